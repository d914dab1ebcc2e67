//! Binary persistence of distortion maps.
//!
//! All integers are big-endian `i32`, vectors are big-endian `f64` pairs.
//!
//! Single map: `step, tile_size, rows, cols`, then `rows × cols` `(dx, dy)`
//! pairs in row-major order.
//!
//! Map list: magic `HDMS`, version, count, then each map as above.

use std::io::{self, Read, Write};

use glam::DVec2;

use super::{DistortionMap, DistortionMaps};
use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"HDMS";
const VERSION: i32 = 1;

/// Refuse grids larger than this many cells when reading.
const MAX_CELLS: usize = 1 << 26;

fn write_i32(writer: &mut impl Write, value: usize) -> Result<()> {
    let value = i32::try_from(value)
        .map_err(|_| Error::MalformedDistortionMap(format!("{value} does not fit in i32")))?;
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn read_i32(reader: &mut impl Read) -> Result<i32> {
    let mut bytes = [0u8; 4];
    read_exact(reader, &mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

fn read_f64(reader: &mut impl Read) -> Result<f64> {
    let mut bytes = [0u8; 8];
    read_exact(reader, &mut bytes)?;
    Ok(f64::from_be_bytes(bytes))
}

fn read_positive(reader: &mut impl Read, field: &str) -> Result<usize> {
    let value = read_i32(reader)?;
    if value <= 0 {
        return Err(Error::MalformedDistortionMap(format!(
            "{field} must be positive, got {value}"
        )));
    }
    Ok(value as usize)
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::MalformedDistortionMap("truncated data".into()),
        _ => Error::Io(e),
    })
}

impl DistortionMap {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        write_i32(writer, self.step)?;
        write_i32(writer, self.tile_size)?;
        write_i32(writer, self.rows)?;
        write_i32(writer, self.cols)?;
        for v in &self.values {
            writer.write_all(&v.x.to_be_bytes())?;
            writer.write_all(&v.y.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let step = read_positive(reader, "step")?;
        let tile_size = read_i32(reader)?;
        if tile_size < 0 {
            return Err(Error::MalformedDistortionMap(format!(
                "tile size must not be negative, got {tile_size}"
            )));
        }
        let rows = read_positive(reader, "rows")?;
        let cols = read_positive(reader, "cols")?;
        if rows.saturating_mul(cols) > MAX_CELLS {
            return Err(Error::MalformedDistortionMap(format!(
                "grid {cols}x{rows} is too large"
            )));
        }

        let mut map = DistortionMap::with_grid(step, tile_size as usize, cols, rows);
        for v in &mut map.values {
            *v = DVec2::new(read_f64(reader)?, read_f64(reader)?);
        }
        map.mark_all_sampled();
        Ok(map)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.values.len() * 16);
        // Writing to a Vec cannot fail and grid dimensions always fit in i32.
        let _ = self.write_to(&mut bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let map = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::MalformedDistortionMap(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }
        Ok(map)
    }
}

impl DistortionMaps {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_all(&VERSION.to_be_bytes())?;
        write_i32(writer, self.maps.len())?;
        for map in &self.maps {
            map.write_to(writer)?;
        }
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic)?;
        if magic != MAGIC {
            return Err(Error::MalformedDistortionMap("bad magic".into()));
        }
        let version = read_i32(reader)?;
        if version != VERSION {
            return Err(Error::MalformedDistortionMap(format!(
                "unsupported version {version}"
            )));
        }
        let count = read_i32(reader)?;
        if count < 0 {
            return Err(Error::MalformedDistortionMap(format!(
                "negative map count {count}"
            )));
        }

        let maps = (0..count)
            .map(|_| DistortionMap::read_from(reader))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { maps })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let _ = self.write_to(&mut bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let maps = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::MalformedDistortionMap(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }
        Ok(maps)
    }
}
