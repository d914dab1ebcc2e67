//! Resident image buffers.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::{BufferId, DeviceError, GpuContext, GpuSession};
use crate::image::Image;

/// Device copies of images, keyed by the caller's image index.
///
/// Holds at most `capacity` buffers; the least recently used entry is
/// released when a new image does not fit. The resident consensus path sizes
/// the cache for the whole set, so nothing is evicted there.
#[derive(Debug)]
pub struct GpuImageCache {
    capacity: usize,
    entries: VecDeque<(usize, BufferId)>,
    hits: usize,
    misses: usize,
}

impl GpuImageCache {
    /// A cache for `capacity` images, never fewer than two.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            entries: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn contains(&self, index: usize) -> bool {
        self.buffer(index).is_some()
    }

    fn buffer(&self, index: usize) -> Option<BufferId> {
        self.entries
            .iter()
            .find(|(i, _)| *i == index)
            .map(|&(_, b)| b)
    }

    /// Buffer holding image `index`, uploading it on a miss.
    pub fn get_or_upload(
        &mut self,
        session: &mut GpuSession<'_>,
        index: usize,
        image: &Image,
    ) -> Result<BufferId, DeviceError> {
        if let Some(position) = self.entries.iter().position(|(i, _)| *i == index) {
            self.hits += 1;
            if let Some(entry) = self.entries.remove(position) {
                self.entries.push_back(entry);
                return Ok(entry.1);
            }
        }
        self.misses += 1;

        if self.entries.len() >= self.capacity
            && let Some((evicted, buffer)) = self.entries.pop_front()
        {
            debug!(index = evicted, "Evicting resident image");
            session.release(buffer);
        }

        let buffer = session.allocate(image.data().len())?;
        if let Err(e) = session.write(buffer, image.data()) {
            session.release(buffer);
            return Err(e);
        }
        self.entries.push_back((index, buffer));
        Ok(buffer)
    }

    /// Overwrite the pixels of a resident image, or upload it if absent.
    pub fn replace(
        &mut self,
        session: &mut GpuSession<'_>,
        index: usize,
        image: &Image,
    ) -> Result<BufferId, DeviceError> {
        match self.buffer(index) {
            Some(buffer) => {
                session.write(buffer, image.data())?;
                Ok(buffer)
            }
            None => self.get_or_upload(session, index, image),
        }
    }

    /// Release every buffer.
    pub fn clear(&mut self, session: &mut GpuSession<'_>) {
        for (_, buffer) in self.entries.drain(..) {
            session.release(buffer);
        }
    }

    /// Release every buffer, taking the device lock. Used when a cache
    /// outlives the session that filled it.
    pub fn release_all(&mut self, context: &GpuContext) {
        if self.entries.is_empty() {
            return;
        }
        match context.try_session() {
            Some(mut session) => self.clear(&mut session),
            None => {
                warn!(
                    buffers = self.entries.len(),
                    "Device busy, resident buffers left for the device to reclaim"
                );
                self.entries.clear();
            }
        }
    }
}
