//! Choosing the frame every other frame is aligned to.

use rayon::prelude::*;
use tracing::debug;

use crate::config::{ReferenceSelection, StackConfig};
use crate::error::{Error, Result};
use crate::image::{ConsensusReference, EllipseFit, Image, Metadata};

use super::sharpness::estimate_sharpness;

/// Eccentricity assumed for frames without an ellipse fit.
const DEFAULT_ECCENTRICITY: f64 = 0.99;

/// A stacking reference and the global weight of every input frame.
#[derive(Debug, Clone)]
pub struct StackReference {
    pub image: Image,
    /// One weight per input frame, in input order. Uniform unless the
    /// reference was picked by sharpness.
    pub weights: Vec<f64>,
}

/// Pick or build the reference for `images` according to `config.reference`.
///
/// # Errors
///
/// [`Error::EmptyImageList`] for no images, and
/// [`Error::ManualReferenceNotFound`] when no frame carries the requested
/// file name.
pub fn choose_reference(images: &[Image], config: &StackConfig) -> Result<StackReference> {
    let first = images.first().ok_or(Error::EmptyImageList)?;
    let uniform = || vec![1.0; images.len()];

    let reference = match config.reference {
        ReferenceSelection::First => StackReference {
            image: first.clone(),
            weights: uniform(),
        },
        ReferenceSelection::Average => StackReference {
            image: combine_pixels(images, |values| {
                values.iter().map(|&v| v as f64).sum::<f64>() as f32 / values.len() as f32
            }),
            weights: uniform(),
        },
        ReferenceSelection::Median => StackReference {
            image: combine_pixels(images, median),
            weights: uniform(),
        },
        ReferenceSelection::Eccentricity => {
            let eccentricity = |image: &Image| {
                image
                    .metadata()
                    .get::<EllipseFit>()
                    .map_or(DEFAULT_ECCENTRICITY, |fit| fit.eccentricity)
            };
            let best = images
                .iter()
                .min_by(|a, b| eccentricity(*a).total_cmp(&eccentricity(*b)))
                .unwrap_or(first);
            StackReference {
                image: best.clone(),
                weights: uniform(),
            }
        }
        ReferenceSelection::Sharpness => sharpest(images),
        ReferenceSelection::Manual => match &config.manual_reference {
            None => sharpest(images),
            Some(name) => {
                let image = images
                    .iter()
                    .find(|image| image.file_name() == Some(name.as_str()))
                    .ok_or_else(|| Error::ManualReferenceNotFound(name.clone()))?;
                StackReference {
                    image: image.clone(),
                    weights: uniform(),
                }
            }
        },
        ReferenceSelection::Consensus => {
            let sharpest = sharpest(images);
            StackReference {
                image: sharpest.image.with_metadata(ConsensusReference),
                weights: sharpest.weights,
            }
        }
    };

    debug!(selection = ?config.reference, frames = images.len(), "Stacking reference chosen");
    Ok(reference)
}

/// Sharpest frame, first one on ties. Weights are the sharpness values, or
/// uniform when every frame is blank.
fn sharpest(images: &[Image]) -> StackReference {
    let mut weights: Vec<f64> = images
        .par_iter()
        .map(|image| estimate_sharpness(image.data(), image.width(), image.height()))
        .collect();
    let best = weights
        .iter()
        .enumerate()
        .fold(0, |best, (i, &s)| if s > weights[best] { i } else { best });
    if weights.iter().all(|&w| w <= 0.0) {
        weights.fill(1.0);
    }
    StackReference {
        image: images[best].clone(),
        weights,
    }
}

/// Per-pixel combination of all frames. Metadata is merged, first frame wins.
fn combine_pixels(images: &[Image], combine: impl Fn(&mut [f32]) -> f32 + Sync) -> Image {
    let (width, height) = images[0].dimensions();
    let mut data = vec![0.0f32; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let mut values = vec![0.0f32; images.len()];
        for (x, out) in row.iter_mut().enumerate() {
            for (value, image) in values.iter_mut().zip(images) {
                *value = image.get(x, y);
            }
            *out = combine(&mut values);
        }
    });

    let mut image = Image::mono(width, height, data);
    *image.metadata_mut() = Metadata::merge(images.iter().map(Image::metadata));
    image
}

/// Median of a non-empty slice. Mean of the two middle values for even
/// lengths. Reorders `values`.
fn median(values: &mut [f32]) -> f32 {
    let mid = values.len() / 2;
    let upper = *values.select_nth_unstable_by(mid, f32::total_cmp).1;
    if values.len() % 2 == 1 {
        upper
    } else {
        let lower = values[..mid].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        0.5 * (lower + upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&mut [5.0, 1.0, 3.0]), 3.0);
        assert_eq!(median(&mut [10.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut [7.0]), 7.0);
    }
}
