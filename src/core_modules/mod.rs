// One file per pipeline layer, leaves first.

pub mod pixel;
pub mod frame;
pub mod color_segmenter;
pub mod blob_cleaner;
pub mod marker_extractor;
pub mod heading_estimator;
pub mod polar_resolver;
pub mod classifier;
pub mod stabilizer;
pub mod dataset;
pub mod quota;

pub mod utils {
    pub mod geometry;
    pub mod image_helper;
}

#[cfg(test)]
pub(crate) mod test_utils;
