pub mod batcher;
pub mod dataset;
pub mod pickle;
pub mod preprocess;

pub use batcher::{SignBatch, SignBatcher, SignDataset, SignItem};
pub use dataset::{DatasetSplits, RawImages, SignSplit};
pub use preprocess::{GrayImages, PreparedSplit};
