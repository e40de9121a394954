pub mod plots;
pub mod samples;

pub use plots::{plot_confusion, plot_history, plot_prediction_grid};
pub use samples::write_sample_previews;
