mod history;
mod tracker;

pub use history::History;
pub use tracker::{CentroidTracker, Track};
