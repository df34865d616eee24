pub mod aggregator;
pub mod calibration;
pub mod fusion;
pub mod model_client;
pub mod performance;

pub use aggregator::{EnsembleAggregator, ExpectedValueInputs};
