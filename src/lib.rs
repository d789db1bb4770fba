pub mod atlas;
pub mod error;
pub mod features;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod optimizer;
pub mod storage;
pub mod system;
pub mod tracking;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ConfigError, SlamError};
pub use system::{SlamConfig, SlamSystem};
pub use tracking::{TrackingResult, TrackingState};
