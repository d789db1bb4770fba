//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs Tracking and
//! spawns the Local Mapping thread, along with the session configuration,
//! shared state and inter-thread messaging types.

pub mod config;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use config::SlamConfig;
pub use messages::{MapperMessage, NewKeyFrameMsg};
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
