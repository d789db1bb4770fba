//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Refreshing the points tracked by new keyframes
//! - Triangulating new map points between covisible keyframes
//! - Fusing duplicate map points
//! - Running local bundle adjustment
//! - Culling redundant keyframes and map points

mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::LocalMapper;
