//! Geometry utilities: SE3 transforms, SO3 helpers, PnP solving.

pub mod pnp;
pub mod se3;
pub mod so3;

pub use pnp::{solve_pnp_ransac, PnPRansacParams, PnPResult};
pub use se3::SE3;
