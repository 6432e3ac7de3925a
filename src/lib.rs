//! Fusion
//!
//! Dense RGB-D reconstruction into a spatially hashed truncated signed
//! distance map. This package re-exports the workspace crates and hosts the
//! runnable demos.
//!
//! - [`data`]: frames, intrinsics, pixel maps, meshes and STL files
//! - [`map`]: the volumetric engine
//! - [`app`]: the frame-by-frame system and its odometry seam

pub use fusion_app as app;
pub use fusion_data as data;
pub use fusion_map as map;

pub use fusion_app::{System, SystemConfig};
pub use fusion_map::{DenseMapping, MapConfig};
