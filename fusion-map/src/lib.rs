//! Fusion Map Crate
//!
//! A spatially hashed truncated signed distance map and the per-frame
//! algorithms that run over it. Work is data-parallel on the CPU via rayon:
//! one task per pixel row, per voxel block, or per block chunk.
//!
//! ## Modules
//!
//! - [`config`]: capacity and fusion parameters, fixed at construction
//! - [`hash_table`]: bucketed block-coordinate table with an excess list
//! - [`map_struct`]: the persistent store of voxel blocks
//! - [`integrate`]: allocate-then-fuse depth integration
//! - [`visibility`]: visible blocks and per-tile depth bounds
//! - [`raycast`]: dense surface prediction from the map
//! - [`mesh`]: marching cubes extraction
//! - [`dense_mapping`]: the facade the orchestration layer drives

pub mod config;
pub mod dense_mapping;
pub mod error;
pub mod hash_table;
pub mod integrate;
pub mod map_struct;
pub mod mesh;
pub mod raycast;
pub mod visibility;
pub mod voxel;

pub use config::MapConfig;
pub use dense_mapping::DenseMapping;
pub use error::MapError;
pub use hash_table::{HashTable, InsertFailure, Insertion};
pub use integrate::IntegrationReport;
pub use map_struct::{AllocationSummary, MapStruct, VoxelSampler};
pub use mesh::{MeshExtraction, MeshReport, extract_mesh, extract_mesh_from};
pub use raycast::{SurfacePrediction, render_shaded, render_textured};
pub use visibility::{RenderingBlock, ZRangeMap};
pub use voxel::{BLOCK_SIZE, BLOCK_VOLUME, Voxel};
