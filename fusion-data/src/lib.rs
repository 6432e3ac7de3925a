//! Fusion Data Crate
//!
//! Frame and image data for dense RGB-D reconstruction. This crate is
//! engine-agnostic: it owns captured frames, their multi-resolution working
//! sets, triangle meshes and mesh file I/O, but knows nothing about the
//! volumetric map itself.
//!
//! ## Modules
//!
//! - [`intrinsics`]: pinhole camera model and its resolution pyramid
//! - [`pixel_map`]: dense per-pixel buffers (depth, vertex and normal maps)
//! - [`frame`]: immutable RGB-D captures with a shared, late-bound pose
//! - [`rgbd_image`]: the per-frame pyramid working set
//! - [`mesh`]: triangle soup buffers
//! - [`stl`]: binary STL export and import
//! - [`source`]: RGB-D stream trait and a synthetic scene source

pub mod frame;
pub mod intrinsics;
pub mod mesh;
pub mod pixel_map;
pub mod rgbd_image;
pub mod source;
pub mod stl;

pub use frame::{DepthImage, FrameError, FrameRef, RgbdFrame};
pub use intrinsics::{Intrinsics, IntrinsicsPyramid};
pub use mesh::{MeshFetch, Triangle, TriangleMesh};
pub use pixel_map::{NormalMap, PixelMap, VertexMap, is_valid_depth};
pub use rgbd_image::RgbdImage;
pub use source::{RgbdCapture, RgbdStream, StreamError, SyntheticScene, SyntheticStream};
pub use stl::{StlError, read_binary_stl, save_binary_stl, write_binary_stl};
