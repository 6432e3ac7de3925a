//! Triangle mesh extraction from the distance field.

mod marching_cubes;
mod tables;

pub use marching_cubes::{extract_mesh, extract_mesh_from};

use fusion_data::TriangleMesh;

/// Counters from one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshReport {
    /// Blocks polygonised before the extraction finished or stopped.
    pub blocks_visited: usize,
    pub triangles: usize,
    /// True if the triangle capacity was reached and blocks were left out.
    pub truncated: bool,
}

/// Extracted triangles with their report.
#[derive(Debug, Clone, Default)]
pub struct MeshExtraction {
    pub mesh: TriangleMesh,
    pub report: MeshReport,
}
