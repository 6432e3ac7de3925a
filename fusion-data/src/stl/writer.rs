//! Binary STL writing.

use crate::stl::{HEADER_LEN, StlError};
use glam::Vec3;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Write a triangle soup as binary STL.
///
/// Facet normals are written as zero; consumers recompute them from the
/// winding. Returns the number of triangles written.
pub fn write_binary_stl<W: Write>(mut writer: W, vertices: &[Vec3]) -> Result<usize, StlError> {
    if vertices.len() % 3 != 0 {
        return Err(StlError::IncompleteTriangle(vertices.len()));
    }
    let count = vertices.len() / 3;
    let declared = u32::try_from(count).map_err(|_| StlError::TooManyTriangles(count))?;

    writer.write_all(&[b' '; HEADER_LEN])?;
    writer.write_all(&declared.to_le_bytes())?;

    for triangle in vertices.chunks_exact(3) {
        writer.write_all(&[0u8; 12])?;
        for vertex in triangle {
            for component in vertex.to_array() {
                writer.write_all(&component.to_le_bytes())?;
            }
        }
        writer.write_all(&0u16.to_le_bytes())?;
    }
    writer.flush()?;

    debug!("Wrote {} STL triangles", count);
    Ok(count)
}

/// Save a triangle soup to `path`. Nothing is created when `vertices` is
/// empty; the returned count is then zero.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn save_binary_stl(path: impl AsRef<Path>, vertices: &[Vec3]) -> Result<usize, StlError> {
    if vertices.is_empty() {
        debug!("No triangles to save, skipping STL export");
        return Ok(0);
    }
    if vertices.len() % 3 != 0 {
        return Err(StlError::IncompleteTriangle(vertices.len()));
    }
    let file = File::create(path.as_ref())?;
    let count = write_binary_stl(BufWriter::new(file), vertices)?;
    info!("Saved {} triangles to {}", count, path.as_ref().display());
    Ok(count)
}
