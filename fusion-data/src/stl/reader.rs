//! Binary STL reading.

use crate::stl::{HEADER_LEN, RECORD_LEN, StlError};
use glam::Vec3;
use std::path::Path;
use tracing::{debug, warn};

/// Load the vertex positions of a binary STL file as a flat triangle soup.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn read_binary_stl(path: impl AsRef<Path>) -> Result<Vec<Vec3>, StlError> {
    let bytes = std::fs::read(path.as_ref())?;
    if bytes.len() < HEADER_LEN + 4 {
        warn!("STL file shorter than its header");
        return Err(StlError::Truncated {
            declared: 0,
            available: 0,
        });
    }

    let declared = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]);
    let body = &bytes[HEADER_LEN + 4..];
    let available = body.len() / RECORD_LEN;
    if available < declared as usize {
        return Err(StlError::Truncated {
            declared,
            available,
        });
    }

    let read_f32 = |chunk: &[u8], offset: usize| {
        f32::from_le_bytes([chunk[offset], chunk[offset + 1], chunk[offset + 2], chunk[offset + 3]])
    };

    let mut vertices = Vec::with_capacity(declared as usize * 3);
    for record in body.chunks_exact(RECORD_LEN).take(declared as usize) {
        for v in 0..3 {
            let base = 12 + v * 12;
            vertices.push(Vec3::new(
                read_f32(record, base),
                read_f32(record, base + 4),
                read_f32(record, base + 8),
            ));
        }
    }

    debug!("Read {} STL triangles", declared);
    Ok(vertices)
}
