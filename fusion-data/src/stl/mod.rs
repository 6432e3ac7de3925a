//! Binary STL file support
//!
//! Layout: an 80 byte header, a little-endian `u32` triangle count, then one
//! 50 byte record per triangle (normal, three vertices, `u16` attribute).

mod reader;
mod writer;

use thiserror::Error;

pub use reader::read_binary_stl;
pub use writer::{save_binary_stl, write_binary_stl};

/// Size of the free-form header.
pub const HEADER_LEN: usize = 80;
/// Size of one triangle record.
pub const RECORD_LEN: usize = 50;

/// Errors that can occur while reading or writing STL files.
#[derive(Debug, Error)]
pub enum StlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vertex count {0} is not a multiple of three")]
    IncompleteTriangle(usize),

    #[error("Triangle count {0} does not fit the file format")]
    TooManyTriangles(usize),

    #[error("File declares {declared} triangles but holds {available}")]
    Truncated { declared: u32, available: usize },
}
