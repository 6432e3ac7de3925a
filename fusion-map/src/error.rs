//! Error types for map construction and export.

use fusion_data::StlError;
use std::collections::TryReserveError;
use thiserror::Error;

/// Errors that can occur in the volumetric map.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("Invalid map configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to allocate {what} ({requested} elements): {source}")]
    Allocation {
        what: &'static str,
        requested: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("Mesh export error: {0}")]
    Export(#[from] StlError),
}
