//! Fusion Application Crate
//!
//! Frame-by-frame orchestration of the dense mapping engine: frame ingestion,
//! the odometry seam, integration and surface prediction, and mesh export.

pub mod config;
pub mod odometry;
pub mod system;

pub use config::{ConfigError, SystemConfig};
pub use odometry::{Odometry, ScriptedOdometry, StaticOdometry, TrackingError};
pub use system::{FrameReport, IntegrationMode, RunMode, System, SystemError};
