//! The camera tracking seam.
//!
//! Dense photometric/geometric odometry is an external collaborator; the
//! system only needs a pose per frame. The implementations here cover a still
//! camera and replaying known trajectories.

use fusion_data::RgbdImage;
use glam::Affine3A;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Tracking lost: {0}")]
    Lost(String),

    #[error("No pose scripted for frame {0}")]
    ScriptExhausted(usize),
}

/// Estimates camera-to-world poses.
pub trait Odometry: Send {
    /// Pose of the frame behind `current`. `reference` is the previous
    /// working set, carrying the map's surface prediction once one exists.
    fn track(&mut self, current: &RgbdImage, reference: Option<&RgbdImage>) -> Result<Affine3A, TrackingError>;

    /// Forget all tracking state.
    fn reset(&mut self) {}
}

/// A camera that never moves.
#[derive(Debug, Clone, Copy)]
pub struct StaticOdometry {
    pose: Affine3A,
}

impl StaticOdometry {
    pub fn new(pose: Affine3A) -> Self {
        Self { pose }
    }
}

impl Default for StaticOdometry {
    fn default() -> Self {
        Self::new(Affine3A::IDENTITY)
    }
}

impl Odometry for StaticOdometry {
    fn track(&mut self, _current: &RgbdImage, _reference: Option<&RgbdImage>) -> Result<Affine3A, TrackingError> {
        Ok(self.pose)
    }
}

/// Replays a known trajectory, one pose per tracked frame.
#[derive(Debug, Clone)]
pub struct ScriptedOdometry {
    poses: Vec<Affine3A>,
    next: usize,
}

impl ScriptedOdometry {
    pub fn new(poses: Vec<Affine3A>) -> Self {
        Self { poses, next: 0 }
    }
}

impl Odometry for ScriptedOdometry {
    fn track(&mut self, _current: &RgbdImage, _reference: Option<&RgbdImage>) -> Result<Affine3A, TrackingError> {
        let pose = self
            .poses
            .get(self.next)
            .copied()
            .ok_or(TrackingError::ScriptExhausted(self.next))?;
        self.next += 1;
        if !pose.is_finite() {
            return Err(TrackingError::Lost(format!("scripted pose {} is not finite", self.next - 1)));
        }
        Ok(pose)
    }

    fn reset(&mut self) {
        self.next = 0;
    }
}
