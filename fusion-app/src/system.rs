//! Frame-by-frame orchestration.

use crate::config::{ConfigError, SystemConfig};
use crate::odometry::Odometry;
use fusion_data::{
    DepthImage, FrameError, FrameRef, IntrinsicsPyramid, MeshFetch, RgbdCapture, RgbdFrame, RgbdImage, StreamError,
};
use fusion_map::{DenseMapping, IntegrationReport, MapError};
use glam::{Affine3A, Mat4, Vec3};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Map error: {0}")]
    Map(#[from] MapError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Whether submitted frames are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Frames are ignored.
    Pause,
    #[default]
    Continuous,
    /// Process one frame, then pause.
    SingleShot,
}

/// Whether tracked frames are fused into the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrationMode {
    #[default]
    On,
    /// Keep tracking and predicting, but leave the map unchanged.
    Hold,
}

/// What happened to one submitted frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub frame_id: usize,
    pub pose: Affine3A,
    /// `None` when integration was held.
    pub integration: Option<IntegrationReport>,
    pub predicted_pixels: usize,
    /// Distance between the tracked and the recorded camera position, when
    /// the capture carried one.
    pub position_error: Option<f32>,
}

pub struct System {
    config: SystemConfig,
    pyramid: IntrinsicsPyramid,
    mapping: DenseMapping,
    odometry: Box<dyn Odometry>,
    reference: Option<RgbdImage>,
    current: Option<FrameRef>,
    keyframe: Option<FrameRef>,
    pose: Affine3A,
    processed_frame_count: usize,
    run_mode: RunMode,
    integration_mode: IntegrationMode,
}

impl System {
    pub fn new(config: SystemConfig, odometry: Box<dyn Odometry>) -> Result<Self, SystemError> {
        config.validate()?;
        let pyramid = IntrinsicsPyramid::new(config.intrinsics, config.pyramid_levels);
        let mapping = DenseMapping::new(config.intrinsics, config.map)?;
        info!(
            "System ready: {}x{} images, {} pyramid levels",
            config.intrinsics.width,
            config.intrinsics.height,
            pyramid.len()
        );
        Ok(Self {
            config,
            pyramid,
            mapping,
            odometry,
            reference: None,
            current: None,
            keyframe: None,
            pose: Affine3A::IDENTITY,
            processed_frame_count: 0,
            run_mode: RunMode::default(),
            integration_mode: IntegrationMode::default(),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn mapping(&self) -> &DenseMapping {
        &self.mapping
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        self.run_mode = mode;
    }

    pub fn integration_mode(&self) -> IntegrationMode {
        self.integration_mode
    }

    pub fn set_integration_mode(&mut self, mode: IntegrationMode) {
        self.integration_mode = mode;
    }

    /// Track, integrate and predict one depth/colour pair.
    ///
    /// Returns `Ok(None)` when the system is paused.
    pub fn process_images(&mut self, depth: &DepthImage, color: RgbImage) -> Result<Option<FrameReport>, SystemError> {
        let timestamp = self.processed_frame_count as f64;
        self.process_frame(depth, color, timestamp, None)
    }

    /// [`System::process_images`] for a stream capture, keeping its timestamp
    /// and comparing the tracked pose against its ground truth.
    pub fn process_capture(&mut self, capture: RgbdCapture) -> Result<Option<FrameReport>, SystemError> {
        self.process_frame(&capture.depth, capture.color, capture.timestamp, capture.ground_truth)
    }

    fn process_frame(
        &mut self,
        depth: &DepthImage,
        color: RgbImage,
        timestamp: f64,
        ground_truth: Option<Affine3A>,
    ) -> Result<Option<FrameReport>, SystemError> {
        if self.run_mode == RunMode::Pause {
            debug!("Paused, frame dropped");
            return Ok(None);
        }

        let frame: FrameRef = Arc::new(RgbdFrame::new(
            depth,
            color,
            self.processed_frame_count,
            timestamp,
            self.pyramid.base(),
        )?);
        let mut image = RgbdImage::new();
        image.upload(frame.clone(), &self.pyramid);

        match self.odometry.track(&image, self.reference.as_ref()) {
            Ok(pose) => self.pose = pose,
            Err(e) => warn!("Tracking failed for frame {}: {}; keeping previous pose", frame.id(), e),
        }
        frame.set_pose(self.pose);
        if let Some(previous) = self.current.take() {
            frame.set_reference_frame(&previous);
            self.keyframe = Some(previous);
        }

        let integration = match self.integration_mode {
            IntegrationMode::On => self.mapping.update(&image),
            IntegrationMode::Hold => None,
        };
        let predicted_pixels = self
            .mapping
            .raycast(&mut image)
            .map(|p| p.hit_count())
            .unwrap_or(0);

        let position_error = ground_truth.map(|truth| (truth.translation - self.pose.translation).length());
        if let Some(error) = position_error {
            debug!("Frame {} is {:.4} from its recorded position", frame.id(), error);
        }

        let report = FrameReport {
            frame_id: frame.id(),
            pose: self.pose,
            integration,
            predicted_pixels,
            position_error,
        };
        debug!(
            "Frame {} done: {} blocks allocated, {} visible, {} pixels predicted",
            report.frame_id,
            self.mapping.map().allocated_block_count(),
            self.mapping.map().visible_block_count(),
            predicted_pixels
        );

        self.reference = Some(image);
        self.current = Some(frame);
        self.processed_frame_count += 1;
        if self.run_mode == RunMode::SingleShot {
            self.run_mode = RunMode::Pause;
        }
        Ok(Some(report))
    }

    /// Drop the map, the tracking state and the frame history.
    pub fn restart(&mut self) {
        self.mapping.restart_mapping();
        self.odometry.reset();
        self.reference = None;
        self.current = None;
        self.keyframe = None;
        self.pose = Affine3A::IDENTITY;
        self.processed_frame_count = 0;
        info!("System restarted");
    }

    /// Shaded rendering of the latest surface prediction.
    pub fn rendered_scene(&self) -> Option<RgbImage> {
        self.mapping.render_scene()
    }

    /// Like [`System::rendered_scene`], coloured by the fused voxel colours.
    pub fn rendered_scene_textured(&self) -> Option<RgbImage> {
        self.mapping.render_scene_textured()
    }

    /// Extract the mesh and write it as binary STL. Returns the triangle
    /// count; nothing is written for an empty map.
    pub fn save_mesh_to_file(&mut self, path: impl AsRef<Path>) -> Result<usize, SystemError> {
        let report = self.mapping.create_scene_mesh();
        if report.truncated {
            warn!("Saving a truncated mesh ({} triangles)", report.triangles);
        }
        Ok(self.mapping.write_mesh_to_file(path)?)
    }

    /// Extract the mesh into `buffer`, three vertices per triangle.
    pub fn create_mesh(&mut self, buffer: &mut [Vec3]) -> MeshFetch {
        self.mapping.fetch_mesh(buffer)
    }

    pub fn fetch_mesh_with_normal(&mut self, vertices: &mut [Vec3], normals: &mut [Vec3]) -> MeshFetch {
        self.mapping.fetch_mesh_with_normal(vertices, normals)
    }

    /// Camera-to-world pose of the latest frame.
    pub fn current_camera_pose(&self) -> Mat4 {
        Mat4::from(self.pose)
    }

    pub fn processed_frame_count(&self) -> usize {
        self.processed_frame_count
    }

    /// The latest frame, if any.
    pub fn current_frame(&self) -> Option<&FrameRef> {
        self.current.as_ref()
    }

    /// The frame the latest one was tracked against.
    pub fn keyframe(&self) -> Option<&FrameRef> {
        self.keyframe.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odometry::{ScriptedOdometry, StaticOdometry};
    use fusion_data::Intrinsics;
    use fusion_map::MapConfig;
    use image::Luma;

    fn small_config() -> SystemConfig {
        SystemConfig {
            intrinsics: Intrinsics::new(24, 16, 20.0, 20.0, 11.5, 7.5),
            pyramid_levels: 2,
            map: MapConfig::default()
                .with_capacity(2048, 512, 1024)
                .with_resolution(0.01, 0.04),
        }
    }

    fn plane() -> (DepthImage, RgbImage) {
        (DepthImage::from_pixel(24, 16, Luma([1.0])), RgbImage::new(24, 16))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = small_config();
        config.pyramid_levels = 0;
        assert!(matches!(
            System::new(config, Box::new(StaticOdometry::default())),
            Err(SystemError::Config(_))
        ));
    }

    #[test]
    fn test_pause_and_single_shot() {
        let mut system = System::new(small_config(), Box::new(StaticOdometry::default())).unwrap();
        let (depth, color) = plane();

        system.set_run_mode(RunMode::Pause);
        assert!(system.process_images(&depth, color.clone()).unwrap().is_none());
        assert_eq!(system.processed_frame_count(), 0);

        system.set_run_mode(RunMode::SingleShot);
        assert!(system.process_images(&depth, color.clone()).unwrap().is_some());
        assert_eq!(system.run_mode(), RunMode::Pause);
        assert!(system.process_images(&depth, color).unwrap().is_none());
        assert_eq!(system.processed_frame_count(), 1);
    }

    #[test]
    fn test_hold_leaves_map_untouched() {
        let mut system = System::new(small_config(), Box::new(StaticOdometry::default())).unwrap();
        let (depth, color) = plane();
        system.set_integration_mode(IntegrationMode::Hold);
        let report = system.process_images(&depth, color).unwrap().unwrap();
        assert!(report.integration.is_none());
        assert_eq!(report.predicted_pixels, 0);
        assert!(report.position_error.is_none());
        assert_eq!(system.mapping().map().allocated_block_count(), 0);
    }

    #[test]
    fn test_tracking_failure_keeps_pose() {
        let moved = Affine3A::from_translation(Vec3::new(0.01, 0.0, 0.0));
        let odometry = ScriptedOdometry::new(vec![moved]);
        let mut system = System::new(small_config(), Box::new(odometry)).unwrap();
        let (depth, color) = plane();
        system.process_images(&depth, color.clone()).unwrap();
        let second = system.process_images(&depth, color).unwrap().unwrap();
        assert_eq!(second.pose, moved);
        assert_eq!(system.current_camera_pose(), Mat4::from(moved));
        let frame = system.current_frame().unwrap();
        assert_eq!(frame.reference_frame().unwrap().id(), 0);
    }

    #[test]
    fn test_restart_resets_counters() {
        let mut system = System::new(small_config(), Box::new(StaticOdometry::default())).unwrap();
        let (depth, color) = plane();
        system.process_images(&depth, color).unwrap();
        assert!(system.rendered_scene().is_some());
        system.restart();
        assert_eq!(system.processed_frame_count(), 0);
        assert!(system.rendered_scene().is_none());
        assert_eq!(system.mapping().map().allocated_block_count(), 0);
        assert_eq!(system.current_camera_pose(), Mat4::IDENTITY);
    }
}
