//! Plane reconstruction example
//!
//! Fuses a few frames of a synthetic wall, raycasts it back and writes the
//! extracted mesh as binary STL.
//!
//! Usage:
//!   cargo run --example plane_reconstruction -- [output.stl]

use fusion::data::{DepthImage, Intrinsics, IntrinsicsPyramid, RgbdFrame, RgbdImage, SyntheticScene};
use fusion::map::{DenseMapping, MapConfig};
use glam::{Affine3A, Vec3};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("plane.stl"));

    let intrinsics = Intrinsics::new(160, 120, 130.0, 130.0, 79.5, 59.5);
    let pyramid = IntrinsicsPyramid::new(intrinsics, 3);
    let config = MapConfig::default()
        .with_capacity(20_000, 5_000, 8_000)
        .with_resolution(0.01, 0.04);
    let mut mapping = DenseMapping::new(intrinsics, config)?;

    let scene = SyntheticScene::Plane { distance: 1.2 };
    for i in 0..5 {
        let pose = Affine3A::from_translation(Vec3::new(0.04 * i as f32, 0.0, 0.0));
        let (depth, color): (DepthImage, _) = scene.render(&intrinsics, &pose);
        let frame = Arc::new(RgbdFrame::new(&depth, color, i, i as f64 / 30.0, &intrinsics)?);
        frame.set_pose(pose);

        let mut image = RgbdImage::new();
        image.upload(frame, &pyramid);
        if let Some(report) = mapping.update(&image) {
            info!(
                "Frame {}: {} new blocks, {} voxels fused",
                i, report.allocated_blocks, report.fused_voxels
            );
        }
        if let Some(prediction) = mapping.raycast(&mut image) {
            info!("Frame {}: {} pixels predicted", i, prediction.hit_count());
        }
    }

    let report = mapping.create_scene_mesh();
    let written = mapping.write_mesh_to_file(&output)?;
    info!(
        "Wrote {} triangles to {:?} (truncated: {})",
        written, output, report.truncated
    );
    Ok(())
}
