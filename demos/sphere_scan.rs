//! Sphere scan example
//!
//! Runs the full system over a synthetic sphere with a camera sweeping
//! sideways, then saves the mesh and a shaded rendering of the last view.
//!
//! Usage:
//!   cargo run --example sphere_scan -- [output_dir]

use fusion::app::{ScriptedOdometry, System, SystemConfig};
use fusion::data::{Intrinsics, RgbdStream, SyntheticScene, SyntheticStream};
use fusion::map::MapConfig;
use glam::{Affine3A, Quat, Vec3};
use std::error::Error;
use std::path::PathBuf;
use tracing::info;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = SystemConfig {
        intrinsics: Intrinsics::new(320, 240, 262.5, 262.5, 159.5, 119.5),
        pyramid_levels: 3,
        map: MapConfig::default()
            .with_capacity(50_000, 20_000, 20_000)
            .with_resolution(0.005, 0.02),
    };

    // Orbit around the sphere centre, always looking at it.
    let center = Vec3::new(0.0, 0.0, 1.0);
    let trajectory: Vec<Affine3A> = (0..24)
        .map(|i| {
            let yaw = (i as f32 / 24.0 - 0.5) * 0.8;
            let rotation = Quat::from_rotation_y(yaw);
            let position = center - rotation * Vec3::new(0.0, 0.0, 1.0);
            Affine3A::from_rotation_translation(rotation, position)
        })
        .collect();

    let scene = SyntheticScene::Sphere { center, radius: 0.25 };
    let mut stream = SyntheticStream::new(scene, config.intrinsics, trajectory.clone());
    let mut system = System::new(config, Box::new(ScriptedOdometry::new(trajectory)))?;

    while let Some(capture) = stream.next_frame()? {
        if let Some(report) = system.process_capture(capture)? {
            info!(
                "Frame {}: {} pixels predicted",
                report.frame_id, report.predicted_pixels
            );
        }
    }

    let mesh_path = output_dir.join("sphere.stl");
    let triangles = system.save_mesh_to_file(&mesh_path)?;
    info!("Wrote {} triangles to {:?}", triangles, mesh_path);

    if let Some(image) = system.rendered_scene() {
        let render_path = output_dir.join("sphere.png");
        image.save(&render_path)?;
        info!("Saved rendering to {:?}", render_path);
    }
    Ok(())
}
