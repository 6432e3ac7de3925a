//! Fusion command line front end
//!
//! Reconstructs a synthetic scene, then writes the extracted mesh as binary
//! STL and, optionally, a shaded rendering of the final surface prediction.

use clap::{Parser, ValueEnum};
use fusion_app::{ScriptedOdometry, System, SystemConfig, SystemError};
use fusion_data::{RgbdStream, SyntheticScene, SyntheticStream};
use glam::{Affine3A, Vec3};
use std::f32::consts::TAU;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SceneKind {
    Plane,
    Sphere,
}

/// Fusion - dense RGB-D reconstruction of synthetic scenes
#[derive(Parser, Debug)]
#[command(name = "fusion")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON system configuration (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scene to reconstruct
    #[arg(short, long, value_enum, default_value = "sphere")]
    scene: SceneKind,

    /// Number of frames along the camera path
    #[arg(short = 'n', long, default_value_t = 30)]
    frames: usize,

    /// Override the voxel size (truncation becomes four voxels)
    #[arg(long)]
    voxel_size: Option<f32>,

    /// Output mesh path
    #[arg(short, long, default_value = "mesh.stl")]
    output: PathBuf,

    /// Also save a shaded PNG of the last surface prediction
    #[arg(short, long)]
    render: Option<PathBuf>,

    /// Colour the rendering with the fused surface colours
    #[arg(long, requires = "render")]
    textured: bool,
}

/// A small sideways sweep that keeps the camera looking along +z.
fn sweep(frames: usize) -> Vec<Affine3A> {
    (0..frames)
        .map(|i| {
            let angle = TAU * i as f32 / frames.max(1) as f32;
            Affine3A::from_translation(Vec3::new(0.1 * angle.sin(), 0.05 * angle.cos() - 0.05, 0.0))
        })
        .collect()
}

fn run(args: Args) -> Result<(), SystemError> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(voxel_size) = args.voxel_size {
        config.map = config.map.with_resolution(voxel_size, voxel_size * 4.0);
    }

    let scene = match args.scene {
        SceneKind::Plane => SyntheticScene::Plane { distance: 1.0 },
        SceneKind::Sphere => SyntheticScene::Sphere {
            center: Vec3::new(0.0, 0.0, 1.5),
            radius: 0.4,
        },
    };
    let trajectory = sweep(args.frames);
    let mut stream = SyntheticStream::new(scene, config.intrinsics, trajectory.clone());
    let mut system = System::new(config, Box::new(ScriptedOdometry::new(trajectory)))?;

    info!("Reconstructing {:?} from {} frames", args.scene, args.frames);
    while let Some(capture) = stream.next_frame()? {
        system.process_capture(capture)?;
    }

    let map = system.mapping().map();
    info!(
        "Processed {} frames: {} blocks allocated, {} allocation failures",
        system.processed_frame_count(),
        map.allocated_block_count(),
        map.allocation_failures()
    );

    let triangles = system.save_mesh_to_file(&args.output)?;
    info!("Wrote {} triangles to {}", triangles, args.output.display());

    if let Some(path) = &args.render {
        let image = if args.textured {
            system.rendered_scene_textured()
        } else {
            system.rendered_scene()
        };
        if let Some(image) = image {
            image.save(path)?;
            info!("Saved rendering to {}", path.display());
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
