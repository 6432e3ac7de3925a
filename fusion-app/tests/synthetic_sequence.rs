//! System-level runs over synthetic streams.

use fusion_app::{IntegrationMode, ScriptedOdometry, StaticOdometry, System, SystemConfig};
use fusion_data::{Intrinsics, RgbdStream, SyntheticScene, SyntheticStream, read_binary_stl};
use fusion_map::MapConfig;
use approx::assert_relative_eq;
use glam::{Affine3A, Vec3};

fn config() -> SystemConfig {
    SystemConfig {
        intrinsics: Intrinsics::new(64, 48, 50.0, 50.0, 31.5, 23.5),
        pyramid_levels: 3,
        map: MapConfig::default()
            .with_capacity(8192, 2048, 4096)
            .with_resolution(0.01, 0.04),
    }
}

fn sphere() -> SyntheticScene {
    SyntheticScene::Sphere {
        center: Vec3::new(0.0, 0.0, 1.0),
        radius: 0.3,
    }
}

#[test]
fn test_sphere_mesh_lies_on_sphere() {
    let config = config();
    let mut stream = SyntheticStream::stationary(sphere(), config.intrinsics, 3);
    let mut system = System::new(config, Box::new(StaticOdometry::default())).unwrap();
    while let Some(capture) = stream.next_frame().unwrap() {
        system.process_capture(capture).unwrap();
    }
    assert_eq!(system.processed_frame_count(), 3);

    let mut vertices = vec![Vec3::ZERO; 3 * 200_000];
    let fetch = system.create_mesh(&mut vertices);
    assert!(fetch.triangles > 0);
    assert!(!fetch.truncated);
    // Silhouette cells see grazing depth; the bulk must sit on the sphere.
    let mesh = &vertices[..fetch.triangles * 3];
    let on_sphere = mesh
        .iter()
        .filter(|v| ((**v - Vec3::new(0.0, 0.0, 1.0)).length() - 0.3).abs() < 0.02)
        .count();
    assert!(on_sphere * 100 >= mesh.len() * 95, "{on_sphere} of {} on the sphere", mesh.len());

    let scene = system.rendered_scene().unwrap();
    assert_eq!(scene.dimensions(), (64, 48));
    // Sphere centre is lit, corners miss.
    assert!(scene.get_pixel(32, 24)[0] > 200);
    assert_eq!(scene.get_pixel(0, 0)[0], 0);
}

#[test]
fn test_moving_camera_with_known_poses() {
    let config = config();
    let trajectory: Vec<Affine3A> = (0..4)
        .map(|i| Affine3A::from_translation(Vec3::new(0.03 * i as f32, 0.0, 0.0)))
        .collect();
    let mut stream = SyntheticStream::new(sphere(), config.intrinsics, trajectory.clone());
    let mut system = System::new(config, Box::new(ScriptedOdometry::new(trajectory.clone()))).unwrap();

    let mut last = None;
    while let Some(capture) = stream.next_frame().unwrap() {
        last = system.process_capture(capture).unwrap();
    }
    let last = last.unwrap();
    assert_eq!(last.pose, trajectory[3]);
    assert!(last.predicted_pixels > 0);
    assert_eq!(system.current_camera_pose(), glam::Mat4::from(trajectory[3]));
    assert_eq!(system.keyframe().unwrap().id(), 2);
    assert_eq!(last.position_error, Some(0.0));
}

#[test]
fn test_still_odometry_drifts_from_recorded_poses() {
    let config = config();
    let trajectory: Vec<Affine3A> = (0..3)
        .map(|i| Affine3A::from_translation(Vec3::new(0.0, 0.02 * i as f32, 0.0)))
        .collect();
    let mut stream = SyntheticStream::new(sphere(), config.intrinsics, trajectory);
    let mut system = System::new(config, Box::new(StaticOdometry::default())).unwrap();

    let mut errors = Vec::new();
    while let Some(capture) = stream.next_frame().unwrap() {
        errors.push(system.process_capture(capture).unwrap().unwrap().position_error.unwrap());
    }
    assert_relative_eq!(errors[0], 0.0);
    assert_relative_eq!(errors[2], 0.04, epsilon = 1e-6);
}

#[test]
fn test_hold_then_save() {
    let config = config();
    let mut stream = SyntheticStream::stationary(SyntheticScene::Plane { distance: 1.0 }, config.intrinsics, 2);
    let mut system = System::new(config, Box::new(StaticOdometry::default())).unwrap();

    system.process_capture(stream.next_frame().unwrap().unwrap()).unwrap();
    let blocks = system.mapping().map().allocated_block_count();
    system.set_integration_mode(IntegrationMode::Hold);
    let held = system.process_capture(stream.next_frame().unwrap().unwrap()).unwrap().unwrap();
    assert!(held.integration.is_none());
    assert!(held.predicted_pixels > 0);
    assert_eq!(system.mapping().map().allocated_block_count(), blocks);

    let path = std::env::temp_dir().join(format!("fusion_system_{}.stl", std::process::id()));
    let triangles = system.save_mesh_to_file(&path).unwrap();
    assert!(triangles > 0);
    assert_eq!(read_binary_stl(&path).unwrap().len(), triangles * 3);
    std::fs::remove_file(&path).ok();

    let mut vertices = vec![Vec3::ZERO; 30];
    let mut normals = vec![Vec3::ZERO; 30];
    let fetch = system.fetch_mesh_with_normal(&mut vertices, &mut normals);
    assert_eq!(fetch.triangles, 10);
    assert!(fetch.truncated);
}
