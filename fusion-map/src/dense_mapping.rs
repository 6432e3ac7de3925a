//! Facade over the map and its per-frame passes.

use crate::config::MapConfig;
use crate::error::MapError;
use crate::integrate::{self, IntegrationReport};
use crate::map_struct::MapStruct;
use crate::mesh::{MeshReport, extract_mesh};
use crate::raycast::{self, SurfacePrediction};
use crate::visibility::{self, ZRangeMap};
use fusion_data::{Intrinsics, MeshFetch, PixelMap, RgbdImage, TriangleMesh, save_binary_stl};
use glam::{Affine3A, Vec3};
use image::RgbImage;
use std::path::Path;
use tracing::{debug, info, warn};

/// Owns one map plus everything derived from it for the current view.
pub struct DenseMapping {
    intrinsics: Intrinsics,
    map: MapStruct,
    zrange: ZRangeMap,
    prediction: Option<SurfacePrediction>,
    scene_mesh: TriangleMesh,
    last_mesh: MeshReport,
}

impl DenseMapping {
    pub fn new(intrinsics: Intrinsics, config: MapConfig) -> Result<Self, MapError> {
        let map = MapStruct::allocate(config)?;
        Ok(Self {
            zrange: ZRangeMap::new(&intrinsics),
            intrinsics,
            map,
            prediction: None,
            scene_mesh: TriangleMesh::new(),
            last_mesh: MeshReport::default(),
        })
    }

    pub fn map(&self) -> &MapStruct {
        &self.map
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// Integrate the full-resolution depth and colour of `image`'s reference
    /// frame at that frame's pose.
    ///
    /// Returns `None` without touching the map if the image has no frame or
    /// the frame has no pose yet.
    pub fn update(&mut self, image: &RgbdImage) -> Option<IntegrationReport> {
        let Some(frame) = image.reference_frame() else {
            warn!("Integration skipped: image has no reference frame");
            return None;
        };
        let Some(pose) = frame.pose() else {
            warn!("Integration skipped: frame {} has no pose", frame.id());
            return None;
        };
        let report = integrate::update(&mut self.map, frame.depth(), frame.image(), &pose, &self.intrinsics);
        debug!(
            "Frame {} integrated, {} blocks allocated",
            frame.id(),
            self.map.allocated_block_count()
        );
        Some(report)
    }

    /// Predict the surface seen from the pose of `image`'s reference frame and
    /// store it as the image's finest vertex/normal maps.
    ///
    /// Returns `None` if the image has no posed frame.
    pub fn raycast(&mut self, image: &mut RgbdImage) -> Option<&SurfacePrediction> {
        let pose = image.reference_frame().and_then(|frame| frame.pose())?;
        let prediction = self.raycast_from(&pose);
        if !image.set_prediction(prediction.vmap.clone(), prediction.nmap.clone()) {
            warn!("Prediction size does not match the image, leaving its maps as captured");
        }
        Some(prediction)
    }

    /// Refresh visibility and raycast from an arbitrary camera-to-world pose.
    ///
    /// With no visible blocks the prediction is empty and no rays are cast.
    pub fn raycast_from(&mut self, pose: &Affine3A) -> &SurfacePrediction {
        let visible = visibility::update_visible_blocks(&mut self.map, pose, &self.intrinsics);
        let prediction = if visible == 0 {
            debug!("No visible blocks, skipping raycast");
            self.map.set_rendering_blocks(Vec::new());
            self.zrange.clear();
            let (width, height) = (self.intrinsics.width, self.intrinsics.height);
            SurfacePrediction {
                vmap: PixelMap::new(width, height, None),
                nmap: PixelMap::new(width, height, None),
                pose: *pose,
            }
        } else {
            visibility::create_rendering_blocks(&mut self.map, &mut self.zrange, pose, &self.intrinsics);
            raycast::raycast(&self.map, &self.zrange, pose, &self.intrinsics)
        };
        self.prediction.insert(prediction)
    }

    /// The last surface prediction, if any.
    pub fn prediction(&self) -> Option<&SurfacePrediction> {
        self.prediction.as_ref()
    }

    /// Shaded rendering of the last prediction.
    pub fn render_scene(&self) -> Option<RgbImage> {
        self.prediction
            .as_ref()
            .map(|p| raycast::render_shaded(&p.vmap, &p.nmap))
    }

    /// Shaded rendering of the last prediction in the fused surface colours.
    pub fn render_scene_textured(&self) -> Option<RgbImage> {
        self.prediction
            .as_ref()
            .map(|p| raycast::render_textured(&self.map, p))
    }

    /// Extract the whole map into the internal staging mesh, replacing its
    /// previous contents. Normals are always computed.
    pub fn create_scene_mesh(&mut self) -> MeshReport {
        let capacity = self.map.config().mesh_triangle_capacity;
        let extraction = extract_mesh(&self.map, true, capacity);
        self.scene_mesh = extraction.mesh;
        self.last_mesh = extraction.report;
        info!(
            "Scene mesh: {} triangles from {} blocks",
            self.last_mesh.triangles,
            self.map.allocated_block_count()
        );
        self.last_mesh
    }

    pub fn scene_mesh(&self) -> &TriangleMesh {
        &self.scene_mesh
    }

    pub fn last_mesh_report(&self) -> MeshReport {
        self.last_mesh
    }

    /// Extract the map and copy whole triangles into `vertices`
    /// (three entries per triangle).
    pub fn fetch_mesh(&mut self, vertices: &mut [Vec3]) -> MeshFetch {
        self.create_scene_mesh();
        let count = (vertices.len() / 3).min(self.scene_mesh.triangle_count());
        vertices[..count * 3].copy_from_slice(&self.scene_mesh.vertices[..count * 3]);
        self.fetch_result(count)
    }

    /// Like [`DenseMapping::fetch_mesh`], also filling per-vertex normals.
    /// The triangle count is limited by the shorter of the two buffers.
    pub fn fetch_mesh_with_normal(&mut self, vertices: &mut [Vec3], normals: &mut [Vec3]) -> MeshFetch {
        self.create_scene_mesh();
        let room = vertices.len().min(normals.len()) / 3;
        let count = room.min(self.scene_mesh.triangle_count());
        vertices[..count * 3].copy_from_slice(&self.scene_mesh.vertices[..count * 3]);
        normals[..count * 3].copy_from_slice(&self.scene_mesh.normals[..count * 3]);
        self.fetch_result(count)
    }

    fn fetch_result(&self, count: usize) -> MeshFetch {
        MeshFetch {
            triangles: count,
            truncated: self.last_mesh.truncated || count < self.scene_mesh.triangle_count(),
        }
    }

    /// Write the staging mesh (from the last [`DenseMapping::create_scene_mesh`])
    /// as binary STL. Writes nothing when it is empty.
    pub fn write_mesh_to_file(&self, path: impl AsRef<Path>) -> Result<usize, MapError> {
        Ok(save_binary_stl(path, &self.scene_mesh.vertices)?)
    }

    /// Discard everything fused so far.
    pub fn restart_mapping(&mut self) {
        self.map.reset();
        self.zrange.clear();
        self.prediction = None;
        self.scene_mesh.clear();
        self.last_mesh = MeshReport::default();
        info!("Mapping restarted");
    }
}
