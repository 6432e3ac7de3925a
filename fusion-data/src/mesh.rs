//! Triangle soup buffers produced by mesh extraction.
//!
//! These are CPU-side, unindexed meshes: every three consecutive vertices form
//! one triangle, and normals (when present) are per vertex in the same order.

use glam::Vec3;

/// A single triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
}

impl Triangle {
    pub fn new(v0: Vec3, v1: Vec3, v2: Vec3) -> Self {
        Self {
            vertices: [v0, v1, v2],
        }
    }

    /// Compute the center (centroid) of the triangle.
    pub fn center(&self) -> Vec3 {
        (self.vertices[0] + self.vertices[1] + self.vertices[2]) / 3.0
    }

    /// Compute the normal of the triangle (not normalized).
    pub fn normal(&self) -> Vec3 {
        let e1 = self.vertices[1] - self.vertices[0];
        let e2 = self.vertices[2] - self.vertices[0];
        e1.cross(e2)
    }

    /// Compute the normalized normal of the triangle.
    pub fn unit_normal(&self) -> Vec3 {
        self.normal().normalize_or_zero()
    }

    pub fn area(&self) -> f32 {
        self.normal().length() * 0.5
    }
}

/// Flat triangle soup with optional per-vertex normals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    /// Empty when normals were not requested, otherwise `vertices.len()` long.
    pub normals: Vec<Vec3>,
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.normals.clear();
    }

    pub fn triangle(&self, index: usize) -> Option<Triangle> {
        let v = self.vertices.get(index * 3..index * 3 + 3)?;
        Some(Triangle::new(v[0], v[1], v[2]))
    }

    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.vertices
            .chunks_exact(3)
            .map(|v| Triangle::new(v[0], v[1], v[2]))
    }

    /// Append another soup. Normals are kept only if both sides have them.
    pub fn append(&mut self, other: &mut TriangleMesh) {
        if other.is_empty() {
            return;
        }
        let keep_normals = (self.is_empty() || self.has_normals()) && other.has_normals();
        if !keep_normals {
            self.normals.clear();
            other.normals.clear();
        }
        self.vertices.append(&mut other.vertices);
        self.normals.append(&mut other.normals);
    }

    /// Drop everything past the first `count` triangles.
    pub fn truncate(&mut self, count: usize) {
        self.vertices.truncate(count * 3);
        if self.has_normals() {
            self.normals.truncate(count * 3);
        }
    }

    /// Raw little-endian-on-LE-hosts view of the vertex positions.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.vertices.first()?;
        Some(
            self.vertices
                .iter()
                .fold((first, first), |(min, max), v| (min.min(*v), max.max(*v))),
        )
    }
}

/// Result of copying triangles into caller-owned storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshFetch {
    /// Triangles written from the start of the destination.
    pub triangles: usize,
    /// True if the source produced more triangles than fit.
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> Vec<Vec3> {
        vec![Vec3::ZERO, Vec3::X, Vec3::Y]
    }

    #[test]
    fn test_triangle_normal() {
        let t = Triangle::new(Vec3::ZERO, Vec3::X, Vec3::Y);
        assert!((t.unit_normal() - Vec3::Z).length() < 0.001);
        assert_eq!(t.area(), 0.5);
        assert_eq!(t.center(), Vec3::new(1.0 / 3.0, 1.0 / 3.0, 0.0));
    }

    #[test]
    fn test_mesh_truncate_and_count() {
        let mut mesh = TriangleMesh::new();
        mesh.vertices = [unit_triangle(), unit_triangle(), unit_triangle()].concat();
        assert_eq!(mesh.triangle_count(), 3);
        mesh.truncate(1);
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.vertex_bytes().len(), 36);
    }

    #[test]
    fn test_append_drops_normals_when_missing() {
        let mut a = TriangleMesh {
            vertices: unit_triangle(),
            normals: vec![Vec3::Z; 3],
        };
        let mut b = TriangleMesh {
            vertices: unit_triangle(),
            normals: Vec::new(),
        };
        a.append(&mut b);
        assert_eq!(a.triangle_count(), 2);
        assert!(!a.has_normals());
    }

    #[test]
    fn test_append_empty_keeps_normals() {
        let mut a = TriangleMesh {
            vertices: unit_triangle(),
            normals: vec![Vec3::Z; 3],
        };
        a.append(&mut TriangleMesh::new());
        assert!(a.has_normals());
        assert_eq!(a.normals.len(), 3);
    }

    #[test]
    fn test_bounds() {
        let mesh = TriangleMesh {
            vertices: unit_triangle(),
            normals: Vec::new(),
        };
        let (min, max) = mesh.bounds().unwrap();
        assert_eq!(min, Vec3::ZERO);
        assert_eq!(max, Vec3::new(1.0, 1.0, 0.0));
        assert!(TriangleMesh::new().bounds().is_none());
    }
}
