use super::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, EDGE_TABLE, TRI_TABLE};
use super::{MeshExtraction, MeshReport};
use crate::map_struct::MapStruct;
use crate::voxel::{BLOCK_SIZE, local_index};
use fusion_data::TriangleMesh;
use glam::{IVec3, Vec3};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Blocks handled by one parallel task.
const CHUNK_BLOCKS: usize = 64;

/// Samples per grid edge: the block plus one layer borrowed from the
/// neighbours in +x, +y and +z.
const GRID: i32 = BLOCK_SIZE + 1;

/// Polygonise every allocated block, keeping at most `capacity` triangles.
///
/// Blocks are visited in allocation order and their triangles are emitted in
/// that order, so a capped extraction is always a prefix of the full one.
/// Cells with any unobserved corner produce nothing.
#[tracing::instrument(skip(map))]
pub fn extract_mesh(map: &MapStruct, with_normals: bool, capacity: usize) -> MeshExtraction {
    let blocks: Vec<u32> = (0..map.allocated_block_count() as u32).collect();
    extract_blocks(map, &blocks, with_normals, capacity)
}

/// Like [`extract_mesh`], restricted to the blocks at `coords` in the given
/// order. Coordinates with no allocated block are skipped.
#[tracing::instrument(skip(map, coords), fields(requested = coords.len()))]
pub fn extract_mesh_from(map: &MapStruct, coords: &[IVec3], with_normals: bool, capacity: usize) -> MeshExtraction {
    let blocks: Vec<u32> = coords.iter().filter_map(|&coord| map.find_block(coord)).collect();
    if blocks.len() < coords.len() {
        debug!("{} requested blocks are not allocated", coords.len() - blocks.len());
    }
    extract_blocks(map, &blocks, with_normals, capacity)
}

fn extract_blocks(map: &MapStruct, blocks: &[u32], with_normals: bool, capacity: usize) -> MeshExtraction {
    let block_count = blocks.len();
    let wave = CHUNK_BLOCKS * rayon::current_num_threads().max(1);
    let mut mesh = TriangleMesh::new();
    let mut report = MeshReport::default();
    let mut full = capacity == 0;

    'waves: for wave_blocks in blocks.chunks(wave) {
        let chunks: Vec<(usize, TriangleMesh)> = wave_blocks
            .par_chunks(CHUNK_BLOCKS)
            .map(|chunk_blocks| {
                let mut chunk = TriangleMesh::new();
                for &block in chunk_blocks {
                    polygonise_block(map, block, with_normals, &mut chunk);
                }
                (chunk_blocks.len(), chunk)
            })
            .collect();

        for (visited, mut chunk) in chunks {
            report.blocks_visited += visited;
            if full {
                // Output is exactly at capacity; only more triangles make it short.
                if !chunk.is_empty() {
                    report.truncated = true;
                    break 'waves;
                }
                continue;
            }
            mesh.append(&mut chunk);
            if mesh.triangle_count() > capacity {
                report.truncated = true;
                mesh.truncate(capacity);
                break 'waves;
            }
            full = mesh.triangle_count() == capacity;
        }
    }

    if with_normals && mesh.normals.len() != mesh.vertices.len() {
        mesh.normals.resize(mesh.vertices.len(), Vec3::ZERO);
    }
    report.triangles = mesh.triangle_count();
    if report.truncated {
        warn!(
            "Mesh extraction stopped at {} triangles after {} of {} blocks",
            capacity, report.blocks_visited, block_count
        );
    } else {
        debug!("Extracted {} triangles from {} blocks", report.triangles, block_count);
    }
    MeshExtraction { mesh, report }
}

/// Sample the block and its +x/+y/+z border into a dense grid of normalised
/// SDF values, `None` where unobserved.
fn gather_grid(map: &MapStruct, coord: IVec3) -> Vec<Option<f32>> {
    // Neighbour block indices, addressed by (dx, dy, dz) bits.
    let neighbours: [Option<u32>; 8] = std::array::from_fn(|i| {
        let offset = IVec3::new((i & 1) as i32, ((i >> 1) & 1) as i32, ((i >> 2) & 1) as i32);
        map.find_block(coord + offset)
    });

    let mut grid = Vec::with_capacity((GRID * GRID * GRID) as usize);
    for z in 0..GRID {
        for y in 0..GRID {
            for x in 0..GRID {
                let p = IVec3::new(x, y, z);
                let carry = p / BLOCK_SIZE;
                let which = (carry.x | (carry.y << 1) | (carry.z << 2)) as usize;
                let sample = neighbours[which].and_then(|block| {
                    let voxel = map.block_voxels(block)[local_index(p - carry * BLOCK_SIZE)];
                    voxel.is_observed().then_some(voxel.sdf)
                });
                grid.push(sample);
            }
        }
    }
    grid
}

fn polygonise_block(map: &MapStruct, block: u32, with_normals: bool, out: &mut TriangleMesh) {
    let coord = map.block_coord(block);
    let grid = gather_grid(map, coord);
    let sample = |p: IVec3| grid[(p.x + p.y * GRID + p.z * GRID * GRID) as usize];
    let base = coord * BLOCK_SIZE;
    let mut sampler = map.sampler();

    for z in 0..BLOCK_SIZE {
        for y in 0..BLOCK_SIZE {
            for x in 0..BLOCK_SIZE {
                let cell = IVec3::new(x, y, z);

                let mut values = [0.0f32; 8];
                let mut complete = true;
                for (value, offset) in values.iter_mut().zip(CORNER_OFFSETS) {
                    match sample(cell + IVec3::from_array(offset)) {
                        Some(sdf) => *value = sdf,
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if !complete {
                    continue;
                }

                let mut case = 0usize;
                for (i, value) in values.iter().enumerate() {
                    if *value < 0.0 {
                        case |= 1 << i;
                    }
                }
                let edges = EDGE_TABLE[case];
                if edges == 0 {
                    continue;
                }

                let mut edge_vertices = [Vec3::ZERO; 12];
                for (i, [a, b]) in EDGE_CONNECTIONS.into_iter().enumerate() {
                    if edges & (1 << i) == 0 {
                        continue;
                    }
                    let pa = map.voxel_center(base + cell + IVec3::from_array(CORNER_OFFSETS[a]));
                    let pb = map.voxel_center(base + cell + IVec3::from_array(CORNER_OFFSETS[b]));
                    let t = (values[a] / (values[a] - values[b])).clamp(0.0, 1.0);
                    edge_vertices[i] = pa + (pb - pa) * t;
                }

                for triangle in TRI_TABLE[case].chunks_exact(3).take_while(|t| t[0] != -1) {
                    let v = [
                        edge_vertices[triangle[0] as usize],
                        edge_vertices[triangle[1] as usize],
                        edge_vertices[triangle[2] as usize],
                    ];
                    out.vertices.extend_from_slice(&v);
                    if with_normals {
                        let face = (v[1] - v[0]).cross(v[2] - v[0]).normalize_or_zero();
                        for vertex in v {
                            let normal = sampler
                                .gradient(vertex)
                                .map(Vec3::normalize_or_zero)
                                .filter(|n| *n != Vec3::ZERO)
                                .unwrap_or(face);
                            out.normals.push(normal);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::voxel::local_coord;

    /// A map whose blocks hold the field `sdf = (z - plane_z)` clamped to the band.
    fn plane_map(plane_z: f32, blocks: &[IVec3]) -> MapStruct {
        let config = MapConfig::default()
            .with_capacity(1024, 256, 256)
            .with_resolution(0.01, 0.04);
        let mut map = MapStruct::allocate(config).unwrap();
        map.allocate_blocks(blocks);
        let voxel_size = config.voxel_size;
        let (coords, voxels) = map.allocated_blocks_mut();
        for (b, coord) in coords.iter().enumerate() {
            for i in 0..crate::voxel::BLOCK_VOLUME {
                let v = *coord * BLOCK_SIZE + local_coord(i);
                let z = (v.z as f32 + 0.5) * voxel_size;
                let sdf = ((plane_z - z) / 0.04).clamp(-1.0, 1.0);
                voxels[b * crate::voxel::BLOCK_VOLUME + i].fuse(sdf, [0, 0, 0], 10.0);
            }
        }
        map
    }

    #[test]
    fn test_plane_inside_one_block() {
        let map = plane_map(0.043, &[IVec3::ZERO]);
        let extraction = extract_mesh(&map, true, usize::MAX);
        // 7 x 7 interior cells, two triangles each.
        assert_eq!(extraction.report.triangles, 7 * 7 * 2);
        assert!(!extraction.report.truncated);
        for v in &extraction.mesh.vertices {
            assert!((v.z - 0.043).abs() < 1e-4);
        }
        for n in &extraction.mesh.normals {
            assert!(n.z.abs() > 0.99);
        }
    }

    #[test]
    fn test_neighbour_blocks_close_the_seams() {
        let blocks = [IVec3::ZERO, IVec3::X, IVec3::Y, IVec3::new(1, 1, 0)];
        let map = plane_map(0.043, &blocks);
        let extraction = extract_mesh(&map, false, usize::MAX);
        // 15 x 15 cells with all four corners present.
        assert_eq!(extraction.report.triangles, 15 * 15 * 2);
        assert!(extraction.mesh.normals.is_empty());
    }

    #[test]
    fn test_capacity_keeps_a_prefix() {
        let blocks = [IVec3::ZERO, IVec3::X, IVec3::Y, IVec3::new(1, 1, 0)];
        let map = plane_map(0.043, &blocks);
        let full = extract_mesh(&map, false, usize::MAX);
        let capped = extract_mesh(&map, false, 100);
        assert_eq!(capped.report.triangles, 100);
        assert!(capped.report.truncated);
        assert_eq!(capped.mesh.vertices[..], full.mesh.vertices[..300]);
    }

    /// Blocks far above the plane: observed, but entirely inside the surface.
    fn empty_blocks(count: i32) -> impl Iterator<Item = IVec3> {
        (0..count).map(move |i| IVec3::new(i - count / 2, 0, 5))
    }

    #[test]
    fn test_exact_capacity_is_not_truncated() {
        let blocks: Vec<IVec3> = std::iter::once(IVec3::ZERO).chain(empty_blocks(150)).collect();
        let map = plane_map(0.043, &blocks);
        let full = extract_mesh(&map, false, usize::MAX);
        assert_eq!(full.report.triangles, 98);

        let exact = extract_mesh(&map, false, 98);
        assert_eq!(exact.report.triangles, 98);
        assert!(!exact.report.truncated);
        assert_eq!(exact.report.blocks_visited, 151);
        assert_eq!(exact.mesh, full.mesh);
    }

    #[test]
    fn test_triangles_after_a_full_buffer_are_reported() {
        let blocks: Vec<IVec3> = std::iter::once(IVec3::ZERO)
            .chain(empty_blocks(100))
            .chain(std::iter::once(IVec3::new(10, 10, 0)))
            .collect();
        let map = plane_map(0.043, &blocks);
        assert_eq!(extract_mesh(&map, false, usize::MAX).report.triangles, 196);

        let capped = extract_mesh(&map, false, 98);
        assert_eq!(capped.report.triangles, 98);
        assert!(capped.report.truncated);
        assert!(extract_mesh(&map, false, 0).report.truncated);
    }

    #[test]
    fn test_restricted_extraction() {
        let blocks = [IVec3::ZERO, IVec3::X, IVec3::Y, IVec3::new(1, 1, 0)];
        let map = plane_map(0.043, &blocks);
        let extraction = extract_mesh_from(&map, &[IVec3::new(1, 1, 0), IVec3::new(5, 5, 5)], false, usize::MAX);
        // The corner block has no +x or +y neighbours.
        assert_eq!(extraction.report.blocks_visited, 1);
        assert_eq!(extraction.report.triangles, 7 * 7 * 2);
        for v in &extraction.mesh.vertices {
            assert!(v.x > 0.08 && v.y > 0.08);
        }
    }

    #[test]
    fn test_empty_map() {
        let config = MapConfig::default().with_capacity(16, 4, 4);
        let map = MapStruct::allocate(config).unwrap();
        let extraction = extract_mesh(&map, true, 10);
        assert_eq!(extraction.report, MeshReport::default());
        assert!(extraction.mesh.is_empty());
    }
}
