//! Map capacity and fusion parameters.

use crate::error::MapError;
use crate::hash_table::BUCKET_SIZE;
use crate::voxel::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Construction-time map configuration. None of these can change while a
/// map exists; a different configuration needs a new map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Number of hash buckets.
    pub bucket_count: usize,
    /// Entries in the shared overflow list.
    pub excess_count: usize,
    /// Voxel blocks in the pool.
    pub block_capacity: usize,
    /// Edge length of one voxel in world units.
    pub voxel_size: f32,
    /// Half width of the band around observed surfaces that receives evidence.
    pub truncation_distance: f32,
    /// Saturation value of the per-voxel confidence weight.
    pub max_weight: f32,
    /// Depth samples outside `[min_depth, max_depth]` are ignored.
    pub min_depth: f32,
    pub max_depth: f32,
    /// Upper bound on screen-space rendering blocks per frame.
    pub rendering_block_capacity: usize,
    /// Triangle capacity of the internal mesh staging buffer.
    pub mesh_triangle_capacity: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            bucket_count: 300_000,
            excess_count: 150_000,
            block_capacity: 100_000,
            voxel_size: 0.003,
            truncation_distance: 0.03,
            max_weight: 100.0,
            min_depth: 0.1,
            max_depth: 3.0,
            rendering_block_capacity: 262_144,
            mesh_triangle_capacity: 2_000_000,
        }
    }
}

impl MapConfig {
    /// Override the three table capacities.
    pub fn with_capacity(mut self, bucket_count: usize, excess_count: usize, block_capacity: usize) -> Self {
        self.bucket_count = bucket_count;
        self.excess_count = excess_count;
        self.block_capacity = block_capacity;
        self
    }

    /// Override voxel size and truncation band together.
    pub fn with_resolution(mut self, voxel_size: f32, truncation_distance: f32) -> Self {
        self.voxel_size = voxel_size;
        self.truncation_distance = truncation_distance;
        self
    }

    /// Edge length of one voxel block in world units.
    pub fn block_extent(&self) -> f32 {
        self.voxel_size * BLOCK_SIZE as f32
    }

    /// Bucket slots plus excess entries.
    pub fn total_hash_entries(&self) -> usize {
        self.bucket_count * BUCKET_SIZE + self.excess_count
    }

    /// Ray marching step; never larger than the truncation band.
    pub fn raycast_step(&self) -> f32 {
        self.truncation_distance * 0.5
    }

    pub fn depth_in_range(&self, depth: f32) -> bool {
        fusion_data::is_valid_depth(depth) && depth >= self.min_depth && depth <= self.max_depth
    }

    pub fn validate(&self) -> Result<(), MapError> {
        let invalid = |msg: &str| Err(MapError::InvalidConfig(msg.to_string()));
        if self.bucket_count == 0 {
            return invalid("bucket_count must be positive");
        }
        if self.block_capacity == 0 {
            return invalid("block_capacity must be positive");
        }
        if self.block_capacity > i32::MAX as usize || self.total_hash_entries() > i32::MAX as usize {
            return invalid("capacities exceed the addressable range");
        }
        if !(self.voxel_size > 0.0) {
            return invalid("voxel_size must be positive");
        }
        if self.truncation_distance < self.voxel_size {
            return invalid("truncation_distance must span at least one voxel");
        }
        if !(self.max_weight >= 1.0) {
            return invalid("max_weight must be at least 1");
        }
        if !(self.min_depth >= 0.0 && self.max_depth > self.min_depth) {
            return invalid("depth range is empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_capacities() {
        let config = MapConfig::default();
        assert_eq!(config.total_hash_entries(), 300_000 * BUCKET_SIZE + 150_000);
        assert!(config.validate().is_ok());
        assert!((config.block_extent() - 0.024).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MapConfig::default().with_capacity(0, 10, 10).validate().is_err());
        assert!(MapConfig::default().with_capacity(10, 10, 0).validate().is_err());
        assert!(MapConfig::default().with_resolution(0.01, 0.005).validate().is_err());
        assert!(MapConfig::default().with_resolution(-1.0, 0.05).validate().is_err());
        let mut config = MapConfig::default();
        config.max_depth = 0.05;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_depth_range() {
        let config = MapConfig::default();
        assert!(config.depth_in_range(1.0));
        assert!(!config.depth_in_range(0.05));
        assert!(!config.depth_in_range(5.0));
        assert!(!config.depth_in_range(f32::NAN));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MapConfig = serde_json::from_str(r#"{ "voxel_size": 0.01 }"#).unwrap();
        assert_eq!(config.voxel_size, 0.01);
        assert_eq!(config.bucket_count, 300_000);
    }
}
