//! Configuration for pools, stack allocators and the garbage collector
//!
//! All structs deserialize with `serde` (missing fields take their defaults)
//! and provide `with_*` builders. [`PoolPreset`] bundles size-class tables for
//! the common pool kinds of a renderer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::size_class::{SizeClass, MAX_SLOTS_PER_CHUNK};
use crate::backend::BufferUsage;
use crate::error::{ForgeMemError, MemResult};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// One size class as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassConfig {
    pub slot_size: u64,
    pub chunk_size: u64,
}

impl SizeClassConfig {
    pub const fn new(slot_size: u64, chunk_size: u64) -> Self {
        Self {
            slot_size,
            chunk_size,
        }
    }
}

/// Order in which closed garbage buckets are examined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Oldest first; stop at the first bucket whose fence has not signaled
    #[default]
    StopAtFirstPending,
    /// Reclaim every signaled bucket regardless of order
    FullScan,
}

/// Deferred-free queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GarbageCollectorConfig {
    /// Closed buckets allowed before `end_frame` blocks on the oldest fence
    pub max_frames_in_flight: usize,
    pub fence_timeout_ms: u64,
    pub policy: ReclaimPolicy,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 3,
            fence_timeout_ms: 1000,
            policy: ReclaimPolicy::StopAtFirstPending,
        }
    }
}

impl GarbageCollectorConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_policy(mut self, policy: ReclaimPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> MemResult<()> {
        if self.max_frames_in_flight == 0 {
            return Err(ForgeMemError::InvalidConfiguration(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Preset pool configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPreset {
    /// Vertex and index data of all meshes, device-local
    UnifiedGeometry,
    /// Per-object scene data (transforms, materials, lights)
    GpuScene,
    /// Host-visible device memory written directly by the CPU
    Rebar,
    /// Geometry classes with explicit backing buffer sizing
    Custom {
        buffer_size_hint: u64,
        max_buffer_count: usize,
    },
}

impl PoolPreset {
    pub fn size_classes(self) -> Vec<SizeClassConfig> {
        match self {
            PoolPreset::UnifiedGeometry | PoolPreset::Custom { .. } => vec![
                SizeClassConfig::new(256, 64 * KIB),
                SizeClassConfig::new(4 * KIB, MIB),
                SizeClassConfig::new(64 * KIB, 8 * MIB),
                SizeClassConfig::new(MIB, 64 * MIB),
            ],
            PoolPreset::GpuScene => vec![
                SizeClassConfig::new(64, 16 * KIB),
                SizeClassConfig::new(256, 64 * KIB),
                SizeClassConfig::new(KIB, 256 * KIB),
                SizeClassConfig::new(4 * KIB, MIB),
                SizeClassConfig::new(16 * KIB, 4 * MIB),
            ],
            PoolPreset::Rebar => vec![
                SizeClassConfig::new(256, 64 * KIB),
                SizeClassConfig::new(4 * KIB, MIB),
                SizeClassConfig::new(64 * KIB, 16 * MIB),
            ],
        }
    }
}

/// Configuration of a [`GpuBufferPool`](super::GpuBufferPool)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size_classes: Vec<SizeClassConfig>,
    /// Size of each backing buffer; larger chunks get a buffer of their own size
    pub buffer_size_hint: u64,
    pub max_buffer_count: usize,
    pub usage: BufferUsage,
    /// Backing buffers are host-visible and mapped for their lifetime
    pub mappable: bool,
    /// Emptied chunks kept per class instead of being returned
    pub retain_empty_chunks: usize,
    pub garbage: GarbageCollectorConfig,
    /// Collect prometheus metrics and log statistics at `end_frame`
    pub telemetry: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_preset(PoolPreset::UnifiedGeometry)
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_preset(preset: PoolPreset) -> Self {
        let size_classes = preset.size_classes();
        let (buffer_size_hint, max_buffer_count, usage, mappable) = match preset {
            PoolPreset::UnifiedGeometry => (
                128 * MIB,
                8,
                BufferUsage::VERTEX
                    | BufferUsage::INDEX
                    | BufferUsage::STORAGE
                    | BufferUsage::TRANSFER_DST,
                false,
            ),
            PoolPreset::GpuScene => (
                32 * MIB,
                4,
                BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
                false,
            ),
            PoolPreset::Rebar => (
                64 * MIB,
                2,
                BufferUsage::STORAGE
                    | BufferUsage::UNIFORM
                    | BufferUsage::VERTEX
                    | BufferUsage::INDEX,
                true,
            ),
            PoolPreset::Custom {
                buffer_size_hint,
                max_buffer_count,
            } => (
                buffer_size_hint,
                max_buffer_count,
                BufferUsage::default(),
                false,
            ),
        };
        PoolConfig {
            size_classes,
            buffer_size_hint,
            max_buffer_count,
            usage,
            mappable,
            retain_empty_chunks: 0,
            garbage: GarbageCollectorConfig::default(),
            telemetry: false,
        }
    }

    /// Parse a JSON document; fields not present keep their defaults
    pub fn from_json(json: &str) -> MemResult<Self> {
        let config: PoolConfig = serde_json::from_str(json)
            .map_err(|e| ForgeMemError::InvalidConfiguration(format!("pool config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_size_classes(mut self, size_classes: Vec<SizeClassConfig>) -> Self {
        self.size_classes = size_classes;
        self
    }

    pub fn with_buffer_size_hint(mut self, bytes: u64) -> Self {
        self.buffer_size_hint = bytes;
        self
    }

    pub fn with_max_buffer_count(mut self, count: usize) -> Self {
        self.max_buffer_count = count;
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_mappable(mut self, mappable: bool) -> Self {
        self.mappable = mappable;
        self
    }

    pub fn with_retained_chunks(mut self, count: usize) -> Self {
        self.retain_empty_chunks = count;
        self
    }

    pub fn with_garbage(mut self, garbage: GarbageCollectorConfig) -> Self {
        self.garbage = garbage;
        self
    }

    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }

    pub fn validate(&self) -> MemResult<()> {
        if self.size_classes.is_empty() {
            return Err(ForgeMemError::InvalidConfiguration(
                "pool needs at least one size class".to_string(),
            ));
        }
        for class in &self.size_classes {
            SizeClass::new(class.slot_size, class.chunk_size)?;
        }
        if self
            .size_classes
            .windows(2)
            .any(|w| w[0].slot_size >= w[1].slot_size)
        {
            return Err(ForgeMemError::InvalidConfiguration(
                "size classes must be ordered by increasing slot size".to_string(),
            ));
        }
        if self.buffer_size_hint == 0 {
            return Err(ForgeMemError::InvalidConfiguration(
                "buffer_size_hint must be non-zero".to_string(),
            ));
        }
        if self.max_buffer_count == 0 {
            return Err(ForgeMemError::InvalidConfiguration(
                "max_buffer_count must be at least 1".to_string(),
            ));
        }
        self.garbage.validate()
    }
}

/// Configuration of a [`StackFrameAllocator`](super::StackFrameAllocator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackAllocatorConfig {
    pub initial_chunk_size: u64,
    /// Each chunk is at least `previous * growth_scale + growth_bias` bytes,
    /// where `previous` is the actual size of the chunk before it
    pub growth_scale: f64,
    pub growth_bias: u64,
    pub max_chunks: usize,
    /// Never grow past the first chunk; overflow is `OutOfMemory`
    pub fixed_capacity: bool,
    /// Every allocation is aligned to at least this (power of two)
    pub min_alignment: u64,
    pub usage: BufferUsage,
    pub mappable: bool,
}

impl Default for StackAllocatorConfig {
    fn default() -> Self {
        Self {
            initial_chunk_size: MIB,
            growth_scale: 2.0,
            growth_bias: 0,
            max_chunks: 16,
            fixed_capacity: false,
            min_alignment: 16,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::UNIFORM | BufferUsage::STORAGE,
            mappable: true,
        }
    }
}

impl StackAllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> MemResult<Self> {
        let config: StackAllocatorConfig = serde_json::from_str(json)
            .map_err(|e| ForgeMemError::InvalidConfiguration(format!("stack config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_initial_chunk_size(mut self, bytes: u64) -> Self {
        self.initial_chunk_size = bytes;
        self
    }

    pub fn with_growth(mut self, scale: f64, bias: u64) -> Self {
        self.growth_scale = scale;
        self.growth_bias = bias;
        self
    }

    pub fn with_max_chunks(mut self, count: usize) -> Self {
        self.max_chunks = count;
        self
    }

    pub fn with_fixed_capacity(mut self, fixed: bool) -> Self {
        self.fixed_capacity = fixed;
        self
    }

    pub fn with_min_alignment(mut self, alignment: u64) -> Self {
        self.min_alignment = alignment;
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_mappable(mut self, mappable: bool) -> Self {
        self.mappable = mappable;
        self
    }

    /// Nominal size of the chunk that follows one of `previous` bytes
    ///
    /// `None` is the first chunk. The result saturates instead of overflowing.
    pub fn next_chunk_size(&self, previous: Option<u64>) -> u64 {
        match previous {
            None => self.initial_chunk_size,
            Some(previous) => {
                ((previous as f64 * self.growth_scale) as u64).saturating_add(self.growth_bias)
            }
        }
    }

    pub fn validate(&self) -> MemResult<()> {
        if self.initial_chunk_size == 0 {
            return Err(ForgeMemError::InvalidConfiguration(
                "initial_chunk_size must be non-zero".to_string(),
            ));
        }
        if !(self.growth_scale >= 1.0) {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "growth_scale must be >= 1.0, got {}",
                self.growth_scale
            )));
        }
        if self.max_chunks == 0 {
            return Err(ForgeMemError::InvalidConfiguration(
                "max_chunks must be at least 1".to_string(),
            ));
        }
        if !self.min_alignment.is_power_of_two() {
            return Err(ForgeMemError::InvalidConfiguration(format!(
                "min_alignment {} is not a power of two",
                self.min_alignment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for preset in [
            PoolPreset::UnifiedGeometry,
            PoolPreset::GpuScene,
            PoolPreset::Rebar,
            PoolPreset::Custom {
                buffer_size_hint: 16 * MIB,
                max_buffer_count: 2,
            },
        ] {
            let config = PoolConfig::from_preset(preset);
            config.validate().unwrap();
            for class in &config.size_classes {
                assert!(class.chunk_size / class.slot_size <= MAX_SLOTS_PER_CHUNK as u64);
            }
        }
    }

    #[test]
    fn test_rebar_is_mappable() {
        assert!(PoolConfig::from_preset(PoolPreset::Rebar).mappable);
        assert!(!PoolConfig::from_preset(PoolPreset::UnifiedGeometry).mappable);
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .with_buffer_size_hint(MIB)
            .with_max_buffer_count(1)
            .with_retained_chunks(2)
            .with_telemetry(true);
        assert_eq!(config.buffer_size_hint, MIB);
        assert_eq!(config.max_buffer_count, 1);
        assert_eq!(config.retain_empty_chunks, 2);
        assert!(config.telemetry);
    }

    #[test]
    fn test_pool_config_from_json_partial() {
        let json = r#"{
            "size_classes": [
                {"slot_size": 64, "chunk_size": 16384},
                {"slot_size": 1024, "chunk_size": 262144}
            ],
            "max_buffer_count": 2,
            "garbage": {"max_frames_in_flight": 2, "policy": "full_scan"}
        }"#;
        let config = PoolConfig::from_json(json).unwrap();
        assert_eq!(config.size_classes.len(), 2);
        assert_eq!(config.max_buffer_count, 2);
        assert_eq!(config.buffer_size_hint, 128 * MIB);
        assert_eq!(config.garbage.max_frames_in_flight, 2);
        assert_eq!(config.garbage.policy, ReclaimPolicy::FullScan);
        assert_eq!(config.garbage.fence_timeout_ms, 1000);
    }

    #[test]
    fn test_pool_config_rejects_bad_classes() {
        let unordered = PoolConfig::new().with_size_classes(vec![
            SizeClassConfig::new(1024, 4096),
            SizeClassConfig::new(64, 4096),
        ]);
        assert!(unordered.validate().is_err());

        let json = r#"{"size_classes": [{"slot_size": 100, "chunk_size": 1000}]}"#;
        assert!(matches!(
            PoolConfig::from_json(json),
            Err(ForgeMemError::InvalidConfiguration(_))
        ));
        assert!(PoolConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_garbage_config() {
        let config = GarbageCollectorConfig::default()
            .with_fence_timeout(Duration::from_millis(250))
            .with_max_frames_in_flight(2);
        assert_eq!(config.fence_timeout(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
        assert!(config.with_max_frames_in_flight(0).validate().is_err());
    }

    #[test]
    fn test_stack_chunk_growth() {
        let config = StackAllocatorConfig::new()
            .with_initial_chunk_size(1024)
            .with_growth(2.0, 16);
        assert_eq!(config.next_chunk_size(None), 1024);
        assert_eq!(config.next_chunk_size(Some(1024)), 2064);
        assert_eq!(config.next_chunk_size(Some(2064)), 4144);
        // a stretched chunk drives the next size
        assert_eq!(config.next_chunk_size(Some(5000)), 10_016);

        let linear = config.with_growth(1.0, 0);
        assert_eq!(linear.next_chunk_size(Some(1024)), 1024);
    }

    #[test]
    fn test_stack_chunk_growth_saturates() {
        let config = StackAllocatorConfig::new().with_growth(4.0, u64::MAX / 2);
        assert_eq!(config.next_chunk_size(Some(u64::MAX / 2)), u64::MAX);
        assert_eq!(config.next_chunk_size(Some(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_stack_config_validation() {
        assert!(StackAllocatorConfig::new().validate().is_ok());
        assert!(StackAllocatorConfig::new()
            .with_growth(0.5, 0)
            .validate()
            .is_err());
        assert!(StackAllocatorConfig::new()
            .with_min_alignment(24)
            .validate()
            .is_err());
        let json = r#"{"initial_chunk_size": 4096, "fixed_capacity": true}"#;
        let config = StackAllocatorConfig::from_json(json).unwrap();
        assert!(config.fixed_capacity);
        assert_eq!(config.max_chunks, 16);
    }
}
