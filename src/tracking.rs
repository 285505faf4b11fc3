//! Resource state tracking and pipeline barrier generation.
//!
//! Every buffer range and every image subresource remembers the last operation recorded
//! against it as a [`ResourceState`]: pipeline stage, access mask, image layout and owning
//! queue family. Recording a new use of the resource replaces that state and yields the
//! barrier that orders the previous use before the new one, if one is needed at all.
//!
//! ```
//! use tephra::tracking::{Access, BufferStateTable, ResourceState};
//!
//! let mut table = BufferStateTable::default();
//! // First use of a fresh buffer needs no synchronization.
//! assert!(table.set_state(ResourceState::new(Access::COPY_WRITE), 0, 256).is_none());
//! // Reading what the copy wrote does.
//! let barrier = table.set_state(ResourceState::new(Access::COMPUTE_READ), 0, 256).unwrap();
//! assert_eq!(barrier.src.access, Access::COPY_WRITE.access);
//! ```
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::Debug,
    ops::{BitOr, BitOrAssign},
};

use ash::vk;
use smallvec::SmallVec;

/// A pipeline stage together with the memory accesses performed at that stage.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Hash)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const HOST_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::HOST,
        access: vk::AccessFlags2::HOST_WRITE,
    };
    pub const HOST_READ: Access = Access {
        stage: vk::PipelineStageFlags2::HOST,
        access: vk::AccessFlags2::HOST_READ,
    };
    pub const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_INPUT,
        access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    };
    pub const INDEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::INDEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const BLIT_DST: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const BLIT_SRC: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const CLEAR: Access = Access {
        stage: vk::PipelineStageFlags2::CLEAR,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const FRAGMENT_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const COMPUTE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_WRITE,
    };
    pub const COMPUTE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    /// Shader access at `stage` for a descriptor of type `ty`.
    pub fn shader(
        stage: vk::PipelineStageFlags2,
        ty: vk::DescriptorType,
        writable: bool,
    ) -> Access {
        let access = match ty {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::INLINE_UNIFORM_BLOCK => vk::AccessFlags2::UNIFORM_READ,
            vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::UNIFORM_TEXEL_BUFFER => vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::DescriptorType::INPUT_ATTACHMENT => vk::AccessFlags2::INPUT_ATTACHMENT_READ,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
            }
            _ if writable => {
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
            }
            _ => vk::AccessFlags2::SHADER_STORAGE_READ,
        };
        Access { stage, access }
    }

    /// Every access bit that modifies memory.
    const WRITES: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    );

    pub fn is_writeonly(&self) -> bool {
        !self.access.is_empty() && Self::WRITES.contains(self.access)
    }

    pub fn is_readonly(&self) -> bool {
        !self.access.is_empty() && !self.access.intersects(Self::WRITES)
    }
}

/// The last recorded use of a buffer range or image subresource.
///
/// A state always describes the most recently *recorded* operation in program order,
/// not the most recently executed one. It is updated as soon as the barrier for a new
/// use is computed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// Image layout. Buffers leave this at `UNDEFINED`.
    pub layout: vk::ImageLayout,
    pub queue_family: u32,
}
impl Default for ResourceState {
    fn default() -> Self {
        Self {
            stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}
impl Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ResourceState");
        debug.field("stage", &self.stage);
        debug.field("access", &self.access);
        if self.layout != vk::ImageLayout::UNDEFINED {
            debug.field("layout", &self.layout);
        }
        if self.queue_family != vk::QUEUE_FAMILY_IGNORED {
            debug.field("queue_family", &self.queue_family);
        }
        debug.finish()
    }
}

impl ResourceState {
    pub fn new(access: Access) -> Self {
        Self {
            stage: access.stage,
            access: access.access,
            ..Default::default()
        }
    }
    pub fn new_with_image_layout(access: Access, layout: vk::ImageLayout) -> Self {
        Self {
            stage: access.stage,
            access: access.access,
            layout,
            ..Default::default()
        }
    }
    pub fn with_queue_family(mut self, queue_family: u32) -> Self {
        self.queue_family = queue_family;
        self
    }
    pub fn access(&self) -> Access {
        Access {
            stage: self.stage,
            access: self.access,
        }
    }

    fn owner_changes(&self, next: &ResourceState) -> bool {
        self.queue_family != vk::QUEUE_FAMILY_IGNORED
            && next.queue_family != vk::QUEUE_FAMILY_IGNORED
            && self.queue_family != next.queue_family
    }

    /// Returns true if moving from `self` to `next` needs a pipeline barrier.
    ///
    /// Layout transitions and queue family ownership transfers always need one. Otherwise
    /// a barrier is skipped if either side performs no access, or if both sides only read
    /// and the new read happens no earlier in the pipeline than the previous one.
    pub fn needs_barrier(&self, next: &ResourceState) -> bool {
        if self.layout != next.layout || self.owner_changes(next) {
            return true;
        }
        if self.access == vk::AccessFlags2::NONE || next.access == vk::AccessFlags2::NONE {
            return false;
        }
        if self.access().is_readonly() && next.access().is_readonly() {
            return !matches!(
                compare_pipeline_stages(self.stage, next.stage),
                Some(ordering) if ordering.is_le()
            );
        }
        true
    }
}

/// Source and destination queue family indices for a barrier.
fn queue_families(src: &ResourceState, dst: &ResourceState) -> (u32, u32) {
    if src.owner_changes(dst) {
        (src.queue_family, dst.queue_family)
    } else {
        (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
    }
}

/// A barrier over a byte range of one buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BufferBarrier {
    pub src: ResourceState,
    pub dst: ResourceState,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}
impl BufferBarrier {
    pub fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        let (src_queue, dst_queue) = queue_families(&self.src, &self.dst);
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .src_queue_family_index(src_queue)
            .dst_queue_family_index(dst_queue)
            .buffer(buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// A barrier over a subresource range of one image.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub src: ResourceState,
    pub dst: ResourceState,
    pub range: vk::ImageSubresourceRange,
}
impl ImageBarrier {
    pub fn to_vk(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        let (src_queue, dst_queue) = queue_families(&self.src, &self.dst);
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .old_layout(self.src.layout)
            .new_layout(self.dst.layout)
            .src_queue_family_index(src_queue)
            .dst_queue_family_index(dst_queue)
            .image(image)
            .subresource_range(self.range)
    }
}

/// Per-range states of a buffer.
///
/// Ranges are exact `(offset, size)` keys. Views over the same bytes must use the same
/// range to observe each other's state.
#[derive(Debug, Default, Clone)]
pub struct BufferStateTable {
    states: BTreeMap<(vk::DeviceSize, vk::DeviceSize), ResourceState>,
}

impl BufferStateTable {
    pub fn get_state(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> ResourceState {
        self.states
            .get(&(offset, size))
            .copied()
            .unwrap_or_default()
    }

    /// Records `state` as the latest use of the range and returns the barrier from the
    /// previous use, if one is needed.
    pub fn set_state(
        &mut self,
        state: ResourceState,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Option<BufferBarrier> {
        let old = self
            .states
            .insert((offset, size), state)
            .unwrap_or_default();
        old.needs_barrier(&state).then_some(BufferBarrier {
            src: old,
            dst: state,
            offset,
            size,
        })
    }

    /// Forgets every recorded state.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// Per-subresource states of an image, stored layer-major.
#[derive(Debug, Clone)]
pub struct ImageStateTable {
    mip_levels: u32,
    array_layers: u32,
    states: Vec<ResourceState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct MipRun {
    base_mip_level: u32,
    level_count: u32,
    src: ResourceState,
}

impl ImageStateTable {
    pub fn new(mip_levels: u32, array_layers: u32) -> Self {
        Self {
            mip_levels,
            array_layers,
            states: vec![ResourceState::default(); (mip_levels * array_layers) as usize],
        }
    }
    /// Starts every subresource from `state` instead of the default.
    pub fn new_with_state(mip_levels: u32, array_layers: u32, state: ResourceState) -> Self {
        Self {
            mip_levels,
            array_layers,
            states: vec![state; (mip_levels * array_layers) as usize],
        }
    }
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    fn index(&self, layer: u32, mip: u32) -> usize {
        (layer * self.mip_levels + mip) as usize
    }

    /// State of one subresource, or `None` if it is outside the image.
    pub fn get_state(&self, layer: u32, mip: u32) -> Option<ResourceState> {
        (layer < self.array_layers && mip < self.mip_levels)
            .then(|| self.states[self.index(layer, mip)])
    }

    /// Resolves `REMAINING_*` counts and clamps the range to the image.
    pub fn resolve_range(&self, range: &vk::ImageSubresourceRange) -> vk::ImageSubresourceRange {
        let base_mip = range.base_mip_level.min(self.mip_levels);
        let base_layer = range.base_array_layer.min(self.array_layers);
        let level_count = if range.level_count == vk::REMAINING_MIP_LEVELS {
            self.mip_levels - base_mip
        } else {
            range.level_count.min(self.mip_levels - base_mip)
        };
        let layer_count = if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
            self.array_layers - base_layer
        } else {
            range.layer_count.min(self.array_layers - base_layer)
        };
        vk::ImageSubresourceRange {
            aspect_mask: range.aspect_mask,
            base_mip_level: base_mip,
            level_count,
            base_array_layer: base_layer,
            layer_count,
        }
    }

    /// Records `state` for every subresource in `range` and returns the barriers needed.
    ///
    /// Contiguous mips of one layer that share a previous state become a single barrier,
    /// and consecutive layers with identical mip runs are merged into one layer range.
    /// Barriers are returned in layer-major order.
    pub fn set_state(
        &mut self,
        state: ResourceState,
        range: &vk::ImageSubresourceRange,
    ) -> SmallVec<[ImageBarrier; 2]> {
        let range = self.resolve_range(range);
        // (base layer, layer count, mip runs of the base layer)
        let mut groups: SmallVec<[(u32, u32, SmallVec<[MipRun; 2]>); 2]> = SmallVec::new();
        for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
            let mut runs: SmallVec<[MipRun; 2]> = SmallVec::new();
            for mip in range.base_mip_level..range.base_mip_level + range.level_count {
                let index = self.index(layer, mip);
                let old = std::mem::replace(&mut self.states[index], state);
                if !old.needs_barrier(&state) {
                    continue;
                }
                match runs.last_mut() {
                    Some(run) if run.src == old && run.base_mip_level + run.level_count == mip => {
                        run.level_count += 1;
                    }
                    _ => runs.push(MipRun {
                        base_mip_level: mip,
                        level_count: 1,
                        src: old,
                    }),
                }
            }
            if runs.is_empty() {
                continue;
            }
            match groups.last_mut() {
                Some((base_layer, layer_count, prev))
                    if *base_layer + *layer_count == layer && *prev == runs =>
                {
                    *layer_count += 1;
                }
                _ => groups.push((layer, 1, runs)),
            }
        }

        groups
            .into_iter()
            .flat_map(|(base_array_layer, layer_count, runs)| {
                runs.into_iter().map(move |run| ImageBarrier {
                    src: run.src,
                    dst: state,
                    range: vk::ImageSubresourceRange {
                        aspect_mask: range.aspect_mask,
                        base_mip_level: run.base_mip_level,
                        level_count: run.level_count,
                        base_array_layer,
                        layer_count,
                    },
                })
            })
            .collect()
    }

    /// Forgets every recorded state, returning all subresources to the default.
    pub fn clear(&mut self) {
        self.states.fill(ResourceState::default());
    }
}

/// Pipelines a stage can appear in, as bits of a mask.
const VERTEX_PIPELINE: u8 = 1 << 0;
const MESH_PIPELINE: u8 = 1 << 1;
const COMPUTE_PIPELINE: u8 = 1 << 2;
const RAY_TRACING_PIPELINE: u8 = 1 << 3;
const RASTER_PIPELINES: u8 = VERTEX_PIPELINE | MESH_PIPELINE;

/// Rank of a single stage bit within the pipelines it belongs to.
fn stage_rank(stage: vk::PipelineStageFlags2) -> Option<(u8, u8)> {
    use vk::PipelineStageFlags2 as S;
    let rank = match stage {
        S::DRAW_INDIRECT => (0, RASTER_PIPELINES | COMPUTE_PIPELINE | RAY_TRACING_PIPELINE),
        S::INDEX_INPUT => (1, VERTEX_PIPELINE),
        S::VERTEX_ATTRIBUTE_INPUT => (2, VERTEX_PIPELINE),
        S::VERTEX_SHADER => (3, VERTEX_PIPELINE),
        S::TESSELLATION_CONTROL_SHADER => (4, VERTEX_PIPELINE),
        S::TESSELLATION_EVALUATION_SHADER => (5, VERTEX_PIPELINE),
        S::GEOMETRY_SHADER => (6, VERTEX_PIPELINE),
        S::TRANSFORM_FEEDBACK_EXT => (7, VERTEX_PIPELINE),
        S::TASK_SHADER_EXT => (1, MESH_PIPELINE),
        S::MESH_SHADER_EXT => (2, MESH_PIPELINE),
        S::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR => (8, RASTER_PIPELINES),
        S::EARLY_FRAGMENT_TESTS => (9, RASTER_PIPELINES),
        S::FRAGMENT_SHADER => (10, RASTER_PIPELINES),
        S::LATE_FRAGMENT_TESTS => (11, RASTER_PIPELINES),
        S::COLOR_ATTACHMENT_OUTPUT => (12, RASTER_PIPELINES),
        S::COMPUTE_SHADER => (1, COMPUTE_PIPELINE),
        S::RAY_TRACING_SHADER_KHR => (1, RAY_TRACING_PIPELINE),
        _ => return None,
    };
    Some(rank)
}

/// Earliest rank among the bits of `stages` that belong to `pipeline`.
fn earliest_in(stages: vk::PipelineStageFlags2, pipeline: u8) -> Option<u8> {
    (0..u64::BITS)
        .map(|bit| vk::PipelineStageFlags2::from_raw(1u64 << bit))
        .filter(|&bit| stages.contains(bit))
        .filter_map(stage_rank)
        .filter(|&(_, pipelines)| pipelines & pipeline != 0)
        .map(|(rank, _)| rank)
        .min()
}

/// Orders the earliest stages of `a` and `b` along the first pipeline both appear in.
///
/// Returns `None` when no pipeline contains a stage of each, as with transfer stages or
/// compute against fragment work.
pub fn compare_pipeline_stages(
    a: vk::PipelineStageFlags2,
    b: vk::PipelineStageFlags2,
) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    [
        VERTEX_PIPELINE,
        MESH_PIPELINE,
        COMPUTE_PIPELINE,
        RAY_TRACING_PIPELINE,
    ]
    .into_iter()
    .find_map(|pipeline| Some(earliest_in(a, pipeline)?.cmp(&earliest_in(b, pipeline)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    fn subresource(layer: u32, mip: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: layer,
            layer_count: 1,
        }
    }

    #[test]
    fn test_stage_order() {
        use vk::PipelineStageFlags2 as S;
        assert_eq!(
            compare_pipeline_stages(S::VERTEX_SHADER, S::FRAGMENT_SHADER),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_pipeline_stages(S::MESH_SHADER_EXT, S::TASK_SHADER_EXT),
            Some(Ordering::Greater)
        );
        // Indirect reads precede every shader stage.
        assert_eq!(
            compare_pipeline_stages(S::DRAW_INDIRECT, S::COMPUTE_SHADER),
            Some(Ordering::Less)
        );
        // The earliest stage of a combined mask decides.
        assert_eq!(
            compare_pipeline_stages(S::VERTEX_SHADER | S::FRAGMENT_SHADER, S::GEOMETRY_SHADER),
            Some(Ordering::Less)
        );
        assert_eq!(compare_pipeline_stages(S::COMPUTE_SHADER, S::FRAGMENT_SHADER), None);
        assert_eq!(compare_pipeline_stages(S::COPY, S::COMPUTE_SHADER), None);
    }

    #[test]
    fn test_read_write_classification() {
        assert!(Access::COMPUTE_READ.is_readonly());
        assert!(!Access::COMPUTE_READ.is_writeonly());
        assert!(Access::COPY_WRITE.is_writeonly());
        assert!(!Access::ALL_COMMANDS.is_readonly());
        assert!(!Access::ALL_COMMANDS.is_writeonly());
        assert!(!Access::NONE.is_readonly());
        let storage = Access::shader(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::DescriptorType::STORAGE_BUFFER,
            true,
        );
        assert!(!storage.is_readonly());
    }

    #[test]
    fn test_default_state() {
        let table = BufferStateTable::default();
        let state = table.get_state(0, 64);
        assert_eq!(state.stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(state.access, vk::AccessFlags2::NONE);
        assert_eq!(state.queue_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(state.layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_buffer_barrier_carries_old_and_new() {
        let mut table = BufferStateTable::default();
        let write = ResourceState::new(Access::COMPUTE_WRITE);
        let read = ResourceState::new(Access::COPY_READ);
        assert!(table.set_state(write, 0, 64).is_none());
        let barrier = table.set_state(read, 0, 64).unwrap();
        assert_eq!(barrier.src, write);
        assert_eq!(barrier.dst, read);
        assert_eq!((barrier.offset, barrier.size), (0, 64));
        assert_eq!(table.get_state(0, 64), read);
    }

    #[test]
    fn test_buffer_ranges_are_independent() {
        let mut table = BufferStateTable::default();
        table.set_state(ResourceState::new(Access::COPY_WRITE), 0, 64);
        assert_eq!(table.get_state(64, 64), ResourceState::default());
        assert!(
            table
                .set_state(ResourceState::new(Access::COMPUTE_READ), 64, 64)
                .is_none()
        );
    }

    #[test]
    fn test_no_access_elides() {
        let mut table = BufferStateTable::default();
        assert!(table.set_state(ResourceState::default(), 0, 16).is_none());
        table.set_state(ResourceState::new(Access::COPY_WRITE), 0, 16);
        assert!(table.set_state(ResourceState::default(), 0, 16).is_none());
    }

    #[test]
    fn test_read_after_read() {
        let mut table = BufferStateTable::default();
        table.set_state(ResourceState::new(Access::COPY_WRITE), 0, 16);
        let vertex_read = ResourceState::new(Access {
            stage: vk::PipelineStageFlags2::VERTEX_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_READ,
        });
        let fragment_read = ResourceState::new(Access {
            stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_READ,
        });
        assert!(table.set_state(vertex_read, 0, 16).is_some());
        // Same read again.
        assert!(table.set_state(vertex_read, 0, 16).is_none());
        // Later read stage.
        assert!(table.set_state(fragment_read, 0, 16).is_none());
        // Earlier read stage needs ordering against the fragment read.
        assert!(table.set_state(vertex_read, 0, 16).is_some());
    }

    #[test]
    fn test_write_after_write() {
        let mut table = BufferStateTable::default();
        let write = ResourceState::new(Access::COMPUTE_WRITE);
        table.set_state(write, 0, 16);
        assert!(table.set_state(write, 0, 16).is_some());
    }

    #[test]
    fn test_queue_family_transfer() {
        let mut table = BufferStateTable::default();
        table.set_state(ResourceState::new(Access::COPY_READ).with_queue_family(1), 0, 16);
        let barrier = table
            .set_state(
                ResourceState::new(Access::COPY_READ).with_queue_family(0),
                0,
                16,
            )
            .unwrap();
        let vk_barrier = barrier.to_vk(vk::Buffer::null());
        assert_eq!(vk_barrier.src_queue_family_index, 1);
        assert_eq!(vk_barrier.dst_queue_family_index, 0);
    }

    #[test]
    fn test_image_layout_transition_from_undefined() {
        let mut table = ImageStateTable::new(1, 1);
        let dst = ResourceState::new_with_image_layout(
            Access::COPY_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let barriers = table.set_state(dst, &full_range());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].src, ResourceState::default());
        assert_eq!(barriers[0].dst, dst);
        // Setting the same read-free state again only orders the writes.
        let barriers = table.set_state(dst, &full_range());
        assert_eq!(barriers.len(), 1);
    }

    #[test]
    fn test_image_subresource_independence() {
        let mut table = ImageStateTable::new(2, 2);
        let dst = ResourceState::new_with_image_layout(
            Access::COPY_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        table.set_state(dst, &subresource(0, 0));
        assert_eq!(table.get_state(0, 0), Some(dst));
        assert_eq!(table.get_state(0, 1), Some(ResourceState::default()));
        assert_eq!(table.get_state(1, 0), Some(ResourceState::default()));
        assert_eq!(table.get_state(1, 1), Some(ResourceState::default()));
    }

    #[test]
    fn test_image_state_outside_image() {
        let table = ImageStateTable::new(2, 3);
        assert!(table.get_state(2, 1).is_some());
        assert_eq!(table.get_state(3, 0), None);
        assert_eq!(table.get_state(0, 2), None);
    }

    #[test]
    fn test_image_mip_coalescing() {
        let mut table = ImageStateTable::new(4, 1);
        let sampled = ResourceState::new_with_image_layout(
            Access::FRAGMENT_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let barriers = table.set_state(sampled, &full_range());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range.base_mip_level, 0);
        assert_eq!(barriers[0].range.level_count, 4);
    }

    #[test]
    fn test_image_coalescing_respects_source_state() {
        let mut table = ImageStateTable::new(4, 1);
        let transfer = ResourceState::new_with_image_layout(
            Access::COPY_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        table.set_state(transfer, &subresource(0, 2));
        let sampled = ResourceState::new_with_image_layout(
            Access::FRAGMENT_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let barriers = table.set_state(sampled, &full_range());
        let runs: Vec<_> = barriers
            .iter()
            .map(|b| (b.range.base_mip_level, b.range.level_count, b.src.layout))
            .collect();
        assert_eq!(
            runs,
            vec![
                (0, 2, vk::ImageLayout::UNDEFINED),
                (2, 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (3, 1, vk::ImageLayout::UNDEFINED),
            ]
        );
    }

    #[test]
    fn test_image_layer_merging() {
        let mut table = ImageStateTable::new(3, 4);
        let storage = ResourceState::new_with_image_layout(
            Access::COMPUTE_WRITE,
            vk::ImageLayout::GENERAL,
        );
        let barriers = table.set_state(storage, &full_range());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range.layer_count, 4);
        assert_eq!(barriers[0].range.level_count, 3);

        // Diverge layer 2, then the next transition splits around it in layer order.
        let copy = ResourceState::new_with_image_layout(
            Access::COPY_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        table.set_state(copy, &subresource(2, 0));
        let barriers = table.set_state(storage, &full_range());
        let layers: Vec<_> = barriers
            .iter()
            .map(|b| {
                (
                    b.range.base_array_layer,
                    b.range.layer_count,
                    b.range.base_mip_level,
                    b.range.level_count,
                )
            })
            .collect();
        assert_eq!(layers, vec![(0, 2, 0, 3), (2, 1, 0, 1), (2, 1, 1, 2), (3, 1, 0, 3)]);
    }
}
