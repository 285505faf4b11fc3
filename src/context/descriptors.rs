//! Descriptor set caching and binding of [`ShaderParameter`] trees.
use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use super::{CommandContext, DescriptorSetCache};
use crate::{
    Result,
    pipeline::PipelineLayout,
    shader::{DescriptorResource, DescriptorWrite, ShaderParameter, collect_writes},
    tracking::Access,
    transient::TransientResourceCache,
    utils::AsVkHandle,
};

/// One descriptor set per set index of a [`PipelineLayout`].
///
/// Owned by the [`CommandContext`] that handed them out and reused once the recording
/// they were used in has completed.
#[derive(Clone)]
pub struct DescriptorSets {
    layout: Arc<PipelineLayout>,
    sets: SmallVec<[vk::DescriptorSet; 4]>,
}

impl DescriptorSets {
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn raw(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl std::fmt::Debug for DescriptorSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSets")
            .field("layout", &self.layout.vk_handle())
            .field("sets", &self.sets)
            .finish()
    }
}

/// Push constant ranges produced by [`CommandContext::update_descriptor_sets`].
pub type PushConstantRanges = Vec<(u32, Vec<u8>)>;

#[derive(Clone, Copy, Debug)]
enum WriteInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    TexelBuffer(vk::BufferView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

#[derive(Clone, Copy, Debug)]
struct PendingWrite {
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    ty: vk::DescriptorType,
    info: WriteInfo,
}

/// Builds the raw writes of `writes`. `acceleration_structures` holds one entry per
/// acceleration structure write, in order.
fn raw_writes<'a>(
    writes: &'a [PendingWrite],
    acceleration_structures: &'a mut [vk::WriteDescriptorSetAccelerationStructureKHR<'a>],
) -> Vec<vk::WriteDescriptorSet<'a>> {
    let mut acceleration_structures = acceleration_structures.iter_mut();
    writes
        .iter()
        .map(|w| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(w.set)
                .dst_binding(w.binding)
                .dst_array_element(w.array_element)
                .descriptor_type(w.ty);
            match &w.info {
                WriteInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                WriteInfo::Image(info) => write.image_info(std::slice::from_ref(info)),
                WriteInfo::TexelBuffer(view) => {
                    write.texel_buffer_view(std::slice::from_ref(view))
                }
                WriteInfo::AccelerationStructure(_) => match acceleration_structures.next() {
                    Some(next) => write.push_next(next).descriptor_count(1),
                    None => write,
                },
            }
        })
        .collect()
}

fn acceleration_structure_handles(writes: &[PendingWrite]) -> Vec<vk::AccelerationStructureKHR> {
    writes
        .iter()
        .filter_map(|w| match w.info {
            WriteInfo::AccelerationStructure(handle) => Some(handle),
            _ => None,
        })
        .collect()
}

impl CommandContext {
    /// Descriptor sets for `layout`, reused from an earlier recording when possible.
    ///
    /// The sets are handed back to the cache at the next [`begin`](Self::begin).
    pub fn get_descriptor_sets(&mut self, layout: &Arc<PipelineLayout>) -> Result<DescriptorSets> {
        let completed = self.last_submit;
        let cache = self
            .descriptor_sets
            .entry(layout.vk_handle())
            .or_insert_with(|| DescriptorSetCache {
                layout: layout.clone(),
                ready: TransientResourceCache::new(),
                in_use: Vec::new(),
            });
        let allocator = &mut self.descriptor_allocator;
        let sets = cache.ready.pop_or_create(completed, || {
            allocator
                .allocate(layout.raw_set_layouts())
                .map(SmallVec::from_vec)
        })?;
        cache.in_use.push(sets.clone());
        Ok(DescriptorSets {
            layout: cache.layout.clone(),
            sets,
        })
    }

    /// Writes every parameter of `params` that resolves to a descriptor or uniform block
    /// of `sets`, recording the uploads and barriers this needs.
    ///
    /// Values bound to push constants are returned for [`push_constants`](Self::push_constants).
    /// Parameters that do not match the layout are logged and skipped.
    pub fn update_descriptor_sets(
        &mut self,
        sets: &DescriptorSets,
        params: &ShaderParameter,
    ) -> Result<PushConstantRanges> {
        let layout = sets.layout().clone();
        let writes = collect_writes(params, layout.parameters());
        if writes.dropped > 0 {
            tracing::debug!(dropped = writes.dropped, "skipped shader parameters");
        }

        let mut pending = Vec::with_capacity(writes.descriptors.len() + writes.uniform_data.len());
        for ((set, binding, array_element), data) in writes.uniform_data {
            let write = DescriptorWrite {
                set,
                binding,
                array_element,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                writable: false,
                resource: DescriptorResource::Data(data),
            };
            pending.extend(self.resolve_write(sets, &layout, write)?);
        }
        for write in writes.descriptors {
            pending.extend(self.resolve_write(sets, &layout, write)?);
        }
        self.write_descriptors(&pending);
        Ok(writes.push_constants)
    }

    /// Records the barrier for the resource of `write` and turns it into a raw write.
    fn resolve_write(
        &mut self,
        sets: &DescriptorSets,
        layout: &PipelineLayout,
        write: DescriptorWrite,
    ) -> Result<Option<PendingWrite>> {
        let Some(&set) = sets.raw().get(write.set as usize) else {
            tracing::warn!(set = write.set, "descriptor set index outside the layout");
            return Ok(None);
        };
        let access = Access::shader(layout.pipeline_stages(), write.ty, write.writable);
        let resource = match write.resource {
            DescriptorResource::Data(data) => {
                let usage = match write.ty {
                    vk::DescriptorType::UNIFORM_BUFFER => vk::BufferUsageFlags::UNIFORM_BUFFER,
                    _ => vk::BufferUsageFlags::STORAGE_BUFFER,
                };
                DescriptorResource::Buffer(self.upload_data(&data, usage)?)
            }
            resource => resource,
        };
        self.add_descriptor_barrier(&resource, access);
        let info = match resource {
            DescriptorResource::Buffer(view) => WriteInfo::Buffer(view.descriptor_info()),
            DescriptorResource::TexelBuffer(texel) => WriteInfo::TexelBuffer(texel.vk_handle()),
            DescriptorResource::Image {
                view,
                layout: image_layout,
                sampler,
            } => WriteInfo::Image(vk::DescriptorImageInfo {
                sampler: sampler.map_or(vk::Sampler::null(), |s| s.vk_handle()),
                image_view: view.vk_handle(),
                image_layout,
            }),
            DescriptorResource::Sampler(sampler) => WriteInfo::Image(vk::DescriptorImageInfo {
                sampler: sampler.vk_handle(),
                ..Default::default()
            }),
            DescriptorResource::AccelerationStructure { handle, .. } => {
                WriteInfo::AccelerationStructure(handle)
            }
            // Replaced by its upload above.
            DescriptorResource::Data(_) => return Ok(None),
        };
        Ok(Some(PendingWrite {
            set,
            binding: write.binding,
            array_element: write.array_element,
            ty: write.ty,
            info,
        }))
    }

    /// Queues the barrier needed before a shader accesses `resource` with `access`.
    ///
    /// Acceleration structures are tracked on the buffer range they are stored in.
    /// Samplers and inline data need none.
    pub fn add_descriptor_barrier(&mut self, resource: &DescriptorResource, access: Access) {
        match resource {
            DescriptorResource::Buffer(view) => self.add_buffer_barrier(view, access),
            DescriptorResource::TexelBuffer(texel) => self.add_buffer_barrier(texel.view(), access),
            DescriptorResource::Image { view, layout, .. } => {
                self.add_image_barrier(view, access, *layout)
            }
            DescriptorResource::AccelerationStructure { storage, .. } => {
                self.add_buffer_barrier(storage, access)
            }
            DescriptorResource::Sampler(_) | DescriptorResource::Data(_) => {}
        }
    }

    fn write_descriptors(&self, writes: &[PendingWrite]) {
        if writes.is_empty() {
            return;
        }
        let handles = acceleration_structure_handles(writes);
        let mut acceleration_structures: Vec<_> = handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect();
        let raw = raw_writes(writes, &mut acceleration_structures);
        unsafe { self.device.update_descriptor_sets(&raw, &[]) };
    }

    /// Binds `sets` at set index 0 for the bind point of their layout.
    pub fn bind_descriptors(&mut self, sets: &DescriptorSets) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cb,
                sets.layout().bind_point(),
                sets.layout().vk_handle(),
                0,
                sets.raw(),
                &[],
            );
        }
        Ok(())
    }

    /// Records one push constant command per range.
    pub fn push_constants(
        &mut self,
        layout: &PipelineLayout,
        ranges: &[(u32, Vec<u8>)],
    ) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let Some(range) = layout.push_constant_range() else {
            tracing::warn!("pipeline layout has no push constants");
            return Ok(());
        };
        let cb = self.command_buffer()?;
        for (offset, bytes) in ranges {
            if !push_range_fits(&range, *offset, bytes.len()) {
                tracing::warn!(
                    offset,
                    size = bytes.len(),
                    range = range.size,
                    "push constant outside the pipeline layout's range"
                );
                continue;
            }
            unsafe {
                self.device.cmd_push_constants(
                    cb,
                    layout.vk_handle(),
                    range.stage_flags,
                    *offset,
                    bytes,
                );
            }
        }
        Ok(())
    }

    /// Allocates descriptor sets for `layout`, writes `params` into them and binds them,
    /// together with any push constants.
    pub fn bind_parameters(
        &mut self,
        layout: &Arc<PipelineLayout>,
        params: &ShaderParameter,
    ) -> Result<DescriptorSets> {
        let sets = self.get_descriptor_sets(layout)?;
        let push_constants = self.update_descriptor_sets(&sets, params)?;
        self.bind_descriptors(&sets)?;
        self.push_constants(layout, &push_constants)?;
        Ok(sets)
    }
}

/// Returns true if `len` bytes at `offset` lie within `range`.
fn push_range_fits(range: &vk::PushConstantRange, offset: u32, len: usize) -> bool {
    let end = (offset as u64).saturating_add(len as u64);
    offset >= range.offset && end <= range.offset as u64 + range.size as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image_write(set: vk::DescriptorSet, array_element: u32) -> PendingWrite {
        PendingWrite {
            set,
            binding: 2,
            array_element,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: WriteInfo::Image(vk::DescriptorImageInfo {
                sampler: vk::Sampler::from_raw(7),
                image_view: vk::ImageView::from_raw(100 + array_element as u64),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }),
        }
    }

    #[test]
    fn test_push_range_fits() {
        let range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 16,
            size: 32,
        };
        assert!(push_range_fits(&range, 16, 32));
        assert!(push_range_fits(&range, 40, 8));
        assert!(!push_range_fits(&range, 44, 8));
        assert!(!push_range_fits(&range, 8, 4));
        assert!(!push_range_fits(&range, u32::MAX, usize::MAX));
    }

    #[test]
    fn test_image_array_writes_one_element_each() {
        let set = vk::DescriptorSet::from_raw(1);
        let writes: Vec<_> = (0..3).map(|i| image_write(set, i)).collect();
        let mut none: [vk::WriteDescriptorSetAccelerationStructureKHR; 0] = [];
        let raw = raw_writes(&writes, &mut none);
        assert_eq!(raw.len(), 3);
        for (i, write) in raw.iter().enumerate() {
            assert_eq!(write.dst_set, set);
            assert_eq!(write.dst_binding, 2);
            assert_eq!(write.dst_array_element, i as u32);
            assert_eq!(write.descriptor_count, 1);
            let info = unsafe { &*write.p_image_info };
            assert_eq!(info.image_view, vk::ImageView::from_raw(100 + i as u64));
        }
    }

    #[test]
    fn test_acceleration_structure_write_chains_info() {
        let writes = [PendingWrite {
            set: vk::DescriptorSet::from_raw(1),
            binding: 0,
            array_element: 0,
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            info: WriteInfo::AccelerationStructure(vk::AccelerationStructureKHR::from_raw(9)),
        }];
        let handles = acceleration_structure_handles(&writes);
        assert_eq!(handles, [vk::AccelerationStructureKHR::from_raw(9)]);
        let mut chained: Vec<_> = handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect();
        let raw = raw_writes(&writes, &mut chained);
        assert_eq!(raw[0].descriptor_count, 1);
        assert!(!raw[0].p_next.is_null());
    }
}
