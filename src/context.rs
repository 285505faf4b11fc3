//! Recording of GPU work with automatic barriers, transient resources and parameter binding.
//!
//! A [`CommandContext`] owns one command pool and one primary command buffer. It is
//! single-buffered: [`CommandContext::begin`] blocks until the previous submission of the
//! same context has completed, which makes every resource cached by the context safe to
//! reuse from that point on.
//!
//! ```no_run
//! # use tephra::{Allocator, Device, context::*, ash::vk};
//! let device = Device::create_system_default().unwrap();
//! let allocator = Allocator::new(device.clone()).unwrap();
//! let mut ctx = CommandContext::new(device, allocator, 0, ContextConfig::default());
//! ctx.begin().unwrap();
//! let data = ctx.upload_data(bytemuck::cast_slice(&[1.0f32, 2.0]), vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
//! let value = ctx.submit(0, &[], &[]).unwrap();
//! # let _ = (data, value);
//! ```
mod compute;
mod descriptors;
mod transfer;

use std::{collections::HashMap, ffi::CString, sync::Arc};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Allocator, Device, Error, HasDevice, Result,
    buffer::{Buffer, BufferView},
    command::{CommandBuffer, CommandBufferState, CommandPool},
    descriptor::{DescriptorAllocator, DescriptorPoolConfig},
    image::{Image, ImageInfo, ImageView},
    pipeline::PipelineLayout,
    sync::{SemaphoreSignal, SemaphoreWait},
    tracking::{Access, ResourceState},
    transient::TransientResourceCache,
    utils::AsVkHandle,
};

pub use descriptors::DescriptorSets;

/// Tunables of a [`CommandContext`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ContextConfig {
    /// Maximum number of sets per descriptor pool.
    pub descriptor_pool_max_sets: u32,
    /// Descriptors of each type per descriptor pool.
    pub descriptors_per_type: u32,
    /// Transient buffers are never created smaller than this.
    pub min_transient_buffer_size: vk::DeviceSize,
    /// Debug name of the command pool and command buffer.
    pub name: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let pool = DescriptorPoolConfig::default();
        Self {
            descriptor_pool_max_sets: pool.max_sets,
            descriptors_per_type: pool.descriptors_per_type,
            min_transient_buffer_size: 256,
            name: None,
        }
    }
}

impl ContextConfig {
    pub fn descriptor_pool_config(&self) -> DescriptorPoolConfig {
        DescriptorPoolConfig {
            max_sets: self.descriptor_pool_max_sets,
            descriptors_per_type: self.descriptors_per_type,
        }
    }
}

/// Memory a transient buffer lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TransientMemory {
    Device,
    Host,
}

/// Transient buffers of one `(usage, memory)` kind.
///
/// `available` is sorted by size so the smallest buffer that fits can be found by binary
/// search. `in_use` holds buffers handed out during the current recording.
#[derive(Default)]
struct TransientBufferPool {
    available: Vec<Arc<Buffer>>,
    in_use: Vec<Arc<Buffer>>,
}

impl TransientBufferPool {
    fn recycle(&mut self) {
        self.available.append(&mut self.in_use);
        self.available.sort_by_key(|buffer| buffer.size());
    }

    fn take_best_fit(&mut self, size: vk::DeviceSize) -> Option<Arc<Buffer>> {
        let index = self.available.partition_point(|buffer| buffer.size() < size);
        (index < self.available.len()).then(|| self.available.remove(index))
    }
}

/// Cached descriptor sets of one pipeline layout.
struct DescriptorSetCache {
    layout: Arc<PipelineLayout>,
    ready: TransientResourceCache<SmallVec<[vk::DescriptorSet; 4]>>,
    in_use: Vec<SmallVec<[vk::DescriptorSet; 4]>>,
}

#[derive(Default)]
struct TransientImageCache {
    ready: TransientResourceCache<Arc<Image>>,
    in_use: Vec<Arc<Image>>,
}

/// Records commands into a single command buffer and submits them on the device timeline.
///
/// Barriers are derived from the state tables of the resources each operation touches.
/// They are queued by the `add_*_barrier` methods and flushed by
/// [`execute_barriers`](Self::execute_barriers), which every recording operation calls
/// before it records its command.
pub struct CommandContext {
    device: Device,
    allocator: Allocator,
    config: ContextConfig,
    queue_family_index: u32,
    pool: Option<CommandPool>,
    command_buffer: Option<CommandBuffer>,
    /// Timeline value signalled by the last submission of this context.
    last_submit: u64,
    pending_buffer_barriers: Vec<vk::BufferMemoryBarrier2<'static>>,
    pending_image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
    descriptor_allocator: DescriptorAllocator,
    descriptor_sets: HashMap<vk::PipelineLayout, DescriptorSetCache>,
    transient_buffers: HashMap<(vk::BufferUsageFlags, TransientMemory), TransientBufferPool>,
    transient_images: HashMap<ImageInfo, TransientImageCache>,
    label_depth: u32,
}

impl HasDevice for CommandContext {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl CommandContext {
    /// Creates a context recording for the queue at `queue_index`.
    ///
    /// The command pool is created by the first call to [`begin`](Self::begin).
    ///
    /// # Panics
    /// Panics if `queue_index` does not name a queue of `device`.
    pub fn new(
        device: Device,
        allocator: Allocator,
        queue_index: usize,
        config: ContextConfig,
    ) -> Self {
        let queue_family_index = device.queue(queue_index).family_index();
        let descriptor_allocator =
            DescriptorAllocator::new(device.clone(), config.descriptor_pool_config());
        Self {
            device,
            allocator,
            config,
            queue_family_index,
            pool: None,
            command_buffer: None,
            last_submit: 0,
            pending_buffer_barriers: Vec::new(),
            pending_image_barriers: Vec::new(),
            descriptor_allocator,
            descriptor_sets: HashMap::new(),
            transient_buffers: HashMap::new(),
            transient_images: HashMap::new(),
            label_depth: 0,
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Timeline value signalled by the last submission, or 0 before the first one.
    pub fn last_submit(&self) -> u64 {
        self.last_submit
    }

    pub fn state(&self) -> CommandBufferState {
        self.command_buffer
            .as_ref()
            .map_or(CommandBufferState::Initial, CommandBuffer::state)
    }

    pub fn is_recording(&self) -> bool {
        self.state() == CommandBufferState::Recording
    }

    /// The raw command buffer being recorded, for commands this context does not wrap.
    pub fn command_buffer(&self) -> Result<vk::CommandBuffer> {
        match &self.command_buffer {
            Some(cb) if cb.state() == CommandBufferState::Recording => Ok(cb.vk_handle()),
            _ => Err(Error::InvalidState("command context is not recording")),
        }
    }

    /// Waits for the previous submission, recycles cached resources and starts recording.
    pub fn begin(&mut self) -> Result<()> {
        if self.pool.is_none() {
            let pool = CommandPool::new_resettable(self.device.clone(), self.queue_family_index)?;
            if let Some(name) = self.debug_name() {
                self.device.set_debug_name(pool.vk_handle(), &name);
            }
            self.pool = Some(pool);
        }
        let pool = self
            .pool
            .as_mut()
            .ok_or(Error::InvalidState("command pool was not created"))?;
        match &mut self.command_buffer {
            Some(cb) => {
                if cb.state() == CommandBufferState::Recording {
                    return Err(Error::InvalidState("command context is already recording"));
                }
                if self.last_submit > 0 {
                    self.device.wait_for_timeline(self.last_submit)?;
                }
                pool.reset(cb)?;
            }
            None => self.command_buffer = Some(pool.alloc()?),
        }
        let cb = self
            .command_buffer
            .as_mut()
            .ok_or(Error::InvalidState("command buffer was not allocated"))?;
        pool.begin(cb)?;
        self.recycle_transients();
        self.pending_buffer_barriers.clear();
        self.pending_image_barriers.clear();
        self.label_depth = 0;
        Ok(())
    }

    /// Moves the resources used by the finished recording back into the reusable caches.
    fn recycle_transients(&mut self) {
        let completed = self.last_submit;
        for cache in self.descriptor_sets.values_mut() {
            for sets in cache.in_use.drain(..) {
                cache.ready.push(sets, completed);
            }
        }
        for pool in self.transient_buffers.values_mut() {
            pool.recycle();
        }
        for cache in self.transient_images.values_mut() {
            for image in cache.in_use.drain(..) {
                cache.ready.push(image, completed);
            }
        }
    }

    /// Ends recording and submits to the queue at `queue_index`.
    ///
    /// The device timeline is signalled in addition to `signals`. The returned value is
    /// the timeline value at which every command recorded since [`begin`](Self::begin)
    /// has completed.
    pub fn submit(
        &mut self,
        queue_index: usize,
        waits: &[SemaphoreWait],
        signals: &[SemaphoreSignal],
    ) -> Result<u64> {
        let queue = self
            .device
            .queues()
            .get(queue_index)
            .ok_or(Error::InvalidState("no queue at this index"))?;
        if queue.family_index() != self.queue_family_index {
            return Err(Error::InvalidState(
                "queue belongs to a different family than the command pool",
            ));
        }
        if self.label_depth > 0 {
            tracing::warn!(
                depth = self.label_depth,
                "submitting with unbalanced debug labels"
            );
            while self.label_depth > 0 {
                self.pop_debug_label()?;
            }
        }
        self.execute_barriers()?;
        let (Some(pool), Some(cb)) = (self.pool.as_mut(), self.command_buffer.as_mut()) else {
            return Err(Error::InvalidState("command context is not recording"));
        };
        if cb.state() != CommandBufferState::Recording {
            return Err(Error::InvalidState("command context is not recording"));
        }
        pool.finish(cb)?;

        let waits: Vec<_> = waits.iter().map(|w| w.to_vk()).collect();
        let signals: Vec<_> = signals.iter().map(|s| s.to_vk()).collect();
        let value = self
            .device
            .submit(queue_index, &[cb.vk_handle()], &waits, &signals)?;
        cb.mark_pending(value);
        self.last_submit = value;
        Ok(value)
    }

    /// Blocks until the last submission of this context has completed.
    pub fn wait(&self) -> Result<()> {
        if self.last_submit > 0 {
            self.device.wait_for_timeline(self.last_submit)?;
        }
        Ok(())
    }

    /// Queues the barrier needed before `view` is accessed with `access`.
    pub fn add_buffer_barrier(&mut self, view: &BufferView, access: Access) {
        if let Some(barrier) = view.set_state(ResourceState::new(access)) {
            self.pending_buffer_barriers
                .push(barrier.to_vk(view.vk_handle()));
        }
    }

    /// Queues the barriers needed before `view` is accessed with `access` in `layout`.
    pub fn add_image_barrier(&mut self, view: &ImageView, access: Access, layout: vk::ImageLayout) {
        self.add_image_range_barrier(view.image(), view.range(), access, layout);
    }

    /// Queues the barriers needed before `range` of `image` is accessed with `access` in
    /// `layout`. Subresources already in that state produce no barrier.
    pub fn add_image_range_barrier(
        &mut self,
        image: &Image,
        range: &vk::ImageSubresourceRange,
        access: Access,
        layout: vk::ImageLayout,
    ) {
        let barriers = image.set_state(
            ResourceState::new_with_image_layout(access, layout),
            range,
        );
        self.pending_image_barriers
            .extend(barriers.iter().map(|b| b.to_vk(image.vk_handle())));
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.pending_buffer_barriers.is_empty() || !self.pending_image_barriers.is_empty()
    }

    /// Records every queued barrier in one `vkCmdPipelineBarrier2`.
    pub fn execute_barriers(&mut self) -> Result<()> {
        if !self.has_pending_barriers() {
            return Ok(());
        }
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_pipeline_barrier2(
                cb,
                &vk::DependencyInfo::default()
                    .buffer_memory_barriers(&self.pending_buffer_barriers)
                    .image_memory_barriers(&self.pending_image_barriers),
            );
        }
        self.pending_buffer_barriers.clear();
        self.pending_image_barriers.clear();
        Ok(())
    }

    /// Opens a debug label region. No-op without debug utils.
    pub fn push_debug_label(&mut self, label: &str, color: [f32; 4]) -> Result<()> {
        let cb = self.command_buffer()?;
        if let Some(debug_utils) = self.device.debug_utils() {
            let name = CString::new(label.replace('\0', "")).unwrap_or_default();
            unsafe {
                debug_utils.cmd_begin_debug_utils_label(
                    cb,
                    &vk::DebugUtilsLabelEXT::default()
                        .label_name(&name)
                        .color(color),
                );
            }
        }
        self.label_depth += 1;
        Ok(())
    }

    pub fn pop_debug_label(&mut self) -> Result<()> {
        let cb = self.command_buffer()?;
        if self.label_depth == 0 {
            return Err(Error::InvalidState("no debug label to pop"));
        }
        if let Some(debug_utils) = self.device.debug_utils() {
            unsafe { debug_utils.cmd_end_debug_utils_label(cb) };
        }
        self.label_depth -= 1;
        Ok(())
    }

    fn debug_name(&self) -> Option<CString> {
        self.config
            .name
            .as_deref()
            .and_then(|name| CString::new(name).ok())
    }

    /// A device-local buffer of at least `size` bytes, reusable after this recording's
    /// submission completes.
    fn transient_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: TransientMemory,
    ) -> Result<Arc<Buffer>> {
        let pool = self.transient_buffers.entry((usage, memory)).or_default();
        let buffer = match pool.take_best_fit(size) {
            Some(buffer) => buffer,
            None => {
                let size = size.max(self.config.min_transient_buffer_size);
                let buffer = match memory {
                    TransientMemory::Device => {
                        Buffer::new_private(self.allocator.clone(), size, 16, usage)?
                    }
                    TransientMemory::Host => {
                        Buffer::new_host(self.allocator.clone(), size, 16, usage)?
                    }
                };
                tracing::debug!(size, ?usage, ?memory, "created transient buffer");
                Arc::new(buffer)
            }
        };
        pool.in_use.push(buffer.clone());
        Ok(buffer)
    }

    /// An image matching `info`, reusable after this recording's submission completes.
    ///
    /// The image keeps the resource state of its previous use.
    pub fn get_transient_image(&mut self, info: &ImageInfo) -> Result<Arc<Image>> {
        let completed = self.last_submit;
        let allocator = self.allocator.clone();
        let cache = self.transient_images.entry(*info).or_default();
        let image = cache.ready.pop_or_create(completed, || {
            Image::new_private(allocator, info).map(Arc::new)
        })?;
        cache.in_use.push(image.clone());
        Ok(image)
    }

    /// Number of descriptor pools created so far. Pools are never freed.
    pub fn descriptor_pool_count(&self) -> usize {
        self.descriptor_allocator.pool_count()
    }

    /// Number of transient buffers owned by this context, in use or not.
    pub fn transient_buffer_count(&self) -> usize {
        self.transient_buffers
            .values()
            .map(|pool| pool.available.len() + pool.in_use.len())
            .sum()
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        let completed = match self.wait() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(%err, "failed to wait for command context before drop");
                false
            }
        };
        if let (Some(pool), Some(mut cb)) = (self.pool.as_mut(), self.command_buffer.take()) {
            if completed {
                cb.state = CommandBufferState::Initial;
            }
            pool.free(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_pool_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.descriptor_pool_config(), DescriptorPoolConfig::default());
        assert!(config.name.is_none());
    }
}
