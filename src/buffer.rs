//! Buffers, buffer views and their tracked state.
//!
//! # Choosing an Allocation Strategy
//!
//! - **[`Buffer::new_private`]**: GPU-exclusive memory, for data produced and consumed on
//!   the GPU.
//! - **[`Buffer::new_host`]**: host-visible memory written sequentially by the CPU, for
//!   staging.
//! - **[`Buffer::new_upload`]**: device-local memory that is host-writable where the
//!   platform allows it.
//! - **[`Buffer::new_readback`]**: host-cached memory for reading GPU results back.
//!
//! A [`Buffer`] is shared through [`Arc`]. [`BufferView`] is a `(buffer, offset, size)`
//! window that keeps the buffer alive; slicing a view shares the same buffer.
use std::{
    fmt::Debug,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{
    Allocator, Device, HasDevice,
    tracking::{BufferBarrier, BufferStateTable, ResourceState},
    utils::AsVkHandle,
};

/// A buffer with its own allocation and per-range [`ResourceState`]s.
///
/// The allocation is released exactly once, when the last [`Arc`] is dropped.
pub struct Buffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    device_address: vk::DeviceAddress,

    memory_properties: vk::MemoryPropertyFlags,
    state: Mutex<BufferStateTable>,
}
impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}
impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory_properties", &self.memory_properties)
            .finish_non_exhaustive()
    }
}
impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}
impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

impl Buffer {
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn from_raw(
        allocator: Allocator,
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Self {
        let info = allocator.get_allocation_info(&allocation);
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            unsafe {
                allocator
                    .device()
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            }
        } else {
            0
        };
        let memory_properties = allocator
            .device()
            .physical_device()
            .properties()
            .memory_types()
            .get(info.memory_type as usize)
            .map(|ty| ty.property_flags)
            .unwrap_or_default();

        Self {
            memory_properties,
            allocator,
            buffer,
            allocation,
            size,
            usage,
            device_address,
            state: Mutex::new(BufferStateTable::default()),
        }
    }

    fn new_with(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        allocation_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<Self> {
        unsafe {
            let (buffer, allocation) = allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                allocation_info,
                alignment,
            )?;
            Ok(Self::from_raw(allocator, buffer, allocation, usage, size))
        }
    }

    /// A buffer accessible exclusively from the GPU.
    pub fn new_private(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new_with(
            allocator,
            size,
            alignment,
            usage,
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            },
        )
    }

    /// A persistently mapped HOST_VISIBLE buffer for sequential CPU writes.
    pub fn new_host(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new_with(
            allocator,
            size,
            alignment,
            usage,
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
        )
    }

    /// A DEVICE_LOCAL buffer that is host-writable where the platform allows it.
    ///
    /// `TRANSFER_DST` is always added to `usage` so a staging copy stays possible.
    pub fn new_upload(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new_with(
            allocator,
            size,
            alignment,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_ALLOW_TRANSFER_INSTEAD,
                ..Default::default()
            },
        )
    }

    /// A host-cached buffer for reading GPU results on the CPU.
    pub fn new_readback(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new_with(
            allocator,
            size,
            alignment,
            usage,
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        )
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Zero unless created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        if !self.is_host_visible() {
            return None;
        }
        let ptr = self.allocator.get_allocation_info(&self.allocation).mapped_data as *mut u8;
        (!ptr.is_null()).then_some(ptr)
    }

    /// Copies `data` into mapped memory at `offset` and flushes it.
    ///
    /// Fails with `ERROR_MEMORY_MAP_FAILED` if the buffer is not host-visible. The caller
    /// must make sure the GPU is not accessing the written range.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        let ptr = self.mapped_ptr().ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset + data.len() as vk::DeviceSize > self.size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        self.flush(offset, data.len() as vk::DeviceSize)
    }

    /// Invalidates and reads `len` bytes of mapped memory at `offset`.
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> VkResult<Vec<u8>> {
        let ptr = self.mapped_ptr().ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset + len as vk::DeviceSize > self.size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.invalidate(offset, len as vk::DeviceSize)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    pub fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        self.allocator
            .flush_allocation(&self.allocation, offset, size)
    }

    pub fn invalidate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        self.allocator
            .invalidate_allocation(&self.allocation, offset, size)
    }

    /// The state table of this buffer. Held only while recording a single command.
    pub fn state(&self) -> MutexGuard<'_, BufferStateTable> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A `(buffer, offset, size)` window into a shared [`Buffer`].
#[derive(Clone)]
pub struct BufferView {
    buffer: Arc<Buffer>,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

impl Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("buffer", &self.buffer.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl PartialEq for BufferView {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
            && self.offset == other.offset
            && self.size == other.size
    }
}
impl Eq for BufferView {}

impl From<Arc<Buffer>> for BufferView {
    fn from(buffer: Arc<Buffer>) -> Self {
        let size = buffer.size;
        Self {
            buffer,
            offset: 0,
            size,
        }
    }
}

impl AsVkHandle for BufferView {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer.buffer
    }
}

impl BufferView {
    /// # Panics
    /// Panics if the range exceeds the buffer.
    pub fn new(buffer: Arc<Buffer>, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        assert!(offset + size <= buffer.size, "view exceeds buffer");
        Self {
            buffer,
            offset,
            size,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// A sub-view relative to this view, sharing the same buffer.
    ///
    /// # Panics
    /// Panics if the sub-view exceeds this view.
    pub fn slice(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        assert!(offset + size <= self.size, "slice exceeds view");
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset + offset,
            size,
        }
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        if self.buffer.device_address == 0 {
            0
        } else {
            self.buffer.device_address + self.offset
        }
    }

    pub fn get_state(&self) -> ResourceState {
        self.buffer.state().get_state(self.offset, self.size)
    }

    /// Records `state` for this view's range and returns the barrier from the previous use.
    pub fn set_state(&self, state: ResourceState) -> Option<BufferBarrier> {
        self.buffer.state().set_state(state, self.offset, self.size)
    }

    pub fn write(&self, data: &[u8]) -> VkResult<()> {
        debug_assert!(data.len() as vk::DeviceSize <= self.size);
        self.buffer.write(self.offset, data)
    }

    pub fn read(&self) -> VkResult<Vec<u8>> {
        self.buffer.read(self.offset, self.size as usize)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer.buffer,
            offset: self.offset,
            range: self.size,
        }
    }
}

/// A [`BufferView`] holding `count` elements of `T`.
pub struct BufferRange<T> {
    view: BufferView,
    count: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for BufferRange<T> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            count: self.count,
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for BufferRange<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRange")
            .field("element", &std::any::type_name::<T>())
            .field("count", &self.count)
            .field("view", &self.view)
            .finish()
    }
}

impl<T: bytemuck::Pod> BufferRange<T> {
    pub fn new(view: BufferView) -> Self {
        let count = view.size() as usize / std::mem::size_of::<T>().max(1);
        Self {
            view,
            count,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn view(&self) -> &BufferView {
        &self.view
    }

    pub fn into_view(self) -> BufferView {
        self.view
    }

    /// Writes `data` from the first element. The buffer must be host-visible.
    pub fn write(&self, data: &[T]) -> VkResult<()> {
        debug_assert!(data.len() <= self.count);
        self.view.write(bytemuck::cast_slice(data))
    }

    /// Reads all elements. The buffer must be host-visible.
    pub fn read(&self) -> VkResult<Vec<T>> {
        let bytes = self.view.read()?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

impl<T> From<BufferRange<T>> for BufferView {
    fn from(range: BufferRange<T>) -> Self {
        range.view
    }
}

/// A formatted view of a buffer for texel buffer descriptors.
pub struct TexelBufferView {
    view: BufferView,
    handle: vk::BufferView,
    format: vk::Format,
}

impl TexelBufferView {
    pub fn new(view: BufferView, format: vk::Format) -> VkResult<Self> {
        let handle = unsafe {
            view.buffer.device().create_buffer_view(
                &vk::BufferViewCreateInfo::default()
                    .buffer(view.buffer.buffer)
                    .format(format)
                    .offset(view.offset)
                    .range(view.size),
                None,
            )
        }?;
        Ok(Self {
            view,
            handle,
            format,
        })
    }

    pub fn view(&self) -> &BufferView {
        &self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl AsVkHandle for TexelBufferView {
    type Handle = vk::BufferView;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Debug for TexelBufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TexelBufferView")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("view", &self.view)
            .finish()
    }
}

impl Drop for TexelBufferView {
    fn drop(&mut self) {
        unsafe {
            self.view.buffer.device().destroy_buffer_view(self.handle, None);
        }
    }
}
