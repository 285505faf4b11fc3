//! GPU memory allocation through the Vulkan Memory Allocator.
//!
//! ```no_run
//! # use tephra::{Device, Allocator, buffer::Buffer, ash::vk};
//! # let device = Device::create_system_default().unwrap();
//! let allocator = Allocator::new(device.clone()).unwrap();
//! let buffer = Buffer::new_private(allocator, 1024, 4, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
//! ```
use std::{ops::Deref, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A reference-counted, thread-safe VMA allocator.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
struct AllocatorInner {
    // Field order matters: the allocator must be destroyed before the device.
    inner: vk_mem::Allocator,
    device: Device,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl PartialEq for Allocator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Allocator {}

impl Allocator {
    /// Creates an allocator for `device`, targeting Vulkan 1.3.
    pub fn new(device: Device) -> VkResult<Self> {
        Self::with_flags(device, vk_mem::AllocatorCreateFlags::empty())
    }

    /// Creates an allocator with extra creation flags, such as
    /// `BUFFER_DEVICE_ADDRESS` when that feature was enabled on the device.
    pub fn with_flags(device: Device, flags: vk_mem::AllocatorCreateFlags) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            &device,
            device.physical_device().vk_handle(),
        );
        info.vulkan_api_version = vk::API_VERSION_1_3;
        info.flags |= flags;
        let inner = unsafe { vk_mem::Allocator::new(info)? };
        Ok(Self(Arc::new(AllocatorInner { inner, device })))
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Allocator").field(&self.0.device).finish()
    }
}
