//! Physical device enumeration and queue family selection.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tephra::{Instance, ash::vk};
//! # let entry = Arc::new(unsafe { ash::Entry::load() }.unwrap());
//! # let instance = Instance::builder(entry).unwrap().build().unwrap();
//! let physical_devices: Vec<_> = instance.enumerate_physical_devices().unwrap().collect();
//! let gpu = physical_devices
//!     .iter()
//!     .find(|d| d.properties().device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
//!     .unwrap_or(&physical_devices[0]);
//! println!("Using: {:?}", gpu.properties().device_name());
//! ```
use crate::{
    Instance,
    utils::{AsVkHandle, Version},
};
use ash::{prelude::VkResult, vk};
use std::{ffi::CStr, ops::Deref, sync::Arc};

/// A GPU enumerated from an [`Instance`]. Cheap to clone.
#[derive(Clone)]
pub struct PhysicalDevice(Arc<PhysicalDeviceInner>);
impl PartialEq for PhysicalDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PhysicalDevice {}

struct PhysicalDeviceInner {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    properties: PhysicalDeviceProperties,
    queue_families: Vec<vk::QueueFamilyProperties>,
}

impl Instance {
    pub fn enumerate_physical_devices(
        &self,
    ) -> VkResult<impl ExactSizeIterator<Item = PhysicalDevice> + '_> {
        let pdevices = unsafe { self.deref().enumerate_physical_devices()? };
        Ok(pdevices.into_iter().map(|pdevice| {
            let properties = PhysicalDeviceProperties::new(self, pdevice);
            let queue_families =
                unsafe { self.get_physical_device_queue_family_properties(pdevice) };
            PhysicalDevice(Arc::new(PhysicalDeviceInner {
                instance: self.clone(),
                physical_device: pdevice,
                properties,
                queue_families,
            }))
        }))
    }
}
impl AsVkHandle for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    fn vk_handle(&self) -> Self::Handle {
        self.0.physical_device
    }
}
impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PhysicalDevice")
            .field(&self.properties().device_name())
            .finish()
    }
}
impl PhysicalDevice {
    pub fn instance(&self) -> &Instance {
        &self.0.instance
    }

    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.0.properties
    }

    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.0.queue_families
    }

    /// The queue family with the fewest capabilities that still supports all of `required`.
    pub fn find_queue_family(&self, required: vk::QueueFlags) -> Option<u32> {
        find_queue_family(&self.0.queue_families, required)
    }

    /// Returns `Ok(None)` if the format is not supported with the given parameters.
    pub fn image_format_properties(
        &self,
        format_info: &vk::PhysicalDeviceImageFormatInfo2,
    ) -> VkResult<Option<vk::ImageFormatProperties>> {
        let mut out = vk::ImageFormatProperties2::default();
        let result = unsafe {
            self.0.instance.get_physical_device_image_format_properties2(
                self.0.physical_device,
                format_info,
                &mut out,
            )
        };
        match result {
            Ok(()) => Ok(Some(out.image_format_properties)),
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.0
                .instance
                .get_physical_device_format_properties(self.0.physical_device, format)
        }
    }

    /// Returns true if the device supports timeline semaphores and synchronization2.
    pub fn supports_core_features(&self) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13);
        unsafe {
            self.0
                .instance
                .get_physical_device_features2(self.0.physical_device, &mut features);
        }
        features12.timeline_semaphore == vk::TRUE && features13.synchronization2 == vk::TRUE
    }
}

/// Picks the queue family whose flags are a superset of `required`, preferring the one
/// with the fewest capability bits.
///
/// Dedicated transfer or compute families therefore win over general purpose ones.
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0 && family.queue_flags.contains(required))
        .min_by_key(|(_, family)| family.queue_flags.as_raw().count_ones())
        .map(|(index, _)| index as u32)
}

/// Cached properties of a physical device.
pub struct PhysicalDeviceProperties {
    inner: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}
impl PhysicalDeviceProperties {
    fn new(instance: &Instance, pdevice: vk::PhysicalDevice) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(pdevice) };
        let inner = unsafe { instance.get_physical_device_properties(pdevice) };
        Self {
            inner,
            memory_properties,
        }
    }

    pub fn device_name(&self) -> &CStr {
        self.inner.device_name_as_c_str().unwrap_or(c"unknown")
    }

    pub fn api_version(&self) -> Version {
        Version(self.inner.api_version)
    }

    pub fn driver_version(&self) -> Version {
        Version(self.inner.driver_version)
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_properties.memory_types[0..self.memory_properties.memory_type_count as usize]
    }

    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_properties.memory_heaps[0..self.memory_properties.memory_heap_count as usize]
    }
}
impl Deref for PhysicalDeviceProperties {
    type Target = vk::PhysicalDeviceProperties;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
