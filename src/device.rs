//! Logical device creation and the device timeline.
//!
//! [`Device`] owns the logical device, its queues and a single timeline semaphore that
//! every submission signals with a strictly increasing value. Caches throughout the crate
//! decide when an object may be reused by comparing against that timeline.
//!
//! ```no_run
//! # use tephra::Device;
//! let device = Device::create_system_default().unwrap();
//! let value = device.next_timeline_signal();
//! // ... submit work, which signals `value` ...
//! device.wait_for_timeline(value).unwrap();
//! ```
//!
//! For more control, use the builder:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tephra::{Instance, Device, ash::vk};
//! # let entry = Arc::new(unsafe { ash::Entry::load() }.unwrap());
//! # let instance = Instance::builder(entry).unwrap().build().unwrap();
//! # let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
//! let mut builder = Device::builder(physical_device);
//! builder.features12.buffer_device_address = vk::TRUE;
//! let queue = builder
//!     .enable_queue_with_caps(vk::QueueFlags::COMPUTE, 1.0)
//!     .unwrap();
//! let device = builder.build().unwrap();
//! assert_eq!(device.queue(queue).family_index(), device.queues()[queue].family_index());
//! ```
use crate::{
    Error, Instance,
    physical_device::PhysicalDevice,
    queue::Queue,
    sync::{create_timeline_semaphore, wait_timeline_semaphore},
    utils::{AsVkHandle, Version},
};
use ash::{prelude::VkResult, vk};

use std::{
    collections::BTreeSet,
    ffi::CStr,
    fmt::Debug,
    ops::Deref,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Types created from a device.
pub trait HasDevice {
    fn device(&self) -> &Device;

    fn physical_device(&self) -> &PhysicalDevice {
        self.device().physical_device()
    }

    fn instance(&self) -> &Instance {
        self.device().physical_device().instance()
    }
}

/// A reference-counted logical device.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.device.handle())
            .finish()
    }
}

struct DeviceInner {
    physical_device: PhysicalDevice,
    device: ash::Device,
    extensions: BTreeSet<&'static CStr>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    queues: Vec<Queue>,

    timeline: vk::Semaphore,
    /// The last value handed out by `increment_timeline_signal`.
    last_signal: AtomicU64,
    /// Serializes timeline increments with queue submission so that signals reach
    /// the queues in increasing order.
    submit_lock: Mutex<()>,
}

impl Device {
    pub fn instance(&self) -> &Instance {
        self.0.physical_device.instance()
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.0.physical_device
    }

    pub fn has_extension_named(&self, name: &CStr) -> bool {
        self.0.extensions.contains(name)
    }

    /// The `VK_EXT_debug_utils` device functions, if enabled on the instance.
    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.0.debug_utils.as_ref()
    }

    pub fn queues(&self) -> &[Queue] {
        &self.0.queues
    }

    /// # Panics
    /// Panics if `index` was not returned by the builder that created this device.
    pub fn queue(&self, index: usize) -> &Queue {
        &self.0.queues[index]
    }

    /// Creates a device on the first physical device with timeline semaphores and
    /// synchronization2, with one queue capable of compute and transfer.
    ///
    /// `VK_EXT_debug_utils` is enabled when available.
    pub fn create_system_default() -> Result<Self, Error> {
        let entry = Arc::new(unsafe { ash::Entry::load() }?);
        let mut instance_builder = Instance::builder(entry)?;
        instance_builder.info.api_version = Version::V1_3;
        instance_builder
            .enable_extension(ash::ext::debug_utils::NAME)
            .ok();
        let instance = instance_builder.build()?;

        let pdevice = instance
            .enumerate_physical_devices()?
            .find(|pdevice| {
                pdevice.properties().api_version() >= Version::V1_3
                    && pdevice.supports_core_features()
            })
            .ok_or(Error::NoCompatibleDevice)?;
        tracing::info!(device = ?pdevice.properties().device_name(), "selected physical device");
        let mut builder = Device::builder(pdevice);
        builder
            .enable_queue_with_caps(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1.0,
            )
            .or_else(|| builder.enable_queue_with_caps(vk::QueueFlags::COMPUTE, 1.0))
            .ok_or(Error::NoCompatibleDevice)?;
        Ok(builder.build()?)
    }

    pub fn builder(pdevice: PhysicalDevice) -> DeviceBuilder {
        DeviceBuilder::new(pdevice)
    }

    /// The value the next submission will signal on the device timeline.
    pub fn next_timeline_signal(&self) -> u64 {
        self.0.last_signal.load(Ordering::Acquire) + 1
    }

    /// Reserves and returns the next timeline value.
    pub fn increment_timeline_signal(&self) -> u64 {
        self.0.last_signal.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The value the device timeline has reached.
    pub fn current_timeline_value(&self) -> VkResult<u64> {
        unsafe { self.0.device.get_semaphore_counter_value(self.0.timeline) }
    }

    /// Blocks until the device timeline reaches `value`.
    pub fn wait_for_timeline(&self, value: u64) -> VkResult<()> {
        wait_timeline_semaphore(&self.0.device, self.0.timeline, value, u64::MAX)
    }

    /// Blocks until the device is idle.
    ///
    /// Timeline values that were reserved but never submitted are signalled from the host
    /// afterwards, so waiters on them do not block forever.
    pub fn wait_idle(&self) -> VkResult<()> {
        let _guard = self
            .0
            .submit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe { self.0.device.device_wait_idle()? };
        let last = self.0.last_signal.load(Ordering::Acquire);
        if self.current_timeline_value()? < last {
            unsafe {
                self.0.device.signal_semaphore(
                    &vk::SemaphoreSignalInfo::default()
                        .semaphore(self.0.timeline)
                        .value(last),
                )?;
            }
        }
        Ok(())
    }

    /// Submits command buffers to the queue at `queue_index`, appending a signal of the
    /// device timeline. Returns the signalled timeline value.
    pub fn submit(
        &self,
        queue_index: usize,
        command_buffers: &[vk::CommandBuffer],
        waits: &[vk::SemaphoreSubmitInfo],
        signals: &[vk::SemaphoreSubmitInfo],
    ) -> VkResult<u64> {
        let queue = self
            .0
            .queues
            .get(queue_index)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let _guard = self
            .0
            .submit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let value = self.increment_timeline_signal();
        let mut signals = signals.to_vec();
        signals.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.0.timeline)
                .value(value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );
        // Safety: the submit lock serializes host access to every queue of this device.
        unsafe { queue.submit(&self.0.device, command_buffers, waits, &signals)? };
        Ok(value)
    }

    /// Names a Vulkan object for debugging tools. No-op without debug utils.
    pub fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &CStr) {
        if let Some(debug_utils) = &self.0.debug_utils {
            let info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(name);
            if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
                tracing::warn!(%err, "failed to set debug name");
            }
        }
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}
impl AsVkHandle for Device {
    type Handle = vk::Device;

    fn vk_handle(&self) -> Self::Handle {
        self.0.device.handle()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: every object created from the device holds a clone of it, so nothing
        // else can be using the device or its queues.
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                tracing::error!(%err, "device_wait_idle failed during drop");
            }
            self.device.destroy_semaphore(self.timeline, None);
            self.device.destroy_device(None);
        }
    }
}

/// Configures queues, extensions and features before device creation.
///
/// Timeline semaphores and synchronization2 are always enabled.
pub struct DeviceBuilder {
    pdevice: PhysicalDevice,
    available_extensions: BTreeSet<Vec<u8>>,
    enabled_extensions: BTreeSet<&'static CStr>,
    /// (family index, priorities), one entry per requested queue family.
    queue_requests: Vec<(u32, Vec<f32>)>,
    /// Queue family and index within the family, in device queue order.
    queue_order: Vec<(u32, u32)>,

    pub features: vk::PhysicalDeviceFeatures,
    pub features11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub features12: vk::PhysicalDeviceVulkan12Features<'static>,
    pub features13: vk::PhysicalDeviceVulkan13Features<'static>,
}

unsafe impl Send for DeviceBuilder {}
unsafe impl Sync for DeviceBuilder {}
impl DeviceBuilder {
    pub fn new(pdevice: PhysicalDevice) -> Self {
        let available_extensions = unsafe {
            pdevice
                .instance()
                .enumerate_device_extension_properties(pdevice.vk_handle())
        }
        .unwrap_or_else(|err| {
            tracing::warn!(%err, "failed to enumerate device extensions");
            Vec::new()
        })
        .into_iter()
        .filter_map(|ext| {
            ext.extension_name_as_c_str()
                .ok()
                .map(|name| name.to_bytes().to_vec())
        })
        .collect();
        #[allow(unused_mut)]
        let mut this = Self {
            pdevice,
            available_extensions,
            enabled_extensions: BTreeSet::new(),
            queue_requests: Vec::new(),
            queue_order: Vec::new(),
            features: vk::PhysicalDeviceFeatures::default(),
            features11: vk::PhysicalDeviceVulkan11Features::default(),
            features12: vk::PhysicalDeviceVulkan12Features::default(),
            features13: vk::PhysicalDeviceVulkan13Features::default(),
        };
        #[cfg(target_vendor = "apple")]
        {
            if this
                .enable_extension(ash::khr::portability_subset::NAME)
                .is_ok()
            {
                tracing::warn!("Running on a Vulkan portability implementation");
            }
        }
        this
    }

    pub fn enable_extension(&mut self, name: &'static CStr) -> Result<(), Error> {
        if self.available_extensions.contains(name.to_bytes()) {
            self.enabled_extensions.insert(name);
            Ok(())
        } else {
            Err(Error::MissingExtension(name))
        }
    }

    fn enabled_in_family(&self, family_index: u32) -> u32 {
        self.queue_requests
            .iter()
            .find(|(family, _)| *family == family_index)
            .map_or(0, |(_, priorities)| priorities.len() as u32)
    }

    /// Requests one more queue from `family_index`.
    ///
    /// Returns the queue's index in [`Device::queues`], or `None` if every queue of the
    /// family is already requested.
    pub fn enable_queue(&mut self, family_index: u32, priority: f32) -> Option<usize> {
        let family = self
            .pdevice
            .queue_family_properties()
            .get(family_index as usize)?;
        let enabled = self.enabled_in_family(family_index);
        if enabled >= family.queue_count {
            return None;
        }
        match self
            .queue_requests
            .iter_mut()
            .find(|(family, _)| *family == family_index)
        {
            Some((_, priorities)) => priorities.push(priority),
            None => self.queue_requests.push((family_index, vec![priority])),
        }
        self.queue_order.push((family_index, enabled));
        Some(self.queue_order.len() - 1)
    }

    /// Requests a queue from the least capable family supporting `required`.
    pub fn enable_queue_with_caps(
        &mut self,
        required: vk::QueueFlags,
        priority: f32,
    ) -> Option<usize> {
        let (family_index, _) = self
            .pdevice
            .queue_family_properties()
            .iter()
            .enumerate()
            .filter(|(index, properties)| {
                properties.queue_flags.contains(required)
                    && self.enabled_in_family(*index as u32) < properties.queue_count
            })
            .min_by_key(|(_, properties)| properties.queue_flags.as_raw().count_ones())?;
        self.enable_queue(family_index as u32, priority)
    }

    pub fn build(mut self) -> VkResult<Device> {
        self.features12.timeline_semaphore = vk::TRUE;
        self.features13.synchronization2 = vk::TRUE;

        let extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let queue_create_infos = self
            .queue_requests
            .iter()
            .map(|(family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(*family)
                    .queue_priorities(priorities)
            })
            .collect::<Vec<_>>();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().features(self.features);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2)
            .push_next(&mut self.features11)
            .push_next(&mut self.features12)
            .push_next(&mut self.features13);
        let instance = self.pdevice.instance();
        let device =
            unsafe { instance.create_device(self.pdevice.vk_handle(), &create_info, None) }?;

        let families = self.pdevice.queue_family_properties();
        let queues = self
            .queue_order
            .iter()
            .map(|&(family, index)| {
                let raw = unsafe { device.get_device_queue(family, index) };
                Queue::from_raw(raw, family, families[family as usize].queue_flags)
            })
            .collect();
        let timeline = match create_timeline_semaphore(&device, 0) {
            Ok(timeline) => timeline,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };
        let debug_utils = instance
            .debug_utils()
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));

        Ok(Device(Arc::new(DeviceInner {
            physical_device: self.pdevice,
            device,
            extensions: self.enabled_extensions,
            debug_utils,
            queues,
            timeline,
            last_signal: AtomicU64::new(0),
            submit_lock: Mutex::new(()),
        })))
    }
}
