//! Semaphores for caller-managed synchronization.
//!
//! Everything recorded through a [`CommandContext`](crate::context::CommandContext) is
//! ordered against the device timeline (see [`Device::next_timeline_signal`]). The
//! [`Semaphore`] type here is for additional waits and signals across queues or with
//! external systems, passed to [`CommandContext::submit`](crate::context::CommandContext::submit)
//! as [`SemaphoreWait`] and [`SemaphoreSignal`].
use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A timeline or binary semaphore.
///
/// For timeline semaphores the last observed counter value is cached to avoid
/// querying the device when polling.
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
    value: AtomicU64,
    binary: bool,
}
impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(if self.binary {
            "BinarySemaphore"
        } else {
            "TimelineSemaphore"
        })
        .field(&self.handle)
        .field(&self.value.load(Ordering::Relaxed))
        .finish()
    }
}

impl Semaphore {
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Creates a new timeline semaphore with the given initial value.
    pub fn new(device: Device, initial_value: u64) -> VkResult<Self> {
        let handle = create_timeline_semaphore(&device, initial_value)?;
        Ok(Self {
            device,
            handle,
            value: AtomicU64::new(initial_value),
            binary: false,
        })
    }

    pub fn new_binary(device: Device) -> VkResult<Self> {
        let handle = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?;
        Ok(Self {
            device,
            handle,
            value: AtomicU64::new(0),
            binary: true,
        })
    }

    /// Queries the current counter value of a timeline semaphore.
    pub fn value(&self) -> VkResult<u64> {
        debug_assert!(!self.binary);
        let new_value = unsafe { self.device.get_semaphore_counter_value(self.handle)? };
        self.value.fetch_max(new_value, Ordering::Relaxed);
        Ok(new_value)
    }

    pub fn is_signaled(&self, value: u64) -> VkResult<bool> {
        if self.value.load(Ordering::Relaxed) >= value {
            return Ok(true);
        }
        Ok(self.value()? >= value)
    }

    /// Signals a timeline semaphore from the host. No-op if already at or past `value`.
    pub fn signal(&self, value: u64) -> VkResult<()> {
        debug_assert!(!self.binary);
        if self.value.load(Ordering::Relaxed) >= value {
            return Ok(());
        }
        unsafe {
            self.device.signal_semaphore(
                &vk::SemaphoreSignalInfo::default()
                    .semaphore(self.handle)
                    .value(value),
            )?;
        }
        self.value.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks until a timeline semaphore reaches `value` or `timeout` nanoseconds pass.
    pub fn wait_blocked(&self, value: u64, timeout: u64) -> VkResult<()> {
        debug_assert!(!self.binary);
        if self.value.load(Ordering::Relaxed) >= value {
            return Ok(());
        }
        wait_timeline_semaphore(&self.device, self.handle, value, timeout)?;
        self.value.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }
}
impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

pub(crate) fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> VkResult<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    unsafe { device.create_semaphore(&info, None) }
}

pub(crate) fn wait_timeline_semaphore(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout: u64,
) -> VkResult<()> {
    let semaphores = [semaphore];
    let values = [value];
    unsafe {
        device.wait_semaphores(
            &vk::SemaphoreWaitInfo::default()
                .semaphores(&semaphores)
                .values(&values),
            timeout,
        )
    }
}

/// A semaphore wait performed before a submission executes `stage`.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreWait<'a> {
    pub semaphore: &'a Semaphore,
    /// Ignored for binary semaphores.
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

/// A semaphore signal performed once a submission finishes `stage`.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreSignal<'a> {
    pub semaphore: &'a Semaphore,
    /// Ignored for binary semaphores.
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreWait<'_> {
    pub(crate) fn to_vk(self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore.vk_handle())
            .value(self.value)
            .stage_mask(self.stage)
    }
}

impl SemaphoreSignal<'_> {
    pub(crate) fn to_vk(self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore.vk_handle())
            .value(self.value)
            .stage_mask(self.stage)
    }
}
