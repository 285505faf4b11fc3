//! Device queues.
//!
//! Queues are created with the [`Device`](crate::Device) and addressed by their index
//! in [`Device::queues`](crate::Device::queues). Submissions to one queue start in order
//! but may finish out of order; completion is observed through the device timeline.
use ash::{prelude::VkResult, vk};

use crate::utils::AsVkHandle;

/// A queue created together with the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queue {
    handle: vk::Queue,
    family_index: u32,
    capabilities: vk::QueueFlags,
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Queue {
    pub(crate) fn from_raw(queue: vk::Queue, family_index: u32, caps: vk::QueueFlags) -> Self {
        Self {
            handle: queue,
            family_index,
            capabilities: caps,
        }
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Capabilities of the queue family this queue belongs to.
    pub fn capabilities(&self) -> vk::QueueFlags {
        self.capabilities
    }

    /// Submits `command_buffers` in one batch.
    ///
    /// # Safety
    /// Host access to the queue must be externally synchronized, and every command buffer
    /// must be in the executable state.
    pub(crate) unsafe fn submit(
        &self,
        device: &ash::Device,
        command_buffers: &[vk::CommandBuffer],
        waits: &[vk::SemaphoreSubmitInfo],
        signals: &[vk::SemaphoreSubmitInfo],
    ) -> VkResult<()> {
        let command_buffer_infos = command_buffers
            .iter()
            .map(|&command_buffer| {
                vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer)
            })
            .collect::<Vec<_>>();
        unsafe {
            device.queue_submit2(
                self.handle,
                &[vk::SubmitInfo2::default()
                    .command_buffer_infos(&command_buffer_infos)
                    .wait_semaphore_infos(waits)
                    .signal_semaphore_infos(signals)],
                vk::Fence::null(),
            )
        }
    }
}
