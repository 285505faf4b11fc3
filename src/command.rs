//! Command pools and the lifecycle of the command buffers allocated from them.
//!
//! Recording itself goes through [`CommandContext`](crate::context::CommandContext), which
//! owns one pool and one primary command buffer and drives it through the
//! [`CommandBufferState`] machine.
use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// Represents the current state of a command buffer in its lifecycle.
///
/// ```text
/// Initial -> Recording -> Executable -> Pending(value)
///    |                                      |
///    +---------<<<------ (reset) -----------+
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandBufferState {
    /// Newly allocated or reset, ready to begin.
    Initial,

    /// Currently being recorded with commands.
    Recording,

    /// Recording finished, ready for submission to a queue.
    Executable,

    /// Submitted. Completes once the device timeline reaches the value.
    Pending(u64),
}

/// A primary command buffer with its tracked lifecycle state.
///
/// Command buffers are allocated by [`CommandPool::alloc`] and must be returned with
/// [`CommandPool::free`]; the pool frees any that remain when it is dropped.
pub struct CommandBuffer {
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) state: CommandBufferState,
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// The timeline value the last submission of this buffer signals, if it was submitted.
    pub fn timestamp(&self) -> Option<u64> {
        match self.state {
            CommandBufferState::Pending(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn mark_pending(&mut self, value: u64) {
        debug_assert_eq!(self.state, CommandBufferState::Executable);
        self.state = CommandBufferState::Pending(value);
    }
}

impl AsVkHandle for CommandBuffer {
    type Handle = vk::CommandBuffer;

    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.buffer)
            .field("state", &self.state)
            .finish()
    }
}

/// A pool for allocating Vulkan command buffers.
///
/// Command pools are not thread-safe. Each [`CommandContext`](crate::context::CommandContext)
/// owns its own pool, which is the unit of recording parallelism.
pub struct CommandPool {
    device: Device,
    handle: vk::CommandPool,
    flags: vk::CommandPoolCreateFlags,
}

impl HasDevice for CommandPool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for CommandPool {
    type Handle = vk::CommandPool;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

impl CommandPool {
    /// Creates a new command pool for a specific queue family.
    pub fn new(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }

    /// Creates a new resettable command pool for a specific queue family.
    ///
    /// Command buffers allocated from this command pool can be individually reset.
    pub fn new_resettable(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    fn new_with_flags(
        device: Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self> {
        let handle = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(flags)
                    .queue_family_index(queue_family_index),
                None,
            )?
        };
        Ok(Self {
            device,
            handle,
            flags,
        })
    }

    pub fn is_resettable(&self) -> bool {
        self.flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    /// Allocate a new primary command buffer from the pool.
    pub fn alloc(&mut self) -> VkResult<CommandBuffer> {
        let buffers = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.handle)
                    .command_buffer_count(1)
                    .level(vk::CommandBufferLevel::PRIMARY),
            )?
        };
        let buffer = buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        Ok(CommandBuffer {
            buffer,
            state: CommandBufferState::Initial,
        })
    }

    /// Begin recording a one-time-submit command buffer.
    pub fn begin(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert_eq!(
            cb.state,
            CommandBufferState::Initial,
            "Command buffer must be reset before it can begin again"
        );
        unsafe {
            self.device.begin_command_buffer(
                cb.buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    /// End recording on a command buffer. Must be called before submitting it.
    pub fn finish(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert_eq!(
            cb.state,
            CommandBufferState::Recording,
            "Command buffer is not recording"
        );
        unsafe {
            self.device.end_command_buffer(cb.buffer)?;
        }
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Resets a command buffer. The pool must be created with [`CommandPool::new_resettable`].
    ///
    /// The caller must have waited for a pending submission to complete.
    pub fn reset(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert!(
            self.is_resettable(),
            "Command pool was not created with RESET_COMMAND_BUFFER"
        );
        unsafe {
            self.device
                .reset_command_buffer(cb.buffer, vk::CommandBufferResetFlags::empty())?;
        }
        cb.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Returns a command buffer to the pool.
    pub fn free(&mut self, cb: CommandBuffer) {
        if let CommandBufferState::Pending(value) = cb.state {
            tracing::warn!(
                command_buffer = ?cb.buffer,
                value,
                "freeing a command buffer that may still be executing"
            );
        }
        unsafe {
            self.device.free_command_buffers(self.handle, &[cb.buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_follows_state() {
        let mut cb = CommandBuffer {
            buffer: vk::CommandBuffer::null(),
            state: CommandBufferState::Executable,
        };
        assert_eq!(cb.timestamp(), None);
        cb.mark_pending(7);
        assert_eq!(cb.state(), CommandBufferState::Pending(7));
        assert_eq!(cb.timestamp(), Some(7));
    }
}
