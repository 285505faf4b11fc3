//! # Tephra
//!
//! A Vulkan compute and rendering core built around automatic resource state tracking
//! and shader parameters bound by name.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tephra::prelude::*;
//!
//! let device = Device::create_system_default().unwrap();
//! let allocator = Allocator::new(device.clone()).unwrap();
//! let mut ctx = CommandContext::new(device.clone(), allocator, 0, ContextConfig::default());
//!
//! ctx.begin().unwrap();
//! let input = ctx
//!     .upload_data(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]), vk::BufferUsageFlags::STORAGE_BUFFER)
//!     .unwrap();
//! let value = ctx.submit(0, &[], &[]).unwrap();
//! device.wait_for_timeline(value).unwrap();
//! # let _ = input;
//! ```
//!
//! ## Overview
//!
//! ### Device and timeline
//!
//! [`Device`] owns the queues and a single timeline semaphore. Every submission signals
//! the next value of that timeline, and the returned value is what callers wait on before
//! reading results back or reusing resources.
//!
//! ### Resource state tracking
//!
//! [`Buffer`](buffer::Buffer)s and [`Image`](image::Image)s remember the last
//! [`ResourceState`](tracking::ResourceState) of each of their ranges. Declaring the next
//! use of a range yields exactly the barriers needed, which
//! [`CommandContext`](context::CommandContext) batches into one pipeline barrier before
//! each command.
//!
//! ### Shader parameters
//!
//! Pipeline layouts are built from SPIR-V reflection ([`shader::reflect`]). Values are
//! assigned by name on a [`ShaderParameter`](shader::ShaderParameter) tree and matched
//! against the layout when binding:
//!
//! ```ignore
//! let mut params = ShaderParameter::new();
//! params["data"].set(buffer_view);
//! params["params"]["scale"].set(2.0f32);
//! ctx.dispatch(&pipeline, [5, 1, 1], &params)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` - Serialize and deserialize the plain configuration structs.
//!
//! ## Requirements
//!
//! - Vulkan 1.3 with timeline semaphores and synchronization2

mod alloc;
pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
mod error;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
mod queue;
mod sampler;
pub mod shader;
pub mod sync;
pub mod tracking;
pub mod transient;
pub mod utils;

pub use alloc::Allocator;
pub use device::{Device, HasDevice};
pub use error::{Error, Result};
pub use instance::Instance;
pub use queue::Queue;
pub use sampler::Sampler;

pub use ash;

pub mod prelude {
    pub use crate::{
        Allocator, Device, Error, HasDevice, Result, Sampler, ash,
        ash::vk,
        buffer::{Buffer, BufferRange, BufferView},
        context::{CommandContext, ContextConfig, DescriptorSets},
        image::{Image, ImageInfo, ImageView},
        pipeline::{LayoutInfo, Pipeline, PipelineCache, PipelineLayout, ShaderStage},
        shader::{ParameterValue, ShaderParameter},
        tracking::{Access, ResourceState},
        utils::AsVkHandle,
    };
}
