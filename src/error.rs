use std::ffi::CStr;

use ash::vk;
use thiserror::Error;

/// Errors returned by the higher-level parts of the crate.
///
/// The thin Vulkan wrappers return [`ash::prelude::VkResult`] directly; everything that combines
/// several Vulkan calls, reflects shaders or validates caller input returns this type.
#[derive(Error, Debug)]
pub enum Error {
    /// A Vulkan call failed.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    /// The Vulkan loader could not be found or loaded.
    #[error("failed to load the Vulkan loader")]
    Loading(#[from] ash::LoadingError),
    /// A required instance or device extension is not available.
    #[error("extension {0:?} is not available")]
    MissingExtension(&'static CStr),
    /// No physical device satisfies the requested capabilities.
    #[error("no compatible physical device")]
    NoCompatibleDevice,
    /// SPIR-V reflection failed.
    #[error("shader reflection failed: {0}")]
    Reflection(String),
    /// Two shader stages declare incompatible bindings at the same location.
    #[error("shader stages disagree on `{name}` (set {set}, binding {binding}): {reason}")]
    InterfaceMismatch {
        name: String,
        set: u32,
        binding: u32,
        reason: String,
    },
    /// A copy destination is smaller than its source.
    #[error("copy source of {src_size} bytes does not fit into destination of {dst_size} bytes")]
    CopyOverflow { src_size: u64, dst_size: u64 },
    /// An operation was called in the wrong recording state.
    #[error("invalid command context state: {0}")]
    InvalidState(&'static str),
    /// Pipeline cache persistence failed.
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
