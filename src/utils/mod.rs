//! Small helpers shared across the crate.
use ash::vk;
use std::fmt::Debug;

/// Types that wrap a raw Vulkan handle.
pub trait AsVkHandle {
    type Handle: ash::vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}
impl<T> AsVkHandle for std::sync::Arc<T>
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// A packed Vulkan API version number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);
impl Version {
    pub const V1_0: Self = Self::new(0, 1, 0, 0);
    pub const V1_1: Self = Self::new(0, 1, 1, 0);
    pub const V1_2: Self = Self::new(0, 1, 2, 0);
    pub const V1_3: Self = Self::new(0, 1, 3, 0);

    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }
    pub const fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub const fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub const fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }
    pub const fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}
impl Default for Version {
    fn default() -> Self {
        Self::V1_3
    }
}
impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({}.{}.{})", self.major(), self.minor(), self.patch())?;
        let variant = self.variant();
        if variant != 0 {
            write!(f, " variant {variant}")?;
        }
        Ok(())
    }
}
impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Maps shader stages to the pipeline stages that execute them.
pub fn shader_stages_to_pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags2 {
    const TABLE: [(vk::ShaderStageFlags, vk::PipelineStageFlags2); 14] = [
        (
            vk::ShaderStageFlags::VERTEX,
            vk::PipelineStageFlags2::VERTEX_SHADER,
        ),
        (
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
        ),
        (
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
        ),
        (
            vk::ShaderStageFlags::GEOMETRY,
            vk::PipelineStageFlags2::GEOMETRY_SHADER,
        ),
        (
            vk::ShaderStageFlags::FRAGMENT,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        ),
        (
            vk::ShaderStageFlags::COMPUTE,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
        ),
        (
            vk::ShaderStageFlags::TASK_EXT,
            vk::PipelineStageFlags2::TASK_SHADER_EXT,
        ),
        (
            vk::ShaderStageFlags::MESH_EXT,
            vk::PipelineStageFlags2::MESH_SHADER_EXT,
        ),
        (
            vk::ShaderStageFlags::RAYGEN_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (
            vk::ShaderStageFlags::ANY_HIT_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (
            vk::ShaderStageFlags::MISS_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (
            vk::ShaderStageFlags::INTERSECTION_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (
            vk::ShaderStageFlags::CALLABLE_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
    ];
    TABLE
        .iter()
        .filter(|(shader, _)| stages.intersects(*shader))
        .fold(vk::PipelineStageFlags2::empty(), |acc, (_, pipeline)| {
            acc | *pipeline
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_stages_to_pipeline_stages() {
        assert_eq!(
            shader_stages_to_pipeline_stages(
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
            ),
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
        assert_eq!(
            shader_stages_to_pipeline_stages(vk::ShaderStageFlags::COMPUTE),
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
        assert_eq!(
            shader_stages_to_pipeline_stages(vk::ShaderStageFlags::empty()),
            vk::PipelineStageFlags2::empty()
        );
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::V1_2 < Version::V1_3);
        assert_eq!(Version::V1_3.minor(), 3);
        assert_eq!(format!("{}", Version::V1_2), "1.2.0");
    }
}
