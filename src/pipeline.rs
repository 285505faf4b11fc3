//! Shader modules, pipeline layouts built from reflection, and compute pipelines.
//!
//! # Key Types
//!
//! - [`ShaderStage`]: A shader module together with its reflected interface.
//! - [`PipelineLayout`]: Descriptor set layouts and the push constant range of a set of
//!   stages, plus the merged [`ParameterLayout`] used to bind parameters by name.
//! - [`Pipeline`]: A compiled compute pipeline.
//! - [`PipelineCache`]: Caches compiled pipeline data, optionally persisted to disk.
//! - [`SpecializationInfo`]: Compile-time constants for shader specialization.
//!
//! # Layout Construction
//!
//! Stages are merged with [`merge_stages`]. Bindings declared by several stages must
//! agree exactly; their visibility is the union of the declaring stages, and the push
//! constant range spans the bytes used by any stage.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tephra::{Device, ash::vk, pipeline::*};
//! # let device = Device::create_system_default().unwrap();
//! # let spirv: &[u32] = &[];
//! let stage = ShaderStage::new(device.clone(), spirv, vk::ShaderStageFlags::COMPUTE, "main").unwrap();
//! let layout = Arc::new(PipelineLayout::new(device.clone(), &[&stage], &LayoutInfo::default()).unwrap());
//! let cache = PipelineCache::load(device, "pipeline.cache").unwrap();
//! let pipeline = cache.create_compute_pipeline(layout, &stage).unwrap();
//! ```
//!
//! # Specialization Constants
//!
//! ```
//! # use tephra::pipeline::SpecializationInfo;
//! let mut spec = SpecializationInfo::new();
//! spec.push(0, 16u32); // constant_id 0 = 16
//! spec.push_bool(1, true); // constant_id 1 = VK_TRUE
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    ffi::CString,
    path::Path,
    sync::Arc,
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use crate::{
    Device, Error, HasDevice, Result,
    descriptor::DescriptorSetLayout,
    sampler::Sampler,
    shader::{BindingKind, ParameterLayout, ShaderParameterBinding, ShaderReflection, reflect},
    utils::{AsVkHandle, shader_stages_to_pipeline_stages},
};

/// A compiled compute pipeline.
pub struct Pipeline {
    device: Device,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    workgroup_size: [u32; 3],
}
impl HasDevice for Pipeline {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Pipeline {
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// Threads per workgroup, `[1, 1, 1]` when the shader does not declare a size.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Number of workgroups covering `thread_count` threads.
    pub fn workgroup_count(&self, thread_count: [u32; 3]) -> [u32; 3] {
        std::array::from_fn(|i| thread_count[i].div_ceil(self.workgroup_size[i].max(1)))
    }
}
impl AsVkHandle for Pipeline {
    type Handle = vk::Pipeline;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

/// SPIR-V code loaded into the device.
pub struct ShaderModule {
    device: Device,
    handle: vk::ShaderModule,
}
impl ShaderModule {
    pub fn new(device: Device, code: &[u32]) -> VkResult<Self> {
        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)?
        };
        Ok(Self {
            device,
            handle: module,
        })
    }
}
impl AsVkHandle for ShaderModule {
    type Handle = vk::ShaderModule;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// One entry point of a shader module and its reflected interface.
pub struct ShaderStage {
    pub module: Arc<ShaderModule>,
    pub entry: CString,
    pub reflection: ShaderReflection,
    pub specialization: SpecializationInfo,
}

impl ShaderStage {
    pub fn new(
        device: Device,
        spirv: &[u32],
        stage: vk::ShaderStageFlags,
        entry: &str,
    ) -> Result<Self> {
        let reflection = reflect(spirv, stage, entry)?;
        let entry = CString::new(entry).map_err(|err| Error::Reflection(err.to_string()))?;
        let module = Arc::new(ShaderModule::new(device, spirv)?);
        Ok(Self {
            module,
            entry,
            reflection,
            specialization: SpecializationInfo::new(),
        })
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.reflection.stage
    }

    pub fn parameters(&self) -> &ParameterLayout {
        &self.reflection.layout
    }
}

/// Merges the parameter layouts of several stages into the layout of one pipeline.
///
/// The result does not depend on the order of `stages`. Fails when two stages declare
/// different bindings under the same name or at the same `(set, binding)`.
pub fn merge_stages(stages: &[&ParameterLayout]) -> Result<ParameterLayout> {
    let mut merged = ParameterLayout::default();
    for stage in stages {
        merged.stages |= stage.stages;
        merge_node(&mut merged.root, &stage.root, &mut String::new())?;
        for (&key, &size) in stage.uniform_blocks.iter() {
            let entry = merged.uniform_blocks.entry(key).or_default();
            *entry = (*entry).max(size);
        }
        merged.push_constants = match (merged.push_constants, stage.push_constants) {
            (Some((a_offset, a_size)), Some((b_offset, b_size))) => {
                let begin = a_offset.min(b_offset);
                let end = (a_offset + a_size).max(b_offset + b_size);
                Some((begin, end - begin))
            }
            (a, b) => a.or(b),
        };
    }
    check_slots(&merged)?;
    Ok(merged)
}

fn merge_node(
    dst: &mut ShaderParameterBinding,
    src: &ShaderParameterBinding,
    path: &mut String,
) -> Result<()> {
    for (key, child) in src.children() {
        let len = path.len();
        crate::shader::binding::push_path(path, key);
        match dst.child_mut(key) {
            None => {
                dst.insert(key.clone(), child.clone());
            }
            Some(existing) => {
                merge_kind(&mut existing.kind, &child.kind, path)?;
                existing.stages |= child.stages;
                merge_node(existing, child, path)?;
            }
        }
        path.truncate(len);
    }
    Ok(())
}

fn merge_kind(dst: &mut BindingKind, src: &BindingKind, path: &str) -> Result<()> {
    if matches!(src, BindingKind::Unset) {
        return Ok(());
    }
    if matches!(dst, BindingKind::Unset) {
        *dst = src.clone();
        return Ok(());
    }
    match (dst, src) {
        (BindingKind::Descriptor(a), BindingKind::Descriptor(b))
            if (a.ty, a.set, a.binding, a.array_size) == (b.ty, b.set, b.binding, b.array_size) =>
        {
            a.writable |= b.writable;
            Ok(())
        }
        (a, b) if *a == *b => Ok(()),
        (a, b) => {
            let (set, binding) = slot(a).or(slot(b)).unwrap_or_default();
            Err(Error::InterfaceMismatch {
                name: path.to_owned(),
                set,
                binding,
                reason: format!("{a:?} != {b:?}"),
            })
        }
    }
}

fn slot(kind: &BindingKind) -> Option<(u32, u32)> {
    match kind {
        BindingKind::Descriptor(d) => Some((d.set, d.binding)),
        BindingKind::Constant(c) if !c.push_constant => Some((c.set, c.binding)),
        _ => None,
    }
}

/// Differently named bindings must not claim the same slot with different types.
fn check_slots(layout: &ParameterLayout) -> Result<()> {
    let mut slots: BTreeMap<(u32, u32), (String, vk::DescriptorType, u32)> = BTreeMap::new();
    for &(set, binding) in layout.uniform_blocks.keys() {
        slots.insert(
            (set, binding),
            (String::new(), vk::DescriptorType::UNIFORM_BUFFER, 1),
        );
    }
    let mut result = Ok(());
    layout.root.visit(|path, node| {
        let BindingKind::Descriptor(d) = &node.kind else {
            return;
        };
        if result.is_err() {
            return;
        }
        let expected = slots
            .entry((d.set, d.binding))
            .or_insert_with(|| (path.to_owned(), d.ty, d.array_size));
        // Uniform blocks are registered without a count.
        let compatible = expected.1 == d.ty
            && (expected.2 == d.array_size || expected.0.is_empty() || expected.0 == path);
        if !compatible {
            result = Err(Error::InterfaceMismatch {
                name: path.to_owned(),
                set: d.set,
                binding: d.binding,
                reason: format!(
                    "also declared as `{}` of type {:?} x{}",
                    expected.0, expected.1, expected.2
                ),
            });
        }
    });
    result
}

/// Caller-supplied options applied while building a [`PipelineLayout`], keyed by the
/// dotted name of a descriptor binding.
///
/// Immutable samplers must cover every element of the binding they name.
#[derive(Clone)]
pub struct LayoutInfo<S = Arc<Sampler>> {
    pub binding_flags: HashMap<String, vk::DescriptorBindingFlags>,
    pub immutable_samplers: HashMap<String, Vec<S>>,
    /// Minimum size of the push constant range.
    pub push_constant_size_hint: u32,
}
impl<S> Default for LayoutInfo<S> {
    fn default() -> Self {
        Self {
            binding_flags: HashMap::new(),
            immutable_samplers: HashMap::new(),
            push_constant_size_hint: 0,
        }
    }
}

/// One binding of a descriptor set layout with the options of a [`LayoutInfo`] applied.
#[derive(Clone, Debug)]
pub struct LayoutBinding<'a, S> {
    pub path: String,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
    pub immutable_samplers: &'a [S],
}

/// Resolves the bindings of each set index up to the highest one used.
///
/// Fails with [`Error::InterfaceMismatch`] if the immutable samplers given for a binding
/// do not match its descriptor count. Options naming no descriptor are logged and ignored.
pub fn layout_bindings<'a, S>(
    parameters: &ParameterLayout,
    info: &'a LayoutInfo<S>,
) -> Result<Vec<Vec<LayoutBinding<'a, S>>>> {
    let descriptors = parameters.descriptors();
    let known = |path: &String| descriptors.values().any(|(p, _, _)| p == path);
    for path in info.binding_flags.keys().chain(info.immutable_samplers.keys()) {
        if !known(path) {
            tracing::warn!(parameter = %path, "layout option names no descriptor binding");
        }
    }

    let mut sets: Vec<Vec<LayoutBinding<'a, S>>> =
        (0..parameters.set_count()).map(|_| Vec::new()).collect();
    for (&(set, binding), (path, d, stages)) in descriptors.iter() {
        let count = d.array_size.max(1);
        let immutable_samplers = match info.immutable_samplers.get(path) {
            Some(samplers) if samplers.len() != count as usize => {
                return Err(Error::InterfaceMismatch {
                    name: path.clone(),
                    set,
                    binding,
                    reason: format!(
                        "{} immutable samplers given for {count} descriptors",
                        samplers.len()
                    ),
                });
            }
            Some(samplers) => samplers.as_slice(),
            None => &[],
        };
        sets[set as usize].push(LayoutBinding {
            path: path.clone(),
            binding,
            ty: d.ty,
            count,
            stages: *stages,
            flags: info.binding_flags.get(path).copied().unwrap_or_default(),
            immutable_samplers,
        });
    }
    Ok(sets)
}

/// A pipeline layout and the merged parameter interface of its stages.
pub struct PipelineLayout {
    device: Device,
    handle: vk::PipelineLayout,
    set_layouts: Vec<DescriptorSetLayout>,
    raw_set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_range: Option<vk::PushConstantRange>,
    parameters: ParameterLayout,
    pipeline_stages: vk::PipelineStageFlags2,
    _immutable_samplers: Vec<Arc<Sampler>>,
}

impl PipelineLayout {
    pub fn new(device: Device, stages: &[&ShaderStage], info: &LayoutInfo) -> Result<Self> {
        let layouts: Vec<&ParameterLayout> = stages.iter().map(|s| s.parameters()).collect();
        Self::from_parameters(device, merge_stages(&layouts)?, info)
    }

    /// Builds one descriptor set layout per set index up to the highest one used, then
    /// the pipeline layout.
    pub fn from_parameters(
        device: Device,
        parameters: ParameterLayout,
        info: &LayoutInfo,
    ) -> Result<Self> {
        let mut immutable_samplers = Vec::new();
        let mut set_layouts = Vec::new();
        for entries in layout_bindings(&parameters, info)? {
            let samplers: Vec<Vec<vk::Sampler>> = entries
                .iter()
                .map(|entry| {
                    immutable_samplers.extend(entry.immutable_samplers.iter().cloned());
                    entry.immutable_samplers.iter().map(|s| s.vk_handle()).collect()
                })
                .collect();
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
                .iter()
                .zip(samplers.iter())
                .map(|(entry, samplers)| {
                    let binding = vk::DescriptorSetLayoutBinding::default()
                        .binding(entry.binding)
                        .descriptor_type(entry.ty)
                        .stage_flags(entry.stages);
                    if samplers.is_empty() {
                        binding.descriptor_count(entry.count)
                    } else {
                        binding.immutable_samplers(samplers)
                    }
                })
                .collect();
            let flags: Vec<vk::DescriptorBindingFlags> =
                entries.iter().map(|entry| entry.flags).collect();
            let flags: &[vk::DescriptorBindingFlags] =
                if flags.iter().all(|flags| flags.is_empty()) {
                    &[]
                } else {
                    &flags
                };
            set_layouts.push(DescriptorSetLayout::new(
                device.clone(),
                &bindings,
                flags,
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?);
        }

        let push_constant_range = parameters.push_constants.map(|(offset, size)| {
            let size = size.max(info.push_constant_size_hint).next_multiple_of(4);
            vk::PushConstantRange {
                stage_flags: parameters.stages,
                offset,
                size,
            }
        });
        let raw_set_layouts: Vec<_> = set_layouts.iter().map(|l| l.vk_handle()).collect();
        let handle = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&raw_set_layouts)
                    .push_constant_ranges(push_constant_range.as_slice()),
                None,
            )?
        };
        Ok(Self {
            pipeline_stages: shader_stages_to_pipeline_stages(parameters.stages),
            device,
            handle,
            set_layouts,
            raw_set_layouts,
            push_constant_range,
            parameters,
            _immutable_samplers: immutable_samplers,
        })
    }

    pub fn parameters(&self) -> &ParameterLayout {
        &self.parameters
    }

    pub fn set_layouts(&self) -> &[DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn raw_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.raw_set_layouts
    }

    pub fn push_constant_range(&self) -> Option<vk::PushConstantRange> {
        self.push_constant_range
    }

    /// Union of the stages of the pipeline.
    pub fn stages(&self) -> vk::ShaderStageFlags {
        self.parameters.stages
    }

    /// Pipeline stages at which bound resources are accessed.
    pub fn pipeline_stages(&self) -> vk::PipelineStageFlags2 {
        self.pipeline_stages
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        if self.parameters.stages == vk::ShaderStageFlags::COMPUTE {
            vk::PipelineBindPoint::COMPUTE
        } else {
            vk::PipelineBindPoint::GRAPHICS
        }
    }
}
impl AsVkHandle for PipelineLayout {
    type Handle = vk::PipelineLayout;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for PipelineLayout {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

/// A cache for compiled pipeline data.
///
/// The cache data can be persisted with [`store`](Self::store) and reloaded with
/// [`load`](Self::load). A null cache ([`null`](Self::null)) performs no caching.
pub struct PipelineCache {
    device: Device,

    /// May be null.
    handle: vk::PipelineCache,
}
impl Drop for PipelineCache {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                self.device.destroy_pipeline_cache(self.handle, None);
            }
        }
    }
}
impl HasDevice for PipelineCache {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for PipelineCache {
    type Handle = vk::PipelineCache;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl PipelineCache {
    pub fn null(device: Device) -> Self {
        Self {
            device,
            handle: vk::PipelineCache::null(),
        }
    }

    pub fn empty(device: Device) -> VkResult<Self> {
        Self::from_initial_data(device, &[])
    }

    /// Creates a pipeline cache from data previously returned by [`get_data`](Self::get_data).
    pub fn from_initial_data(device: Device, initial_data: &[u8]) -> VkResult<Self> {
        let handle = unsafe {
            device.create_pipeline_cache(
                &vk::PipelineCacheCreateInfo::default().initial_data(initial_data),
                None,
            )
        }?;
        Ok(Self { device, handle })
    }

    /// Loads the cache stored at `path`. A missing or rejected file is logged and an
    /// empty cache is returned instead.
    pub fn load(device: Device, path: impl AsRef<Path>) -> VkResult<Self> {
        let path = path.as_ref();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to read pipeline cache");
                return Self::empty(device);
            }
        };
        match Self::from_initial_data(device.clone(), &data) {
            Ok(cache) => Ok(cache),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "pipeline cache rejected");
                Self::empty(device)
            }
        }
    }

    /// Writes the cache data to `path`.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.get_data()?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Combine the data stores of pipeline caches
    pub fn merge(&mut self, other: &Self) -> VkResult<()> {
        if self.handle.is_null() || other.handle.is_null() {
            return Ok(());
        }
        assert_eq!(self.device, other.device);
        unsafe {
            self.device
                .merge_pipeline_caches(self.handle, &[other.handle])
        }
    }

    pub fn get_data(&self) -> VkResult<Vec<u8>> {
        if self.handle.is_null() {
            return Ok(Vec::new());
        }
        unsafe { self.device.get_pipeline_cache_data(self.handle) }
    }

    pub fn create_compute_pipeline(
        &self,
        layout: Arc<PipelineLayout>,
        stage: &ShaderStage,
    ) -> VkResult<Pipeline> {
        let specialization_info = stage.specialization.raw_specialization_info();
        let create_info = vk::ComputePipelineCreateInfo::default()
            .layout(layout.vk_handle())
            .stage(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(stage.module.vk_handle())
                    .name(&stage.entry)
                    .specialization_info(&specialization_info),
            );
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(self.handle, &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        let handle = pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        Ok(Pipeline {
            device: self.device.clone(),
            handle,
            layout,
            workgroup_size: stage.reflection.workgroup_size.unwrap_or([1, 1, 1]),
        })
    }
}

/// Specialization constants for shader compilation.
#[derive(Clone, Default, Debug)]
pub struct SpecializationInfo {
    data: Vec<u8>,
    entries: Vec<vk::SpecializationMapEntry>,
}
impl SpecializationInfo {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn entries(&self) -> &[vk::SpecializationMapEntry] {
        &self.entries
    }

    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn push<T: bytemuck::Pod>(&mut self, constant_id: u32, item: T) {
        let bytes = bytemuck::bytes_of(&item);
        self.entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: self.data.len() as u32,
            size: bytes.len(),
        });
        self.data.extend_from_slice(bytes);
    }

    /// Booleans are `VkBool32` in SPIR-V.
    pub fn push_bool(&mut self, constant_id: u32, item: bool) {
        self.push::<vk::Bool32>(constant_id, if item { vk::TRUE } else { vk::FALSE });
    }

    pub fn raw_specialization_info(&self) -> vk::SpecializationInfo<'_> {
        vk::SpecializationInfo::default()
            .map_entries(&self.entries)
            .data(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::reflect;

    const VERTEX: &[u32] = inline_spirv::inline_spirv!(
        r#"
        #version 450
        layout(set = 0, binding = 0) uniform Camera { mat4 view_proj; } camera;
        layout(set = 0, binding = 1) uniform sampler2D albedo;
        layout(push_constant) uniform Push { mat4 model; } push;
        layout(location = 0) in vec3 position;
        void main() {
            vec3 offset = textureLod(albedo, vec2(0.0), 0.0).xyz;
            gl_Position = camera.view_proj * push.model * vec4(position + offset, 1.0);
        }
        "#,
        vert
    );

    const FRAGMENT: &[u32] = inline_spirv::inline_spirv!(
        r#"
        #version 450
        layout(set = 0, binding = 1) uniform sampler2D albedo;
        layout(set = 1, binding = 0) uniform Material { vec4 tint; } material;
        layout(push_constant) uniform Push { layout(offset = 64) vec4 color; } push;
        layout(location = 0) out vec4 out_color;
        void main() {
            out_color = texture(albedo, vec2(0.5)) * material.tint * push.color;
        }
        "#,
        frag
    );

    const FRAGMENT_ARRAY: &[u32] = inline_spirv::inline_spirv!(
        r#"
        #version 450
        layout(set = 0, binding = 1) uniform sampler2D albedo[2];
        layout(location = 0) out vec4 out_color;
        void main() {
            out_color = texture(albedo[0], vec2(0.5)) + texture(albedo[1], vec2(0.5));
        }
        "#,
        frag
    );

    const FRAGMENT_ALIASED: &[u32] = inline_spirv::inline_spirv!(
        r#"
        #version 450
        layout(set = 0, binding = 0) buffer Other { vec4 values[]; } other;
        layout(location = 0) out vec4 out_color;
        void main() {
            out_color = other.values[0];
        }
        "#,
        frag
    );

    fn layout(spirv: &[u32], stage: vk::ShaderStageFlags) -> ParameterLayout {
        reflect(spirv, stage, "main").unwrap().layout
    }

    #[test]
    fn test_merge_is_order_independent() {
        let vertex = layout(VERTEX, vk::ShaderStageFlags::VERTEX);
        let fragment = layout(FRAGMENT, vk::ShaderStageFlags::FRAGMENT);
        let a = merge_stages(&[&vertex, &fragment]).unwrap();
        let b = merge_stages(&[&fragment, &vertex]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.descriptors(), b.descriptors());

        assert_eq!(
            a.stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        let albedo = a.root.find("albedo").unwrap();
        assert_eq!(
            albedo.stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            a.root.find("camera").unwrap().stages,
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            a.root.find("material").unwrap().stages,
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(a.push_constants, Some((0, 80)));
        assert_eq!(a.set_count(), 2);
    }

    #[test]
    fn test_layout_options_by_name() {
        let vertex = layout(VERTEX, vk::ShaderStageFlags::VERTEX);
        let fragment = layout(FRAGMENT, vk::ShaderStageFlags::FRAGMENT);
        let merged = merge_stages(&[&vertex, &fragment]).unwrap();

        let mut info = LayoutInfo::<u32>::default();
        info.binding_flags.insert(
            "material".to_owned(),
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        info.immutable_samplers.insert("albedo".to_owned(), vec![7]);
        info.binding_flags.insert(
            "shadow_map".to_owned(),
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
        );
        let sets = layout_bindings(&merged, &info).unwrap();
        assert_eq!(sets.len(), 2);

        let albedo = sets[0].iter().find(|b| b.binding == 1).unwrap();
        assert_eq!(albedo.path, "albedo");
        assert_eq!(albedo.immutable_samplers, &[7]);
        assert!(albedo.flags.is_empty());
        assert_eq!(
            albedo.stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        let camera = sets[0].iter().find(|b| b.binding == 0).unwrap();
        assert!(camera.immutable_samplers.is_empty());

        let material = &sets[1][0];
        assert_eq!(material.path, "material");
        assert_eq!(material.flags, vk::DescriptorBindingFlags::PARTIALLY_BOUND);
    }

    #[test]
    fn test_immutable_samplers_cover_every_element() {
        let fragment = layout(FRAGMENT_ARRAY, vk::ShaderStageFlags::FRAGMENT);
        let mut info = LayoutInfo::<u32>::default();
        info.immutable_samplers.insert("albedo".to_owned(), vec![1]);
        match layout_bindings(&fragment, &info) {
            Err(Error::InterfaceMismatch {
                name, set, binding, ..
            }) => {
                assert_eq!(name, "albedo");
                assert_eq!((set, binding), (0, 1));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        info.immutable_samplers.insert("albedo".to_owned(), vec![1, 2]);
        let sets = layout_bindings(&fragment, &info).unwrap();
        assert_eq!(sets[0][0].count, 2);
        assert_eq!(sets[0][0].immutable_samplers, &[1, 2]);
    }

    #[test]
    fn test_merge_rejects_count_mismatch() {
        let vertex = layout(VERTEX, vk::ShaderStageFlags::VERTEX);
        let fragment = layout(FRAGMENT_ARRAY, vk::ShaderStageFlags::FRAGMENT);
        match merge_stages(&[&vertex, &fragment]) {
            Err(Error::InterfaceMismatch {
                name, set, binding, ..
            }) => {
                assert_eq!(name, "albedo");
                assert_eq!((set, binding), (0, 1));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_rejects_aliased_slot() {
        let vertex = layout(VERTEX, vk::ShaderStageFlags::VERTEX);
        let fragment = layout(FRAGMENT_ALIASED, vk::ShaderStageFlags::FRAGMENT);
        for stages in [[&vertex, &fragment], [&fragment, &vertex]] {
            assert!(matches!(
                merge_stages(&stages),
                Err(Error::InterfaceMismatch { set: 0, binding: 0, .. })
            ));
        }
    }

    #[test]
    fn test_specialization_info() {
        let mut spec = SpecializationInfo::new();
        spec.push(0, 16u32);
        spec.push_bool(1, true);
        spec.push(2, 0.5f32);
        assert_eq!(spec.entries().len(), 3);
        assert_eq!(spec.entries()[1].offset, 4);
        assert_eq!(spec.entries()[2].size, 4);
        assert_eq!(&spec.data()[4..8], vk::TRUE.to_ne_bytes());
    }
}
