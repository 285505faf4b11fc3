//! SPIR-V reflection into [`ParameterLayout`]s.
use ash::vk;
use spirq::{
    ReflectConfig,
    constant::ConstantValue,
    func::ExecutionMode,
    spirv,
    ty::{AccessType, DescriptorType, StructType, Type},
    var::Variable,
};

use super::binding::{
    BindingKind, ConstantBinding, DescriptorBinding, ParameterLayout, ShaderParameterBinding,
    StructBinding, VertexAttributeBinding,
};
use crate::{Error, Result};

/// Reflected interface of one entry point.
#[derive(Clone, Debug)]
pub struct ShaderReflection {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
    pub layout: ParameterLayout,
    /// Workgroup size of compute entry points, with specialization constants at their
    /// default values.
    pub workgroup_size: Option<[u32; 3]>,
}

/// Reflects the entry point `entry_point` of a SPIR-V module, which runs at `stage`.
///
/// Named uniform blocks become a descriptor node whose members are its children.
/// Members of anonymous uniform blocks and of push constant blocks are placed directly
/// under the root.
pub fn reflect(
    spirv: &[u32],
    stage: vk::ShaderStageFlags,
    entry_point: &str,
) -> Result<ShaderReflection> {
    let entry_points = ReflectConfig::new()
        .spv(spirv)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|err| Error::Reflection(err.to_string()))?;
    let entry = entry_points
        .iter()
        .find(|entry| entry.name == entry_point)
        .ok_or_else(|| Error::Reflection(format!("no entry point named {entry_point}")))?;

    let mut builder = LayoutBuilder {
        stage,
        layout: ParameterLayout {
            stages: stage,
            ..Default::default()
        },
    };
    for var in entry.vars.iter() {
        match var {
            Variable::Descriptor {
                name,
                desc_bind,
                desc_ty,
                ty,
                nbind,
                ..
            } => builder.add_descriptor(
                name.as_deref(),
                desc_bind.set(),
                desc_bind.bind(),
                desc_ty,
                ty,
                *nbind,
            ),
            Variable::PushConstant { ty, .. } => builder.add_push_constants(ty),
            Variable::Input { name, location, .. } if stage == vk::ShaderStageFlags::VERTEX => {
                if let Some(name) = name {
                    builder.add_vertex_input(name, location.loc());
                }
            }
            _ => {}
        }
    }

    Ok(ShaderReflection {
        stage,
        entry_point: entry_point.to_owned(),
        layout: builder.layout,
        workgroup_size: workgroup_size(&entry.exec_modes),
    })
}

struct LayoutBuilder {
    stage: vk::ShaderStageFlags,
    layout: ParameterLayout,
}

impl LayoutBuilder {
    fn node(&self, kind: BindingKind) -> ShaderParameterBinding {
        ShaderParameterBinding::new(kind, self.stage)
    }

    fn add_descriptor(
        &mut self,
        name: Option<&str>,
        set: u32,
        binding: u32,
        desc_ty: &DescriptorType,
        ty: &Type,
        nbind: u32,
    ) {
        let (vk_ty, writable) = match desc_ty {
            DescriptorType::Sampler() => (vk::DescriptorType::SAMPLER, false),
            DescriptorType::CombinedImageSampler() => {
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, false)
            }
            DescriptorType::SampledImage() => (vk::DescriptorType::SAMPLED_IMAGE, false),
            DescriptorType::StorageImage(access) => {
                (vk::DescriptorType::STORAGE_IMAGE, is_writable(access))
            }
            DescriptorType::UniformTexelBuffer() => {
                (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, false)
            }
            DescriptorType::StorageTexelBuffer(access) => {
                (vk::DescriptorType::STORAGE_TEXEL_BUFFER, is_writable(access))
            }
            DescriptorType::UniformBuffer() => (vk::DescriptorType::UNIFORM_BUFFER, false),
            DescriptorType::StorageBuffer(access) => {
                (vk::DescriptorType::STORAGE_BUFFER, is_writable(access))
            }
            DescriptorType::InputAttachment(_) => (vk::DescriptorType::INPUT_ATTACHMENT, false),
            DescriptorType::AccelStruct() => {
                (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, false)
            }
            #[allow(unreachable_patterns)]
            other => {
                tracing::warn!(?other, set, binding, "unsupported descriptor type");
                return;
            }
        };

        let block = match ty {
            Type::Struct(st) => Some(st),
            _ => None,
        };
        let name = name.filter(|name| !name.is_empty());

        if vk_ty == vk::DescriptorType::UNIFORM_BUFFER {
            let size = ty.nbyte().unwrap_or(0) as u32;
            self.layout.uniform_blocks.insert((set, binding), size);
            if name.is_none() {
                if let Some(st) = block {
                    let stage = self.stage;
                    let root = &mut self.layout.root;
                    add_members(root, st, 0, set, binding, false, stage);
                }
                return;
            }
        }

        let Some(key) = name
            .map(str::to_owned)
            .or_else(|| block.and_then(|st| st.name.clone()))
        else {
            tracing::warn!(set, binding, "skipping unnamed descriptor");
            return;
        };
        let mut node = self.node(BindingKind::Descriptor(DescriptorBinding {
            ty: vk_ty,
            set,
            binding,
            array_size: nbind,
            writable,
        }));
        if vk_ty == vk::DescriptorType::UNIFORM_BUFFER
            && let Some(st) = block
        {
            add_members(&mut node, st, 0, set, binding, false, self.stage);
        }
        self.layout.root.insert(key, node);
    }

    fn add_push_constants(&mut self, ty: &Type) {
        let Type::Struct(st) = ty else {
            return;
        };
        let begin = st
            .members
            .iter()
            .filter_map(|member| member.offset)
            .min()
            .unwrap_or(0) as u32;
        let end = ty.nbyte().unwrap_or(0) as u32;
        if end > begin {
            self.layout.push_constants = Some((begin, end - begin));
        }
        let stage = self.stage;
        add_members(&mut self.layout.root, st, 0, 0, 0, true, stage);
    }

    fn add_vertex_input(&mut self, name: &str, location: u32) {
        let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
        let semantic_index = name[trimmed.len()..].parse().unwrap_or(0);
        let node = self.node(BindingKind::VertexAttribute(VertexAttributeBinding {
            location,
            semantic: trimmed.to_ascii_uppercase(),
            semantic_index,
        }));
        self.layout.root.insert(name, node);
    }
}

fn is_writable(access: &AccessType) -> bool {
    !matches!(access, AccessType::ReadOnly)
}

fn add_members(
    parent: &mut ShaderParameterBinding,
    st: &StructType,
    base_offset: u32,
    set: u32,
    binding: u32,
    push_constant: bool,
    stage: vk::ShaderStageFlags,
) {
    for member in st.members.iter() {
        let Some(name) = member.name.as_deref() else {
            continue;
        };
        let offset = base_offset + member.offset.unwrap_or(0) as u32;
        let type_size = member.ty.nbyte().unwrap_or(0) as u32;
        let constant = |array_size, array_stride| ConstantBinding {
            offset,
            type_size,
            set,
            binding,
            array_size,
            array_stride,
            push_constant,
        };
        let node = match &member.ty {
            Type::Array(arr) => {
                let array_size = arr.nelement.unwrap_or(0);
                let stride = arr.stride.unwrap_or(0) as u32;
                match &*arr.element_ty {
                    Type::Struct(element) => {
                        let mut node = ShaderParameterBinding::new(
                            BindingKind::Struct(StructBinding {
                                array_size,
                                descriptor_stride: 0,
                                uniform_stride: stride,
                            }),
                            stage,
                        );
                        add_members(&mut node, element, offset, set, binding, push_constant, stage);
                        node
                    }
                    _ => ShaderParameterBinding::new(
                        BindingKind::Constant(constant(array_size, stride)),
                        stage,
                    ),
                }
            }
            Type::Struct(inner) => {
                let mut node =
                    ShaderParameterBinding::new(BindingKind::Constant(constant(1, 0)), stage);
                add_members(&mut node, inner, offset, set, binding, push_constant, stage);
                node
            }
            _ => ShaderParameterBinding::new(BindingKind::Constant(constant(1, 0)), stage),
        };
        parent.insert(name, node);
    }
}

/// Reads the `LocalSize` or `LocalSizeId` execution mode of an entry point.
pub fn workgroup_size(exec_modes: &[ExecutionMode]) -> Option<[u32; 3]> {
    let mode = exec_modes.iter().find(|mode| {
        matches!(
            mode.exec_mode,
            spirv::ExecutionMode::LocalSize | spirv::ExecutionMode::LocalSizeId
        )
    })?;
    let [x, y, z] = mode.operands.as_slice() else {
        return None;
    };
    Some([as_u32(&x.value)?, as_u32(&y.value)?, as_u32(&z.value)?])
}

fn as_u32(value: &ConstantValue) -> Option<u32> {
    match value {
        ConstantValue::U32(x) => Some(*x),
        ConstantValue::S32(x) => u32::try_from(*x).ok(),
        ConstantValue::Typeless(bytes) => <[u8; 4]>::try_from(&bytes[..]).ok().map(u32::from_le_bytes),
        _ => None,
    }
}
