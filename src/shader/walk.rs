//! Matching a [`ShaderParameter`] tree against a pipeline's [`ParameterLayout`].
//!
//! [`collect_writes`] walks both trees in lock-step and produces a [`ParameterWrites`]
//! plan: descriptor writes, uniform block contents and push constant ranges. Recording
//! barriers, uploading bytes and updating descriptor sets is left to the command context.
//!
//! Mismatched assignments are logged with the dotted path of the parameter and skipped.
use std::{collections::BTreeMap, sync::Arc};

use ash::vk;

use super::{
    binding::{
        BindingKind, ConstantBinding, DescriptorBinding, ParameterKey, ParameterLayout,
        ShaderParameterBinding, push_path,
    },
    parameter::{ParameterValue, ShaderParameter},
};
use crate::{
    buffer::{BufferView, TexelBufferView},
    image::ImageView,
    sampler::Sampler,
};

/// What a single descriptor write refers to.
#[derive(Clone, Debug)]
pub enum DescriptorResource {
    Buffer(BufferView),
    TexelBuffer(Arc<TexelBufferView>),
    Image {
        view: ImageView,
        layout: vk::ImageLayout,
        sampler: Option<Arc<Sampler>>,
    },
    Sampler(Arc<Sampler>),
    AccelerationStructure {
        handle: vk::AccelerationStructureKHR,
        storage: BufferView,
    },
    /// Bytes to place in a transient buffer bound at this slot.
    Data(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct DescriptorWrite {
    pub set: u32,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub writable: bool,
    pub resource: DescriptorResource,
}

#[derive(Clone, Debug, Default)]
pub struct ParameterWrites {
    pub descriptors: Vec<DescriptorWrite>,
    /// Contents of each uniform block, keyed by `(set, binding, array element)`, padded to
    /// the declared block size.
    pub uniform_data: BTreeMap<(u32, u32, u32), Vec<u8>>,
    /// Non-overlapping `(offset, bytes)` ranges sorted by offset.
    pub push_constants: Vec<(u32, Vec<u8>)>,
    /// Number of assignments that were skipped.
    pub dropped: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Cursor {
    constant_offset: u32,
    binding_offset: u32,
    array_index: Option<u32>,
    /// Element of the uniform block array the constants below belong to.
    block_element: u32,
}

/// Resolves every assigned value of `params` against `layout`.
pub fn collect_writes(params: &ShaderParameter, layout: &ParameterLayout) -> ParameterWrites {
    let mut walker = Walker {
        out: ParameterWrites::default(),
        path: String::new(),
    };
    walker.walk_children(params, &layout.root, Cursor::default());

    let mut out = walker.out;
    for (&(set, binding, _), data) in out.uniform_data.iter_mut() {
        if let Some(&size) = layout.uniform_blocks.get(&(set, binding))
            && data.len() < size as usize
        {
            data.resize(size as usize, 0);
        }
    }
    out.push_constants = coalesce_ranges(std::mem::take(&mut out.push_constants));
    out
}

struct Walker {
    out: ParameterWrites,
    path: String,
}

impl Walker {
    fn walk_children(
        &mut self,
        value: &ShaderParameter,
        binding: &ShaderParameterBinding,
        cursor: Cursor,
    ) {
        for (key, child) in value.children() {
            let len = self.path.len();
            push_path(&mut self.path, key);
            if let Some(child_binding) = binding.child(key) {
                let cursor = Cursor {
                    array_index: None,
                    ..cursor
                };
                self.visit(child, child_binding, cursor);
            } else if let ParameterKey::Index(index) = *key {
                // Elements of an array share the binding of the array itself.
                match binding.kind.array_size() {
                    Some(size) if size == 0 || index < size => {
                        let cursor = Cursor {
                            array_index: Some(index),
                            ..cursor
                        };
                        self.visit(child, binding, cursor);
                    }
                    Some(size) => {
                        tracing::warn!(parameter = %self.path, size, "array index out of bounds");
                        self.out.dropped += 1;
                    }
                    None => {
                        tracing::warn!(parameter = %self.path, "indexed parameter is not an array");
                        self.out.dropped += 1;
                    }
                }
            } else if !child.is_empty() {
                tracing::warn!(parameter = %self.path, "no shader parameter with this name");
                self.out.dropped += 1;
            }
            self.path.truncate(len);
        }
    }

    fn visit(&mut self, value: &ShaderParameter, binding: &ShaderParameterBinding, mut cursor: Cursor) {
        if let BindingKind::Descriptor(d) = &binding.kind
            && d.ty == vk::DescriptorType::UNIFORM_BUFFER
        {
            cursor.block_element = cursor.array_index.unwrap_or(0);
        }
        match (value.value(), &binding.kind) {
            (None, BindingKind::Struct(s)) => {
                if let Some(index) = cursor.array_index {
                    let offsets = element_offset(cursor.constant_offset, index, s.uniform_stride)
                        .zip(element_offset(cursor.binding_offset, index, s.descriptor_stride));
                    let Some((constant_offset, binding_offset)) = offsets else {
                        self.overflow(index);
                        return;
                    };
                    cursor.constant_offset = constant_offset;
                    cursor.binding_offset = binding_offset;
                }
            }
            (None, _) => {}
            (Some(ParameterValue::Constant(bytes)), BindingKind::Constant(c)) => {
                self.write_constant(bytes, c, cursor);
            }
            (Some(ParameterValue::Constant(bytes)), BindingKind::Descriptor(d))
                if matches!(
                    d.ty,
                    vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER
                ) =>
            {
                self.write_descriptor(d, cursor, DescriptorResource::Data(bytes.to_vec()));
            }
            (Some(value), BindingKind::Descriptor(d)) => match descriptor_resource(value, d.ty) {
                Some(resource) => self.write_descriptor(d, cursor, resource),
                None => self.mismatch(value, &binding.kind),
            },
            (Some(value), kind) => self.mismatch(value, kind),
        }
        cursor.array_index = None;
        self.walk_children(value, binding, cursor);
    }

    fn write_constant(&mut self, bytes: &[u8], c: &ConstantBinding, cursor: Cursor) {
        let index = cursor.array_index.unwrap_or(0);
        let Some(offset) = c
            .offset
            .checked_add(cursor.constant_offset)
            .and_then(|base| element_offset(base, index, c.array_stride))
            .filter(|offset| offset.checked_add(bytes.len() as u32).is_some())
        else {
            self.overflow(index);
            return;
        };
        let declared = match cursor.array_index {
            Some(_) if c.array_stride > 0 => c.array_stride,
            _ => c.type_size,
        };
        if declared > 0 && bytes.len() > declared as usize {
            tracing::warn!(
                parameter = %self.path,
                size = bytes.len(),
                declared,
                "value is larger than the shader parameter"
            );
        }
        if c.push_constant {
            self.out.push_constants.push((offset, bytes.to_vec()));
        } else {
            let key = (c.set, c.binding, cursor.block_element);
            let data = self.out.uniform_data.entry(key).or_default();
            let begin = offset as usize;
            let end = begin + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[begin..end].copy_from_slice(bytes);
        }
    }

    fn write_descriptor(
        &mut self,
        d: &DescriptorBinding,
        cursor: Cursor,
        resource: DescriptorResource,
    ) {
        let Some(binding) = d.binding.checked_add(cursor.binding_offset) else {
            self.overflow(cursor.array_index.unwrap_or(0));
            return;
        };
        self.out.descriptors.push(DescriptorWrite {
            set: d.set,
            binding,
            array_element: cursor.array_index.unwrap_or(0),
            ty: d.ty,
            writable: d.writable,
            resource,
        });
    }

    fn overflow(&mut self, index: u32) {
        tracing::warn!(parameter = %self.path, index, "array element offset overflows");
        self.out.dropped += 1;
    }

    fn mismatch(&mut self, value: &ParameterValue, kind: &BindingKind) {
        tracing::warn!(
            parameter = %self.path,
            value = value.kind_name(),
            binding = ?kind,
            "shader parameter assigned a value of the wrong kind"
        );
        self.out.dropped += 1;
    }
}

/// `base + index * stride`, or `None` on overflow.
fn element_offset(base: u32, index: u32, stride: u32) -> Option<u32> {
    index.checked_mul(stride)?.checked_add(base)
}

/// Layout an image bound to a descriptor of type `ty` is used in, unless the caller
/// asked for another one.
pub fn default_image_layout(ty: vk::DescriptorType) -> vk::ImageLayout {
    match ty {
        vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

fn descriptor_resource(value: &ParameterValue, ty: vk::DescriptorType) -> Option<DescriptorResource> {
    use vk::DescriptorType as T;
    let resource = match (value, ty) {
        (
            ParameterValue::Buffer(view),
            T::UNIFORM_BUFFER | T::STORAGE_BUFFER | T::UNIFORM_BUFFER_DYNAMIC | T::STORAGE_BUFFER_DYNAMIC,
        ) => DescriptorResource::Buffer(view.clone()),
        (ParameterValue::TexelBuffer(view), T::UNIFORM_TEXEL_BUFFER | T::STORAGE_TEXEL_BUFFER) => {
            DescriptorResource::TexelBuffer(view.clone())
        }
        (
            ParameterValue::Image(image),
            T::SAMPLED_IMAGE | T::STORAGE_IMAGE | T::COMBINED_IMAGE_SAMPLER | T::INPUT_ATTACHMENT,
        ) => DescriptorResource::Image {
            view: image.view.clone(),
            layout: image.layout.unwrap_or(default_image_layout(ty)),
            sampler: image.sampler.clone(),
        },
        (ParameterValue::Sampler(sampler), T::SAMPLER) => {
            DescriptorResource::Sampler(sampler.clone())
        }
        (ParameterValue::AccelerationStructure(accel), T::ACCELERATION_STRUCTURE_KHR) => {
            DescriptorResource::AccelerationStructure {
                handle: accel.handle,
                storage: accel.storage.clone(),
            }
        }
        _ => return None,
    };
    Some(resource)
}

/// Merges overlapping or touching `(offset, bytes)` ranges. Where ranges overlap, the one
/// with the higher offset wins; among equal offsets, the later one.
pub fn coalesce_ranges(mut ranges: Vec<(u32, Vec<u8>)>) -> Vec<(u32, Vec<u8>)> {
    ranges.sort_by_key(|(offset, _)| *offset);
    let mut merged: Vec<(u32, Vec<u8>)> = Vec::with_capacity(ranges.len());
    for (offset, bytes) in ranges {
        if let Some((last_offset, last)) = merged.last_mut()
            && offset as usize <= *last_offset as usize + last.len()
        {
            let begin = (offset - *last_offset) as usize;
            let end = begin + bytes.len();
            if last.len() < end {
                last.resize(end, 0);
            }
            last[begin..end].copy_from_slice(&bytes);
            continue;
        }
        merged.push((offset, bytes));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::binding::StructBinding;

    fn node(kind: BindingKind) -> ShaderParameterBinding {
        ShaderParameterBinding::new(kind, vk::ShaderStageFlags::COMPUTE)
    }

    fn constant(offset: u32, type_size: u32, push_constant: bool) -> ConstantBinding {
        ConstantBinding {
            offset,
            type_size,
            set: 0,
            binding: 0,
            array_size: 1,
            array_stride: 0,
            push_constant,
        }
    }

    fn descriptor(ty: vk::DescriptorType, binding: u32, array_size: u32) -> BindingKind {
        BindingKind::Descriptor(DescriptorBinding {
            ty,
            set: 1,
            binding,
            array_size,
            writable: ty == vk::DescriptorType::STORAGE_BUFFER,
        })
    }

    /// `uniform Params { float scale; float offset; Light lights[4]; float weights[3]; }`
    /// at set 0 binding 0, a push constant `frame`, and some descriptors in set 1.
    fn layout() -> ParameterLayout {
        let mut root = ShaderParameterBinding::default();
        let params = root.entry("params");
        params.kind = descriptor(vk::DescriptorType::UNIFORM_BUFFER, 0, 1);
        if let BindingKind::Descriptor(d) = &mut params.kind {
            d.set = 0;
        }
        params.insert("scale", node(BindingKind::Constant(constant(0, 4, false))));
        params.insert("offset", node(BindingKind::Constant(constant(4, 4, false))));
        let lights = params.entry("lights");
        lights.kind = BindingKind::Struct(StructBinding {
            array_size: 4,
            descriptor_stride: 0,
            uniform_stride: 32,
        });
        lights.insert("color", node(BindingKind::Constant(constant(16, 16, false))));
        lights.insert("intensity", node(BindingKind::Constant(constant(32, 4, false))));
        params.insert(
            "weights",
            node(BindingKind::Constant(ConstantBinding {
                array_size: 3,
                array_stride: 16,
                ..constant(144, 48, false)
            })),
        );

        root.insert("frame", node(BindingKind::Constant(constant(0, 4, true))));
        root.insert("jitter", node(BindingKind::Constant(constant(8, 8, true))));
        root.insert(
            "buffers",
            node(descriptor(vk::DescriptorType::STORAGE_BUFFER, 1, 8)),
        );
        root.insert(
            "linear",
            node(descriptor(vk::DescriptorType::SAMPLER, 2, 1)),
        );

        ParameterLayout {
            root,
            uniform_blocks: [((0, 0), 192)].into_iter().collect(),
            push_constants: Some((0, 16)),
            stages: vk::ShaderStageFlags::COMPUTE,
        }
    }

    #[test]
    fn test_uniform_constants() {
        let mut params = ShaderParameter::new();
        params["params"]["scale"].set(2.0f32);
        params["params"]["offset"].set(0.5f32);
        let writes = collect_writes(&params, &layout());

        assert_eq!(writes.dropped, 0);
        assert!(writes.descriptors.is_empty());
        let data = &writes.uniform_data[&(0, 0, 0)];
        assert_eq!(data.len(), 192);
        assert_eq!(&data[0..4], 2.0f32.to_ne_bytes());
        assert_eq!(&data[4..8], 0.5f32.to_ne_bytes());
    }

    #[test]
    fn test_struct_array_element() {
        let mut params = ShaderParameter::new();
        params["params"]["lights"][2u32]["intensity"].set(3.0f32);
        let writes = collect_writes(&params, &layout());
        let data = &writes.uniform_data[&(0, 0, 0)];
        assert_eq!(&data[96..100], 3.0f32.to_ne_bytes());
        assert!(data[..96].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scalar_array_element() {
        let mut params = ShaderParameter::new();
        params["params"]["weights"][1u32].set(7u32);
        let writes = collect_writes(&params, &layout());
        let data = &writes.uniform_data[&(0, 0, 0)];
        assert_eq!(&data[160..164], 7u32.to_ne_bytes());
    }

    #[test]
    fn test_out_of_bounds_index_is_skipped() {
        let mut params = ShaderParameter::new();
        params["params"]["lights"][4u32]["intensity"].set(1.0f32);
        params["params"]["weights"][3u32].set(1.0f32);
        let writes = collect_writes(&params, &layout());
        assert_eq!(writes.dropped, 2);
        assert!(writes.uniform_data.is_empty());
    }

    #[test]
    fn test_push_constants_are_coalesced() {
        let mut params = ShaderParameter::new();
        params["frame"].set(9u32);
        params["jitter"].set(glam::Vec2::new(0.25, 0.75));
        let writes = collect_writes(&params, &layout());
        assert!(writes.uniform_data.is_empty());
        // The gap between `frame` and `jitter` keeps them in separate ranges.
        assert_eq!(writes.push_constants.len(), 2);
        assert_eq!(writes.push_constants[0], (0, 9u32.to_ne_bytes().to_vec()));
        assert_eq!(writes.push_constants[1].0, 8);

        params["frame"].set(glam::UVec2::new(9, 10));
        let writes = collect_writes(&params, &layout());
        assert_eq!(writes.push_constants.len(), 1);
        let (offset, bytes) = &writes.push_constants[0];
        assert_eq!(*offset, 0);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], 10u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], 0.25f32.to_ne_bytes());
    }

    #[test]
    fn test_constant_as_storage_buffer_array() {
        let mut params = ShaderParameter::new();
        for i in 0..3u32 {
            params["buffers"][i].set(ParameterValue::constant_slice(&[i; 4]));
        }
        let writes = collect_writes(&params, &layout());
        let elements: Vec<u32> = writes
            .descriptors
            .iter()
            .map(|write| {
                assert_eq!((write.set, write.binding), (1, 1));
                assert_eq!(write.ty, vk::DescriptorType::STORAGE_BUFFER);
                write.array_element
            })
            .collect();
        assert_eq!(elements, [0, 1, 2]);
        let DescriptorResource::Data(bytes) = &writes.descriptors[2].resource else {
            panic!("expected inline data");
        };
        assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<u32, u8>(&[2; 4]));
    }

    #[test]
    fn test_mismatches_are_dropped() {
        let mut params = ShaderParameter::new();
        params["linear"].set(1.0f32);
        params["missing"].set(1.0f32);
        params["frame"][0u32]["nested"].set(1u32);
        params["params"]["scale"].set(1.0f32);
        let writes = collect_writes(&params, &layout());
        assert_eq!(writes.dropped, 3);
        assert!(writes.descriptors.is_empty());
        assert_eq!(writes.uniform_data.len(), 1);
    }

    #[test]
    fn test_oversized_value_is_still_written() {
        let mut params = ShaderParameter::new();
        params["params"]["scale"].set(glam::Vec2::new(1.0, 2.0));
        let writes = collect_writes(&params, &layout());
        assert_eq!(writes.dropped, 0);
        let data = &writes.uniform_data[&(0, 0, 0)];
        assert_eq!(&data[4..8], 2.0f32.to_ne_bytes());
    }

    #[test]
    fn test_uniform_block_array_elements_are_separate() {
        // `uniform Block { vec4 tint; float x; } blocks[4];` at set 0 binding 3.
        let mut root = ShaderParameterBinding::default();
        let blocks = root.entry("blocks");
        blocks.kind = BindingKind::Descriptor(DescriptorBinding {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            set: 0,
            binding: 3,
            array_size: 4,
            writable: false,
        });
        blocks.insert(
            "x",
            node(BindingKind::Constant(ConstantBinding {
                binding: 3,
                ..constant(16, 4, false)
            })),
        );
        let layout = ParameterLayout {
            root,
            uniform_blocks: [((0, 3), 32)].into_iter().collect(),
            push_constants: None,
            stages: vk::ShaderStageFlags::COMPUTE,
        };

        let mut params = ShaderParameter::new();
        params["blocks"][0u32]["x"].set(1.0f32);
        params["blocks"][2u32]["x"].set(2.0f32);
        let writes = collect_writes(&params, &layout);
        assert_eq!(writes.dropped, 0);
        let keys: Vec<_> = writes.uniform_data.keys().copied().collect();
        assert_eq!(keys, [(0, 3, 0), (0, 3, 2)]);
        let first = &writes.uniform_data[&(0, 3, 0)];
        assert_eq!(first.len(), 32);
        assert_eq!(&first[16..20], 1.0f32.to_ne_bytes());
        assert_eq!(&writes.uniform_data[&(0, 3, 2)][16..20], 2.0f32.to_ne_bytes());
    }

    #[test]
    fn test_element_offset_overflow_is_skipped() {
        let mut root = ShaderParameterBinding::default();
        root.insert(
            "values",
            node(BindingKind::Constant(ConstantBinding {
                array_size: 0,
                array_stride: 16,
                ..constant(0, 0, false)
            })),
        );
        let layout = ParameterLayout {
            root,
            ..Default::default()
        };
        let mut params = ShaderParameter::new();
        params["values"][u32::MAX].set(1.0f32);
        params["values"][2u32].set(3.0f32);
        let writes = collect_writes(&params, &layout);
        assert_eq!(writes.dropped, 1);
        assert_eq!(&writes.uniform_data[&(0, 0, 0)][32..36], 3.0f32.to_ne_bytes());
    }

    #[test]
    fn test_coalesce_ranges() {
        let merged = coalesce_ranges(vec![
            (8, vec![3, 3]),
            (0, vec![1, 1, 1, 1]),
            (4, vec![2, 2, 2, 2]),
            (32, vec![4]),
        ]);
        assert_eq!(
            merged,
            vec![(0, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3]), (32, vec![4])]
        );
    }
}
