use std::{
    collections::BTreeMap,
    ops::{Index, IndexMut},
    sync::Arc,
};

use ash::vk;
use bytemuck::Pod;
use smallvec::SmallVec;

use super::binding::ParameterKey;
use crate::{
    buffer::{BufferRange, BufferView, TexelBufferView},
    image::ImageView,
    sampler::Sampler,
};

/// An image bound to a shader parameter.
#[derive(Clone, Debug)]
pub struct ImageParameter {
    pub view: ImageView,
    /// Layout the image is transitioned to. Picked from the descriptor type when `None`.
    pub layout: Option<vk::ImageLayout>,
    /// Required for combined image samplers.
    pub sampler: Option<Arc<Sampler>>,
}

/// An acceleration structure bound to a shader parameter, together with the buffer range
/// it is stored in. Barriers are tracked on that range.
#[derive(Clone, Debug)]
pub struct AccelerationStructureParameter {
    pub handle: vk::AccelerationStructureKHR,
    pub storage: BufferView,
}

/// The value assigned to a shader parameter.
#[derive(Clone, Debug)]
pub enum ParameterValue {
    /// Plain bytes, laid out the way the shader expects them.
    Constant(SmallVec<[u8; 16]>),
    Buffer(BufferView),
    TexelBuffer(Arc<TexelBufferView>),
    Image(ImageParameter),
    Sampler(Arc<Sampler>),
    AccelerationStructure(AccelerationStructureParameter),
}

impl ParameterValue {
    pub fn constant<T: Pod>(value: &T) -> Self {
        ParameterValue::Constant(SmallVec::from_slice(bytemuck::bytes_of(value)))
    }

    pub fn constant_slice<T: Pod>(values: &[T]) -> Self {
        ParameterValue::Constant(SmallVec::from_slice(bytemuck::cast_slice(values)))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ParameterValue::Constant(_) => "constant",
            ParameterValue::Buffer(_) => "buffer",
            ParameterValue::TexelBuffer(_) => "texel buffer",
            ParameterValue::Image(_) => "image",
            ParameterValue::Sampler(_) => "sampler",
            ParameterValue::AccelerationStructure(_) => "acceleration structure",
        }
    }
}

macro_rules! impl_constant_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ParameterValue {
                fn from(value: $ty) -> Self {
                    ParameterValue::constant(&value)
                }
            }
        )*
    };
}

impl_constant_from!(
    f32,
    i32,
    u32,
    f64,
    glam::Vec2,
    glam::Vec3,
    glam::Vec4,
    glam::IVec2,
    glam::IVec3,
    glam::IVec4,
    glam::UVec2,
    glam::UVec3,
    glam::UVec4,
    glam::Mat4,
);

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::constant(&(value as u32))
    }
}
impl From<&[u8]> for ParameterValue {
    fn from(value: &[u8]) -> Self {
        ParameterValue::Constant(SmallVec::from_slice(value))
    }
}
impl From<BufferView> for ParameterValue {
    fn from(value: BufferView) -> Self {
        ParameterValue::Buffer(value)
    }
}
impl<T> From<BufferRange<T>> for ParameterValue {
    fn from(value: BufferRange<T>) -> Self {
        ParameterValue::Buffer(value.into())
    }
}
impl From<Arc<TexelBufferView>> for ParameterValue {
    fn from(value: Arc<TexelBufferView>) -> Self {
        ParameterValue::TexelBuffer(value)
    }
}
impl From<ImageView> for ParameterValue {
    fn from(view: ImageView) -> Self {
        ParameterValue::Image(ImageParameter {
            view,
            layout: None,
            sampler: None,
        })
    }
}
impl From<(ImageView, Arc<Sampler>)> for ParameterValue {
    fn from((view, sampler): (ImageView, Arc<Sampler>)) -> Self {
        ParameterValue::Image(ImageParameter {
            view,
            layout: None,
            sampler: Some(sampler),
        })
    }
}
impl From<ImageParameter> for ParameterValue {
    fn from(value: ImageParameter) -> Self {
        ParameterValue::Image(value)
    }
}
impl From<Arc<Sampler>> for ParameterValue {
    fn from(value: Arc<Sampler>) -> Self {
        ParameterValue::Sampler(value)
    }
}
impl From<AccelerationStructureParameter> for ParameterValue {
    fn from(value: AccelerationStructureParameter) -> Self {
        ParameterValue::AccelerationStructure(value)
    }
}

/// A sparse tree of shader parameter values, keyed like the pipeline's binding tree.
///
/// Indexing a missing child through `&mut` creates it.
///
/// ```ignore
/// let mut params = ShaderParameter::new();
/// params["params"]["scale"].set(2.0f32);
/// params["data"].set(buffer_view);
/// params["textures"][1u32].set((image_view, sampler));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ShaderParameter {
    value: Option<ParameterValue>,
    children: BTreeMap<ParameterKey, ShaderParameter>,
}

static EMPTY: ShaderParameter = ShaderParameter {
    value: None,
    children: BTreeMap::new(),
};

impl ShaderParameter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, value: impl Into<ParameterValue>) -> &mut Self {
        self.value = Some(value.into());
        self
    }

    pub fn take(&mut self) -> Option<ParameterValue> {
        self.value.take()
    }

    pub fn value(&self) -> Option<&ParameterValue> {
        self.value.as_ref()
    }

    pub fn get(&self, key: &ParameterKey) -> Option<&ShaderParameter> {
        self.children.get(key)
    }

    pub fn entry(&mut self, key: impl Into<ParameterKey>) -> &mut ShaderParameter {
        self.children.entry(key.into()).or_default()
    }

    pub fn remove(&mut self, key: &ParameterKey) -> Option<ShaderParameter> {
        self.children.remove(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&ParameterKey, &ShaderParameter)> {
        self.children.iter()
    }

    /// True when neither this node nor any child holds a value.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.values().all(ShaderParameter::is_empty)
    }
}

impl Index<&str> for ShaderParameter {
    type Output = ShaderParameter;

    fn index(&self, name: &str) -> &Self::Output {
        self.children
            .get(&ParameterKey::Name(name.to_owned()))
            .unwrap_or(&EMPTY)
    }
}
impl IndexMut<&str> for ShaderParameter {
    fn index_mut(&mut self, name: &str) -> &mut Self::Output {
        self.entry(name)
    }
}
impl Index<u32> for ShaderParameter {
    type Output = ShaderParameter;

    fn index(&self, index: u32) -> &Self::Output {
        self.children
            .get(&ParameterKey::Index(index))
            .unwrap_or(&EMPTY)
    }
}
impl IndexMut<u32> for ShaderParameter {
    fn index_mut(&mut self, index: u32) -> &mut Self::Output {
        self.entry(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_bytes(param: &ShaderParameter) -> &[u8] {
        match param.value() {
            Some(ParameterValue::Constant(bytes)) => bytes,
            other => panic!("expected constant, got {other:?}"),
        }
    }

    #[test]
    fn test_index_creates_on_access() {
        let mut params = ShaderParameter::new();
        params["lights"][2u32]["color"].set(glam::Vec3::new(1.0, 0.5, 0.0));
        assert!(params.get(&ParameterKey::from("lights")).is_some());
        assert_eq!(
            constant_bytes(&params["lights"][2u32]["color"]),
            bytemuck::bytes_of(&glam::Vec3::new(1.0, 0.5, 0.0))
        );
        assert!(params["lights"].value().is_none());
    }

    #[test]
    fn test_shared_index_does_not_create() {
        let params = ShaderParameter::new();
        assert!(params["missing"][3u32].value().is_none());
        assert!(params.is_empty());
    }

    #[test]
    fn test_reassignment_replaces_value() {
        let mut params = ShaderParameter::new();
        params["scale"].set(1.0f32).set(2.0f32);
        assert_eq!(constant_bytes(&params["scale"]), 2.0f32.to_ne_bytes());
        params["flag"].set(true);
        assert_eq!(constant_bytes(&params["flag"]), 1u32.to_ne_bytes());
        assert!(!params.is_empty());
    }
}
