//! Shader reflection and the parameter binding trees built from it.
//!
//! [`reflect`](reflect::reflect) turns a SPIR-V entry point into a [`ParameterLayout`]
//! whose [`ShaderParameterBinding`] tree says where every named parameter lives: a
//! descriptor slot, a range of a uniform block, or a range of the push constant block.
//! Callers fill a [`ShaderParameter`] tree with values using the same names, and
//! [`collect_writes`](walk::collect_writes) pairs the two trees up.
pub mod binding;
pub mod parameter;
pub mod reflect;
pub mod walk;

pub use binding::{
    BindingKind, ConstantBinding, DescriptorBinding, ParameterKey, ParameterLayout,
    ShaderParameterBinding, StructBinding, VertexAttributeBinding,
};
pub use parameter::{
    AccelerationStructureParameter, ImageParameter, ParameterValue, ShaderParameter,
};
pub use reflect::{ShaderReflection, reflect};
pub use walk::{DescriptorResource, DescriptorWrite, ParameterWrites, collect_writes};
