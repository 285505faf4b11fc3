use std::{collections::BTreeMap, fmt::Write};

use ash::vk;

/// Key of a child in a binding or parameter tree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterKey {
    Name(String),
    Index(u32),
}

impl From<&str> for ParameterKey {
    fn from(value: &str) -> Self {
        ParameterKey::Name(value.to_owned())
    }
}
impl From<String> for ParameterKey {
    fn from(value: String) -> Self {
        ParameterKey::Name(value)
    }
}
impl From<u32> for ParameterKey {
    fn from(value: u32) -> Self {
        ParameterKey::Index(value)
    }
}

impl std::fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterKey::Name(name) => f.write_str(name),
            ParameterKey::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// Appends `key` to a dotted parameter path such as `lights[2].color`.
pub(crate) fn push_path(path: &mut String, key: &ParameterKey) {
    match key {
        ParameterKey::Name(name) => {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(name);
        }
        ParameterKey::Index(index) => {
            let _ = write!(path, "[{index}]");
        }
    }
}

/// A resource slot in a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub ty: vk::DescriptorType,
    pub set: u32,
    pub binding: u32,
    /// Zero for runtime-sized arrays.
    pub array_size: u32,
    pub writable: bool,
}

/// Bytes inside a uniform block or the push constant block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConstantBinding {
    /// Offset from the start of the block.
    pub offset: u32,
    /// Size of the whole member, all array elements included.
    pub type_size: u32,
    pub set: u32,
    pub binding: u32,
    pub array_size: u32,
    pub array_stride: u32,
    pub push_constant: bool,
}

/// An array of structs. Children describe element 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StructBinding {
    pub array_size: u32,
    /// Binding indices consumed by each element.
    pub descriptor_stride: u32,
    /// Bytes consumed by each element in its uniform or push constant block.
    pub uniform_stride: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttributeBinding {
    pub location: u32,
    pub semantic: String,
    pub semantic_index: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// A pure container.
    #[default]
    Unset,
    Descriptor(DescriptorBinding),
    Constant(ConstantBinding),
    Struct(StructBinding),
    VertexAttribute(VertexAttributeBinding),
}

impl BindingKind {
    /// Declared array size, or `None` when elements cannot be addressed by index.
    pub fn array_size(&self) -> Option<u32> {
        match self {
            BindingKind::Descriptor(d) => Some(d.array_size),
            BindingKind::Constant(c) => Some(c.array_size),
            BindingKind::Struct(s) => Some(s.array_size),
            BindingKind::Unset | BindingKind::VertexAttribute(_) => None,
        }
    }
}

/// Node of the tree describing where each named shader parameter lives.
///
/// Built from reflection data and never modified once a pipeline layout owns it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderParameterBinding {
    pub kind: BindingKind,
    /// Stages that declare this binding.
    pub stages: vk::ShaderStageFlags,
    children: BTreeMap<ParameterKey, ShaderParameterBinding>,
}

impl ShaderParameterBinding {
    pub fn new(kind: BindingKind, stages: vk::ShaderStageFlags) -> Self {
        Self {
            kind,
            stages,
            children: BTreeMap::new(),
        }
    }

    pub fn child(&self, key: &ParameterKey) -> Option<&ShaderParameterBinding> {
        self.children.get(key)
    }

    pub fn child_mut(&mut self, key: &ParameterKey) -> Option<&mut ShaderParameterBinding> {
        self.children.get_mut(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&ParameterKey, &ShaderParameterBinding)> {
        self.children.iter()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Inserts a child, returning the one it replaced.
    pub fn insert(
        &mut self,
        key: impl Into<ParameterKey>,
        node: ShaderParameterBinding,
    ) -> Option<ShaderParameterBinding> {
        self.children.insert(key.into(), node)
    }

    pub fn entry(&mut self, key: impl Into<ParameterKey>) -> &mut ShaderParameterBinding {
        self.children.entry(key.into()).or_default()
    }

    /// Looks up a node by dotted path, for example `material.albedo` or `lights[1].color`.
    pub fn find(&self, path: &str) -> Option<&ShaderParameterBinding> {
        let mut node = self;
        for key in parse_path(path)? {
            node = node.children.get(&key)?;
        }
        Some(node)
    }

    /// Calls `f` with the dotted path of every node below this one, parents first.
    pub fn visit(&self, mut f: impl FnMut(&str, &ShaderParameterBinding)) {
        fn visit_inner(
            node: &ShaderParameterBinding,
            path: &mut String,
            f: &mut dyn FnMut(&str, &ShaderParameterBinding),
        ) {
            for (key, child) in node.children.iter() {
                let len = path.len();
                push_path(path, key);
                f(path, child);
                visit_inner(child, path, f);
                path.truncate(len);
            }
        }
        let mut path = String::new();
        visit_inner(self, &mut path, &mut f);
    }
}

fn parse_path(path: &str) -> Option<Vec<ParameterKey>> {
    let mut keys = Vec::new();
    for segment in path.split('.') {
        let (name, mut rest) = match segment.find('[') {
            Some(i) => segment.split_at(i),
            None => (segment, ""),
        };
        if !name.is_empty() {
            keys.push(ParameterKey::Name(name.to_owned()));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            keys.push(ParameterKey::Index(stripped[..end].parse().ok()?));
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(keys)
}

/// The reflected parameter interface of one shader stage, or of a whole pipeline once
/// stages have been merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterLayout {
    pub root: ShaderParameterBinding,
    /// Declared size of every uniform block, keyed by `(set, binding)`.
    pub uniform_blocks: BTreeMap<(u32, u32), u32>,
    /// `(offset, size)` of the bytes used by push constants.
    pub push_constants: Option<(u32, u32)>,
    pub stages: vk::ShaderStageFlags,
}

impl ParameterLayout {
    /// Every descriptor binding keyed by `(set, binding)`, with the path it was found at
    /// and the stages that use it.
    pub fn descriptors(
        &self,
    ) -> BTreeMap<(u32, u32), (String, DescriptorBinding, vk::ShaderStageFlags)> {
        let mut out = BTreeMap::new();
        let mut block_stages: BTreeMap<(u32, u32), vk::ShaderStageFlags> = BTreeMap::new();
        self.root.visit(|path, node| match &node.kind {
            BindingKind::Descriptor(d) => {
                out.entry((d.set, d.binding))
                    .or_insert_with(|| (path.to_owned(), *d, node.stages));
            }
            BindingKind::Constant(c) if !c.push_constant => {
                *block_stages.entry((c.set, c.binding)).or_default() |= node.stages;
            }
            _ => {}
        });
        // Flattened uniform blocks have no node of their own.
        for &(set, binding) in self.uniform_blocks.keys() {
            let stages = block_stages
                .get(&(set, binding))
                .copied()
                .unwrap_or(self.stages);
            out.entry((set, binding)).or_insert_with(|| {
                (
                    String::new(),
                    DescriptorBinding {
                        ty: vk::DescriptorType::UNIFORM_BUFFER,
                        set,
                        binding,
                        array_size: 1,
                        writable: false,
                    },
                    stages,
                )
            });
        }
        out
    }

    /// Number of descriptor sets, counting gaps below the highest set index.
    pub fn set_count(&self) -> u32 {
        self.descriptors()
            .keys()
            .map(|&(set, _)| set + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(offset: u32) -> ShaderParameterBinding {
        ShaderParameterBinding::new(
            BindingKind::Constant(ConstantBinding {
                offset,
                type_size: 4,
                set: 0,
                binding: 0,
                array_size: 1,
                array_stride: 0,
                push_constant: false,
            }),
            vk::ShaderStageFlags::COMPUTE,
        )
    }

    #[test]
    fn test_find_by_path() {
        let mut root = ShaderParameterBinding::default();
        let lights = root.entry("lights");
        lights.kind = BindingKind::Struct(StructBinding {
            array_size: 4,
            descriptor_stride: 0,
            uniform_stride: 16,
        });
        lights.insert("color", constant(0));
        root.insert("scale", constant(64));

        assert_eq!(root.find("scale"), Some(&constant(64)));
        assert_eq!(root.find("lights.color"), Some(&constant(0)));
        assert!(root.find("lights.missing").is_none());
        assert!(root.find("scale]").is_none());
    }

    #[test]
    fn test_visit_paths() {
        let mut root = ShaderParameterBinding::default();
        root.entry("a").insert(2u32, constant(0));
        root.entry("b");
        let mut paths = Vec::new();
        root.visit(|path, _| paths.push(path.to_owned()));
        assert_eq!(paths, ["a", "a[2]", "b"]);
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("a[1][2].b").unwrap(),
            vec![
                ParameterKey::from("a"),
                ParameterKey::Index(1),
                ParameterKey::Index(2),
                ParameterKey::from("b"),
            ]
        );
        assert!(parse_path("a[x]").is_none());
    }
}
