//! Descriptor set layouts, descriptor pools and a growable descriptor allocator.
//!
//! Pool exhaustion is reported as [`PoolAllocation::Exhausted`] rather than an error, and
//! [`DescriptorAllocator`] reacts to it by creating another pool and retrying once.
//!
//! ```no_run
//! # use tephra::{Device, ash::vk, descriptor::{DescriptorSetLayout, DescriptorAllocator, DescriptorPoolConfig}};
//! # let device = Device::create_system_default().unwrap();
//! let layout = DescriptorSetLayout::new(
//!     device.clone(),
//!     &[vk::DescriptorSetLayoutBinding {
//!         binding: 0,
//!         descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
//!         descriptor_count: 1,
//!         stage_flags: vk::ShaderStageFlags::COMPUTE,
//!         ..Default::default()
//!     }],
//!     &[],
//!     vk::DescriptorSetLayoutCreateFlags::empty(),
//! ).unwrap();
//! let mut allocator = DescriptorAllocator::new(device, DescriptorPoolConfig::default());
//! let sets = allocator.allocate(&[layout.raw()]).unwrap();
//! ```
use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A descriptor set layout.
pub struct DescriptorSetLayout {
    device: Device,
    handle: vk::DescriptorSetLayout,
}
impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}
impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DescriptorSetLayout")
            .field(&self.handle)
            .finish()
    }
}
impl DescriptorSetLayout {
    /// Creates a descriptor set layout with N bindings.
    ///
    /// `binding_flags` is either empty or holds one entry per binding. Immutable samplers
    /// are passed through `p_immutable_samplers` of the bindings.
    pub fn new(
        device: Device,
        binding_infos: &[vk::DescriptorSetLayoutBinding],
        binding_flags: &[vk::DescriptorBindingFlags],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> VkResult<Self> {
        assert!(binding_flags.is_empty() || binding_flags.len() == binding_infos.len());
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(binding_flags);
        let mut info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(flags)
            .bindings(binding_infos);
        if !binding_flags.is_empty() {
            info = info.push_next(&mut flags_info);
        }
        let handle = unsafe { device.create_descriptor_set_layout(&info, None) }?;
        Ok(Self { device, handle })
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}
impl AsVkHandle for DescriptorSetLayout {
    type Handle = vk::DescriptorSetLayout;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

/// Sizing of each pool created by a [`DescriptorAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DescriptorPoolConfig {
    pub max_sets: u32,
    /// Number of descriptors reserved for every descriptor type.
    pub descriptors_per_type: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 1024,
            descriptors_per_type: 4096,
        }
    }
}

impl DescriptorPoolConfig {
    const TYPES: [vk::DescriptorType; 9] = [
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::INPUT_ATTACHMENT,
    ];

    pub fn pool_sizes(&self, acceleration_structures: bool) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<_> = Self::TYPES
            .iter()
            .map(|&ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: self.descriptors_per_type,
            })
            .collect();
        if acceleration_structures {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: self.descriptors_per_type,
            });
        }
        sizes
    }
}

/// The outcome of allocating from a single pool.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolAllocation {
    Allocated(Vec<vk::DescriptorSet>),
    /// The pool has no room left; allocate from another pool.
    Exhausted,
}

/// Something descriptor sets can be allocated from.
pub trait PoolBackend {
    fn try_allocate(&mut self, layouts: &[vk::DescriptorSetLayout]) -> VkResult<PoolAllocation>;
}

/// A descriptor pool.
pub struct DescriptorPool {
    device: Device,
    raw: vk::DescriptorPool,
}
impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.raw, None);
        }
    }
}
impl AsVkHandle for DescriptorPool {
    type Handle = vk::DescriptorPool;
    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}
impl HasDevice for DescriptorPool {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl DescriptorPool {
    pub fn new(
        device: Device,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VkResult<Self> {
        let raw = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .flags(flags)
                    .max_sets(max_sets)
                    .pool_sizes(pool_sizes),
                None,
            )?
        };
        Ok(Self { device, raw })
    }

    pub fn from_config(device: Device, config: &DescriptorPoolConfig) -> VkResult<Self> {
        let acceleration_structures =
            device.has_extension_named(ash::khr::acceleration_structure::NAME);
        let sizes = config.pool_sizes(acceleration_structures);
        Self::new(
            device,
            &sizes,
            config.max_sets,
            vk::DescriptorPoolCreateFlags::empty(),
        )
    }

    /// Returns every set to the pool.
    pub fn reset(&mut self) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.raw, vk::DescriptorPoolResetFlags::empty())
        }
    }
}

impl PoolBackend for DescriptorPool {
    fn try_allocate(&mut self, layouts: &[vk::DescriptorSetLayout]) -> VkResult<PoolAllocation> {
        let result = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.raw)
                    .set_layouts(layouts),
            )
        };
        match result {
            Ok(sets) => Ok(PoolAllocation::Allocated(sets)),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Ok(PoolAllocation::Exhausted)
            }
            Err(err) => Err(err),
        }
    }
}

type PoolFactory<P> = Box<dyn FnMut() -> VkResult<P> + Send + Sync>;

/// Allocates descriptor sets from a growing list of pools. Pools are never freed.
pub struct DescriptorAllocator<P: PoolBackend = DescriptorPool> {
    pools: Vec<P>,
    factory: PoolFactory<P>,
}

impl DescriptorAllocator<DescriptorPool> {
    pub fn new(device: Device, config: DescriptorPoolConfig) -> Self {
        Self::with_factory(move || DescriptorPool::from_config(device.clone(), &config))
    }
}

impl<P: PoolBackend> DescriptorAllocator<P> {
    pub fn with_factory(factory: impl FnMut() -> VkResult<P> + Send + Sync + 'static) -> Self {
        Self {
            pools: Vec::new(),
            factory: Box::new(factory),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn grow(&mut self) -> VkResult<&mut P> {
        let pool = (self.factory)()?;
        self.pools.push(pool);
        tracing::debug!(pools = self.pools.len(), "created descriptor pool");
        Ok(self.pools.last_mut().ok_or(vk::Result::ERROR_UNKNOWN)?)
    }

    /// Allocates one set per layout, adding a pool and retrying once if the newest pool
    /// is exhausted.
    pub fn allocate(
        &mut self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let pool = match self.pools.last_mut() {
            Some(pool) => pool,
            None => self.grow()?,
        };
        if let PoolAllocation::Allocated(sets) = pool.try_allocate(layouts)? {
            return Ok(sets);
        }
        match self.grow()?.try_allocate(layouts)? {
            PoolAllocation::Allocated(sets) => Ok(sets),
            PoolAllocation::Exhausted => Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    struct FakePool {
        remaining: u32,
        next: Arc<AtomicU64>,
    }

    impl PoolBackend for FakePool {
        fn try_allocate(
            &mut self,
            layouts: &[vk::DescriptorSetLayout],
        ) -> VkResult<PoolAllocation> {
            if (layouts.len() as u32) > self.remaining {
                return Ok(PoolAllocation::Exhausted);
            }
            self.remaining -= layouts.len() as u32;
            Ok(PoolAllocation::Allocated(
                layouts
                    .iter()
                    .map(|_| {
                        vk::DescriptorSet::from_raw(self.next.fetch_add(1, Ordering::Relaxed) + 1)
                    })
                    .collect(),
            ))
        }
    }

    fn fake_allocator(capacity: u32) -> DescriptorAllocator<FakePool> {
        let next = Arc::new(AtomicU64::new(0));
        DescriptorAllocator::with_factory(move || {
            Ok(FakePool {
                remaining: capacity,
                next: next.clone(),
            })
        })
    }

    #[test]
    fn test_pool_growth() {
        let mut allocator = fake_allocator(4);
        let layouts = [vk::DescriptorSetLayout::null(); 2];
        for _ in 0..2 {
            assert_eq!(allocator.allocate(&layouts).unwrap().len(), 2);
        }
        assert_eq!(allocator.pool_count(), 1);
        // The first pool is now full; the next allocation transparently grows.
        let sets = allocator.allocate(&layouts).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(allocator.pool_count(), 2);
        assert!(sets.iter().all(|set| !set.is_null()));
    }

    #[test]
    fn test_oversized_request_fails_after_one_retry() {
        let mut allocator = fake_allocator(1);
        let layouts = [vk::DescriptorSetLayout::null(); 3];
        assert_eq!(
            allocator.allocate(&layouts),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        assert_eq!(allocator.pool_count(), 2);
    }

    #[test]
    fn test_empty_request_creates_no_pool() {
        let mut allocator = fake_allocator(1);
        assert!(allocator.allocate(&[]).unwrap().is_empty());
        assert_eq!(allocator.pool_count(), 0);
    }

    #[test]
    fn test_pool_sizes() {
        let config = DescriptorPoolConfig {
            max_sets: 8,
            descriptors_per_type: 16,
        };
        let sizes = config.pool_sizes(false);
        assert!(sizes.iter().all(|size| size.descriptor_count == 16));
        assert!(
            !sizes
                .iter()
                .any(|size| size.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        );
        assert_eq!(config.pool_sizes(true).len(), sizes.len() + 1);
    }
}
