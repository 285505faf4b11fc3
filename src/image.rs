//! Images, memoized image views and per-subresource state.
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::{prelude::VkResult, vk};
use glam::UVec3;
use smallvec::SmallVec;
use vk_mem::Alloc;

use crate::{
    Allocator, Device, HasDevice,
    tracking::{ImageBarrier, ImageStateTable, ResourceState},
    utils::AsVkHandle,
};

/// The creation parameters of an image. Doubles as the cache key for transient images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    pub ty: vk::ImageType,
    pub format: vk::Format,
    pub extent: UVec3,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            ty: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: UVec3::ONE,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
        }
    }
}

impl ImageInfo {
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: UVec3::new(width, height, 1),
            usage,
            ..Default::default()
        }
    }

    pub fn to_create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .flags(self.flags)
            .image_type(self.ty)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.extent.x,
                height: self.extent.y,
                depth: self.extent.z,
            })
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

impl From<&vk::ImageCreateInfo<'_>> for ImageInfo {
    fn from(info: &vk::ImageCreateInfo<'_>) -> Self {
        Self {
            ty: info.image_type,
            format: info.format,
            extent: UVec3::new(info.extent.width, info.extent.height, info.extent.depth),
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            samples: info.samples,
            tiling: info.tiling,
            usage: info.usage,
            flags: info.flags,
        }
    }
}

/// Raw components of a view's subresource range, view type and component mapping.
type ViewKey = ([u32; 5], i32, [i32; 4]);

fn view_key(
    range: &vk::ImageSubresourceRange,
    view_type: vk::ImageViewType,
    components: &vk::ComponentMapping,
) -> ViewKey {
    (
        [
            range.aspect_mask.as_raw(),
            range.base_mip_level,
            range.level_count,
            range.base_array_layer,
            range.layer_count,
        ],
        view_type.as_raw(),
        [
            components.r.as_raw(),
            components.g.as_raw(),
            components.b.as_raw(),
            components.a.as_raw(),
        ],
    )
}

/// An image with per-subresource [`ResourceState`]s and a cache of its views.
///
/// Images created by [`Image::from_raw`] (swapchain images, for example) are not owned
/// and are never destroyed by this type; their views are.
pub struct Image {
    device: Device,
    /// `None` for images not owned by this object.
    allocation: Option<(Allocator, vk_mem::Allocation)>,
    handle: vk::Image,
    info: ImageInfo,
    state: Mutex<ImageStateTable>,
    views: Mutex<HashMap<ViewKey, vk::ImageView>>,
}
unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Drop for Image {
    fn drop(&mut self) {
        let views = self
            .views
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe {
            for (_, view) in views.drain() {
                self.device.destroy_image_view(view, None);
            }
            if let Some((allocator, allocation)) = &mut self.allocation {
                allocator.destroy_image(self.handle, allocation);
            }
        }
    }
}
impl HasDevice for Image {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("info", &self.info)
            .field("owned", &self.allocation.is_some())
            .finish_non_exhaustive()
    }
}

impl Image {
    /// A device-local image allocated from `allocator`.
    pub fn new_private(allocator: Allocator, info: &ImageInfo) -> VkResult<Self> {
        let (handle, allocation) = unsafe {
            allocator.create_image(
                &info.to_create_info(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
            )?
        };
        Ok(Self {
            device: allocator.device().clone(),
            allocation: Some((allocator, allocation)),
            handle,
            info: *info,
            state: Mutex::new(ImageStateTable::new(info.mip_levels, info.array_layers)),
            views: Mutex::new(HashMap::new()),
        })
    }

    /// Wraps an image owned by someone else.
    ///
    /// # Safety
    /// `handle` must be a valid image created from `device` with parameters matching `info`,
    /// and must outlive the returned object.
    pub unsafe fn from_raw(device: Device, handle: vk::Image, info: &ImageInfo) -> Self {
        Self {
            device,
            allocation: None,
            handle,
            info: *info,
            state: Mutex::new(ImageStateTable::new(info.mip_levels, info.array_layers)),
            views: Mutex::new(HashMap::new()),
        }
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }
    pub fn extent(&self) -> UVec3 {
        self.info.extent
    }
    pub fn format(&self) -> vk::Format {
        self.info.format
    }
    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }
    pub fn array_layers(&self) -> u32 {
        self.info.array_layers
    }
    pub fn is_owned(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn aspects(&self) -> vk::ImageAspectFlags {
        format_aspects(self.info.format)
    }

    /// All mips and layers of every aspect.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspects(),
            base_mip_level: 0,
            level_count: self.info.mip_levels,
            base_array_layer: 0,
            layer_count: self.info.array_layers,
        }
    }

    pub fn subresource_layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspects(),
            mip_level,
            base_array_layer: 0,
            layer_count: self.info.array_layers,
        }
    }

    /// The state table of this image. Held only while recording a single command.
    pub fn state(&self) -> MutexGuard<'_, ImageStateTable> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// State of one subresource, or `None` if the image has no such layer or mip.
    pub fn get_state(&self, array_layer: u32, mip_level: u32) -> Option<ResourceState> {
        self.state().get_state(array_layer, mip_level)
    }

    /// Records `state` for `range` and returns the barriers from the previous uses.
    pub fn set_state(
        &self,
        state: ResourceState,
        range: &vk::ImageSubresourceRange,
    ) -> SmallVec<[ImageBarrier; 2]> {
        self.state().set_state(state, range)
    }

    /// Returns the view of `range`, creating it on first use.
    ///
    /// Views are cached for the lifetime of the image.
    pub fn view(
        self: &Arc<Self>,
        range: &vk::ImageSubresourceRange,
        view_type: vk::ImageViewType,
        components: vk::ComponentMapping,
    ) -> VkResult<ImageView> {
        let range = self.state().resolve_range(range);
        let key = view_key(&range, view_type, &components);
        let mut views = self
            .views
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let handle = match views.get(&key) {
            Some(view) => *view,
            None => {
                let view = unsafe {
                    self.device.create_image_view(
                        &vk::ImageViewCreateInfo::default()
                            .image(self.handle)
                            .view_type(view_type)
                            .format(self.info.format)
                            .components(components)
                            .subresource_range(range),
                        None,
                    )?
                };
                views.insert(key, view);
                view
            }
        };
        Ok(ImageView {
            image: self.clone(),
            handle,
            range,
            view_type,
        })
    }

    /// The view of every mip and layer with the natural view type.
    pub fn full_view(self: &Arc<Self>) -> VkResult<ImageView> {
        let view_type = match (self.info.ty, self.info.array_layers) {
            (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
            (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, 1) => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        };
        self.view(&self.full_range(), view_type, vk::ComponentMapping::default())
    }

    pub fn cached_view_count(&self) -> usize {
        self.views
            .lock()
            .map(|views| views.len())
            .unwrap_or_default()
    }
}

/// A cached view of an [`Image`]. Cloning is cheap; the view is destroyed with the image.
#[derive(Clone)]
pub struct ImageView {
    image: Arc<Image>,
    handle: vk::ImageView,
    range: vk::ImageSubresourceRange,
    view_type: vk::ImageViewType,
}

impl ImageView {
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
    pub fn range(&self) -> &vk::ImageSubresourceRange {
        &self.range
    }
    pub fn view_type(&self) -> vk::ImageViewType {
        self.view_type
    }
    pub fn set_state(&self, state: ResourceState) -> SmallVec<[ImageBarrier; 2]> {
        self.image.set_state(state, &self.range)
    }
}

impl AsVkHandle for ImageView {
    type Handle = vk::ImageView;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl PartialEq for ImageView {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
impl Eq for ImageView {}

impl Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .field("image", &self.image.handle)
            .field("range", &self.range)
            .field("view_type", &self.view_type)
            .finish()
    }
}

/// The aspects present in images of `format`.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_aspects() {
        assert_eq!(
            format_aspects(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspects(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_view_key_distinguishes_components() {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let identity = vk::ComponentMapping::default();
        let swizzled = vk::ComponentMapping {
            r: vk::ComponentSwizzle::B,
            b: vk::ComponentSwizzle::R,
            ..Default::default()
        };
        assert_eq!(
            view_key(&range, vk::ImageViewType::TYPE_2D, &identity),
            view_key(&range, vk::ImageViewType::TYPE_2D, &identity)
        );
        assert_ne!(
            view_key(&range, vk::ImageViewType::TYPE_2D, &identity),
            view_key(&range, vk::ImageViewType::TYPE_2D, &swizzled)
        );
        assert_ne!(
            view_key(&range, vk::ImageViewType::TYPE_2D, &identity),
            view_key(&range, vk::ImageViewType::TYPE_2D_ARRAY, &identity)
        );
    }

    #[test]
    fn test_image_info_round_trip() {
        let info = ImageInfo::new_2d(
            vk::Format::R16G16B16A16_SFLOAT,
            64,
            32,
            vk::ImageUsageFlags::STORAGE,
        );
        let create_info = info.to_create_info();
        assert_eq!(ImageInfo::from(&create_info), info);
    }
}
