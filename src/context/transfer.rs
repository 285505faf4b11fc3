//! Copies, fills, blits, clears and staging uploads.
use ash::vk;
use bytemuck::Pod;
use glam::UVec3;

use super::{CommandContext, TransientMemory};
use crate::{
    Error, Result,
    buffer::{BufferRange, BufferView},
    image::{Image, ImageView},
    tracking::Access,
    utils::AsVkHandle,
};

fn mip_extent(image: &Image, mip_level: u32) -> UVec3 {
    (image.extent() >> mip_level).max(UVec3::ONE)
}

fn layers_of(view: &ImageView, mip_level: u32) -> vk::ImageSubresourceLayers {
    let range = view.range();
    vk::ImageSubresourceLayers {
        aspect_mask: range.aspect_mask,
        mip_level,
        base_array_layer: range.base_array_layer,
        layer_count: range.layer_count,
    }
}

fn mip_range(view: &ImageView, mip_level: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        base_mip_level: mip_level,
        level_count: 1,
        ..*view.range()
    }
}

fn offset_of(extent: UVec3) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.x as i32,
        y: extent.y as i32,
        z: extent.z as i32,
    }
}

impl CommandContext {
    /// Copies all of `src` to the start of `dst`.
    ///
    /// Fails with [`Error::CopyOverflow`] when `dst` is smaller than `src`.
    pub fn copy_buffer(&mut self, src: &BufferView, dst: &BufferView) -> Result<()> {
        if dst.size() < src.size() {
            return Err(Error::CopyOverflow {
                src_size: src.size(),
                dst_size: dst.size(),
            });
        }
        self.add_buffer_barrier(src, Access::COPY_READ);
        self.add_buffer_barrier(dst, Access::COPY_WRITE);
        self.execute_barriers()?;
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_copy_buffer(
                cb,
                src.vk_handle(),
                dst.vk_handle(),
                &[vk::BufferCopy {
                    src_offset: src.offset(),
                    dst_offset: dst.offset(),
                    size: src.size(),
                }],
            );
        }
        Ok(())
    }

    /// Fills `dst` with repeated copies of `value`. The view's offset and size must be
    /// multiples of 4.
    pub fn fill_buffer(&mut self, dst: &BufferView, value: u32) -> Result<()> {
        self.add_buffer_barrier(dst, Access::CLEAR);
        self.execute_barriers()?;
        let cb = self.command_buffer()?;
        unsafe {
            self.device
                .cmd_fill_buffer(cb, dst.vk_handle(), dst.offset(), dst.size(), value);
        }
        Ok(())
    }

    /// Copies tightly packed texels from `src` into the base mip level of `dst`.
    pub fn copy_buffer_to_image(&mut self, src: &BufferView, dst: &ImageView) -> Result<()> {
        let mip_level = dst.range().base_mip_level;
        self.add_buffer_barrier(src, Access::COPY_READ);
        self.add_image_range_barrier(
            dst.image(),
            &mip_range(dst, mip_level),
            Access::COPY_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        self.execute_barriers()?;
        let extent = mip_extent(dst.image(), mip_level);
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cb,
                src.vk_handle(),
                dst.image().vk_handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::BufferImageCopy {
                    buffer_offset: src.offset(),
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: layers_of(dst, mip_level),
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.x,
                        height: extent.y,
                        depth: extent.z,
                    },
                }],
            );
        }
        Ok(())
    }

    /// Copies the base mip level of `src` into `dst`, tightly packed.
    pub fn copy_image_to_buffer(&mut self, src: &ImageView, dst: &BufferView) -> Result<()> {
        let mip_level = src.range().base_mip_level;
        self.add_image_range_barrier(
            src.image(),
            &mip_range(src, mip_level),
            Access::COPY_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        self.add_buffer_barrier(dst, Access::COPY_WRITE);
        self.execute_barriers()?;
        let extent = mip_extent(src.image(), mip_level);
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                cb,
                src.image().vk_handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.vk_handle(),
                &[vk::BufferImageCopy {
                    buffer_offset: dst.offset(),
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: layers_of(src, mip_level),
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.x,
                        height: extent.y,
                        depth: extent.z,
                    },
                }],
            );
        }
        Ok(())
    }

    /// Blits the base mip level of `src` over the whole base mip level of `dst`.
    pub fn blit_image(
        &mut self,
        src: &ImageView,
        dst: &ImageView,
        filter: vk::Filter,
    ) -> Result<()> {
        let src_mip = src.range().base_mip_level;
        let dst_mip = dst.range().base_mip_level;
        self.add_image_range_barrier(
            src.image(),
            &mip_range(src, src_mip),
            Access::BLIT_SRC,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        self.add_image_range_barrier(
            dst.image(),
            &mip_range(dst, dst_mip),
            Access::BLIT_DST,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        self.execute_barriers()?;
        let region = vk::ImageBlit {
            src_subresource: layers_of(src, src_mip),
            src_offsets: [
                vk::Offset3D::default(),
                offset_of(mip_extent(src.image(), src_mip)),
            ],
            dst_subresource: layers_of(dst, dst_mip),
            dst_offsets: [
                vk::Offset3D::default(),
                offset_of(mip_extent(dst.image(), dst_mip)),
            ],
        };
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_blit_image(
                cb,
                src.image().vk_handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image().vk_handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            );
        }
        Ok(())
    }

    /// Clears every subresource of `view` to `color`.
    pub fn clear_color(&mut self, view: &ImageView, color: vk::ClearColorValue) -> Result<()> {
        self.add_image_barrier(view, Access::CLEAR, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        self.execute_barriers()?;
        let cb = self.command_buffer()?;
        unsafe {
            self.device.cmd_clear_color_image(
                cb,
                view.image().vk_handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &color,
                std::slice::from_ref(view.range()),
            );
        }
        Ok(())
    }

    /// Copies `data` into a transient device-local buffer with `usage` through a staging
    /// buffer. The copy is recorded into the current command buffer.
    ///
    /// The returned view is exactly `data.len()` bytes and stays valid until the
    /// submission of this recording has completed.
    pub fn upload_data(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<BufferView> {
        let staging = self.upload_host(data)?;
        let size = staging.size();
        let buffer = self.transient_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            TransientMemory::Device,
        )?;
        let view = BufferView::new(buffer, 0, size);
        self.copy_buffer(&staging, &view)?;
        Ok(view)
    }

    /// Copies `data` into a transient host-visible buffer usable as a transfer source.
    ///
    /// No command is recorded; the caller records the copy out of the returned view.
    pub fn upload_host(&mut self, data: &[u8]) -> Result<BufferView> {
        if data.is_empty() {
            return Err(Error::InvalidState("cannot upload an empty slice"));
        }
        let size = data.len() as vk::DeviceSize;
        let buffer = self.transient_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            TransientMemory::Host,
        )?;
        buffer.write(0, data)?;
        Ok(BufferView::new(buffer, 0, size))
    }

    /// A device-local buffer of `count` elements of `T` with `usage`, reusable after the
    /// submission of this recording has completed. Contents are undefined.
    pub fn get_transient_buffer<T: Pod>(
        &mut self,
        count: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<BufferRange<T>> {
        let size = (count * std::mem::size_of::<T>()) as vk::DeviceSize;
        if size == 0 {
            return Err(Error::InvalidState("cannot allocate an empty transient buffer"));
        }
        let usage =
            usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let buffer = self.transient_buffer(size, usage, TransientMemory::Device)?;
        Ok(BufferRange::new(BufferView::new(buffer, 0, size)))
    }
}
