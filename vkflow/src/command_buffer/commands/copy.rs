use crate::{
    command_buffer::{CommandRecorder, Result},
    device::NativeImage,
    resource::{AccessType, BufferId, ImageId, ImageLayoutType},
};
use ash::vk;
use smallvec::SmallVec;

/// # Commands to transfer data between resources
impl CommandRecorder {
    /// Copies data from a buffer to another buffer.
    ///
    /// # Safety
    ///
    /// - The regions must be in bounds of both buffers, and the accesses must be synchronized.
    pub unsafe fn copy_buffer(
        &mut self,
        copy_buffer_info: &CopyBufferInfo<'_>,
    ) -> Result<&mut Self> {
        let &CopyBufferInfo {
            src_buffer,
            dst_buffer,
            regions,
            _ne: _,
        } = copy_buffer_info;

        let src = self.device.buffer_native(src_buffer)?;
        let dst = self.device.buffer_native(dst_buffer)?;

        let regions_vk = if regions.is_empty() {
            let src_size = self.device.buffer_info(src_buffer)?.size;
            let dst_size = self.device.buffer_info(dst_buffer)?.size;

            SmallVec::<[_; 8]>::from_elem(
                vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: src_size.min(dst_size),
                },
                1,
            )
        } else {
            regions.iter().map(BufferCopy::to_vk).collect()
        };

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device
                .backend()
                .cmd_copy_buffer(self.handle, src.handle, dst.handle, &regions_vk)
        };

        Ok(self)
    }

    /// Copies data from a buffer to an image.
    ///
    /// # Safety
    ///
    /// - The regions must be in bounds of the buffer and image, the image must be in the layout
    ///   that `dst_image_layout` resolves to, and the accesses must be synchronized.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        copy_buffer_to_image_info: &CopyBufferToImageInfo<'_>,
    ) -> Result<&mut Self> {
        let &CopyBufferToImageInfo {
            src_buffer,
            dst_image,
            dst_image_layout,
            regions,
            _ne: _,
        } = copy_buffer_to_image_info;

        let src = self.device.buffer_native(src_buffer)?;
        let dst = self.device.image_native(dst_image)?;
        let dst_image_layout = AccessType::CopyTransferWrite.image_layout(dst_image_layout);
        let regions_vk = image_copy_regions(&dst, regions);

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_copy_buffer_to_image(
                self.handle,
                src.handle,
                dst.handle,
                dst_image_layout,
                &regions_vk,
            )
        };

        Ok(self)
    }

    /// Copies data from an image to a buffer.
    ///
    /// # Safety
    ///
    /// - The regions must be in bounds of the image and buffer, the image must be in the layout
    ///   that `src_image_layout` resolves to, and the accesses must be synchronized.
    pub unsafe fn copy_image_to_buffer(
        &mut self,
        copy_image_to_buffer_info: &CopyImageToBufferInfo<'_>,
    ) -> Result<&mut Self> {
        let &CopyImageToBufferInfo {
            src_image,
            src_image_layout,
            dst_buffer,
            regions,
            _ne: _,
        } = copy_image_to_buffer_info;

        let src = self.device.image_native(src_image)?;
        let dst = self.device.buffer_native(dst_buffer)?;
        let src_image_layout = AccessType::CopyTransferRead.image_layout(src_image_layout);
        let regions_vk = image_copy_regions(&src, regions);

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_copy_image_to_buffer(
                self.handle,
                src.handle,
                src_image_layout,
                dst.handle,
                &regions_vk,
            )
        };

        Ok(self)
    }
}

/// Returns the native regions, or a region covering the first mip level of every array layer if
/// `regions` is empty.
fn image_copy_regions(
    image: &NativeImage,
    regions: &[BufferImageCopy<'_>],
) -> SmallVec<[vk::BufferImageCopy; 8]> {
    if regions.is_empty() {
        let [width, height, depth] = image.extent;

        SmallVec::from_elem(
            vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: image.aspect_mask,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: image.whole_slice.layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth,
                },
            },
            1,
        )
    } else {
        regions
            .iter()
            .map(|region| region.to_vk(image.aspect_mask))
            .collect()
    }
}

/// Parameters to copy data from a buffer to another buffer.
#[derive(Clone, Debug)]
pub struct CopyBufferInfo<'a> {
    /// The buffer to copy from.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub src_buffer: BufferId,

    /// The buffer to copy to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub dst_buffer: BufferId,

    /// The regions of both buffers to copy between.
    ///
    /// The default value is empty, which means that the whole of the smaller buffer is copied.
    pub regions: &'a [BufferCopy<'a>],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for CopyBufferInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl CopyBufferInfo<'_> {
    /// Returns a default `CopyBufferInfo`.
    #[inline]
    pub const fn new() -> Self {
        CopyBufferInfo {
            src_buffer: BufferId::INVALID,
            dst_buffer: BufferId::INVALID,
            regions: &[],
            _ne: crate::NE,
        }
    }
}

/// A region of data to copy between buffers.
#[derive(Clone, Debug)]
pub struct BufferCopy<'a> {
    /// The offset in bytes from the start of the source buffer.
    ///
    /// The default value is `0`.
    pub src_offset: vk::DeviceSize,

    /// The offset in bytes from the start of the destination buffer.
    ///
    /// The default value is `0`.
    pub dst_offset: vk::DeviceSize,

    /// The number of bytes to copy.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: vk::DeviceSize,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for BufferCopy<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BufferCopy<'_> {
    /// Returns a default `BufferCopy`.
    #[inline]
    pub const fn new() -> Self {
        BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 0,
            _ne: crate::NE,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::BufferCopy {
        let &Self {
            src_offset,
            dst_offset,
            size,
            _ne: _,
        } = self;

        vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        }
    }
}

/// Parameters to copy data from a buffer to an image.
#[derive(Clone, Debug)]
pub struct CopyBufferToImageInfo<'a> {
    /// The buffer to copy from.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub src_buffer: BufferId,

    /// The image to copy to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub dst_image: ImageId,

    /// The layout type that the image is in.
    ///
    /// The default value is [`ImageLayoutType::Optimal`].
    pub dst_image_layout: ImageLayoutType,

    /// The regions of the buffer and image to copy between.
    ///
    /// The default value is empty, which means that the first mip level of every array layer of
    /// the image is copied, from tightly packed data at the start of the buffer.
    pub regions: &'a [BufferImageCopy<'a>],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for CopyBufferToImageInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl CopyBufferToImageInfo<'_> {
    /// Returns a default `CopyBufferToImageInfo`.
    #[inline]
    pub const fn new() -> Self {
        CopyBufferToImageInfo {
            src_buffer: BufferId::INVALID,
            dst_image: ImageId::INVALID,
            dst_image_layout: ImageLayoutType::Optimal,
            regions: &[],
            _ne: crate::NE,
        }
    }
}

/// Parameters to copy data from an image to a buffer.
#[derive(Clone, Debug)]
pub struct CopyImageToBufferInfo<'a> {
    /// The image to copy from.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub src_image: ImageId,

    /// The layout type that the image is in.
    ///
    /// The default value is [`ImageLayoutType::Optimal`].
    pub src_image_layout: ImageLayoutType,

    /// The buffer to copy to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub dst_buffer: BufferId,

    /// The regions of the image and buffer to copy between.
    ///
    /// The default value is empty, which means that the first mip level of every array layer of
    /// the image is copied, to tightly packed data at the start of the buffer.
    pub regions: &'a [BufferImageCopy<'a>],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for CopyImageToBufferInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl CopyImageToBufferInfo<'_> {
    /// Returns a default `CopyImageToBufferInfo`.
    #[inline]
    pub const fn new() -> Self {
        CopyImageToBufferInfo {
            src_image: ImageId::INVALID,
            src_image_layout: ImageLayoutType::Optimal,
            dst_buffer: BufferId::INVALID,
            regions: &[],
            _ne: crate::NE,
        }
    }
}

/// A region of data to copy between a buffer and an image.
#[derive(Clone, Debug)]
pub struct BufferImageCopy<'a> {
    /// The offset in bytes from the start of the buffer.
    ///
    /// The default value is `0`.
    pub buffer_offset: vk::DeviceSize,

    /// The number of texels per row in the buffer, or `0` for tightly packed rows.
    ///
    /// The default value is `0`.
    pub buffer_row_length: u32,

    /// The number of rows per array layer in the buffer, or `0` for tightly packed layers.
    ///
    /// The default value is `0`.
    pub buffer_image_height: u32,

    /// The default value is `0`.
    pub mip_level: u32,

    /// The default value is `0`.
    pub base_array_layer: u32,

    /// The default value is `1`.
    pub layer_count: u32,

    /// The offset in texels of the region in the image.
    ///
    /// The default value is `[0; 3]`.
    pub image_offset: [u32; 3],

    /// The extent in texels of the region in the image.
    ///
    /// The default value is `[0; 3]`, which must be overridden.
    pub image_extent: [u32; 3],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for BufferImageCopy<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BufferImageCopy<'_> {
    /// Returns a default `BufferImageCopy`.
    #[inline]
    pub const fn new() -> Self {
        BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
            image_offset: [0; 3],
            image_extent: [0; 3],
            _ne: crate::NE,
        }
    }

    pub(crate) fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::BufferImageCopy {
        let &Self {
            buffer_offset,
            buffer_row_length,
            buffer_image_height,
            mip_level,
            base_array_layer,
            layer_count,
            image_offset,
            image_extent,
            _ne: _,
        } = self;

        vk::BufferImageCopy {
            buffer_offset,
            buffer_row_length,
            buffer_image_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level,
                base_array_layer,
                layer_count,
            },
            image_offset: vk::Offset3D {
                x: image_offset[0] as i32,
                y: image_offset[1] as i32,
                z: image_offset[2] as i32,
            },
            image_extent: vk::Extent3D {
                width: image_extent[0],
                height: image_extent[1],
                depth: image_extent[2],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::HeadlessBackend,
        command_buffer::{DependencyInfo, ImageMemoryBarrier},
        device::{Device, DeviceCreateInfo, SubmitInfo},
        resource::{BufferCreateInfo, ImageCreateInfo, MemoryLocation},
    };
    use std::{ptr, sync::Arc};

    #[test]
    fn whole_buffer_copy() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let host_buffer = |size| {
            device
                .create_buffer(&BufferCreateInfo {
                    size,
                    usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                    memory_location: MemoryLocation::HostRandomAccess,
                    ..Default::default()
                })
                .unwrap()
        };
        let src = host_buffer(8);
        let dst = host_buffer(16);
        let src_ptr = device.buffer_host_address(src).unwrap().unwrap();
        let dst_ptr = device.buffer_host_address(dst).unwrap().unwrap();

        unsafe { ptr::copy_nonoverlapping([9u8; 8].as_ptr(), src_ptr.as_ptr(), 8) };

        let mut recorder = device.create_command_recorder("copy").unwrap();

        unsafe {
            recorder
                .copy_buffer(&CopyBufferInfo {
                    src_buffer: src,
                    dst_buffer: dst,
                    ..Default::default()
                })
                .unwrap()
                .copy_buffer(&CopyBufferInfo {
                    src_buffer: src,
                    dst_buffer: dst,
                    regions: &[BufferCopy {
                        src_offset: 0,
                        dst_offset: 12,
                        size: 4,
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .unwrap();
        }

        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        let mut contents = [0u8; 16];
        unsafe { ptr::copy_nonoverlapping(dst_ptr.as_ptr(), contents.as_mut_ptr(), 16) };
        assert_eq!(contents, [9, 9, 9, 9, 9, 9, 9, 9, 0, 0, 0, 0, 9, 9, 9, 9]);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn image_copies_use_transfer_layouts() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 256,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                ..Default::default()
            })
            .unwrap();
        let image = device
            .create_image(&ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                extent: [8, 8, 1],
                usage: vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
                ..Default::default()
            })
            .unwrap();

        let mut recorder = device.create_command_recorder("upload").unwrap();

        unsafe {
            recorder
                .pipeline_barrier(&DependencyInfo {
                    image_memory_barriers: &[ImageMemoryBarrier {
                        dst_stages: vk::PipelineStageFlags2::COPY,
                        dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        image,
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .unwrap()
                .copy_buffer_to_image(&CopyBufferToImageInfo {
                    src_buffer: buffer,
                    dst_image: image,
                    ..Default::default()
                })
                .unwrap()
                // Wrong on purpose: the image is not in `TRANSFER_SRC_OPTIMAL`.
                .copy_image_to_buffer(&CopyImageToBufferInfo {
                    src_image: image,
                    dst_buffer: buffer,
                    ..Default::default()
                })
                .unwrap();
        }

        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        assert_eq!(backend.validation_errors().len(), 1);
    }
}
