use crate::{
    command_buffer::{CommandRecorder, Result},
    resource::{AccessType, BufferId, ImageId, ImageLayoutType, ImageSlice},
};
use ash::vk;
use smallvec::SmallVec;

/// # Commands to fill resources with new data
impl CommandRecorder {
    /// Fills a region of a buffer with repeated copies of a 32-bit value.
    ///
    /// # Safety
    ///
    /// - The region must be in bounds of the buffer, and the access must be synchronized.
    pub unsafe fn fill_buffer(
        &mut self,
        fill_buffer_info: &FillBufferInfo<'_>,
    ) -> Result<&mut Self> {
        let &FillBufferInfo {
            dst_buffer,
            dst_offset,
            size,
            data,
            _ne: _,
        } = fill_buffer_info;

        let dst = self.device.buffer_native(dst_buffer)?;

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device
                .backend()
                .cmd_fill_buffer(self.handle, dst.handle, dst_offset, size, data)
        };

        Ok(self)
    }

    /// Clears a color image with a specific value.
    ///
    /// # Safety
    ///
    /// - The image must be in the layout that `image_layout` resolves to, and the access must be
    ///   synchronized.
    pub unsafe fn clear_color_image(
        &mut self,
        clear_info: &ClearColorImageInfo<'_>,
    ) -> Result<&mut Self> {
        let &ClearColorImageInfo {
            image,
            image_layout,
            clear_value,
            regions,
            _ne: _,
        } = clear_info;

        let image = self.device.image_native(image)?;
        let image_layout = AccessType::ClearTransferWrite.image_layout(image_layout);

        let regions_vk = if regions.is_empty() {
            SmallVec::<[_; 8]>::from_elem(image.whole_slice.to_vk(image.aspect_mask), 1)
        } else {
            regions
                .iter()
                .map(|slice| slice.to_vk(image.aspect_mask))
                .collect()
        };

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_clear_color_image(
                self.handle,
                image.handle,
                image_layout,
                &clear_value.to_vk(),
                &regions_vk,
            )
        };

        Ok(self)
    }
}

/// Parameters to fill a region of a buffer with repeated copies of a value.
#[derive(Clone, Debug)]
pub struct FillBufferInfo<'a> {
    /// The buffer to fill.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub dst_buffer: BufferId,

    /// The offset in bytes from the start of the buffer. Must be a multiple of 4.
    ///
    /// The default value is `0`.
    pub dst_offset: vk::DeviceSize,

    /// The number of bytes to fill. Must be a multiple of 4, or [`vk::WHOLE_SIZE`] to fill up to
    /// the end of the buffer.
    ///
    /// The default value is [`vk::WHOLE_SIZE`].
    pub size: vk::DeviceSize,

    /// The value to fill with.
    ///
    /// The default value is `0`.
    pub data: u32,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for FillBufferInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl FillBufferInfo<'_> {
    /// Returns a default `FillBufferInfo`.
    #[inline]
    pub const fn new() -> Self {
        FillBufferInfo {
            dst_buffer: BufferId::INVALID,
            dst_offset: 0,
            size: vk::WHOLE_SIZE,
            data: 0,
            _ne: crate::NE,
        }
    }
}

/// Parameters to clear a color image.
#[derive(Clone, Debug)]
pub struct ClearColorImageInfo<'a> {
    /// The image to clear.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub image: ImageId,

    /// The layout type that the image is in.
    ///
    /// The default value is [`ImageLayoutType::Optimal`].
    pub image_layout: ImageLayoutType,

    /// The color value to clear the image to.
    ///
    /// The default value is `ClearColorValue::Float([0.0; 4])`.
    pub clear_value: ClearColorValue,

    /// The subresources of the image to clear.
    ///
    /// The default value is empty, which means that the whole image is cleared.
    pub regions: &'a [ImageSlice],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for ClearColorImageInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ClearColorImageInfo<'_> {
    /// Returns a default `ClearColorImageInfo`.
    #[inline]
    pub const fn new() -> Self {
        ClearColorImageInfo {
            image: ImageId::INVALID,
            image_layout: ImageLayoutType::Optimal,
            clear_value: ClearColorValue::Float([0.0; 4]),
            regions: &[],
            _ne: crate::NE,
        }
    }
}

/// A value to clear a color image or attachment to. Which variant must be used depends on the
/// numeric type of the format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearColorValue {
    /// For floating-point and normalized formats.
    Float([f32; 4]),

    /// For signed integer formats.
    Int([i32; 4]),

    /// For unsigned integer formats.
    Uint([u32; 4]),
}

impl ClearColorValue {
    pub(crate) fn to_vk(self) -> vk::ClearColorValue {
        match self {
            Self::Float(float32) => vk::ClearColorValue { float32 },
            Self::Int(int32) => vk::ClearColorValue { int32 },
            Self::Uint(uint32) => vk::ClearColorValue { uint32 },
        }
    }
}

impl From<[f32; 4]> for ClearColorValue {
    #[inline]
    fn from(value: [f32; 4]) -> Self {
        Self::Float(value)
    }
}

impl From<[i32; 4]> for ClearColorValue {
    #[inline]
    fn from(value: [i32; 4]) -> Self {
        Self::Int(value)
    }
}

impl From<[u32; 4]> for ClearColorValue {
    #[inline]
    fn from(value: [u32; 4]) -> Self {
        Self::Uint(value)
    }
}
