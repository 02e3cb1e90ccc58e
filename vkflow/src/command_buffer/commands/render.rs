use crate::{
    command_buffer::{ClearColorValue, CommandRecorder, Result},
    resource::ImageViewId,
};
use ash::vk;
use smallvec::SmallVec;

/// # Commands for dynamic rendering
impl CommandRecorder {
    /// Begins a rendering scope.
    ///
    /// The render area defaults to the extent of the first attachment at the base mip level of
    /// its view.
    ///
    /// # Safety
    ///
    /// - Every attachment's image must be in the given layout, and the accesses must be
    ///   synchronized.
    ///
    /// # Panics
    ///
    /// - Panics if a rendering scope is already open.
    pub unsafe fn begin_rendering(
        &mut self,
        rendering_info: &RenderingInfo<'_>,
    ) -> Result<&mut Self> {
        assert!(!self.in_rendering, "a rendering scope is already open");

        let &RenderingInfo {
            render_area_offset,
            render_area_extent,
            color_attachments,
            ref depth_attachment,
            _ne: _,
        } = rendering_info;

        let color_attachments_vk = color_attachments
            .iter()
            .map(|attachment| self.resolve_attachment(attachment))
            .collect::<Result<SmallVec<[_; 4]>>>()?;
        let depth_attachment_vk = depth_attachment
            .as_ref()
            .map(|attachment| self.resolve_attachment(attachment))
            .transpose()?;

        let render_area_extent = if render_area_extent == [0, 0] {
            match color_attachments.first().or(depth_attachment.as_ref()) {
                Some(attachment) => self.attachment_extent(attachment.image_view)?,
                None => [0, 0],
            }
        } else {
            render_area_extent
        };

        let render_area = vk::Rect2D {
            offset: vk::Offset2D {
                x: render_area_offset[0] as i32,
                y: render_area_offset[1] as i32,
            },
            extent: vk::Extent2D {
                width: render_area_extent[0],
                height: render_area_extent[1],
            },
        };

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_begin_rendering(
                self.handle,
                render_area,
                &color_attachments_vk,
                depth_attachment_vk.as_ref(),
            )
        };

        self.in_rendering = true;

        Ok(self)
    }

    /// Ends the rendering scope.
    ///
    /// # Safety
    ///
    /// - The accesses made during the scope must be synchronized.
    ///
    /// # Panics
    ///
    /// - Panics if no rendering scope is open.
    pub unsafe fn end_rendering(&mut self) -> &mut Self {
        assert!(self.in_rendering, "no rendering scope is open");

        // SAFETY: Ensured by the caller.
        unsafe { self.device.backend().cmd_end_rendering(self.handle) };

        self.in_rendering = false;

        self
    }

    fn resolve_attachment(
        &self,
        attachment: &RenderingAttachmentInfo,
    ) -> Result<vk::RenderingAttachmentInfo<'static>> {
        let view = self.device.image_view_native(attachment.image_view)?;

        Ok(vk::RenderingAttachmentInfo::default()
            .image_view(view.handle)
            .image_layout(attachment.image_layout)
            .load_op(attachment.load_op)
            .store_op(attachment.store_op)
            .clear_value(attachment.clear_value.to_vk()))
    }

    fn attachment_extent(&self, image_view: ImageViewId) -> Result<[u32; 2]> {
        let view = self.device.image_view_native(image_view)?;
        let image = self.device.image_native(view.image)?;
        let mip_level = view.slice.base_mip_level;

        Ok([
            (image.extent[0] >> mip_level).max(1),
            (image.extent[1] >> mip_level).max(1),
        ])
    }
}

/// Parameters to begin a rendering scope.
#[derive(Clone, Debug)]
pub struct RenderingInfo<'a> {
    /// The offset of the render area, in pixels.
    ///
    /// The default value is `[0; 2]`.
    pub render_area_offset: [u32; 2],

    /// The extent of the render area, in pixels.
    ///
    /// The default value is `[0; 2]`, which means the extent of the first attachment.
    pub render_area_extent: [u32; 2],

    /// The color attachments to render to.
    ///
    /// The default value is empty.
    pub color_attachments: &'a [RenderingAttachmentInfo],

    /// The depth/stencil attachment to render to.
    ///
    /// The default value is `None`.
    pub depth_attachment: Option<RenderingAttachmentInfo>,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for RenderingInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RenderingInfo<'_> {
    /// Returns a default `RenderingInfo`.
    #[inline]
    pub const fn new() -> Self {
        RenderingInfo {
            render_area_offset: [0; 2],
            render_area_extent: [0; 2],
            color_attachments: &[],
            depth_attachment: None,
            _ne: crate::NE,
        }
    }
}

/// An attachment of a rendering scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingAttachmentInfo {
    /// The view to render to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub image_view: ImageViewId,

    /// The layout that the view's subresources are in during rendering.
    ///
    /// The default value is [`vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL`].
    pub image_layout: vk::ImageLayout,

    /// What happens to the contents of the attachment at the start of rendering.
    ///
    /// The default value is [`vk::AttachmentLoadOp::DONT_CARE`].
    pub load_op: vk::AttachmentLoadOp,

    /// What happens to the contents of the attachment at the end of rendering.
    ///
    /// The default value is [`vk::AttachmentStoreOp::STORE`].
    pub store_op: vk::AttachmentStoreOp,

    /// The value to clear the attachment to if `load_op` is `CLEAR`.
    ///
    /// The default value is `ClearValue::Color(ClearColorValue::Float([0.0; 4]))`.
    pub clear_value: ClearValue,
}

impl Default for RenderingAttachmentInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RenderingAttachmentInfo {
    /// Returns a default `RenderingAttachmentInfo`.
    #[inline]
    pub const fn new() -> Self {
        RenderingAttachmentInfo {
            image_view: ImageViewId::INVALID,
            image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: ClearValue::Color(ClearColorValue::Float([0.0; 4])),
        }
    }
}

/// A value to clear an attachment to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color(ClearColorValue),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub(crate) fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(color) => vk::ClearValue {
                color: color.to_vk(),
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

impl From<ClearColorValue> for ClearValue {
    #[inline]
    fn from(value: ClearColorValue) -> Self {
        Self::Color(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{headless::RecordedCommand, HeadlessBackend},
        device::{Device, DeviceCreateInfo},
        resource::{ImageCreateInfo, ImageSlice, ImageViewCreateInfo},
    };
    use std::sync::Arc;

    #[test]
    fn render_area_defaults_to_attachment_extent() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let image = device
            .create_image(&ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                extent: [64, 32, 1],
                mip_levels: 3,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ..Default::default()
            })
            .unwrap();
        let mip_view = device
            .create_image_view(&ImageViewCreateInfo {
                image,
                slice: ImageSlice {
                    base_mip_level: 1,
                    ..ImageSlice::new(1, 1)
                },
                ..Default::default()
            })
            .unwrap();

        let mut recorder = device.create_command_recorder("render").unwrap();
        let handle = recorder.as_raw();

        unsafe {
            recorder
                .begin_rendering(&RenderingInfo {
                    color_attachments: &[RenderingAttachmentInfo {
                        image_view: mip_view,
                        load_op: vk::AttachmentLoadOp::CLEAR,
                        clear_value: ClearColorValue::Uint([1, 2, 3, 4]).into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .unwrap();
            assert!(recorder.is_rendering());
            recorder.end_rendering();
        }

        let commands = backend.commands(handle).unwrap();
        let RecordedCommand::BeginRendering {
            render_area,
            color_attachments,
            depth_attachment,
        } = &commands[0]
        else {
            panic!("expected the beginning of a rendering scope");
        };

        assert_eq!(render_area.extent.width, 32);
        assert_eq!(render_area.extent.height, 16);
        assert_eq!(color_attachments[0].clear_value, [1, 2, 3, 4]);
        assert_eq!(color_attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert!(depth_attachment.is_none());
        assert!(matches!(commands[1], RecordedCommand::EndRendering));
    }

    #[test]
    #[should_panic = "no rendering scope is open"]
    fn unbalanced_end_rendering() {
        let device =
            Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap();
        let mut recorder = device.create_command_recorder("render").unwrap();

        unsafe { recorder.end_rendering() };
    }
}
