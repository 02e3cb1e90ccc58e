use crate::{
    command_buffer::{CommandRecorder, Result},
    resource::{BufferId, ImageId, ImageSlice},
};
use ash::vk;
use smallvec::SmallVec;
use std::ops::Range;

/// # Commands to synchronize resource accesses
impl CommandRecorder {
    /// Records a pipeline barrier.
    ///
    /// # Safety
    ///
    /// - The barriers must not leave any access unsynchronized that the surrounding commands
    ///   depend on, and the old layouts of image barriers must match the layouts the images are in
    ///   (or be `UNDEFINED`).
    pub unsafe fn pipeline_barrier(
        &mut self,
        dependency_info: &DependencyInfo<'_>,
    ) -> Result<&mut Self> {
        if dependency_info.is_empty() {
            return Ok(self);
        }

        let (memory_barriers, buffer_barriers, image_barriers) =
            self.resolve_barriers(dependency_info)?;

        log::trace!(
            "recording pipeline barrier with {} barriers",
            memory_barriers.len() + buffer_barriers.len() + image_barriers.len(),
        );

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_pipeline_barrier(
                self.handle,
                &memory_barriers,
                &buffer_barriers,
                &image_barriers,
            )
        };

        Ok(self)
    }

    /// Signals `event` once the source scope of `dependency_info` has completed, the first half
    /// of a split barrier.
    pub(crate) unsafe fn set_event(
        &mut self,
        event: vk::Event,
        dependency_info: &DependencyInfo<'_>,
    ) -> Result<&mut Self> {
        let (memory_barriers, buffer_barriers, image_barriers) =
            self.resolve_barriers(dependency_info)?;

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_set_event(
                self.handle,
                event,
                &memory_barriers,
                &buffer_barriers,
                &image_barriers,
            )
        };

        Ok(self)
    }

    /// Waits for `event`, the second half of a split barrier. `dependency_info` must be the same
    /// as the one `event` was set with.
    pub(crate) unsafe fn wait_event(
        &mut self,
        event: vk::Event,
        dependency_info: &DependencyInfo<'_>,
    ) -> Result<&mut Self> {
        let (memory_barriers, buffer_barriers, image_barriers) =
            self.resolve_barriers(dependency_info)?;

        // SAFETY: Ensured by the caller.
        unsafe {
            self.device.backend().cmd_wait_event(
                self.handle,
                event,
                &memory_barriers,
                &buffer_barriers,
                &image_barriers,
            )
        };

        Ok(self)
    }

    /// Unsignals `event` once `stages` have completed, so that the event can be set again.
    pub(crate) unsafe fn reset_event(
        &mut self,
        event: vk::Event,
        stages: vk::PipelineStageFlags2,
    ) -> &mut Self {
        // SAFETY: Ensured by the caller.
        unsafe {
            self.device
                .backend()
                .cmd_reset_event(self.handle, event, stages)
        };

        self
    }

    #[allow(clippy::type_complexity)]
    fn resolve_barriers(
        &self,
        dependency_info: &DependencyInfo<'_>,
    ) -> Result<(
        SmallVec<[vk::MemoryBarrier2<'static>; 2]>,
        SmallVec<[vk::BufferMemoryBarrier2<'static>; 8]>,
        SmallVec<[vk::ImageMemoryBarrier2<'static>; 8]>,
    )> {
        let &DependencyInfo {
            memory_barriers,
            buffer_memory_barriers,
            image_memory_barriers,
            _ne: _,
        } = dependency_info;

        let memory_barriers_vk = memory_barriers
            .iter()
            .map(|barrier| {
                let &MemoryBarrier {
                    src_stages,
                    src_access,
                    dst_stages,
                    dst_access,
                    _ne: _,
                } = barrier;

                vk::MemoryBarrier2::default()
                    .src_stage_mask(src_stages)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stages)
                    .dst_access_mask(dst_access)
            })
            .collect();

        let buffer_memory_barriers_vk = buffer_memory_barriers
            .iter()
            .map(|barrier| {
                let &BufferMemoryBarrier {
                    src_stages,
                    src_access,
                    dst_stages,
                    dst_access,
                    buffer,
                    ref range,
                    _ne: _,
                } = barrier;

                let buffer = self.resolve_buffer(buffer)?;

                Ok(vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src_stages)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stages)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer)
                    .offset(range.start)
                    .size(range.end - range.start))
            })
            .collect::<Result<_>>()?;

        let image_memory_barriers_vk = image_memory_barriers
            .iter()
            .map(|barrier| {
                let &ImageMemoryBarrier {
                    src_stages,
                    src_access,
                    dst_stages,
                    dst_access,
                    old_layout,
                    new_layout,
                    image,
                    slice,
                    _ne: _,
                } = barrier;

                let image = self.device.image_native(image)?;

                Ok(vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stages)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stages)
                    .dst_access_mask(dst_access)
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.handle)
                    .subresource_range(slice.to_vk(image.aspect_mask)))
            })
            .collect::<Result<_>>()?;

        Ok((
            memory_barriers_vk,
            buffer_memory_barriers_vk,
            image_memory_barriers_vk,
        ))
    }
}

/// Dependency info for barriers in a pipeline barrier command.
///
/// A pipeline barrier creates a dependency between commands recorded before the barrier (the
/// source scope) and commands recorded after it (the destination scope). The pipeline stages
/// create an *execution dependency*: the `src_stages` of commands before the barrier must be
/// completely finished before any of the `dst_stages` of commands after the barrier are allowed
/// to start. The access masks create a *memory dependency*: any `src_access` performed before the
/// barrier is made available and visible to any `dst_access` after it.
#[derive(Clone, Debug)]
pub struct DependencyInfo<'a> {
    /// Memory barriers for global operations and accesses, not limited to a single resource.
    ///
    /// The default value is empty.
    pub memory_barriers: &'a [MemoryBarrier<'a>],

    /// Memory barriers for individual buffers.
    ///
    /// The default value is empty.
    pub buffer_memory_barriers: &'a [BufferMemoryBarrier<'a>],

    /// Memory barriers for individual images.
    ///
    /// The default value is empty.
    pub image_memory_barriers: &'a [ImageMemoryBarrier<'a>],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for DependencyInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyInfo<'_> {
    /// Returns a default `DependencyInfo`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            memory_barriers: &[],
            buffer_memory_barriers: &[],
            image_memory_barriers: &[],
            _ne: crate::NE,
        }
    }

    /// Returns `true` if `self` doesn't contain any barriers.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty()
            && self.buffer_memory_barriers.is_empty()
            && self.image_memory_barriers.is_empty()
    }
}

/// A memory barrier that is applied globally.
#[derive(Clone, Debug)]
pub struct MemoryBarrier<'a> {
    /// The pipeline stages in the source scope to wait for.
    ///
    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the source scope to make available and visible.
    ///
    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The pipeline stages in the destination scope that must wait for `src_stages`.
    ///
    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the destination scope that must wait for `src_access` to be made
    /// available and visible.
    ///
    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for MemoryBarrier<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBarrier<'_> {
    /// Returns a default `MemoryBarrier`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            _ne: crate::NE,
        }
    }
}

/// A memory barrier that is applied to a single buffer.
#[derive(Clone, Debug)]
pub struct BufferMemoryBarrier<'a> {
    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    /// The buffer to apply the barrier to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub buffer: BufferId,

    /// The byte range of `buffer` to apply the barrier to.
    ///
    /// The default value is `0..0`, which must be overridden.
    pub range: Range<vk::DeviceSize>,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for BufferMemoryBarrier<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BufferMemoryBarrier<'_> {
    /// Returns a default `BufferMemoryBarrier`.
    #[inline]
    pub const fn new() -> Self {
        BufferMemoryBarrier {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            buffer: BufferId::INVALID,
            range: 0..0,
            _ne: crate::NE,
        }
    }
}

/// A memory barrier that is applied to a single image.
#[derive(Clone, Debug)]
pub struct ImageMemoryBarrier<'a> {
    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    /// The layout that the subresources are in before the barrier. `UNDEFINED` discards their
    /// contents.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub old_layout: vk::ImageLayout,

    /// The layout that the subresources are transitioned to.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub new_layout: vk::ImageLayout,

    /// The image to apply the barrier to.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    ///
    /// [`Id::INVALID`]: crate::Id::INVALID
    pub image: ImageId,

    /// The subresources of `image` to apply the barrier to.
    ///
    /// The default value is a single mip level and array layer.
    pub slice: ImageSlice,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for ImageMemoryBarrier<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ImageMemoryBarrier<'_> {
    /// Returns a default `ImageMemoryBarrier`.
    #[inline]
    pub const fn new() -> Self {
        ImageMemoryBarrier {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            image: ImageId::INVALID,
            slice: ImageSlice::new(1, 1),
            _ne: crate::NE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            headless::{BarrierResource, RecordedCommand},
            HeadlessBackend,
        },
        device::{Device, DeviceCreateInfo, SubmitInfo},
        resource::{BufferCreateInfo, ImageCreateInfo},
    };
    use std::sync::Arc;

    #[test]
    fn barriers_resolve_ids() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 32,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                ..Default::default()
            })
            .unwrap();
        let image = device
            .create_image(&ImageCreateInfo {
                format: vk::Format::D32_SFLOAT,
                extent: [4, 4, 1],
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            })
            .unwrap();

        let mut recorder = device.create_command_recorder("barriers").unwrap();
        let handle = recorder.as_raw();

        unsafe {
            recorder
                .pipeline_barrier(&DependencyInfo {
                    buffer_memory_barriers: &[BufferMemoryBarrier {
                        src_stages: vk::PipelineStageFlags2::COMPUTE_SHADER,
                        src_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
                        dst_stages: vk::PipelineStageFlags2::COMPUTE_SHADER,
                        dst_access: vk::AccessFlags2::SHADER_STORAGE_READ,
                        buffer,
                        range: 0..32,
                        ..Default::default()
                    }],
                    image_memory_barriers: &[ImageMemoryBarrier {
                        dst_stages: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                        dst_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                        image,
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .unwrap()
                // Empty barriers aren't recorded.
                .pipeline_barrier(&DependencyInfo::new())
                .unwrap();
        }

        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        let commands = backend.commands(handle).unwrap();
        assert_eq!(commands.len(), 1);

        let RecordedCommand::PipelineBarrier { barriers } = &commands[0] else {
            panic!("expected a pipeline barrier");
        };
        assert_eq!(barriers.len(), 2);
        assert!(matches!(
            barriers[0].resource,
            BarrierResource::Buffer { offset: 0, size: 32, .. },
        ));
        assert!(matches!(
            barriers[1].resource,
            BarrierResource::Image { aspect_mask: vk::ImageAspectFlags::DEPTH, .. },
        ));
        assert!(backend.validation_errors().is_empty());
    }
}
