//! Recording commands to execute on the device.

pub use self::commands::{clear::*, copy::*, render::*, sync::*};
use crate::{
    device::{Device, DeviceError},
    resource::{BufferId, ImageId, ImageViewId, SamplerId},
    swapchain::Swapchain,
    zombie::ZombieBatch,
    InvalidIdError,
};
use ash::vk;
use std::{fmt, mem, sync::Arc};

mod commands;

/// A command buffer in the recording state.
///
/// Commands refer to resources by ID; the IDs are resolved to native handles when the command is
/// recorded, so a resource must be alive at that point. Resources destroyed through the
/// `destroy_*_deferred` methods stay alive until the recorded commands have completed.
///
/// Call [`end`] to finish recording, then hand the result to [`Device::submit`]. Dropping the
/// recorder instead discards the recorded commands.
///
/// [`end`]: Self::end
pub struct CommandRecorder {
    device: Arc<Device>,
    handle: vk::CommandBuffer,
    name: String,
    /// Keeps the device from collecting zombies that the recorded commands may use.
    recording: u64,
    deferred: Vec<Deferred>,
    presents: Vec<Present>,
    in_rendering: bool,
}

/// An object whose destruction waits for a command buffer's submission.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Deferred {
    Buffer(BufferId),
    Image(ImageId),
    ImageView(ImageViewId),
    Sampler(SamplerId),
    Event(vk::Event),
}

/// A presentation that is issued right after the command buffer is submitted.
pub(crate) struct Present {
    pub(crate) swapchain: Arc<Swapchain>,
    pub(crate) image_index: u32,
}

impl CommandRecorder {
    pub(crate) fn new(device: &Arc<Device>, name: &str) -> Result<Self, DeviceError> {
        let handle = device.backend().begin_command_buffer(name)?;
        let recording = device.begin_recording();

        Ok(CommandRecorder {
            device: device.clone(),
            handle,
            name: name.to_owned(),
            recording,
            deferred: Vec::new(),
            presents: Vec::new(),
            in_rendering: false,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the native command buffer.
    ///
    /// While this method is safe, recording into the command buffer directly isn't. You must
    /// guarantee that any subresources you use are either accounted for in the task's declared
    /// accesses, or don't require any synchronization.
    #[inline]
    pub fn as_raw(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Destroys the buffer once the recorded commands have completed. The ID is invalid from the
    /// moment the commands are submitted.
    pub fn destroy_buffer_deferred(&mut self, id: BufferId) -> &mut Self {
        self.deferred.push(Deferred::Buffer(id));

        self
    }

    /// Destroys the image and its default view once the recorded commands have completed.
    pub fn destroy_image_deferred(&mut self, id: ImageId) -> &mut Self {
        self.deferred.push(Deferred::Image(id));

        self
    }

    /// Destroys the image view once the recorded commands have completed.
    pub fn destroy_image_view_deferred(&mut self, id: ImageViewId) -> &mut Self {
        self.deferred.push(Deferred::ImageView(id));

        self
    }

    /// Destroys the sampler once the recorded commands have completed.
    pub fn destroy_sampler_deferred(&mut self, id: SamplerId) -> &mut Self {
        self.deferred.push(Deferred::Sampler(id));

        self
    }

    pub(crate) fn destroy_event_deferred(&mut self, event: vk::Event) {
        self.deferred.push(Deferred::Event(event));
    }

    /// Queues the presentation of an acquired swapchain image, to be issued right after the
    /// recorded commands are submitted. The image must be in the `PRESENT_SRC_KHR` layout by the
    /// end of the command buffer.
    ///
    /// # Panics
    ///
    /// - Panics if `swapchain` was created on a different device.
    pub fn queue_present(&mut self, swapchain: &Arc<Swapchain>, image_index: u32) -> &mut Self {
        assert!(
            Arc::ptr_eq(swapchain.device(), &self.device),
            "the swapchain was created on a different device",
        );

        self.presents.push(Present {
            swapchain: swapchain.clone(),
            image_index,
        });

        self
    }

    /// Returns `true` if a rendering scope is open.
    #[inline]
    pub fn is_rendering(&self) -> bool {
        self.in_rendering
    }

    /// Finishes recording.
    ///
    /// # Panics
    ///
    /// - Panics if a rendering scope is still open.
    pub fn end(mut self) -> Result<ExecutableCommands, DeviceError> {
        assert!(
            !self.in_rendering,
            "`end_rendering` must be called before ending the command buffer",
        );

        // SAFETY: The command buffer is in the recording state.
        unsafe { self.device.backend().end_command_buffer(self.handle) }?;

        let handle = mem::replace(&mut self.handle, vk::CommandBuffer::null());

        Ok(ExecutableCommands {
            device: self.device.clone(),
            handle,
            recording: self.recording,
            deferred: mem::take(&mut self.deferred),
            presents: mem::take(&mut self.presents),
        })
    }

    pub(crate) fn resolve_buffer(&self, id: BufferId) -> Result<vk::Buffer, InvalidIdError> {
        Ok(self.device.buffer_native(id)?.handle)
    }
}

impl fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("in_rendering", &self.in_rendering)
            .finish_non_exhaustive()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if self.handle == vk::CommandBuffer::null() {
            return;
        }

        log::debug!("discarding command buffer {:?}", self.name);

        let batch = ZombieBatch {
            command_buffers: vec![self.handle],
            ..Default::default()
        };
        self.device.end_recording(self.recording);
        self.device
            .destroy_deferred(mem::take(&mut self.deferred), batch, None);
    }
}

/// Commands that have finished recording and can be submitted with [`Device::submit`].
///
/// Dropping the commands without submitting them discards them, and performs their deferred
/// destructions at the current timeline value.
pub struct ExecutableCommands {
    device: Arc<Device>,
    handle: vk::CommandBuffer,
    recording: u64,
    deferred: Vec<Deferred>,
    presents: Vec<Present>,
}

impl ExecutableCommands {
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn as_raw(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Takes ownership of everything that's pinned at the submission's timeline value.
    pub(crate) fn take_for_submission(
        &mut self,
    ) -> (vk::CommandBuffer, u64, Vec<Deferred>, Vec<Present>) {
        (
            mem::replace(&mut self.handle, vk::CommandBuffer::null()),
            self.recording,
            mem::take(&mut self.deferred),
            mem::take(&mut self.presents),
        )
    }
}

impl fmt::Debug for ExecutableCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableCommands")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutableCommands {
    fn drop(&mut self) {
        if self.handle == vk::CommandBuffer::null() {
            return;
        }

        let batch = ZombieBatch {
            command_buffers: vec![self.handle],
            ..Default::default()
        };
        self.device.end_recording(self.recording);
        self.device
            .destroy_deferred(mem::take(&mut self.deferred), batch, None);
    }
}

type Result<T = (), E = InvalidIdError> = ::std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{headless::RecordedCommand, HeadlessBackend},
        device::{DeviceCreateInfo, SubmitInfo},
        resource::{BufferCreateInfo, MemoryLocation},
    };

    fn device() -> (Arc<HeadlessBackend>, Arc<Device>) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();

        (backend, device)
    }

    fn buffer(device: &Device) -> BufferId {
        device
            .create_buffer(&BufferCreateInfo {
                size: 64,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                memory_location: MemoryLocation::HostRandomAccess,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn deferred_destruction_is_pinned_at_submission() {
        let (backend, device) = device();
        let baseline = backend.live_object_count();
        let buffer = buffer(&device);

        let mut recorder = device.create_command_recorder("frame").unwrap();
        recorder.destroy_buffer_deferred(buffer);
        let commands = recorder.end().unwrap();

        // Still alive until the submission.
        assert!(device.is_buffer_valid(buffer));

        device.submit([commands], &SubmitInfo::new()).unwrap();
        assert!(!device.is_buffer_valid(buffer));
        assert_eq!(device.zombie_count(), 2);

        device.collect_garbage().unwrap();
        assert_eq!(backend.live_object_count(), baseline);
    }

    #[test]
    fn discarded_recorder_releases_everything() {
        let (backend, device) = device();
        let baseline = backend.live_object_count();
        let buffer = buffer(&device);

        let mut recorder = device.create_command_recorder("discarded").unwrap();
        recorder.destroy_buffer_deferred(buffer);
        drop(recorder);

        assert!(!device.is_buffer_valid(buffer));
        device.collect_garbage().unwrap();
        assert_eq!(backend.live_object_count(), baseline);
        assert_eq!(backend.submission_count(), 0);

        let commands = device.create_command_recorder("unsubmitted").unwrap().end().unwrap();
        drop(commands);
        device.collect_garbage().unwrap();
        assert_eq!(backend.live_object_count(), baseline);
    }

    #[test]
    fn commands_recorded_in_order() {
        let (backend, device) = device();
        let buffer = buffer(&device);
        let mut recorder = device.create_command_recorder("fill").unwrap();

        unsafe {
            recorder
                .fill_buffer(&FillBufferInfo {
                    dst_buffer: buffer,
                    dst_offset: 0,
                    size: 8,
                    data: 0x0101_0101,
                    ..Default::default()
                })
                .unwrap()
                .fill_buffer(&FillBufferInfo {
                    dst_buffer: buffer,
                    dst_offset: 4,
                    size: 4,
                    data: 0x0202_0202,
                    ..Default::default()
                })
                .unwrap();
        }

        let handle = recorder.as_raw();
        let commands = recorder.end().unwrap();
        device.submit([commands], &SubmitInfo::new()).unwrap();

        let recorded = backend.commands(handle).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(
            recorded[1],
            RecordedCommand::FillBuffer { offset: 4, .. },
        ));

        let address = device.buffer_host_address(buffer).unwrap().unwrap();
        let mut contents = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(address.as_ptr(), contents.as_mut_ptr(), 8);
        }
        assert_eq!(contents, [1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn destroyed_resources_outlive_open_recordings() {
        let (backend, device) = device();
        let buffer = buffer(&device);

        let mut recorder = device.create_command_recorder("fill").unwrap();
        unsafe {
            recorder
                .fill_buffer(&FillBufferInfo {
                    dst_buffer: buffer,
                    size: 4,
                    ..Default::default()
                })
                .unwrap();
        }

        device.destroy_buffer(buffer).unwrap();

        // An unrelated submission completing doesn't release anything the open recording may
        // use.
        let other = device.create_command_recorder("other").unwrap().end().unwrap();
        assert_eq!(device.submit([other], &SubmitInfo::new()), Ok(1));
        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 2);

        let value = device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();
        assert_eq!(value, 2);
        assert!(backend.validation_errors().is_empty());

        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }

    #[test]
    fn stale_ids_fail_to_record() {
        let (_, device) = device();
        let buffer = buffer(&device);
        device.destroy_buffer(buffer).unwrap();

        let mut recorder = device.create_command_recorder("stale").unwrap();
        let result = unsafe {
            recorder.fill_buffer(&FillBufferInfo {
                dst_buffer: buffer,
                size: 4,
                ..Default::default()
            })
        };

        assert_eq!(result.err(), Some(InvalidIdError::new(buffer)));
    }
}
