//! The boundary between the crate and the native graphics API.
//!
//! Everything above this module refers to resources by [`Id`] only. The [`Device`] resolves IDs
//! to native handles and hands those to a [`Backend`], which is the only place where native
//! objects are created, destroyed or recorded into. Barrier and attachment data cross the
//! boundary as `ash::vk` synchronization2 structures, so a Vulkan backend can pass them through
//! unchanged.
//!
//! [`HeadlessBackend`] is a complete software implementation used for testing without a GPU.
//!
//! [`Id`]: crate::Id
//! [`Device`]: crate::device::Device

pub use self::headless::HeadlessBackend;
use crate::{
    resource::{
        BufferCreateInfo, ImageCreateInfo, ImageViewCreateInfo, MemoryBlockCreateInfo,
        SamplerCreateInfo,
    },
    swapchain::SwapchainCreateInfo,
};
use ash::vk;
use std::{error::Error, fmt, ptr::NonNull, time::Duration};

pub mod headless;

/// A native graphics API driven by a [`Device`].
///
/// Creation functions are safe to call: they only ever produce new objects. Destruction and
/// recording functions are `unsafe` because the caller must guarantee that the handles passed in
/// were created by this backend, are still alive, and (for destruction) are no longer in use by
/// any pending GPU work.
///
/// [`Device`]: crate::device::Device
pub trait Backend: Send + Sync + 'static {
    /// Creates a buffer. When `memory` is given, the buffer is bound to that memory at the given
    /// offset; otherwise the backend allocates dedicated memory for it.
    fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
        memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    ) -> Result<NativeBuffer, BackendError>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Creates an image. When `memory` is given, the image is bound to that memory at the given
    /// offset; otherwise the backend allocates dedicated memory for it.
    fn create_image(
        &self,
        create_info: &ImageCreateInfo,
        memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    ) -> Result<vk::Image, BackendError>;

    unsafe fn destroy_image(&self, image: vk::Image);

    /// Creates a view of `image`. The `image` field of `create_info` is the image's ID and is only
    /// informative here.
    fn create_image_view(
        &self,
        image: vk::Image,
        image_info: &ImageCreateInfo,
        create_info: &ImageViewCreateInfo,
    ) -> Result<vk::ImageView, BackendError>;

    unsafe fn destroy_image_view(&self, image_view: vk::ImageView);

    fn create_sampler(&self, create_info: &SamplerCreateInfo) -> Result<vk::Sampler, BackendError>;

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);

    fn allocate_memory(
        &self,
        create_info: &MemoryBlockCreateInfo,
    ) -> Result<vk::DeviceMemory, BackendError>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    fn create_timeline_semaphore(
        &self,
        initial_value: u64,
        name: &str,
    ) -> Result<vk::Semaphore, BackendError>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Returns the current counter value of a timeline semaphore.
    unsafe fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, BackendError>;

    /// Blocks until the counter of `semaphore` reaches `value` or `timeout` elapses. Returns
    /// `false` on timeout. `None` waits indefinitely.
    unsafe fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Sets the counter of `semaphore` from the host.
    unsafe fn signal_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<(), BackendError>;

    fn create_event(&self, name: &str) -> Result<vk::Event, BackendError>;

    unsafe fn destroy_event(&self, event: vk::Event);

    fn create_swapchain(
        &self,
        create_info: &SwapchainCreateInfo,
    ) -> Result<NativeSwapchain, BackendError>;

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Allocates a primary command buffer and begins recording into it.
    fn begin_command_buffer(&self, name: &str) -> Result<vk::CommandBuffer, BackendError>;

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer)
        -> Result<(), BackendError>;

    unsafe fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    );

    unsafe fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    );

    /// Waits for `event`, then applies the barriers. The barriers must be the ones the event was
    /// set with.
    unsafe fn cmd_wait_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    );

    unsafe fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags2,
    );

    unsafe fn cmd_begin_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        render_area: vk::Rect2D,
        color_attachments: &[vk::RenderingAttachmentInfo<'_>],
        depth_attachment: Option<&vk::RenderingAttachmentInfo<'_>>,
    );

    unsafe fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer);

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    unsafe fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    );

    unsafe fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    /// Submits command buffers to the queue.
    ///
    /// # Safety
    ///
    /// - Every command buffer must have been ended.
    /// - Every semaphore must be alive until the submission completes.
    unsafe fn submit(&self, submit: &NativeSubmit<'_>) -> Result<(), BackendError>;

    /// Acquires the index of the next presentable image of `swapchain`.
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Option<Duration>,
    ) -> Result<u32, BackendError>;

    /// Queues the presentation of an acquired swapchain image. The presentation happens after
    /// all work previously submitted to the queue.
    unsafe fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> Result<(), BackendError>;

    /// Blocks until all submitted work has completed.
    fn wait_idle(&self) -> Result<(), BackendError>;
}

/// A buffer created by a [`Backend`].
#[derive(Clone, Copy, Debug)]
pub struct NativeBuffer {
    pub handle: vk::Buffer,

    /// The buffer's address as seen by shaders.
    pub device_address: vk::DeviceAddress,

    /// Where the buffer's memory is mapped on the host, if it's host-visible.
    pub host_address: Option<NonNull<u8>>,
}

// SAFETY: The host address is only a location in mapped memory. Synchronizing access to the
// memory behind it is the user's responsibility, the same as with the GPU.
unsafe impl Send for NativeBuffer {}

// SAFETY: Same as above.
unsafe impl Sync for NativeBuffer {}

/// A swapchain created by a [`Backend`], along with its presentable images.
#[derive(Clone, Debug)]
pub struct NativeSwapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],

    /// Timeline semaphores to wait for before the command buffers execute.
    pub wait_semaphores: &'a [vk::SemaphoreSubmitInfo<'a>],

    /// Timeline semaphores to signal once the command buffers have completed.
    pub signal_semaphores: &'a [vk::SemaphoreSubmitInfo<'a>],
}

/// Error that can be returned by a [`Backend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    DeviceLost,
    SurfaceLost,

    /// The swapchain no longer matches the surface and must be recreated.
    OutOfDate,

    InitializationFailed,

    /// The requested object or parameters aren't supported.
    Unsupported,

    /// Any other native error.
    Other(vk::Result),
}

impl From<vk::Result> for BackendError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_FEATURE_NOT_PRESENT | vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
                Self::Unsupported
            }
            result => Self::Other(result),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfHostMemory => "a host memory allocation has failed",
            Self::OutOfDeviceMemory => "a device memory allocation has failed",
            Self::DeviceLost => "the logical or physical device has been lost",
            Self::SurfaceLost => "the surface is no longer available",
            Self::OutOfDate => "the swapchain is out of date and must be recreated",
            Self::InitializationFailed => "initialization of an object could not be completed",
            Self::Unsupported => "the requested feature or format is not supported",
            Self::Other(result) => return write!(f, "the backend returned {result}"),
        };

        f.write_str(msg)
    }
}

impl Error for BackendError {}
