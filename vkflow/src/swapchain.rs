//! Presenting rendered images to a surface.

use crate::{
    device::{Device, DeviceError},
    lock::Lock,
    resource::{ImageCreateInfo, ImageId},
};
use ash::vk;
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

/// A swapchain whose images are registered in the device's image table.
///
/// The images can be used like any other image, except that they can't be destroyed on their
/// own; they are destroyed along with the swapchain. Acquiring an image blocks until fewer than
/// [`max_frames_in_flight`] frames are pending on the GPU.
///
/// [`max_frames_in_flight`]: SwapchainCreateInfo::max_frames_in_flight
pub struct Swapchain {
    device: Arc<Device>,
    handle: vk::SwapchainKHR,
    images: Vec<ImageId>,
    create_info: SwapchainCreateInfo,
    state: Lock<SwapchainState>,
}

struct SwapchainState {
    current_image_index: Option<u32>,
    /// Timeline values of the submissions that presented, oldest first.
    frames_in_flight: VecDeque<u64>,
}

impl Swapchain {
    pub(crate) fn new(
        device: &Arc<Device>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<Arc<Self>, DeviceError> {
        assert_ne!(create_info.max_frames_in_flight, 0);

        let native = device.backend().create_swapchain(create_info)?;
        let image_info = ImageCreateInfo {
            format: create_info.format,
            extent: [create_info.extent[0], create_info.extent[1], 1],
            usage: create_info.image_usage,
            name: create_info.name.clone(),
            ..Default::default()
        };
        let mut images = Vec::with_capacity(native.images.len());

        for &image in &native.images {
            match device.insert_image(image, &image_info, None, true) {
                Ok(id) => images.push(id),
                Err(err) => {
                    device.zombify_swapchain(native.handle, &images);
                    return Err(err);
                }
            }
        }

        log::debug!(
            "created swapchain {:?} with {} images",
            create_info.name,
            images.len(),
        );

        Ok(Arc::new(Swapchain {
            device: device.clone(),
            handle: native.handle,
            images,
            create_info: create_info.clone(),
            state: Lock::new(SwapchainState {
                current_image_index: None,
                frames_in_flight: VecDeque::new(),
            }),
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn create_info(&self) -> &SwapchainCreateInfo {
        &self.create_info
    }

    /// Returns the IDs of the swapchain's images, in swapchain order.
    #[inline]
    pub fn images(&self) -> &[ImageId] {
        &self.images
    }

    /// Acquires the next image to render to and returns its index.
    ///
    /// Before acquiring, this waits until fewer than `max_frames_in_flight` presenting
    /// submissions are pending.
    pub fn acquire_next_image(&self, timeout: Option<Duration>) -> Result<u32, DeviceError> {
        let mut state = self.state.lock();

        while state.frames_in_flight.len() >= self.create_info.max_frames_in_flight as usize {
            let Some(value) = state.frames_in_flight.pop_front() else {
                break;
            };

            self.device.wait_for_timeline_value(value, None)?;
        }

        // SAFETY: We own the swapchain.
        let image_index = unsafe {
            self.device
                .backend()
                .acquire_next_image(self.handle, timeout)
        }?;

        state.current_image_index = Some(image_index);

        log::trace!("acquired image {image_index} of swapchain {:?}", self.create_info.name);

        Ok(image_index)
    }

    /// Returns the index of the most recently acquired image.
    #[inline]
    pub fn current_image_index(&self) -> Option<u32> {
        self.state.lock().current_image_index
    }

    /// Returns the ID of the most recently acquired image.
    pub fn current_image_id(&self) -> Option<ImageId> {
        let image_index = self.current_image_index()?;

        self.images.get(image_index as usize).copied()
    }

    /// Records that a submission presenting an image of the swapchain signals `timeline_value`.
    pub(crate) fn frame_submitted(&self, timeline_value: u64) {
        let mut state = self.state.lock();
        state.frames_in_flight.push_back(timeline_value);
        state.current_image_index = None;
    }

    #[inline]
    pub(crate) fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("images", &self.images)
            .field("create_info", &self.create_info)
            .finish_non_exhaustive()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.device.zombify_swapchain(self.handle, &self.images);
    }
}

/// Parameters to create a new [`Swapchain`].
#[derive(Clone, Debug, PartialEq)]
pub struct SwapchainCreateInfo {
    /// The surface to present to.
    ///
    /// The default value is a null handle. The headless backend ignores it.
    pub surface: vk::SurfaceKHR,

    /// The format of the swapchain images.
    ///
    /// The default value is [`vk::Format::B8G8R8A8_SRGB`].
    pub format: vk::Format,

    /// The extent of the swapchain images, in pixels.
    ///
    /// The default value is `[0; 2]`, which must be overridden.
    pub extent: [u32; 2],

    /// The number of images in the swapchain.
    ///
    /// The default value is `3`.
    pub image_count: u32,

    /// The default value is [`vk::PresentModeKHR::FIFO`].
    pub present_mode: vk::PresentModeKHR,

    /// The default value is [`vk::ImageUsageFlags::COLOR_ATTACHMENT`].
    pub image_usage: vk::ImageUsageFlags,

    /// The maximum number of presenting submissions that may be pending before acquiring an
    /// image blocks. Must not be zero.
    ///
    /// The default value is `2`.
    pub max_frames_in_flight: u32,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for SwapchainCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SwapchainCreateInfo {
    /// Returns a default `SwapchainCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        SwapchainCreateInfo {
            surface: vk::SurfaceKHR::null(),
            format: vk::Format::B8G8R8A8_SRGB,
            extent: [0; 2],
            image_count: 3,
            present_mode: vk::PresentModeKHR::FIFO,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            max_frames_in_flight: 2,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}
