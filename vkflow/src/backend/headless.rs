//! A backend that runs entirely on the host.
//!
//! Recorded commands are kept as [`RecordedCommand`]s so that tests can inspect them. On
//! submission they are replayed on the host: buffer copies and fills operate on emulated memory,
//! barriers update a per-subresource layout tracker, and the signal semaphores are signaled
//! right away. Replaying also validates the layouts that commands claim an image to be in; any
//! mismatch is kept as a validation error instead of failing the submission.

use super::{Backend, BackendError, NativeBuffer, NativeSubmit, NativeSwapchain};
use crate::{
    resource::{
        BufferCreateInfo, ImageCreateInfo, ImageSlice, ImageViewCreateInfo,
        MemoryBlockCreateInfo, MemoryLocation, SamplerCreateInfo,
    },
    swapchain::SwapchainCreateInfo,
};
use ash::vk::{self, Handle};
use foldhash::HashMap;
use parking_lot::{Condvar, Mutex};
use std::{
    alloc::{self, Layout},
    fmt, mem,
    ptr::{self, NonNull},
    time::{Duration, Instant},
};

const DEVICE_ADDRESS_BASE: vk::DeviceAddress = 0x1_0000_0000;

const ALLOCATION_ALIGNMENT: u64 = 256;

/// A [`Backend`] that emulates a device on the host.
pub struct HeadlessBackend {
    state: Mutex<State>,
    semaphore_signaled: Condvar,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_device_address: vk::DeviceAddress,
    memories: HashMap<vk::DeviceMemory, MemoryState>,
    buffers: HashMap<vk::Buffer, BufferState>,
    images: HashMap<vk::Image, ImageState>,
    image_views: HashMap<vk::ImageView, ImageViewState>,
    samplers: HashMap<vk::Sampler, String>,
    semaphores: HashMap<vk::Semaphore, u64>,
    events: HashMap<vk::Event, bool>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    submission_count: u64,
    presents: Vec<(vk::SwapchainKHR, u32)>,
    validation_errors: Vec<String>,
}

struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The allocation is plain bytes owned by the backend state.
unsafe impl Send for Allocation {}

impl Allocation {
    fn new(size: vk::DeviceSize) -> Result<Self, BackendError> {
        let size = usize::try_from(size).map_err(|_| BackendError::OutOfDeviceMemory)?;
        let layout = Layout::from_size_align(size.max(1), ALLOCATION_ALIGNMENT as usize)
            .map_err(|_| BackendError::OutOfDeviceMemory)?;

        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Allocation { ptr, layout })
            .ok_or(BackendError::OutOfHostMemory)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: The pointer was allocated with this layout in `Allocation::new`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct MemoryState {
    allocation: Allocation,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
    memory_location: MemoryLocation,
}

struct BufferState {
    ptr: NonNull<u8>,
    size: vk::DeviceSize,
    _dedicated: Option<Allocation>,
}

// SAFETY: `ptr` points into an `Allocation` owned by the backend state.
unsafe impl Send for BufferState {}

struct ImageState {
    mip_levels: u32,
    array_layers: u32,
    layouts: Vec<vk::ImageLayout>,
    owned_by_swapchain: bool,
}

impl ImageState {
    fn new(mip_levels: u32, array_layers: u32) -> Self {
        ImageState {
            mip_levels,
            array_layers,
            layouts: vec![vk::ImageLayout::UNDEFINED; (mip_levels * array_layers) as usize],
            owned_by_swapchain: false,
        }
    }

    fn resolve_range(&self, range: &vk::ImageSubresourceRange) -> ImageSlice {
        let level_count = if range.level_count == vk::REMAINING_MIP_LEVELS {
            self.mip_levels.saturating_sub(range.base_mip_level)
        } else {
            range.level_count
        };
        let layer_count = if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
            self.array_layers.saturating_sub(range.base_array_layer)
        } else {
            range.layer_count
        };

        ImageSlice {
            base_mip_level: range.base_mip_level,
            level_count,
            base_array_layer: range.base_array_layer,
            layer_count,
        }
    }

    fn subresource_indices(&self, slice: &ImageSlice) -> Option<Vec<usize>> {
        if slice.mip_levels().end > self.mip_levels
            || slice.array_layers().end > self.array_layers
        {
            return None;
        }

        let mut indices = Vec::with_capacity((slice.level_count * slice.layer_count) as usize);

        for mip_level in slice.mip_levels() {
            for array_layer in slice.array_layers() {
                indices.push((mip_level * self.array_layers + array_layer) as usize);
            }
        }

        Some(indices)
    }
}

struct ImageViewState {
    image: vk::Image,
    slice: ImageSlice,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next_image_index: u32,
}

struct CommandBufferState {
    name: String,
    commands: Vec<RecordedCommand>,
    ended: bool,
}

/// A command as recorded by the [`HeadlessBackend`].
#[derive(Clone, Debug)]
pub enum RecordedCommand {
    PipelineBarrier {
        barriers: Vec<RecordedBarrier>,
    },
    SetEvent {
        event: vk::Event,
        barriers: Vec<RecordedBarrier>,
    },
    WaitEvent {
        event: vk::Event,
        barriers: Vec<RecordedBarrier>,
    },
    ResetEvent {
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags2,
    },
    BeginRendering {
        render_area: vk::Rect2D,
        color_attachments: Vec<RecordedAttachment>,
        depth_attachment: Option<RecordedAttachment>,
    },
    EndRendering,
    CopyBuffer {
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    FillBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    ClearColorImage {
        image: vk::Image,
        image_layout: vk::ImageLayout,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
}

impl RecordedCommand {
    /// Returns the barriers of a barrier command, or an empty slice for other commands.
    pub fn barriers(&self) -> &[RecordedBarrier] {
        match self {
            Self::PipelineBarrier { barriers }
            | Self::SetEvent { barriers, .. }
            | Self::WaitEvent { barriers, .. } => barriers,
            _ => &[],
        }
    }
}

/// One barrier of a recorded barrier command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub resource: BarrierResource,
}

/// What a [`RecordedBarrier`] applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierResource {
    Global,
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Image {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
        slice: ImageSlice,
    },
}

/// One attachment of a recorded [`RecordedCommand::BeginRendering`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedAttachment {
    pub image_view: vk::ImageView,
    pub image_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    /// The bits of the clear value, as 32-bit words.
    pub clear_value: [u32; 4],
}

impl RecordedAttachment {
    fn new(info: &vk::RenderingAttachmentInfo<'_>) -> Self {
        // SAFETY: Every bit pattern is a valid `[u32; 4]`, and `color` is the largest member of
        // the union.
        let clear_value = unsafe { info.clear_value.color.uint32 };

        RecordedAttachment {
            image_view: info.image_view,
            image_layout: info.image_layout,
            load_op: info.load_op,
            store_op: info.store_op,
            clear_value,
        }
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        HeadlessBackend {
            state: Mutex::new(State {
                next_handle: 1,
                next_device_address: DEVICE_ADDRESS_BASE,
                ..Default::default()
            }),
            semaphore_signaled: Condvar::new(),
        }
    }

    /// Returns the commands recorded into `command_buffer`, or `None` if the command buffer has
    /// been freed.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Option<Vec<RecordedCommand>> {
        let state = self.state.lock();

        state
            .command_buffers
            .get(&command_buffer)
            .map(|command_buffer| command_buffer.commands.clone())
    }

    /// Returns the current layout of a subresource of `image`.
    pub fn image_layout(
        &self,
        image: vk::Image,
        mip_level: u32,
        array_layer: u32,
    ) -> Option<vk::ImageLayout> {
        let state = self.state.lock();
        let image = state.images.get(&image)?;

        if mip_level >= image.mip_levels || array_layer >= image.array_layers {
            return None;
        }

        Some(image.layouts[(mip_level * image.array_layers + array_layer) as usize])
    }

    /// Returns every presentation so far, in order.
    pub fn presents(&self) -> Vec<(vk::SwapchainKHR, u32)> {
        self.state.lock().presents.clone()
    }

    /// Returns the number of queue submissions so far.
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submission_count
    }

    /// Returns the validation errors found while replaying submissions.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    /// Returns the number of objects that have been created and not yet destroyed.
    pub fn live_object_count(&self) -> usize {
        let state = self.state.lock();

        state.memories.len()
            + state.buffers.len()
            + state
                .images
                .values()
                .filter(|image| !image.owned_by_swapchain)
                .count()
            + state.image_views.len()
            + state.samplers.len()
            + state.semaphores.len()
            + state.events.len()
            + state.swapchains.len()
            + state.command_buffers.len()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessBackend").finish_non_exhaustive()
    }
}

impl State {
    fn next_handle<H: Handle>(&mut self) -> H {
        let raw = self.next_handle;
        self.next_handle += 1;

        H::from_raw(raw)
    }

    fn reserve_device_address(&mut self, size: vk::DeviceSize) -> vk::DeviceAddress {
        let address = self.next_device_address;
        self.next_device_address += size.next_multiple_of(ALLOCATION_ALIGNMENT);

        address
    }

    fn recording(&mut self, command_buffer: vk::CommandBuffer) -> Option<&mut CommandBufferState> {
        match self.command_buffers.get_mut(&command_buffer) {
            Some(state) if !state.ended => Some(state),
            Some(state) => {
                let msg = format!("recording into ended command buffer {:?}", state.name);
                self.validation_errors.push(msg);
                None
            }
            None => {
                let msg = format!("recording into unknown command buffer {command_buffer:?}");
                self.validation_errors.push(msg);
                None
            }
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        if let Some(state) = self.recording(command_buffer) {
            state.commands.push(command);
        }
    }

    fn record_barriers(
        &self,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) -> Vec<RecordedBarrier> {
        let memory_barriers = memory_barriers.iter().map(|barrier| RecordedBarrier {
            src_stage_mask: barrier.src_stage_mask,
            src_access_mask: barrier.src_access_mask,
            dst_stage_mask: barrier.dst_stage_mask,
            dst_access_mask: barrier.dst_access_mask,
            resource: BarrierResource::Global,
        });
        let buffer_barriers = buffer_barriers.iter().map(|barrier| RecordedBarrier {
            src_stage_mask: barrier.src_stage_mask,
            src_access_mask: barrier.src_access_mask,
            dst_stage_mask: barrier.dst_stage_mask,
            dst_access_mask: barrier.dst_access_mask,
            resource: BarrierResource::Buffer {
                buffer: barrier.buffer,
                offset: barrier.offset,
                size: barrier.size,
            },
        });
        let image_barriers = image_barriers.iter().map(|barrier| {
            let range = &barrier.subresource_range;
            let slice = match self.images.get(&barrier.image) {
                Some(image) => image.resolve_range(range),
                None => ImageSlice {
                    base_mip_level: range.base_mip_level,
                    level_count: range.level_count,
                    base_array_layer: range.base_array_layer,
                    layer_count: range.layer_count,
                },
            };

            RecordedBarrier {
                src_stage_mask: barrier.src_stage_mask,
                src_access_mask: barrier.src_access_mask,
                dst_stage_mask: barrier.dst_stage_mask,
                dst_access_mask: barrier.dst_access_mask,
                resource: BarrierResource::Image {
                    image: barrier.image,
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                    aspect_mask: range.aspect_mask,
                    slice,
                },
            }
        });

        memory_barriers
            .chain(buffer_barriers)
            .chain(image_barriers)
            .collect()
    }

    fn replay(&mut self, commands: &[RecordedCommand]) {
        for command in commands {
            match command {
                RecordedCommand::PipelineBarrier { barriers } => self.apply_barriers(barriers),
                RecordedCommand::SetEvent { event, .. } => {
                    self.events.insert(*event, true);
                }
                RecordedCommand::WaitEvent { event, barriers } => {
                    if self.events.get(event) != Some(&true) {
                        let msg = format!("waiting for event {event:?}, which was never set");
                        self.validation_errors.push(msg);
                    }

                    self.apply_barriers(barriers);
                }
                RecordedCommand::ResetEvent { event, .. } => {
                    self.events.insert(*event, false);
                }
                RecordedCommand::BeginRendering {
                    color_attachments,
                    depth_attachment,
                    ..
                } => {
                    for attachment in color_attachments.iter().chain(depth_attachment) {
                        self.check_view_layout(attachment.image_view, attachment.image_layout);
                    }
                }
                RecordedCommand::EndRendering => {}
                RecordedCommand::CopyBuffer {
                    src_buffer,
                    dst_buffer,
                    regions,
                } => {
                    for region in regions {
                        self.copy_buffer(*src_buffer, *dst_buffer, region);
                    }
                }
                RecordedCommand::CopyBufferToImage {
                    dst_image: image,
                    dst_image_layout: image_layout,
                    regions,
                    ..
                }
                | RecordedCommand::CopyImageToBuffer {
                    src_image: image,
                    src_image_layout: image_layout,
                    regions,
                    ..
                } => {
                    for region in regions {
                        let layers = &region.image_subresource;
                        let range = vk::ImageSubresourceRange {
                            aspect_mask: layers.aspect_mask,
                            base_mip_level: layers.mip_level,
                            level_count: 1,
                            base_array_layer: layers.base_array_layer,
                            layer_count: layers.layer_count,
                        };
                        self.check_image_layout(*image, &range, *image_layout);
                    }
                }
                RecordedCommand::FillBuffer {
                    buffer,
                    offset,
                    size,
                    data,
                } => self.fill_buffer(*buffer, *offset, *size, *data),
                RecordedCommand::ClearColorImage {
                    image,
                    image_layout,
                    ranges,
                } => {
                    for range in ranges {
                        self.check_image_layout(*image, range, *image_layout);
                    }
                }
            }
        }
    }

    fn apply_barriers(&mut self, barriers: &[RecordedBarrier]) {
        for barrier in barriers {
            let BarrierResource::Image {
                image,
                old_layout,
                new_layout,
                slice,
                ..
            } = barrier.resource
            else {
                continue;
            };

            let Some(state) = self.images.get_mut(&image) else {
                let msg = format!("barrier on unknown image {image:?}");
                self.validation_errors.push(msg);
                continue;
            };

            let Some(indices) = state.subresource_indices(&slice) else {
                let msg = format!("barrier on {slice:?}, which is out of range of {image:?}");
                self.validation_errors.push(msg);
                continue;
            };

            for index in indices {
                let current = state.layouts[index];

                if old_layout != vk::ImageLayout::UNDEFINED && old_layout != current {
                    let msg = format!(
                        "barrier on {image:?} transitions from {old_layout:?}, but subresource \
                        {index} is in {current:?}",
                    );
                    self.validation_errors.push(msg);
                }

                state.layouts[index] = new_layout;
            }
        }
    }

    fn check_image_layout(
        &mut self,
        image: vk::Image,
        range: &vk::ImageSubresourceRange,
        expected: vk::ImageLayout,
    ) {
        let Some(state) = self.images.get(&image) else {
            let msg = format!("command uses unknown image {image:?}");
            self.validation_errors.push(msg);
            return;
        };

        let slice = state.resolve_range(range);

        let Some(indices) = state.subresource_indices(&slice) else {
            let msg = format!("command uses {slice:?}, which is out of range of {image:?}");
            self.validation_errors.push(msg);
            return;
        };

        for index in indices {
            let current = state.layouts[index];

            if current != expected {
                let msg = format!(
                    "command expects {image:?} to be in {expected:?}, but subresource {index} is \
                    in {current:?}",
                );
                self.validation_errors.push(msg);
            }
        }
    }

    fn check_view_layout(&mut self, image_view: vk::ImageView, expected: vk::ImageLayout) {
        let Some(view) = self.image_views.get(&image_view) else {
            let msg = format!("rendering to unknown image view {image_view:?}");
            self.validation_errors.push(msg);
            return;
        };

        let (image, range) = (view.image, view.slice.to_vk(vk::ImageAspectFlags::empty()));
        self.check_image_layout(image, &range, expected);
    }

    fn buffer_range(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Option<NonNull<u8>> {
        let Some(state) = self.buffers.get(&buffer) else {
            let msg = format!("command uses unknown buffer {buffer:?}");
            self.validation_errors.push(msg);
            return None;
        };

        if offset.checked_add(size).map_or(true, |end| end > state.size) {
            let msg = format!(
                "range {offset}..{} is out of bounds of {buffer:?}, which has size {}",
                offset.saturating_add(size),
                state.size,
            );
            self.validation_errors.push(msg);
            return None;
        }

        // SAFETY: The range was checked to be in bounds of the buffer's memory.
        Some(unsafe { state.ptr.add(offset as usize) })
    }

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        region: &vk::BufferCopy,
    ) {
        let src = self.buffer_range(src_buffer, region.src_offset, region.size);
        let dst = self.buffer_range(dst_buffer, region.dst_offset, region.size);

        if let (Some(src), Some(dst)) = (src, dst) {
            // SAFETY: Both ranges are in bounds. `ptr::copy` allows them to overlap.
            unsafe { ptr::copy(src.as_ptr(), dst.as_ptr(), region.size as usize) };
        }
    }

    fn fill_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        let size = if size == vk::WHOLE_SIZE {
            let buffer_size = self.buffers.get(&buffer).map_or(0, |state| state.size);
            buffer_size.saturating_sub(offset) & !3
        } else {
            size
        };

        let Some(dst) = self.buffer_range(buffer, offset, size) else {
            return;
        };

        for word in 0..(size / 4) as usize {
            // SAFETY: The range `offset..offset + size` is in bounds.
            let word_ptr = unsafe { dst.as_ptr().add(word * 4) };

            // SAFETY: The word is in bounds and the write is unaligned.
            unsafe { ptr::write_unaligned(word_ptr.cast::<u32>(), data) };
        }
    }
}

impl Backend for HeadlessBackend {
    fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
        memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    ) -> Result<NativeBuffer, BackendError> {
        if create_info.size == 0 {
            return Err(BackendError::InitializationFailed);
        }

        let mut state = self.state.lock();

        let (buffer_state, device_address, memory_location) = match memory {
            Some((memory, offset)) => {
                let memory = state
                    .memories
                    .get(&memory)
                    .ok_or(BackendError::InitializationFailed)?;

                if offset
                    .checked_add(create_info.size)
                    .map_or(true, |end| end > memory.size)
                {
                    return Err(BackendError::OutOfDeviceMemory);
                }

                // SAFETY: The range was checked to be in bounds of the memory.
                let ptr = unsafe { memory.allocation.ptr.add(offset as usize) };

                (
                    BufferState {
                        ptr,
                        size: create_info.size,
                        _dedicated: None,
                    },
                    memory.device_address + offset,
                    memory.memory_location,
                )
            }
            None => {
                let allocation = Allocation::new(create_info.size)?;
                let device_address = state.reserve_device_address(create_info.size);

                (
                    BufferState {
                        ptr: allocation.ptr,
                        size: create_info.size,
                        _dedicated: Some(allocation),
                    },
                    device_address,
                    create_info.memory_location,
                )
            }
        };

        let host_address = memory_location
            .is_host_visible()
            .then_some(buffer_state.ptr);
        let handle = state.next_handle();
        state.buffers.insert(handle, buffer_state);

        Ok(NativeBuffer {
            handle,
            device_address,
            host_address,
        })
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_image(
        &self,
        create_info: &ImageCreateInfo,
        memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    ) -> Result<vk::Image, BackendError> {
        if create_info.format == vk::Format::UNDEFINED
            || create_info.extent.contains(&0)
            || create_info.mip_levels == 0
            || create_info.array_layers == 0
        {
            return Err(BackendError::InitializationFailed);
        }

        let mut state = self.state.lock();

        if let Some((memory, _)) = memory {
            if !state.memories.contains_key(&memory) {
                return Err(BackendError::InitializationFailed);
            }
        }

        let handle = state.next_handle();
        let image = ImageState::new(create_info.mip_levels, create_info.array_layers);
        state.images.insert(handle, image);

        Ok(handle)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image);
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _image_info: &ImageCreateInfo,
        create_info: &ImageViewCreateInfo,
    ) -> Result<vk::ImageView, BackendError> {
        let mut state = self.state.lock();

        let image_state = state
            .images
            .get(&image)
            .ok_or(BackendError::InitializationFailed)?;

        if create_info.slice.is_empty()
            || image_state
                .subresource_indices(&create_info.slice)
                .is_none()
        {
            return Err(BackendError::InitializationFailed);
        }

        let handle = state.next_handle();
        state.image_views.insert(
            handle,
            ImageViewState {
                image,
                slice: create_info.slice,
            },
        );

        Ok(handle)
    }

    unsafe fn destroy_image_view(&self, image_view: vk::ImageView) {
        self.state.lock().image_views.remove(&image_view);
    }

    fn create_sampler(&self, create_info: &SamplerCreateInfo) -> Result<vk::Sampler, BackendError> {
        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.samplers.insert(handle, create_info.name.clone());

        Ok(handle)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn allocate_memory(
        &self,
        create_info: &MemoryBlockCreateInfo,
    ) -> Result<vk::DeviceMemory, BackendError> {
        if create_info.size == 0 {
            return Err(BackendError::InitializationFailed);
        }

        let allocation = Allocation::new(create_info.size)?;
        let mut state = self.state.lock();
        let device_address = state.reserve_device_address(create_info.size);
        let handle = state.next_handle();
        state.memories.insert(
            handle,
            MemoryState {
                allocation,
                size: create_info.size,
                device_address,
                memory_location: create_info.memory_location,
            },
        );

        Ok(handle)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().memories.remove(&memory);
    }

    fn create_timeline_semaphore(
        &self,
        initial_value: u64,
        _name: &str,
    ) -> Result<vk::Semaphore, BackendError> {
        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.semaphores.insert(handle, initial_value);

        Ok(handle)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    unsafe fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, BackendError> {
        self.state
            .lock()
            .semaphores
            .get(&semaphore)
            .copied()
            .ok_or(BackendError::DeviceLost)
    }

    unsafe fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();

        loop {
            let current = *state
                .semaphores
                .get(&semaphore)
                .ok_or(BackendError::DeviceLost)?;

            if current >= value {
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .semaphore_signaled
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        let current = state.semaphores.get(&semaphore).copied().unwrap_or(0);
                        return Ok(current >= value);
                    }
                }
                None => self.semaphore_signaled.wait(&mut state),
            }
        }
    }

    unsafe fn signal_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let current = state
            .semaphores
            .get_mut(&semaphore)
            .ok_or(BackendError::DeviceLost)?;

        if value <= *current {
            let msg = format!(
                "signaling {semaphore:?} with {value}, which is not greater than its current \
                value {current}",
            );
            state.validation_errors.push(msg);
        } else {
            *current = value;
        }

        drop(state);
        self.semaphore_signaled.notify_all();

        Ok(())
    }

    fn create_event(&self, _name: &str) -> Result<vk::Event, BackendError> {
        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.events.insert(handle, false);

        Ok(handle)
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        self.state.lock().events.remove(&event);
    }

    fn create_swapchain(
        &self,
        create_info: &SwapchainCreateInfo,
    ) -> Result<NativeSwapchain, BackendError> {
        if create_info.image_count == 0 || create_info.extent.contains(&0) {
            return Err(BackendError::InitializationFailed);
        }

        let mut state = self.state.lock();
        let handle = state.next_handle();
        let mut images = Vec::with_capacity(create_info.image_count as usize);

        for _ in 0..create_info.image_count {
            let image = state.next_handle();
            let mut image_state = ImageState::new(1, 1);
            image_state.owned_by_swapchain = true;
            state.images.insert(image, image_state);
            images.push(image);
        }

        state.swapchains.insert(
            handle,
            SwapchainState {
                images: images.clone(),
                next_image_index: 0,
            },
        );

        Ok(NativeSwapchain { handle, images })
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();

        if let Some(swapchain) = state.swapchains.remove(&swapchain) {
            for image in swapchain.images {
                state.images.remove(&image);
            }
        }
    }

    fn begin_command_buffer(&self, name: &str) -> Result<vk::CommandBuffer, BackendError> {
        let mut state = self.state.lock();
        let handle = state.next_handle();
        state.command_buffers.insert(
            handle,
            CommandBufferState {
                name: name.to_owned(),
                commands: Vec::new(),
                ended: false,
            },
        );

        Ok(handle)
    }

    unsafe fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let command_buffer = state
            .recording(command_buffer)
            .ok_or(BackendError::InitializationFailed)?;
        command_buffer.ended = true;

        Ok(())
    }

    unsafe fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&command_buffer);
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let mut state = self.state.lock();
        let barriers = state.record_barriers(memory_barriers, buffer_barriers, image_barriers);
        state.record(command_buffer, RecordedCommand::PipelineBarrier { barriers });
    }

    unsafe fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let mut state = self.state.lock();
        let barriers = state.record_barriers(memory_barriers, buffer_barriers, image_barriers);
        state.record(command_buffer, RecordedCommand::SetEvent { event, barriers });
    }

    unsafe fn cmd_wait_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        memory_barriers: &[vk::MemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let mut state = self.state.lock();
        let barriers = state.record_barriers(memory_barriers, buffer_barriers, image_barriers);
        state.record(command_buffer, RecordedCommand::WaitEvent { event, barriers });
    }

    unsafe fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags2,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::ResetEvent { event, stage_mask },
        );
    }

    unsafe fn cmd_begin_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        render_area: vk::Rect2D,
        color_attachments: &[vk::RenderingAttachmentInfo<'_>],
        depth_attachment: Option<&vk::RenderingAttachmentInfo<'_>>,
    ) {
        let command = RecordedCommand::BeginRendering {
            render_area,
            color_attachments: color_attachments
                .iter()
                .map(RecordedAttachment::new)
                .collect(),
            depth_attachment: depth_attachment.map(RecordedAttachment::new),
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::EndRendering);
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let command = RecordedCommand::CopyBuffer {
            src_buffer,
            dst_buffer,
            regions: regions.to_vec(),
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let command = RecordedCommand::CopyBufferToImage {
            src_buffer,
            dst_image,
            dst_image_layout,
            regions: regions.to_vec(),
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        let command = RecordedCommand::CopyImageToBuffer {
            src_image,
            src_image_layout,
            dst_buffer,
            regions: regions.to_vec(),
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        let command = RecordedCommand::FillBuffer {
            buffer,
            offset,
            size,
            data,
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        let command = RecordedCommand::ClearColorImage {
            image,
            image_layout,
            ranges: ranges.to_vec(),
        };
        self.state.lock().record(command_buffer, command);
    }

    unsafe fn submit(&self, submit: &NativeSubmit<'_>) -> Result<(), BackendError> {
        let mut state = self.state.lock();

        for wait in submit.wait_semaphores {
            let current = state.semaphores.get(&wait.semaphore).copied();

            if current.map_or(true, |current| current < wait.value) {
                let msg = format!(
                    "submission waits for {:?} to reach {}, which no prior work signals",
                    wait.semaphore, wait.value,
                );
                state.validation_errors.push(msg);
            }
        }

        for &command_buffer in submit.command_buffers {
            let commands = match state.command_buffers.get_mut(&command_buffer) {
                Some(recorded) if recorded.ended => mem::take(&mut recorded.commands),
                Some(recorded) => {
                    let msg =
                        format!("submitting command buffer {:?} before it ended", recorded.name);
                    state.validation_errors.push(msg);
                    continue;
                }
                None => return Err(BackendError::DeviceLost),
            };

            state.replay(&commands);

            if let Some(recorded) = state.command_buffers.get_mut(&command_buffer) {
                recorded.commands = commands;
            }
        }

        for signal in submit.signal_semaphores {
            let current = state
                .semaphores
                .get_mut(&signal.semaphore)
                .ok_or(BackendError::DeviceLost)?;
            *current = (*current).max(signal.value);
        }

        state.submission_count += 1;
        drop(state);
        self.semaphore_signaled.notify_all();

        Ok(())
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: Option<Duration>,
    ) -> Result<u32, BackendError> {
        let mut state = self.state.lock();
        let swapchain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or(BackendError::SurfaceLost)?;
        let image_index = swapchain.next_image_index;
        swapchain.next_image_index = (image_index + 1) % swapchain.images.len() as u32;

        Ok(image_index)
    }

    unsafe fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let image = state
            .swapchains
            .get(&swapchain)
            .ok_or(BackendError::SurfaceLost)?
            .images
            .get(image_index as usize)
            .copied()
            .ok_or(BackendError::OutOfDate)?;
        let range = ImageSlice::new(1, 1).to_vk(vk::ImageAspectFlags::COLOR);
        state.check_image_layout(image, &range, vk::ImageLayout::PRESENT_SRC_KHR);
        state.presents.push((swapchain, image_index));

        Ok(())
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        // Submissions complete as they are made.
        Ok(())
    }
}
