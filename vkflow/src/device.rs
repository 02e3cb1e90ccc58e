//! The device: resource tables, the zombie queues and the device timeline.

use crate::{
    backend::{Backend, BackendError, NativeBuffer, NativeSubmit},
    command_buffer::{CommandRecorder, Deferred, ExecutableCommands},
    graph::AccessState,
    lock::Lock,
    resource::{
        format_aspect_mask, Buffer, BufferCreateInfo, BufferId, Image, ImageCreateInfo, ImageId,
        ImageSlice, ImageView, ImageViewCreateInfo, ImageViewId, MemoryBlock,
        MemoryBlockCreateInfo, Sampler, SamplerCreateInfo, SamplerId,
    },
    slot_table::SlotTable,
    swapchain::{Swapchain, SwapchainCreateInfo},
    timeline::{Timeline, TimelineSemaphore, TimelineSemaphoreCreateInfo},
    zombie::{
        BufferZombie, ImageViewZombie, ImageZombie, SamplerZombie, SlotRelease, ZombieBatch,
        Zombies,
    },
    Id, InvalidIdError, ObjectType,
};
use ash::vk;
use smallvec::SmallVec;
use std::{error::Error, fmt, ptr::NonNull, sync::Arc, time::Duration};

/// Owns every resource created through it, and defers their destruction until the GPU is done
/// with them.
///
/// Resources are referred to by [`Id`]s. Destroying a resource makes its ID invalid right away,
/// but the native object is only destroyed once the device timeline reaches the value it was
/// destroyed at, which happens in [`collect_garbage`].
///
/// [`collect_garbage`]: Self::collect_garbage
pub struct Device {
    backend: Arc<dyn Backend>,
    name: String,
    resources: Lock<Resources>,
    zombies: Lock<Zombies>,
    timeline: Timeline,
}

pub(crate) struct Resources {
    buffers: SlotTable<Buffer, BufferSlot>,
    images: SlotTable<Image, ImageSlot>,
    image_views: SlotTable<ImageView, ImageViewSlot>,
    samplers: SlotTable<Sampler, SamplerSlot>,
}

impl Resources {
    fn slot_release(&mut self) -> SlotRelease<'_> {
        SlotRelease {
            buffers: &mut self.buffers,
            images: &mut self.images,
            image_views: &mut self.image_views,
            samplers: &mut self.samplers,
        }
    }
}

pub(crate) struct BufferSlot {
    native: NativeBuffer,
    info: BufferCreateInfo,
    memory_block: Option<MemoryBlock>,
    /// The last access of the task graph executions that used the buffer.
    last_access: Option<AccessState>,
}

pub(crate) struct ImageSlot {
    handle: vk::Image,
    info: ImageCreateInfo,
    default_view: ImageViewId,
    memory_block: Option<MemoryBlock>,
    owned_by_swapchain: bool,
    /// Indexed by `mip_level * info.array_layers + array_layer`, or empty if no task graph
    /// execution used the image yet.
    last_access: Vec<Option<AccessState>>,
}

pub(crate) struct ImageViewSlot {
    handle: vk::ImageView,
    info: ImageViewCreateInfo,
    aspect_mask: vk::ImageAspectFlags,
    is_default_view: bool,
}

pub(crate) struct SamplerSlot {
    handle: vk::Sampler,
    info: SamplerCreateInfo,
}

/// What the recorder needs to know about an image to record commands on it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NativeImage {
    pub(crate) handle: vk::Image,
    pub(crate) aspect_mask: vk::ImageAspectFlags,
    pub(crate) whole_slice: ImageSlice,
    pub(crate) extent: [u32; 3],
    pub(crate) default_view: ImageViewId,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct NativeImageView {
    pub(crate) handle: vk::ImageView,
    pub(crate) image: ImageId,
    pub(crate) slice: ImageSlice,
    pub(crate) aspect_mask: vk::ImageAspectFlags,
}

impl Device {
    /// Creates a new device driving `backend`.
    pub fn new(
        backend: Arc<dyn Backend>,
        create_info: &DeviceCreateInfo,
    ) -> Result<Arc<Self>, DeviceError> {
        let timeline = Timeline::new(&*backend, &create_info.name)?;

        log::debug!("created device {:?}", create_info.name);

        Ok(Arc::new(Device {
            backend,
            name: create_info.name.clone(),
            resources: Lock::new(Resources {
                buffers: SlotTable::new(create_info.max_buffers),
                images: SlotTable::new(create_info.max_images),
                image_views: SlotTable::new(create_info.max_image_views),
                samplers: SlotTable::new(create_info.max_samplers),
            }),
            zombies: Lock::new(Zombies::new()),
            timeline,
        }))
    }

    /// Returns the backend that the device drives.
    #[inline]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a new buffer with dedicated memory.
    pub fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<BufferId, DeviceError> {
        let native = self.backend.create_buffer(create_info, None)?;

        self.insert_buffer(native, create_info, None)
    }

    /// Creates a new buffer bound to `memory_block` at `offset`.
    pub fn create_buffer_from_memory_block(
        &self,
        memory_block: &MemoryBlock,
        offset: vk::DeviceSize,
        create_info: &BufferCreateInfo,
    ) -> Result<BufferId, DeviceError> {
        let native = self
            .backend
            .create_buffer(create_info, Some((memory_block.handle(), offset)))?;

        self.insert_buffer(native, create_info, Some(memory_block.clone()))
    }

    fn insert_buffer(
        &self,
        native: NativeBuffer,
        create_info: &BufferCreateInfo,
        memory_block: Option<MemoryBlock>,
    ) -> Result<BufferId, DeviceError> {
        let slot = BufferSlot {
            native,
            info: create_info.clone(),
            memory_block,
            last_access: None,
        };
        let mut resources = self.resources.lock();

        match resources.buffers.insert(slot) {
            Ok(id) => {
                log::debug!("created buffer {:?} as {id:?}", create_info.name);

                Ok(id)
            }
            Err(slot) => {
                let capacity = resources.buffers.capacity();
                drop(resources);

                // SAFETY: The buffer was never visible outside this function.
                unsafe { self.backend.destroy_buffer(slot.native.handle) };

                Err(DeviceError::CapacityExceeded {
                    object_type: ObjectType::Buffer,
                    capacity,
                })
            }
        }
    }

    /// Creates a new image with dedicated memory, along with its default view.
    pub fn create_image(&self, create_info: &ImageCreateInfo) -> Result<ImageId, DeviceError> {
        let handle = self.backend.create_image(create_info, None)?;

        self.insert_image(handle, create_info, None, false)
    }

    /// Creates a new image bound to `memory_block` at `offset`, along with its default view.
    pub fn create_image_from_memory_block(
        &self,
        memory_block: &MemoryBlock,
        offset: vk::DeviceSize,
        create_info: &ImageCreateInfo,
    ) -> Result<ImageId, DeviceError> {
        let handle = self
            .backend
            .create_image(create_info, Some((memory_block.handle(), offset)))?;

        self.insert_image(handle, create_info, Some(memory_block.clone()), false)
    }

    /// Registers an image in the image table and creates its default view. On error, the image
    /// is destroyed unless it's owned by a swapchain.
    pub(crate) fn insert_image(
        &self,
        handle: vk::Image,
        create_info: &ImageCreateInfo,
        memory_block: Option<MemoryBlock>,
        owned_by_swapchain: bool,
    ) -> Result<ImageId, DeviceError> {
        let destroy_image = || {
            if !owned_by_swapchain {
                // SAFETY: The image was never visible outside this function.
                unsafe { self.backend.destroy_image(handle) };
            }
        };

        let view_info = ImageViewCreateInfo {
            image: Id::INVALID,
            view_type: create_info.default_view_type(),
            format: create_info.format,
            slice: create_info.whole_slice(),
            name: create_info.name.clone(),
            ..Default::default()
        };
        let view_handle = match self
            .backend
            .create_image_view(handle, create_info, &view_info)
        {
            Ok(view_handle) => view_handle,
            Err(err) => {
                destroy_image();
                return Err(err.into());
            }
        };

        let mut resources = self.resources.lock();

        let image_slot = ImageSlot {
            handle,
            info: create_info.clone(),
            default_view: Id::INVALID,
            memory_block,
            owned_by_swapchain,
            last_access: Vec::new(),
        };

        let image_id = match resources.images.insert(image_slot) {
            Ok(image_id) => image_id,
            Err(_) => {
                let capacity = resources.images.capacity();
                drop(resources);

                // SAFETY: The view was never visible outside this function.
                unsafe { self.backend.destroy_image_view(view_handle) };
                destroy_image();

                return Err(DeviceError::CapacityExceeded {
                    object_type: ObjectType::Image,
                    capacity,
                });
            }
        };

        let view_slot = ImageViewSlot {
            handle: view_handle,
            info: ImageViewCreateInfo {
                image: image_id,
                ..view_info
            },
            aspect_mask: create_info.aspect_mask(),
            is_default_view: true,
        };

        let view_id = match resources.image_views.insert(view_slot) {
            Ok(view_id) => view_id,
            Err(_) => {
                let capacity = resources.image_views.capacity();
                resources.images.retire(image_id);
                resources.images.release(image_id.index());
                drop(resources);

                // SAFETY: The view was never visible outside this function.
                unsafe { self.backend.destroy_image_view(view_handle) };
                destroy_image();

                return Err(DeviceError::CapacityExceeded {
                    object_type: ObjectType::ImageView,
                    capacity,
                });
            }
        };

        if let Some(image_slot) = resources.images.get_mut(image_id) {
            image_slot.default_view = view_id;
        }

        log::debug!("created image {:?} as {image_id:?}", create_info.name);

        Ok(image_id)
    }

    /// Creates a new view of an image.
    pub fn create_image_view(
        &self,
        create_info: &ImageViewCreateInfo,
    ) -> Result<ImageViewId, DeviceError> {
        let (image_handle, image_info) = {
            let resources = self.resources.lock();
            let image = resources
                .images
                .get(create_info.image)
                .ok_or(InvalidIdError::new(create_info.image))?;

            (image.handle, image.info.clone())
        };

        let mut native_info = create_info.clone();

        if native_info.format == vk::Format::UNDEFINED {
            native_info.format = image_info.format;
        }

        let handle = self
            .backend
            .create_image_view(image_handle, &image_info, &native_info)?;
        let slot = ImageViewSlot {
            handle,
            info: create_info.clone(),
            aspect_mask: format_aspect_mask(native_info.format),
            is_default_view: false,
        };
        let mut resources = self.resources.lock();

        match resources.image_views.insert(slot) {
            Ok(id) => {
                log::debug!("created image view {:?} as {id:?}", create_info.name);

                Ok(id)
            }
            Err(_) => {
                let capacity = resources.image_views.capacity();
                drop(resources);

                // SAFETY: The view was never visible outside this function.
                unsafe { self.backend.destroy_image_view(handle) };

                Err(DeviceError::CapacityExceeded {
                    object_type: ObjectType::ImageView,
                    capacity,
                })
            }
        }
    }

    pub fn create_sampler(
        &self,
        create_info: &SamplerCreateInfo,
    ) -> Result<SamplerId, DeviceError> {
        let handle = self.backend.create_sampler(create_info)?;
        let slot = SamplerSlot {
            handle,
            info: create_info.clone(),
        };
        let mut resources = self.resources.lock();

        match resources.samplers.insert(slot) {
            Ok(id) => {
                log::debug!("created sampler {:?} as {id:?}", create_info.name);

                Ok(id)
            }
            Err(_) => {
                let capacity = resources.samplers.capacity();
                drop(resources);

                // SAFETY: The sampler was never visible outside this function.
                unsafe { self.backend.destroy_sampler(handle) };

                Err(DeviceError::CapacityExceeded {
                    object_type: ObjectType::Sampler,
                    capacity,
                })
            }
        }
    }

    /// Allocates a block of memory that buffers and images can be bound into.
    pub fn create_memory_block(
        &self,
        create_info: &MemoryBlockCreateInfo,
    ) -> Result<MemoryBlock, DeviceError> {
        let handle = self.backend.allocate_memory(create_info)?;

        log::debug!("allocated memory block {:?}", create_info.name);

        Ok(MemoryBlock::new(
            self.backend.clone(),
            handle,
            create_info.clone(),
        ))
    }

    pub fn create_timeline_semaphore(
        self: &Arc<Self>,
        create_info: &TimelineSemaphoreCreateInfo,
    ) -> Result<TimelineSemaphore, DeviceError> {
        TimelineSemaphore::new(self, create_info)
    }

    pub fn create_swapchain(
        self: &Arc<Self>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<Arc<Swapchain>, DeviceError> {
        Swapchain::new(self, create_info)
    }

    /// Begins recording a new command buffer.
    pub fn create_command_recorder(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<CommandRecorder, DeviceError> {
        CommandRecorder::new(self, name)
    }

    /// Destroys a buffer once the work submitted so far has completed. The ID is invalid from
    /// now on.
    pub fn destroy_buffer(&self, id: BufferId) -> Result<(), InvalidIdError> {
        let mut batch = ZombieBatch::default();
        self.resources.lock().retire_buffer(id, &mut batch)?;
        self.push_zombies(batch);

        Ok(())
    }

    /// Destroys an image and its default view once the work submitted so far has completed. The
    /// IDs are invalid from now on.
    ///
    /// Swapchain images can't be destroyed this way; they are destroyed with their swapchain.
    pub fn destroy_image(&self, id: ImageId) -> Result<(), InvalidIdError> {
        let mut batch = ZombieBatch::default();
        self.resources.lock().retire_image(id, false, &mut batch)?;
        self.push_zombies(batch);

        Ok(())
    }

    /// Destroys an image view once the work submitted so far has completed. The ID is invalid
    /// from now on.
    ///
    /// Default views can't be destroyed this way; they are destroyed with their image.
    pub fn destroy_image_view(&self, id: ImageViewId) -> Result<(), InvalidIdError> {
        let mut batch = ZombieBatch::default();
        self.resources.lock().retire_image_view(id, &mut batch)?;
        self.push_zombies(batch);

        Ok(())
    }

    /// Destroys a sampler once the work submitted so far has completed. The ID is invalid from
    /// now on.
    pub fn destroy_sampler(&self, id: SamplerId) -> Result<(), InvalidIdError> {
        let mut batch = ZombieBatch::default();
        self.resources.lock().retire_sampler(id, &mut batch)?;
        self.push_zombies(batch);

        Ok(())
    }

    /// Keeps zombies pushed from now on alive until the returned recording is ended.
    pub(crate) fn begin_recording(&self) -> u64 {
        self.zombies.lock().begin_recording()
    }

    /// Ends a recording whose commands were discarded.
    pub(crate) fn end_recording(&self, recording: u64) {
        self.zombies.lock().end_recording(recording, None);
    }

    /// Pins the objects at the current CPU timeline value.
    fn push_zombies(&self, batch: ZombieBatch) {
        let mut zombies = self.zombies.lock();

        // Reading the value with the lock held keeps each queue ordered.
        let timeline_value = self.timeline.cpu_value();
        zombies.push_batch(timeline_value, batch);
    }

    /// Retires the deferred objects and pins them at `timeline_value`, or at the current CPU
    /// timeline value if `None`.
    pub(crate) fn destroy_deferred(
        &self,
        deferred: Vec<Deferred>,
        mut batch: ZombieBatch,
        timeline_value: Option<u64>,
    ) {
        self.retire_deferred(deferred, &mut batch);

        let mut zombies = self.zombies.lock();
        let timeline_value = timeline_value.unwrap_or_else(|| self.timeline.cpu_value());
        zombies.push_batch(timeline_value, batch);
    }

    fn retire_deferred(&self, deferred: Vec<Deferred>, batch: &mut ZombieBatch) {
        if deferred.is_empty() {
            return;
        }

        let mut resources = self.resources.lock();

        for object in deferred {
            let result = match object {
                Deferred::Buffer(id) => resources.retire_buffer(id, batch),
                Deferred::Image(id) => resources.retire_image(id, false, batch),
                Deferred::ImageView(id) => resources.retire_image_view(id, batch),
                Deferred::Sampler(id) => resources.retire_sampler(id, batch),
                Deferred::Event(event) => {
                    batch.events.push(event);
                    Ok(())
                }
            };

            if let Err(err) = result {
                log::warn!("skipping deferred destruction: {err}");
            }
        }
    }

    pub(crate) fn zombify_semaphore(&self, semaphore: vk::Semaphore) {
        let batch = ZombieBatch {
            semaphores: vec![semaphore],
            ..Default::default()
        };
        self.push_zombies(batch);
    }

    pub(crate) fn zombify_events(&self, events: Vec<vk::Event>) {
        let batch = ZombieBatch {
            events,
            ..Default::default()
        };
        self.push_zombies(batch);
    }

    pub(crate) fn zombify_swapchain(&self, swapchain: vk::SwapchainKHR, images: &[ImageId]) {
        let mut batch = ZombieBatch::default();

        {
            let mut resources = self.resources.lock();

            for &image in images {
                if let Err(err) = resources.retire_image(image, true, &mut batch) {
                    log::warn!("skipping destruction of swapchain image: {err}");
                }
            }
        }

        batch.swapchains.push(swapchain);
        self.push_zombies(batch);
    }

    /// Submits recorded commands to the queue and returns the timeline value that the device's
    /// timeline semaphore is signaled with once they complete.
    ///
    /// The command buffers and everything that was destroyed through them are pinned at the
    /// returned value. Presentations queued on the command buffers are issued right after the
    /// submission.
    ///
    /// # Panics
    ///
    /// - Panics if any of the commands were recorded on a different device.
    pub fn submit(
        &self,
        commands: impl IntoIterator<Item = ExecutableCommands>,
        submit_info: &SubmitInfo<'_>,
    ) -> Result<u64, DeviceError> {
        let mut commands = commands.into_iter().collect::<SmallVec<[_; 1]>>();
        let mut batch = ZombieBatch::default();
        let mut deferred = Vec::new();
        let mut presents = Vec::new();
        let mut recordings = SmallVec::<[_; 1]>::new();

        for commands in &mut commands {
            assert!(
                ptr_eq(commands.device(), self),
                "the commands were recorded on a different device",
            );

            let (handle, recording, commands_deferred, commands_presents) =
                commands.take_for_submission();
            batch.command_buffers.push(handle);
            recordings.push(recording);
            deferred.extend(commands_deferred);
            presents.extend(commands_presents);
        }

        self.retire_deferred(deferred, &mut batch);

        let command_buffers = batch.command_buffers.clone();
        let wait_semaphores = submit_info
            .wait_semaphores
            .iter()
            .map(|&(semaphore, value)| semaphore_submit_info(semaphore.handle(), value))
            .collect::<SmallVec<[_; 4]>>();

        let mut zombies = self.zombies.lock();
        let timeline_value = self.timeline.advance();

        for recording in recordings {
            zombies.end_recording(recording, Some(timeline_value));
        }

        let signal_semaphores = [(self.timeline.semaphore(), timeline_value)]
            .into_iter()
            .chain(
                submit_info
                    .signal_semaphores
                    .iter()
                    .map(|&(semaphore, value)| (semaphore.handle(), value)),
            )
            .map(|(semaphore, value)| semaphore_submit_info(semaphore, value))
            .collect::<SmallVec<[_; 4]>>();

        // SAFETY: The command buffers were ended by `CommandRecorder::end`, and the semaphores
        // are borrowed for the duration of the call.
        let result = unsafe {
            self.backend.submit(&NativeSubmit {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                signal_semaphores: &signal_semaphores,
            })
        };

        if let Err(err) = result {
            // Nothing will signal the value, so signal it from the host to keep the timeline
            // moving.
            // SAFETY: The semaphore is owned by the device.
            let signaled = unsafe {
                self.backend
                    .signal_semaphore(self.timeline.semaphore(), timeline_value)
            };

            if let Err(err) = signaled {
                log::error!("failed to signal the device timeline after a failed submit: {err}");
            }

            zombies.push_batch(timeline_value, batch);

            return Err(err.into());
        }

        zombies.push_batch(timeline_value, batch);
        drop(zombies);

        log::debug!(
            "submitted {} command buffers on device {:?} at timeline value {timeline_value}",
            command_buffers.len(),
            self.name,
        );

        let mut present_result = Ok(());

        for present in presents {
            // SAFETY: The swapchain is kept alive by the `Arc` and the image was acquired.
            let result = unsafe {
                self.backend
                    .present(present.swapchain.handle(), present.image_index)
            };
            present.swapchain.frame_submitted(timeline_value);

            if let Err(err) = result {
                if present_result.is_ok() {
                    present_result = Err(err);
                }
            }
        }

        present_result?;

        Ok(timeline_value)
    }

    /// Blocks until all submitted work has completed, then collects all zombies.
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        self.backend.wait_idle()?;
        self.timeline
            .wait(&*self.backend, self.timeline.cpu_value(), None)?;

        self.collect_garbage()
    }

    /// Blocks until the GPU timeline reaches `value`. Returns `false` if `timeout` elapsed first.
    pub fn wait_for_timeline_value(
        &self,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, DeviceError> {
        Ok(self.timeline.wait(&*self.backend, value, timeout)?)
    }

    /// Destroys every zombie whose pinned timeline value the GPU has reached, and frees their
    /// slots for reuse.
    pub fn collect_garbage(&self) -> Result<(), DeviceError> {
        let gpu_timeline_value = self.timeline.gpu_value(&*self.backend)?;
        let ready = self.zombies.lock().drain_ready(gpu_timeline_value);

        if ready.is_empty() {
            return Ok(());
        }

        let mut resources = self.resources.lock();

        // SAFETY: The GPU timeline has passed the value every zombie was pinned at.
        unsafe { ready.destroy(&*self.backend, resources.slot_release()) };

        Ok(())
    }

    /// Returns the timeline value of the most recent submission.
    #[inline]
    pub fn cpu_timeline_value(&self) -> u64 {
        self.timeline.cpu_value()
    }

    /// Returns the timeline value of the most recent submission that has completed.
    pub fn gpu_timeline_value(&self) -> Result<u64, BackendError> {
        self.timeline.gpu_value(&*self.backend)
    }

    /// Returns the number of objects waiting in the zombie queues.
    pub fn zombie_count(&self) -> usize {
        self.zombies.lock().len()
    }

    pub fn buffer_info(&self, id: BufferId) -> Result<BufferCreateInfo, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.buffers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.info.clone())
    }

    pub fn image_info(&self, id: ImageId) -> Result<ImageCreateInfo, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.images.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.info.clone())
    }

    pub fn image_view_info(&self, id: ImageViewId) -> Result<ImageViewCreateInfo, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.image_views.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.info.clone())
    }

    pub fn sampler_info(&self, id: SamplerId) -> Result<SamplerCreateInfo, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.samplers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.info.clone())
    }

    /// Returns the address of the buffer as seen by shaders.
    pub fn buffer_device_address(&self, id: BufferId) -> Result<vk::DeviceAddress, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.buffers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.native.device_address)
    }

    /// Returns where the buffer's memory is mapped on the host, or `None` if the buffer isn't
    /// host-visible.
    pub fn buffer_host_address(&self, id: BufferId) -> Result<Option<NonNull<u8>>, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.buffers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.native.host_address)
    }

    /// Returns the view covering every subresource of the image.
    pub fn image_default_view(&self, id: ImageId) -> Result<ImageViewId, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.images.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.default_view)
    }

    #[inline]
    pub fn is_buffer_valid(&self, id: BufferId) -> bool {
        self.resources.lock().buffers.contains(id)
    }

    #[inline]
    pub fn is_image_valid(&self, id: ImageId) -> bool {
        self.resources.lock().images.contains(id)
    }

    #[inline]
    pub fn is_image_view_valid(&self, id: ImageViewId) -> bool {
        self.resources.lock().image_views.contains(id)
    }

    #[inline]
    pub fn is_sampler_valid(&self, id: SamplerId) -> bool {
        self.resources.lock().samplers.contains(id)
    }

    /// Returns the last access that a task graph execution made to the buffer.
    pub(crate) fn buffer_access(
        &self,
        id: BufferId,
    ) -> Result<Option<AccessState>, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.buffers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.last_access)
    }

    pub(crate) fn set_buffer_access(
        &self,
        id: BufferId,
        access: AccessState,
    ) -> Result<(), InvalidIdError> {
        let mut resources = self.resources.lock();
        let slot = resources.buffers.get_mut(id).ok_or(InvalidIdError::new(id))?;
        slot.last_access = Some(access);

        Ok(())
    }

    /// Returns the last accesses that task graph executions made to the first `mip_levels` mip
    /// levels and `array_layers` array layers of the image, indexed by
    /// `mip_level * array_layers + array_layer`. Subresources the image doesn't have are `None`.
    pub(crate) fn image_access(
        &self,
        id: ImageId,
        mip_levels: u32,
        array_layers: u32,
    ) -> Result<Vec<Option<AccessState>>, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.images.get(id).ok_or(InvalidIdError::new(id))?;
        let mut accesses = vec![None; (mip_levels * array_layers) as usize];

        if slot.last_access.is_empty() {
            return Ok(accesses);
        }

        for mip_level in 0..mip_levels.min(slot.info.mip_levels) {
            for array_layer in 0..array_layers.min(slot.info.array_layers) {
                let source = mip_level * slot.info.array_layers + array_layer;
                accesses[(mip_level * array_layers + array_layer) as usize] =
                    slot.last_access[source as usize];
            }
        }

        Ok(accesses)
    }

    /// Records the accesses that are `Some` in `accesses`, which is laid out like the return
    /// value of [`image_access`].
    ///
    /// [`image_access`]: Self::image_access
    pub(crate) fn set_image_access(
        &self,
        id: ImageId,
        array_layers: u32,
        accesses: &[Option<AccessState>],
    ) -> Result<(), InvalidIdError> {
        let mut resources = self.resources.lock();
        let slot = resources.images.get_mut(id).ok_or(InvalidIdError::new(id))?;
        let (own_mip_levels, own_array_layers) = (slot.info.mip_levels, slot.info.array_layers);

        if slot.last_access.is_empty() {
            slot.last_access = vec![None; (own_mip_levels * own_array_layers) as usize];
        }

        for (index, access) in accesses.iter().enumerate() {
            let Some(access) = access else {
                continue;
            };
            let index = index as u32;
            let (mip_level, array_layer) = (index / array_layers, index % array_layers);

            if mip_level < own_mip_levels && array_layer < own_array_layers {
                let target = mip_level * own_array_layers + array_layer;
                slot.last_access[target as usize] = Some(*access);
            }
        }

        Ok(())
    }

    pub(crate) fn buffer_native(&self, id: BufferId) -> Result<NativeBuffer, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.buffers.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(slot.native)
    }

    pub(crate) fn image_native(&self, id: ImageId) -> Result<NativeImage, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.images.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(NativeImage {
            handle: slot.handle,
            aspect_mask: slot.info.aspect_mask(),
            whole_slice: slot.info.whole_slice(),
            extent: slot.info.extent,
            default_view: slot.default_view,
        })
    }

    pub(crate) fn image_view_native(
        &self,
        id: ImageViewId,
    ) -> Result<NativeImageView, InvalidIdError> {
        let resources = self.resources.lock();
        let slot = resources.image_views.get(id).ok_or(InvalidIdError::new(id))?;

        Ok(NativeImageView {
            handle: slot.handle,
            image: slot.info.image,
            slice: slot.info.slice,
            aspect_mask: slot.aspect_mask,
        })
    }
}

impl Resources {
    fn retire_buffer(
        &mut self,
        id: BufferId,
        batch: &mut ZombieBatch,
    ) -> Result<(), InvalidIdError> {
        let slot = self.buffers.retire(id).ok_or(InvalidIdError::new(id))?;

        log::debug!("destroying buffer {:?}", slot.info.name);

        batch.buffers.push(BufferZombie {
            index: id.index(),
            native: slot.native,
            memory_block: slot.memory_block,
        });

        Ok(())
    }

    fn retire_image(
        &mut self,
        id: ImageId,
        owned_by_swapchain: bool,
        batch: &mut ZombieBatch,
    ) -> Result<(), InvalidIdError> {
        match self.images.get(id) {
            Some(slot) if slot.owned_by_swapchain == owned_by_swapchain => {}
            _ => return Err(InvalidIdError::new(id)),
        }

        let slot = self.images.retire(id).ok_or(InvalidIdError::new(id))?;

        log::debug!("destroying image {:?}", slot.info.name);

        if let Some(view) = self.image_views.retire(slot.default_view) {
            batch.image_views.push(ImageViewZombie {
                index: slot.default_view.index(),
                handle: view.handle,
            });
        }

        batch.images.push(ImageZombie {
            index: id.index(),
            handle: slot.handle,
            memory_block: slot.memory_block,
            owned_by_swapchain: slot.owned_by_swapchain,
        });

        Ok(())
    }

    fn retire_image_view(
        &mut self,
        id: ImageViewId,
        batch: &mut ZombieBatch,
    ) -> Result<(), InvalidIdError> {
        match self.image_views.get(id) {
            Some(slot) if !slot.is_default_view => {}
            _ => return Err(InvalidIdError::new(id)),
        }

        let slot = self.image_views.retire(id).ok_or(InvalidIdError::new(id))?;

        log::debug!("destroying image view {:?}", slot.info.name);

        batch.image_views.push(ImageViewZombie {
            index: id.index(),
            handle: slot.handle,
        });

        Ok(())
    }

    fn retire_sampler(
        &mut self,
        id: SamplerId,
        batch: &mut ZombieBatch,
    ) -> Result<(), InvalidIdError> {
        let slot = self.samplers.retire(id).ok_or(InvalidIdError::new(id))?;

        log::debug!("destroying sampler {:?}", slot.info.name);

        batch.samplers.push(SamplerZombie {
            index: id.index(),
            handle: slot.handle,
        });

        Ok(())
    }

    /// Retires every live resource, warning about each one.
    fn retire_leaked(&mut self) -> ZombieBatch {
        let mut batch = ZombieBatch::default();

        for (index, slot) in self.image_views.retire_all() {
            if !slot.is_default_view {
                log::warn!("image view {:?} was never destroyed", slot.info.name);
            }

            batch.image_views.push(ImageViewZombie {
                index,
                handle: slot.handle,
            });
        }

        for (index, slot) in self.images.retire_all() {
            log::warn!("image {:?} was never destroyed", slot.info.name);

            batch.images.push(ImageZombie {
                index,
                handle: slot.handle,
                memory_block: slot.memory_block,
                owned_by_swapchain: slot.owned_by_swapchain,
            });
        }

        for (index, slot) in self.buffers.retire_all() {
            log::warn!("buffer {:?} was never destroyed", slot.info.name);

            batch.buffers.push(BufferZombie {
                index,
                native: slot.native,
                memory_block: slot.memory_block,
            });
        }

        for (index, slot) in self.samplers.retire_all() {
            log::warn!("sampler {:?} was never destroyed", slot.info.name);

            batch.samplers.push(SamplerZombie {
                index,
                handle: slot.handle,
            });
        }

        batch
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("cpu_timeline_value", &self.timeline.cpu_value())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            log::error!("failed to wait for device {:?} to become idle: {err}", self.name);
        }

        let zombies = self.zombies.get_mut().drain_all();
        let resources = self.resources.get_mut();

        // SAFETY: The device is idle.
        unsafe { zombies.destroy(&*self.backend, resources.slot_release()) };

        let leaked = resources.retire_leaked();

        // SAFETY: The device is idle, and nothing can refer to the resources anymore.
        unsafe { leaked.destroy(&*self.backend, resources.slot_release()) };

        // SAFETY: The device is idle.
        unsafe { self.backend.destroy_semaphore(self.timeline.semaphore()) };

        log::debug!("destroyed device {:?}", self.name);
    }
}

fn ptr_eq(device: &Arc<Device>, other: &Device) -> bool {
    std::ptr::eq(&**device, other)
}

fn semaphore_submit_info(semaphore: vk::Semaphore, value: u64) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo {
        semaphore,
        value,
        stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        ..Default::default()
    }
}

/// Parameters to create a new [`Device`].
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// A name used in logs.
    pub name: String,

    /// The maximum number of buffers that can exist at once, including those waiting to be
    /// collected.
    ///
    /// The default value is `1 << 16`. At most `1 << 20` is allowed.
    pub max_buffers: u32,

    /// The default value is `1 << 16`. At most `1 << 20` is allowed.
    pub max_images: u32,

    /// This includes the default view of every image.
    ///
    /// The default value is `1 << 16`. At most `1 << 20` is allowed.
    pub max_image_views: u32,

    /// The default value is `1 << 12`. At most `1 << 20` is allowed.
    pub max_samplers: u32,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCreateInfo {
    /// Returns a default `DeviceCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        DeviceCreateInfo {
            name: String::new(),
            max_buffers: 1 << 16,
            max_images: 1 << 16,
            max_image_views: 1 << 16,
            max_samplers: 1 << 12,
            _ne: crate::NE,
        }
    }
}

/// Parameters to submit commands to the queue.
#[derive(Clone, Copy, Debug)]
pub struct SubmitInfo<'a> {
    /// Timeline semaphores and the values to wait for before the commands execute.
    ///
    /// The default value is empty.
    pub wait_semaphores: &'a [(&'a TimelineSemaphore, u64)],

    /// Timeline semaphores and the values to signal once the commands have completed, in
    /// addition to the device timeline.
    ///
    /// The default value is empty.
    pub signal_semaphores: &'a [(&'a TimelineSemaphore, u64)],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for SubmitInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SubmitInfo<'_> {
    /// Returns a default `SubmitInfo`.
    #[inline]
    pub const fn new() -> Self {
        SubmitInfo {
            wait_semaphores: &[],
            signal_semaphores: &[],
            _ne: crate::NE,
        }
    }
}

/// Error that can happen when using a [`Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    InvalidId(InvalidIdError),

    Backend(BackendError),

    /// The table of the given kind of object is full.
    CapacityExceeded {
        object_type: ObjectType,
        capacity: u32,
    },
}

impl From<InvalidIdError> for DeviceError {
    fn from(err: InvalidIdError) -> Self {
        Self::InvalidId(err)
    }
}

impl From<BackendError> for DeviceError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId(_) => f.write_str("invalid resource ID"),
            Self::Backend(_) => f.write_str("the backend returned an error"),
            Self::CapacityExceeded {
                object_type,
                capacity,
            } => write!(
                f,
                "the device can't hold more than {capacity} objects of type {object_type:?}",
            ),
        }
    }
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidId(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::CapacityExceeded { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::HeadlessBackend, resource::MemoryLocation};

    fn device() -> (Arc<HeadlessBackend>, Arc<Device>) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(
            backend.clone(),
            &DeviceCreateInfo {
                name: "test".into(),
                ..Default::default()
            },
        )
        .unwrap();

        (backend, device)
    }

    fn buffer_info(size: vk::DeviceSize) -> BufferCreateInfo {
        BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            name: "buffer".into(),
            ..Default::default()
        }
    }

    fn image_info() -> ImageCreateInfo {
        ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [16, 16, 1],
            mip_levels: 3,
            array_layers: 2,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            name: "image".into(),
            ..Default::default()
        }
    }

    #[test]
    fn info_round_trip() {
        let (_, device) = device();

        let buffer = device.create_buffer(&buffer_info(64)).unwrap();
        assert_eq!(device.buffer_info(buffer), Ok(buffer_info(64)));

        let image = device.create_image(&image_info()).unwrap();
        assert_eq!(device.image_info(image), Ok(image_info()));

        let sampler_info = SamplerCreateInfo {
            mag_filter: vk::Filter::LINEAR,
            ..Default::default()
        };
        let sampler = device.create_sampler(&sampler_info).unwrap();
        assert_eq!(device.sampler_info(sampler), Ok(sampler_info));
    }

    #[test]
    fn default_view_covers_image() {
        let (_, device) = device();
        let image = device.create_image(&image_info()).unwrap();
        let view = device.image_default_view(image).unwrap();
        let view_info = device.image_view_info(view).unwrap();

        assert_eq!(view_info.image, image);
        assert_eq!(view_info.slice, ImageSlice::new(3, 2));
        assert_eq!(view_info.view_type, vk::ImageViewType::TYPE_2D_ARRAY);

        // Default views go with their image.
        assert!(device.destroy_image_view(view).is_err());

        device.destroy_image(image).unwrap();
        assert!(!device.is_image_valid(image));
        assert!(!device.is_image_view_valid(view));
    }

    #[test]
    fn slot_reused_only_after_collection() {
        let (_, device) = device();

        let recorder = device.create_command_recorder("frame").unwrap();
        let commands = recorder.end().unwrap();
        let first = device.create_buffer(&buffer_info(16)).unwrap();
        let value = device.submit([commands], &SubmitInfo::new()).unwrap();
        assert_eq!(value, 1);

        // Destroyed after the submission, so pinned at its value.
        device.destroy_buffer(first).unwrap();
        assert!(!device.is_buffer_valid(first));

        let second = device.create_buffer(&buffer_info(16)).unwrap();
        assert_ne!(second.index(), first.index());

        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 0);

        let third = device.create_buffer(&buffer_info(16)).unwrap();
        assert_eq!(third.index(), first.index());
        assert_eq!(third.version(), first.version() + 1);
    }

    #[test]
    fn zombies_wait_for_gpu_timeline() {
        let (_, device) = device();
        let semaphore = device
            .create_timeline_semaphore(&TimelineSemaphoreCreateInfo::new())
            .unwrap();

        let recorder = device.create_command_recorder("frame").unwrap();
        let commands = recorder.end().unwrap();
        let value = device.submit([commands], &SubmitInfo::new()).unwrap();
        assert_eq!(device.gpu_timeline_value(), Ok(value));

        let buffer = device.create_buffer(&buffer_info(16)).unwrap();
        device.destroy_buffer(buffer).unwrap();
        assert_eq!(device.zombie_count(), 2);

        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 0);

        drop(semaphore);
        assert_eq!(device.zombie_count(), 1);
        assert!(device.wait_for_timeline_value(value, None).unwrap());
        device.wait_idle().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }

    #[test]
    fn stale_ids_are_rejected() {
        let (_, device) = device();
        let buffer = device.create_buffer(&buffer_info(16)).unwrap();
        device.destroy_buffer(buffer).unwrap();

        let err = InvalidIdError::new(buffer);
        assert_eq!(device.buffer_info(buffer), Err(err));
        assert_eq!(device.buffer_device_address(buffer), Err(err));
        assert_eq!(device.buffer_host_address(buffer), Err(err));
        assert_eq!(device.destroy_buffer(buffer), Err(err));

        device.collect_garbage().unwrap();
        let reused = device.create_buffer(&buffer_info(16)).unwrap();
        assert_eq!(reused.index(), buffer.index());
        assert_eq!(device.buffer_info(buffer), Err(err));
        assert!(device.buffer_info(reused).is_ok());

        assert!(device.image_info(Id::INVALID).is_err());
        assert!(device.image_default_view(ImageId::new(999, 1)).is_err());
    }

    #[test]
    fn capacity_exceeded() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(
            backend.clone(),
            &DeviceCreateInfo {
                max_buffers: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let baseline = backend.live_object_count();

        device.create_buffer(&buffer_info(16)).unwrap();
        assert_eq!(
            device.create_buffer(&buffer_info(16)),
            Err(DeviceError::CapacityExceeded {
                object_type: ObjectType::Buffer,
                capacity: 1,
            }),
        );
        assert_eq!(backend.live_object_count(), baseline + 1);
    }

    #[test]
    fn host_visible_buffers() {
        let (_, device) = device();
        let gpu_only = device.create_buffer(&buffer_info(16)).unwrap();
        let host = device
            .create_buffer(&BufferCreateInfo {
                memory_location: MemoryLocation::HostSequentialWrite,
                ..buffer_info(16)
            })
            .unwrap();

        assert_eq!(device.buffer_host_address(gpu_only), Ok(None));
        assert!(device.buffer_host_address(host).unwrap().is_some());
        assert_ne!(
            device.buffer_device_address(gpu_only),
            device.buffer_device_address(host),
        );
    }

    #[test]
    fn memory_block_outlives_bound_resources() {
        let (backend, device) = device();
        let baseline = backend.live_object_count();
        let block = device
            .create_memory_block(&MemoryBlockCreateInfo {
                size: 1024,
                memory_location: MemoryLocation::HostRandomAccess,
                ..Default::default()
            })
            .unwrap();
        let buffer = device
            .create_buffer_from_memory_block(&block, 256, &buffer_info(128))
            .unwrap();
        let address = device.buffer_host_address(buffer).unwrap().unwrap();
        assert_eq!(block.size(), 1024);

        // The buffer keeps the memory alive.
        drop(block);
        unsafe { address.as_ptr().write(7) };

        device.destroy_buffer(buffer).unwrap();
        device.collect_garbage().unwrap();
        assert_eq!(backend.live_object_count(), baseline);
    }

    #[test]
    fn leaked_resources_destroyed_on_drop() {
        let (backend, device) = device();

        device.create_buffer(&buffer_info(16)).unwrap();
        device.create_image(&image_info()).unwrap();
        let image = device.create_image(&image_info()).unwrap();
        device
            .create_image_view(&ImageViewCreateInfo {
                image,
                ..Default::default()
            })
            .unwrap();
        device.create_sampler(&SamplerCreateInfo::new()).unwrap();

        drop(device);
        assert_eq!(backend.live_object_count(), 0);
    }
}
