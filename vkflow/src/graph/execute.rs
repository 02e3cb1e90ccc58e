use super::{
    compile::{coalesce, BarrierIndex, BarrierRecord, BarrierTarget, FinalState, Placement, Step},
    AccessState, ExecutableTaskGraph, NodeIndex, RenderAttachment, TaskBufferSlot, TaskImageSlot,
    TaskNode,
};
use crate::{
    backend::BackendError,
    command_buffer::{
        BufferMemoryBarrier, CommandRecorder, DependencyInfo, ImageMemoryBarrier,
        RenderingAttachmentInfo, RenderingInfo,
    },
    device::{Device, DeviceError},
    resource::{
        contains_writes, BufferId, ImageCreateInfo, ImageId, ImageSlice, ImageViewCreateInfo,
        ImageViewId,
    },
    InvalidIdError, TaskError, TaskInterface, TaskResult,
};
use ash::vk;
use smallvec::SmallVec;
use std::{error::Error, fmt, sync::Arc};

impl ExecutableTaskGraph {
    /// Records the task graph into `recorder`.
    ///
    /// The task resources are bound first. Persistent task resources use their current binding,
    /// the swapchain task image uses the current image of the graph's swapchain, and transient
    /// task resources get resources that are created for this execution and destroyed once the
    /// recorded commands complete.
    ///
    /// The first accesses of the graph are synchronized against the access history of the
    /// persistent task resources, and the history is updated when recording succeeds. If
    /// recording fails, the commands recorded so far must be discarded by dropping `recorder`.
    ///
    /// # Panics
    ///
    /// - Panics if `recorder` was created on a different device.
    pub fn execute(&mut self, recorder: &mut CommandRecorder) -> Result<(), ExecuteError> {
        assert!(
            Arc::ptr_eq(recorder.device(), &self.graph.device),
            "the command recorder was created on a different device",
        );

        let mut bindings = Bindings {
            graph: self.graph.id,
            buffers: Vec::with_capacity(self.graph.buffers.len()),
            images: Vec::with_capacity(self.graph.images.len()),
        };
        let mut transients = Transients::default();
        let mut views = ViewCache::default();

        let result = self
            .bind(&mut bindings, &mut transients)
            .and_then(|history| {
                self.record(recorder, &bindings, &history, &mut views)?;

                Ok(history)
            });

        for view in views.views.drain(..).map(|(_, _, view)| view) {
            recorder.destroy_image_view_deferred(view);
        }

        for buffer in transients.buffers {
            recorder.destroy_buffer_deferred(buffer);
        }

        for image in transients.images {
            recorder.destroy_image_deferred(image);
        }

        let history = result?;
        self.update_history(&bindings, &history);

        log::trace!("recorded task graph {:?}", self.graph.name);

        Ok(())
    }

    fn bind(
        &self,
        bindings: &mut Bindings,
        transients: &mut Transients,
    ) -> Result<History, ExecuteError> {
        let device = &self.graph.device;
        let mut history = History {
            buffers: Vec::with_capacity(self.graph.buffers.len()),
            images: Vec::with_capacity(self.graph.images.len()),
        };

        for slot in &self.graph.buffers {
            match slot {
                TaskBufferSlot::Persistent(buffer) => {
                    let buffers = buffer.state().lock().buffers.clone();

                    if buffers.is_empty() {
                        return Err(ExecuteError::Unbound {
                            resource: buffer.name().to_owned(),
                        });
                    }

                    let accesses = buffers
                        .iter()
                        .map(|&buffer| device.buffer_access(buffer))
                        .collect::<Result<SmallVec<[_; 1]>, InvalidIdError>>()?;

                    bindings.buffers.push(buffers);
                    history.buffers.push(accesses);
                }
                TaskBufferSlot::Transient(create_info) => {
                    let buffer = device.create_buffer(create_info)?;
                    transients.buffers.push(buffer);
                    bindings.buffers.push(SmallVec::from_slice(&[buffer]));
                    history.buffers.push(SmallVec::from_slice(&[None]));
                }
            }
        }

        for slot in &self.graph.images {
            let whole_slice = slot.whole_slice();
            let subresource_count = (whole_slice.level_count * whole_slice.layer_count) as usize;

            match slot {
                TaskImageSlot::Persistent(image) if image.is_swapchain_image() => {
                    let current_image = self
                        .graph
                        .swapchain
                        .as_ref()
                        .and_then(|swapchain| swapchain.current_image_id())
                        .ok_or_else(|| ExecuteError::Unbound {
                            resource: image.name().to_owned(),
                        })?;

                    bindings.images.push(SmallVec::from_slice(&[current_image]));
                    history.images.push(ImageHistory {
                        array_layers: whole_slice.layer_count,
                        states: SmallVec::from_elem(vec![None; subresource_count], 1),
                    });
                }
                TaskImageSlot::Persistent(image) => {
                    let images = image.state().lock().images.clone();

                    if images.is_empty() {
                        return Err(ExecuteError::Unbound {
                            resource: image.name().to_owned(),
                        });
                    }

                    let states = images
                        .iter()
                        .map(|&image| {
                            device.image_access(
                                image,
                                whole_slice.level_count,
                                whole_slice.layer_count,
                            )
                        })
                        .collect::<Result<SmallVec<[_; 1]>, InvalidIdError>>()?;

                    bindings.images.push(images);
                    history.images.push(ImageHistory {
                        array_layers: whole_slice.layer_count,
                        states,
                    });
                }
                TaskImageSlot::Transient(create_info) => {
                    let image = device.create_image(create_info)?;
                    transients.images.push(image);
                    bindings.images.push(SmallVec::from_slice(&[image]));
                    history.images.push(ImageHistory {
                        array_layers: whole_slice.layer_count,
                        states: SmallVec::from_elem(vec![None; subresource_count], 1),
                    });
                }
            }
        }

        Ok(history)
    }

    fn record(
        &self,
        recorder: &mut CommandRecorder,
        bindings: &Bindings,
        history: &History,
        views: &mut ViewCache,
    ) -> Result<(), ExecuteError> {
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();

        for step in &self.steps {
            buffer_barriers.clear();
            image_barriers.clear();

            match step {
                Step::InitialBarriers { barriers } => {
                    for &barrier in barriers {
                        resolve_initial_barrier(
                            &self.barriers[barrier as usize],
                            history,
                            bindings,
                            &mut buffer_barriers,
                            &mut image_barriers,
                        );
                    }

                    let dependency_info = DependencyInfo {
                        buffer_memory_barriers: &buffer_barriers,
                        image_memory_barriers: &image_barriers,
                        ..Default::default()
                    };

                    // SAFETY: The barriers synchronize the first accesses of the graph with the
                    // last accesses recorded in the history.
                    unsafe { recorder.pipeline_barrier(&dependency_info) }?;
                }
                Step::PipelineBarrier { barriers } => {
                    self.expand_barriers(
                        barriers,
                        bindings,
                        &mut buffer_barriers,
                        &mut image_barriers,
                    );

                    let dependency_info = DependencyInfo {
                        buffer_memory_barriers: &buffer_barriers,
                        image_memory_barriers: &image_barriers,
                        ..Default::default()
                    };

                    // SAFETY: The barriers were derived from the declared accesses.
                    unsafe { recorder.pipeline_barrier(&dependency_info) }?;
                }
                Step::SetEvent { event, barriers } => {
                    self.expand_barriers(
                        barriers,
                        bindings,
                        &mut buffer_barriers,
                        &mut image_barriers,
                    );

                    let dependency_info = DependencyInfo {
                        buffer_memory_barriers: &buffer_barriers,
                        image_memory_barriers: &image_barriers,
                        ..Default::default()
                    };

                    // SAFETY: The event is waited on and reset later in the same command buffer,
                    // with the same dependency info.
                    unsafe { recorder.set_event(self.events[*event as usize], &dependency_info) }?;
                }
                Step::WaitEvent { event, barriers } => {
                    self.expand_barriers(
                        barriers,
                        bindings,
                        &mut buffer_barriers,
                        &mut image_barriers,
                    );

                    let dependency_info = DependencyInfo {
                        buffer_memory_barriers: &buffer_barriers,
                        image_memory_barriers: &image_barriers,
                        ..Default::default()
                    };

                    // SAFETY: The event was set earlier in the same command buffer.
                    unsafe { recorder.wait_event(self.events[*event as usize], &dependency_info) }?;
                }
                Step::ResetEvent { event, stages } => {
                    // SAFETY: The wait on the event was recorded right before.
                    unsafe { recorder.reset_event(self.events[*event as usize], *stages) };
                }
                Step::BeginRendering { node } => {
                    self.begin_rendering(recorder, bindings, views, *node)?;
                }
                Step::ExecuteTask { node } => {
                    self.execute_task(recorder, bindings, views, *node)?;
                }
                Step::EndRendering => {
                    // SAFETY: The rendering scope was opened by the previous `BeginRendering`.
                    unsafe { recorder.end_rendering() };
                }
                Step::Present => {
                    if let Some(swapchain) = &self.graph.swapchain {
                        let image_index = swapchain.current_image_index().ok_or_else(|| {
                            ExecuteError::Unbound {
                                resource: swapchain.create_info().name.clone(),
                            }
                        })?;

                        recorder.queue_present(swapchain, image_index);
                    }
                }
            }
        }

        Ok(())
    }

    fn expand_barriers(
        &self,
        barriers: &[BarrierIndex],
        bindings: &Bindings,
        buffer_barriers: &mut Vec<BufferMemoryBarrier<'static>>,
        image_barriers: &mut Vec<ImageMemoryBarrier<'static>>,
    ) {
        for &barrier in barriers {
            push_barriers(
                &self.barriers[barrier as usize],
                bindings,
                buffer_barriers,
                image_barriers,
            );
        }
    }

    fn begin_rendering(
        &self,
        recorder: &mut CommandRecorder,
        bindings: &Bindings,
        views: &mut ViewCache,
        node_index: NodeIndex,
    ) -> Result<(), ExecuteError> {
        let node = &self.graph.nodes[node_index as usize];
        let Some(rendering) = &node.rendering else {
            return Ok(());
        };
        let device = &self.graph.device;

        let color_attachments = rendering
            .color_attachments
            .iter()
            .map(|attachment| attachment_info(device, bindings, views, node, attachment))
            .collect::<Result<SmallVec<[_; 4]>, _>>()?;
        let depth_attachment = rendering
            .depth_attachment
            .as_ref()
            .map(|attachment| attachment_info(device, bindings, views, node, attachment))
            .transpose()?;

        // SAFETY: The barriers recorded before transitioned the attachments into their layouts.
        unsafe {
            recorder.begin_rendering(&RenderingInfo {
                render_area_extent: rendering.render_area_extent,
                color_attachments: &color_attachments,
                depth_attachment,
                ..Default::default()
            })
        }?;

        Ok(())
    }

    fn execute_task(
        &self,
        recorder: &mut CommandRecorder,
        bindings: &Bindings,
        views: &mut ViewCache,
        node_index: NodeIndex,
    ) -> Result<(), ExecuteError> {
        let node = &self.graph.nodes[node_index as usize];
        let mut task_interface = TaskInterface {
            recorder: &mut *recorder,
            device: &self.graph.device,
            bindings,
            node,
            views: &mut *views,
        };

        if let Err(error) = node.task.execute(&mut task_interface) {
            if recorder.is_rendering() {
                // SAFETY: The rendering scope was opened for this task.
                unsafe { recorder.end_rendering() };
            }

            return Err(ExecuteError::Task {
                task: node.name.clone(),
                error,
            });
        }

        Ok(())
    }

    fn update_history(&self, bindings: &Bindings, history: &History) {
        let device = &self.graph.device;
        let buffers = self
            .graph
            .buffers
            .iter()
            .zip(&self.final_buffer_states)
            .zip(bindings.buffers.iter().zip(&history.buffers));

        for ((slot, final_state), (buffers, previous_accesses)) in buffers {
            let (TaskBufferSlot::Persistent(_), Some(final_state)) = (slot, final_state) else {
                continue;
            };

            for (&buffer, previous) in buffers.iter().zip(previous_accesses) {
                let access = self.next_access_state(final_state, previous.as_ref());

                if let Err(err) = device.set_buffer_access(buffer, access) {
                    log::warn!("not recording the access history of a destroyed buffer: {err}");
                }
            }
        }

        let images = self
            .graph
            .images
            .iter()
            .zip(&self.final_image_states)
            .zip(bindings.images.iter().zip(&history.images));

        for ((slot, final_states), (images, image_history)) in images {
            let TaskImageSlot::Persistent(image) = slot else {
                continue;
            };

            if image.is_swapchain_image() {
                continue;
            }

            for (&image, previous_states) in images.iter().zip(&image_history.states) {
                let accesses = final_states
                    .iter()
                    .zip(previous_states)
                    .map(|(final_state, previous)| {
                        let final_state = final_state.as_ref()?;

                        Some(self.next_access_state(final_state, previous.as_ref()))
                    })
                    .collect::<Vec<_>>();

                if let Err(err) =
                    device.set_image_access(image, image_history.array_layers, &accesses)
                {
                    log::warn!("not recording the access history of a destroyed image: {err}");
                }
            }
        }
    }

    fn next_access_state(
        &self,
        final_state: &FinalState,
        previous: Option<&AccessState>,
    ) -> AccessState {
        if !final_state.reading {
            return AccessState {
                stage_mask: final_state.stage_mask,
                access_mask: final_state.access_mask,
                visible_stages: vk::PipelineStageFlags2::empty(),
                visible_access: vk::AccessFlags2::empty(),
                image_layout: final_state.image_layout,
            };
        }

        let barrier = &self.barriers[final_state.barrier as usize];

        match previous {
            // The initial barrier was left out, so the readers of the previous execution may
            // still be running.
            Some(previous)
                if barrier.placement == Placement::Initial && !has_hazard(previous, barrier) =>
            {
                AccessState {
                    stage_mask: previous.stage_mask | final_state.stage_mask,
                    access_mask: vk::AccessFlags2::empty(),
                    visible_stages: previous.visible_stages,
                    visible_access: previous.visible_access,
                    image_layout: final_state.image_layout,
                }
            }
            _ => AccessState {
                stage_mask: final_state.stage_mask,
                access_mask: vk::AccessFlags2::empty(),
                visible_stages: barrier.dst_stages,
                visible_access: barrier.dst_access,
                image_layout: final_state.image_layout,
            },
        }
    }
}

/// Returns `true` if the access of `barrier` has to wait on the access recorded in `previous`.
fn has_hazard(previous: &AccessState, barrier: &BarrierRecord) -> bool {
    contains_writes(barrier.dst_access)
        || contains_writes(previous.access_mask)
        || previous.image_layout != barrier.new_layout
        || !previous.visible_stages.contains(barrier.dst_stages)
        || !previous.visible_access.contains(barrier.dst_access)
}

/// Pushes the part of `barrier` that each resource bound to its task resource needs, given the
/// resource's access history.
fn resolve_initial_barrier(
    barrier: &BarrierRecord,
    history: &History,
    bindings: &Bindings,
    buffer_barriers: &mut Vec<BufferMemoryBarrier<'static>>,
    image_barriers: &mut Vec<ImageMemoryBarrier<'static>>,
) {
    match barrier.target {
        BarrierTarget::Buffer { index } => {
            let buffers = bindings.buffers(index);

            for (&buffer, previous) in buffers.iter().zip(&history.buffers[index as usize]) {
                let Some(previous) = previous else {
                    continue;
                };

                if has_hazard(previous, barrier) {
                    let barrier = BarrierRecord {
                        src_stages: previous.stage_mask,
                        src_access: previous.access_mask,
                        ..*barrier
                    };
                    buffer_barriers.push(buffer_barrier(&barrier, buffer));
                }
            }
        }
        BarrierTarget::Image { index, slice } => {
            let image_history = &history.images[index as usize];
            let array_layers = image_history.array_layers;
            let images = bindings.images(index);

            for (&image, states) in images.iter().zip(&image_history.states) {
                let sources =
                    coalesce(slice.level_count, slice.layer_count, |mip_level, array_layer| {
                        let subresource = (slice.base_mip_level + mip_level) * array_layers
                            + slice.base_array_layer
                            + array_layer;

                        match &states[subresource as usize] {
                            None if barrier.new_layout == vk::ImageLayout::UNDEFINED => None,
                            None => Some((
                                vk::PipelineStageFlags2::empty(),
                                vk::AccessFlags2::empty(),
                                vk::ImageLayout::UNDEFINED,
                            )),
                            Some(previous) if has_hazard(previous, barrier) => Some((
                                previous.stage_mask,
                                previous.access_mask,
                                previous.image_layout,
                            )),
                            Some(_) => None,
                        }
                    });

                for (subslice, (src_stages, src_access, old_layout)) in sources {
                    let barrier = BarrierRecord {
                        src_stages,
                        src_access,
                        old_layout,
                        ..*barrier
                    };
                    let slice = ImageSlice {
                        base_mip_level: slice.base_mip_level + subslice.base_mip_level,
                        level_count: subslice.level_count,
                        base_array_layer: slice.base_array_layer + subslice.base_array_layer,
                        layer_count: subslice.layer_count,
                    };
                    image_barriers.push(image_barrier(&barrier, image, slice));
                }
            }
        }
    }
}

/// Expands `barrier` over every resource bound to its task resource.
fn push_barriers(
    barrier: &BarrierRecord,
    bindings: &Bindings,
    buffer_barriers: &mut Vec<BufferMemoryBarrier<'static>>,
    image_barriers: &mut Vec<ImageMemoryBarrier<'static>>,
) {
    match barrier.target {
        BarrierTarget::Buffer { index } => {
            buffer_barriers.extend(
                bindings
                    .buffers(index)
                    .iter()
                    .map(|&buffer| buffer_barrier(barrier, buffer)),
            );
        }
        BarrierTarget::Image { index, slice } => {
            image_barriers.extend(
                bindings
                    .images(index)
                    .iter()
                    .map(|&image| image_barrier(barrier, image, slice)),
            );
        }
    }
}

fn buffer_barrier(barrier: &BarrierRecord, buffer: BufferId) -> BufferMemoryBarrier<'static> {
    BufferMemoryBarrier {
        src_stages: barrier.src_stages,
        src_access: barrier.src_access,
        dst_stages: barrier.dst_stages,
        dst_access: barrier.dst_access,
        buffer,
        range: 0..vk::WHOLE_SIZE,
        ..Default::default()
    }
}

fn image_barrier(
    barrier: &BarrierRecord,
    image: ImageId,
    slice: ImageSlice,
) -> ImageMemoryBarrier<'static> {
    ImageMemoryBarrier {
        src_stages: barrier.src_stages,
        src_access: barrier.src_access,
        dst_stages: barrier.dst_stages,
        dst_access: barrier.dst_access,
        old_layout: barrier.old_layout,
        new_layout: barrier.new_layout,
        image,
        slice,
        ..Default::default()
    }
}

fn attachment_info(
    device: &Arc<Device>,
    bindings: &Bindings,
    views: &mut ViewCache,
    node: &TaskNode,
    attachment: &RenderAttachment,
) -> Result<RenderingAttachmentInfo, ExecuteError> {
    let image_view = bindings
        .images(attachment.index)
        .first()
        .copied()
        .ok_or(TaskError::Unbound)
        .and_then(|image| views.get_or_create(device, image, attachment.slice))
        .map_err(|error| ExecuteError::Task {
            task: node.name.clone(),
            error,
        })?;

    Ok(RenderingAttachmentInfo {
        image_view,
        image_layout: attachment.image_layout,
        load_op: attachment.load_op,
        store_op: attachment.store_op,
        clear_value: attachment.clear_value,
    })
}

/// The resources bound to the task resources of a graph for one execution.
pub(crate) struct Bindings {
    graph: u64,
    buffers: Vec<SmallVec<[BufferId; 1]>>,
    images: Vec<SmallVec<[ImageId; 1]>>,
}

impl Bindings {
    pub(crate) fn check_graph(&self, graph: u64) -> TaskResult {
        if graph == self.graph {
            Ok(())
        } else {
            Err(TaskError::InvalidTaskResource)
        }
    }

    pub(crate) fn buffers(&self, index: u32) -> &[BufferId] {
        &self.buffers[index as usize]
    }

    pub(crate) fn images(&self, index: u32) -> &[ImageId] {
        &self.images[index as usize]
    }
}

#[derive(Default)]
struct Transients {
    buffers: Vec<BufferId>,
    images: Vec<ImageId>,
}

/// The access history of the bound resources at the start of an execution, in binding order.
struct History {
    buffers: Vec<SmallVec<[Option<AccessState>; 1]>>,
    images: Vec<ImageHistory>,
}

struct ImageHistory {
    /// The array layer count of the task image.
    array_layers: u32,
    /// For every bound image, indexed by `mip_level * array_layers + array_layer`.
    states: SmallVec<[Vec<Option<AccessState>>; 1]>,
}

/// Image views of slices created during an execution.
#[derive(Default)]
pub(crate) struct ViewCache {
    views: Vec<(ImageId, ImageSlice, ImageViewId)>,
}

impl ViewCache {
    /// Returns a view of `slice` of `image`. The default view is used when `slice` covers the
    /// whole image.
    pub(crate) fn get_or_create(
        &mut self,
        device: &Arc<Device>,
        image: ImageId,
        slice: ImageSlice,
    ) -> TaskResult<ImageViewId> {
        let image_info = device.image_info(image)?;

        if slice == image_info.whole_slice() {
            return Ok(device.image_default_view(image)?);
        }

        if let Some(&(_, _, view)) = self
            .views
            .iter()
            .find(|&&(other_image, other_slice, _)| other_image == image && other_slice == slice)
        {
            return Ok(view);
        }

        let view_type = ImageCreateInfo {
            array_layers: slice.layer_count,
            ..image_info.clone()
        }
        .default_view_type();

        let view = device.create_image_view(&ImageViewCreateInfo {
            image,
            view_type,
            format: vk::Format::UNDEFINED,
            slice,
            name: format!("{} slice view", image_info.name),
            ..Default::default()
        })?;
        self.views.push((image, slice, view));

        Ok(view)
    }
}

/// Error that can happen when executing an [`ExecutableTaskGraph`].
#[derive(Debug)]
pub enum ExecuteError {
    /// A task returned an error.
    Task { task: String, error: TaskError },

    /// A resource bound to a task resource is no longer alive.
    InvalidId(InvalidIdError),

    Backend(BackendError),

    /// Creating a transient resource failed for a reason other than a backend error.
    Device(DeviceError),

    /// No resource is bound to a persistent task resource, or no swapchain image was acquired.
    Unbound { resource: String },
}

impl From<InvalidIdError> for ExecuteError {
    fn from(err: InvalidIdError) -> Self {
        Self::InvalidId(err)
    }
}

impl From<BackendError> for ExecuteError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl From<DeviceError> for ExecuteError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::InvalidId(err) => Self::InvalidId(err),
            DeviceError::Backend(err) => Self::Backend(err),
            err => Self::Device(err),
        }
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task { task, .. } => write!(f, "error in task {task:?}"),
            Self::InvalidId(_) => f.write_str("invalid resource ID"),
            Self::Backend(_) => f.write_str("a runtime error occurred"),
            Self::Device(_) => f.write_str("a device error occurred"),
            Self::Unbound { resource } => {
                write!(f, "no resource is bound to task resource {resource:?}")
            }
        }
    }
}

impl Error for ExecuteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Task { error, .. } => Some(error),
            Self::InvalidId(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::Device(err) => Some(err),
            Self::Unbound { .. } => None,
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
        command_buffer::{ClearColorValue, ClearValue, FillBufferInfo},
        device::{DeviceCreateInfo, SubmitInfo},
        graph::{
            AttachmentInfo, RenderTaskInfo, TaskBuffer, TaskBufferCreateInfo, TaskGraph,
            TaskGraphCreateInfo, TaskImage, TaskImageCreateInfo,
        },
        resource::{AccessType, BufferCreateInfo, ImageLayoutType, MemoryLocation},
        swapchain::SwapchainCreateInfo,
    };
    use std::marker::PhantomData;

    fn device() -> (Arc<HeadlessBackend>, Arc<Device>) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();

        (backend, device)
    }

    fn host_buffer(device: &Device) -> BufferId {
        device
            .create_buffer(&BufferCreateInfo {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::UNIFORM_BUFFER,
                memory_location: MemoryLocation::HostRandomAccess,
                ..Default::default()
            })
            .unwrap()
    }

    fn read_u32(device: &Device, buffer: BufferId) -> u32 {
        let address = device.buffer_host_address(buffer).unwrap().unwrap();

        unsafe { address.cast::<u32>().as_ptr().read_unaligned() }
    }

    fn command_kinds(commands: &[RecordedCommand]) -> Vec<&'static str> {
        commands
            .iter()
            .map(|command| match command {
                RecordedCommand::PipelineBarrier { .. } => "pipeline_barrier",
                RecordedCommand::SetEvent { .. } => "set_event",
                RecordedCommand::WaitEvent { .. } => "wait_event",
                RecordedCommand::ResetEvent { .. } => "reset_event",
                RecordedCommand::BeginRendering { .. } => "begin_rendering",
                RecordedCommand::EndRendering => "end_rendering",
                RecordedCommand::FillBuffer { .. } => "fill_buffer",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn split_barriers_are_recorded() {
        let (backend, device) = device();
        let mut graph = TaskGraph::new(
            &device,
            &TaskGraphCreateInfo {
                name: "split".into(),
                use_split_barriers: true,
                ..Default::default()
            },
        );
        let buffer_info = BufferCreateInfo {
            size: 64,
            usage: vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
            ..Default::default()
        };
        let shared = graph.create_task_buffer(&buffer_info);
        let unrelated = graph.create_task_buffer(&buffer_info);
        graph
            .create_task_node("produce", PhantomData)
            .buffer_access(shared, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .create_task_node("unrelated", PhantomData)
            .buffer_access(unrelated, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .create_task_node("consume", PhantomData)
            .buffer_access(shared, AccessType::ComputeShaderStorageRead)
            .unwrap();
        let mut executable = graph.compile().unwrap();

        let mut recorder = device.create_command_recorder("split").unwrap();
        executable.execute(&mut recorder).unwrap();

        let handle = recorder.as_raw();
        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        let commands = backend.commands(handle).unwrap();
        // Transient buffers start without history, so there are no initial barriers.
        assert_eq!(
            command_kinds(&commands),
            ["set_event", "wait_event", "reset_event"],
        );
        assert_eq!(commands[0].barriers().len(), 1);
        assert_eq!(commands[0].barriers(), commands[1].barriers());
        assert!(backend.validation_errors().is_empty());

        device.wait_idle().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }

    #[test]
    fn render_tasks_are_bracketed() {
        let (backend, device) = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let color = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [4, 4, 1],
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            name: "color".into(),
            ..Default::default()
        });
        graph
            .add_render_task(
                "draw",
                &RenderTaskInfo {
                    color_attachments: &[(
                        color,
                        AttachmentInfo {
                            load_op: vk::AttachmentLoadOp::CLEAR,
                            clear_value: ClearValue::Color(ClearColorValue::Uint([1, 2, 3, 4])),
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                },
                move |ti| {
                    assert!(ti.recorder().is_rendering());
                    assert_eq!(
                        ti.image_layout(color)?,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    );

                    Ok(())
                },
            )
            .unwrap();
        let mut executable = graph.compile().unwrap();

        let mut recorder = device.create_command_recorder("draw").unwrap();
        executable.execute(&mut recorder).unwrap();
        assert!(!recorder.is_rendering());

        let handle = recorder.as_raw();
        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        let commands = backend.commands(handle).unwrap();
        assert_eq!(
            command_kinds(&commands),
            ["pipeline_barrier", "begin_rendering", "end_rendering"],
        );

        let RecordedCommand::BeginRendering {
            color_attachments, ..
        } = &commands[1]
        else {
            unreachable!();
        };
        assert_eq!(color_attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color_attachments[0].clear_value, [1, 2, 3, 4]);
        assert_eq!(
            color_attachments[0].image_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert!(backend.validation_errors().is_empty());

        // The transient image is destroyed along with the command buffer.
        device.wait_idle().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }

    #[test]
    fn failing_task_closes_the_rendering_scope() {
        let (_, device) = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let color = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [4, 4, 1],
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        });
        graph
            .add_render_task(
                "fail",
                &RenderTaskInfo {
                    color_attachments: &[(color, AttachmentInfo::new())],
                    ..Default::default()
                },
                |_| Err(TaskError::Custom("out of ideas".into())),
            )
            .unwrap();
        let mut executable = graph.compile().unwrap();

        let mut recorder = device.create_command_recorder("fail").unwrap();
        let err = executable.execute(&mut recorder).unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Task {
                ref task,
                error: TaskError::Custom(_),
            } if task == "fail",
        ));
        assert!(!recorder.is_rendering());
    }

    #[test]
    fn persistent_buffers_can_be_rebound() {
        let (backend, device) = device();
        let buffer1 = host_buffer(&device);
        let buffer2 = host_buffer(&device);
        let task_buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            buffers: &[buffer1],
            name: "rebound".into(),
            ..Default::default()
        });

        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = graph.use_persistent_buffer(&task_buffer);
        graph
            .add_task("fill", move |ti| {
                let buffer = ti.buffer(id)?;

                unsafe {
                    ti.recorder().fill_buffer(&FillBufferInfo {
                        dst_buffer: buffer,
                        size: 16,
                        data: 7,
                        ..Default::default()
                    })
                }?;

                Ok(())
            })
            .buffer_access(id, AccessType::CopyTransferWrite)
            .unwrap();
        let mut executable = graph.compile().unwrap();

        for (frame, buffer) in [buffer1, buffer2].into_iter().enumerate() {
            if frame == 1 {
                task_buffer.set_buffers(&[buffer2]);
                assert_eq!(read_u32(&device, buffer2), 0);
            }

            let mut recorder = device.create_command_recorder("fill").unwrap();
            executable.execute(&mut recorder).unwrap();
            device
                .submit([recorder.end().unwrap()], &SubmitInfo::new())
                .unwrap();
            assert_eq!(read_u32(&device, buffer), 7);
        }

        let last_access = device.buffer_access(buffer2).unwrap().unwrap();
        assert_eq!(last_access.access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert!(last_access.visible_access.is_empty());
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn unbound_resources_are_reported() {
        let (_, device) = device();
        let task_buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            name: "nothing".into(),
            ..Default::default()
        });
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = graph.use_persistent_buffer(&task_buffer);
        graph
            .create_task_node("read", PhantomData)
            .buffer_access(id, AccessType::ComputeShaderStorageRead)
            .unwrap();
        let mut executable = graph.compile().unwrap();

        let mut recorder = device.create_command_recorder("unbound").unwrap();
        let err = executable.execute(&mut recorder).unwrap_err();
        assert!(matches!(err, ExecuteError::Unbound { ref resource } if resource == "nothing"));
    }

    #[test]
    fn visible_reads_need_no_barrier() {
        let (backend, device) = device();
        let buffer = host_buffer(&device);
        let task_buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            buffers: &[buffer],
            ..Default::default()
        });

        let mut writer = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = writer.use_persistent_buffer(&task_buffer);
        writer
            .create_task_node("write", PhantomData)
            .buffer_access(id, AccessType::CopyTransferWrite)
            .unwrap();
        let mut writer = writer.compile().unwrap();

        let mut reader = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = reader.use_persistent_buffer(&task_buffer);
        reader
            .create_task_node("read", PhantomData)
            .buffer_access(id, AccessType::ComputeShaderStorageRead)
            .unwrap();
        let mut reader = reader.compile().unwrap();

        let mut recorder = device.create_command_recorder("frame").unwrap();
        writer.execute(&mut recorder).unwrap();

        let handle = recorder.as_raw();
        reader.execute(&mut recorder).unwrap();

        let commands = backend.commands(handle).unwrap();
        assert_eq!(command_kinds(&commands), ["pipeline_barrier"]);

        let barrier = commands[0].barriers()[0];
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::SHADER_STORAGE_READ);
        assert!(matches!(barrier.resource, BarrierResource::Buffer { .. }));

        // The write is already visible to the reader, so reading again needs no barrier.
        reader.execute(&mut recorder).unwrap();
        assert_eq!(backend.commands(handle).unwrap().len(), 1);

        let last_access = device.buffer_access(buffer).unwrap().unwrap();
        assert_eq!(last_access.stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert!(last_access.access_mask.is_empty());
        assert_eq!(
            last_access.visible_access,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        );

        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn slices_get_their_own_views() {
        let (_, device) = device();
        let image = device
            .create_image(&ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                extent: [8, 8, 1],
                array_layers: 4,
                usage: vk::ImageUsageFlags::SAMPLED,
                name: "layers".into(),
                ..Default::default()
            })
            .unwrap();
        let mut views = ViewCache::default();

        let whole = views
            .get_or_create(&device, image, ImageSlice::new(1, 4))
            .unwrap();
        assert_eq!(whole, device.image_default_view(image).unwrap());

        let layer = ImageSlice {
            base_array_layer: 2,
            ..ImageSlice::new(1, 1)
        };
        let view = views.get_or_create(&device, image, layer).unwrap();
        assert_eq!(views.get_or_create(&device, image, layer).unwrap(), view);
        assert_eq!(views.views.len(), 1);

        let view_info = device.image_view_info(view).unwrap();
        assert_eq!(view_info.view_type, vk::ImageViewType::TYPE_2D);
        assert_eq!(view_info.slice, layer);
    }

    #[test]
    fn frames_present_the_swapchain_image() {
        let (backend, device) = device();
        let swapchain = device
            .create_swapchain(&SwapchainCreateInfo {
                extent: [8, 8],
                image_count: 2,
                name: "swapchain".into(),
                ..Default::default()
            })
            .unwrap();
        let buffer = host_buffer(&device);
        let task_buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            buffers: &[buffer],
            name: "uniforms".into(),
            ..Default::default()
        });
        let task_image = TaskImage::new(&TaskImageCreateInfo {
            swapchain_image: true,
            name: "swapchain image".into(),
            ..Default::default()
        });

        let mut graph = TaskGraph::new(
            &device,
            &TaskGraphCreateInfo {
                name: "frame".into(),
                swapchain: Some(swapchain.clone()),
                ..Default::default()
            },
        );
        let uniforms = graph.use_persistent_buffer(&task_buffer);
        let swapchain_image = graph.use_persistent_image(&task_image);
        graph
            .create_task_node("update", PhantomData)
            .buffer_access(uniforms, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .add_render_task(
                "draw",
                &RenderTaskInfo {
                    color_attachments: &[(
                        swapchain_image,
                        AttachmentInfo {
                            load_op: vk::AttachmentLoadOp::CLEAR,
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                },
                |_| Ok(()),
            )
            .unwrap()
            .buffer_access(uniforms, AccessType::FragmentShaderUniformRead)
            .unwrap();
        graph.add_present().unwrap();
        let mut executable = graph.compile().unwrap();

        for frame in 0..2 {
            let image_index = swapchain.acquire_next_image(None).unwrap();
            assert_eq!(image_index, frame);

            let mut recorder = device.create_command_recorder("frame").unwrap();
            executable.execute(&mut recorder).unwrap();
            device
                .submit([recorder.end().unwrap()], &SubmitInfo::new())
                .unwrap();
        }

        assert_eq!(backend.presents().len(), 2);
        assert!(backend.validation_errors().is_empty());

        // Swapchain images don't keep a history.
        for &image in swapchain.images() {
            let accesses = device.image_access(image, 1, 1).unwrap();
            assert!(accesses.iter().all(Option::is_none));
        }

        device.wait_idle().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }

    fn image_barriers(
        command: &RecordedCommand,
    ) -> Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)> {
        command
            .barriers()
            .iter()
            .filter_map(|barrier| match barrier.resource {
                BarrierResource::Image {
                    image,
                    old_layout,
                    new_layout,
                    ..
                } => Some((image, old_layout, new_layout)),
                _ => None,
            })
            .collect()
    }

    fn sampled_image(device: &Device) -> ImageId {
        device
            .create_image(&ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                extent: [4, 4, 1],
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                ..Default::default()
            })
            .unwrap()
    }

    fn record(device: &Arc<Device>, executable: &mut ExecutableTaskGraph) -> vk::CommandBuffer {
        let mut recorder = device.create_command_recorder("frame").unwrap();
        executable.execute(&mut recorder).unwrap();

        let handle = recorder.as_raw();
        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();

        handle
    }

    #[test]
    fn rebound_images_start_undefined() {
        let (backend, device) = device();
        let first = sampled_image(&device);
        let second = sampled_image(&device);
        let task_image = TaskImage::new(&TaskImageCreateInfo {
            images: &[first],
            name: "target".into(),
            ..Default::default()
        });

        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = graph.use_persistent_image(&task_image);
        graph
            .create_task_node("upload", PhantomData)
            .image_access(id, AccessType::CopyTransferWrite, ImageLayoutType::Optimal)
            .unwrap();
        graph
            .create_task_node("sample", PhantomData)
            .image_access(id, AccessType::FragmentShaderSampledRead, ImageLayoutType::Optimal)
            .unwrap();
        let mut executable = graph.compile().unwrap();

        record(&device, &mut executable);

        // A fresh image has no history, whatever the previous binding went through.
        task_image.set_images(&[second]);
        let handle = record(&device, &mut executable);
        let commands = backend.commands(handle).unwrap();
        assert_eq!(
            image_barriers(&commands[0]),
            [(
                device.image_native(second).unwrap().handle,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
        );

        // Binding the first image again picks up where its own history left off.
        task_image.set_images(&[first]);
        let handle = record(&device, &mut executable);
        let commands = backend.commands(handle).unwrap();
        assert_eq!(
            image_barriers(&commands[0]),
            [(
                device.image_native(first).unwrap().handle,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
        );

        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn history_is_shared_between_graphs() {
        let (backend, device) = device();
        let image = sampled_image(&device);

        let mut writer = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = writer.use_persistent_image(&TaskImage::new(&TaskImageCreateInfo {
            images: &[image],
            ..Default::default()
        }));
        writer
            .create_task_node("upload", PhantomData)
            .image_access(id, AccessType::CopyTransferWrite, ImageLayoutType::Optimal)
            .unwrap();
        let mut writer = writer.compile().unwrap();

        let mut reader = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let id = reader.use_persistent_image(&TaskImage::new(&TaskImageCreateInfo {
            images: &[image],
            ..Default::default()
        }));
        reader
            .create_task_node("sample", PhantomData)
            .image_access(id, AccessType::FragmentShaderSampledRead, ImageLayoutType::Optimal)
            .unwrap();
        let mut reader = reader.compile().unwrap();

        record(&device, &mut writer);

        let handle = record(&device, &mut reader);
        let commands = backend.commands(handle).unwrap();
        let barrier = commands[0].barriers()[0];
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(
            image_barriers(&commands[0])[0].1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        // Writing after the read only has to wait for the reader to finish.
        let handle = record(&device, &mut writer);
        let commands = backend.commands(handle).unwrap();
        let barrier = commands[0].barriers()[0];
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert!(barrier.src_access_mask.is_empty());
        assert_eq!(
            image_barriers(&commands[0])[0].1,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn write_read_present_over_two_frames() {
        let (backend, device) = device();
        let swapchain = device
            .create_swapchain(&SwapchainCreateInfo {
                extent: [8, 8],
                image_count: 2,
                ..Default::default()
            })
            .unwrap();
        let buffer = host_buffer(&device);
        let task_buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            buffers: &[buffer],
            ..Default::default()
        });
        let task_image = TaskImage::new(&TaskImageCreateInfo {
            swapchain_image: true,
            ..Default::default()
        });

        let mut graph = TaskGraph::new(
            &device,
            &TaskGraphCreateInfo {
                swapchain: Some(swapchain.clone()),
                ..Default::default()
            },
        );
        let id = graph.use_persistent_buffer(&task_buffer);
        let swapchain_image = graph.use_persistent_image(&task_image);
        graph
            .add_task("write", move |ti| {
                let buffer = ti.buffer(id)?;

                unsafe {
                    ti.recorder().fill_buffer(&FillBufferInfo {
                        dst_buffer: buffer,
                        size: 4,
                        data: 3,
                        ..Default::default()
                    })
                }?;

                Ok(())
            })
            .buffer_access(id, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .add_render_task(
                "read",
                &RenderTaskInfo {
                    color_attachments: &[(swapchain_image, AttachmentInfo::new())],
                    ..Default::default()
                },
                |_| Ok(()),
            )
            .unwrap()
            .buffer_access(id, AccessType::FragmentShaderUniformRead)
            .unwrap();
        graph.add_present().unwrap();
        let mut executable = graph.compile().unwrap();

        let mut initial_buffer_barriers = Vec::new();

        for _ in 0..2 {
            swapchain.acquire_next_image(None).unwrap();
            let handle = record(&device, &mut executable);
            let commands = backend.commands(handle).unwrap();

            initial_buffer_barriers.push(
                commands[0]
                    .barriers()
                    .iter()
                    .filter(|barrier| matches!(barrier.resource, BarrierResource::Buffer { .. }))
                    .copied()
                    .collect::<Vec<_>>(),
            );
        }

        // The first frame starts without history. The second one waits for the read of the
        // first before writing again.
        assert!(initial_buffer_barriers[0].is_empty());
        assert_eq!(initial_buffer_barriers[1].len(), 1);
        let barrier = initial_buffer_barriers[1][0];
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert!(barrier.src_access_mask.is_empty());
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);

        assert_eq!(read_u32(&device, buffer), 3);
        assert_eq!(backend.presents().len(), 2);
        assert!(backend.validation_errors().is_empty());

        device.collect_garbage().unwrap();
        assert_eq!(device.gpu_timeline_value(), Ok(device.cpu_timeline_value()));
        assert_eq!(device.zombie_count(), 0);
    }
}
