use super::{ExecutableTaskGraph, NodeIndex, ResourceAccess, TaskGraph, TaskNode};
use crate::{
    backend::BackendError,
    resource::{AccessType, ImageLayoutType, ImageSlice},
};
use ash::vk;
use foldhash::{HashMap, HashMapExt};
use smallvec::SmallVec;
use std::{error::Error, fmt};

pub(crate) type BarrierIndex = u32;

pub(crate) type EventIndex = u32;

impl TaskGraph {
    /// Compiles the task graph into an executable form.
    ///
    /// Tasks keep the order they were added in. For every access of every task resource the
    /// previous access is looked up, and a barrier is inserted in between if either of them
    /// writes or if the image layout changes. Consecutive reads in the same layout share one
    /// barrier, whose destination scope is widened for every further reader.
    pub fn compile(self) -> Result<ExecutableTaskGraph, CompileError> {
        let mut compiler = Compiler::new(&self);

        if let Err(kind) = compiler.visit_graph(&self) {
            return Err(CompileError::new(self, kind));
        }

        let (steps, event_count) = compiler.schedule(&self);

        let events = match self.create_events(event_count) {
            Ok(events) => events,
            Err(err) => return Err(CompileError::new(self, CompileErrorKind::Backend(err))),
        };

        log::debug!(
            "compiled task graph {:?}: {} tasks, {} barriers, {} split barriers",
            self.name,
            self.nodes.len(),
            compiler.barriers.len(),
            events.len(),
        );

        let Compiler {
            buffers,
            images,
            barriers,
            ..
        } = compiler;

        Ok(ExecutableTaskGraph {
            graph: self,
            barriers,
            steps,
            events,
            final_buffer_states: buffers
                .into_iter()
                .map(|state| state.map(ResourceState::to_final))
                .collect(),
            final_image_states: images
                .into_iter()
                .map(|image| {
                    image
                        .states
                        .into_iter()
                        .map(|state| state.map(ResourceState::to_final))
                        .collect()
                })
                .collect(),
        })
    }

    fn create_events(&self, count: EventIndex) -> Result<Vec<vk::Event>, BackendError> {
        let backend = self.device.backend();
        let mut events = Vec::with_capacity(count as usize);

        for event_index in 0..count {
            match backend.create_event(&format!("{} split barrier {event_index}", self.name)) {
                Ok(event) => events.push(event),
                Err(err) => {
                    for event in events {
                        // SAFETY: The event was never recorded into a command buffer.
                        unsafe { backend.destroy_event(event) };
                    }

                    return Err(err);
                }
            }
        }

        Ok(events)
    }
}

/// A barrier of the compiled schedule. At execution it is expanded over every resource bound to
/// its task resource.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BarrierRecord {
    pub(crate) src_stages: vk::PipelineStageFlags2,
    pub(crate) src_access: vk::AccessFlags2,
    pub(crate) dst_stages: vk::PipelineStageFlags2,
    pub(crate) dst_access: vk::AccessFlags2,
    pub(crate) old_layout: vk::ImageLayout,
    pub(crate) new_layout: vk::ImageLayout,
    pub(crate) target: BarrierTarget,
    pub(crate) placement: Placement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BarrierTarget {
    Buffer { index: u32 },
    Image { index: u32, slice: ImageSlice },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Before the first step. The source scope and the old layout are taken from the history
    /// of the task resource at execution.
    Initial,
    /// In a pipeline barrier right before the consumer.
    Pipeline { consumer: NodeIndex },
    /// Signaled after the producer and waited on right before the consumer.
    Split {
        producer: NodeIndex,
        consumer: NodeIndex,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    InitialBarriers {
        barriers: Vec<BarrierIndex>,
    },
    PipelineBarrier {
        barriers: Vec<BarrierIndex>,
    },
    SetEvent {
        event: EventIndex,
        barriers: Vec<BarrierIndex>,
    },
    WaitEvent {
        event: EventIndex,
        barriers: Vec<BarrierIndex>,
    },
    ResetEvent {
        event: EventIndex,
        stages: vk::PipelineStageFlags2,
    },
    BeginRendering {
        node: NodeIndex,
    },
    ExecuteTask {
        node: NodeIndex,
    },
    EndRendering,
    Present,
}

/// The state a buffer or image subresource is left in by the last accesses of the graph.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FinalState {
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    pub(crate) access_mask: vk::AccessFlags2,
    pub(crate) image_layout: vk::ImageLayout,
    /// Whether the accesses since the last barrier only read.
    pub(crate) reading: bool,
    pub(crate) barrier: BarrierIndex,
}

struct Compiler {
    use_split_barriers: bool,
    node_count: NodeIndex,
    buffers: Vec<Option<ResourceState>>,
    images: Vec<SubresourceStates>,
    barriers: Vec<BarrierRecord>,
}

struct SubresourceStates {
    array_layers: u32,
    mip_levels: u32,
    /// Indexed by `mip_level * array_layers + array_layer`.
    states: Vec<Option<ResourceState>>,
}

#[derive(Clone, Copy, Debug)]
struct ResourceState {
    /// The scope that a conflicting access has to wait on. After reads the access mask is empty.
    src_stages: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    layout: vk::ImageLayout,
    reading: bool,
    /// The barrier that made the resource available to the last accesses.
    barrier: BarrierIndex,
    last_node: NodeIndex,
}

impl ResourceState {
    fn new(access: &ResourceAccess, barrier: BarrierIndex, node: NodeIndex) -> Self {
        let is_write = access.is_write();

        ResourceState {
            src_stages: access.stage_mask,
            src_access: if is_write {
                access.access_mask
            } else {
                vk::AccessFlags2::empty()
            },
            layout: access.image_layout,
            reading: !is_write,
            barrier,
            last_node: node,
        }
    }

    fn to_final(self) -> FinalState {
        FinalState {
            stage_mask: self.src_stages,
            access_mask: self.src_access,
            image_layout: self.layout,
            reading: self.reading,
            barrier: self.barrier,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    /// The first access in the graph.
    Initial,
    /// A read following reads in the same layout.
    Widen,
    Barrier {
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        old_layout: vk::ImageLayout,
        producer: NodeIndex,
    },
}

fn transition(state: Option<&ResourceState>, access: &ResourceAccess) -> Transition {
    match state {
        None => Transition::Initial,
        Some(state)
            if state.reading && !access.is_write() && state.layout == access.image_layout =>
        {
            Transition::Widen
        }
        Some(state) => Transition::Barrier {
            src_stages: state.src_stages,
            src_access: state.src_access,
            old_layout: state.layout,
            producer: state.last_node,
        },
    }
}

/// The source half of a barrier, which is what subresources need to share to be coalesced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BarrierSource {
    src_stages: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    old_layout: vk::ImageLayout,
    placement: Placement,
}

impl Compiler {
    fn new(graph: &TaskGraph) -> Self {
        Compiler {
            use_split_barriers: graph.use_split_barriers,
            node_count: graph.nodes.len() as NodeIndex,
            buffers: vec![None; graph.buffers.len()],
            images: graph
                .images
                .iter()
                .map(|slot| {
                    let whole_slice = slot.whole_slice();

                    SubresourceStates {
                        array_layers: whole_slice.layer_count,
                        mip_levels: whole_slice.level_count,
                        states: vec![
                            None;
                            (whole_slice.level_count * whole_slice.layer_count) as usize
                        ],
                    }
                })
                .collect(),
            barriers: Vec::new(),
        }
    }

    fn visit_graph(&mut self, graph: &TaskGraph) -> Result<(), CompileErrorKind> {
        for (node_index, node) in graph.nodes.iter().enumerate() {
            let node_index = node_index as NodeIndex;

            for (index, access) in &node.buffer_accesses {
                self.visit_buffer(*index, access, node_index);
            }

            for (index, accesses) in self.merge_image_accesses(graph, node)? {
                self.visit_image(index, &accesses, node_index);
            }
        }

        if graph.present {
            self.visit_present(graph)?;
        }

        Ok(())
    }

    fn visit_buffer(&mut self, index: u32, access: &ResourceAccess, node: NodeIndex) {
        let state = &mut self.buffers[index as usize];

        match transition(state.as_ref(), access) {
            Transition::Widen => {
                if let Some(state) = state {
                    widen(&mut self.barriers, state, access, node);
                }
            }
            Transition::Initial => {
                let barrier = push_barrier(
                    &mut self.barriers,
                    BarrierTarget::Buffer { index },
                    access,
                    BarrierSource::initial(),
                );
                *state = Some(ResourceState::new(access, barrier, node));
            }
            Transition::Barrier {
                src_stages,
                src_access,
                old_layout,
                producer,
            } => {
                let source = BarrierSource {
                    src_stages,
                    src_access,
                    old_layout,
                    placement: placement(self.use_split_barriers, self.node_count, producer, node),
                };
                let barrier = push_barrier(
                    &mut self.barriers,
                    BarrierTarget::Buffer { index },
                    access,
                    source,
                );
                *state = Some(ResourceState::new(access, barrier, node));
            }
        }
    }

    /// Combines the image accesses of a node per subresource.
    fn merge_image_accesses(
        &self,
        graph: &TaskGraph,
        node: &TaskNode,
    ) -> Result<SmallVec<[(u32, Vec<Option<ResourceAccess>>); 2]>, CompileErrorKind> {
        let mut merged = SmallVec::<[(u32, Vec<Option<ResourceAccess>>); 2]>::new();

        for (access_index, (index, slice, access)) in node.image_accesses.iter().enumerate() {
            let image = &self.images[*index as usize];
            let position = match merged.iter().position(|(other, _)| other == index) {
                Some(position) => position,
                None => {
                    merged.push((*index, vec![None; image.states.len()]));
                    merged.len() - 1
                }
            };
            let accesses = &mut merged[position].1;

            for mip_level in slice.mip_levels() {
                for array_layer in slice.array_layers() {
                    let subresource = (mip_level * image.array_layers + array_layer) as usize;

                    match &mut accesses[subresource] {
                        Some(existing) if existing.image_layout != access.image_layout => {
                            let (_, first_slice, first_access) = node.image_accesses
                                [..access_index]
                                .iter()
                                .find(|(other, other_slice, other_access)| {
                                    other == index
                                        && other_slice.intersects(slice)
                                        && other_access.image_layout != access.image_layout
                                })
                                .copied()
                                .unwrap_or((*index, *slice, *existing));

                            return Err(CompileErrorKind::ConflictingAccess {
                                task: node.name.clone(),
                                resource: graph.images[*index as usize].name().to_owned(),
                                first: AccessDescriptor::new(first_slice, &first_access),
                                second: AccessDescriptor::new(*slice, access),
                            });
                        }
                        Some(existing) => {
                            existing.stage_mask |= access.stage_mask;
                            existing.access_mask |= access.access_mask;
                        }
                        None => accesses[subresource] = Some(*access),
                    }
                }
            }
        }

        Ok(merged)
    }

    fn visit_image(&mut self, index: u32, accesses: &[Option<ResourceAccess>], node: NodeIndex) {
        let use_split_barriers = self.use_split_barriers;
        let node_count = self.node_count;
        let image = &mut self.images[index as usize];
        let array_layers = image.array_layers;

        let transitions = image
            .states
            .iter_mut()
            .zip(accesses)
            .map(|(state, access)| {
                let access = (*access)?;

                match transition(state.as_ref(), &access) {
                    Transition::Widen => {
                        if let Some(state) = state {
                            widen(&mut self.barriers, state, &access, node);
                        }

                        None
                    }
                    Transition::Initial => Some((BarrierSource::initial(), access)),
                    Transition::Barrier {
                        src_stages,
                        src_access,
                        old_layout,
                        producer,
                    } => {
                        let source = BarrierSource {
                            src_stages,
                            src_access,
                            old_layout,
                            placement: placement(use_split_barriers, node_count, producer, node),
                        };

                        Some((source, access))
                    }
                }
            })
            .collect::<Vec<_>>();

        let slices = coalesce(image.mip_levels, array_layers, |mip_level, array_layer| {
            transitions[(mip_level * array_layers + array_layer) as usize]
        });

        for (slice, (source, access)) in slices {
            let barrier = push_barrier(
                &mut self.barriers,
                BarrierTarget::Image { index, slice },
                &access,
                source,
            );

            for mip_level in slice.mip_levels() {
                for array_layer in slice.array_layers() {
                    image.states[(mip_level * array_layers + array_layer) as usize] =
                        Some(ResourceState::new(&access, barrier, node));
                }
            }
        }
    }

    /// Transitions every swapchain image that the tasks use into the present layout, right after
    /// the last task.
    fn visit_present(&mut self, graph: &TaskGraph) -> Result<(), CompileErrorKind> {
        let present_access = ResourceAccess {
            stage_mask: AccessType::Present.stage_mask(),
            access_mask: AccessType::Present.access_mask(),
            image_layout: AccessType::Present.image_layout(ImageLayoutType::Optimal),
        };
        let mut presented = false;

        for (index, slot) in graph.images.iter().enumerate() {
            let states = &self.images[index].states;

            if !slot.is_swapchain_image() || states.iter().all(Option::is_none) {
                continue;
            }

            let accesses = vec![Some(present_access); states.len()];
            self.visit_image(index as u32, &accesses, self.node_count);
            presented = true;
        }

        if presented {
            Ok(())
        } else {
            Err(CompileErrorKind::MissingSwapchainImage)
        }
    }

    /// Orders the barriers around the tasks. Returns the steps and the number of events that the
    /// split barriers need.
    fn schedule(&self, graph: &TaskGraph) -> (Vec<Step>, EventIndex) {
        let node_count = self.node_count as usize;
        let mut initial = Vec::new();
        let mut pipeline = vec![Vec::new(); node_count + 1];
        let mut waits = vec![SmallVec::<[(NodeIndex, BarrierIndex); 2]>::new(); node_count];
        let mut sets = vec![SmallVec::<[(NodeIndex, BarrierIndex); 2]>::new(); node_count];

        for (barrier_index, barrier) in self.barriers.iter().enumerate() {
            let barrier_index = barrier_index as BarrierIndex;

            match barrier.placement {
                Placement::Initial => initial.push(barrier_index),
                Placement::Pipeline { consumer } => {
                    pipeline[consumer as usize].push(barrier_index);
                }
                Placement::Split { producer, consumer } => {
                    waits[consumer as usize].push((producer, barrier_index));
                    sets[producer as usize].push((consumer, barrier_index));
                }
            }
        }

        let mut steps = Vec::new();
        let mut events = HashMap::<(NodeIndex, NodeIndex), EventIndex>::new();

        if !initial.is_empty() {
            steps.push(Step::InitialBarriers { barriers: initial });
        }

        for (node_index, node) in graph.nodes.iter().enumerate() {
            let barriers = std::mem::take(&mut pipeline[node_index]);

            if !barriers.is_empty() {
                steps.push(Step::PipelineBarrier { barriers });
            }

            for (producer, barriers) in group_by_node(&mut waits[node_index]) {
                let Some(&event) = events.get(&(producer, node_index as NodeIndex)) else {
                    continue;
                };
                let stages = barriers
                    .iter()
                    .fold(vk::PipelineStageFlags2::empty(), |stages, &barrier| {
                        stages | self.barriers[barrier as usize].dst_stages
                    });

                steps.push(Step::WaitEvent { event, barriers });
                steps.push(Step::ResetEvent {
                    event,
                    stages: if stages.is_empty() {
                        vk::PipelineStageFlags2::ALL_COMMANDS
                    } else {
                        stages
                    },
                });
            }

            let node_index = node_index as NodeIndex;

            if node.rendering.is_some() {
                steps.push(Step::BeginRendering { node: node_index });
                steps.push(Step::ExecuteTask { node: node_index });
                steps.push(Step::EndRendering);
            } else {
                steps.push(Step::ExecuteTask { node: node_index });
            }

            for (consumer, barriers) in group_by_node(&mut sets[node_index as usize]) {
                let event = events.len() as EventIndex;
                events.insert((node_index, consumer), event);
                steps.push(Step::SetEvent { event, barriers });
            }
        }

        if graph.present {
            let barriers = std::mem::take(&mut pipeline[node_count]);

            if !barriers.is_empty() {
                steps.push(Step::PipelineBarrier { barriers });
            }

            steps.push(Step::Present);
        }

        (steps, events.len() as EventIndex)
    }
}

impl BarrierSource {
    fn initial() -> Self {
        BarrierSource {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            old_layout: vk::ImageLayout::UNDEFINED,
            placement: Placement::Initial,
        }
    }
}

fn placement(
    use_split_barriers: bool,
    node_count: NodeIndex,
    producer: NodeIndex,
    consumer: NodeIndex,
) -> Placement {
    if use_split_barriers && consumer < node_count && consumer > producer + 1 {
        Placement::Split { producer, consumer }
    } else {
        Placement::Pipeline { consumer }
    }
}

fn push_barrier(
    barriers: &mut Vec<BarrierRecord>,
    target: BarrierTarget,
    access: &ResourceAccess,
    source: BarrierSource,
) -> BarrierIndex {
    let barrier = BarrierRecord {
        src_stages: source.src_stages,
        src_access: source.src_access,
        dst_stages: access.stage_mask,
        dst_access: access.access_mask,
        old_layout: source.old_layout,
        new_layout: access.image_layout,
        target,
        placement: source.placement,
    };

    log::trace!("emitting barrier {barrier:?}");

    let barrier_index = barriers.len() as BarrierIndex;
    barriers.push(barrier);

    barrier_index
}

fn widen(
    barriers: &mut [BarrierRecord],
    state: &mut ResourceState,
    access: &ResourceAccess,
    node: NodeIndex,
) {
    let barrier = &mut barriers[state.barrier as usize];
    barrier.dst_stages |= access.stage_mask;
    barrier.dst_access |= access.access_mask;

    state.src_stages |= access.stage_mask;
    state.last_node = node;
}

/// Groups `(node, barrier)` pairs by node, in ascending node order.
fn group_by_node(
    pairs: &mut [(NodeIndex, BarrierIndex)],
) -> SmallVec<[(NodeIndex, Vec<BarrierIndex>); 2]> {
    pairs.sort_by_key(|&(node, _)| node);

    let mut groups = SmallVec::<[(NodeIndex, Vec<BarrierIndex>); 2]>::new();

    for &(node, barrier) in pairs.iter() {
        match groups.last_mut() {
            Some((last, barriers)) if *last == node => barriers.push(barrier),
            _ => groups.push((node, vec![barrier])),
        }
    }

    groups
}

/// Splits the subresources of an image into slices whose subresources have equal keys.
/// Subresources without a key are left out.
///
/// Array layers of a mip level are merged into runs first, then runs covering the same layers of
/// adjacent mip levels are merged.
pub(crate) fn coalesce<K: Copy + PartialEq>(
    mip_levels: u32,
    array_layers: u32,
    mut key: impl FnMut(u32, u32) -> Option<K>,
) -> SmallVec<[(ImageSlice, K); 2]> {
    let mut slices = SmallVec::<[(ImageSlice, K); 2]>::new();

    for mip_level in 0..mip_levels {
        let mut array_layer = 0;

        while array_layer < array_layers {
            let Some(run_key) = key(mip_level, array_layer) else {
                array_layer += 1;
                continue;
            };
            let start = array_layer;
            array_layer += 1;

            while array_layer < array_layers && key(mip_level, array_layer) == Some(run_key) {
                array_layer += 1;
            }

            let layers = start..array_layer;
            let merged = slices.iter_mut().find(|(slice, other)| {
                *other == run_key
                    && slice.array_layers() == layers
                    && slice.mip_levels().end == mip_level
            });

            match merged {
                Some((slice, _)) => slice.level_count += 1,
                None => slices.push((
                    ImageSlice {
                        base_mip_level: mip_level,
                        level_count: 1,
                        base_array_layer: start,
                        layer_count: array_layer - start,
                    },
                    run_key,
                )),
            }
        }
    }

    slices
}

/// Error that can happen when compiling a [`TaskGraph`].
pub struct CompileError {
    pub graph: TaskGraph,
    pub kind: CompileErrorKind,
}

/// The kind of [`CompileError`] that occurred.
#[derive(Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// A task accesses overlapping slices of an image in different layouts.
    ConflictingAccess {
        task: String,
        resource: String,
        first: AccessDescriptor,
        second: AccessDescriptor,
    },

    /// A present was requested but none of the tasks uses a swapchain task image.
    MissingSwapchainImage,

    /// Creating the events for the split barriers failed.
    Backend(BackendError),
}

/// Describes an access declared by a task, for error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessDescriptor {
    pub slice: ImageSlice,
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
    pub image_layout: vk::ImageLayout,
}

impl AccessDescriptor {
    fn new(slice: ImageSlice, access: &ResourceAccess) -> Self {
        AccessDescriptor {
            slice,
            stage_mask: access.stage_mask,
            access_mask: access.access_mask,
            image_layout: access.image_layout,
        }
    }
}

impl CompileError {
    fn new(graph: TaskGraph, kind: CompileErrorKind) -> Self {
        CompileError { graph, kind }
    }
}

impl fmt::Debug for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CompileErrorKind::ConflictingAccess {
                task,
                resource,
                first,
                second,
            } => write!(
                f,
                "task {task:?} accesses overlapping slices of image {resource:?} in different \
                layouts ({:?} and {:?})",
                first.image_layout, second.image_layout,
            ),
            CompileErrorKind::MissingSwapchainImage => {
                f.write_str("a present was requested but no task uses a swapchain image")
            }
            CompileErrorKind::Backend(_) => f.write_str("a runtime error occurred"),
        }
    }
}

impl Error for CompileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            CompileErrorKind::Backend(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::HeadlessBackend,
        device::{Device, DeviceCreateInfo},
        graph::{TaskGraphCreateInfo, TaskImage, TaskImageCreateInfo},
        resource::{BufferCreateInfo, ImageCreateInfo, ImageLayoutType},
        swapchain::SwapchainCreateInfo,
    };
    use std::{marker::PhantomData, sync::Arc};

    fn device() -> Arc<Device> {
        Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap()
    }

    fn buffer_info() -> BufferCreateInfo {
        BufferCreateInfo {
            size: 64,
            usage: vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
            ..Default::default()
        }
    }

    fn split_graph(device: &Arc<Device>) -> TaskGraph {
        TaskGraph::new(
            device,
            &TaskGraphCreateInfo {
                use_split_barriers: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn read_after_write() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = graph.create_task_buffer(&buffer_info());
        graph
            .create_task_node("write", PhantomData)
            .buffer_access(buffer, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .create_task_node("read", PhantomData)
            .buffer_access(buffer, AccessType::ComputeShaderStorageRead)
            .unwrap();

        let executable = graph.compile().unwrap();
        assert_eq!(
            executable.steps,
            [
                Step::InitialBarriers { barriers: vec![0] },
                Step::ExecuteTask { node: 0 },
                Step::PipelineBarrier { barriers: vec![1] },
                Step::ExecuteTask { node: 1 },
            ],
        );

        let barrier = &executable.barriers[1];
        assert_eq!(barrier.src_stages, vk::PipelineStageFlags2::COPY);
        assert_eq!(barrier.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::SHADER_STORAGE_READ);
        assert_eq!(barrier.placement, Placement::Pipeline { consumer: 1 });
    }

    #[test]
    fn readers_share_a_barrier() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = graph.create_task_buffer(&buffer_info());
        graph
            .create_task_node("write", PhantomData)
            .buffer_access(buffer, AccessType::CopyTransferWrite)
            .unwrap();
        graph
            .create_task_node("read1", PhantomData)
            .buffer_access(buffer, AccessType::ComputeShaderStorageRead)
            .unwrap();
        graph
            .create_task_node("read2", PhantomData)
            .buffer_access(buffer, AccessType::FragmentShaderUniformRead)
            .unwrap();

        let executable = graph.compile().unwrap();
        assert_eq!(executable.barriers.len(), 2);
        assert!(!executable.steps[3..]
            .iter()
            .any(|step| matches!(step, Step::PipelineBarrier { .. })));

        let barrier = &executable.barriers[1];
        assert_eq!(
            barrier.dst_stages,
            vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        assert_eq!(
            barrier.dst_access,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::UNIFORM_READ,
        );
    }

    #[test]
    fn write_after_read_is_execution_only() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = graph.create_task_buffer(&buffer_info());
        graph
            .create_task_node("read", PhantomData)
            .buffer_access(buffer, AccessType::ComputeShaderStorageRead)
            .unwrap();
        graph
            .create_task_node("write", PhantomData)
            .buffer_access(buffer, AccessType::CopyTransferWrite)
            .unwrap();

        let executable = graph.compile().unwrap();
        let barrier = &executable.barriers[1];
        assert_eq!(barrier.src_stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert!(barrier.src_access.is_empty());
        assert_eq!(barrier.dst_access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn layout_change_between_reads() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let image = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [4, 4, 1],
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE,
            ..Default::default()
        });
        graph
            .create_task_node("sample", PhantomData)
            .image_access(
                image,
                AccessType::FragmentShaderSampledRead,
                ImageLayoutType::Optimal,
            )
            .unwrap();
        graph
            .create_task_node("load", PhantomData)
            .image_access(
                image,
                AccessType::ComputeShaderStorageRead,
                ImageLayoutType::Optimal,
            )
            .unwrap();

        let executable = graph.compile().unwrap();
        assert_eq!(executable.barriers.len(), 2);

        let barrier = &executable.barriers[1];
        assert_eq!(barrier.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::GENERAL);
        assert!(barrier.src_access.is_empty());
    }

    #[test]
    fn present_is_a_single_transition() {
        let device = device();
        let swapchain = device
            .create_swapchain(&SwapchainCreateInfo {
                extent: [8, 8],
                image_usage: vk::ImageUsageFlags::SAMPLED,
                ..Default::default()
            })
            .unwrap();
        let mut graph = TaskGraph::new(
            &device,
            &TaskGraphCreateInfo {
                swapchain: Some(swapchain),
                ..Default::default()
            },
        );
        let swapchain_image = graph.use_persistent_image(&TaskImage::new(&TaskImageCreateInfo {
            swapchain_image: true,
            ..Default::default()
        }));
        graph
            .create_task_node("sample", PhantomData)
            .image_access(
                swapchain_image,
                AccessType::FragmentShaderSampledRead,
                ImageLayoutType::Optimal,
            )
            .unwrap();
        graph.add_present().unwrap();

        let executable = graph.compile().unwrap();
        let transitions = executable
            .barriers
            .iter()
            .filter(|barrier| barrier.placement != Placement::Initial)
            .collect::<Vec<_>>();
        assert_eq!(transitions.len(), 1);
        assert_eq!(
            transitions[0].old_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(transitions[0].new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            executable.steps[executable.steps.len() - 2..],
            [Step::PipelineBarrier { barriers: vec![1] }, Step::Present],
        );
    }

    #[test]
    fn present_needs_a_swapchain_image() {
        let device = device();
        let swapchain = device
            .create_swapchain(&SwapchainCreateInfo {
                extent: [8, 8],
                ..Default::default()
            })
            .unwrap();
        let mut graph = TaskGraph::new(
            &device,
            &TaskGraphCreateInfo {
                swapchain: Some(swapchain),
                ..Default::default()
            },
        );
        graph.create_task_node("nothing", PhantomData);
        graph.add_present().unwrap();

        let err = graph.compile().unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::MissingSwapchainImage);
        assert_eq!(err.graph.task_node_count(), 1);
    }

    #[test]
    fn subresources_are_tracked_separately() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let image = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [16, 16, 1],
            mip_levels: 3,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            ..Default::default()
        });
        let mip = |mip_level| ImageSlice {
            base_mip_level: mip_level,
            ..ImageSlice::new(1, 1)
        };

        graph
            .create_task_node("upload", PhantomData)
            .image_access(image, AccessType::CopyTransferWrite, ImageLayoutType::Optimal)
            .unwrap();

        for mip_level in 1..3 {
            graph
                .create_task_node(format!("blit {mip_level}"), PhantomData)
                .image_slice_access(
                    image,
                    mip(mip_level - 1),
                    AccessType::BlitTransferRead,
                    ImageLayoutType::Optimal,
                )
                .unwrap()
                .image_slice_access(
                    image,
                    mip(mip_level),
                    AccessType::BlitTransferWrite,
                    ImageLayoutType::Optimal,
                )
                .unwrap();
        }

        graph
            .create_task_node("sample", PhantomData)
            .image_access(
                image,
                AccessType::FragmentShaderSampledRead,
                ImageLayoutType::Optimal,
            )
            .unwrap();

        let executable = graph.compile().unwrap();
        let sample_barriers = executable
            .barriers
            .iter()
            .filter(|barrier| barrier.placement == Placement::Pipeline { consumer: 3 })
            .collect::<Vec<_>>();

        // Mip levels 0 and 1 were last read as blit sources, mip level 2 was last written.
        assert_eq!(sample_barriers.len(), 2);
        assert_eq!(
            sample_barriers[0].target,
            BarrierTarget::Image {
                index: 0,
                slice: ImageSlice::new(2, 1),
            },
        );
        assert_eq!(
            sample_barriers[0].old_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert!(sample_barriers[0].src_access.is_empty());
        assert_eq!(
            sample_barriers[1].target,
            BarrierTarget::Image {
                index: 0,
                slice: mip(2),
            },
        );
        assert_eq!(
            sample_barriers[1].old_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(sample_barriers[1].src_access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn conflicting_layouts_in_one_task() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let image = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [16, 16, 1],
            mip_levels: 2,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            ..Default::default()
        });
        graph
            .create_task_node("confused", PhantomData)
            .image_access(
                image,
                AccessType::FragmentShaderSampledRead,
                ImageLayoutType::Optimal,
            )
            .unwrap()
            .image_slice_access(
                image,
                ImageSlice::new(1, 1),
                AccessType::CopyTransferWrite,
                ImageLayoutType::Optimal,
            )
            .unwrap();

        let err = graph.compile().unwrap_err();
        let CompileErrorKind::ConflictingAccess {
            task,
            first,
            second,
            ..
        } = &err.kind
        else {
            panic!("expected a conflicting access");
        };
        assert_eq!(task, "confused");
        assert_eq!(first.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(second.image_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(second.slice, ImageSlice::new(1, 1));
    }

    #[test]
    fn distant_consumers_use_split_barriers() {
        let device = device();
        let mut graph = split_graph(&device);
        let shared = graph.create_task_buffer(&buffer_info());
        let unrelated = graph.create_task_buffer(&buffer_info());
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
        graph
            .create_task_node("overwrite", PhantomData)
            .buffer_access(shared, AccessType::CopyTransferWrite)
            .unwrap();

        let executable = graph.compile().unwrap();
        assert_eq!(executable.split_barrier_count(), 1);
        assert_eq!(
            executable.steps,
            [
                Step::InitialBarriers {
                    barriers: vec![0, 1],
                },
                Step::ExecuteTask { node: 0 },
                Step::SetEvent {
                    event: 0,
                    barriers: vec![2],
                },
                Step::ExecuteTask { node: 1 },
                Step::WaitEvent {
                    event: 0,
                    barriers: vec![2],
                },
                Step::ResetEvent {
                    event: 0,
                    stages: vk::PipelineStageFlags2::COMPUTE_SHADER,
                },
                Step::ExecuteTask { node: 2 },
                Step::PipelineBarrier { barriers: vec![3] },
                Step::ExecuteTask { node: 3 },
            ],
        );
        assert_eq!(
            executable.barriers[2].placement,
            Placement::Split {
                producer: 0,
                consumer: 2,
            },
        );
    }

    #[test]
    fn coalesce_merges_rectangles() {
        // Two mip levels of four layers; layers 1 and 2 share a key on both levels.
        let keys = [[Some(1), Some(2), Some(2), None], [Some(3), Some(2), Some(2), Some(3)]];
        let slices = coalesce(2, 4, |mip_level, array_layer| {
            keys[mip_level as usize][array_layer as usize]
        });

        assert_eq!(slices.len(), 4);
        assert_eq!(
            slices[1],
            (
                ImageSlice {
                    base_mip_level: 0,
                    level_count: 2,
                    base_array_layer: 1,
                    layer_count: 2,
                },
                2,
            ),
        );
        assert_eq!(slices[3].0.base_array_layer, 3);
        assert_eq!(slices[3].0.base_mip_level, 1);
    }
}
