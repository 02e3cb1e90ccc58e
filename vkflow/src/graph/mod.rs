//! The task graph data structure and associated types.
//!
//! A [`TaskGraph`] is a list of tasks that execute in the order they were added, each declaring
//! the resources it accesses and how. Compiling the graph derives the barriers and layout
//! transitions between the tasks from those declarations; executing it binds the task resources
//! to concrete resources and records everything into a [`CommandRecorder`].
//!
//! [`CommandRecorder`]: crate::command_buffer::CommandRecorder

pub use self::{
    compile::{AccessDescriptor, CompileError, CompileErrorKind},
    execute::ExecuteError,
};
use self::compile::{BarrierRecord, FinalState, Step};
use crate::{
    command_buffer::{ClearColorValue, ClearValue},
    device::Device,
    lock::Lock,
    resource::{
        contains_writes, AccessType, BufferCreateInfo, BufferId, ImageCreateInfo, ImageId,
        ImageLayoutType, ImageSlice,
    },
    swapchain::Swapchain,
    FnTask, Task, TaskInterface, TaskResult,
};
use ash::vk;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

mod compile;
pub(crate) mod execute;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

type NodeIndex = u32;

/// A list of [`Task`] nodes executed in declaration order, together with the task resources
/// they access.
pub struct TaskGraph {
    id: u64,
    device: Arc<Device>,
    name: String,
    use_split_barriers: bool,
    swapchain: Option<Arc<Swapchain>>,
    buffers: Vec<TaskBufferSlot>,
    images: Vec<TaskImageSlot>,
    nodes: Vec<TaskNode>,
    present: bool,
}

enum TaskBufferSlot {
    Persistent(TaskBuffer),
    Transient(BufferCreateInfo),
}

enum TaskImageSlot {
    Persistent(TaskImage),
    Transient(ImageCreateInfo),
}

impl TaskBufferSlot {
    fn name(&self) -> &str {
        match self {
            Self::Persistent(buffer) => buffer.name(),
            Self::Transient(create_info) => &create_info.name,
        }
    }
}

impl TaskImageSlot {
    fn name(&self) -> &str {
        match self {
            Self::Persistent(image) => image.name(),
            Self::Transient(create_info) => &create_info.name,
        }
    }

    /// The slice covering every subresource the task image can be accessed with.
    fn whole_slice(&self) -> ImageSlice {
        match self {
            Self::Persistent(image) => ImageSlice::new(image.mip_levels(), image.array_layers()),
            Self::Transient(create_info) => create_info.whole_slice(),
        }
    }

    fn is_swapchain_image(&self) -> bool {
        matches!(self, Self::Persistent(image) if image.is_swapchain_image())
    }
}

impl TaskGraph {
    /// Creates a new empty `TaskGraph`.
    pub fn new(device: &Arc<Device>, create_info: &TaskGraphCreateInfo) -> Self {
        if let Some(swapchain) = &create_info.swapchain {
            assert!(
                Arc::ptr_eq(swapchain.device(), device),
                "the swapchain was created on a different device",
            );
        }

        TaskGraph {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            device: device.clone(),
            name: create_info.name.clone(),
            use_split_barriers: create_info.use_split_barriers,
            swapchain: create_info.swapchain.clone(),
            buffers: Vec::new(),
            images: Vec::new(),
            nodes: Vec::new(),
            present: false,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a transient buffer, which is created at the start of every execution and destroyed
    /// once the recorded commands have completed.
    pub fn create_task_buffer(&mut self, create_info: &BufferCreateInfo) -> TaskBufferId {
        self.push_buffer(TaskBufferSlot::Transient(create_info.clone()))
    }

    /// Adds a transient image, which is created at the start of every execution and destroyed
    /// once the recorded commands have completed.
    pub fn create_task_image(&mut self, create_info: &ImageCreateInfo) -> TaskImageId {
        self.push_image(TaskImageSlot::Transient(create_info.clone()))
    }

    /// Makes a persistent task buffer accessible to the tasks of this graph.
    ///
    /// Using the same task buffer again returns the same ID.
    pub fn use_persistent_buffer(&mut self, buffer: &TaskBuffer) -> TaskBufferId {
        let existing = self.buffers.iter().position(|slot| match slot {
            TaskBufferSlot::Persistent(other) => Arc::ptr_eq(&other.inner, &buffer.inner),
            TaskBufferSlot::Transient(_) => false,
        });

        match existing {
            Some(index) => TaskBufferId {
                graph: self.id,
                index: index as u32,
            },
            None => self.push_buffer(TaskBufferSlot::Persistent(buffer.clone())),
        }
    }

    /// Makes a persistent task image accessible to the tasks of this graph.
    ///
    /// Using the same task image again returns the same ID.
    pub fn use_persistent_image(&mut self, image: &TaskImage) -> TaskImageId {
        let existing = self.images.iter().position(|slot| match slot {
            TaskImageSlot::Persistent(other) => Arc::ptr_eq(&other.inner, &image.inner),
            TaskImageSlot::Transient(_) => false,
        });

        match existing {
            Some(index) => TaskImageId {
                graph: self.id,
                index: index as u32,
            },
            None => self.push_image(TaskImageSlot::Persistent(image.clone())),
        }
    }

    fn push_buffer(&mut self, slot: TaskBufferSlot) -> TaskBufferId {
        let index = self.buffers.len() as u32;
        self.buffers.push(slot);

        TaskBufferId {
            graph: self.id,
            index,
        }
    }

    fn push_image(&mut self, slot: TaskImageSlot) -> TaskImageId {
        let index = self.images.len() as u32;
        self.images.push(slot);

        TaskImageId {
            graph: self.id,
            index,
        }
    }

    /// Creates a new [`TaskNode`] from the given `task` and returns a builder to declare its
    /// resource accesses.
    pub fn create_task_node(
        &mut self,
        name: impl Into<String>,
        task: impl Task,
    ) -> TaskNodeBuilder<'_> {
        let node_index = self.push_node(name.into(), Box::new(task), None);

        TaskNodeBuilder {
            graph: self,
            node_index,
        }
    }

    /// Adds a task whose commands are recorded by the closure `f`.
    pub fn add_task<F>(&mut self, name: impl Into<String>, f: F) -> TaskNodeBuilder<'_>
    where
        F: Fn(&mut TaskInterface<'_>) -> TaskResult + Send + Sync + 'static,
    {
        self.create_task_node(name, FnTask(f))
    }

    /// Adds a task that records inside a rendering scope.
    ///
    /// The rendering scope is opened with the given attachments before `f` is called and closed
    /// after. The attachment accesses are declared automatically: an attachment whose load op is
    /// `LOAD` is read and written, any other attachment is only written.
    pub fn add_render_task<F>(
        &mut self,
        name: impl Into<String>,
        render_info: &RenderTaskInfo<'_>,
        f: F,
    ) -> Result<TaskNodeBuilder<'_>>
    where
        F: Fn(&mut TaskInterface<'_>) -> TaskResult + Send + Sync + 'static,
    {
        let &RenderTaskInfo {
            color_attachments,
            ref depth_attachment,
            render_area_extent,
            _ne: _,
        } = render_info;

        let mut rendering = RenderingDesc {
            render_area_extent,
            color_attachments: SmallVec::new(),
            depth_attachment: None,
        };
        let mut declared = SmallVec::<[_; 5]>::new();

        for (id, attachment) in color_attachments {
            let access_type = if attachment.load_op == vk::AttachmentLoadOp::LOAD {
                AccessType::ColorAttachmentReadWrite
            } else {
                AccessType::ColorAttachmentWrite
            };
            let (index, slice) = self.resolve_attachment(*id, attachment)?;
            rendering.color_attachments.push(RenderAttachment::new(
                index,
                slice,
                access_type.image_layout(attachment.layout_type),
                attachment,
            ));
            declared.push((*id, slice, access_type, attachment.layout_type));
        }

        if let Some((id, attachment)) = depth_attachment {
            let access_type = if attachment.load_op == vk::AttachmentLoadOp::LOAD {
                AccessType::DepthStencilAttachmentReadWrite
            } else {
                AccessType::DepthStencilAttachmentWrite
            };
            let (index, slice) = self.resolve_attachment(*id, attachment)?;
            rendering.depth_attachment = Some(RenderAttachment::new(
                index,
                slice,
                access_type.image_layout(attachment.layout_type),
                attachment,
            ));
            declared.push((*id, slice, access_type, attachment.layout_type));
        }

        let node_index = self.push_node(name.into(), Box::new(FnTask(f)), Some(rendering));

        for (id, slice, access_type, layout_type) in declared {
            if let Err(err) =
                self.declare_image_access(node_index, id, slice, access_type, layout_type)
            {
                self.nodes.pop();
                return Err(err);
            }
        }

        Ok(TaskNodeBuilder {
            graph: self,
            node_index,
        })
    }

    fn resolve_attachment(
        &self,
        id: TaskImageId,
        attachment: &AttachmentInfo,
    ) -> Result<(u32, ImageSlice)> {
        let index = self.image_index(id)?;
        let whole_slice = self.images[index as usize].whole_slice();
        let slice = attachment.slice.unwrap_or(whole_slice);

        if slice.is_empty() || !whole_slice.contains(&slice) {
            return Err(TaskGraphError::InvalidSlice);
        }

        Ok((index, slice))
    }

    /// Requests that the graph's swapchain image is presented after the last task.
    ///
    /// The swapchain task image is transitioned to `PRESENT_SRC_KHR` directly from the layout of
    /// its last access.
    pub fn add_present(&mut self) -> Result {
        if self.swapchain.is_none() {
            return Err(TaskGraphError::PresentWithoutSwapchain);
        }

        if mem::replace(&mut self.present, true) {
            return Err(TaskGraphError::DuplicatePresent);
        }

        Ok(())
    }

    fn push_node(
        &mut self,
        name: String,
        task: Box<dyn Task>,
        rendering: Option<RenderingDesc>,
    ) -> NodeIndex {
        let node_index = self.nodes.len() as NodeIndex;
        self.nodes.push(TaskNode {
            name,
            task,
            buffer_accesses: SmallVec::new(),
            image_accesses: SmallVec::new(),
            rendering,
        });

        node_index
    }

    fn buffer_index(&self, id: TaskBufferId) -> Result<u32> {
        if id.graph != self.id || id.index as usize >= self.buffers.len() {
            return Err(TaskGraphError::InvalidTaskResource);
        }

        Ok(id.index)
    }

    fn image_index(&self, id: TaskImageId) -> Result<u32> {
        if id.graph != self.id || id.index as usize >= self.images.len() {
            return Err(TaskGraphError::InvalidTaskResource);
        }

        Ok(id.index)
    }

    fn declare_buffer_access(
        &mut self,
        node_index: NodeIndex,
        id: TaskBufferId,
        access_type: AccessType,
    ) -> Result {
        let index = self.buffer_index(id)?;

        if !access_type.is_valid_buffer_access_type() {
            return Err(TaskGraphError::InvalidAccessType);
        }

        let node = &mut self.nodes[node_index as usize];

        if let Some((_, access)) = node
            .buffer_accesses
            .iter_mut()
            .find(|(other, _)| *other == index)
        {
            access.stage_mask |= access_type.stage_mask();
            access.access_mask |= access_type.access_mask();
        } else {
            node.buffer_accesses.push((
                index,
                ResourceAccess {
                    stage_mask: access_type.stage_mask(),
                    access_mask: access_type.access_mask(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                },
            ));
        }

        Ok(())
    }

    fn declare_image_access(
        &mut self,
        node_index: NodeIndex,
        id: TaskImageId,
        slice: ImageSlice,
        access_type: AccessType,
        layout_type: ImageLayoutType,
    ) -> Result {
        let index = self.image_index(id)?;

        if !access_type.is_valid_image_access_type() {
            return Err(TaskGraphError::InvalidAccessType);
        }

        if slice.is_empty() || !self.images[index as usize].whole_slice().contains(&slice) {
            return Err(TaskGraphError::InvalidSlice);
        }

        let image_layout = access_type.image_layout(layout_type);
        let node = &mut self.nodes[node_index as usize];

        if let Some((_, _, access)) = node
            .image_accesses
            .iter_mut()
            .find(|(other, other_slice, access)| {
                *other == index && *other_slice == slice && access.image_layout == image_layout
            })
        {
            access.stage_mask |= access_type.stage_mask();
            access.access_mask |= access_type.access_mask();
        } else {
            node.image_accesses.push((
                index,
                slice,
                ResourceAccess {
                    stage_mask: access_type.stage_mask(),
                    access_mask: access_type.access_mask(),
                    image_layout,
                },
            ));
        }

        Ok(())
    }

    /// Returns the number of task nodes in the graph.
    #[inline]
    pub fn task_node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the task node with the given ID.
    pub fn task_node(&self, id: NodeId) -> Result<&TaskNode> {
        if id.graph != self.id {
            return Err(TaskGraphError::InvalidTaskResource);
        }

        self.nodes
            .get(id.index as usize)
            .ok_or(TaskGraphError::InvalidTaskResource)
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("use_split_barriers", &self.use_split_barriers)
            .field("nodes", &self.nodes)
            .field("present", &self.present)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new [`TaskGraph`].
#[derive(Clone, Debug)]
pub struct TaskGraphCreateInfo {
    pub name: String,

    /// Whether to synchronize a producer and a consumer that are more than one task apart with a
    /// split barrier, signaled after the producer and waited on before the consumer.
    ///
    /// The default value is `false`, which means full pipeline barriers are used everywhere.
    pub use_split_barriers: bool,

    /// The swapchain that swapchain task images are bound to and that [`add_present`]
    /// presents.
    ///
    /// The default value is `None`.
    ///
    /// [`add_present`]: TaskGraph::add_present
    pub swapchain: Option<Arc<Swapchain>>,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for TaskGraphCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraphCreateInfo {
    /// Returns a default `TaskGraphCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        TaskGraphCreateInfo {
            name: String::new(),
            use_split_barriers: false,
            swapchain: None,
            _ne: crate::NE,
        }
    }
}

/// The ID type used to refer to a buffer within a [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskBufferId {
    pub(crate) graph: u64,
    pub(crate) index: u32,
}

/// The ID type used to refer to an image within a [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskImageId {
    pub(crate) graph: u64,
    pub(crate) index: u32,
}

/// The ID type used to refer to a node within a [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    graph: u64,
    index: NodeIndex,
}

/// A node within a [`TaskGraph`] that represents a [`Task`] to be executed along with its resource
/// accesses.
pub struct TaskNode {
    name: String,
    task: Box<dyn Task>,
    buffer_accesses: SmallVec<[(u32, ResourceAccess); 4]>,
    image_accesses: SmallVec<[(u32, ImageSlice, ResourceAccess); 4]>,
    rendering: Option<RenderingDesc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResourceAccess {
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    pub(crate) access_mask: vk::AccessFlags2,
    pub(crate) image_layout: vk::ImageLayout,
}

impl ResourceAccess {
    fn is_write(&self) -> bool {
        contains_writes(self.access_mask)
    }
}

impl TaskNode {
    /// Returns the name the task node was created with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a reference to the task the task node was created with.
    #[inline]
    pub fn task(&self) -> &dyn Task {
        &*self.task
    }

    /// Returns `true` if the task node is recorded inside a rendering scope.
    #[inline]
    pub fn is_render_task(&self) -> bool {
        self.rendering.is_some()
    }

    pub(crate) fn accesses_buffer(&self, index: u32) -> bool {
        self.buffer_accesses.iter().any(|(other, _)| *other == index)
    }

    /// Returns the first declared access of the image.
    pub(crate) fn image_access(&self, index: u32) -> Option<(ImageSlice, &ResourceAccess)> {
        self.image_accesses
            .iter()
            .find(|(other, _, _)| *other == index)
            .map(|(_, slice, access)| (*slice, access))
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("buffer_accesses", &self.buffer_accesses)
            .field("image_accesses", &self.image_accesses)
            .field("rendering", &self.rendering)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
struct RenderingDesc {
    render_area_extent: [u32; 2],
    color_attachments: SmallVec<[RenderAttachment; 4]>,
    depth_attachment: Option<RenderAttachment>,
}

#[derive(Clone, Copy, Debug)]
struct RenderAttachment {
    index: u32,
    slice: ImageSlice,
    image_layout: vk::ImageLayout,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    clear_value: ClearValue,
}

impl RenderAttachment {
    fn new(
        index: u32,
        slice: ImageSlice,
        image_layout: vk::ImageLayout,
        attachment: &AttachmentInfo,
    ) -> Self {
        RenderAttachment {
            index,
            slice,
            image_layout,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            clear_value: attachment.clear_value,
        }
    }
}

/// A builder used to add resource accesses to a [`TaskNode`].
pub struct TaskNodeBuilder<'a> {
    graph: &'a mut TaskGraph,
    node_index: NodeIndex,
}

impl TaskNodeBuilder<'_> {
    /// Adds a buffer access to this task node. Accesses of the same buffer are merged.
    pub fn buffer_access(
        &mut self,
        id: TaskBufferId,
        access_type: AccessType,
    ) -> Result<&mut Self> {
        self.graph
            .declare_buffer_access(self.node_index, id, access_type)?;

        Ok(self)
    }

    /// Adds an access of every subresource of an image to this task node.
    pub fn image_access(
        &mut self,
        id: TaskImageId,
        access_type: AccessType,
        layout_type: ImageLayoutType,
    ) -> Result<&mut Self> {
        let index = self.graph.image_index(id)?;
        let slice = self.graph.images[index as usize].whole_slice();

        self.image_slice_access(id, slice, access_type, layout_type)
    }

    /// Adds an access of a slice of an image to this task node.
    ///
    /// Accesses of the same slice in the same layout are merged. Overlapping slices accessed in
    /// different layouts fail to compile.
    pub fn image_slice_access(
        &mut self,
        id: TaskImageId,
        slice: ImageSlice,
        access_type: AccessType,
        layout_type: ImageLayoutType,
    ) -> Result<&mut Self> {
        self.graph
            .declare_image_access(self.node_index, id, slice, access_type, layout_type)?;

        Ok(self)
    }

    /// Finishes building the task node and returns the ID of the built node.
    #[inline]
    pub fn build(&mut self) -> NodeId {
        NodeId {
            graph: self.graph.id,
            index: self.node_index,
        }
    }
}

/// Parameters to add a render task with [`TaskGraph::add_render_task`].
#[derive(Clone, Debug)]
pub struct RenderTaskInfo<'a> {
    /// The color attachments to render to.
    ///
    /// The default value is empty.
    pub color_attachments: &'a [(TaskImageId, AttachmentInfo)],

    /// The depth/stencil attachment to render to.
    ///
    /// The default value is `None`.
    pub depth_attachment: Option<(TaskImageId, AttachmentInfo)>,

    /// The extent of the render area, in pixels.
    ///
    /// The default value is `[0; 2]`, which means the extent of the first attachment.
    pub render_area_extent: [u32; 2],

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for RenderTaskInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RenderTaskInfo<'_> {
    /// Returns a default `RenderTaskInfo`.
    #[inline]
    pub const fn new() -> Self {
        RenderTaskInfo {
            color_attachments: &[],
            depth_attachment: None,
            render_area_extent: [0; 2],
            _ne: crate::NE,
        }
    }
}

/// Parameters describing an attachment of a render task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttachmentInfo {
    /// The slice of the task image to render to.
    ///
    /// The default value is `None`, which means the whole image.
    pub slice: Option<ImageSlice>,

    /// The layout type the attachment is accessed in.
    ///
    /// The default value is [`ImageLayoutType::Optimal`].
    pub layout_type: ImageLayoutType,

    /// The default value is [`vk::AttachmentLoadOp::DONT_CARE`].
    pub load_op: vk::AttachmentLoadOp,

    /// The default value is [`vk::AttachmentStoreOp::STORE`].
    pub store_op: vk::AttachmentStoreOp,

    /// The value to clear the attachment to if `load_op` is `CLEAR`.
    ///
    /// The default value is `ClearValue::Color(ClearColorValue::Float([0.0; 4]))`.
    pub clear_value: ClearValue,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for AttachmentInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentInfo {
    /// Returns a default `AttachmentInfo`.
    #[inline]
    pub const fn new() -> Self {
        AttachmentInfo {
            slice: None,
            layout_type: ImageLayoutType::Optimal,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: ClearValue::Color(ClearColorValue::Float([0.0; 4])),
            _ne: crate::NE,
        }
    }
}

/// The state a resource is left in by the accesses of an execution, which the first accesses of
/// the next execution synchronize against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AccessState {
    /// The scope that the next access has to wait on.
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    pub(crate) access_mask: vk::AccessFlags2,
    /// If the accesses since the last write only read, the scope the write is visible to.
    pub(crate) visible_stages: vk::PipelineStageFlags2,
    pub(crate) visible_access: vk::AccessFlags2,
    pub(crate) image_layout: vk::ImageLayout,
}

/// A buffer binding that outlives the executions of task graphs.
///
/// The same task buffer can be used by several task graphs. The access history is kept with each
/// bound buffer, so it carries the synchronization from one execution to the next, whichever task
/// buffer the buffer is bound to. Cloning a `TaskBuffer` returns another handle to the same task
/// buffer.
#[derive(Clone)]
pub struct TaskBuffer {
    inner: Arc<TaskBufferInner>,
}

struct TaskBufferInner {
    name: String,
    state: Lock<TaskBufferState>,
}

pub(crate) struct TaskBufferState {
    pub(crate) buffers: SmallVec<[BufferId; 1]>,
}

impl TaskBuffer {
    pub fn new(create_info: &TaskBufferCreateInfo<'_>) -> Self {
        TaskBuffer {
            inner: Arc::new(TaskBufferInner {
                name: create_info.name.clone(),
                state: Lock::new(TaskBufferState {
                    buffers: create_info.buffers.iter().copied().collect(),
                }),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the buffers currently bound to the task buffer.
    pub fn buffers(&self) -> Vec<BufferId> {
        self.inner.state.lock().buffers.to_vec()
    }

    /// Binds `buffers` to the task buffer, replacing the previous binding. Executions that start
    /// after this use the new buffers, synchronized against their own access history.
    pub fn set_buffers(&self, buffers: &[BufferId]) {
        self.inner.state.lock().buffers = buffers.iter().copied().collect();
    }

    pub(crate) fn state(&self) -> &Lock<TaskBufferState> {
        &self.inner.state
    }
}

impl fmt::Debug for TaskBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuffer")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new [`TaskBuffer`].
#[derive(Clone, Debug)]
pub struct TaskBufferCreateInfo<'a> {
    /// The buffers initially bound to the task buffer.
    ///
    /// The default value is empty.
    pub buffers: &'a [BufferId],

    pub name: String,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for TaskBufferCreateInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBufferCreateInfo<'_> {
    /// Returns a default `TaskBufferCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        TaskBufferCreateInfo {
            buffers: &[],
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// An image binding that outlives the executions of task graphs.
///
/// The access history is kept with each bound image, per mip level and array layer. An image
/// that no execution used yet starts in the `UNDEFINED` layout. A swapchain task image is bound
/// to the current image of the graph's swapchain at every execution, and its contents are
/// considered undefined at the start of the execution.
#[derive(Clone)]
pub struct TaskImage {
    inner: Arc<TaskImageInner>,
}

struct TaskImageInner {
    name: String,
    mip_levels: u32,
    array_layers: u32,
    swapchain_image: bool,
    state: Lock<TaskImageState>,
}

pub(crate) struct TaskImageState {
    pub(crate) images: SmallVec<[ImageId; 1]>,
}

impl TaskImage {
    /// # Panics
    ///
    /// - Panics if `create_info.mip_levels` or `create_info.array_layers` is zero.
    pub fn new(create_info: &TaskImageCreateInfo<'_>) -> Self {
        let &TaskImageCreateInfo {
            images,
            mip_levels,
            array_layers,
            swapchain_image,
            ref name,
            _ne: _,
        } = create_info;

        assert_ne!(mip_levels, 0);
        assert_ne!(array_layers, 0);

        TaskImage {
            inner: Arc::new(TaskImageInner {
                name: name.clone(),
                mip_levels,
                array_layers,
                swapchain_image,
                state: Lock::new(TaskImageState {
                    images: images.iter().copied().collect(),
                }),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.inner.mip_levels
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.inner.array_layers
    }

    #[inline]
    pub fn is_swapchain_image(&self) -> bool {
        self.inner.swapchain_image
    }

    /// Returns the images currently bound to the task image.
    pub fn images(&self) -> Vec<ImageId> {
        self.inner.state.lock().images.to_vec()
    }

    /// Binds `images` to the task image, replacing the previous binding. The images must have at
    /// least as many mip levels and array layers as the task image.
    ///
    /// Executions that start after this use the new images, synchronized against their own
    /// access history.
    pub fn set_images(&self, images: &[ImageId]) {
        self.inner.state.lock().images = images.iter().copied().collect();
    }

    pub(crate) fn state(&self) -> &Lock<TaskImageState> {
        &self.inner.state
    }
}

impl fmt::Debug for TaskImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskImage")
            .field("name", &self.inner.name)
            .field("mip_levels", &self.inner.mip_levels)
            .field("array_layers", &self.inner.array_layers)
            .field("swapchain_image", &self.inner.swapchain_image)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new [`TaskImage`].
#[derive(Clone, Debug)]
pub struct TaskImageCreateInfo<'a> {
    /// The images initially bound to the task image.
    ///
    /// The default value is empty.
    pub images: &'a [ImageId],

    /// The number of mip levels that tasks can access.
    ///
    /// The default value is `1`.
    pub mip_levels: u32,

    /// The number of array layers that tasks can access.
    ///
    /// The default value is `1`.
    pub array_layers: u32,

    /// Whether the task image stands for the current image of the graph's swapchain.
    ///
    /// The default value is `false`.
    pub swapchain_image: bool,

    pub name: String,

    pub _ne: crate::NonExhaustive<'a>,
}

impl Default for TaskImageCreateInfo<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TaskImageCreateInfo<'_> {
    /// Returns a default `TaskImageCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        TaskImageCreateInfo {
            images: &[],
            mip_levels: 1,
            array_layers: 1,
            swapchain_image: false,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// A [`TaskGraph`] that has been compiled into an executable form.
pub struct ExecutableTaskGraph {
    graph: TaskGraph,
    barriers: Vec<BarrierRecord>,
    steps: Vec<Step>,
    events: Vec<vk::Event>,
    final_buffer_states: Vec<Option<FinalState>>,
    final_image_states: Vec<Vec<Option<FinalState>>>,
}

impl ExecutableTaskGraph {
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.graph.device
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.graph.name
    }

    /// Returns the task node with the given ID.
    #[inline]
    pub fn task_node(&self, id: NodeId) -> Result<&TaskNode> {
        self.graph.task_node(id)
    }

    /// Returns the number of barriers in the schedule, before they are expanded over the bound
    /// resources.
    #[inline]
    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    /// Returns the number of events that the split barriers use, one per pair of tasks.
    #[inline]
    pub fn split_barrier_count(&self) -> usize {
        self.events.len()
    }
}

impl fmt::Debug for ExecutableTaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableTaskGraph")
            .field("graph", &self.graph)
            .field("barriers", &self.barriers)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutableTaskGraph {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            self.graph.device.zombify_events(mem::take(&mut self.events));
        }
    }
}

type Result<T = (), E = TaskGraphError> = ::std::result::Result<T, E>;

/// Error that can happen when building a [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskGraphError {
    /// The task resource ID belongs to a different task graph or doesn't exist.
    InvalidTaskResource,

    /// The access type can't be used with the kind of resource.
    InvalidAccessType,

    /// The slice is empty or lies outside the task image.
    InvalidSlice,

    /// A present was requested from a graph without a swapchain.
    PresentWithoutSwapchain,

    /// A present was already requested.
    DuplicatePresent,
}

impl fmt::Display for TaskGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidTaskResource => "the task resource doesn't belong to the task graph",
            Self::InvalidAccessType => {
                "the access type is incompatible with the kind of task resource"
            }
            Self::InvalidSlice => "the slice is not within the subresources of the task image",
            Self::PresentWithoutSwapchain => "the task graph was created without a swapchain",
            Self::DuplicatePresent => "a present was already added to the task graph",
        };

        f.write_str(msg)
    }
}

impl Error for TaskGraphError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::HeadlessBackend,
        device::DeviceCreateInfo,
        swapchain::SwapchainCreateInfo,
    };
    use std::marker::PhantomData;

    fn device() -> Arc<Device> {
        Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap()
    }

    #[test]
    fn foreign_resources_are_rejected() {
        let device = device();
        let mut graph1 = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let mut graph2 = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = graph1.create_task_buffer(&BufferCreateInfo {
            size: 4,
            ..Default::default()
        });

        let result = graph2
            .create_task_node("foreign", PhantomData)
            .buffer_access(buffer, AccessType::CopyTransferWrite)
            .map(|_| ());
        assert_eq!(result, Err(TaskGraphError::InvalidTaskResource));

        let result = graph1
            .create_task_node("invalid access", PhantomData)
            .buffer_access(buffer, AccessType::Present)
            .map(|_| ());
        assert_eq!(result, Err(TaskGraphError::InvalidAccessType));
    }

    #[test]
    fn slices_must_be_within_the_image() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let image = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [4, 4, 1],
            mip_levels: 2,
            usage: vk::ImageUsageFlags::SAMPLED,
            ..Default::default()
        });
        let mut node = graph.create_task_node("sample", PhantomData);

        let result = node
            .image_slice_access(
                image,
                ImageSlice {
                    base_mip_level: 1,
                    ..ImageSlice::new(2, 1)
                },
                AccessType::FragmentShaderSampledRead,
                ImageLayoutType::Optimal,
            )
            .map(|_| ());
        assert_eq!(result, Err(TaskGraphError::InvalidSlice));

        node.image_slice_access(
            image,
            ImageSlice {
                base_mip_level: 1,
                ..ImageSlice::new(1, 1)
            },
            AccessType::FragmentShaderSampledRead,
            ImageLayoutType::Optimal,
        )
        .unwrap();
    }

    #[test]
    fn accesses_are_merged() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = graph.create_task_buffer(&BufferCreateInfo {
            size: 4,
            ..Default::default()
        });
        let node = graph
            .create_task_node("copy", PhantomData)
            .buffer_access(buffer, AccessType::CopyTransferRead)
            .unwrap()
            .buffer_access(buffer, AccessType::CopyTransferWrite)
            .unwrap()
            .build();

        let node = graph.task_node(node).unwrap();
        assert_eq!(node.name(), "copy");
        assert_eq!(node.buffer_accesses.len(), 1);
        assert_eq!(
            node.buffer_accesses[0].1.access_mask,
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE,
        );
    }

    #[test]
    fn persistent_resources_are_used_once() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let buffer = TaskBuffer::new(&TaskBufferCreateInfo {
            name: "persistent".into(),
            ..Default::default()
        });

        let id1 = graph.use_persistent_buffer(&buffer);
        let id2 = graph.use_persistent_buffer(&buffer.clone());
        assert_eq!(id1, id2);
        assert_eq!(graph.buffers.len(), 1);
    }

    #[test]
    fn present_requires_a_swapchain() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        assert_eq!(
            graph.add_present(),
            Err(TaskGraphError::PresentWithoutSwapchain),
        );

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
        graph.add_present().unwrap();
        assert_eq!(graph.add_present(), Err(TaskGraphError::DuplicatePresent));
    }

    #[test]
    fn render_task_declares_attachments() {
        let device = device();
        let mut graph = TaskGraph::new(&device, &TaskGraphCreateInfo::new());
        let color = graph.create_task_image(&ImageCreateInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [4, 4, 1],
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        });
        let node = graph
            .add_render_task(
                "draw",
                &RenderTaskInfo {
                    color_attachments: &[(
                        color,
                        AttachmentInfo {
                            load_op: vk::AttachmentLoadOp::LOAD,
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                },
                |_| Ok(()),
            )
            .unwrap()
            .build();

        let node = graph.task_node(node).unwrap();
        assert!(node.is_render_task());

        let (slice, access) = node.image_access(color.index).unwrap();
        assert_eq!(slice, ImageSlice::new(1, 1));
        assert_eq!(access.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(
            access.access_mask,
            AccessType::ColorAttachmentReadWrite.access_mask(),
        );

        let foreign = TaskImageId {
            graph: 0,
            index: 0,
        };
        let result = graph
            .add_render_task(
                "foreign",
                &RenderTaskInfo {
                    color_attachments: &[(foreign, AttachmentInfo::new())],
                    ..Default::default()
                },
                |_| Ok(()),
            )
            .map(|_| ());
        assert_eq!(result, Err(TaskGraphError::InvalidTaskResource));
        assert_eq!(graph.task_node_count(), 1);
    }
}
