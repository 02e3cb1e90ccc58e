//! Generational GPU resource management with timeline-gated destruction, a ring-buffer staging
//! pool, and a task graph that derives barriers and layout transitions from declared accesses.
//!
//! Everything hangs off a [`Device`], which owns the resource tables, the zombie queues and the
//! device timeline. Resources are referred to exclusively through [`Id`]s; native handles never
//! leave the device and the [`Backend`] it drives.
//!
//! [`Device`]: device::Device
//! [`Backend`]: backend::Backend

use command_buffer::CommandRecorder;
use device::{Device, DeviceError};
use graph::{
    execute::{Bindings, ViewCache},
    TaskBufferId, TaskImageId, TaskNode,
};
use resource::{Buffer, BufferId, Image, ImageId, ImageView, ImageViewId, Sampler};
use ash::vk;
use std::{
    cmp,
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

pub mod backend;
pub mod command_buffer;
pub mod device;
pub mod graph;
mod lock;
pub mod resource;
mod slot_table;
pub mod swapchain;
pub mod timeline;
pub mod transfer;
mod zombie;

/// A task represents a unit of work to be recorded by a [`CommandRecorder`].
///
/// Closures with the signature `Fn(&mut TaskInterface<'_>) -> TaskResult` can be added directly
/// using [`TaskGraph::add_task`]. Implement this trait when the task needs to be a named type.
///
/// [`TaskGraph::add_task`]: graph::TaskGraph::add_task
pub trait Task: Send + Sync + 'static {
    /// Records the task's commands.
    ///
    /// Every resource the recorded commands touch must have been declared as an access of the
    /// task node. The task graph synchronizes declared accesses only.
    fn execute(&self, ti: &mut TaskInterface<'_>) -> TaskResult;
}

impl fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// A task that doesn't record anything.
///
/// Useful when all that's wanted is the synchronization of the declared accesses, for example to
/// transition an image into a layout before it leaves the graph.
impl Task for PhantomData<()> {
    fn execute(&self, _ti: &mut TaskInterface<'_>) -> TaskResult {
        Ok(())
    }
}

pub(crate) struct FnTask<F>(pub(crate) F);

impl<F> Task for FnTask<F>
where
    F: Fn(&mut TaskInterface<'_>) -> TaskResult + Send + Sync + 'static,
{
    fn execute(&self, ti: &mut TaskInterface<'_>) -> TaskResult {
        (self.0)(ti)
    }
}

/// What a task sees while it is being recorded.
///
/// This gives access to the command recorder and resolves the graph's task resources to the
/// resources that are bound to them for the current execution.
pub struct TaskInterface<'a> {
    pub(crate) recorder: &'a mut CommandRecorder,
    pub(crate) device: &'a Arc<Device>,
    pub(crate) bindings: &'a Bindings,
    pub(crate) node: &'a TaskNode,
    pub(crate) views: &'a mut ViewCache,
}

impl TaskInterface<'_> {
    /// Returns the command recorder that the task records into.
    #[inline]
    pub fn recorder(&mut self) -> &mut CommandRecorder {
        self.recorder
    }

    /// Returns the device the task graph was created with.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        self.device
    }

    /// Returns the name the task node was created with.
    #[inline]
    pub fn task_name(&self) -> &str {
        self.node.name()
    }

    /// Returns the first buffer bound to `id`.
    pub fn buffer(&self, id: TaskBufferId) -> TaskResult<BufferId> {
        self.buffers(id)?
            .first()
            .copied()
            .ok_or(TaskError::Unbound)
    }

    /// Returns all buffers bound to `id`.
    pub fn buffers(&self, id: TaskBufferId) -> TaskResult<&[BufferId]> {
        self.bindings.check_graph(id.graph)?;

        if !self.node.accesses_buffer(id.index) {
            return Err(TaskError::UndeclaredAccess);
        }

        Ok(self.bindings.buffers(id.index))
    }

    /// Returns the first image bound to `id`.
    pub fn image(&self, id: TaskImageId) -> TaskResult<ImageId> {
        self.images(id)?.first().copied().ok_or(TaskError::Unbound)
    }

    /// Returns all images bound to `id`.
    pub fn images(&self, id: TaskImageId) -> TaskResult<&[ImageId]> {
        self.bindings.check_graph(id.graph)?;

        if self.node.image_access(id.index).is_none() {
            return Err(TaskError::UndeclaredAccess);
        }

        Ok(self.bindings.images(id.index))
    }

    /// Returns a view of the first image bound to `id` that covers the slice the task declared.
    ///
    /// When the declared slice covers the whole image this is the image's default view;
    /// otherwise a view is created for this execution and destroyed once the recorded commands
    /// complete.
    pub fn image_view(&mut self, id: TaskImageId) -> TaskResult<ImageViewId> {
        let image = self.image(id)?;
        let (slice, _) = self
            .node
            .image_access(id.index)
            .ok_or(TaskError::UndeclaredAccess)?;

        self.views.get_or_create(self.device, image, slice)
    }

    /// Returns the layout the image bound to `id` is in while the task executes.
    pub fn image_layout(&self, id: TaskImageId) -> TaskResult<vk::ImageLayout> {
        self.bindings.check_graph(id.graph)?;

        self.node
            .image_access(id.index)
            .map(|(_, access)| access.image_layout)
            .ok_or(TaskError::UndeclaredAccess)
    }
}

/// The type of result returned by a task.
pub type TaskResult<T = (), E = TaskError> = ::std::result::Result<T, E>;

/// Error that can happen inside a task.
#[derive(Debug)]
pub enum TaskError {
    /// A resource ID used by the task doesn't refer to a live resource.
    InvalidId(InvalidIdError),

    /// A task resource ID belongs to a different task graph.
    InvalidTaskResource,

    /// The task used a task resource that it didn't declare an access for.
    UndeclaredAccess,

    /// No resource is bound to the task resource.
    Unbound,

    /// Creating a resource or view for the task failed.
    Device(DeviceError),

    /// An error produced by the task itself.
    Custom(Box<dyn Error + Send + Sync>),
}

impl From<InvalidIdError> for TaskError {
    fn from(err: InvalidIdError) -> Self {
        Self::InvalidId(err)
    }
}

impl From<DeviceError> for TaskError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

impl From<backend::BackendError> for TaskError {
    fn from(err: backend::BackendError) -> Self {
        Self::Device(DeviceError::Backend(err))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidId(_) => "invalid resource ID",
            Self::InvalidTaskResource => "the task resource belongs to a different task graph",
            Self::UndeclaredAccess => "the task doesn't declare an access for the task resource",
            Self::Unbound => "no resource is bound to the task resource",
            Self::Device(_) => "a device error occurred",
            Self::Custom(_) => "the task failed",
        };

        f.write_str(msg)
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidId(err) => Some(err),
            Self::Device(err) => Some(err),
            Self::Custom(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Error that can happen when trying to retrieve a resource by [`Id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidIdError {
    object_type: ObjectType,
    index: u32,
    version: u64,
}

impl InvalidIdError {
    pub(crate) fn new<O: Object>(id: Id<O>) -> Self {
        InvalidIdError {
            object_type: O::TYPE,
            index: id.index(),
            version: id.version(),
        }
    }

    /// Returns the type of object the invalid ID was for.
    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
}

impl fmt::Display for InvalidIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let &Self {
            object_type,
            index,
            version,
        } = self;

        write!(
            f,
            "invalid {object_type:?} ID (index {index}, version {version})",
        )
    }
}

impl Error for InvalidIdError {}

/// This ID type is used throughout the crate to refer to resources owned by a [`Device`].
///
/// An ID packs a 20-bit slot index and a 44-bit version. Destroying a resource and collecting
/// it bumps the slot's version, so IDs of destroyed resources never alias newer ones.
///
/// Note that this ID **is not** globally unique. It is unique in the scope of a device.
#[repr(transparent)]
pub struct Id<T> {
    raw: u64,
    marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    /// An ID that's guaranteed to be invalid.
    pub const INVALID: Self = Id::from_raw(0);

    pub(crate) const INDEX_BITS: u32 = 20;

    pub(crate) const INDEX_MASK: u64 = (1 << Self::INDEX_BITS) - 1;

    /// The largest version a slot can have before it's retired.
    pub(crate) const MAX_VERSION: u64 = (1 << (64 - Self::INDEX_BITS)) - 1;

    pub(crate) const fn new(index: u32, version: u64) -> Self {
        debug_assert!(index as u64 <= Self::INDEX_MASK);
        debug_assert!(version <= Self::MAX_VERSION);

        Id::from_raw((version << Self::INDEX_BITS) | index as u64)
    }

    /// Reconstructs an ID from the value returned by [`as_raw`].
    ///
    /// [`as_raw`]: Self::as_raw
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Id {
            raw,
            marker: PhantomData,
        }
    }

    /// Returns the packed representation of the ID, for example to pass it to a shader.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.raw
    }

    /// Returns the slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        (self.raw & Self::INDEX_MASK) as u32
    }

    /// Returns the slot version.
    #[inline]
    pub const fn version(self) -> u64 {
        self.raw >> Self::INDEX_BITS
    }

    /// Returns `true` if this is [`Id::INVALID`].
    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.version() == 0
    }
}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T: Object> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Id")
            .field("type", &T::TYPE)
            .field("index", &self.index())
            .field("version", &self.version())
            .finish()
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

// SAFETY: `Id` is `#[repr(transparent)]` over a `u64`, and the zero value is a valid (invalid)
// ID.
unsafe impl<T: 'static> bytemuck::Zeroable for Id<T> {}

// SAFETY: Same as above, and every bit pattern is a valid `Id`.
unsafe impl<T: 'static> bytemuck::Pod for Id<T> {}

pub trait Object {
    const TYPE: ObjectType;
}

impl Object for Buffer {
    const TYPE: ObjectType = ObjectType::Buffer;
}

impl Object for Image {
    const TYPE: ObjectType = ObjectType::Image;
}

impl Object for ImageView {
    const TYPE: ObjectType = ObjectType::ImageView;
}

impl Object for Sampler {
    const TYPE: ObjectType = ObjectType::Sampler;
}

/// The kinds of objects that live in a device's resource tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Buffer,
    Image,
    ImageView,
    Sampler,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NonExhaustive<'a>(PhantomData<&'a ()>);

impl fmt::Debug for NonExhaustive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("NonExhaustive")
    }
}

const NE: NonExhaustive<'static> = NonExhaustive(PhantomData);
