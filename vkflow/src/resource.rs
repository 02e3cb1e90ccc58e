//! Resource types, their creation parameters, and the types of access the task graph
//! synchronizes.

use crate::{backend::Backend, Id};
use ash::vk;
use std::{fmt, ops::Range, sync::Arc};

/// Marker type for buffer [`Id`]s.
#[derive(Debug)]
pub enum Buffer {}

/// Marker type for image [`Id`]s.
#[derive(Debug)]
pub enum Image {}

/// Marker type for image view [`Id`]s.
#[derive(Debug)]
pub enum ImageView {}

/// Marker type for sampler [`Id`]s.
#[derive(Debug)]
pub enum Sampler {}

pub type BufferId = Id<Buffer>;

pub type ImageId = Id<Image>;

pub type ImageViewId = Id<ImageView>;

pub type SamplerId = Id<Sampler>;

/// Where the memory of a resource lives and how the host can access it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local memory that the host can't access.
    #[default]
    GpuOnly,

    /// Host-visible memory meant to be written sequentially by the host and read once by the
    /// device, such as staging memory.
    HostSequentialWrite,

    /// Host-visible, host-cached memory that the host can read and write in any order.
    HostRandomAccess,
}

impl MemoryLocation {
    /// Returns `true` if resources in this location are mapped on the host.
    #[inline]
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

/// Parameters to create a new buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: vk::DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,

    /// The default value is [`MemoryLocation::GpuOnly`].
    pub memory_location: MemoryLocation,

    /// A name used in logs and as the backend's debug name.
    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BufferCreateInfo {
    /// Returns a default `BufferCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        BufferCreateInfo {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            memory_location: MemoryLocation::GpuOnly,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// Parameters to create a new image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageCreateInfo {
    /// The default value is [`vk::ImageType::TYPE_2D`].
    pub image_type: vk::ImageType,

    /// The default value is [`vk::Format::UNDEFINED`], which must be overridden.
    pub format: vk::Format,

    /// The width, height and depth of the image.
    ///
    /// The default value is `[0, 0, 1]`, which must be overridden.
    pub extent: [u32; 3],

    /// The default value is `1`.
    pub mip_levels: u32,

    /// The default value is `1`.
    pub array_layers: u32,

    /// The default value is [`vk::SampleCountFlags::TYPE_1`].
    pub samples: vk::SampleCountFlags,

    /// The default value is empty, which must be overridden.
    pub usage: vk::ImageUsageFlags,

    /// The default value is [`MemoryLocation::GpuOnly`].
    pub memory_location: MemoryLocation,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCreateInfo {
    /// Returns a default `ImageCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: [0, 0, 1],
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::empty(),
            memory_location: MemoryLocation::GpuOnly,
            name: String::new(),
            _ne: crate::NE,
        }
    }

    /// Returns the slice covering every subresource of the image.
    #[inline]
    pub const fn whole_slice(&self) -> ImageSlice {
        ImageSlice {
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// Returns the aspects of the image's format.
    #[inline]
    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        format_aspect_mask(self.format)
    }

    pub(crate) fn default_view_type(&self) -> vk::ImageViewType {
        match (self.image_type, self.array_layers > 1) {
            (vk::ImageType::TYPE_1D, false) => vk::ImageViewType::TYPE_1D,
            (vk::ImageType::TYPE_1D, true) => vk::ImageViewType::TYPE_1D_ARRAY,
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, false) => vk::ImageViewType::TYPE_2D,
            (_, true) => vk::ImageViewType::TYPE_2D_ARRAY,
        }
    }
}

/// Parameters to create a new image view.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageViewCreateInfo {
    /// The image to create a view of.
    ///
    /// The default value is [`Id::INVALID`], which must be overridden.
    pub image: ImageId,

    /// The default value is [`vk::ImageViewType::TYPE_2D`].
    pub view_type: vk::ImageViewType,

    /// The format of the view. [`vk::Format::UNDEFINED`] means the image's format.
    ///
    /// The default value is [`vk::Format::UNDEFINED`].
    pub format: vk::Format,

    /// The subresources of the image that the view covers.
    ///
    /// The default value is a single mip level and array layer.
    pub slice: ImageSlice,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for ImageViewCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ImageViewCreateInfo {
    /// Returns a default `ImageViewCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        ImageViewCreateInfo {
            image: Id::INVALID,
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            slice: ImageSlice {
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// Parameters to create a new sampler.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerCreateInfo {
    /// The default value is [`vk::Filter::NEAREST`].
    pub mag_filter: vk::Filter,

    /// The default value is [`vk::Filter::NEAREST`].
    pub min_filter: vk::Filter,

    /// The default value is [`vk::SamplerMipmapMode::NEAREST`].
    pub mipmap_mode: vk::SamplerMipmapMode,

    /// The addressing modes for the U, V and W coordinates.
    ///
    /// The default value is [`vk::SamplerAddressMode::CLAMP_TO_EDGE`] for all three.
    pub address_mode: [vk::SamplerAddressMode; 3],

    /// Enables anisotropic filtering with the given maximum.
    ///
    /// The default value is `None`.
    pub max_anisotropy: Option<f32>,

    /// The default value is `0.0`.
    pub min_lod: f32,

    /// The default value is [`vk::LOD_CLAMP_NONE`].
    pub max_lod: f32,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for SamplerCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerCreateInfo {
    /// Returns a default `SamplerCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        SamplerCreateInfo {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 3],
            max_anisotropy: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// Parameters to allocate a [`MemoryBlock`].
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryBlockCreateInfo {
    /// The size of the allocation in bytes.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: vk::DeviceSize,

    /// The default value is [`MemoryLocation::GpuOnly`].
    pub memory_location: MemoryLocation,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for MemoryBlockCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockCreateInfo {
    /// Returns a default `MemoryBlockCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        MemoryBlockCreateInfo {
            size: 0,
            memory_location: MemoryLocation::GpuOnly,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// A block of device memory that buffers and images can be bound into.
///
/// The memory is freed once the last clone of the block is dropped. Resources bound into the
/// block keep it alive until they are destroyed and their destruction is collected.
#[derive(Clone)]
pub struct MemoryBlock {
    inner: Arc<MemoryBlockInner>,
}

struct MemoryBlockInner {
    backend: Arc<dyn Backend>,
    handle: vk::DeviceMemory,
    create_info: MemoryBlockCreateInfo,
}

impl MemoryBlock {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        handle: vk::DeviceMemory,
        create_info: MemoryBlockCreateInfo,
    ) -> Self {
        MemoryBlock {
            inner: Arc::new(MemoryBlockInner {
                backend,
                handle,
                create_info,
            }),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::DeviceMemory {
        self.inner.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.inner.create_info.size
    }

    #[inline]
    pub fn memory_location(&self) -> MemoryLocation {
        self.inner.create_info.memory_location
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.create_info.name
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("handle", &self.inner.handle)
            .field("create_info", &self.inner.create_info)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryBlockInner {
    fn drop(&mut self) {
        log::debug!("freeing memory block {:?}", self.create_info.name);

        // SAFETY: Every resource bound into the block holds a clone of it until the resource's
        // destruction has been collected, so the memory is no longer in use.
        unsafe { self.backend.free_memory(self.handle) };
    }
}

/// A range of mip levels and array layers of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageSlice {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageSlice {
    /// Returns the slice covering `level_count` mip levels and `layer_count` array layers,
    /// starting at the first of each.
    #[inline]
    pub const fn new(level_count: u32, layer_count: u32) -> Self {
        ImageSlice {
            base_mip_level: 0,
            level_count,
            base_array_layer: 0,
            layer_count,
        }
    }

    #[inline]
    pub const fn mip_levels(&self) -> Range<u32> {
        self.base_mip_level..self.base_mip_level + self.level_count
    }

    #[inline]
    pub const fn array_layers(&self) -> Range<u32> {
        self.base_array_layer..self.base_array_layer + self.layer_count
    }

    /// Returns `true` if the slice covers no subresource.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.level_count == 0 || self.layer_count == 0
    }

    /// Returns `true` if every subresource of `other` is also in `self`.
    #[inline]
    pub fn contains(&self, other: &ImageSlice) -> bool {
        let (a_mips, b_mips) = (self.mip_levels(), other.mip_levels());
        let (a_layers, b_layers) = (self.array_layers(), other.array_layers());

        a_mips.start <= b_mips.start
            && b_mips.end <= a_mips.end
            && a_layers.start <= b_layers.start
            && b_layers.end <= a_layers.end
    }

    /// Returns `true` if `self` and `other` have at least one subresource in common.
    #[inline]
    pub fn intersects(&self, other: &ImageSlice) -> bool {
        let (a_mips, b_mips) = (self.mip_levels(), other.mip_levels());
        let (a_layers, b_layers) = (self.array_layers(), other.array_layers());

        a_mips.start < b_mips.end
            && b_mips.start < a_mips.end
            && a_layers.start < b_layers.end
            && b_layers.start < a_layers.end
    }

    /// Converts the slice to a native subresource range with the given aspects.
    #[inline]
    pub fn to_vk(self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip_level,
            level_count: self.level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }
}

/// Returns the aspects that an image of the given format has.
pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

macro_rules! access_types {
    (
        $(
            $(#[$meta:meta])*
            $name:ident {
                stage_mask: $($stage_flag:ident)|+,
                access_mask: $($access_flag:ident)|+,
                image_layout: $image_layout:ident,
                valid_for: $($valid_for:ident)|+,
            }
        )*
    ) => {
        /// Specifies which type of access is performed on a resource.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum AccessType {
            $(
                $(#[$meta])*
                $name,
            )*
        }

        impl AccessType {
            /// Returns the stage mask of this type of access.
            #[inline]
            #[must_use]
            pub const fn stage_mask(self) -> vk::PipelineStageFlags2 {
                match self {
                    $(
                        Self::$name => vk::PipelineStageFlags2::from_raw(
                            0 $(| vk::PipelineStageFlags2::$stage_flag.as_raw())+
                        ),
                    )*
                }
            }

            /// Returns the access mask of this type of access.
            #[inline]
            #[must_use]
            pub const fn access_mask(self) -> vk::AccessFlags2 {
                match self {
                    $(
                        Self::$name => vk::AccessFlags2::from_raw(
                            0 $(| vk::AccessFlags2::$access_flag.as_raw())+
                        ),
                    )*
                }
            }

            /// Returns the image layout for this type of access.
            #[inline]
            #[must_use]
            pub const fn image_layout(self, layout_type: ImageLayoutType) -> vk::ImageLayout {
                if layout_type.is_general() && !matches!(self, Self::Present) {
                    return vk::ImageLayout::GENERAL;
                }

                match self {
                    $(
                        Self::$name => vk::ImageLayout::$image_layout,
                    )*
                }
            }

            const fn valid_for(self) -> u8 {
                match self {
                    $(
                        Self::$name => $($valid_for)|+,
                    )*
                }
            }
        }
    };
}

const BUFFER: u8 = 1 << 0;
const IMAGE: u8 = 1 << 1;

access_types! {
    IndirectCommandRead {
        stage_mask: DRAW_INDIRECT,
        access_mask: INDIRECT_COMMAND_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    IndexRead {
        stage_mask: INDEX_INPUT,
        access_mask: INDEX_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    VertexAttributeRead {
        stage_mask: VERTEX_ATTRIBUTE_INPUT,
        access_mask: VERTEX_ATTRIBUTE_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    VertexShaderUniformRead {
        stage_mask: VERTEX_SHADER,
        access_mask: UNIFORM_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    VertexShaderSampledRead {
        stage_mask: VERTEX_SHADER,
        access_mask: SHADER_SAMPLED_READ,
        image_layout: SHADER_READ_ONLY_OPTIMAL,
        valid_for: BUFFER | IMAGE,
    }

    VertexShaderStorageRead {
        stage_mask: VERTEX_SHADER,
        access_mask: SHADER_STORAGE_READ,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    VertexShaderStorageWrite {
        stage_mask: VERTEX_SHADER,
        access_mask: SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    VertexShaderStorageReadWrite {
        stage_mask: VERTEX_SHADER,
        access_mask: SHADER_STORAGE_READ | SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    FragmentShaderUniformRead {
        stage_mask: FRAGMENT_SHADER,
        access_mask: UNIFORM_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    FragmentShaderSampledRead {
        stage_mask: FRAGMENT_SHADER,
        access_mask: SHADER_SAMPLED_READ,
        image_layout: SHADER_READ_ONLY_OPTIMAL,
        valid_for: BUFFER | IMAGE,
    }

    FragmentShaderStorageRead {
        stage_mask: FRAGMENT_SHADER,
        access_mask: SHADER_STORAGE_READ,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    FragmentShaderStorageWrite {
        stage_mask: FRAGMENT_SHADER,
        access_mask: SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    FragmentShaderStorageReadWrite {
        stage_mask: FRAGMENT_SHADER,
        access_mask: SHADER_STORAGE_READ | SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderUniformRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: UNIFORM_READ,
        image_layout: UNDEFINED,
        valid_for: BUFFER,
    }

    ComputeShaderSampledRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_SAMPLED_READ,
        image_layout: SHADER_READ_ONLY_OPTIMAL,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderStorageRead {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_STORAGE_READ,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderStorageWrite {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    ComputeShaderStorageReadWrite {
        stage_mask: COMPUTE_SHADER,
        access_mask: SHADER_STORAGE_READ | SHADER_STORAGE_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    ColorAttachmentRead {
        stage_mask: COLOR_ATTACHMENT_OUTPUT,
        access_mask: COLOR_ATTACHMENT_READ,
        image_layout: COLOR_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    ColorAttachmentWrite {
        stage_mask: COLOR_ATTACHMENT_OUTPUT,
        access_mask: COLOR_ATTACHMENT_WRITE,
        image_layout: COLOR_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    ColorAttachmentReadWrite {
        stage_mask: COLOR_ATTACHMENT_OUTPUT,
        access_mask: COLOR_ATTACHMENT_READ | COLOR_ATTACHMENT_WRITE,
        image_layout: COLOR_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    DepthStencilAttachmentRead {
        stage_mask: EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS,
        access_mask: DEPTH_STENCIL_ATTACHMENT_READ,
        image_layout: DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        valid_for: IMAGE,
    }

    DepthStencilAttachmentWrite {
        stage_mask: EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS,
        access_mask: DEPTH_STENCIL_ATTACHMENT_WRITE,
        image_layout: DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    DepthStencilAttachmentReadWrite {
        stage_mask: EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS,
        access_mask: DEPTH_STENCIL_ATTACHMENT_READ | DEPTH_STENCIL_ATTACHMENT_WRITE,
        image_layout: DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    CopyTransferRead {
        stage_mask: COPY,
        access_mask: TRANSFER_READ,
        image_layout: TRANSFER_SRC_OPTIMAL,
        valid_for: BUFFER | IMAGE,
    }

    CopyTransferWrite {
        stage_mask: COPY,
        access_mask: TRANSFER_WRITE,
        image_layout: TRANSFER_DST_OPTIMAL,
        valid_for: BUFFER | IMAGE,
    }

    BlitTransferRead {
        stage_mask: BLIT,
        access_mask: TRANSFER_READ,
        image_layout: TRANSFER_SRC_OPTIMAL,
        valid_for: IMAGE,
    }

    BlitTransferWrite {
        stage_mask: BLIT,
        access_mask: TRANSFER_WRITE,
        image_layout: TRANSFER_DST_OPTIMAL,
        valid_for: IMAGE,
    }

    ClearTransferWrite {
        stage_mask: CLEAR,
        access_mask: TRANSFER_WRITE,
        image_layout: TRANSFER_DST_OPTIMAL,
        valid_for: IMAGE,
    }

    HostRead {
        stage_mask: HOST,
        access_mask: HOST_READ,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    HostWrite {
        stage_mask: HOST,
        access_mask: HOST_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    /// The presentation engine reads the image. Only used for swapchain images, after
    /// [`TaskGraph::add_present`].
    ///
    /// [`TaskGraph::add_present`]: crate::graph::TaskGraph::add_present
    Present {
        stage_mask: NONE,
        access_mask: NONE,
        image_layout: PRESENT_SRC_KHR,
        valid_for: IMAGE,
    }

    /// Only use this for prototyping or debugging.
    General {
        stage_mask: ALL_COMMANDS,
        access_mask: MEMORY_READ | MEMORY_WRITE,
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }
}

impl AccessType {
    pub(crate) const fn is_valid_buffer_access_type(self) -> bool {
        self.valid_for() & BUFFER != 0
    }

    pub(crate) const fn is_valid_image_access_type(self) -> bool {
        self.valid_for() & IMAGE != 0
    }

    /// Returns `true` if this type of access writes to the resource.
    #[inline]
    pub const fn is_write(self) -> bool {
        contains_writes(self.access_mask())
    }
}

const WRITE_ACCESSES: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

/// Returns `true` if `access_mask` contains any write access.
#[inline]
pub(crate) const fn contains_writes(access_mask: vk::AccessFlags2) -> bool {
    access_mask.as_raw() & WRITE_ACCESSES.as_raw() != 0
}

/// Specifies which type of layout an image resource is accessed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ImageLayoutType {
    /// The image is accessed in an optimal layout. This is what you should be using most of the
    /// time.
    ///
    /// The optimal layout depends on the access type. For instance, for color attachment output,
    /// the only valid optimal layout is `COLOR_ATTACHMENT_OPTIMAL`. Some access types don't have
    /// an optimal layout for them, in which case the general layout is used either way.
    #[default]
    Optimal,

    /// The image is accessed in the general layout. This layout may be less efficient to access
    /// on some hardware than an optimal layout, but it can save layout transitions.
    General,
}

impl ImageLayoutType {
    /// Returns `true` if the layout type is `Optimal`.
    #[inline]
    #[must_use]
    pub const fn is_optimal(self) -> bool {
        matches!(self, ImageLayoutType::Optimal)
    }

    /// Returns `true` if the layout type is `General`.
    #[inline]
    #[must_use]
    pub const fn is_general(self) -> bool {
        matches!(self, ImageLayoutType::General)
    }
}
