// The Squall Vulkan execution runtime
//
// This crate takes a compiled render queue (a DAG of passes and
// attachments) and turns it into correctly synchronized, concurrent
// GPU work: device discovery, memory pooling, per-family command
// scheduling, frame lifecycles, descriptor management and swapchain
// presentation.
//
// Austin Shafer - 2024

mod buffer;
mod cmd;
mod compiler;
mod descriptor;
mod device;
mod font;
mod frame;
mod graph;
mod image;
mod instance;
mod material;
mod memory;
mod mesh;
mod queue;
mod renderpass;
mod sched;
mod swapchain;
mod sync;
mod textureset;
mod transfer;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
mod tests;

pub use crate::buffer::{Buffer, BufferInfo};
pub use crate::cmd::{
    BufferMemoryBarrier, CommandBuffer, CommandPool, ImageMemoryBarrier, QueueFamilyTransfer,
};
pub use crate::compiler::{CompiledQueue, Pipeline, RenderQueueCompiler, ShaderModule};
pub use crate::descriptor::{
    BoundResource, DescriptorBinding, DescriptorPool, DescriptorSetBindings,
};
pub use crate::device::Device;
pub use crate::font::{CharId, FontQueue, GlyphPlacement, GlyphRequest};
pub use crate::frame::{AttachmentHandle, FrameHandle, FrameRequest, PassHandle};
pub use crate::graph::{
    AttachmentBacking, AttachmentData, AttachmentKind, AttachmentPassData, AttachmentRef,
    AttachmentUse, ComputePipelineData, DescriptorBindingData, DescriptorSetLayoutData,
    GraphicPipelineData, PassData, PassKind, PipelineLayoutData, ProgramData, PushConstantRange,
    QueueData, SubpassData, SubpassDependency,
};
pub use crate::image::{Image, ImageInfo, ImageView, ImageViewInfo, Sampler, SamplerInfo};
pub use crate::instance::{
    DeviceFeatures, DisplayOutputInfo, Instance, PhysicalDeviceInfo, QueueFamilyInfo,
    SurfaceBackends,
};
pub use crate::material::{Material, MaterialCompiler, MaterialId, MaterialInputData};
pub use crate::memory::pool::MemoryPool;
pub use crate::memory::{
    AllocationType, AllocationUsage, Allocator, DeviceMemory, MemoryRequirements,
};
pub use crate::mesh::{MeshCompiler, MeshData, MeshEntry, MeshId, MeshSet};
pub use crate::queue::{
    DeviceQueue, DeviceQueueFamily, FrameSync, IdleFlags, QueueOperations, QueueSet, Waiter,
};
pub use crate::renderpass::{PipelineLayout, RenderPass};
pub use crate::sched::{FrameCache, Framebuffer, Loop, LoopEvent, LoopHandle, WorkerPool};
pub use crate::swapchain::{AcquiredImage, Surface, SurfaceOptions, Swapchain};
pub use crate::sync::{DependencyEvent, Fence, FenceState, FenceType, Semaphore};
pub use crate::textureset::{MaterialImageSlot, MaterialLayout, TextureSet, TextureSetLayout};
pub use crate::transfer::{capture_buffer, capture_image, TransferQueue, TransferRequest};

use std::sync::Arc;

extern crate thiserror;
use thiserror::Error;

/// Size of one allocator page. All device memory is requested from the
/// driver in multiples of this.
pub(crate) const PAGE_SIZE: u64 = 8 * 1024 * 1024;
/// Number of size-class buckets in the allocator free lists. Bucket 0
/// is the oversized sink.
pub(crate) const MAX_BUCKET_INDEX: u64 = 20;
/// Pages of each memory type kept around after free before we start
/// handing them back to the driver.
pub(crate) const PRESERVE_PAGES: u64 = 20;
/// Size of each persistent glyph cache buffer.
pub(crate) const FONT_BUFFER_SIZE: u64 = 16 * 1024 * 1024;
/// How long a fence may stay armed before we suspect the driver lost it.
pub(crate) const FENCE_BROKEN_THRESHOLD_US: u64 = 1_000_000;

/// These are the errors that squall will report to applications. Much
/// of this mirrors VkResult, with extra engine-side conditions mixed in.
///
/// Status values that are not really failures (NOT_READY and friends)
/// are still listed here so query style calls can report them, callers
/// are expected to match on them.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SquallError {
    #[error("Operation is not ready")]
    NOT_READY,
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Result set was incomplete")]
    INCOMPLETE,
    #[error("Swapchain can still present but should be recreated")]
    SUBOPTIMAL,
    #[error("Surface has changed and the swapchain must be recreated")]
    OUT_OF_DATE,
    #[error("The logical device was lost")]
    DEVICE_LOST,
    #[error("Out of host memory")]
    OUT_OF_HOST_MEMORY,
    #[error("Out of device memory")]
    OUT_OF_DEVICE_MEMORY,
    #[error("Out of pool memory")]
    OUT_OF_POOL_MEMORY,
    #[error("Too many objects allocated")]
    TOO_MANY_OBJECTS,
    #[error("Allocation failed due to fragmentation")]
    FRAGMENTATION,
    #[error("A requested extension is not present")]
    EXTENSION_NOT_PRESENT,
    #[error("A requested feature is not present")]
    FEATURE_NOT_PRESENT,
    #[error("A requested layer is not present")]
    LAYER_NOT_PRESENT,
    #[error("Format is not supported")]
    FORMAT_NOT_SUPPORTED,
    #[error("No compatible vulkan driver found")]
    INCOMPATIBLE_DRIVER,
    #[error("The presentation surface was lost")]
    SURFACE_LOST,
    #[error("The native window is already in use")]
    NATIVE_WINDOW_IN_USE,
    #[error("Exclusive fullscreen access was lost")]
    FULLSCREEN_LOST,
    #[error("Invalid operation or argument")]
    INVALID,
    #[error("No queue matching the requested operations")]
    NO_QUEUE,
    #[error("Render queue data failed validation")]
    INVALID_QUEUE_DATA,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Presentation request failed")]
    PRESENT_FAILED,
    #[error("The frame was invalidated before completion")]
    FRAME_INVALIDATED,
    #[error("Device memory allocation failed")]
    ALLOCATION_FAILED,
}

impl SquallError {
    /// Classify a raw VkResult.
    ///
    /// Every result code the runtime can observe maps onto one of our
    /// statuses so upper layers never see a raw vulkan error.
    pub fn from_vk(res: ash::vk::Result) -> Option<Self> {
        use ash::vk;
        match res {
            vk::Result::SUCCESS => None,
            vk::Result::NOT_READY => Some(SquallError::NOT_READY),
            vk::Result::TIMEOUT => Some(SquallError::TIMEOUT),
            vk::Result::INCOMPLETE => Some(SquallError::INCOMPLETE),
            vk::Result::SUBOPTIMAL_KHR => Some(SquallError::SUBOPTIMAL),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Some(SquallError::OUT_OF_DATE),
            vk::Result::ERROR_DEVICE_LOST => Some(SquallError::DEVICE_LOST),
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Some(SquallError::OUT_OF_HOST_MEMORY),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Some(SquallError::OUT_OF_DEVICE_MEMORY),
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Some(SquallError::OUT_OF_POOL_MEMORY),
            vk::Result::ERROR_TOO_MANY_OBJECTS => Some(SquallError::TOO_MANY_OBJECTS),
            vk::Result::ERROR_FRAGMENTATION => Some(SquallError::FRAGMENTATION),
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => Some(SquallError::EXTENSION_NOT_PRESENT),
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Some(SquallError::FEATURE_NOT_PRESENT),
            vk::Result::ERROR_LAYER_NOT_PRESENT => Some(SquallError::LAYER_NOT_PRESENT),
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Some(SquallError::FORMAT_NOT_SUPPORTED),
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Some(SquallError::INCOMPATIBLE_DRIVER),
            vk::Result::ERROR_SURFACE_LOST_KHR => Some(SquallError::SURFACE_LOST),
            vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => Some(SquallError::NATIVE_WINDOW_IN_USE),
            vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT => {
                Some(SquallError::FULLSCREEN_LOST)
            }
            _ => Some(SquallError::INVALID),
        }
    }

    /// Is this a control flow status rather than a real failure?
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            SquallError::NOT_READY | SquallError::TIMEOUT | SquallError::INCOMPLETE
        )
    }

    /// Fatal errors stop the Loop entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SquallError::DEVICE_LOST)
    }
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// Generic helper for retaining objects of any type until GPU work
/// referencing them completes.
pub trait Droppable {}
impl<T> Droppable for T {}

/// Callback used during instance creation to test if a queue family on
/// a physical device can present to the platform's windowing system.
pub type PresentSupportCallback =
    dyn Fn(&ash::Instance, ash::vk::PhysicalDevice, u32) -> bool + Send + Sync;

/// Gate callback letting the application veto a physical device.
pub type DeviceSupportCallback = dyn Fn(&PhysicalDeviceInfo) -> bool + Send + Sync;

/// Callback returning extra device extensions the application requires.
pub type DeviceExtensionsCallback = dyn Fn(&PhysicalDeviceInfo) -> Vec<&'static std::ffi::CStr> + Send + Sync;

/// Callback overriding the core feature set enabled on the device.
/// Every requested feature is checked against what the hardware can
/// actually enable before device creation.
pub type DeviceFeaturesCallback =
    dyn Fn(&PhysicalDeviceInfo) -> ash::vk::PhysicalDeviceFeatures + Send + Sync;

/// Parameters for creating the runtime.
///
/// Collects every tunable in one place, in the usual builder
/// arrangement. Everything has a default, the zero-config path gets
/// you the first suitable device with validation off.
pub struct CreateInfo {
    /// Pick a specific physical device, None selects the first suitable.
    pub device_idx: Option<usize>,
    /// Enables the debug utils messenger and validation layer.
    pub enable_validation: bool,
    /// Per-device yes/no gate.
    pub device_support_cb: Option<Arc<DeviceSupportCallback>>,
    /// Extra required device extensions.
    pub device_extensions_cb: Option<Arc<DeviceExtensionsCallback>>,
    /// Core feature chain override.
    pub device_features_cb: Option<Arc<DeviceFeaturesCallback>>,
    /// Presentation support test supplied by the platform layer.
    pub present_support_cb: Option<Arc<PresentSupportCallback>>,
    /// Fence poll interval for the scheduler, in microseconds.
    pub scheduler_interval_us: u64,
    /// Presents tolerated in a non-preferred mode before renegotiation.
    pub max_suboptimal_frames: u32,
    /// Cap on bindless sampled image slots.
    pub max_texture_set_images: u32,
    /// Cap on bindless storage buffer slots.
    pub max_texture_set_buffers: u32,
    /// Export fences as sync fds when the OS supports it.
    pub use_external_fence_sync: bool,
    /// Expand glyph requests to full character groups.
    pub font_preload_groups: bool,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo::default(),
        }
    }
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            device_idx: None,
            enable_validation: false,
            device_support_cb: None,
            device_extensions_cb: None,
            device_features_cb: None,
            present_support_cb: None,
            scheduler_interval_us: 500,
            max_suboptimal_frames: 24,
            max_texture_set_images: 1024,
            max_texture_set_buffers: 1024,
            use_external_fence_sync: false,
            font_preload_groups: false,
        }
    }
}

pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn device_idx(mut self, idx: usize) -> Self {
        self.ci.device_idx = Some(idx);
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.ci.enable_validation = enable;
        self
    }

    pub fn device_support_cb(mut self, cb: Arc<DeviceSupportCallback>) -> Self {
        self.ci.device_support_cb = Some(cb);
        self
    }

    pub fn device_extensions_cb(mut self, cb: Arc<DeviceExtensionsCallback>) -> Self {
        self.ci.device_extensions_cb = Some(cb);
        self
    }

    pub fn device_features_cb(mut self, cb: Arc<DeviceFeaturesCallback>) -> Self {
        self.ci.device_features_cb = Some(cb);
        self
    }

    pub fn present_support_cb(mut self, cb: Arc<PresentSupportCallback>) -> Self {
        self.ci.present_support_cb = Some(cb);
        self
    }

    pub fn scheduler_interval_us(mut self, us: u64) -> Self {
        self.ci.scheduler_interval_us = us;
        self
    }

    pub fn max_suboptimal_frames(mut self, count: u32) -> Self {
        self.ci.max_suboptimal_frames = count;
        self
    }

    pub fn max_texture_set_images(mut self, count: u32) -> Self {
        self.ci.max_texture_set_images = count;
        self
    }

    pub fn max_texture_set_buffers(mut self, count: u32) -> Self {
        self.ci.max_texture_set_buffers = count;
        self
    }

    pub fn use_external_fence_sync(mut self, use_sync: bool) -> Self {
        self.ci.use_external_fence_sync = use_sync;
        self
    }

    pub fn font_preload_groups(mut self, preload: bool) -> Self {
        self.ci.font_preload_groups = preload;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// Monotonic clock helper used for fence timing.
pub(crate) fn current_time_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Round `val` up to a multiple of `align`. `align` must be a power
/// of two for the memory paths that use this, but the helper itself
/// handles any nonzero alignment.
pub(crate) fn align_up(val: u64, align: u64) -> u64 {
    if align <= 1 {
        return val;
    }
    ((val + align - 1) / align) * align
}
