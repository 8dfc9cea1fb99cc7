// Image, image view and sampler wrappers
//
// Austin Shafer - 2024

use ash::vk;

use crate::cmd::ImageMemoryBarrier;
use crate::memory::DeviceMemory;
use crate::{Result, SquallError};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Creation parameters for an image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl ImageInfo {
    /// The common case: a single-mip 2D texture.
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: format,
            extent: vk::Extent3D {
                width: width,
                height: height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: usage,
        }
    }
}

/// The aspect planes implied by a pixel format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Everything that identifies a view over an image. Identical infos
/// return the identical ImageView object from `Image::get_view`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageViewInfo {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageViewInfo {
    pub fn new_2d(format: vk::Format) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D,
            format: format,
            aspect: aspect_for_format(format),
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
        }
    }

    /// Check the view type is expressible over the given image type.
    pub fn compatible_with(&self, image_type: vk::ImageType) -> bool {
        match self.view_type {
            vk::ImageViewType::TYPE_1D | vk::ImageViewType::TYPE_1D_ARRAY => {
                image_type == vk::ImageType::TYPE_1D
            }
            vk::ImageViewType::TYPE_2D | vk::ImageViewType::TYPE_2D_ARRAY => {
                image_type == vk::ImageType::TYPE_2D
            }
            vk::ImageViewType::CUBE | vk::ImageViewType::CUBE_ARRAY => {
                image_type == vk::ImageType::TYPE_2D
            }
            vk::ImageViewType::TYPE_3D => image_type == vk::ImageType::TYPE_3D,
            _ => false,
        }
    }
}

struct ImageInternal {
    memory: Option<Arc<DeviceMemory>>,
    offset: u64,
    pending_barrier: Option<ImageMemoryBarrier>,
    layout: vk::ImageLayout,
    views: HashMap<ImageViewInfo, Arc<ImageView>>,
}

/// A VkImage with its backing memory and cached views.
pub struct Image {
    i_dev: ash::Device,
    i_image: vk::Image,
    i_info: ImageInfo,
    /// true if the handle is owned elsewhere (swapchain images)
    i_external: bool,
    i_internal: Mutex<ImageInternal>,
}

impl Image {
    pub(crate) fn new(
        dev: ash::Device,
        handle: vk::Image,
        info: ImageInfo,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            i_dev: dev,
            i_image: handle,
            i_info: info,
            i_external: false,
            i_internal: Mutex::new(ImageInternal {
                memory: None,
                offset: 0,
                pending_barrier: None,
                layout: layout,
                views: HashMap::new(),
            }),
        }
    }

    /// Wrap an image owned by someone else (swapchain images). No
    /// memory will ever be bound and the handle is not destroyed on
    /// drop.
    pub(crate) fn new_external(dev: ash::Device, handle: vk::Image, info: ImageInfo) -> Self {
        let mut ret = Self::new(dev, handle, info, vk::ImageLayout::UNDEFINED);
        ret.i_external = true;
        ret
    }

    pub fn vkhandle(&self) -> vk::Image {
        self.i_image
    }

    pub fn info(&self) -> &ImageInfo {
        &self.i_info
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.i_info.extent
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.i_info.format)
    }

    /// True for images owned elsewhere, i.e. swapchain images.
    pub fn is_external(&self) -> bool {
        self.i_external
    }

    /// Bind backing memory at the memory's own offset.
    pub fn bind_memory(&self, mem: Arc<DeviceMemory>) -> bool {
        let offset = mem.offset();
        self.bind_memory_at(mem, offset)
    }

    /// Bind backing memory exactly once, repeat calls are no-ops.
    pub fn bind_memory_at(&self, mem: Arc<DeviceMemory>, offset: u64) -> bool {
        let mut internal = self.i_internal.lock().unwrap();
        if internal.memory.is_some() {
            return true;
        }

        let res = unsafe { self.i_dev.bind_image_memory(self.i_image, mem.mem, offset) };
        if let Err(e) = res {
            log::error!("vkBindImageMemory failed: {:?}", e);
            return false;
        }
        internal.memory = Some(mem);
        internal.offset = offset;
        true
    }

    pub fn memory(&self) -> Option<Arc<DeviceMemory>> {
        self.i_internal.lock().unwrap().memory.clone()
    }

    /// Current layout bookkeeping. This tracks what the runtime has
    /// transitioned the image to, it is advisory between passes.
    pub fn layout(&self) -> vk::ImageLayout {
        self.i_internal.lock().unwrap().layout
    }

    pub fn set_layout(&self, layout: vk::ImageLayout) {
        self.i_internal.lock().unwrap().layout = layout;
    }

    /// Get or create the view described by `info`.
    ///
    /// Views are interned per image: asking for the same info twice
    /// returns the same object.
    pub fn get_view(self: &Arc<Self>, info: &ImageViewInfo) -> Result<Arc<ImageView>> {
        if !info.compatible_with(self.i_info.image_type) {
            return Err(SquallError::INVALID);
        }

        let mut internal = self.i_internal.lock().unwrap();
        if let Some(view) = internal.views.get(info) {
            return Ok(view.clone());
        }

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(self.i_image)
            .view_type(info.view_type)
            .format(info.format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(info.aspect)
                    .base_mip_level(info.base_mip)
                    .level_count(info.mip_count)
                    .base_array_layer(info.base_layer)
                    .layer_count(info.layer_count)
                    .build(),
            )
            .build();

        let handle = unsafe {
            self.i_dev
                .create_image_view(&create_info, None)
                .or(Err(SquallError::INVALID))?
        };

        let view = Arc::new(ImageView {
            v_dev: self.i_dev.clone(),
            v_view: handle,
            v_info: info.clone(),
            v_image: Arc::downgrade(self),
            v_image_handle: self.i_image,
        });
        internal.views.insert(info.clone(), view.clone());
        Ok(view)
    }

    /// Record a queue family release for the next consumer. One slot,
    /// writing over an unconsumed barrier is an upstream bug.
    pub fn set_pending_barrier(&self, barrier: ImageMemoryBarrier) {
        let mut internal = self.i_internal.lock().unwrap();
        debug_assert!(
            internal.pending_barrier.is_none(),
            "pending barrier slot overwritten before being consumed"
        );
        internal.pending_barrier = Some(barrier);
    }

    pub fn take_pending_barrier(&self) -> Option<ImageMemoryBarrier> {
        self.i_internal.lock().unwrap().pending_barrier.take()
    }

    pub fn has_pending_barrier(&self) -> bool {
        self.i_internal.lock().unwrap().pending_barrier.is_some()
    }

    pub fn drop_pending_barrier(&self) {
        self.i_internal.lock().unwrap().pending_barrier = None;
    }

    /// The whole-image subresource range for barriers.
    pub fn full_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::builder()
            .aspect_mask(self.aspect())
            .base_mip_level(0)
            .level_count(self.i_info.mip_levels)
            .base_array_layer(0)
            .layer_count(self.i_info.array_layers)
            .build()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let mut internal = self.i_internal.lock().unwrap();
        internal.views.clear();
        if !self.i_external {
            unsafe {
                self.i_dev.destroy_image(self.i_image, None);
            }
        }
    }
}

/// A view over an image. Owned by the image's view cache and by any
/// descriptor or framebuffer referencing it.
pub struct ImageView {
    v_dev: ash::Device,
    v_view: vk::ImageView,
    v_info: ImageViewInfo,
    v_image: Weak<Image>,
    v_image_handle: vk::Image,
}

impl ImageView {
    pub fn vkhandle(&self) -> vk::ImageView {
        self.v_view
    }

    pub fn info(&self) -> &ImageViewInfo {
        &self.v_info
    }

    pub fn image(&self) -> Option<Arc<Image>> {
        self.v_image.upgrade()
    }

    pub fn image_handle(&self) -> vk::Image {
        self.v_image_handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.v_dev.destroy_image_view(self.v_view, None);
        }
    }
}

/// Sampler parameters, hashable so the device can dedupe compiled
/// samplers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SamplerInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub anisotropy: bool,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            anisotropy: false,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        }
    }
}

/// A compiled sampler.
pub struct Sampler {
    s_dev: ash::Device,
    s_sampler: vk::Sampler,
    s_info: SamplerInfo,
}

impl Sampler {
    pub(crate) fn new(dev: &ash::Device, info: &SamplerInfo) -> Result<Arc<Self>> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode_u)
            .address_mode_v(info.address_mode_v)
            .address_mode_w(info.address_mode_w)
            .anisotropy_enable(info.anisotropy)
            .border_color(info.border_color)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS);

        let handle = unsafe {
            dev.create_sampler(&create_info, None)
                .or(Err(SquallError::INVALID))?
        };
        Ok(Arc::new(Self {
            s_dev: dev.clone(),
            s_sampler: handle,
            s_info: info.clone(),
        }))
    }

    pub fn vkhandle(&self) -> vk::Sampler {
        self.s_sampler
    }

    pub fn info(&self) -> &SamplerInfo {
        &self.s_info
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.s_dev.destroy_sampler(self.s_sampler, None);
        }
    }
}
