// Bindless texture set
//
// A per-device descriptor layout holding three arrays: samplers,
// sampled images and storage buffers. Materials index into these at
// draw time through push constants instead of binding per-material
// sets. Slots nothing has claimed point at tiny sentinel resources,
// or stay unwritten when the device supports partially bound
// descriptors.
//
// Austin Shafer - 2024

use ash::vk;
use ash::vk::Handle;

use crate::buffer::{Buffer, BufferInfo};
use crate::cmd::{BufferMemoryBarrier, CommandBuffer, ImageMemoryBarrier};
use crate::descriptor::coalesce_ranges;
use crate::image::{Image, ImageInfo, ImageView, ImageViewInfo, Sampler};
use crate::instance::PhysicalDeviceInfo;
use crate::memory::{AllocationUsage, Allocator};
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

/// Fill pattern for the sentinel buffer.
const EMPTY_BUFFER_FILL: u32 = 0xffff_ffff;

/// One image slot of a material set.
#[derive(Clone)]
pub struct MaterialImageSlot {
    pub view: Arc<ImageView>,
    pub sampler_idx: u32,
}

/// The resolved slot tables of a material set, the input to
/// `TextureSet::write`.
#[derive(Clone, Default)]
pub struct MaterialLayout {
    pub images: Vec<Option<MaterialImageSlot>>,
    pub buffers: Vec<Option<Arc<Buffer>>>,
}

/// The per-device bindless layout and its shared resources.
pub struct TextureSetLayout {
    t_dev: ash::Device,
    t_layout: Mutex<vk::DescriptorSetLayout>,
    t_partially_bound: bool,
    t_update_after_bind: bool,
    t_sampler_count: u32,
    t_image_count: u32,
    t_buffer_count: u32,
    /// 1x1 transparent-zero image bound into unclaimed sampled slots
    t_empty_image: Arc<Image>,
    t_empty_view: Arc<ImageView>,
    /// 1x1 solid white image for untextured draws
    t_solid_image: Arc<Image>,
    t_solid_view: Arc<ImageView>,
    /// tiny buffer of 0xffffffff for unclaimed buffer slots
    t_empty_buffer: Arc<Buffer>,
    /// compiled samplers for binding 0, set by the queue compiler
    t_samplers: Mutex<Vec<Arc<Sampler>>>,
    /// recycled sets
    t_sets: Mutex<Vec<Arc<TextureSet>>>,
}

impl TextureSetLayout {
    pub fn new(
        dev: &ash::Device,
        allocator: &Arc<Allocator>,
        pdev_info: &PhysicalDeviceInfo,
        image_cap: u32,
        buffer_cap: u32,
    ) -> Result<Arc<Self>> {
        let limits = &pdev_info.limits;
        let image_count = image_cap.min(limits.max_per_stage_descriptor_sampled_images / 2);
        let buffer_count = buffer_cap.min(limits.max_per_stage_descriptor_storage_buffers / 2);
        let sampler_count = 16u32.min(limits.max_per_stage_descriptor_samplers);

        let partially_bound = pdev_info.features.partially_bound;
        let update_after_bind = pdev_info.features.update_after_bind;

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(sampler_count)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(image_count)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(buffer_count)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];

        let mut flags = vec![vk::DescriptorBindingFlags::empty(); bindings.len()];
        if partially_bound {
            flags[1] |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
            flags[2] |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        if update_after_bind {
            flags[1] |= vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
            flags[2] |= vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        }

        let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(flags.as_slice())
            .build();
        let mut info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .build();
        if update_after_bind {
            info.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        }
        info.p_next = &mut binding_flags as *mut _ as *const std::os::raw::c_void;

        let layout = unsafe {
            dev.create_descriptor_set_layout(&info, None)
                .or(Err(SquallError::INVALID))?
        };

        // sentinel resources: a zero image, a white image and a tiny
        // poison-filled buffer. Contents are written by
        // `record_defaults` once a transfer queue exists.
        let sentinel_usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        let empty_image = allocator
            .spawn_persistent_image(
                AllocationUsage::DeviceLocal,
                &ImageInfo::new_2d(vk::Format::R8G8B8A8_UNORM, 1, 1, sentinel_usage),
                false,
            )
            .ok_or(SquallError::ALLOCATION_FAILED)?;
        let solid_image = allocator
            .spawn_persistent_image(
                AllocationUsage::DeviceLocal,
                &ImageInfo::new_2d(vk::Format::R8G8B8A8_UNORM, 1, 1, sentinel_usage),
                false,
            )
            .ok_or(SquallError::ALLOCATION_FAILED)?;
        let empty_buffer = allocator
            .spawn_persistent_buffer(
                AllocationUsage::DeviceLocal,
                &BufferInfo::new(
                    16,
                    vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                ),
                None,
            )
            .ok_or(SquallError::ALLOCATION_FAILED)?;

        let view_info = ImageViewInfo::new_2d(vk::Format::R8G8B8A8_UNORM);
        let empty_view = empty_image.get_view(&view_info)?;
        let solid_view = solid_image.get_view(&view_info)?;

        Ok(Arc::new(Self {
            t_dev: dev.clone(),
            t_layout: Mutex::new(layout),
            t_partially_bound: partially_bound,
            t_update_after_bind: update_after_bind,
            t_sampler_count: sampler_count,
            t_image_count: image_count,
            t_buffer_count: buffer_count,
            t_empty_image: empty_image,
            t_empty_view: empty_view,
            t_solid_image: solid_image,
            t_solid_view: solid_view,
            t_empty_buffer: empty_buffer,
            t_samplers: Mutex::new(Vec::new()),
            t_sets: Mutex::new(Vec::new()),
        }))
    }

    pub fn vkhandle(&self) -> vk::DescriptorSetLayout {
        *self.t_layout.lock().unwrap()
    }

    pub fn image_count(&self) -> u32 {
        self.t_image_count
    }

    pub fn buffer_count(&self) -> u32 {
        self.t_buffer_count
    }

    pub fn sampler_count(&self) -> u32 {
        self.t_sampler_count
    }

    pub fn is_partially_bound(&self) -> bool {
        self.t_partially_bound
    }

    pub fn empty_image(&self) -> &Arc<Image> {
        &self.t_empty_image
    }

    pub fn solid_image(&self) -> &Arc<Image> {
        &self.t_solid_image
    }

    pub fn empty_buffer(&self) -> &Arc<Buffer> {
        &self.t_empty_buffer
    }

    /// Install the compiled sampler list for binding 0.
    pub fn set_samplers(&self, samplers: Vec<Arc<Sampler>>) {
        *self.t_samplers.lock().unwrap() = samplers;
    }

    pub fn samplers(&self) -> Vec<Arc<Sampler>> {
        self.t_samplers.lock().unwrap().clone()
    }

    /// Record the one-shot initialization of the sentinel resources:
    /// clear the empty image to zero, the solid image to white, fill
    /// the empty buffer, and move everything to its resting layout.
    pub fn record_defaults(&self, cbuf: &mut CommandBuffer) {
        let to_transfer = |image: &Arc<Image>| {
            (
                image.clone(),
                ImageMemoryBarrier {
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    family: Default::default(),
                    range: image.full_subresource_range(),
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                },
            )
        };
        cbuf.cmd_pipeline_barrier(
            &[],
            &[to_transfer(&self.t_empty_image), to_transfer(&self.t_solid_image)],
        );

        cbuf.cmd_clear_color_image(
            &self.t_empty_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        );
        cbuf.cmd_clear_color_image(
            &self.t_solid_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ClearColorValue {
                float32: [1.0, 1.0, 1.0, 1.0],
            },
        );
        cbuf.cmd_fill_buffer(
            &self.t_empty_buffer,
            0,
            vk::WHOLE_SIZE,
            EMPTY_BUFFER_FILL,
        );

        let to_shader = |image: &Arc<Image>| {
            (
                image.clone(),
                ImageMemoryBarrier {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    family: Default::default(),
                    range: image.full_subresource_range(),
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                },
            )
        };
        cbuf.cmd_pipeline_barrier(
            &[],
            &[to_shader(&self.t_empty_image), to_shader(&self.t_solid_image)],
        );
    }

    /// Grab a texture set, recycling a released one when possible.
    pub fn acquire_set(self: &Arc<Self>) -> Option<Arc<TextureSet>> {
        if let Some(set) = self.t_sets.lock().unwrap().pop() {
            return Some(set);
        }
        TextureSet::new(&self.t_dev, self)
    }

    pub fn release_set(&self, set: Arc<TextureSet>) {
        self.t_sets.lock().unwrap().push(set);
    }

    /// Explicit teardown.
    pub fn invalidate(&self) {
        for set in self.t_sets.lock().unwrap().drain(..) {
            set.invalidate();
        }
        let mut layout = self.t_layout.lock().unwrap();
        if *layout != vk::DescriptorSetLayout::null() {
            unsafe {
                self.t_dev.destroy_descriptor_set_layout(*layout, None);
            }
            *layout = vk::DescriptorSetLayout::null();
        }
    }
}

struct TextureSetInternal {
    /// identity of what is bound at each image slot
    bound_images: Vec<u64>,
    bound_buffers: Vec<u64>,
    bound_samplers: Vec<u64>,
    /// refs keeping bound resources alive
    image_refs: Vec<Option<Arc<ImageView>>>,
    buffer_refs: Vec<Option<Arc<Buffer>>>,
    /// producers' barriers collected during write, consumed by the
    /// first pass sampling from this set
    pending_image_barriers: Vec<(Arc<Image>, ImageMemoryBarrier)>,
    pending_buffer_barriers: Vec<(Arc<Buffer>, BufferMemoryBarrier)>,
}

/// One allocated bindless descriptor set.
pub struct TextureSet {
    ts_dev: ash::Device,
    ts_layout: Arc<TextureSetLayout>,
    ts_pool: Mutex<vk::DescriptorPool>,
    ts_set: vk::DescriptorSet,
    ts_internal: Mutex<TextureSetInternal>,
}

impl TextureSet {
    fn new(dev: &ash::Device, layout: &Arc<TextureSetLayout>) -> Option<Arc<Self>> {
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(layout.t_sampler_count)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(layout.t_image_count)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(layout.t_buffer_count)
                .build(),
        ];

        let mut flags = vk::DescriptorPoolCreateFlags::empty();
        if layout.t_update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .pool_sizes(&sizes)
            .max_sets(1)
            .build();

        let pool = match unsafe { dev.create_descriptor_pool(&pool_info, None) } {
            Ok(p) => p,
            Err(e) => {
                log::error!("texture set pool creation failed: {:?}", e);
                return None;
            }
        };

        let layouts = [layout.vkhandle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();
        let set = match unsafe { dev.allocate_descriptor_sets(&alloc_info) } {
            Ok(mut s) => s.remove(0),
            Err(e) => {
                log::error!("texture set allocation failed: {:?}", e);
                unsafe { dev.destroy_descriptor_pool(pool, None) };
                return None;
            }
        };

        Some(Arc::new(Self {
            ts_dev: dev.clone(),
            ts_layout: layout.clone(),
            ts_pool: Mutex::new(pool),
            ts_set: set,
            ts_internal: Mutex::new(TextureSetInternal {
                bound_images: vec![0; layout.t_image_count as usize],
                bound_buffers: vec![0; layout.t_buffer_count as usize],
                bound_samplers: vec![0; layout.t_sampler_count as usize],
                image_refs: (0..layout.t_image_count).map(|_| None).collect(),
                buffer_refs: (0..layout.t_buffer_count).map(|_| None).collect(),
                pending_image_barriers: Vec::new(),
                pending_buffer_barriers: Vec::new(),
            }),
        }))
    }

    pub fn vkhandle(&self) -> vk::DescriptorSet {
        self.ts_set
    }

    /// Push the compiled sampler list into binding 0.
    pub fn write_samplers(&self) {
        let samplers = self.ts_layout.samplers();
        if samplers.is_empty() {
            return;
        }

        let mut internal = self.ts_internal.lock().unwrap();
        let mut dirty = vec![false; samplers.len().min(internal.bound_samplers.len())];
        for (i, s) in samplers.iter().enumerate().take(dirty.len()) {
            let handle = s.vkhandle().as_raw();
            if internal.bound_samplers[i] != handle {
                internal.bound_samplers[i] = handle;
                dirty[i] = true;
            }
        }

        let infos: Vec<_> = samplers
            .iter()
            .map(|s| {
                vk::DescriptorImageInfo::builder()
                    .sampler(s.vkhandle())
                    .build()
            })
            .collect();

        let writes: Vec<_> = coalesce_ranges(&dirty)
            .into_iter()
            .map(|(first, count)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.ts_set)
                    .dst_binding(0)
                    .dst_array_element(first)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&infos[first as usize..(first + count) as usize])
                    .build()
            })
            .collect();

        if !writes.is_empty() {
            unsafe {
                self.ts_dev.update_descriptor_sets(writes.as_slice(), &[]);
            }
        }
    }

    /// Sync the set's arrays to a material layout.
    ///
    /// Only slots whose resource changed are written; runs of changed
    /// slots collapse into single writes. Unpopulated slots point at
    /// the sentinels unless the device supports partially bound
    /// descriptors, in which case they stay unwritten. Pending
    /// producer barriers on newly bound resources are collected for
    /// the first consumer to emit.
    pub fn write(&self, material: &MaterialLayout) -> usize {
        let layout = &self.ts_layout;
        let mut internal = self.ts_internal.lock().unwrap();

        // image slots
        let image_slots = layout.t_image_count as usize;
        let mut image_dirty = vec![false; image_slots];
        for i in 0..image_slots {
            let slot = material.images.get(i).and_then(|s| s.as_ref());
            let (handle, view) = match slot {
                Some(s) => (s.view.vkhandle().as_raw(), Some(s.view.clone())),
                None => {
                    if layout.t_partially_bound {
                        // leave unclaimed slots unwritten
                        continue;
                    }
                    (
                        layout.t_empty_view.vkhandle().as_raw(),
                        Some(layout.t_empty_view.clone()),
                    )
                }
            };

            if internal.bound_images[i] != handle {
                internal.bound_images[i] = handle;
                if let Some(view) = view {
                    if let Some(image) = view.image() {
                        if let Some(barrier) = image.take_pending_barrier() {
                            internal.pending_image_barriers.push((image.clone(), barrier));
                        }
                    }
                    internal.image_refs[i] = Some(view);
                }
                image_dirty[i] = true;
            }
        }

        // buffer slots
        let buffer_slots = layout.t_buffer_count as usize;
        let mut buffer_dirty = vec![false; buffer_slots];
        for i in 0..buffer_slots {
            let slot = material.buffers.get(i).and_then(|s| s.as_ref());
            let buffer = match slot {
                Some(b) => Some(b.clone()),
                None => {
                    if layout.t_partially_bound {
                        continue;
                    }
                    Some(layout.t_empty_buffer.clone())
                }
            };

            if let Some(buffer) = buffer {
                let handle = buffer.vkhandle().as_raw();
                if internal.bound_buffers[i] != handle {
                    internal.bound_buffers[i] = handle;
                    if let Some(barrier) = buffer.take_pending_barrier() {
                        internal.pending_buffer_barriers.push((buffer.clone(), barrier));
                    }
                    internal.buffer_refs[i] = Some(buffer);
                    buffer_dirty[i] = true;
                }
            }
        }

        // build the coalesced writes
        let image_infos: Vec<_> = (0..image_slots)
            .map(|i| {
                let view = internal.image_refs[i]
                    .as_ref()
                    .map(|v| v.vkhandle())
                    .unwrap_or(layout.t_empty_view.vkhandle());
                vk::DescriptorImageInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build()
            })
            .collect();
        let buffer_infos: Vec<_> = (0..buffer_slots)
            .map(|i| {
                let buffer = internal.buffer_refs[i]
                    .as_ref()
                    .map(|b| b.vkhandle())
                    .unwrap_or(layout.t_empty_buffer.vkhandle());
                vk::DescriptorBufferInfo::builder()
                    .buffer(buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
                    .build()
            })
            .collect();

        let mut writes = Vec::new();
        for (first, count) in coalesce_ranges(&image_dirty).into_iter() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.ts_set)
                    .dst_binding(1)
                    .dst_array_element(first)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_infos[first as usize..(first + count) as usize])
                    .build(),
            );
        }
        for (first, count) in coalesce_ranges(&buffer_dirty).into_iter() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.ts_set)
                    .dst_binding(2)
                    .dst_array_element(first)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buffer_infos[first as usize..(first + count) as usize])
                    .build(),
            );
        }

        let emitted = writes.len();
        if emitted > 0 {
            unsafe {
                self.ts_dev.update_descriptor_sets(writes.as_slice(), &[]);
            }
        }
        emitted
    }

    /// Barriers collected from producers, for the first consumer.
    pub fn take_pending_image_barriers(&self) -> Vec<(Arc<Image>, ImageMemoryBarrier)> {
        std::mem::replace(
            &mut self.ts_internal.lock().unwrap().pending_image_barriers,
            Vec::new(),
        )
    }

    pub fn take_pending_buffer_barriers(&self) -> Vec<(Arc<Buffer>, BufferMemoryBarrier)> {
        std::mem::replace(
            &mut self.ts_internal.lock().unwrap().pending_buffer_barriers,
            Vec::new(),
        )
    }

    pub fn drop_pending_barriers(&self) {
        let mut internal = self.ts_internal.lock().unwrap();
        internal.pending_image_barriers.clear();
        internal.pending_buffer_barriers.clear();
    }

    pub fn invalidate(&self) {
        let mut pool = self.ts_pool.lock().unwrap();
        if *pool != vk::DescriptorPool::null() {
            unsafe {
                self.ts_dev.destroy_descriptor_pool(*pool, None);
            }
            *pool = vk::DescriptorPool::null();
        }
    }
}

impl Drop for TextureSet {
    fn drop(&mut self) {
        let pool = *self.ts_pool.lock().unwrap();
        if pool != vk::DescriptorPool::null() {
            log::warn!("TextureSet dropped while still live");
            unsafe {
                self.ts_dev.destroy_descriptor_pool(pool, None);
            }
        }
    }
}
