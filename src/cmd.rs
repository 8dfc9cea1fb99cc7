// Command recording
//
// CommandPool and CommandBuffer wrap the raw vulkan objects with the
// state the runtime needs: retained resources, bound set tracking and
// render pass position. Barrier descriptions live here too since they
// are what recording mostly consists of.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::Buffer;
use crate::image::Image;
use crate::queue::QueueOperations;
use crate::renderpass::RenderPass;
use crate::Droppable;

use std::sync::{Arc, Mutex};

/// A queue family ownership transfer. Defaults to "no transfer".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueFamilyTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

impl Default for QueueFamilyTransfer {
    fn default() -> Self {
        Self {
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

impl QueueFamilyTransfer {
    pub fn new(src: u32, dst: u32) -> Self {
        Self {
            src_family: src,
            dst_family: dst,
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.src_family != vk::QUEUE_FAMILY_IGNORED || self.dst_family != vk::QUEUE_FAMILY_IGNORED
    }
}

/// An image layout/ownership transition, described without the image
/// itself so it can sit in an object's pending slot.
#[derive(Debug, Clone)]
pub struct ImageMemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub family: QueueFamilyTransfer,
    pub range: vk::ImageSubresourceRange,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageMemoryBarrier {
    pub(crate) fn to_vk(&self, image: vk::Image) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.family.src_family)
            .dst_queue_family_index(self.family.dst_family)
            .subresource_range(self.range)
            .build()
    }
}

/// A buffer availability/ownership transition.
#[derive(Debug, Clone)]
pub struct BufferMemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub family: QueueFamilyTransfer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl BufferMemoryBarrier {
    pub(crate) fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier {
        vk::BufferMemoryBarrier::builder()
            .buffer(buffer)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.family.src_family)
            .dst_queue_family_index(self.family.dst_family)
            .offset(self.offset)
            .size(self.size)
            .build()
    }
}

/// Compare a new descriptor set binding against what is already bound.
///
/// Returns false when `sets` equals the currently bound run starting
/// at `first_set`, in which case the bind call can be skipped.
pub(crate) fn update_bound_sets(
    bound: &mut Vec<vk::DescriptorSet>,
    sets: &[vk::DescriptorSet],
    first_set: usize,
) -> bool {
    if bound.len() >= first_set + sets.len()
        && bound[first_set..first_set + sets.len()] == *sets
    {
        return false;
    }

    bound.truncate(first_set);
    while bound.len() < first_set {
        bound.push(vk::DescriptorSet::null());
    }
    bound.extend_from_slice(sets);
    true
}

/// One recorded command buffer.
///
/// Everything an application records goes through the typed wrappers
/// here. Objects touched by a command are retained on the buffer so
/// they cannot die while the GPU may still read them.
pub struct CommandBuffer {
    cb_dev: ash::Device,
    cb_buffer: vk::CommandBuffer,
    /// suppression state for redundant descriptor binds
    cb_bound_sets: Vec<vk::DescriptorSet>,
    cb_bound_layout: vk::PipelineLayout,
    /// render pass position
    cb_within_renderpass: bool,
    cb_current_subpass: u32,
    /// refs held until the pool resets this buffer
    cb_resources: Vec<Box<dyn Droppable + Send + Sync>>,
}

impl CommandBuffer {
    pub fn vkhandle(&self) -> vk::CommandBuffer {
        self.cb_buffer
    }

    pub fn current_subpass(&self) -> u32 {
        self.cb_current_subpass
    }

    pub fn within_renderpass(&self) -> bool {
        self.cb_within_renderpass
    }

    /// Keep `obj` alive for as long as this command buffer exists.
    pub fn retain(&mut self, obj: Box<dyn Droppable + Send + Sync>) {
        self.cb_resources.push(obj);
    }

    /// Issue one pipeline barrier covering a batch of buffer and image
    /// transitions. Stage masks are the OR of each transition's stages.
    pub fn cmd_pipeline_barrier(
        &mut self,
        buffers: &[(Arc<Buffer>, BufferMemoryBarrier)],
        images: &[(Arc<Image>, ImageMemoryBarrier)],
    ) {
        if buffers.is_empty() && images.is_empty() {
            return;
        }

        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();

        let mut vk_buffers = Vec::with_capacity(buffers.len());
        for (buf, barrier) in buffers.iter() {
            src_stage |= barrier.src_stage;
            dst_stage |= barrier.dst_stage;
            vk_buffers.push(barrier.to_vk(buf.vkhandle()));
            self.cb_resources.push(Box::new(buf.clone()));
        }
        let mut vk_images = Vec::with_capacity(images.len());
        for (img, barrier) in images.iter() {
            src_stage |= barrier.src_stage;
            dst_stage |= barrier.dst_stage;
            vk_images.push(barrier.to_vk(img.vkhandle()));
            img.set_layout(barrier.new_layout);
            self.cb_resources.push(Box::new(img.clone()));
        }

        if src_stage.is_empty() {
            src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stage.is_empty() {
            dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }

        unsafe {
            self.cb_dev.cmd_pipeline_barrier(
                self.cb_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                vk_buffers.as_slice(),
                vk_images.as_slice(),
            );
        }
    }

    pub fn cmd_copy_buffer(&mut self, src: &Arc<Buffer>, dst: &Arc<Buffer>, regions: &[vk::BufferCopy]) {
        unsafe {
            self.cb_dev
                .cmd_copy_buffer(self.cb_buffer, src.vkhandle(), dst.vkhandle(), regions);
        }
        self.cb_resources.push(Box::new(src.clone()));
        self.cb_resources.push(Box::new(dst.clone()));
    }

    pub fn cmd_copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Image>,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.cb_dev.cmd_copy_buffer_to_image(
                self.cb_buffer,
                src.vkhandle(),
                dst.vkhandle(),
                layout,
                regions,
            );
        }
        self.cb_resources.push(Box::new(src.clone()));
        self.cb_resources.push(Box::new(dst.clone()));
    }

    pub fn cmd_copy_image_to_buffer(
        &mut self,
        src: &Arc<Image>,
        layout: vk::ImageLayout,
        dst: &Arc<Buffer>,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.cb_dev.cmd_copy_image_to_buffer(
                self.cb_buffer,
                src.vkhandle(),
                layout,
                dst.vkhandle(),
                regions,
            );
        }
        self.cb_resources.push(Box::new(src.clone()));
        self.cb_resources.push(Box::new(dst.clone()));
    }

    pub fn cmd_copy_image(
        &mut self,
        src: &Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: &Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.cb_dev.cmd_copy_image(
                self.cb_buffer,
                src.vkhandle(),
                src_layout,
                dst.vkhandle(),
                dst_layout,
                regions,
            );
        }
        self.cb_resources.push(Box::new(src.clone()));
        self.cb_resources.push(Box::new(dst.clone()));
    }

    pub fn cmd_fill_buffer(&mut self, buf: &Arc<Buffer>, offset: u64, size: u64, data: u32) {
        unsafe {
            self.cb_dev
                .cmd_fill_buffer(self.cb_buffer, buf.vkhandle(), offset, size, data);
        }
        self.cb_resources.push(Box::new(buf.clone()));
    }

    pub fn cmd_clear_color_image(
        &mut self,
        image: &Arc<Image>,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
    ) {
        let range = image.full_subresource_range();
        unsafe {
            self.cb_dev.cmd_clear_color_image(
                self.cb_buffer,
                image.vkhandle(),
                layout,
                &color,
                &[range],
            );
        }
        self.cb_resources.push(Box::new(image.clone()));
    }

    /// Begin a render pass. `alt` selects the readback variant of the
    /// pass, used when the target is not a swapchain image.
    pub fn cmd_begin_render_pass(
        &mut self,
        pass: &Arc<RenderPass>,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        alt: bool,
    ) {
        let clear_values = pass.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.vkhandle(alt))
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(clear_values.as_slice())
            .build();

        unsafe {
            self.cb_dev.cmd_begin_render_pass(
                self.cb_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        self.cb_within_renderpass = true;
        self.cb_current_subpass = 0;
        self.cb_resources.push(Box::new(pass.clone()));
    }

    pub fn cmd_next_subpass(&mut self) -> u32 {
        unsafe {
            self.cb_dev
                .cmd_next_subpass(self.cb_buffer, vk::SubpassContents::INLINE);
        }
        self.cb_current_subpass += 1;
        self.cb_current_subpass
    }

    pub fn cmd_end_render_pass(&mut self) {
        unsafe {
            self.cb_dev.cmd_end_render_pass(self.cb_buffer);
        }
        self.cb_within_renderpass = false;
        self.cb_current_subpass = 0;
    }

    pub fn cmd_bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.cb_dev
                .cmd_bind_pipeline(self.cb_buffer, bind_point, pipeline);
        }
    }

    /// Bind descriptor sets, suppressing the call when the new sets
    /// equal the currently bound run at the same position.
    pub fn cmd_bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        if layout != self.cb_bound_layout {
            // a new layout invalidates compatibility, rebind everything
            self.cb_bound_sets.clear();
            self.cb_bound_layout = layout;
        }
        if !update_bound_sets(&mut self.cb_bound_sets, sets, first_set as usize) {
            return;
        }

        unsafe {
            self.cb_dev.cmd_bind_descriptor_sets(
                self.cb_buffer,
                bind_point,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    pub fn cmd_push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.cb_dev
                .cmd_push_constants(self.cb_buffer, layout, stages, offset, data);
        }
    }

    pub fn cmd_set_viewport(&mut self, viewport: &vk::Viewport) {
        unsafe {
            self.cb_dev
                .cmd_set_viewport(self.cb_buffer, 0, &[*viewport]);
        }
    }

    pub fn cmd_set_scissor(&mut self, scissor: &vk::Rect2D) {
        unsafe {
            self.cb_dev.cmd_set_scissor(self.cb_buffer, 0, &[*scissor]);
        }
    }

    pub fn cmd_draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.cb_dev.cmd_draw(
                self.cb_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn cmd_draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.cb_dev.cmd_draw_indexed(
                self.cb_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn cmd_bind_index_buffer(&mut self, buf: &Arc<Buffer>, offset: u64, ty: vk::IndexType) {
        unsafe {
            self.cb_dev
                .cmd_bind_index_buffer(self.cb_buffer, buf.vkhandle(), offset, ty);
        }
        self.cb_resources.push(Box::new(buf.clone()));
    }

    pub fn cmd_bind_vertex_buffers(&mut self, first: u32, bufs: &[Arc<Buffer>], offsets: &[u64]) {
        let handles: Vec<_> = bufs.iter().map(|b| b.vkhandle()).collect();
        unsafe {
            self.cb_dev
                .cmd_bind_vertex_buffers(self.cb_buffer, first, handles.as_slice(), offsets);
        }
        for b in bufs.iter() {
            self.cb_resources.push(Box::new(b.clone()));
        }
    }

    pub fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe {
            self.cb_dev.cmd_dispatch(self.cb_buffer, x, y, z);
        }
    }
}

/// A command pool tied to one queue family.
pub struct CommandPool {
    cp_dev: ash::Device,
    cp_pool: Mutex<vk::CommandPool>,
    cp_family: u32,
    cp_class: QueueOperations,
    /// portability devices leak on plain reset, see `reset`
    cp_portability: bool,
    /// buffers handed out since the last reset
    cp_buffers: Mutex<Vec<vk::CommandBuffer>>,
    cp_autorelease: Mutex<Vec<Box<dyn Droppable + Send + Sync>>>,
}

impl CommandPool {
    pub fn new(
        dev: &ash::Device,
        family: u32,
        class: QueueOperations,
        portability: bool,
        transient: bool,
    ) -> Option<Self> {
        let mut flags = vk::CommandPoolCreateFlags::empty();
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(family)
            .build();

        let pool = match unsafe { dev.create_command_pool(&info, None) } {
            Ok(p) => p,
            Err(e) => {
                log::error!("vkCreateCommandPool failed: {:?}", e);
                return None;
            }
        };

        Some(Self {
            cp_dev: dev.clone(),
            cp_pool: Mutex::new(pool),
            cp_family: family,
            cp_class: class,
            cp_portability: portability,
            cp_buffers: Mutex::new(Vec::new()),
            cp_autorelease: Mutex::new(Vec::new()),
        })
    }

    pub fn family(&self) -> u32 {
        self.cp_family
    }

    pub fn class(&self) -> QueueOperations {
        self.cp_class
    }

    /// Keep `obj` alive until the next reset of this pool.
    pub fn autorelease(&self, obj: Box<dyn Droppable + Send + Sync>) {
        self.cp_autorelease.lock().unwrap().push(obj);
    }

    /// Allocate and record one command buffer.
    ///
    /// The closure does all the recording through the CommandBuffer
    /// wrappers. If it returns false the buffer is freed and None
    /// comes back.
    pub fn record_buffer<F>(
        &self,
        usage: vk::CommandBufferUsageFlags,
        level: vk::CommandBufferLevel,
        record_fn: F,
    ) -> Option<CommandBuffer>
    where
        F: FnOnce(&mut CommandBuffer) -> bool,
    {
        let pool = *self.cp_pool.lock().unwrap();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(level)
            .build();

        let handle = match unsafe { self.cp_dev.allocate_command_buffers(&alloc_info) } {
            Ok(mut v) => v.remove(0),
            Err(e) => {
                log::error!("vkAllocateCommandBuffers failed: {:?}", e);
                return None;
            }
        };
        self.cp_buffers.lock().unwrap().push(handle);

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(usage).build();
        if let Err(e) = unsafe { self.cp_dev.begin_command_buffer(handle, &begin_info) } {
            log::error!("vkBeginCommandBuffer failed: {:?}", e);
            return None;
        }

        let mut cbuf = CommandBuffer {
            cb_dev: self.cp_dev.clone(),
            cb_buffer: handle,
            cb_bound_sets: Vec::new(),
            cb_bound_layout: vk::PipelineLayout::null(),
            cb_within_renderpass: false,
            cb_current_subpass: 0,
            cb_resources: Vec::new(),
        };

        let ok = record_fn(&mut cbuf);

        if let Err(e) = unsafe { self.cp_dev.end_command_buffer(handle) } {
            log::error!("vkEndCommandBuffer failed: {:?}", e);
            return None;
        }

        if !ok {
            unsafe { self.cp_dev.free_command_buffers(pool, &[handle]) };
            self.cp_buffers.lock().unwrap().retain(|b| *b != handle);
            return None;
        }
        Some(cbuf)
    }

    /// Free all recorded buffers and reset the pool for reuse.
    ///
    /// On portability devices the pool is destroyed and recreated
    /// instead, plain resets leak there.
    pub fn reset(&self, release_resources: bool) {
        let mut pool = self.cp_pool.lock().unwrap();
        let buffers = std::mem::replace(&mut *self.cp_buffers.lock().unwrap(), Vec::new());
        unsafe {
            if !buffers.is_empty() {
                self.cp_dev.free_command_buffers(*pool, buffers.as_slice());
            }

            if self.cp_portability {
                self.cp_dev.destroy_command_pool(*pool, None);
                let info = vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(self.cp_family)
                    .build();
                *pool = self
                    .cp_dev
                    .create_command_pool(&info, None)
                    .unwrap_or(vk::CommandPool::null());
            } else {
                let flags = if release_resources {
                    vk::CommandPoolResetFlags::RELEASE_RESOURCES
                } else {
                    vk::CommandPoolResetFlags::empty()
                };
                if let Err(e) = self.cp_dev.reset_command_pool(*pool, flags) {
                    log::error!("vkResetCommandPool failed: {:?}", e);
                }
            }
        }

        self.cp_autorelease.lock().unwrap().clear();
    }

    /// Explicit teardown. Drop only logs if this was skipped.
    pub fn invalidate(&self) {
        let mut pool = self.cp_pool.lock().unwrap();
        if *pool != vk::CommandPool::null() {
            unsafe {
                self.cp_dev.destroy_command_pool(*pool, None);
            }
            *pool = vk::CommandPool::null();
        }
        self.cp_autorelease.lock().unwrap().clear();
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        let pool = *self.cp_pool.lock().unwrap();
        if pool != vk::CommandPool::null() {
            log::warn!(
                "CommandPool for family {} dropped while still live",
                self.cp_family
            );
            unsafe {
                self.cp_dev.destroy_command_pool(pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(val: u64) -> vk::DescriptorSet {
        vk::DescriptorSet::from_raw(val)
    }

    use ash::vk::Handle;

    #[test]
    fn bound_set_suppression() {
        let mut bound = Vec::new();
        let sets = [set(1), set(2)];

        // first bind always emits
        assert!(update_bound_sets(&mut bound, &sets, 0));
        // identical rebind is suppressed
        assert!(!update_bound_sets(&mut bound, &sets, 0));
        // a differing suffix emits and replaces
        assert!(update_bound_sets(&mut bound, &[set(3)], 1));
        assert_eq!(bound, vec![set(1), set(3)]);
        // and the old pair no longer matches
        assert!(update_bound_sets(&mut bound, &sets, 0));
    }

    #[test]
    fn bound_set_prefix_positions() {
        let mut bound = Vec::new();
        // binding at a gap pads with null sets
        assert!(update_bound_sets(&mut bound, &[set(5)], 2));
        assert_eq!(bound.len(), 3);
        assert_eq!(bound[2], set(5));
        // the same set at the same index is suppressed
        assert!(!update_bound_sets(&mut bound, &[set(5)], 2));
    }
}
