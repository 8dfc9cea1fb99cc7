// Frame execution
//
// A FrameHandle walks one compiled queue: attachments materialize
// their backing objects, passes record as soon as their inputs are
// ready, submissions ride whatever queue of the right class frees up
// first, and completion cascades attachment readiness until the DAG
// drains. All frame state mutation happens on the loop thread;
// recording and attachment factories run on the worker pool.
//
// Austin Shafer - 2024

use ash::vk;

use crate::cmd::{CommandBuffer, CommandPool, ImageMemoryBarrier};
use crate::device::Device;
use crate::graph::{AttachmentBacking, AttachmentData, PassData, PassKind, QueueData};
use crate::image::{ImageView, ImageViewInfo};
use crate::memory::pool::MemoryPool;
use crate::queue::{DeviceQueue, FrameSync, QueueOperations, Waiter};
use crate::renderpass::RenderPass;
use crate::sched::{FrameCache, LoopHandle};
use crate::sync::{DependencyEvent, FenceType, Semaphore};
use crate::{Result, SquallError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A request to run one frame of a compiled queue.
pub struct FrameRequest {
    pub queue: Arc<QueueData>,
    /// input blobs per attachment index, consumed by the factories
    pub input: HashMap<usize, Vec<u8>>,
    /// externally supplied backings (swapchain images and friends)
    pub backings: HashMap<usize, AttachmentBacking>,
    /// events that must signal before the frame starts
    pub wait_events: Vec<Arc<DependencyEvent>>,
    /// events this frame signals on completion
    pub signal_events: Vec<Arc<DependencyEvent>>,
    /// semaphores the frame's first submission waits on
    pub wait_semaphores: Vec<(Arc<Semaphore>, vk::PipelineStageFlags)>,
    /// semaphores the frame's last submission signals
    pub signal_semaphores: Vec<Arc<Semaphore>>,
    /// returns swapchain acquire semaphores on retirement
    pub recycle_semaphores: Vec<(Arc<Semaphore>, Box<dyn FnOnce(Arc<Semaphore>) + Send>)>,
    pub on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl FrameRequest {
    pub fn new(queue: Arc<QueueData>) -> Self {
        Self {
            queue: queue,
            input: HashMap::new(),
            backings: HashMap::new(),
            wait_events: Vec::new(),
            signal_events: Vec::new(),
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            recycle_semaphores: Vec::new(),
            on_complete: None,
        }
    }
}

/// Which passes can run right now: not yet started, with every input
/// attachment ready.
pub(crate) fn runnable_passes(
    passes: &[Arc<PassData>],
    attachment_ready: &[bool],
    pass_started: &[bool],
) -> Vec<usize> {
    passes
        .iter()
        .enumerate()
        .filter(|(i, pass)| {
            !pass_started[*i] && pass.input_attachments().all(|a| attachment_ready[a])
        })
        .map(|(i, _)| i)
        .collect()
}

/// Per-frame state of one attachment slot.
pub struct AttachmentHandle {
    pub data: Arc<AttachmentData>,
    backing: Mutex<AttachmentBacking>,
}

impl AttachmentHandle {
    fn new(data: Arc<AttachmentData>) -> Arc<Self> {
        Arc::new(Self {
            data: data,
            backing: Mutex::new(AttachmentBacking::None),
        })
    }

    pub fn set_backing(&self, backing: AttachmentBacking) {
        *self.backing.lock().unwrap() = backing;
    }

    pub fn backing(&self) -> AttachmentBacking {
        self.backing.lock().unwrap().clone()
    }

    pub fn image(&self) -> Option<Arc<crate::image::Image>> {
        match self.backing() {
            AttachmentBacking::Image(i) => Some(i),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<Arc<crate::buffer::Buffer>> {
        match self.backing() {
            AttachmentBacking::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

/// Per-frame state of one pass: its compiled artifacts and the
/// resources it holds until retirement.
pub struct PassHandle {
    pub data: Arc<PassData>,
    /// position in the queue's pass list
    pub pass_idx: usize,
    pub render_pass: Option<Arc<RenderPass>>,
    /// the frame's attachment handles, indexed like the queue
    pub attachments: Vec<Arc<AttachmentHandle>>,
    /// command pool feeding this pass's buffers
    pub pool: Arc<CommandPool>,
    /// framebuffer to render into, graphics only
    pub framebuffer: Option<Arc<crate::sched::Framebuffer>>,
    /// true when the render target is not a swapchain image and the
    /// pass should use its readback variant
    pub use_alt: bool,
}

impl PassHandle {
    pub fn attachment(&self, idx: usize) -> Option<&Arc<AttachmentHandle>> {
        self.attachments.get(idx)
    }
}

struct FrameState {
    attachment_ready: Vec<bool>,
    pass_started: Vec<bool>,
    pass_complete: Vec<bool>,
    /// which pass produces each attachment
    producers: Vec<Option<usize>>,
    finished: bool,
}

/// One in-flight frame.
pub struct FrameHandle {
    f_id: u64,
    f_dev: Arc<Device>,
    f_loop: LoopHandle,
    f_cache: Arc<FrameCache>,
    f_queue: Arc<QueueData>,
    f_attachments: Vec<Arc<AttachmentHandle>>,
    f_valid: AtomicBool,
    f_state: Mutex<FrameState>,
    /// per-key transient allocation pools
    f_pools: Mutex<HashMap<u64, Arc<MemoryPool>>>,
    f_signal_events: Vec<Arc<DependencyEvent>>,
    f_on_complete: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
    /// sync plumbing consumed by the first/last submission
    f_wait_semaphores: Mutex<Vec<(Arc<Semaphore>, vk::PipelineStageFlags)>>,
    f_signal_semaphores: Mutex<Vec<Arc<Semaphore>>>,
    f_recycle: Mutex<Vec<(Arc<Semaphore>, Box<dyn FnOnce(Arc<Semaphore>) + Send>)>>,
}

impl FrameHandle {
    pub(crate) fn new(
        id: u64,
        dev: Arc<Device>,
        loop_handle: LoopHandle,
        cache: Arc<FrameCache>,
        mut request: FrameRequest,
    ) -> Arc<Self> {
        let queue = request.queue.clone();
        let attachments: Vec<_> = queue
            .attachments
            .iter()
            .map(|a| AttachmentHandle::new(a.clone()))
            .collect();

        // externally supplied backings land immediately
        for (idx, backing) in request.backings.drain() {
            if let Some(handle) = attachments.get(idx) {
                handle.set_backing(backing);
            }
        }

        let producers = queue.producers();
        let pass_count = queue.passes.len();
        let att_count = queue.attachments.len();

        Arc::new(Self {
            f_id: id,
            f_dev: dev,
            f_loop: loop_handle,
            f_cache: cache,
            f_queue: queue,
            f_attachments: attachments,
            f_valid: AtomicBool::new(true),
            f_state: Mutex::new(FrameState {
                attachment_ready: vec![false; att_count],
                pass_started: vec![false; pass_count],
                pass_complete: vec![false; pass_count],
                producers: producers,
                finished: false,
            }),
            f_pools: Mutex::new(HashMap::new()),
            f_signal_events: std::mem::replace(&mut request.signal_events, Vec::new()),
            f_on_complete: Mutex::new(request.on_complete.take()),
            f_wait_semaphores: Mutex::new(std::mem::replace(
                &mut request.wait_semaphores,
                Vec::new(),
            )),
            f_signal_semaphores: Mutex::new(std::mem::replace(
                &mut request.signal_semaphores,
                Vec::new(),
            )),
            f_recycle: Mutex::new(std::mem::replace(&mut request.recycle_semaphores, Vec::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.f_id
    }

    pub fn is_valid(&self) -> bool {
        self.f_valid.load(Ordering::Acquire)
    }

    pub fn queue_data(&self) -> &Arc<QueueData> {
        &self.f_queue
    }

    pub fn attachment(&self, idx: usize) -> Option<&Arc<AttachmentHandle>> {
        self.f_attachments.get(idx)
    }

    /// The frame's transient memory pool for a pool key, created on
    /// first use and cleared when the frame retires.
    pub fn memory_pool(&self, key: u64) -> Arc<MemoryPool> {
        let mut pools = self.f_pools.lock().unwrap();
        pools
            .entry(key)
            .or_insert_with(|| MemoryPool::new(self.f_dev.allocator().clone(), true))
            .clone()
    }

    /// Kick the frame off: resolve attachment inputs, then schedule
    /// every pass that has no unmet dependencies. Runs on the loop
    /// thread.
    pub(crate) fn start(self: &Arc<Self>, mut input: HashMap<usize, Vec<u8>>) {
        if !self.f_queue.is_compiled() || self.f_queue.compiled_artifacts().is_none() {
            log::error!("frame {} submitted against an uncompiled queue", self.f_id);
            self.invalidate();
            return;
        }

        for (idx, att) in self.f_attachments.iter().enumerate() {
            let has_producer = {
                let state = self.f_state.lock().unwrap();
                state.producers[idx].is_some()
            };

            let blob = input.remove(&idx);
            match (&att.data.factory, blob) {
                (Some(_), Some(blob)) => {
                    // factory work runs on the pool, results come back
                    // to the loop thread
                    let frame = self.clone();
                    let att = att.clone();
                    let dev = self.f_dev.clone();
                    self.f_loop.perform_in_queue(Box::new(move || {
                        let backing = (att.data.factory.as_ref().unwrap())(&dev, Some(&blob));
                        let frame2 = frame.clone();
                        frame.f_loop.perform(Box::new(move |_state| match backing {
                            Some(b) => {
                                att.set_backing(b);
                                frame2.mark_attachment_ready(idx);
                            }
                            None => frame2.invalidate(),
                        }));
                    }));
                    continue;
                }
                (Some(factory), None) => {
                    if att.data.takes_input {
                        log::error!(
                            "attachment {} expects input data but none was provided",
                            att.data.name
                        );
                        self.invalidate();
                        return;
                    }
                    match factory(&self.f_dev, None) {
                        Some(b) => att.set_backing(b),
                        None => {
                            self.invalidate();
                            return;
                        }
                    }
                }
                (None, _) => {}
            }

            if !has_producer {
                self.mark_attachment_ready(idx);
            }
        }

        self.try_schedule();
    }

    /// Mark one attachment ready and schedule anything it unblocked.
    pub(crate) fn mark_attachment_ready(self: &Arc<Self>, idx: usize) {
        {
            let mut state = self.f_state.lock().unwrap();
            state.attachment_ready[idx] = true;
        }
        self.try_schedule();
    }

    /// Launch every pass whose inputs are satisfied.
    fn try_schedule(self: &Arc<Self>) {
        if !self.is_valid() {
            return;
        }

        let runnable = {
            let mut state = self.f_state.lock().unwrap();
            let runnable =
                runnable_passes(&self.f_queue.passes, &state.attachment_ready, &state.pass_started);
            for i in runnable.iter() {
                state.pass_started[*i] = true;
            }
            runnable
        };

        for pass_idx in runnable.into_iter() {
            self.start_pass(pass_idx);
        }

        self.check_finished();
    }

    /// Build the PassHandle and fire recording on the worker pool.
    fn start_pass(self: &Arc<Self>, pass_idx: usize) {
        let pass_data = self.f_queue.passes[pass_idx].clone();
        let artifacts = match self.f_queue.compiled_artifacts() {
            Some(a) => a,
            None => {
                self.invalidate();
                return;
            }
        };
        let render_pass = artifacts.render_pass(pass_idx);

        // generic passes only run their callback, no GPU submission
        if pass_data.kind == PassKind::Generic {
            let frame = self.clone();
            self.f_loop.perform_in_queue(Box::new(move || {
                let frame2 = frame.clone();
                frame.f_loop.perform(Box::new(move |_state| {
                    frame2.on_pass_complete(pass_idx, true);
                }));
            }));
            return;
        }

        let ops = match pass_data.kind {
            PassKind::Graphics => QueueOperations::GRAPHICS,
            PassKind::Compute => QueueOperations::COMPUTE,
            PassKind::Transfer => QueueOperations::TRANSFER,
            PassKind::Generic => unreachable!(),
        };

        let pool = match self.f_dev.acquire_command_pool(ops) {
            Some(p) => p,
            None => {
                self.invalidate();
                return;
            }
        };

        let handle = match self.build_pass_handle(pass_data, pass_idx, render_pass, pool) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                log::error!("frame {}: pass setup failed: {:?}", self.f_id, e);
                self.invalidate();
                return;
            }
        };

        // record on the worker pool, then hop back to submit
        let frame = self.clone();
        self.f_loop.perform_in_queue(Box::new(move || {
            let cbuf = frame.record_pass(&handle);
            let frame2 = frame.clone();
            frame.f_loop.perform(Box::new(move |state| match cbuf {
                Some(cbuf) => frame2.submit_pass(state, pass_idx, handle, cbuf, ops),
                None => frame2.invalidate(),
            }));
        }));
    }

    fn build_pass_handle(
        &self,
        pass_data: Arc<PassData>,
        pass_idx: usize,
        render_pass: Option<Arc<RenderPass>>,
        pool: Arc<CommandPool>,
    ) -> Result<PassHandle> {
        let mut framebuffer = None;
        let mut use_alt = false;

        if pass_data.kind == PassKind::Graphics {
            let rp = render_pass.as_ref().ok_or(SquallError::INVALID_QUEUE_DATA)?;

            // gather one view per pass attachment slot, in order
            let mut views: Vec<Arc<ImageView>> = Vec::new();
            let mut extent = vk::Extent2D::default();
            for att in pass_data.attachments.iter() {
                let handle = self
                    .f_attachments
                    .get(att.attachment)
                    .ok_or(SquallError::INVALID_QUEUE_DATA)?;
                let image = handle.image().ok_or(SquallError::INVALID_QUEUE_DATA)?;
                extent = vk::Extent2D {
                    width: image.extent().width,
                    height: image.extent().height,
                };
                // readback variant when the target will not be presented
                if att.final_layout == vk::ImageLayout::PRESENT_SRC_KHR && !image.is_external() {
                    use_alt = true;
                }
                views.push(image.get_view(&ImageViewInfo::new_2d(att.format))?);
            }

            framebuffer = Some(self.f_cache.get_framebuffer(
                &self.f_dev,
                rp,
                use_alt,
                &views,
                extent,
            )?);
        }

        Ok(PassHandle {
            data: pass_data,
            pass_idx: pass_idx,
            render_pass: render_pass,
            attachments: self.f_attachments.clone(),
            pool: pool,
            framebuffer: framebuffer,
            use_alt: use_alt,
        })
    }

    /// The queue class a pass kind submits on.
    fn ops_for_kind(kind: PassKind) -> QueueOperations {
        match kind {
            PassKind::Graphics => QueueOperations::GRAPHICS,
            PassKind::Compute => QueueOperations::COMPUTE,
            _ => QueueOperations::TRANSFER,
        }
    }

    /// Record one pass's command buffer. Runs on the worker pool.
    ///
    /// Consumes pending producer barriers on the pass's inputs before
    /// the callback, and records release barriers afterwards for
    /// outputs whose next consumer sits on another family.
    fn record_pass(&self, handle: &Arc<PassHandle>) -> Option<CommandBuffer> {
        let handle = handle.clone();
        let dev_family = self
            .f_dev
            .queues()
            .family_index(match handle.data.kind {
                PassKind::Graphics => QueueOperations::GRAPHICS,
                PassKind::Compute => QueueOperations::COMPUTE,
                _ => QueueOperations::TRANSFER,
            })
            .unwrap_or(vk::QUEUE_FAMILY_IGNORED);

        handle.pool.record_buffer(
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            vk::CommandBufferLevel::PRIMARY,
            |cbuf| {
                // consume pending queue family releases on our inputs
                let mut image_barriers: Vec<(Arc<crate::image::Image>, ImageMemoryBarrier)> =
                    Vec::new();
                let mut buffer_barriers = Vec::new();
                for att in handle.data.attachments.iter() {
                    if let Some(att_handle) = handle.attachments.get(att.attachment) {
                        match att_handle.backing() {
                            AttachmentBacking::Image(image) => {
                                if let Some(mut barrier) = image.take_pending_barrier() {
                                    if barrier.family.is_transfer() {
                                        barrier.family.dst_family = dev_family;
                                    }
                                    image_barriers.push((image, barrier));
                                }
                            }
                            AttachmentBacking::Buffer(buffer) => {
                                if let Some(mut barrier) = buffer.take_pending_barrier() {
                                    if barrier.family.is_transfer() {
                                        barrier.family.dst_family = dev_family;
                                    }
                                    buffer_barriers.push((buffer, barrier));
                                }
                            }
                            AttachmentBacking::None => {}
                        }
                    }
                }
                cbuf.cmd_pipeline_barrier(&buffer_barriers, &image_barriers);

                if handle.data.kind == PassKind::Graphics {
                    let rp = handle.render_pass.as_ref().unwrap();
                    let fb = handle.framebuffer.as_ref().unwrap();
                    cbuf.cmd_begin_render_pass(
                        rp,
                        fb.vkhandle(),
                        vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: fb.extent(),
                        },
                        handle.use_alt,
                    );
                    cbuf.retain(Box::new(fb.clone()));
                }

                let ok = match handle.data.record_fn.as_ref() {
                    Some(f) => f(cbuf, &handle),
                    None => true,
                };

                if handle.data.kind == PassKind::Graphics {
                    cbuf.cmd_end_render_pass();
                }

                // release outputs whose next consumer sits on another
                // queue family. The matching acquire is stored on the
                // object for that consumer's pre-pass batch.
                let mut release_barriers = Vec::new();
                for att in handle.data.attachments.iter() {
                    if !att.usage.contains(crate::graph::AttachmentUse::OUTPUT) {
                        continue;
                    }
                    let consumer = match self
                        .f_queue
                        .next_consumer(handle.pass_idx, att.attachment)
                    {
                        Some(c) => c,
                        None => continue,
                    };
                    let consumer_family = self
                        .f_dev
                        .queues()
                        .family_index(Self::ops_for_kind(self.f_queue.passes[consumer].kind))
                        .unwrap_or(dev_family);
                    if consumer_family == dev_family {
                        continue;
                    }

                    if let Some(att_handle) = handle.attachments.get(att.attachment) {
                        if let AttachmentBacking::Image(image) = att_handle.backing() {
                            let barrier = ImageMemoryBarrier {
                                src_access: vk::AccessFlags::MEMORY_WRITE,
                                dst_access: vk::AccessFlags::MEMORY_READ,
                                old_layout: att.final_layout,
                                new_layout: att.final_layout,
                                family: crate::cmd::QueueFamilyTransfer::new(
                                    dev_family,
                                    consumer_family,
                                ),
                                range: image.full_subresource_range(),
                                src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                                dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                            };
                            image.set_pending_barrier(barrier.clone());
                            release_barriers.push((image, barrier));
                        }
                    }
                }
                cbuf.cmd_pipeline_barrier(&[], &release_barriers);

                ok
            },
        )
    }

    /// Acquire a queue of the pass's class and submit. Loop thread.
    fn submit_pass(
        self: &Arc<Self>,
        state: &mut crate::sched::LoopState,
        pass_idx: usize,
        handle: Arc<PassHandle>,
        cbuf: CommandBuffer,
        ops: QueueOperations,
    ) {
        if !self.is_valid() {
            return;
        }

        let frame = self.clone();
        let frame_inv = self.clone();
        let frame_valid = self.clone();
        let loop_handle = state.handle();
        let cbuf = Arc::new(cbuf);

        let waiter = Waiter {
            acquire: Box::new(move |queue: Arc<DeviceQueue>| {
                let frame = frame.clone();
                let handle = handle.clone();
                let cbuf = cbuf.clone();
                loop_handle.perform(Box::new(move |state| {
                    frame.do_submit(state, pass_idx, handle, cbuf, queue);
                }));
            }),
            invalidate: Box::new(move || {
                frame_inv.invalidate();
            }),
            is_valid: Box::new(move || frame_valid.is_valid()),
        };

        if !self.f_dev.queues().acquire_queue(ops, self.f_id, waiter) {
            log::error!("frame {}: no queue family serves {:?}", self.f_id, ops);
            self.invalidate();
        }
    }

    /// The actual submission once a queue is in hand. Loop thread.
    fn do_submit(
        self: &Arc<Self>,
        state: &mut crate::sched::LoopState,
        pass_idx: usize,
        handle: Arc<PassHandle>,
        cbuf: Arc<CommandBuffer>,
        queue: Arc<DeviceQueue>,
    ) {
        if !self.is_valid() {
            self.f_dev.queues().release_queue(queue);
            return;
        }

        let fence = match state.acquire_fence(FenceType::Default) {
            Some(f) => f,
            None => {
                self.f_dev.queues().release_queue(queue);
                self.invalidate();
                return;
            }
        };
        fence.set_frame(self.f_id);

        let mut sync = FrameSync::new();
        // the frame-level semaphore plumbing rides the first and last
        // submissions that take it
        {
            let mut waits = self.f_wait_semaphores.lock().unwrap();
            sync.wait = std::mem::replace(&mut *waits, Vec::new());
        }
        if self.is_last_pass(pass_idx) {
            let mut signals = self.f_signal_semaphores.lock().unwrap();
            sync.signal = std::mem::replace(&mut *signals, Vec::new());
            let mut recycle = self.f_recycle.lock().unwrap();
            sync.recycle = std::mem::replace(&mut *recycle, Vec::new());
        }

        // final layouts land on our output images at execution
        for att in handle.data.attachments.iter() {
            if let Some(att_handle) = handle.attachments.get(att.attachment) {
                if let AttachmentBacking::Image(image) = att_handle.backing() {
                    sync.images.push((image, att.final_layout));
                }
            }
        }

        // completion chain: outputs become ready, resources retire
        let frame = self.clone();
        let loop_handle = state.handle();
        let pool = handle.pool.clone();
        let cbuf_retain = cbuf.clone();
        fence.add_release(
            Box::new(move |success| {
                drop(cbuf_retain);
                loop_handle.perform(Box::new(move |state2| {
                    pool.reset(true);
                    state2.device().queues().release_command_pool(pool.clone());
                    frame.on_pass_complete(pass_idx, success);
                }));
            }),
            Some(Box::new(handle.clone())),
            "pass-complete",
        );

        let res = queue.submit(
            sync,
            &fence,
            &[cbuf.vkhandle()],
            self.f_dev.submit_idle_flags,
        );
        // the queue frees up as soon as the submission is in
        self.f_dev.queues().release_queue(queue);

        match res {
            Ok(()) => {
                state.schedule_fence(fence);
            }
            Err(e) => {
                log::error!("frame {}: submit failed: {:?}", self.f_id, e);
                // signal(false) runs the release chain, which also
                // returns the fence to the pool
                fence.signal(false);
                self.invalidate();
            }
        }
    }

    fn is_last_pass(&self, pass_idx: usize) -> bool {
        // passes are listed in topological order, the tail is the
        // frame's final submission
        pass_idx + 1 == self.f_queue.passes.len()
    }

    /// A pass's fence retired. Loop thread.
    pub(crate) fn on_pass_complete(self: &Arc<Self>, pass_idx: usize, success: bool) {
        if !success {
            self.invalidate();
            return;
        }

        {
            let mut state = self.f_state.lock().unwrap();
            state.pass_complete[pass_idx] = true;
        }

        // outputs the pass produced are now readable
        let outputs: Vec<_> = self.f_queue.passes[pass_idx]
            .output_attachments()
            .collect();
        {
            let mut state = self.f_state.lock().unwrap();
            for o in outputs.iter() {
                state.attachment_ready[*o] = true;
            }
        }

        self.try_schedule();
    }

    fn check_finished(self: &Arc<Self>) {
        let finished = {
            let mut state = self.f_state.lock().unwrap();
            if state.finished {
                return;
            }
            let all_done = state.pass_complete.iter().all(|d| *d);
            if all_done {
                state.finished = true;
            }
            all_done
        };

        if finished {
            self.complete(true);
        }
    }

    /// Flip the frame invalid: releases are triggered, queued
    /// callbacks will bail, and the completion chain reports failure.
    pub fn invalidate(self: &Arc<Self>) {
        if !self.f_valid.swap(false, Ordering::AcqRel) {
            return;
        }
        self.complete(false);
    }

    fn complete(self: &Arc<Self>, success: bool) {
        for event in self.f_signal_events.iter() {
            event.signal(success);
        }

        if let Some(cb) = self.f_on_complete.lock().unwrap().take() {
            cb(success);
        }

        // transient pools drain now that every pass fence retired
        let pools = std::mem::replace(&mut *self.f_pools.lock().unwrap(), HashMap::new());
        for (_, pool) in pools.into_iter() {
            pool.clear();
        }

        let frame_id = self.f_id;
        self.f_loop.perform(Box::new(move |state| {
            state.retire_frame(frame_id);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passes_with_inputs(inputs: Vec<Vec<usize>>) -> Vec<Arc<PassData>> {
        use crate::graph::{AttachmentPassData, AttachmentUse};
        let mut ecs = lluvia::Instance::new();
        inputs
            .into_iter()
            .enumerate()
            .map(|(i, ins)| {
                Arc::new(PassData {
                    id: ecs.add_entity(),
                    name: format!("pass-{}", i),
                    kind: PassKind::Transfer,
                    attachments: ins
                        .into_iter()
                        .map(|a| {
                            AttachmentPassData::new(
                                a,
                                AttachmentUse::INPUT,
                                vk::Format::R8G8B8A8_UNORM,
                            )
                        })
                        .collect(),
                    subpasses: Vec::new(),
                    dependencies: Vec::new(),
                    layouts: Vec::new(),
                    record_fn: None,
                })
            })
            .collect()
    }

    #[test]
    fn runnable_respects_input_readiness() {
        // pass 0 reads attachment 0, pass 1 reads attachments 0 and 1
        let passes = passes_with_inputs(vec![vec![0], vec![0, 1]]);

        let ready = vec![true, false];
        let started = vec![false, false];
        assert_eq!(runnable_passes(&passes, &ready, &started), vec![0]);

        let ready = vec![true, true];
        assert_eq!(runnable_passes(&passes, &ready, &started), vec![0, 1]);

        // started passes never come back
        let started = vec![true, false];
        assert_eq!(runnable_passes(&passes, &ready, &started), vec![1]);
    }

    #[test]
    fn passes_without_inputs_run_immediately() {
        let passes = passes_with_inputs(vec![vec![]]);
        assert_eq!(
            runnable_passes(&passes, &[], &[false]),
            vec![0]
        );
    }
}
