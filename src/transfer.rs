// Transfer sub-queue
//
// Uploads batches of buffers and images to the device. Host-visible
// targets are written through the map, device-local targets go
// through a staging buffer on the transfer family, with ownership
// release barriers recorded for consumers on other families. Also
// home to the synchronous capture helpers that read resources back.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::cmd::{BufferMemoryBarrier, ImageMemoryBarrier, QueueFamilyTransfer};
use crate::device::Device;
use crate::frame::FrameRequest;
use crate::graph::{
    AttachmentData, AttachmentKind, AttachmentPassData, AttachmentUse, PassData, PassKind,
    QueueData,
};
use crate::image::Image;
use crate::memory::pool::MemoryPool;
use crate::memory::AllocationUsage;
use crate::queue::QueueOperations;
use crate::sched::{Loop, LoopHandle};
use crate::sync::FenceType;
use crate::{Result, SquallError};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One upload batch.
pub struct TransferRequest {
    /// data to land in each buffer
    pub buffers: Vec<(Arc<Buffer>, Vec<u8>)>,
    /// data to land in each image, with the layout it rests in
    pub images: Vec<(Arc<Image>, Vec<u8>, vk::ImageLayout)>,
    /// the queue class that will consume the uploads. A class on a
    /// different family gets ownership release barriers.
    pub target_ops: Option<QueueOperations>,
    pub on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl TransferRequest {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            images: Vec::new(),
            target_ops: None,
            on_complete: None,
        }
    }
}

struct PendingBatch {
    buffers: Vec<(Arc<Buffer>, Vec<u8>)>,
    images: Vec<(Arc<Image>, Vec<u8>, vk::ImageLayout)>,
    target_family: Option<u32>,
    staging_pool: Arc<MemoryPool>,
}

/// The transfer sub-queue: its own single-pass compiled queue, rerun
/// per upload batch.
pub struct TransferQueue {
    tq_dev: Arc<Device>,
    tq_loop: LoopHandle,
    tq_queue: Arc<QueueData>,
    tq_pending: Arc<Mutex<VecDeque<PendingBatch>>>,
}

impl TransferQueue {
    /// Build and compile the transfer queue on a loop.
    pub fn new(gpu_loop: &Arc<Loop>) -> Arc<Self> {
        let dev = gpu_loop.device().clone();
        let handle = gpu_loop.handle();
        let pending: Arc<Mutex<VecDeque<PendingBatch>>> = Arc::new(Mutex::new(VecDeque::new()));

        let transfer_family = dev
            .queues()
            .family_index(QueueOperations::TRANSFER)
            .unwrap_or(vk::QUEUE_FAMILY_IGNORED);

        let record_pending = pending.clone();
        let queue = {
            let mut ecs_owner = lluvia::Instance::new();
            let attachment = Arc::new(AttachmentData {
                id: ecs_owner.add_entity(),
                name: "transfer-resources".to_string(),
                kind: AttachmentKind::Generic,
                factory: None,
                takes_input: false,
            });

            let pass = Arc::new(PassData {
                id: ecs_owner.add_entity(),
                name: "transfer-upload".to_string(),
                kind: PassKind::Transfer,
                attachments: vec![AttachmentPassData::new(
                    0,
                    AttachmentUse::OUTPUT,
                    vk::Format::UNDEFINED,
                )],
                subpasses: Vec::new(),
                dependencies: Vec::new(),
                layouts: Vec::new(),
                record_fn: Some(Box::new(move |cbuf, _handle| {
                    let batch = match record_pending.lock().unwrap().pop_front() {
                        Some(b) => b,
                        None => return true,
                    };
                    Self::record_batch(cbuf, batch, transfer_family)
                })),
            });

            QueueData::new(
                &mut ecs_owner,
                "transfer-queue".to_string(),
                vec![attachment],
                vec![pass],
            )
        };

        gpu_loop.compile_queue(queue.clone(), None);

        Arc::new(Self {
            tq_dev: dev,
            tq_loop: handle,
            tq_queue: queue,
            tq_pending: pending,
        })
    }

    pub fn queue_data(&self) -> &Arc<QueueData> {
        &self.tq_queue
    }

    /// Upload a batch.
    ///
    /// Backing memory is bound here: the whole batch lands in one
    /// allocation, except objects whose requirements demand their own.
    /// Host-visible targets get their bytes immediately; the rest are
    /// staged and copied by the recorded pass.
    pub fn submit(&self, mut request: TransferRequest) {
        let allocator = self.tq_dev.allocator();

        // bind memory for anything that does not have it yet
        let images: Vec<_> = request
            .images
            .iter()
            .filter(|(i, _, _)| i.memory().is_none())
            .map(|(i, _, _)| i.clone())
            .collect();
        let buffers: Vec<_> = request
            .buffers
            .iter()
            .filter(|(b, _)| b.memory().is_none())
            .map(|(b, _)| b.clone())
            .collect();
        if (!images.is_empty() || !buffers.is_empty())
            && allocator
                .emplace_objects(AllocationUsage::DeviceLocal, &images, &buffers)
                .is_none()
        {
            log::error!("transfer: failed to allocate batch memory");
            if let Some(cb) = request.on_complete.take() {
                cb(false);
            }
            return;
        }

        // host-visible buffers are written directly, no commands
        let mut staged_buffers = Vec::new();
        for (buffer, data) in request.buffers.into_iter() {
            if buffer.is_host_visible() {
                if !buffer.set_data(&data, 0) {
                    log::error!("transfer: host write failed for {} bytes", data.len());
                }
            } else {
                staged_buffers.push((buffer, data));
            }
        }

        let target_family = request.target_ops.and_then(|ops| {
            let family = self.tq_dev.queues().family_index(ops)?;
            let transfer = self.tq_dev.queues().family_index(QueueOperations::TRANSFER)?;
            if family != transfer {
                Some(family)
            } else {
                None
            }
        });

        if staged_buffers.is_empty() && request.images.is_empty() {
            // nothing left for the GPU
            if let Some(cb) = request.on_complete.take() {
                cb(true);
            }
            return;
        }

        let batch = PendingBatch {
            buffers: staged_buffers,
            images: request.images,
            target_family: target_family,
            staging_pool: MemoryPool::new(allocator.clone(), true),
        };
        self.tq_pending.lock().unwrap().push_back(batch);

        let mut frame = FrameRequest::new(self.tq_queue.clone());
        frame.on_complete = request.on_complete.take();
        self.tq_loop
            .post(crate::sched::LoopEvent::SubmitFrame(frame));
    }

    /// Record one batch: staging writes, transitions, copies, and the
    /// release half of any cross-family handoff. Runs on the worker
    /// pool inside the pass's command buffer.
    fn record_batch(
        cbuf: &mut crate::cmd::CommandBuffer,
        batch: PendingBatch,
        transfer_family: u32,
    ) -> bool {
        let pool = &batch.staging_pool;

        // everything going to the device rides one staging buffer
        let total: u64 = batch.buffers.iter().map(|(_, d)| d.len() as u64).sum::<u64>()
            + batch.images.iter().map(|(_, d, _)| d.len() as u64).sum::<u64>();
        let staging = match pool.spawn_buffer(
            AllocationUsage::HostTransitionSource,
            &BufferInfo::new(total.max(4), vk::BufferUsageFlags::TRANSFER_SRC),
        ) {
            Some(s) => s,
            None => {
                log::error!("transfer: staging allocation of {} bytes failed", total);
                return false;
            }
        };

        let mut offset = 0u64;
        let mut buffer_copies = Vec::new();
        for (buffer, data) in batch.buffers.iter() {
            if !staging.set_data(data, offset) {
                return false;
            }
            buffer_copies.push((
                buffer.clone(),
                vk::BufferCopy::builder()
                    .src_offset(offset)
                    .dst_offset(0)
                    .size(data.len() as u64)
                    .build(),
            ));
            offset = crate::align_up(offset + data.len() as u64, 64);
        }

        let mut image_copies = Vec::new();
        for (image, data, _) in batch.images.iter() {
            if !staging.set_data(data, offset) {
                return false;
            }
            let extent = image.extent();
            image_copies.push((
                image.clone(),
                vk::BufferImageCopy::builder()
                    .buffer_offset(offset)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(image.aspect())
                            .mip_level(0)
                            .base_array_layer(0)
                            .layer_count(1)
                            .build(),
                    )
                    .image_extent(extent)
                    .build(),
            ));
            offset = crate::align_up(offset + data.len() as u64, 64);
        }

        // transition every image into transfer-dst
        let to_dst: Vec<_> = batch
            .images
            .iter()
            .map(|(image, _, _)| {
                (
                    image.clone(),
                    ImageMemoryBarrier {
                        src_access: vk::AccessFlags::empty(),
                        dst_access: vk::AccessFlags::TRANSFER_WRITE,
                        old_layout: vk::ImageLayout::UNDEFINED,
                        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        family: Default::default(),
                        range: image.full_subresource_range(),
                        src_stage: vk::PipelineStageFlags::HOST,
                        dst_stage: vk::PipelineStageFlags::TRANSFER,
                    },
                )
            })
            .collect();
        cbuf.cmd_pipeline_barrier(&[], &to_dst);

        for (buffer, copy) in buffer_copies.into_iter() {
            cbuf.cmd_copy_buffer(&staging, &buffer, &[copy]);
        }
        for (image, copy) in image_copies.into_iter() {
            cbuf.cmd_copy_buffer_to_image(
                &staging,
                &image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        // move images to their resting layout, releasing ownership to
        // the consumer family when one was named
        let family = batch
            .target_family
            .map(|dst| QueueFamilyTransfer::new(transfer_family, dst))
            .unwrap_or_default();

        let to_final: Vec<_> = batch
            .images
            .iter()
            .map(|(image, _, layout)| {
                let barrier = ImageMemoryBarrier {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: *layout,
                    family: family,
                    range: image.full_subresource_range(),
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                };
                if batch.target_family.is_some() {
                    // the acquire half waits on the consumer
                    image.set_pending_barrier(barrier.clone());
                }
                (image.clone(), barrier)
            })
            .collect();
        cbuf.cmd_pipeline_barrier(&[], &to_final);

        if batch.target_family.is_some() {
            for (buffer, _) in batch.buffers.iter() {
                let barrier = BufferMemoryBarrier {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                    family: family,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::VERTEX_SHADER,
                };
                buffer.set_pending_barrier(barrier.clone());
                cbuf.cmd_pipeline_barrier(&[(buffer.clone(), barrier)], &[]);
            }
        }

        // the staging pool lives as long as the command buffer
        cbuf.retain(Box::new(pool.clone()));
        true
    }
}

/// Synchronously read a buffer back from the device.
///
/// Allocates a host-cached staging buffer, copies on the transfer
/// family, blocks on the fence, then hands the bytes to `cb`. This
/// must never be called from the loop thread.
pub fn capture_buffer(
    dev: &Arc<Device>,
    buffer: &Arc<Buffer>,
    cb: Box<dyn FnOnce(&[u8]) + Send>,
) -> Result<()> {
    let staging = dev
        .allocator()
        .spawn_persistent_buffer(
            AllocationUsage::HostTransitionDestination,
            &BufferInfo::new(buffer.size(), vk::BufferUsageFlags::TRANSFER_DST),
            None,
        )
        .ok_or(SquallError::ALLOCATION_FAILED)?;

    let queue = dev
        .queues()
        .try_acquire_queue_sync(QueueOperations::TRANSFER, true)
        .ok_or(SquallError::NO_QUEUE)?;
    let pool = dev
        .acquire_command_pool(QueueOperations::TRANSFER)
        .ok_or(SquallError::NO_QUEUE)?;

    let copy_size = buffer.size();
    let cbuf = pool
        .record_buffer(
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            vk::CommandBufferLevel::PRIMARY,
            |cbuf| {
                cbuf.cmd_copy_buffer(
                    buffer,
                    &staging,
                    &[vk::BufferCopy::builder().size(copy_size).build()],
                );
                cbuf.cmd_pipeline_barrier(
                    &[(
                        staging.clone(),
                        BufferMemoryBarrier {
                            src_access: vk::AccessFlags::TRANSFER_WRITE,
                            dst_access: vk::AccessFlags::HOST_READ,
                            family: Default::default(),
                            offset: 0,
                            size: vk::WHOLE_SIZE,
                            src_stage: vk::PipelineStageFlags::TRANSFER,
                            dst_stage: vk::PipelineStageFlags::HOST,
                        },
                    )],
                    &[],
                );
                true
            },
        )
        .ok_or(SquallError::INVALID)?;

    let fence = dev
        .create_fence(FenceType::Default)
        .ok_or(SquallError::INVALID)?;
    let sync = crate::queue::FrameSync::new();
    queue.submit(sync, &fence, &[cbuf.vkhandle()], dev.submit_idle_flags)?;
    dev.queues().release_queue(queue);

    // block until the copy lands
    fence.check(false);

    let mut bytes = vec![0u8; buffer.size() as usize];
    if !staging.get_data(0, &mut bytes) {
        return Err(SquallError::INVALID);
    }
    cb(&bytes);

    pool.reset(true);
    dev.queues().release_command_pool(pool);
    Ok(())
}

/// Synchronously read an image back from the device as tightly packed
/// pixels.
pub fn capture_image(
    dev: &Arc<Device>,
    image: &Arc<Image>,
    bytes_per_pixel: u64,
    cb: Box<dyn FnOnce(&[u8]) + Send>,
) -> Result<()> {
    let extent = image.extent();
    let size = extent.width as u64 * extent.height as u64 * bytes_per_pixel;
    let staging = dev
        .allocator()
        .spawn_persistent_buffer(
            AllocationUsage::HostTransitionDestination,
            &BufferInfo::new(size, vk::BufferUsageFlags::TRANSFER_DST),
            None,
        )
        .ok_or(SquallError::ALLOCATION_FAILED)?;

    let queue = dev
        .queues()
        .try_acquire_queue_sync(QueueOperations::TRANSFER, true)
        .ok_or(SquallError::NO_QUEUE)?;
    let pool = dev
        .acquire_command_pool(QueueOperations::TRANSFER)
        .ok_or(SquallError::NO_QUEUE)?;

    let old_layout = image.layout();
    let cbuf = pool
        .record_buffer(
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            vk::CommandBufferLevel::PRIMARY,
            |cbuf| {
                cbuf.cmd_pipeline_barrier(
                    &[],
                    &[(
                        image.clone(),
                        ImageMemoryBarrier {
                            src_access: vk::AccessFlags::MEMORY_WRITE,
                            dst_access: vk::AccessFlags::TRANSFER_READ,
                            old_layout: old_layout,
                            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            family: Default::default(),
                            range: image.full_subresource_range(),
                            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                            dst_stage: vk::PipelineStageFlags::TRANSFER,
                        },
                    )],
                );

                cbuf.cmd_copy_image_to_buffer(
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    &staging,
                    &[vk::BufferImageCopy::builder()
                        .buffer_offset(0)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(
                            vk::ImageSubresourceLayers::builder()
                                .aspect_mask(image.aspect())
                                .mip_level(0)
                                .base_array_layer(0)
                                .layer_count(1)
                                .build(),
                        )
                        .image_extent(extent)
                        .build()],
                );

                cbuf.cmd_pipeline_barrier(
                    &[],
                    &[(
                        image.clone(),
                        ImageMemoryBarrier {
                            src_access: vk::AccessFlags::TRANSFER_READ,
                            dst_access: vk::AccessFlags::MEMORY_READ,
                            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            new_layout: old_layout,
                            family: Default::default(),
                            range: image.full_subresource_range(),
                            src_stage: vk::PipelineStageFlags::TRANSFER,
                            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                        },
                    )],
                );
                true
            },
        )
        .ok_or(SquallError::INVALID)?;

    let fence = dev
        .create_fence(FenceType::Default)
        .ok_or(SquallError::INVALID)?;
    queue.submit(
        crate::queue::FrameSync::new(),
        &fence,
        &[cbuf.vkhandle()],
        dev.submit_idle_flags,
    )?;
    dev.queues().release_queue(queue);

    fence.check(false);

    let mut bytes = vec![0u8; size as usize];
    if !staging.get_data(0, &mut bytes) {
        return Err(SquallError::INVALID);
    }
    cb(&bytes);

    pool.reset(true);
    dev.queues().release_command_pool(pool);
    Ok(())
}
