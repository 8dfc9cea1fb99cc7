// Device queues and queue families
//
// Each logical queue family keeps a free list of queues, a stash of
// pre-warmed command pools and a wait queue of acquirers. A queue is
// owned by exactly one frame between acquire and release.
//
// Austin Shafer - 2024

use ash::vk;

use crate::cmd::CommandPool;
use crate::image::Image;
use crate::sync::{Fence, Semaphore};
use crate::{Result, SquallError};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

bitflags! {
    /// The operation classes a queue family can serve. PRESENT is
    /// ours, the rest mirror VkQueueFlags.
    pub struct QueueOperations: u32 {
        const GRAPHICS = 1;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PROTECTED = 1 << 4;
        const PRESENT = 1 << 5;
    }
}

impl QueueOperations {
    pub fn from_vk(flags: vk::QueueFlags) -> Self {
        let mut ret = QueueOperations::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            ret |= QueueOperations::GRAPHICS;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            ret |= QueueOperations::COMPUTE;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            ret |= QueueOperations::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::SPARSE_BINDING) {
            ret |= QueueOperations::SPARSE_BINDING;
        }
        if flags.contains(vk::QueueFlags::PROTECTED) {
            ret |= QueueOperations::PROTECTED;
        }
        ret
    }
}

bitflags! {
    /// Extra wait-idle calls around a submission. Portability drivers
    /// need POST_QUEUE to quiet validation false positives.
    pub struct IdleFlags: u32 {
        const PRE_QUEUE = 1;
        const PRE_DEVICE = 1 << 1;
        const POST_QUEUE = 1 << 2;
        const POST_DEVICE = 1 << 3;
    }
}

/// The synchronization package for one submission.
pub struct FrameSync {
    /// semaphores to wait on, with their stages. Semaphores already
    /// consumed by an earlier submit are skipped.
    pub wait: Vec<(Arc<Semaphore>, vk::PipelineStageFlags)>,
    /// semaphores this submission signals
    pub signal: Vec<Arc<Semaphore>>,
    /// image layout bookkeeping applied once the submit succeeds
    pub images: Vec<(Arc<Image>, vk::ImageLayout)>,
    /// semaphores handed back somewhere (usually a swapchain pool)
    /// when the fence retires
    pub recycle: Vec<(Arc<Semaphore>, Box<dyn FnOnce(Arc<Semaphore>) + Send>)>,
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            wait: Vec::new(),
            signal: Vec::new(),
            images: Vec::new(),
            recycle: Vec::new(),
        }
    }
}

/// One VkQueue handed out to frames.
pub struct DeviceQueue {
    q_dev: ash::Device,
    q_queue: vk::Queue,
    q_family: u32,
    q_ops: QueueOperations,
    /// fences currently in flight on this queue
    q_nfences: AtomicU32,
    /// the frame that owns us right now
    q_owner: Mutex<Option<u64>>,
}

impl DeviceQueue {
    pub(crate) fn new(
        dev: &ash::Device,
        queue: vk::Queue,
        family: u32,
        ops: QueueOperations,
    ) -> Arc<Self> {
        Arc::new(Self {
            q_dev: dev.clone(),
            q_queue: queue,
            q_family: family,
            q_ops: ops,
            q_nfences: AtomicU32::new(0),
            q_owner: Mutex::new(None),
        })
    }

    pub fn vkhandle(&self) -> vk::Queue {
        self.q_queue
    }

    pub fn family(&self) -> u32 {
        self.q_family
    }

    pub fn ops(&self) -> QueueOperations {
        self.q_ops
    }

    pub fn set_owner(&self, frame: u64) {
        *self.q_owner.lock().unwrap() = Some(frame);
    }

    pub fn owner(&self) -> Option<u64> {
        *self.q_owner.lock().unwrap()
    }

    pub(crate) fn reset(&self) {
        *self.q_owner.lock().unwrap() = None;
    }

    pub fn retain_fence(&self) {
        self.q_nfences.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_fence(&self) {
        self.q_nfences.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_fences(&self) -> u32 {
        self.q_nfences.load(Ordering::SeqCst)
    }

    pub fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.q_dev.queue_wait_idle(self.q_queue) {
                log::error!("vkQueueWaitIdle failed: {:?}", e);
            }
        }
    }

    /// Submit command buffers with the frame's sync package.
    ///
    /// Wait semaphores that were already consumed are dropped from the
    /// submission. On success the semaphore flags roll forward, the
    /// fence is armed against this queue, recycle entries are chained
    /// onto the fence, and the declared image layouts are applied.
    pub fn submit(
        self: &Arc<Self>,
        sync: FrameSync,
        fence: &Arc<Fence>,
        cbufs: &[vk::CommandBuffer],
        idle: IdleFlags,
    ) -> Result<()> {
        let mut wait_semas = Vec::with_capacity(sync.wait.len());
        let mut wait_stages = Vec::with_capacity(sync.wait.len());
        let mut waits = Vec::with_capacity(sync.wait.len());
        for (sem, stage) in sync.wait.iter() {
            if sem.is_waited() {
                continue;
            }
            wait_semas.push(sem.vkhandle());
            wait_stages.push(*stage);
            waits.push(sem.clone());
        }

        let signal_semas: Vec<_> = sync.signal.iter().map(|s| s.vkhandle()).collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semas.as_slice())
            .wait_dst_stage_mask(wait_stages.as_slice())
            .command_buffers(cbufs)
            .signal_semaphores(signal_semas.as_slice())
            .build();

        unsafe {
            if idle.contains(IdleFlags::PRE_DEVICE) {
                let _ = self.q_dev.device_wait_idle();
            }
            if idle.contains(IdleFlags::PRE_QUEUE) {
                let _ = self.q_dev.queue_wait_idle(self.q_queue);
            }

            if let Err(e) = self
                .q_dev
                .queue_submit(self.q_queue, &[submit_info], fence.vkhandle())
            {
                log::error!("vkQueueSubmit failed: {:?}", e);
                return Err(SquallError::from_vk(e).unwrap_or(SquallError::INVALID));
            }

            if idle.contains(IdleFlags::POST_QUEUE) {
                let _ = self.q_dev.queue_wait_idle(self.q_queue);
            }
            if idle.contains(IdleFlags::POST_DEVICE) {
                let _ = self.q_dev.device_wait_idle();
            }
        }

        for sem in waits.iter() {
            sem.mark_waited();
        }
        for sem in sync.signal.iter() {
            sem.mark_signaled();
            sem.set_in_use(true);

            let sem = sem.clone();
            let timeline = sem.timeline();
            fence.add_release(
                Box::new(move |_success| {
                    // a reset in between means this use is stale
                    if sem.timeline() == timeline {
                        sem.set_in_use(false);
                    }
                }),
                None,
                "semaphore-in-use",
            );
        }
        for (sem, return_fn) in sync.recycle.into_iter() {
            fence.add_release(
                Box::new(move |_success| {
                    return_fn(sem);
                }),
                None,
                "semaphore-recycle",
            );
        }

        fence.set_armed(Some(self.clone()));

        for (image, layout) in sync.images.iter() {
            image.set_layout(*layout);
        }

        Ok(())
    }
}

/// An entry in a family's wait queue.
pub struct Waiter {
    pub acquire: Box<dyn FnOnce(Arc<DeviceQueue>) + Send>,
    pub invalidate: Box<dyn FnOnce() + Send>,
    /// is the frame/loop that queued this still alive
    pub is_valid: Box<dyn Fn() -> bool + Send>,
}

/// One queue family's worth of scheduling state.
pub struct DeviceQueueFamily {
    pub index: u32,
    pub count: u32,
    /// the class this family is the designated provider for
    pub preferred: QueueOperations,
    pub ops: QueueOperations,
    pub transfer_granularity: vk::Extent3D,
    pub(crate) queues: Vec<Arc<DeviceQueue>>,
    pub(crate) pools: Vec<Arc<CommandPool>>,
    pub(crate) waiters: VecDeque<Waiter>,
}

struct QueueSetInternal {
    families: Vec<DeviceQueueFamily>,
    /// callers blocked in try_acquire_queue_sync
    sync_waiters: u32,
}

/// The device's collection of queue families, behind one lock.
pub struct QueueSet {
    internal: Mutex<QueueSetInternal>,
    cond: Condvar,
}

impl QueueSet {
    pub(crate) fn new(families: Vec<DeviceQueueFamily>) -> Self {
        Self {
            internal: Mutex::new(QueueSetInternal {
                families: families,
                sync_waiters: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn family_pos(families: &[DeviceQueueFamily], ops: QueueOperations) -> Option<usize> {
        families
            .iter()
            .position(|f| f.preferred == ops)
            .or_else(|| families.iter().position(|f| f.ops.contains(ops)))
    }

    /// Look up family info without touching the free lists.
    pub fn family_info(&self, ops: QueueOperations) -> Option<(u32, QueueOperations, vk::Extent3D)> {
        let internal = self.internal.lock().unwrap();
        Self::family_pos(&internal.families, ops)
            .map(|i| {
                let f = &internal.families[i];
                (f.index, f.ops, f.transfer_granularity)
            })
    }

    pub fn family_index(&self, ops: QueueOperations) -> Option<u32> {
        self.family_info(ops).map(|(idx, _, _)| idx)
    }

    /// Asynchronous acquisition: if a queue is free the callback runs
    /// immediately, otherwise the waiter is queued on the family.
    ///
    /// Returns false only when no family serves `ops` at all.
    pub fn acquire_queue(&self, ops: QueueOperations, frame: u64, waiter: Waiter) -> bool {
        let queue = {
            let mut internal = self.internal.lock().unwrap();
            let pos = match Self::family_pos(&internal.families, ops) {
                Some(p) => p,
                None => return false,
            };
            let family = &mut internal.families[pos];

            match family.queues.pop() {
                Some(q) => Some(q),
                None => {
                    log::debug!(
                        "acquire_queue: family {} exhausted, queuing waiter",
                        family.index
                    );
                    family.waiters.push_back(waiter);
                    return true;
                }
            }
        };

        if let Some(queue) = queue {
            queue.set_owner(frame);
            (waiter.acquire)(queue);
        }
        true
    }

    /// Synchronous acquisition for loop-side code. With `block` this
    /// parks the thread on the family condvar until a queue frees up.
    pub fn try_acquire_queue_sync(
        &self,
        ops: QueueOperations,
        block: bool,
    ) -> Option<Arc<DeviceQueue>> {
        let mut internal = self.internal.lock().unwrap();
        let pos = Self::family_pos(&internal.families, ops)?;

        if block {
            internal.sync_waiters += 1;
            while internal.families[pos].queues.is_empty() {
                internal = self.cond.wait(internal).unwrap();
            }
            internal.sync_waiters -= 1;
        }

        internal.families[pos].queues.pop()
    }

    /// Return a queue. Synchronous waiters get first claim, then the
    /// oldest still-valid asynchronous waiter, then the free list.
    pub fn release_queue(&self, queue: Arc<DeviceQueue>) {
        queue.reset();

        loop {
            let (waiter, queue_back) = {
                let mut internal = self.internal.lock().unwrap();
                let pos = match internal
                    .families
                    .iter()
                    .position(|f| f.index == queue.family())
                {
                    Some(p) => p,
                    None => return,
                };

                if internal.sync_waiters > 0 {
                    internal.families[pos].queues.push(queue);
                    self.cond.notify_one();
                    return;
                }

                match internal.families[pos].waiters.pop_front() {
                    Some(w) => (Some(w), None),
                    None => (None, Some(pos)),
                }
            };

            match (waiter, queue_back) {
                (Some(w), _) => {
                    if (w.is_valid)() {
                        (w.acquire)(queue);
                        return;
                    }
                    // dead waiter: tell it and try the next one
                    (w.invalidate)();
                    continue;
                }
                (None, Some(pos)) => {
                    let mut internal = self.internal.lock().unwrap();
                    internal.families[pos].queues.push(queue);
                    return;
                }
                _ => return,
            }
        }
    }

    /// Grab a pre-warmed command pool for a family, or have `make`
    /// build a fresh one.
    pub fn acquire_command_pool<F>(&self, ops: QueueOperations, make: F) -> Option<Arc<CommandPool>>
    where
        F: FnOnce(u32, QueueOperations) -> Option<Arc<CommandPool>>,
    {
        let (index, family_ops) = {
            let mut internal = self.internal.lock().unwrap();
            let pos = Self::family_pos(&internal.families, ops)?;
            let family = &mut internal.families[pos];
            if let Some(pool) = family.pools.pop() {
                return Some(pool);
            }
            (family.index, family.ops)
        };
        make(index, family_ops)
    }

    /// Return a command pool to its family's stash. The pool must be
    /// reset by the caller first.
    pub fn release_command_pool(&self, pool: Arc<CommandPool>) {
        let mut internal = self.internal.lock().unwrap();
        if let Some(family) = internal
            .families
            .iter_mut()
            .find(|f| f.index == pool.family())
        {
            family.pools.push(pool);
        }
    }

    /// Number of free queues plus queued waiters per family, for
    /// diagnostics and tests.
    pub fn free_queue_count(&self, ops: QueueOperations) -> Option<usize> {
        let internal = self.internal.lock().unwrap();
        Self::family_pos(&internal.families, ops)
            .map(|i| internal.families[i].queues.len())
    }

    /// Drain everything at teardown, invalidating waiters.
    pub fn invalidate(&self) {
        let waiters = {
            let mut internal = self.internal.lock().unwrap();
            let mut ret = Vec::new();
            for family in internal.families.iter_mut() {
                while let Some(w) = family.waiters.pop_front() {
                    ret.push(w);
                }
                family.queues.clear();
                for pool in family.pools.drain(..) {
                    pool.invalidate();
                }
            }
            ret
        };

        for w in waiters.into_iter() {
            (w.invalidate)();
        }
    }
}
