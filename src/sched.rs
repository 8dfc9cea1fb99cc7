// The frame loop
//
// One dedicated thread owns all frame state and dispatches a message
// enum over a channel: frame submissions, fence polls, queue
// compilations and posted closures all arrive as events. A small
// worker pool runs compute-bound tasks (recording, factories, shader
// compilation) and posts results back as more events.
//
// Austin Shafer - 2024

use ash::vk;
use ash::vk::Handle;
use lluvia as ll;

use crate::device::Device;
use crate::frame::{FrameHandle, FrameRequest};
use crate::graph::QueueData;
use crate::image::ImageView;
use crate::renderpass::RenderPass;
use crate::sync::{DependencyEvent, Fence, FenceType};
use crate::{CreateInfo, Result, SquallError};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// A compiled VkFramebuffer.
pub struct Framebuffer {
    fb_dev: ash::Device,
    fb: vk::Framebuffer,
    fb_extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn vkhandle(&self) -> vk::Framebuffer {
        self.fb
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.fb_extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.fb_dev.destroy_framebuffer(self.fb, None);
        }
    }
}

struct CacheEntry {
    framebuffer: Arc<Framebuffer>,
    /// weak refs so dead views evict the entry
    views: Vec<Weak<ImageView>>,
}

/// Memoizes framebuffers by (render pass, view identity). Entries
/// whose views have been destroyed are dropped on the next lookup.
pub struct FrameCache {
    fc_cache: Mutex<HashMap<(u64, Vec<u64>), CacheEntry>>,
}

impl FrameCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fc_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_framebuffer(
        &self,
        dev: &Arc<Device>,
        pass: &Arc<RenderPass>,
        alt: bool,
        views: &[Arc<ImageView>],
        extent: vk::Extent2D,
    ) -> Result<Arc<Framebuffer>> {
        let mut cache = self.fc_cache.lock().unwrap();
        cache.retain(|_, entry| entry.views.iter().all(|v| v.upgrade().is_some()));

        let key = (
            pass.vkhandle(alt).as_raw(),
            views.iter().map(|v| v.vkhandle().as_raw()).collect::<Vec<_>>(),
        );
        if let Some(entry) = cache.get(&key) {
            return Ok(entry.framebuffer.clone());
        }

        let attachments: Vec<_> = views.iter().map(|v| v.vkhandle()).collect();
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass.vkhandle(alt))
            .attachments(attachments.as_slice())
            .width(extent.width)
            .height(extent.height)
            .layers(1)
            .build();

        let fb = unsafe {
            dev.vkdev()
                .create_framebuffer(&info, None)
                .or(Err(SquallError::INVALID))?
        };

        let framebuffer = Arc::new(Framebuffer {
            fb_dev: dev.vkdev().clone(),
            fb: fb,
            fb_extent: extent,
        });
        cache.insert(
            key,
            CacheEntry {
                framebuffer: framebuffer.clone(),
                views: views.iter().map(|v| Arc::downgrade(v)).collect(),
            },
        );
        Ok(framebuffer)
    }

    /// Drop every framebuffer built against a render pass, used when
    /// a compiled queue is destroyed.
    pub fn remove_pass(&self, pass: &RenderPass) {
        let main = pass.vkhandle(false).as_raw();
        let alt = pass.vkhandle(true).as_raw();
        self.fc_cache
            .lock()
            .unwrap()
            .retain(|(rp, _), _| *rp != main && *rp != alt);
    }

    pub fn clear(&self) {
        self.fc_cache.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.fc_cache.lock().unwrap().len()
    }
}

type WorkerTask = Box<dyn FnOnce() + Send>;

struct WorkerShared {
    tasks: Mutex<VecDeque<WorkerTask>>,
    cond: Condvar,
    running: AtomicBool,
}

/// A fixed pool of worker threads for compute-bound tasks. Tasks must
/// route vulkan calls through `Device::make_api_call`.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(count: usize) -> Arc<Self> {
        let shared = Arc::new(WorkerShared {
            tasks: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let threads = (0..count.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("squall-worker-{}", i))
                    .spawn(move || {
                        loop {
                            let task = {
                                let mut tasks = shared.tasks.lock().unwrap();
                                loop {
                                    if let Some(t) = tasks.pop_front() {
                                        break Some(t);
                                    }
                                    if !shared.running.load(Ordering::Acquire) {
                                        break None;
                                    }
                                    tasks = shared.cond.wait(tasks).unwrap();
                                }
                            };
                            match task {
                                Some(t) => t(),
                                None => return,
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();

        Arc::new(Self {
            shared: shared,
            threads: Mutex::new(threads),
        })
    }

    pub fn post(&self, task: WorkerTask) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.tasks.lock().unwrap().push_back(task);
        self.shared.cond.notify_one();
    }

    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        let threads = std::mem::replace(&mut *self.threads.lock().unwrap(), Vec::new());
        for t in threads.into_iter() {
            let _ = t.join();
        }
    }
}

/// The messages the loop thread dispatches on.
pub enum LoopEvent {
    /// run a frame of a compiled queue
    SubmitFrame(FrameRequest),
    /// poll every scheduled fence
    CheckFences,
    /// compile a queue's artifacts, then report
    CompileQueue(Arc<QueueData>, Option<Box<dyn FnOnce(bool) + Send>>),
    /// a closure to run with the loop state
    Perform(Box<dyn FnOnce(&mut LoopState) + Send>),
    /// signal dependency events with a success bit
    SignalDependencies(Vec<Arc<DependencyEvent>>, bool),
    Shutdown,
}

/// Cloneable posting handle into the loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::Sender<LoopEvent>,
    workers: Arc<WorkerPool>,
}

impl LoopHandle {
    pub fn post(&self, ev: LoopEvent) {
        if self.tx.send(ev).is_err() {
            log::debug!("loop is gone, event dropped");
        }
    }

    /// Run a closure on the loop thread.
    pub fn perform(&self, f: Box<dyn FnOnce(&mut LoopState) + Send>) {
        self.post(LoopEvent::Perform(f));
    }

    /// Run a compute task on the worker pool.
    pub fn perform_in_queue(&self, f: Box<dyn FnOnce() + Send>) {
        self.workers.post(f);
    }
}

/// The loop thread's state. Only the dispatch thread touches this.
pub struct LoopState {
    device: Arc<Device>,
    handle: LoopHandle,
    cache: Arc<FrameCache>,
    ecs: ll::Instance,
    running: bool,
    next_frame_id: u64,
    frames: HashMap<u64, Arc<FrameHandle>>,
    fence_pools: HashMap<FenceType, Vec<Arc<Fence>>>,
    scheduled_fences: Vec<Arc<Fence>>,
    armed_fences: Arc<AtomicUsize>,
    exported_fds: Vec<(i32, Arc<Fence>)>,
}

impl LoopState {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn frame_cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    pub fn ecs(&mut self) -> &mut ll::Instance {
        &mut self.ecs
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Pull a fence from the pool for its type, or create one.
    pub fn acquire_fence(&mut self, fence_type: FenceType) -> Option<Arc<Fence>> {
        let fence = self
            .fence_pools
            .entry(fence_type)
            .or_insert_with(Vec::new)
            .pop()
            .or_else(|| self.device.create_fence(fence_type))?;

        // when this arming retires, come back to the pool
        let handle = self.handle.clone();
        let pool_fence = fence.clone();
        fence.set_release_fn(Box::new(move || {
            handle.perform(Box::new(move |state| {
                state.release_fence(pool_fence);
            }));
        }));
        Some(fence)
    }

    pub fn release_fence(&mut self, fence: Arc<Fence>) {
        self.fence_pools
            .entry(fence.fence_type())
            .or_insert_with(Vec::new)
            .push(fence);
    }

    /// Register an armed fence with the poll timer.
    ///
    /// When external fence sync is on, the fence is also exported as
    /// a sync fd for the platform's event loop to wait on; the poll
    /// timer still runs as the retirement authority.
    pub fn schedule_fence(&mut self, fence: Arc<Fence>) {
        if let Some(fd) = self.device.export_fence_sync_fd(&fence) {
            self.exported_fds.push((fd, fence.clone()));
        }
        self.armed_fences.fetch_add(1, Ordering::SeqCst);
        self.scheduled_fences.push(fence);
    }

    /// Drain the sync fds exported since the last call. The platform
    /// event loop polls these and posts CheckFences when they fire.
    pub fn take_exported_fence_fds(&mut self) -> Vec<(i32, Arc<Fence>)> {
        std::mem::replace(&mut self.exported_fds, Vec::new())
    }

    pub(crate) fn retire_frame(&mut self, frame_id: u64) {
        self.frames.remove(&frame_id);
    }

    fn check_fences(&mut self) {
        let mut still_armed = Vec::new();
        let fences = std::mem::replace(&mut self.scheduled_fences, Vec::new());
        for fence in fences.into_iter() {
            if fence.check(true) {
                self.armed_fences.fetch_sub(1, Ordering::SeqCst);
            } else {
                still_armed.push(fence);
            }
        }
        self.scheduled_fences = still_armed;
    }

    fn submit_frame(&mut self, request: FrameRequest) {
        if !self.running {
            return;
        }

        // frames against an uncompiled queue wait for the compiler
        if !request.queue.is_compiled() {
            let handle = self.handle.clone();
            let queue = request.queue.clone();
            let request = Mutex::new(Some(request));
            queue.on_compiled(Box::new(move |success| {
                if let Some(req) = request.lock().unwrap().take() {
                    if success {
                        handle.post(LoopEvent::SubmitFrame(req));
                    } else if let Some(cb) = req.on_complete {
                        cb(false);
                    }
                }
            }));
            return;
        }

        let id = self.next_frame_id;
        self.next_frame_id += 1;

        let wait_events = request.wait_events.clone();
        let mut input = HashMap::new();
        let mut request = request;
        std::mem::swap(&mut input, &mut request.input);

        let frame = FrameHandle::new(
            id,
            self.device.clone(),
            self.handle.clone(),
            self.cache.clone(),
            request,
        );
        self.frames.insert(id, frame.clone());

        // hold the start until the frame's dependencies have signaled
        let handle = self.handle.clone();
        DependencyEvent::wait_for_all(
            &wait_events,
            Box::new(move |success| {
                handle.perform(Box::new(move |_state| {
                    if success {
                        frame.start(input);
                    } else {
                        frame.invalidate();
                    }
                }));
            }),
        );
    }

    fn compile_queue(&mut self, queue: Arc<QueueData>, cb: Option<Box<dyn FnOnce(bool) + Send>>) {
        let device = self.device.clone();
        let cache = self.cache.clone();
        let workers = self.handle.workers.clone();
        crate::compiler::RenderQueueCompiler::compile(
            device,
            workers,
            cache,
            queue,
            Box::new(move |success| {
                if let Some(cb) = cb {
                    cb(success);
                }
            }),
        );
    }

    /// Drain everything for shutdown: wait for the device, retire all
    /// fences, invalidate frames.
    fn drain(&mut self) {
        self.running = false;
        self.device.wait_idle();

        let fences = std::mem::replace(&mut self.scheduled_fences, Vec::new());
        for fence in fences.into_iter() {
            fence.check(false);
            self.armed_fences.fetch_sub(1, Ordering::SeqCst);
        }

        let frames = std::mem::replace(&mut self.frames, HashMap::new());
        for (_, frame) in frames.into_iter() {
            frame.invalidate();
        }

        self.cache.clear();
        self.fence_pools.clear();
    }
}

/// The runtime's top level: owns the Device, the dispatch thread and
/// the fence poll timer.
pub struct Loop {
    l_dev: Arc<Device>,
    l_handle: LoopHandle,
    l_workers: Arc<WorkerPool>,
    l_thread: Mutex<Option<thread::JoinHandle<()>>>,
    l_timer: Mutex<Option<thread::JoinHandle<()>>>,
    l_running: Arc<AtomicBool>,
}

impl Loop {
    pub fn new(device: Arc<Device>, info: &CreateInfo) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<LoopEvent>();
        let workers = WorkerPool::new(
            thread::available_parallelism()
                .map(|n| n.get().saturating_sub(2).max(2))
                .unwrap_or(2),
        );
        let armed_fences = Arc::new(AtomicUsize::new(0));

        let handle = LoopHandle {
            tx: tx,
            workers: workers.clone(),
        };

        let running = Arc::new(AtomicBool::new(true));

        // the dispatch thread: everything frame-related happens here
        let mut state = LoopState {
            device: device.clone(),
            handle: handle.clone(),
            cache: FrameCache::new(),
            ecs: ll::Instance::new(),
            running: true,
            next_frame_id: 1,
            frames: HashMap::new(),
            fence_pools: HashMap::new(),
            scheduled_fences: Vec::new(),
            armed_fences: armed_fences.clone(),
            exported_fds: Vec::new(),
        };
        let loop_thread = thread::Builder::new()
            .name("squall-loop".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    match event {
                        LoopEvent::SubmitFrame(request) => state.submit_frame(request),
                        LoopEvent::CheckFences => state.check_fences(),
                        LoopEvent::CompileQueue(queue, cb) => state.compile_queue(queue, cb),
                        LoopEvent::Perform(f) => f(&mut state),
                        LoopEvent::SignalDependencies(events, success) => {
                            for e in events.iter() {
                                e.signal(success);
                            }
                        }
                        LoopEvent::Shutdown => {
                            state.drain();
                            return;
                        }
                    }
                }
            })
            .unwrap();

        // the fence timer: posts poll events while any fence is armed
        let timer_handle = handle.clone();
        let timer_running = running.clone();
        let timer_armed = armed_fences;
        let interval = Duration::from_micros(info.scheduler_interval_us.max(1));
        let timer_thread = thread::Builder::new()
            .name("squall-fence-timer".to_string())
            .spawn(move || {
                while timer_running.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if timer_armed.load(Ordering::SeqCst) > 0 {
                        timer_handle.post(LoopEvent::CheckFences);
                    }
                }
            })
            .unwrap();

        Arc::new(Self {
            l_dev: device,
            l_handle: handle,
            l_workers: workers,
            l_thread: Mutex::new(Some(loop_thread)),
            l_timer: Mutex::new(Some(timer_thread)),
            l_running: running,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.l_dev
    }

    pub fn handle(&self) -> LoopHandle {
        self.l_handle.clone()
    }

    /// Queue a frame for execution.
    pub fn submit_frame(&self, request: FrameRequest) {
        self.l_handle.post(LoopEvent::SubmitFrame(request));
    }

    /// Compile a queue's GPU artifacts, invoking `cb` when done.
    pub fn compile_queue(&self, queue: Arc<QueueData>, cb: Option<Box<dyn FnOnce(bool) + Send>>) {
        self.l_handle.post(LoopEvent::CompileQueue(queue, cb));
    }

    /// Run `cb` on the loop thread once all events have signaled.
    pub fn wait_for_dependencies(
        &self,
        events: Vec<Arc<DependencyEvent>>,
        cb: Box<dyn FnOnce(bool) + Send>,
    ) {
        let handle = self.l_handle.clone();
        DependencyEvent::wait_for_all(
            &events,
            Box::new(move |success| {
                handle.perform(Box::new(move |_state| cb(success)));
            }),
        );
    }

    /// Signal a batch of dependency events.
    pub fn signal_dependencies(&self, events: Vec<Arc<DependencyEvent>>, success: bool) {
        self.l_handle
            .post(LoopEvent::SignalDependencies(events, success));
    }

    /// Stop the loop: drains fences, invalidates frames, joins the
    /// threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.l_running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.l_handle.post(LoopEvent::Shutdown);
        if let Some(t) = self.l_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        if let Some(t) = self.l_timer.lock().unwrap().take() {
            let _ = t.join();
        }
        self.l_workers.shutdown();
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
