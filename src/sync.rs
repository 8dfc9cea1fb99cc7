// Synchronization primitives
//
// Fences bridge GPU completion back to the runtime: they carry the
// release callbacks that retire frame resources. Semaphores order
// GPU work and track their own reusability. DependencyEvents are the
// one-shot latches that order frames against each other.
//
// Austin Shafer - 2024

use ash::vk;

use crate::queue::DeviceQueue;
use crate::{current_time_us, Droppable, FENCE_BROKEN_THRESHOLD_US};

use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FenceState {
    Disabled,
    Armed,
    Signaled,
}

/// Which pool a fence returns to when it retires.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FenceType {
    Default,
    Swapchain,
}

/// A release callback entry: the closure, anything it needs kept
/// alive, and a tag for diagnostics.
struct ReleaseHandle {
    callback: Box<dyn FnOnce(bool) + Send>,
    _held: Option<Box<dyn Droppable + Send + Sync>>,
    tag: &'static str,
}

struct FenceInternal {
    state: FenceState,
    armed_time_us: u64,
    /// the one-shot blocking recovery wait has been issued
    recovery_attempted: bool,
    frame: u64,
    release: Vec<ReleaseHandle>,
    autorelease: Vec<Box<dyn Droppable + Send + Sync>>,
    queue: Option<Arc<DeviceQueue>>,
    /// fired after the release list, used by the Loop to pool us
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

/// A GPU-to-CPU completion fence.
pub struct Fence {
    f_dev: ash::Device,
    f_fence: vk::Fence,
    f_type: FenceType,
    f_internal: Mutex<FenceInternal>,
}

impl Fence {
    /// Create a fence. `exportable` chains the external-fence info so
    /// the fence can later be exported as a sync fd.
    pub fn new(dev: &ash::Device, fence_type: FenceType, exportable: bool) -> Option<Self> {
        let mut export_info = vk::ExportFenceCreateInfo::builder()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();
        let mut info = vk::FenceCreateInfo::builder().build();
        if exportable {
            info.p_next = &mut export_info as *mut _ as *const std::os::raw::c_void;
        }

        let fence = match unsafe { dev.create_fence(&info, None) } {
            Ok(f) => f,
            Err(e) => {
                log::error!("vkCreateFence failed: {:?}", e);
                return None;
            }
        };

        Some(Self {
            f_dev: dev.clone(),
            f_fence: fence,
            f_type: fence_type,
            f_internal: Mutex::new(FenceInternal {
                state: FenceState::Disabled,
                armed_time_us: 0,
                recovery_attempted: false,
                frame: 0,
                release: Vec::new(),
                autorelease: Vec::new(),
                queue: None,
                release_fn: None,
            }),
        })
    }

    pub fn vkhandle(&self) -> vk::Fence {
        self.f_fence
    }

    pub fn fence_type(&self) -> FenceType {
        self.f_type
    }

    pub fn state(&self) -> FenceState {
        self.f_internal.lock().unwrap().state
    }

    pub fn is_armed(&self) -> bool {
        self.state() == FenceState::Armed
    }

    pub fn set_frame(&self, frame: u64) {
        self.f_internal.lock().unwrap().frame = frame;
    }

    /// Mark the fence as submitted, attaching the queue it rode on so
    /// the queue's in-flight count stays accurate.
    pub fn set_armed(&self, queue: Option<Arc<DeviceQueue>>) {
        let mut internal = self.f_internal.lock().unwrap();
        internal.state = FenceState::Armed;
        internal.armed_time_us = current_time_us();
        internal.recovery_attempted = false;
        if let Some(q) = queue {
            q.retain_fence();
            internal.queue = Some(q);
        }
    }

    /// Add a callback to run exactly once when this fence retires.
    pub fn add_release(
        &self,
        cb: Box<dyn FnOnce(bool) + Send>,
        held: Option<Box<dyn Droppable + Send + Sync>>,
        tag: &'static str,
    ) {
        let mut internal = self.f_internal.lock().unwrap();
        internal.release.push(ReleaseHandle {
            callback: cb,
            _held: held,
            tag: tag,
        });
    }

    /// Keep `obj` alive for the duration of this arming.
    pub fn autorelease(&self, obj: Box<dyn Droppable + Send + Sync>) {
        self.f_internal.lock().unwrap().autorelease.push(obj);
    }

    /// Callback run after the release list fires, used by the Loop to
    /// return the fence to its free pool.
    pub fn set_release_fn(&self, cb: Box<dyn FnOnce() + Send>) {
        self.f_internal.lock().unwrap().release_fn = Some(cb);
    }

    /// Poll or wait on the fence.
    ///
    /// `lockfree` does a status query. A fence armed for over a second
    /// is logged as possibly broken and gets one blocking wait to
    /// recover from drivers that stall but still resolve. On signal
    /// the fence is reset and its release callbacks fire, in that
    /// order.
    pub fn check(&self, lockfree: bool) -> bool {
        {
            let internal = self.f_internal.lock().unwrap();
            if internal.state != FenceState::Armed {
                return true;
            }
        }

        let status = if lockfree {
            unsafe { self.f_dev.get_fence_status(self.f_fence) }
        } else {
            unsafe {
                self.f_dev
                    .wait_for_fences(&[self.f_fence], true, u64::MAX)
                    .map(|_| true)
            }
        };

        match status {
            Ok(true) => {
                self.signal(true);
                true
            }
            // get_fence_status reports unsignaled as Ok(false)
            Ok(false) | Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                let do_recover = {
                    let mut internal = self.f_internal.lock().unwrap();
                    let stuck = current_time_us() - internal.armed_time_us
                        > FENCE_BROKEN_THRESHOLD_US;
                    if stuck && !internal.recovery_attempted {
                        internal.recovery_attempted = true;
                        true
                    } else {
                        false
                    }
                };

                if do_recover {
                    log::error!(
                        "Fence [{}] has been armed for over a second, possibly broken",
                        self.f_internal.lock().unwrap().frame
                    );
                    return self.check(false);
                }
                false
            }
            Err(e) => {
                log::error!("Fence status query failed: {:?}", e);
                self.signal(false);
                true
            }
        }
    }

    /// Transition to Signaled and run the retirement sequence:
    /// vkResetFences first, then the release callbacks, then the
    /// pooling callback, with the autorelease set dropped last.
    pub(crate) fn signal(&self, success: bool) {
        let (release, autorelease, release_fn, queue) = {
            let mut internal = self.f_internal.lock().unwrap();
            if internal.state == FenceState::Signaled {
                return;
            }
            internal.state = FenceState::Signaled;

            (
                std::mem::replace(&mut internal.release, Vec::new()),
                std::mem::replace(&mut internal.autorelease, Vec::new()),
                internal.release_fn.take(),
                internal.queue.take(),
            )
        };

        unsafe {
            if let Err(e) = self.f_dev.reset_fences(&[self.f_fence]) {
                log::error!("vkResetFences failed: {:?}", e);
            }
        }
        self.f_internal.lock().unwrap().state = FenceState::Disabled;

        if let Some(q) = queue {
            q.release_fence();
        }

        for handle in release.into_iter() {
            log::debug!("Fence release: {}", handle.tag);
            (handle.callback)(success);
        }

        if let Some(cb) = release_fn {
            cb();
        }

        drop(autorelease);
    }

    /// Explicit teardown of the vulkan object.
    pub fn invalidate(&self) {
        let mut internal = self.f_internal.lock().unwrap();
        internal.release.clear();
        internal.autorelease.clear();
        internal.release_fn = None;
        internal.queue = None;
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.f_dev.destroy_fence(self.f_fence, None);
        }
    }
}

struct SemaphoreInternal {
    signaled: bool,
    waited: bool,
    in_use: bool,
    timeline: u64,
}

/// A semaphore can be resubmitted only when every signal has been
/// consumed by a wait and no in-flight submission references it.
pub(crate) fn semaphore_reusable(signaled: bool, waited: bool, in_use: bool) -> bool {
    signaled == waited && !in_use
}

/// A binary semaphore with reuse tracking.
///
/// A semaphore can only be resubmitted once every signal has been
/// consumed by a wait and no in-flight submission references it. The
/// timeline counter invalidates stale uses across reuse cycles.
pub struct Semaphore {
    s_dev: ash::Device,
    s_sem: vk::Semaphore,
    s_internal: Mutex<SemaphoreInternal>,
}

impl Semaphore {
    pub fn new(dev: &ash::Device) -> Option<Self> {
        let info = vk::SemaphoreCreateInfo::builder().build();
        let sem = match unsafe { dev.create_semaphore(&info, None) } {
            Ok(s) => s,
            Err(e) => {
                log::error!("vkCreateSemaphore failed: {:?}", e);
                return None;
            }
        };

        Some(Self {
            s_dev: dev.clone(),
            s_sem: sem,
            s_internal: Mutex::new(SemaphoreInternal {
                signaled: false,
                waited: false,
                in_use: false,
                timeline: 0,
            }),
        })
    }

    pub fn vkhandle(&self) -> vk::Semaphore {
        self.s_sem
    }

    pub fn is_signaled(&self) -> bool {
        self.s_internal.lock().unwrap().signaled
    }

    pub fn is_waited(&self) -> bool {
        self.s_internal.lock().unwrap().waited
    }

    pub fn timeline(&self) -> u64 {
        self.s_internal.lock().unwrap().timeline
    }

    pub fn mark_signaled(&self) {
        let mut internal = self.s_internal.lock().unwrap();
        internal.signaled = true;
        internal.waited = false;
    }

    pub fn mark_waited(&self) {
        self.s_internal.lock().unwrap().waited = true;
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.s_internal.lock().unwrap().in_use = in_use;
    }

    /// Try to recycle the semaphore for a new submission chain.
    ///
    /// Succeeds only when every signal has been waited on and nothing
    /// in flight still references it, in which case the timeline
    /// advances so stale release callbacks can detect they lost.
    pub fn reset(&self) -> bool {
        let mut internal = self.s_internal.lock().unwrap();
        if semaphore_reusable(internal.signaled, internal.waited, internal.in_use) {
            internal.signaled = false;
            internal.waited = false;
            internal.timeline += 1;
            true
        } else {
            false
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.s_dev.destroy_semaphore(self.s_sem, None);
        }
    }
}

struct EventInternal {
    signaled: bool,
    success: bool,
    waiters: Vec<Box<dyn FnOnce(bool) + Send>>,
}

/// A one-shot latch used to order frames against each other.
///
/// Signaled exactly once with a success bit. Waiters registered before
/// the signal run at signal time, later waiters observe the cached
/// bit immediately.
pub struct DependencyEvent {
    e_internal: Mutex<EventInternal>,
}

impl DependencyEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            e_internal: Mutex::new(EventInternal {
                signaled: false,
                success: false,
                waiters: Vec::new(),
            }),
        })
    }

    pub fn is_signaled(&self) -> bool {
        self.e_internal.lock().unwrap().signaled
    }

    /// Latch the event. Repeat signals are ignored.
    pub fn signal(&self, success: bool) {
        let waiters = {
            let mut internal = self.e_internal.lock().unwrap();
            if internal.signaled {
                return;
            }
            internal.signaled = true;
            internal.success = success;
            std::mem::replace(&mut internal.waiters, Vec::new())
        };

        for w in waiters.into_iter() {
            w(success);
        }
    }

    /// Run `cb` when the event signals, or now if it already has.
    pub fn wait(&self, cb: Box<dyn FnOnce(bool) + Send>) {
        let run_now = {
            let mut internal = self.e_internal.lock().unwrap();
            if internal.signaled {
                Some(internal.success)
            } else {
                internal.waiters.push(cb);
                return;
            }
        };

        if let Some(success) = run_now {
            cb(success);
        }
    }

    /// Run `cb` once every event in `events` has signaled, with the
    /// AND of their success bits.
    pub fn wait_for_all(events: &[Arc<DependencyEvent>], cb: Box<dyn FnOnce(bool) + Send>) {
        if events.is_empty() {
            cb(true);
            return;
        }

        struct WaitState {
            remaining: usize,
            success: bool,
            cb: Option<Box<dyn FnOnce(bool) + Send>>,
        }

        let state = Arc::new(Mutex::new(WaitState {
            remaining: events.len(),
            success: true,
            cb: Some(cb),
        }));

        for event in events.iter() {
            let state = state.clone();
            event.wait(Box::new(move |success| {
                let run = {
                    let mut s = state.lock().unwrap();
                    s.success &= success;
                    s.remaining -= 1;
                    if s.remaining == 0 {
                        Some((s.cb.take().unwrap(), s.success))
                    } else {
                        None
                    }
                };
                if let Some((cb, success)) = run {
                    cb(success);
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn event_waiter_before_and_after_signal() {
        let event = DependencyEvent::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        event.wait(Box::new(move |success| {
            assert!(success);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        event.signal(true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // late waiters observe the cached bit
        let h = hits.clone();
        event.wait(Box::new(move |success| {
            assert!(success);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // repeat signals are ignored
        event.signal(false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn event_coalescing_order() {
        // three waiters over three events, signaled out of order:
        // each waiter fires when the last of its events lands
        let e1 = DependencyEvent::new();
        let e2 = DependencyEvent::new();
        let e3 = DependencyEvent::new();

        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, events) in [
            ("w1", vec![e1.clone()]),
            ("w2", vec![e1.clone(), e2.clone()]),
            ("w3", vec![e1.clone(), e2.clone(), e3.clone()]),
        ] {
            let order = order.clone();
            DependencyEvent::wait_for_all(
                &events,
                Box::new(move |success| {
                    order.lock().unwrap().push((name, success));
                }),
            );
        }

        e2.signal(true);
        e1.signal(true);
        e3.signal(true);

        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec![("w1", true), ("w2", true), ("w3", true)]
        );
    }

    #[test]
    fn event_success_bit_is_anded() {
        let e1 = DependencyEvent::new();
        let e2 = DependencyEvent::new();

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        DependencyEvent::wait_for_all(
            &[e1.clone(), e2.clone()],
            Box::new(move |success| {
                *r.lock().unwrap() = Some(success);
            }),
        );

        e1.signal(true);
        e2.signal(false);
        assert_eq!(*result.lock().unwrap(), Some(false));
    }

    #[test]
    fn empty_event_set_fires_immediately() {
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        DependencyEvent::wait_for_all(
            &[],
            Box::new(move |success| {
                *r.lock().unwrap() = Some(success);
            }),
        );
        assert_eq!(*result.lock().unwrap(), Some(true));
    }
}
