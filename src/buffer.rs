// Buffer object wrapper
//
// Owns a VkBuffer plus a reference to the memory backing it, and a
// single pending barrier slot used for queue family ownership
// handoffs.
//
// Austin Shafer - 2024

use ash::vk;

use crate::cmd::BufferMemoryBarrier;
use crate::memory::DeviceMemory;

use std::sync::{Arc, Mutex};

/// Creation parameters for a buffer, the subset of VkBufferCreateInfo
/// the runtime deals in.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

impl BufferInfo {
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size: size,
            usage: usage,
        }
    }
}

struct BufferInternal {
    memory: Option<Arc<DeviceMemory>>,
    /// offset of this buffer within its memory
    offset: u64,
    pending_barrier: Option<BufferMemoryBarrier>,
}

/// A VkBuffer with its backing memory.
pub struct Buffer {
    b_dev: ash::Device,
    b_buffer: vk::Buffer,
    b_info: BufferInfo,
    b_internal: Mutex<BufferInternal>,
}

impl Buffer {
    pub(crate) fn new(dev: ash::Device, handle: vk::Buffer, info: BufferInfo) -> Self {
        Self {
            b_dev: dev,
            b_buffer: handle,
            b_info: info,
            b_internal: Mutex::new(BufferInternal {
                memory: None,
                offset: 0,
                pending_barrier: None,
            }),
        }
    }

    pub fn vkhandle(&self) -> vk::Buffer {
        self.b_buffer
    }

    pub fn info(&self) -> &BufferInfo {
        &self.b_info
    }

    pub fn size(&self) -> u64 {
        self.b_info.size
    }

    /// Bind backing memory at the memory's own offset.
    pub fn bind_memory(&self, mem: Arc<DeviceMemory>) -> bool {
        let offset = mem.offset();
        self.bind_memory_at(mem, offset)
    }

    /// Bind backing memory at an explicit offset within `mem`.
    ///
    /// Binding happens exactly once, repeat calls are no-ops so that
    /// shared setup paths do not have to track it.
    pub fn bind_memory_at(&self, mem: Arc<DeviceMemory>, offset: u64) -> bool {
        let mut internal = self.b_internal.lock().unwrap();
        if internal.memory.is_some() {
            return true;
        }

        let res = unsafe {
            self.b_dev
                .bind_buffer_memory(self.b_buffer, mem.mem, offset)
        };
        if let Err(e) = res {
            log::error!("vkBindBufferMemory failed: {:?}", e);
            return false;
        }
        internal.memory = Some(mem);
        internal.offset = offset;
        true
    }

    pub fn memory(&self) -> Option<Arc<DeviceMemory>> {
        self.b_internal.lock().unwrap().memory.clone()
    }

    pub fn is_host_visible(&self) -> bool {
        self.b_internal
            .lock()
            .unwrap()
            .memory
            .as_ref()
            .map(|m| m.is_host_visible())
            .unwrap_or(false)
    }

    /// Write bytes into the buffer through its mapped memory.
    pub fn set_data(&self, data: &[u8], offset: u64) -> bool {
        let mem = match self.memory() {
            Some(m) => m,
            None => {
                log::error!("set_data called on a buffer with no memory bound");
                return false;
            }
        };
        mem.write_bytes(offset, data)
    }

    /// Read the buffer's contents back out through its mapped memory.
    pub fn get_data(&self, offset: u64, out: &mut [u8]) -> bool {
        let mem = match self.memory() {
            Some(m) => m,
            None => return false,
        };
        mem.read_bytes(offset, out)
    }

    /// Record a queue family release that the next consumer must
    /// complete. The slot holds at most one barrier, a second producer
    /// writing before the consumer drained it is a bug upstream.
    pub fn set_pending_barrier(&self, barrier: BufferMemoryBarrier) {
        let mut internal = self.b_internal.lock().unwrap();
        debug_assert!(
            internal.pending_barrier.is_none(),
            "pending barrier slot overwritten before being consumed"
        );
        internal.pending_barrier = Some(barrier);
    }

    /// Take the pending barrier, leaving the slot empty.
    pub fn take_pending_barrier(&self) -> Option<BufferMemoryBarrier> {
        self.b_internal.lock().unwrap().pending_barrier.take()
    }

    pub fn has_pending_barrier(&self) -> bool {
        self.b_internal.lock().unwrap().pending_barrier.is_some()
    }

    pub fn drop_pending_barrier(&self) {
        self.b_internal.lock().unwrap().pending_barrier = None;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.b_dev.destroy_buffer(self.b_buffer, None);
        }
    }
}
