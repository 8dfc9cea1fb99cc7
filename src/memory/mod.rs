// Device memory allocator
//
// All device memory flows through here. Memory is requested from the
// driver in 8 MiB pages, kept in per-type free lists bucketed by size
// class, and handed to sub-allocating pools or bound directly for
// persistent resources.
//
// Austin Shafer - 2024

pub mod pool;

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::image::{Image, ImageInfo};
use crate::instance::PhysicalDeviceInfo;
use crate::{align_up, MAX_BUCKET_INDEX, PAGE_SIZE, PRESERVE_PAGES};

use std::os::raw::c_void;
use std::sync::{Arc, Mutex, Weak};

/// What a piece of memory will be used for. This drives memory type
/// selection: it is a usage tag, not a property mask, so callers say
/// what they are doing and we pick the best heap for it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationUsage {
    /// device local only
    DeviceLocal,
    /// device local, visible directly on host
    DeviceLocalHostVisible,
    /// host-local, source for transfers to the GPU (coherent preferable)
    HostTransitionSource,
    /// host-local, destination for readbacks from the GPU (cached preferable)
    HostTransitionDestination,
    /// memory for transient attachments
    DeviceLocalLazilyAllocated,
}

/// Tiling category of the last resource placed on a page. Linear and
/// optimal resources on the same page must be separated by
/// bufferImageGranularity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationType {
    Unknown,
    Linear,
    Optimal,
}

/// The three ways a heap can sit relative to the CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemHeapType {
    HostLocal,
    DeviceLocal,
    DeviceLocalHostVisible,
}

/// Raw mapped pointer for a page. Mapping is serialized through the
/// mutex carried next to this on the node.
#[derive(Debug, Copy, Clone)]
pub(crate) struct MappedPtr(pub *mut c_void);
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// One page (or run of pages) of device memory.
#[derive(Clone)]
pub struct MemNode {
    /// size class index, in pages
    pub(crate) index: u64,
    pub(crate) mem: vk::DeviceMemory,
    /// size in bytes
    pub(crate) size: u64,
    /// bump offset of the sub-allocator using this node
    pub(crate) offset: u64,
    /// tiling category of the last allocation for granularity padding
    pub(crate) last_allocation: AllocationType,
    pub(crate) ptr: Option<MappedPtr>,
    /// serializes vkMapMemory access on this page
    pub(crate) mapping: Arc<Mutex<()>>,
}

impl MemNode {
    pub fn is_valid(&self) -> bool {
        self.mem != vk::DeviceMemory::null()
    }

    pub fn free_space(&self) -> u64 {
        self.size - self.offset
    }
}

/// A sub-allocated block carved out of a MemNode by a MemoryPool.
#[derive(Clone)]
pub struct MemBlock {
    pub(crate) mem: vk::DeviceMemory,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    /// memory type index this was allocated from
    pub(crate) type_idx: u32,
    pub(crate) ptr: Option<MappedPtr>,
    pub(crate) mapping: Arc<Mutex<()>>,
    pub(crate) alloc_type: AllocationType,
}

impl MemBlock {
    pub fn is_valid(&self) -> bool {
        self.mem != vk::DeviceMemory::null()
    }
}

/// One memory type within a heap, together with its page free lists.
///
/// `buf[0]` is the oversized sink, `buf[1..]` are exact size classes
/// counted in pages.
pub struct MemType {
    pub idx: u32,
    pub flags: vk::MemoryPropertyFlags,
    pub heap_idx: u32,
    /// minimum allocation, in pages
    pub(crate) min: u64,
    /// largest populated index into buf
    pub(crate) last: u64,
    /// pages to preserve across frees, 0 disables preservation
    pub(crate) max: u64,
    /// current preserved page budget remaining
    pub(crate) current: u64,
    pub(crate) buf: Vec<Vec<MemNode>>,
}

impl MemType {
    pub(crate) fn new(idx: u32, mem_type: &vk::MemoryType) -> Self {
        Self {
            idx: idx,
            flags: mem_type.property_flags,
            heap_idx: mem_type.heap_index,
            min: 2,
            last: 0,
            max: PRESERVE_PAGES,
            current: PRESERVE_PAGES,
            buf: (0..MAX_BUCKET_INDEX).map(|_| Vec::new()).collect(),
        }
    }

    pub fn is_device_local(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }
    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
    pub fn is_host_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
    pub fn is_host_cached(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_CACHED)
    }
    pub fn is_lazily_allocated(&self) -> bool {
        self.flags
            .contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED)
    }
    pub fn is_protected(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::PROTECTED)
    }
}

/// One device heap with its budget tracking.
pub struct MemHeap {
    pub idx: u32,
    pub size: u64,
    pub kind: MemHeapType,
    /// soft cap reported by the driver, tracked but not enforced
    pub budget: u64,
    pub usage: u64,
}

/// The result of a buffer/image requirements query.
#[derive(Debug, Default, Copy, Clone)]
pub struct MemoryRequirements {
    pub requirements: vk::MemoryRequirements,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
    /// filled in by batch placement
    pub target_offset: u64,
}

/// Compute the selection score of one memory type for a usage tag.
///
/// Zero means the type is unusable for this tag. Kept as a free
/// function of plain data so it can be tested without a device.
pub(crate) fn memory_type_score(
    heap_kind: MemHeapType,
    ty: &MemType,
    usage: AllocationUsage,
    dev_type: vk::PhysicalDeviceType,
) -> u32 {
    match usage {
        AllocationUsage::DeviceLocal | AllocationUsage::DeviceLocalLazilyAllocated => {
            let base = match heap_kind {
                MemHeapType::DeviceLocal => 32,
                MemHeapType::DeviceLocalHostVisible => 24,
                MemHeapType::HostLocal => return 0,
            };
            if !ty.is_device_local() {
                return 0;
            }
            let mut ret: u32 = base;
            if ty.is_host_visible() {
                ret -= 2;
            }
            if ty.is_host_coherent() {
                ret -= 3;
            }
            if ty.is_host_cached() {
                ret -= 4;
            }
            if usage == AllocationUsage::DeviceLocalLazilyAllocated && ty.is_lazily_allocated() {
                ret += 12;
            }
            ret
        }
        AllocationUsage::DeviceLocalHostVisible => match heap_kind {
            MemHeapType::DeviceLocalHostVisible => {
                if !ty.is_device_local() || !ty.is_host_visible() {
                    return 0;
                }
                let mut ret: u32 = 32;
                if dev_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                    // on discrete hardware coherent BAR memory is the
                    // slow path for the CPU side
                    if ty.is_host_coherent() {
                        ret -= 3;
                    }
                    if ty.is_host_cached() {
                        ret -= 4;
                    }
                } else {
                    if ty.is_host_coherent() {
                        ret -= 2;
                    } else if ty.is_host_cached() {
                        ret -= 4;
                    }
                }
                ret
            }
            MemHeapType::DeviceLocal => 0,
            MemHeapType::HostLocal => {
                if ty.is_host_visible() {
                    1
                } else {
                    0
                }
            }
        },
        AllocationUsage::HostTransitionSource => {
            let base = match heap_kind {
                MemHeapType::HostLocal => 32,
                MemHeapType::DeviceLocalHostVisible => 16,
                MemHeapType::DeviceLocal => return 0,
            };
            if !ty.is_host_visible() {
                return 0;
            }
            let mut ret: u32 = base;
            if ty.is_host_coherent() {
                ret += 3;
            }
            if ty.is_host_cached() {
                ret -= 4;
            }
            ret
        }
        AllocationUsage::HostTransitionDestination => {
            let base = match heap_kind {
                MemHeapType::HostLocal => 32,
                MemHeapType::DeviceLocalHostVisible => 16,
                MemHeapType::DeviceLocal => return 0,
            };
            if !ty.is_host_visible() {
                return 0;
            }
            let mut ret: u32 = base;
            if ty.is_host_coherent() {
                ret -= 3;
            }
            if ty.is_host_cached() {
                ret += 4;
            }
            ret
        }
    }
}

/// Page-rounded size and raw size-class index for a byte size.
///
/// The index is unclamped. Indexes at or past MAX_BUCKET_INDEX only
/// ever live in the sink bucket, which `free` handles.
pub(crate) fn bucket_for_size(in_size: u64, min_pages: u64) -> (u64, u64) {
    let mut size = align_up(in_size, PAGE_SIZE);
    if size < min_pages * PAGE_SIZE {
        size = min_pages * PAGE_SIZE;
    }
    let index = size / PAGE_SIZE - min_pages + 1;
    (size, index)
}

/// Where a DeviceMemory came from, which decides how it dies.
enum MemorySource {
    /// its own VkDeviceMemory, freed on destroy
    Dedicated,
    /// a block borrowed from a pool, returned on destroy
    Pooled(Weak<pool::MemoryPool>),
}

/// An allocation bound (or bindable) to a buffer or image.
///
/// This either owns a dedicated VkDeviceMemory outright or references
/// a sub-block of a pool page. `offset` is where the resource must be
/// bound within `mem`.
pub struct DeviceMemory {
    pub(crate) mem: vk::DeviceMemory,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) type_idx: u32,
    pub(crate) usage: AllocationUsage,
    pub(crate) coherent: bool,
    pub(crate) ptr: Option<MappedPtr>,
    pub(crate) mapping: Arc<Mutex<()>>,
    pub(crate) alloc_type: AllocationType,
    source: MemorySource,
    /// cached from the allocator for flush alignment
    non_coherent_atom: u64,
    dev: ash::Device,
}

impl DeviceMemory {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_host_visible(&self) -> bool {
        self.ptr.is_some()
            || matches!(
                self.usage,
                AllocationUsage::DeviceLocalHostVisible
                    | AllocationUsage::HostTransitionSource
                    | AllocationUsage::HostTransitionDestination
            )
    }

    /// Write `data` into this allocation at `offset` bytes in.
    ///
    /// Mapping is serialized on the page mutex. Non-coherent memory is
    /// flushed with ranges aligned to nonCoherentAtomSize.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        if offset + data.len() as u64 > self.size {
            log::error!(
                "write_bytes: write of {} bytes at {} overflows allocation of {}",
                data.len(),
                offset,
                self.size
            );
            return false;
        }

        let _guard = self.mapping.lock().unwrap();
        unsafe {
            let (base, mapped_here) = match self.ptr {
                Some(p) => (p.0, false),
                None => {
                    match self.dev.map_memory(
                        self.mem,
                        self.offset,
                        self.size,
                        vk::MemoryMapFlags::empty(),
                    ) {
                        Ok(p) => (p, true),
                        Err(_) => return false,
                    }
                }
            };

            // persistent maps cover the whole node, so our block offset
            // still applies. A fresh map above already starts at it.
            let dst_off = if mapped_here { 0 } else { self.offset };
            let dst = (base as *mut u8).add((dst_off + offset) as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());

            if !self.coherent {
                let start = align_down(self.offset + offset, self.non_coherent_atom);
                let end = align_up(self.offset + offset + data.len() as u64, self.non_coherent_atom);
                let range = vk::MappedMemoryRange::builder()
                    .memory(self.mem)
                    .offset(start)
                    .size(end - start)
                    .build();
                if self.dev.flush_mapped_memory_ranges(&[range]).is_err() {
                    log::error!("write_bytes: could not flush mapped range");
                }
            }

            if mapped_here {
                self.dev.unmap_memory(self.mem);
            }
        }
        true
    }

    /// Read `out.len()` bytes starting at `offset` into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> bool {
        if out.is_empty() {
            return true;
        }
        if offset + out.len() as u64 > self.size {
            return false;
        }

        let _guard = self.mapping.lock().unwrap();
        unsafe {
            let (base, mapped_here) = match self.ptr {
                Some(p) => (p.0, false),
                None => {
                    match self.dev.map_memory(
                        self.mem,
                        self.offset,
                        self.size,
                        vk::MemoryMapFlags::empty(),
                    ) {
                        Ok(p) => (p, true),
                        Err(_) => return false,
                    }
                }
            };

            if !self.coherent {
                let start = align_down(self.offset + offset, self.non_coherent_atom);
                let end = align_up(self.offset + offset + out.len() as u64, self.non_coherent_atom);
                let range = vk::MappedMemoryRange::builder()
                    .memory(self.mem)
                    .offset(start)
                    .size(end - start)
                    .build();
                let _ = self.dev.invalidate_mapped_memory_ranges(&[range]);
            }

            let src_off = if mapped_here { 0 } else { self.offset };
            let src = (base as *const u8).add((src_off + offset) as usize);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());

            if mapped_here {
                self.dev.unmap_memory(self.mem);
            }
        }
        true
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        match &self.source {
            MemorySource::Dedicated => unsafe {
                self.dev.free_memory(self.mem, None);
            },
            MemorySource::Pooled(pool) => {
                if let Some(pool) = pool.upgrade() {
                    pool.return_block(MemBlock {
                        mem: self.mem,
                        offset: self.offset,
                        size: self.size,
                        type_idx: self.type_idx,
                        ptr: self.ptr,
                        mapping: self.mapping.clone(),
                        alloc_type: self.alloc_type,
                    });
                }
            }
        }
    }
}

fn align_down(val: u64, align: u64) -> u64 {
    if align <= 1 {
        return val;
    }
    (val / align) * align
}

/// The per-device allocator.
///
/// Enumerated once at device creation. All free list state sits behind
/// one mutex; pages hold their own mapping mutexes so sub-allocators
/// never contend here for plain writes.
pub struct Allocator {
    dev: ash::Device,
    inst: ash::Instance,
    pdev: vk::PhysicalDevice,
    dev_type: vk::PhysicalDeviceType,
    buffer_image_granularity: u64,
    non_coherent_atom_size: u64,
    has_memreq2: bool,
    has_dedicated: bool,
    has_budget: bool,
    a_internal: Mutex<AllocatorInternal>,
}

struct AllocatorInternal {
    heaps: Vec<MemHeap>,
    types: Vec<MemType>,
}

impl Allocator {
    pub fn new(
        dev: ash::Device,
        inst: ash::Instance,
        pdev_info: &PhysicalDeviceInfo,
    ) -> Self {
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev_info.pdev) };

        let mut heaps = Vec::new();
        let mut types = Vec::new();
        for i in 0..mem_props.memory_heap_count as usize {
            let heap = &mem_props.memory_heaps[i];
            let mut kind = if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                MemHeapType::DeviceLocal
            } else {
                MemHeapType::HostLocal
            };

            for j in 0..mem_props.memory_type_count as usize {
                let ty = &mem_props.memory_types[j];
                if ty.heap_index as usize == i
                    && kind == MemHeapType::DeviceLocal
                    && ty.property_flags
                        .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                {
                    kind = MemHeapType::DeviceLocalHostVisible;
                }
            }

            heaps.push(MemHeap {
                idx: i as u32,
                size: heap.size,
                kind: kind,
                budget: 0,
                usage: 0,
            });
        }
        for j in 0..mem_props.memory_type_count as usize {
            types.push(MemType::new(j as u32, &mem_props.memory_types[j]));
        }

        let ret = Self {
            dev: dev,
            inst: inst,
            pdev: pdev_info.pdev,
            dev_type: pdev_info.device_type,
            buffer_image_granularity: pdev_info.limits.buffer_image_granularity,
            non_coherent_atom_size: pdev_info.limits.non_coherent_atom_size,
            has_memreq2: pdev_info.features.memreq2,
            has_dedicated: pdev_info.features.dedicated_allocation,
            has_budget: pdev_info.features.memory_budget,
            a_internal: Mutex::new(AllocatorInternal {
                heaps: heaps,
                types: types,
            }),
        };
        ret.update_budget();
        ret
    }

    pub fn buffer_image_granularity(&self) -> u64 {
        self.buffer_image_granularity
    }

    pub fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }

    pub(crate) fn vkdev(&self) -> &ash::Device {
        &self.dev
    }

    /// Refresh the per-heap budget/usage numbers from the driver.
    pub fn update_budget(&self) {
        if !self.has_budget {
            return;
        }

        let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::builder().build();
        let mut props = vk::PhysicalDeviceMemoryProperties2::builder().build();
        props.p_next = &mut budget as *mut _ as *mut c_void;
        unsafe {
            self.inst
                .get_physical_device_memory_properties2(self.pdev, &mut props)
        };

        let mut internal = self.a_internal.lock().unwrap();
        for heap in internal.heaps.iter_mut() {
            heap.budget = budget.heap_budget[heap.idx as usize];
            heap.usage = budget.heap_usage[heap.idx as usize];
        }
    }

    /// A type mask with every memory type set, the starting point for
    /// batch placement.
    pub fn initial_type_mask(&self) -> u32 {
        let internal = self.a_internal.lock().unwrap();
        let mut ret = 0;
        for t in internal.types.iter() {
            ret |= 1 << t.idx;
        }
        ret
    }

    /// Select the best memory type with its bit in `type_mask` for a
    /// usage tag. Returns the type index, or None if nothing matches.
    pub fn find_memory_type(&self, type_mask: u32, usage: AllocationUsage) -> Option<u32> {
        let internal = self.a_internal.lock().unwrap();

        let mut best_score = 0;
        let mut best_idx = None;
        for ty in internal.types.iter() {
            if type_mask & (1 << ty.idx) == 0 {
                continue;
            }
            let heap = &internal.heaps[ty.heap_idx as usize];
            let score = memory_type_score(heap.kind, ty, usage, self.dev_type);
            if score > best_score {
                best_score = score;
                best_idx = Some(ty.idx);
            }
        }

        if best_idx.is_none() {
            log::error!("Failed to find a usable memory type for {:?}", usage);
        }
        best_idx
    }

    pub(crate) fn type_flags(&self, type_idx: u32) -> vk::MemoryPropertyFlags {
        let internal = self.a_internal.lock().unwrap();
        internal.types[type_idx as usize].flags
    }

    /// Query requirements for a buffer, using the Requirements2 path
    /// when available so dedicated-allocation hints come back too.
    pub fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let mut ret = MemoryRequirements::default();
        if self.has_memreq2 && self.has_dedicated {
            let mut dedicated = vk::MemoryDedicatedRequirements::builder().build();
            let mut reqs = vk::MemoryRequirements2::builder().build();
            reqs.p_next = &mut dedicated as *mut _ as *mut c_void;
            let info = vk::BufferMemoryRequirementsInfo2::builder()
                .buffer(buffer)
                .build();
            unsafe { self.dev.get_buffer_memory_requirements2(&info, &mut reqs) };
            ret.requirements = reqs.memory_requirements;
            ret.requires_dedicated = dedicated.requires_dedicated_allocation != 0;
            ret.prefers_dedicated = dedicated.prefers_dedicated_allocation != 0;
        } else {
            ret.requirements = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
        }
        ret
    }

    pub fn get_image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let mut ret = MemoryRequirements::default();
        if self.has_memreq2 && self.has_dedicated {
            let mut dedicated = vk::MemoryDedicatedRequirements::builder().build();
            let mut reqs = vk::MemoryRequirements2::builder().build();
            reqs.p_next = &mut dedicated as *mut _ as *mut c_void;
            let info = vk::ImageMemoryRequirementsInfo2::builder().image(image).build();
            unsafe { self.dev.get_image_memory_requirements2(&info, &mut reqs) };
            ret.requirements = reqs.memory_requirements;
            ret.requires_dedicated = dedicated.requires_dedicated_allocation != 0;
            ret.prefers_dedicated = dedicated.prefers_dedicated_allocation != 0;
        } else {
            ret.requirements = unsafe { self.dev.get_image_memory_requirements(image) };
        }
        ret
    }

    /// Grab a page run for `in_size` bytes of memory type `type_idx`.
    ///
    /// Walks the free list buckets upward from the exact size class,
    /// falls back to the oversized sink, and finally asks the driver.
    /// If `persistent` and the type is host visible the node comes
    /// back mapped.
    pub(crate) fn alloc(&self, type_idx: u32, in_size: u64, persistent: bool) -> Option<MemNode> {
        let mut internal = self.a_internal.lock().unwrap();
        let ty = &mut internal.types[type_idx as usize];

        let (size, index) = bucket_for_size(in_size, ty.min);
        if size < in_size {
            return None;
        }

        // First see if there are any nodes in the buckets our size
        // class maps into
        if index <= ty.last {
            let max_index = ty.last;
            let mut i = index;
            while i < max_index && ty.buf[i as usize].is_empty() {
                i += 1;
            }

            if !ty.buf[i as usize].is_empty() {
                let mut node = ty.buf[i as usize].pop().unwrap();

                if ty.buf[i as usize].is_empty() && i == ty.last {
                    // walk `last` back down to the next populated bucket
                    let mut max = i;
                    while max > 0 && ty.buf[max as usize].is_empty() {
                        max -= 1;
                    }
                    ty.last = max;
                }

                ty.current = (ty.current + node.index + (ty.min - 1)).min(ty.max);

                if !self.adjust_node_mapping(&mut node, persistent) {
                    return None;
                }
                return Some(node);
            }
        } else if !ty.buf[0].is_empty() {
            // seek the oversized sink for the first node big enough
            if let Some(pos) = ty.buf[0].iter().position(|n| n.index >= index) {
                let mut node = ty.buf[0].remove(pos);
                ty.current = (ty.current + node.index + (ty.min - 1)).min(ty.max);

                if !self.adjust_node_mapping(&mut node, persistent) {
                    return None;
                }
                return Some(node);
            }
        }

        let host_visible = ty.is_host_visible();
        drop(internal);

        // Nothing on the free lists fits, ask the driver
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_idx)
            .build();

        let mem = match unsafe { self.dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                log::error!("vkAllocateMemory of {} bytes failed: {:?}", size, e);
                return None;
            }
        };

        let mut ptr = None;
        if persistent && host_visible {
            match unsafe { self.dev.map_memory(mem, 0, size, vk::MemoryMapFlags::empty()) } {
                Ok(p) => ptr = Some(MappedPtr(p)),
                Err(_) => {
                    unsafe { self.dev.free_memory(mem, None) };
                    return None;
                }
            }
        }

        Some(MemNode {
            index: index,
            mem: mem,
            size: size,
            offset: 0,
            last_allocation: AllocationType::Unknown,
            ptr: ptr,
            mapping: Arc::new(Mutex::new(())),
        })
    }

    /// Match a recycled node's mapping state to what the caller needs.
    fn adjust_node_mapping(&self, node: &mut MemNode, persistent: bool) -> bool {
        if persistent && node.ptr.is_none() {
            match unsafe {
                self.dev
                    .map_memory(node.mem, 0, node.size, vk::MemoryMapFlags::empty())
            } {
                Ok(p) => node.ptr = Some(MappedPtr(p)),
                Err(_) => return false,
            }
        } else if !persistent && node.ptr.is_some() {
            unsafe { self.dev.unmap_memory(node.mem) };
            node.ptr = None;
        }
        true
    }

    /// Return nodes to the free lists. Pages beyond the preservation
    /// budget are unmapped and handed back to the driver.
    pub(crate) fn free(&self, type_idx: u32, nodes: Vec<MemNode>) {
        let mut freelist = Vec::new();
        {
            let mut internal = self.a_internal.lock().unwrap();
            let ty = &mut internal.types[type_idx as usize];

            let mut max_index = ty.last;
            let mut current_free = ty.current;

            for mut node in nodes.into_iter() {
                node.offset = 0;
                node.last_allocation = AllocationType::Unknown;
                let index = node.index;

                if index + (ty.min - 1) > current_free {
                    // over the preservation budget, release it for real
                    freelist.push(node);
                } else if index < MAX_BUCKET_INDEX && index != 0 {
                    if ty.buf[index as usize].is_empty() && index > max_index {
                        max_index = index;
                    }
                    current_free = current_free.saturating_sub(index + (ty.min - 1));
                    ty.buf[index as usize].push(node);
                } else {
                    // too large for a size bucket, keep in the sink
                    current_free = current_free.saturating_sub(index + (ty.min - 1));
                    ty.buf[0].push(node);
                }
            }

            ty.last = max_index;
            ty.current = current_free;
        }

        for node in freelist.into_iter() {
            unsafe {
                if node.ptr.is_some() {
                    self.dev.unmap_memory(node.mem);
                }
                self.dev.free_memory(node.mem, None);
            }
        }
    }

    /// Create a buffer object without memory behind it yet.
    pub fn preallocate_buffer(&self, info: &BufferInfo) -> Option<Arc<Buffer>> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let handle = match unsafe { self.dev.create_buffer(&create_info, None) } {
            Ok(b) => b,
            Err(e) => {
                log::error!("vkCreateBuffer failed: {:?}", e);
                return None;
            }
        };
        Some(Arc::new(Buffer::new(self.dev.clone(), handle, info.clone())))
    }

    /// Create an image object without memory behind it yet.
    pub fn preallocate_image(&self, info: &ImageInfo, preinitialized: bool) -> Option<Arc<Image>> {
        let layout = if preinitialized {
            vk::ImageLayout::PREINITIALIZED
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(info.tiling)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(layout)
            .build();

        let handle = match unsafe { self.dev.create_image(&create_info, None) } {
            Ok(i) => i,
            Err(e) => {
                log::error!("vkCreateImage failed: {:?}", e);
                return None;
            }
        };
        Some(Arc::new(Image::new(
            self.dev.clone(),
            handle,
            info.clone(),
            layout,
        )))
    }

    /// Give this buffer/image its own VkDeviceMemory and bind it.
    pub fn allocate_dedicated_buffer(&self, usage: AllocationUsage, target: &Arc<Buffer>) -> bool {
        let req = self.get_buffer_memory_requirements(target.vkhandle());
        let type_idx = match self.find_memory_type(req.requirements.memory_type_bits, usage) {
            Some(t) => t,
            None => return false,
        };

        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(req.requirements.size)
            .memory_type_index(type_idx)
            .build();

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .buffer(target.vkhandle())
            .build();
        if self.has_dedicated {
            alloc_info.p_next = &mut dedicated_info as *mut _ as *const c_void;
        }

        let mem = match unsafe { self.dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                log::error!("dedicated buffer allocation failed: {:?}", e);
                return false;
            }
        };

        target.bind_memory(Arc::new(self.wrap_dedicated(
            mem,
            req.requirements.size,
            type_idx,
            usage,
            AllocationType::Linear,
        )))
    }

    pub fn allocate_dedicated_image(&self, usage: AllocationUsage, target: &Arc<Image>) -> bool {
        let req = self.get_image_memory_requirements(target.vkhandle());
        let type_idx = match self.find_memory_type(req.requirements.memory_type_bits, usage) {
            Some(t) => t,
            None => return false,
        };

        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(req.requirements.size)
            .memory_type_index(type_idx)
            .build();

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(target.vkhandle())
            .build();
        if self.has_dedicated {
            alloc_info.p_next = &mut dedicated_info as *mut _ as *const c_void;
        }

        let mem = match unsafe { self.dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                log::error!("dedicated image allocation failed: {:?}", e);
                return false;
            }
        };

        let alloc_type = if target.info().tiling == vk::ImageTiling::OPTIMAL {
            AllocationType::Optimal
        } else {
            AllocationType::Linear
        };
        target.bind_memory(Arc::new(self.wrap_dedicated(
            mem,
            req.requirements.size,
            type_idx,
            usage,
            alloc_type,
        )))
    }

    pub(crate) fn wrap_dedicated(
        &self,
        mem: vk::DeviceMemory,
        size: u64,
        type_idx: u32,
        usage: AllocationUsage,
        alloc_type: AllocationType,
    ) -> DeviceMemory {
        DeviceMemory {
            mem: mem,
            offset: 0,
            size: size,
            type_idx: type_idx,
            usage: usage,
            coherent: self
                .type_flags(type_idx)
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            ptr: None,
            mapping: Arc::new(Mutex::new(())),
            alloc_type: alloc_type,
            source: MemorySource::Dedicated,
            non_coherent_atom: self.non_coherent_atom_size,
            dev: self.dev.clone(),
        }
    }

    pub(crate) fn wrap_block(
        &self,
        block: MemBlock,
        usage: AllocationUsage,
        pool: &Arc<pool::MemoryPool>,
    ) -> DeviceMemory {
        DeviceMemory {
            mem: block.mem,
            offset: block.offset,
            size: block.size,
            type_idx: block.type_idx,
            usage: usage,
            coherent: self
                .type_flags(block.type_idx)
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            ptr: block.ptr,
            mapping: block.mapping.clone(),
            alloc_type: block.alloc_type,
            source: MemorySource::Pooled(Arc::downgrade(pool)),
            non_coherent_atom: self.non_coherent_atom_size,
            dev: self.dev.clone(),
        }
    }

    /// Create a buffer with its own memory that outlives any frame.
    pub fn spawn_persistent_buffer(
        self: &Arc<Self>,
        usage: AllocationUsage,
        info: &BufferInfo,
        data: Option<&[u8]>,
    ) -> Option<Arc<Buffer>> {
        let target = self.preallocate_buffer(info)?;
        if !self.allocate_dedicated_buffer(usage, &target) {
            return None;
        }

        if let Some(bytes) = data {
            if !target.set_data(bytes, 0) {
                return None;
            }
        }
        Some(target)
    }

    /// Create an image with its own memory that outlives any frame.
    pub fn spawn_persistent_image(
        self: &Arc<Self>,
        usage: AllocationUsage,
        info: &ImageInfo,
        preinitialized: bool,
    ) -> Option<Arc<Image>> {
        let target = self.preallocate_image(info, preinitialized)?;
        if !self.allocate_dedicated_image(usage, &target) {
            return None;
        }
        Some(target)
    }

    /// Bind a whole batch of images and buffers to one VkDeviceMemory.
    ///
    /// Optimal-tiled images are packed first, then the linear span,
    /// with a bufferImageGranularity gap between the two. Objects that
    /// want a dedicated allocation get one instead of joining the
    /// batch.
    pub fn emplace_objects(
        self: &Arc<Self>,
        usage: AllocationUsage,
        images: &[Arc<Image>],
        buffers: &[Arc<Buffer>],
    ) -> Option<Arc<DeviceMemory>> {
        let mut image_reqs = Vec::with_capacity(images.len());
        let mut buffer_reqs = Vec::with_capacity(buffers.len());
        let mut linear_objects = 0;
        let mut nonlinear_objects = 0;
        let mut mask = self.initial_type_mask();

        for buf in buffers.iter() {
            let req = self.get_buffer_memory_requirements(buf.vkhandle());
            if !req.prefers_dedicated && !req.requires_dedicated {
                mask &= req.requirements.memory_type_bits;
            }
            if mask == 0 {
                log::error!("emplace_objects: no common memory type for the batch");
                return None;
            }
            buffer_reqs.push(req);
            linear_objects += 1;
        }
        for img in images.iter() {
            let req = self.get_image_memory_requirements(img.vkhandle());
            if !req.prefers_dedicated && !req.requires_dedicated {
                mask &= req.requirements.memory_type_bits;
            }
            if mask == 0 {
                log::error!("emplace_objects: no common memory type for the batch");
                return None;
            }
            image_reqs.push(req);
            if img.info().tiling == vk::ImageTiling::OPTIMAL {
                nonlinear_objects += 1;
            } else {
                linear_objects += 1;
            }
        }

        let type_idx = self.find_memory_type(mask, usage)?;
        let ty_flags = self.type_flags(type_idx);
        let atom = if ty_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !ty_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            self.non_coherent_atom_size
        } else {
            1
        };

        let mut required = 0u64;

        if nonlinear_objects > 0 {
            for (i, img) in images.iter().enumerate() {
                let req = &mut image_reqs[i];
                if !req.requires_dedicated
                    && !req.prefers_dedicated
                    && img.info().tiling == vk::ImageTiling::OPTIMAL
                {
                    required = align_up(required, req.requirements.alignment.max(atom));
                    req.target_offset = required;
                    required += req.requirements.size;
                }
            }
        }

        if nonlinear_objects > 0 && linear_objects > 0 {
            required = align_up(required, self.buffer_image_granularity);
        }

        if linear_objects > 0 {
            for (i, img) in images.iter().enumerate() {
                let req = &mut image_reqs[i];
                if !req.requires_dedicated
                    && !req.prefers_dedicated
                    && img.info().tiling != vk::ImageTiling::OPTIMAL
                {
                    required = align_up(required, req.requirements.alignment.max(atom));
                    req.target_offset = required;
                    required += req.requirements.size;
                }
            }
            for req in buffer_reqs.iter_mut() {
                if !req.requires_dedicated && !req.prefers_dedicated {
                    required = align_up(required, req.requirements.alignment.max(atom));
                    req.target_offset = required;
                    required += req.requirements.size;
                }
            }
        }

        let mut mem_object = vk::DeviceMemory::null();
        if required > 0 {
            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(required)
                .memory_type_index(type_idx)
                .build();
            mem_object = match unsafe { self.dev.allocate_memory(&alloc_info, None) } {
                Ok(m) => m,
                Err(e) => {
                    log::error!("emplace_objects: failed to allocate memory: {:?}", e);
                    return None;
                }
            };
        }

        let memory = Arc::new(self.wrap_dedicated(
            mem_object,
            required,
            type_idx,
            usage,
            AllocationType::Unknown,
        ));

        for (i, img) in images.iter().enumerate() {
            let req = &image_reqs[i];
            if req.requires_dedicated || req.prefers_dedicated {
                if !self.allocate_dedicated_image(usage, img) {
                    return None;
                }
            } else {
                img.bind_memory_at(memory.clone(), req.target_offset);
            }
        }
        for (i, buf) in buffers.iter().enumerate() {
            let req = &buffer_reqs[i];
            if req.requires_dedicated || req.prefers_dedicated {
                if !self.allocate_dedicated_buffer(usage, buf) {
                    return None;
                }
            } else {
                buf.bind_memory_at(memory.clone(), req.target_offset);
            }
        }

        Some(memory)
    }

    /// Drain every free list, unmapping and freeing all pages. Called
    /// by the device at teardown.
    pub fn invalidate(&self) {
        let mut internal = self.a_internal.lock().unwrap();
        for ty in internal.types.iter_mut() {
            for bucket in ty.buf.iter_mut() {
                for node in bucket.drain(..) {
                    unsafe {
                        if node.ptr.is_some() {
                            self.dev.unmap_memory(node.mem);
                        }
                        self.dev.free_memory(node.mem, None);
                    }
                }
            }
            ty.last = 0;
        }
    }
}
