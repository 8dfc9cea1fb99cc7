// Per-frame memory pool
//
// A bump sub-allocator over pages from the Allocator. Frames create
// one of these per pool key, spawn transient buffers and images out
// of it, and clear the whole thing once the frame's fences retire.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::image::{Image, ImageInfo};
use crate::memory::{
    AllocationType, AllocationUsage, Allocator, MemBlock, MemNode,
};
use crate::align_up;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Free lists and live pages for one memory type inside the pool.
struct MemData {
    nodes: Vec<MemNode>,
    freed: Vec<MemBlock>,
}

struct PoolInternal {
    heaps: HashMap<u32, MemData>,
    /// keep spawned objects alive until the pool clears
    buffers: Vec<Arc<Buffer>>,
    images: Vec<Arc<Image>>,
}

/// Decide the placement offset for a new allocation on a page.
///
/// Alignment starts from the resource's own requirement, raised to
/// nonCoherentAtomSize on mappable non-coherent memory, and raised to
/// bufferImageGranularity when the page's previous resource was of the
/// other tiling category.
pub(crate) fn place_on_node(
    node_offset: u64,
    last_allocation: AllocationType,
    alloc_type: AllocationType,
    alignment: u64,
    non_coherent_atom: Option<u64>,
    granularity: u64,
) -> u64 {
    let mut offset = align_up(node_offset, alignment);
    if let Some(atom) = non_coherent_atom {
        offset = align_up(offset, atom);
    }
    if last_allocation != alloc_type && last_allocation != AllocationType::Unknown {
        offset = align_up(offset, granularity);
    }
    offset
}

/// Can a freed block satisfy a new request?
///
/// The block's offset must be at least as aligned as the request wants
/// (trailing zero count, 64 for offset zero) and the block must be
/// big enough.
pub(crate) fn block_reusable(
    block_offset: u64,
    block_size: u64,
    req_size: u64,
    req_alignment: u64,
) -> bool {
    let target_alignment = req_alignment.trailing_zeros();
    let source_alignment = block_offset.trailing_zeros();
    source_alignment >= target_alignment && block_size >= req_size
}

/// A per-frame (or per-resource-set) sub-allocator.
pub struct MemoryPool {
    p_allocator: Arc<Allocator>,
    p_persistent_mapping: bool,
    p_internal: Mutex<PoolInternal>,
}

impl MemoryPool {
    pub fn new(allocator: Arc<Allocator>, persistent_mapping: bool) -> Arc<Self> {
        Arc::new(Self {
            p_allocator: allocator,
            p_persistent_mapping: persistent_mapping,
            p_internal: Mutex::new(PoolInternal {
                heaps: HashMap::new(),
                buffers: Vec::new(),
                images: Vec::new(),
            }),
        })
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.p_allocator
    }

    /// Sub-allocate a block for one resource.
    pub(crate) fn alloc(
        &self,
        type_idx: u32,
        in_size: u64,
        alignment: u64,
        alloc_type: AllocationType,
        usage: AllocationUsage,
    ) -> Option<MemBlock> {
        if alloc_type == AllocationType::Unknown {
            return None;
        }

        let size = align_up(in_size, alignment);
        let ty_flags = self.p_allocator.type_flags(type_idx);
        let non_coherent_atom = if ty_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !ty_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            Some(self.p_allocator.non_coherent_atom_size())
        } else {
            None
        };

        let mut internal = self.p_internal.lock().unwrap();
        let mem = internal.heaps.entry(type_idx).or_insert_with(|| MemData {
            nodes: Vec::new(),
            freed: Vec::new(),
        });

        // try unused blocks first
        if let Some(pos) = mem.freed.iter().position(|b| {
            b.alloc_type == alloc_type && block_reusable(b.offset, b.size, in_size, alignment)
        }) {
            return Some(mem.freed.remove(pos));
        }

        let mut chosen: Option<usize> = None;
        let mut aligned_offset = 0;
        for (i, node) in mem.nodes.iter().enumerate() {
            let offset = place_on_node(
                node.offset,
                node.last_allocation,
                alloc_type,
                alignment,
                non_coherent_atom,
                self.p_allocator.buffer_image_granularity(),
            );
            if offset + size < node.size {
                chosen = Some(i);
                aligned_offset = offset;
                break;
            }
        }

        let node_idx = match chosen {
            Some(i) => i,
            None => {
                let persistent =
                    usage != AllocationUsage::DeviceLocal && self.p_persistent_mapping;
                let node = self.p_allocator.alloc(type_idx, size, persistent)?;
                mem.nodes.push(node);
                aligned_offset = 0;
                mem.nodes.len() - 1
            }
        };

        let node = &mut mem.nodes[node_idx];
        if !node.is_valid() {
            return None;
        }
        node.offset = aligned_offset + size;
        node.last_allocation = alloc_type;

        Some(MemBlock {
            mem: node.mem,
            offset: aligned_offset,
            size: size,
            type_idx: type_idx,
            ptr: node.ptr,
            mapping: node.mapping.clone(),
            alloc_type: alloc_type,
        })
    }

    /// Take a returned block back for reuse within this pool.
    pub(crate) fn return_block(&self, block: MemBlock) {
        let mut internal = self.p_internal.lock().unwrap();
        if let Some(mem) = internal.heaps.get_mut(&block.type_idx) {
            mem.freed.push(block);
        }
    }

    /// Create a transient buffer backed by this pool.
    pub fn spawn_buffer(
        self: &Arc<Self>,
        usage: AllocationUsage,
        info: &BufferInfo,
    ) -> Option<Arc<Buffer>> {
        let buffer = self.p_allocator.preallocate_buffer(info)?;
        let requirements = self
            .p_allocator
            .get_buffer_memory_requirements(buffer.vkhandle());

        if requirements.requires_dedicated {
            if !self.p_allocator.allocate_dedicated_buffer(usage, &buffer) {
                return None;
            }
        } else {
            let type_idx = self
                .p_allocator
                .find_memory_type(requirements.requirements.memory_type_bits, usage)?;
            let block = self.alloc(
                type_idx,
                requirements.requirements.size,
                requirements.requirements.alignment,
                AllocationType::Linear,
                usage,
            )?;
            let mem = Arc::new(self.p_allocator.wrap_block(block, usage, self));
            if !buffer.bind_memory(mem) {
                log::error!("Failed to bind pool memory for buffer: {:?}", usage);
                return None;
            }
        }

        self.p_internal
            .lock()
            .unwrap()
            .buffers
            .push(buffer.clone());
        Some(buffer)
    }

    /// Create a transient image backed by this pool.
    pub fn spawn_image(
        self: &Arc<Self>,
        usage: AllocationUsage,
        info: &ImageInfo,
    ) -> Option<Arc<Image>> {
        let image = self.p_allocator.preallocate_image(info, false)?;
        let requirements = self
            .p_allocator
            .get_image_memory_requirements(image.vkhandle());

        if requirements.requires_dedicated {
            if !self.p_allocator.allocate_dedicated_image(usage, &image) {
                return None;
            }
        } else {
            let type_idx = self
                .p_allocator
                .find_memory_type(requirements.requirements.memory_type_bits, usage)?;
            let alloc_type = if info.tiling == vk::ImageTiling::OPTIMAL {
                AllocationType::Optimal
            } else {
                AllocationType::Linear
            };
            let block = self.alloc(
                type_idx,
                requirements.requirements.size,
                requirements.requirements.alignment,
                alloc_type,
                usage,
            )?;
            let mem = Arc::new(self.p_allocator.wrap_block(block, usage, self));
            if !image.bind_memory(mem) {
                log::error!("Failed to bind pool memory for image");
                return None;
            }
        }

        self.p_internal.lock().unwrap().images.push(image.clone());
        Some(image)
    }

    /// Buffers that outlive the pool go straight to the allocator.
    pub fn spawn_persistent_buffer(
        &self,
        usage: AllocationUsage,
        info: &BufferInfo,
    ) -> Option<Arc<Buffer>> {
        self.p_allocator.spawn_persistent_buffer(usage, info, None)
    }

    /// Drop every transient resource and hand all pages back.
    ///
    /// Callers must ensure no GPU work still references the spawned
    /// objects, this is tied to fence retirement by the frame code.
    pub fn clear(&self) {
        let mut internal = self.p_internal.lock().unwrap();
        internal.buffers.clear();
        internal.images.clear();

        for (type_idx, mem) in internal.heaps.iter_mut() {
            mem.freed.clear();
            let nodes = std::mem::replace(&mut mem.nodes, Vec::new());
            self.p_allocator.free(*type_idx, nodes);
        }
        internal.heaps.clear();
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.clear();
    }
}
