// Font glyph queue
//
// Receives batches of rasterized glyphs and assembles a glyph atlas
// image. Per-glyph bitmaps are cached in a ring of device-local
// buffers keyed by CharId, so re-packing an atlas after growth reuses
// the persistent copies instead of re-uploading from the host.
// Rectangle placement is computed on the CPU by a height-sorted shelf
// packer before any copy is recorded.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::cmd::ImageMemoryBarrier;
use crate::frame::FrameRequest;
use crate::graph::{
    AttachmentData, AttachmentKind, AttachmentPassData, AttachmentUse, PassData, PassKind,
    QueueData,
};
use crate::image::Image;
use crate::memory::AllocationUsage;
use crate::sched::{Loop, LoopEvent, LoopHandle};
use crate::FONT_BUFFER_SIZE;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identity of one glyph: font id, codepoint and anchor corner packed
/// into a single key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharId(u64);

impl CharId {
    pub fn new(font_id: u16, codepoint: u32, anchor: u8) -> Self {
        Self(((font_id as u64) << 40) | ((codepoint as u64) << 8) | anchor as u64)
    }

    pub fn font_id(&self) -> u16 {
        (self.0 >> 40) as u16
    }

    pub fn codepoint(&self) -> u32 {
        ((self.0 >> 8) & 0xffff_ffff) as u32
    }

    pub fn anchor(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

/// Glyph requests arrive pre-rasterized; shaping and rasterization
/// live above this crate.
pub struct GlyphRequest {
    pub id: CharId,
    pub width: u32,
    pub height: u32,
    /// tightly packed single-channel coverage
    pub bitmap: Vec<u8>,
}

/// Where a glyph landed on the atlas.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GlyphPlacement {
    pub id: CharId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Pack rectangles onto an atlas with height-sorted shelves.
///
/// Glyphs are sorted tallest-first, then placed left to right on
/// shelves; a glyph that does not fit the current shelf opens a new
/// one below. Returns None when the atlas cannot hold everything.
pub(crate) fn pack_glyphs(
    atlas_width: u32,
    atlas_height: u32,
    glyphs: &[(CharId, u32, u32)],
) -> Option<Vec<GlyphPlacement>> {
    let mut order: Vec<_> = glyphs.iter().collect();
    order.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)).then(a.0.cmp(&b.0)));

    let mut placements = Vec::with_capacity(order.len());
    let mut shelf_y = 0u32;
    let mut shelf_height = 0u32;
    let mut cursor_x = 0u32;

    for (id, width, height) in order.into_iter() {
        if *width > atlas_width || *height > atlas_height {
            return None;
        }

        if cursor_x + width > atlas_width {
            // open a new shelf below the current one
            shelf_y += shelf_height;
            shelf_height = 0;
            cursor_x = 0;
        }
        if shelf_height == 0 {
            shelf_height = *height;
        }
        if shelf_y + height > atlas_height {
            return None;
        }

        placements.push(GlyphPlacement {
            id: *id,
            x: cursor_x,
            y: shelf_y,
            width: *width,
            height: *height,
        });
        cursor_x += width;
    }

    Some(placements)
}

/// A reserved block in the persistent glyph ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RingSlot {
    pub buffer: usize,
    pub offset: u64,
}

/// CPU-side accounting for the ring of fixed-size glyph buffers.
///
/// Blocks never free individually; the ring only grows, one buffer at
/// a time, when the current buffer cannot fit the next block.
pub(crate) struct GlyphRing {
    capacity: u64,
    buffers: usize,
    cursor: u64,
}

impl GlyphRing {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity,
            buffers: 0,
            cursor: 0,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers
    }

    /// Reserve `size` bytes, returning the slot and whether a new
    /// buffer must be allocated to honor it.
    pub fn reserve(&mut self, size: u64, align: u64) -> Option<(RingSlot, bool)> {
        if size > self.capacity {
            return None;
        }

        let mut grew = false;
        if self.buffers == 0 {
            self.buffers = 1;
            self.cursor = 0;
            grew = true;
        }

        let mut offset = crate::align_up(self.cursor, align);
        if offset + size > self.capacity {
            self.buffers += 1;
            self.cursor = 0;
            offset = 0;
            grew = true;
        }

        self.cursor = offset + size;
        Some((
            RingSlot {
                buffer: self.buffers - 1,
                offset: offset,
            },
            grew,
        ))
    }
}

/// Where a cached glyph's pixels live.
#[derive(Debug, Copy, Clone)]
struct CachedGlyph {
    slot: RingSlot,
    width: u32,
    height: u32,
}

struct PendingFontBatch {
    /// glyphs whose bitmaps ride the staging buffer this frame
    fresh: Vec<(GlyphRequest, RingSlot, GlyphPlacement)>,
    /// glyphs already resident in the ring
    cached: Vec<(CachedGlyph, GlyphPlacement)>,
    atlas: Arc<Image>,
}

struct FontQueueInternal {
    ring: GlyphRing,
    ring_buffers: Vec<Arc<Buffer>>,
    glyphs: HashMap<CharId, CachedGlyph>,
}

/// The glyph upload sub-queue.
pub struct FontQueue {
    fq_dev: Arc<crate::device::Device>,
    fq_loop: LoopHandle,
    fq_queue: Arc<QueueData>,
    fq_internal: Arc<Mutex<FontQueueInternal>>,
    fq_pending: Arc<Mutex<Vec<PendingFontBatch>>>,
    fq_preload_groups: bool,
}

impl FontQueue {
    pub fn new(gpu_loop: &Arc<Loop>, preload_groups: bool) -> Arc<Self> {
        let dev = gpu_loop.device().clone();
        let internal = Arc::new(Mutex::new(FontQueueInternal {
            ring: GlyphRing::new(FONT_BUFFER_SIZE),
            ring_buffers: Vec::new(),
            glyphs: HashMap::new(),
        }));
        let pending: Arc<Mutex<Vec<PendingFontBatch>>> = Arc::new(Mutex::new(Vec::new()));

        let record_pending = pending.clone();
        let record_internal = internal.clone();
        let record_allocator = dev.allocator().clone();
        let queue = {
            let mut ecs_owner = lluvia::Instance::new();
            let attachment = Arc::new(AttachmentData {
                id: ecs_owner.add_entity(),
                name: "glyph-atlas".to_string(),
                kind: AttachmentKind::Image,
                factory: None,
                takes_input: false,
            });
            let pass = Arc::new(PassData {
                id: ecs_owner.add_entity(),
                name: "glyph-upload".to_string(),
                kind: PassKind::Transfer,
                attachments: vec![AttachmentPassData::new(
                    0,
                    AttachmentUse::OUTPUT,
                    vk::Format::R8_UNORM,
                )],
                subpasses: Vec::new(),
                dependencies: Vec::new(),
                layouts: Vec::new(),
                record_fn: Some(Box::new(move |cbuf, _handle| {
                    let batch = match record_pending.lock().unwrap().pop() {
                        Some(b) => b,
                        None => return true,
                    };
                    Self::record_batch(cbuf, batch, &record_internal, &record_allocator)
                })),
            });

            QueueData::new(
                &mut ecs_owner,
                "font-queue".to_string(),
                vec![attachment],
                vec![pass],
            )
        };

        gpu_loop.compile_queue(queue.clone(), None);

        Arc::new(Self {
            fq_dev: dev,
            fq_loop: gpu_loop.handle(),
            fq_queue: queue,
            fq_internal: internal,
            fq_pending: pending,
            fq_preload_groups: preload_groups,
        })
    }

    /// Expand a set of codepoints to their full 64-codepoint groups,
    /// the preload behavior behind `font_preload_groups`.
    pub fn expand_codepoints(&self, codepoints: &[u32]) -> Vec<u32> {
        if !self.fq_preload_groups {
            return codepoints.to_vec();
        }

        let mut groups: Vec<u32> = codepoints.iter().map(|c| c & !0x3f).collect();
        groups.sort_unstable();
        groups.dedup();

        groups
            .into_iter()
            .flat_map(|base| base..base + 64)
            .collect()
    }

    /// Which of the requested glyphs are not yet resident and need
    /// rasterization by the caller.
    pub fn missing_glyphs(&self, ids: &[CharId]) -> Vec<CharId> {
        let internal = self.fq_internal.lock().unwrap();
        ids.iter()
            .filter(|id| !internal.glyphs.contains_key(id))
            .cloned()
            .collect()
    }

    /// Upload a glyph batch and assemble `atlas` from it.
    ///
    /// Newly rasterized glyphs are staged, copied onto the atlas and
    /// installed into the persistent ring; glyphs already resident
    /// copy straight from the ring. `on_complete` gets the final
    /// placements once the GPU work retires.
    pub fn submit(
        &self,
        requests: Vec<GlyphRequest>,
        atlas: Arc<Image>,
        on_complete: Box<dyn FnOnce(Option<Vec<GlyphPlacement>>) + Send>,
    ) {
        let extent = atlas.extent();

        // every glyph this atlas will hold: the fresh ones plus any
        // cached ones being re-packed
        let shapes: Vec<_> = {
            let internal = self.fq_internal.lock().unwrap();
            requests
                .iter()
                .map(|r| (r.id, r.width, r.height))
                .chain(
                    internal
                        .glyphs
                        .iter()
                        .filter(|(id, _)| !requests.iter().any(|r| r.id == **id))
                        .map(|(id, g)| (*id, g.width, g.height)),
                )
                .collect()
        };

        let placements = match pack_glyphs(extent.width, extent.height, &shapes) {
            Some(p) => p,
            None => {
                log::error!(
                    "glyph packing failed: {} glyphs do not fit {}x{}",
                    shapes.len(),
                    extent.width,
                    extent.height
                );
                on_complete(None);
                return;
            }
        };
        let placed: HashMap<CharId, GlyphPlacement> =
            placements.iter().map(|p| (p.id, *p)).collect();

        // reserve ring space for the fresh glyphs and split the batch
        let (fresh, cached) = {
            let mut internal = self.fq_internal.lock().unwrap();
            let mut fresh = Vec::new();
            for request in requests.into_iter() {
                if internal.glyphs.contains_key(&request.id) {
                    continue;
                }
                let size = request.bitmap.len() as u64;
                let (slot, grew) = match internal.ring.reserve(size.max(1), 64) {
                    Some(r) => r,
                    None => {
                        log::error!("glyph of {} bytes exceeds the ring capacity", size);
                        on_complete(None);
                        return;
                    }
                };
                if grew {
                    let buffer = self.fq_dev.allocator().spawn_persistent_buffer(
                        AllocationUsage::DeviceLocal,
                        &BufferInfo::new(
                            FONT_BUFFER_SIZE,
                            vk::BufferUsageFlags::TRANSFER_SRC
                                | vk::BufferUsageFlags::TRANSFER_DST,
                        ),
                        None,
                    );
                    match buffer {
                        Some(b) => internal.ring_buffers.push(b),
                        None => {
                            on_complete(None);
                            return;
                        }
                    }
                }

                let placement = placed[&request.id];
                internal.glyphs.insert(
                    request.id,
                    CachedGlyph {
                        slot: slot,
                        width: request.width,
                        height: request.height,
                    },
                );
                fresh.push((request, slot, placement));
            }

            let cached: Vec<_> = internal
                .glyphs
                .iter()
                .filter(|(id, _)| !fresh.iter().any(|(r, _, _)| r.id == **id))
                .filter_map(|(id, g)| placed.get(id).map(|p| (*g, *p)))
                .collect();
            (fresh, cached)
        };

        self.fq_pending.lock().unwrap().push(PendingFontBatch {
            fresh: fresh,
            cached: cached,
            atlas: atlas,
        });

        let mut frame = FrameRequest::new(self.fq_queue.clone());
        frame.on_complete = Some(Box::new(move |success| {
            on_complete(if success { Some(placements) } else { None });
        }));
        self.fq_loop.post(LoopEvent::SubmitFrame(frame));
    }

    /// Record one batch: stage fresh bitmaps, copy everything onto
    /// the atlas (staging for fresh, ring for cached), then install
    /// the fresh bitmaps into the ring for next time.
    fn record_batch(
        cbuf: &mut crate::cmd::CommandBuffer,
        batch: PendingFontBatch,
        internal: &Arc<Mutex<FontQueueInternal>>,
        allocator: &Arc<crate::memory::Allocator>,
    ) -> bool {
        let ring_buffers: Vec<Arc<Buffer>> = internal.lock().unwrap().ring_buffers.clone();

        let staging_size: u64 = batch
            .fresh
            .iter()
            .map(|(r, _, _)| crate::align_up(r.bitmap.len() as u64, 64))
            .sum();
        let pool = crate::memory::pool::MemoryPool::new(allocator.clone(), true);
        let staging = match pool.spawn_buffer(
            AllocationUsage::HostTransitionSource,
            &BufferInfo::new(staging_size.max(4), vk::BufferUsageFlags::TRANSFER_SRC),
        ) {
            Some(s) => s,
            None => return false,
        };

        // atlas to transfer-dst
        cbuf.cmd_pipeline_barrier(
            &[],
            &[(
                batch.atlas.clone(),
                ImageMemoryBarrier {
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    family: Default::default(),
                    range: batch.atlas.full_subresource_range(),
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                },
            )],
        );

        let copy_region = |offset: u64, p: &GlyphPlacement| {
            vk::BufferImageCopy::builder()
                .buffer_offset(offset)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_offset(vk::Offset3D {
                    x: p.x as i32,
                    y: p.y as i32,
                    z: 0,
                })
                .image_extent(vk::Extent3D {
                    width: p.width,
                    height: p.height,
                    depth: 1,
                })
                .build()
        };

        // fresh glyphs: host -> staging -> atlas, then -> ring
        let mut staging_cursor = 0u64;
        let mut installs: Vec<(usize, vk::BufferCopy)> = Vec::new();
        for (request, slot, placement) in batch.fresh.iter() {
            if !staging.set_data(&request.bitmap, staging_cursor) {
                return false;
            }
            cbuf.cmd_copy_buffer_to_image(
                &staging,
                &batch.atlas,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region(staging_cursor, placement)],
            );
            installs.push((
                slot.buffer,
                vk::BufferCopy::builder()
                    .src_offset(staging_cursor)
                    .dst_offset(slot.offset)
                    .size(request.bitmap.len() as u64)
                    .build(),
            ));
            staging_cursor = crate::align_up(staging_cursor + request.bitmap.len() as u64, 64);
        }

        // cached glyphs: ring -> atlas
        for (glyph, placement) in batch.cached.iter() {
            let buffer = match ring_buffers.get(glyph.slot.buffer) {
                Some(b) => b,
                None => continue,
            };
            cbuf.cmd_copy_buffer_to_image(
                buffer,
                &batch.atlas,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region(glyph.slot.offset, placement)],
            );
        }

        // install the fresh bitmaps into the ring
        for (buffer_idx, copy) in installs.into_iter() {
            if let Some(buffer) = ring_buffers.get(buffer_idx) {
                cbuf.cmd_copy_buffer(&staging, buffer, &[copy]);
            }
        }

        // atlas to its sampling layout
        cbuf.cmd_pipeline_barrier(
            &[],
            &[(
                batch.atlas.clone(),
                ImageMemoryBarrier {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    family: Default::default(),
                    range: batch.atlas.full_subresource_range(),
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                },
            )],
        );

        cbuf.retain(Box::new(pool));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> CharId {
        CharId::new(1, n, 0)
    }

    #[test]
    fn char_id_round_trips() {
        let c = CharId::new(0x1234, 0x1f600, 2);
        assert_eq!(c.font_id(), 0x1234);
        assert_eq!(c.codepoint(), 0x1f600);
        assert_eq!(c.anchor(), 2);
    }

    #[test]
    fn shelf_packing_sorts_by_height() {
        // a short glyph submitted first still packs after the tall one
        let placements =
            pack_glyphs(64, 64, &[(id(1), 10, 4), (id(2), 10, 12)]).unwrap();
        let tall = placements.iter().find(|p| p.id == id(2)).unwrap();
        let short = placements.iter().find(|p| p.id == id(1)).unwrap();
        assert_eq!(tall.x, 0);
        assert_eq!(tall.y, 0);
        // same shelf, to the right of the tall one
        assert_eq!(short.y, 0);
        assert_eq!(short.x, 10);
    }

    #[test]
    fn shelf_packing_wraps_and_rejects_overflow() {
        // three 30-wide glyphs on a 64-wide atlas: two per shelf
        let placements = pack_glyphs(
            64,
            20,
            &[(id(1), 30, 8), (id(2), 30, 8), (id(3), 30, 8)],
        )
        .unwrap();
        let ys: Vec<_> = placements.iter().map(|p| p.y).collect();
        assert!(ys.contains(&0));
        assert!(ys.contains(&8));

        // and a too-small atlas reports failure
        assert!(pack_glyphs(64, 10, &[(id(1), 30, 8), (id(2), 30, 8), (id(3), 30, 8)]).is_none());
    }

    #[test]
    fn glyph_ring_grows_past_one_buffer() {
        let mut ring = GlyphRing::new(100);
        let (slot, grew) = ring.reserve(60, 1).unwrap();
        assert!(grew);
        assert_eq!(slot, RingSlot { buffer: 0, offset: 0 });

        // 60 more does not fit the first buffer, a second opens
        let (slot, grew) = ring.reserve(60, 1).unwrap();
        assert!(grew);
        assert_eq!(slot, RingSlot { buffer: 1, offset: 0 });
        assert_eq!(ring.buffer_count(), 2);

        // the second buffer still has room
        let (slot, grew) = ring.reserve(30, 1).unwrap();
        assert!(!grew);
        assert_eq!(slot, RingSlot { buffer: 1, offset: 60 });

        // oversized blocks are refused outright
        assert!(ring.reserve(101, 1).is_none());
    }
}
