// Mesh compilation
//
// Compacts a mesh set's index and vertex data into two device-local
// buffers. Meshes carried over from the previous set are copied
// buffer-to-buffer on the GPU instead of being uploaded from the host
// again.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::frame::FrameRequest;
use crate::graph::{
    AttachmentData, AttachmentKind, AttachmentPassData, AttachmentUse, PassData, PassKind,
    QueueData,
};
use crate::memory::AllocationUsage;
use crate::sched::{Loop, LoopEvent, LoopHandle};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type MeshId = u64;

/// Host-side mesh data for upload.
pub struct MeshData {
    pub id: MeshId,
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
}

/// Where one mesh landed in the compacted buffers.
#[derive(Debug, Copy, Clone)]
pub struct MeshEntry {
    pub vertex_offset: u64,
    pub vertex_len: u64,
    pub index_offset: u64,
    pub index_len: u64,
}

/// A compiled mesh set: two packed buffers plus the lookup table.
pub struct MeshSet {
    pub vertex_buffer: Arc<Buffer>,
    pub index_buffer: Arc<Buffer>,
    pub entries: HashMap<MeshId, MeshEntry>,
}

/// Compute the compacted placement for a mesh list.
///
/// Returns per-mesh entries plus the total sizes of the two buffers.
/// Offsets stay 4-byte aligned so index reads never straddle.
pub(crate) fn compact_entries(
    meshes: &[(MeshId, u64, u64)],
) -> (HashMap<MeshId, MeshEntry>, u64, u64) {
    let mut entries = HashMap::new();
    let mut vertex_cursor = 0u64;
    let mut index_cursor = 0u64;
    for (id, vertex_len, index_len) in meshes.iter() {
        entries.insert(
            *id,
            MeshEntry {
                vertex_offset: vertex_cursor,
                vertex_len: *vertex_len,
                index_offset: index_cursor,
                index_len: *index_len,
            },
        );
        vertex_cursor = crate::align_up(vertex_cursor + vertex_len, 4);
        index_cursor = crate::align_up(index_cursor + index_len, 4);
    }
    (entries, vertex_cursor, index_cursor)
}

struct PendingCompile {
    meshes: Vec<MeshData>,
    prior: Option<Arc<MeshSet>>,
    target: Arc<MeshSet>,
}

/// The mesh sub-queue.
pub struct MeshCompiler {
    mc_dev: Arc<crate::device::Device>,
    mc_loop: LoopHandle,
    mc_queue: Arc<QueueData>,
    mc_pending: Arc<Mutex<Vec<PendingCompile>>>,
}

impl MeshCompiler {
    pub fn new(gpu_loop: &Arc<Loop>) -> Arc<Self> {
        let dev = gpu_loop.device().clone();
        let pending: Arc<Mutex<Vec<PendingCompile>>> = Arc::new(Mutex::new(Vec::new()));

        let record_pending = pending.clone();
        let record_allocator = dev.allocator().clone();
        let queue = {
            let mut ecs_owner = lluvia::Instance::new();
            let attachment = Arc::new(AttachmentData {
                id: ecs_owner.add_entity(),
                name: "mesh-set".to_string(),
                kind: AttachmentKind::Buffer,
                factory: None,
                takes_input: false,
            });
            let pass = Arc::new(PassData {
                id: ecs_owner.add_entity(),
                name: "mesh-compact".to_string(),
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
                    let compile = match record_pending.lock().unwrap().pop() {
                        Some(c) => c,
                        None => return true,
                    };
                    Self::record_compile(cbuf, compile, &record_allocator)
                })),
            });

            QueueData::new(
                &mut ecs_owner,
                "mesh-queue".to_string(),
                vec![attachment],
                vec![pass],
            )
        };

        gpu_loop.compile_queue(queue.clone(), None);

        Arc::new(Self {
            mc_dev: dev,
            mc_loop: gpu_loop.handle(),
            mc_queue: queue,
            mc_pending: pending,
        })
    }

    /// Compile a new mesh set.
    ///
    /// `prior` enables carry-over: meshes whose id already lives in
    /// the prior set are copied on-device from the old packed buffers.
    /// `on_complete` receives the new set once its uploads retire.
    pub fn compile(
        &self,
        meshes: Vec<MeshData>,
        prior: Option<Arc<MeshSet>>,
        on_complete: Box<dyn FnOnce(Option<Arc<MeshSet>>) + Send>,
    ) {
        let shapes: Vec<_> = meshes
            .iter()
            .map(|m| (m.id, m.vertices.len() as u64, m.indices.len() as u64))
            .collect();
        let (entries, vertex_total, index_total) = compact_entries(&shapes);

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::TRANSFER_SRC;
        let vertex_buffer = self.mc_dev.allocator().spawn_persistent_buffer(
            AllocationUsage::DeviceLocal,
            &BufferInfo::new(
                vertex_total.max(4),
                usage | vk::BufferUsageFlags::VERTEX_BUFFER,
            ),
            None,
        );
        let index_buffer = self.mc_dev.allocator().spawn_persistent_buffer(
            AllocationUsage::DeviceLocal,
            &BufferInfo::new(index_total.max(4), usage | vk::BufferUsageFlags::INDEX_BUFFER),
            None,
        );

        let (vertex_buffer, index_buffer) = match (vertex_buffer, index_buffer) {
            (Some(v), Some(i)) => (v, i),
            _ => {
                log::error!("mesh compile: buffer allocation failed");
                on_complete(None);
                return;
            }
        };

        let target = Arc::new(MeshSet {
            vertex_buffer: vertex_buffer,
            index_buffer: index_buffer,
            entries: entries,
        });

        self.mc_pending.lock().unwrap().push(PendingCompile {
            meshes: meshes,
            prior: prior,
            target: target.clone(),
        });

        let mut frame = FrameRequest::new(self.mc_queue.clone());
        frame.on_complete = Some(Box::new(move |success| {
            on_complete(if success { Some(target) } else { None });
        }));
        self.mc_loop.post(LoopEvent::SubmitFrame(frame));
    }

    /// Record one compile: carried-over meshes copy device-to-device,
    /// new meshes stage from the host.
    fn record_compile(
        cbuf: &mut crate::cmd::CommandBuffer,
        compile: PendingCompile,
        allocator: &Arc<crate::memory::Allocator>,
    ) -> bool {
        let target = &compile.target;

        // split into carried-over and fresh meshes
        let mut fresh_bytes = 0u64;
        for mesh in compile.meshes.iter() {
            let carried = compile
                .prior
                .as_ref()
                .and_then(|p| p.entries.get(&mesh.id))
                .is_some();
            if !carried {
                fresh_bytes += mesh.vertices.len() as u64 + mesh.indices.len() as u64;
            }
        }

        let pool = crate::memory::pool::MemoryPool::new(allocator.clone(), true);
        let staging = if fresh_bytes > 0 {
            match pool.spawn_buffer(
                AllocationUsage::HostTransitionSource,
                &BufferInfo::new(fresh_bytes.max(4), vk::BufferUsageFlags::TRANSFER_SRC),
            ) {
                Some(s) => s,
                None => return false,
            }
        } else {
            match pool.spawn_buffer(
                AllocationUsage::HostTransitionSource,
                &BufferInfo::new(4, vk::BufferUsageFlags::TRANSFER_SRC),
            ) {
                Some(s) => s,
                None => return false,
            }
        };

        let mut staging_cursor = 0u64;
        for mesh in compile.meshes.iter() {
            let entry = target.entries[&mesh.id];
            let prior_entry = compile
                .prior
                .as_ref()
                .and_then(|p| p.entries.get(&mesh.id).map(|e| (p, *e)));

            match prior_entry {
                Some((prior, old)) => {
                    // on-device copy from the previous packed buffers
                    if old.vertex_len > 0 {
                        cbuf.cmd_copy_buffer(
                            &prior.vertex_buffer,
                            &target.vertex_buffer,
                            &[vk::BufferCopy::builder()
                                .src_offset(old.vertex_offset)
                                .dst_offset(entry.vertex_offset)
                                .size(old.vertex_len)
                                .build()],
                        );
                    }
                    if old.index_len > 0 {
                        cbuf.cmd_copy_buffer(
                            &prior.index_buffer,
                            &target.index_buffer,
                            &[vk::BufferCopy::builder()
                                .src_offset(old.index_offset)
                                .dst_offset(entry.index_offset)
                                .size(old.index_len)
                                .build()],
                        );
                    }
                }
                None => {
                    if !mesh.vertices.is_empty() {
                        if !staging.set_data(&mesh.vertices, staging_cursor) {
                            return false;
                        }
                        cbuf.cmd_copy_buffer(
                            &staging,
                            &target.vertex_buffer,
                            &[vk::BufferCopy::builder()
                                .src_offset(staging_cursor)
                                .dst_offset(entry.vertex_offset)
                                .size(mesh.vertices.len() as u64)
                                .build()],
                        );
                        staging_cursor += mesh.vertices.len() as u64;
                    }
                    if !mesh.indices.is_empty() {
                        if !staging.set_data(&mesh.indices, staging_cursor) {
                            return false;
                        }
                        cbuf.cmd_copy_buffer(
                            &staging,
                            &target.index_buffer,
                            &[vk::BufferCopy::builder()
                                .src_offset(staging_cursor)
                                .dst_offset(entry.index_offset)
                                .size(mesh.indices.len() as u64)
                                .build()],
                        );
                        staging_cursor += mesh.indices.len() as u64;
                    }
                }
            }
        }

        // make the packed buffers visible to their consumers
        let barrier = |_buffer: &Arc<Buffer>| crate::cmd::BufferMemoryBarrier {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::INDEX_READ,
            family: Default::default(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER,
        };
        cbuf.cmd_pipeline_barrier(
            &[
                (target.vertex_buffer.clone(), barrier(&target.vertex_buffer)),
                (target.index_buffer.clone(), barrier(&target.index_buffer)),
            ],
            &[],
        );

        cbuf.retain(Box::new(pool));
        if let Some(prior) = compile.prior {
            // the old set must survive until our copies execute
            cbuf.retain(Box::new(prior));
        }
        cbuf.retain(Box::new(target.clone()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_is_dense_and_aligned() {
        let (entries, vertex_total, index_total) =
            compact_entries(&[(1, 30, 6), (2, 16, 12), (3, 5, 3)]);

        assert_eq!(entries[&1].vertex_offset, 0);
        // 30 rounds to 32
        assert_eq!(entries[&2].vertex_offset, 32);
        assert_eq!(entries[&3].vertex_offset, 48);
        assert_eq!(vertex_total, 56);

        assert_eq!(entries[&1].index_offset, 0);
        assert_eq!(entries[&2].index_offset, 8);
        assert_eq!(entries[&3].index_offset, 20);
        assert_eq!(index_total, 24);
    }

    #[test]
    fn empty_set_compacts_to_nothing() {
        let (entries, v, i) = compact_entries(&[]);
        assert!(entries.is_empty());
        assert_eq!(v, 0);
        assert_eq!(i, 0);
    }
}
