// Material compilation
//
// Streams material set changes (add/update/remove) into the bindless
// texture set and the material data buffer. Only one compilation is
// in flight per target at a time: requests that arrive while one runs
// coalesce, keeping the newest version of each material and carrying
// everyone's events and callbacks forward.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{Buffer, BufferInfo};
use crate::frame::FrameRequest;
use crate::graph::{
    AttachmentData, AttachmentKind, AttachmentPassData, AttachmentUse, PassData, PassKind,
    QueueData,
};
use crate::image::ImageView;
use crate::memory::AllocationUsage;
use crate::sched::{Loop, LoopEvent, LoopHandle};
use crate::sync::DependencyEvent;
use crate::textureset::{MaterialImageSlot, MaterialLayout, TextureSet, TextureSetLayout};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub type MaterialId = u64;

/// One material's resolved resources and shader-visible data.
#[derive(Clone)]
pub struct Material {
    pub id: MaterialId,
    /// newer versions win when requests coalesce
    pub version: u64,
    pub images: Vec<(Arc<ImageView>, u32)>,
    pub buffers: Vec<Arc<Buffer>>,
    /// packed per-material data for the material buffer
    pub data: Vec<u8>,
}

/// A batch of material changes from the caller.
pub struct MaterialInputData {
    pub materials: Vec<Material>,
    pub remove: Vec<MaterialId>,
    /// events forwarded to the compilation that actually runs
    pub signal_events: Vec<Arc<DependencyEvent>>,
    pub on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

/// Coalesced state of requests waiting for the in-flight compilation.
struct MaterialRequest {
    latest: HashMap<MaterialId, Material>,
    remove: HashSet<MaterialId>,
    signal_events: Vec<Arc<DependencyEvent>>,
    callbacks: Vec<Box<dyn FnOnce(bool) + Send>>,
}

impl MaterialRequest {
    fn new() -> Self {
        Self {
            latest: HashMap::new(),
            remove: HashSet::new(),
            signal_events: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Fold another input into this request. The newest version of
    /// each material survives; a remove cancels a queued update.
    fn merge(&mut self, mut input: MaterialInputData) {
        for mat in input.materials.drain(..) {
            self.remove.remove(&mat.id);
            match self.latest.get(&mat.id) {
                Some(existing) if existing.version >= mat.version => {}
                _ => {
                    self.latest.insert(mat.id, mat);
                }
            }
        }
        for id in input.remove.drain(..) {
            self.latest.remove(&id);
            self.remove.insert(id);
        }
        self.signal_events.append(&mut input.signal_events);
        if let Some(cb) = input.on_complete.take() {
            self.callbacks.push(cb);
        }
    }

    fn is_empty(&self) -> bool {
        self.latest.is_empty() && self.remove.is_empty()
    }
}

/// The live material table: which material owns which bindless slots.
struct MaterialTable {
    materials: HashMap<MaterialId, Material>,
    /// image slot index -> owning material
    image_slots: Vec<Option<MaterialId>>,
    buffer_slots: Vec<Option<MaterialId>>,
    data_buffer: Option<Arc<Buffer>>,
}

impl MaterialTable {
    /// Apply a request and rebuild the slot tables.
    fn apply(&mut self, request: &mut MaterialRequest) {
        for id in request.remove.drain() {
            self.materials.remove(&id);
        }
        for (id, mat) in request.latest.drain() {
            self.materials.insert(id, mat);
        }

        for slot in self.image_slots.iter_mut() {
            *slot = None;
        }
        for slot in self.buffer_slots.iter_mut() {
            *slot = None;
        }

        // deterministic slot assignment: materials in id order
        let mut ids: Vec<_> = self.materials.keys().cloned().collect();
        ids.sort_unstable();
        let mut image_cursor = 0;
        let mut buffer_cursor = 0;
        for id in ids.into_iter() {
            let mat = &self.materials[&id];
            for _ in mat.images.iter() {
                if image_cursor < self.image_slots.len() {
                    self.image_slots[image_cursor] = Some(id);
                    image_cursor += 1;
                }
            }
            for _ in mat.buffers.iter() {
                if buffer_cursor < self.buffer_slots.len() {
                    self.buffer_slots[buffer_cursor] = Some(id);
                    buffer_cursor += 1;
                }
            }
        }
    }

    /// Flatten into the layout consumed by TextureSet::write.
    fn to_layout(&self) -> MaterialLayout {
        let mut layout = MaterialLayout::default();
        layout.images = vec![None; self.image_slots.len()];
        layout.buffers = vec![None; self.buffer_slots.len()];

        let mut ids: Vec<_> = self.materials.keys().cloned().collect();
        ids.sort_unstable();
        let mut image_cursor = 0;
        let mut buffer_cursor = 0;
        for id in ids.into_iter() {
            let mat = &self.materials[&id];
            for (view, sampler_idx) in mat.images.iter() {
                if image_cursor < layout.images.len() {
                    layout.images[image_cursor] = Some(MaterialImageSlot {
                        view: view.clone(),
                        sampler_idx: *sampler_idx,
                    });
                    image_cursor += 1;
                }
            }
            for buffer in mat.buffers.iter() {
                if buffer_cursor < layout.buffers.len() {
                    layout.buffers[buffer_cursor] = Some(buffer.clone());
                    buffer_cursor += 1;
                }
            }
        }
        layout
    }

    /// Concatenated per-material data, in slot order.
    fn pack_data(&self) -> Vec<u8> {
        let mut ids: Vec<_> = self.materials.keys().cloned().collect();
        ids.sort_unstable();
        let mut ret = Vec::new();
        for id in ids.into_iter() {
            ret.extend_from_slice(&self.materials[&id].data);
        }
        ret
    }
}

struct CompilerInternal {
    in_flight: bool,
    pending: MaterialRequest,
    table: MaterialTable,
    texture_set: Option<Arc<TextureSet>>,
}

/// Compiles material changes into the texture set and data buffer.
pub struct MaterialCompiler {
    mc_dev: Arc<crate::device::Device>,
    mc_loop: LoopHandle,
    mc_layout: Arc<TextureSetLayout>,
    mc_queue: Arc<QueueData>,
    mc_internal: Arc<Mutex<CompilerInternal>>,
    /// next batch's packed data, consumed by the recorded pass
    mc_upload: Arc<Mutex<Option<(Arc<Buffer>, Vec<u8>)>>>,
}

impl MaterialCompiler {
    pub fn new(gpu_loop: &Arc<Loop>) -> Arc<Self> {
        let dev = gpu_loop.device().clone();
        let layout = dev.texture_layout().clone();

        let upload: Arc<Mutex<Option<(Arc<Buffer>, Vec<u8>)>>> = Arc::new(Mutex::new(None));
        let record_upload = upload.clone();
        let record_allocator = dev.allocator().clone();

        let queue = {
            let mut ecs_owner = lluvia::Instance::new();
            let attachment = Arc::new(AttachmentData {
                id: ecs_owner.add_entity(),
                name: "material-set".to_string(),
                kind: AttachmentKind::Buffer,
                factory: None,
                takes_input: false,
            });
            let pass = Arc::new(PassData {
                id: ecs_owner.add_entity(),
                name: "material-upload".to_string(),
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
                    let (target, data) = match record_upload.lock().unwrap().take() {
                        Some(u) => u,
                        None => return true,
                    };
                    // stream the packed data through the host map when
                    // possible, else stage and copy
                    if target.is_host_visible() {
                        return target.set_data(&data, 0);
                    }

                    let pool = crate::memory::pool::MemoryPool::new(
                        record_allocator.clone(),
                        true,
                    );
                    let staging = match pool.spawn_buffer(
                        AllocationUsage::HostTransitionSource,
                        &BufferInfo::new(
                            data.len().max(4) as u64,
                            vk::BufferUsageFlags::TRANSFER_SRC,
                        ),
                    ) {
                        Some(s) => s,
                        None => return false,
                    };
                    if !staging.set_data(&data, 0) {
                        return false;
                    }
                    cbuf.cmd_copy_buffer(
                        &staging,
                        &target,
                        &[vk::BufferCopy::builder().size(data.len() as u64).build()],
                    );
                    cbuf.retain(Box::new(pool));
                    true
                })),
            });

            QueueData::new(
                &mut ecs_owner,
                "material-queue".to_string(),
                vec![attachment],
                vec![pass],
            )
        };

        gpu_loop.compile_queue(queue.clone(), None);

        let image_slots = layout.image_count() as usize;
        let buffer_slots = layout.buffer_count() as usize;

        Arc::new(Self {
            mc_dev: dev,
            mc_loop: gpu_loop.handle(),
            mc_layout: layout,
            mc_queue: queue,
            mc_internal: Arc::new(Mutex::new(CompilerInternal {
                in_flight: false,
                pending: MaterialRequest::new(),
                table: MaterialTable {
                    materials: HashMap::new(),
                    image_slots: vec![None; image_slots],
                    buffer_slots: vec![None; buffer_slots],
                    data_buffer: None,
                },
                texture_set: None,
            })),
            mc_upload: upload,
        })
    }

    /// The texture set holding the current material bindings.
    pub fn texture_set(&self) -> Option<Arc<TextureSet>> {
        self.mc_internal.lock().unwrap().texture_set.clone()
    }

    /// The packed material data buffer.
    pub fn data_buffer(&self) -> Option<Arc<Buffer>> {
        self.mc_internal.lock().unwrap().table.data_buffer.clone()
    }

    /// Queue a batch of material changes.
    pub fn submit(self: &Arc<Self>, input: MaterialInputData) {
        let launch = {
            let mut internal = self.mc_internal.lock().unwrap();
            internal.pending.merge(input);
            if internal.in_flight || internal.pending.is_empty() {
                false
            } else {
                internal.in_flight = true;
                true
            }
        };

        if launch {
            self.launch();
        }
    }

    /// Run one compilation over the coalesced pending request.
    fn launch(self: &Arc<Self>) {
        let (layout, data, events, callbacks) = {
            let mut internal = self.mc_internal.lock().unwrap();
            let mut request = std::mem::replace(&mut internal.pending, MaterialRequest::new());
            let events = std::mem::replace(&mut request.signal_events, Vec::new());
            let callbacks = std::mem::replace(&mut request.callbacks, Vec::new());
            internal.table.apply(&mut request);
            (internal.table.to_layout(), internal.table.pack_data(), events, callbacks)
        };

        // sync the bindless set to the new slot tables
        let set = match self.mc_layout.acquire_set() {
            Some(s) => s,
            None => {
                self.finish(false, events, callbacks);
                return;
            }
        };
        set.write_samplers();
        let writes = set.write(&layout);
        log::debug!("material compile: {} descriptor writes", writes);

        // (re)build the data buffer when the packed size grows
        let target = {
            let mut internal = self.mc_internal.lock().unwrap();
            internal.texture_set = Some(set);

            let needed = data.len().max(16) as u64;
            let rebuild = internal
                .table
                .data_buffer
                .as_ref()
                .map(|b| b.size() < needed)
                .unwrap_or(true);
            if rebuild {
                internal.table.data_buffer = self.mc_dev.allocator().spawn_persistent_buffer(
                    AllocationUsage::DeviceLocalHostVisible,
                    &BufferInfo::new(
                        needed.next_power_of_two(),
                        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                    ),
                    None,
                );
            }
            internal.table.data_buffer.clone()
        };

        let target = match target {
            Some(t) => t,
            None => {
                self.finish(false, events, callbacks);
                return;
            }
        };

        *self.mc_upload.lock().unwrap() = Some((target, data));

        let compiler = self.clone();
        let mut frame = FrameRequest::new(self.mc_queue.clone());
        frame.signal_events = events;
        frame.on_complete = Some(Box::new(move |success| {
            compiler.on_compiled(success);
        }));
        for cb in callbacks.into_iter() {
            // every coalesced caller hears about this run
            let chain = frame.on_complete.take();
            frame.on_complete = Some(Box::new(move |success| {
                cb(success);
                if let Some(chain) = chain {
                    chain(success);
                }
            }));
        }

        self.mc_loop.post(LoopEvent::SubmitFrame(frame));
    }

    fn on_compiled(self: &Arc<Self>, success: bool) {
        if !success {
            log::error!("material compilation failed");
        }

        let relaunch = {
            let mut internal = self.mc_internal.lock().unwrap();
            if internal.pending.is_empty() {
                internal.in_flight = false;
                false
            } else {
                true
            }
        };

        if relaunch {
            self.launch();
        }
    }

    fn finish(
        &self,
        success: bool,
        events: Vec<Arc<DependencyEvent>>,
        callbacks: Vec<Box<dyn FnOnce(bool) + Send>>,
    ) {
        for e in events.iter() {
            e.signal(success);
        }
        for cb in callbacks.into_iter() {
            cb(success);
        }
        let mut internal = self.mc_internal.lock().unwrap();
        internal.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(id: MaterialId, version: u64) -> Material {
        Material {
            id: id,
            version: version,
            images: Vec::new(),
            buffers: Vec::new(),
            data: vec![id as u8; 4],
        }
    }

    #[test]
    fn requests_coalesce_to_latest_version() {
        let mut req = MaterialRequest::new();
        req.merge(MaterialInputData {
            materials: vec![material(1, 1), material(2, 1)],
            remove: Vec::new(),
            signal_events: Vec::new(),
            on_complete: None,
        });
        // a newer version of material 1 replaces the queued one
        req.merge(MaterialInputData {
            materials: vec![material(1, 3)],
            remove: Vec::new(),
            signal_events: Vec::new(),
            on_complete: None,
        });
        // an older straggler does not
        req.merge(MaterialInputData {
            materials: vec![material(1, 2)],
            remove: Vec::new(),
            signal_events: Vec::new(),
            on_complete: None,
        });

        assert_eq!(req.latest[&1].version, 3);
        assert_eq!(req.latest[&2].version, 1);
    }

    #[test]
    fn remove_cancels_queued_update() {
        let mut req = MaterialRequest::new();
        req.merge(MaterialInputData {
            materials: vec![material(7, 1)],
            remove: Vec::new(),
            signal_events: Vec::new(),
            on_complete: None,
        });
        req.merge(MaterialInputData {
            materials: Vec::new(),
            remove: vec![7],
            signal_events: Vec::new(),
            on_complete: None,
        });
        assert!(req.latest.is_empty());
        assert!(req.remove.contains(&7));

        // and a later add revives it
        req.merge(MaterialInputData {
            materials: vec![material(7, 2)],
            remove: Vec::new(),
            signal_events: Vec::new(),
            on_complete: None,
        });
        assert!(req.latest.contains_key(&7));
        assert!(!req.remove.contains(&7));
    }
}
