// Compiled render queue input
//
// These are the declarative structures the runtime consumes: a DAG of
// passes and attachments with their layouts, programs and pipelines.
// The builder living above this crate produces them; everything here
// is plain data plus the compiled-state latch.
//
// Austin Shafer - 2024

use ash::vk;
use lluvia as ll;

use crate::cmd::CommandBuffer;
use crate::frame::PassHandle;
use crate::image::SamplerInfo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What kind of backing object an attachment resolves to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Buffer,
    Generic,
}

/// What kind of queue work a pass records.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PassKind {
    Graphics,
    Compute,
    Transfer,
    Generic,
}

bitflags! {
    /// How a pass touches one of its attachments.
    pub struct AttachmentUse: u32 {
        const INPUT = 1;
        const OUTPUT = 1 << 1;
        const RESOLVE = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
    }
}

impl AttachmentUse {
    /// Aliasing is possible when the attachment is read and written
    /// within the same pass.
    pub fn may_alias(&self) -> bool {
        self.contains(AttachmentUse::INPUT)
            && (self.contains(AttachmentUse::OUTPUT)
                || self.contains(AttachmentUse::DEPTH_STENCIL))
    }
}

/// Per-pass settings for one attachment slot.
#[derive(Debug, Clone)]
pub struct AttachmentPassData {
    /// index into the queue's attachment list
    pub attachment: usize,
    pub usage: AttachmentUse,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentPassData {
    pub fn new(attachment: usize, usage: AttachmentUse, format: vk::Format) -> Self {
        Self {
            attachment: attachment,
            usage: usage,
            format: format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::GENERAL,
        }
    }
}

/// A reference from a subpass to one of the pass's attachment slots.
#[derive(Debug, Copy, Clone)]
pub struct AttachmentRef {
    /// index into PassData::attachments
    pub attachment: usize,
    pub layout: vk::ImageLayout,
}

/// One subpass of a graphics pass.
#[derive(Debug, Clone, Default)]
pub struct SubpassData {
    pub inputs: Vec<AttachmentRef>,
    pub outputs: Vec<AttachmentRef>,
    pub resolves: Vec<AttachmentRef>,
    pub depth_stencil: Option<AttachmentRef>,
}

/// An execution dependency between two subpasses.
#[derive(Debug, Copy, Clone)]
pub struct SubpassDependency {
    /// vk::SUBPASS_EXTERNAL for edges into/out of the pass
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

/// One binding within a declared descriptor set layout.
#[derive(Debug, Clone)]
pub struct DescriptorBindingData {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    /// may this binding be rewritten while the set is in use
    pub update_after_bind: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutData {
    pub bindings: Vec<DescriptorBindingData>,
}

#[derive(Debug, Copy, Clone)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// A declared pipeline layout: descriptor sets plus push constants.
/// When `uses_texture_set` is on, the device's bindless layout is
/// appended as the last set at compile time.
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutData {
    pub sets: Vec<DescriptorSetLayoutData>,
    pub push_constants: Vec<PushConstantRange>,
    pub uses_texture_set: bool,
}

/// A SPIR-V shader program to compile.
pub struct ProgramData {
    pub name: String,
    pub stage: vk::ShaderStageFlags,
    pub spirv: Vec<u32>,
}

/// A graphics pipeline declaration, referencing programs by index.
pub struct GraphicPipelineData {
    pub name: String,
    /// index into QueueData::passes
    pub pass: usize,
    pub subpass: u32,
    /// index into the pass's layouts
    pub layout: usize,
    /// indices into QueueData::programs
    pub shaders: Vec<usize>,
}

/// A compute pipeline declaration.
pub struct ComputePipelineData {
    pub name: String,
    pub pass: usize,
    pub layout: usize,
    pub shader: usize,
}

/// The recording callback for a pass: gets the command buffer mid
/// recording and the pass handle for resource lookups.
pub type PassRecordFn = Box<dyn Fn(&mut CommandBuffer, &PassHandle) -> bool + Send + Sync>;

/// One pass of the queue DAG.
pub struct PassData {
    pub id: ll::Entity,
    pub name: String,
    pub kind: PassKind,
    pub attachments: Vec<AttachmentPassData>,
    pub subpasses: Vec<SubpassData>,
    pub dependencies: Vec<SubpassDependency>,
    pub layouts: Vec<PipelineLayoutData>,
    /// records the pass's commands; graphics passes run inside their
    /// render pass, others record raw commands
    pub record_fn: Option<PassRecordFn>,
}

impl PassData {
    /// The attachments this pass must wait on before recording.
    pub fn input_attachments(&self) -> impl Iterator<Item = usize> + '_ {
        self.attachments
            .iter()
            .filter(|a| a.usage.contains(AttachmentUse::INPUT))
            .map(|a| a.attachment)
    }

    /// The attachments this pass produces.
    pub fn output_attachments(&self) -> impl Iterator<Item = usize> + '_ {
        self.attachments
            .iter()
            .filter(|a| {
                a.usage.contains(AttachmentUse::OUTPUT)
                    || a.usage.contains(AttachmentUse::DEPTH_STENCIL)
                    || a.usage.contains(AttachmentUse::RESOLVE)
            })
            .map(|a| a.attachment)
    }
}

/// The backing object behind an attachment for one frame.
#[derive(Clone)]
pub enum AttachmentBacking {
    Image(Arc<crate::image::Image>),
    Buffer(Arc<crate::buffer::Buffer>),
    None,
}

/// Builds the per-frame backing object for an attachment from the
/// request's input blob.
pub type AttachmentFactoryFn =
    Box<dyn Fn(&crate::device::Device, Option<&[u8]>) -> Option<AttachmentBacking> + Send + Sync>;

/// One attachment slot of the queue DAG.
pub struct AttachmentData {
    pub id: ll::Entity,
    pub name: String,
    pub kind: AttachmentKind,
    /// materializes the frame's backing object; None means the frame
    /// must receive the backing externally (swapchain images)
    pub factory: Option<AttachmentFactoryFn>,
    /// does this attachment receive external input data per frame
    pub takes_input: bool,
}

/// A compiled render queue: the DAG of passes and attachments, the
/// declared programs/pipelines/samplers, and the compile latch.
///
/// The artifacts themselves (modules, pipelines, render passes) are
/// attached by the RenderQueueCompiler.
pub struct QueueData {
    pub id: ll::Entity,
    pub name: String,
    pub attachments: Vec<Arc<AttachmentData>>,
    pub passes: Vec<Arc<PassData>>,
    pub programs: Vec<ProgramData>,
    pub graphic_pipelines: Vec<GraphicPipelineData>,
    pub compute_pipelines: Vec<ComputePipelineData>,
    pub samplers: Vec<SamplerInfo>,
    compiled: AtomicBool,
    compiled_artifacts: Mutex<Option<Arc<crate::compiler::CompiledQueue>>>,
    compile_waiters: Mutex<Vec<Box<dyn FnOnce(bool) + Send>>>,
}

impl QueueData {
    pub fn new(
        ecs: &mut ll::Instance,
        name: String,
        attachments: Vec<Arc<AttachmentData>>,
        passes: Vec<Arc<PassData>>,
    ) -> Arc<Self> {
        Self::new_with_pipelines(
            ecs,
            name,
            attachments,
            passes,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn new_with_pipelines(
        ecs: &mut ll::Instance,
        name: String,
        attachments: Vec<Arc<AttachmentData>>,
        passes: Vec<Arc<PassData>>,
        programs: Vec<ProgramData>,
        graphic_pipelines: Vec<GraphicPipelineData>,
        compute_pipelines: Vec<ComputePipelineData>,
        samplers: Vec<SamplerInfo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ecs.add_entity(),
            name: name,
            attachments: attachments,
            passes: passes,
            programs: programs,
            graphic_pipelines: graphic_pipelines,
            compute_pipelines: compute_pipelines,
            samplers: samplers,
            compiled: AtomicBool::new(false),
            compiled_artifacts: Mutex::new(None),
            compile_waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    pub fn compiled_artifacts(&self) -> Option<Arc<crate::compiler::CompiledQueue>> {
        self.compiled_artifacts.lock().unwrap().clone()
    }

    /// Latch the queue as compiled and publish its artifacts. Calling
    /// this twice has the same effect as once: the first artifacts
    /// win and waiters fire a single time.
    pub fn set_compiled(&self, artifacts: Option<Arc<crate::compiler::CompiledQueue>>) {
        if self.compiled.swap(true, Ordering::AcqRel) {
            return;
        }

        let success = artifacts.is_some();
        *self.compiled_artifacts.lock().unwrap() = artifacts;

        let waiters =
            std::mem::replace(&mut *self.compile_waiters.lock().unwrap(), Vec::new());
        for w in waiters.into_iter() {
            w(success);
        }
    }

    /// Run `cb` once compilation finishes, or now if it already has.
    pub fn on_compiled(&self, cb: Box<dyn FnOnce(bool) + Send>) {
        if self.is_compiled() {
            cb(self.compiled_artifacts().is_some());
            return;
        }
        let mut waiters = self.compile_waiters.lock().unwrap();
        // the latch may have flipped while we took the lock
        if self.is_compiled() {
            drop(waiters);
            cb(self.compiled_artifacts().is_some());
            return;
        }
        waiters.push(cb);
    }

    /// Which pass produces each attachment, or None for attachments
    /// fed from outside.
    pub fn producers(&self) -> Vec<Option<usize>> {
        let mut ret = vec![None; self.attachments.len()];
        for (pass_idx, pass) in self.passes.iter().enumerate() {
            for att in pass.output_attachments() {
                if ret[att].is_none() {
                    ret[att] = Some(pass_idx);
                }
            }
        }
        ret
    }

    /// The next pass after `pass_idx` that reads `attachment`, which
    /// is who a producer must hand queue family ownership to.
    pub fn next_consumer(&self, pass_idx: usize, attachment: usize) -> Option<usize> {
        self.passes
            .iter()
            .enumerate()
            .skip(pass_idx + 1)
            .find(|(_, pass)| pass.input_attachments().any(|a| a == attachment))
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(ecs: &mut ll::Instance, name: &str) -> Arc<AttachmentData> {
        Arc::new(AttachmentData {
            id: ecs.add_entity(),
            name: name.to_string(),
            kind: AttachmentKind::Image,
            factory: None,
            takes_input: false,
        })
    }

    fn pass(ecs: &mut ll::Instance, kind: PassKind, atts: Vec<(usize, AttachmentUse)>) -> Arc<PassData> {
        Arc::new(PassData {
            id: ecs.add_entity(),
            name: "pass".to_string(),
            kind: kind,
            attachments: atts
                .into_iter()
                .map(|(a, usage)| AttachmentPassData::new(a, usage, vk::Format::R8G8B8A8_UNORM))
                .collect(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            layouts: Vec::new(),
            record_fn: None,
        })
    }

    #[test]
    fn producers_and_consumers() {
        let mut ecs = ll::Instance::new();
        let atts = vec![attachment(&mut ecs, "a"), attachment(&mut ecs, "b")];
        // pass 0 writes 0, pass 1 reads 0 and writes 1, pass 2 reads 1
        let passes = vec![
            pass(&mut ecs, PassKind::Transfer, vec![(0, AttachmentUse::OUTPUT)]),
            pass(
                &mut ecs,
                PassKind::Graphics,
                vec![(0, AttachmentUse::INPUT), (1, AttachmentUse::OUTPUT)],
            ),
            pass(&mut ecs, PassKind::Graphics, vec![(1, AttachmentUse::INPUT)]),
        ];
        let queue = QueueData::new(&mut ecs, "q".to_string(), atts, passes);

        assert_eq!(queue.producers(), vec![Some(0), Some(1)]);
        assert_eq!(queue.next_consumer(0, 0), Some(1));
        assert_eq!(queue.next_consumer(1, 1), Some(2));
        assert_eq!(queue.next_consumer(1, 0), None);
        assert_eq!(queue.next_consumer(2, 1), None);
    }

    #[test]
    fn compile_latch_is_idempotent() {
        let mut ecs = ll::Instance::new();
        let queue = QueueData::new(&mut ecs, "q".to_string(), Vec::new(), Vec::new());

        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        queue.on_compiled(Box::new(move |success| {
            assert!(!success);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        queue.set_compiled(None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(queue.is_compiled());

        // a second latch has no further effect
        queue.set_compiled(None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // late registrants observe the cached outcome immediately
        let h = hits.clone();
        queue.on_compiled(Box::new(move |success| {
            assert!(!success);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
