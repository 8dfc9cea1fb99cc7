// Render queue compilation
//
// Takes a declared QueueData and produces its GPU artifacts: shader
// modules, render passes, pipeline layouts and pipelines. Programs
// and samplers compile in parallel on the worker pool; pipelines wait
// on both, and the queue's compiled latch flips once everything
// lands.
//
// Austin Shafer - 2024

use ash::vk;

use crate::device::Device;
use crate::graph::{PassKind, QueueData};
use crate::image::Sampler;
use crate::renderpass::RenderPass;
use crate::sched::{FrameCache, WorkerPool};

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A compiled SPIR-V module.
pub struct ShaderModule {
    sm_dev: ash::Device,
    sm_module: vk::ShaderModule,
    sm_stage: vk::ShaderStageFlags,
    sm_name: String,
}

impl ShaderModule {
    fn new(dev: &Device, name: &str, stage: vk::ShaderStageFlags, spirv: &[u32]) -> Option<Self> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv).build();
        // shader compilation runs on the worker pool, serialize the
        // driver entry
        let module = dev.make_api_call(|vkdev| unsafe { vkdev.create_shader_module(&info, None) });
        match module {
            Ok(m) => Some(Self {
                sm_dev: dev.vkdev().clone(),
                sm_module: m,
                sm_stage: stage,
                sm_name: name.to_string(),
            }),
            Err(e) => {
                log::error!("shader module {} failed to compile: {:?}", name, e);
                None
            }
        }
    }

    pub fn vkhandle(&self) -> vk::ShaderModule {
        self.sm_module
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.sm_stage
    }

    pub fn name(&self) -> &str {
        &self.sm_name
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.sm_dev.destroy_shader_module(self.sm_module, None);
        }
    }
}

/// A compiled pipeline, graphics or compute.
pub struct Pipeline {
    p_dev: ash::Device,
    p_pipeline: vk::Pipeline,
    p_bind_point: vk::PipelineBindPoint,
    p_name: String,
}

impl Pipeline {
    pub fn vkhandle(&self) -> vk::Pipeline {
        self.p_pipeline
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.p_bind_point
    }

    pub fn name(&self) -> &str {
        &self.p_name
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.p_dev.destroy_pipeline(self.p_pipeline, None);
        }
    }
}

/// Everything a compiled queue owns. Dropping this scrubs its render
/// passes out of the frame cache.
pub struct CompiledQueue {
    cq_cache: Arc<FrameCache>,
    cq_render_passes: Vec<Option<Arc<RenderPass>>>,
    cq_programs: Vec<Arc<ShaderModule>>,
    cq_graphic_pipelines: Vec<Arc<Pipeline>>,
    cq_compute_pipelines: Vec<Arc<Pipeline>>,
    cq_samplers: Vec<Arc<Sampler>>,
}

impl CompiledQueue {
    pub fn render_pass(&self, pass_idx: usize) -> Option<Arc<RenderPass>> {
        self.cq_render_passes.get(pass_idx).and_then(|p| p.clone())
    }

    pub fn program(&self, idx: usize) -> Option<&Arc<ShaderModule>> {
        self.cq_programs.get(idx)
    }

    pub fn graphic_pipeline(&self, idx: usize) -> Option<&Arc<Pipeline>> {
        self.cq_graphic_pipelines.get(idx)
    }

    pub fn compute_pipeline(&self, idx: usize) -> Option<&Arc<Pipeline>> {
        self.cq_compute_pipelines.get(idx)
    }

    pub fn samplers(&self) -> &[Arc<Sampler>] {
        &self.cq_samplers
    }
}

impl Drop for CompiledQueue {
    fn drop(&mut self) {
        for pass in self.cq_render_passes.iter().flatten() {
            self.cq_cache.remove_pass(pass);
        }
    }
}

struct CompileState {
    device: Arc<Device>,
    cache: Arc<FrameCache>,
    queue: Arc<QueueData>,
    outstanding: AtomicUsize,
    failed: AtomicBool,
    programs: Mutex<Vec<Option<Arc<ShaderModule>>>>,
    samplers: Mutex<Vec<Option<Arc<Sampler>>>>,
    done_cb: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
}

/// Compiles queues on the worker pool.
pub struct RenderQueueCompiler {}

impl RenderQueueCompiler {
    /// Kick off compilation. `done_cb` runs (from a worker thread)
    /// once the queue's compiled latch flips, with the success bit.
    pub fn compile(
        device: Arc<Device>,
        workers: Arc<WorkerPool>,
        cache: Arc<FrameCache>,
        queue: Arc<QueueData>,
        done_cb: Box<dyn FnOnce(bool) + Send>,
    ) {
        if queue.is_compiled() {
            // compiling twice is a no-op, report the cached outcome
            done_cb(queue.compiled_artifacts().is_some());
            return;
        }

        let program_count = queue.programs.len();
        let sampler_count = queue.samplers.len();

        let state = Arc::new(CompileState {
            device: device,
            cache: cache,
            queue: queue.clone(),
            // programs + samplers + one finalize guard
            outstanding: AtomicUsize::new(program_count + sampler_count + 1),
            failed: AtomicBool::new(false),
            programs: Mutex::new((0..program_count).map(|_| None).collect()),
            samplers: Mutex::new((0..sampler_count).map(|_| None).collect()),
            done_cb: Mutex::new(Some(done_cb)),
        });

        for i in 0..program_count {
            let state = state.clone();
            workers.post(Box::new(move || {
                let p = &state.queue.programs[i];
                match ShaderModule::new(&state.device, &p.name, p.stage, &p.spirv) {
                    Some(module) => {
                        state.programs.lock().unwrap()[i] = Some(Arc::new(module));
                    }
                    None => {
                        state.failed.store(true, Ordering::Release);
                    }
                }
                Self::task_done(&state);
            }));
        }

        for i in 0..sampler_count {
            let state = state.clone();
            workers.post(Box::new(move || {
                let info = &state.queue.samplers[i];
                match state.device.get_sampler(info) {
                    Ok(s) => {
                        state.samplers.lock().unwrap()[i] = Some(s);
                    }
                    Err(e) => {
                        log::error!("sampler compilation failed: {:?}", e);
                        state.failed.store(true, Ordering::Release);
                    }
                }
                Self::task_done(&state);
            }));
        }

        // the guard task: ensures finalize runs even for queues with
        // no programs or samplers
        let guard_state = state;
        workers.post(Box::new(move || {
            Self::task_done(&guard_state);
        }));
    }

    fn task_done(state: &Arc<CompileState>) {
        if state.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        Self::finalize(state);
    }

    /// All parallel tasks are in: build render passes and pipelines,
    /// then flip the queue's compiled latch.
    fn finalize(state: &Arc<CompileState>) {
        if state.failed.load(Ordering::Acquire) {
            Self::report(state, None);
            return;
        }

        let queue = &state.queue;
        let mut render_passes = Vec::with_capacity(queue.passes.len());
        for pass in queue.passes.iter() {
            match pass.kind {
                PassKind::Graphics | PassKind::Compute | PassKind::Transfer => {
                    match RenderPass::compile(&state.device, pass) {
                        Ok(rp) => render_passes.push(Some(rp)),
                        Err(e) => {
                            log::error!("pass {} failed to compile: {:?}", pass.name, e);
                            Self::report(state, None);
                            return;
                        }
                    }
                }
                PassKind::Generic => render_passes.push(None),
            }
        }

        let programs: Vec<_> = state
            .programs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.clone())
            .collect();
        let samplers: Vec<_> = state
            .samplers
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.clone())
            .collect();
        if programs.len() != queue.programs.len() || samplers.len() != queue.samplers.len() {
            Self::report(state, None);
            return;
        }

        // compiled samplers feed the bindless sampler binding
        if !samplers.is_empty() {
            state.device.texture_layout().set_samplers(samplers.clone());
        }

        let mut graphic_pipelines = Vec::new();
        for decl in queue.graphic_pipelines.iter() {
            let rp = match render_passes.get(decl.pass).and_then(|p| p.as_ref()) {
                Some(rp) => rp,
                None => {
                    log::error!("pipeline {} references a pass with no artifacts", decl.name);
                    Self::report(state, None);
                    return;
                }
            };
            match Self::build_graphic_pipeline(&state.device, decl, rp, &programs) {
                Some(p) => graphic_pipelines.push(Arc::new(p)),
                None => {
                    Self::report(state, None);
                    return;
                }
            }
        }

        let mut compute_pipelines = Vec::new();
        for decl in queue.compute_pipelines.iter() {
            let rp = match render_passes.get(decl.pass).and_then(|p| p.as_ref()) {
                Some(rp) => rp,
                None => {
                    log::error!("pipeline {} references a pass with no artifacts", decl.name);
                    Self::report(state, None);
                    return;
                }
            };
            match Self::build_compute_pipeline(&state.device, decl, rp, &programs) {
                Some(p) => compute_pipelines.push(Arc::new(p)),
                None => {
                    Self::report(state, None);
                    return;
                }
            }
        }

        let artifacts = Arc::new(CompiledQueue {
            cq_cache: state.cache.clone(),
            cq_render_passes: render_passes,
            cq_programs: programs,
            cq_graphic_pipelines: graphic_pipelines,
            cq_compute_pipelines: compute_pipelines,
            cq_samplers: samplers,
        });
        Self::report(state, Some(artifacts));
    }

    fn report(state: &Arc<CompileState>, artifacts: Option<Arc<CompiledQueue>>) {
        let success = artifacts.is_some();
        state.queue.set_compiled(artifacts);
        if let Some(cb) = state.done_cb.lock().unwrap().take() {
            cb(success);
        }
    }

    fn build_graphic_pipeline(
        device: &Arc<Device>,
        decl: &crate::graph::GraphicPipelineData,
        render_pass: &Arc<RenderPass>,
        programs: &[Arc<ShaderModule>],
    ) -> Option<Pipeline> {
        let layout = match render_pass.layout(decl.layout) {
            Some(l) => l,
            None => {
                log::error!("pipeline {} references unknown layout", decl.name);
                return None;
            }
        };

        let entry = CString::new("main").unwrap();
        let mut stages = Vec::new();
        for shader_idx in decl.shaders.iter() {
            let module = match programs.get(*shader_idx) {
                Some(m) => m,
                None => {
                    log::error!("pipeline {} references unknown program", decl.name);
                    return None;
                }
            };
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(module.stage())
                    .module(module.vkhandle())
                    .name(&entry)
                    .build(),
            );
        }

        // vertex data arrives through storage buffers indexed in the
        // shader, so the fixed-function vertex input stays empty
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder().build();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build();
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0)
            .build();
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()];
        let blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(false)
            .depth_write_enable(false)
            .build();

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages.as_slice())
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .depth_stencil_state(&depth_stencil)
            .layout(layout.vkhandle())
            .render_pass(render_pass.vkhandle(false))
            .subpass(decl.subpass)
            .build();

        let pipelines = device.make_api_call(|vkdev| unsafe {
            vkdev.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        });
        match pipelines {
            Ok(mut p) => Some(Pipeline {
                p_dev: device.vkdev().clone(),
                p_pipeline: p.remove(0),
                p_bind_point: vk::PipelineBindPoint::GRAPHICS,
                p_name: decl.name.clone(),
            }),
            Err((_, e)) => {
                log::error!("graphics pipeline {} failed: {:?}", decl.name, e);
                None
            }
        }
    }

    fn build_compute_pipeline(
        device: &Arc<Device>,
        decl: &crate::graph::ComputePipelineData,
        render_pass: &Arc<RenderPass>,
        programs: &[Arc<ShaderModule>],
    ) -> Option<Pipeline> {
        let layout = match render_pass.layout(decl.layout) {
            Some(l) => l,
            None => {
                log::error!("pipeline {} references unknown layout", decl.name);
                return None;
            }
        };
        let module = match programs.get(decl.shader) {
            Some(m) => m,
            None => {
                log::error!("pipeline {} references unknown program", decl.name);
                return None;
            }
        };

        let entry = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module.vkhandle())
            .name(&entry)
            .build();

        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout.vkhandle())
            .build();

        let pipelines = device.make_api_call(|vkdev| unsafe {
            vkdev.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        });
        match pipelines {
            Ok(mut p) => Some(Pipeline {
                p_dev: device.vkdev().clone(),
                p_pipeline: p.remove(0),
                p_bind_point: vk::PipelineBindPoint::COMPUTE,
                p_name: decl.name.clone(),
            }),
            Err((_, e)) => {
                log::error!("compute pipeline {} failed: {:?}", decl.name, e);
                None
            }
        }
    }
}
