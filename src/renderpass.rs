// Render pass compilation
//
// Turns a declarative PassData into the vulkan objects a frame needs:
// the VkRenderPass (plus a readback variant when the output would be
// presented), the pipeline layouts, clear values, and a cache of
// pre-warmed descriptor pools.
//
// Austin Shafer - 2024

use ash::vk;

use crate::descriptor::DescriptorPool;
use crate::device::Device;
use crate::graph::{PassData, PassKind, PipelineLayoutData, SubpassData};
use crate::image::aspect_for_format;
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

/// The pixel category of a format, which picks the clear value shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FormatCategory {
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

pub(crate) fn format_category(format: vk::Format) -> FormatCategory {
    let aspect = aspect_for_format(format);
    let depth = aspect.contains(vk::ImageAspectFlags::DEPTH);
    let stencil = aspect.contains(vk::ImageAspectFlags::STENCIL);
    match (depth, stencil) {
        (true, true) => FormatCategory::DepthStencil,
        (true, false) => FormatCategory::Depth,
        (false, true) => FormatCategory::Stencil,
        (false, false) => FormatCategory::Color,
    }
}

/// Derive the clear value for one attachment. Only meaningful when
/// the load op clears, but we emit one entry per attachment since
/// VkRenderPassBeginInfo indexes by attachment position.
pub(crate) fn clear_value_for(format: vk::Format) -> vk::ClearValue {
    match format_category(format) {
        FormatCategory::Color => vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        },
        _ => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    }
}

/// Compute the preserved attachment list for one subpass.
///
/// An attachment whose lifetime spans this subpass (touched by an
/// earlier and a later subpass) but which this subpass neither reads
/// nor writes must be listed as preserved or its contents may be
/// discarded by tilers.
pub(crate) fn preserved_for_subpass(
    subpasses: &[SubpassData],
    attachment_count: usize,
    subpass_idx: usize,
) -> Vec<u32> {
    let touches = |sp: &SubpassData, att: usize| {
        sp.inputs.iter().any(|r| r.attachment == att)
            || sp.outputs.iter().any(|r| r.attachment == att)
            || sp.resolves.iter().any(|r| r.attachment == att)
            || sp.depth_stencil.map(|r| r.attachment == att).unwrap_or(false)
    };

    let mut ret = Vec::new();
    for att in 0..attachment_count {
        if touches(&subpasses[subpass_idx], att) {
            continue;
        }
        let before = subpasses[..subpass_idx].iter().any(|sp| touches(sp, att));
        let after = subpasses[subpass_idx + 1..].iter().any(|sp| touches(sp, att));
        if before && after {
            ret.push(att as u32);
        }
    }
    ret
}

/// Merge declared push constant ranges so each shader stage set ends
/// up with a single covering range.
pub(crate) fn merge_push_constants(
    ranges: &[crate::graph::PushConstantRange],
) -> Vec<vk::PushConstantRange> {
    let mut merged: Vec<vk::PushConstantRange> = Vec::new();
    for r in ranges.iter() {
        if let Some(existing) = merged.iter_mut().find(|m| m.stage_flags == r.stages) {
            let end = (existing.offset + existing.size).max(r.offset + r.size);
            existing.offset = existing.offset.min(r.offset);
            existing.size = end - existing.offset;
        } else {
            merged.push(
                vk::PushConstantRange::builder()
                    .stage_flags(r.stages)
                    .offset(r.offset)
                    .size(r.size)
                    .build(),
            );
        }
    }
    merged
}

/// A compiled pipeline layout: the vulkan object, the set layouts we
/// own, and the sizing info for descriptor pool prewarming.
pub struct PipelineLayout {
    pl_dev: ash::Device,
    pl_layout: vk::PipelineLayout,
    /// layouts we created (the appended bindless layout is not ours)
    pl_owned_set_layouts: Vec<vk::DescriptorSetLayout>,
    /// the full set list as bound, including the bindless slot
    pl_set_layouts: Vec<vk::DescriptorSetLayout>,
    /// totals per descriptor type across our sets
    pl_sizes: Vec<(vk::DescriptorType, u32)>,
    /// (type, array length) per binding, per set
    pl_binding_shapes: Vec<Vec<(vk::DescriptorType, u32)>>,
    pl_update_after_bind: bool,
}

impl PipelineLayout {
    /// Build a layout from its declaration. If the declaration uses
    /// the texture set, the device's bindless layout is appended as
    /// the last set.
    pub fn new(dev: &Device, data: &PipelineLayoutData) -> Result<Arc<Self>> {
        let vkdev = dev.vkdev();
        let mut owned_layouts = Vec::new();
        let mut sizes: Vec<(vk::DescriptorType, u32)> = Vec::new();
        let mut shapes = Vec::new();
        let mut update_after_bind = false;

        for set in data.sets.iter() {
            let mut bindings = Vec::new();
            let mut flags = Vec::new();
            let mut shape = Vec::new();
            let mut set_uab = false;
            for b in set.bindings.iter() {
                bindings.push(
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(b.binding)
                        .descriptor_type(b.descriptor_type)
                        .descriptor_count(b.count)
                        .stage_flags(b.stages)
                        .build(),
                );
                flags.push(if b.update_after_bind {
                    set_uab = true;
                    update_after_bind = true;
                    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
                } else {
                    vk::DescriptorBindingFlags::empty()
                });
                shape.push((b.descriptor_type, b.count));

                match sizes.iter_mut().find(|(ty, _)| *ty == b.descriptor_type) {
                    Some((_, count)) => *count += b.count,
                    None => sizes.push((b.descriptor_type, b.count)),
                }
            }

            let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
                .binding_flags(flags.as_slice())
                .build();
            let mut info = vk::DescriptorSetLayoutCreateInfo::builder()
                .bindings(bindings.as_slice())
                .build();
            if set_uab {
                info.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
            }
            info.p_next = &mut binding_flags as *mut _ as *const std::os::raw::c_void;

            let layout = unsafe {
                vkdev
                    .create_descriptor_set_layout(&info, None)
                    .or(Err(SquallError::INVALID))?
            };
            owned_layouts.push(layout);
            shapes.push(shape);
        }

        let mut all_layouts = owned_layouts.clone();
        if data.uses_texture_set {
            all_layouts.push(dev.texture_layout().vkhandle());
        }

        let push_constants = merge_push_constants(&data.push_constants);
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(all_layouts.as_slice())
            .push_constant_ranges(push_constants.as_slice())
            .build();

        let layout = unsafe {
            vkdev
                .create_pipeline_layout(&info, None)
                .or(Err(SquallError::INVALID))?
        };

        Ok(Arc::new(Self {
            pl_dev: vkdev.clone(),
            pl_layout: layout,
            pl_owned_set_layouts: owned_layouts,
            pl_set_layouts: all_layouts,
            pl_sizes: sizes,
            pl_binding_shapes: shapes,
            pl_update_after_bind: update_after_bind,
        }))
    }

    pub fn vkhandle(&self) -> vk::PipelineLayout {
        self.pl_layout
    }

    pub fn update_after_bind(&self) -> bool {
        self.pl_update_after_bind
    }

    /// Pre-warm one descriptor pool sized to this layout's bindings.
    pub fn new_descriptor_pool(&self) -> Option<Arc<DescriptorPool>> {
        if self.pl_owned_set_layouts.is_empty() {
            return None;
        }
        DescriptorPool::new(
            &self.pl_dev,
            self.pl_sizes.clone(),
            self.pl_owned_set_layouts.as_slice(),
            self.pl_binding_shapes.as_slice(),
            self.pl_update_after_bind,
        )
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.pl_dev.destroy_pipeline_layout(self.pl_layout, None);
            for layout in self.pl_owned_set_layouts.iter() {
                self.pl_dev.destroy_descriptor_set_layout(*layout, None);
            }
        }
    }
}

/// A compiled render pass with its layouts and pool cache.
pub struct RenderPass {
    rp_dev: ash::Device,
    rp_kind: PassKind,
    rp_pass: vk::RenderPass,
    /// readback variant: final PresentSrc layouts rewritten to
    /// TransferSrc, chosen at record time for off-screen targets
    rp_alt_pass: vk::RenderPass,
    rp_clear_values: Vec<vk::ClearValue>,
    rp_layouts: Vec<Arc<PipelineLayout>>,
    rp_pools: Mutex<Vec<(usize, Arc<DescriptorPool>)>>,
}

// vk::ClearValue is a plain data union
unsafe impl Send for RenderPass {}
unsafe impl Sync for RenderPass {}

impl RenderPass {
    /// Compile the pass. Non-graphics passes get layouts and clear
    /// values but no VkRenderPass.
    pub fn compile(dev: &Device, data: &PassData) -> Result<Arc<Self>> {
        let mut layouts = Vec::new();
        for l in data.layouts.iter() {
            layouts.push(PipelineLayout::new(dev, l)?);
        }

        let clear_values = data
            .attachments
            .iter()
            .map(|a| clear_value_for(a.format))
            .collect::<Vec<_>>();

        let (pass, alt_pass) = if data.kind == PassKind::Graphics {
            let main = Self::create_vk_pass(dev, data, false)?;
            let needs_alt = data
                .attachments
                .iter()
                .any(|a| a.final_layout == vk::ImageLayout::PRESENT_SRC_KHR);
            let alt = if needs_alt {
                Self::create_vk_pass(dev, data, true)?
            } else {
                vk::RenderPass::null()
            };
            (main, alt)
        } else {
            (vk::RenderPass::null(), vk::RenderPass::null())
        };

        // pre-warm one descriptor pool per layout
        let mut pools = Vec::new();
        for (i, layout) in layouts.iter().enumerate() {
            if let Some(pool) = layout.new_descriptor_pool() {
                pools.push((i, pool));
            }
        }

        Ok(Arc::new(Self {
            rp_dev: dev.vkdev().clone(),
            rp_kind: data.kind,
            rp_pass: pass,
            rp_alt_pass: alt_pass,
            rp_clear_values: clear_values,
            rp_layouts: layouts,
            rp_pools: Mutex::new(pools),
        }))
    }

    fn create_vk_pass(dev: &Device, data: &PassData, alt: bool) -> Result<vk::RenderPass> {
        let attachments: Vec<_> = data
            .attachments
            .iter()
            .map(|a| {
                let mut final_layout = a.final_layout;
                if alt && final_layout == vk::ImageLayout::PRESENT_SRC_KHR {
                    final_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
                }
                let mut flags = vk::AttachmentDescriptionFlags::empty();
                if a.usage.may_alias() {
                    flags |= vk::AttachmentDescriptionFlags::MAY_ALIAS;
                }
                vk::AttachmentDescription::builder()
                    .flags(flags)
                    .format(a.format)
                    .samples(a.samples)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(a.stencil_load_op)
                    .stencil_store_op(a.stencil_store_op)
                    .initial_layout(a.initial_layout)
                    .final_layout(final_layout)
                    .build()
            })
            .collect();

        // the ref arrays have to stay alive until create_render_pass
        let mut input_refs = Vec::new();
        let mut output_refs = Vec::new();
        let mut resolve_refs = Vec::new();
        let mut depth_refs = Vec::new();
        let mut preserve_lists = Vec::new();
        for (i, sp) in data.subpasses.iter().enumerate() {
            let to_vk = |r: &crate::graph::AttachmentRef| {
                vk::AttachmentReference::builder()
                    .attachment(r.attachment as u32)
                    .layout(r.layout)
                    .build()
            };
            input_refs.push(sp.inputs.iter().map(to_vk).collect::<Vec<_>>());
            output_refs.push(sp.outputs.iter().map(to_vk).collect::<Vec<_>>());
            resolve_refs.push(sp.resolves.iter().map(to_vk).collect::<Vec<_>>());
            depth_refs.push(sp.depth_stencil.as_ref().map(|r| to_vk(r)));
            preserve_lists.push(preserved_for_subpass(
                &data.subpasses,
                data.attachments.len(),
                i,
            ));
        }

        let subpasses: Vec<_> = data
            .subpasses
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(input_refs[i].as_slice())
                    .color_attachments(output_refs[i].as_slice())
                    .preserve_attachments(preserve_lists[i].as_slice());
                if !resolve_refs[i].is_empty() {
                    builder = builder.resolve_attachments(resolve_refs[i].as_slice());
                }
                if let Some(depth) = depth_refs[i].as_ref() {
                    builder = builder.depth_stencil_attachment(depth);
                }
                builder.build()
            })
            .collect();

        let dependencies: Vec<_> = data
            .dependencies
            .iter()
            .map(|d| {
                vk::SubpassDependency::builder()
                    .src_subpass(d.src_subpass)
                    .dst_subpass(d.dst_subpass)
                    .src_stage_mask(d.src_stage)
                    .dst_stage_mask(d.dst_stage)
                    .src_access_mask(d.src_access)
                    .dst_access_mask(d.dst_access)
                    .dependency_flags(if d.by_region {
                        vk::DependencyFlags::BY_REGION
                    } else {
                        vk::DependencyFlags::empty()
                    })
                    .build()
            })
            .collect();

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments.as_slice())
            .subpasses(subpasses.as_slice())
            .dependencies(dependencies.as_slice())
            .build();

        unsafe {
            dev.vkdev()
                .create_render_pass(&info, None)
                .or(Err(SquallError::INVALID_QUEUE_DATA))
        }
    }

    pub fn kind(&self) -> PassKind {
        self.rp_kind
    }

    /// The render pass to begin. `alt` selects the readback variant
    /// when one was compiled.
    pub fn vkhandle(&self, alt: bool) -> vk::RenderPass {
        if alt && self.rp_alt_pass != vk::RenderPass::null() {
            self.rp_alt_pass
        } else {
            self.rp_pass
        }
    }

    pub fn has_alt(&self) -> bool {
        self.rp_alt_pass != vk::RenderPass::null()
    }

    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        self.rp_clear_values.clone()
    }

    pub fn layouts(&self) -> &[Arc<PipelineLayout>] {
        &self.rp_layouts
    }

    pub fn layout(&self, idx: usize) -> Option<&Arc<PipelineLayout>> {
        self.rp_layouts.get(idx)
    }

    /// Take a descriptor pool for a layout from the cache, building a
    /// fresh one when the cache is dry. The frame returns it through
    /// `release_descriptor_pool` on fence retirement.
    pub fn acquire_descriptor_pool(&self, layout_idx: usize) -> Option<Arc<DescriptorPool>> {
        {
            let mut pools = self.rp_pools.lock().unwrap();
            if let Some(pos) = pools.iter().position(|(idx, _)| *idx == layout_idx) {
                return Some(pools.remove(pos).1);
            }
        }
        self.rp_layouts.get(layout_idx)?.new_descriptor_pool()
    }

    pub fn release_descriptor_pool(&self, layout_idx: usize, pool: Arc<DescriptorPool>) {
        self.rp_pools.lock().unwrap().push((layout_idx, pool));
    }

    /// Explicit teardown of the vulkan objects.
    pub fn invalidate(&self) {
        let pools = std::mem::replace(&mut *self.rp_pools.lock().unwrap(), Vec::new());
        for (_, pool) in pools.into_iter() {
            pool.invalidate();
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.invalidate();
        unsafe {
            if self.rp_pass != vk::RenderPass::null() {
                self.rp_dev.destroy_render_pass(self.rp_pass, None);
            }
            if self.rp_alt_pass != vk::RenderPass::null() {
                self.rp_dev.destroy_render_pass(self.rp_alt_pass, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttachmentRef, PushConstantRange};

    fn subpass(
        inputs: &[usize],
        outputs: &[usize],
        depth: Option<usize>,
    ) -> SubpassData {
        let to_ref = |i: &usize| AttachmentRef {
            attachment: *i,
            layout: vk::ImageLayout::GENERAL,
        };
        SubpassData {
            inputs: inputs.iter().map(to_ref).collect(),
            outputs: outputs.iter().map(to_ref).collect(),
            resolves: Vec::new(),
            depth_stencil: depth.map(|i| to_ref(&i)),
        }
    }

    #[test]
    fn format_categories() {
        assert_eq!(
            format_category(vk::Format::B8G8R8A8_UNORM),
            FormatCategory::Color
        );
        assert_eq!(format_category(vk::Format::D32_SFLOAT), FormatCategory::Depth);
        assert_eq!(format_category(vk::Format::S8_UINT), FormatCategory::Stencil);
        assert_eq!(
            format_category(vk::Format::D24_UNORM_S8_UINT),
            FormatCategory::DepthStencil
        );
    }

    #[test]
    fn preserved_attachments_span_gaps() {
        // attachment 0 is written in subpass 0 and read in subpass 2,
        // subpass 1 does not touch it: it must be preserved there
        let subpasses = vec![
            subpass(&[], &[0], None),
            subpass(&[], &[1], None),
            subpass(&[0], &[2], None),
        ];
        assert_eq!(preserved_for_subpass(&subpasses, 3, 1), vec![0]);
        assert!(preserved_for_subpass(&subpasses, 3, 0).is_empty());
        assert!(preserved_for_subpass(&subpasses, 3, 2).is_empty());
    }

    #[test]
    fn push_constant_merging() {
        let ranges = [
            PushConstantRange {
                stages: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 16,
            },
            PushConstantRange {
                stages: vk::ShaderStageFlags::VERTEX,
                offset: 16,
                size: 16,
            },
            PushConstantRange {
                stages: vk::ShaderStageFlags::FRAGMENT,
                offset: 32,
                size: 8,
            },
        ];
        let merged = merge_push_constants(&ranges);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].offset, 0);
        assert_eq!(merged[0].size, 32);
        assert_eq!(merged[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}
