// Descriptor set management
//
// Descriptor pools are created per pipeline layout and recycled
// through the render pass cache. Each allocated set remembers what is
// bound at every array index so unchanged writes can be skipped, and
// runs of changed indices collapse into single writes.
//
// Austin Shafer - 2024

use ash::vk;
use ash::vk::Handle;

use crate::buffer::Buffer;
use crate::image::{ImageView, Sampler};

use std::sync::{Arc, Mutex};

/// A resource bound (or bindable) at one descriptor array index.
#[derive(Clone)]
pub enum BoundResource {
    Image {
        view: Arc<ImageView>,
        sampler: Option<Arc<Sampler>>,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
}

impl BoundResource {
    /// Identity key for change detection. Two resources with equal
    /// keys produce identical descriptor contents.
    fn key(&self) -> (u64, u64, u64) {
        match self {
            BoundResource::Image {
                view,
                sampler,
                layout,
            } => (
                view.vkhandle().as_raw(),
                sampler
                    .as_ref()
                    .map(|s| s.vkhandle().as_raw())
                    .unwrap_or(0),
                layout.as_raw() as u64,
            ),
            BoundResource::Buffer {
                buffer,
                offset,
                range,
            } => (buffer.vkhandle().as_raw(), *offset, *range),
        }
    }

    pub fn same_as(&self, other: &BoundResource) -> bool {
        self.key() == other.key()
    }
}

/// Collapse a dirty bitmap into (first, count) runs.
///
/// Each run becomes one VkWriteDescriptorSet with dstArrayElement =
/// first. Clean gaps split runs.
pub(crate) fn coalesce_ranges(dirty: &[bool]) -> Vec<(u32, u32)> {
    let mut ret = Vec::new();
    let mut run_start: Option<usize> = None;

    for (i, d) in dirty.iter().enumerate() {
        match (run_start, *d) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                ret.push((start as u32, (i - start) as u32));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        ret.push((start as u32, (dirty.len() - start) as u32));
    }
    ret
}

/// The contents of one descriptor binding: an array of slots tracking
/// what was last written at each index.
pub struct DescriptorBinding {
    pub descriptor_type: vk::DescriptorType,
    pub(crate) slots: Vec<Option<BoundResource>>,
}

impl DescriptorBinding {
    pub fn new(descriptor_type: vk::DescriptorType, count: usize) -> Self {
        Self {
            descriptor_type: descriptor_type,
            slots: (0..count).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&BoundResource> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Is writing `new` at `index` a change?
    pub fn is_dirty(&self, index: usize, new: &BoundResource) -> bool {
        match self.get(index) {
            Some(old) => !old.same_as(new),
            None => true,
        }
    }

    /// Apply a batch of candidate writes, returning the dirty bitmap
    /// over the whole array. Slots whose value is unchanged stay
    /// clean.
    pub fn apply(&mut self, updates: &[(u32, BoundResource)]) -> Vec<bool> {
        let mut dirty = vec![false; self.slots.len()];
        for (index, new) in updates.iter() {
            let i = *index as usize;
            if i >= self.slots.len() {
                log::error!(
                    "descriptor write at index {} past binding length {}",
                    i,
                    self.slots.len()
                );
                continue;
            }
            if self.is_dirty(i, new) {
                self.slots[i] = Some(new.clone());
                dirty[i] = true;
            }
        }
        dirty
    }
}

/// One allocated descriptor set with its binding records.
pub struct DescriptorSetBindings {
    pub(crate) set: vk::DescriptorSet,
    pub(crate) bindings: Mutex<Vec<DescriptorBinding>>,
}

impl DescriptorSetBindings {
    pub fn vkhandle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Write a batch of updates to one binding, emitting the minimum
    /// number of VkWriteDescriptorSets. Returns how many writes were
    /// issued; zero when everything matched what was already bound.
    pub fn update(
        &self,
        dev: &ash::Device,
        binding_idx: u32,
        updates: &[(u32, BoundResource)],
    ) -> usize {
        let mut bindings = self.bindings.lock().unwrap();
        let binding = match bindings.get_mut(binding_idx as usize) {
            Some(b) => b,
            None => {
                log::error!("descriptor update against unknown binding {}", binding_idx);
                return 0;
            }
        };

        let dirty = binding.apply(updates);
        let ranges = coalesce_ranges(&dirty);
        if ranges.is_empty() {
            return 0;
        }

        // per-range info arrays must outlive the vk write structs
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut writes = Vec::with_capacity(ranges.len());

        for (first, count) in ranges.iter() {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(self.set)
                .dst_binding(binding_idx)
                .dst_array_element(*first)
                .descriptor_type(binding.descriptor_type);

            let is_image = match binding.slots[*first as usize].as_ref().unwrap() {
                BoundResource::Image { .. } => true,
                BoundResource::Buffer { .. } => false,
            };

            if is_image {
                let infos: Vec<_> = (*first..*first + *count)
                    .map(|i| match binding.slots[i as usize].as_ref().unwrap() {
                        BoundResource::Image {
                            view,
                            sampler,
                            layout,
                        } => vk::DescriptorImageInfo::builder()
                            .sampler(
                                sampler
                                    .as_ref()
                                    .map(|s| s.vkhandle())
                                    .unwrap_or(vk::Sampler::null()),
                            )
                            .image_view(view.vkhandle())
                            .image_layout(*layout)
                            .build(),
                        _ => panic!("mixed resource kinds within one binding range"),
                    })
                    .collect();
                image_infos.push(infos);
                write = write.image_info(image_infos.last().unwrap().as_slice());
            } else {
                let infos: Vec<_> = (*first..*first + *count)
                    .map(|i| match binding.slots[i as usize].as_ref().unwrap() {
                        BoundResource::Buffer {
                            buffer,
                            offset,
                            range,
                        } => vk::DescriptorBufferInfo::builder()
                            .buffer(buffer.vkhandle())
                            .offset(*offset)
                            .range(*range)
                            .build(),
                        _ => panic!("mixed resource kinds within one binding range"),
                    })
                    .collect();
                buffer_infos.push(infos);
                write = write.buffer_info(buffer_infos.last().unwrap().as_slice());
            }

            writes.push(write.build());
        }

        let emitted = writes.len();
        unsafe {
            dev.update_descriptor_sets(writes.as_slice(), &[]);
        }
        emitted
    }
}

/// A descriptor pool sized for one pipeline layout.
pub struct DescriptorPool {
    dp_dev: ash::Device,
    dp_pool: Mutex<vk::DescriptorPool>,
    dp_sets: Vec<Arc<DescriptorSetBindings>>,
}

impl DescriptorPool {
    /// Build a pool and allocate one set per layout up front.
    ///
    /// `sizes` is the (type, count) total across the layout's
    /// bindings; we sort it by type so identical layouts produce
    /// identical pools. `binding_shapes` describes, per set, each
    /// binding's type and array length for the tracking records.
    pub fn new(
        dev: &ash::Device,
        mut sizes: Vec<(vk::DescriptorType, u32)>,
        set_layouts: &[vk::DescriptorSetLayout],
        binding_shapes: &[Vec<(vk::DescriptorType, u32)>],
        update_after_bind: bool,
    ) -> Option<Arc<Self>> {
        if set_layouts.is_empty() {
            return None;
        }
        sizes.sort_by_key(|(ty, _)| ty.as_raw());

        let pool_sizes: Vec<_> = sizes
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(ty, count)| {
                vk::DescriptorPoolSize::builder()
                    .ty(*ty)
                    .descriptor_count(*count)
                    .build()
            })
            .collect();

        let mut flags = vk::DescriptorPoolCreateFlags::empty();
        if update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .pool_sizes(pool_sizes.as_slice())
            .max_sets(set_layouts.len() as u32)
            .build();

        let pool = match unsafe { dev.create_descriptor_pool(&info, None) } {
            Ok(p) => p,
            Err(e) => {
                log::error!("vkCreateDescriptorPool failed: {:?}", e);
                return None;
            }
        };

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(set_layouts)
            .build();
        let raw_sets = match unsafe { dev.allocate_descriptor_sets(&alloc_info) } {
            Ok(s) => s,
            Err(e) => {
                log::error!("vkAllocateDescriptorSets failed: {:?}", e);
                unsafe { dev.destroy_descriptor_pool(pool, None) };
                return None;
            }
        };

        let sets = raw_sets
            .into_iter()
            .enumerate()
            .map(|(i, set)| {
                let bindings = binding_shapes
                    .get(i)
                    .map(|shape| {
                        shape
                            .iter()
                            .map(|(ty, count)| DescriptorBinding::new(*ty, *count as usize))
                            .collect()
                    })
                    .unwrap_or_else(Vec::new);
                Arc::new(DescriptorSetBindings {
                    set: set,
                    bindings: Mutex::new(bindings),
                })
            })
            .collect();

        Some(Arc::new(Self {
            dp_dev: dev.clone(),
            dp_pool: Mutex::new(pool),
            dp_sets: sets,
        }))
    }

    pub fn sets(&self) -> &[Arc<DescriptorSetBindings>] {
        &self.dp_sets
    }

    pub fn set(&self, idx: usize) -> Option<&Arc<DescriptorSetBindings>> {
        self.dp_sets.get(idx)
    }

    pub fn vk_sets(&self) -> Vec<vk::DescriptorSet> {
        self.dp_sets.iter().map(|s| s.set).collect()
    }

    /// Explicit teardown. Drop only logs if this was skipped.
    pub fn invalidate(&self) {
        let mut pool = self.dp_pool.lock().unwrap();
        if *pool != vk::DescriptorPool::null() {
            unsafe {
                self.dp_dev.destroy_descriptor_pool(*pool, None);
            }
            *pool = vk::DescriptorPool::null();
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        let pool = *self.dp_pool.lock().unwrap();
        if pool != vk::DescriptorPool::null() {
            log::warn!("DescriptorPool dropped while still live");
            unsafe {
                self.dp_dev.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_empty_and_full() {
        assert!(coalesce_ranges(&[false, false, false]).is_empty());
        assert_eq!(coalesce_ranges(&[true, true, true]), vec![(0, 3)]);
    }

    #[test]
    fn coalesce_gaps_split_runs() {
        // dirty at 0..2 and 4, clean gap at 2..4
        assert_eq!(
            coalesce_ranges(&[true, true, false, false, true]),
            vec![(0, 2), (4, 1)]
        );
    }

    #[test]
    fn coalesce_single_update_in_sparse_set() {
        // a set bound at {0, 2, 5} where only slot 2 changed: exactly
        // one write with dstArrayElement=2, descriptorCount=1
        let mut dirty = vec![false; 6];
        dirty[2] = true;
        assert_eq!(coalesce_ranges(&dirty), vec![(2, 1)]);
    }
}
