// Vulkan device representation
//
// This stores per-GPU state: the logical device, the allocator, the
// queue family scheduling records, the bindless texture layout and
// the per-device caches for samplers and format features.
//
// Austin Shafer - 2024

use ash::extensions::khr;
use ash::vk;

use crate::cmd::CommandPool;
use crate::image::{Sampler, SamplerInfo};
use crate::instance::{Instance, PhysicalDeviceInfo};
use crate::memory::Allocator;
use crate::queue::{DeviceQueue, DeviceQueueFamily, IdleFlags, QueueOperations, QueueSet};
use crate::sync::{Fence, FenceType, Semaphore};
use crate::textureset::TextureSetLayout;
use crate::{CreateInfo, Result, SquallError};

use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::{Arc, Mutex};

/// The queue classes we materialize logical families for.
const QUEUE_CLASSES: [QueueOperations; 4] = [
    QueueOperations::GRAPHICS,
    QueueOperations::PRESENT,
    QueueOperations::TRANSFER,
    QueueOperations::COMPUTE,
];

/// Squall Device
///
/// This holds all of the Vulkan logic for one GPU.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device backing it
    pub(crate) pdev_info: PhysicalDeviceInfo,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) queues: QueueSet,
    pub(crate) texture_layout: Arc<TextureSetLayout>,
    /// loads swapchain extension entry points
    pub(crate) swapchain_loader: khr::Swapchain,
    pub(crate) surface_loader: khr::Surface,
    /// sync-fd export, present when the extension is and the caller
    /// asked for external fence sync
    pub(crate) external_fence_loader: Option<khr::ExternalFenceFd>,
    pub(crate) use_external_fence_sync: bool,
    /// idle flags forced on every submit for this device
    pub(crate) submit_idle_flags: IdleFlags,
    /// serializes API calls some drivers cannot take concurrently
    d_api_mutex: Mutex<()>,
    /// compiled sampler cache
    d_samplers: Mutex<HashMap<SamplerInfo, Arc<Sampler>>>,
    /// per-format feature cache
    d_format_features: Mutex<HashMap<vk::Format, vk::FormatProperties>>,
}

impl Device {
    /// Decide which queue family serves each operation class.
    ///
    /// Transfer and compute prefer dedicated families so copies and
    /// dispatches do not contend with rendering. Classes collapse
    /// onto the same family when the hardware offers nothing better.
    fn assign_queue_families(pdev_info: &PhysicalDeviceInfo) -> HashMap<u32, QueueOperations> {
        let mut assignments: HashMap<u32, QueueOperations> = HashMap::new();

        for class in QUEUE_CLASSES.iter() {
            let dedicated = pdev_info.queue_families.iter().find(|f| {
                f.ops.contains(*class)
                    && match *class {
                        QueueOperations::TRANSFER => {
                            !f.ops.contains(QueueOperations::GRAPHICS)
                                && !f.ops.contains(QueueOperations::COMPUTE)
                        }
                        QueueOperations::COMPUTE => !f.ops.contains(QueueOperations::GRAPHICS),
                        _ => true,
                    }
            });
            let family = dedicated.or_else(|| {
                pdev_info
                    .queue_families
                    .iter()
                    .find(|f| f.ops.contains(*class))
            });

            if let Some(f) = family {
                *assignments.entry(f.index).or_insert(QueueOperations::empty()) |= *class;
            }
        }

        assignments
    }

    /// AND a requested feature struct against the supported one.
    ///
    /// VkPhysicalDeviceFeatures is a flat run of VkBool32s, so the
    /// can-enable check walks it as one.
    fn mask_features(
        requested: &mut vk::PhysicalDeviceFeatures,
        supported: &vk::PhysicalDeviceFeatures,
    ) {
        let count = std::mem::size_of::<vk::PhysicalDeviceFeatures>()
            / std::mem::size_of::<vk::Bool32>();
        unsafe {
            let req =
                std::slice::from_raw_parts_mut(requested as *mut _ as *mut vk::Bool32, count);
            let sup = std::slice::from_raw_parts(supported as *const _ as *const vk::Bool32, count);
            for (r, s) in req.iter_mut().zip(sup.iter()) {
                if *r != 0 && *s == 0 {
                    *r = 0;
                }
            }
        }
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// Create a logical device for interfacing with the physical
    /// device. The features we turn on are the descriptor indexing
    /// set needed for the bindless texture arrays, gated on what the
    /// probe found.
    fn create_device(
        inst: &ash::Instance,
        pdev_info: &PhysicalDeviceInfo,
        create_info: &CreateInfo,
        queue_families: &[(u32, u32)],
    ) -> Result<ash::Device> {
        let mut dev_extension_names = vec![khr::Swapchain::name().as_ptr()];

        let portability_name =
            unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_portability_subset\0") };
        if pdev_info.features.portability {
            dev_extension_names.push(portability_name.as_ptr());
        }
        let extra_exts = create_info
            .device_extensions_cb
            .as_ref()
            .map(|cb| cb(pdev_info))
            .unwrap_or_else(Vec::new);
        for e in extra_exts.iter() {
            if !pdev_info.has_extension(e) {
                log::error!("Requested device extension {:?} is not available", e);
                return Err(SquallError::EXTENSION_NOT_PRESENT);
            }
            dev_extension_names.push(e.as_ptr());
        }

        // the application can override the core feature set, but only
        // features the hardware reports stay enabled
        let mut features = match create_info.device_features_cb.as_ref() {
            Some(cb) => cb(pdev_info),
            None => vk::PhysicalDeviceFeatures::builder().build(),
        };
        let supported = unsafe { inst.get_physical_device_features(pdev_info.pdev) };
        Self::mask_features(&mut features, &supported);

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_indexing(pdev_info.features.desc_indexing)
            .shader_sampled_image_array_non_uniform_indexing(pdev_info.features.desc_indexing)
            .runtime_descriptor_array(pdev_info.features.desc_indexing)
            .descriptor_binding_variable_descriptor_count(pdev_info.features.variable_count)
            .descriptor_binding_partially_bound(pdev_info.features.partially_bound)
            .descriptor_binding_sampled_image_update_after_bind(
                pdev_info.features.update_after_bind,
            )
            .descriptor_binding_storage_buffer_update_after_bind(
                pdev_info.features.update_after_bind,
            )
            .build();

        // one priority per queue, all equal
        let priorities = [1.0f32; 8];
        let mut queue_infos = Vec::new();
        for (index, count) in queue_families.iter() {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*index)
                    .queue_priorities(&priorities[0..*count as usize])
                    .build(),
            );
        }

        let devinfo = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_slice())
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .push_next(&mut vulkan12_features)
            .build();

        unsafe {
            inst.create_device(pdev_info.pdev, &devinfo, None)
                .map_err(|e| SquallError::from_vk(e).unwrap_or(SquallError::INVALID))
        }
    }

    /// Create a new Device for the configured physical device.
    pub fn new(instance: Arc<Instance>, info: &CreateInfo) -> Result<Arc<Self>> {
        let pdev_info = instance.select_pdev_info(info)?.clone();
        if !pdev_info.features.desc_indexing {
            log::error!(
                "Device {} does not support descriptor indexing",
                pdev_info.name
            );
            return Err(SquallError::FEATURE_NOT_PRESENT);
        }

        let assignments = Self::assign_queue_families(&pdev_info);
        let queue_counts: Vec<(u32, u32)> = assignments
            .iter()
            .map(|(index, _)| {
                let fam = pdev_info
                    .queue_families
                    .iter()
                    .find(|f| f.index == *index)
                    .unwrap();
                (*index, fam.count.min(4))
            })
            .collect();

        let dev = Self::create_device(&instance.inst, &pdev_info, info, &queue_counts)?;

        // materialize the logical family records with their free
        // queue lists and a pre-warmed command pool each
        let mut families = Vec::new();
        for (index, count) in queue_counts.iter() {
            let fam_info = pdev_info
                .queue_families
                .iter()
                .find(|f| f.index == *index)
                .unwrap();
            let preferred = assignments[index];

            let queues = (0..*count)
                .map(|i| {
                    let queue = unsafe { dev.get_device_queue(*index, i) };
                    DeviceQueue::new(&dev, queue, *index, fam_info.ops)
                })
                .collect::<Vec<_>>();

            let mut pools = Vec::new();
            if let Some(pool) = CommandPool::new(
                &dev,
                *index,
                fam_info.ops,
                pdev_info.features.portability,
                true,
            ) {
                pools.push(Arc::new(pool));
            }

            families.push(DeviceQueueFamily {
                index: *index,
                count: *count,
                preferred: preferred,
                ops: fam_info.ops,
                transfer_granularity: fam_info.transfer_granularity,
                queues: queues,
                pools: pools,
                waiters: std::collections::VecDeque::new(),
            });
        }

        let allocator = Arc::new(Allocator::new(
            dev.clone(),
            instance.inst.clone(),
            &pdev_info,
        ));

        let texture_layout = TextureSetLayout::new(
            &dev,
            &allocator,
            &pdev_info,
            info.max_texture_set_images,
            info.max_texture_set_buffers,
        )?;

        let submit_idle_flags = if pdev_info.features.portability {
            IdleFlags::POST_QUEUE
        } else {
            IdleFlags::empty()
        };

        let swapchain_loader = khr::Swapchain::new(&instance.inst, &dev);
        let surface_loader = khr::Surface::new(&instance.loader, &instance.inst);
        let external_fence_loader = if pdev_info.features.external_fence_fd {
            Some(khr::ExternalFenceFd::new(&instance.inst, &dev))
        } else {
            None
        };
        let use_external_fence_sync =
            info.use_external_fence_sync && pdev_info.features.external_fence_fd;

        Ok(Arc::new(Self {
            inst: instance,
            dev: dev,
            pdev_info: pdev_info,
            allocator: allocator,
            queues: QueueSet::new(families),
            texture_layout: texture_layout,
            swapchain_loader: swapchain_loader,
            surface_loader: surface_loader,
            external_fence_loader: external_fence_loader,
            use_external_fence_sync: use_external_fence_sync,
            submit_idle_flags: submit_idle_flags,
            d_api_mutex: Mutex::new(()),
            d_samplers: Mutex::new(HashMap::new()),
            d_format_features: Mutex::new(HashMap::new()),
        }))
    }

    pub fn vkdev(&self) -> &ash::Device {
        &self.dev
    }

    pub fn pdev_info(&self) -> &PhysicalDeviceInfo {
        &self.pdev_info
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn texture_layout(&self) -> &Arc<TextureSetLayout> {
        &self.texture_layout
    }

    /// Serialize an API call that some drivers cannot handle from
    /// multiple threads at once. Worker-pool code must route its
    /// vulkan calls through here.
    pub fn make_api_call<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ash::Device) -> R,
    {
        let _guard = self.d_api_mutex.lock().unwrap();
        f(&self.dev)
    }

    /// Get a compiled sampler, deduped by its parameters.
    pub fn get_sampler(&self, info: &SamplerInfo) -> Result<Arc<Sampler>> {
        let mut cache = self.d_samplers.lock().unwrap();
        if let Some(s) = cache.get(info) {
            return Ok(s.clone());
        }
        let sampler = Sampler::new(&self.dev, info)?;
        cache.insert(info.clone(), sampler.clone());
        Ok(sampler)
    }

    /// Query (and cache) the feature flags for a format.
    pub fn format_features(&self, format: vk::Format) -> vk::FormatProperties {
        let mut cache = self.d_format_features.lock().unwrap();
        *cache.entry(format).or_insert_with(|| unsafe {
            self.inst
                .inst
                .get_physical_device_format_properties(self.pdev_info.pdev, format)
        })
    }

    pub fn create_fence(&self, fence_type: FenceType) -> Option<Arc<Fence>> {
        Fence::new(&self.dev, fence_type, self.use_external_fence_sync).map(Arc::new)
    }

    /// Export a fence as a sync fd for event loop integration.
    ///
    /// Returns None when the extension is absent, the configuration
    /// left external sync off, or the driver refuses. Callers own the
    /// returned fd.
    pub fn export_fence_sync_fd(&self, fence: &Fence) -> Option<i32> {
        if !self.use_external_fence_sync {
            return None;
        }
        let loader = self.external_fence_loader.as_ref()?;

        let info = vk::FenceGetFdInfoKHR::builder()
            .fence(fence.vkhandle())
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();
        match unsafe { loader.get_fence_fd(&info) } {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::warn!("sync fd export failed: {:?}", e);
                None
            }
        }
    }

    pub fn create_semaphore(&self) -> Option<Arc<Semaphore>> {
        Semaphore::new(&self.dev).map(Arc::new)
    }

    /// Build a fresh command pool for a family, used as the fallback
    /// when the family's pre-warmed stash is empty.
    pub fn new_command_pool(&self, family: u32, ops: QueueOperations) -> Option<Arc<CommandPool>> {
        CommandPool::new(&self.dev, family, ops, self.pdev_info.features.portability, true)
            .map(Arc::new)
    }

    /// Grab a command pool for an operation class.
    pub fn acquire_command_pool(&self, ops: QueueOperations) -> Option<Arc<CommandPool>> {
        self.queues
            .acquire_command_pool(ops, |family, family_ops| {
                self.new_command_pool(family, family_ops)
            })
    }

    pub fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.dev.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed: {:?}", e);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // first wait for the device to finish working, then unwind in
        // reverse construction order
        self.wait_idle();
        self.queues.invalidate();
        self.texture_layout.invalidate();
        {
            self.d_samplers.lock().unwrap().clear();
        }
        self.allocator.invalidate();
        unsafe {
            self.dev.destroy_device(None);
        }
    }
}
