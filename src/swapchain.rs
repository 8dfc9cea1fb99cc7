// Surface and swapchain presentation
//
// The swapchain tracks each image's state (free, acquired, queued for
// present), owns the acquire/present semaphore pool, and decides when
// the caller should recreate it: OUT_OF_DATE errors, suboptimal
// acquires, or too many presents in a fallback present mode.
//
// Austin Shafer - 2024

use ash::vk;

use crate::device::Device;
use crate::image::{Image, ImageInfo};
use crate::instance::Instance;
use crate::queue::{DeviceQueue, QueueOperations};
use crate::sync::{Fence, Semaphore};
use crate::{Result, SquallError};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A VkSurfaceKHR together with the instance that created it. The
/// platform layer builds the raw surface, we own its lifetime.
pub struct Surface {
    s_inst: Arc<Instance>,
    s_surface: vk::SurfaceKHR,
}

/// Everything the surface supports on a given device.
pub struct SurfaceOptions {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceOptions {
    /// Pick a surface format, preferring BGRA8 when the surface does
    /// not care.
    pub fn select_format(&self) -> Result<vk::SurfaceFormatKHR> {
        self.formats
            .iter()
            .map(|fmt| match fmt.format {
                vk::Format::UNDEFINED => vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: fmt.color_space,
                },
                _ => *fmt,
            })
            .nth(0)
            .ok_or(SquallError::FORMAT_NOT_SUPPORTED)
    }
}

impl Surface {
    pub fn new(inst: Arc<Instance>, surface: vk::SurfaceKHR) -> Arc<Self> {
        Arc::new(Self {
            s_inst: inst,
            s_surface: surface,
        })
    }

    pub fn vkhandle(&self) -> vk::SurfaceKHR {
        self.s_surface
    }

    /// Query formats, modes and capabilities for a device.
    pub fn get_surface_options(&self, dev: &Device) -> Result<SurfaceOptions> {
        let pdev = dev.pdev_info().pdev;
        unsafe {
            let capabilities = dev
                .surface_loader
                .get_physical_device_surface_capabilities(pdev, self.s_surface)
                .map_err(|e| SquallError::from_vk(e).unwrap_or(SquallError::SURFACE_LOST))?;
            let formats = dev
                .surface_loader
                .get_physical_device_surface_formats(pdev, self.s_surface)
                .map_err(|e| SquallError::from_vk(e).unwrap_or(SquallError::SURFACE_LOST))?;
            let present_modes = dev
                .surface_loader
                .get_physical_device_surface_present_modes(pdev, self.s_surface)
                .map_err(|e| SquallError::from_vk(e).unwrap_or(SquallError::SURFACE_LOST))?;

            Ok(SurfaceOptions {
                capabilities: capabilities,
                formats: formats,
                present_modes: present_modes,
            })
        }
    }

    /// Can the given queue family present to this surface?
    pub fn supports_family(&self, dev: &Device, family: u32) -> bool {
        unsafe {
            dev.surface_loader
                .get_physical_device_surface_support(dev.pdev_info().pdev, family, self.s_surface)
                .unwrap_or(false)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        let loader = ash::extensions::khr::Surface::new(&self.s_inst.loader, &self.s_inst.inst);
        unsafe {
            loader.destroy_surface(self.s_surface, None);
        }
    }
}

/// A successfully acquired swapchain image.
pub struct AcquiredImage {
    pub index: u32,
    pub image: Arc<Image>,
    /// signaled when the image is actually ready to be written
    pub semaphore: Arc<Semaphore>,
}

struct SwapchainImageRecord {
    image: Arc<Image>,
    /// the wait semaphore of the present queued for this slot
    present_semaphore: Option<Arc<Semaphore>>,
}

struct SwapchainInternal {
    swapchain: vk::SwapchainKHR,
    images: Vec<SwapchainImageRecord>,
    /// reusable acquire/present semaphores
    semaphore_pool: Vec<Arc<Semaphore>>,
    /// semaphores that were still in flight at recreate time
    quarantine: Vec<Arc<Semaphore>>,
    /// indices currently between acquire and present
    acquired: HashSet<u32>,
    /// the surface changed under us, recreate soon
    deprecated: bool,
    /// presents in a fallback mode since the last renegotiation
    suboptimal_presents: u32,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

/// A swapchain and its presentation state.
pub struct Swapchain {
    sc_dev: Arc<Device>,
    sc_surface: Arc<Surface>,
    /// the mode we would rather be in when the surface allows it
    sc_preferred_mode: vk::PresentModeKHR,
    sc_max_suboptimal: u32,
    sc_internal: Mutex<SwapchainInternal>,
}

impl Swapchain {
    /// Create the initial swapchain for a surface.
    pub fn new(
        dev: Arc<Device>,
        surface: Arc<Surface>,
        preferred_mode: vk::PresentModeKHR,
        max_suboptimal: u32,
    ) -> Result<Arc<Self>> {
        let ret = Arc::new(Self {
            sc_dev: dev,
            sc_surface: surface,
            sc_preferred_mode: preferred_mode,
            sc_max_suboptimal: max_suboptimal,
            sc_internal: Mutex::new(SwapchainInternal {
                swapchain: vk::SwapchainKHR::null(),
                images: Vec::new(),
                semaphore_pool: Vec::new(),
                quarantine: Vec::new(),
                acquired: HashSet::new(),
                deprecated: false,
                suboptimal_presents: 0,
                format: vk::SurfaceFormatKHR::default(),
                extent: vk::Extent2D::default(),
                present_mode: vk::PresentModeKHR::FIFO,
            }),
        });
        ret.recreate()?;
        Ok(ret)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.sc_internal.lock().unwrap().extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.sc_internal.lock().unwrap().format
    }

    pub fn is_deprecated(&self) -> bool {
        self.sc_internal.lock().unwrap().deprecated
    }

    pub fn image_count(&self) -> usize {
        self.sc_internal.lock().unwrap().images.len()
    }

    pub fn image(&self, index: u32) -> Option<Arc<Image>> {
        self.sc_internal
            .lock()
            .unwrap()
            .images
            .get(index as usize)
            .map(|r| r.image.clone())
    }

    pub fn acquired_count(&self) -> usize {
        self.sc_internal.lock().unwrap().acquired.len()
    }

    /// (Re)build the swapchain against the current surface state.
    ///
    /// The old swapchain seeds `oldSwapchain` and its semaphore pool
    /// carries over. Per-image present semaphores go back to the pool
    /// when reusable, to the quarantine list otherwise.
    pub fn recreate(&self) -> Result<()> {
        let options = self.sc_surface.get_surface_options(&self.sc_dev)?;
        let format = options.select_format()?;

        let caps = &options.capabilities;
        let mut desired_image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && desired_image_count > caps.max_image_count {
            desired_image_count = caps.max_image_count;
        }

        let extent = match caps.current_extent.width {
            u32::MAX => vk::Extent2D {
                width: 1280,
                height: 720,
            },
            _ => caps.current_extent,
        };

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let present_mode = options
            .present_modes
            .iter()
            .cloned()
            .find(|m| *m == self.sc_preferred_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        // concurrent sharing when graphics and present families differ
        let graphics_family = self
            .sc_dev
            .queues
            .family_index(QueueOperations::GRAPHICS)
            .ok_or(SquallError::NO_QUEUE)?;
        let present_family = self
            .sc_dev
            .queues
            .family_index(QueueOperations::PRESENT)
            .unwrap_or(graphics_family);
        let family_indices = [graphics_family, present_family];
        let (sharing_mode, family_slice): (vk::SharingMode, &[u32]) =
            if graphics_family != present_family {
                (vk::SharingMode::CONCURRENT, &family_indices)
            } else {
                (vk::SharingMode::EXCLUSIVE, &[])
            };

        let mut internal = self.sc_internal.lock().unwrap();

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.sc_surface.vkhandle())
            .min_image_count(desired_image_count)
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_slice)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(internal.swapchain)
            .build();

        // win32 fullscreen-exclusive control, chained only when the
        // driver offers it
        let mut fullscreen_info = vk::SurfaceFullScreenExclusiveInfoEXT::builder()
            .full_screen_exclusive(vk::FullScreenExclusiveEXT::ALLOWED)
            .build();
        if self.sc_dev.pdev_info().features.fullscreen_exclusive {
            create_info.p_next = &mut fullscreen_info as *mut _ as *const std::os::raw::c_void;
        }

        let new_swapchain = unsafe {
            self.sc_dev
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // the old swapchain (if any) is retired: park its in-flight
        // semaphores and drop its image records
        let old_images = std::mem::replace(&mut internal.images, Vec::new());
        for mut record in old_images.into_iter() {
            if let Some(sem) = record.present_semaphore.take() {
                if sem.reset() {
                    internal.semaphore_pool.push(sem);
                } else {
                    internal.quarantine.push(sem);
                }
            }
        }
        if internal.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.sc_dev
                    .swapchain_loader
                    .destroy_swapchain(internal.swapchain, None);
            }
        }
        internal.swapchain = new_swapchain;

        let raw_images = unsafe {
            self.sc_dev
                .swapchain_loader
                .get_swapchain_images(new_swapchain)
                .or(Err(SquallError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        internal.images = raw_images
            .into_iter()
            .map(|img| SwapchainImageRecord {
                image: Arc::new(Image::new_external(
                    self.sc_dev.vkdev().clone(),
                    img,
                    ImageInfo::new_2d(
                        format.format,
                        extent.width,
                        extent.height,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                    ),
                )),
                present_semaphore: None,
            })
            .collect();

        internal.acquired.clear();
        internal.deprecated = false;
        internal.suboptimal_presents = 0;
        internal.format = format;
        internal.extent = extent;
        internal.present_mode = present_mode;

        log::debug!(
            "Created swapchain: {} images, {:?}, {}x{}",
            internal.images.len(),
            format.format,
            extent.width,
            extent.height,
        );

        Ok(())
    }

    /// Pull a reusable semaphore or make a fresh one.
    fn pop_semaphore(&self, internal: &mut SwapchainInternal) -> Option<Arc<Semaphore>> {
        // check quarantine for semaphores that became reusable
        let mut i = 0;
        while i < internal.quarantine.len() {
            if internal.quarantine[i].reset() {
                let sem = internal.quarantine.remove(i);
                internal.semaphore_pool.push(sem);
            } else {
                i += 1;
            }
        }

        if let Some(sem) = internal.semaphore_pool.pop() {
            return Some(sem);
        }
        self.sc_dev.create_semaphore()
    }

    /// Hand a semaphore back to the pool once its waits completed.
    pub fn return_semaphore(&self, sem: Arc<Semaphore>) {
        let mut internal = self.sc_internal.lock().unwrap();
        if sem.reset() {
            internal.semaphore_pool.push(sem);
        } else {
            internal.quarantine.push(sem);
        }
    }

    /// Acquire the next image.
    ///
    /// `lockfree` polls with a zero timeout and returns Ok(None) when
    /// nothing is ready. OUT_OF_DATE and fullscreen loss deprecate the
    /// swapchain and return Ok(None) so the caller recreates and
    /// retries. A suboptimal acquire still returns the image but
    /// flags deprecation for the next frame.
    pub fn acquire(
        &self,
        lockfree: bool,
        fence: Option<&Arc<Fence>>,
    ) -> Result<Option<AcquiredImage>> {
        let mut internal = self.sc_internal.lock().unwrap();
        let semaphore = self
            .pop_semaphore(&mut *internal)
            .ok_or(SquallError::INVALID)?;

        let timeout = if lockfree { 0 } else { u64::MAX };
        let res = unsafe {
            self.sc_dev.swapchain_loader.acquire_next_image(
                internal.swapchain,
                timeout,
                semaphore.vkhandle(),
                fence.map(|f| f.vkhandle()).unwrap_or(vk::Fence::null()),
            )
        };

        match res {
            Ok((index, suboptimal)) => {
                semaphore.mark_signaled();
                if let Some(f) = fence {
                    f.set_armed(None);
                }
                internal.acquired.insert(index);
                if suboptimal {
                    internal.deprecated = true;
                }

                let image = internal.images[index as usize].image.clone();
                Ok(Some(AcquiredImage {
                    index: index,
                    image: image,
                    semaphore: semaphore,
                }))
            }
            Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                internal.semaphore_pool.push(semaphore);
                Ok(None)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
            | Err(vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT) => {
                internal.semaphore_pool.push(semaphore);
                internal.deprecated = true;
                Ok(None)
            }
            Err(e) => {
                internal.semaphore_pool.push(semaphore);
                log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                Err(SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE)
            }
        }
    }

    /// Present an acquired image.
    ///
    /// `wait_sema` is the frame's render-complete semaphore. The
    /// image index leaves the acquired set no matter what the driver
    /// says. Returns SUBOPTIMAL when the mode fallback counter says
    /// it is time to renegotiate the present mode.
    pub fn present(
        &self,
        queue: &Arc<DeviceQueue>,
        index: u32,
        wait_sema: Arc<Semaphore>,
    ) -> Result<()> {
        let mut internal = self.sc_internal.lock().unwrap();

        let wait_semas = [wait_sema.vkhandle()];
        let swapchains = [internal.swapchain];
        let indices = [index];
        let mut info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();

        // present timing feedback when GOOGLE_display_timing exists.
        // A zero desired time means "as soon as possible".
        let times = [vk::PresentTimeGOOGLE::builder()
            .present_id(0)
            .desired_present_time(0)
            .build()];
        let mut times_info = vk::PresentTimesInfoGOOGLE::builder().times(&times).build();
        if self.sc_dev.pdev_info().features.display_timing {
            info.p_next = &mut times_info as *mut _ as *const std::os::raw::c_void;
        }

        let res = unsafe {
            self.sc_dev
                .swapchain_loader
                .queue_present(queue.vkhandle(), &info)
        };
        wait_sema.mark_waited();

        // bookkeeping happens regardless of the result
        internal.acquired.remove(&index);
        let old_sem = internal
            .images
            .get_mut(index as usize)
            .and_then(|r| r.present_semaphore.take());
        if let Some(old) = old_sem {
            if old.reset() {
                internal.semaphore_pool.push(old);
            } else {
                internal.quarantine.push(old);
            }
        }
        if let Some(record) = internal.images.get_mut(index as usize) {
            record.present_semaphore = Some(wait_sema);
        }

        match res {
            Ok(suboptimal) => {
                if suboptimal {
                    internal.deprecated = true;
                }
                if internal.present_mode != self.sc_preferred_mode {
                    internal.suboptimal_presents += 1;
                    if internal.suboptimal_presents >= self.sc_max_suboptimal {
                        internal.suboptimal_presents = 0;
                        return Err(SquallError::SUBOPTIMAL);
                    }
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                internal.deprecated = true;
                Err(SquallError::OUT_OF_DATE)
            }
            Err(vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT) => {
                internal.deprecated = true;
                Err(SquallError::FULLSCREEN_LOST)
            }
            Err(e) => {
                log::error!("vkQueuePresentKHR failed: {:?}", e);
                Err(SquallError::PRESENT_FAILED)
            }
        }
    }

    /// Release an acquired index without presenting (frame abort).
    pub fn abandon(&self, acquired: AcquiredImage) {
        let mut internal = self.sc_internal.lock().unwrap();
        internal.acquired.remove(&acquired.index);
        if acquired.semaphore.reset() {
            internal.semaphore_pool.push(acquired.semaphore);
        } else {
            internal.quarantine.push(acquired.semaphore);
        }
    }

    /// Tear down the vulkan swapchain. Image wrappers die with their
    /// last reference.
    pub fn invalidate(&self) {
        let mut internal = self.sc_internal.lock().unwrap();
        internal.images.clear();
        internal.semaphore_pool.clear();
        internal.quarantine.clear();
        if internal.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.sc_dev
                    .swapchain_loader
                    .destroy_swapchain(internal.swapchain, None);
            }
            internal.swapchain = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.invalidate();
    }
}
