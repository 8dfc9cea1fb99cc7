// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context:
// the loader entry, the debug messenger and the enumerated list of
// physical devices we can build a Device from.
//
// Austin Shafer - 2024

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::queue::QueueOperations;
use crate::{CreateInfo, Result, SquallError};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::sync::Arc;

lazy_static! {
    /// Validation ids that are known to fire spuriously. These get
    /// demoted from Error to Warning so real problems stand out.
    /// The swapchain extent id is raised by resize races where the
    /// surface changed between query and create.
    static ref BENIGN_VUIDS: Vec<&'static str> =
        vec!["VUID-VkSwapchainCreateInfoKHR-imageExtent-01274"];
}

// This happy little debug callback is from the ash examples,
// extended to classify by severity and demote known-benign ids.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let data = match p_callback_data.as_ref() {
        Some(d) => d,
        None => return vk::FALSE,
    };
    let message = if data.p_message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
    };
    let id_name = if data.p_message_id_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(data.p_message_id_name)
            .to_string_lossy()
            .into_owned()
    };

    let mut severity = message_severity;
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        && BENIGN_VUIDS.iter().any(|v| id_name.contains(v))
    {
        severity = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;
    }

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}][{}] {}", message_types, id_name, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}][{}] {}", message_types, id_name, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::info!("[VK][{:?}][{}] {}", message_types, id_name, message);
    } else {
        log::debug!("[VK][{:?}][{}] {}", message_types, id_name, message);
    }
    vk::FALSE
}

bitflags! {
    /// The set of platform surface extensions available from this
    /// vulkan loader.
    pub struct SurfaceBackends: u32 {
        const WAYLAND = 1;
        const XCB = 1 << 1;
        const XLIB = 1 << 2;
        const WIN32 = 1 << 3;
        const METAL = 1 << 4;
        const DISPLAY = 1 << 5;
        const HEADLESS = 1 << 6;
    }
}

/// One queue family advertised by a physical device.
#[derive(Debug, Clone)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub count: u32,
    pub ops: QueueOperations,
    /// Minimum transfer granularity for copies on this family.
    pub transfer_granularity: vk::Extent3D,
    /// Can this family present to the platform surface
    pub can_present: bool,
}

/// Flags for the optional device behaviors the runtime cares about.
///
/// Booleans decided once at enumeration time and consulted everywhere
/// else, so the extension name lists never need to stay in memory.
#[derive(Debug, Clone, Default)]
pub struct DeviceFeatures {
    pub memreq2: bool,
    pub dedicated_allocation: bool,
    pub memory_budget: bool,
    pub desc_indexing: bool,
    pub update_after_bind: bool,
    pub partially_bound: bool,
    pub variable_count: bool,
    pub portability: bool,
    pub external_fence_fd: bool,
    pub display_timing: bool,
    pub fullscreen_exclusive: bool,
}

/// A single display output and its modes, for direct-to-display
/// presentation.
#[derive(Debug, Clone)]
pub struct DisplayOutputInfo {
    pub name: String,
    pub physical_resolution: vk::Extent2D,
    /// (width, height, refresh rate in mHz)
    pub modes: Vec<(u32, u32, u32)>,
}

/// An immutable description of one GPU.
///
/// Everything a Device or a caller's support callback could want to
/// know, captured once at instance creation.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub(crate) pdev: vk::PhysicalDevice,
    pub name: String,
    pub api_version: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub features: DeviceFeatures,
    pub extensions: Vec<CString>,
    pub displays: Vec<DisplayOutputInfo>,
}

// vk::PhysicalDeviceLimits is plain data, the handle is opaque
unsafe impl Send for PhysicalDeviceInfo {}
unsafe impl Sync for PhysicalDeviceInfo {}

impl PhysicalDeviceInfo {
    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == name)
    }

    /// A device is suitable if it can run graphics work at all. The
    /// application gate callback can veto it afterwards.
    pub fn is_suitable(&self) -> bool {
        self.queue_families
            .iter()
            .any(|f| f.ops.contains(QueueOperations::GRAPHICS))
            && self.has_extension(khr::Swapchain::name())
    }
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which squall will use internally.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
    /// what this loader can present to
    pub i_surface_backends: SurfaceBackends,
    /// all GPUs visible through this instance
    pub i_devices: Vec<PhysicalDeviceInfo>,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        (dr_loader, callback)
    }

    /// Find which WSI surface extensions this loader exposes.
    fn probe_surface_backends(entry: &Entry) -> SurfaceBackends {
        let mut ret = SurfaceBackends::empty();
        let exts = match entry.enumerate_instance_extension_properties(None) {
            Ok(e) => e,
            Err(_) => return ret,
        };

        for e in exts.iter() {
            let name = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
            match name.to_bytes() {
                b"VK_KHR_wayland_surface" => ret |= SurfaceBackends::WAYLAND,
                b"VK_KHR_xcb_surface" => ret |= SurfaceBackends::XCB,
                b"VK_KHR_xlib_surface" => ret |= SurfaceBackends::XLIB,
                b"VK_KHR_win32_surface" => ret |= SurfaceBackends::WIN32,
                b"VK_EXT_metal_surface" => ret |= SurfaceBackends::METAL,
                b"VK_KHR_display" => ret |= SurfaceBackends::DISPLAY,
                b"VK_EXT_headless_surface" => ret |= SurfaceBackends::HEADLESS,
                _ => {}
            }
        }
        ret
    }

    /// Collect the surface extension names we will enable, from what
    /// the loader supports.
    fn surface_extension_names(backends: SurfaceBackends) -> Vec<*const i8> {
        let mut ret = vec![khr::Surface::name().as_ptr()];
        if backends.contains(SurfaceBackends::WAYLAND) {
            ret.push(khr::WaylandSurface::name().as_ptr());
        }
        if backends.contains(SurfaceBackends::XCB) {
            ret.push(khr::XcbSurface::name().as_ptr());
        }
        if backends.contains(SurfaceBackends::XLIB) {
            ret.push(khr::XlibSurface::name().as_ptr());
        }
        if backends.contains(SurfaceBackends::WIN32) {
            ret.push(khr::Win32Surface::name().as_ptr());
        }
        if backends.contains(SurfaceBackends::DISPLAY) {
            ret.push(khr::Display::name().as_ptr());
        }
        ret
    }

    /// Build the queue family list for one physical device.
    fn enumerate_queue_families(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        info: &CreateInfo,
    ) -> Vec<QueueFamilyInfo> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .map(|(index, props)| {
                let mut ops = QueueOperations::from_vk(props.queue_flags);
                let can_present = match info.present_support_cb.as_ref() {
                    Some(cb) => cb(inst, pdev, index as u32),
                    // With no platform callback assume graphics
                    // families can present
                    None => ops.contains(QueueOperations::GRAPHICS),
                };
                if can_present {
                    ops |= QueueOperations::PRESENT;
                }

                QueueFamilyInfo {
                    index: index as u32,
                    count: props.queue_count,
                    ops: ops,
                    transfer_granularity: props.min_image_transfer_granularity,
                    can_present: can_present,
                }
            })
            .collect()
    }

    /// Probe the optional features we use into a plain flag set.
    fn probe_features(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        api_version: u32,
        extensions: &[CString],
    ) -> DeviceFeatures {
        let has = |name: &[u8]| {
            extensions
                .iter()
                .any(|e| e.as_bytes_with_nul() == name || e.as_bytes() == &name[..name.len() - 1])
        };

        let mut ret = DeviceFeatures::default();
        ret.memreq2 = api_version >= vk::API_VERSION_1_1
            || has(b"VK_KHR_get_memory_requirements2\0");
        ret.dedicated_allocation =
            api_version >= vk::API_VERSION_1_1 || has(b"VK_KHR_dedicated_allocation\0");
        ret.memory_budget = has(b"VK_EXT_memory_budget\0");
        ret.portability = has(b"VK_KHR_portability_subset\0");
        ret.external_fence_fd = has(b"VK_KHR_external_fence_fd\0");
        ret.display_timing = has(b"VK_GOOGLE_display_timing\0");
        ret.fullscreen_exclusive = has(b"VK_EXT_full_screen_exclusive\0");

        let desc_indexing_ext =
            api_version >= vk::API_VERSION_1_2 || has(b"VK_EXT_descriptor_indexing\0");
        if desc_indexing_ext && api_version >= vk::API_VERSION_1_1 {
            // check the actual indexing feature bits
            let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::builder().build();
            let mut features = vk::PhysicalDeviceFeatures2::builder().build();
            features.p_next = &mut indexing as *mut _ as *mut c_void;
            unsafe { inst.get_physical_device_features2(pdev, &mut features) };

            ret.desc_indexing = indexing.runtime_descriptor_array != 0
                && indexing.shader_sampled_image_array_non_uniform_indexing != 0;
            ret.update_after_bind = indexing.descriptor_binding_sampled_image_update_after_bind != 0;
            ret.partially_bound = indexing.descriptor_binding_partially_bound != 0;
            ret.variable_count = indexing.descriptor_binding_variable_descriptor_count != 0;
        }

        ret
    }

    /// Enumerate display outputs for direct presentation.
    ///
    /// Only valid if VK_KHR_display was enabled on the instance.
    fn enumerate_displays(
        entry: &Entry,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        backends: SurfaceBackends,
    ) -> Vec<DisplayOutputInfo> {
        let mut ret = Vec::new();
        if !backends.contains(SurfaceBackends::DISPLAY) {
            return ret;
        }

        let disp_loader = khr::Display::new(entry, inst);
        let props = match unsafe { disp_loader.get_physical_device_display_properties(pdev) } {
            Ok(p) => p,
            Err(_) => return ret,
        };

        for prop in props.iter() {
            let name = if prop.display_name.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(prop.display_name) }
                    .to_string_lossy()
                    .into_owned()
            };
            let modes = unsafe { disp_loader.get_display_mode_properties(pdev, prop.display) }
                .unwrap_or_else(|_| Vec::new())
                .iter()
                .map(|m| {
                    (
                        m.parameters.visible_region.width,
                        m.parameters.visible_region.height,
                        m.parameters.refresh_rate,
                    )
                })
                .collect();

            ret.push(DisplayOutputInfo {
                name: name,
                physical_resolution: prop.physical_resolution,
                modes: modes,
            });
        }
        ret
    }

    /// Describe one physical device.
    fn describe_pdev(
        entry: &Entry,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        info: &CreateInfo,
        backends: SurfaceBackends,
    ) -> PhysicalDeviceInfo {
        let props = unsafe { inst.get_physical_device_properties(pdev) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let extensions = unsafe { inst.enumerate_device_extension_properties(pdev) }
            .unwrap_or_else(|_| Vec::new())
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect::<Vec<_>>();

        let features = Self::probe_features(inst, pdev, props.api_version, &extensions);

        PhysicalDeviceInfo {
            pdev: pdev,
            name: name,
            api_version: props.api_version,
            device_type: props.device_type,
            limits: props.limits,
            queue_families: Self::enumerate_queue_families(inst, pdev, info),
            features: features,
            extensions: extensions,
            displays: Self::enumerate_displays(entry, inst, pdev, backends),
        }
    }

    /// Create a vkInstance
    ///
    /// Most of the create info entries are straightforward, with
    /// some basic extensions being enabled. All of the work is
    /// done in subfunctions.
    pub fn new(info: &CreateInfo) -> Result<Arc<Self>> {
        let entry = Entry::linked();
        let app_name = CString::new("squall").unwrap();

        let layer_names = if info.enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let backends = Self::probe_surface_backends(&entry);
        let mut extension_names_raw = Self::surface_extension_names(backends);
        if info.enable_validation {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(SquallError::INCOMPATIBLE_DRIVER))?
        };

        let debug = if info.enable_validation {
            Some(Self::setup_debug(&entry, &instance))
        } else {
            None
        };

        let pdevices = unsafe {
            instance
                .enumerate_physical_devices()
                .or(Err(SquallError::INCOMPATIBLE_DRIVER))?
        };
        let devices = pdevices
            .iter()
            .map(|pdev| Self::describe_pdev(&entry, &instance, *pdev, info, backends))
            .collect::<Vec<_>>();

        for dev in devices.iter() {
            log::info!(
                "Found physical device {} (api {}.{}.{}), {} queue families",
                dev.name,
                vk::api_version_major(dev.api_version),
                vk::api_version_minor(dev.api_version),
                vk::api_version_patch(dev.api_version),
                dev.queue_families.len(),
            );
        }

        Ok(Arc::new(Self {
            loader: entry,
            inst: instance,
            debug: debug,
            i_surface_backends: backends,
            i_devices: devices,
        }))
    }

    /// Pick a physical device per the configuration: an explicit index
    /// if one was given, otherwise the first suitable device that the
    /// application's gate callback accepts.
    pub fn select_pdev_info(&self, info: &CreateInfo) -> Result<&PhysicalDeviceInfo> {
        if let Some(idx) = info.device_idx {
            return self.i_devices.get(idx).ok_or(SquallError::INVALID);
        }

        self.i_devices
            .iter()
            .find(|d| {
                d.is_suitable()
                    && info
                        .device_support_cb
                        .as_ref()
                        .map(|cb| cb(d))
                        .unwrap_or(true)
            })
            .ok_or(SquallError::INCOMPATIBLE_DRIVER)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
