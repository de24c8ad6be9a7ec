use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use super::{fatal, vk_check};

/// Device bootstrap: instance, surface, physical device, logical device
/// and the single graphics+present queue family everything runs on.
pub struct VkContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

impl VkContext {
    pub fn new(window: &Window) -> Self {
        let entry = match unsafe { ash::Entry::load() } {
            Ok(entry) => entry,
            Err(err) => fatal(&format!("Cannot load the Vulkan loader: {err}")),
        };

        let instance = create_instance(&entry, window);

        let display_handle = match window.display_handle() {
            Ok(handle) => handle.as_raw(),
            Err(err) => fatal(&format!("Cannot get a display handle: {err}")),
        };
        let window_handle = match window.window_handle() {
            Ok(handle) => handle.as_raw(),
            Err(err) => fatal(&format!("Cannot get a window handle: {err}")),
        };
        let surface = vk_check(
            unsafe { ash_window::create_surface(&entry, &instance, display_handle, window_handle, None) },
            "vkCreateSurfaceKHR",
        );
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let physical_device = select_physical_device(&instance);
        let queue_family = select_queue_family(&instance, &surface_loader, physical_device, surface);
        let device = create_logical_device(&instance, physical_device, queue_family);

        let graphics_queue = unsafe { device.get_device_queue(queue_family, 0) };
        // graphics and present come from the same family by construction
        let present_queue = graphics_queue;

        let command_pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = vk_check(
            unsafe { device.create_command_pool(&command_pool_ci, None) },
            "vkCreateCommandPool",
        );

        Self {
            entry,
            instance,
            surface_loader,
            surface,
            physical_device,
            device,
            queue_family,
            graphics_queue,
            present_queue,
            command_pool,
        }
    }

    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &ash::Entry, window: &Window) -> ash::Instance {
    let display_handle = match window.display_handle() {
        Ok(handle) => handle.as_raw(),
        Err(err) => fatal(&format!("Cannot get a display handle: {err}")),
    };
    let surface_extensions = vk_check(
        ash_window::enumerate_required_extensions(display_handle),
        "enumerate required surface extensions",
    );
    let extensions: Vec<*const std::ffi::c_char> = surface_extensions.to_vec();

    let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
    if cfg!(debug_assertions) {
        layers.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"photometric")
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"photometric")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let instance_ci = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    vk_check(
        unsafe { entry.create_instance(&instance_ci, None) },
        "vkCreateInstance",
    )
}

/// Finds a Vulkan 1.3 capable device, preferring a discrete GPU among the
/// qualified candidates and falling back to the first qualified one.
fn select_physical_device(instance: &ash::Instance) -> vk::PhysicalDevice {
    let physical_devices = vk_check(
        unsafe { instance.enumerate_physical_devices() },
        "vkEnumeratePhysicalDevices",
    );

    let mut chosen = None;
    for physical_device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            continue;
        }
        if chosen.is_none() {
            chosen = Some(physical_device);
        }
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            return physical_device;
        }
    }

    match chosen {
        Some(physical_device) => physical_device,
        None => fatal("Could not find a physical device supporting Vulkan 1.3"),
    }
}

fn select_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> u32 {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    for (index, family) in families.iter().enumerate() {
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        let present_supported = vk_check(
            unsafe {
                surface_loader.get_physical_device_surface_support(
                    physical_device,
                    index as u32,
                    surface,
                )
            },
            "vkGetPhysicalDeviceSurfaceSupportKHR",
        );
        if present_supported {
            return index as u32;
        }
    }
    fatal("Could not find a queue family with both graphics and presentation supported")
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> ash::Device {
    // Probe the features this renderer cannot run without: dynamic
    // rendering and synchronization2 for the pass/barrier model, buffer
    // device address for vertex pulling, and descriptor indexing for the
    // variable-count bindless texture array.
    let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vk12)
        .push_next(&mut vk13);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    if vk13.dynamic_rendering == vk::FALSE || vk13.synchronization2 == vk::FALSE {
        fatal("Device does not support dynamic rendering and synchronization2");
    }
    if vk12.buffer_device_address == vk::FALSE
        || vk12.runtime_descriptor_array == vk::FALSE
        || vk12.descriptor_binding_variable_descriptor_count == vk::FALSE
        || vk12.shader_sampled_image_array_non_uniform_indexing == vk::FALSE
    {
        fatal("Device does not support buffer device address and descriptor indexing");
    }
    // The texture array and material buffer are rewritten while earlier
    // frames are still in flight, so update-after-bind is required too.
    if vk12.descriptor_binding_sampled_image_update_after_bind == vk::FALSE
        || vk12.descriptor_binding_storage_buffer_update_after_bind == vk::FALSE
    {
        fatal("Device does not support update-after-bind descriptors");
    }

    let mut vk12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);
    let mut vk13 = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let queue_priorities = [1.0f32];
    let queue_ci = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities);
    let queue_create_infos = [queue_ci];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let device_ci = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vk12)
        .push_next(&mut vk13);

    vk_check(
        unsafe { instance.create_device(physical_device, &device_ci, None) },
        "vkCreateDevice",
    )
}
