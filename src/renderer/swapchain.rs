use ash::vk;
use log::info;

use super::context::VkContext;
use super::{subresource_range, vk_check};
use crate::settings::RenderSettings;

/// Swapchain plus everything derived from it: images, views, the surface
/// format and the extent the render targets are sized against.
pub struct SwapchainContext {
    pub loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

impl SwapchainContext {
    pub fn new(context: &VkContext, settings: &RenderSettings, window_extent: vk::Extent2D) -> Self {
        let loader = ash::khr::swapchain::Device::new(&context.instance, &context.device);
        let mut swapchain = Self {
            loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
        };
        swapchain.create(context, settings, window_extent);
        swapchain
    }

    /// Rebuilds the swapchain for a new surface size. The previous chain
    /// must be idle: callers wait on the device before recreating.
    pub fn recreate(
        &mut self,
        context: &VkContext,
        settings: &RenderSettings,
        window_extent: vk::Extent2D,
    ) {
        self.destroy(&context.device);
        self.create(context, settings, window_extent);
    }

    fn create(&mut self, context: &VkContext, settings: &RenderSettings, window_extent: vk::Extent2D) {
        let capabilities = vk_check(
            unsafe {
                context
                    .surface_loader
                    .get_physical_device_surface_capabilities(context.physical_device, context.surface)
            },
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
        );
        let formats = vk_check(
            unsafe {
                context
                    .surface_loader
                    .get_physical_device_surface_formats(context.physical_device, context.surface)
            },
            "vkGetPhysicalDeviceSurfaceFormatsKHR",
        );
        let present_modes = vk_check(
            unsafe {
                context.surface_loader.get_physical_device_surface_present_modes(
                    context.physical_device,
                    context.surface,
                )
            },
            "vkGetPhysicalDeviceSurfacePresentModesKHR",
        );

        self.format = choose_surface_format(&formats);
        self.extent = choose_extent(&capabilities, window_extent);
        let present_mode = settings.present_mode(&present_modes);

        // Triple buffering when the surface allows it.
        let mut image_count = capabilities.min_image_count.max(3);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let swapchain_ci = vk::SwapchainCreateInfoKHR::default()
            .surface(context.surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = vk_check(
            unsafe { self.loader.create_swapchain(&swapchain_ci, None) },
            "vkCreateSwapchainKHR",
        );
        self.images = vk_check(
            unsafe { self.loader.get_swapchain_images(self.swapchain) },
            "vkGetSwapchainImagesKHR",
        );
        self.views = self
            .images
            .iter()
            .map(|&image| {
                let view_ci = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format.format)
                    .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR));
                vk_check(
                    unsafe { context.device.create_image_view(&view_ci, None) },
                    "vkCreateImageView",
                )
            })
            .collect();

        info!(
            "Swapchain: {} images, {:?}, {}x{}, {:?}",
            self.images.len(),
            self.format.format,
            self.extent.width,
            self.extent.height,
            present_mode
        );
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for &view in &self.views {
                device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        self.views.clear();
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    // current_extent of u32::MAX means the surface lets the swapchain
    // pick; otherwise the surface size is authoritative.
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}
