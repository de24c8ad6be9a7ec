use ash::vk;

use super::allocator::{AllocatedBuffer, AllocatedImage, GpuAllocator, Residency};
use super::context::VkContext;
use crate::settings::RenderSettings;

pub const HDR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const HISTOGRAM_BINS: u32 = 256;

/// Offscreen targets sized to the swapchain: the multisampled HDR color
/// buffer, its single-sample resolve, and the multisampled depth buffer.
/// Recreated wholesale on resize.
pub struct RenderTargets {
    pub msaa_color: AllocatedImage,
    pub resolve_color: AllocatedImage,
    pub depth: AllocatedImage,
}

impl RenderTargets {
    pub fn new(
        context: &VkContext,
        allocator: &mut GpuAllocator,
        settings: &RenderSettings,
        extent: vk::Extent2D,
    ) -> Self {
        let samples = settings.sample_count_flags();

        let msaa_color = allocator.create_image(
            &context.device,
            extent,
            HDR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
            samples,
            1,
            "msaa hdr color",
        );

        // Sampled by the histogram pass, written as a storage image by the
        // tone-map pass, then blitted to the swapchain.
        let resolve_color = allocator.create_image(
            &context.device,
            extent,
            HDR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
            vk::SampleCountFlags::TYPE_1,
            1,
            "hdr resolve",
        );

        let depth = allocator.create_image(
            &context.device,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            samples,
            1,
            "main depth",
        );

        Self {
            msaa_color,
            resolve_color,
            depth,
        }
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        allocator.destroy_image(device, &mut self.msaa_color);
        allocator.destroy_image(device, &mut self.resolve_color);
        allocator.destroy_image(device, &mut self.depth);
    }
}

/// Single-sample depth target for the directional light, sampled with
/// comparison in the forward passes. Its size is fixed for the run.
pub struct ShadowMap {
    pub image: AllocatedImage,
    pub sampler: vk::Sampler,
}

impl ShadowMap {
    pub fn new(context: &VkContext, allocator: &mut GpuAllocator, size: u32) -> Self {
        let image = allocator.create_image(
            &context.device,
            vk::Extent2D {
                width: size,
                height: size,
            },
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
            vk::SampleCountFlags::TYPE_1,
            1,
            "shadow map",
        );

        let sampler_ci = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let sampler = super::vk_check(
            unsafe { context.device.create_sampler(&sampler_ci, None) },
            "vkCreateSampler",
        );

        Self { image, sampler }
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        unsafe { device.destroy_sampler(self.sampler, None) };
        allocator.destroy_image(device, &mut self.image);
    }
}

/// Device buffers for the auto-exposure chain: the 256-bin luminance
/// histogram and the single-float adapted average, both addressed directly
/// from the compute shaders.
pub struct ComputeBuffers {
    pub histogram: AllocatedBuffer,
    pub average_luminance: AllocatedBuffer,
}

impl ComputeBuffers {
    pub fn new(context: &VkContext, allocator: &mut GpuAllocator) -> Self {
        let histogram = allocator.create_buffer(
            &context.device,
            (HISTOGRAM_BINS as vk::DeviceSize) * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Residency::DeviceLocal,
            "exposure histogram",
        );
        let average_luminance = allocator.create_buffer(
            &context.device,
            4,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Residency::DeviceLocal,
            "average luminance",
        );
        Self {
            histogram,
            average_luminance,
        }
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        allocator.destroy_buffer(device, &mut self.histogram);
        allocator.destroy_buffer(device, &mut self.average_luminance);
    }
}
