use std::path::Path;

use ash::vk;
use log::info;

use super::context::VkContext;
use super::descriptors::DescriptorState;
use super::draw::{
    AverageLuminancePushConstants, ColorCorrectPushConstants, DrawPushConstants,
    HistogramPushConstants,
};
use super::targets::{DEPTH_FORMAT, HDR_FORMAT};
use super::{fatal, vk_check};
use crate::settings::RenderSettings;

const SHADER_DIR: &str = "shaders";

/// Every pipeline the frame loop records with, plus their layouts. The
/// graphics pipelines share one layout (scene set, asset set, push
/// constants) so descriptor bindings stay valid across pass switches.
pub struct Pipelines {
    pub draw_layout: vk::PipelineLayout,
    pub histogram_layout: vk::PipelineLayout,
    pub average_layout: vk::PipelineLayout,
    pub tonemap_layout: vk::PipelineLayout,

    pub shadow: vk::Pipeline,
    pub depth_prepass: vk::Pipeline,
    pub opaque: vk::Pipeline,
    pub transparent: vk::Pipeline,
    pub build_histogram: vk::Pipeline,
    pub average_histogram: vk::Pipeline,
    pub tonemap: vk::Pipeline,
}

impl Pipelines {
    pub fn new(
        context: &VkContext,
        descriptors: &DescriptorState,
        settings: &RenderSettings,
    ) -> Self {
        let device = &context.device;

        let draw_layout = create_layout(
            device,
            &[descriptors.scene_layout, descriptors.asset_layout],
            vk::ShaderStageFlags::ALL,
            std::mem::size_of::<DrawPushConstants>() as u32,
        );
        let histogram_layout = create_layout(
            device,
            &[descriptors.histogram_layout],
            vk::ShaderStageFlags::COMPUTE,
            std::mem::size_of::<HistogramPushConstants>() as u32,
        );
        let average_layout = create_layout(
            device,
            &[],
            vk::ShaderStageFlags::COMPUTE,
            std::mem::size_of::<AverageLuminancePushConstants>() as u32,
        );
        let tonemap_layout = create_layout(
            device,
            &[descriptors.tonemap_layout],
            vk::ShaderStageFlags::COMPUTE,
            std::mem::size_of::<ColorCorrectPushConstants>() as u32,
        );

        let (shadow, depth_prepass, opaque, transparent) =
            create_graphics_pipelines(device, draw_layout, settings);

        let build_histogram =
            create_compute_pipeline(device, histogram_layout, "build_exposure_histogram.comp.spv");
        let average_histogram = create_compute_pipeline(
            device,
            average_layout,
            "average_exposure_histogram.comp.spv",
        );
        let tonemap = create_compute_pipeline(device, tonemap_layout, "color_correct.comp.spv");

        Self {
            draw_layout,
            histogram_layout,
            average_layout,
            tonemap_layout,
            shadow,
            depth_prepass,
            opaque,
            transparent,
            build_histogram,
            average_histogram,
            tonemap,
        }
    }

    /// Rebuilds the graphics pipelines from the SPIR-V on disk. The caller
    /// waits for the device to go idle first. Compute pipelines have no
    /// shader-iteration story and stay as built.
    pub fn recompile(&mut self, context: &VkContext, settings: &RenderSettings) {
        let device = &context.device;
        unsafe {
            device.destroy_pipeline(self.shadow, None);
            device.destroy_pipeline(self.depth_prepass, None);
            device.destroy_pipeline(self.opaque, None);
            device.destroy_pipeline(self.transparent, None);
        }
        let (shadow, depth_prepass, opaque, transparent) =
            create_graphics_pipelines(device, self.draw_layout, settings);
        self.shadow = shadow;
        self.depth_prepass = depth_prepass;
        self.opaque = opaque;
        self.transparent = transparent;
        info!("Reloaded graphics pipelines");
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.shadow, None);
            device.destroy_pipeline(self.depth_prepass, None);
            device.destroy_pipeline(self.opaque, None);
            device.destroy_pipeline(self.transparent, None);
            device.destroy_pipeline(self.build_histogram, None);
            device.destroy_pipeline(self.average_histogram, None);
            device.destroy_pipeline(self.tonemap, None);
            device.destroy_pipeline_layout(self.draw_layout, None);
            device.destroy_pipeline_layout(self.histogram_layout, None);
            device.destroy_pipeline_layout(self.average_layout, None);
            device.destroy_pipeline_layout(self.tonemap_layout, None);
        }
    }
}

fn load_shader(device: &ash::Device, name: &str) -> vk::ShaderModule {
    let path = Path::new(SHADER_DIR).join(name);
    let mut file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(err) => fatal(&format!("Cannot open shader {path:?}: {err}")),
    };
    let code = match ash::util::read_spv(&mut file) {
        Ok(code) => code,
        Err(err) => fatal(&format!("Shader {path:?} is not valid SPIR-V: {err}")),
    };
    let module_ci = vk::ShaderModuleCreateInfo::default().code(&code);
    vk_check(
        unsafe { device.create_shader_module(&module_ci, None) },
        "vkCreateShaderModule",
    )
}

fn create_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_stages: vk::ShaderStageFlags,
    push_size: u32,
) -> vk::PipelineLayout {
    let push_ranges = [vk::PushConstantRange::default()
        .stage_flags(push_stages)
        .size(push_size)];
    let layout_ci = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&push_ranges);
    vk_check(
        unsafe { device.create_pipeline_layout(&layout_ci, None) },
        "vkCreatePipelineLayout",
    )
}

struct RasterConfig {
    fragment: Option<&'static str>,
    samples: vk::SampleCountFlags,
    depth_compare: vk::CompareOp,
    depth_write: bool,
    blend: bool,
    color: bool,
}

fn create_graphics_pipelines(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    settings: &RenderSettings,
) -> (vk::Pipeline, vk::Pipeline, vk::Pipeline, vk::Pipeline) {
    let samples = settings.sample_count_flags();

    // Shadow pass renders at one sample into the light's depth map with a
    // conventional depth range; everything on the main targets is
    // reverse-Z.
    let shadow = build_raster_pipeline(
        device,
        layout,
        "depth_only.vert.spv",
        RasterConfig {
            fragment: None,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_compare: vk::CompareOp::LESS,
            depth_write: true,
            blend: false,
            color: false,
        },
    );
    let depth_prepass = build_raster_pipeline(
        device,
        layout,
        "depth_only.vert.spv",
        RasterConfig {
            fragment: None,
            samples,
            depth_compare: vk::CompareOp::GREATER,
            depth_write: true,
            blend: false,
            color: false,
        },
    );
    let opaque = build_raster_pipeline(
        device,
        layout,
        "draw.vert.spv",
        RasterConfig {
            fragment: Some("pbr.frag.spv"),
            samples,
            depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
            depth_write: false,
            blend: false,
            color: true,
        },
    );
    let transparent = build_raster_pipeline(
        device,
        layout,
        "draw.vert.spv",
        RasterConfig {
            fragment: Some("pbr.frag.spv"),
            samples,
            depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
            depth_write: false,
            blend: true,
            color: true,
        },
    );

    (shadow, depth_prepass, opaque, transparent)
}

fn build_raster_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    vertex_shader: &str,
    config: RasterConfig,
) -> vk::Pipeline {
    let vertex_module = load_shader(device, vertex_shader);
    let fragment_module = config.fragment.map(|name| load_shader(device, name));

    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex_module)
        .name(c"main")];
    if let Some(module) = fragment_module {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(c"main"),
        );
    }

    // Vertices are pulled through a buffer reference, so no input state.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(config.samples);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(config.depth_write)
        .depth_compare_op(config.depth_compare);

    let blend_attachment = if config.blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = if config.color {
        vec![blend_attachment]
    } else {
        Vec::new()
    };
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    // Cull mode and winding are per-draw: mirrored transforms flip the
    // front face and the shadow pass culls front faces.
    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::CULL_MODE,
        vk::DynamicState::FRONT_FACE,
    ];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [HDR_FORMAT];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .depth_attachment_format(DEPTH_FORMAT);
    if config.color {
        rendering_info = rendering_info.color_attachment_formats(&color_formats);
    }

    let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipeline = match unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_ci], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((_, err)) => fatal(&format!("Failed to create graphics pipeline: {err:?}")),
    };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        if let Some(module) = fragment_module {
            device.destroy_shader_module(module, None);
        }
    }

    pipeline
}

fn create_compute_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    shader: &str,
) -> vk::Pipeline {
    let module = load_shader(device, shader);
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let pipeline_ci = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);
    let pipeline = match unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_ci], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((_, err)) => fatal(&format!("Failed to create compute pipeline {shader}: {err:?}")),
    };
    unsafe { device.destroy_shader_module(module, None) };
    pipeline
}
