use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use glam::{Mat4, Vec3};
use log::{info, warn};
use thiserror::Error;
use winit::window::Window;

use super::allocator::{immediate_submit, GpuAllocator, StagingArena};
use super::context::VkContext;
use super::cull::is_visible;
use super::descriptors::DescriptorState;
use super::draw::{
    flatten_asset, AverageLuminancePushConstants, ColorCorrectPushConstants, DrawObject,
    DrawPushConstants, HistogramPushConstants, MaterialData, SceneData,
};
use super::frame::FrameSlot;
use super::pipelines::Pipelines;
use super::swapchain::SwapchainContext;
use super::targets::{ComputeBuffers, RenderTargets, ShadowMap};
use super::{fatal, image_barrier, vk_check};
use crate::asset;
use crate::settings::RenderSettings;

/// Exposure histogram range in log2 luminance.
const MIN_LOG_LUMINANCE: f32 = -10.0;
const LOG_LUMINANCE_RANGE: f32 = 12.0;
const EXPOSURE_ADAPTATION_SPEED: f32 = 1.1;

/// Half-width of the directional light's orthographic volume.
const SHADOW_EXTENT: f32 = 30.0;

static ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum RendererError {
    /// The context owns process-wide GPU state (validation layers, the
    /// texture cache), so a second live renderer is refused outright.
    #[error("a renderer is already active in this process")]
    AlreadyActive,
}

pub struct Renderer {
    settings: RenderSettings,
    context: VkContext,
    allocator: GpuAllocator,
    staging: StagingArena,
    swapchain: SwapchainContext,
    frames: Vec<FrameSlot>,
    frame_index: usize,
    targets: RenderTargets,
    shadow_map: ShadowMap,
    compute_buffers: ComputeBuffers,
    descriptors: DescriptorState,
    pipelines: Pipelines,

    default_texture: super::allocator::AllocatedImage,
    default_sampler: vk::Sampler,

    assets: Vec<asset::GltfAsset>,
    draws: Vec<DrawObject>,

    sun_direction: Vec3,
}

impl Renderer {
    pub fn new(window: &Window, settings: RenderSettings) -> Result<Self, RendererError> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(RendererError::AlreadyActive);
        }

        let context = VkContext::new(window);
        let mut allocator = GpuAllocator::new(&context);

        let size = window.inner_size();
        let swapchain = SwapchainContext::new(
            &context,
            &settings,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        );

        let frames = (0..swapchain.images.len())
            .map(|_| FrameSlot::new(&context.device, context.command_pool))
            .collect();

        let mut staging = StagingArena::new(&context.device, &mut allocator);
        let mut descriptors =
            DescriptorState::new(&context, &mut allocator, swapchain.images.len() as u32);

        let targets = RenderTargets::new(&context, &mut allocator, &settings, swapchain.extent);
        let shadow_map = ShadowMap::new(&context, &mut allocator, settings.shadow_map_size);
        let compute_buffers = ComputeBuffers::new(&context, &mut allocator);
        let pipelines = Pipelines::new(&context, &descriptors, &settings);

        let default_sampler = create_linear_sampler(&context.device);
        let default_texture = create_white_texture(&context, &mut allocator, &mut staging);

        // Slot 0 of both shared tables is the fallback for anything an
        // asset leaves unassigned.
        descriptors.add_textures(&context.device, &[(default_texture.view, default_sampler)]);
        descriptors.add_materials(
            &context,
            &mut allocator,
            &mut staging,
            &[MaterialData::default()],
        );

        descriptors.write_shadow_map(&context.device, shadow_map.image.view, shadow_map.sampler);
        descriptors.update_compute_targets(
            &context.device,
            targets.resolve_color.view,
            default_sampler,
        );

        info!("Renderer initialized");

        Ok(Self {
            settings,
            context,
            allocator,
            staging,
            swapchain,
            frames,
            frame_index: 0,
            targets,
            shadow_map,
            compute_buffers,
            descriptors,
            pipelines,
            default_texture,
            default_sampler,
            assets: Vec::new(),
            draws: Vec::new(),
            sun_direction: Vec3::new(2.0, 4.5, 1.0).normalize(),
        })
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    /// Loads a glTF scene and registers it: its materials and textures are
    /// appended to the shared tables and its draws join the frame list.
    pub fn add_gltf_asset(&mut self, path: &Path) {
        let asset = asset::gltf::load(
            &self.context,
            &mut self.allocator,
            &mut self.staging,
            &self.settings.texture_cache_dir,
            path,
        );

        let material_base = self.descriptors.material_count();
        let texture_base = self.descriptors.texture_count();
        let flat = flatten_asset(&asset, material_base, texture_base);

        self.descriptors.add_materials(
            &self.context,
            &mut self.allocator,
            &mut self.staging,
            &flat.materials,
        );
        let texture_writes: Vec<(vk::ImageView, vk::Sampler)> = asset
            .textures
            .iter()
            .map(|t| (t.view, t.sampler))
            .collect();
        self.descriptors.add_textures(&self.context.device, &texture_writes);

        self.draws.extend(flat.draws);
        self.assets.push(asset);
    }

    /// Records and submits one frame: shadow map, depth pre-pass, forward
    /// opaque and transparent into the HDR target, the auto-exposure
    /// compute chain, and the final blit to the swapchain image.
    pub fn draw(&mut self, camera: &crate::camera::Camera, dt: f32) {
        let device = self.context.device.clone();
        let frame = &self.frames[self.frame_index];

        vk_check(
            unsafe { device.wait_for_fences(&[frame.in_flight], true, u64::MAX) },
            "vkWaitForFences",
        );

        let acquired = unsafe {
            self.swapchain.loader.acquire_next_image(
                self.swapchain.swapchain,
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            )
        };
        let (image_index, acquire_suboptimal) = match acquired {
            Ok(result) => result,
            // No image was acquired; rebuild the chain and skip the frame
            // without advancing the slot index.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.resize_to_surface();
                return;
            }
            Err(err) => fatal(&format!("vkAcquireNextImageKHR failed: {err:?}")),
        };

        let frame = &self.frames[self.frame_index];
        vk_check(
            unsafe { device.reset_fences(&[frame.in_flight]) },
            "vkResetFences",
        );

        let (scene, shadow_scene) = self.scene_data(camera);
        self.descriptors
            .write_scene_data(self.frame_index, &scene, &shadow_scene);

        let cmd = frame.command_buffer;
        vk_check(
            unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) },
            "vkResetCommandBuffer",
        );
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_check(
            unsafe { device.begin_command_buffer(cmd, &begin_info) },
            "vkBeginCommandBuffer",
        );

        self.record_shadow_pass(cmd, &shadow_scene);
        self.record_main_passes(cmd, &scene);
        self.record_exposure_passes(cmd, dt);
        self.record_present_blit(cmd, image_index);

        vk_check(
            unsafe { device.end_command_buffer(cmd) },
            "vkEndCommandBuffer",
        );

        let frame = &self.frames[self.frame_index];
        // The swapchain image is first touched by the final blit, so the
        // acquire semaphore only needs to gate that stage.
        let wait_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.image_available)
            .stage_mask(vk::PipelineStageFlags2::BLIT)];
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.render_finished)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(&signal_infos);
        vk_check(
            unsafe {
                device.queue_submit2(self.context.graphics_queue, &[submit], frame.in_flight)
            },
            "vkQueueSubmit2",
        );

        let wait_semaphores = [frame.render_finished];
        let swapchains = [self.swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present = unsafe {
            self.swapchain
                .loader
                .queue_present(self.context.present_queue, &present_info)
        };

        let (advance, rebuild) = frame_disposition(present, acquire_suboptimal);
        // The slot index only moves forward on a frame that reached
        // presentation.
        if advance {
            self.frame_index = (self.frame_index + 1) % self.frames.len();
        }
        if rebuild {
            self.resize_to_surface();
        }
    }

    /// Rebuilds against whatever extent the surface reports now; used when
    /// acquire or present flags the chain stale before any window event.
    fn resize_to_surface(&mut self) {
        let extent = self.swapchain.extent;
        self.resize_screen(extent.width, extent.height);
    }

    fn scene_data(&self, camera: &crate::camera::Camera) -> (SceneData, SceneData) {
        let view = camera.view();
        let proj = camera.proj();

        let light_position = self.sun_direction * 5.0;
        let light_view = Mat4::look_at_rh(light_position, Vec3::ZERO, Vec3::Y);
        let mut light_proj = Mat4::orthographic_rh(
            -SHADOW_EXTENT,
            SHADOW_EXTENT,
            -SHADOW_EXTENT,
            SHADOW_EXTENT,
            0.0001,
            100.0,
        );
        light_proj.y_axis.y *= -1.0;
        let light_view_proj = light_proj * light_view;

        let scene = SceneData {
            view,
            proj,
            view_proj: proj * view,
            light_view_proj,
            eye_position: camera.eye.extend(1.0),
            sun_direction: self.sun_direction.extend(0.0),
        };
        let shadow = SceneData {
            view: light_view,
            proj: light_proj,
            view_proj: light_view_proj,
            light_view_proj,
            eye_position: light_position.extend(1.0),
            sun_direction: self.sun_direction.extend(0.0),
        };
        (scene, shadow)
    }

    fn record_shadow_pass(&self, cmd: vk::CommandBuffer, shadow_scene: &SceneData) {
        let device = &self.context.device;
        let extent = self.shadow_map.image.extent;

        // Last frame left the map in DEPTH_READ_ONLY; contents are cleared
        // anyway, so the old layout is discarded.
        let to_attachment = [image_barrier(
            self.shadow_map.image.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_attachment);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.shadow_map.image.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines.shadow);
            self.set_viewport(cmd, extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.draw_layout,
                0,
                &[
                    self.descriptors.shadow_sets[self.frame_index],
                    self.descriptors.asset_set,
                ],
                &[],
            );
        }
        // Front faces are culled so only back-face depth reaches the map,
        // which softens shadow acne on thin geometry.
        for draw in self.draws.iter().filter(|d| !d.transparent) {
            if !is_visible(&draw.bounds, shadow_scene.view_proj * draw.model) {
                continue;
            }
            self.record_draw(cmd, draw, vk::CullModeFlags::FRONT);
        }
        unsafe { device.cmd_end_rendering(cmd) };

        let to_sampled = [image_barrier(
            self.shadow_map.image.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_sampled);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn record_main_passes(&self, cmd: vk::CommandBuffer, scene: &SceneData) {
        let device = &self.context.device;
        let extent = self.swapchain.extent;

        let to_attachments = [
            image_barrier(
                self.targets.msaa_color.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            image_barrier(
                self.targets.resolve_color.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            image_barrier(
                self.targets.depth.image,
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        ];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_attachments);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };

        let visible: Vec<&DrawObject> = self
            .draws
            .iter()
            .filter(|draw| is_visible(&draw.bounds, scene.view_proj * draw.model))
            .collect();

        // Depth pre-pass: reverse-Z, cleared to the far plane at 0.
        let prepass_depth = vk::RenderingAttachmentInfo::default()
            .image_view(self.targets.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .depth_attachment(&prepass_depth);
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.depth_prepass,
            );
            self.set_viewport(cmd, extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.draw_layout,
                0,
                &[
                    self.descriptors.scene_sets[self.frame_index],
                    self.descriptors.asset_set,
                ],
                &[],
            );
        }
        for &draw in visible.iter().filter(|d| !d.transparent) {
            self.record_draw(cmd, draw, vk::CullModeFlags::BACK);
        }
        unsafe { device.cmd_end_rendering(cmd) };

        // The forward passes re-read the depth the pre-pass just wrote.
        let depth_ready = [image_barrier(
            self.targets.depth.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&depth_ready);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.targets.msaa_color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .resolve_mode(vk::ResolveModeFlags::AVERAGE)
            .resolve_image_view(self.targets.resolve_color.view)
            .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            });
        let forward_depth = vk::RenderingAttachmentInfo::default()
            .image_view(self.targets.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::NONE);
        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&forward_depth);
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines.opaque);
            self.set_viewport(cmd, extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.draw_layout,
                0,
                &[
                    self.descriptors.scene_sets[self.frame_index],
                    self.descriptors.asset_set,
                ],
                &[],
            );
        }
        for &draw in visible.iter().filter(|d| !d.transparent) {
            self.record_draw(cmd, draw, vk::CullModeFlags::BACK);
        }
        // Transparents draw last, in asset order, against the opaque depth.
        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.transparent,
            );
        }
        for &draw in visible.iter().filter(|d| d.transparent) {
            self.record_draw(cmd, draw, vk::CullModeFlags::BACK);
        }
        unsafe { device.cmd_end_rendering(cmd) };
    }

    fn record_exposure_passes(&self, cmd: vk::CommandBuffer, dt: f32) {
        let device = &self.context.device;
        let extent = self.swapchain.extent;
        let group_count_x = extent.width.div_ceil(16);
        let group_count_y = extent.height.div_ceil(16);

        // Resolve output becomes sampleable for the histogram.
        let to_sampled = [image_barrier(
            self.targets.resolve_color.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_sampled);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);

            device.cmd_fill_buffer(
                cmd,
                self.compute_buffers.histogram.buffer,
                0,
                vk::WHOLE_SIZE,
                0,
            );
        }
        let histogram_zeroed = [super::buffer_barrier(
            self.compute_buffers.histogram.buffer,
            vk::PipelineStageFlags2::CLEAR,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        )];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&histogram_zeroed);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipelines.build_histogram,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipelines.histogram_layout,
                0,
                &[self.descriptors.histogram_set],
                &[],
            );
            let push = HistogramPushConstants {
                histogram_buffer: self.compute_buffers.histogram.address,
                min_log_luminance: MIN_LOG_LUMINANCE,
                inverse_log_luminance_range: 1.0 / LOG_LUMINANCE_RANGE,
                extent: [extent.width, extent.height],
                _pad: [0; 2],
            };
            device.cmd_push_constants(
                cmd,
                self.pipelines.histogram_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, group_count_x, group_count_y, 1);
        }

        let histogram_built = [super::buffer_barrier(
            self.compute_buffers.histogram.buffer,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        )];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&histogram_built);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipelines.average_histogram,
            );
            let push = AverageLuminancePushConstants {
                histogram_buffer: self.compute_buffers.histogram.address,
                average_buffer: self.compute_buffers.average_luminance.address,
                pixel_count: extent.width * extent.height,
                time_coefficient: (1.0 - (-dt * EXPOSURE_ADAPTATION_SPEED).exp()).clamp(0.0, 1.0),
                min_log_luminance: MIN_LOG_LUMINANCE,
                log_luminance_range: LOG_LUMINANCE_RANGE,
            };
            device.cmd_push_constants(
                cmd,
                self.pipelines.average_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            // One workgroup covers the 256 bins.
            device.cmd_dispatch(cmd, 1, 1, 1);
        }

        // Tone-map in place: the resolve image flips to a storage layout
        // once the adapted average is ready.
        let average_ready = [super::buffer_barrier(
            self.compute_buffers.average_luminance.buffer,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        )];
        let to_storage = [image_barrier(
            self.targets.resolve_color.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        )];
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(&average_ready)
            .image_memory_barriers(&to_storage);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipelines.tonemap);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipelines.tonemap_layout,
                0,
                &[self.descriptors.tonemap_set],
                &[],
            );
            let push = ColorCorrectPushConstants {
                average_buffer: self.compute_buffers.average_luminance.address,
                extent: [extent.width, extent.height],
            };
            device.cmd_push_constants(
                cmd,
                self.pipelines.tonemap_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, group_count_x, group_count_y, 1);
        }
    }

    fn record_present_blit(&self, cmd: vk::CommandBuffer, image_index: u32) {
        let device = &self.context.device;
        let extent = self.swapchain.extent;
        let swapchain_image = self.swapchain.images[image_index as usize];

        let to_transfer = [
            image_barrier(
                self.targets.resolve_color.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::PipelineStageFlags2::BLIT,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            // src stage matches the acquire semaphore's wait stage so the
            // layout transition chains after the image is really free.
            image_barrier(
                swapchain_image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::BLIT,
                vk::PipelineStageFlags2::BLIT,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_transfer);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };

        let full_region = [
            vk::Offset3D::default(),
            vk::Offset3D {
                x: extent.width as i32,
                y: extent.height as i32,
                z: 1,
            },
        ];
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let blit = vk::ImageBlit::default()
            .src_subresource(subresource)
            .src_offsets(full_region)
            .dst_subresource(subresource)
            .dst_offsets(full_region);
        unsafe {
            device.cmd_blit_image(
                cmd,
                self.targets.resolve_color.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        let to_present = [image_barrier(
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::BLIT,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::AccessFlags2::NONE,
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_present);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn record_draw(&self, cmd: vk::CommandBuffer, draw: &DrawObject, cull_mode: vk::CullModeFlags) {
        let device = &self.context.device;
        let push = DrawPushConstants {
            model: draw.model,
            vertex_buffer: draw.vertex_buffer,
            material_index: draw.material_index,
            _pad: 0,
        };
        let cull_mode = if draw.double_sided {
            vk::CullModeFlags::NONE
        } else {
            cull_mode
        };
        unsafe {
            device.cmd_set_cull_mode(cmd, cull_mode);
            device.cmd_set_front_face(cmd, draw.front_face);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, draw.index_type);
            device.cmd_push_constants(
                cmd,
                self.pipelines.draw_layout,
                vk::ShaderStageFlags::ALL,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_draw_indexed(cmd, draw.index_count, 1, draw.first_index, 0, 0);
        }
    }

    fn set_viewport(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.context.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.context.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    /// Rebuilds everything sized to the surface. The frame ring is kept;
    /// the ring index does not advance for a resize.
    pub fn resize_screen(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        vk_check(
            unsafe { self.context.device.device_wait_idle() },
            "vkDeviceWaitIdle",
        );

        self.swapchain.recreate(
            &self.context,
            &self.settings,
            vk::Extent2D { width, height },
        );
        self.targets.destroy(&self.context.device, &mut self.allocator);
        self.targets = RenderTargets::new(
            &self.context,
            &mut self.allocator,
            &self.settings,
            self.swapchain.extent,
        );
        self.descriptors.update_compute_targets(
            &self.context.device,
            self.targets.resolve_color.view,
            self.default_sampler,
        );

        if self.swapchain.images.len() != self.frames.len() {
            warn!(
                "Swapchain image count changed from {} to {}",
                self.frames.len(),
                self.swapchain.images.len()
            );
            for frame in &mut self.frames {
                frame.destroy(&self.context.device, self.context.command_pool);
            }
            self.frames = (0..self.swapchain.images.len())
                .map(|_| FrameSlot::new(&self.context.device, self.context.command_pool))
                .collect();
            self.frame_index = 0;
        }
    }

    /// Reloads the graphics pipelines from the SPIR-V on disk.
    pub fn recompile_pipelines(&mut self) {
        vk_check(
            unsafe { self.context.device.device_wait_idle() },
            "vkDeviceWaitIdle",
        );
        self.pipelines.recompile(&self.context, &self.settings);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let device = self.context.device.clone();
        let _ = unsafe { device.device_wait_idle() };

        for mut asset in self.assets.drain(..) {
            asset.destroy(&device, &mut self.allocator);
        }
        unsafe { device.destroy_sampler(self.default_sampler, None) };
        self.allocator.destroy_image(&device, &mut self.default_texture);

        self.descriptors.destroy(&device, &mut self.allocator);
        self.pipelines.destroy(&device);
        self.targets.destroy(&device, &mut self.allocator);
        self.shadow_map.destroy(&device, &mut self.allocator);
        self.compute_buffers.destroy(&device, &mut self.allocator);
        self.staging.destroy(&device, &mut self.allocator);
        for frame in &mut self.frames {
            frame.destroy(&device, self.context.command_pool);
        }
        self.swapchain.destroy(&device);
        self.context.destroy();

        ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Maps the present result onto the frame protocol: whether the slot
/// index advances and whether the swapchain must be rebuilt.
fn frame_disposition(
    present: ash::prelude::VkResult<bool>,
    acquire_suboptimal: bool,
) -> (bool, bool) {
    match present {
        Ok(suboptimal) => (true, suboptimal || acquire_suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => (false, true),
        Err(err) => fatal(&format!("vkQueuePresentKHR failed: {err:?}")),
    }
}

fn create_linear_sampler(device: &ash::Device) -> vk::Sampler {
    let sampler_ci = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);
    vk_check(
        unsafe { device.create_sampler(&sampler_ci, None) },
        "vkCreateSampler",
    )
}

fn create_white_texture(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
) -> super::allocator::AllocatedImage {
    let image = allocator.create_image(
        &context.device,
        vk::Extent2D {
            width: 1,
            height: 1,
        },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageAspectFlags::COLOR,
        vk::SampleCountFlags::TYPE_1,
        1,
        "default white",
    );

    staging.write(&[255u8; 4]);
    immediate_submit(
        &context.device,
        context.command_pool,
        context.graphics_queue,
        |cmd| {
            let to_transfer = [image_barrier(
                image.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::NONE,
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::TRANSFER_WRITE,
            )];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_transfer);
            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                });
            let to_sampled = [image_barrier(
                image.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::COPY,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            )];
            unsafe {
                context.device.cmd_pipeline_barrier2(cmd, &dependency);
                context.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_sampled);
                context.device.cmd_pipeline_barrier2(cmd, &dependency);
            }
        },
    );

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_present_advances_without_a_rebuild() {
        assert_eq!(frame_disposition(Ok(false), false), (true, false));
    }

    #[test]
    fn suboptimal_results_rebuild_but_still_advance() {
        assert_eq!(frame_disposition(Ok(true), false), (true, true));
        assert_eq!(frame_disposition(Ok(false), true), (true, true));
    }

    #[test]
    fn out_of_date_present_rebuilds_and_holds_the_slot_index() {
        assert_eq!(
            frame_disposition(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), false),
            (false, true)
        );
    }
}
