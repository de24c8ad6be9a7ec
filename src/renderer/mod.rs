pub mod allocator;
pub mod context;
pub mod cull;
pub mod descriptors;
pub mod draw;
pub mod frame;
pub mod pipelines;
mod renderer;
pub mod swapchain;
pub mod targets;

pub use cull::Bounds;
pub use draw::{DrawObject, MaterialData, SceneData, TextureInfo, Vertex};
pub use renderer::{Renderer, RendererError};

use ash::vk;

/// Fatal-error policy: an invalid environment, asset, or API contract
/// violation cannot be continued past without risking GPU-side undefined
/// behavior. Print a diagnostic and abort (no unwinding through FFI).
pub(crate) fn fatal(message: &str) -> ! {
    log::error!("{message}");
    std::process::abort();
}

/// Checks a Vulkan call result, aborting with the operation name and the
/// symbolic result code on failure.
pub(crate) fn vk_check<T>(result: ash::prelude::VkResult<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(&format!("{what} failed: {err:?}")),
    }
}

pub(crate) fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// Single-image layout/visibility barrier. Queue family ownership is never
/// transferred; all work runs on the one graphics+present family.
#[allow(clippy::too_many_arguments)]
pub(crate) fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    dst_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(subresource_range(aspect))
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
}

pub(crate) fn buffer_barrier(
    buffer: vk::Buffer,
    src_stage: vk::PipelineStageFlags2,
    dst_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
}
