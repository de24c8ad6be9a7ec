pub mod gltf;
pub mod texture;

use ash::vk;
use glam::Mat4;

use crate::renderer::allocator::{AllocatedBuffer, AllocatedImage, GpuAllocator};
use crate::renderer::{Bounds, MaterialData};

/// A loaded glTF scene with its geometry resident on the GPU. Material and
/// texture indices are local to the asset; the renderer rebases them into
/// the shared tables when the asset is registered.
pub struct GltfAsset {
    pub primitives: Vec<Primitive>,
    pub nodes: Vec<NodeDraw>,
    pub materials: Vec<MaterialData>,
    pub images: Vec<AllocatedImage>,
    pub textures: Vec<GpuTexture>,
    pub index_buffer: AllocatedBuffer,
    pub vertex_buffer: AllocatedBuffer,
    pub index_type: vk::IndexType,
}

/// One indexed range of the asset's merged geometry buffers.
pub struct Primitive {
    pub first_index: u32,
    pub index_count: u32,
    pub material: Option<usize>,
    pub transparent: bool,
    pub double_sided: bool,
    pub bounds: Bounds,
}

/// A scene node that draws geometry: its world transform and the
/// primitives of its mesh.
pub struct NodeDraw {
    pub transform: Mat4,
    pub primitives: Vec<usize>,
}

/// A glTF texture: a view into one of the asset's images plus its own
/// sampler. Several textures may share an image.
pub struct GpuTexture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl GltfAsset {
    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        for texture in &self.textures {
            unsafe { device.destroy_sampler(texture.sampler, None) };
        }
        for image in &mut self.images {
            allocator.destroy_image(device, image);
        }
        allocator.destroy_buffer(device, &mut self.index_buffer);
        allocator.destroy_buffer(device, &mut self.vertex_buffer);
    }
}
