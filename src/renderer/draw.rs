use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::cull::Bounds;
use crate::asset::GltfAsset;

/// Interleaved vertex as pulled by the vertex shader through a buffer
/// reference; no vertex input state is declared on the pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub color: [f32; 4],
    pub position: [f32; 3],
    pub uv_x: f32,
    pub normal: [f32; 3],
    pub uv_y: f32,
    pub tangent: [f32; 4],
    pub uv1: [f32; 2],
    pub _pad: [f32; 2],
}

/// Slot in the bindless texture array plus which UV set samples it.
/// `index` of 0 is the shared 1x1 white fallback texture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureInfo {
    pub index: u32,
    pub tex_coord: u32,
}

impl TextureInfo {
    pub const NONE: u32 = u32::MAX;

    pub fn none() -> Self {
        Self {
            index: Self::NONE,
            tex_coord: 0,
        }
    }
}

/// One entry of the material storage buffer, 128 bytes, matching the
/// std430 layout in the fragment shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialData {
    pub base_color: TextureInfo,
    pub metallic_roughness: TextureInfo,
    pub normal: TextureInfo,
    pub occlusion: TextureInfo,
    pub emissive: TextureInfo,
    pub clearcoat: TextureInfo,
    pub sheen: TextureInfo,
    pub transmission: TextureInfo,
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub normal_scale: f32,
    pub occlusion_strength: f32,
    pub alpha_cutoff: f32,
    pub transmission_factor: f32,
    pub clearcoat_factor: f32,
    pub sheen_roughness: f32,
    pub _pad: f32,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            base_color: TextureInfo::none(),
            metallic_roughness: TextureInfo::none(),
            normal: TextureInfo::none(),
            occlusion: TextureInfo::none(),
            emissive: TextureInfo::none(),
            clearcoat: TextureInfo::none(),
            sheen: TextureInfo::none(),
            transmission: TextureInfo::none(),
            base_color_factor: [1.0; 4],
            emissive_factor: [0.0; 3],
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            normal_scale: 1.0,
            occlusion_strength: 1.0,
            alpha_cutoff: 0.5,
            transmission_factor: 0.0,
            clearcoat_factor: 0.0,
            sheen_roughness: 0.0,
            _pad: 0.0,
        }
    }
}

/// Per-frame constants shared by every raster pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub light_view_proj: Mat4,
    pub eye_position: Vec4,
    pub sun_direction: Vec4,
}

/// Push constants for the draw pipelines: ALL stages, 80 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub model: Mat4,
    pub vertex_buffer: vk::DeviceAddress,
    pub material_index: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HistogramPushConstants {
    pub histogram_buffer: vk::DeviceAddress,
    pub min_log_luminance: f32,
    pub inverse_log_luminance_range: f32,
    pub extent: [u32; 2],
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AverageLuminancePushConstants {
    pub histogram_buffer: vk::DeviceAddress,
    pub average_buffer: vk::DeviceAddress,
    pub pixel_count: u32,
    pub time_coefficient: f32,
    pub min_log_luminance: f32,
    pub log_luminance_range: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ColorCorrectPushConstants {
    pub average_buffer: vk::DeviceAddress,
    pub extent: [u32; 2],
}

/// One recorded draw: an indexed primitive range with its world transform
/// and global material slot. Built once per asset load, culled per frame.
#[derive(Debug, Clone)]
pub struct DrawObject {
    pub model: Mat4,
    pub bounds: Bounds,
    pub first_index: u32,
    pub index_count: u32,
    pub material_index: u32,
    pub front_face: vk::FrontFace,
    pub transparent: bool,
    /// Double-sided materials disable culling for every pass.
    pub double_sided: bool,
    pub index_buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub vertex_buffer: vk::DeviceAddress,
}

pub struct FlattenedAsset {
    pub draws: Vec<DrawObject>,
    /// Materials with texture slots rebased into the global array.
    pub materials: Vec<MaterialData>,
}

/// Rebases an asset's local material/texture indices into the shared
/// tables and expands its node hierarchy into flat draw records.
///
/// Rebasing happens exactly here and nowhere else: the asset keeps its
/// local indices so it can be flattened again against different bases.
pub fn flatten_asset(asset: &GltfAsset, material_base: u32, texture_base: u32) -> FlattenedAsset {
    let materials = asset
        .materials
        .iter()
        .map(|material| {
            let mut rebased = *material;
            for slot in [
                &mut rebased.base_color,
                &mut rebased.metallic_roughness,
                &mut rebased.normal,
                &mut rebased.occlusion,
                &mut rebased.emissive,
                &mut rebased.clearcoat,
                &mut rebased.sheen,
                &mut rebased.transmission,
            ] {
                slot.index = if slot.index == TextureInfo::NONE {
                    // fall back to the shared white texture
                    0
                } else {
                    slot.index + texture_base
                };
            }
            rebased
        })
        .collect();

    let mut draws = Vec::new();
    for node in &asset.nodes {
        // Mirrored transforms flip triangle winding.
        let front_face = if node.transform.determinant() < 0.0 {
            vk::FrontFace::CLOCKWISE
        } else {
            vk::FrontFace::COUNTER_CLOCKWISE
        };
        for &primitive_index in &node.primitives {
            let primitive = &asset.primitives[primitive_index];
            let material_index = match primitive.material {
                Some(local) => local as u32 + material_base,
                // global slot 0 is the shared default material
                None => 0,
            };
            draws.push(DrawObject {
                model: node.transform,
                bounds: primitive.bounds,
                first_index: primitive.first_index,
                index_count: primitive.index_count,
                material_index,
                front_face,
                transparent: primitive.transparent,
                double_sided: primitive.double_sided,
                index_buffer: asset.index_buffer.buffer,
                index_type: asset.index_type,
                vertex_buffer: asset.vertex_buffer.address,
            });
        }
    }

    FlattenedAsset { draws, materials }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{GltfAsset, NodeDraw, Primitive};
    use crate::renderer::allocator::AllocatedBuffer;
    use glam::Vec3;

    fn test_asset() -> GltfAsset {
        let primitives = vec![
            Primitive {
                first_index: 0,
                index_count: 36,
                material: Some(0),
                transparent: false,
                double_sided: false,
                bounds: Bounds {
                    origin: Vec3::ZERO,
                    extent: Vec3::ONE,
                },
            },
            Primitive {
                first_index: 36,
                index_count: 12,
                material: None,
                transparent: true,
                double_sided: true,
                bounds: Bounds {
                    origin: Vec3::ZERO,
                    extent: Vec3::ONE,
                },
            },
        ];
        let nodes = vec![
            NodeDraw {
                transform: Mat4::IDENTITY,
                primitives: vec![0, 1],
            },
            NodeDraw {
                transform: Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)),
                primitives: vec![0],
            },
        ];
        let material = MaterialData {
            base_color: TextureInfo {
                index: 2,
                tex_coord: 1,
            },
            ..MaterialData::default()
        };
        GltfAsset {
            primitives,
            nodes,
            materials: vec![material],
            images: Vec::new(),
            textures: Vec::new(),
            index_buffer: null_buffer(),
            vertex_buffer: null_buffer(),
            index_type: vk::IndexType::UINT16,
        }
    }

    fn null_buffer() -> AllocatedBuffer {
        AllocatedBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
            address: 0,
        }
    }

    #[test]
    fn material_indices_are_rebased_exactly_once() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 7, 0);

        assert_eq!(flat.draws[0].material_index, 7);
        // the asset's own table is untouched
        let again = flatten_asset(&asset, 7, 0);
        assert_eq!(again.draws[0].material_index, 7);
    }

    #[test]
    fn texture_slots_are_rebased_and_missing_slots_fall_back() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 1, 5);

        assert_eq!(flat.materials[0].base_color.index, 7);
        assert_eq!(flat.materials[0].base_color.tex_coord, 1);
        assert_eq!(flat.materials[0].normal.index, 0);
    }

    #[test]
    fn missing_material_uses_shared_default_slot() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 4, 0);

        assert_eq!(flat.draws[1].material_index, 0);
    }

    #[test]
    fn mirrored_transforms_flip_winding() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 1, 1);

        assert_eq!(flat.draws[0].front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(flat.draws[2].front_face, vk::FrontFace::CLOCKWISE);
    }

    #[test]
    fn nodes_expand_to_one_draw_per_primitive() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 1, 1);

        assert_eq!(flat.draws.len(), 3);
        assert_eq!(flat.draws[1].first_index, 36);
        assert_eq!(flat.draws[1].index_count, 12);
        assert!(flat.draws[1].transparent);
    }

    #[test]
    fn double_sided_flag_reaches_every_draw_of_the_primitive() {
        let asset = test_asset();
        let flat = flatten_asset(&asset, 1, 1);

        // primitive 0 in both nodes, primitive 1 in the first node
        assert!(!flat.draws[0].double_sided);
        assert!(flat.draws[1].double_sided);
        assert!(!flat.draws[2].double_sided);
    }

    #[test]
    fn push_constant_sizes_match_shader_blocks() {
        assert_eq!(std::mem::size_of::<DrawPushConstants>(), 80);
        assert_eq!(std::mem::size_of::<MaterialData>(), 128);
    }
}
