use ash::vk;
use glam::{Mat4, Vec3};
use photometric::asset::{GltfAsset, NodeDraw, Primitive};
use photometric::renderer::allocator::AllocatedBuffer;
use photometric::renderer::draw::flatten_asset;
use photometric::renderer::{Bounds, MaterialData, TextureInfo};

fn buffer() -> AllocatedBuffer {
    AllocatedBuffer {
        buffer: vk::Buffer::null(),
        allocation: None,
        size: 0,
        address: 0,
    }
}

fn bounds() -> Bounds {
    Bounds {
        origin: Vec3::ZERO,
        extent: Vec3::ONE,
    }
}

fn two_material_asset() -> GltfAsset {
    GltfAsset {
        primitives: vec![
            Primitive {
                first_index: 0,
                index_count: 6,
                material: Some(0),
                transparent: false,
                double_sided: false,
                bounds: bounds(),
            },
            Primitive {
                first_index: 6,
                index_count: 6,
                material: Some(1),
                transparent: true,
                double_sided: true,
                bounds: bounds(),
            },
        ],
        nodes: vec![NodeDraw {
            transform: Mat4::IDENTITY,
            primitives: vec![0, 1],
        }],
        materials: vec![
            MaterialData {
                base_color: TextureInfo {
                    index: 0,
                    tex_coord: 0,
                },
                ..MaterialData::default()
            },
            MaterialData {
                base_color: TextureInfo {
                    index: 1,
                    tex_coord: 0,
                },
                ..MaterialData::default()
            },
        ],
        images: Vec::new(),
        textures: Vec::new(),
        index_buffer: buffer(),
        vertex_buffer: buffer(),
        index_type: vk::IndexType::UINT16,
    }
}

#[test]
fn two_assets_get_disjoint_table_ranges() {
    let first = two_material_asset();
    let second = two_material_asset();

    // The shared tables start with the default material and texture.
    let flat_first = flatten_asset(&first, 1, 1);
    let next_material_base = 1 + flat_first.materials.len() as u32;
    let next_texture_base = 1 + 2;
    let flat_second = flatten_asset(&second, next_material_base, next_texture_base);

    let first_range: Vec<u32> = flat_first.draws.iter().map(|d| d.material_index).collect();
    let second_range: Vec<u32> = flat_second.draws.iter().map(|d| d.material_index).collect();
    assert_eq!(first_range, vec![1, 2]);
    assert_eq!(second_range, vec![3, 4]);

    assert_eq!(flat_first.materials[1].base_color.index, 2);
    assert_eq!(flat_second.materials[1].base_color.index, 4);
}

#[test]
fn transparency_flag_survives_flattening() {
    let flat = flatten_asset(&two_material_asset(), 1, 1);
    assert!(!flat.draws[0].transparent);
    assert!(flat.draws[1].transparent);
}

#[test]
fn default_material_layout_matches_the_gpu_table() {
    assert_eq!(std::mem::size_of::<MaterialData>(), 128);
    let default = MaterialData::default();
    assert_eq!(default.base_color.index, TextureInfo::NONE);
    assert_eq!(default.base_color_factor, [1.0; 4]);
}
