use std::path::Path;

use ash::vk;
use glam::{Mat4, Vec3};
use gltf::Gltf;
use log::{info, warn};

use super::texture::{classify_linear_images, compressed_basis_data, sniff_channels, upload_basis_texture};
use super::{GltfAsset, GpuTexture, NodeDraw, Primitive};
use crate::renderer::allocator::{
    immediate_submit, AllocatedBuffer, GpuAllocator, Residency, StagingArena,
};
use crate::renderer::context::VkContext;
use crate::renderer::draw::{MaterialData, TextureInfo, Vertex};
use crate::renderer::{buffer_barrier, fatal, Bounds};

/// Loads a glTF or glb scene: merged geometry buffers on the GPU, one
/// material record per glTF material with local texture indices, and the
/// full compressed texture set.
pub fn load(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
    cache_dir: &Path,
    path: &Path,
) -> GltfAsset {
    info!("Loading asset {path:?}");
    let gltf = match Gltf::open(path) {
        Ok(gltf) => gltf,
        Err(err) => fatal(&format!("Cannot open asset {path:?}: {err}")),
    };
    let base = path.parent().unwrap_or(Path::new("."));
    let buffers = match gltf::import_buffers(&gltf.document, Some(base), gltf.blob.clone()) {
        Ok(buffers) => buffers,
        Err(err) => fatal(&format!("Cannot load buffers for {path:?}: {err}")),
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("asset");

    let (materials, material_flags) = read_materials(&gltf.document);
    let (images, textures) =
        load_textures(context, allocator, staging, cache_dir, stem, base, &gltf, &buffers);
    let geometry = read_geometry(&gltf.document, &buffers, &material_flags);
    let nodes = flatten_nodes(&gltf.document, &geometry.mesh_primitives);

    let (vertex_buffer, index_buffer, index_type) =
        upload_geometry(context, allocator, staging, &geometry);

    info!(
        "Loaded {path:?}: {} draws, {} materials, {} textures",
        geometry.primitives.len(),
        materials.len(),
        textures.len()
    );

    GltfAsset {
        primitives: geometry.primitives,
        nodes,
        materials,
        images,
        textures,
        index_buffer,
        vertex_buffer,
        index_type,
    }
}

fn texture_slot(info: Option<gltf::texture::Info>) -> TextureInfo {
    match info {
        Some(info) => TextureInfo {
            index: info.texture().index() as u32,
            tex_coord: info.tex_coord(),
        },
        None => TextureInfo::none(),
    }
}

/// Per-material routing bits that live outside the GPU record.
#[derive(Debug, Clone, Copy)]
struct MaterialFlags {
    transparent: bool,
    double_sided: bool,
}

fn read_materials(document: &gltf::Document) -> (Vec<MaterialData>, Vec<MaterialFlags>) {
    let mut materials = Vec::new();
    let mut flags = Vec::new();
    for material in document.materials() {
        let pbr = material.pbr_metallic_roughness();
        let mut data = MaterialData {
            base_color: texture_slot(pbr.base_color_texture()),
            metallic_roughness: texture_slot(pbr.metallic_roughness_texture()),
            emissive: texture_slot(material.emissive_texture()),
            base_color_factor: pbr.base_color_factor(),
            emissive_factor: material.emissive_factor(),
            metallic_factor: pbr.metallic_factor(),
            roughness_factor: pbr.roughness_factor(),
            alpha_cutoff: material.alpha_cutoff().unwrap_or(0.5),
            ..MaterialData::default()
        };
        if let Some(normal) = material.normal_texture() {
            data.normal = TextureInfo {
                index: normal.texture().index() as u32,
                tex_coord: normal.tex_coord(),
            };
            data.normal_scale = normal.scale();
        }
        if let Some(occlusion) = material.occlusion_texture() {
            data.occlusion = TextureInfo {
                index: occlusion.texture().index() as u32,
                tex_coord: occlusion.tex_coord(),
            };
            data.occlusion_strength = occlusion.strength();
        }
        if let Some(transmission) = material.transmission() {
            data.transmission = texture_slot(transmission.transmission_texture());
            data.transmission_factor = transmission.transmission_factor();
        }
        // Older assets: specular-glossiness diffuse stands in for base color.
        if let Some(sg) = material.pbr_specular_glossiness() {
            if let Some(diffuse) = sg.diffuse_texture() {
                data.base_color = TextureInfo {
                    index: diffuse.texture().index() as u32,
                    tex_coord: diffuse.tex_coord(),
                };
            }
            data.base_color_factor = sg.diffuse_factor();
        }
        read_untyped_extensions(&material, &mut data);

        materials.push(data);
        // Masked materials draw with the blended set rather than getting
        // a dedicated cutout pipeline.
        flags.push(MaterialFlags {
            transparent: material.alpha_mode() != gltf::material::AlphaMode::Opaque,
            double_sided: material.double_sided(),
        });
    }
    (materials, flags)
}

/// Clearcoat and sheen are not typed by the loader; pull the handful of
/// fields we shade with out of the raw extension JSON.
fn read_untyped_extensions(material: &gltf::Material, data: &mut MaterialData) {
    let Some(extensions) = material.extensions() else {
        return;
    };
    if let Some(clearcoat) = extensions.get("KHR_materials_clearcoat") {
        data.clearcoat_factor = clearcoat
            .get("clearcoatFactor")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as f32;
        data.clearcoat = json_texture_slot(clearcoat.get("clearcoatTexture"));
    }
    if let Some(sheen) = extensions.get("KHR_materials_sheen") {
        data.sheen_roughness = sheen
            .get("sheenRoughnessFactor")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as f32;
        data.sheen = json_texture_slot(sheen.get("sheenColorTexture"));
    }
}

fn json_texture_slot(value: Option<&serde_json::Value>) -> TextureInfo {
    let Some(value) = value else {
        return TextureInfo::none();
    };
    let index = value.get("index").and_then(|i| i.as_u64());
    match index {
        Some(index) => TextureInfo {
            index: index as u32,
            tex_coord: value
                .get("texCoord")
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as u32,
        },
        None => TextureInfo::none(),
    }
}

#[allow(clippy::too_many_arguments)]
fn load_textures(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
    cache_dir: &Path,
    stem: &str,
    base: &Path,
    gltf: &Gltf,
    buffers: &[gltf::buffer::Data],
) -> (Vec<crate::renderer::allocator::AllocatedImage>, Vec<GpuTexture>) {
    let linear_images = classify_linear_images(&gltf.document);

    let mut images = Vec::new();
    for image in gltf.document.images() {
        let index = image.index();
        let bytes = image_bytes(&image, base, buffers);
        let label = format!("{stem}_{index}");
        let srgb = !linear_images.contains(&index);
        let channels = sniff_channels(&bytes, &label);
        let basis = compressed_basis_data(cache_dir, stem, index, &bytes, srgb);
        images.push(upload_basis_texture(
            context, allocator, staging, &basis, channels, srgb, &label,
        ));
    }

    let textures = gltf
        .document
        .textures()
        .map(|texture| GpuTexture {
            view: images[texture.source().index()].view,
            sampler: create_sampler(&context.device, texture.sampler()),
        })
        .collect();

    (images, textures)
}

fn image_bytes(image: &gltf::Image, base: &Path, buffers: &[gltf::buffer::Data]) -> Vec<u8> {
    match image.source() {
        gltf::image::Source::Uri { uri, .. } => {
            let path = base.join(uri);
            match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => fatal(&format!("Cannot read image {path:?}: {err}")),
            }
        }
        gltf::image::Source::View { view, .. } => {
            let data = &buffers[view.buffer().index()];
            data[view.offset()..view.offset() + view.length()].to_vec()
        }
    }
}

fn create_sampler(device: &ash::Device, sampler: gltf::texture::Sampler) -> vk::Sampler {
    use gltf::texture::{MagFilter, MinFilter, WrappingMode};

    let mag_filter = match sampler.mag_filter() {
        Some(MagFilter::Nearest) => vk::Filter::NEAREST,
        _ => vk::Filter::LINEAR,
    };
    let (min_filter, mipmap_mode) = match sampler.min_filter() {
        Some(MinFilter::Nearest) | Some(MinFilter::NearestMipmapNearest) => {
            (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
        }
        Some(MinFilter::NearestMipmapLinear) => {
            (vk::Filter::NEAREST, vk::SamplerMipmapMode::LINEAR)
        }
        Some(MinFilter::LinearMipmapNearest) => {
            (vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST)
        }
        _ => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    };
    let wrap = |mode: WrappingMode| match mode {
        WrappingMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrappingMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        WrappingMode::Repeat => vk::SamplerAddressMode::REPEAT,
    };

    let sampler_ci = vk::SamplerCreateInfo::default()
        .mag_filter(mag_filter)
        .min_filter(min_filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(wrap(sampler.wrap_s()))
        .address_mode_v(wrap(sampler.wrap_t()))
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);
    crate::renderer::vk_check(
        unsafe { device.create_sampler(&sampler_ci, None) },
        "vkCreateSampler",
    )
}

struct Geometry {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    primitives: Vec<Primitive>,
    /// Global primitive indices per mesh, for node flattening.
    mesh_primitives: Vec<Vec<usize>>,
}

fn read_geometry(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    material_flags: &[MaterialFlags],
) -> Geometry {
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();
    let mut primitives = Vec::new();
    let mut mesh_primitives = Vec::new();

    for mesh in document.meshes() {
        let mut owned = Vec::new();
        for primitive in mesh.primitives() {
            let reader = primitive.reader(|buffer| Some(&*buffers[buffer.index()]));
            let Some(positions) = reader.read_positions() else {
                warn!(
                    "Mesh {:?} has a primitive without positions, skipping it",
                    mesh.name().unwrap_or("unnamed")
                );
                continue;
            };

            let vertex_offset = vertices.len() as u32;
            let first_index = indices.len() as u32;

            let positions: Vec<[f32; 3]> = positions.collect();
            let normals: Vec<[f32; 3]> = reader
                .read_normals()
                .map(|iter| iter.collect())
                .unwrap_or_default();
            let tangents: Vec<[f32; 4]> = reader
                .read_tangents()
                .map(|iter| iter.collect())
                .unwrap_or_default();
            let colors: Vec<[f32; 4]> = reader
                .read_colors(0)
                .map(|iter| iter.into_rgba_f32().collect())
                .unwrap_or_default();
            let uv0: Vec<[f32; 2]> = reader
                .read_tex_coords(0)
                .map(|iter| iter.into_f32().collect())
                .unwrap_or_default();
            let uv1: Vec<[f32; 2]> = reader
                .read_tex_coords(1)
                .map(|iter| iter.into_f32().collect())
                .unwrap_or_default();

            for (index, position) in positions.iter().enumerate() {
                let uv0 = uv0.get(index).copied().unwrap_or([0.0, 0.0]);
                vertices.push(Vertex {
                    color: colors.get(index).copied().unwrap_or([1.0; 4]),
                    position: *position,
                    uv_x: uv0[0],
                    normal: normals.get(index).copied().unwrap_or([0.0, 1.0, 0.0]),
                    uv_y: uv0[1],
                    tangent: tangents.get(index).copied().unwrap_or([1.0, 0.0, 0.0, 1.0]),
                    uv1: uv1.get(index).copied().unwrap_or([0.0, 0.0]),
                    _pad: [0.0; 2],
                });
            }

            // Index widths (u8, u16, u32) all normalize to u32 here; the
            // final width is chosen once the whole asset is merged.
            match reader.read_indices() {
                Some(read) => {
                    indices.extend(read.into_u32().map(|i| i + vertex_offset));
                }
                None => {
                    indices.extend(vertex_offset..vertex_offset + positions.len() as u32);
                }
            }

            let bounding = primitive.bounding_box();
            let min = Vec3::from(bounding.min);
            let max = Vec3::from(bounding.max);

            let material = primitive.material().index();
            let flags = material
                .map(|index| material_flags[index])
                .unwrap_or(MaterialFlags {
                    transparent: false,
                    double_sided: false,
                });

            owned.push(primitives.len());
            primitives.push(Primitive {
                first_index,
                index_count: indices.len() as u32 - first_index,
                material,
                transparent: flags.transparent,
                double_sided: flags.double_sided,
                bounds: Bounds {
                    origin: (min + max) * 0.5,
                    extent: (max - min) * 0.5,
                },
            });
        }
        mesh_primitives.push(owned);
    }

    Geometry {
        vertices,
        indices,
        primitives,
        mesh_primitives,
    }
}

fn flatten_nodes(document: &gltf::Document, mesh_primitives: &[Vec<usize>]) -> Vec<NodeDraw> {
    let mut nodes = Vec::new();
    let scene = document.default_scene().or_else(|| document.scenes().next());
    let Some(scene) = scene else {
        warn!("Asset has no scenes");
        return nodes;
    };
    for node in scene.nodes() {
        visit_node(&node, Mat4::IDENTITY, mesh_primitives, &mut nodes);
    }
    nodes
}

fn visit_node(
    node: &gltf::Node,
    parent: Mat4,
    mesh_primitives: &[Vec<usize>],
    out: &mut Vec<NodeDraw>,
) {
    let local = Mat4::from_cols_array_2d(&node.transform().matrix());
    let world = parent * local;
    if let Some(mesh) = node.mesh() {
        let primitives = mesh_primitives[mesh.index()].clone();
        if !primitives.is_empty() {
            out.push(NodeDraw {
                transform: world,
                primitives,
            });
        }
    }
    for child in node.children() {
        visit_node(&child, world, mesh_primitives, out);
    }
}

fn upload_geometry(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
    geometry: &Geometry,
) -> (AllocatedBuffer, AllocatedBuffer, vk::IndexType) {
    // Narrow indices only when every rebased index fits.
    let (index_bytes, index_type) = if geometry.vertices.len() <= u16::MAX as usize + 1 {
        let narrowed: Vec<u16> = geometry.indices.iter().map(|&i| i as u16).collect();
        (bytemuck::cast_slice(&narrowed).to_vec(), vk::IndexType::UINT16)
    } else {
        (
            bytemuck::cast_slice(&geometry.indices).to_vec(),
            vk::IndexType::UINT32,
        )
    };
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&geometry.vertices);

    let vertex_buffer = allocator.create_buffer(
        &context.device,
        (vertex_bytes.len() as vk::DeviceSize).max(std::mem::size_of::<Vertex>() as vk::DeviceSize),
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        Residency::DeviceLocal,
        "asset vertices",
    );
    let index_buffer = allocator.create_buffer(
        &context.device,
        (index_bytes.len() as vk::DeviceSize).max(4),
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        Residency::DeviceLocal,
        "asset indices",
    );

    upload_buffer(context, allocator, staging, vertex_bytes, &vertex_buffer);
    upload_buffer(context, allocator, staging, &index_bytes, &index_buffer);

    (vertex_buffer, index_buffer, index_type)
}

fn upload_buffer(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
    bytes: &[u8],
    destination: &AllocatedBuffer,
) {
    if bytes.is_empty() {
        return;
    }
    staging.ensure_capacity(&context.device, allocator, bytes.len() as vk::DeviceSize);
    staging.write(bytes);
    immediate_submit(
        &context.device,
        context.command_pool,
        context.graphics_queue,
        |cmd| {
            let region = vk::BufferCopy::default().size(bytes.len() as vk::DeviceSize);
            unsafe {
                context.device.cmd_copy_buffer(
                    cmd,
                    staging.buffer.buffer,
                    destination.buffer,
                    &[region],
                );
            }
            let barrier = buffer_barrier(
                destination.buffer,
                vk::PipelineStageFlags2::COPY,
                vk::PipelineStageFlags2::ALL_GRAPHICS,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::INDEX_READ,
            );
            let barriers = [barrier];
            let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
            unsafe { context.device.cmd_pipeline_barrier2(cmd, &dependency) };
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(json: &str) -> gltf::Document {
        Gltf::from_slice(json.as_bytes())
            .expect("fixture document parses")
            .document
    }

    #[test]
    fn masked_materials_route_to_the_blended_set() {
        let document = document(
            r#"{
                "asset": {"version": "2.0"},
                "materials": [
                    {"alphaMode": "OPAQUE"},
                    {"alphaMode": "MASK", "alphaCutoff": 0.25},
                    {"alphaMode": "BLEND"}
                ]
            }"#,
        );
        let (materials, flags) = read_materials(&document);
        assert_eq!(materials.len(), 3);
        assert!(!flags[0].transparent);
        assert!(flags[1].transparent);
        assert!(flags[2].transparent);
        assert_eq!(materials[1].alpha_cutoff, 0.25);
    }

    #[test]
    fn double_sided_materials_are_flagged() {
        let document = document(
            r#"{
                "asset": {"version": "2.0"},
                "materials": [
                    {"doubleSided": true},
                    {}
                ]
            }"#,
        );
        let (_, flags) = read_materials(&document);
        assert!(flags[0].double_sided);
        assert!(!flags[1].double_sided);
    }
}
