use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Once;

use ash::vk;
use basis_universal::{
    BasisTextureFormat, Compressor, CompressorParams, TranscodeParameters, Transcoder,
    TranscoderTextureFormat,
};
use image::ImageDecoder;
use log::{info, warn};

use crate::renderer::allocator::{
    immediate_submit, AllocatedImage, GpuAllocator, StagingArena,
};
use crate::renderer::context::VkContext;
use crate::renderer::{fatal, image_barrier};

static TRANSCODER_INIT: Once = Once::new();

/// Images referenced through a linear-data slot (normals, ORM, occlusion,
/// transmission, specular-glossiness, clearcoat maps, sheen roughness).
/// These must not be gamma-decoded. Everything not in the returned set,
/// including images no material references, is treated as sRGB color
/// data; one linear reference wins over any number of color references.
pub fn classify_linear_images(document: &gltf::Document) -> HashSet<usize> {
    let image_of = |texture_index: usize| -> Option<usize> {
        document
            .textures()
            .nth(texture_index)
            .map(|t| t.source().index())
    };

    let mut linear = HashSet::new();
    for material in document.materials() {
        if let Some(tex) = material.pbr_metallic_roughness().metallic_roughness_texture() {
            linear.extend(image_of(tex.texture().index()));
        }
        if let Some(tex) = material.normal_texture() {
            linear.extend(image_of(tex.texture().index()));
        }
        if let Some(tex) = material.occlusion_texture() {
            linear.extend(image_of(tex.texture().index()));
        }
        if let Some(transmission) = material.transmission() {
            if let Some(tex) = transmission.transmission_texture() {
                linear.extend(image_of(tex.texture().index()));
            }
        }
        // The combined specular-glossiness map holds exponents, not color.
        if let Some(sg) = material.pbr_specular_glossiness() {
            if let Some(tex) = sg.specular_glossiness_texture() {
                linear.extend(image_of(tex.texture().index()));
            }
        }
        // Clearcoat and sheen roughness are not typed by the loader.
        if let Some(extensions) = material.extensions() {
            if let Some(clearcoat) = extensions.get("KHR_materials_clearcoat") {
                for slot in [
                    "clearcoatTexture",
                    "clearcoatRoughnessTexture",
                    "clearcoatNormalTexture",
                ] {
                    if let Some(index) = extension_texture_index(clearcoat, slot) {
                        linear.extend(image_of(index));
                    }
                }
            }
            if let Some(sheen) = extensions.get("KHR_materials_sheen") {
                if let Some(index) = extension_texture_index(sheen, "sheenRoughnessTexture") {
                    linear.extend(image_of(index));
                }
            }
        }
    }
    linear
}

fn extension_texture_index(extension: &serde_json::Value, slot: &str) -> Option<usize> {
    extension
        .get(slot)
        .and_then(|t| t.get("index"))
        .and_then(|i| i.as_u64())
        .map(|i| i as usize)
}

/// Transcode target and matching Vulkan format for a source image.
pub fn transcode_format(channels: u8, srgb: bool) -> (TranscoderTextureFormat, vk::Format) {
    match channels {
        1 => (TranscoderTextureFormat::BC4_R, vk::Format::BC4_UNORM_BLOCK),
        2 => (TranscoderTextureFormat::BC5_RG, vk::Format::BC5_UNORM_BLOCK),
        _ => (
            TranscoderTextureFormat::BC7_RGBA,
            if srgb {
                vk::Format::BC7_SRGB_BLOCK
            } else {
                vk::Format::BC7_UNORM_BLOCK
            },
        ),
    }
}

/// Compressed-texture cache entry name. Keyed by the source file stem and
/// the image's position in the document, so two assets with the same stem
/// will collide on purpose rather than recompress.
pub fn cache_file_name(asset_stem: &str, image_index: usize) -> String {
    format!("{asset_stem}_{image_index}.basis")
}

/// Reads just the header to learn the stored channel count, so a cache
/// hit never pays for a full decode.
pub fn sniff_channels(bytes: &[u8], label: &str) -> u8 {
    let reader = match image::ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(err) => fatal(&format!("Cannot sniff image format for {label}: {err}")),
    };
    let decoder = match reader.into_decoder() {
        Ok(decoder) => decoder,
        Err(err) => fatal(&format!("Cannot read image header for {label}: {err}")),
    };
    match decoder.color_type().channel_count() {
        c @ 1..=3 => c,
        _ => 4,
    }
}

pub struct TexturePixels {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Decodes an embedded or external image into tightly packed pixels,
/// keeping the source channel count so single and dual channel maps get
/// the cheaper block formats.
pub fn decode_pixels(bytes: &[u8], label: &str) -> TexturePixels {
    let reader = match image::ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(err) => fatal(&format!("Cannot sniff image format for {label}: {err}")),
    };
    let decoded = match reader.decode() {
        Ok(decoded) => decoded,
        Err(err) => fatal(&format!("Cannot decode image {label}: {err}")),
    };

    let channels = decoded.color().channel_count();
    let width = decoded.width();
    let height = decoded.height();
    let data = match channels {
        1 => decoded.to_luma8().into_raw(),
        2 => decoded.to_luma_alpha8().into_raw(),
        3 => decoded.to_rgb8().into_raw(),
        _ => decoded.to_rgba8().into_raw(),
    };
    let channels = match channels {
        1 | 2 | 3 => channels,
        _ => 4,
    };

    TexturePixels {
        data,
        width,
        height,
        channels,
    }
}

/// Returns the UASTC-compressed basis file for an image, reusing the
/// on-disk cache when a previous run already paid for compression.
pub fn compressed_basis_data(
    cache_dir: &Path,
    asset_stem: &str,
    image_index: usize,
    bytes: &[u8],
    srgb: bool,
) -> Vec<u8> {
    let cache_path: PathBuf = cache_dir.join(cache_file_name(asset_stem, image_index));
    if let Ok(cached) = std::fs::read(&cache_path) {
        return cached;
    }

    let label = cache_file_name(asset_stem, image_index);
    info!("Compressing texture {label}");
    let pixels = decode_pixels(bytes, &label);

    let mut params = CompressorParams::new();
    params.set_basis_format(BasisTextureFormat::UASTC4x4);
    params.set_color_space(if srgb {
        basis_universal::ColorSpace::Srgb
    } else {
        basis_universal::ColorSpace::Linear
    });
    params
        .source_image_mut(0)
        .init(&pixels.data, pixels.width, pixels.height, pixels.channels);

    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let mut compressor = Compressor::new(threads);
    if !unsafe { compressor.init(&params) } {
        fatal(&format!("Texture compressor rejected {label}"));
    }
    if unsafe { compressor.process() }.is_err() {
        fatal(&format!("Texture compression failed for {label}"));
    }
    let basis = compressor.basis_file().to_vec();

    if let Err(err) = std::fs::create_dir_all(cache_dir)
        .and_then(|_| std::fs::write(&cache_path, &basis))
    {
        warn!("Could not write texture cache entry {cache_path:?}: {err}");
    }

    basis
}

/// Transcodes a basis file to the device block format and uploads the full
/// mip chain.
pub fn upload_basis_texture(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    staging: &mut StagingArena,
    basis: &[u8],
    channels: u8,
    srgb: bool,
    label: &str,
) -> AllocatedImage {
    TRANSCODER_INIT.call_once(basis_universal::transcoder_init);

    let mut transcoder = Transcoder::new();
    let (transcode_fmt, vk_format) = transcode_format(channels, srgb);

    if transcoder.prepare_transcoding(basis).is_err() {
        fatal(&format!("Basis data for {label} is not transcodable"));
    }
    let level_count = transcoder.image_level_count(basis, 0);
    if level_count == 0 {
        fatal(&format!("Basis data for {label} contains no image levels"));
    }

    let mut levels = Vec::with_capacity(level_count as usize);
    let mut total_size = 0usize;
    for level in 0..level_count {
        let info = match transcoder.image_level_info(basis, 0, level) {
            Some(info) => info,
            None => fatal(&format!("Missing level {level} in basis data for {label}")),
        };
        let data = match transcoder.transcode_image_level(
            basis,
            transcode_fmt,
            TranscodeParameters {
                image_index: 0,
                level_index: level,
                ..Default::default()
            },
        ) {
            Ok(data) => data,
            Err(err) => fatal(&format!("Transcode failed for {label} level {level}: {err:?}")),
        };
        total_size += data.len();
        levels.push((info.m_orig_width, info.m_orig_height, data));
    }
    transcoder.end_transcoding();

    let (base_width, base_height) = (levels[0].0, levels[0].1);
    let image = allocator.create_image(
        &context.device,
        vk::Extent2D {
            width: base_width,
            height: base_height,
        },
        vk_format,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageAspectFlags::COLOR,
        vk::SampleCountFlags::TYPE_1,
        level_count,
        label,
    );

    staging.ensure_capacity(&context.device, allocator, total_size as vk::DeviceSize);
    let mut regions = Vec::with_capacity(levels.len());
    let mut offset = 0usize;
    {
        let mapped = staging.buffer.mapped_slice_mut();
        for (level, (width, height, data)) in levels.iter().enumerate() {
            mapped[offset..offset + data.len()].copy_from_slice(data);
            regions.push(
                vk::BufferImageCopy::default()
                    .buffer_offset(offset as vk::DeviceSize)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level as u32,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: *width,
                        height: *height,
                        depth: 1,
                    }),
            );
            offset += data.len();
        }
    }

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
            unsafe {
                context.device.cmd_pipeline_barrier2(cmd, &dependency);
                context.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            }
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
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&to_sampled);
            unsafe { context.device.cmd_pipeline_barrier2(cmd, &dependency) };
        },
    );

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_names_combine_stem_and_image_index() {
        assert_eq!(cache_file_name("Sponza", 0), "Sponza_0.basis");
        assert_eq!(cache_file_name("Sponza", 17), "Sponza_17.basis");
    }

    #[test]
    fn channel_count_selects_block_format() {
        assert_eq!(
            transcode_format(1, false).1,
            vk::Format::BC4_UNORM_BLOCK
        );
        assert_eq!(
            transcode_format(2, false).1,
            vk::Format::BC5_UNORM_BLOCK
        );
        assert_eq!(transcode_format(3, true).1, vk::Format::BC7_SRGB_BLOCK);
        assert_eq!(transcode_format(4, false).1, vk::Format::BC7_UNORM_BLOCK);
    }

    #[test]
    fn srgb_only_affects_color_capable_formats() {
        assert_eq!(transcode_format(1, true).1, vk::Format::BC4_UNORM_BLOCK);
        assert_eq!(transcode_format(2, true).1, vk::Format::BC5_UNORM_BLOCK);
    }

    fn document(json: &str) -> gltf::Document {
        gltf::Gltf::from_slice(json.as_bytes())
            .expect("fixture document parses")
            .document
    }

    #[test]
    fn linear_reference_overrides_color_use_of_the_same_image() {
        let document = document(
            r#"{
                "asset": {"version": "2.0"},
                "images": [{"uri": "shared.png"}],
                "textures": [{"source": 0}],
                "materials": [{
                    "pbrMetallicRoughness": {
                        "baseColorTexture": {"index": 0},
                        "metallicRoughnessTexture": {"index": 0}
                    }
                }]
            }"#,
        );
        let linear = classify_linear_images(&document);
        assert!(linear.contains(&0));
    }

    #[test]
    fn unreferenced_images_default_to_srgb() {
        let document = document(
            r#"{
                "asset": {"version": "2.0"},
                "images": [{"uri": "orphan.png"}]
            }"#,
        );
        let linear = classify_linear_images(&document);
        assert!(!linear.contains(&0));
    }

    #[test]
    fn specular_glossiness_map_is_linear_but_its_diffuse_is_not() {
        let document = document(
            r#"{
                "asset": {"version": "2.0"},
                "extensionsUsed": ["KHR_materials_pbrSpecularGlossiness"],
                "images": [{"uri": "diffuse.png"}, {"uri": "sg.png"}],
                "textures": [{"source": 0}, {"source": 1}],
                "materials": [{
                    "extensions": {
                        "KHR_materials_pbrSpecularGlossiness": {
                            "diffuseTexture": {"index": 0},
                            "specularGlossinessTexture": {"index": 1}
                        }
                    }
                }]
            }"#,
        );
        let linear = classify_linear_images(&document);
        assert!(linear.contains(&1));
        assert!(!linear.contains(&0));
    }

    #[test]
    fn cache_hit_returns_stored_bytes_without_decoding() {
        let dir = std::env::temp_dir().join("photometric-texture-cache-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(cache_file_name("fixture", 3));
        std::fs::write(&path, b"compressed bytes from a previous run").unwrap();

        // The source bytes are not a decodable image; only the cache path
        // can produce this result.
        let basis = compressed_basis_data(&dir, "fixture", 3, b"not an image", true);
        assert_eq!(basis, b"compressed bytes from a previous run");

        let _ = std::fs::remove_file(&path);
    }
}
