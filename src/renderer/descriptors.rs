use ash::vk;
use log::info;

use super::allocator::{immediate_submit, AllocatedBuffer, GpuAllocator, Residency, StagingArena};
use super::context::VkContext;
use super::draw::{MaterialData, SceneData};
use super::{buffer_barrier, fatal, vk_check};

/// Capacity of the bindless texture array. The binding is partially bound,
/// so only slots below `texture_count` are ever sampled.
pub const MAX_TEXTURES: u32 = 300;

const MATERIAL_STRIDE: vk::DeviceSize = std::mem::size_of::<MaterialData>() as vk::DeviceSize;

/// All descriptor machinery: the shared pool, the set layouts, the
/// per-frame scene/shadow uniform sets and the long-lived asset and
/// compute sets.
///
/// Asset data grows while frames are in flight, which is why the material
/// buffer swap and the texture array writes are ordered so that in-flight
/// frames only ever observe the counts they were recorded with.
pub struct DescriptorState {
    pub pool: vk::DescriptorPool,

    pub scene_layout: vk::DescriptorSetLayout,
    pub asset_layout: vk::DescriptorSetLayout,
    pub histogram_layout: vk::DescriptorSetLayout,
    pub tonemap_layout: vk::DescriptorSetLayout,

    pub scene_sets: Vec<vk::DescriptorSet>,
    pub shadow_sets: Vec<vk::DescriptorSet>,
    pub asset_set: vk::DescriptorSet,
    pub histogram_set: vk::DescriptorSet,
    pub tonemap_set: vk::DescriptorSet,

    scene_buffers: Vec<AllocatedBuffer>,
    shadow_buffers: Vec<AllocatedBuffer>,

    material_buffer: AllocatedBuffer,
    material_capacity: u32,
    material_count: u32,
    texture_count: u32,
}

impl DescriptorState {
    pub fn new(context: &VkContext, allocator: &mut GpuAllocator, frame_count: u32) -> Self {
        let device = &context.device;

        let scene_layout = create_scene_layout(device);
        let asset_layout = create_asset_layout(device);
        let histogram_layout = create_single_binding_layout(
            device,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::COMPUTE,
        );
        let tonemap_layout = create_single_binding_layout(
            device,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::COMPUTE,
        );

        let pool = create_pool(device, frame_count);

        let mut scene_sets = Vec::new();
        let mut shadow_sets = Vec::new();
        let mut scene_buffers = Vec::new();
        let mut shadow_buffers = Vec::new();
        for index in 0..frame_count {
            scene_sets.push(allocate_set(device, pool, scene_layout));
            shadow_sets.push(allocate_set(device, pool, scene_layout));
            scene_buffers.push(create_scene_buffer(
                device,
                allocator,
                &format!("scene constants {index}"),
            ));
            shadow_buffers.push(create_scene_buffer(
                device,
                allocator,
                &format!("shadow constants {index}"),
            ));
        }
        for (set, buffer) in scene_sets.iter().chain(&shadow_sets).zip(
            scene_buffers.iter().chain(&shadow_buffers),
        ) {
            write_uniform_buffer(device, *set, 0, buffer);
        }

        let asset_set = allocate_variable_set(device, pool, asset_layout, MAX_TEXTURES);
        let histogram_set = allocate_set(device, pool, histogram_layout);
        let tonemap_set = allocate_set(device, pool, tonemap_layout);

        // Seed capacity so the first asset load rarely grows mid-upload.
        let material_capacity = 64u32;
        let material_buffer = create_material_buffer(context, allocator, material_capacity);
        write_material_buffer(device, asset_set, &material_buffer);

        Self {
            pool,
            scene_layout,
            asset_layout,
            histogram_layout,
            tonemap_layout,
            scene_sets,
            shadow_sets,
            asset_set,
            histogram_set,
            tonemap_set,
            scene_buffers,
            shadow_buffers,
            material_buffer,
            material_capacity,
            material_count: 0,
            texture_count: 0,
        }
    }

    pub fn material_count(&self) -> u32 {
        self.material_count
    }

    pub fn texture_count(&self) -> u32 {
        self.texture_count
    }

    /// Uploads the per-frame constants for the given ring slot.
    pub fn write_scene_data(&mut self, frame_index: usize, scene: &SceneData, shadow: &SceneData) {
        // The mapped allocation can be larger than the struct.
        let bytes = bytemuck::bytes_of(scene);
        self.scene_buffers[frame_index].mapped_slice_mut()[..bytes.len()].copy_from_slice(bytes);
        let bytes = bytemuck::bytes_of(shadow);
        self.shadow_buffers[frame_index].mapped_slice_mut()[..bytes.len()].copy_from_slice(bytes);
    }

    /// Appends materials to the shared table, returning the base slot the
    /// batch landed at.
    ///
    /// If the table must grow, the live range is copied GPU-side into a
    /// larger buffer, the new batch is staged in at the tail, and only
    /// then is the old buffer destroyed and the descriptor rewritten. The
    /// visible count is bumped last so a draw recorded mid-upload never
    /// indexes past initialized entries.
    pub fn add_materials(
        &mut self,
        context: &VkContext,
        allocator: &mut GpuAllocator,
        staging: &mut StagingArena,
        materials: &[MaterialData],
    ) -> u32 {
        let base = self.material_count;
        if materials.is_empty() {
            return base;
        }

        let needed = self.material_count + materials.len() as u32;
        if needed > self.material_capacity {
            let new_capacity = needed.max(self.material_capacity * 2);
            info!(
                "Growing material table from {} to {} entries",
                self.material_capacity, new_capacity
            );
            let new_buffer = create_material_buffer(context, allocator, new_capacity);

            let live_bytes = self.material_count as vk::DeviceSize * MATERIAL_STRIDE;
            let old_buffer = std::mem::replace(&mut self.material_buffer, new_buffer);
            immediate_submit(
                &context.device,
                context.command_pool,
                context.graphics_queue,
                |cmd| {
                    if live_bytes > 0 {
                        let region = vk::BufferCopy::default().size(live_bytes);
                        unsafe {
                            context.device.cmd_copy_buffer(
                                cmd,
                                old_buffer.buffer,
                                self.material_buffer.buffer,
                                &[region],
                            );
                        }
                    }
                },
            );
            let mut old_buffer = old_buffer;
            allocator.destroy_buffer(&context.device, &mut old_buffer);
            write_material_buffer(&context.device, self.asset_set, &self.material_buffer);
            self.material_capacity = new_capacity;
        }

        let bytes = bytemuck::cast_slice(materials);
        staging.ensure_capacity(&context.device, allocator, bytes.len() as vk::DeviceSize);
        staging.write(bytes);

        let dst_offset = base as vk::DeviceSize * MATERIAL_STRIDE;
        immediate_submit(
            &context.device,
            context.command_pool,
            context.graphics_queue,
            |cmd| {
                let region = vk::BufferCopy::default()
                    .dst_offset(dst_offset)
                    .size(bytes.len() as vk::DeviceSize);
                unsafe {
                    context.device.cmd_copy_buffer(
                        cmd,
                        staging.buffer.buffer,
                        self.material_buffer.buffer,
                        &[region],
                    );
                }
                let barrier = buffer_barrier(
                    self.material_buffer.buffer,
                    vk::PipelineStageFlags2::COPY,
                    vk::PipelineStageFlags2::ALL_GRAPHICS,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::AccessFlags2::SHADER_READ,
                );
                let barriers = [barrier];
                let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                unsafe { context.device.cmd_pipeline_barrier2(cmd, &dependency) };
            },
        );

        self.material_count = needed;
        base
    }

    /// Appends textures to the bindless array, returning the base slot.
    /// Writes land past every slot in-flight frames can reference, so no
    /// synchronization with rendering is needed.
    pub fn add_textures(
        &mut self,
        device: &ash::Device,
        textures: &[(vk::ImageView, vk::Sampler)],
    ) -> u32 {
        let base = self.texture_count;
        if textures.is_empty() {
            return base;
        }
        if base + textures.len() as u32 > MAX_TEXTURES {
            fatal(&format!(
                "Texture array overflow: {} + {} exceeds the {} slot capacity",
                base,
                textures.len(),
                MAX_TEXTURES
            ));
        }

        let image_infos: Vec<vk::DescriptorImageInfo> = textures
            .iter()
            .map(|&(view, sampler)| {
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.asset_set)
            .dst_binding(2)
            .dst_array_element(base)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos);
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        self.texture_count = base + textures.len() as u32;
        base
    }

    /// Binds the shadow map into the asset set. Written once at startup.
    pub fn write_shadow_map(&self, device: &ash::Device, view: vk::ImageView, sampler: vk::Sampler) {
        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.asset_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    /// Re-points the compute sets at the current HDR resolve target.
    /// Called at startup and after every resize.
    pub fn update_compute_targets(
        &self,
        device: &ash::Device,
        resolve_view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let sampled_info = [vk::DescriptorImageInfo::default()
            .image_view(resolve_view)
            .sampler(sampler)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let storage_info = [vk::DescriptorImageInfo::default()
            .image_view(resolve_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(self.histogram_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&sampled_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.tonemap_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&storage_info),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        for buffer in self
            .scene_buffers
            .iter_mut()
            .chain(self.shadow_buffers.iter_mut())
        {
            allocator.destroy_buffer(device, buffer);
        }
        allocator.destroy_buffer(device, &mut self.material_buffer);
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.scene_layout, None);
            device.destroy_descriptor_set_layout(self.asset_layout, None);
            device.destroy_descriptor_set_layout(self.histogram_layout, None);
            device.destroy_descriptor_set_layout(self.tonemap_layout, None);
        }
    }
}

fn create_pool(device: &ash::Device, frame_count: u32) -> vk::DescriptorPool {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: frame_count * 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: MAX_TEXTURES + 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
        },
    ];
    let pool_ci = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(frame_count * 2 + 3)
        .pool_sizes(&sizes);
    vk_check(
        unsafe { device.create_descriptor_pool(&pool_ci, None) },
        "vkCreateDescriptorPool",
    )
}

fn create_scene_layout(device: &ash::Device) -> vk::DescriptorSetLayout {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)];
    let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    vk_check(
        unsafe { device.create_descriptor_set_layout(&layout_ci, None) },
        "vkCreateDescriptorSetLayout",
    )
}

fn create_asset_layout(device: &ash::Device) -> vk::DescriptorSetLayout {
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        vk::DescriptorSetLayoutBinding::default()
            .binding(1)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS),
        vk::DescriptorSetLayoutBinding::default()
            .binding(2)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_TEXTURES)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
    ];
    let binding_flags = [
        vk::DescriptorBindingFlags::empty(),
        vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
        vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
    ];
    let mut flags_ci =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
    let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut flags_ci);
    vk_check(
        unsafe { device.create_descriptor_set_layout(&layout_ci, None) },
        "vkCreateDescriptorSetLayout",
    )
}

fn create_single_binding_layout(
    device: &ash::Device,
    ty: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayout {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)];
    let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    vk_check(
        unsafe { device.create_descriptor_set_layout(&layout_ci, None) },
        "vkCreateDescriptorSetLayout",
    )
}

fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> vk::DescriptorSet {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    vk_check(
        unsafe { device.allocate_descriptor_sets(&alloc_info) },
        "vkAllocateDescriptorSets",
    )[0]
}

fn allocate_variable_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: u32,
) -> vk::DescriptorSet {
    let counts = [count];
    let mut variable_info =
        vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts)
        .push_next(&mut variable_info);
    vk_check(
        unsafe { device.allocate_descriptor_sets(&alloc_info) },
        "vkAllocateDescriptorSets",
    )[0]
}

fn create_scene_buffer(
    device: &ash::Device,
    allocator: &mut GpuAllocator,
    name: &str,
) -> AllocatedBuffer {
    allocator.create_buffer(
        device,
        std::mem::size_of::<SceneData>() as vk::DeviceSize,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        Residency::HostVisible,
        name,
    )
}

fn create_material_buffer(
    context: &VkContext,
    allocator: &mut GpuAllocator,
    capacity: u32,
) -> AllocatedBuffer {
    allocator.create_buffer(
        &context.device,
        capacity as vk::DeviceSize * MATERIAL_STRIDE,
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::TRANSFER_SRC,
        Residency::DeviceLocal,
        "material table",
    )
}

fn write_uniform_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: &AllocatedBuffer,
) {
    let buffer_info = [vk::DescriptorBufferInfo::default()
        .buffer(buffer.buffer)
        .range(buffer.size)];
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_info);
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

fn write_material_buffer(device: &ash::Device, set: vk::DescriptorSet, buffer: &AllocatedBuffer) {
    let buffer_info = [vk::DescriptorBufferInfo::default()
        .buffer(buffer.buffer)
        .range(buffer.size)];
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(1)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(&buffer_info);
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}
