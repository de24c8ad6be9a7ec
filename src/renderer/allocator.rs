use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use super::context::VkContext;
use super::{fatal, vk_check};

/// Where a resource's memory lives. DeviceLocal buffers are filled through
/// the staging arena; HostVisible ones stay persistently mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    DeviceLocal,
    HostVisible,
}

impl Residency {
    fn location(self) -> MemoryLocation {
        match self {
            Residency::DeviceLocal => MemoryLocation::GpuOnly,
            Residency::HostVisible => MemoryLocation::CpuToGpu,
        }
    }
}

pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    /// Non-zero only when the buffer was created with
    /// SHADER_DEVICE_ADDRESS usage.
    pub address: vk::DeviceAddress,
}

impl AllocatedBuffer {
    /// Mapped bytes of a HostVisible buffer.
    pub fn mapped_slice_mut(&mut self) -> &mut [u8] {
        match self.allocation.as_mut().and_then(|a| a.mapped_slice_mut()) {
            Some(slice) => slice,
            None => fatal("Buffer is not host visible"),
        }
    }
}

pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Thin wrapper over the vulkan allocator that owns buffer/image creation
/// and destruction in one place.
pub struct GpuAllocator {
    allocator: Allocator,
}

impl GpuAllocator {
    pub fn new(context: &VkContext) -> Self {
        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => fatal(&format!("Failed to create the GPU allocator: {err}")),
        };
        Self { allocator }
    }

    pub fn create_buffer(
        &mut self,
        device: &ash::Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
        name: &str,
    ) -> AllocatedBuffer {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = vk_check(
            unsafe { device.create_buffer(&buffer_ci, None) },
            "vkCreateBuffer",
        );

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: residency.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => fatal(&format!("Failed to allocate buffer memory ({name}): {err}")),
        };
        vk_check(
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) },
            "vkBindBufferMemory",
        );

        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { device.get_buffer_device_address(&info) }
        } else {
            0
        };

        AllocatedBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            address,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &mut self,
        device: &ash::Device,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        samples: vk::SampleCountFlags,
        mip_levels: u32,
        name: &str,
    ) -> AllocatedImage {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = vk_check(
            unsafe { device.create_image(&image_ci, None) },
            "vkCreateImage",
        );

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => fatal(&format!("Failed to allocate image memory ({name}): {err}")),
        };
        vk_check(
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) },
            "vkBindImageMemory",
        );

        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(super::subresource_range(aspect));
        let view = vk_check(
            unsafe { device.create_image_view(&view_ci, None) },
            "vkCreateImageView",
        );

        AllocatedImage {
            image,
            view,
            allocation: Some(allocation),
            format,
            extent,
        }
    }

    pub fn destroy_buffer(&mut self, device: &ash::Device, buffer: &mut AllocatedBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            let _ = self.allocator.free(allocation);
        }
        unsafe { device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
    }

    pub fn destroy_image(&mut self, device: &ash::Device, image: &mut AllocatedImage) {
        if let Some(allocation) = image.allocation.take() {
            let _ = self.allocator.free(allocation);
        }
        unsafe {
            device.destroy_image_view(image.view, None);
            device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();
        image.view = vk::ImageView::null();
    }
}

/// Host-visible scratch buffer reused across uploads. Grows to the largest
/// upload seen and never shrinks.
pub struct StagingArena {
    pub buffer: AllocatedBuffer,
}

impl StagingArena {
    const INITIAL_SIZE: vk::DeviceSize = 16 * 1024 * 1024;

    pub fn new(device: &ash::Device, allocator: &mut GpuAllocator) -> Self {
        let buffer = allocator.create_buffer(
            device,
            Self::INITIAL_SIZE,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Residency::HostVisible,
            "staging arena",
        );
        Self { buffer }
    }

    /// Returns the mapped staging bytes, growing the arena first if the
    /// request does not fit. Growth destroys the old buffer immediately;
    /// callers must not have an upload from it still in flight.
    pub fn ensure_capacity(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        size: vk::DeviceSize,
    ) {
        if size <= self.buffer.size {
            return;
        }
        allocator.destroy_buffer(device, &mut self.buffer);
        self.buffer = allocator.create_buffer(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Residency::HostVisible,
            "staging arena",
        );
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.mapped_slice_mut()[..data.len()].copy_from_slice(data);
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        allocator.destroy_buffer(device, &mut self.buffer);
    }
}

/// Records and submits a one-shot command buffer, waiting for completion.
/// Used for uploads and descriptor growth copies outside the frame loop.
pub fn immediate_submit<F: FnOnce(vk::CommandBuffer)>(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    record: F,
) {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = vk_check(
        unsafe { device.allocate_command_buffers(&alloc_info) },
        "vkAllocateCommandBuffers",
    )[0];

    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    vk_check(
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) },
        "vkBeginCommandBuffer",
    );

    record(command_buffer);

    vk_check(
        unsafe { device.end_command_buffer(command_buffer) },
        "vkEndCommandBuffer",
    );

    let fence_ci = vk::FenceCreateInfo::default();
    let fence = vk_check(
        unsafe { device.create_fence(&fence_ci, None) },
        "vkCreateFence",
    );

    let command_buffer_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer)];
    let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffer_infos);
    vk_check(
        unsafe { device.queue_submit2(queue, &[submit], fence) },
        "vkQueueSubmit2",
    );
    vk_check(
        unsafe { device.wait_for_fences(&[fence], true, u64::MAX) },
        "vkWaitForFences",
    );

    unsafe {
        device.destroy_fence(fence, None);
        device.free_command_buffers(command_pool, &[command_buffer]);
    }
}
