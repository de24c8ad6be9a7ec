use ash::vk;

use super::vk_check;

/// Per-frame-in-flight resources. One slot per swapchain image; the ring
/// index advances only after a successful present.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    pub fn new(device: &ash::Device, command_pool: vk::CommandPool) -> Self {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = vk_check(
            unsafe { device.allocate_command_buffers(&alloc_info) },
            "vkAllocateCommandBuffers",
        )[0];

        let semaphore_ci = vk::SemaphoreCreateInfo::default();
        let image_available = vk_check(
            unsafe { device.create_semaphore(&semaphore_ci, None) },
            "vkCreateSemaphore",
        );
        let render_finished = vk_check(
            unsafe { device.create_semaphore(&semaphore_ci, None) },
            "vkCreateSemaphore",
        );

        // Signaled so the first wait on each slot passes immediately.
        let fence_ci = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = vk_check(
            unsafe { device.create_fence(&fence_ci, None) },
            "vkCreateFence",
        );

        Self {
            command_buffer,
            image_available,
            render_finished,
            in_flight,
        }
    }

    pub fn destroy(&mut self, device: &ash::Device, command_pool: vk::CommandPool) {
        unsafe {
            device.free_command_buffers(command_pool, &[self.command_buffer]);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}
