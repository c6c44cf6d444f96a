use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    backend::{Backend, PresentOutcome},
    context::Context,
    deferred::DeferredAction,
    error::GpuError,
    sync::{Fence, Semaphore},
};

/// The swap-chain image a submission should present right after it lands
/// on the queue.
#[derive(Clone, Copy, Debug)]
pub struct PresentTarget {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

struct SlotObjects {
    ctx: Arc<Context>,
    command_pool: vk::CommandPool,
    init_command_buffer: vk::CommandBuffer,
    draw_command_buffer: vk::CommandBuffer,
    fence: Fence,
    semaphore: Semaphore,
    present_semaphore: Semaphore,
}

impl Drop for SlotObjects {
    fn drop(&mut self) {
        // Frees both command buffers along with the pool.
        unsafe {
            self.ctx.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// The production [`Backend`]: one command pool, two command buffers, a
/// fence and two semaphores per ring slot, all created up front. Any
/// creation failure tears down what exists and aborts initialization.
pub struct VulkanBackend {
    ctx: Arc<Context>,
    slots: Vec<SlotObjects>,
}

impl VulkanBackend {
    pub fn new(ctx: &Arc<Context>, ring_size: usize) -> Result<VulkanBackend, GpuError> {
        let mut slots = Vec::with_capacity(ring_size);
        for _ in 0..ring_size {
            slots.push(SlotObjects::new(ctx)?);
        }
        log::debug!("created {} command buffer bundles", ring_size);

        Ok(VulkanBackend {
            ctx: Arc::clone(ctx),
            slots,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl SlotObjects {
    fn new(ctx: &Arc<Context>) -> Result<SlotObjects, GpuError> {
        let pool_create_info =
            vk::CommandPoolCreateInfo::builder().queue_family_index(ctx.queue_family_index());
        let command_pool = unsafe { ctx.create_command_pool(&pool_create_info, None) }
            .map_err(|res| GpuError::init("vkCreateCommandPool", res))?;
        let command_pool = scopeguard::guard(command_pool, |pool| unsafe {
            ctx.destroy_command_pool(pool, None);
        });

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(2);
        let buffers = unsafe { ctx.allocate_command_buffers(&allocate_info) }
            .map_err(|res| GpuError::init("vkAllocateCommandBuffers", res))?;

        // Created signaled so the first begin on this slot never blocks.
        let fence = Fence::new(ctx, true)?;
        let semaphore = Semaphore::new(ctx)?;
        let present_semaphore = Semaphore::new(ctx)?;

        Ok(SlotObjects {
            ctx: Arc::clone(ctx),
            command_pool: scopeguard::ScopeGuard::into_inner(command_pool),
            init_command_buffer: buffers[0],
            draw_command_buffer: buffers[1],
            fence,
            semaphore,
            present_semaphore,
        })
    }
}

impl Backend for VulkanBackend {
    type CommandBuffer = vk::CommandBuffer;
    type Semaphore = vk::Semaphore;
    type DescriptorPool = vk::DescriptorPool;
    type PresentTarget = PresentTarget;
    type Cleanup = DeferredAction;

    fn ring_size(&self) -> usize {
        self.slots.len()
    }

    fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].draw_command_buffer
    }

    fn init_command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].init_command_buffer
    }

    fn semaphore(&self, slot: usize) -> vk::Semaphore {
        self.slots[slot].semaphore.handle
    }

    fn begin_bundle(&self, slot: usize) -> Result<(), GpuError> {
        let objects = &self.slots[slot];

        // Resetting the pool implicitly recycles both command buffers.
        unsafe {
            self.ctx
                .reset_command_pool(objects.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|res| GpuError::init("vkResetCommandPool", res))?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        for &buffer in &[objects.init_command_buffer, objects.draw_command_buffer] {
            unsafe { self.ctx.begin_command_buffer(buffer, &begin_info) }
                .map_err(|res| GpuError::init("vkBeginCommandBuffer", res))?;
        }
        Ok(())
    }

    fn end_bundle(&self, slot: usize) -> Result<(), GpuError> {
        let objects = &self.slots[slot];
        for &buffer in &[objects.init_command_buffer, objects.draw_command_buffer] {
            unsafe { self.ctx.end_command_buffer(buffer) }
                .map_err(|res| GpuError::init("vkEndCommandBuffer", res))?;
        }
        Ok(())
    }

    fn wait_fence(&self, slot: usize) -> Result<(), GpuError> {
        self.slots[slot].fence.wait()
    }

    fn reset_fence(&self, slot: usize) -> Result<(), GpuError> {
        self.slots[slot].fence.reset()
    }

    fn submit(
        &self,
        slot: usize,
        init_used: bool,
        semaphore_used: bool,
        present: Option<&PresentTarget>,
    ) -> Result<Option<PresentOutcome>, GpuError> {
        let objects = &self.slots[slot];

        let mut command_buffers: SmallVec<[vk::CommandBuffer; 2]> = SmallVec::new();
        if init_used {
            command_buffers.push(objects.init_command_buffer);
        }
        command_buffers.push(objects.draw_command_buffer);

        let mut wait_semaphores: SmallVec<[vk::Semaphore; 1]> = SmallVec::new();
        let mut wait_stages: SmallVec<[vk::PipelineStageFlags; 1]> = SmallVec::new();
        if semaphore_used {
            wait_semaphores.push(objects.semaphore.handle);
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        }

        let mut signal_semaphores: SmallVec<[vk::Semaphore; 1]> = SmallVec::new();
        if present.is_some() {
            signal_semaphores.push(objects.present_semaphore.handle);
        }

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        let queue = self.ctx.queue().lock();
        {
            profiling::scope!("vkQueueSubmit");
            unsafe { self.ctx.queue_submit(*queue, &[submit_info], objects.fence.handle) }
                .map_err(|res| {
                    log::error!("vkQueueSubmit failed: {:?}", res);
                    GpuError::SubmitFailed(res)
                })?;
        }

        let target = match present {
            Some(target) => target,
            None => return Ok(None),
        };

        let loader = match self.ctx.swapchain_loader() {
            Some(loader) => loader,
            None => {
                log::error!("present requested without a swapchain loader");
                return Ok(Some(PresentOutcome::Failed(
                    vk::Result::ERROR_INITIALIZATION_FAILED,
                )));
            }
        };

        let present_wait = [objects.present_semaphore.handle];
        let swapchains = [target.swapchain];
        let image_indices = [target.image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present_wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = {
            profiling::scope!("vkQueuePresentKHR");
            unsafe { loader.queue_present(*queue, &present_info) }
        };
        Ok(Some(classify_present_result(result)))
    }

    fn execute_cleanup(&self, cleanup: DeferredAction) {
        cleanup.execute(&self.ctx);
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> Result<vk::DescriptorPool, GpuError> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets.saturating_mul(4),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                descriptor_count: max_sets,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        unsafe { self.ctx.create_descriptor_pool(&create_info, None) }
            .map_err(|res| GpuError::init("vkCreateDescriptorPool", res))
    }

    fn reset_descriptor_pool(&self, pool: &vk::DescriptorPool) -> Result<(), GpuError> {
        unsafe {
            self.ctx
                .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(|res| GpuError::init("vkResetDescriptorPool", res))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.ctx.destroy_descriptor_pool(pool, None);
        }
    }
}

/// Sorts a `vkQueuePresentKHR` result into "fine", "recreate the swap
/// chain when convenient" and "something is genuinely wrong".
///
/// A suboptimal or out-of-date surface is routine on resize. Some Android
/// drivers additionally report a lost surface across device rotation, so
/// that too is treated as a recreation request there.
pub fn classify_present_result(result: ash::prelude::VkResult<bool>) -> PresentOutcome {
    match result {
        Ok(false) => PresentOutcome::Presented,
        Ok(true) => {
            log::warn!("present returned VK_SUBOPTIMAL_KHR");
            PresentOutcome::NeedsRecreation(vk::Result::SUBOPTIMAL_KHR)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            log::warn!("present returned VK_ERROR_OUT_OF_DATE_KHR");
            PresentOutcome::NeedsRecreation(vk::Result::ERROR_OUT_OF_DATE_KHR)
        }
        #[cfg(target_os = "android")]
        Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
            log::warn!("present returned VK_ERROR_SURFACE_LOST_KHR");
            PresentOutcome::NeedsRecreation(vk::Result::ERROR_SURFACE_LOST_KHR)
        }
        Err(res) => {
            log::error!("vkQueuePresentKHR failed: {:?}", res);
            PresentOutcome::Failed(res)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_present_results_are_not_fatal() {
        assert_eq!(
            classify_present_result(Ok(false)),
            PresentOutcome::Presented
        );
        assert_eq!(
            classify_present_result(Ok(true)),
            PresentOutcome::NeedsRecreation(vk::Result::SUBOPTIMAL_KHR)
        );
        assert_eq!(
            classify_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            PresentOutcome::NeedsRecreation(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
    }

    #[test]
    fn unrecognized_present_results_are_fatal() {
        assert_eq!(
            classify_present_result(Err(vk::Result::ERROR_DEVICE_LOST)),
            PresentOutcome::Failed(vk::Result::ERROR_DEVICE_LOST)
        );
        #[cfg(not(target_os = "android"))]
        assert_eq!(
            classify_present_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            PresentOutcome::Failed(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }
}
