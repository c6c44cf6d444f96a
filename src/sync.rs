use std::sync::Arc;

use ash::vk;

use crate::{context::Context, error::GpuError};

pub struct Fence {
    pub(crate) handle: vk::Fence,
    ctx: Arc<Context>,
}

pub struct Semaphore {
    pub(crate) handle: vk::Semaphore,
    ctx: Arc<Context>,
}

impl Fence {
    pub fn new(ctx: &Arc<Context>, signaled: bool) -> Result<Fence, GpuError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { ctx.create_fence(&create_info, None) }
            .map_err(|res| GpuError::init("vkCreateFence", res))?;

        Ok(Fence {
            handle: fence,
            ctx: Arc::clone(ctx),
        })
    }

    pub fn wait(&self) -> Result<(), GpuError> {
        profiling::scope!("vkWaitForFences");
        unsafe { self.ctx.wait_for_fences(&[self.handle], true, u64::MAX) }
            .map_err(|res| GpuError::init("vkWaitForFences", res))
    }

    pub fn reset(&self) -> Result<(), GpuError> {
        unsafe { self.ctx.reset_fences(&[self.handle]) }
            .map_err(|res| GpuError::init("vkResetFences", res))
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Semaphore {
    pub fn new(ctx: &Arc<Context>) -> Result<Semaphore, GpuError> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { ctx.create_semaphore(&create_info, None) }
            .map_err(|res| GpuError::init("vkCreateSemaphore", res))?;

        Ok(Semaphore {
            handle: semaphore,
            ctx: Arc::clone(ctx),
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.ctx.destroy_fence(self.handle, None);
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.ctx.destroy_semaphore(self.handle, None);
        }
    }
}
