use ash::vk;

use crate::context::Context;

/// A destruction postponed until the GPU has retired the command buffer
/// that last referenced the resource.
///
/// Kept as a tagged variant over the owned handle rather than a boxed
/// closure so the destruction logic stays centralized and inspectable, and
/// so nothing can accidentally capture state by reference.
#[derive(Debug)]
pub enum DeferredAction {
    DestroyBuffer(vk::Buffer),
    DestroyBufferView(vk::BufferView),
    DestroyImage(vk::Image),
    DestroyImageView(vk::ImageView),
    DestroyFramebuffer(vk::Framebuffer),
    DestroyDescriptorPool(vk::DescriptorPool),
    FreeMemory(vk::DeviceMemory),
}

impl DeferredAction {
    pub(crate) fn execute(self, ctx: &Context) {
        unsafe {
            match self {
                DeferredAction::DestroyBuffer(handle) => ctx.destroy_buffer(handle, None),
                DeferredAction::DestroyBufferView(handle) => ctx.destroy_buffer_view(handle, None),
                DeferredAction::DestroyImage(handle) => ctx.destroy_image(handle, None),
                DeferredAction::DestroyImageView(handle) => ctx.destroy_image_view(handle, None),
                DeferredAction::DestroyFramebuffer(handle) => {
                    ctx.destroy_framebuffer(handle, None)
                }
                DeferredAction::DestroyDescriptorPool(handle) => {
                    ctx.destroy_descriptor_pool(handle, None)
                }
                DeferredAction::FreeMemory(handle) => ctx.free_memory(handle, None),
            }
        }
    }
}
