//! Lifecycle management for a Vulkan command stream.
//!
//! The centerpiece is [`CommandBufferPool`], a small ring of command
//! buffer bundles recycled by fence. Every submission is tagged with a
//! monotonically increasing fence counter; anything that must outlive the
//! GPU's use of it (buffers, images, descriptor sets, ring-buffer space)
//! keys its release off those counters instead of waiting on fences
//! directly. [`StreamBuffer`] and [`StagingBuffer`] build on that for
//! per-frame data streaming and one-off transfers.
//!
//! The pool is generic over a [`Backend`] so the ring logic is testable
//! without a device; [`VulkanBackend`] is the real one.

mod backend;
mod commands;
mod context;
mod deferred;
mod double_buffered;
mod error;
mod staging_buffer;
mod stream_buffer;
mod sync;
mod vulkan;
mod worker;

pub use backend::{Backend, PresentOutcome};
pub use commands::{CommandBufferPool, DescriptorPoolGrowth, PoolConfig};
pub use context::Context;
pub use deferred::DeferredAction;
pub use error::GpuError;
pub use staging_buffer::{StagingBuffer, StagingKind};
pub use stream_buffer::StreamBuffer;
pub use sync::{Fence, Semaphore};
pub use vulkan::{classify_present_result, PresentTarget, VulkanBackend};
