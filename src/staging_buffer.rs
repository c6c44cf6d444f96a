use std::sync::Arc;

use ash::vk;
use scopeguard::ScopeGuard;

use crate::{context::Context, error::GpuError, stream_buffer::align_up};

/// Direction a staging buffer moves data in, which drives the memory type
/// it is placed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingKind {
    /// CPU writes, GPU reads. Plain host-visible memory.
    Upload,
    /// GPU writes, CPU reads. Prefers cached host memory so the readback
    /// is not a stream of uncached loads.
    Readback,
}

/// A persistently mapped buffer for one-off transfers between the CPU and
/// the GPU, with explicit cache management on both sides.
///
/// Nothing here tracks GPU progress. The caller is responsible for
/// ordering: issue the barrier helpers around the GPU-side access, and
/// wait on the owning pool's fence counter before reading back.
pub struct StagingBuffer {
    ctx: Arc<Context>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    map_ptr: *mut u8,
    size: u64,
    coherent: bool,
}

unsafe impl Send for StagingBuffer {}

impl StagingBuffer {
    pub fn new(
        ctx: Arc<Context>,
        kind: StagingKind,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<StagingBuffer, GpuError> {
        let buffer = unsafe {
            let create_info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            ctx.create_buffer(&create_info, None)
                .map_err(|e| GpuError::init("vkCreateBuffer", e))?
        };
        let buffer = scopeguard::guard(buffer, |buffer| unsafe {
            ctx.destroy_buffer(buffer, None);
        });

        let requirements = unsafe { ctx.get_buffer_memory_requirements(*buffer) };
        let preferred = match kind {
            StagingKind::Upload => vk::MemoryPropertyFlags::HOST_COHERENT,
            StagingKind::Readback => {
                vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED
            }
        };
        let (memory_type, flags) = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                preferred,
            )
            .ok_or(GpuError::OutOfDeviceMemory)?;
        let coherent = flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        let memory = unsafe {
            let allocate_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            ctx.allocate_memory(&allocate_info, None)
                .map_err(|e| GpuError::init("vkAllocateMemory", e))?
        };
        let memory = scopeguard::guard(memory, |memory| unsafe {
            ctx.free_memory(memory, None);
        });

        let map_ptr = unsafe {
            ctx.bind_buffer_memory(*buffer, *memory, 0)
                .map_err(|e| GpuError::init("vkBindBufferMemory", e))?;
            ctx.map_memory(*memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| GpuError::init("vkMapMemory", e))? as *mut u8
        };

        Ok(StagingBuffer {
            buffer: ScopeGuard::into_inner(buffer),
            memory: ScopeGuard::into_inner(memory),
            map_ptr,
            size,
            coherent,
            ctx,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn map_pointer(&self) -> *mut u8 {
        self.map_ptr
    }

    /// Copies `data` into the buffer at `offset`. With `flush` the CPU
    /// cache is flushed afterwards so the GPU sees the write; callers
    /// batching several writes can pass `false` and flush once at the end.
    pub fn write(&mut self, offset: u64, data: &[u8], flush: bool) -> Result<(), GpuError> {
        assert!(offset + data.len() as u64 <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map_ptr.add(offset as usize),
                data.len(),
            );
        }
        if flush {
            self.flush_cpu_cache(offset, data.len() as u64)?;
        }
        Ok(())
    }

    /// Copies from the buffer at `offset` into `out`. With `invalidate`
    /// the CPU cache is invalidated first so stale lines are not read. GPU
    /// writes must already be fenced and barriered.
    pub fn read(&mut self, offset: u64, out: &mut [u8], invalidate: bool) -> Result<(), GpuError> {
        assert!(offset + out.len() as u64 <= self.size);
        if invalidate {
            self.invalidate_cpu_cache(offset, out.len() as u64)?;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map_ptr.add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    pub fn flush_cpu_cache(&self, offset: u64, num_bytes: u64) -> Result<(), GpuError> {
        if self.coherent {
            return Ok(());
        }
        let range = self.atom_range(offset, num_bytes);
        unsafe {
            self.ctx
                .flush_mapped_memory_ranges(&[range])
                .map_err(|e| GpuError::init("vkFlushMappedMemoryRanges", e))
        }
    }

    pub fn invalidate_cpu_cache(&self, offset: u64, num_bytes: u64) -> Result<(), GpuError> {
        if self.coherent {
            return Ok(());
        }
        let range = self.atom_range(offset, num_bytes);
        unsafe {
            self.ctx
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(|e| GpuError::init("vkInvalidateMappedMemoryRanges", e))
        }
    }

    fn atom_range(&self, offset: u64, num_bytes: u64) -> vk::MappedMemoryRange {
        // Flush and invalidate granularity is nonCoherentAtomSize.
        let atom = self.ctx.non_coherent_atom_size();
        let start = offset & !(atom - 1);
        let end = align_up(offset + num_bytes, atom).min(self.size);
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(start)
            .size(end - start)
            .build()
    }

    /// Barrier making prior CPU writes visible to the given GPU stage.
    pub fn prepare_for_gpu_write(
        &self,
        command_buffer: vk::CommandBuffer,
        offset: u64,
        num_bytes: u64,
        dst_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.buffer_barrier(
            command_buffer,
            offset,
            num_bytes,
            vk::AccessFlags::HOST_WRITE,
            dst_access,
            vk::PipelineStageFlags::HOST,
            dst_stage,
        );
    }

    /// Barrier making a GPU write visible to subsequent CPU reads. The
    /// caller still waits on the fence counter before touching the memory.
    pub fn flush_gpu_cache(
        &self,
        command_buffer: vk::CommandBuffer,
        offset: u64,
        num_bytes: u64,
        src_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
    ) {
        self.buffer_barrier(
            command_buffer,
            offset,
            num_bytes,
            src_access,
            vk::AccessFlags::HOST_READ,
            src_stage,
            vk::PipelineStageFlags::HOST,
        );
    }

    /// Barrier invalidating a GPU cache of this buffer before the GPU
    /// overwrites a range the CPU wrote earlier through the mapping.
    pub fn invalidate_gpu_cache(
        &self,
        command_buffer: vk::CommandBuffer,
        offset: u64,
        num_bytes: u64,
        dst_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.buffer_barrier(
            command_buffer,
            offset,
            num_bytes,
            vk::AccessFlags::HOST_WRITE,
            dst_access,
            vk::PipelineStageFlags::HOST,
            dst_stage,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn buffer_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        offset: u64,
        num_bytes: u64,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(offset)
            .size(num_bytes)
            .build();
        unsafe {
            self.ctx.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.unmap_memory(self.memory);
            self.ctx.destroy_buffer(self.buffer, None);
            self.ctx.free_memory(self.memory, None);
        }
    }
}
