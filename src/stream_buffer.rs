use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use scopeguard::ScopeGuard;

use crate::{
    backend::Backend, commands::CommandBufferPool, context::Context, error::GpuError,
};

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Clone, Copy, Debug)]
struct Reservation {
    offset: u64,
    size: u64,
}

/// Ring bookkeeping for a persistently mapped streaming buffer. Pure
/// arithmetic over offsets and fence counters; the memory itself lives in
/// [`StreamBuffer`].
///
/// `cursor` is where the CPU writes next, `gpu_position` is the oldest
/// byte the GPU may still be reading. Each committed region is tracked
/// against the fence counter of the command buffer that consumed it, one
/// entry per counter.
#[derive(Clone)]
pub(crate) struct Ring {
    size: u64,
    cursor: u64,
    gpu_position: u64,
    reserved: Option<Reservation>,
    tracked: VecDeque<(u64, u64)>,
}

impl Ring {
    pub(crate) fn new(size: u64) -> Ring {
        Ring {
            size,
            cursor: 0,
            gpu_position: 0,
            reserved: None,
            tracked: VecDeque::new(),
        }
    }

    /// Whether a reservation of `num_bytes` at `alignment` fits right now,
    /// and at what offset.
    ///
    /// Three cases. With the cursor at or past the GPU position the free
    /// region runs to the end of the buffer, wrapping to offset zero if the
    /// tail is too short; wrapping must leave the byte at `gpu_position - 1`
    /// unused so a full buffer is distinguishable from an empty one. With
    /// the cursor behind the GPU position only the gap between them is
    /// free, with the same strict bound.
    fn fit(&self, num_bytes: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.cursor, alignment);
        if self.cursor >= self.gpu_position {
            if aligned + num_bytes <= self.size {
                Some(aligned)
            } else if num_bytes < self.gpu_position {
                Some(0)
            } else {
                None
            }
        } else if aligned + num_bytes < self.gpu_position {
            Some(aligned)
        } else {
            None
        }
    }

    pub(crate) fn try_reserve(&mut self, num_bytes: u64, alignment: u64) -> Option<u64> {
        debug_assert!(self.reserved.is_none());
        if num_bytes > self.size {
            return None;
        }
        let offset = self.fit(num_bytes, alignment)?;
        self.reserved = Some(Reservation {
            offset,
            size: num_bytes,
        });
        Some(offset)
    }

    pub(crate) fn reserved_offset(&self) -> Option<u64> {
        self.reserved.map(|r| r.offset)
    }

    /// Finalizes the pending reservation, consuming `num_bytes` of it, and
    /// tags the consumed region with `fence_counter`. Regions consumed
    /// under the same counter coalesce into one tracked entry.
    pub(crate) fn commit(&mut self, num_bytes: u64, fence_counter: u64) {
        let reservation = match self.reserved.take() {
            Some(r) => r,
            None => return,
        };
        debug_assert!(num_bytes <= reservation.size);
        self.cursor = reservation.offset + num_bytes;

        match self.tracked.back_mut() {
            Some((counter, position)) if *counter == fence_counter => {
                *position = self.cursor;
            }
            _ => self.tracked.push_back((fence_counter, self.cursor)),
        }
    }

    /// Releases every region whose fence counter is known complete.
    pub(crate) fn retire(&mut self, completed_counter: u64) {
        while let Some(&(counter, position)) = self.tracked.front() {
            if counter > completed_counter {
                break;
            }
            self.gpu_position = position;
            self.tracked.pop_front();
        }
    }

    /// The fence counter to wait for so that a reservation of `num_bytes`
    /// would succeed, found by simulating retirement entry by entry.
    /// `None` means no amount of waiting helps.
    pub(crate) fn clear_space_fence(&self, num_bytes: u64, alignment: u64) -> Option<u64> {
        let mut simulated = self.clone();
        while let Some(&(counter, position)) = simulated.tracked.front() {
            simulated.gpu_position = position;
            simulated.tracked.pop_front();
            if simulated.fit(num_bytes, alignment).is_some() {
                return Some(counter);
            }
        }
        None
    }
}

/// Persistently mapped ring buffer for per-frame data that the CPU
/// produces and the GPU consumes within a few frames: vertex and index
/// streams, dynamic uniforms, texel uploads.
///
/// Space is recycled by fence counter; the caller never waits on the
/// buffer directly, only through the pool.
pub struct StreamBuffer {
    ctx: Arc<Context>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    map_ptr: *mut u8,
    size: u64,
    coherent: bool,
    ring: Ring,
}

// The mapped pointer is only written through &mut self.
unsafe impl Send for StreamBuffer {}

impl StreamBuffer {
    pub fn new(
        ctx: Arc<Context>,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<StreamBuffer, GpuError> {
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
        let (memory_type, flags) = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::HOST_COHERENT,
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

        Ok(StreamBuffer {
            buffer: ScopeGuard::into_inner(buffer),
            memory: ScopeGuard::into_inner(memory),
            map_ptr,
            size,
            coherent,
            ring: Ring::new(size),
            ctx,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reserves `num_bytes` at `alignment`, waiting on the pool for older
    /// work to retire when the ring is full. Returns `false` when even
    /// that cannot help: the request is larger than the buffer, or the
    /// space is held by the command buffer currently being recorded.
    pub fn reserve<B: Backend>(
        &mut self,
        pool: &mut CommandBufferPool<B>,
        num_bytes: u64,
        alignment: u64,
    ) -> Result<bool, GpuError> {
        self.ring.retire(pool.completed_fence_counter());
        if self.ring.try_reserve(num_bytes, alignment).is_some() {
            return Ok(true);
        }

        let counter = match self.ring.clear_space_fence(num_bytes, alignment) {
            Some(counter) => counter,
            None => return Ok(false),
        };
        // Space tied up in the open command buffer cannot be reclaimed by
        // waiting; the caller has to submit first.
        if counter >= pool.current_fence_counter() {
            return Ok(false);
        }

        log::debug!(
            "stream buffer stall: waiting for fence counter {} to free {} bytes",
            counter,
            num_bytes
        );
        pool.wait_for_fence_counter(counter)?;
        self.ring.retire(pool.completed_fence_counter());
        Ok(self.ring.try_reserve(num_bytes, alignment).is_some())
    }

    /// Pointer into the mapped memory for the pending reservation.
    pub fn current_host_pointer(&mut self) -> *mut u8 {
        match self.ring.reserved_offset() {
            Some(offset) => unsafe { self.map_ptr.add(offset as usize) },
            None => std::ptr::null_mut(),
        }
    }

    /// Offset of the pending reservation, for binding and descriptors.
    pub fn current_offset(&self) -> u64 {
        self.ring.reserved_offset().unwrap_or(0)
    }

    /// Finalizes `num_bytes` of the pending reservation against the
    /// command buffer currently being recorded, flushing the written range
    /// when the memory is not coherent.
    pub fn commit<B: Backend>(
        &mut self,
        pool: &CommandBufferPool<B>,
        num_bytes: u64,
    ) -> Result<(), GpuError> {
        let offset = match self.ring.reserved_offset() {
            Some(offset) => offset,
            None => return Ok(()),
        };
        if !self.coherent && num_bytes > 0 {
            self.flush_written_range(offset, num_bytes)?;
        }
        self.ring.commit(num_bytes, pool.current_fence_counter());
        Ok(())
    }

    fn flush_written_range(&self, offset: u64, num_bytes: u64) -> Result<(), GpuError> {
        let atom = self.ctx.non_coherent_atom_size();
        let start = offset & !(atom - 1);
        let end = align_up(offset + num_bytes, atom).min(self.size);
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(start)
            .size(end - start)
            .build();
        unsafe {
            self.ctx
                .flush_mapped_memory_ranges(&[range])
                .map_err(|e| GpuError::init("vkFlushMappedMemoryRanges", e))
        }
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.unmap_memory(self.memory);
            self.ctx.destroy_buffer(self.buffer, None);
            self.ctx.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn reservations_advance_and_wrap() {
        let mut ring = Ring::new(1024);

        assert_eq!(ring.try_reserve(600, 16), Some(0));
        ring.commit(600, 1);

        // 424 bytes remain before the end, and the head is still in
        // flight, so 500 does not fit anywhere yet.
        assert_eq!(ring.try_reserve(500, 16), None);
        assert_eq!(ring.clear_space_fence(500, 16), Some(1));

        ring.retire(1);
        assert_eq!(ring.try_reserve(500, 16), Some(0));
        ring.commit(500, 2);
    }

    #[test]
    fn oversized_requests_are_hopeless() {
        let mut ring = Ring::new(256);
        assert_eq!(ring.try_reserve(512, 4), None);
        assert_eq!(ring.clear_space_fence(512, 4), None);
    }

    #[test]
    fn wrap_never_reaches_the_gpu_position() {
        let mut ring = Ring::new(128);
        ring.try_reserve(96, 4).unwrap();
        ring.commit(96, 1);
        ring.retire(1);
        // gpu_position == cursor == 96; wrapping to zero may use at most
        // 95 bytes so the ring cannot appear empty while full.
        assert_eq!(ring.try_reserve(96, 4), None);
        assert_eq!(ring.try_reserve(95, 4), Some(0));
    }

    #[test]
    fn same_counter_commits_coalesce() {
        let mut ring = Ring::new(1024);
        for _ in 0..4 {
            ring.try_reserve(100, 4).unwrap();
            ring.commit(100, 1);
        }
        assert_eq!(ring.tracked.len(), 1);
        assert_eq!(ring.tracked[0], (1, 400));
    }

    /// Randomized reserve/commit/retire cycles; grants must stay inside
    /// the buffer, respect alignment, and never overlap a live region.
    #[test]
    fn random_traffic_yields_disjoint_live_regions() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..64 {
            let size = 1u64 << rng.gen_range(8..13);
            let mut ring = Ring::new(size);
            let mut counter = 1u64;
            let mut completed = 0u64;
            let mut live: Vec<(u64, u64, u64)> = Vec::new();

            for _ in 0..256 {
                let bytes = rng.gen_range(1..=size / 2);
                let alignment = 1u64 << rng.gen_range(0..6);

                let offset = match ring.try_reserve(bytes, alignment) {
                    Some(offset) => offset,
                    None => match ring.clear_space_fence(bytes, alignment) {
                        Some(wait) => {
                            completed = completed.max(wait);
                            counter = counter.max(completed + 1);
                            ring.retire(completed);
                            live.retain(|&(c, ..)| c > completed);
                            match ring.try_reserve(bytes, alignment) {
                                Some(offset) => offset,
                                None => panic!("reserve failed after clearing space"),
                            }
                        }
                        None => continue,
                    },
                };

                assert_eq!(offset % alignment, 0);
                assert!(offset + bytes <= size);
                for &(_, start, end) in &live {
                    assert!(
                        offset + bytes <= start || offset >= end,
                        "grant [{}, {}) overlaps live [{}, {})",
                        offset,
                        offset + bytes,
                        start,
                        end
                    );
                }

                ring.commit(bytes, counter);
                live.push((counter, offset, offset + bytes));
                if rng.gen_bool(0.4) {
                    counter += 1;
                }
                if rng.gen_bool(0.2) && completed + 1 < counter {
                    completed += 1;
                    ring.retire(completed);
                    live.retain(|&(c, ..)| c > completed);
                }
            }
        }
    }
}
