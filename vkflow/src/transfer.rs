//! A ring buffer of host-visible memory for staging uploads.
//!
//! Allocations are carved out of one persistent buffer in submission order. Each allocation is
//! tagged with a value of the pool's own timeline semaphore, which the submission reading the
//! allocation must signal. Memory is reclaimed once the semaphore passes an allocation's value.

use crate::{
    backend::BackendError,
    device::{Device, DeviceError},
    resource::{BufferCreateInfo, BufferId, MemoryLocation},
    timeline::{TimelineSemaphore, TimelineSemaphoreCreateInfo},
};
use ash::vk;
use std::{collections::VecDeque, error::Error, fmt, ptr::NonNull, sync::Arc};

/// A pool of host-visible memory handing out short-lived staging allocations.
pub struct TransferMemoryPool {
    device: Arc<Device>,
    buffer: BufferId,
    device_address: vk::DeviceAddress,
    host_address: NonNull<u8>,
    ring: RingAllocator,
    timeline_semaphore: TimelineSemaphore,
    name: String,
}

// SAFETY: The host address points into memory owned by the pool's buffer. Writes go through
// `TransferAllocation`, whose ranges are disjoint.
unsafe impl Send for TransferMemoryPool {}

// SAFETY: Same as above. No method taking `&self` touches the memory.
unsafe impl Sync for TransferMemoryPool {}

impl TransferMemoryPool {
    /// Creates a new pool, allocating its buffer and timeline semaphore.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.capacity` is zero.
    pub fn new(
        device: &Arc<Device>,
        create_info: &TransferMemoryPoolCreateInfo,
    ) -> Result<Self, DeviceError> {
        let TransferMemoryPoolCreateInfo {
            capacity,
            ref name,
            _ne: _,
        } = *create_info;

        assert_ne!(capacity, 0, "a transfer memory pool can't be empty");

        let buffer = device.create_buffer(&BufferCreateInfo {
            size: capacity,
            usage: vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            memory_location: MemoryLocation::HostSequentialWrite,
            name: format!("{name} buffer"),
            ..Default::default()
        })?;

        let mapping = device.buffer_device_address(buffer).and_then(|device_address| {
            Ok((device_address, device.buffer_host_address(buffer)?))
        });

        let (device_address, host_address) = match mapping {
            Ok((device_address, Some(host_address))) => (device_address, host_address),
            Ok((_, None)) => {
                release_buffer(device, buffer, name);
                return Err(DeviceError::Backend(BackendError::Unsupported));
            }
            Err(err) => return Err(err.into()),
        };

        let timeline_semaphore =
            match device.create_timeline_semaphore(&TimelineSemaphoreCreateInfo {
                initial_value: 0,
                name: format!("{name} timeline"),
                ..Default::default()
            }) {
                Ok(semaphore) => semaphore,
                Err(err) => {
                    release_buffer(device, buffer, name);
                    return Err(err);
                }
            };

        log::debug!("created transfer memory pool {name:?} of {capacity} bytes");

        Ok(TransferMemoryPool {
            device: device.clone(),
            buffer,
            device_address,
            host_address,
            ring: RingAllocator::new(capacity),
            timeline_semaphore,
            name: name.clone(),
        })
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The returned allocation must be read by a submission that signals the pool's
    /// [`timeline_semaphore`] with [`timeline_value`], otherwise its memory is never reclaimed.
    ///
    /// Returns [`AllocationError::Exhausted`] if the request doesn't fit even after reclaiming
    /// the memory of completed submissions. Nothing is changed in that case.
    ///
    /// # Panics
    ///
    /// - Panics if `alignment` is not a power of two.
    ///
    /// [`timeline_semaphore`]: Self::timeline_semaphore
    /// [`timeline_value`]: Self::timeline_value
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<TransferAllocation, AllocationError> {
        assert!(
            alignment.is_power_of_two(),
            "the alignment must be a power of two",
        );

        if size == 0 || size > self.ring.capacity {
            return Err(AllocationError::Exhausted);
        }

        let offset = match self.ring.allocate(size, alignment) {
            Some(offset) => offset,
            None => {
                let completed = self.timeline_semaphore.value()?;
                self.ring.reclaim(completed);

                self.ring
                    .allocate(size, alignment)
                    .ok_or(AllocationError::Exhausted)?
            }
        };

        // SAFETY: The ring only hands out ranges within the buffer.
        let host_address = unsafe { self.host_address.add(offset as usize) };

        Ok(TransferAllocation {
            device_address: self.device_address + offset,
            host_address,
            buffer_offset: offset,
            size,
            timeline_index: self.ring.current_timeline_value,
        })
    }

    /// Returns the value the next submission using the pool's allocations must signal.
    #[inline]
    pub fn timeline_value(&self) -> u64 {
        self.ring.current_timeline_value
    }

    #[inline]
    pub fn timeline_semaphore(&self) -> &TimelineSemaphore {
        &self.timeline_semaphore
    }

    /// Returns the pool's buffer. Allocations are at [`TransferAllocation::buffer_offset`].
    #[inline]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    #[inline]
    pub fn capacity(&self) -> vk::DeviceSize {
        self.ring.capacity
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TransferMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferMemoryPool")
            .field("buffer", &self.buffer)
            .field("ring", &self.ring)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for TransferMemoryPool {
    fn drop(&mut self) {
        release_buffer(&self.device, self.buffer, &self.name);
    }
}

fn release_buffer(device: &Device, buffer: BufferId, name: &str) {
    if let Err(err) = device.destroy_buffer(buffer) {
        log::error!("failed to destroy the buffer of transfer memory pool {name:?}: {err}");
    }
}

/// Parameters to create a new [`TransferMemoryPool`].
#[derive(Clone, Debug)]
pub struct TransferMemoryPoolCreateInfo {
    /// The size of the pool's buffer in bytes.
    ///
    /// The default value is 8 MiB.
    pub capacity: vk::DeviceSize,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for TransferMemoryPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMemoryPoolCreateInfo {
    /// Returns a default `TransferMemoryPoolCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        TransferMemoryPoolCreateInfo {
            capacity: 8 * 1024 * 1024,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// A range of a [`TransferMemoryPool`]'s buffer.
#[derive(Debug)]
pub struct TransferAllocation {
    /// The address of the range as seen by shaders.
    pub device_address: vk::DeviceAddress,

    /// Where the range is mapped on the host.
    pub host_address: NonNull<u8>,

    /// The offset of the range within [`TransferMemoryPool::buffer`].
    pub buffer_offset: vk::DeviceSize,

    pub size: vk::DeviceSize,

    /// The value of the pool's timeline semaphore after which the range is reclaimed.
    pub timeline_index: u64,
}

// SAFETY: The host address is only a location in mapped memory.
unsafe impl Send for TransferAllocation {}

// SAFETY: Same as above. Writing requires `&mut self`.
unsafe impl Sync for TransferAllocation {}

impl TransferAllocation {
    /// Copies `value` to the start of the range.
    ///
    /// # Safety
    ///
    /// - The submission signaling [`timeline_index`] must not have completed yet.
    ///
    /// # Panics
    ///
    /// - Panics if `T` is larger than the range.
    ///
    /// [`timeline_index`]: Self::timeline_index
    #[inline]
    pub unsafe fn write<T: bytemuck::Pod>(&mut self, value: &T) {
        // SAFETY: Ensured by the caller.
        unsafe { self.write_slice(std::slice::from_ref(value)) };
    }

    /// Copies `data` to the start of the range.
    ///
    /// # Safety
    ///
    /// - The submission signaling [`timeline_index`] must not have completed yet.
    ///
    /// # Panics
    ///
    /// - Panics if `data` is larger than the range.
    ///
    /// [`timeline_index`]: Self::timeline_index
    pub unsafe fn write_slice<T: bytemuck::Pod>(&mut self, data: &[T]) {
        let bytes = bytemuck::cast_slice::<T, u8>(data);

        assert!(
            bytes.len() as vk::DeviceSize <= self.size,
            "writing {} bytes into an allocation of {} bytes",
            bytes.len(),
            self.size,
        );

        // SAFETY:
        // * The range is within mapped memory and at least `bytes.len()` bytes long.
        // * The ring doesn't hand the range out again before the submission completes, which
        //   the caller ensures it hasn't.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.host_address.as_ptr(), bytes.len())
        };
    }
}

/// Error that can happen when allocating from a [`TransferMemoryPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// Not enough memory is free, even after reclaiming completed allocations.
    Exhausted,

    /// Reading the pool's timeline semaphore failed.
    Backend(BackendError),
}

impl From<BackendError> for AllocationError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("the transfer memory pool is exhausted"),
            Self::Backend(_) => f.write_str("a backend error occurred"),
        }
    }
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            Self::Exhausted => None,
        }
    }
}

/// The bookkeeping of the ring, kept apart from the memory so that it can be reasoned about on
/// its own.
#[derive(Debug)]
struct RingAllocator {
    capacity: u64,
    claimed_start: u64,
    claimed_size: u64,
    current_timeline_value: u64,
    /// Sizes consumed by each live allocation, in allocation order. The consumed sizes include
    /// alignment padding and abandoned tail space, so they add up to `claimed_size`.
    live: VecDeque<LiveAllocation>,
}

#[derive(Clone, Copy, Debug)]
struct LiveAllocation {
    timeline_index: u64,
    consumed_size: u64,
}

impl RingAllocator {
    fn new(capacity: u64) -> Self {
        RingAllocator {
            capacity,
            claimed_start: 0,
            claimed_size: 0,
            current_timeline_value: 0,
            live: VecDeque::new(),
        }
    }

    /// Claims `size` bytes and returns their offset, or `None` if neither the tail nor the start
    /// of the ring has room.
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let claimed_end = self.claimed_start + self.claimed_size;
        let wrapped = claimed_end > self.capacity;

        let (tail, limit) = if wrapped {
            (claimed_end - self.capacity, self.claimed_start)
        } else {
            (claimed_end, self.capacity)
        };

        let aligned = tail.next_multiple_of(alignment);

        let (offset, consumed_size) = if aligned + size <= limit {
            (aligned, aligned - tail + size)
        } else if !wrapped && size <= self.claimed_start {
            // Abandon the rest of the tail and start over at the beginning.
            (0, self.capacity - tail + size)
        } else {
            return None;
        };

        self.claimed_size += consumed_size;
        self.current_timeline_value += 1;
        self.live.push_back(LiveAllocation {
            timeline_index: self.current_timeline_value,
            consumed_size,
        });

        debug_assert!(self.claimed_size <= self.capacity);

        Some(offset)
    }

    /// Releases every allocation whose timeline index is at most `completed`.
    fn reclaim(&mut self, completed: u64) {
        while let Some(allocation) = self.live.front() {
            if allocation.timeline_index > completed {
                break;
            }

            self.claimed_start = (self.claimed_start + allocation.consumed_size) % self.capacity;
            self.claimed_size -= allocation.consumed_size;
            self.live.pop_front();
        }

        if self.claimed_size == 0 {
            self.claimed_start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::HeadlessBackend,
        command_buffer::{BufferCopy, CopyBufferInfo},
        device::{DeviceCreateInfo, SubmitInfo},
    };
    use std::ops::Range;

    fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[test]
    fn tail_then_zero_offset() {
        let mut ring = RingAllocator::new(256);

        assert_eq!(ring.allocate(100, 1), Some(0));
        assert_eq!(ring.allocate(100, 64), Some(128));
        assert_eq!(ring.claimed_size, 228);

        // Neither the tail nor the start has room until the first allocation is reclaimed.
        assert_eq!(ring.allocate(64, 1), None);
        ring.reclaim(1);
        assert_eq!(ring.claimed_start, 100);

        assert_eq!(ring.allocate(64, 16), Some(0));
        // The abandoned 28 bytes of tail are consumed along with the allocation.
        assert_eq!(ring.claimed_size, 128 + 28 + 64);
        assert_eq!(ring.live.back().unwrap().consumed_size, 92);

        // The claimed region now wraps, so the free space is between its end and its start.
        assert_eq!(ring.allocate(36, 4), Some(64));
        assert_eq!(ring.allocate(1, 1), None);
    }

    #[test]
    fn reclaim_resets_when_empty() {
        let mut ring = RingAllocator::new(64);

        ring.allocate(48, 1).unwrap();
        ring.allocate(8, 1).unwrap();
        ring.reclaim(1);
        assert_eq!(ring.claimed_start, 48);

        ring.reclaim(ring.current_timeline_value);
        assert_eq!(ring.claimed_start, 0);
        assert_eq!(ring.claimed_size, 0);
        assert_eq!(ring.allocate(64, 1), Some(0));
    }

    #[test]
    fn live_allocations_are_disjoint() {
        let capacity = 1000;
        let mut ring = RingAllocator::new(capacity);
        let mut live = VecDeque::<(u64, Range<u64>)>::new();
        let mut state = 0x2545_f491_u32;

        for _ in 0..10_000 {
            // xorshift, so that the sequence is the same on every run.
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;

            let size = u64::from(state % 200) + 1;
            let alignment = 1u64 << (state >> 29);

            match ring.allocate(size, alignment) {
                Some(offset) => {
                    let range = offset..offset + size;
                    assert_eq!(offset % alignment, 0);
                    assert!(range.end <= capacity);
                    assert!(live.iter().all(|(_, other)| !overlaps(&range, other)));
                    live.push_back((ring.current_timeline_value, range));
                }
                None => {
                    let completed = live.front().map_or(0, |&(index, _)| index) + 2;
                    ring.reclaim(completed);
                    live.retain(|&(index, _)| index > completed);
                }
            }

            assert!(ring.claimed_size <= capacity);
        }
    }

    #[test]
    fn rejects_oversized_requests() {
        let device =
            Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap();
        let mut pool = TransferMemoryPool::new(
            &device,
            &TransferMemoryPoolCreateInfo {
                capacity: 256,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(pool.allocate(257, 4).unwrap_err(), AllocationError::Exhausted);
        assert_eq!(pool.allocate(0, 4).unwrap_err(), AllocationError::Exhausted);
        assert_eq!(pool.timeline_value(), 0);

        let allocation = pool.allocate(256, 4).unwrap();
        assert_eq!(allocation.timeline_index, 1);
        assert_eq!(
            allocation.device_address,
            device.buffer_device_address(pool.buffer()).unwrap(),
        );

        // Nothing was submitted, so nothing can be reclaimed.
        assert_eq!(pool.allocate(4, 4).unwrap_err(), AllocationError::Exhausted);
    }

    #[test]
    #[should_panic = "the alignment must be a power of two"]
    fn alignment_must_be_power_of_two() {
        let device =
            Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap();
        let mut pool = TransferMemoryPool::new(&device, &Default::default()).unwrap();

        let _ = pool.allocate(16, 3);
    }

    #[test]
    fn staging_through_a_small_ring() {
        const ITERATIONS: u64 = 1000;
        const SIZE: u64 = 68;

        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let mut pool = TransferMemoryPool::new(
            &device,
            &TransferMemoryPoolCreateInfo {
                capacity: 256,
                name: "staging".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let result = device
            .create_buffer(&BufferCreateInfo {
                size: ITERATIONS * SIZE,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                memory_location: MemoryLocation::HostRandomAccess,
                ..Default::default()
            })
            .unwrap();

        for iteration in 0..ITERATIONS {
            let mut allocation = pool.allocate(SIZE, 4).unwrap();
            let values = [iteration as u32; (SIZE / 4) as usize];
            unsafe { allocation.write_slice(&values) };

            let mut recorder = device.create_command_recorder("upload").unwrap();
            unsafe {
                recorder
                    .copy_buffer(&CopyBufferInfo {
                        src_buffer: pool.buffer(),
                        dst_buffer: result,
                        regions: &[BufferCopy {
                            src_offset: allocation.buffer_offset,
                            dst_offset: iteration * SIZE,
                            size: SIZE,
                            ..Default::default()
                        }],
                        ..Default::default()
                    })
                    .unwrap();
            }

            device
                .submit(
                    [recorder.end().unwrap()],
                    &SubmitInfo {
                        signal_semaphores: &[(pool.timeline_semaphore(), pool.timeline_value())],
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        device.wait_idle().unwrap();

        let address = device.buffer_host_address(result).unwrap().unwrap();
        let contents = unsafe {
            std::slice::from_raw_parts(address.as_ptr(), (ITERATIONS * SIZE) as usize)
        };

        for (iteration, chunk) in contents.chunks_exact(SIZE as usize).enumerate() {
            let expected = [iteration as u32; (SIZE / 4) as usize];
            assert_eq!(chunk, bytemuck::cast_slice::<u32, u8>(&expected));
        }

        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn dropped_pool_outlives_pending_uploads() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let mut pool = TransferMemoryPool::new(
            &device,
            &TransferMemoryPoolCreateInfo {
                capacity: 256,
                ..Default::default()
            },
        )
        .unwrap();
        let result = device
            .create_buffer(&BufferCreateInfo {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                memory_location: MemoryLocation::HostRandomAccess,
                ..Default::default()
            })
            .unwrap();

        let mut allocation = pool.allocate(16, 4).unwrap();
        unsafe { allocation.write(&[7u32; 4]) };

        let mut recorder = device.create_command_recorder("upload").unwrap();
        unsafe {
            recorder
                .copy_buffer(&CopyBufferInfo {
                    src_buffer: pool.buffer(),
                    dst_buffer: result,
                    regions: &[BufferCopy {
                        src_offset: allocation.buffer_offset,
                        size: 16,
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .unwrap();
        }

        // The recorded copy still reads from the pool's buffer.
        drop(pool);
        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 2);

        device
            .submit([recorder.end().unwrap()], &SubmitInfo::new())
            .unwrap();
        device.wait_idle().unwrap();

        assert!(backend.validation_errors().is_empty());
        assert_eq!(device.zombie_count(), 0);

        let address = device.buffer_host_address(result).unwrap().unwrap();
        let contents = unsafe { std::slice::from_raw_parts(address.as_ptr(), 16) };
        assert_eq!(contents, bytemuck::cast_slice::<u32, u8>(&[7; 4]));
    }

    #[test]
    fn failed_buffer_release_is_tolerated() {
        let device =
            Device::new(Arc::new(HeadlessBackend::new()), &DeviceCreateInfo::new()).unwrap();
        let pool = TransferMemoryPool::new(&device, &Default::default()).unwrap();
        let buffer = pool.buffer();

        // Releasing an already destroyed buffer only logs the error.
        device.destroy_buffer(buffer).unwrap();
        drop(pool);

        assert!(!device.is_buffer_valid(buffer));
        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 0);
    }
}
