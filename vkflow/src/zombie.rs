//! Deferred destruction of objects that pending GPU work may still use.
//!
//! Every destroyed object becomes a zombie pinned at a value of the device timeline. Zombies are
//! pushed in timeline order, so collecting them only ever drains a prefix of each queue.

use crate::{
    backend::{Backend, NativeBuffer},
    resource::{Buffer, Image, ImageView, MemoryBlock, Sampler},
    slot_table::SlotTable,
};
use ash::vk;
use std::collections::VecDeque;

pub(crate) struct ZombieQueue<T> {
    entries: VecDeque<Pinned<T>>,
}

struct Pinned<T> {
    timeline_value: u64,
    /// The sequence number of the batch the zombie was pushed with.
    batch: u64,
    zombie: T,
}

impl<T> ZombieQueue<T> {
    pub(crate) const fn new() -> Self {
        ZombieQueue {
            entries: VecDeque::new(),
        }
    }

    /// Pushes a zombie that can be destroyed once the GPU timeline reaches `timeline_value`.
    pub(crate) fn push(&mut self, timeline_value: u64, batch: u64, zombie: T) {
        let mut timeline_value = timeline_value;

        if let Some(last) = self.entries.back() {
            let last_value = last.timeline_value;

            debug_assert!(
                last_value <= timeline_value,
                "zombie pinned at {timeline_value} pushed after one pinned at {last_value}",
            );

            if last_value > timeline_value {
                log::warn!(
                    "zombie pinned at {timeline_value} pushed after one pinned at {last_value}; \
                    pinning it at {last_value} instead",
                );
                timeline_value = last_value;
            }
        }

        self.entries.push_back(Pinned {
            timeline_value,
            batch,
            zombie,
        });
    }

    /// Removes and returns every zombie pinned at or before `gpu_timeline_value` that was pushed
    /// with a batch older than `held_batch`.
    pub(crate) fn drain_ready(&mut self, gpu_timeline_value: u64, held_batch: u64) -> Vec<T> {
        let ready_count = self
            .entries
            .iter()
            .position(|entry| {
                entry.timeline_value > gpu_timeline_value || entry.batch >= held_batch
            })
            .unwrap_or(self.entries.len());

        self.entries
            .drain(..ready_count)
            .map(|entry| entry.zombie)
            .collect()
    }

    /// Pins every zombie pushed with batch `first_batch` or later at `timeline_value` or later.
    pub(crate) fn raise_pins(&mut self, first_batch: u64, timeline_value: u64) {
        for entry in self.entries.iter_mut().rev() {
            if entry.batch < first_batch {
                break;
            }

            entry.timeline_value = entry.timeline_value.max(timeline_value);
        }
    }

    /// Removes and returns every zombie regardless of its pin.
    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|entry| entry.zombie).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct BufferZombie {
    pub(crate) index: u32,
    pub(crate) native: NativeBuffer,
    pub(crate) memory_block: Option<MemoryBlock>,
}

pub(crate) struct ImageZombie {
    pub(crate) index: u32,
    pub(crate) handle: vk::Image,
    pub(crate) memory_block: Option<MemoryBlock>,
    /// Swapchain images are destroyed along with their swapchain.
    pub(crate) owned_by_swapchain: bool,
}

pub(crate) struct ImageViewZombie {
    pub(crate) index: u32,
    pub(crate) handle: vk::ImageView,
}

pub(crate) struct SamplerZombie {
    pub(crate) index: u32,
    pub(crate) handle: vk::Sampler,
}

/// One zombie queue per kind of object.
pub(crate) struct Zombies {
    pub(crate) buffers: ZombieQueue<BufferZombie>,
    pub(crate) images: ZombieQueue<ImageZombie>,
    pub(crate) image_views: ZombieQueue<ImageViewZombie>,
    pub(crate) samplers: ZombieQueue<SamplerZombie>,
    pub(crate) semaphores: ZombieQueue<vk::Semaphore>,
    pub(crate) events: ZombieQueue<vk::Event>,
    pub(crate) command_buffers: ZombieQueue<vk::CommandBuffer>,
    pub(crate) swapchains: ZombieQueue<vk::SwapchainKHR>,
    /// The sequence number of the next batch pushed.
    next_batch: u64,
    /// For every command buffer still being recorded or not yet submitted, the sequence number
    /// of the first batch pushed after it began. Zombies from that batch on may be used by it.
    recordings: Vec<u64>,
}

impl Zombies {
    pub(crate) const fn new() -> Self {
        Zombies {
            buffers: ZombieQueue::new(),
            images: ZombieQueue::new(),
            image_views: ZombieQueue::new(),
            samplers: ZombieQueue::new(),
            semaphores: ZombieQueue::new(),
            events: ZombieQueue::new(),
            command_buffers: ZombieQueue::new(),
            swapchains: ZombieQueue::new(),
            next_batch: 0,
            recordings: Vec::new(),
        }
    }

    /// Registers a command buffer that began recording, and returns the token to pass to
    /// [`end_recording`].
    ///
    /// [`end_recording`]: Self::end_recording
    pub(crate) fn begin_recording(&mut self) -> u64 {
        let first_batch = self.next_batch;
        self.recordings.push(first_batch);

        first_batch
    }

    /// Unregisters a command buffer that was submitted or discarded.
    ///
    /// If `timeline_value` is `Some`, the command buffer was submitted with that value, and every
    /// zombie it may use stays alive until the GPU timeline reaches it.
    pub(crate) fn end_recording(&mut self, first_batch: u64, timeline_value: Option<u64>) {
        let index = self.recordings.iter().position(|&b| b == first_batch);
        debug_assert!(index.is_some(), "ending a recording that isn't registered");

        match index {
            Some(index) => {
                self.recordings.swap_remove(index);
            }
            None => log::warn!("ending a recording that isn't registered"),
        }

        if let Some(timeline_value) = timeline_value {
            self.buffers.raise_pins(first_batch, timeline_value);
            self.images.raise_pins(first_batch, timeline_value);
            self.image_views.raise_pins(first_batch, timeline_value);
            self.samplers.raise_pins(first_batch, timeline_value);
            self.semaphores.raise_pins(first_batch, timeline_value);
            self.events.raise_pins(first_batch, timeline_value);
            self.command_buffers.raise_pins(first_batch, timeline_value);
            self.swapchains.raise_pins(first_batch, timeline_value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.samplers.len()
            + self.semaphores.len()
            + self.events.len()
            + self.command_buffers.len()
            + self.swapchains.len()
    }

    /// Takes every zombie that the GPU is done with and that no unsubmitted command buffer may
    /// use.
    pub(crate) fn drain_ready(&mut self, gpu_timeline_value: u64) -> ZombieBatch {
        let value = gpu_timeline_value;
        let held = self.recordings.iter().copied().min().unwrap_or(u64::MAX);

        ZombieBatch {
            buffers: self.buffers.drain_ready(value, held),
            images: self.images.drain_ready(value, held),
            image_views: self.image_views.drain_ready(value, held),
            samplers: self.samplers.drain_ready(value, held),
            semaphores: self.semaphores.drain_ready(value, held),
            events: self.events.drain_ready(value, held),
            command_buffers: self.command_buffers.drain_ready(value, held),
            swapchains: self.swapchains.drain_ready(value, held),
        }
    }

    /// Pushes every object of `batch`, pinned at `timeline_value`.
    pub(crate) fn push_batch(&mut self, timeline_value: u64, batch: ZombieBatch) {
        let sequence = self.next_batch;
        self.next_batch += 1;

        for zombie in batch.buffers {
            self.buffers.push(timeline_value, sequence, zombie);
        }

        for zombie in batch.images {
            self.images.push(timeline_value, sequence, zombie);
        }

        for zombie in batch.image_views {
            self.image_views.push(timeline_value, sequence, zombie);
        }

        for zombie in batch.samplers {
            self.samplers.push(timeline_value, sequence, zombie);
        }

        for semaphore in batch.semaphores {
            self.semaphores.push(timeline_value, sequence, semaphore);
        }

        for event in batch.events {
            self.events.push(timeline_value, sequence, event);
        }

        for command_buffer in batch.command_buffers {
            self.command_buffers.push(timeline_value, sequence, command_buffer);
        }

        for swapchain in batch.swapchains {
            self.swapchains.push(timeline_value, sequence, swapchain);
        }
    }

    pub(crate) fn drain_all(&mut self) -> ZombieBatch {
        ZombieBatch {
            buffers: self.buffers.drain_all(),
            images: self.images.drain_all(),
            image_views: self.image_views.drain_all(),
            samplers: self.samplers.drain_all(),
            semaphores: self.semaphores.drain_all(),
            events: self.events.drain_all(),
            command_buffers: self.command_buffers.drain_all(),
            swapchains: self.swapchains.drain_all(),
        }
    }
}

/// Objects taken out of the zombie queues, or retired and waiting to be pushed into them.
#[derive(Default)]
pub(crate) struct ZombieBatch {
    pub(crate) buffers: Vec<BufferZombie>,
    pub(crate) images: Vec<ImageZombie>,
    pub(crate) image_views: Vec<ImageViewZombie>,
    pub(crate) samplers: Vec<SamplerZombie>,
    pub(crate) semaphores: Vec<vk::Semaphore>,
    pub(crate) events: Vec<vk::Event>,
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) swapchains: Vec<vk::SwapchainKHR>,
}

/// The slot tables that zombies release their indices into.
pub(crate) struct SlotRelease<'a> {
    pub(crate) buffers: &'a mut SlotTable<Buffer, crate::device::BufferSlot>,
    pub(crate) images: &'a mut SlotTable<Image, crate::device::ImageSlot>,
    pub(crate) image_views: &'a mut SlotTable<ImageView, crate::device::ImageViewSlot>,
    pub(crate) samplers: &'a mut SlotTable<Sampler, crate::device::SamplerSlot>,
}

impl ZombieBatch {
    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.samplers.len()
            + self.semaphores.len()
            + self.events.len()
            + self.command_buffers.len()
            + self.swapchains.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys the native objects and frees their slots.
    ///
    /// # Safety
    ///
    /// - The GPU must no longer be using any of the objects.
    pub(crate) unsafe fn destroy(self, backend: &dyn Backend, slots: SlotRelease<'_>) {
        let count = self.len();

        if count == 0 {
            return;
        }

        for command_buffer in self.command_buffers {
            // SAFETY: Ensured by the caller.
            unsafe { backend.free_command_buffer(command_buffer) };
        }

        for zombie in self.image_views {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_image_view(zombie.handle) };
            slots.image_views.release(zombie.index);
        }

        for zombie in self.images {
            if !zombie.owned_by_swapchain {
                // SAFETY: Ensured by the caller.
                unsafe { backend.destroy_image(zombie.handle) };
            }

            drop(zombie.memory_block);
            slots.images.release(zombie.index);
        }

        for zombie in self.buffers {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_buffer(zombie.native.handle) };
            drop(zombie.memory_block);
            slots.buffers.release(zombie.index);
        }

        for zombie in self.samplers {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_sampler(zombie.handle) };
            slots.samplers.release(zombie.index);
        }

        for event in self.events {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_event(event) };
        }

        for semaphore in self.semaphores {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_semaphore(semaphore) };
        }

        for swapchain in self.swapchains {
            // SAFETY: Ensured by the caller.
            unsafe { backend.destroy_swapchain(swapchain) };
        }

        log::trace!("destroyed {count} zombies");
    }
}
