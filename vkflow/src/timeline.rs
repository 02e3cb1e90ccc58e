//! Timeline values and timeline semaphores.
//!
//! The device keeps two timelines. The CPU timeline counts submissions: each [`Device::submit`]
//! increments it and signals the new value on the device's timeline semaphore once the submitted
//! work completes. The GPU timeline is the current value of that semaphore. Everything that must
//! outlive in-flight work is pinned at a CPU timeline value and released once the GPU timeline
//! catches up.
//!
//! [`Device::submit`]: crate::device::Device::submit

use crate::{
    backend::{Backend, BackendError},
    device::{Device, DeviceError},
    lock::Counter,
};
use ash::vk;
use std::{fmt, sync::Arc, time::Duration};

pub(crate) struct Timeline {
    cpu: Counter,
    semaphore: vk::Semaphore,
}

impl Timeline {
    pub(crate) fn new(backend: &dyn Backend, name: &str) -> Result<Self, BackendError> {
        let semaphore = backend.create_timeline_semaphore(0, name)?;

        Ok(Timeline {
            cpu: Counter::new(0),
            semaphore,
        })
    }

    /// Returns the value of the most recent submission.
    #[inline]
    pub(crate) fn cpu_value(&self) -> u64 {
        self.cpu.load()
    }

    /// Returns the value of the most recent submission that completed.
    pub(crate) fn gpu_value(&self, backend: &dyn Backend) -> Result<u64, BackendError> {
        // SAFETY: The semaphore is alive as long as the timeline.
        unsafe { backend.semaphore_value(self.semaphore) }
    }

    /// Increments the CPU timeline for a new submission and returns the value the submission
    /// signals.
    #[inline]
    pub(crate) fn advance(&self) -> u64 {
        self.cpu.increment()
    }

    #[inline]
    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Blocks until the GPU timeline reaches `value`.
    pub(crate) fn wait(
        &self,
        backend: &dyn Backend,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError> {
        // SAFETY: The semaphore is alive as long as the timeline.
        unsafe { backend.wait_semaphore(self.semaphore, value, timeout) }
    }
}

/// Parameters to create a new [`TimelineSemaphore`].
#[derive(Clone, Debug)]
pub struct TimelineSemaphoreCreateInfo {
    /// The default value is `0`.
    pub initial_value: u64,

    pub name: String,

    pub _ne: crate::NonExhaustive<'static>,
}

impl Default for TimelineSemaphoreCreateInfo {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineSemaphoreCreateInfo {
    /// Returns a default `TimelineSemaphoreCreateInfo`.
    #[inline]
    pub const fn new() -> Self {
        TimelineSemaphoreCreateInfo {
            initial_value: 0,
            name: String::new(),
            _ne: crate::NE,
        }
    }
}

/// A semaphore with a monotonically increasing 64-bit counter.
///
/// Submissions can wait for and signal values of the semaphore through [`SubmitInfo`], and the
/// host can read, wait for and set its value. Dropping the semaphore defers its destruction
/// until the work submitted so far has completed.
///
/// [`SubmitInfo`]: crate::device::SubmitInfo
pub struct TimelineSemaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
    name: String,
}

impl TimelineSemaphore {
    pub(crate) fn new(
        device: &Arc<Device>,
        create_info: &TimelineSemaphoreCreateInfo,
    ) -> Result<Self, DeviceError> {
        let handle = device
            .backend()
            .create_timeline_semaphore(create_info.initial_value, &create_info.name)?;

        log::debug!(
            "created timeline semaphore {:?} at {}",
            create_info.name,
            create_info.initial_value,
        );

        Ok(TimelineSemaphore {
            device: device.clone(),
            handle,
            name: create_info.name.clone(),
        })
    }

    /// Returns the current counter value.
    pub fn value(&self) -> Result<u64, BackendError> {
        // SAFETY: We own the semaphore.
        unsafe { self.device.backend().semaphore_value(self.handle) }
    }

    /// Blocks until the counter reaches `value`. Returns `false` if `timeout` elapsed first.
    /// `None` waits indefinitely.
    pub fn wait_for_value(
        &self,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError> {
        // SAFETY: We own the semaphore.
        unsafe {
            self.device
                .backend()
                .wait_semaphore(self.handle, value, timeout)
        }
    }

    /// Sets the counter from the host. `value` must be greater than the current value.
    pub fn set_value(&self, value: u64) -> Result<(), BackendError> {
        // SAFETY: We own the semaphore.
        unsafe { self.device.backend().signal_semaphore(self.handle, value) }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub(crate) fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        self.device.zombify_semaphore(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::HeadlessBackend, device::DeviceCreateInfo};

    #[test]
    fn set_and_wait() {
        let device = Device::new(Arc::new(HeadlessBackend::new()), &Default::default()).unwrap();
        let semaphore = device
            .create_timeline_semaphore(&TimelineSemaphoreCreateInfo {
                initial_value: 2,
                name: "test".into(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(semaphore.value(), Ok(2));
        assert_eq!(
            semaphore.wait_for_value(3, Some(Duration::from_millis(1))),
            Ok(false),
        );

        semaphore.set_value(5).unwrap();
        assert_eq!(semaphore.value(), Ok(5));
        assert_eq!(semaphore.wait_for_value(3, None), Ok(true));
    }

    #[test]
    fn destroyed_through_zombies() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), &DeviceCreateInfo::new()).unwrap();
        let baseline = backend.live_object_count();

        let semaphore = device
            .create_timeline_semaphore(&TimelineSemaphoreCreateInfo::new())
            .unwrap();
        assert_eq!(backend.live_object_count(), baseline + 1);

        drop(semaphore);
        assert_eq!(device.zombie_count(), 1);

        device.collect_garbage().unwrap();
        assert_eq!(device.zombie_count(), 0);
        assert_eq!(backend.live_object_count(), baseline);
    }
}
