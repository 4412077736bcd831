//! Host/device synchronization primitives.
//!
//! - [`Fence`]: host-waitable completion signal for queue work. Unsignaled
//!   until the work it is attached to completes, then signaled until reset.
//! - [`Semaphore`]: ordering between queue submissions. Binary semaphores
//!   have no host-visible state. Timeline semaphores carry a 64-bit counter
//!   that only moves forward, advanced by the host or by completed work.
//! - [`Event`]: a flag set and waited on within recorded command streams,
//!   also settable from the host.
//!
//! All three are created and destroyed by the [`Device`]; host-side
//! operations are available on the objects themselves:
//!
//! ```
//! # use basalt::prelude::*;
//! # let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
//! # let mut device = Device::new(&gpu, DeviceCreateInfo {
//! #     queues: vec![QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
//! #     ..Default::default()
//! # }).unwrap();
//! let timeline = device.create_semaphore(SemaphoreCreateInfo::timeline()).unwrap();
//! let semaphore = device.get(timeline).unwrap();
//! semaphore.signal(3).unwrap();
//! assert!(semaphore.wait(2, 0).unwrap().is_success());
//! assert!(semaphore.signal(3).is_err());
//! ```

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use ash::vk;

use crate::{
    Device,
    driver::{Driver, DriverRef, NativeInfo},
    error::{Error, ResourceKind, Result, WaitStatus},
    features::DeviceFeatures,
    store::{Managed, Resource},
    utils::AsVkHandle,
};

/// Host-observed state of a [`Fence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Unsignaled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceCreateInfo {
    /// Create the fence in the signaled state.
    pub signaled: bool,
}

/// A host-waitable completion signal.
///
/// Resetting a fence while work it is attached to is still pending is a
/// caller error; the fence does not track its submissions.
pub struct Fence {
    driver: DriverRef,
    handle: vk::Fence,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}

impl Fence {
    /// Non-blocking.
    pub fn status(&self) -> Result<FenceStatus> {
        Ok(if self.driver.fence_status(self.handle)? {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        })
    }

    /// Blocks the calling thread until the fence is signaled or `timeout_ns`
    /// elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<WaitStatus> {
        let signaled = self.driver.wait_fence(self.handle, timeout_ns)?;
        Ok(WaitStatus::from_signaled(signaled))
    }

    /// Fails with [`Error::DeviceLost`] if the device became unusable.
    pub fn reset(&self) -> Result<()> {
        self.driver.reset_fence(self.handle)?;
        Ok(())
    }

    /// Waits, then resets the fence if the wait succeeded.
    pub fn wait_and_reset(&self, timeout_ns: u64) -> Result<WaitStatus> {
        let status = self.wait(timeout_ns)?;
        if status.is_success() {
            self.reset()?;
        }
        Ok(status)
    }
}

impl AsVkHandle for Fence {
    type Handle = vk::Fence;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Fence {
    type CreateInfo = FenceCreateInfo;
    const KIND: ResourceKind = ResourceKind::Fence;
}

impl Managed for Fence {
    fn validate(_: &Device, _: &FenceCreateInfo) -> Result<()> {
        Ok(())
    }

    fn create(device: &Device, info: FenceCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let flags = if info.signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let handle = driver
            .create(NativeInfo::Fence(&vk::FenceCreateInfo::default().flags(flags)))
            .map_err(Error::creation(ResourceKind::Fence))?;
        Ok(Self {
            driver: driver.clone(),
            handle,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    #[default]
    Binary,
    Timeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreCreateInfo {
    pub kind: SemaphoreKind,
    /// Pipeline stages that wait when this semaphore is in a submission's
    /// wait list.
    pub wait_dst_stage_mask: vk::PipelineStageFlags,
}

impl Default for SemaphoreCreateInfo {
    fn default() -> Self {
        Self {
            kind: SemaphoreKind::Binary,
            wait_dst_stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }
}

impl SemaphoreCreateInfo {
    pub fn binary() -> Self {
        Self::default()
    }

    /// A timeline semaphore. Needs [`DeviceFeatures::TIMELINE_SEMAPHORE`].
    pub fn timeline() -> Self {
        Self {
            kind: SemaphoreKind::Timeline,
            ..Self::default()
        }
    }
}

/// A queue ordering primitive, binary or timeline.
///
/// Timeline semaphores start at zero. The counter value last observed is
/// cached so host signals can reject values that do not advance it.
pub struct Semaphore {
    driver: DriverRef,
    handle: vk::Semaphore,
    kind: SemaphoreKind,
    wait_dst_stage_mask: vk::PipelineStageFlags,
    value: AtomicU64,
    /// Serializes host signals so the monotonic check and the signal are atomic.
    signal_lock: Mutex<()>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SemaphoreKind::Binary => f.debug_tuple("BinarySemaphore").field(&self.handle).finish(),
            SemaphoreKind::Timeline => f
                .debug_tuple("TimelineSemaphore")
                .field(&self.handle)
                .field(&self.value.load(Ordering::Relaxed))
                .finish(),
        }
    }
}

impl Semaphore {
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    pub fn is_timeline(&self) -> bool {
        self.kind == SemaphoreKind::Timeline
    }

    pub fn wait_dst_stage_mask(&self) -> vk::PipelineStageFlags {
        self.wait_dst_stage_mask
    }

    fn require_timeline(&self) -> Result<()> {
        if self.is_timeline() {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(
                "binary semaphores have no host-visible counter".into(),
            ))
        }
    }

    /// Current counter value (timeline only).
    pub fn value(&self) -> Result<u64> {
        self.require_timeline()?;
        let value = self.driver.semaphore_value(self.handle)?;
        self.value.fetch_max(value, Ordering::AcqRel);
        Ok(value)
    }

    /// Advances the counter to `value` from the host (timeline only).
    ///
    /// Fails with [`Error::InvalidValue`] unless `value` is greater than the
    /// current counter.
    pub fn signal(&self, value: u64) -> Result<()> {
        let _guard = self.signal_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.value()?;
        if value <= current {
            return Err(Error::InvalidValue {
                current,
                requested: value,
            });
        }
        self.driver.signal_semaphore(self.handle, value)?;
        self.value.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Blocks the calling thread until the counter reaches `value` or
    /// `timeout_ns` elapses (timeline only). Returns immediately if the
    /// counter was already observed at or past `value`.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<WaitStatus> {
        self.require_timeline()?;
        if self.value.load(Ordering::Acquire) >= value {
            return Ok(WaitStatus::Success);
        }
        let reached = self.driver.wait_semaphore(self.handle, value, timeout_ns)?;
        if reached {
            self.value.fetch_max(value, Ordering::AcqRel);
        }
        Ok(WaitStatus::from_signaled(reached))
    }
}

impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Semaphore {
    type CreateInfo = SemaphoreCreateInfo;
    const KIND: ResourceKind = ResourceKind::Semaphore;
}

impl Managed for Semaphore {
    fn validate(device: &Device, info: &SemaphoreCreateInfo) -> Result<()> {
        if info.kind == SemaphoreKind::Timeline
            && !device
                .enabled_features()
                .contains(DeviceFeatures::TIMELINE_SEMAPHORE)
        {
            return Err(Error::UnsupportedFeature(
                "timeline semaphores need the TIMELINE_SEMAPHORE feature".into(),
            ));
        }
        if info.wait_dst_stage_mask.is_empty() {
            return Err(Error::invalid(
                ResourceKind::Semaphore,
                "wait stage mask is empty",
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: SemaphoreCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let semaphore_type = match info.kind {
            SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
            SemaphoreKind::Timeline => vk::SemaphoreType::TIMELINE,
        };
        let handle = driver
            .create(NativeInfo::Semaphore {
                semaphore_type,
                initial_value: 0,
            })
            .map_err(Error::creation(ResourceKind::Semaphore))?;
        Ok(Self {
            driver: driver.clone(),
            handle,
            kind: info.kind,
            wait_dst_stage_mask: info.wait_dst_stage_mask,
            value: AtomicU64::new(0),
            signal_lock: Mutex::new(()),
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

/// Host-observed state of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Set,
    Reset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCreateInfo {
    /// Only usable from the device; host `set`/`reset`/`status` are disallowed.
    pub device_only: bool,
}

/// A fine-grained dependency flag within a queue's timeline.
pub struct Event {
    driver: DriverRef,
    handle: vk::Event,
    device_only: bool,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Event").field(&self.handle).finish()
    }
}

impl Event {
    fn require_host_access(&self) -> Result<()> {
        if self.device_only {
            Err(Error::UnsupportedFeature(
                "device-only events cannot be accessed from the host".into(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn set(&self) -> Result<()> {
        self.require_host_access()?;
        self.driver.set_event(self.handle)?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.require_host_access()?;
        self.driver.reset_event(self.handle)?;
        Ok(())
    }

    pub fn status(&self) -> Result<EventStatus> {
        self.require_host_access()?;
        Ok(if self.driver.event_status(self.handle)? {
            EventStatus::Set
        } else {
            EventStatus::Reset
        })
    }
}

impl AsVkHandle for Event {
    type Handle = vk::Event;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Event {
    type CreateInfo = EventCreateInfo;
    const KIND: ResourceKind = ResourceKind::Event;
}

impl Managed for Event {
    fn validate(_: &Device, _: &EventCreateInfo) -> Result<()> {
        Ok(())
    }

    fn create(device: &Device, info: EventCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let flags = if info.device_only {
            vk::EventCreateFlags::DEVICE_ONLY
        } else {
            vk::EventCreateFlags::empty()
        };
        let handle = driver
            .create(NativeInfo::Event(&vk::EventCreateInfo::default().flags(flags)))
            .map_err(Error::creation(ResourceKind::Event))?;
        Ok(Self {
            driver: driver.clone(),
            handle,
            device_only: info.device_only,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        HeadlessAdapter, PhysicalDevice,
        device::tests::device,
        queue::{SemaphoreSignal, SemaphoreWait, Submission},
    };
    use std::{sync::Arc, time::Duration};

    #[test]
    fn fence_round_trip() {
        let mut device = device();
        let handle = device.create_fence(FenceCreateInfo::default()).unwrap();
        let fence = device.get(handle).unwrap();
        assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);
        assert_eq!(fence.wait(0).unwrap(), WaitStatus::Timeout);

        let queue = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();
        queue.submit(&[], Some(fence)).unwrap();
        assert_eq!(fence.wait(u64::MAX).unwrap(), WaitStatus::Success);
        assert_eq!(fence.status().unwrap(), FenceStatus::Signaled);

        fence.reset().unwrap();
        assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);
    }

    #[test]
    fn signaled_fence_wait_and_reset() {
        let mut device = device();
        let handle = device
            .create_fence(FenceCreateInfo { signaled: true })
            .unwrap();
        let fence = device.get(handle).unwrap();
        assert_eq!(fence.wait_and_reset(0).unwrap(), WaitStatus::Success);
        assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);
        assert_eq!(fence.wait_and_reset(1_000).unwrap(), WaitStatus::Timeout);
    }

    #[test]
    fn reset_on_lost_device() {
        let mut device = device();
        let handle = device.create_fence(FenceCreateInfo::default()).unwrap();
        device.simulate_device_loss().unwrap();
        let fence = device.get(handle).unwrap();
        assert_eq!(fence.reset(), Err(Error::DeviceLost));
        assert_eq!(fence.wait(u64::MAX), Err(Error::DeviceLost));
    }

    #[test]
    fn timeline_is_monotonic() {
        let mut device = device();
        let handle = device.create_semaphore(SemaphoreCreateInfo::timeline()).unwrap();
        let semaphore = device.get(handle).unwrap();
        assert_eq!(semaphore.value().unwrap(), 0);
        semaphore.signal(5).unwrap();
        assert_eq!(
            semaphore.signal(5),
            Err(Error::InvalidValue {
                current: 5,
                requested: 5
            })
        );
        assert_eq!(
            semaphore.signal(2),
            Err(Error::InvalidValue {
                current: 5,
                requested: 2
            })
        );
        assert_eq!(semaphore.wait(5, 0).unwrap(), WaitStatus::Success);
        assert_eq!(semaphore.wait(3, 0).unwrap(), WaitStatus::Success);
        assert_eq!(semaphore.wait(6, 1_000).unwrap(), WaitStatus::Timeout);
    }

    #[test]
    fn timeline_wait_blocks_until_signaled_elsewhere() {
        let mut device = device();
        let handle = device.create_semaphore(SemaphoreCreateInfo::timeline()).unwrap();
        let device = Arc::new(device);
        let signaler = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                device.get(handle).unwrap().signal(7).unwrap();
            })
        };
        let semaphore = device.get(handle).unwrap();
        assert_eq!(semaphore.wait(7, u64::MAX).unwrap(), WaitStatus::Success);
        signaler.join().unwrap();
        assert_eq!(semaphore.value().unwrap(), 7);
    }

    #[test]
    fn submissions_advance_timelines() {
        let mut device = device();
        let a = device.create_semaphore(SemaphoreCreateInfo::timeline()).unwrap();
        let b = device.create_semaphore(SemaphoreCreateInfo::timeline()).unwrap();
        let graphics = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();
        let compute = device.get_queue(vk::QueueFlags::COMPUTE, 1, 0).unwrap();
        let (a, b) = (device.get(a).unwrap(), device.get(b).unwrap());

        // compute waits on a=1 and signals b=2
        compute
            .submit(
                &[Submission {
                    waits: &[SemaphoreWait {
                        semaphore: a,
                        value: 1,
                    }],
                    signals: &[SemaphoreSignal {
                        semaphore: b,
                        value: 2,
                    }],
                    ..Default::default()
                }],
                None,
            )
            .unwrap();
        assert_eq!(b.value().unwrap(), 0);

        graphics
            .submit(
                &[Submission {
                    signals: &[SemaphoreSignal {
                        semaphore: a,
                        value: 1,
                    }],
                    ..Default::default()
                }],
                None,
            )
            .unwrap();
        assert_eq!(b.wait(2, u64::MAX).unwrap(), WaitStatus::Success);
        assert_eq!(a.value().unwrap(), 1);
        assert_eq!(b.value().unwrap(), 2);
    }

    #[test]
    fn submitted_signals_must_advance_the_timeline() {
        let mut device = device();
        let timeline = device
            .create_semaphore(SemaphoreCreateInfo::timeline())
            .unwrap();
        let fence = device.create_fence(FenceCreateInfo::default()).unwrap();
        let queue = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();
        let (timeline, fence) = (device.get(timeline).unwrap(), device.get(fence).unwrap());
        timeline.signal(5).unwrap();

        for stale in [3, 5] {
            assert_eq!(
                queue.submit(
                    &[Submission {
                        signals: &[SemaphoreSignal {
                            semaphore: timeline,
                            value: stale,
                        }],
                        ..Default::default()
                    }],
                    Some(fence),
                ),
                Err(Error::InvalidValue {
                    current: 5,
                    requested: stale
                })
            );
        }
        // Nothing was submitted, so the fence stays unsignaled.
        assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);

        queue
            .submit(
                &[Submission {
                    signals: &[SemaphoreSignal {
                        semaphore: timeline,
                        value: 6,
                    }],
                    ..Default::default()
                }],
                Some(fence),
            )
            .unwrap();
        assert!(fence.wait(u64::MAX).unwrap().is_success());
        assert_eq!(timeline.value().unwrap(), 6);
    }

    #[test]
    fn binary_semaphores_have_no_counter() {
        let mut device = device();
        let handle = device.create_semaphore(SemaphoreCreateInfo::binary()).unwrap();
        let semaphore = device.get(handle).unwrap();
        assert!(!semaphore.is_timeline());
        assert!(matches!(semaphore.value(), Err(Error::UnsupportedFeature(_))));
        assert!(matches!(semaphore.signal(1), Err(Error::UnsupportedFeature(_))));
        assert!(matches!(semaphore.wait(1, 0), Err(Error::UnsupportedFeature(_))));
    }

    #[test]
    fn timeline_requires_feature() {
        let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
        let mut device = Device::new(
            &gpu,
            crate::DeviceCreateInfo {
                queues: vec![crate::QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
                features: DeviceFeatures::default() - DeviceFeatures::TIMELINE_SEMAPHORE,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            device.create_semaphore(SemaphoreCreateInfo::timeline()),
            Err(Error::UnsupportedFeature(_))
        ));
        assert_eq!(device.count::<Semaphore>(), 0);
        device.create_semaphore(SemaphoreCreateInfo::binary()).unwrap();
        drop(device);
        assert_eq!(gpu.live_object_count(), Some(0));
    }

    #[test]
    fn event_host_access() {
        let mut device = device();
        let handle = device.create_event(EventCreateInfo::default()).unwrap();
        let event = device.get(handle).unwrap();
        assert_eq!(event.status().unwrap(), EventStatus::Reset);
        event.set().unwrap();
        assert_eq!(event.status().unwrap(), EventStatus::Set);
        event.reset().unwrap();
        assert_eq!(event.status().unwrap(), EventStatus::Reset);

        let device_only = device
            .create_event(EventCreateInfo { device_only: true })
            .unwrap();
        assert!(matches!(
            device.get(device_only).unwrap().set(),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn events_fail_on_lost_device() {
        let mut device = device();
        let handle = device.create_event(EventCreateInfo::default()).unwrap();
        device.simulate_device_loss().unwrap();
        let event = device.get(handle).unwrap();
        assert_eq!(event.set(), Err(Error::DeviceLost));
        assert_eq!(event.reset(), Err(Error::DeviceLost));
        assert_eq!(event.status(), Err(Error::DeviceLost));
    }
}
