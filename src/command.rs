//! Command pools and command buffers.
//!
//! A [`CommandPool`] is a device object, created through
//! [`Device::create_command_pool`](crate::Device::create_command_pool).
//! Command buffers are allocated from it and live as long as the pool does:
//! destroying the pool frees every buffer it allocated.
//!
//! # Lifecycle
//!
//! ```text
//! Initial --begin--> Recording --finish--> Executable --submit--> (reusable)
//!    ^                                          |
//!    +------------------- begin / reset --------+
//! ```
//!
//! Commands are written with a [`CommandEncoder`] inside
//! [`CommandPool::record`], which begins and finishes the buffer around the
//! callback:
//!
//! ```
//! # use basalt::prelude::*;
//! # let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
//! # let mut device = Device::new(&gpu, DeviceCreateInfo {
//! #     queues: vec![QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
//! #     ..Default::default()
//! # }).unwrap();
//! let pool = device.create_command_pool(CommandPoolCreateInfo::new(0)).unwrap();
//! let event = device.create_event(EventCreateInfo::default()).unwrap();
//!
//! let pool = device.get(pool).unwrap();
//! let mut cmd = pool.allocate_one(vk::CommandBufferLevel::PRIMARY).unwrap();
//! pool.record(&mut cmd, |encoder| {
//!     encoder.set_event(device.get(event).unwrap(), vk::PipelineStageFlags::TRANSFER);
//! })
//! .unwrap();
//! assert_eq!(cmd.state(), CommandBufferState::Executable);
//! ```

use std::sync::{Mutex, PoisonError};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device,
    driver::{Command, Driver, DriverRef, NativeInfo},
    error::{Error, ResourceKind, Result},
    store::{Managed, Resource},
    sync::Event,
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPoolCreateInfo {
    /// Must be one of the families the device requested queues from.
    pub family_index: u32,
    pub flags: vk::CommandPoolCreateFlags,
}

impl CommandPoolCreateInfo {
    /// A pool whose buffers can be reset individually.
    pub fn new(family_index: u32) -> Self {
        Self {
            family_index,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        }
    }

    /// A pool for buffers that are submitted once and then reset with the pool.
    pub fn transient(family_index: u32) -> Self {
        Self {
            family_index,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
        }
    }
}

/// The state of a [`CommandBuffer`] as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Allocated or reset. Must be begun before recording.
    Initial,
    /// Between [`CommandPool::begin`] and [`CommandPool::finish`].
    Recording,
    /// Recorded and ready for [`Queue::submit`](crate::Queue::submit).
    /// Stays executable after submission and can be submitted again.
    Executable,
}

/// A command buffer allocated from a [`CommandPool`].
///
/// Command buffers are not stored by the device. They are freed with
/// [`CommandPool::free`] or when their pool is destroyed, after which the
/// value is stale and must not be submitted.
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    /// The pool that allocated this buffer.
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    state: CommandBufferState,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("raw", &self.raw)
            .field("level", &self.level)
            .field("state", &self.state)
            .finish()
    }
}

impl AsVkHandle for CommandBuffer {
    type Handle = vk::CommandBuffer;

    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }
}

/// A pool of command buffers for one queue family.
///
/// Native command pools require external synchronization, so every
/// operation takes the pool's lock. This lets a pool resolved with
/// [`Device::get`](crate::Device::get) be used through a shared reference.
pub struct CommandPool {
    driver: DriverRef,
    handle: vk::CommandPool,
    family_index: u32,
    flags: vk::CommandPoolCreateFlags,
    lock: Mutex<()>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("handle", &self.handle)
            .field("family_index", &self.family_index)
            .field("flags", &self.flags)
            .finish()
    }
}

impl AsVkHandle for CommandPool {
    type Handle = vk::CommandPool;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl CommandPool {
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    fn owns(&self, cb: &CommandBuffer) -> Result<()> {
        if cb.pool == self.handle {
            Ok(())
        } else {
            Err(Error::NotOwned {
                kind: ResourceKind::CommandBuffer,
            })
        }
    }

    /// Allocates `count` command buffers in the initial state.
    pub fn allocate(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer>> {
        if count == 0 {
            return Err(Error::invalid(
                ResourceKind::CommandBuffer,
                "command buffer count is zero",
            ));
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = self
            .driver
            .allocate_command_buffers(self.handle, level, count)
            .map_err(Error::creation(ResourceKind::CommandBuffer))?;
        Ok(raw
            .into_iter()
            .map(|raw| CommandBuffer {
                raw,
                pool: self.handle,
                level,
                state: CommandBufferState::Initial,
            })
            .collect())
    }

    pub fn allocate_one(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        self.allocate(level, 1)?
            .pop()
            .ok_or(Error::CreationFailed {
                kind: ResourceKind::CommandBuffer,
                result: vk::Result::ERROR_UNKNOWN,
            })
    }

    /// Begins recording. Any previous recording is discarded.
    pub fn begin(&self, cb: &mut CommandBuffer) -> Result<()> {
        self.owns(cb)?;
        if cb.state == CommandBufferState::Recording {
            return Err(Error::invalid(
                ResourceKind::CommandBuffer,
                "command buffer is already recording",
            ));
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.begin_command_buffer(cb.raw)?;
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Ends recording. The buffer becomes executable.
    pub fn finish(&self, cb: &mut CommandBuffer) -> Result<()> {
        self.owns(cb)?;
        if cb.state != CommandBufferState::Recording {
            return Err(Error::invalid(
                ResourceKind::CommandBuffer,
                format!("cannot finish a command buffer that is {:?}", cb.state),
            ));
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.end_command_buffer(cb.raw)?;
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Begins `cb`, runs `callback` with an encoder for it and finishes it.
    pub fn record<T>(
        &self,
        cb: &mut CommandBuffer,
        callback: impl FnOnce(&mut CommandEncoder<'_>) -> T,
    ) -> Result<T> {
        self.begin(cb)?;
        let output = {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut encoder = CommandEncoder {
                driver: &*self.driver,
                buffer: cb.raw,
            };
            callback(&mut encoder)
        };
        self.finish(cb)?;
        Ok(output)
    }

    /// Returns command buffers to the pool.
    pub fn free(&self, buffers: impl IntoIterator<Item = CommandBuffer>) -> Result<()> {
        let buffers: SmallVec<[CommandBuffer; 4]> = buffers.into_iter().collect();
        for cb in &buffers {
            self.owns(cb)?;
        }
        let raw: SmallVec<[vk::CommandBuffer; 4]> = buffers.iter().map(|cb| cb.raw).collect();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.free_command_buffers(self.handle, &raw);
        Ok(())
    }

    /// Resets every buffer of the pool to the initial state.
    ///
    /// Host-side [`CommandBuffer::state`] is not updated for buffers the
    /// caller holds; [`begin`](Self::begin) them again before reuse.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.reset_command_pool(self.handle)?;
        Ok(())
    }
}

impl Resource for CommandPool {
    type CreateInfo = CommandPoolCreateInfo;
    const KIND: ResourceKind = ResourceKind::CommandPool;
}

impl Managed for CommandPool {
    fn validate(device: &Device, info: &CommandPoolCreateInfo) -> Result<()> {
        if !device.has_queue_family(info.family_index) {
            return Err(Error::invalid(
                ResourceKind::CommandPool,
                format!(
                    "no queues were requested from family {}",
                    info.family_index
                ),
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: CommandPoolCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let raw = vk::CommandPoolCreateInfo::default()
            .queue_family_index(info.family_index)
            .flags(info.flags);
        let handle = driver
            .create(NativeInfo::CommandPool(&raw))
            .map_err(Error::creation(ResourceKind::CommandPool))?;
        Ok(Self {
            driver: driver.clone(),
            handle,
            family_index: info.family_index,
            flags: info.flags,
            lock: Mutex::new(()),
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

/// Writes commands into a command buffer that is recording.
///
/// Obtained from [`CommandPool::record`].
pub struct CommandEncoder<'a> {
    driver: &'a dyn Driver,
    buffer: vk::CommandBuffer,
}

impl CommandEncoder<'_> {
    /// Sets `event` once all earlier commands reach `stage`.
    pub fn set_event(&mut self, event: &Event, stage: vk::PipelineStageFlags) -> &mut Self {
        self.driver
            .record(self.buffer, Command::SetEvent(event.vk_handle(), stage));
        self
    }

    /// Resets `event` once all earlier commands reach `stage`.
    pub fn reset_event(&mut self, event: &Event, stage: vk::PipelineStageFlags) -> &mut Self {
        self.driver
            .record(self.buffer, Command::ResetEvent(event.vk_handle(), stage));
        self
    }

    /// Blocks `dst_stage_mask` of later commands until every event is set.
    pub fn wait_events(
        &mut self,
        events: &[&Event],
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    ) -> &mut Self {
        let events: SmallVec<[vk::Event; 4]> = events.iter().map(|e| e.vk_handle()).collect();
        self.driver.record(
            self.buffer,
            Command::WaitEvents {
                events: &events,
                src_stage_mask,
                dst_stage_mask,
            },
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::tests::device,
        queue::Submission,
        sync::{EventCreateInfo, EventStatus, FenceCreateInfo, FenceStatus},
    };

    const LEVEL: vk::CommandBufferLevel = vk::CommandBufferLevel::PRIMARY;

    #[test]
    fn family_must_be_requested() {
        let mut device = device();
        assert!(matches!(
            device.create_command_pool(CommandPoolCreateInfo::new(2)),
            Err(Error::InvalidParams {
                kind: ResourceKind::CommandPool,
                ..
            })
        ));
        let pool = device
            .create_command_pool(CommandPoolCreateInfo::transient(1))
            .unwrap();
        assert_eq!(device.get(pool).unwrap().family_index(), 1);
    }

    #[test]
    fn state_machine() {
        let mut device = device();
        let pool = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let pool = device.get(pool).unwrap();
        let mut buffers = pool.allocate(LEVEL, 2).unwrap();
        assert!(pool.allocate(LEVEL, 0).is_err());
        assert_eq!(buffers.len(), 2);
        let cb = &mut buffers[0];
        assert_eq!(cb.state(), CommandBufferState::Initial);
        assert!(pool.finish(cb).is_err());

        pool.begin(cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recording);
        assert!(pool.begin(cb).is_err());
        pool.finish(cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);

        let answer = pool.record(cb, |_| 42).unwrap();
        assert_eq!(answer, 42);
        assert_eq!(cb.state(), CommandBufferState::Executable);
        pool.free(buffers).unwrap();
    }

    #[test]
    fn buffers_belong_to_their_pool() {
        let mut device = device();
        let first = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let second = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let mut cb = device.get(first).unwrap().allocate_one(LEVEL).unwrap();
        let other = device.get(second).unwrap();
        assert_eq!(
            other.begin(&mut cb).unwrap_err(),
            Error::NotOwned {
                kind: ResourceKind::CommandBuffer
            }
        );
        assert!(other.free([cb]).is_err());
    }

    #[test]
    fn submit_requires_executable_buffers() {
        let mut device = device();
        let pool = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let mut cb = device.get(pool).unwrap().allocate_one(LEVEL).unwrap();
        let queue = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();
        let submit = |cb: &CommandBuffer| {
            queue.submit(
                &[Submission {
                    command_buffers: &[cb],
                    ..Default::default()
                }],
                None,
            )
        };
        assert!(matches!(
            submit(&cb),
            Err(Error::InvalidParams {
                kind: ResourceKind::CommandBuffer,
                ..
            })
        ));
        device.get(pool).unwrap().record(&mut cb, |_| ()).unwrap();
        submit(&cb).unwrap();
        // Executable buffers can be submitted again.
        submit(&cb).unwrap();
    }

    #[test]
    fn events_gate_submissions() {
        let mut device = device();
        let pool = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let gate = device.create_event(EventCreateInfo::default()).unwrap();
        let done = device.create_event(EventCreateInfo::default()).unwrap();
        let fence = device.create_fence(FenceCreateInfo::default()).unwrap();

        let pool = device.get(pool).unwrap();
        let (gate, done, fence) = (
            device.get(gate).unwrap(),
            device.get(done).unwrap(),
            device.get(fence).unwrap(),
        );
        let mut cb = pool.allocate_one(LEVEL).unwrap();
        pool.record(&mut cb, |encoder| {
            encoder
                .wait_events(
                    &[gate],
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                )
                .set_event(done, vk::PipelineStageFlags::TRANSFER)
                .reset_event(gate, vk::PipelineStageFlags::TRANSFER);
        })
        .unwrap();

        let queue = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();
        queue
            .submit(
                &[Submission {
                    command_buffers: &[&cb],
                    ..Default::default()
                }],
                Some(fence),
            )
            .unwrap();
        assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);
        assert_eq!(done.status().unwrap(), EventStatus::Reset);

        gate.set().unwrap();
        assert!(fence.wait(u64::MAX).unwrap().is_success());
        assert_eq!(done.status().unwrap(), EventStatus::Set);
        assert_eq!(gate.status().unwrap(), EventStatus::Reset);
    }

    #[test]
    fn destroying_the_pool_frees_its_buffers() {
        let mut device = device();
        let before = device.physical_device().live_object_count();
        let pool = device
            .create_command_pool(CommandPoolCreateInfo::new(0))
            .unwrap();
        let buffers = device.get(pool).unwrap().allocate(LEVEL, 3).unwrap();
        device.get(pool).unwrap().reset().unwrap();
        drop(buffers);
        device.destroy_command_pool(pool).unwrap();
        assert_eq!(device.physical_device().live_object_count(), before);
    }
}
