//! Device queues.
//!
//! A [`Queue`] is created by the [`Device`](crate::Device) for every queue
//! requested at creation and handed out by reference through
//! [`Device::get_queue`](crate::Device::get_queue).
//!
//! Submissions start in the order they are submitted but may finish out of
//! order. Semaphores order submissions against each other; a [`Fence`]
//! attached to a submission lets the host wait for it.

use std::sync::{Mutex, PoisonError};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    command::{CommandBuffer, CommandBufferState},
    driver::{DriverRef, SubmitBatch},
    error::{Error, ResourceKind, Result},
    swapchain::Swapchain,
    sync::{Fence, Semaphore, SemaphoreKind},
    utils::AsVkHandle,
};

/// A semaphore a submission waits on before it starts.
#[derive(Clone, Copy)]
pub struct SemaphoreWait<'a> {
    pub semaphore: &'a Semaphore,
    /// Target counter value. Ignored for binary semaphores.
    pub value: u64,
}

/// A semaphore a submission signals once it completes.
#[derive(Clone, Copy)]
pub struct SemaphoreSignal<'a> {
    pub semaphore: &'a Semaphore,
    /// New counter value. Ignored for binary semaphores. For timelines it
    /// must exceed the current value, and any value still pending from an
    /// earlier submission.
    pub value: u64,
}

/// One batch of work for [`Queue::submit`].
#[derive(Clone, Copy, Default)]
pub struct Submission<'a> {
    pub waits: &'a [SemaphoreWait<'a>],
    pub command_buffers: &'a [&'a CommandBuffer],
    pub signals: &'a [SemaphoreSignal<'a>],
}

pub struct Queue {
    driver: DriverRef,
    handle: vk::Queue,
    queue_type: vk::QueueFlags,
    family_index: u32,
    queue_index: u32,
    /// Native queues require external synchronization.
    submit_lock: Mutex<()>,
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("queue_type", &self.queue_type)
            .field("family_index", &self.family_index)
            .field("queue_index", &self.queue_index)
            .finish()
    }
}

fn binary_value(semaphore: &Semaphore, value: u64) -> u64 {
    match semaphore.kind() {
        SemaphoreKind::Binary => 0,
        SemaphoreKind::Timeline => value,
    }
}

impl Queue {
    pub(crate) fn new(
        driver: DriverRef,
        handle: vk::Queue,
        queue_type: vk::QueueFlags,
        family_index: u32,
        queue_index: u32,
    ) -> Self {
        Self {
            driver,
            handle,
            queue_type,
            family_index,
            queue_index,
            submit_lock: Mutex::new(()),
        }
    }

    /// The capability this queue was requested with.
    pub fn queue_type(&self) -> vk::QueueFlags {
        self.queue_type
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    /// Submits batches of command buffers.
    ///
    /// Every command buffer must be executable. A timeline signal that does
    /// not advance the semaphore's current value fails with
    /// [`Error::InvalidValue`] and nothing is submitted. `fence` is signaled
    /// once all batches complete; with no batches it is signaled after all
    /// earlier submissions to this queue.
    pub fn submit(&self, submissions: &[Submission<'_>], fence: Option<&Fence>) -> Result<()> {
        struct Prepared {
            waits: SmallVec<[(vk::Semaphore, u64, vk::PipelineStageFlags); 4]>,
            command_buffers: SmallVec<[vk::CommandBuffer; 4]>,
            signals: SmallVec<[(vk::Semaphore, u64); 4]>,
        }
        let mut prepared = Vec::with_capacity(submissions.len());
        for submission in submissions {
            if let Some(cb) = submission
                .command_buffers
                .iter()
                .find(|cb| cb.state() != CommandBufferState::Executable)
            {
                return Err(Error::invalid(
                    ResourceKind::CommandBuffer,
                    format!("command buffer is {:?}, not executable", cb.state()),
                ));
            }
            for signal in submission.signals {
                if signal.semaphore.kind() != SemaphoreKind::Timeline {
                    continue;
                }
                let current = signal.semaphore.value()?;
                if signal.value <= current {
                    return Err(Error::InvalidValue {
                        current,
                        requested: signal.value,
                    });
                }
            }
            prepared.push(Prepared {
                waits: submission
                    .waits
                    .iter()
                    .map(|w| {
                        (
                            w.semaphore.vk_handle(),
                            binary_value(w.semaphore, w.value),
                            w.semaphore.wait_dst_stage_mask(),
                        )
                    })
                    .collect(),
                command_buffers: submission
                    .command_buffers
                    .iter()
                    .map(|cb| cb.vk_handle())
                    .collect(),
                signals: submission
                    .signals
                    .iter()
                    .map(|s| (s.semaphore.vk_handle(), binary_value(s.semaphore, s.value)))
                    .collect(),
            });
        }
        let batches: Vec<_> = prepared
            .iter()
            .map(|p| SubmitBatch {
                waits: &p.waits,
                command_buffers: &p.command_buffers,
                signals: &p.signals,
            })
            .collect();
        let fence = fence.map_or(vk::Fence::null(), |fence| fence.vk_handle());

        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.queue_submit(self.handle, &batches, fence)?;
        tracing::trace!(queue = ?self.handle, batches = batches.len(), "submit");
        Ok(())
    }

    /// Blocks until all work submitted to this queue completes.
    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.queue_wait_idle(self.handle)?;
        Ok(())
    }

    /// Queues `image_index` of `swapchain` for presentation after `waits`
    /// are signaled. Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        waits: &[&Semaphore],
    ) -> Result<bool> {
        if image_index as usize >= swapchain.images().len() {
            return Err(Error::invalid(
                ResourceKind::Swapchain,
                format!(
                    "image index {image_index} out of range for {} images",
                    swapchain.images().len()
                ),
            ));
        }
        if waits.iter().any(|s| s.kind() != SemaphoreKind::Binary) {
            return Err(Error::invalid(
                ResourceKind::Semaphore,
                "presentation can only wait on binary semaphores",
            ));
        }
        let waits: SmallVec<[vk::Semaphore; 4]> = waits.iter().map(|s| s.vk_handle()).collect();
        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let suboptimal = self.driver.queue_present(
            self.handle,
            &waits,
            swapchain.vk_handle(),
            image_index,
        )?;
        Ok(suboptimal)
    }
}
