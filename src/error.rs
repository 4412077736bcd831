//! Error taxonomy shared by every device operation.
//!
//! Every create, destroy and wait call returns [`Result`], distinguishing the
//! kind of failure so callers can pick a recovery policy. Nothing is retried
//! internally.

use ash::vk;
use thiserror::Error;

/// The kind of object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Device,
    Queue,
    Buffer,
    Image,
    ImageView,
    Texture,
    RenderTargetView,
    DepthStencilView,
    Sampler,
    ShaderModule,
    ShaderProgram,
    DescriptorSetLayout,
    DescriptorPool,
    PipelineLayout,
    PipelineCache,
    ComputePipeline,
    GraphicsPipeline,
    RenderPass,
    QueryPool,
    CommandPool,
    CommandBuffer,
    Swapchain,
    Surface,
    Event,
    Fence,
    Semaphore,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Caller-supplied parameters violate a precondition of the object kind.
    #[error("invalid {kind} parameters: {reason}")]
    InvalidParams {
        kind: ResourceKind,
        reason: String,
    },

    /// A requested feature, extension or capability is absent.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The native creation call failed.
    #[error("failed to create {kind}: {result}")]
    CreationFailed {
        kind: ResourceKind,
        result: vk::Result,
    },

    /// The handle was not issued by this device, or was already destroyed.
    #[error("{kind} handle is not owned by this device")]
    NotOwned { kind: ResourceKind },

    /// The device has been torn down.
    #[error("the device has already been destroyed")]
    AlreadyDestroyed,

    #[error("the device was lost")]
    DeviceLost,

    #[error("timed out waiting for a signal")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    /// A timeline semaphore was signaled with a value that does not advance it.
    #[error("timeline value {requested} does not advance the current value {current}")]
    InvalidValue { current: u64, requested: u64 },

    #[error("failed to load the Vulkan library: {0}")]
    LoaderUnavailable(String),

    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::TIMEOUT => Error::Timeout,
            other => Error::Vulkan(other),
        }
    }
}

impl Error {
    pub(crate) fn invalid(kind: ResourceKind, reason: impl Into<String>) -> Self {
        Error::InvalidParams {
            kind,
            reason: reason.into(),
        }
    }

    /// Maps a failed native creation call. Device loss is reported as such.
    pub(crate) fn creation(kind: ResourceKind) -> impl FnOnce(vk::Result) -> Self {
        move |result| match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            result => Error::CreationFailed { kind, result },
        }
    }
}

/// Outcome of a bounded host wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Success,
    Timeout,
}

impl WaitStatus {
    pub fn is_success(self) -> bool {
        self == WaitStatus::Success
    }

    /// Escalates a timeout into [`Error::Timeout`].
    pub fn check(self) -> Result<()> {
        match self {
            WaitStatus::Success => Ok(()),
            WaitStatus::Timeout => Err(Error::Timeout),
        }
    }

    pub(crate) fn from_signaled(signaled: bool) -> Self {
        if signaled {
            WaitStatus::Success
        } else {
            WaitStatus::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_mapped() {
        assert_eq!(
            Error::from(vk::Result::ERROR_DEVICE_LOST),
            Error::DeviceLost
        );
        assert_eq!(
            Error::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            Error::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        );
        let err = Error::creation(ResourceKind::Buffer)(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(
            err,
            Error::CreationFailed {
                kind: ResourceKind::Buffer,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        );
    }

    #[test]
    fn wait_status_escalation() {
        assert!(WaitStatus::Success.check().is_ok());
        assert_eq!(WaitStatus::Timeout.check(), Err(Error::Timeout));
        assert_eq!(
            Error::invalid(ResourceKind::Buffer, "size is zero").to_string(),
            "invalid Buffer parameters: size is zero"
        );
    }
}
