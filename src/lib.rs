//! # Basalt
//!
//! A managed object store for Vulkan logical devices.
//!
//! A [`Device`] creates every GPU object on behalf of the application and
//! keeps ownership of it. Callers hold typed [`Handle`]s, resolve them with
//! [`Device::get`] and release them with [`Device::destroy`]. Whatever is
//! still alive when the device is torn down is destroyed in dependency order,
//! so no object outlives its device.
//!
//! ## Quick Start
//!
//! ```
//! use basalt::prelude::*;
//!
//! let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
//! let mut device = Device::new(
//!     &gpu,
//!     DeviceCreateInfo {
//!         queues: vec![QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//!
//! let buffer = device
//!     .create_buffer(BufferCreateInfo {
//!         size: 256,
//!         usage: vk::BufferUsageFlags::TRANSFER_DST,
//!         committed: true,
//!         ..Default::default()
//!     })
//!     .unwrap();
//! device.destroy_buffer(buffer).unwrap();
//! device.teardown();
//! assert_eq!(gpu.live_object_count(), Some(0));
//! ```
//!
//! ## Overview
//!
//! ### Instance and adapters
//!
//! An [`Instance`] loads the Vulkan library and enumerates
//! [`PhysicalDevice`]s. [`PhysicalDevice::headless`] builds a software
//! adapter from a [`HeadlessAdapter`] description instead; it executes
//! submissions on the host and counts live objects, which is what the tests
//! of this crate run against.
//!
//! ### Objects
//!
//! Every object kind implements [`Resource`]: a creation record
//! (`CreateInfo`), validated before any native call, and read-only accessors
//! on the stored object. Memory-backed kinds ([`Buffer`](buffer::Buffer),
//! [`Image`](image::Image) and the viewed image kinds) are placed through
//! the device's allocator according to a [`MemoryUsage`].
//!
//! ### Synchronization
//!
//! - [`Queue`] - submits batches; work starts in order, may finish out of order
//! - [`Fence`](sync::Fence) - host waits for a submission
//! - [`Semaphore`](sync::Semaphore) - orders submissions; timeline
//!   semaphores carry a monotonic counter the host can wait on and signal
//! - [`Event`](sync::Event) - fine-grained flags set and waited on inside
//!   command buffers

mod driver;
mod handle;
mod queue;
mod store;
mod surface;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod features;
pub mod image;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod query;
pub mod render_pass;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod utils;

pub use device::{Device, DeviceCreateInfo, QueueRequest};
pub use driver::headless::HeadlessAdapter;
pub use error::{Error, ResourceKind, Result, WaitStatus};
pub use features::DeviceFeatures;
pub use handle::{DeviceId, Handle};
pub use instance::{Instance, InstanceCreateInfo};
pub use memory::MemoryUsage;
pub use physical_device::PhysicalDevice;
pub use queue::{Queue, SemaphoreSignal, SemaphoreWait, Submission};
pub use store::Resource;
pub use surface::Surface;

pub use ash;

pub mod prelude {
    pub use crate::{
        Device, DeviceCreateInfo, DeviceFeatures, Error, Handle, HeadlessAdapter, Instance,
        InstanceCreateInfo, MemoryUsage, PhysicalDevice, Queue, QueueRequest, Resource,
        ResourceKind, SemaphoreSignal, SemaphoreWait, Submission, Surface, WaitStatus, ash,
        ash::vk,
        buffer::{Buffer, BufferCreateInfo, BufferRole},
        command::{
            CommandBuffer, CommandBufferState, CommandEncoder, CommandPool, CommandPoolCreateInfo,
        },
        descriptor::{
            DescriptorPool, DescriptorPoolCreateInfo, DescriptorSetLayout,
            DescriptorSetLayoutCreateInfo,
        },
        image::{
            DepthStencilView, Image, ImageCreateInfo, ImageLike, ImageView, ImageViewCreateInfo,
            RenderTargetView, Texture,
        },
        pipeline::{
            ComputePipeline, ComputePipelineCreateInfo, GraphicsPipeline,
            GraphicsPipelineCreateInfo, GraphicsPipelineState, PipelineCache,
            PipelineCacheCreateInfo, PipelineLayout, PipelineLayoutCreateInfo,
        },
        query::{QueryPool, QueryPoolCreateInfo},
        render_pass::{RenderPass, RenderPassCreateInfo, SubpassInfo},
        sampler::{Sampler, SamplerCreateInfo},
        shader::{
            ShaderModule, ShaderModuleCreateInfo, ShaderProgram, ShaderProgramCreateInfo,
            ShaderStageInfo,
        },
        swapchain::{Swapchain, SwapchainCreateInfo},
        sync::{
            Event, EventCreateInfo, EventStatus, Fence, FenceCreateInfo, FenceStatus, Semaphore,
            SemaphoreCreateInfo, SemaphoreKind,
        },
        utils::AsVkHandle,
    };
}
