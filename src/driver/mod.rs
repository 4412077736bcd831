//! Native dispatch table.
//!
//! Every native call a [`Device`](crate::Device) makes goes through the
//! [`Driver`] trait. Two backends implement it:
//!
//! - [`vulkan::VulkanDriver`] issues the calls through `ash` and allocates
//!   memory through VMA.
//! - [`headless::HeadlessDriver`] is a software device. It mints handles,
//!   tracks fence, semaphore and event state, executes submissions in order and
//!   accounts heap usage, so the object store can run without a GPU.
//!
//! Object descriptions are passed as the Vulkan create-info structs themselves,
//! so resource code builds them once regardless of the backend.

pub(crate) mod headless;
pub(crate) mod vulkan;

use std::{ptr::NonNull, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::memory::MemoryUsage;

pub(crate) type DriverRef = Arc<dyn Driver>;

/// Create info for an object that is not backed by allocator memory.
pub enum NativeInfo<'a> {
    ImageView(&'a vk::ImageViewCreateInfo<'a>),
    Sampler(&'a vk::SamplerCreateInfo<'a>),
    ShaderModule(&'a vk::ShaderModuleCreateInfo<'a>),
    DescriptorSetLayout(&'a vk::DescriptorSetLayoutCreateInfo<'a>),
    DescriptorPool(&'a vk::DescriptorPoolCreateInfo<'a>),
    PipelineLayout(&'a vk::PipelineLayoutCreateInfo<'a>),
    PipelineCache(&'a vk::PipelineCacheCreateInfo<'a>),
    ComputePipeline(vk::PipelineCache, &'a vk::ComputePipelineCreateInfo<'a>),
    GraphicsPipeline(vk::PipelineCache, &'a vk::GraphicsPipelineCreateInfo<'a>),
    RenderPass(&'a vk::RenderPassCreateInfo<'a>),
    QueryPool(&'a vk::QueryPoolCreateInfo<'a>),
    CommandPool(&'a vk::CommandPoolCreateInfo<'a>),
    Event(&'a vk::EventCreateInfo<'a>),
    Fence(&'a vk::FenceCreateInfo<'a>),
    Semaphore {
        semaphore_type: vk::SemaphoreType,
        initial_value: u64,
    },
    Swapchain(&'a vk::SwapchainCreateInfoKHR<'a>),
}

impl NativeInfo<'_> {
    pub(crate) fn object_type(&self) -> vk::ObjectType {
        match self {
            NativeInfo::ImageView(_) => vk::ObjectType::IMAGE_VIEW,
            NativeInfo::Sampler(_) => vk::ObjectType::SAMPLER,
            NativeInfo::ShaderModule(_) => vk::ObjectType::SHADER_MODULE,
            NativeInfo::DescriptorSetLayout(_) => vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
            NativeInfo::DescriptorPool(_) => vk::ObjectType::DESCRIPTOR_POOL,
            NativeInfo::PipelineLayout(_) => vk::ObjectType::PIPELINE_LAYOUT,
            NativeInfo::PipelineCache(_) => vk::ObjectType::PIPELINE_CACHE,
            NativeInfo::ComputePipeline(..) | NativeInfo::GraphicsPipeline(..) => {
                vk::ObjectType::PIPELINE
            }
            NativeInfo::RenderPass(_) => vk::ObjectType::RENDER_PASS,
            NativeInfo::QueryPool(_) => vk::ObjectType::QUERY_POOL,
            NativeInfo::CommandPool(_) => vk::ObjectType::COMMAND_POOL,
            NativeInfo::Event(_) => vk::ObjectType::EVENT,
            NativeInfo::Fence(_) => vk::ObjectType::FENCE,
            NativeInfo::Semaphore { .. } => vk::ObjectType::SEMAPHORE,
            NativeInfo::Swapchain(_) => vk::ObjectType::SWAPCHAIN_KHR,
        }
    }
}

/// Placement request for a buffer or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequest {
    pub usage: MemoryUsage,
    /// Ask for a dedicated allocation instead of a suballocation.
    pub committed: bool,
}

/// Backing memory of a buffer or image.
pub struct Allocation {
    pub size: vk::DeviceSize,
    /// Persistent host mapping, for host-visible memory only.
    pub mapped: Option<NonNull<u8>>,
    pub backing: Backing,
}

pub enum Backing {
    Vma(vk_mem::Allocation),
    Headless {
        heap: usize,
        _storage: Option<Box<[u8]>>,
    },
}

// The mapping is only written through `Device`, which serializes access.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// One batch of a queue submission.
pub struct SubmitBatch<'a> {
    pub waits: &'a [(vk::Semaphore, u64, vk::PipelineStageFlags)],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signals: &'a [(vk::Semaphore, u64)],
}

/// A command recorded into a command buffer.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    SetEvent(vk::Event, vk::PipelineStageFlags),
    ResetEvent(vk::Event, vk::PipelineStageFlags),
    WaitEvents {
        events: &'a [vk::Event],
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    },
}

/// Native operations of one logical device.
///
/// Errors are raw `vk::Result`s; callers translate them into
/// [`Error`](crate::Error)s with the kind of object involved.
pub trait Driver: Send + Sync {
    fn raw_device(&self) -> vk::Device;

    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    fn device_wait_idle(&self) -> VkResult<()>;
    /// Prepares for teardown: afterwards no submitted work references any object.
    fn quiesce(&self);
    /// Marks the device lost. Only the headless backend supports this.
    fn simulate_device_loss(&self) -> bool {
        false
    }

    fn create_object(&self, info: NativeInfo<'_>) -> VkResult<u64>;
    fn destroy_object(&self, ty: vk::ObjectType, raw: u64);

    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Buffer, Allocation)>;
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation);
    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Image, Allocation)>;
    fn destroy_image(&self, image: vk::Image, allocation: Allocation);
    fn flush_allocation(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    fn invalidate_allocation(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// `Ok(false)` on timeout.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;
    /// `Ok(false)` on timeout.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64)
    -> VkResult<bool>;

    fn event_status(&self, event: vk::Event) -> VkResult<bool>;
    fn set_event(&self, event: vk::Event) -> VkResult<()>;
    fn reset_event(&self, event: vk::Event) -> VkResult<()>;

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn record(&self, buffer: vk::CommandBuffer, command: Command<'_>);

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        waits: &[vk::Semaphore],
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<bool>;
}

impl<'d> dyn Driver + 'd {
    pub(crate) fn create<H: vk::Handle>(&self, info: NativeInfo<'_>) -> VkResult<H> {
        self.create_object(info).map(H::from_raw)
    }

    pub(crate) fn destroy<H: vk::Handle>(&self, handle: H) {
        self.destroy_object(H::TYPE, handle.as_raw())
    }
}
