//! Backend issuing native calls through `ash`, with VMA as the allocator context.

use std::{ffi::CString, mem::ManuallyDrop, ptr::NonNull};

use ash::{
    khr,
    prelude::VkResult,
    vk::{self, Handle},
};
use smallvec::SmallVec;
use vk_mem::Alloc;

use super::{Allocation, Backing, Command, Driver, MemoryRequest, NativeInfo, SubmitBatch};
use crate::{Instance, features::DeviceFeatures, memory::MemoryUsage};

pub(crate) struct VulkanDriver {
    device: ash::Device,
    /// Dropped before the device.
    allocator: ManuallyDrop<vk_mem::Allocator>,
    swapchain: Option<khr::swapchain::Device>,
    timeline: bool,
    // Keeps the instance alive for as long as the device.
    _instance: Instance,
}

pub(crate) struct QueueFamilyRequest<'a> {
    pub family_index: u32,
    pub priorities: &'a [f32],
}

impl VulkanDriver {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queues: &[QueueFamilyRequest<'_>],
        extensions: &[CString],
        features: DeviceFeatures,
    ) -> VkResult<Self> {
        let queue_infos: Vec<_> = queues
            .iter()
            .map(|queue| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(queue.family_index)
                    .queue_priorities(queue.priorities)
            })
            .collect();
        let extension_names: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();
        let core_features = features.to_vk();
        let timeline = features.contains(DeviceFeatures::TIMELINE_SEMAPHORE);
        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let mut info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&core_features);
        if timeline {
            info = info.push_next(&mut timeline_features);
        }

        let device = unsafe { instance.raw().create_device(physical_device, &info, None)? };
        let allocator_info =
            vk_mem::AllocatorCreateInfo::new(instance.raw(), &device, physical_device);
        let allocator = match unsafe { vk_mem::Allocator::new(allocator_info) } {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };
        let swapchain = extensions
            .iter()
            .any(|name| name.as_c_str() == khr::swapchain::NAME)
            .then(|| khr::swapchain::Device::new(instance.raw(), &device));
        tracing::info!(device = ?device.handle(), "create device");

        Ok(Self {
            device,
            allocator: ManuallyDrop::new(allocator),
            swapchain,
            timeline,
            _instance: instance.clone(),
        })
    }

    fn swapchain_loader(&self) -> VkResult<&khr::swapchain::Device> {
        self.swapchain
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    fn allocation_info(memory: MemoryRequest) -> vk_mem::AllocationCreateInfo {
        use vk_mem::AllocationCreateFlags as Flags;
        let (usage, mut flags) = match memory.usage {
            MemoryUsage::GpuOnly => (vk_mem::MemoryUsage::AutoPreferDevice, Flags::empty()),
            MemoryUsage::Upload => (
                vk_mem::MemoryUsage::Auto,
                Flags::MAPPED | Flags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryUsage::Readback => (
                vk_mem::MemoryUsage::AutoPreferHost,
                Flags::MAPPED | Flags::HOST_ACCESS_RANDOM,
            ),
        };
        if memory.committed {
            flags |= Flags::DEDICATED_MEMORY;
        }
        vk_mem::AllocationCreateInfo {
            usage,
            flags,
            ..Default::default()
        }
    }

    fn wrap_allocation(&self, allocation: vk_mem::Allocation) -> Allocation {
        let info = self.allocator.get_allocation_info(&allocation);
        Allocation {
            size: info.size,
            mapped: NonNull::new(info.mapped_data.cast::<u8>()),
            backing: Backing::Vma(allocation),
        }
    }
}

fn timed_out(result: VkResult<()>) -> VkResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(err) => Err(err),
    }
}

fn first<T>(created: Vec<T>) -> VkResult<T> {
    created.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

impl Driver for VulkanDriver {
    fn raw_device(&self) -> vk::Device {
        self.device.handle()
    }

    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn quiesce(&self) {
        if let Err(err) = self.device_wait_idle() {
            tracing::error!(?err, "wait idle before teardown failed");
        }
    }

    fn create_object(&self, info: NativeInfo<'_>) -> VkResult<u64> {
        let d = &self.device;
        let raw = unsafe {
            match info {
                NativeInfo::ImageView(info) => d.create_image_view(info, None)?.as_raw(),
                NativeInfo::Sampler(info) => d.create_sampler(info, None)?.as_raw(),
                NativeInfo::ShaderModule(info) => d.create_shader_module(info, None)?.as_raw(),
                NativeInfo::DescriptorSetLayout(info) => {
                    d.create_descriptor_set_layout(info, None)?.as_raw()
                }
                NativeInfo::DescriptorPool(info) => d.create_descriptor_pool(info, None)?.as_raw(),
                NativeInfo::PipelineLayout(info) => d.create_pipeline_layout(info, None)?.as_raw(),
                NativeInfo::PipelineCache(info) => d.create_pipeline_cache(info, None)?.as_raw(),
                NativeInfo::ComputePipeline(cache, info) => first(
                    d.create_compute_pipelines(cache, std::slice::from_ref(info), None)
                        .map_err(|(_, err)| err)?,
                )?
                .as_raw(),
                NativeInfo::GraphicsPipeline(cache, info) => first(
                    d.create_graphics_pipelines(cache, std::slice::from_ref(info), None)
                        .map_err(|(_, err)| err)?,
                )?
                .as_raw(),
                NativeInfo::RenderPass(info) => d.create_render_pass(info, None)?.as_raw(),
                NativeInfo::QueryPool(info) => d.create_query_pool(info, None)?.as_raw(),
                NativeInfo::CommandPool(info) => d.create_command_pool(info, None)?.as_raw(),
                NativeInfo::Event(info) => d.create_event(info, None)?.as_raw(),
                NativeInfo::Fence(info) => d.create_fence(info, None)?.as_raw(),
                NativeInfo::Semaphore {
                    semaphore_type,
                    initial_value,
                } => {
                    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                        .semaphore_type(semaphore_type)
                        .initial_value(initial_value);
                    let mut info = vk::SemaphoreCreateInfo::default();
                    if semaphore_type == vk::SemaphoreType::TIMELINE {
                        info = info.push_next(&mut type_info);
                    }
                    d.create_semaphore(&info, None)?.as_raw()
                }
                NativeInfo::Swapchain(info) => {
                    self.swapchain_loader()?.create_swapchain(info, None)?.as_raw()
                }
            }
        };
        Ok(raw)
    }

    fn destroy_object(&self, ty: vk::ObjectType, raw: u64) {
        let d = &self.device;
        unsafe {
            match ty {
                vk::ObjectType::IMAGE_VIEW => d.destroy_image_view(Handle::from_raw(raw), None),
                vk::ObjectType::SAMPLER => d.destroy_sampler(Handle::from_raw(raw), None),
                vk::ObjectType::SHADER_MODULE => {
                    d.destroy_shader_module(Handle::from_raw(raw), None)
                }
                vk::ObjectType::DESCRIPTOR_SET_LAYOUT => {
                    d.destroy_descriptor_set_layout(Handle::from_raw(raw), None)
                }
                vk::ObjectType::DESCRIPTOR_POOL => {
                    d.destroy_descriptor_pool(Handle::from_raw(raw), None)
                }
                vk::ObjectType::PIPELINE_LAYOUT => {
                    d.destroy_pipeline_layout(Handle::from_raw(raw), None)
                }
                vk::ObjectType::PIPELINE_CACHE => {
                    d.destroy_pipeline_cache(Handle::from_raw(raw), None)
                }
                vk::ObjectType::PIPELINE => d.destroy_pipeline(Handle::from_raw(raw), None),
                vk::ObjectType::RENDER_PASS => d.destroy_render_pass(Handle::from_raw(raw), None),
                vk::ObjectType::QUERY_POOL => d.destroy_query_pool(Handle::from_raw(raw), None),
                vk::ObjectType::COMMAND_POOL => {
                    d.destroy_command_pool(Handle::from_raw(raw), None)
                }
                vk::ObjectType::EVENT => d.destroy_event(Handle::from_raw(raw), None),
                vk::ObjectType::FENCE => d.destroy_fence(Handle::from_raw(raw), None),
                vk::ObjectType::SEMAPHORE => d.destroy_semaphore(Handle::from_raw(raw), None),
                vk::ObjectType::SWAPCHAIN_KHR => match &self.swapchain {
                    Some(loader) => loader.destroy_swapchain(Handle::from_raw(raw), None),
                    None => tracing::error!(raw, "swapchain without a swapchain loader"),
                },
                other => tracing::error!(?other, raw, "no destroy routine for object type"),
            }
        }
    }

    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Buffer, Allocation)> {
        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(info, &Self::allocation_info(memory))?
        };
        Ok((buffer, self.wrap_allocation(allocation)))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        match allocation.backing {
            Backing::Vma(mut allocation) => unsafe {
                self.allocator.destroy_buffer(buffer, &mut allocation)
            },
            Backing::Headless { .. } => {
                tracing::error!(?buffer, "foreign allocation passed to the Vulkan backend")
            }
        }
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Image, Allocation)> {
        let (image, allocation) = unsafe {
            self.allocator
                .create_image(info, &Self::allocation_info(memory))?
        };
        Ok((image, self.wrap_allocation(allocation)))
    }

    fn destroy_image(&self, image: vk::Image, allocation: Allocation) {
        match allocation.backing {
            Backing::Vma(mut allocation) => unsafe {
                self.allocator.destroy_image(image, &mut allocation)
            },
            Backing::Headless { .. } => {
                tracing::error!(?image, "foreign allocation passed to the Vulkan backend")
            }
        }
    }

    fn flush_allocation(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        match &allocation.backing {
            Backing::Vma(allocation) => self.allocator.flush_allocation(allocation, offset, size),
            Backing::Headless { .. } => Ok(()),
        }
    }

    fn invalidate_allocation(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        match &allocation.backing {
            Backing::Vma(allocation) => self
                .allocator
                .invalidate_allocation(allocation, offset, size),
            Backing::Headless { .. } => Ok(()),
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        timed_out(unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) })
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&info) }
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        timed_out(unsafe { self.device.wait_semaphores(&info, timeout_ns) })
    }

    fn event_status(&self, event: vk::Event) -> VkResult<bool> {
        unsafe { self.device.get_event_status(event) }
    }

    fn set_event(&self, event: vk::Event) -> VkResult<()> {
        unsafe { self.device.set_event(event) }
    }

    fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        unsafe { self.device.reset_event(event) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .begin_command_buffer(buffer, &vk::CommandBufferBeginInfo::default())
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn record(&self, buffer: vk::CommandBuffer, command: Command<'_>) {
        unsafe {
            match command {
                Command::SetEvent(event, stage) => self.device.cmd_set_event(buffer, event, stage),
                Command::ResetEvent(event, stage) => {
                    self.device.cmd_reset_event(buffer, event, stage)
                }
                Command::WaitEvents {
                    events,
                    src_stage_mask,
                    dst_stage_mask,
                } => self.device.cmd_wait_events(
                    buffer,
                    events,
                    src_stage_mask,
                    dst_stage_mask,
                    &[],
                    &[],
                    &[],
                ),
            }
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader()?.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader()?
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        struct Prepared {
            wait_semaphores: SmallVec<[vk::Semaphore; 4]>,
            wait_values: SmallVec<[u64; 4]>,
            wait_stages: SmallVec<[vk::PipelineStageFlags; 4]>,
            signal_semaphores: SmallVec<[vk::Semaphore; 4]>,
            signal_values: SmallVec<[u64; 4]>,
        }
        let prepared: Vec<Prepared> = batches
            .iter()
            .map(|batch| Prepared {
                wait_semaphores: batch.waits.iter().map(|w| w.0).collect(),
                wait_values: batch.waits.iter().map(|w| w.1).collect(),
                wait_stages: batch.waits.iter().map(|w| w.2).collect(),
                signal_semaphores: batch.signals.iter().map(|s| s.0).collect(),
                signal_values: batch.signals.iter().map(|s| s.1).collect(),
            })
            .collect();
        let mut timeline_infos: Vec<_> = prepared
            .iter()
            .map(|p| {
                vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&p.wait_values)
                    .signal_semaphore_values(&p.signal_values)
            })
            .collect();
        let submits: Vec<_> = prepared
            .iter()
            .zip(timeline_infos.iter_mut())
            .zip(batches)
            .map(|((p, timeline), batch)| {
                let submit = vk::SubmitInfo::default()
                    .wait_semaphores(&p.wait_semaphores)
                    .wait_dst_stage_mask(&p.wait_stages)
                    .command_buffers(batch.command_buffers)
                    .signal_semaphores(&p.signal_semaphores);
                if self.timeline {
                    submit.push_next(timeline)
                } else {
                    submit
                }
            })
            .collect();
        unsafe { self.device.queue_submit(queue, &submits, fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        waits: &[vk::Semaphore],
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swapchain_loader()?.queue_present(queue, &info) }
    }
}
