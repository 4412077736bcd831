//! Software device.
//!
//! The headless backend never touches a GPU. Handles are minted from a
//! process-wide counter, host-visible memory is backed by boxed byte slices and
//! heap usage is accounted against the adapter's declared heaps. Submitted
//! work runs in FIFO order per queue as soon as its semaphore waits and event
//! waits are satisfied, so fences, timeline values and events behave as they
//! would on real hardware with an infinitely fast GPU.

use std::{
    collections::{HashMap, VecDeque},
    ffi::CString,
    ptr::NonNull,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use ash::{
    khr,
    prelude::VkResult,
    vk::{self, Handle},
};
use smallvec::SmallVec;

use super::{Allocation, Backing, Command, Driver, MemoryRequest, NativeInfo, SubmitBatch};
use crate::{
    features::DeviceFeatures,
    memory::MemoryTypeMap,
    physical_device::AmdShaderCoreProperties,
    utils::{Version, write_cstr_array},
};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x1000);

fn mint() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

const MB: vk::DeviceSize = 1024 * 1024;

/// Description of a software adapter.
///
/// Every field is public; start from [`Default`] and override what the test
/// needs:
///
/// ```
/// # use basalt::{HeadlessAdapter, PhysicalDevice, DeviceFeatures};
/// let gpu = PhysicalDevice::headless(HeadlessAdapter {
///     features: DeviceFeatures::default() - DeviceFeatures::TIMELINE_SEMAPHORE,
///     ..Default::default()
/// })
/// .unwrap();
/// assert!(!gpu.supports_timeline_semaphore());
/// ```
#[derive(Debug, Clone)]
pub struct HeadlessAdapter {
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: Version,
    pub driver_version: u32,
    /// Flags and queue count of each family, in family index order.
    pub queue_families: Vec<(vk::QueueFlags, u32)>,
    pub memory_heaps: Vec<vk::MemoryHeap>,
    pub memory_types: Vec<vk::MemoryType>,
    pub features: DeviceFeatures,
    pub extensions: Vec<CString>,
    pub limits: vk::PhysicalDeviceLimits,
    pub amd_shader_core: Option<AmdShaderCoreProperties>,
}

impl Default for HeadlessAdapter {
    fn default() -> Self {
        use vk::MemoryPropertyFlags as F;
        let limits = vk::PhysicalDeviceLimits {
            max_image_dimension1_d: 16384,
            max_image_dimension2_d: 16384,
            max_image_dimension3_d: 2048,
            max_image_dimension_cube: 16384,
            max_image_array_layers: 2048,
            max_uniform_buffer_range: 65536,
            max_storage_buffer_range: 1 << 27,
            max_push_constants_size: 256,
            max_bound_descriptor_sets: 8,
            max_sampler_anisotropy: 16.0,
            max_color_attachments: 8,
            ..Default::default()
        };
        Self {
            device_name: "Headless Device".into(),
            vendor_id: 0,
            device_id: 0,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: Version::V1_3,
            driver_version: 1,
            queue_families: vec![
                (
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    4,
                ),
                (vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
                (vk::QueueFlags::TRANSFER, 1),
            ],
            memory_heaps: vec![
                vk::MemoryHeap {
                    size: 256 * MB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                vk::MemoryHeap {
                    size: 1024 * MB,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
            memory_types: vec![
                vk::MemoryType {
                    property_flags: F::DEVICE_LOCAL,
                    heap_index: 0,
                },
                vk::MemoryType {
                    property_flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                    heap_index: 1,
                },
                vk::MemoryType {
                    property_flags: F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            features: DeviceFeatures::all(),
            extensions: vec![khr::swapchain::NAME.to_owned()],
            limits,
            amd_shader_core: None,
        }
    }
}

impl HeadlessAdapter {
    /// The adapter as reported by `vkGetPhysicalDeviceProperties`.
    pub fn properties(&self) -> vk::PhysicalDeviceProperties {
        let mut properties = vk::PhysicalDeviceProperties {
            api_version: self.api_version.as_raw(),
            driver_version: self.driver_version,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            device_type: self.device_type,
            limits: self.limits,
            ..Default::default()
        };
        write_cstr_array(&mut properties.device_name, &self.device_name);
        properties
    }
}

/// State shared by every device created from one headless adapter.
pub(crate) struct HeadlessShared {
    adapter: HeadlessAdapter,
    raw: vk::PhysicalDevice,
    /// Devices and the objects they own.
    live_objects: AtomicUsize,
    heap_usage: Mutex<Vec<vk::DeviceSize>>,
}

impl HeadlessShared {
    pub(crate) fn new(adapter: HeadlessAdapter) -> Self {
        let heap_usage = Mutex::new(vec![0; adapter.memory_heaps.len()]);
        Self {
            adapter,
            raw: vk::PhysicalDevice::from_raw(mint()),
            live_objects: AtomicUsize::new(0),
            heap_usage,
        }
    }

    pub(crate) fn adapter(&self) -> &HeadlessAdapter {
        &self.adapter
    }

    pub(crate) fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.raw
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Acquire)
    }

    fn retain(&self) {
        self.live_objects.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.live_objects.fetch_sub(1, Ordering::AcqRel);
    }

    fn reserve(&self, heap: usize, size: vk::DeviceSize) -> VkResult<()> {
        let capacity = self
            .adapter
            .memory_heaps
            .get(heap)
            .map_or(0, |heap| heap.size);
        let mut usage = self.heap_usage.lock().unwrap_or_else(PoisonError::into_inner);
        let used = usage
            .get_mut(heap)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        if capacity.saturating_sub(*used) < size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        *used += size;
        Ok(())
    }

    fn unreserve(&self, heap: usize, size: vk::DeviceSize) {
        let mut usage = self.heap_usage.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(used) = usage.get_mut(heap) {
            *used = used.saturating_sub(size);
        }
    }

    #[cfg(test)]
    fn heap_usage(&self, heap: usize) -> vk::DeviceSize {
        self.heap_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(heap)
            .copied()
            .unwrap_or(0)
    }
}

enum Object {
    Plain(vk::ObjectType),
    Fence { signaled: bool },
    /// Binary semaphores hold 0 or 1.
    Semaphore { timeline: bool, value: u64 },
    Event { set: bool },
    CommandPool { buffers: Vec<u64> },
    DescriptorPool { max_sets: u32, allocated: u32 },
    Swapchain { images: Vec<vk::Image>, next: u32 },
    Memory { heap: usize, size: vk::DeviceSize },
}

#[derive(Clone)]
enum Op {
    SetEvent(u64),
    ResetEvent(u64),
    WaitEvents(SmallVec<[u64; 4]>),
}

struct Recording {
    pool: u64,
    ops: Vec<Op>,
}

struct Batch {
    waits: SmallVec<[(u64, u64); 4]>,
    /// Copied out of the command buffers at submit time.
    ops: Vec<Op>,
    signals: SmallVec<[(u64, u64); 4]>,
    fence: Option<u64>,
    started: bool,
    cursor: usize,
}

impl Batch {
    fn new(
        waits: SmallVec<[(u64, u64); 4]>,
        ops: Vec<Op>,
        signals: SmallVec<[(u64, u64); 4]>,
    ) -> Self {
        Self {
            waits,
            ops,
            signals,
            fence: None,
            started: false,
            cursor: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Batch>,
}

#[derive(Default)]
struct State {
    lost: bool,
    objects: HashMap<u64, Object>,
    command_buffers: HashMap<u64, Recording>,
    queue_handles: HashMap<(u32, u32), vk::Queue>,
    queues: HashMap<u64, QueueState>,
}

fn semaphore_reached(objects: &HashMap<u64, Object>, semaphore: u64, target: u64) -> bool {
    match objects.get(&semaphore) {
        Some(Object::Semaphore {
            timeline: true,
            value,
        }) => *value >= target,
        Some(Object::Semaphore {
            timeline: false,
            value,
        }) => *value != 0,
        _ => false,
    }
}

fn event_is_set(objects: &HashMap<u64, Object>, event: u64) -> bool {
    matches!(objects.get(&event), Some(Object::Event { set: true }))
}

fn write_event(objects: &mut HashMap<u64, Object>, event: u64, value: bool) {
    if let Some(Object::Event { set }) = objects.get_mut(&event) {
        *set = value;
    }
}

fn signal(objects: &mut HashMap<u64, Object>, semaphore: u64, target: u64) {
    if let Some(Object::Semaphore { timeline, value }) = objects.get_mut(&semaphore) {
        *value = if *timeline { (*value).max(target) } else { 1 };
    }
}

fn signal_fence(objects: &mut HashMap<u64, Object>, fence: u64) {
    if let Some(Object::Fence { signaled }) = objects.get_mut(&fence) {
        *signaled = true;
    }
}

impl QueueState {
    /// Runs batches in order until one blocks. Returns whether anything ran.
    fn advance(&mut self, objects: &mut HashMap<u64, Object>) -> bool {
        let mut progressed = false;
        while let Some(batch) = self.pending.front_mut() {
            if !batch.started {
                if !batch
                    .waits
                    .iter()
                    .all(|&(semaphore, value)| semaphore_reached(objects, semaphore, value))
                {
                    break;
                }
                // Waiting unsignals a binary semaphore.
                for &(semaphore, _) in &batch.waits {
                    if let Some(Object::Semaphore {
                        timeline: false,
                        value,
                    }) = objects.get_mut(&semaphore)
                    {
                        *value = 0;
                    }
                }
                batch.started = true;
                progressed = true;
            }
            while let Some(op) = batch.ops.get(batch.cursor) {
                match op {
                    Op::SetEvent(event) => write_event(objects, *event, true),
                    Op::ResetEvent(event) => write_event(objects, *event, false),
                    Op::WaitEvents(events) => {
                        if !events.iter().all(|&event| event_is_set(objects, event)) {
                            return progressed;
                        }
                    }
                }
                batch.cursor += 1;
                progressed = true;
            }
            for &(semaphore, value) in &batch.signals {
                signal(objects, semaphore, value);
            }
            if let Some(fence) = batch.fence {
                signal_fence(objects, fence);
            }
            self.pending.pop_front();
            progressed = true;
        }
        progressed
    }
}

impl State {
    /// Runs every queue until no batch can make progress.
    fn pump(&mut self) {
        let State {
            objects, queues, ..
        } = self;
        loop {
            let mut progressed = false;
            for queue in queues.values_mut() {
                progressed |= queue.advance(objects);
            }
            if !progressed {
                break;
            }
        }
    }

    fn idle(&self) -> bool {
        self.queues.values().all(|queue| queue.pending.is_empty())
    }
}

/// Bytes accounted for an image: four per texel across the full mip chain.
fn image_footprint(info: &vk::ImageCreateInfo<'_>) -> vk::DeviceSize {
    let extent = info.extent;
    let texels: u64 = (0..info.mip_levels.min(32))
        .map(|level| {
            let dim = |d: u32| u64::from((d >> level).max(1));
            dim(extent.width) * dim(extent.height) * dim(extent.depth)
        })
        .sum();
    texels * u64::from(info.array_layers) * u64::from(info.samples.as_raw().max(1)) * 4
}

pub(crate) struct HeadlessDriver {
    shared: Arc<HeadlessShared>,
    memory_types: MemoryTypeMap,
    raw: vk::Device,
    state: Mutex<State>,
    signal: Condvar,
}

impl HeadlessDriver {
    pub(crate) fn new(shared: Arc<HeadlessShared>, memory_types: MemoryTypeMap) -> Self {
        shared.retain();
        let raw = vk::Device::from_raw(mint());
        tracing::info!(
            device = ?raw,
            adapter = %shared.adapter.device_name,
            "create headless device"
        );
        Self {
            shared,
            memory_types,
            raw,
            state: Mutex::new(State::default()),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs ready work after a host-side state change and wakes waiters.
    fn pump(&self, state: &mut State) {
        state.pump();
        self.signal.notify_all();
    }

    /// Blocks until `ready` holds, the timeout elapses or the device is lost.
    fn wait_until(
        &self,
        timeout_ns: u64,
        mut ready: impl FnMut(&State) -> VkResult<bool>,
    ) -> VkResult<bool> {
        let deadline = if timeout_ns == u64::MAX {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout_ns))
        };
        let mut state = self.lock();
        loop {
            if state.lost {
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            if ready(&state)? {
                return Ok(true);
            }
            state = match deadline {
                None => self
                    .signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.signal
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn insert(&self, state: &mut State, object: Object) -> u64 {
        let raw = mint();
        state.objects.insert(raw, object);
        self.shared.retain();
        raw
    }

    fn remove(&self, state: &mut State, raw: u64) -> Option<Object> {
        let object = state.objects.remove(&raw)?;
        self.shared.release();
        Some(object)
    }

    fn allocate(
        &self,
        memory: MemoryRequest,
        size: vk::DeviceSize,
    ) -> VkResult<(Allocation, Object)> {
        let type_index = self.memory_types.select(memory.usage);
        let memory_type = self
            .shared
            .adapter
            .memory_types
            .get(type_index as usize)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let heap = memory_type.heap_index as usize;
        self.shared.reserve(heap, size)?;

        let host_visible = memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mut storage = host_visible.then(|| vec![0u8; size as usize].into_boxed_slice());
        let mapped = storage
            .as_mut()
            .and_then(|bytes| NonNull::new(bytes.as_mut_ptr()));
        let allocation = Allocation {
            size,
            mapped,
            backing: Backing::Headless {
                heap,
                _storage: storage,
            },
        };
        Ok((allocation, Object::Memory { heap, size }))
    }

    fn free(&self, raw: u64, allocation: Allocation) {
        let mut state = self.lock();
        if self.remove(&mut state, raw).is_none() {
            tracing::error!(raw, "destroying unknown memory-backed object");
        }
        if let Backing::Headless { heap, .. } = allocation.backing {
            self.shared.unreserve(heap, allocation.size);
        }
    }
}

impl Drop for HeadlessDriver {
    fn drop(&mut self) {
        let state = self.lock();
        if !state.objects.is_empty() {
            tracing::warn!(
                count = state.objects.len(),
                "headless device dropped with live objects"
            );
        }
        drop(state);
        self.shared.release();
        tracing::info!(device = ?self.raw, "drop headless device");
    }
}

impl Driver for HeadlessDriver {
    fn raw_device(&self) -> vk::Device {
        self.raw
    }

    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        let mut state = self.lock();
        if let Some(queue) = state.queue_handles.get(&(family_index, queue_index)) {
            return *queue;
        }
        let queue = vk::Queue::from_raw(mint());
        state
            .queue_handles
            .insert((family_index, queue_index), queue);
        state.queues.insert(queue.as_raw(), QueueState::default());
        queue
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.wait_until(u64::MAX, |state| Ok(state.idle()))?;
        Ok(())
    }

    fn quiesce(&self) {
        let mut state = self.lock();
        let pending: usize = state.queues.values().map(|q| q.pending.len()).sum();
        if pending > 0 {
            tracing::warn!(pending, "discarding blocked submissions at teardown");
        }
        for queue in state.queues.values_mut() {
            queue.pending.clear();
        }
        self.signal.notify_all();
    }

    fn simulate_device_loss(&self) -> bool {
        let mut state = self.lock();
        state.lost = true;
        tracing::warn!(device = ?self.raw, "simulated device loss");
        self.signal.notify_all();
        true
    }

    fn create_object(&self, info: NativeInfo<'_>) -> VkResult<u64> {
        let object = match info {
            NativeInfo::Fence(info) => Object::Fence {
                signaled: info.flags.contains(vk::FenceCreateFlags::SIGNALED),
            },
            NativeInfo::Semaphore {
                semaphore_type,
                initial_value,
            } => {
                let timeline = semaphore_type == vk::SemaphoreType::TIMELINE;
                Object::Semaphore {
                    timeline,
                    value: if timeline { initial_value } else { 0 },
                }
            }
            NativeInfo::Event(_) => Object::Event { set: false },
            NativeInfo::CommandPool(_) => Object::CommandPool {
                buffers: Vec::new(),
            },
            NativeInfo::DescriptorPool(info) => Object::DescriptorPool {
                max_sets: info.max_sets,
                allocated: 0,
            },
            NativeInfo::Swapchain(info) => Object::Swapchain {
                images: (0..info.min_image_count)
                    .map(|_| vk::Image::from_raw(mint()))
                    .collect(),
                next: 0,
            },
            other => Object::Plain(other.object_type()),
        };
        let mut state = self.lock();
        Ok(self.insert(&mut state, object))
    }

    fn destroy_object(&self, ty: vk::ObjectType, raw: u64) {
        let mut state = self.lock();
        match self.remove(&mut state, raw) {
            Some(Object::CommandPool { buffers }) => {
                for buffer in buffers {
                    state.command_buffers.remove(&buffer);
                }
            }
            Some(_) => {}
            None => tracing::error!(?ty, raw, "destroying unknown object"),
        }
    }

    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Buffer, Allocation)> {
        let (allocation, object) = self.allocate(memory, info.size)?;
        let mut state = self.lock();
        let raw = self.insert(&mut state, object);
        Ok((vk::Buffer::from_raw(raw), allocation))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        self.free(buffer.as_raw(), allocation)
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        memory: MemoryRequest,
    ) -> VkResult<(vk::Image, Allocation)> {
        let (mut allocation, object) = self.allocate(memory, image_footprint(info))?;
        // Optimal tiling has no host layout.
        allocation.mapped = None;
        let mut state = self.lock();
        let raw = self.insert(&mut state, object);
        Ok((vk::Image::from_raw(raw), allocation))
    }

    fn destroy_image(&self, image: vk::Image, allocation: Allocation) {
        self.free(image.as_raw(), allocation)
    }

    fn flush_allocation(
        &self,
        _: &Allocation,
        _: vk::DeviceSize,
        _: vk::DeviceSize,
    ) -> VkResult<()> {
        Ok(())
    }

    fn invalidate_allocation(
        &self,
        _: &Allocation,
        _: vk::DeviceSize,
        _: vk::DeviceSize,
    ) -> VkResult<()> {
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.objects.get(&fence.as_raw()) {
            Some(Object::Fence { signaled }) => Ok(*signaled),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        let raw = fence.as_raw();
        self.wait_until(timeout_ns, |state| match state.objects.get(&raw) {
            Some(Object::Fence { signaled }) => Ok(*signaled),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        })
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.objects.get_mut(&fence.as_raw()) {
            Some(Object::Fence { signaled }) => {
                *signaled = false;
                Ok(())
            }
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.objects.get(&semaphore.as_raw()) {
            Some(Object::Semaphore { value, .. }) => Ok(*value),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        signal(&mut state.objects, semaphore.as_raw(), value);
        self.pump(&mut state);
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let raw = semaphore.as_raw();
        self.wait_until(timeout_ns, |state| Ok(semaphore_reached(&state.objects, raw, value)))
    }

    fn event_status(&self, event: vk::Event) -> VkResult<bool> {
        let state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.objects.get(&event.as_raw()) {
            Some(Object::Event { set }) => Ok(*set),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn set_event(&self, event: vk::Event) -> VkResult<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        write_event(&mut state.objects, event.as_raw(), true);
        self.pump(&mut state);
        Ok(())
    }

    fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        write_event(&mut state.objects, event.as_raw(), false);
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.lock();
        let State {
            objects,
            command_buffers,
            ..
        } = &mut *state;
        let Some(Object::CommandPool { buffers }) = objects.get_mut(&pool.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let allocated: Vec<_> = (0..count).map(|_| mint()).collect();
        for &raw in &allocated {
            buffers.push(raw);
            command_buffers.insert(
                raw,
                Recording {
                    pool: pool.as_raw(),
                    ops: Vec::new(),
                },
            );
        }
        Ok(allocated.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, freed: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        for buffer in freed {
            state.command_buffers.remove(&buffer.as_raw());
        }
        if let Some(Object::CommandPool { buffers }) = state.objects.get_mut(&pool.as_raw()) {
            buffers.retain(|raw| !freed.iter().any(|b| b.as_raw() == *raw));
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.lock();
        for recording in state.command_buffers.values_mut() {
            if recording.pool == pool.as_raw() {
                recording.ops.clear();
            }
        }
        Ok(())
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.lock();
        let recording = state
            .command_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        recording.ops.clear();
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let state = self.lock();
        if state.command_buffers.contains_key(&buffer.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn record(&self, buffer: vk::CommandBuffer, command: Command<'_>) {
        let op = match command {
            Command::SetEvent(event, _) => Op::SetEvent(event.as_raw()),
            Command::ResetEvent(event, _) => Op::ResetEvent(event.as_raw()),
            Command::WaitEvents { events, .. } => {
                Op::WaitEvents(events.iter().map(|event| event.as_raw()).collect())
            }
        };
        let mut state = self.lock();
        match state.command_buffers.get_mut(&buffer.as_raw()) {
            Some(recording) => recording.ops.push(op),
            None => tracing::error!(?buffer, "recording into unknown command buffer"),
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.lock();
        let Some(Object::DescriptorPool {
            max_sets,
            allocated,
        }) = state.objects.get_mut(&pool.as_raw())
        else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let requested = layouts.len() as u32;
        if *max_sets - *allocated < requested {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        *allocated += requested;
        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(mint()))
            .collect())
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self.lock();
        if let Some(Object::DescriptorPool { allocated, .. }) =
            state.objects.get_mut(&pool.as_raw())
        {
            *allocated = 0;
        }
        Ok(())
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let state = self.lock();
        match state.objects.get(&swapchain.as_raw()) {
            Some(Object::Swapchain { images, .. }) => Ok(images.clone()),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let Some(Object::Swapchain { images, next }) = state.objects.get_mut(&swapchain.as_raw())
        else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let index = *next;
        *next = (index + 1) % (images.len().max(1) as u32);
        if semaphore != vk::Semaphore::null() {
            signal(&mut state.objects, semaphore.as_raw(), 1);
        }
        if fence != vk::Fence::null() {
            signal_fence(&mut state.objects, fence.as_raw());
        }
        self.pump(&mut state);
        Ok((index, false))
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let mut prepared = Vec::with_capacity(batches.len().max(1));
        for batch in batches {
            let mut ops = Vec::new();
            for buffer in batch.command_buffers {
                let recording = state
                    .command_buffers
                    .get(&buffer.as_raw())
                    .ok_or(vk::Result::ERROR_UNKNOWN)?;
                ops.extend(recording.ops.iter().cloned());
            }
            prepared.push(Batch::new(
                batch.waits.iter().map(|w| (w.0.as_raw(), w.1)).collect(),
                ops,
                batch.signals.iter().map(|s| (s.0.as_raw(), s.1)).collect(),
            ));
        }
        if fence != vk::Fence::null() {
            if prepared.is_empty() {
                prepared.push(Batch::new(SmallVec::new(), Vec::new(), SmallVec::new()));
            }
            if let Some(last) = prepared.last_mut() {
                last.fence = Some(fence.as_raw());
            }
        }
        let queue_state = state
            .queues
            .get_mut(&queue.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        queue_state.pending.extend(prepared);
        self.pump(&mut state);
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let raw = queue.as_raw();
        self.wait_until(u64::MAX, |state| {
            Ok(state
                .queues
                .get(&raw)
                .is_none_or(|queue| queue.pending.is_empty()))
        })?;
        Ok(())
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        waits: &[vk::Semaphore],
        _swapchain: vk::SwapchainKHR,
        _image_index: u32,
    ) -> VkResult<bool> {
        let mut state = self.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        // Presentation is ordered after earlier work on the queue and consumes its waits.
        let batch = Batch::new(
            waits.iter().map(|s| (s.as_raw(), 1)).collect(),
            Vec::new(),
            SmallVec::new(),
        );
        state
            .queues
            .get_mut(&queue.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?
            .pending
            .push_back(batch);
        self.pump(&mut state);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUsage;

    fn driver() -> (Arc<HeadlessShared>, HeadlessDriver) {
        let adapter = HeadlessAdapter::default();
        let map =
            MemoryTypeMap::new(&adapter.memory_types, &adapter.memory_heaps, adapter.device_type)
                .unwrap();
        let shared = Arc::new(HeadlessShared::new(adapter));
        let driver = HeadlessDriver::new(shared.clone(), map);
        (shared, driver)
    }

    fn timeline(driver: &HeadlessDriver) -> vk::Semaphore {
        vk::Semaphore::from_raw(
            driver
                .create_object(NativeInfo::Semaphore {
                    semaphore_type: vk::SemaphoreType::TIMELINE,
                    initial_value: 0,
                })
                .unwrap(),
        )
    }

    fn fence(driver: &HeadlessDriver) -> vk::Fence {
        vk::Fence::from_raw(
            driver
                .create_object(NativeInfo::Fence(&vk::FenceCreateInfo::default()))
                .unwrap(),
        )
    }

    #[test]
    fn live_objects_track_device_and_objects() {
        let (shared, driver) = driver();
        assert_eq!(shared.live_objects(), 1);
        let fence = fence(&driver);
        assert_eq!(shared.live_objects(), 2);
        driver.destroy_object(vk::ObjectType::FENCE, fence.as_raw());
        assert_eq!(shared.live_objects(), 1);
        drop(driver);
        assert_eq!(shared.live_objects(), 0);
    }

    #[test]
    fn submission_waits_for_timeline_value() {
        let (_shared, driver) = driver();
        let queue = driver.get_queue(0, 0);
        let semaphore = timeline(&driver);
        let fence = fence(&driver);

        let waits = [(semaphore, 5, vk::PipelineStageFlags::ALL_COMMANDS)];
        let batch = SubmitBatch {
            waits: &waits,
            command_buffers: &[],
            signals: &[],
        };
        driver.queue_submit(queue, &[batch], fence).unwrap();
        assert!(!driver.fence_status(fence).unwrap());

        driver.signal_semaphore(semaphore, 4).unwrap();
        assert!(!driver.fence_status(fence).unwrap());
        driver.signal_semaphore(semaphore, 5).unwrap();
        assert!(driver.wait_fence(fence, 0).unwrap());
        driver.queue_wait_idle(queue).unwrap();
    }

    #[test]
    fn command_buffer_blocks_on_event() {
        let (_shared, driver) = driver();
        let queue = driver.get_queue(0, 0);
        let pool = driver
            .create_object(NativeInfo::CommandPool(&vk::CommandPoolCreateInfo::default()))
            .map(vk::CommandPool::from_raw)
            .unwrap();
        let gate = driver
            .create_object(NativeInfo::Event(&vk::EventCreateInfo::default()))
            .map(vk::Event::from_raw)
            .unwrap();
        let done = driver
            .create_object(NativeInfo::Event(&vk::EventCreateInfo::default()))
            .map(vk::Event::from_raw)
            .unwrap();
        let cmd = driver
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        driver.begin_command_buffer(cmd).unwrap();
        driver.record(
            cmd,
            Command::WaitEvents {
                events: &[gate],
                src_stage_mask: vk::PipelineStageFlags::HOST,
                dst_stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            },
        );
        driver.record(cmd, Command::SetEvent(done, vk::PipelineStageFlags::ALL_COMMANDS));
        driver.end_command_buffer(cmd).unwrap();

        let fence = fence(&driver);
        let batch = SubmitBatch {
            waits: &[],
            command_buffers: &[cmd],
            signals: &[],
        };
        driver.queue_submit(queue, &[batch], fence).unwrap();
        assert!(!driver.event_status(done).unwrap());
        assert!(!driver.wait_fence(fence, 1_000).unwrap());

        driver.set_event(gate).unwrap();
        assert!(driver.event_status(done).unwrap());
        assert!(driver.fence_status(fence).unwrap());
    }

    #[test]
    fn host_wait_wakes_on_signal_from_another_thread() {
        let (_shared, driver) = driver();
        let driver = Arc::new(driver);
        let semaphore = timeline(&driver);
        let signaler = {
            let driver = driver.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                driver.signal_semaphore(semaphore, 3).unwrap();
            })
        };
        assert!(driver.wait_semaphore(semaphore, 3, u64::MAX).unwrap());
        signaler.join().unwrap();
        assert_eq!(driver.semaphore_value(semaphore).unwrap(), 3);
    }

    #[test]
    fn device_loss_fails_waits() {
        let (_shared, driver) = driver();
        let fence = fence(&driver);
        let event = vk::Event::from_raw(
            driver
                .create_object(NativeInfo::Event(&vk::EventCreateInfo::default()))
                .unwrap(),
        );
        assert!(driver.simulate_device_loss());
        assert_eq!(driver.wait_fence(fence, u64::MAX), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(driver.reset_fence(fence), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(driver.device_wait_idle(), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(driver.set_event(event), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(driver.reset_event(event), Err(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn heaps_are_accounted() {
        let (shared, driver) = driver();
        let upload = MemoryRequest {
            usage: MemoryUsage::Upload,
            committed: false,
        };
        let info = vk::BufferCreateInfo::default()
            .size(1024)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC);
        let (buffer, allocation) = driver.create_buffer(&info, upload).unwrap();
        assert!(allocation.mapped.is_some());
        assert_eq!(shared.heap_usage(1), 1024);
        driver.destroy_buffer(buffer, allocation);
        assert_eq!(shared.heap_usage(1), 0);

        let huge = vk::BufferCreateInfo::default()
            .size(512 * MB)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER);
        let gpu_only = MemoryRequest {
            usage: MemoryUsage::GpuOnly,
            committed: true,
        };
        assert_eq!(
            driver.create_buffer(&huge, gpu_only).err(),
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(shared.live_objects(), 1);
    }

    #[test]
    fn descriptor_pool_capacity() {
        let (_shared, driver) = driver();
        let pool = driver
            .create_object(NativeInfo::DescriptorPool(
                &vk::DescriptorPoolCreateInfo::default().max_sets(2),
            ))
            .map(vk::DescriptorPool::from_raw)
            .unwrap();
        let layout = vk::DescriptorSetLayout::from_raw(1);
        assert_eq!(driver.allocate_descriptor_sets(pool, &[layout, layout]).unwrap().len(), 2);
        assert_eq!(
            driver.allocate_descriptor_sets(pool, &[layout]).err(),
            Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        driver.reset_descriptor_pool(pool).unwrap();
        assert_eq!(driver.allocate_descriptor_sets(pool, &[layout]).unwrap().len(), 1);
    }
}
