//! Logical device creation and the object store.
//!
//! A [`Device`] owns one logical device, its allocator context, the queues
//! requested at creation and every object created through it. Objects are
//! never handed out: factories return a [`Handle`], a typed non-owning key
//! that the device resolves with [`Device::get`] and releases with
//! [`Device::destroy`].
//!
//! # Quick Start
//!
//! ```
//! # use basalt::prelude::*;
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
//! assert_eq!(device.get(buffer).unwrap().size(), 256);
//! device.destroy_buffer(buffer).unwrap();
//! ```
//!
//! # Uniform object contract
//!
//! Every kind implementing [`Resource`] goes through the same four calls:
//!
//! - [`create`](Device::create) validates the creation record, issues the
//!   native call and registers the object. Invalid records fail with
//!   [`Error::InvalidParams`] before anything is registered.
//! - [`destroy`](Device::destroy) fails with [`Error::NotOwned`] for handles
//!   this device did not issue or already destroyed.
//! - [`get`](Device::get) and [`count`](Device::count) read the store.
//! - [`create_many`](Device::create_many) and
//!   [`destroy_many`](Device::destroy_many) are all-or-nothing.
//!
//! Named entry points (`create_buffer`, `destroy_fence`, ...) forward to the
//! generic ones.
//!
//! # Teardown
//!
//! [`Device::teardown`] (also run on drop) waits for the queues, destroys
//! every remaining object with dependents first, then releases the allocator
//! and the logical device. Afterwards every call fails with
//! [`Error::AlreadyDestroyed`].

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    ffi::{CStr, CString},
    fmt::Debug,
};

use ash::vk::{self, Handle as _};

use crate::{
    buffer::{Buffer, BufferCreateInfo, BufferRole},
    command::CommandPool,
    descriptor::{DescriptorPool, DescriptorSetLayout},
    driver::{
        DriverRef,
        headless::HeadlessDriver,
        vulkan::{QueueFamilyRequest, VulkanDriver},
    },
    error::{Error, ResourceKind, Result},
    features::DeviceFeatures,
    handle::{DeviceId, Handle},
    image::{DepthStencilView, Image, ImageView, RenderTargetView, Texture},
    physical_device::{Backend, PhysicalDevice},
    pipeline::{ComputePipeline, GraphicsPipeline, PipelineCache, PipelineLayout},
    query::QueryPool,
    queue::Queue,
    render_pass::RenderPass,
    sampler::Sampler,
    shader::{ShaderModule, ShaderProgram},
    store::{Resource, Stores},
    swapchain::Swapchain,
    sync::{Event, Fence, Semaphore},
    utils::{AsVkHandle, Version},
};

/// Queues to create on one queue family.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRequest {
    /// The capability the queues are retrieved by. Must be a single flag
    /// supported by the family.
    pub queue_type: vk::QueueFlags,
    pub family_index: u32,
    /// One priority in `0.0..=1.0` per queue.
    pub priorities: Vec<f32>,
}

impl QueueRequest {
    /// `count` queues of equal priority.
    pub fn new(queue_type: vk::QueueFlags, family_index: u32, count: u32) -> Self {
        Self {
            queue_type,
            family_index,
            priorities: vec![1.0; count as usize],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceCreateInfo {
    pub queues: Vec<QueueRequest>,
    /// Device extensions to enable.
    pub extensions: Vec<CString>,
    pub features: DeviceFeatures,
}

pub struct Device {
    id: DeviceId,
    physical_device: PhysicalDevice,
    /// `None` once torn down.
    driver: Option<DriverRef>,
    extensions: BTreeSet<CString>,
    features: DeviceFeatures,
    queues: HashMap<(vk::QueueFlags, u32, u32), Queue>,
    stores: Stores,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id.as_u64())
            .field("physical_device", &self.physical_device)
            .field("objects", &self.stores.len())
            .field("destroyed", &self.driver.is_none())
            .finish()
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::invalid(ResourceKind::Device, reason)
}

fn validate_queues(physical_device: &PhysicalDevice, queues: &[QueueRequest]) -> Result<()> {
    if queues.is_empty() {
        return Err(invalid("at least one queue must be requested"));
    }
    let mut families = HashSet::new();
    for request in queues {
        let index = request.family_index;
        let family = physical_device
            .queue_family_properties(index)
            .map_err(|_| invalid(format!("queue family {index} does not exist")))?;
        if !families.insert(index) {
            return Err(invalid(format!("queue family {index} requested twice")));
        }
        if request.queue_type.as_raw().count_ones() != 1 {
            return Err(invalid(format!(
                "queue type {:?} is not a single capability",
                request.queue_type
            )));
        }
        if !family.flags.contains(request.queue_type) {
            return Err(invalid(format!(
                "queue family {index} does not support {:?}",
                request.queue_type
            )));
        }
        let count = request.priorities.len() as u32;
        if count == 0 || count > family.queue_count {
            return Err(invalid(format!(
                "{count} queues requested from family {index}, which has {}",
                family.queue_count
            )));
        }
        if let Some(priority) = request
            .priorities
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(invalid(format!("queue priority {priority} is out of range")));
        }
    }
    Ok(())
}

impl Device {
    /// Creates a logical device on `physical_device`.
    ///
    /// Fails with [`Error::UnsupportedFeature`] if a requested extension or
    /// feature is missing, and with [`Error::InvalidParams`] for malformed
    /// queue requests.
    pub fn new(physical_device: &PhysicalDevice, info: DeviceCreateInfo) -> Result<Self> {
        validate_queues(physical_device, &info.queues)?;
        if let Some(missing) = info
            .extensions
            .iter()
            .find(|name| !physical_device.supports_extension(name))
        {
            tracing::warn!(extension = ?missing, "device extension not supported");
            return Err(Error::UnsupportedFeature(format!(
                "device extension {missing:?}"
            )));
        }
        let missing = info.features - physical_device.features();
        if !missing.is_empty() {
            tracing::warn!(features = %missing.names(), "device features not supported");
            return Err(Error::UnsupportedFeature(format!(
                "device features {}",
                missing.names()
            )));
        }

        let driver: DriverRef = match physical_device.backend() {
            Backend::Vulkan { instance } => {
                if info.features.contains(DeviceFeatures::TIMELINE_SEMAPHORE)
                    && instance.api_version() < Version::V1_2
                {
                    return Err(Error::UnsupportedFeature(
                        "timeline semaphores need an instance created for Vulkan 1.2".into(),
                    ));
                }
                let families: Vec<_> = info
                    .queues
                    .iter()
                    .map(|request| QueueFamilyRequest {
                        family_index: request.family_index,
                        priorities: &request.priorities,
                    })
                    .collect();
                let driver = VulkanDriver::new(
                    instance,
                    physical_device.vk_handle(),
                    &families,
                    &info.extensions,
                    info.features,
                )
                .map_err(Error::creation(ResourceKind::Device))?;
                std::sync::Arc::new(driver)
            }
            Backend::Headless(shared) => std::sync::Arc::new(HeadlessDriver::new(
                shared.clone(),
                *physical_device.memory_type_map(),
            )),
        };

        let mut queues = HashMap::new();
        for request in &info.queues {
            for index in 0..request.priorities.len() as u32 {
                let raw = driver.get_queue(request.family_index, index);
                let queue = Queue::new(
                    driver.clone(),
                    raw,
                    request.queue_type,
                    request.family_index,
                    index,
                );
                queues.insert((request.queue_type, request.family_index, index), queue);
            }
        }

        let id = DeviceId::next();
        tracing::info!(
            id = id.as_u64(),
            device = ?driver.raw_device(),
            adapter = %physical_device.descriptive_name(),
            queues = queues.len(),
            "create device"
        );
        Ok(Self {
            id,
            physical_device: physical_device.clone(),
            driver: Some(driver),
            extensions: info.extensions.into_iter().collect(),
            features: info.features,
            queues,
            stores: Stores::default(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    /// Features enabled at creation.
    pub fn enabled_features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.contains(name)
    }

    pub fn enabled_extensions(&self) -> impl Iterator<Item = &CStr> {
        self.extensions.iter().map(CString::as_c_str)
    }

    /// The native logical device handle.
    pub fn raw(&self) -> Result<vk::Device> {
        Ok(self.driver()?.raw_device())
    }

    pub fn is_destroyed(&self) -> bool {
        self.driver.is_none()
    }

    pub(crate) fn driver(&self) -> Result<&DriverRef> {
        self.driver.as_ref().ok_or(Error::AlreadyDestroyed)
    }

    /// Fails with [`Error::NotFound`] unless the queue was requested at creation.
    pub fn get_queue(
        &self,
        queue_type: vk::QueueFlags,
        family_index: u32,
        queue_index: u32,
    ) -> Result<&Queue> {
        self.driver()?;
        self.queues
            .get(&(queue_type, family_index, queue_index))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{queue_type:?} queue {queue_index} of family {family_index}"
                ))
            })
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    /// Whether queues were requested from `family_index`.
    pub fn has_queue_family(&self, family_index: u32) -> bool {
        self.queues
            .keys()
            .any(|&(_, family, _)| family == family_index)
    }

    /// Blocks until all submitted work on every queue completes.
    pub fn wait_idle(&self) -> Result<()> {
        self.driver()?.device_wait_idle()?;
        Ok(())
    }

    /// Marks a headless device as lost. Fails with
    /// [`Error::UnsupportedFeature`] on real hardware.
    pub fn simulate_device_loss(&self) -> Result<()> {
        if self.driver()?.simulate_device_loss() {
            Ok(())
        } else {
            Err(Error::UnsupportedFeature(
                "device loss can only be simulated on headless devices".into(),
            ))
        }
    }

    /// Creates an object of kind `K` and registers it in the kind's store.
    pub fn create<K: Resource>(&mut self, info: K::CreateInfo) -> Result<Handle<K>> {
        self.driver()?;
        K::validate(self, &info)?;
        let object = K::create(self, info)?;
        Ok(self.register(object))
    }

    fn register<K: Resource>(&mut self, object: K) -> Handle<K> {
        let raw = object.vk_handle();
        let key = K::store_mut(&mut self.stores).insert(object);
        tracing::debug!(kind = %K::KIND, raw = raw.as_raw(), "create");
        Handle::new(self.id, key, raw)
    }

    /// Destroys the object behind `handle`.
    pub fn destroy<K: Resource>(&mut self, handle: Handle<K>) -> Result<()> {
        let driver = self.driver()?.clone();
        if handle.device != self.id {
            return Err(Error::NotOwned { kind: K::KIND });
        }
        let object = K::store_mut(&mut self.stores)
            .remove(handle.key)
            .ok_or(Error::NotOwned { kind: K::KIND })?;
        tracing::debug!(kind = %K::KIND, raw = handle.raw().as_raw(), "destroy");
        object.destroy(&*driver);
        Ok(())
    }

    /// Resolves a handle issued by this device.
    pub fn get<K: Resource>(&self, handle: Handle<K>) -> Result<&K> {
        self.driver()?;
        if handle.device != self.id {
            return Err(Error::NotOwned { kind: K::KIND });
        }
        K::store(&self.stores)
            .get(handle.key)
            .ok_or(Error::NotOwned { kind: K::KIND })
    }

    pub fn get_mut<K: Resource>(&mut self, handle: Handle<K>) -> Result<&mut K> {
        self.driver()?;
        if handle.device != self.id {
            return Err(Error::NotOwned { kind: K::KIND });
        }
        K::store_mut(&mut self.stores)
            .get_mut(handle.key)
            .ok_or(Error::NotOwned { kind: K::KIND })
    }

    /// Whether `handle` refers to a live object of this device.
    pub fn contains<K: Resource>(&self, handle: Handle<K>) -> bool {
        handle.device == self.id && K::store(&self.stores).contains_key(handle.key)
    }

    /// Number of live objects of kind `K`.
    pub fn count<K: Resource>(&self) -> usize {
        K::store(&self.stores).len()
    }

    /// Number of live objects across every kind.
    pub fn object_count(&self) -> usize {
        self.stores.len()
    }

    /// Creates one object per record, or none.
    ///
    /// Every record is validated before the first native call; if a native
    /// creation fails, the objects created so far are destroyed again. The
    /// error is the one the failing record would produce on its own.
    pub fn create_many<K: Resource>(
        &mut self,
        infos: impl IntoIterator<Item = K::CreateInfo>,
    ) -> Result<Vec<Handle<K>>> {
        let driver = self.driver()?.clone();
        let infos: Vec<_> = infos.into_iter().collect();
        for info in &infos {
            K::validate(self, info)?;
        }
        let mut created = Vec::with_capacity(infos.len());
        for info in infos {
            match K::create(self, info) {
                Ok(object) => created.push(object),
                Err(err) => {
                    tracing::debug!(
                        kind = %K::KIND,
                        rolled_back = created.len(),
                        "bulk create failed"
                    );
                    for object in created {
                        object.destroy(&*driver);
                    }
                    return Err(err);
                }
            }
        }
        Ok(created
            .into_iter()
            .map(|object| self.register(object))
            .collect())
    }

    /// Destroys every object in `handles`, or none.
    ///
    /// Fails with [`Error::NotOwned`] if any handle is foreign, stale or
    /// repeated; nothing is destroyed in that case.
    pub fn destroy_many<K: Resource>(&mut self, handles: &[Handle<K>]) -> Result<()> {
        let driver = self.driver()?.clone();
        let mut seen = HashSet::with_capacity(handles.len());
        for handle in handles {
            if !self.contains(*handle) || !seen.insert(handle.key) {
                return Err(Error::NotOwned { kind: K::KIND });
            }
        }
        let store = K::store_mut(&mut self.stores);
        for handle in handles {
            if let Some(object) = store.remove(handle.key) {
                object.destroy(&*driver);
            }
        }
        tracing::debug!(kind = %K::KIND, count = handles.len(), "destroy");
        Ok(())
    }

    fn create_buffer_with_role(
        &mut self,
        role: BufferRole,
        info: BufferCreateInfo,
    ) -> Result<Handle<Buffer>> {
        self.create::<Buffer>(BufferCreateInfo { role, ..info })
    }

    fn destroy_buffer_with_role(&mut self, role: BufferRole, handle: Handle<Buffer>) -> Result<()> {
        let actual = self.get(handle)?.role();
        if actual != role {
            return Err(Error::invalid(
                ResourceKind::Buffer,
                format!("buffer is a {actual:?} buffer, not a {role:?} buffer"),
            ));
        }
        self.destroy(handle)
    }

    pub fn create_descriptor_set_layouts(
        &mut self,
        infos: impl IntoIterator<Item = <DescriptorSetLayout as Resource>::CreateInfo>,
    ) -> Result<Vec<Handle<DescriptorSetLayout>>> {
        self.create_many(infos)
    }

    pub fn destroy_descriptor_set_layouts(
        &mut self,
        handles: &[Handle<DescriptorSetLayout>],
    ) -> Result<()> {
        self.destroy_many(handles)
    }

    /// Copies `data` into a host-visible buffer at `offset`.
    pub fn write_buffer(&mut self, handle: Handle<Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        let driver = self.driver()?.clone();
        let buffer = self.get(handle)?;
        let mapped = buffer.mapped_range(offset, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr(), data.len());
        }
        driver.flush_allocation(buffer.allocation(), offset, data.len() as u64)?;
        Ok(())
    }

    /// Reads `len` bytes at `offset` from a host-visible buffer.
    pub fn read_buffer(&self, handle: Handle<Buffer>, offset: u64, len: usize) -> Result<Vec<u8>> {
        let driver = self.driver()?;
        let buffer = self.get(handle)?;
        let mapped = buffer.mapped_range(offset, len as u64)?;
        driver.invalidate_allocation(buffer.allocation(), offset, len as u64)?;
        let mut data = vec![0; len];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr(), data.as_mut_ptr(), len);
        }
        Ok(data)
    }

    /// Destroys every owned object, then the queues, the allocator context and
    /// the logical device. Calling it again is a no-op.
    pub fn teardown(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        driver.quiesce();
        let remaining = self.stores.drain(&*driver);
        if remaining > 0 {
            tracing::warn!(id = self.id.as_u64(), remaining, "device destroyed with live objects");
        }
        self.queues.clear();
        tracing::info!(id = self.id.as_u64(), device = ?driver.raw_device(), "destroy device");
        drop(driver);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();
    }
}

macro_rules! named_entry_points {
    ($($kind:ty => $create:ident, $destroy:ident;)*) => {
        impl Device {
            $(
                #[doc = concat!("Creates a [`", stringify!($kind), "`]. See [`Device::create`].")]
                pub fn $create(
                    &mut self,
                    info: <$kind as Resource>::CreateInfo,
                ) -> Result<Handle<$kind>> {
                    self.create::<$kind>(info)
                }

                pub fn $destroy(&mut self, handle: Handle<$kind>) -> Result<()> {
                    self.destroy(handle)
                }
            )*
        }
    };
}

named_entry_points! {
    Buffer => create_buffer, destroy_buffer;
    Image => create_image, destroy_image;
    ImageView => create_image_view, destroy_image_view;
    Texture => create_texture, destroy_texture;
    RenderTargetView => create_render_target_view, destroy_render_target_view;
    DepthStencilView => create_depth_stencil_view, destroy_depth_stencil_view;
    Sampler => create_sampler, destroy_sampler;
    ShaderModule => create_shader_module, destroy_shader_module;
    ShaderProgram => create_shader_program, destroy_shader_program;
    DescriptorSetLayout => create_descriptor_set_layout, destroy_descriptor_set_layout;
    DescriptorPool => create_descriptor_pool, destroy_descriptor_pool;
    PipelineLayout => create_pipeline_layout, destroy_pipeline_layout;
    PipelineCache => create_pipeline_cache, destroy_pipeline_cache;
    ComputePipeline => create_compute_pipeline, destroy_compute_pipeline;
    GraphicsPipeline => create_graphics_pipeline, destroy_graphics_pipeline;
    RenderPass => create_render_pass, destroy_render_pass;
    QueryPool => create_query_pool, destroy_query_pool;
    CommandPool => create_command_pool, destroy_command_pool;
    Swapchain => create_swapchain, destroy_swapchain;
    Event => create_event, destroy_event;
    Fence => create_fence, destroy_fence;
    Semaphore => create_semaphore, destroy_semaphore;
}

macro_rules! buffer_roles {
    ($($role:ident => $create:ident, $destroy:ident;)*) => {
        impl Device {
            $(
                #[doc = concat!(
                    "Creates a buffer in the ",
                    stringify!($role),
                    " role. The role's usage flag is added to `info.usage`."
                )]
                pub fn $create(&mut self, info: BufferCreateInfo) -> Result<Handle<Buffer>> {
                    self.create_buffer_with_role(BufferRole::$role, info)
                }

                #[doc = concat!(
                    "Destroys a buffer created by [`Device::",
                    stringify!($create),
                    "`]."
                )]
                pub fn $destroy(&mut self, handle: Handle<Buffer>) -> Result<()> {
                    self.destroy_buffer_with_role(BufferRole::$role, handle)
                }
            )*
        }
    };
}

buffer_roles! {
    Index => create_index_buffer, destroy_index_buffer;
    Vertex => create_vertex_buffer, destroy_vertex_buffer;
    Constant => create_constant_buffer, destroy_constant_buffer;
    Storage => create_storage_buffer, destroy_storage_buffer;
    Indirect => create_indirect_buffer, destroy_indirect_buffer;
}
