//! Descriptor set layouts and descriptor pools.
//!
//! Writing descriptors into the allocated sets is left to the caller; the
//! raw `vk::DescriptorSet` handles are returned for that purpose.
//!
//! # Example
//!
//! ```
//! # use basalt::prelude::*;
//! # let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
//! # let mut device = Device::new(&gpu, DeviceCreateInfo {
//! #     queues: vec![QueueRequest::new(vk::QueueFlags::COMPUTE, 1, 1)],
//! #     ..Default::default()
//! # }).unwrap();
//! // A layout with a single storage buffer binding
//! let layout = device
//!     .create_descriptor_set_layout(DescriptorSetLayoutCreateInfo {
//!         bindings: vec![vk::DescriptorSetLayoutBinding {
//!             binding: 0,
//!             descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
//!             descriptor_count: 1,
//!             stage_flags: vk::ShaderStageFlags::COMPUTE,
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! // A pool for one set
//! let pool = device
//!     .create_descriptor_pool(DescriptorPoolCreateInfo {
//!         max_sets: 1,
//!         pool_sizes: vec![vk::DescriptorPoolSize {
//!             ty: vk::DescriptorType::STORAGE_BUFFER,
//!             descriptor_count: 1,
//!         }],
//!         ..Default::default()
//!     })
//!     .unwrap();
//! let sets = device
//!     .get(pool)
//!     .unwrap()
//!     .allocate_sets(&[device.get(layout).unwrap()])
//!     .unwrap();
//! assert_eq!(sets.len(), 1);
//! ```

use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{Mutex, PoisonError},
};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device,
    driver::{Driver, DriverRef, NativeInfo},
    error::{Error, ResourceKind, Result},
    store::{Managed, Resource},
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutCreateInfo {
    /// Binding numbers must be unique.
    pub bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    pub flags: vk::DescriptorSetLayoutCreateFlags,
}

/// A descriptor set layout.
pub struct DescriptorSetLayout {
    handle: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

// Immutable sampler pointers are never stored.
unsafe impl Send for DescriptorSetLayout {}
unsafe impl Sync for DescriptorSetLayout {}

impl Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl DescriptorSetLayout {
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl AsVkHandle for DescriptorSetLayout {
    type Handle = vk::DescriptorSetLayout;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for DescriptorSetLayout {
    type CreateInfo = DescriptorSetLayoutCreateInfo;
    const KIND: ResourceKind = ResourceKind::DescriptorSetLayout;
}

impl Managed for DescriptorSetLayout {
    fn validate(_: &Device, info: &DescriptorSetLayoutCreateInfo) -> Result<()> {
        let mut seen = HashSet::with_capacity(info.bindings.len());
        if let Some(duplicate) = info.bindings.iter().find(|b| !seen.insert(b.binding)) {
            return Err(Error::invalid(
                ResourceKind::DescriptorSetLayout,
                format!("binding {} declared twice", duplicate.binding),
            ));
        }
        if info
            .bindings
            .iter()
            .any(|b| !b.p_immutable_samplers.is_null())
        {
            return Err(Error::invalid(
                ResourceKind::DescriptorSetLayout,
                "immutable samplers are not supported",
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: DescriptorSetLayoutCreateInfo) -> Result<Self> {
        let raw = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(info.flags)
            .bindings(&info.bindings);
        let handle = device
            .driver()?
            .create(NativeInfo::DescriptorSetLayout(&raw))
            .map_err(Error::creation(ResourceKind::DescriptorSetLayout))?;
        Ok(Self {
            handle,
            bindings: info.bindings,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolCreateInfo {
    /// Must be non-zero.
    pub max_sets: u32,
    /// Every size must have a non-zero count.
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub flags: vk::DescriptorPoolCreateFlags,
}

/// A pool descriptor sets are allocated from.
///
/// Sets are released all at once by [`DescriptorPool::reset`] or when the pool
/// is destroyed.
pub struct DescriptorPool {
    driver: DriverRef,
    handle: vk::DescriptorPool,
    max_sets: u32,
    /// Sets allocated since the last reset. Also serializes native pool access.
    allocated: Mutex<u32>,
}

impl Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("max_sets", &self.max_sets)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn allocated_sets(&self) -> u32 {
        *self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates one set per layout.
    ///
    /// Fails with `Error::Vulkan(ERROR_OUT_OF_POOL_MEMORY)` when the pool is
    /// exhausted.
    pub fn allocate_sets(
        &self,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let raw: SmallVec<[vk::DescriptorSetLayout; 4]> =
            layouts.iter().map(|layout| layout.vk_handle()).collect();
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let sets = self.driver.allocate_descriptor_sets(self.handle, &raw)?;
        *allocated += sets.len() as u32;
        Ok(sets)
    }

    pub fn allocate_one(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let mut sets = self.allocate_sets(&[layout])?;
        sets.pop()
            .ok_or(Error::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    /// Returns every set to the pool. Handles allocated earlier become invalid.
    pub fn reset(&self) -> Result<()> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.reset_descriptor_pool(self.handle)?;
        *allocated = 0;
        Ok(())
    }
}

impl AsVkHandle for DescriptorPool {
    type Handle = vk::DescriptorPool;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for DescriptorPool {
    type CreateInfo = DescriptorPoolCreateInfo;
    const KIND: ResourceKind = ResourceKind::DescriptorPool;
}

impl Managed for DescriptorPool {
    fn validate(_: &Device, info: &DescriptorPoolCreateInfo) -> Result<()> {
        if info.max_sets == 0 {
            return Err(Error::invalid(ResourceKind::DescriptorPool, "max_sets is zero"));
        }
        if let Some(size) = info.pool_sizes.iter().find(|s| s.descriptor_count == 0) {
            return Err(Error::invalid(
                ResourceKind::DescriptorPool,
                format!("pool size for {:?} has a zero count", size.ty),
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: DescriptorPoolCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let raw = vk::DescriptorPoolCreateInfo::default()
            .flags(info.flags)
            .max_sets(info.max_sets)
            .pool_sizes(&info.pool_sizes);
        let handle = driver
            .create(NativeInfo::DescriptorPool(&raw))
            .map_err(Error::creation(ResourceKind::DescriptorPool))?;
        Ok(Self {
            driver: driver.clone(),
            handle,
            max_sets: info.max_sets,
            allocated: Mutex::new(0),
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::device;

    fn binding(binding: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
            ..Default::default()
        }
    }

    fn layout(bindings: &[u32]) -> DescriptorSetLayoutCreateInfo {
        DescriptorSetLayoutCreateInfo {
            bindings: bindings.iter().copied().map(binding).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn binding_numbers_are_unique() {
        let mut device = device();
        assert!(matches!(
            device.create_descriptor_set_layout(layout(&[0, 1, 0])),
            Err(Error::InvalidParams {
                kind: ResourceKind::DescriptorSetLayout,
                ..
            })
        ));
        let handle = device.create_descriptor_set_layout(layout(&[2, 0])).unwrap();
        let created = device.get(handle).unwrap();
        assert_eq!(created.bindings().len(), 2);
        assert!(created.binding(2).is_some());
        assert!(created.binding(1).is_none());
    }

    #[test]
    fn layouts_in_bulk() {
        let mut device = device();
        assert!(
            device
                .create_descriptor_set_layouts([layout(&[0]), layout(&[1, 1])])
                .is_err()
        );
        assert_eq!(device.count::<DescriptorSetLayout>(), 0);
        let handles = device
            .create_descriptor_set_layouts([layout(&[0]), layout(&[0, 1]), layout(&[])])
            .unwrap();
        assert_eq!(device.count::<DescriptorSetLayout>(), 3);
        device.destroy_descriptor_set_layouts(&handles).unwrap();
        assert_eq!(device.count::<DescriptorSetLayout>(), 0);
    }

    #[test]
    fn pool_preconditions_and_capacity() {
        let mut device = device();
        let pool = |max_sets, count| DescriptorPoolCreateInfo {
            max_sets,
            pool_sizes: vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            }],
            ..Default::default()
        };
        assert!(device.create_descriptor_pool(pool(0, 4)).is_err());
        assert!(device.create_descriptor_pool(pool(2, 0)).is_err());
        assert_eq!(device.count::<DescriptorPool>(), 0);

        let handle = device.create_descriptor_pool(pool(2, 4)).unwrap();
        let set_layout = device.create_descriptor_set_layout(layout(&[0])).unwrap();
        let (pool, set_layout) = (device.get(handle).unwrap(), device.get(set_layout).unwrap());
        assert_eq!(pool.allocate_sets(&[set_layout, set_layout]).unwrap().len(), 2);
        assert_eq!(pool.allocated_sets(), 2);
        assert_eq!(
            pool.allocate_one(set_layout),
            Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        );
        pool.reset().unwrap();
        assert_eq!(pool.allocated_sets(), 0);
        pool.allocate_one(set_layout).unwrap();
    }
}
