//! Buffers bound to allocator memory.
//!
//! Memory placement is chosen by [`MemoryUsage`]:
//!
//! - [`MemoryUsage::GpuOnly`]: device-local memory. Use for anything written and
//!   read by the GPU only.
//! - [`MemoryUsage::Upload`]: host-visible memory the CPU writes once and the
//!   GPU reads, e.g. staging buffers and per-frame constants.
//! - [`MemoryUsage::Readback`]: host-visible, host-cached memory for data the
//!   CPU reads back.
//!
//! A buffer may also carry a [`BufferRole`]. The role adds its usage flag and
//! tightens the size limit where the device imposes one. Host-visible buffers
//! are persistently mapped; they are written and read through
//! [`Device::write_buffer`] and [`Device::read_buffer`].

use std::{fmt::Debug, ptr::NonNull};

use ash::vk;

use crate::{
    Device,
    driver::{Allocation, Driver, MemoryRequest},
    error::{Error, ResourceKind, Result},
    memory::MemoryUsage,
    store::{Managed, Resource},
    utils::AsVkHandle,
};

/// What a buffer is created for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// No role; only the usage flags given at creation apply.
    #[default]
    General,
    Index,
    Vertex,
    /// Uniform buffer, limited to `max_uniform_buffer_range` bytes.
    Constant,
    /// Storage buffer, limited to `max_storage_buffer_range` bytes.
    Storage,
    Indirect,
}

impl BufferRole {
    /// The usage flag implied by the role.
    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferRole::General => vk::BufferUsageFlags::empty(),
            BufferRole::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferRole::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferRole::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferRole::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferRole::Indirect => vk::BufferUsageFlags::INDIRECT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferCreateInfo {
    /// Size in bytes. Must be non-zero.
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
    /// Request a dedicated allocation instead of a suballocation.
    pub committed: bool,
    pub role: BufferRole,
}

impl BufferCreateInfo {
    fn effective_usage(&self) -> vk::BufferUsageFlags {
        self.usage | self.role.usage()
    }
}

pub struct Buffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory: MemoryUsage,
    committed: bool,
    role: BufferRole,
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory", &self.memory)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl Buffer {
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags, including the flag implied by the role.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Whether the buffer is persistently mapped into host memory.
    pub fn is_host_visible(&self) -> bool {
        self.allocation.mapped.is_some()
    }

    pub(crate) fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Pointer to `len` mapped bytes at `offset`.
    pub(crate) fn mapped_range(&self, offset: u64, len: u64) -> Result<NonNull<u8>> {
        let mapped = self.allocation.mapped.ok_or_else(|| {
            Error::invalid(ResourceKind::Buffer, "buffer memory is not host-visible")
        })?;
        let in_range = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size);
        if !in_range {
            return Err(Error::invalid(
                ResourceKind::Buffer,
                format!(
                    "range {offset}..{} exceeds the buffer size {}",
                    offset.saturating_add(len),
                    self.size
                ),
            ));
        }
        // In range of a live mapping of at least `size` bytes.
        Ok(unsafe { mapped.add(offset as usize) })
    }
}

impl Resource for Buffer {
    type CreateInfo = BufferCreateInfo;
    const KIND: ResourceKind = ResourceKind::Buffer;
}

impl Managed for Buffer {
    fn validate(device: &Device, info: &BufferCreateInfo) -> Result<()> {
        let invalid = |reason: String| Err(Error::invalid(ResourceKind::Buffer, reason));
        if info.size == 0 {
            return invalid("size is zero".into());
        }
        if info.effective_usage().is_empty() {
            return invalid("usage is empty".into());
        }
        let limits = device.physical_device().limits();
        let limit = match info.role {
            BufferRole::Constant => Some((
                "max_uniform_buffer_range",
                limits.max_uniform_buffer_range,
            )),
            BufferRole::Storage => Some((
                "max_storage_buffer_range",
                limits.max_storage_buffer_range,
            )),
            _ => None,
        };
        if let Some((name, limit)) = limit
            && info.size > u64::from(limit)
        {
            return invalid(format!(
                "{:?} buffer of {} bytes exceeds {name} ({limit})",
                info.role, info.size
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: BufferCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let usage = info.effective_usage();
        let (buffer, allocation) = driver
            .create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(info.size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                MemoryRequest {
                    usage: info.memory,
                    committed: info.committed,
                },
            )
            .map_err(Error::creation(ResourceKind::Buffer))?;
        Ok(Self {
            buffer,
            allocation,
            size: info.size,
            usage,
            memory: info.memory,
            committed: info.committed,
            role: info.role,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy_buffer(self.buffer, self.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::device;

    #[test]
    fn zero_sized_and_usageless_buffers_are_rejected() {
        let mut device = device();
        assert!(matches!(
            device.create_buffer(BufferCreateInfo {
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                ..Default::default()
            }),
            Err(Error::InvalidParams {
                kind: ResourceKind::Buffer,
                ..
            })
        ));
        assert!(matches!(
            device.create_buffer(BufferCreateInfo {
                size: 16,
                ..Default::default()
            }),
            Err(Error::InvalidParams { .. })
        ));
        // The role alone supplies a usage flag.
        let handle = device
            .create_storage_buffer(BufferCreateInfo {
                size: 16,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            device.get(handle).unwrap().usage(),
            vk::BufferUsageFlags::STORAGE_BUFFER
        );
        assert_eq!(device.count::<Buffer>(), 1);
    }

    #[test]
    fn storage_buffers_respect_the_range_limit() {
        let mut device = device();
        let limit = u64::from(device.physical_device().limits().max_storage_buffer_range);
        let info = |size| BufferCreateInfo {
            size,
            ..Default::default()
        };
        assert!(device.create_storage_buffer(info(limit + 1)).is_err());
        // The same size is fine without the storage role.
        device
            .create_buffer(BufferCreateInfo {
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                ..info(limit + 1)
            })
            .unwrap();
    }

    #[test]
    fn placement_follows_memory_usage() {
        let mut device = device();
        let create = |device: &mut Device, memory, committed| {
            device
                .create_buffer(BufferCreateInfo {
                    size: 64,
                    usage: vk::BufferUsageFlags::TRANSFER_SRC,
                    memory,
                    committed,
                    ..Default::default()
                })
                .unwrap()
        };
        let private = create(&mut device, MemoryUsage::GpuOnly, false);
        let upload = create(&mut device, MemoryUsage::Upload, true);
        let readback = create(&mut device, MemoryUsage::Readback, false);
        assert!(!device.get(private).unwrap().is_host_visible());
        let upload = device.get(upload).unwrap();
        assert!(upload.is_host_visible());
        assert!(upload.is_committed());
        assert_eq!(upload.memory_usage(), MemoryUsage::Upload);
        assert!(device.get(readback).unwrap().is_host_visible());
    }
}
