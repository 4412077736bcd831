//! Memory placement for buffers and images.
//!
//! Every memory-backed object asks for one of the [`MemoryUsage`] strategies.
//! The Vulkan backend forwards the strategy to VMA; the headless backend
//! resolves it to a concrete memory type through [`MemoryTypeMap`], which is
//! computed once per physical device from its heaps and types.

use ash::vk;

use crate::error::{Error, Result};

/// How the host intends to access a memory-backed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// Only the device touches the memory.
    #[default]
    GpuOnly,
    /// The host writes sequentially, the device reads.
    Upload,
    /// The device writes, the host reads back.
    Readback,
}

impl MemoryUsage {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

/// Memory type index chosen for each allocation strategy.
///
/// The choice accounts for the layouts seen in practice:
///
/// - **Unified memory** (Intel, Apple, mobile): one heap, every type device local
///   and host visible.
/// - **Discrete without resizable BAR**: VRAM is not host visible, uploads need
///   staging through system memory.
/// - **256MB BAR**: a small host-visible window into VRAM, good for uniforms only.
/// - **Resizable BAR**: all of VRAM is host visible.
/// - **APU carve-out**: a small device-local heap while the GPU mostly lives in
///   system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeMap {
    /// Device-local memory, preferring types the host cannot see.
    pub private: u32,
    /// Host-visible staging memory, preferring coherent write-combined types.
    pub host: u32,
    /// Host-visible cached memory for readback.
    pub dynamic: u32,
    /// Memory for data the host writes and the device reads.
    pub upload: u32,
    /// Whether `upload` is host visible. When false, uploads need a staging copy.
    pub upload_host_visible: bool,
    /// Device-local host-visible memory for uniforms, if the device has any.
    pub uniform: Option<u32>,
}

const SMALL_HEAP: vk::DeviceSize = 256 * 1024 * 1024;

impl MemoryTypeMap {
    pub fn new(
        memory_types: &[vk::MemoryType],
        memory_heaps: &[vk::MemoryHeap],
        device_type: vk::PhysicalDeviceType,
    ) -> Result<Self> {
        use vk::MemoryPropertyFlags as F;

        let heap_size = |mt: &vk::MemoryType| {
            memory_heaps
                .get(mt.heap_index as usize)
                .map_or(0, |heap| heap.size)
        };
        // Ties resolve to the lowest index.
        let best = |required: F, rank: &dyn Fn(&vk::MemoryType) -> (bool, bool, bool, u64)| {
            memory_types
                .iter()
                .enumerate()
                .rev()
                .filter(|(_, mt)| mt.property_flags.contains(required))
                .max_by_key(|(_, mt)| rank(mt))
                .map(|(i, _)| i as u32)
        };
        let missing = |what: &str| {
            Error::UnsupportedFeature(format!("the device has no {what} memory type"))
        };

        let private = best(F::DEVICE_LOCAL, &|mt| {
            let pure = !mt.property_flags.contains(F::HOST_VISIBLE);
            (pure, false, false, heap_size(mt))
        })
        .ok_or_else(|| missing("DEVICE_LOCAL"))?;

        let host = best(F::HOST_VISIBLE, &|mt| {
            let f = mt.property_flags;
            (
                f.contains(F::HOST_COHERENT),
                !f.contains(F::HOST_CACHED),
                !f.contains(F::DEVICE_LOCAL),
                heap_size(mt),
            )
        })
        .ok_or_else(|| missing("HOST_VISIBLE"))?;

        let dynamic = best(F::HOST_VISIBLE | F::HOST_CACHED, &|mt| {
            let f = mt.property_flags;
            (
                f.contains(F::DEVICE_LOCAL),
                f.contains(F::HOST_COHERENT),
                false,
                heap_size(mt),
            )
        })
        .ok_or_else(|| missing("HOST_CACHED"))?;

        let bar = best(F::DEVICE_LOCAL | F::HOST_VISIBLE, &|mt| {
            (false, false, false, heap_size(mt))
        });
        let integrated = device_type == vk::PhysicalDeviceType::INTEGRATED_GPU;
        let (upload, upload_host_visible) = match bar {
            Some(index) if heap_size(&memory_types[index as usize]) > SMALL_HEAP => (index, true),
            // APU carve-out: the GPU reads system memory directly.
            Some(_) if integrated => (host, true),
            Some(_) => (private, false),
            None if integrated => (host, false),
            None => (private, false),
        };

        Ok(Self {
            private,
            host,
            dynamic,
            upload,
            upload_host_visible,
            uniform: bar,
        })
    }

    /// The memory type an allocation with `usage` lands in.
    pub fn select(&self, usage: MemoryUsage) -> u32 {
        match usage {
            MemoryUsage::GpuOnly => self.private,
            MemoryUsage::Upload if self.upload_host_visible => self.upload,
            MemoryUsage::Upload => self.host,
            MemoryUsage::Readback => self.dynamic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const HCA: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;

    fn ty(heap_index: u32, property_flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags,
            heap_index,
        }
    }

    fn heap(size: u64, device_local: bool) -> vk::MemoryHeap {
        vk::MemoryHeap {
            size,
            flags: if device_local {
                vk::MemoryHeapFlags::DEVICE_LOCAL
            } else {
                vk::MemoryHeapFlags::empty()
            },
        }
    }

    #[test]
    fn unified_memory() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL | HV | HC | HCA)],
            &[heap(16 * GB, true)],
            vk::PhysicalDeviceType::INTEGRATED_GPU,
        )
        .unwrap();
        assert_eq!((map.private, map.host, map.dynamic, map.upload), (0, 0, 0, 0));
        assert!(map.upload_host_visible);
        assert_eq!(map.uniform, Some(0));
    }

    #[test]
    fn discrete_without_bar() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL), ty(1, HV | HC), ty(1, HV | HC | HCA)],
            &[heap(10 * GB, true), heap(32 * GB, false)],
            vk::PhysicalDeviceType::DISCRETE_GPU,
        )
        .unwrap();
        assert_eq!(map.private, 0);
        assert_eq!(map.host, 1);
        assert_eq!(map.dynamic, 2);
        assert_eq!(map.upload, 0);
        assert!(!map.upload_host_visible);
        assert_eq!(map.uniform, None);
        assert_eq!(map.select(MemoryUsage::Upload), 1, "uploads stage through host memory");
    }

    #[test]
    fn resizable_bar() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL), ty(0, DL | HV | HC), ty(1, HV | HC), ty(1, HV | HC | HCA)],
            &[heap(16 * GB, true), heap(16 * GB, false)],
            vk::PhysicalDeviceType::DISCRETE_GPU,
        )
        .unwrap();
        assert_eq!(map.private, 0, "pure VRAM preferred for private data");
        assert_eq!(map.host, 2);
        assert_eq!(map.dynamic, 3);
        assert_eq!(map.upload, 1);
        assert!(map.upload_host_visible);
        assert_eq!(map.uniform, Some(1));
        assert_eq!(map.select(MemoryUsage::Upload), 1);
    }

    #[test]
    fn small_bar_window_serves_uniforms_only() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL), ty(1, DL | HV | HC), ty(2, HV | HC), ty(2, HV | HC | HCA)],
            &[heap(16 * GB, true), heap(256 * MB, true), heap(16 * GB, false)],
            vk::PhysicalDeviceType::DISCRETE_GPU,
        )
        .unwrap();
        assert_eq!(map.upload, 0);
        assert!(!map.upload_host_visible);
        assert_eq!(map.uniform, Some(1));
    }

    #[test]
    fn apu_carve_out_uploads_to_system_memory() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL), ty(0, DL | HV | HC), ty(1, HV | HC), ty(1, HV | HC | HCA)],
            &[heap(256 * MB, true), heap(14 * GB, false)],
            vk::PhysicalDeviceType::INTEGRATED_GPU,
        )
        .unwrap();
        assert_eq!(map.upload, 2);
        assert!(map.upload_host_visible);
        assert_eq!(map.uniform, Some(1));
    }

    #[test]
    fn larger_heap_wins() {
        let map = MemoryTypeMap::new(
            &[ty(0, DL), ty(1, DL), ty(2, HV | HC | HCA)],
            &[heap(2 * GB, true), heap(8 * GB, true), heap(16 * GB, false)],
            vk::PhysicalDeviceType::DISCRETE_GPU,
        )
        .unwrap();
        assert_eq!(map.private, 1);
    }

    #[test]
    fn missing_device_local_memory_is_unsupported() {
        let err = MemoryTypeMap::new(
            &[ty(0, HV | HC | HCA)],
            &[heap(GB, false)],
            vk::PhysicalDeviceType::CPU,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }
}
