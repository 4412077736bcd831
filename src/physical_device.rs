//! Physical device enumeration and capability snapshots.
//!
//! A [`PhysicalDevice`] is an immutable snapshot of one adapter: its identity,
//! limits, supported [`DeviceFeatures`], queue families, memory heaps and
//! types, device extensions and vendor-specific properties. It is taken once
//! at enumeration time and never changes afterwards, so it can be cloned
//! cheaply and shared by every [`Device`](crate::Device) created from it.
//!
//! # Example
//!
//! ```no_run
//! # use basalt::{Instance, InstanceCreateInfo};
//! let instance = Instance::new(InstanceCreateInfo::default()).unwrap();
//! for gpu in instance.enumerate_physical_devices().unwrap() {
//!     println!("{} timeline={}", gpu.descriptive_name(), gpu.supports_timeline_semaphore());
//! }
//! ```
//!
//! Without a GPU, [`PhysicalDevice::headless`] builds a software adapter from a
//! [`HeadlessAdapter`] description.

use std::{
    collections::BTreeSet,
    ffi::{CStr, CString},
    sync::Arc,
};

use ash::vk;

use crate::{
    Instance,
    driver::headless::{HeadlessAdapter, HeadlessShared},
    error::{Error, Result},
    features::DeviceFeatures,
    memory::MemoryTypeMap,
    surface::{Surface, SurfaceBackend},
    utils::{AsVkHandle, Version, cstr_from_array},
};

/// Vendor of an adapter, derived from its PCI vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Amd,
    Intel,
    Nvidia,
    Arm,
    Qualcomm,
    ImgTec,
    Apple,
    Other(u32),
}

impl Vendor {
    pub const AMD_ID: u32 = 0x1002;
    pub const INTEL_ID: u32 = 0x8086;
    pub const NVIDIA_ID: u32 = 0x10DE;

    pub fn from_id(vendor_id: u32) -> Self {
        match vendor_id {
            Self::AMD_ID => Vendor::Amd,
            Self::INTEL_ID => Vendor::Intel,
            Self::NVIDIA_ID => Vendor::Nvidia,
            0x13B5 => Vendor::Arm,
            0x5143 => Vendor::Qualcomm,
            0x1010 => Vendor::ImgTec,
            0x106B => Vendor::Apple,
            other => Vendor::Other(other),
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vendor::Amd => f.write_str("AMD"),
            Vendor::Intel => f.write_str("Intel"),
            Vendor::Nvidia => f.write_str("NVIDIA"),
            Vendor::Arm => f.write_str("ARM"),
            Vendor::Qualcomm => f.write_str("Qualcomm"),
            Vendor::ImgTec => f.write_str("Imagination"),
            Vendor::Apple => f.write_str("Apple"),
            Vendor::Other(id) => write!(f, "vendor {id:#06x}"),
        }
    }
}

/// Properties of one queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    pub min_image_transfer_granularity: vk::Extent3D,
}

/// Shader core layout reported by `VK_AMD_shader_core_properties`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AmdShaderCoreProperties {
    pub shader_engine_count: u32,
    pub shader_arrays_per_engine_count: u32,
    pub compute_units_per_shader_array: u32,
    pub simd_per_compute_unit: u32,
    pub wavefronts_per_simd: u32,
    pub wavefront_size: u32,
    pub sgprs_per_simd: u32,
    pub min_sgpr_allocation: u32,
    pub max_sgpr_allocation: u32,
    pub sgpr_allocation_granularity: u32,
    pub vgprs_per_simd: u32,
    pub min_vgpr_allocation: u32,
    pub max_vgpr_allocation: u32,
    pub vgpr_allocation_granularity: u32,
}

impl AmdShaderCoreProperties {
    /// Total number of compute units on the adapter.
    pub fn compute_unit_count(&self) -> u32 {
        self.shader_engine_count
            * self.shader_arrays_per_engine_count
            * self.compute_units_per_shader_array
    }
}

impl From<&vk::PhysicalDeviceShaderCorePropertiesAMD<'_>> for AmdShaderCoreProperties {
    fn from(p: &vk::PhysicalDeviceShaderCorePropertiesAMD<'_>) -> Self {
        Self {
            shader_engine_count: p.shader_engine_count,
            shader_arrays_per_engine_count: p.shader_arrays_per_engine_count,
            compute_units_per_shader_array: p.compute_units_per_shader_array,
            simd_per_compute_unit: p.simd_per_compute_unit,
            wavefronts_per_simd: p.wavefronts_per_simd,
            wavefront_size: p.wavefront_size,
            sgprs_per_simd: p.sgprs_per_simd,
            min_sgpr_allocation: p.min_sgpr_allocation,
            max_sgpr_allocation: p.max_sgpr_allocation,
            sgpr_allocation_granularity: p.sgpr_allocation_granularity,
            vgprs_per_simd: p.vgprs_per_simd,
            min_vgpr_allocation: p.min_vgpr_allocation,
            max_vgpr_allocation: p.max_vgpr_allocation,
            vgpr_allocation_granularity: p.vgpr_allocation_granularity,
        }
    }
}

/// A capability snapshot of one physical adapter.
///
/// This type is reference-counted and cheap to clone.
#[derive(Clone)]
pub struct PhysicalDevice(Arc<PhysicalDeviceInner>);
impl PartialEq for PhysicalDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PhysicalDevice {}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PhysicalDevice")
            .field(&self.0.descriptive_name)
            .finish()
    }
}

pub(crate) enum Backend {
    Vulkan { instance: Instance },
    Headless(Arc<HeadlessShared>),
}

struct PhysicalDeviceInner {
    backend: Backend,
    raw: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    features: DeviceFeatures,
    queue_families: Vec<QueueFamily>,
    memory_types: Vec<vk::MemoryType>,
    memory_heaps: Vec<vk::MemoryHeap>,
    memory_type_map: MemoryTypeMap,
    extensions: BTreeSet<CString>,
    amd_shader_core: Option<AmdShaderCoreProperties>,
    descriptive_name: String,
}

impl Instance {
    /// Enumerates every physical device visible to the loader.
    pub fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let raws = unsafe { self.raw().enumerate_physical_devices()? };
        let devices = raws
            .into_iter()
            .map(|raw| PhysicalDevice::from_vulkan(self.clone(), raw))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(count = devices.len(), "enumerated physical devices");
        Ok(devices)
    }
}

impl AsVkHandle for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    fn vk_handle(&self) -> Self::Handle {
        self.0.raw
    }
}

impl PhysicalDevice {
    fn from_vulkan(instance: Instance, raw: vk::PhysicalDevice) -> Result<Self> {
        let vk_instance = instance.raw();
        let properties = unsafe { vk_instance.get_physical_device_properties(raw) };
        let extensions: BTreeSet<CString> =
            unsafe { vk_instance.enumerate_device_extension_properties(raw)? }
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
                .collect();

        let mut features =
            DeviceFeatures::from_vk(&unsafe { vk_instance.get_physical_device_features(raw) });
        // Timeline semaphore entry points are only loaded as core 1.2 commands.
        let core_1_2 = Version(properties.api_version) >= Version::V1_2
            && instance.api_version() >= Version::V1_2;
        if core_1_2 {
            let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut timeline);
            unsafe { vk_instance.get_physical_device_features2(raw, &mut features2) };
            if timeline.timeline_semaphore == vk::TRUE {
                features |= DeviceFeatures::TIMELINE_SEMAPHORE;
            }
        }

        let amd_shader_core = if extensions.contains(ash::amd::shader_core_properties::NAME)
            && instance.api_version() >= Version::V1_1
        {
            let mut amd = vk::PhysicalDeviceShaderCorePropertiesAMD::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut amd);
            unsafe { vk_instance.get_physical_device_properties2(raw, &mut properties2) };
            Some(AmdShaderCoreProperties::from(&amd))
        } else {
            None
        };

        let queue_families = unsafe { vk_instance.get_physical_device_queue_family_properties(raw) }
            .iter()
            .enumerate()
            .map(|(index, family)| QueueFamily {
                index: index as u32,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                timestamp_valid_bits: family.timestamp_valid_bits,
                min_image_transfer_granularity: family.min_image_transfer_granularity,
            })
            .collect();

        let memory = unsafe { vk_instance.get_physical_device_memory_properties(raw) };
        let memory_types = memory.memory_types[..memory.memory_type_count as usize].to_vec();
        let memory_heaps = memory.memory_heaps[..memory.memory_heap_count as usize].to_vec();

        Self::assemble(
            Backend::Vulkan { instance },
            raw,
            properties,
            features,
            queue_families,
            memory_types,
            memory_heaps,
            extensions,
            amd_shader_core,
        )
    }

    /// Builds a software adapter. Devices created from it run on the headless
    /// backend, which needs no GPU.
    pub fn headless(adapter: HeadlessAdapter) -> Result<Self> {
        let shared = Arc::new(HeadlessShared::new(adapter));
        let adapter = shared.adapter();
        let properties = adapter.properties();
        let queue_families = adapter
            .queue_families
            .iter()
            .enumerate()
            .map(|(index, &(flags, queue_count))| QueueFamily {
                index: index as u32,
                flags,
                queue_count,
                timestamp_valid_bits: 64,
                min_image_transfer_granularity: vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                },
            })
            .collect();
        let raw = shared.raw_physical_device();
        Self::assemble(
            Backend::Headless(shared.clone()),
            raw,
            properties,
            adapter.features,
            queue_families,
            adapter.memory_types.clone(),
            adapter.memory_heaps.clone(),
            adapter.extensions.iter().cloned().collect(),
            adapter.amd_shader_core,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        backend: Backend,
        raw: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        features: DeviceFeatures,
        queue_families: Vec<QueueFamily>,
        memory_types: Vec<vk::MemoryType>,
        memory_heaps: Vec<vk::MemoryHeap>,
        extensions: BTreeSet<CString>,
        amd_shader_core: Option<AmdShaderCoreProperties>,
    ) -> Result<Self> {
        let memory_type_map =
            MemoryTypeMap::new(&memory_types, &memory_heaps, properties.device_type)?;
        let descriptive_name = format!(
            "{} ({}, {})",
            cstr_from_array(&properties.device_name).to_string_lossy(),
            Vendor::from_id(properties.vendor_id),
            device_type_name(properties.device_type),
        );
        tracing::debug!(name = %descriptive_name, ?features, "physical device snapshot");
        Ok(PhysicalDevice(Arc::new(PhysicalDeviceInner {
            backend,
            raw,
            properties,
            features,
            queue_families,
            memory_types,
            memory_heaps,
            memory_type_map,
            extensions,
            amd_shader_core,
            descriptive_name,
        })))
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.0.backend
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.0.properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.0.properties.limits
    }

    pub fn vendor_id(&self) -> u32 {
        self.0.properties.vendor_id
    }

    pub fn device_id(&self) -> u32 {
        self.0.properties.device_id
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.0.properties.device_type
    }

    pub fn device_name(&self) -> &CStr {
        cstr_from_array(&self.0.properties.device_name)
    }

    pub fn api_version(&self) -> Version {
        Version(self.0.properties.api_version)
    }

    pub fn driver_version(&self) -> u32 {
        self.0.properties.driver_version
    }

    /// "<device name> (<vendor>, <device type>)".
    pub fn descriptive_name(&self) -> &str {
        &self.0.descriptive_name
    }

    pub fn vendor(&self) -> Vendor {
        Vendor::from_id(self.vendor_id())
    }

    pub fn is_amd(&self) -> bool {
        self.vendor() == Vendor::Amd
    }

    pub fn is_intel(&self) -> bool {
        self.vendor() == Vendor::Intel
    }

    pub fn is_nvidia(&self) -> bool {
        self.vendor() == Vendor::Nvidia
    }

    /// Features the adapter supports.
    pub fn features(&self) -> DeviceFeatures {
        self.0.features
    }

    pub fn supports_timeline_semaphore(&self) -> bool {
        self.0.features.contains(DeviceFeatures::TIMELINE_SEMAPHORE)
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.0.queue_families
    }

    /// Properties of the queue family at `index`.
    pub fn queue_family_properties(&self, index: u32) -> Result<&QueueFamily> {
        self.0
            .queue_families
            .get(index as usize)
            .ok_or_else(|| Error::NotFound(format!("queue family {index}")))
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.0.memory_types
    }

    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.0.memory_heaps
    }

    pub fn memory_type_map(&self) -> &MemoryTypeMap {
        &self.0.memory_type_map
    }

    pub fn extensions(&self) -> impl ExactSizeIterator<Item = &CStr> {
        self.0.extensions.iter().map(CString::as_c_str)
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.0.extensions.contains(name)
    }

    /// Shader core layout, for AMD adapters exposing `VK_AMD_shader_core_properties`.
    pub fn amd_shader_core_properties(&self) -> Option<&AmdShaderCoreProperties> {
        self.0.amd_shader_core.as_ref()
    }

    /// Whether queues of `queue_family_index` can present to `surface`.
    ///
    /// A surface from a different backend than this adapter is never presentable.
    pub fn supports_presentation(
        &self,
        queue_family_index: u32,
        surface: &Surface,
    ) -> Result<bool> {
        let family = self.queue_family_properties(queue_family_index)?;
        match (&self.0.backend, surface.backend()) {
            (Backend::Vulkan { instance }, SurfaceBackend::Vulkan { raw, .. }) => {
                let loader = instance.surface_loader().ok_or_else(|| {
                    Error::UnsupportedFeature(
                        "VK_KHR_surface is not enabled on the instance".into(),
                    )
                })?;
                let supported = unsafe {
                    loader.get_physical_device_surface_support(
                        self.0.raw,
                        queue_family_index,
                        *raw,
                    )?
                };
                Ok(supported)
            }
            (Backend::Headless(_), SurfaceBackend::Headless { .. }) => {
                Ok(family.flags.contains(vk::QueueFlags::GRAPHICS))
            }
            _ => Ok(false),
        }
    }

    /// Objects currently alive on a headless adapter, across all of its
    /// devices and including the devices themselves. `None` for Vulkan adapters.
    pub fn live_object_count(&self) -> Option<usize> {
        match &self.0.backend {
            Backend::Headless(shared) => Some(shared.live_objects()),
            Backend::Vulkan { .. } => None,
        }
    }
}

fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> PhysicalDevice {
        PhysicalDevice::headless(HeadlessAdapter {
            device_name: "Radeon Test".into(),
            vendor_id: Vendor::AMD_ID,
            amd_shader_core: Some(AmdShaderCoreProperties {
                shader_engine_count: 4,
                shader_arrays_per_engine_count: 2,
                compute_units_per_shader_array: 10,
                wavefront_size: 64,
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn identity_and_vendor() {
        let gpu = adapter();
        assert!(gpu.is_amd());
        assert!(!gpu.is_intel());
        assert!(!gpu.is_nvidia());
        assert_eq!(gpu.device_name(), c"Radeon Test");
        assert_eq!(gpu.descriptive_name(), "Radeon Test (AMD, discrete)");
        assert_eq!(
            gpu.amd_shader_core_properties().map(|p| p.compute_unit_count()),
            Some(80)
        );
        assert_eq!(Vendor::from_id(0x10DE), Vendor::Nvidia);
        assert_eq!(Vendor::from_id(0x1234).to_string(), "vendor 0x1234");
    }

    #[test]
    fn queue_family_lookup() {
        let gpu = adapter();
        let count = gpu.queue_families().len() as u32;
        assert!(count > 0);
        let graphics = gpu.queue_family_properties(0).unwrap();
        assert!(graphics.flags.contains(vk::QueueFlags::GRAPHICS));
        assert!(matches!(
            gpu.queue_family_properties(count),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn presentation_support() {
        let gpu = adapter();
        let surface = Surface::headless();
        let families = gpu.queue_families().to_vec();
        for family in families {
            assert_eq!(
                gpu.supports_presentation(family.index, &surface).unwrap(),
                family.flags.contains(vk::QueueFlags::GRAPHICS)
            );
        }
        assert!(matches!(
            gpu.supports_presentation(99, &surface),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn snapshots_are_shared() {
        let gpu = adapter();
        let clone = gpu.clone();
        assert_eq!(gpu, clone);
        assert_ne!(gpu, adapter());
        assert!(gpu.supports_timeline_semaphore());
        assert!(gpu.supports_extension(ash::khr::swapchain::NAME));
        assert_eq!(gpu.live_object_count(), Some(0));
    }
}
