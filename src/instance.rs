//! Instance creation.
//!
//! The [`Instance`] is the connection to the Vulkan loader, and the starting
//! point of the enumeration phase:
//!
//! ```no_run
//! # use std::borrow::Cow;
//! # use basalt::{Instance, InstanceCreateInfo, utils::Version};
//! let instance = Instance::new(InstanceCreateInfo {
//!     application_name: Cow::Borrowed(c"My Application"),
//!     api_version: Version::V1_3,
//!     validation: true,
//!     ..Default::default()
//! })
//! .unwrap();
//! let adapters = instance.enumerate_physical_devices().unwrap();
//! ```

use ash::{khr, vk};
use std::{
    borrow::Cow,
    collections::BTreeSet,
    ffi::{CStr, CString},
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    utils::Version,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A Vulkan instance.
///
/// Reference-counted; every [`PhysicalDevice`](crate::PhysicalDevice) and
/// [`Surface`](crate::Surface) created from it keeps it alive.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Instance {}

struct InstanceInner {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface: Option<khr::surface::Instance>,
    extensions: BTreeSet<CString>,
    api_version: Version,
}

/// Configuration for instance creation.
#[derive(Debug, Clone)]
pub struct InstanceCreateInfo {
    pub flags: vk::InstanceCreateFlags,
    /// Shown in debugging tools.
    pub application_name: Cow<'static, CStr>,
    pub application_version: Version,
    pub engine_name: Cow<'static, CStr>,
    pub engine_version: Version,
    pub api_version: Version,
    /// Instance extensions to enable. Creation fails if one is missing.
    pub extensions: Vec<CString>,
    /// Layers to enable. Missing layers are skipped with a warning.
    pub layers: Vec<CString>,
    /// Enables `VK_LAYER_KHRONOS_validation` when present.
    pub validation: bool,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::InstanceCreateFlags::empty(),
            application_name: Cow::Borrowed(c"Unnamed Application"),
            application_version: Default::default(),
            engine_name: Cow::Borrowed(c"basalt"),
            engine_version: Version::new(0, 0, 1, 0),
            api_version: Version::V1_2,
            extensions: vec![khr::surface::NAME.to_owned()],
            layers: Vec::new(),
            validation: false,
        }
    }
}

impl Instance {
    /// Loads the system Vulkan library and creates an instance.
    pub fn new(info: InstanceCreateInfo) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|err| Error::LoaderUnavailable(err.to_string()))?;
        Self::with_entry(entry, info)
    }

    /// Creates an instance from an already loaded entry point.
    pub fn with_entry(entry: ash::Entry, info: InstanceCreateInfo) -> Result<Self> {
        let available_extensions: BTreeSet<CString> =
            unsafe { entry.enumerate_instance_extension_properties(None)? }
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
                .collect();
        let available_layers: BTreeSet<CString> =
            unsafe { entry.enumerate_instance_layer_properties()? }
                .iter()
                .filter_map(|layer| layer.layer_name_as_c_str().ok().map(CStr::to_owned))
                .collect();

        if let Some(missing) = info
            .extensions
            .iter()
            .find(|name| !available_extensions.contains(name.as_c_str()))
        {
            return Err(Error::UnsupportedFeature(format!(
                "instance extension {missing:?}"
            )));
        }

        let mut layers: Vec<&CStr> = Vec::new();
        let requested = info.layers.iter().map(CString::as_c_str);
        let validation = info.validation.then_some(VALIDATION_LAYER);
        for layer in requested.chain(validation) {
            if available_layers.contains(layer) {
                layers.push(layer);
            } else {
                tracing::warn!(?layer, "layer not available, skipping");
            }
        }

        let application_info = vk::ApplicationInfo::default()
            .application_name(&info.application_name)
            .application_version(info.application_version.as_raw())
            .engine_name(&info.engine_name)
            .engine_version(info.engine_version.as_raw())
            .api_version(info.api_version.as_raw());
        let layer_names: Vec<_> = layers.iter().map(|name| name.as_ptr()).collect();
        let extension_names: Vec<_> = info.extensions.iter().map(|name| name.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::default()
            .flags(info.flags)
            .application_info(&application_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        let extensions: BTreeSet<CString> = info.extensions.into_iter().collect();
        let surface = extensions
            .contains(khr::surface::NAME)
            .then(|| khr::surface::Instance::new(&entry, &instance));
        tracing::info!(
            instance = ?instance.handle(),
            api_version = %info.api_version,
            "create instance"
        );

        Ok(Instance(Arc::new(InstanceInner {
            _entry: entry,
            instance,
            surface,
            extensions,
            api_version: info.api_version,
        })))
    }

    pub(crate) fn raw(&self) -> &ash::Instance {
        &self.0.instance
    }

    pub(crate) fn surface_loader(&self) -> Option<&khr::surface::Instance> {
        self.0.surface.as_ref()
    }

    /// The API version requested at creation.
    pub fn api_version(&self) -> Version {
        self.0.api_version
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        self.0.extensions.contains(name)
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Every PhysicalDevice and Surface holds an Instance, so none remain.
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let info = InstanceCreateInfo::default();
        assert_eq!(info.api_version, Version::V1_2);
        assert!(
            info.extensions
                .iter()
                .any(|name| name.as_c_str() == khr::surface::NAME)
        );
        assert!(!info.validation);
    }
}
