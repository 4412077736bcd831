//! Presentation surfaces.
//!
//! Window system integration is out of scope: a [`Surface`] adopts a
//! `VkSurfaceKHR` that the application already created through its windowing
//! library, and destroys it when the last clone is dropped.

use ash::vk::{self, Handle};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{Instance, utils::AsVkHandle};

#[derive(Clone)]
pub struct Surface(Arc<SurfaceBackend>);

pub(crate) enum SurfaceBackend {
    Vulkan {
        instance: Instance,
        raw: vk::SurfaceKHR,
    },
    Headless {
        raw: vk::SurfaceKHR,
    },
}

impl Drop for SurfaceBackend {
    fn drop(&mut self) {
        if let SurfaceBackend::Vulkan { instance, raw } = self {
            match instance.surface_loader() {
                Some(loader) => unsafe { loader.destroy_surface(*raw, None) },
                None => tracing::error!(surface = ?raw, "surface outlived its loader"),
            }
        }
    }
}

impl Surface {
    /// Takes ownership of a surface created from `instance`.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid surface created from `instance`, and must not be
    /// destroyed by anyone else.
    pub unsafe fn from_raw(instance: &Instance, raw: vk::SurfaceKHR) -> Self {
        Surface(Arc::new(SurfaceBackend::Vulkan {
            instance: instance.clone(),
            raw,
        }))
    }

    /// A surface for headless adapters. Graphics-capable queue families can
    /// present to it.
    pub fn headless() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let raw = vk::SurfaceKHR::from_raw(NEXT.fetch_add(1, Ordering::Relaxed));
        Surface(Arc::new(SurfaceBackend::Headless { raw }))
    }

    pub(crate) fn backend(&self) -> &SurfaceBackend {
        &self.0
    }
}

impl AsVkHandle for Surface {
    type Handle = vk::SurfaceKHR;
    fn vk_handle(&self) -> Self::Handle {
        match &*self.0 {
            SurfaceBackend::Vulkan { raw, .. } | SurfaceBackend::Headless { raw } => *raw,
        }
    }
}
