//! Non-owning typed references to device-owned objects.
//!
//! A [`Handle`] is what a [`Device`](crate::Device) returns from every factory
//! call. It is `Copy`, carries no lifetime, and never keeps the referenced
//! object alive: the device keeps exclusive ownership and the handle is only
//! a key into the device's store for that object kind.
//!
//! Two handles are equal when they were issued by the same device, for the same
//! store slot, and wrap the same native handle. The native handle is only
//! reachable through [`Handle::raw`].

use std::{
    fmt::Debug,
    hash::Hash,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{store::Resource, utils::AsVkHandle};

slotmap::new_key_type! {
    /// Generational slot in one of the device's object stores.
    pub struct SlotKey;
}

/// Identity of a logical device, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A typed, non-owning reference to an object of kind `K` owned by a device.
pub struct Handle<K: Resource> {
    pub(crate) device: DeviceId,
    pub(crate) key: SlotKey,
    raw: <K as AsVkHandle>::Handle,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> Handle<K> {
    pub(crate) fn new(device: DeviceId, key: SlotKey, raw: <K as AsVkHandle>::Handle) -> Self {
        Self {
            device,
            key,
            raw,
            _kind: PhantomData,
        }
    }

    /// The native handle of the referenced object.
    pub fn raw(&self) -> <K as AsVkHandle>::Handle {
        self.raw
    }

    /// The device that issued this handle.
    pub fn device_id(&self) -> DeviceId {
        self.device
    }
}

impl<K: Resource> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: Resource> Copy for Handle<K> {}

impl<K: Resource> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
            && self.key == other.key
            && ash::vk::Handle::as_raw(self.raw) == ash::vk::Handle::as_raw(other.raw)
    }
}
impl<K: Resource> Eq for Handle<K> {}

impl<K: Resource> Hash for Handle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.device.hash(state);
        self.key.hash(state);
        ash::vk::Handle::as_raw(self.raw).hash(state);
    }
}

impl<K: Resource> Debug for Handle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &K::KIND)
            .field("device", &self.device.0)
            .field("raw", &self.raw)
            .finish()
    }
}
