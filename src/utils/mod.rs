use ash::vk;
use std::{
    ffi::{CStr, c_char},
    fmt::Debug,
};

/// Types that wrap exactly one native Vulkan handle.
pub trait AsVkHandle {
    type Handle: vk::Handle + Copy + Debug;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u32);
impl Version {
    pub const V1_0: Self = Self::new(0, 1, 0, 0);
    pub const V1_1: Self = Self::new(0, 1, 1, 0);
    pub const V1_2: Self = Self::new(0, 1, 2, 0);
    pub const V1_3: Self = Self::new(0, 1, 3, 0);

    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }
    pub const fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub const fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub const fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }
    pub const fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}
impl Default for Version {
    fn default() -> Self {
        Self::new(0, 0, 1, 0)
    }
}
impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({self})")
    }
}
impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())?;
        let variant = self.variant();
        if variant != 0 {
            write!(f, " variant {variant}")?;
        }
        Ok(())
    }
}

/// Reads a nul-terminated string out of a fixed-size Vulkan char array.
///
/// Falls back to the empty string if the array holds no terminator.
pub(crate) fn cstr_from_array(array: &[c_char]) -> &CStr {
    // c_char and u8 share size and alignment.
    let bytes = unsafe { std::slice::from_raw_parts(array.as_ptr().cast::<u8>(), array.len()) };
    CStr::from_bytes_until_nul(bytes).unwrap_or(c"")
}

/// Writes `value` into a fixed-size Vulkan char array, truncating if needed.
pub(crate) fn write_cstr_array(array: &mut [c_char], value: &str) {
    let len = value.len().min(array.len().saturating_sub(1));
    for (dst, src) in array.iter_mut().zip(value.as_bytes()[..len].iter()) {
        *dst = *src as c_char;
    }
    if let Some(terminator) = array.get_mut(len) {
        *terminator = 0;
    }
}

/// Number of mip levels of a full chain for the given extent.
pub(crate) fn full_mip_chain(extent: vk::Extent3D) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth).max(1);
    u32::BITS - largest.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_components() {
        let v = Version::V1_2;
        assert_eq!((v.major(), v.minor(), v.patch()), (1, 2, 0));
        assert!(Version::V1_3 > Version::V1_2);
        assert_eq!(Version::new(0, 1, 3, 250).to_string(), "1.3.250");
    }

    #[test]
    fn char_array_round_trip() {
        let mut name = [0 as c_char; 8];
        write_cstr_array(&mut name, "Radeon RX");
        assert_eq!(cstr_from_array(&name), c"Radeon ");
        write_cstr_array(&mut name, "Arc");
        assert_eq!(cstr_from_array(&name), c"Arc");
    }

    #[test]
    fn mip_chain_length() {
        let extent = |width, height| vk::Extent3D {
            width,
            height,
            depth: 1,
        };
        assert_eq!(full_mip_chain(extent(1, 1)), 1);
        assert_eq!(full_mip_chain(extent(256, 256)), 9);
        assert_eq!(full_mip_chain(extent(300, 20)), 9);
    }
}
