//! Samplers.
//!
//! Samplers define how images are read in shaders: filtering, address
//! wrapping and mipmap selection. They are immutable after creation.

use std::fmt::Debug;

use ash::vk;

use crate::{
    Device,
    driver::{Driver, NativeInfo},
    error::{Error, ResourceKind, Result},
    features::DeviceFeatures,
    store::{Managed, Resource},
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerCreateInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    /// Anisotropic filtering. Needs [`DeviceFeatures::SAMPLER_ANISOTROPY`].
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerCreateInfo {
    /// Trilinear filtering with repeat addressing over every mip level.
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

impl SamplerCreateInfo {
    /// Nearest filtering, clamped to the edge.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Self::default()
        }
    }
}

pub struct Sampler {
    handle: vk::Sampler,
    info: SamplerCreateInfo,
}

impl Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl Sampler {
    pub fn info(&self) -> &SamplerCreateInfo {
        &self.info
    }
}

impl AsVkHandle for Sampler {
    type Handle = vk::Sampler;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Sampler {
    type CreateInfo = SamplerCreateInfo;
    const KIND: ResourceKind = ResourceKind::Sampler;
}

impl Managed for Sampler {
    fn validate(device: &Device, info: &SamplerCreateInfo) -> Result<()> {
        if let Some(anisotropy) = info.max_anisotropy {
            if !device
                .enabled_features()
                .contains(DeviceFeatures::SAMPLER_ANISOTROPY)
            {
                return Err(Error::UnsupportedFeature(
                    "anisotropic filtering needs the SAMPLER_ANISOTROPY feature".into(),
                ));
            }
            let limit = device.physical_device().limits().max_sampler_anisotropy;
            if !(1.0..=limit).contains(&anisotropy) {
                return Err(Error::invalid(
                    ResourceKind::Sampler,
                    format!("anisotropy {anisotropy} outside 1.0..={limit}"),
                ));
            }
        }
        if info.min_lod > info.max_lod {
            return Err(Error::invalid(
                ResourceKind::Sampler,
                format!("min_lod {} exceeds max_lod {}", info.min_lod, info.max_lod),
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: SamplerCreateInfo) -> Result<Self> {
        let raw = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode_u)
            .address_mode_v(info.address_mode_v)
            .address_mode_w(info.address_mode_w)
            .mip_lod_bias(info.mip_lod_bias)
            .anisotropy_enable(info.max_anisotropy.is_some())
            .max_anisotropy(info.max_anisotropy.unwrap_or(1.0))
            .compare_enable(info.compare_op.is_some())
            .compare_op(info.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(info.min_lod)
            .max_lod(info.max_lod)
            .border_color(info.border_color);
        let handle = device
            .driver()?
            .create(NativeInfo::Sampler(&raw))
            .map_err(Error::creation(ResourceKind::Sampler))?;
        Ok(Self { handle, info })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DeviceCreateInfo, QueueRequest,
        device::tests::{adapter, device},
    };

    #[test]
    fn anisotropy_is_bounded() {
        let mut device = device();
        let with = |anisotropy| SamplerCreateInfo {
            max_anisotropy: Some(anisotropy),
            ..Default::default()
        };
        assert!(matches!(
            device.create_sampler(with(64.0)),
            Err(Error::InvalidParams {
                kind: ResourceKind::Sampler,
                ..
            })
        ));
        let handle = device.create_sampler(with(16.0)).unwrap();
        assert_eq!(device.get(handle).unwrap().info().max_anisotropy, Some(16.0));
        device.create_sampler(SamplerCreateInfo::nearest()).unwrap();
        assert_eq!(device.count::<Sampler>(), 2);
    }

    #[test]
    fn anisotropy_needs_the_feature() {
        let gpu = adapter();
        let mut device = Device::new(
            &gpu,
            DeviceCreateInfo {
                queues: vec![QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
                features: DeviceFeatures::empty(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            device.create_sampler(SamplerCreateInfo {
                max_anisotropy: Some(4.0),
                ..Default::default()
            }),
            Err(Error::UnsupportedFeature(_))
        ));
        assert_eq!(device.count::<Sampler>(), 0);
        assert!(
            device
                .create_sampler(SamplerCreateInfo {
                    min_lod: 4.0,
                    max_lod: 1.0,
                    ..Default::default()
                })
                .is_err()
        );
    }
}
