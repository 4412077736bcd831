//! Images and the views onto them.
//!
//! An [`Image`] is bound to allocator memory; an [`ImageView`] selects a
//! subresource range of an image owned by the same device. Three kinds bundle
//! an image with a view over all of it:
//!
//! - [`Texture`]: a sampled image.
//! - [`RenderTargetView`]: a color attachment.
//! - [`DepthStencilView`]: a depth/stencil attachment.

use std::fmt::Debug;

use ash::vk;

use crate::{
    Device,
    driver::{Allocation, Driver, MemoryRequest, NativeInfo},
    error::{Error, ResourceKind, Result},
    handle::Handle,
    memory::MemoryUsage,
    store::{Managed, Resource},
    utils::{AsVkHandle, full_mip_chain},
};

/// Aspects present in `format`.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    format_aspects(format).intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
}

/// Common read accessors of the image-backed kinds.
pub trait ImageLike {
    fn image_type(&self) -> vk::ImageType;
    fn format(&self) -> vk::Format;
    fn extent(&self) -> vk::Extent3D;
    fn mip_level_count(&self) -> u32;
    fn array_layer_count(&self) -> u32;
    fn samples(&self) -> vk::SampleCountFlags;

    fn aspects(&self) -> vk::ImageAspectFlags {
        format_aspects(self.format())
    }

    /// The range covering every mip level and layer.
    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspects(),
            base_mip_level: 0,
            level_count: self.mip_level_count(),
            base_array_layer: 0,
            layer_count: self.array_layer_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub memory: MemoryUsage,
    pub committed: bool,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::empty(),
            flags: vk::ImageCreateFlags::empty(),
            memory: MemoryUsage::GpuOnly,
            committed: false,
        }
    }
}

impl ImageCreateInfo {
    /// A single-layer 2D image.
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            usage,
            ..Default::default()
        }
    }

    /// Sets `mip_levels` to a full chain for the extent.
    pub fn with_full_mip_chain(self) -> Self {
        Self {
            mip_levels: full_mip_chain(self.extent),
            ..self
        }
    }

    fn validate(&self, device: &Device, kind: ResourceKind) -> Result<()> {
        let invalid = |reason: String| Err(Error::invalid(kind, reason));
        let vk::Extent3D {
            width,
            height,
            depth,
        } = self.extent;
        if width == 0 || height == 0 || depth == 0 {
            return invalid(format!("extent {width}x{height}x{depth} has a zero dimension"));
        }
        if self.mip_levels == 0 || self.array_layers == 0 {
            return invalid("mip level and array layer counts must be non-zero".into());
        }
        if self.usage.is_empty() {
            return invalid("usage is empty".into());
        }
        let max_mips = full_mip_chain(self.extent);
        if self.mip_levels > max_mips {
            return invalid(format!(
                "{} mip levels requested, a {width}x{height}x{depth} image has at most {max_mips}",
                self.mip_levels
            ));
        }
        let limits = device.physical_device().limits();
        let max_dimension = match self.image_type {
            vk::ImageType::TYPE_1D => limits.max_image_dimension1_d,
            vk::ImageType::TYPE_3D => limits.max_image_dimension3_d,
            _ => limits.max_image_dimension2_d,
        };
        if width.max(height).max(depth) > max_dimension {
            return invalid(format!(
                "extent {width}x{height}x{depth} exceeds the {:?} limit {max_dimension}",
                self.image_type
            ));
        }
        if self.array_layers > limits.max_image_array_layers {
            return invalid(format!(
                "{} array layers exceed the limit {}",
                self.array_layers, limits.max_image_array_layers
            ));
        }
        Ok(())
    }

    fn to_vk(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// An image fully bound to a memory allocation.
pub struct Image {
    image: vk::Image,
    allocation: Allocation,
    info: ImageCreateInfo,
}

impl Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("format", &self.info.format)
            .field("extent", &self.info.extent)
            .finish_non_exhaustive()
    }
}

impl Image {
    fn new(device: &Device, kind: ResourceKind, info: ImageCreateInfo) -> Result<Self> {
        let (image, allocation) = device
            .driver()?
            .create_image(
                &info.to_vk(),
                MemoryRequest {
                    usage: info.memory,
                    committed: info.committed,
                },
            )
            .map_err(Error::creation(kind))?;
        Ok(Self {
            image,
            allocation,
            info,
        })
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.info.usage
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.info.memory
    }

    /// Bytes of memory backing the image.
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    fn release(self, driver: &dyn Driver) {
        driver.destroy_image(self.image, self.allocation);
    }
}

impl ImageLike for Image {
    fn image_type(&self) -> vk::ImageType {
        self.info.image_type
    }
    fn format(&self) -> vk::Format {
        self.info.format
    }
    fn extent(&self) -> vk::Extent3D {
        self.info.extent
    }
    fn mip_level_count(&self) -> u32 {
        self.info.mip_levels
    }
    fn array_layer_count(&self) -> u32 {
        self.info.array_layers
    }
    fn samples(&self) -> vk::SampleCountFlags {
        self.info.samples
    }
}

impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> Self::Handle {
        self.image
    }
}

impl Resource for Image {
    type CreateInfo = ImageCreateInfo;
    const KIND: ResourceKind = ResourceKind::Image;
}

impl Managed for Image {
    fn validate(device: &Device, info: &ImageCreateInfo) -> Result<()> {
        info.validate(device, ResourceKind::Image)
    }

    fn create(device: &Device, info: ImageCreateInfo) -> Result<Self> {
        Image::new(device, ResourceKind::Image, info)
    }

    fn destroy(self, driver: &dyn Driver) {
        self.release(driver)
    }
}

fn default_view_type(image: &impl ImageLike) -> vk::ImageViewType {
    let layered = image.array_layer_count() > 1;
    match image.image_type() {
        vk::ImageType::TYPE_1D if layered => vk::ImageViewType::TYPE_1D_ARRAY,
        vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
        vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
        _ if layered => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

fn create_view(
    device: &Device,
    kind: ResourceKind,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(range);
    device
        .driver()?
        .create(NativeInfo::ImageView(&info))
        .map_err(Error::creation(kind))
}

#[derive(Debug, Clone, Copy)]
pub struct ImageViewCreateInfo {
    /// Must be owned by the creating device.
    pub image: Handle<Image>,
    /// Derived from the image when `None`.
    pub view_type: Option<vk::ImageViewType>,
    /// The image format when `None`.
    pub format: Option<vk::Format>,
    /// The full range of the image when `None`.
    pub subresource_range: Option<vk::ImageSubresourceRange>,
}

impl ImageViewCreateInfo {
    /// A view over the whole image.
    pub fn new(image: Handle<Image>) -> Self {
        Self {
            image,
            view_type: None,
            format: None,
            subresource_range: None,
        }
    }
}

pub struct ImageView {
    view: vk::ImageView,
    image: Handle<Image>,
    view_type: vk::ImageViewType,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
}

impl Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("view", &self.view)
            .field("image", &self.image.raw())
            .field("view_type", &self.view_type)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    pub fn image(&self) -> Handle<Image> {
        self.image
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        self.view_type
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        self.range
    }
}

impl AsVkHandle for ImageView {
    type Handle = vk::ImageView;
    fn vk_handle(&self) -> Self::Handle {
        self.view
    }
}

impl Resource for ImageView {
    type CreateInfo = ImageViewCreateInfo;
    const KIND: ResourceKind = ResourceKind::ImageView;
}

impl Managed for ImageView {
    fn validate(device: &Device, info: &ImageViewCreateInfo) -> Result<()> {
        let image = device.get(info.image)?;
        let Some(range) = info.subresource_range else {
            return Ok(());
        };
        let invalid = |reason: String| Err(Error::invalid(ResourceKind::ImageView, reason));
        if range.aspect_mask.is_empty() || !image.aspects().contains(range.aspect_mask) {
            return invalid(format!(
                "aspects {:?} are not present in {:?}",
                range.aspect_mask,
                image.format()
            ));
        }
        let within = |base: u32, count: u32, total: u32| {
            let end_in_range = count == vk::REMAINING_MIP_LEVELS
                || base.checked_add(count).is_some_and(|end| end <= total);
            count != 0 && base < total && end_in_range
        };
        if !within(range.base_mip_level, range.level_count, image.mip_level_count()) {
            return invalid(format!(
                "mip levels {}+{} out of range for {} levels",
                range.base_mip_level,
                range.level_count,
                image.mip_level_count()
            ));
        }
        if !within(range.base_array_layer, range.layer_count, image.array_layer_count()) {
            return invalid(format!(
                "array layers {}+{} out of range for {} layers",
                range.base_array_layer,
                range.layer_count,
                image.array_layer_count()
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: ImageViewCreateInfo) -> Result<Self> {
        let image = device.get(info.image)?;
        let view_type = info.view_type.unwrap_or_else(|| default_view_type(image));
        let format = info.format.unwrap_or(image.format());
        let range = info.subresource_range.unwrap_or_else(|| image.full_range());
        let view = create_view(
            device,
            ResourceKind::ImageView,
            image.vk_handle(),
            view_type,
            format,
            range,
        )?;
        Ok(Self {
            view,
            image: info.image,
            view_type,
            format,
            range,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.view);
    }
}

/// An image bundled with a view over all of it.
struct ViewedImage {
    image: Image,
    view: vk::ImageView,
}

impl ViewedImage {
    fn new(device: &Device, kind: ResourceKind, info: ImageCreateInfo) -> Result<Self> {
        let image = Image::new(device, kind, info)?;
        let view = create_view(
            device,
            kind,
            image.vk_handle(),
            default_view_type(&image),
            image.format(),
            image.full_range(),
        );
        match view {
            Ok(view) => Ok(Self { image, view }),
            Err(err) => {
                image.release(&**device.driver()?);
                Err(err)
            }
        }
    }

    fn release(self, driver: &dyn Driver) {
        driver.destroy(self.view);
        self.image.release(driver);
    }
}

macro_rules! viewed_image_kinds {
    ($($(#[$meta:meta])* $kind:ident => $usage:expr, $check:expr;)*) => {
        $(
            $(#[$meta])*
            pub struct $kind(ViewedImage);

            impl Debug for $kind {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct(stringify!($kind))
                        .field("image", &self.0.image.image)
                        .field("view", &self.0.view)
                        .field("format", &self.0.image.info.format)
                        .finish_non_exhaustive()
                }
            }

            impl $kind {
                /// The view over the whole image.
                pub fn view(&self) -> vk::ImageView {
                    self.0.view
                }

                /// The native image behind the view.
                pub fn image(&self) -> vk::Image {
                    self.0.image.image
                }

                pub fn usage(&self) -> vk::ImageUsageFlags {
                    self.0.image.usage()
                }
            }

            impl ImageLike for $kind {
                fn image_type(&self) -> vk::ImageType {
                    self.0.image.image_type()
                }
                fn format(&self) -> vk::Format {
                    self.0.image.format()
                }
                fn extent(&self) -> vk::Extent3D {
                    self.0.image.extent()
                }
                fn mip_level_count(&self) -> u32 {
                    self.0.image.mip_level_count()
                }
                fn array_layer_count(&self) -> u32 {
                    self.0.image.array_layer_count()
                }
                fn samples(&self) -> vk::SampleCountFlags {
                    self.0.image.samples()
                }
            }

            impl AsVkHandle for $kind {
                type Handle = vk::ImageView;
                fn vk_handle(&self) -> Self::Handle {
                    self.0.view
                }
            }

            impl Resource for $kind {
                type CreateInfo = ImageCreateInfo;
                const KIND: ResourceKind = ResourceKind::$kind;
            }

            impl Managed for $kind {
                fn validate(device: &Device, info: &ImageCreateInfo) -> Result<()> {
                    let check: fn(vk::Format) -> Result<(), String> = $check;
                    check(info.format)
                        .map_err(|reason| Error::invalid(ResourceKind::$kind, reason))?;
                    ImageCreateInfo {
                        usage: info.usage | $usage,
                        ..*info
                    }
                    .validate(device, ResourceKind::$kind)
                }

                fn create(device: &Device, info: ImageCreateInfo) -> Result<Self> {
                    let info = ImageCreateInfo {
                        usage: info.usage | $usage,
                        ..info
                    };
                    ViewedImage::new(device, ResourceKind::$kind, info).map(Self)
                }

                fn destroy(self, driver: &dyn Driver) {
                    self.0.release(driver)
                }
            }
        )*
    };
}

viewed_image_kinds! {
    /// A sampled image with a view over all of it. `SAMPLED` and
    /// `TRANSFER_DST` are added to the requested usage.
    Texture => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST, |_| Ok(());
    /// A color attachment with a view over all of it. The format must be a
    /// color format.
    RenderTargetView => vk::ImageUsageFlags::COLOR_ATTACHMENT, |format| {
        if is_depth_stencil_format(format) {
            Err(format!("{format:?} is not a color format"))
        } else {
            Ok(())
        }
    };
    /// A depth/stencil attachment with a view over all of it. The format must
    /// have a depth or stencil aspect.
    DepthStencilView => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, |format| {
        if is_depth_stencil_format(format) {
            Ok(())
        } else {
            Err(format!("{format:?} is not a depth/stencil format"))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{adapter, device, device_on};

    fn sampled(width: u32, height: u32) -> ImageCreateInfo {
        ImageCreateInfo::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            width,
            height,
            vk::ImageUsageFlags::SAMPLED,
        )
    }

    #[test]
    fn image_preconditions() {
        let mut device = device();
        let rejected = |device: &mut Device, info| {
            matches!(
                device.create_image(info),
                Err(Error::InvalidParams {
                    kind: ResourceKind::Image,
                    ..
                })
            )
        };
        assert!(rejected(&mut device, sampled(0, 4)));
        assert!(rejected(&mut device, ImageCreateInfo {
            mip_levels: 0,
            ..sampled(4, 4)
        }));
        assert!(rejected(&mut device, ImageCreateInfo {
            array_layers: 0,
            ..sampled(4, 4)
        }));
        assert!(rejected(&mut device, ImageCreateInfo {
            mip_levels: 10,
            ..sampled(256, 256)
        }));
        assert!(rejected(&mut device, sampled(32768, 1)));
        assert_eq!(device.count::<Image>(), 0);

        let handle = device
            .create_image(sampled(256, 256).with_full_mip_chain())
            .unwrap();
        let image = device.get(handle).unwrap();
        assert_eq!(image.mip_level_count(), 9);
        assert!(image.allocation_size() > 256 * 256 * 4);
    }

    #[test]
    fn views_need_an_owned_image_and_a_valid_range() {
        let gpu = adapter();
        let mut device = device_on(&gpu);
        let mut other = device_on(&gpu);
        let foreign = other.create_image(sampled(8, 8)).unwrap();
        assert_eq!(
            device.create_image_view(ImageViewCreateInfo::new(foreign)),
            Err(Error::NotOwned {
                kind: ResourceKind::Image
            })
        );

        let image = device
            .create_image(ImageCreateInfo {
                array_layers: 4,
                ..sampled(8, 8).with_full_mip_chain()
            })
            .unwrap();
        let range = |base_mip_level, level_count| ImageViewCreateInfo {
            subresource_range: Some(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level,
                level_count,
                base_array_layer: 0,
                layer_count: 1,
            }),
            ..ImageViewCreateInfo::new(image)
        };
        assert!(device.create_image_view(range(2, 2)).is_ok());
        assert!(device.create_image_view(range(3, 2)).is_err());
        assert!(device.create_image_view(range(0, 0)).is_err());
        assert!(device
            .create_image_view(range(1, vk::REMAINING_MIP_LEVELS))
            .is_ok());

        let whole = device
            .create_image_view(ImageViewCreateInfo::new(image))
            .unwrap();
        let view = device.get(whole).unwrap();
        assert_eq!(view.view_type(), vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(view.subresource_range().level_count, 4);
        assert_eq!(view.image(), image);
        assert_eq!(device.count::<ImageView>(), 3);
    }

    #[test]
    fn attachment_views_check_formats() {
        let mut device = device();
        let depth = ImageCreateInfo::new_2d(
            vk::Format::D32_SFLOAT,
            64,
            64,
            vk::ImageUsageFlags::empty(),
        );
        let color = ImageCreateInfo::new_2d(
            vk::Format::B8G8R8A8_SRGB,
            64,
            64,
            vk::ImageUsageFlags::empty(),
        );
        assert!(matches!(
            device.create_render_target_view(depth),
            Err(Error::InvalidParams {
                kind: ResourceKind::RenderTargetView,
                ..
            })
        ));
        assert!(matches!(
            device.create_depth_stencil_view(color),
            Err(Error::InvalidParams {
                kind: ResourceKind::DepthStencilView,
                ..
            })
        ));

        let rt = device.create_render_target_view(color).unwrap();
        let ds = device.create_depth_stencil_view(depth).unwrap();
        assert!(
            device
                .get(rt)
                .unwrap()
                .usage()
                .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        );
        assert_eq!(device.get(ds).unwrap().aspects(), vk::ImageAspectFlags::DEPTH);
        device.destroy_render_target_view(rt).unwrap();
        device.destroy_depth_stencil_view(ds).unwrap();
    }

    #[test]
    fn textures_own_their_image() {
        let gpu = adapter();
        let mut device = device_on(&gpu);
        let baseline = gpu.live_object_count().unwrap();
        let texture = device.create_texture(sampled(16, 16)).unwrap();
        // The image and its view.
        assert_eq!(gpu.live_object_count(), Some(baseline + 2));
        assert_eq!(device.count::<Image>(), 0);
        device.destroy_texture(texture).unwrap();
        assert_eq!(gpu.live_object_count(), Some(baseline));
    }
}
