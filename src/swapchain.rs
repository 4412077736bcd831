//! Swapchains.

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device, Surface,
    driver::{Driver, DriverRef, NativeInfo},
    error::{Error, ResourceKind, Result},
    store::{Managed, Resource},
    sync::{Fence, Semaphore, SemaphoreKind},
    utils::AsVkHandle,
};

#[derive(Clone)]
pub struct SwapchainCreateInfo {
    pub surface: Surface,
    /// The family presentation will happen from. It must have queues on the
    /// device and be able to present to `surface`.
    pub queue_family_index: u32,
    pub flags: vk::SwapchainCreateFlagsKHR,
    pub min_image_count: u32,
    pub image_format: vk::Format,
    pub image_color_space: vk::ColorSpaceKHR,
    pub image_extent: vk::Extent2D,
    pub image_array_layers: u32,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub clipped: bool,
}

impl SwapchainCreateInfo {
    /// A double-buffered FIFO swapchain of color attachments.
    pub fn new(surface: Surface, queue_family_index: u32, width: u32, height: u32) -> Self {
        Self {
            surface,
            queue_family_index,
            flags: vk::SwapchainCreateFlagsKHR::empty(),
            min_image_count: 2,
            image_format: vk::Format::B8G8R8A8_SRGB,
            image_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            image_extent: vk::Extent2D { width, height },
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: vk::PresentModeKHR::FIFO,
            clipped: true,
        }
    }
}

impl std::fmt::Debug for SwapchainCreateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapchainCreateInfo")
            .field("surface", &self.surface.vk_handle())
            .field("queue_family_index", &self.queue_family_index)
            .field("min_image_count", &self.min_image_count)
            .field("image_format", &self.image_format)
            .field("image_extent", &self.image_extent)
            .field("present_mode", &self.present_mode)
            .finish_non_exhaustive()
    }
}

pub struct Swapchain {
    driver: DriverRef,
    handle: vk::SwapchainKHR,
    /// Kept alive for as long as the swapchain presents to it.
    surface: Surface,
    images: SmallVec<[vk::Image; 3]>,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("images", &self.images.len())
            .field("format", &self.format)
            .field("extent", &self.extent)
            .finish()
    }
}

impl Swapchain {
    /// Presentable images, owned by the swapchain.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Acquires the next presentable image, signaling `semaphore` and
    /// `fence` once it is ready. Returns the image index and whether the
    /// swapchain no longer matches the surface exactly.
    ///
    /// `semaphore` must be binary.
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> Result<(u32, bool)> {
        if semaphore.is_some_and(|s| s.kind() != SemaphoreKind::Binary) {
            return Err(Error::invalid(
                ResourceKind::Semaphore,
                "image acquisition can only signal binary semaphores",
            ));
        }
        let semaphore = semaphore.map_or(vk::Semaphore::null(), |s| s.vk_handle());
        let fence = fence.map_or(vk::Fence::null(), |f| f.vk_handle());
        match self
            .driver
            .acquire_next_image(self.handle, timeout_ns, semaphore, fence)
        {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(Error::Timeout),
            Err(err) => Err(err.into()),
        }
    }
}

impl AsVkHandle for Swapchain {
    type Handle = vk::SwapchainKHR;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Swapchain {
    type CreateInfo = SwapchainCreateInfo;
    const KIND: ResourceKind = ResourceKind::Swapchain;
}

impl Managed for Swapchain {
    fn validate(device: &Device, info: &SwapchainCreateInfo) -> Result<()> {
        if !device.has_extension(ash::khr::swapchain::NAME) {
            return Err(Error::UnsupportedFeature(
                "swapchains need the VK_KHR_swapchain extension".into(),
            ));
        }
        let invalid = |reason: &str| Err(Error::invalid(ResourceKind::Swapchain, reason));
        if info.image_extent.width == 0 || info.image_extent.height == 0 {
            return invalid("swapchain extent is zero");
        }
        if info.min_image_count == 0 {
            return invalid("swapchain image count is zero");
        }
        if info.image_array_layers == 0 {
            return invalid("swapchain array layer count is zero");
        }
        if info.image_usage.is_empty() {
            return invalid("swapchain image usage is empty");
        }
        if !device.has_queue_family(info.queue_family_index) {
            return Err(Error::invalid(
                ResourceKind::Swapchain,
                format!(
                    "no queues were requested from family {}",
                    info.queue_family_index
                ),
            ));
        }
        if !device
            .physical_device()
            .supports_presentation(info.queue_family_index, &info.surface)?
        {
            return Err(Error::UnsupportedFeature(format!(
                "queue family {} cannot present to the surface",
                info.queue_family_index
            )));
        }
        Ok(())
    }

    fn create(device: &Device, info: SwapchainCreateInfo) -> Result<Self> {
        let driver = device.driver()?;
        let raw = vk::SwapchainCreateInfoKHR::default()
            .flags(info.flags)
            .surface(info.surface.vk_handle())
            .min_image_count(info.min_image_count)
            .image_format(info.image_format)
            .image_color_space(info.image_color_space)
            .image_extent(info.image_extent)
            .image_array_layers(info.image_array_layers)
            .image_usage(info.image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(info.pre_transform)
            .composite_alpha(info.composite_alpha)
            .present_mode(info.present_mode)
            .clipped(info.clipped);
        let handle: vk::SwapchainKHR = driver
            .create(NativeInfo::Swapchain(&raw))
            .map_err(Error::creation(ResourceKind::Swapchain))?;
        let images = match driver.swapchain_images(handle) {
            Ok(images) => images.into_iter().collect(),
            Err(err) => {
                driver.destroy(handle);
                return Err(err.into());
            }
        };
        tracing::info!(
            width = info.image_extent.width,
            height = info.image_extent.height,
            format = ?info.image_format,
            color_space = ?info.image_color_space,
            "created swapchain"
        );
        Ok(Self {
            driver: driver.clone(),
            handle,
            surface: info.surface,
            images,
            format: info.image_format,
            color_space: info.image_color_space,
            extent: info.image_extent,
            present_mode: info.present_mode,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}
