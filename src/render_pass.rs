//! Render passes.

use std::fmt::Debug;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device,
    driver::{Driver, NativeInfo},
    error::{Error, ResourceKind, Result},
    store::{Managed, Resource},
    utils::AsVkHandle,
};

/// Attachment usage of one subpass. Indices refer to
/// [`RenderPassCreateInfo::attachments`].
#[derive(Debug, Clone, Default)]
pub struct SubpassInfo {
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassCreateInfo {
    pub attachments: Vec<vk::AttachmentDescription>,
    /// At least one.
    pub subpasses: Vec<SubpassInfo>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassCreateInfo {
    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::invalid(ResourceKind::RenderPass, reason));
        if self.subpasses.is_empty() {
            return invalid("a render pass needs at least one subpass".into());
        }
        let attachment_count = self.attachments.len() as u32;
        for (index, subpass) in self.subpasses.iter().enumerate() {
            let references = subpass
                .input_attachments
                .iter()
                .chain(&subpass.color_attachments)
                .chain(&subpass.depth_stencil_attachment);
            for reference in references {
                if reference.attachment != vk::ATTACHMENT_UNUSED
                    && reference.attachment >= attachment_count
                {
                    return invalid(format!(
                        "subpass {index} references attachment {} of {attachment_count}",
                        reference.attachment
                    ));
                }
            }
        }
        let subpass_count = self.subpasses.len() as u32;
        let in_range = |subpass: u32| subpass == vk::SUBPASS_EXTERNAL || subpass < subpass_count;
        if let Some(dependency) = self
            .dependencies
            .iter()
            .find(|d| !in_range(d.src_subpass) || !in_range(d.dst_subpass))
        {
            return invalid(format!(
                "dependency {} -> {} references a missing subpass",
                dependency.src_subpass, dependency.dst_subpass
            ));
        }
        Ok(())
    }
}

pub struct RenderPass {
    handle: vk::RenderPass,
    attachments: Vec<vk::AttachmentDescription>,
    /// Color attachment count of each subpass.
    subpass_colors: SmallVec<[u32; 4]>,
}

impl Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("attachments", &self.attachments.len())
            .field("subpasses", &self.subpass_colors.len())
            .finish()
    }
}

impl RenderPass {
    pub fn attachments(&self) -> &[vk::AttachmentDescription] {
        &self.attachments
    }

    pub fn subpass_count(&self) -> u32 {
        self.subpass_colors.len() as u32
    }

    /// `None` if the subpass does not exist.
    pub fn color_attachment_count(&self, subpass: u32) -> Option<u32> {
        self.subpass_colors.get(subpass as usize).copied()
    }
}

impl AsVkHandle for RenderPass {
    type Handle = vk::RenderPass;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for RenderPass {
    type CreateInfo = RenderPassCreateInfo;
    const KIND: ResourceKind = ResourceKind::RenderPass;
}

impl Managed for RenderPass {
    fn validate(_: &Device, info: &RenderPassCreateInfo) -> Result<()> {
        info.validate()
    }

    fn create(device: &Device, info: RenderPassCreateInfo) -> Result<Self> {
        let subpasses: SmallVec<[vk::SubpassDescription<'_>; 4]> = info
            .subpasses
            .iter()
            .map(|subpass| {
                let description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&subpass.input_attachments)
                    .color_attachments(&subpass.color_attachments);
                match &subpass.depth_stencil_attachment {
                    Some(depth) => description.depth_stencil_attachment(depth),
                    None => description,
                }
            })
            .collect();
        let raw = vk::RenderPassCreateInfo::default()
            .attachments(&info.attachments)
            .subpasses(&subpasses)
            .dependencies(&info.dependencies);
        let handle = device
            .driver()?
            .create(NativeInfo::RenderPass(&raw))
            .map_err(Error::creation(ResourceKind::RenderPass))?;
        let subpass_colors = info
            .subpasses
            .iter()
            .map(|s| s.color_attachments.len() as u32)
            .collect();
        Ok(Self {
            handle,
            attachments: info.attachments,
            subpass_colors,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::tests::device;

    /// One color attachment written by one subpass.
    pub(crate) fn single_color_pass() -> RenderPassCreateInfo {
        RenderPassCreateInfo {
            attachments: vec![vk::AttachmentDescription {
                format: vk::Format::B8G8R8A8_SRGB,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            }],
            subpasses: vec![SubpassInfo {
                color_attachments: vec![vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn references_must_be_in_range() {
        let mut device = device();
        assert!(matches!(
            device.create_render_pass(RenderPassCreateInfo::default()),
            Err(Error::InvalidParams {
                kind: ResourceKind::RenderPass,
                ..
            })
        ));

        let mut dangling = single_color_pass();
        dangling.subpasses[0].depth_stencil_attachment = Some(vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        assert!(device.create_render_pass(dangling).is_err());

        let mut bad_dependency = single_color_pass();
        bad_dependency.dependencies.push(vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 1,
            ..Default::default()
        });
        assert!(device.create_render_pass(bad_dependency).is_err());
        assert_eq!(device.count::<RenderPass>(), 0);

        let mut unused = single_color_pass();
        unused.subpasses[0].color_attachments.push(vk::AttachmentReference {
            attachment: vk::ATTACHMENT_UNUSED,
            layout: vk::ImageLayout::UNDEFINED,
        });
        let handle = device.create_render_pass(unused).unwrap();
        let pass = device.get(handle).unwrap();
        assert_eq!(pass.subpass_count(), 1);
        assert_eq!(pass.color_attachment_count(0), Some(2));
        assert_eq!(pass.color_attachment_count(1), None);
    }
}
