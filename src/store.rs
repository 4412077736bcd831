//! Per-kind object arenas.
//!
//! Every object a [`Device`] owns lives in exactly one generational arena,
//! selected at compile time through the [`Resource`] implementation of its
//! kind. The field order of [`Stores`] is the teardown order: objects that
//! reference others come first.

use slotmap::SlotMap;

use crate::{
    Device,
    buffer::Buffer,
    command::CommandPool,
    descriptor::{DescriptorPool, DescriptorSetLayout},
    driver::Driver,
    error::{ResourceKind, Result},
    handle::SlotKey,
    image::{DepthStencilView, Image, ImageView, RenderTargetView, Texture},
    pipeline::{ComputePipeline, GraphicsPipeline, PipelineCache, PipelineLayout},
    query::QueryPool,
    render_pass::RenderPass,
    sampler::Sampler,
    shader::{ShaderModule, ShaderProgram},
    swapchain::Swapchain,
    sync::{Event, Fence, Semaphore},
    utils::AsVkHandle,
};

/// An object kind owned and managed by a [`Device`].
///
/// Implemented by every kind the device can create. The trait is sealed: the
/// creation and destruction routines behind it are internal.
pub trait Resource: AsVkHandle + Managed + Send + Sync + 'static {
    /// Parameters accepted by [`Device::create`].
    type CreateInfo;
    const KIND: ResourceKind;
}

/// Native creation and destruction routines of a kind.
pub trait Managed: Stored {
    /// Checks the kind's preconditions. Runs before any native call.
    fn validate(device: &Device, info: &<Self as Resource>::CreateInfo) -> Result<()>
    where
        Self: Resource;

    /// Creates the native object. Only called after `validate` succeeded.
    fn create(device: &Device, info: <Self as Resource>::CreateInfo) -> Result<Self>
    where
        Self: Resource;

    fn destroy(self, driver: &dyn Driver);
}

/// Access to the arena of a kind.
pub trait Stored: Sized {
    fn store(stores: &Stores) -> &SlotMap<SlotKey, Self>;
    fn store_mut(stores: &mut Stores) -> &mut SlotMap<SlotKey, Self>;
}

macro_rules! stores {
    ($($field:ident: $kind:ty),* $(,)?) => {
        #[derive(Default)]
        pub struct Stores {
            $($field: SlotMap<SlotKey, $kind>,)*
        }

        $(
            impl Stored for $kind {
                fn store(stores: &Stores) -> &SlotMap<SlotKey, Self> {
                    &stores.$field
                }
                fn store_mut(stores: &mut Stores) -> &mut SlotMap<SlotKey, Self> {
                    &mut stores.$field
                }
            }
        )*

        impl Stores {
            /// Number of live objects across every kind.
            pub(crate) fn len(&self) -> usize {
                0 $(+ self.$field.len())*
            }

            /// Destroys every remaining object, kind by kind in field order.
            /// Returns how many were destroyed.
            pub(crate) fn drain(&mut self, driver: &dyn Driver) -> usize {
                let mut destroyed = 0;
                $(
                    let count = self.$field.len();
                    for (_, object) in self.$field.drain() {
                        object.destroy(driver);
                    }
                    if count > 0 {
                        tracing::debug!(kind = %<$kind as Resource>::KIND, count, "teardown");
                    }
                    destroyed += count;
                )*
                destroyed
            }
        }
    };
}

stores! {
    graphics_pipelines: GraphicsPipeline,
    compute_pipelines: ComputePipeline,
    pipeline_caches: PipelineCache,
    pipeline_layouts: PipelineLayout,
    descriptor_pools: DescriptorPool,
    descriptor_set_layouts: DescriptorSetLayout,
    shader_programs: ShaderProgram,
    shader_modules: ShaderModule,
    render_passes: RenderPass,
    depth_stencil_views: DepthStencilView,
    render_target_views: RenderTargetView,
    image_views: ImageView,
    textures: Texture,
    swapchains: Swapchain,
    samplers: Sampler,
    images: Image,
    buffers: Buffer,
    query_pools: QueryPool,
    command_pools: CommandPool,
    events: Event,
    fences: Fence,
    semaphores: Semaphore,
}
