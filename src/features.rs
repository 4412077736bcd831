//! Device feature negotiation.
//!
//! [`DeviceFeatures`] mirrors every boolean of `VkPhysicalDeviceFeatures` as a
//! flag, plus [`DeviceFeatures::TIMELINE_SEMAPHORE`] for the Vulkan 1.2
//! timeline semaphore capability. A physical device reports the set it
//! supports; a device is created with the subset it needs.

use ash::vk;
use bitflags::bitflags;

macro_rules! device_features {
    ($($bit:literal => $flag:ident: $field:ident,)*) => {
        bitflags! {
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct DeviceFeatures: u64 {
                $(const $flag = 1 << $bit;)*
                /// Timeline semaphores, reported through
                /// `VkPhysicalDeviceTimelineSemaphoreFeatures`.
                const TIMELINE_SEMAPHORE = 1 << 63;
            }
        }

        impl DeviceFeatures {
            /// Collects the core features set in `features`.
            pub fn from_vk(features: &vk::PhysicalDeviceFeatures) -> Self {
                let mut out = Self::empty();
                $(
                    if features.$field == vk::TRUE {
                        out |= Self::$flag;
                    }
                )*
                out
            }

            /// The core feature struct for these flags. `TIMELINE_SEMAPHORE` is not
            /// part of it and has to be chained separately.
            pub fn to_vk(self) -> vk::PhysicalDeviceFeatures {
                vk::PhysicalDeviceFeatures {
                    $($field: self.contains(Self::$flag) as vk::Bool32,)*
                    ..Default::default()
                }
            }
        }
    };
}

device_features! {
    0 => ROBUST_BUFFER_ACCESS: robust_buffer_access,
    1 => FULL_DRAW_INDEX_UINT32: full_draw_index_uint32,
    2 => IMAGE_CUBE_ARRAY: image_cube_array,
    3 => INDEPENDENT_BLEND: independent_blend,
    4 => GEOMETRY_SHADER: geometry_shader,
    5 => TESSELLATION_SHADER: tessellation_shader,
    6 => SAMPLE_RATE_SHADING: sample_rate_shading,
    7 => DUAL_SRC_BLEND: dual_src_blend,
    8 => LOGIC_OP: logic_op,
    9 => MULTI_DRAW_INDIRECT: multi_draw_indirect,
    10 => DRAW_INDIRECT_FIRST_INSTANCE: draw_indirect_first_instance,
    11 => DEPTH_CLAMP: depth_clamp,
    12 => DEPTH_BIAS_CLAMP: depth_bias_clamp,
    13 => FILL_MODE_NON_SOLID: fill_mode_non_solid,
    14 => DEPTH_BOUNDS: depth_bounds,
    15 => WIDE_LINES: wide_lines,
    16 => LARGE_POINTS: large_points,
    17 => ALPHA_TO_ONE: alpha_to_one,
    18 => MULTI_VIEWPORT: multi_viewport,
    19 => SAMPLER_ANISOTROPY: sampler_anisotropy,
    20 => TEXTURE_COMPRESSION_ETC2: texture_compression_etc2,
    21 => TEXTURE_COMPRESSION_ASTC_LDR: texture_compression_astc_ldr,
    22 => TEXTURE_COMPRESSION_BC: texture_compression_bc,
    23 => OCCLUSION_QUERY_PRECISE: occlusion_query_precise,
    24 => PIPELINE_STATISTICS_QUERY: pipeline_statistics_query,
    25 => VERTEX_PIPELINE_STORES_AND_ATOMICS: vertex_pipeline_stores_and_atomics,
    26 => FRAGMENT_STORES_AND_ATOMICS: fragment_stores_and_atomics,
    27 => SHADER_TESSELLATION_AND_GEOMETRY_POINT_SIZE: shader_tessellation_and_geometry_point_size,
    28 => SHADER_IMAGE_GATHER_EXTENDED: shader_image_gather_extended,
    29 => SHADER_STORAGE_IMAGE_EXTENDED_FORMATS: shader_storage_image_extended_formats,
    30 => SHADER_STORAGE_IMAGE_MULTISAMPLE: shader_storage_image_multisample,
    31 => SHADER_STORAGE_IMAGE_READ_WITHOUT_FORMAT: shader_storage_image_read_without_format,
    32 => SHADER_STORAGE_IMAGE_WRITE_WITHOUT_FORMAT: shader_storage_image_write_without_format,
    33 => SHADER_UNIFORM_BUFFER_ARRAY_DYNAMIC_INDEXING: shader_uniform_buffer_array_dynamic_indexing,
    34 => SHADER_SAMPLED_IMAGE_ARRAY_DYNAMIC_INDEXING: shader_sampled_image_array_dynamic_indexing,
    35 => SHADER_STORAGE_BUFFER_ARRAY_DYNAMIC_INDEXING: shader_storage_buffer_array_dynamic_indexing,
    36 => SHADER_STORAGE_IMAGE_ARRAY_DYNAMIC_INDEXING: shader_storage_image_array_dynamic_indexing,
    37 => SHADER_CLIP_DISTANCE: shader_clip_distance,
    38 => SHADER_CULL_DISTANCE: shader_cull_distance,
    39 => SHADER_FLOAT64: shader_float64,
    40 => SHADER_INT64: shader_int64,
    41 => SHADER_INT16: shader_int16,
    42 => SHADER_RESOURCE_RESIDENCY: shader_resource_residency,
    43 => SHADER_RESOURCE_MIN_LOD: shader_resource_min_lod,
    44 => SPARSE_BINDING: sparse_binding,
    45 => SPARSE_RESIDENCY_BUFFER: sparse_residency_buffer,
    46 => SPARSE_RESIDENCY_IMAGE_2D: sparse_residency_image2_d,
    47 => SPARSE_RESIDENCY_IMAGE_3D: sparse_residency_image3_d,
    48 => SPARSE_RESIDENCY_2_SAMPLES: sparse_residency2_samples,
    49 => SPARSE_RESIDENCY_4_SAMPLES: sparse_residency4_samples,
    50 => SPARSE_RESIDENCY_8_SAMPLES: sparse_residency8_samples,
    51 => SPARSE_RESIDENCY_16_SAMPLES: sparse_residency16_samples,
    52 => SPARSE_RESIDENCY_ALIASED: sparse_residency_aliased,
    53 => VARIABLE_MULTISAMPLE_RATE: variable_multisample_rate,
    54 => INHERITED_QUERIES: inherited_queries,
}

impl Default for DeviceFeatures {
    /// The features a device enables when the caller does not choose.
    fn default() -> Self {
        Self::GEOMETRY_SHADER
            | Self::TESSELLATION_SHADER
            | Self::DUAL_SRC_BLEND
            | Self::SAMPLER_ANISOTROPY
            | Self::PIPELINE_STATISTICS_QUERY
            | Self::TIMELINE_SEMAPHORE
    }
}

impl DeviceFeatures {
    /// Human readable list of the flag names, for error messages.
    pub fn names(self) -> String {
        self.iter_names()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_round_trip_keeps_core_bits() {
        let features = DeviceFeatures::SAMPLER_ANISOTROPY
            | DeviceFeatures::SPARSE_RESIDENCY_IMAGE_3D
            | DeviceFeatures::INHERITED_QUERIES
            | DeviceFeatures::TIMELINE_SEMAPHORE;
        let raw = features.to_vk();
        assert_eq!(raw.sampler_anisotropy, vk::TRUE);
        assert_eq!(raw.sparse_residency_image3_d, vk::TRUE);
        assert_eq!(raw.geometry_shader, vk::FALSE);
        assert_eq!(
            DeviceFeatures::from_vk(&raw),
            features - DeviceFeatures::TIMELINE_SEMAPHORE
        );
    }

    #[test]
    fn defaults_and_names() {
        let defaults = DeviceFeatures::default();
        assert!(defaults.contains(DeviceFeatures::TIMELINE_SEMAPHORE));
        assert!(!defaults.contains(DeviceFeatures::ROBUST_BUFFER_ACCESS));
        assert_eq!(
            (DeviceFeatures::WIDE_LINES | DeviceFeatures::LARGE_POINTS).names(),
            "WIDE_LINES, LARGE_POINTS"
        );
    }
}
