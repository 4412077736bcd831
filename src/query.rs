//! Query pools.

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPoolCreateInfo {
    pub query_type: vk::QueryType,
    /// Number of queries. Must be non-zero.
    pub count: u32,
    /// Counters of a `PIPELINE_STATISTICS` pool. Ignored for other types.
    pub pipeline_statistics: vk::QueryPipelineStatisticFlags,
}

impl Default for QueryPoolCreateInfo {
    fn default() -> Self {
        Self {
            query_type: vk::QueryType::TIMESTAMP,
            count: 0,
            pipeline_statistics: vk::QueryPipelineStatisticFlags::empty(),
        }
    }
}

pub struct QueryPool {
    handle: vk::QueryPool,
    query_type: vk::QueryType,
    count: u32,
}

impl Debug for QueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPool")
            .field("handle", &self.handle)
            .field("query_type", &self.query_type)
            .field("count", &self.count)
            .finish()
    }
}

impl QueryPool {
    pub fn query_type(&self) -> vk::QueryType {
        self.query_type
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl AsVkHandle for QueryPool {
    type Handle = vk::QueryPool;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for QueryPool {
    type CreateInfo = QueryPoolCreateInfo;
    const KIND: ResourceKind = ResourceKind::QueryPool;
}

impl Managed for QueryPool {
    fn validate(device: &Device, info: &QueryPoolCreateInfo) -> Result<()> {
        if info.count == 0 {
            return Err(Error::invalid(ResourceKind::QueryPool, "query count is zero"));
        }
        if info.query_type == vk::QueryType::PIPELINE_STATISTICS {
            if !device
                .enabled_features()
                .contains(DeviceFeatures::PIPELINE_STATISTICS_QUERY)
            {
                return Err(Error::UnsupportedFeature(
                    "pipeline statistics queries need the PIPELINE_STATISTICS_QUERY feature".into(),
                ));
            }
            if info.pipeline_statistics.is_empty() {
                return Err(Error::invalid(
                    ResourceKind::QueryPool,
                    "a pipeline statistics pool needs at least one counter",
                ));
            }
        }
        Ok(())
    }

    fn create(device: &Device, info: QueryPoolCreateInfo) -> Result<Self> {
        let statistics = if info.query_type == vk::QueryType::PIPELINE_STATISTICS {
            info.pipeline_statistics
        } else {
            vk::QueryPipelineStatisticFlags::empty()
        };
        let raw = vk::QueryPoolCreateInfo::default()
            .query_type(info.query_type)
            .query_count(info.count)
            .pipeline_statistics(statistics);
        let handle = device
            .driver()?
            .create(NativeInfo::QueryPool(&raw))
            .map_err(Error::creation(ResourceKind::QueryPool))?;
        Ok(Self {
            handle,
            query_type: info.query_type,
            count: info.count,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}
