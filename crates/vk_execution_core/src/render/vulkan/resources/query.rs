//! GPU queries
//!
//! A [`QueryManager`] owns one native query pool per query type. [`Query`]
//! objects borrow indices from it while they are in use and hand them back as
//! stale when they are restarted or dropped. Stale indices are reset in the
//! next flushed command buffer before they become available again.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::core::QueryPoolSizes;
use crate::foundation::logging::{debug, error, info, warn};
use crate::render::vulkan::commands::CommandBuffer;
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::native::NativeObject;
use crate::render::vulkan::sync::FenceValue;

/// Kind of GPU query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QueryType {
    /// Number of samples that passed the depth test
    Occlusion = 1,
    /// Whether any sample passed the depth test
    BinaryOcclusion = 2,
    /// GPU timestamp written at the end of the query
    Timestamp = 3,
    /// Pipeline invocation counters
    PipelineStatistics = 4,
    /// Pair of timestamps around a range of commands
    Duration = 5,
}

impl QueryType {
    /// Every query type
    pub const ALL: [QueryType; 5] = [
        QueryType::Occlusion,
        QueryType::BinaryOcclusion,
        QueryType::Timestamp,
        QueryType::PipelineStatistics,
        QueryType::Duration,
    ];

    /// Bit identifying the type in command buffer query masks
    pub fn type_bit(self) -> u32 {
        1 << self as u32
    }

    /// Native query indices used by one query of this type
    pub fn index_count(self) -> usize {
        match self {
            QueryType::Duration => 2,
            _ => 1,
        }
    }

    fn vk_query_type(self) -> vk::QueryType {
        match self {
            QueryType::Occlusion | QueryType::BinaryOcclusion => vk::QueryType::OCCLUSION,
            QueryType::Timestamp | QueryType::Duration => vk::QueryType::TIMESTAMP,
            QueryType::PipelineStatistics => vk::QueryType::PIPELINE_STATISTICS,
        }
    }

    fn configured_count(self, sizes: &QueryPoolSizes) -> u32 {
        match self {
            QueryType::Occlusion => sizes.occlusion,
            QueryType::BinaryOcclusion => sizes.binary_occlusion,
            QueryType::Timestamp => sizes.timestamp,
            QueryType::PipelineStatistics => sizes.pipeline_statistics,
            QueryType::Duration => sizes.duration * 2,
        }
    }

    fn slot(self) -> usize {
        self as usize - 1
    }
}

fn pipeline_statistics_flags(shader_stages: vk::PipelineStageFlags) -> vk::QueryPipelineStatisticFlags {
    let mut flags = vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS;
    if shader_stages.contains(vk::PipelineStageFlags::GEOMETRY_SHADER) {
        flags |= vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_INVOCATIONS
            | vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_PRIMITIVES;
    }
    if shader_stages.contains(vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER) {
        flags |= vk::QueryPipelineStatisticFlags::TESSELLATION_CONTROL_SHADER_PATCHES;
    }
    if shader_stages.contains(vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER) {
        flags |= vk::QueryPipelineStatisticFlags::TESSELLATION_EVALUATION_SHADER_INVOCATIONS;
    }
    flags
}

struct QueryPoolSlot {
    pool: vk::QueryPool,
    capacity: u32,
    available: VecDeque<u32>,
    stale: Vec<u32>,
    peak_allocated: u32,
}

/// Per-context owner of native query pools
pub struct QueryManager {
    device: Arc<RenderDevice>,
    pools: Mutex<[Option<QueryPoolSlot>; 5]>,
}

impl QueryManager {
    /// Create the pools enabled in the configuration and reset them on `queue_index`
    pub fn new(device: &Arc<RenderDevice>, queue_index: usize) -> VulkanResult<Arc<Self>> {
        let limits = *device.limits();
        let sizes = device.config().query_pool_sizes;
        let mut pools: [Option<QueryPoolSlot>; 5] = Default::default();

        for query_type in QueryType::ALL {
            let capacity = query_type.configured_count(&sizes);
            if capacity == 0 {
                continue;
            }
            let statistics = match query_type {
                QueryType::Occlusion if !limits.occlusion_query_precise => {
                    debug!("Precise occlusion queries are not supported");
                    continue;
                }
                QueryType::PipelineStatistics if !limits.pipeline_statistics_query => {
                    debug!("Pipeline statistics queries are not supported");
                    continue;
                }
                QueryType::PipelineStatistics => pipeline_statistics_flags(limits.enabled_graphics_shader_stages),
                _ => vk::QueryPipelineStatisticFlags::empty(),
            };

            let pool = device
                .native()
                .create_query_pool(query_type.vk_query_type(), capacity, statistics)?;
            pools[query_type.slot()] = Some(QueryPoolSlot {
                pool,
                capacity,
                available: (0..capacity).collect(),
                stale: Vec::new(),
                peak_allocated: 0,
            });
        }

        let manager = Arc::new(Self {
            device: Arc::clone(device),
            pools: Mutex::new(pools),
        });

        // Queries must be reset before first use
        let resets: Vec<(vk::QueryPool, u32)> = manager
            .pools
            .lock()
            .iter()
            .flatten()
            .map(|slot| (slot.pool, slot.capacity))
            .collect();
        if !resets.is_empty() {
            device.execute_transient(queue_index, |command_buffer| {
                for (pool, count) in resets {
                    command_buffer.reset_query_pool(pool, 0, count);
                }
            })?;
        }
        Ok(manager)
    }

    /// Native pool of `query_type`, `None` when the type is disabled
    pub fn pool(&self, query_type: QueryType) -> Option<vk::QueryPool> {
        self.pools.lock()[query_type.slot()].as_ref().map(|slot| slot.pool)
    }

    /// Take an available index from the pool of `query_type`
    pub fn allocate_query(&self, query_type: QueryType) -> Option<u32> {
        let mut pools = self.pools.lock();
        let slot = pools[query_type.slot()].as_mut()?;
        let index = slot.available.pop_front()?;
        let allocated = slot.capacity - slot.available.len() as u32;
        slot.peak_allocated = slot.peak_allocated.max(allocated);
        Some(index)
    }

    /// Return an index that must be reset before it is reused
    pub fn discard_query(&self, query_type: QueryType, index: u32) {
        if let Some(slot) = self.pools.lock()[query_type.slot()].as_mut() {
            slot.stale.push(index);
        }
    }

    /// Record resets of every stale index and make them available again
    pub fn reset_stale_queries(&self, command_buffer: &mut CommandBuffer) -> u32 {
        let mut reset = 0;
        for slot in self.pools.lock().iter_mut().flatten() {
            for index in slot.stale.drain(..) {
                command_buffer.reset_query_pool(slot.pool, index, 1);
                slot.available.push_front(index);
                reset += 1;
            }
        }
        reset
    }

    /// Number of indices of `query_type` ready for use
    pub fn available_count(&self, query_type: QueryType) -> usize {
        self.pools.lock()[query_type.slot()]
            .as_ref()
            .map_or(0, |slot| slot.available.len())
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        let mask = self.device.command_queue_mask();
        for (query_type, slot) in QueryType::ALL.into_iter().zip(self.pools.get_mut().iter_mut()) {
            let Some(slot) = slot.take() else {
                continue;
            };
            let outstanding = slot.capacity as usize - slot.available.len() - slot.stale.len();
            if outstanding != 0 {
                warn!("{outstanding} {query_type:?} query index(es) are still in use");
            }
            info!(
                "Peak {query_type:?} query usage: {} of {}",
                slot.peak_allocated, slot.capacity
            );
            self.device.safe_release_native_object(NativeObject::QueryPool(slot.pool), mask);
        }
    }
}

/// Life stage of a [`Query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Never begun
    Inactive,
    /// Begun but not ended
    Querying,
    /// Ended, results are written once the GPU passes [`Query::end_fence_value`]
    Ended,
}

/// Client query
pub struct Query {
    manager: Arc<QueryManager>,
    query_type: QueryType,
    indices: [Option<u32>; 2],
    state: QueryState,
    end_fence_value: FenceValue,
}

impl Query {
    /// Create a query served by `manager`
    pub fn new(manager: &Arc<QueryManager>, query_type: QueryType) -> Self {
        Self {
            manager: Arc::clone(manager),
            query_type,
            indices: [None; 2],
            state: QueryState::Inactive,
            end_fence_value: FenceValue::ZERO,
        }
    }

    /// Query type
    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Life stage
    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Fence value of the submission that ends the query
    pub fn end_fence_value(&self) -> FenceValue {
        self.end_fence_value
    }

    /// Native pool of the query type
    pub fn pool(&self) -> Option<vk::QueryPool> {
        self.manager.pool(self.query_type)
    }

    /// Native index `slot`, the second one only exists for duration queries
    pub fn index(&self, slot: usize) -> Option<u32> {
        self.indices.get(slot).copied().flatten()
    }

    fn discard_indices(&mut self) {
        for index in self.indices.iter_mut().filter_map(Option::take) {
            self.manager.discard_query(self.query_type, index);
        }
    }

    fn allocate_indices(&mut self) -> bool {
        self.discard_indices();
        for slot in 0..self.query_type.index_count() {
            match self.manager.allocate_query(self.query_type) {
                Some(index) => self.indices[slot] = Some(index),
                None => {
                    error!(
                        "Failed to allocate a {:?} query. Increase the query pool size in the engine configuration.",
                        self.query_type
                    );
                    self.discard_indices();
                    return false;
                }
            }
        }
        true
    }

    /// Prepare for a begin command. Returns false when no index is available.
    pub(crate) fn on_begin(&mut self) -> bool {
        if self.state == QueryState::Querying {
            error!("Attempting to begin a {:?} query that is already in progress", self.query_type);
            return false;
        }
        if !self.allocate_indices() {
            return false;
        }
        self.state = QueryState::Querying;
        true
    }

    /// Prepare for an end command. Returns false when the query cannot be ended.
    pub(crate) fn on_end(&mut self, end_fence_value: FenceValue) -> bool {
        if self.query_type == QueryType::Timestamp {
            if !self.allocate_indices() {
                return false;
            }
        } else if self.state != QueryState::Querying {
            error!("Attempting to end a {:?} query that has not been begun", self.query_type);
            return false;
        }
        self.state = QueryState::Ended;
        self.end_fence_value = end_fence_value;
        true
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.discard_indices();
    }
}
