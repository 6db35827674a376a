//! GPU progress tracking
//!
//! A [`FenceTimeline`] associates a monotonically increasing [`FenceValue`]
//! with native fences. Every queue submission gets the next value and a fence
//! from the device-wide [`FencePool`]. Polling the timeline drains signaled
//! fences oldest-first and returns them to the pool.
//!
//! ## Usage Pattern
//!
//! ```text
//! submit  -> value N, fence F   -> timeline.add_pending(N, F)
//! poll    -> get_completed_value() >= N once F is signaled
//! release -> anything tagged with N may now be recycled
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::error::{VulkanError, VulkanResult};
use super::native::{NativeDevice, NativeObject};
use crate::foundation::logging::{debug, error};

/// Point on a queue's execution timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(u64);

impl FenceValue {
    /// Nothing has completed yet
    pub const ZERO: Self = Self(0);
    /// Every submission, used to drain a timeline completely
    pub const MAX: Self = Self(u64::MAX);

    /// Wrap a raw value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The value that follows this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FenceValue {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Device-wide pool of unsignaled native fences
pub struct FencePool {
    device: Arc<dyn NativeDevice>,
    fences: Mutex<Vec<vk::Fence>>,
}

impl FencePool {
    /// Create an empty pool
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device,
            fences: Mutex::new(Vec::new()),
        }
    }

    /// Take an unsignaled fence, creating one when the pool is empty
    pub fn get_fence(&self) -> VulkanResult<vk::Fence> {
        if let Some(fence) = self.fences.lock().pop() {
            return Ok(fence);
        }
        self.device.create_fence(false)
    }

    /// Return a signaled fence. It is reset before it becomes available again.
    pub fn dispose_fence(&self, fence: vk::Fence) {
        match self.device.reset_fence(fence) {
            Ok(()) => self.fences.lock().push(fence),
            Err(err) => {
                error!("Failed to reset fence, destroying it instead: {err}");
                self.device.destroy(NativeObject::Fence(fence));
            }
        }
    }

    /// Number of idle fences
    pub fn len(&self) -> usize {
        self.fences.lock().len()
    }

    /// Whether the pool holds no idle fences
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        for fence in self.fences.get_mut().drain(..) {
            self.device.destroy(NativeObject::Fence(fence));
        }
    }
}

/// Monotonic counter of completed GPU work backed by native fences.
///
/// Also serves as the client-facing fence object: client code signals it
/// through a device context and waits on it from the host.
pub struct FenceTimeline {
    device: Arc<dyn NativeDevice>,
    pool: Arc<FencePool>,
    pending: Mutex<VecDeque<(FenceValue, vk::Fence)>>,
    last_completed: AtomicU64,
}

impl FenceTimeline {
    /// Create a timeline with nothing completed
    pub fn new(device: Arc<dyn NativeDevice>, pool: Arc<FencePool>) -> Self {
        Self {
            device,
            pool,
            pending: Mutex::new(VecDeque::new()),
            last_completed: AtomicU64::new(0),
        }
    }

    /// Register a native fence that is signaled once work up to `value` completes
    pub fn add_pending(&self, value: FenceValue, fence: vk::Fence) {
        let mut pending = self.pending.lock();
        debug_assert!(
            pending.back().map_or(true, |(last, _)| *last <= value),
            "fence values must be added in increasing order"
        );
        pending.push_back((value, fence));
    }

    /// Poll signaled fences and return the last completed value. Never blocks.
    pub fn get_completed_value(&self) -> FenceValue {
        let mut pending = self.pending.lock();
        while let Some(&(value, fence)) = pending.front() {
            match self.device.get_fence_status(fence) {
                Ok(true) => {
                    pending.pop_front();
                    self.pool.dispose_fence(fence);
                    self.advance(value);
                }
                Ok(false) => break,
                Err(err) => {
                    error!("Failed to query fence status: {err}");
                    break;
                }
            }
        }
        self.last_completed_value()
    }

    /// Last completed value observed by a previous poll or wait
    pub fn last_completed_value(&self) -> FenceValue {
        FenceValue(self.last_completed.load(Ordering::Acquire))
    }

    /// Whether work up to `value` has completed
    pub fn is_signaled(&self, value: FenceValue) -> bool {
        value <= self.get_completed_value()
    }

    /// Block until every pending entry up to `value` has been signaled.
    ///
    /// `FenceValue::MAX` drains the whole timeline.
    pub fn wait(&self, value: FenceValue) -> VulkanResult<()> {
        let mut pending = self.pending.lock();
        while let Some(&(pending_value, fence)) = pending.front() {
            if pending_value > value {
                break;
            }

            if !self.device.get_fence_status(fence)? {
                self.device.wait_for_fence(fence)?;
            }

            pending.pop_front();
            self.pool.dispose_fence(fence);
            self.advance(pending_value);
        }
        Ok(())
    }

    /// Move the completed value forward to `value` without waiting
    pub fn reset(&self, value: FenceValue) -> VulkanResult<()> {
        let current = self.last_completed_value();
        if value < current {
            return Err(VulkanError::invalid_operation(format!(
                "Fence value cannot move backwards (current: {current}, requested: {value})"
            )));
        }
        self.advance(value);
        Ok(())
    }

    /// Number of fences that have not been observed as signaled
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn advance(&self, value: FenceValue) {
        self.last_completed.fetch_max(value.get(), Ordering::AcqRel);
    }
}

impl Drop for FenceTimeline {
    fn drop(&mut self) {
        if self.pending_count() > 0 {
            debug!("Waiting for {} pending fence(s) before destroying timeline", self.pending_count());
            if let Err(err) = self.wait(FenceValue::MAX) {
                error!("Failed to wait for pending fences: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::mock::MockDevice;

    fn timeline() -> (Arc<MockDevice>, Arc<FencePool>, FenceTimeline) {
        let device = Arc::new(MockDevice::new());
        let pool = Arc::new(FencePool::new(device.clone()));
        let timeline = FenceTimeline::new(device.clone(), pool.clone());
        (device, pool, timeline)
    }

    #[test]
    fn test_fence_value_ordering() {
        assert!(FenceValue::new(3) < FenceValue::new(4));
        assert_eq!(FenceValue::new(3).next(), FenceValue::new(4));
        assert_eq!(FenceValue::MAX.next(), FenceValue::MAX);
    }

    #[test]
    fn test_completed_value_drains_in_order() {
        let (device, pool, timeline) = timeline();
        let first = pool.get_fence().unwrap();
        let second = pool.get_fence().unwrap();
        timeline.add_pending(FenceValue::new(1), first);
        timeline.add_pending(FenceValue::new(2), second);

        assert_eq!(timeline.get_completed_value(), FenceValue::ZERO);

        // Only the newer fence signaled: the older one still blocks the drain
        device.wait_for_fence(second).unwrap();
        assert_eq!(timeline.get_completed_value(), FenceValue::ZERO);

        device.wait_for_fence(first).unwrap();
        assert_eq!(timeline.get_completed_value(), FenceValue::new(2));
        assert_eq!(timeline.pending_count(), 0);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_wait_stops_at_requested_value() {
        let (_device, pool, timeline) = timeline();
        for value in 1..=3 {
            timeline.add_pending(FenceValue::new(value), pool.get_fence().unwrap());
        }

        timeline.wait(FenceValue::new(2)).unwrap();
        assert_eq!(timeline.last_completed_value(), FenceValue::new(2));
        assert_eq!(timeline.pending_count(), 1);

        timeline.wait(FenceValue::MAX).unwrap();
        assert_eq!(timeline.last_completed_value(), FenceValue::new(3));
        assert_eq!(timeline.pending_count(), 0);
    }

    #[test]
    fn test_reset_is_forward_only() {
        let (_device, _pool, timeline) = timeline();
        timeline.reset(FenceValue::new(10)).unwrap();
        assert_eq!(timeline.last_completed_value(), FenceValue::new(10));
        assert!(timeline.reset(FenceValue::new(5)).is_err());
        assert_eq!(timeline.last_completed_value(), FenceValue::new(10));
    }

    #[test]
    fn test_pool_recycles_fences() {
        let (device, pool, _timeline) = timeline();
        let fence = pool.get_fence().unwrap();
        pool.dispose_fence(fence);
        assert_eq!(pool.get_fence().unwrap(), fence);
        assert!(!device.get_fence_status(fence).unwrap());
    }
}
