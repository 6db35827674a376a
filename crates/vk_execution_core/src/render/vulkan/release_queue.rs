//! Deferred release of GPU-referenced objects
//!
//! Objects still referenced by recorded commands cannot be destroyed or reused
//! right away. They go through two stages:
//!
//! 1. **Stale**: released while commands referencing them may still be recorded.
//!    Tagged with the number of the next command buffer to be submitted.
//! 2. **Pending release**: the command buffer with that number has been submitted
//!    and its fence value is known. The object is released once the queue's
//!    timeline reaches that value.
//!
//! Objects handed to [`ReleaseQueue::discard_resource`] with a known fence skip the
//! first stage.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::native::{NativeDevice, NativeObject};
use super::sync::FenceValue;

/// Object whose destruction or recycling is deferred.
///
/// The release action runs when the last reference is dropped, so one object
/// can sit in the release queues of several hardware queues at once and is
/// only released once every one of them has let go.
pub struct StaleResource {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StaleResource {
    /// Run `release` when the resource is finally dropped
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            release: Some(Box::new(release)),
        })
    }

    /// Destroy a native object when the resource is finally dropped
    pub fn native(device: Arc<dyn NativeDevice>, object: NativeObject) -> Arc<Self> {
        Self::new(move || device.destroy(object))
    }
}

impl Drop for StaleResource {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Per-queue deferred release list
#[derive(Default)]
pub struct ReleaseQueue {
    stale: Mutex<VecDeque<(u64, Arc<StaleResource>)>>,
    pending: Mutex<VecDeque<(FenceValue, Arc<StaleResource>)>>,
}

impl ReleaseQueue {
    /// Create empty lists
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `resource` until the command buffer numbered `next_cmd_buffer_number`
    /// has been submitted
    pub fn safe_release_resource(&self, resource: Arc<StaleResource>, next_cmd_buffer_number: u64) {
        self.stale.lock().push_back((next_cmd_buffer_number, resource));
    }

    /// Release `resource` once the queue completes `fence_value`
    pub fn discard_resource(&self, resource: Arc<StaleResource>, fence_value: FenceValue) {
        self.pending.lock().push_back((fence_value, resource));
    }

    /// Move stale resources covered by the submitted command buffer into the
    /// release list, tagged with its fence value
    pub fn discard_stale_resources(&self, submitted_cmd_buffer_number: u64, fence_value: FenceValue) {
        let mut stale = self.stale.lock();
        let mut pending = self.pending.lock();
        while let Some((number, _)) = stale.front() {
            if *number > submitted_cmd_buffer_number {
                break;
            }
            if let Some((_, resource)) = stale.pop_front() {
                pending.push_back((fence_value, resource));
            }
        }
    }

    /// Drop every resource whose fence value is at most `completed`.
    ///
    /// Returns the number of entries released.
    pub fn purge(&self, completed: FenceValue) -> usize {
        let mut released = Vec::new();
        {
            let mut pending = self.pending.lock();
            while pending.front().is_some_and(|(value, _)| *value <= completed) {
                if let Some(entry) = pending.pop_front() {
                    released.push(entry);
                }
            }
        }
        // Release actions may take other locks, so they run after the list lock is gone
        let count = released.len();
        drop(released);
        count
    }

    /// Number of resources waiting for a submission
    pub fn stale_count(&self) -> usize {
        self.stale.lock().len()
    }

    /// Number of resources waiting for a fence
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: &Arc<AtomicUsize>) -> Arc<StaleResource> {
        let counter = counter.clone();
        StaleResource::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_purge_respects_fence_values() {
        let released = Arc::new(AtomicUsize::new(0));
        let queue = ReleaseQueue::new();
        queue.discard_resource(counted(&released), FenceValue::new(1));
        queue.discard_resource(counted(&released), FenceValue::new(3));

        assert_eq!(queue.purge(FenceValue::ZERO), 0);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert_eq!(queue.purge(FenceValue::new(2)), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        assert_eq!(queue.purge(FenceValue::new(3)), 1);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_stale_resources_wait_for_submission() {
        let released = Arc::new(AtomicUsize::new(0));
        let queue = ReleaseQueue::new();
        queue.safe_release_resource(counted(&released), 5);
        queue.safe_release_resource(counted(&released), 6);

        // Nothing is pending before the submission
        assert_eq!(queue.purge(FenceValue::MAX), 0);

        queue.discard_stale_resources(5, FenceValue::new(10));
        assert_eq!(queue.stale_count(), 1);
        assert_eq!(queue.pending_count(), 1);

        queue.purge(FenceValue::new(9));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        queue.purge(FenceValue::new(10));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_resource_released_by_last_queue() {
        let released = Arc::new(AtomicUsize::new(0));
        let graphics = ReleaseQueue::new();
        let compute = ReleaseQueue::new();

        let resource = counted(&released);
        graphics.discard_resource(resource.clone(), FenceValue::new(1));
        compute.discard_resource(resource, FenceValue::new(7));

        graphics.purge(FenceValue::new(1));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        compute.purge(FenceValue::new(7));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
