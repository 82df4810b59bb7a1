//! Completion tracking for submitted work.
//!
//! Every command stream owns one [`Timeline`], a monotonically increasing
//! counter advanced by the stream's queue as batches retire. A [`Fence`] is a
//! (timeline, value) pair: it is complete once the counter has reached its
//! value. Failures are sticky; once a batch fails, that value and every later
//! value on the timeline report the failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{Backend, DeviceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Completed,
}

#[derive(Default)]
struct TimelineState {
    completed: u64,
    failure: Option<(u64, String)>,
}

pub struct Timeline {
    backend: Backend,
    state: Mutex<TimelineState>,
    cond: Condvar,
}

impl Timeline {
    pub(crate) fn new(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(TimelineState::default()),
            cond: Condvar::new(),
        })
    }

    /// Mark every value up to `value` as retired.
    pub(crate) fn signal(&self, value: u64) {
        let mut state = self.state.lock();
        if value > state.completed {
            state.completed = value;
        }
        self.cond.notify_all();
    }

    /// Record a failure at `value`. The first failure wins.
    pub(crate) fn fail(&self, value: u64, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((value, message.into()));
        }
        self.cond.notify_all();
    }

    pub(crate) fn failed(&self) -> bool {
        self.state.lock().failure.is_some()
    }

    pub fn completed_value(&self) -> u64 {
        self.state.lock().completed
    }

    fn status_locked(&self, state: &TimelineState, value: u64) -> Result<FenceStatus> {
        if let Some((failed_at, message)) = &state.failure {
            if value >= *failed_at {
                return Err(GPUError::DeviceFailure {
                    backend: self.backend,
                    message: message.clone(),
                });
            }
        }

        if state.completed >= value {
            Ok(FenceStatus::Completed)
        } else {
            Ok(FenceStatus::Pending)
        }
    }

    pub(crate) fn status(&self, value: u64) -> Result<FenceStatus> {
        let state = self.state.lock();
        self.status_locked(&state, value)
    }

    pub(crate) fn wait(&self, value: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if self.status_locked(&state, value)? == FenceStatus::Completed {
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return match self.status_locked(&state, value)? {
                            FenceStatus::Completed => Ok(()),
                            FenceStatus::Pending => Err(GPUError::TimedOut(timeout)),
                        };
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// Completion token for one submission on a command stream.
#[derive(Clone)]
pub struct Fence {
    timeline: Arc<Timeline>,
    value: u64,
    device: DeviceId,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("device", &self.device)
            .field("value", &self.value)
            .field("completed", &self.timeline.completed_value())
            .finish()
    }
}

impl Fence {
    pub(crate) fn new(timeline: Arc<Timeline>, value: u64, device: DeviceId) -> Self {
        Self {
            timeline,
            value,
            device,
        }
    }

    /// Block until the fence completes or `timeout` elapses.
    ///
    /// A timeout leaves the fence pending; the work it marks keeps running.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.timeline.wait(self.value, timeout)
    }

    pub fn poll(&self) -> Result<FenceStatus> {
        self.timeline.status(self.value)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.poll(), Ok(FenceStatus::Completed))
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_and_stays_pending() {
        let timeline = Timeline::new(Backend::Cpu);
        let fence = Fence::new(timeline.clone(), 1, DeviceId(0));

        assert_eq!(fence.poll().unwrap(), FenceStatus::Pending);
        let err = fence.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, GPUError::TimedOut(_)));
        assert_eq!(fence.poll().unwrap(), FenceStatus::Pending);

        timeline.signal(1);
        fence.wait(Duration::from_millis(10)).unwrap();
        assert!(fence.is_complete());
    }

    #[test]
    fn later_values_complete_after_earlier() {
        let timeline = Timeline::new(Backend::Cpu);
        let first = Fence::new(timeline.clone(), 1, DeviceId(0));
        let second = Fence::new(timeline.clone(), 2, DeviceId(0));

        timeline.signal(1);
        assert!(first.is_complete());
        assert!(!second.is_complete());

        let signaller = {
            let timeline = timeline.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                timeline.signal(2);
            })
        };
        second.wait(Duration::from_secs(5)).unwrap();
        signaller.join().unwrap();
    }

    #[test]
    fn failure_is_sticky() {
        let timeline = Timeline::new(Backend::Cuda);
        timeline.signal(1);
        timeline.fail(2, "copy faulted");
        timeline.signal(3);

        assert!(Fence::new(timeline.clone(), 1, DeviceId(0)).is_complete());
        for value in [2, 3] {
            let err = Fence::new(timeline.clone(), value, DeviceId(0))
                .wait(Duration::from_millis(1))
                .unwrap_err();
            match err {
                GPUError::DeviceFailure { backend, message } => {
                    assert_eq!(backend, Backend::Cuda);
                    assert_eq!(message, "copy faulted");
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }
}
