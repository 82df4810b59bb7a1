use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gpu::driver::{NativeStream, Operation};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{Backend, DeviceId};
use crate::sync::{Fence, Timeline};

const ABORTED: &str = "aborted during shutdown";
const BARRIER_POLL: Duration = Duration::from_millis(5);

struct Batch {
    value: u64,
    ops: Vec<Operation>,
}

#[derive(Default)]
struct QueueShared {
    abort: AtomicBool,
    aborted_ops: AtomicUsize,
    /// (fence value, operation count) of batches not yet retired.
    outstanding: Mutex<VecDeque<(u64, usize)>>,
}

impl QueueShared {
    fn retire(&self, value: u64) {
        let mut outstanding = self.outstanding.lock();
        while let Some((v, _)) = outstanding.front() {
            if *v > value {
                break;
            }
            outstanding.pop_front();
        }
    }
}

/// Host side of a device queue.
///
/// Each stream gets a worker thread that feeds submitted batches to the
/// backend in order and advances the stream's timeline as they retire.
/// Barriers are resolved on the worker by waiting on the named fences, so a
/// stream can depend on work from any device or backend.
pub(crate) struct StreamQueue {
    device: DeviceId,
    timeline: Arc<Timeline>,
    next_value: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<Batch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<QueueShared>,
}

enum BatchError {
    Aborted(usize),
    Failed(GPUError),
}

fn wait_barrier(fences: &[Fence], abort: &AtomicBool) -> Result<(), BatchError> {
    for fence in fences {
        loop {
            match fence.wait(BARRIER_POLL) {
                Ok(()) => break,
                Err(GPUError::TimedOut(_)) => {
                    if abort.load(Ordering::Acquire) {
                        return Err(BatchError::Aborted(0));
                    }
                }
                Err(err) => {
                    return Err(BatchError::Failed(GPUError::DeviceFailure {
                        backend: match &err {
                            GPUError::DeviceFailure { backend, .. } => *backend,
                            _ => Backend::Cpu,
                        },
                        message: format!("barrier dependency failed: {err}"),
                    }))
                }
            }
        }
    }
    Ok(())
}

/// Work operations in `ops`; barriers are bookkeeping and never count.
fn work_count(ops: &[Operation]) -> usize {
    ops.iter()
        .filter(|op| !matches!(op, Operation::Barrier(_)))
        .count()
}

fn run_batch(native: &mut dyn NativeStream, ops: &[Operation], abort: &AtomicBool) -> Result<(), BatchError> {
    let mut start = 0;
    let mut segments: Vec<(usize, usize, Option<&[Fence]>)> = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        if let Operation::Barrier(fences) = op {
            segments.push((start, i, Some(fences.as_slice())));
            start = i + 1;
        }
    }
    segments.push((start, ops.len(), None));

    for (begin, end, barrier) in segments {
        if abort.load(Ordering::Acquire) {
            return Err(BatchError::Aborted(work_count(&ops[begin..])));
        }

        if begin < end {
            if let Err(stop) = native.execute(&ops[begin..end], abort) {
                if abort.load(Ordering::Acquire) {
                    let resume = (begin + stop.completed).min(end);
                    return Err(BatchError::Aborted(work_count(&ops[resume..])));
                }
                return Err(BatchError::Failed(stop.error));
            }
        }

        if let Some(fences) = barrier {
            match wait_barrier(fences, abort) {
                Err(BatchError::Aborted(_)) => return Err(BatchError::Aborted(work_count(&ops[end..]))),
                other => other?,
            }
        }
    }
    Ok(())
}

fn worker_loop(
    mut native: Box<dyn NativeStream>,
    receiver: mpsc::Receiver<Batch>,
    timeline: Arc<Timeline>,
    shared: Arc<QueueShared>,
) {
    while let Ok(batch) = receiver.recv() {
        if shared.abort.load(Ordering::Acquire) {
            shared.aborted_ops.fetch_add(work_count(&batch.ops), Ordering::AcqRel);
            timeline.fail(batch.value, ABORTED);
        } else if timeline.failed() {
            // Earlier failure already covers this value.
        } else {
            match run_batch(&mut *native, &batch.ops, &shared.abort) {
                Ok(()) => timeline.signal(batch.value),
                Err(BatchError::Aborted(remaining)) => {
                    shared.aborted_ops.fetch_add(remaining, Ordering::AcqRel);
                    timeline.fail(batch.value, ABORTED);
                }
                Err(BatchError::Failed(err)) => {
                    tracing::error!(value = batch.value, %err, "batch failed");
                    timeline.fail(batch.value, err.to_string());
                }
            }
        }
        shared.retire(batch.value);
    }
}

impl StreamQueue {
    pub fn spawn(
        device: DeviceId,
        backend: Backend,
        native: Box<dyn NativeStream>,
        name: String,
    ) -> Result<Arc<Self>> {
        let timeline = Timeline::new(backend);
        let shared = Arc::new(QueueShared::default());
        let (sender, receiver) = mpsc::channel();

        let worker = {
            let timeline = timeline.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(native, receiver, timeline, shared))
                .map_err(|e| GPUError::DeviceFailure {
                    backend,
                    message: format!("failed to spawn stream worker: {e}"),
                })?
        };

        Ok(Arc::new(Self {
            device,
            timeline,
            next_value: AtomicU64::new(0),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            shared,
        }))
    }

    /// Hand `ops` to the worker. Returns the fence marking their completion.
    pub fn submit(&self, ops: Vec<Operation>) -> Result<Fence> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(GPUError::ShutDown)?;

        let value = self.next_value.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.outstanding.lock().push_back((value, ops.len()));
        if sender.send(Batch { value, ops }).is_err() {
            self.shared.retire(value);
            return Err(GPUError::ShutDown);
        }

        Ok(Fence::new(self.timeline.clone(), value, self.device))
    }

    pub fn last_fence(&self) -> Option<Fence> {
        match self.next_value.load(Ordering::Acquire) {
            0 => None,
            value => Some(Fence::new(self.timeline.clone(), value, self.device)),
        }
    }

    /// Operations submitted but not yet retired.
    pub fn outstanding_ops(&self) -> usize {
        self.shared.outstanding.lock().iter().map(|(_, n)| n).sum()
    }

    /// Wait for outstanding work until `deadline`, then abort whatever is
    /// left and stop the worker. Returns the number of aborted operations.
    pub fn drain(&self, deadline: Instant) -> usize {
        if let Some(fence) = self.last_fence() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(GPUError::TimedOut(_)) = fence.wait(remaining) {
                self.shared.abort.store(true, Ordering::Release);
            }
        }
        self.stop();
        self.shared.aborted_ops.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!(device = %self.device, "stream worker panicked");
                self.timeline.fail(self.next_value.load(Ordering::Acquire), "stream worker panicked");
            }
        }
    }
}

impl Drop for StreamQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
