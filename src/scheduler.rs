//! Hardware Scheduler Model
//!
//! Each engine hands its batches to an async task over an mpsc channel.
//! The task decodes every batch, accumulates per-engine statistics and
//! retires the batch: the engine tag and a watch channel both move to the
//! batch's task count. Blocking waits drive the watch channel from the
//! calling thread, which must not be an async worker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::cmd_parse::{parse_command_buffer, CommandCounts};
use crate::csr::{BatchBuffer, ChannelFactory, EngineId, SubmissionChannel, TagAddress};
use crate::error::{lock_poisoned, DriverError, Result, SubmissionStatus};

/// What one engine has executed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub engine: EngineId,
    pub batches: u64,
    pub bytes: u64,
    pub last_task_count: u64,
    pub relaxed_ordering_batches: u64,
    pub malformed_batches: u64,
    pub counts: CommandCounts,
}

type SharedStats = Arc<Mutex<BTreeMap<EngineId, EngineStats>>>;

pub struct HardwareScheduler {
    handle: Handle,
    latency: Duration,
    stats: SharedStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HardwareScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareScheduler")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl HardwareScheduler {
    /// `latency` is how long each batch takes to execute.
    pub fn new(handle: Handle, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            handle,
            latency,
            stats: Arc::new(Mutex::new(BTreeMap::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Factory that gives every engine its own scheduler task.
    pub fn channel_factory(self: &Arc<Self>) -> ChannelFactory {
        let scheduler = self.clone();
        Arc::new(move |engine, tag| Box::new(scheduler.spawn_engine(engine, tag)) as Box<dyn SubmissionChannel>)
    }

    fn spawn_engine(&self, engine: EngineId, tag: TagAddress) -> ScheduledChannel {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (retired, completed) = watch::channel(tag.completed());
        let task = self.handle.spawn(run_engine(
            engine,
            receiver,
            retired,
            tag,
            self.stats.clone(),
            self.latency,
        ));
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => warn!("Scheduler task list poisoned, engine {} task detached", engine),
        }
        debug!("Scheduler task started for engine {}", engine);
        ScheduledChannel {
            engine,
            sender,
            completed,
            handle: self.handle.clone(),
        }
    }

    /// Per-engine statistics, ordered by engine id.
    pub fn stats(&self) -> Result<Vec<EngineStats>> {
        let stats = self.stats.lock().map_err(|_| lock_poisoned("scheduler stats"))?;
        Ok(stats.values().copied().collect())
    }

    /// Stop every engine task. Batches still queued are dropped.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        debug!("Hardware scheduler stopped");
    }
}

async fn run_engine(
    engine: EngineId,
    mut receiver: mpsc::UnboundedReceiver<BatchBuffer>,
    retired: watch::Sender<u64>,
    tag: TagAddress,
    stats: SharedStats,
    latency: Duration,
) {
    while let Some(batch) = receiver.recv().await {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut counts = CommandCounts::default();
        let mut malformed = false;
        let mut bytes = 0u64;
        for buffer in std::iter::once(&batch.commands).chain(batch.chained.iter()) {
            bytes += buffer.len() as u64;
            match parse_command_buffer(buffer) {
                Ok(commands) => counts.accumulate(&CommandCounts::from_commands(&commands)),
                Err(err) => {
                    warn!("Engine {} task {}: {}", engine, batch.task_count, err);
                    malformed = true;
                }
            }
        }

        match stats.lock() {
            Ok(mut stats) => {
                let entry = stats.entry(engine).or_insert_with(|| EngineStats {
                    engine,
                    ..Default::default()
                });
                entry.batches += 1;
                entry.bytes += bytes;
                entry.last_task_count = batch.task_count;
                entry.counts.accumulate(&counts);
                if batch.has_relaxed_ordering_dependencies {
                    entry.relaxed_ordering_batches += 1;
                }
                if malformed {
                    entry.malformed_batches += 1;
                }
            }
            Err(_) => {
                error!("Scheduler statistics poisoned, engine {} stopping", engine);
                break;
            }
        }

        tag.update(batch.task_count);
        retired.send_replace(batch.task_count);
        trace!(
            "Engine {} retired task {} ({} walkers, {} SBA)",
            engine,
            batch.task_count,
            counts.compute_walker,
            counts.state_base_address
        );
    }
    debug!("Engine {} scheduler task exiting", engine);
}

/// Submission side of one engine's scheduler task.
#[derive(Debug)]
struct ScheduledChannel {
    engine: EngineId,
    sender: mpsc::UnboundedSender<BatchBuffer>,
    completed: watch::Receiver<u64>,
    handle: Handle,
}

impl SubmissionChannel for ScheduledChannel {
    fn submit(&mut self, batch: BatchBuffer) -> SubmissionStatus {
        match self.sender.send(batch) {
            Ok(()) => SubmissionStatus::Success,
            Err(_) => {
                warn!("Engine {} scheduler is gone", self.engine);
                SubmissionStatus::DeviceUninitialized
            }
        }
    }

    fn wait_for_task_count(&self, task_count: u64, timeout: Duration) -> Result<()> {
        if *self.completed.borrow() >= task_count {
            return Ok(());
        }
        let mut completed = self.completed.clone();
        let wait = tokio::time::timeout(timeout, async move {
            completed.wait_for(|done| *done >= task_count).await.map(|_| ())
        });
        match self.handle.block_on(wait) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DriverError::DeviceLost(format!(
                "engine {} stopped before task {}",
                self.engine, task_count
            ))),
            Err(_) => Err(DriverError::DeviceLost(format!(
                "engine {} did not retire task {} within {:?}",
                self.engine, task_count, timeout
            ))),
        }
    }
}
