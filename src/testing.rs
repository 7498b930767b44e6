//! Test doubles: a recording submission channel and helpers to inspect
//! what reached it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cmd_parse::{parse_command_buffer, CommandCounts, ParsedCommand};
use crate::config::Config;
use crate::csr::{BatchBuffer, ChannelFactory, EngineId, SubmissionChannel, TagAddress};
use crate::device::Device;
use crate::error::{DriverError, Result, SubmissionStatus};
use crate::hw_info::GfxCoreCaps;

#[derive(Debug, Default)]
struct MockState {
    batches: Vec<BatchBuffer>,
    forced_status: Option<SubmissionStatus>,
}

/// Shared handle over every channel a factory produced.
#[derive(Debug, Clone, Default)]
pub struct MockChannelControl {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
struct MockChannel {
    tag: TagAddress,
    state: Arc<Mutex<MockState>>,
}

impl SubmissionChannel for MockChannel {
    fn submit(&mut self, batch: BatchBuffer) -> SubmissionStatus {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.forced_status {
            return status;
        }
        self.tag.update(batch.task_count);
        state.batches.push(batch);
        SubmissionStatus::Success
    }

    fn wait_for_task_count(&self, task_count: u64, _timeout: Duration) -> Result<()> {
        if self.tag.completed() >= task_count {
            Ok(())
        } else {
            Err(DriverError::DeviceLost(format!("task count {task_count} not retired")))
        }
    }
}

impl MockChannelControl {
    pub fn factory(&self) -> ChannelFactory {
        let state = self.state.clone();
        Arc::new(move |_engine: EngineId, tag: TagAddress| {
            Box::new(MockChannel {
                tag,
                state: state.clone(),
            }) as Box<dyn SubmissionChannel>
        })
    }

    /// Every accepted batch, in submission order.
    pub fn batches(&self) -> Vec<BatchBuffer> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn batches_for(&self, engine: EngineId) -> Vec<BatchBuffer> {
        self.batches().into_iter().filter(|batch| batch.engine == engine).collect()
    }

    /// Make every following submission return `status`.
    /// `SubmissionStatus::Success` restores normal behavior.
    pub fn force_status(&self, status: SubmissionStatus) {
        self.state.lock().unwrap().forced_status = match status {
            SubmissionStatus::Success => None,
            other => Some(other),
        };
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().batches.clear();
    }
}

/// Primary commands of a batch.
pub fn primary_commands(batch: &BatchBuffer) -> Vec<ParsedCommand> {
    parse_command_buffer(&batch.commands).unwrap()
}

/// Commands of every chained command-list buffer of a batch.
pub fn chained_commands(batch: &BatchBuffer) -> Vec<ParsedCommand> {
    batch
        .chained
        .iter()
        .flat_map(|chunk| parse_command_buffer(chunk).unwrap())
        .collect()
}

pub fn counts(commands: &[ParsedCommand]) -> CommandCounts {
    CommandCounts::from_commands(commands)
}

pub fn device_with(config: Config, caps: GfxCoreCaps) -> (Arc<Device>, MockChannelControl) {
    let control = MockChannelControl::default();
    let device = Device::with_caps(config, caps, control.factory()).unwrap();
    (device, control)
}

pub fn device() -> (Arc<Device>, MockChannelControl) {
    device_with(Config::default(), GfxCoreCaps::xe_hpg_core())
}
