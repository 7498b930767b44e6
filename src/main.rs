//! Level Zero Command-List Engine Replay Service
//!
//! This service:
//! 1. Loads the engine configuration from TOML
//! 2. Builds a simulated device whose engines retire batches through the
//!    asynchronous hardware scheduler model
//! 3. Replays a smoke workload on regular and immediate command lists
//! 4. Reports per-engine submission statistics

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use l0_cmdlist_engine::cmdlist::{BufferRegion, CopyRegion};
use l0_cmdlist_engine::csr::{EngineGroupType, WAIT_TIMEOUT};
use l0_cmdlist_engine::event::{EventDesc, EventPool, EVENT_SCOPE_FLAG_HOST};
use l0_cmdlist_engine::kernel::{ArgDescriptor, ArgValue, GroupCount, Kernel, KernelDescriptor};
use l0_cmdlist_engine::scheduler::HardwareScheduler;
use l0_cmdlist_engine::{
    CmdListKernelLaunchParams, CommandList, CommandQueue, Config, Device, Fence, ImmediateListDesc, ZeResult,
};

const DEFAULT_CONFIG_PATH: &str = "l0-engine.toml";

/// Simulated execution time of one batch.
const BATCH_LATENCY: Duration = Duration::from_micros(50);

#[derive(Debug, Default)]
struct ReplaySummary {
    iterations: u32,
    queue_executions: u32,
    immediate_flushes: u32,
}

/// Buffers and lists the smoke workload reuses across iterations.
struct Workload {
    device: Arc<Device>,
    config: Config,
    src: u64,
    dst: u64,
    host: u64,
    kernel: Kernel,
    regular: CommandList,
    immediate: CommandList,
    queue: CommandQueue,
    fence: Fence,
}

impl Workload {
    fn new(device: &Arc<Device>, config: &Config) -> Result<Self> {
        let memory = device.memory();
        let size = config.copy_size.max(config.fill_size).max(1);
        let src = memory.alloc_device_mem(size, 64)?;
        let dst = memory.alloc_device_mem(size, 64)?;
        let host = memory.alloc_host_mem(size, 64)?;

        let mut desc = KernelDescriptor::new("smoke_scale");
        desc.args.push(ArgDescriptor::stateless_pointer(0));
        desc.args.push(ArgDescriptor::stateless_pointer(8));
        let mut kernel = Kernel::new(Arc::new(desc));
        kernel.set_arg(0, ArgValue::Pointer(dst))?;
        kernel.set_arg(1, ArgValue::Pointer(src))?;

        let regular = CommandList::create(device, EngineGroupType::Compute, 0)?;
        let immediate = CommandList::create_immediate(device, &ImmediateListDesc::default(), false, EngineGroupType::Compute)?;
        let queue = CommandQueue::create(device, EngineGroupType::Compute, &Default::default())?;

        Ok(Self {
            device: device.clone(),
            config: config.clone(),
            src,
            dst,
            host,
            kernel,
            regular,
            immediate,
            queue,
            fence: Fence::new(),
        })
    }

    /// Record the regular list once; it is executed every iteration.
    fn record_regular(&mut self) -> Result<()> {
        let config = &self.config;
        let list = &mut self.regular;
        list.append_memory_fill(self.dst, &[0xA5], config.fill_size, None, &[])?;
        list.append_memory_copy(self.dst, self.src, config.copy_size, None, &[])?;

        let width = (config.copy_size / 16).clamp(1, 256) as u32;
        let region = CopyRegion {
            width,
            height: 4,
            depth: 1,
            ..Default::default()
        };
        let dst = BufferRegion {
            ptr: self.host,
            region,
            row_pitch: width,
            slice_pitch: width * 4,
        };
        if (width * 4) as usize <= config.copy_size {
            list.append_memory_copy_region(&dst, &BufferRegion { ptr: self.src, ..dst }, None, &[])?;
        }

        list.append_launch_kernel(
            &self.kernel,
            GroupCount::linear(4),
            None,
            &[],
            &CmdListKernelLaunchParams::default(),
        )?;
        list.append_barrier(None, &[])?;
        list.close()?;
        debug!("Regular list recorded ({} bytes)", list.container().total_used());
        Ok(())
    }

    fn run_iteration(&mut self, events: &Arc<EventPool>, summary: &mut ReplaySummary) -> Result<()> {
        self.queue
            .execute_command_lists(&mut [&mut self.regular], Some(&self.fence), false)?;
        let status = self.fence.host_synchronize(WAIT_TIMEOUT);
        if status != ZeResult::Success {
            bail!("queue fence did not signal: {:?}", status);
        }
        self.fence.reset()?;
        summary.queue_executions += 1;

        let event = events.create_event(EventDesc {
            index: 0,
            signal_scope: EVENT_SCOPE_FLAG_HOST,
            wait_scope: 0,
        })?;
        let before = self.immediate.counters();
        self.immediate
            .append_memory_copy(self.host, self.dst, self.config.copy_size, None, &[])?;
        self.immediate
            .append_launch_kernel(&self.kernel, GroupCount::linear(2), Some(&event), &[], &Default::default())?;
        let status = event.host_synchronize(WAIT_TIMEOUT);
        if status != ZeResult::Success {
            bail!("immediate list event did not signal: {:?}", status);
        }
        event.reset()?;
        let after = self.immediate.counters();
        summary.immediate_flushes += (after.flush_task_submissions + after.queue_submissions)
            - (before.flush_task_submissions + before.queue_submissions);
        Ok(())
    }

    fn destroy(self) -> Result<()> {
        self.regular.destroy()?;
        self.immediate.destroy()?;
        self.queue.destroy()?;
        let memory = self.device.memory();
        for ptr in [self.src, self.dst, self.host] {
            memory.free_mem(ptr)?;
        }
        Ok(())
    }
}

fn run_workload(device: Arc<Device>, config: Config, shutdown: Arc<AtomicBool>) -> Result<ReplaySummary> {
    let mut workload = Workload::new(&device, &config)?;
    workload.record_regular()?;
    let events = EventPool::create(device.memory(), 1)?;

    let mut summary = ReplaySummary::default();
    while config.iterations == 0 || summary.iterations < config.iterations {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping replay");
            break;
        }
        workload
            .run_iteration(&events, &mut summary)
            .with_context(|| format!("iteration {}", summary.iterations))?;
        summary.iterations += 1;
    }

    workload.destroy()?;
    Ok(summary)
}

fn load_config() -> Result<Config> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if path.exists() {
        Config::load(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("L0 command-list engine replay service starting...");
    info!("Configuration loaded: {:?}", config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("setting Ctrl+C handler")?;

    let scheduler = HardwareScheduler::new(tokio::runtime::Handle::current(), BATCH_LATENCY);
    let device = Device::new(config.clone(), scheduler.channel_factory())?;
    info!("Device ready: {:?}", device);

    let started = Instant::now();
    let replay = tokio::task::spawn_blocking({
        let device = device.clone();
        let config = config.clone();
        move || run_workload(device, config, shutdown)
    })
    .await
    .context("replay task panicked")?;

    match &replay {
        Ok(summary) => info!(
            "Replayed {} iteration(s) in {:?}: {} queue execution(s), {} immediate flush(es)",
            summary.iterations,
            started.elapsed(),
            summary.queue_executions,
            summary.immediate_flushes
        ),
        Err(err) => error!("Replay failed: {:#}", err),
    }

    match scheduler.stats() {
        Ok(stats) => {
            for engine in stats {
                info!(
                    "Engine {}: {} batch(es), {} bytes, last task {}, SBA {}, walkers {}, DC flushes {}, blits {}",
                    engine.engine,
                    engine.batches,
                    engine.bytes,
                    engine.last_task_count,
                    engine.counts.state_base_address,
                    engine.counts.compute_walker,
                    engine.counts.dc_flushes,
                    engine.counts.blits
                );
                if engine.malformed_batches > 0 {
                    warn!("Engine {}: {} malformed batch(es)", engine.engine, engine.malformed_batches);
                }
            }
        }
        Err(err) => warn!("Scheduler statistics unavailable: {}", err),
    }
    match device.memory().local_memory_used() {
        Ok(used) => info!("Local memory in use at exit: {} bytes", used),
        Err(err) => warn!("Memory statistics unavailable: {}", err),
    }

    scheduler.shutdown();
    info!("Replay service shutting down");
    replay.map(|_| ())
}
