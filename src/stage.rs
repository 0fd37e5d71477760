//! Stages, the context they share, and the schedulers that drive them.
//!
//! A [`Stage`] goes through `prepare`, repeated `process`, then `finalize`.
//! Stages either get a thread each ([`StageRunner::spawn`], collected by a
//! [`Pipeline`]) or share one loop ([`run_cooperative`]). A failing stage
//! reports its own [`StageOutcome`]; it never takes another stage down.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{ChannelConfig, FlowConfig, MissingDataPolicy, ParameterSet};
use crate::error::{FlowError, FlowResult};
use crate::link::{Direction, Link};
use crate::Core::alloc::SegmentAllocator;
use crate::Transport::{Channel, ClusterEndpoint, MemoryRendezvous, ShmChannel, SocketChannel, SocketListener};

/// Pause after a sweep in which no stage made progress.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// What a call to [`Stage::process`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One unit was handled; call again.
    Continue,
    /// Nothing to do right now; call again later.
    Idle,
    /// The stage has no more work.
    Done,
}

/// A pipeline node.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Allocate buffers and open links. May block on peers.
    fn prepare(&mut self, ctx: &PipelineContext) -> FlowResult<()>;

    /// Handle exactly one unit. A non-blocking stage must not wait
    /// indefinitely on its links here.
    fn process(&mut self, ctx: &PipelineContext) -> FlowResult<Step>;

    /// Flush and close links. Runs after `process` stops, also on error.
    fn finalize(&mut self, ctx: &PipelineContext) -> FlowResult<()>;

    /// Policy for wall-clock rings owned by this stage; `None` uses the
    /// pipeline's configured one.
    fn missing_data_policy(&self) -> Option<MissingDataPolicy> {
        None
    }
}

/// Everything stages of one pipeline share.
pub struct PipelineContext {
    config: FlowConfig,
    parameters: ParameterSet,
    memory: MemoryRendezvous,
    segments: Mutex<HashMap<String, Arc<SegmentAllocator>>>,
    cluster: Option<ClusterEndpoint>,
    shutdown: AtomicBool,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::from_config(FlowConfig::default())
    }

    pub fn from_config(config: FlowConfig) -> Self {
        let parameters = config.parameter_set();
        Self {
            config,
            parameters,
            memory: MemoryRendezvous::new(),
            segments: Mutex::new(HashMap::new()),
            cluster: None,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Join a cluster fabric as the endpoint's rank.
    pub fn with_cluster(mut self, endpoint: ClusterEndpoint) -> Self {
        self.cluster = Some(endpoint);
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn memory(&self) -> &MemoryRendezvous {
        &self.memory
    }

    pub fn cluster(&self) -> Option<&ClusterEndpoint> {
        self.cluster.as_ref()
    }

    /// Missing-data policy for `stage`: its own choice, else the ring config.
    pub fn missing_data_policy(&self, stage: &dyn Stage) -> MissingDataPolicy {
        stage
            .missing_data_policy()
            .unwrap_or(self.config.ring.missing_data)
    }

    /// Make an already open segment available under `name`.
    pub fn register_segment(&self, name: &str, segment: Arc<SegmentAllocator>) {
        self.segments.lock().insert(name.to_string(), segment);
    }

    /// The segment `name`: a registered one, else attach to it, else create
    /// it with `size` bytes.
    pub fn segment(&self, name: &str, size: usize) -> FlowResult<Arc<SegmentAllocator>> {
        let mut segments = self.segments.lock();
        if let Some(segment) = segments.get(name) {
            return Ok(segment.clone());
        }
        let segment = match SegmentAllocator::attach(name, size) {
            Ok(segment) => segment,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                SegmentAllocator::new(name, size).map_err(|e| FlowError::io(format!("shm:{name}"), &e))?
            }
            Err(err) => return Err(FlowError::io(format!("shm:{name}"), &err)),
        };
        let segment = Arc::new(segment);
        segments.insert(name.to_string(), segment.clone());
        tracing::debug!(segment = name, "segment opened for pipeline");
        Ok(segment)
    }

    /// Build the channel a link configuration describes. Socket channels
    /// that connect out do so on [`Link::open`].
    pub fn open_channel(&self, config: &ChannelConfig) -> FlowResult<Box<dyn Channel>> {
        let channel: Box<dyn Channel> = match config {
            ChannelConfig::Memory {
                name,
                capacity,
                blocking,
            } => Box::new(self.memory.endpoint(name, *capacity, *blocking)),
            ChannelConfig::Shm {
                segment,
                segment_size,
                tx_band,
                rx_band,
                blocking,
            } => {
                let segment = self.segment(segment, *segment_size)?;
                Box::new(ShmChannel::open(segment, *tx_band, *rx_band, *blocking)?)
            }
            ChannelConfig::Socket {
                address,
                listen,
                blocking,
            } => {
                if *listen {
                    Box::new(SocketListener::bind(address)?.accept(*blocking)?)
                } else {
                    Box::new(SocketChannel::new(address.as_str(), *blocking))
                }
            }
            ChannelConfig::Cluster { peer, tag, blocking } => {
                let endpoint = self
                    .cluster
                    .as_ref()
                    .ok_or_else(|| FlowError::Config("cluster link without a cluster endpoint".into()))?;
                Box::new(endpoint.channel(*peer, *tag, *blocking))
            }
        };
        Ok(channel)
    }

    /// Open the configured link `name`.
    pub fn open_link(&self, name: &str, direction: Direction) -> FlowResult<Link> {
        let link_config = self
            .config
            .link(name)
            .ok_or_else(|| FlowError::Config(format!("no link named '{name}'")))?;
        let channel = self.open_channel(&link_config.channel)?;
        let mut link = Link::new(name, channel, direction);
        link.open()?;
        Ok(link)
    }

    /// Ask every stage to stop after its current unit.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!(pipeline = %self.config.pipeline, "shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

/// How one stage ended.
#[derive(Debug)]
pub struct StageOutcome {
    pub name: String,
    /// `process` calls that returned `Continue`.
    pub units: u64,
    /// Overloads absorbed while processing.
    pub overloads: u64,
    pub result: FlowResult<()>,
}

impl StageOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-stage bookkeeping shared by both schedulers.
struct Driver {
    stage: Box<dyn Stage>,
    units: u64,
    overloads: u64,
    prepared: bool,
    finished: Option<FlowResult<()>>,
}

impl Driver {
    fn new(stage: Box<dyn Stage>) -> Self {
        Self {
            stage,
            units: 0,
            overloads: 0,
            prepared: false,
            finished: None,
        }
    }

    fn prepare(&mut self, ctx: &PipelineContext) {
        tracing::info!(stage = self.stage.name(), "preparing");
        match self.stage.prepare(ctx) {
            Ok(()) => self.prepared = true,
            Err(err) => {
                tracing::warn!(stage = self.stage.name(), error = %err, "prepare failed");
                self.finished = Some(Err(err));
            }
        }
    }

    /// Run one `process` call. Returns whether the stage made progress.
    fn step(&mut self, ctx: &PipelineContext) -> bool {
        match self.stage.process(ctx) {
            Ok(Step::Continue) => {
                self.units += 1;
                true
            }
            Ok(Step::Idle) => false,
            Ok(Step::Done) => {
                self.finish(ctx, Ok(()));
                true
            }
            Err(err) if err.is_overload() => {
                self.overloads += 1;
                tracing::warn!(stage = self.stage.name(), error = %err, "unit dropped");
                true
            }
            Err(err) => {
                tracing::warn!(stage = self.stage.name(), error = %err, "stage failed");
                self.finish(ctx, Err(err));
                true
            }
        }
    }

    fn finish(&mut self, ctx: &PipelineContext, result: FlowResult<()>) {
        let finalized = if self.prepared { self.stage.finalize(ctx) } else { Ok(()) };
        // A processing error outranks a finalize error.
        let result = result.and(finalized);
        tracing::info!(stage = self.stage.name(), units = self.units, ok = result.is_ok(), "stage finished");
        self.finished = Some(result);
    }

    fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    fn into_outcome(self) -> StageOutcome {
        StageOutcome {
            name: self.stage.name().to_string(),
            units: self.units,
            overloads: self.overloads,
            result: self.finished.unwrap_or(Ok(())),
        }
    }
}

/// Thread-per-stage scheduler.
pub struct StageRunner {
    name: String,
    handle: JoinHandle<StageOutcome>,
}

impl StageRunner {
    /// Run `stage` on its own thread until it is done, fails, or the
    /// context is shut down.
    pub fn spawn(stage: Box<dyn Stage>, ctx: Arc<PipelineContext>) -> FlowResult<Self> {
        let name = stage.name().to_string();
        let handle = thread::Builder::new()
            .name(format!("stage-{name}"))
            .spawn(move || {
                let mut driver = Driver::new(stage);
                driver.prepare(&ctx);
                while !driver.is_finished() {
                    if ctx.is_shutdown() {
                        driver.finish(&ctx, Ok(()));
                        break;
                    }
                    if !driver.step(&ctx) {
                        thread::sleep(IDLE_BACKOFF);
                    }
                }
                driver.into_outcome()
            })
            .map_err(|e| FlowError::Config(format!("cannot start stage '{name}': {e}")))?;
        Ok(Self { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> StageOutcome {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(stage = %self.name, "stage panicked");
                StageOutcome {
                    result: Err(FlowError::StagePanicked(self.name.clone())),
                    name: self.name,
                    units: 0,
                    overloads: 0,
                }
            }
        }
    }
}

/// Drive several stages round-robin on the calling thread.
///
/// Returns one outcome per stage, in the order given.
pub fn run_cooperative(stages: Vec<Box<dyn Stage>>, ctx: &PipelineContext) -> Vec<StageOutcome> {
    let mut drivers: Vec<Driver> = stages.into_iter().map(Driver::new).collect();
    for driver in drivers.iter_mut() {
        driver.prepare(ctx);
    }

    while drivers.iter().any(|d| !d.is_finished()) {
        if ctx.is_shutdown() {
            for driver in drivers.iter_mut().filter(|d| !d.is_finished()) {
                driver.finish(ctx, Ok(()));
            }
            break;
        }
        let mut progressed = false;
        for driver in drivers.iter_mut().filter(|d| !d.is_finished()) {
            progressed |= driver.step(ctx);
        }
        if !progressed {
            thread::sleep(IDLE_BACKOFF);
        }
    }

    drivers.into_iter().map(Driver::into_outcome).collect()
}

/// A set of stage threads sharing one context.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    runners: Vec<StageRunner>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            runners: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn spawn(&mut self, stage: Box<dyn Stage>) -> FlowResult<()> {
        let runner = StageRunner::spawn(stage, self.ctx.clone())?;
        self.runners.push(runner);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.ctx.request_shutdown();
    }

    /// Wait for every stage and report each one separately.
    pub fn join(self) -> Vec<StageOutcome> {
        let outcomes: Vec<StageOutcome> = self.runners.into_iter().map(StageRunner::join).collect();
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        tracing::info!(pipeline = %self.ctx.config().pipeline, stages = outcomes.len(), failed, "pipeline joined");
        outcomes
    }
}
