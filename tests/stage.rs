// Stage lifecycle, the two schedulers and the pipeline context.
//
// cargo test --test stage -- --nocapture

use parking_lot::Mutex;
use rtflow::Buffer::{FieldKind, FieldSpec, StreamBuffer};
use rtflow::Transport::Fabric;
use rtflow::{
    run_cooperative, Direction, FlowConfig, FlowError, FlowResult, Link, MissingDataPolicy, Pipeline,
    PipelineContext, Stage, State, Step, TransportFault,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONFIG: &str = r#"
pipeline = "stage-test"

[parameters]
units = 40
observation.id = 7

[[links]]
name = "beams"
[links.channel]
backend = "memory"
name = "beams"
capacity = 2
"#;

fn spec() -> FieldSpec {
    FieldSpec::new("Beam", 1).field("power", FieldKind::F32, &[32])
}

struct Producer {
    link: Option<Link>,
    next: u64,
    total: u64,
    unit: Option<StreamBuffer>,
}

impl Producer {
    fn new() -> Self {
        Self {
            link: None,
            next: 1,
            total: 0,
            unit: None,
        }
    }
}

impl Stage for Producer {
    fn name(&self) -> &str {
        "producer"
    }

    fn prepare(&mut self, ctx: &PipelineContext) -> FlowResult<()> {
        self.total = ctx.parameters().get("units")?;
        self.unit = Some(StreamBuffer::with_spec(&spec())?);
        self.link = Some(ctx.open_link("beams", Direction::Write)?);
        Ok(())
    }

    fn process(&mut self, _ctx: &PipelineContext) -> FlowResult<Step> {
        if self.next > self.total {
            return Ok(Step::Done);
        }
        let (Some(link), Some(unit)) = (self.link.as_mut(), self.unit.as_mut()) else {
            return Err(FlowError::Config("producer not prepared".into()));
        };
        unit.field_mut::<f32>("power")?.fill(self.next as f32);
        unit.set_sequence(self.next);
        match link.write(&*unit)? {
            State::Finished => {
                self.next += 1;
                Ok(Step::Continue)
            }
            _ => Ok(Step::Idle),
        }
    }

    fn finalize(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        Ok(())
    }
}

struct Consumer {
    link: Option<Link>,
    unit: Option<StreamBuffer>,
    expected: u64,
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Consumer {
    fn new(seen: Arc<Mutex<Vec<u64>>>) -> Self {
        Self {
            link: None,
            unit: None,
            expected: 0,
            seen,
        }
    }
}

impl Stage for Consumer {
    fn name(&self) -> &str {
        "consumer"
    }

    fn prepare(&mut self, ctx: &PipelineContext) -> FlowResult<()> {
        self.expected = ctx.parameters().get("units")?;
        self.unit = Some(StreamBuffer::with_spec(&spec())?);
        self.link = Some(ctx.open_link("beams", Direction::Read)?);
        Ok(())
    }

    fn process(&mut self, _ctx: &PipelineContext) -> FlowResult<Step> {
        if self.seen.lock().len() as u64 >= self.expected {
            return Ok(Step::Done);
        }
        let (Some(link), Some(unit)) = (self.link.as_mut(), self.unit.as_mut()) else {
            return Err(FlowError::Config("consumer not prepared".into()));
        };
        match link.read(unit)? {
            State::Finished => {
                let power = unit.field::<f32>("power")?[0];
                assert_eq!(power, unit.sequence() as f32);
                self.seen.lock().push(unit.sequence());
                Ok(Step::Continue)
            }
            _ => Ok(Step::Idle),
        }
    }

    fn finalize(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        Ok(())
    }
}

/// Scripted stage: returns the given results in order, then `Done`.
struct Scripted {
    name: &'static str,
    script: Vec<FlowResult<Step>>,
    fail_prepare: bool,
    finalized: Arc<AtomicBool>,
}

impl Scripted {
    fn new(name: &'static str, script: Vec<FlowResult<Step>>) -> (Self, Arc<AtomicBool>) {
        let finalized = Arc::new(AtomicBool::new(false));
        let stage = Self {
            name,
            script,
            fail_prepare: false,
            finalized: finalized.clone(),
        };
        (stage, finalized)
    }
}

impl Stage for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        if self.fail_prepare {
            return Err(FlowError::Config("no buffers".into()));
        }
        self.script.reverse();
        Ok(())
    }

    fn process(&mut self, _ctx: &PipelineContext) -> FlowResult<Step> {
        self.script.pop().unwrap_or(Ok(Step::Done))
    }

    fn finalize(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn missing_data_policy(&self) -> Option<MissingDataPolicy> {
        Some(MissingDataPolicy::Fatal)
    }
}

/// Stage whose `process` panics on its first call.
struct Panicking;

impl Stage for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        Ok(())
    }

    fn process(&mut self, _ctx: &PipelineContext) -> FlowResult<Step> {
        panic!("stage bug");
    }

    fn finalize(&mut self, _ctx: &PipelineContext) -> FlowResult<()> {
        Ok(())
    }
}

fn context() -> PipelineContext {
    rtflow::logging::init_for_tests();
    PipelineContext::from_config(FlowConfig::from_toml_str(CONFIG).unwrap())
}

#[test]
fn test_pipeline_threads_move_units_over_configured_link() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new(context());
    pipeline.spawn(Box::new(Consumer::new(seen.clone()))).unwrap();
    pipeline.spawn(Box::new(Producer::new())).unwrap();

    let outcomes = pipeline.join();
    for outcome in &outcomes {
        println!("{outcome:?}");
        assert!(outcome.is_ok());
        assert_eq!(outcome.units, 40);
    }
    assert_eq!(*seen.lock(), (1..=40).collect::<Vec<u64>>());
}

#[test]
fn test_cooperative_scheduler_interleaves_stages() {
    let ctx = context();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stages: Vec<Box<dyn Stage>> = vec![Box::new(Producer::new()), Box::new(Consumer::new(seen.clone()))];

    let outcomes = run_cooperative(stages, &ctx);
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].name, "producer");
    assert_eq!(outcomes[1].name, "consumer");
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(seen.lock().len(), 40);
}

#[test]
fn test_failing_stage_does_not_take_others_down() {
    let broken = FlowError::transport(3usize, TransportFault::Reset, "peer vanished");
    let (failing, failing_finalized) = Scripted::new(
        "failing",
        vec![Ok(Step::Continue), Ok(Step::Continue), Ok(Step::Continue), Err(broken.clone())],
    );
    let (healthy, healthy_finalized) = Scripted::new("healthy", (0..10).map(|_| Ok(Step::Continue)).collect());

    let mut pipeline = Pipeline::new(PipelineContext::new());
    pipeline.spawn(Box::new(failing)).unwrap();
    pipeline.spawn(Box::new(healthy)).unwrap();
    let outcomes = pipeline.join();

    assert_eq!(outcomes[0].units, 3);
    assert_eq!(outcomes[0].result, Err(broken));
    assert!(failing_finalized.load(Ordering::SeqCst));

    assert!(outcomes[1].is_ok());
    assert_eq!(outcomes[1].units, 10);
    assert!(healthy_finalized.load(Ordering::SeqCst));
}

#[test]
fn test_panicking_stage_is_reported_by_name() {
    rtflow::logging::init_for_tests();
    let (healthy, _) = Scripted::new("healthy", (0..5).map(|_| Ok(Step::Continue)).collect());
    let mut pipeline = Pipeline::new(PipelineContext::new());
    pipeline.spawn(Box::new(Panicking)).unwrap();
    pipeline.spawn(Box::new(healthy)).unwrap();
    let outcomes = pipeline.join();

    println!("{:?}", outcomes[0]);
    assert_eq!(outcomes[0].name, "panicking");
    assert_eq!(outcomes[0].result, Err(FlowError::StagePanicked("panicking".into())));
    assert!(outcomes[0].result.as_ref().unwrap_err().is_fatal());
    assert!(outcomes[1].is_ok());
    assert_eq!(outcomes[1].units, 5);
}

#[test]
fn test_overloads_are_counted_not_fatal() {
    let ctx = PipelineContext::new();
    let script = (0..6)
        .map(|i| {
            if i % 2 == 0 {
                Err(FlowError::overload("sink", "late"))
            } else {
                Ok(Step::Continue)
            }
        })
        .collect();
    let (stage, _) = Scripted::new("bursty", script);
    let outcomes = run_cooperative(vec![Box::new(stage)], &ctx);
    assert!(outcomes[0].is_ok());
    assert_eq!(outcomes[0].units, 3);
    assert_eq!(outcomes[0].overloads, 3);
}

#[test]
fn test_prepare_failure_skips_process_and_finalize() {
    let (mut stage, finalized) = Scripted::new("unprepared", vec![Ok(Step::Continue)]);
    stage.fail_prepare = true;
    let outcomes = run_cooperative(vec![Box::new(stage)], &PipelineContext::new());
    assert!(matches!(outcomes[0].result, Err(FlowError::Config(_))));
    assert_eq!(outcomes[0].units, 0);
    assert!(!finalized.load(Ordering::SeqCst));
}

#[test]
fn test_shutdown_stops_idle_stage() {
    let (idle, finalized) = Scripted::new("idle", (0..100_000).map(|_| Ok(Step::Idle)).collect());
    let mut pipeline = Pipeline::new(PipelineContext::new());
    pipeline.spawn(Box::new(idle)).unwrap();
    thread::sleep(Duration::from_millis(20));
    pipeline.shutdown();
    assert!(pipeline.context().is_shutdown());

    let outcomes = pipeline.join();
    assert!(outcomes[0].is_ok());
    assert!(finalized.load(Ordering::SeqCst));
}

#[test]
fn test_context_parameters_and_policy() {
    let ctx = context();
    assert_eq!(ctx.config().pipeline, "stage-test");
    assert_eq!(ctx.parameters().get::<u32>("observation.id").unwrap(), 7);
    assert_eq!(ctx.parameters().get_or("missing", 3u8), 3);

    let (stage, _) = Scripted::new("strict", vec![]);
    assert_eq!(ctx.missing_data_policy(&stage), MissingDataPolicy::Fatal);
    let producer = Producer::new();
    assert_eq!(ctx.missing_data_policy(&producer), MissingDataPolicy::Tolerate);
}

#[test]
fn test_context_rejects_unknown_and_unbacked_links() {
    let ctx = context();
    assert!(matches!(ctx.open_link("nowhere", Direction::Read), Err(FlowError::Config(_))));

    let cluster = FlowConfig::from_toml_str(
        r#"
        [[links]]
        name = "to-one"
        [links.channel]
        backend = "cluster"
        peer = 1
        "#,
    )
    .unwrap();
    let bare = PipelineContext::from_config(cluster.clone());
    assert!(matches!(bare.open_link("to-one", Direction::Write), Err(FlowError::Config(_))));

    let fabric = Fabric::new(2);
    let joined = PipelineContext::from_config(cluster).with_cluster(fabric.endpoint(0).unwrap());
    assert!(joined.cluster().is_some());
    let link = joined.open_link("to-one", Direction::Write).unwrap();
    assert_eq!(link.direction(), Direction::Write);
}
