//! Multi-stream driver: runs every stream of a [`StageGraph`] through its
//! own chain of inference stages, all sharing one [`ModelRegistry`].
//!
//! ```text
//! source ─► stage 0 ─► channel ─► stage 1 ─► channel ─► … ─► collector
//! ```
//!
//! Each box is a blocking task in one `JoinSet`.  Shutdown follows the same
//! cascade in every failure mode: a task that stops (end of input, error,
//! cancellation) flushes its stage and closes its outgoing channel, which
//! ends the task downstream of it.  The first error wins and cancels the
//! remaining sources.
//!
//! Stage `k` of stream 0 keeps its configured name and model; the same
//! stage in stream `n > 0` is named `{name}-s{n}` and registers as a slave
//! of the same instance id, so all streams share one loaded model.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vinfer_core::error::{EngineError, Result};
use vinfer_core::io::{FlowStatus, FrameSink, FrameSource};
use vinfer_core::types::Frame;

use crate::config::{StageConfig, StageGraph};
use crate::metrics::StageMetricsSnapshot;
use crate::registry::ModelRegistry;
use crate::stage::InferenceStage;
use crate::synthetic::SyntheticSource;

/// Synthetic workload for [`MultiStreamRunner`].
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub streams: usize,
    pub frames_per_stream: u64,
    pub width: u32,
    pub height: u32,
    pub regions_per_frame: u32,
    /// Overrides every stage's `flush_timeout_ms` when set.
    pub flush_timeout_ms: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            streams: 1,
            frames_per_stream: 32,
            width: 320,
            height: 240,
            regions_per_frame: 2,
            flush_timeout_ms: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.streams == 0 {
            return Err(EngineError::InvalidConfig("streams must be at least 1".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "frame size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamReport {
    pub stream: usize,
    pub frames_in: u64,
    pub frames_out: u64,
    /// Tensors attached to the frames that reached the end of the chain.
    pub tensors_attached: u64,
    pub in_order: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub name: String,
    pub stream: usize,
    pub instance_id: String,
    pub metrics: StageMetricsSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub elapsed_ms: u64,
    pub streams: Vec<StreamReport>,
    pub stages: Vec<StageReport>,
    pub in_order: bool,
}

/// Sink feeding the next task of a stream.
///
/// Unbounded: `push` runs under the ledger lock, possibly on an engine
/// worker thread, and must never wait for the consumer.
struct ChannelSink {
    tx: Mutex<Option<UnboundedSender<Frame>>>,
}

impl ChannelSink {
    fn new() -> (Arc<Self>, UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl FrameSink for ChannelSink {
    fn push(&self, frame: Frame) -> FlowStatus {
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match tx.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => FlowStatus::Ok,
            _ => FlowStatus::Flushing,
        }
    }

    fn end_of_stream(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

#[derive(Default)]
struct StreamTally {
    frames_in: u64,
    frames_out: u64,
    tensors_attached: u64,
    in_order: bool,
}

struct StreamChain {
    stages: Vec<Arc<InferenceStage>>,
    /// `sinks[k]` receives what stage `k` forwards.
    sinks: Vec<Arc<ChannelSink>>,
    receivers: Vec<UnboundedReceiver<Frame>>,
}

/// Drives `RunConfig::streams` synthetic streams through the graph.
pub struct MultiStreamRunner {
    graph: StageGraph,
    config: RunConfig,
    registry: Arc<ModelRegistry>,
    cancel: CancellationToken,
}

impl MultiStreamRunner {
    pub fn new(graph: StageGraph, config: RunConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        graph.validate()?;
        config.validate()?;
        Ok(Self {
            graph,
            config,
            registry,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling stops every source; stages still flush before `run`
    /// returns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn stage_config(&self, template: &StageConfig, stream: usize) -> StageConfig {
        let mut config = template.clone();
        if stream > 0 {
            config.model_instance_id = template.instance_id().to_string();
            config.name = format!("{}-s{stream}", template.name);
            config.model = None;
        }
        if let Some(ms) = self.config.flush_timeout_ms {
            config.flush_timeout_ms = ms;
        }
        config
    }

    fn build_chain(&self, stream: usize) -> Result<StreamChain> {
        let mut chain = StreamChain {
            stages: Vec::with_capacity(self.graph.stages.len()),
            sinks: Vec::with_capacity(self.graph.stages.len()),
            receivers: Vec::with_capacity(self.graph.stages.len()),
        };
        for template in &self.graph.stages {
            let (sink, rx) = ChannelSink::new();
            let stage = InferenceStage::new(
                self.stage_config(template, stream),
                Arc::clone(&self.registry),
                sink.clone(),
            )?;
            chain.stages.push(Arc::new(stage));
            chain.sinks.push(sink);
            chain.receivers.push(rx);
        }
        Ok(chain)
    }

    /// Run every stream to completion or cancellation.
    ///
    /// All stages are shut down (flushed, released) before this returns,
    /// whether or not a task failed.
    #[instrument(skip_all, name = "multi_stream_run")]
    pub async fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        let mut chains = Vec::with_capacity(self.config.streams);
        for stream in 0..self.config.streams {
            match self.build_chain(stream) {
                Ok(chain) => chains.push(chain),
                Err(e) => {
                    let _ = shutdown_all(&chains);
                    return Err(e);
                }
            }
        }
        info!(
            streams = self.config.streams,
            stages = self.graph.stages.len(),
            frames_per_stream = self.config.frames_per_stream,
            "Multi-stream run started"
        );

        let tallies: Vec<Arc<Mutex<StreamTally>>> = (0..chains.len())
            .map(|_| Arc::new(Mutex::new(StreamTally::default())))
            .collect();

        let mut tasks = JoinSet::new();
        for (stream, chain) in chains.iter_mut().enumerate() {
            let receivers = std::mem::take(&mut chain.receivers);
            let mut upstream = None;
            for (k, rx) in receivers.into_iter().enumerate() {
                let stage = Arc::clone(&chain.stages[k]);
                let sink = Arc::clone(&chain.sinks[k]);
                match upstream.take() {
                    None => {
                        let source = SyntheticSource::new(
                            self.config.width,
                            self.config.height,
                            self.config.frames_per_stream,
                            self.config.regions_per_frame,
                        );
                        let cancel = self.cancel.clone();
                        let tally = Arc::clone(&tallies[stream]);
                        tasks.spawn_blocking(move || -> Result<()> {
                            source_stage(source, &stage, sink.as_ref(), &cancel, &tally)
                        });
                    }
                    Some(input) => {
                        tasks.spawn_blocking(move || -> Result<()> {
                            relay_stage(input, &stage, sink.as_ref())
                        });
                    }
                }
                upstream = Some(rx);
            }
            if let Some(output) = upstream {
                let tally = Arc::clone(&tallies[stream]);
                tasks.spawn_blocking(move || -> Result<()> {
                    collect_stream(stream, output, &tally);
                    Ok(())
                });
            }
        }

        // ─── Shutdown barrier ───

        let mut first_error: Option<EngineError> = None;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e.chain(), code = e.error_code(), "Pipeline stage failed");
                    self.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(%join_err, "Pipeline task panicked");
                    self.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(EngineError::Pipeline(format!("Task panic: {join_err}")));
                    }
                }
            }
        }

        let shutdown = shutdown_all(&chains);
        if let Some(e) = first_error {
            return Err(e);
        }
        shutdown?;

        let mut stages = Vec::new();
        for (stream, chain) in chains.iter().enumerate() {
            for stage in &chain.stages {
                let metrics = stage.metrics().snapshot();
                metrics.validate_drained()?;
                stages.push(StageReport {
                    name: stage.name().to_string(),
                    stream,
                    instance_id: stage.instance_id().to_string(),
                    metrics,
                });
            }
        }
        let streams: Vec<StreamReport> = tallies
            .iter()
            .enumerate()
            .map(|(stream, tally)| {
                let tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                StreamReport {
                    stream,
                    frames_in: tally.frames_in,
                    frames_out: tally.frames_out,
                    tensors_attached: tally.tensors_attached,
                    in_order: tally.in_order,
                }
            })
            .collect();

        let report = RunReport {
            elapsed_ms: start.elapsed().as_millis() as u64,
            in_order: streams.iter().all(|s| s.in_order),
            streams,
            stages,
        };
        info!(
            elapsed_ms = report.elapsed_ms,
            in_order = report.in_order,
            "Multi-stream run complete"
        );
        Ok(report)
    }
}

/// Shut every stage down, returning the first failure.
fn shutdown_all(chains: &[StreamChain]) -> Result<()> {
    let mut first = None;
    for stage in chains.iter().flat_map(|c| c.stages.iter()) {
        if let Err(e) = stage.shutdown() {
            warn!(stage = %stage.name(), error = %e.chain(), "Stage shutdown failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Submit one frame; recoverable failures are logged and the stream goes
/// on.
fn submit_frame(stage: &InferenceStage, frame: Frame) -> Result<()> {
    match stage.submit(frame) {
        Ok(_) => Ok(()),
        Err(e) if e.is_recoverable() => {
            warn!(error = %e.chain(), code = e.error_code(), "Frame submitted without results");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Flush `stage` and close its output, whatever `result` was.
fn finish_stage(stage: &InferenceStage, sink: &ChannelSink, result: Result<()>) -> Result<()> {
    let flushed = stage.flush();
    sink.end_of_stream();
    debug!(stage = %stage.name(), "Stage output closed");
    result.and(flushed)
}

fn source_stage(
    mut source: impl FrameSource,
    stage: &InferenceStage,
    sink: &ChannelSink,
    cancel: &CancellationToken,
    tally: &Mutex<StreamTally>,
) -> Result<()> {
    let mut produced = 0;
    let result = (|| -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                debug!(stage = %stage.name(), "Source cancelled");
                return Ok(());
            }
            let Some(frame) = source.next_frame()? else {
                return Ok(());
            };
            produced += 1;
            submit_frame(stage, frame)?;
        }
    })();
    tally
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .frames_in = produced;
    finish_stage(stage, sink, result)
}

fn relay_stage(
    mut input: UnboundedReceiver<Frame>,
    stage: &InferenceStage,
    sink: &ChannelSink,
) -> Result<()> {
    let result = (|| -> Result<()> {
        while let Some(frame) = input.blocking_recv() {
            submit_frame(stage, frame)?;
        }
        Ok(())
    })();
    // Refuse anything still arriving so upstream sees a flow error.
    input.close();
    finish_stage(stage, sink, result)
}

fn collect_stream(stream: usize, mut output: UnboundedReceiver<Frame>, tally: &Mutex<StreamTally>) {
    let mut frames_out = 0;
    let mut tensors = 0;
    let mut in_order = true;
    let mut last: Option<u64> = None;
    while let Some(frame) = output.blocking_recv() {
        if last.is_some_and(|prev| frame.index <= prev) {
            error!(stream, index = frame.index, "Frame forwarded out of order");
            in_order = false;
        }
        last = Some(frame.index);
        frames_out += 1;
        let meta = frame.buffer.meta();
        tensors += meta.tensors.len() as u64
            + meta.regions.iter().map(|r| r.tensors.len() as u64).sum::<u64>();
    }
    let mut tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    tally.frames_out = frames_out;
    tally.tensors_attached = tensors;
    tally.in_order = in_order;
}
