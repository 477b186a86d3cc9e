//! # Message Pipeline
//!
//! A [`MessagePipeline`] is the consumer-facing handle of one pipeline run.
//! The run itself is an actor task that owns every piece of per-run state:
//!
//! ```text
//!  Connection ──► inbound filter ──► OrderedValidations ──► OrderingEngine ──► stages ──► output
//!                                          ▲                      │
//!                                          │                      ▼ gap
//!                                     ResendEvent ◄──────── ResendCoordinator
//! ```
//!
//! The actor multiplexes the inbound source, validation completions, resend
//! events and the run-state signal in one `select!` loop, so the ordering
//! state is never shared.
//!
//! ## Termination
//!
//! | Trigger | Behavior |
//! |---------|----------|
//! | [`MessagePipeline::end`] | stop reading input, finish validations already started, close |
//! | [`MessagePipeline::cancel`] or handle dropped | close immediately, buffered messages are discarded |
//! | bye message ordered | deliver it, close |
//! | stage error | deliver the error once, close |
//!
//! Closing always unregisters the inbound handler and cancels every resend
//! attempt, waiting a bounded time for their request handles to be released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{MAX_PENDING_VALIDATIONS, PipelineConfig, PipelineOptions};
use crate::error::{PipelineError, ValidationError};
use crate::messages::{ControlKind, ControlMessage, StreamMessage};
use crate::ordering::{GapRetry, OrderingEngine, OrderingEvent};
use crate::protocols::{Connection, HandlerId};
use crate::resend::{ResendCoordinator, ResendEvent};
use crate::validator::{OrderedValidations, Validator};

/// Capacity of the inbound handler channel.
const INBOUND_CHANNEL_SIZE: usize = 1024;

/// Post-processing applied to ordered messages before they reach the consumer.
#[async_trait]
pub trait PipelineStage: Send + 'static {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Return `Ok(None)` to drop the message. An error ends the run.
    async fn process(&mut self, message: StreamMessage) -> anyhow::Result<Option<StreamMessage>>;
}

/// A [`PipelineStage`] backed by a closure.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: FnMut(StreamMessage) -> anyhow::Result<Option<StreamMessage>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> PipelineStage for FnStage<F>
where
    F: FnMut(StreamMessage) -> anyhow::Result<Option<StreamMessage>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, message: StreamMessage) -> anyhow::Result<Option<StreamMessage>> {
        (self.f)(message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Ending,
    Cancelled,
}

type Output = Result<StreamMessage, PipelineError>;

/// Handle to one pipeline run. Dropping it cancels the run.
pub struct MessagePipeline {
    id: String,
    stream_id: String,
    stream_partition: u32,
    state_tx: watch::Sender<RunState>,
    output: Mutex<mpsc::Receiver<Output>>,
    collecting: AtomicBool,
}

impl MessagePipeline {
    /// Register the inbound handler and start the run.
    ///
    /// The handler is registered before this returns, so messages dispatched
    /// afterwards are never missed.
    pub fn spawn(
        connection: Arc<dyn Connection>,
        validator: Arc<Validator>,
        config: &PipelineConfig,
        options: PipelineOptions,
        stages: Vec<Box<dyn PipelineStage>>,
    ) -> Self {
        let inbound_kind = options.delivery.control_kind();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let inbound_id = connection.on(inbound_kind, inbound_tx);

        let (output_tx, output_rx) = mpsc::channel(config.output_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let (resends, resend_rx) =
            ResendCoordinator::new(connection.clone(), &options, config.gap_fill_timeout);

        let handle = Self {
            id: options.key.clone(),
            stream_id: options.stream_id.clone(),
            stream_partition: options.stream_partition,
            state_tx,
            output: Mutex::new(output_rx),
            collecting: AtomicBool::new(false),
        };

        let actor = PipelineActor {
            id: options.key.clone(),
            engine: OrderingEngine::new(options.stream_id.clone(), options.stream_partition, config),
            connection,
            config: config.clone(),
            options,
            inbound_kind,
            inbound_id: Some(inbound_id),
            inbound_rx,
            validations: OrderedValidations::new(validator),
            resends,
            resend_rx,
            stages,
            output_tx,
            state_rx,
            ending: false,
        };
        tokio::spawn(actor.run());

        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_partition(&self) -> u32 {
        self.stream_partition
    }

    /// Next ordered message. `None` once the run has closed.
    pub async fn next(&self) -> Option<Output> {
        self.output.lock().await.recv().await
    }

    /// Stop reading input; the sequence ends once in-flight messages are processed.
    pub fn end(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Ending;
                true
            } else {
                false
            }
        });
    }

    /// Close the run immediately.
    pub fn cancel(&self) {
        self.state_tx.send_replace(RunState::Cancelled);
    }

    /// Drain the remaining sequence and decode each payload.
    ///
    /// Fails with [`PipelineError::AlreadyCollecting`] if another collection
    /// on this pipeline is in progress.
    pub async fn collect<T: DeserializeOwned>(&self) -> Result<Vec<T>, PipelineError> {
        if self.collecting.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyCollecting);
        }
        let _guard = CollectGuard(&self.collecting);

        let mut output = self.output.lock().await;
        let mut payloads = Vec::new();
        while let Some(item) = output.recv().await {
            payloads.push(item?.parsed_content()?);
        }
        Ok(payloads)
    }
}

struct CollectGuard<'a>(&'a AtomicBool);

impl Drop for CollectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Exit {
    Ended,
    Cancelled,
    StageFailed,
    ConsumerGone,
}

enum Flow {
    Continue,
    Stop(Exit),
}

struct PipelineActor {
    id: String,
    connection: Arc<dyn Connection>,
    config: PipelineConfig,
    options: PipelineOptions,
    inbound_kind: ControlKind,
    inbound_id: Option<HandlerId>,
    inbound_rx: mpsc::Receiver<ControlMessage>,
    validations: OrderedValidations,
    engine: OrderingEngine,
    resends: ResendCoordinator,
    resend_rx: mpsc::Receiver<ResendEvent>,
    stages: Vec<Box<dyn PipelineStage>>,
    output_tx: mpsc::Sender<Output>,
    state_rx: watch::Receiver<RunState>,
    ending: bool,
}

impl PipelineActor {
    async fn run(mut self) {
        debug!(pipeline = %self.id, stream = %self.options.stream_id, partition = self.options.stream_partition, "pipeline started");

        let exit = loop {
            // A blocked `emit` may have consumed the change notification.
            let state = *self.state_rx.borrow();
            match state {
                RunState::Running => {}
                RunState::Ending if !self.ending => self.begin_end(),
                RunState::Ending => {}
                RunState::Cancelled => break Exit::Cancelled,
            }
            if self.ending && self.validations.is_empty() {
                break Exit::Ended;
            }

            let reading = !self.ending && self.validations.len() < MAX_PENDING_VALIDATIONS;
            let validating = !self.validations.is_empty();

            tokio::select! {
                changed = self.state_rx.changed() => {
                    let state = match changed {
                        Ok(()) => *self.state_rx.borrow_and_update(),
                        Err(_) => RunState::Cancelled,
                    };
                    match state {
                        RunState::Running => {}
                        RunState::Ending => self.begin_end(),
                        RunState::Cancelled => break Exit::Cancelled,
                    }
                }
                outcome = self.validations.next(), if validating => {
                    if let Some((message, result)) = outcome
                        && let Flow::Stop(exit) = self.on_validated(message, result).await
                    {
                        break exit;
                    }
                }
                event = self.resend_rx.recv() => {
                    if let Some(event) = event
                        && let Flow::Stop(exit) = self.on_resend_event(event).await
                    {
                        break exit;
                    }
                }
                received = self.inbound_rx.recv(), if reading => {
                    match received {
                        Some(control) => self.on_inbound(control),
                        None => {
                            info!(pipeline = %self.id, "inbound source closed");
                            self.begin_end();
                        }
                    }
                }
            }
        };

        self.teardown(exit).await;
    }

    fn on_inbound(&mut self, control: ControlMessage) {
        let Some(message) = control.into_stream_message() else {
            return;
        };
        if message.stream_id != self.options.stream_id
            || message.stream_partition != self.options.stream_partition
        {
            return;
        }
        trace!(pipeline = %self.id, message_ref = %message.message_ref, "inbound message");
        self.validations.push(message);
    }

    async fn on_validated(
        &mut self,
        message: StreamMessage,
        result: Result<(), ValidationError>,
    ) -> Flow {
        let events = match result {
            Ok(()) => self.engine.add(message),
            Err(error) => {
                debug!(
                    pipeline = %self.id,
                    message_id = %hex::encode(&message.message_id()[..8]),
                    publisher = %message.publisher_id.short(),
                    error = %error,
                    "dropping invalid message"
                );
                self.engine.mark_explicitly(&message)
            }
        };
        self.apply(events).await
    }

    async fn on_resend_event(&mut self, event: ResendEvent) -> Flow {
        match event {
            ResendEvent::Message { message, .. } => {
                self.validations.push(message);
                Flow::Continue
            }
            ResendEvent::Finished { lineage, request_id, outcome } => {
                if !self.resends.complete(&lineage, &request_id) {
                    return Flow::Continue;
                }
                match self.engine.retry_gap(&lineage, self.config.max_gap_requests) {
                    GapRetry::Retry(request) => {
                        debug!(
                            pipeline = %self.id,
                            lineage = %lineage,
                            outcome = ?outcome,
                            attempt = request.attempt,
                            "gap still open, retrying resend"
                        );
                        self.resends.start(request);
                        Flow::Continue
                    }
                    GapRetry::Exhausted => {
                        let events = self.engine.abandon_gap(&lineage);
                        self.apply(events).await
                    }
                    GapRetry::Closed => Flow::Continue,
                }
            }
        }
    }

    async fn apply(&mut self, events: Vec<OrderingEvent>) -> Flow {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            match event {
                OrderingEvent::Ordered(message) => {
                    if let Flow::Stop(exit) = self.deliver(message).await {
                        return Flow::Stop(exit);
                    }
                }
                OrderingEvent::Gap(request) => {
                    if self.config.max_gap_requests == 0 {
                        queue.extend(self.engine.abandon_gap(&request.lineage));
                    } else {
                        self.resends.start(request);
                    }
                }
                OrderingEvent::GapClosed(lineage) => self.resends.cancel(&lineage),
                OrderingEvent::End => return Flow::Stop(Exit::Ended),
            }
        }
        Flow::Continue
    }

    async fn deliver(&mut self, message: StreamMessage) -> Flow {
        let mut current = Some(message);
        for stage in self.stages.iter_mut() {
            let Some(message) = current.take() else {
                return Flow::Continue;
            };
            match stage.process(message).await {
                Ok(next) => current = next,
                Err(source) => {
                    let error = PipelineError::Stage {
                        stage: stage.name().to_string(),
                        source,
                    };
                    warn!(pipeline = %self.id, error = %error, "pipeline stage failed");
                    self.emit(Err(error)).await;
                    return Flow::Stop(Exit::StageFailed);
                }
            }
        }

        match current {
            Some(message) => {
                if self.emit(Ok(message)).await {
                    Flow::Continue
                } else {
                    Flow::Stop(Exit::ConsumerGone)
                }
            }
            None => Flow::Continue,
        }
    }

    /// Send to the consumer unless the run is cancelled first.
    async fn emit(&mut self, item: Output) -> bool {
        tokio::select! {
            sent = self.output_tx.send(item) => sent.is_ok(),
            _ = cancelled(&mut self.state_rx) => false,
        }
    }

    fn begin_end(&mut self) {
        self.ending = true;
        self.stop_inbound();
    }

    fn stop_inbound(&mut self) {
        if let Some(id) = self.inbound_id.take() {
            self.connection.off(self.inbound_kind, id);
        }
        self.inbound_rx.close();
    }

    async fn teardown(mut self, exit: Exit) {
        self.stop_inbound();
        self.validations.clear();
        self.engine.clear_gaps();
        self.resends.shutdown(self.config.teardown_timeout).await;
        self.engine.clear();
        debug!(pipeline = %self.id, exit = ?exit, "pipeline stopped");
    }
}

async fn cancelled(state_rx: &mut watch::Receiver<RunState>) {
    loop {
        if *state_rx.borrow() == RunState::Cancelled {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}
