//! # Resend Coordination
//!
//! Each gap-fill attempt is a short-lived task that owns one request id on
//! the connection:
//!
//! 1. register handlers for unicast traffic and resend completions
//! 2. take the request handle and send [`ControlRequest::ResendRange`]
//! 3. forward matching unicast messages to the pipeline until a completion,
//!    the attempt deadline, or cancellation
//! 4. unregister and release the handle, then report [`ResendEvent::Finished`]
//!
//! An attempt always lasts its full window unless cancelled, so retries of
//! one gap are spaced by the gap-fill timeout. Step 4 runs on every exit
//! path; cleanup failures are logged, never propagated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::PipelineOptions;
use crate::error::PipelineError;
use crate::messages::{ControlKind, ControlMessage, ControlRequest, LineageKey, RequestId, StreamMessage};
use crate::ordering::GapRequest;
use crate::protocols::{Connection, HandlerId};

/// Capacity of one attempt's inbound channel.
const ATTEMPT_CHANNEL_SIZE: usize = 256;

/// Capacity of the channel back to the pipeline.
pub const RESEND_EVENT_CHANNEL_SIZE: usize = 1024;

const ATTEMPT_KINDS: [ControlKind; 4] = [
    ControlKind::UnicastMessage,
    ControlKind::ResendResponseResent,
    ControlKind::ResendResponseNoResend,
    ControlKind::ErrorResponse,
];

/// How an attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResendOutcome {
    Resent,
    NoResend,
    /// The responder answered with an error.
    Failed(String),
    /// The request could not be sent.
    SendFailed(String),
    TimedOut,
}

#[derive(Debug)]
pub enum ResendEvent {
    /// A recovered message for the pipeline to validate and order.
    Message { request_id: RequestId, message: StreamMessage },
    /// An attempt's window closed.
    Finished {
        lineage: LineageKey,
        request_id: RequestId,
        outcome: ResendOutcome,
    },
}

struct ActiveAttempt {
    request_id: RequestId,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Runs resend attempts for one pipeline, at most one per lineage.
pub struct ResendCoordinator {
    connection: Arc<dyn Connection>,
    stream_id: String,
    stream_partition: u32,
    key: String,
    timeout: Duration,
    counter: u64,
    events_tx: mpsc::Sender<ResendEvent>,
    active: HashMap<LineageKey, ActiveAttempt>,
    /// Cancelled attempts that may still be cleaning up.
    retiring: Vec<JoinHandle<()>>,
}

impl ResendCoordinator {
    pub fn new(
        connection: Arc<dyn Connection>,
        options: &PipelineOptions,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<ResendEvent>) {
        let (events_tx, events_rx) = mpsc::channel(RESEND_EVENT_CHANNEL_SIZE);
        let coordinator = Self {
            connection,
            stream_id: options.stream_id.clone(),
            stream_partition: options.stream_partition,
            key: options.key.clone(),
            timeout,
            counter: 0,
            events_tx,
            active: HashMap::new(),
            retiring: Vec::new(),
        };
        (coordinator, events_rx)
    }

    /// Start an attempt for `gap`, replacing any attempt on the same lineage.
    pub fn start(&mut self, gap: GapRequest) -> RequestId {
        self.cancel(&gap.lineage);

        self.counter += 1;
        let request_id = format!("{}-resend-{}", self.key, self.counter);
        debug!(
            request_id = %request_id,
            lineage = %gap.lineage,
            from = %gap.from,
            to = %gap.to,
            attempt = gap.attempt,
            "requesting resend"
        );

        let (cancel, cancel_rx) = oneshot::channel();
        let attempt = Attempt {
            connection: self.connection.clone(),
            request: ControlRequest::ResendRange {
                request_id: request_id.clone(),
                stream_id: self.stream_id.clone(),
                stream_partition: self.stream_partition,
                from: gap.from,
                to: gap.to,
                publisher_id: gap.lineage.publisher_id,
                msg_chain_id: gap.lineage.msg_chain_id.clone(),
            },
            request_id: request_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_partition: self.stream_partition,
            lineage: gap.lineage.clone(),
            deadline: Instant::now() + self.timeout,
            events_tx: self.events_tx.clone(),
        };
        let task = tokio::spawn(attempt.run(cancel_rx));

        self.active.insert(gap.lineage, ActiveAttempt {
            request_id: request_id.clone(),
            cancel,
            task,
        });
        request_id
    }

    /// Cancel the lineage's attempt, if any. It reports nothing further.
    pub fn cancel(&mut self, lineage: &LineageKey) {
        if let Some(active) = self.active.remove(lineage) {
            trace!(request_id = %active.request_id, "cancelling resend");
            let _ = active.cancel.send(());
            self.retiring.retain(|task| !task.is_finished());
            self.retiring.push(active.task);
        }
    }

    /// Forget a finished attempt. Returns false if `request_id` is stale,
    /// i.e. the lineage has since moved on to another attempt.
    pub fn complete(&mut self, lineage: &LineageKey, request_id: &str) -> bool {
        match self.active.get(lineage) {
            Some(active) if active.request_id == request_id => {
                self.active.remove(lineage);
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, lineage: &LineageKey) -> bool {
        self.active.contains_key(lineage)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel every attempt and wait up to `grace` for their cleanup.
    pub async fn shutdown(&mut self, grace: Duration) {
        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut self.retiring);
        for (_, active) in self.active.drain() {
            let _ = active.cancel.send(());
            tasks.push(active.task);
        }
        if tasks.is_empty() {
            return;
        }

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let count = tasks.len();
        let wait = async move {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(attempts = count, "resend cleanup timed out, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

struct Attempt {
    connection: Arc<dyn Connection>,
    request: ControlRequest,
    request_id: RequestId,
    stream_id: String,
    stream_partition: u32,
    lineage: LineageKey,
    deadline: Instant,
    events_tx: mpsc::Sender<ResendEvent>,
}

impl Attempt {
    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        let (tx, mut rx) = mpsc::channel(ATTEMPT_CHANNEL_SIZE);
        let registrations: Vec<(ControlKind, HandlerId)> = ATTEMPT_KINDS
            .iter()
            .map(|&kind| (kind, self.connection.on(kind, tx.clone())))
            .collect();
        drop(tx);

        let outcome = self.exchange(&mut rx, &mut cancel_rx).await;

        for (kind, id) in registrations {
            self.connection.off(kind, id);
        }
        if let Err(e) = self.connection.remove_request_handle(&self.request_id).await {
            warn!(request_id = %self.request_id, error = %e, "failed to release request handle");
        }

        if let Some(outcome) = outcome {
            trace!(request_id = %self.request_id, outcome = ?outcome, "resend attempt finished");
            let _ = self
                .events_tx
                .send(ResendEvent::Finished {
                    lineage: self.lineage,
                    request_id: self.request_id,
                    outcome,
                })
                .await;
        }
    }

    /// Returns `None` when cancelled.
    async fn exchange(
        &self,
        rx: &mut mpsc::Receiver<ControlMessage>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> Option<ResendOutcome> {
        let mut outcome = self.send_request().await.err();

        let window = tokio::time::sleep_until(self.deadline);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut *cancel_rx => return None,
                _ = &mut window => return Some(outcome.unwrap_or(ResendOutcome::TimedOut)),
                received = rx.recv(), if outcome.is_none() => {
                    let Some(message) = received else {
                        outcome = Some(ResendOutcome::Failed("connection dropped handlers".to_string()));
                        continue;
                    };
                    if message.request_id() != Some(self.request_id.as_str()) {
                        continue;
                    }
                    match message {
                        ControlMessage::UnicastMessage { message, .. } => {
                            if message.stream_id != self.stream_id
                                || message.stream_partition != self.stream_partition
                            {
                                debug!(request_id = %self.request_id, "resent message for another stream partition");
                                continue;
                            }
                            let event = ResendEvent::Message {
                                request_id: self.request_id.clone(),
                                message,
                            };
                            if self.events_tx.send(event).await.is_err() {
                                return None;
                            }
                        }
                        ControlMessage::ResendResponseResent { .. } => outcome = Some(ResendOutcome::Resent),
                        ControlMessage::ResendResponseNoResend { .. } => outcome = Some(ResendOutcome::NoResend),
                        ControlMessage::ErrorResponse { error_message, .. } => {
                            outcome = Some(ResendOutcome::Failed(error_message));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn send_request(&self) -> Result<(), ResendOutcome> {
        let result = match self.connection.add_request_handle(&self.request_id).await {
            Ok(()) => self.connection.send(self.request.clone()).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            let error = PipelineError::ConnectionFailure(e);
            warn!(request_id = %self.request_id, error = %error, "resend request failed");
            ResendOutcome::SendFailed(error.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHub;
    use crate::identity::Identity;
    use crate::messages::MessageRef;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn lineage() -> LineageKey {
        LineageKey {
            publisher_id: Identity::from_bytes([4u8; 32]),
            msg_chain_id: "chain".into(),
        }
    }

    fn gap() -> GapRequest {
        GapRequest {
            lineage: lineage(),
            from: MessageRef::new(1000, 3),
            to: MessageRef::new(1000, 3),
            attempt: 1,
        }
    }

    fn coordinator(hub: &Arc<ConnectionHub>) -> (ResendCoordinator, mpsc::Receiver<ResendEvent>) {
        ResendCoordinator::new(hub.clone(), &PipelineOptions::new("stream", 0), TIMEOUT)
    }

    fn resent_message() -> StreamMessage {
        StreamMessage::new(
            "stream",
            0,
            MessageRef::new(1000, 3),
            Some(MessageRef::new(1000, 2)),
            lineage().publisher_id,
            "chain",
            vec![3],
        )
    }

    fn assert_released(hub: &ConnectionHub) {
        for kind in ATTEMPT_KINDS {
            assert_eq!(hub.handler_count(kind), 0, "{:?} handler left registered", kind);
        }
        assert_eq!(hub.request_handle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_forwards_messages_and_reports_after_window() {
        let (hub, mut outbound) = ConnectionHub::new();
        let (mut coordinator, mut events) = coordinator(&hub);
        let started = Instant::now();

        let request_id = coordinator.start(gap());
        assert_eq!(request_id, "stream-0-resend-1");

        match outbound.recv().await {
            Some(ControlRequest::ResendRange { request_id: sent, from, to, msg_chain_id, .. }) => {
                assert_eq!(sent, request_id);
                assert_eq!(from, MessageRef::new(1000, 3));
                assert_eq!(to, MessageRef::new(1000, 3));
                assert_eq!(msg_chain_id, "chain");
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(hub.has_request_handle(&request_id));

        hub.dispatch(ControlMessage::UnicastMessage {
            request_id: "someone-else".into(),
            message: resent_message(),
        })
        .await;
        hub.dispatch(ControlMessage::UnicastMessage {
            request_id: request_id.clone(),
            message: resent_message(),
        })
        .await;
        hub.dispatch(ControlMessage::ResendResponseResent {
            request_id: request_id.clone(),
            stream_id: "stream".into(),
            stream_partition: 0,
        })
        .await;

        match events.recv().await {
            Some(ResendEvent::Message { request_id: got, message }) => {
                assert_eq!(got, request_id);
                assert_eq!(message.message_ref, MessageRef::new(1000, 3));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(ResendEvent::Finished { lineage: got, outcome, .. }) => {
                assert_eq!(got, lineage());
                assert_eq!(outcome, ResendOutcome::Resent);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(started.elapsed() >= TIMEOUT);
        assert_released(&hub);
        assert!(coordinator.complete(&lineage(), &request_id));
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_responder_times_out() {
        let (hub, mut outbound) = ConnectionHub::new();
        let (mut coordinator, mut events) = coordinator(&hub);

        coordinator.start(gap());
        assert!(outbound.recv().await.is_some());

        match events.recv().await {
            Some(ResendEvent::Finished { outcome, .. }) => assert_eq!(outcome, ResendOutcome::TimedOut),
            other => panic!("unexpected event {:?}", other),
        }
        assert_released(&hub);
    }

    #[tokio::test(start_paused = true)]
    async fn error_response_ends_attempt() {
        let (hub, mut outbound) = ConnectionHub::new();
        let (mut coordinator, mut events) = coordinator(&hub);

        let request_id = coordinator.start(gap());
        assert!(outbound.recv().await.is_some());
        hub.dispatch(ControlMessage::ErrorResponse {
            request_id,
            error_message: "storage unavailable".into(),
        })
        .await;

        match events.recv().await {
            Some(ResendEvent::Finished { outcome, .. }) => {
                assert_eq!(outcome, ResendOutcome::Failed("storage unavailable".into()));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_a_failed_attempt() {
        let (hub, outbound) = ConnectionHub::new();
        drop(outbound);
        let (mut coordinator, mut events) = coordinator(&hub);

        coordinator.start(gap());
        match events.recv().await {
            Some(ResendEvent::Finished { outcome, .. }) => {
                assert!(matches!(outcome, ResendOutcome::SendFailed(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_released(&hub);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_everything_silently() {
        let (hub, mut outbound) = ConnectionHub::new();
        let (mut coordinator, mut events) = coordinator(&hub);

        coordinator.start(gap());
        assert!(outbound.recv().await.is_some());
        assert!(coordinator.is_active(&lineage()));

        coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(coordinator.active_count(), 0);
        assert_released(&hub);

        drop(coordinator);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_lineage_supersedes_the_old_attempt() {
        let (hub, mut outbound) = ConnectionHub::new();
        let (mut coordinator, mut events) = coordinator(&hub);

        let first = coordinator.start(gap());
        assert!(outbound.recv().await.is_some());
        let second = coordinator.start(gap());
        assert_ne!(first, second);
        assert!(outbound.recv().await.is_some());

        match events.recv().await {
            Some(ResendEvent::Finished { request_id, .. }) => assert_eq!(request_id, second),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!coordinator.complete(&lineage(), &first));
        assert!(coordinator.complete(&lineage(), &second));
        assert_released(&hub);
    }
}
