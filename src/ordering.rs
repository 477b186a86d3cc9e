//! # Ordering Engine
//!
//! One [`OrderingEngine`] per (stream, partition). It keeps one queue per
//! lineage `(publisher_id, msg_chain_id)` and emits each lineage's messages
//! strictly along the producer-declared `prev_ref` chain.
//!
//! ## Lineage State Machine
//!
//! ```text
//!   arrival ──► duplicate? ──yes──► drop
//!                  │no
//!                  ▼
//!             connects to last_emitted? ──yes──► emit, drain buffer
//!                  │no
//!                  ▼
//!             buffer ──► gap pending? ──no──► open gap (last, prev_ref]
//! ```
//!
//! A gap closes when emission reaches its upper bound, or when it is
//! abandoned after the resend budget is spent; abandoning force-advances the
//! lineage to the upper bound.
//!
//! The engine is a plain state machine. It performs no I/O; every call
//! returns the [`OrderingEvent`]s the caller must act on.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::config::{MAX_LINEAGES, PipelineConfig};
use crate::error::PipelineError;
use crate::messages::{LineageKey, MessageRef, StreamMessage};

/// Output of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderingEvent {
    /// Next message in its lineage.
    Ordered(StreamMessage),
    /// A gap opened; the caller should request a resend of this range.
    Gap(GapRequest),
    /// The lineage's pending gap is resolved.
    GapClosed(LineageKey),
    /// A bye message was emitted. No further output follows.
    End,
}

/// Inclusive range of one lineage to request again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GapRequest {
    pub lineage: LineageKey,
    pub from: MessageRef,
    pub to: MessageRef,
    /// 1-based attempt number this request belongs to.
    pub attempt: u32,
}

/// Result of [`OrderingEngine::retry_gap`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GapRetry {
    Retry(GapRequest),
    /// The attempt budget is spent; the caller should abandon the gap.
    Exhausted,
    /// No gap is pending on the lineage any more.
    Closed,
}

#[derive(Clone, Copy, Debug)]
struct Gap {
    to: MessageRef,
    attempts: u32,
}

/// A buffered chain position. `message` is `None` for positions that were
/// rejected upstream and must be skipped rather than emitted.
#[derive(Debug)]
struct Slot {
    prev_ref: Option<MessageRef>,
    message: Option<StreamMessage>,
}

#[derive(Debug, Default)]
struct LineageQueue {
    last_emitted: Option<MessageRef>,
    buffer: BTreeMap<MessageRef, Slot>,
    gap: Option<Gap>,
}

impl LineageQueue {
    fn is_duplicate(&self, message_ref: MessageRef) -> bool {
        self.last_emitted.is_some_and(|last| message_ref <= last) || self.buffer.contains_key(&message_ref)
    }

    /// A missing `prev_ref`, or one already passed, declares no pending predecessor.
    ///
    /// The second case is a forked chain: a producer that restarted from an
    /// older ref. Its predecessor can never be emitted again, so the message
    /// connects instead of opening a gap.
    fn connects(&self, prev_ref: Option<MessageRef>) -> bool {
        match (self.last_emitted, prev_ref) {
            (None, _) | (Some(_), None) => true,
            (Some(last), Some(prev)) => prev <= last,
        }
    }

    /// Take the position `message_ref`. Returns true if a bye message was emitted.
    fn accept(&mut self, message_ref: MessageRef, slot: Slot, events: &mut Vec<OrderingEvent>) -> bool {
        self.last_emitted = Some(message_ref);
        match slot.message {
            Some(message) => {
                let bye = message.bye;
                events.push(OrderingEvent::Ordered(message));
                bye
            }
            None => false,
        }
    }

    /// Emit buffered positions that now connect. Returns true on bye.
    fn drain(&mut self, events: &mut Vec<OrderingEvent>) -> bool {
        loop {
            let Some((_, head)) = self.buffer.first_key_value() else {
                return false;
            };
            if !self.connects(head.prev_ref) {
                return false;
            }
            let Some((message_ref, slot)) = self.buffer.pop_first() else {
                return false;
            };
            if self.accept(message_ref, slot, events) {
                return true;
            }
        }
    }

    /// Close a reached gap, then open a new one if the buffer head is disconnected.
    fn refresh_gap(&mut self, key: &LineageKey, events: &mut Vec<OrderingEvent>) {
        if let Some(gap) = self.gap
            && self.last_emitted.is_some_and(|last| last >= gap.to)
        {
            self.gap = None;
            trace!(lineage = %key, "gap closed");
            events.push(OrderingEvent::GapClosed(key.clone()));
        }

        if self.gap.is_none()
            && let Some(last) = self.last_emitted
            && let Some((_, head)) = self.buffer.first_key_value()
            && let Some(to) = head.prev_ref
        {
            self.gap = Some(Gap { to, attempts: 1 });
            debug!(lineage = %key, from = %last, to = %to, "gap detected");
            events.push(OrderingEvent::Gap(GapRequest {
                lineage: key.clone(),
                from: last.successor(),
                to,
                attempt: 1,
            }));
        }
    }
}

pub struct OrderingEngine {
    stream_id: String,
    stream_partition: u32,
    order_messages: bool,
    max_buffered_per_lineage: usize,
    lineages: HashMap<LineageKey, LineageQueue>,
    /// Duplicate filter used when ordering is disabled.
    seen: LruCache<(LineageKey, MessageRef), ()>,
    ended: bool,
}

impl OrderingEngine {
    pub fn new(stream_id: impl Into<String>, stream_partition: u32, config: &PipelineConfig) -> Self {
        let seen_cap = NonZeroUsize::new(config.cache_max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            stream_id: stream_id.into(),
            stream_partition,
            order_messages: config.order_messages,
            max_buffered_per_lineage: config.max_buffered_per_lineage,
            lineages: HashMap::new(),
            seen: LruCache::new(seen_cap),
            ended: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_partition(&self) -> u32 {
        self.stream_partition
    }

    /// True once a bye message has been emitted.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn lineage_count(&self) -> usize {
        self.lineages.len()
    }

    pub fn last_emitted(&self, key: &LineageKey) -> Option<MessageRef> {
        self.lineages.get(key).and_then(|queue| queue.last_emitted)
    }

    pub fn buffered(&self, key: &LineageKey) -> usize {
        self.lineages.get(key).map_or(0, |queue| queue.buffer.len())
    }

    pub fn has_gap(&self, key: &LineageKey) -> bool {
        self.lineages.get(key).is_some_and(|queue| queue.gap.is_some())
    }

    pub fn pending_gaps(&self) -> usize {
        self.lineages.values().filter(|queue| queue.gap.is_some()).count()
    }

    /// Feed a validated message.
    pub fn add(&mut self, message: StreamMessage) -> Vec<OrderingEvent> {
        if !self.accepts(&message) {
            return Vec::new();
        }
        if !self.order_messages {
            return self.pass_through(message);
        }
        let key = message.lineage();
        let message_ref = message.message_ref;
        let slot = Slot {
            prev_ref: message.prev_ref,
            message: Some(message),
        };
        self.insert(key, message_ref, slot)
    }

    /// Record that `message` was rejected upstream.
    ///
    /// Its chain position is taken without emitting anything, so the lineage
    /// advances past it once its predecessors are emitted instead of waiting
    /// for a resend that would return the same rejected message.
    pub fn mark_explicitly(&mut self, message: &StreamMessage) -> Vec<OrderingEvent> {
        if !self.accepts(message) {
            return Vec::new();
        }
        if !self.order_messages {
            self.seen.put((message.lineage(), message.message_ref), ());
            return Vec::new();
        }
        let slot = Slot {
            prev_ref: message.prev_ref,
            message: None,
        };
        self.insert(message.lineage(), message.message_ref, slot)
    }

    /// Account for one more resend attempt on the lineage's pending gap.
    pub fn retry_gap(&mut self, key: &LineageKey, budget: u32) -> GapRetry {
        let Some(queue) = self.lineages.get_mut(key) else {
            return GapRetry::Closed;
        };
        let (Some(gap), Some(last)) = (queue.gap.as_mut(), queue.last_emitted) else {
            return GapRetry::Closed;
        };
        if gap.attempts >= budget {
            return GapRetry::Exhausted;
        }
        gap.attempts += 1;
        GapRetry::Retry(GapRequest {
            lineage: key.clone(),
            from: last.successor(),
            to: gap.to,
            attempt: gap.attempts,
        })
    }

    /// Give up on the lineage's pending gap: skip to its upper bound and
    /// emit whatever now connects.
    pub fn abandon_gap(&mut self, key: &LineageKey) -> Vec<OrderingEvent> {
        let mut events = Vec::new();
        if self.ended {
            return events;
        }
        let Some(queue) = self.lineages.get_mut(key) else {
            return events;
        };
        let Some(gap) = queue.gap.take() else {
            return events;
        };

        let from = queue.last_emitted.map_or(gap.to, |last| last.successor());
        if queue.last_emitted.is_none_or(|last| last < gap.to) {
            queue.last_emitted = Some(gap.to);
        }
        let retained = queue.buffer.split_off(&gap.to.successor());
        let discarded = std::mem::replace(&mut queue.buffer, retained).len();

        let error = PipelineError::GapFillExhausted {
            lineage: key.to_string(),
            from,
            to: gap.to,
            attempts: gap.attempts,
        };
        warn!(error = %error, discarded, "abandoning unfillable gap");
        events.push(OrderingEvent::GapClosed(key.clone()));

        if queue.drain(&mut events) {
            self.finish(&mut events);
            return events;
        }
        queue.refresh_gap(key, &mut events);
        events
    }

    /// Forget every pending gap without emitting anything.
    pub fn clear_gaps(&mut self) {
        for queue in self.lineages.values_mut() {
            queue.gap = None;
        }
    }

    /// Drop all lineage state.
    pub fn clear(&mut self) {
        self.lineages.clear();
        self.seen.clear();
    }

    fn accepts(&self, message: &StreamMessage) -> bool {
        if self.ended {
            trace!("ignoring message after end of stream");
            return false;
        }
        if message.stream_id != self.stream_id || message.stream_partition != self.stream_partition {
            debug!(
                stream = %message.stream_id,
                partition = message.stream_partition,
                "ignoring message for another stream partition"
            );
            return false;
        }
        true
    }

    fn insert(&mut self, key: LineageKey, message_ref: MessageRef, slot: Slot) -> Vec<OrderingEvent> {
        let mut events = Vec::new();

        if !self.lineages.contains_key(&key) && self.lineages.len() >= MAX_LINEAGES {
            warn!(lineage = %key, "lineage table full, dropping message");
            return events;
        }
        let queue = self.lineages.entry(key.clone()).or_default();

        if queue.is_duplicate(message_ref) {
            trace!(lineage = %key, message_ref = %message_ref, "duplicate dropped");
            return events;
        }

        if queue.connects(slot.prev_ref) {
            if queue.accept(message_ref, slot, &mut events) || queue.drain(&mut events) {
                self.finish(&mut events);
                return events;
            }
        } else {
            if queue.buffer.len() >= self.max_buffered_per_lineage {
                warn!(
                    lineage = %key,
                    message_ref = %message_ref,
                    limit = self.max_buffered_per_lineage,
                    "lineage buffer full, dropping message"
                );
                return events;
            }
            trace!(lineage = %key, message_ref = %message_ref, "buffered out of order");
            queue.buffer.insert(message_ref, slot);
        }

        queue.refresh_gap(&key, &mut events);
        events
    }

    fn pass_through(&mut self, message: StreamMessage) -> Vec<OrderingEvent> {
        let seen_key = (message.lineage(), message.message_ref);
        if self.seen.put(seen_key, ()).is_some() {
            trace!(message_ref = %message.message_ref, "duplicate dropped");
            return Vec::new();
        }
        let bye = message.bye;
        let mut events = vec![OrderingEvent::Ordered(message)];
        if bye {
            self.finish(&mut events);
        }
        events
    }

    fn finish(&mut self, events: &mut Vec<OrderingEvent>) {
        debug!(stream = %self.stream_id, partition = self.stream_partition, "bye received, ending stream");
        self.ended = true;
        self.clear_gaps();
        events.push(OrderingEvent::End);
    }
}
