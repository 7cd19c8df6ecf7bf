//! Per-session event fan-out.
//!
//! Every session owns a logical publish channel. Events published while no
//! subscriber is attached are buffered in a bounded backlog (default 100,
//! drop-oldest with a loss counter); a subscriber first receives the
//! backlog, then live events. Publication is non-blocking — a slow
//! subscriber can never stall the runner.
//!
//! Ordering is FIFO per session: every event carries a strictly increasing
//! `sequence`, and `(session_id, sequence)` is the dedup key for
//! at-least-once delivery.
//!
//! Subscribing replays the backlog in order, then appends a
//! `connection_established` marker (it carries the next sequence number,
//! so delivery order and sequence order always agree), then goes live.
//!
//! # Examples
//!
//! ```rust
//! use specloom::events::{EventFanout, EventPayload};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let fanout = EventFanout::new(100);
//! fanout.publish("sess-1", EventPayload::Pong);
//!
//! let mut stream = fanout.subscribe("sess-1");
//! let first = stream.recv().await.unwrap();
//! assert!(matches!(first.payload, EventPayload::Pong));
//! let second = stream.recv().await.unwrap();
//! assert!(matches!(second.payload, EventPayload::ConnectionEstablished));
//! assert!(second.sequence > first.sequence);
//! # }
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::domain::{ErrorKind, MessageType};

/// Semantic payload of a session event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// First event on every new subscription.
    ConnectionEstablished,
    ProgressUpdate {
        progress: f32,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    AgentMessage {
        message: String,
        message_type: MessageType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    UserMessageEcho {
        message: String,
    },
    Completion {
        artifact_id: String,
        version: u32,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    Pong,
}

/// An event as delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    /// Strictly increasing per session; dedup key together with
    /// `session_id`.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

struct SessionChannel {
    next_sequence: u64,
    backlog: VecDeque<SessionEvent>,
    dropped: u64,
    subscribers: Vec<flume::Sender<SessionEvent>>,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            backlog: VecDeque::new(),
            dropped: 0,
            subscribers: Vec::new(),
        }
    }
}

/// Fan-out hub for all sessions. Cheap to clone via `Arc`.
pub struct EventFanout {
    capacity: usize,
    sessions: Mutex<FxHashMap<String, SessionChannel>>,
}

impl EventFanout {
    /// `capacity` bounds the per-session offline backlog.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Publish an event. Never blocks: the backlog drops its oldest entry
    /// on overflow and disconnected subscribers are pruned.
    pub fn publish(&self, session_id: &str, payload: EventPayload) {
        let mut sessions = self.sessions.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);
        let event = SessionEvent {
            session_id: session_id.to_string(),
            sequence: channel.next_sequence,
            timestamp: Utc::now(),
            payload,
        };
        channel.next_sequence += 1;

        if channel.backlog.len() == self.capacity {
            channel.backlog.pop_front();
            channel.dropped += 1;
            tracing::warn!(
                session = session_id,
                dropped_total = channel.dropped,
                "event backlog full, dropping oldest"
            );
        }
        channel.backlog.push_back(event.clone());

        channel
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Attach a subscriber. The stream yields the buffered backlog, then
    /// a `connection_established` marker, then live events — sequence
    /// numbers stay strictly increasing across all three.
    pub fn subscribe(&self, session_id: &str) -> EventStream {
        let (tx, rx) = flume::unbounded();
        let mut sessions = self.sessions.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);

        for event in &channel.backlog {
            let _ = tx.send(event.clone());
        }
        let hello = SessionEvent {
            session_id: session_id.to_string(),
            sequence: channel.next_sequence,
            timestamp: Utc::now(),
            payload: EventPayload::ConnectionEstablished,
        };
        channel.next_sequence += 1;
        let _ = tx.send(hello);
        channel.subscribers.push(tx);
        EventStream { rx }
    }

    /// Events lost to backlog overflow for a session.
    #[must_use]
    pub fn dropped(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .map_or(0, |c| c.dropped)
    }

    /// Answer a transport keepalive.
    pub fn pong(&self, session_id: &str) {
        self.publish(session_id, EventPayload::Pong);
    }

    /// Drop a session's channel (terminal sessions, GC).
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

/// Publishing handle bound to one session; what nodes see in their
/// context.
#[derive(Clone)]
pub struct SessionPublisher {
    fanout: Arc<EventFanout>,
    session_id: String,
}

impl SessionPublisher {
    pub fn new(fanout: Arc<EventFanout>, session_id: impl Into<String>) -> Self {
        Self {
            fanout,
            session_id: session_id.into(),
        }
    }

    pub fn publish(&self, payload: EventPayload) {
        self.fanout.publish(&self.session_id, payload);
    }

    pub fn agent_message(
        &self,
        message: impl Into<String>,
        message_type: MessageType,
        data: Option<Value>,
    ) {
        self.publish(EventPayload::AgentMessage {
            message: message.into(),
            message_type,
            data,
        });
    }
}

/// Receiving side of a subscription.
pub struct EventStream {
    rx: flume::Receiver<SessionEvent>,
}

impl EventStream {
    /// Await the next event; `None` once the fan-out side is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Adapt into a [`futures_util::Stream`] for transports that speak
    /// streams (SSE, WebSocket bridges).
    pub fn into_stream(self) -> impl futures_util::Stream<Item = SessionEvent> {
        futures_util::stream::unfold(self.rx, |rx| async move {
            rx.recv_async().await.ok().map(|event| (event, rx))
        })
    }
}
