//! Typed pub/sub event bus with room-based fan-out.
//!
//! The bus is the single egress for progress and state-change events. A
//! single dispatcher task owns the subscriber table; publishes and
//! membership changes arrive on an inbound channel, so no locks guard the
//! routing state itself.
//!
//! # Delivery contract
//!
//! - [`EventBus::publish`] is non-blocking and never drops an event inside
//!   the process.
//! - Each subscriber has a bounded queue. A slow subscriber overflows by
//!   dropping its **oldest non-terminal** event; terminal events
//!   (completions, session state transitions) are never dropped.
//! - Delivery is at-least-once per still-connected subscriber and ordered
//!   per room (a single dispatcher plus per-subscriber FIFO queues makes
//!   the ordering global, which is stronger).
//! - Dropping a [`Subscription`] unsubscribes; a disconnected client is
//!   indistinguishable from an unsubscribed one.
//!
//! # Rooms
//!
//! Events are addressed to exactly one [`Room`]: `global`,
//! `execution:<id>`, `device:<id>`, or `user:<name>`. Subscribers join any
//! number of rooms and receive only events for rooms they are in.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::report::StepResult;

/// A named subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Queue state and test metadata visible to everyone.
    Global,
    /// Step-level detail for one execution.
    Execution(String),
    /// Per-device telemetry (screenshot frames, session health).
    Device(String),
    /// Direct replies to one user.
    User(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Global => write!(f, "global"),
            Room::Execution(id) => write!(f, "execution:{id}"),
            Room::Device(id) => write!(f, "device:{id}"),
            Room::User(name) => write!(f, "user:{name}"),
        }
    }
}

/// Brief queue entry included in `queue.updated` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntryBrief {
    pub queue_id: String,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub state: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Typed event payloads. Serialized field names are the wire contract;
/// hosts forward these frames verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    #[serde(rename = "queue.updated")]
    QueueUpdated {
        revision: u64,
        entries: Vec<QueueEntryBrief>,
    },

    #[serde(rename = "queue.status.response")]
    QueueStatusResponse {
        viewer: String,
        status: serde_json::Value,
    },

    #[serde(rename = "test.start")]
    TestStart {
        execution_id: String,
        queue_id: String,
        requester: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        test_name: Option<String>,
        device_ids: Vec<String>,
        scenario_ids: Vec<String>,
    },

    #[serde(rename = "test.scenario.start")]
    TestScenarioStart {
        execution_id: String,
        scenario_id: String,
    },

    #[serde(rename = "test.scenario.complete")]
    TestScenarioComplete {
        execution_id: String,
        scenario_id: String,
        status: String,
    },

    #[serde(rename = "test.progress")]
    TestProgress {
        execution_id: String,
        completed: usize,
        total: usize,
        percent: f64,
    },

    #[serde(rename = "test.complete")]
    TestComplete {
        execution_id: String,
        status: String,
        passed: usize,
        failed: usize,
        skipped: usize,
        stopped: usize,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        report_id: Option<String>,
    },

    #[serde(rename = "device.node")]
    DeviceNode {
        execution_id: String,
        device_id: String,
        scenario_id: String,
        repeat: u32,
        step: StepResult,
    },

    #[serde(rename = "device.scenario.start")]
    DeviceScenarioStart {
        execution_id: String,
        device_id: String,
        scenario_id: String,
        repeat: u32,
    },

    #[serde(rename = "device.scenario.complete")]
    DeviceScenarioComplete {
        execution_id: String,
        device_id: String,
        scenario_id: String,
        repeat: u32,
        status: String,
        duration_ms: u64,
    },

    #[serde(rename = "session.health")]
    SessionHealth {
        device_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    #[serde(rename = "screenshot.frame")]
    ScreenshotFrame {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        frame: Vec<u8>,
    },
}

impl EventPayload {
    /// Dotted event kind, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::QueueUpdated { .. } => "queue.updated",
            EventPayload::QueueStatusResponse { .. } => "queue.status.response",
            EventPayload::TestStart { .. } => "test.start",
            EventPayload::TestScenarioStart { .. } => "test.scenario.start",
            EventPayload::TestScenarioComplete { .. } => "test.scenario.complete",
            EventPayload::TestProgress { .. } => "test.progress",
            EventPayload::TestComplete { .. } => "test.complete",
            EventPayload::DeviceNode { .. } => "device.node",
            EventPayload::DeviceScenarioStart { .. } => "device.scenario.start",
            EventPayload::DeviceScenarioComplete { .. } => "device.scenario.complete",
            EventPayload::SessionHealth { .. } => "session.health",
            EventPayload::ScreenshotFrame { .. } => "screenshot.frame",
        }
    }

    /// Terminal state events survive subscriber queue overflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::TestComplete { .. }
                | EventPayload::TestScenarioComplete { .. }
                | EventPayload::DeviceScenarioComplete { .. }
                | EventPayload::SessionHealth { .. }
        )
    }
}

/// An event addressed to a single room.
#[derive(Debug, Clone)]
pub struct Event {
    pub room: Room,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(room: Room, payload: EventPayload) -> Self {
        Self { room, payload }
    }
}

enum BusCommand {
    Publish(Event),
    Subscribe {
        rooms: HashSet<Room>,
        reply: oneshot::Sender<(u64, Arc<SubQueue>)>,
    },
    Join {
        id: u64,
        room: Room,
    },
    Leave {
        id: u64,
        room: Room,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Bounded per-subscriber delivery queue.
///
/// Overflow removes the oldest non-terminal event. If every queued event
/// is terminal the queue grows past its capacity; terminal events are few
/// and must not be lost.
struct SubQueue {
    state: Mutex<SubQueueState>,
    notify: Notify,
    capacity: usize,
}

struct SubQueueState {
    items: VecDeque<Event>,
    closed: bool,
    dropped: u64,
}

impl SubQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SubQueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: Event) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                if let Some(pos) = state.items.iter().position(|e| !e.payload.is_terminal()) {
                    state.items.remove(pos);
                    state.dropped += 1;
                }
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Result<Option<Event>, Closed> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.items.pop_front() {
            Some(event) => Ok(Some(event)),
            None if state.closed => Err(Closed),
            None => Ok(None),
        }
    }

    fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

struct Closed;

/// A live subscription. Receive with [`recv`](Subscription::recv); drop to
/// unsubscribe.
pub struct Subscription {
    id: u64,
    queue: Arc<SubQueue>,
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus shuts down
    /// or this subscription is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Ok(Some(event)) => return Some(event),
                Err(Closed) => return None,
                Ok(None) => notified.await,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.pop().ok().flatten()
    }

    /// Joins an additional room.
    pub fn join(&self, room: Room) {
        let _ = self.tx.send(BusCommand::Join { id: self.id, room });
    }

    /// Leaves a room.
    pub fn leave(&self, room: Room) {
        let _ = self.tx.send(BusCommand::Leave { id: self.id, room });
    }

    /// Events dropped from this subscription's queue due to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        let _ = self.tx.send(BusCommand::Unsubscribe { id: self.id });
    }
}

/// Cheaply cloneable handle to the bus dispatcher.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl EventBus {
    /// Spawns the dispatcher task and returns a handle to it. The task
    /// runs until `shutdown` is cancelled.
    pub fn spawn(queue_depth: usize, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, queue_depth, shutdown));
        Self { tx }
    }

    /// Publishes an event. Never blocks; delivery happens on the
    /// dispatcher task.
    pub fn publish(&self, room: Room, payload: EventPayload) {
        trace!(room = %room, kind = payload.kind(), "publish");
        let _ = self.tx.send(BusCommand::Publish(Event::new(room, payload)));
    }

    /// Subscribes to a set of rooms.
    pub async fn subscribe(&self, rooms: impl IntoIterator<Item = Room>) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::Subscribe {
                rooms: rooms.into_iter().collect(),
                reply,
            })
            .ok()?;
        let (id, queue) = rx.await.ok()?;
        Some(Subscription {
            id,
            queue,
            tx: self.tx.clone(),
        })
    }
}

struct SubscriberSlot {
    rooms: HashSet<Room>,
    queue: Arc<SubQueue>,
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<BusCommand>,
    queue_depth: usize,
    shutdown: CancellationToken,
) {
    let mut subscribers: HashMap<u64, SubscriberSlot> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        let command = tokio::select! {
            command = rx.recv() => match command {
                Some(c) => c,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match command {
            BusCommand::Publish(event) => {
                for slot in subscribers.values() {
                    if slot.rooms.contains(&event.room) {
                        slot.queue.push(event.clone());
                    }
                }
            }
            BusCommand::Subscribe { rooms, reply } => {
                let id = next_id;
                next_id += 1;
                let queue = Arc::new(SubQueue::new(queue_depth));
                subscribers.insert(
                    id,
                    SubscriberSlot {
                        rooms,
                        queue: Arc::clone(&queue),
                    },
                );
                let _ = reply.send((id, queue));
            }
            BusCommand::Join { id, room } => {
                if let Some(slot) = subscribers.get_mut(&id) {
                    slot.rooms.insert(room);
                }
            }
            BusCommand::Leave { id, room } => {
                if let Some(slot) = subscribers.get_mut(&id) {
                    slot.rooms.remove(&room);
                }
            }
            BusCommand::Unsubscribe { id } => {
                if let Some(slot) = subscribers.remove(&id) {
                    slot.queue.close();
                }
            }
        }
    }

    debug!("event bus dispatcher stopped");
    for slot in subscribers.values() {
        slot.queue.close();
    }
}
