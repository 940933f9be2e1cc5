//! # Master-side delegate broker.
//!
//! Implements the request/response "delegate" pattern of the control
//! protocol: a worker proposes work on a topic; handler code in the
//! master (any bus subscriber holding a [`DelegateHub`]) performs it and
//! responds on the request's `expect` topic; the broker correlates the
//! response, routes it back to the requested workers, and times out
//! pending requests that never get answered.
//!
//! ## Flow
//! ```text
//! worker ── Delegate{delegate, expect, matches, targets, timeout} ──► broker
//!   broker ── publish DelegateRequested ──► Bus ──► handler subscriber
//!   handler ── hub.respond(expect, value) ──► broker.resolve()
//!     ├─ match found   → Notify{topic, body}        → targets or broadcast
//!     └─ after timeout → Notify{topic, origin, err} → targets or broadcast
//! ```
//!
//! ## Rules
//! - Correlation compares the named top-level fields of the request body
//!   against the response payload (`matches` field-equality).
//! - Exactly one pending correlation per outstanding request; a request
//!   with `notification = true` additionally registers its `expect` topic
//!   for future pushes, whether the request resolves or times out.
//!   Registration is idempotent per topic.
//! - Timeout never hangs a party: the origin body is redelivered with an
//!   attached error instead of a result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::{Bus, Event, EventKind};

use super::message::{ControlMessage, DelegateRequest};

/// A routing instruction for the supervisor core loop: deliver `message`
/// to `targets`, or to every live worker when `targets` is `None`.
#[derive(Debug)]
pub struct Outbound {
    /// Specific worker PIDs, or `None` for broadcast.
    pub targets: Option<Vec<u32>>,
    /// The message to deliver.
    pub message: ControlMessage,
}

struct Pending {
    id: u64,
    expect: String,
    origin: Value,
    matches: Vec<String>,
    targets: Option<Vec<u32>>,
    notification: bool,
}

#[derive(Default)]
struct Inner {
    pending: Vec<Pending>,
    /// expect topic → routing targets registered for future pushes.
    notifications: HashMap<String, Option<Vec<u32>>>,
}

/// Correlates delegate responses with pending requests.
pub struct DelegateBroker {
    bus: Bus,
    outbound: mpsc::UnboundedSender<Outbound>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl DelegateBroker {
    /// Creates a broker publishing on `bus` and routing responses through
    /// `outbound` (consumed by the supervisor core loop).
    pub fn new(bus: Bus, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            outbound,
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Accepts a delegate request from worker `from_pid`.
    ///
    /// Publishes `DelegateRequested` for handler subscribers; when the
    /// request expects a response, registers a pending correlation and
    /// arms its timeout.
    pub fn handle_request(self: &Arc<Self>, from_pid: u32, req: DelegateRequest) {
        self.bus.publish(
            Event::new(EventKind::DelegateRequested)
                .with_pid(from_pid)
                .with_topic(req.delegate.clone())
                .with_payload(req.body.clone()),
        );

        let Some(expect) = req.expect.clone() else {
            return;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = req.timeout();
        {
            let mut inner = self.inner.lock().expect("delegate broker lock poisoned");
            inner.pending.push(Pending {
                id,
                expect,
                origin: req.body.clone(),
                matches: req.matches.clone(),
                targets: req.targets.clone(),
                notification: req.notification,
            });
        }

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            broker.expire(id);
        });
    }

    /// Resolves `topic` with a handler-produced `response`.
    ///
    /// Routes the response to the first pending request whose correlation
    /// fields match; otherwise, if the topic is registered for
    /// notifications, routes it as a future-update push. Unmatched,
    /// unregistered responses are dropped.
    pub fn resolve(&self, topic: &str, response: Value) {
        let routed = {
            let mut inner = self.inner.lock().expect("delegate broker lock poisoned");
            let found = inner.pending.iter().position(|p| {
                p.expect == topic && fields_match(&p.origin, &response, &p.matches)
            });
            match found {
                Some(idx) => {
                    let p = inner.pending.swap_remove(idx);
                    if p.notification {
                        // Idempotent: a second registration for the same
                        // topic reuses the first route.
                        inner
                            .notifications
                            .entry(p.expect.clone())
                            .or_insert_with(|| p.targets.clone());
                    }
                    Some(p.targets)
                }
                None => inner.notifications.get(topic).cloned(),
            }
        };

        if let Some(targets) = routed {
            self.route(targets, topic, response, None);
            self.bus
                .publish(Event::new(EventKind::DelegateResolved).with_topic(topic));
        }
    }

    /// Times out pending request `id` if still unresolved: redelivers the
    /// origin body with an attached error. A `notification` request keeps
    /// its topic registration either way; timing out only ends the wait
    /// for the direct response.
    fn expire(&self, id: u64) {
        let expired = {
            let mut inner = self.inner.lock().expect("delegate broker lock poisoned");
            inner.pending.iter().position(|p| p.id == id).map(|idx| {
                let p = inner.pending.swap_remove(idx);
                if p.notification {
                    inner
                        .notifications
                        .entry(p.expect.clone())
                        .or_insert_with(|| p.targets.clone());
                }
                p
            })
        };

        let Some(p) = expired else {
            return; // resolved in time
        };
        self.bus.publish(
            Event::new(EventKind::DelegateTimedOut)
                .with_topic(p.expect.clone())
                .with_reason("timeout"),
        );
        self.route(p.targets, &p.expect, p.origin, Some("timeout".to_string()));
    }

    fn route(&self, targets: Option<Vec<u32>>, topic: &str, body: Value, error: Option<String>) {
        let _ = self.outbound.send(Outbound {
            targets,
            message: ControlMessage::Notify {
                topic: topic.to_string(),
                body,
                error,
            },
        });
    }
}

/// Cloneable handle for responding to delegate topics from handler code.
#[derive(Clone)]
pub struct DelegateHub {
    broker: Arc<DelegateBroker>,
}

impl DelegateHub {
    /// Creates a hub backed by `broker`.
    pub fn new(broker: Arc<DelegateBroker>) -> Self {
        Self { broker }
    }

    /// Responds on `topic` with `value`.
    ///
    /// Resolves a pending correlation when one matches, or pushes a
    /// notification when the topic is registered for updates.
    pub fn respond(&self, topic: &str, value: Value) {
        self.broker.resolve(topic, value);
    }
}

fn fields_match(origin: &Value, response: &Value, fields: &[String]) -> bool {
    fields
        .iter()
        .all(|f| origin.get(f.as_str()) == response.get(f.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn broker() -> (Arc<DelegateBroker>, mpsc::UnboundedReceiver<Outbound>, Bus) {
        let bus = Bus::new(64);
        let (tx, rx) = mpsc::unbounded_channel();
        (DelegateBroker::new(bus.clone(), tx), rx, bus)
    }

    fn request(expect: &str) -> DelegateRequest {
        DelegateRequest {
            delegate: "lookup".into(),
            expect: Some(expect.into()),
            matches: vec!["key".into()],
            targets: None,
            notification: false,
            timeout_ms: Some(50),
            body: json!({"key": "a"}),
        }
    }

    #[tokio::test]
    async fn matching_response_is_routed_broadcast() {
        let (broker, mut rx, _bus) = broker();
        broker.handle_request(100, request("lookup_done"));
        broker.resolve("lookup_done", json!({"key": "a", "value": 1}));

        let out = rx.recv().await.unwrap();
        assert!(out.targets.is_none());
        let ControlMessage::Notify { topic, body, error } = out.message else {
            panic!("expected notify");
        };
        assert_eq!(topic, "lookup_done");
        assert_eq!(body, json!({"key": "a", "value": 1}));
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn mismatched_correlation_fields_do_not_resolve() {
        let (broker, mut rx, _bus) = broker();
        broker.handle_request(100, request("lookup_done"));
        // Different "key": not a response to this request and the topic
        // is not registered for notifications either.
        broker.resolve("lookup_done", json!({"key": "b", "value": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_redelivers_origin_with_error() {
        let (broker, mut rx, bus) = broker();
        let mut events = bus.subscribe();
        broker.handle_request(100, request("lookup_done"));

        let out = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ControlMessage::Notify { topic, body, error } = out.message else {
            panic!("expected notify");
        };
        assert_eq!(topic, "lookup_done");
        assert_eq!(body, json!({"key": "a"}));
        assert_eq!(error.as_deref(), Some("timeout"));

        // DelegateRequested then DelegateTimedOut on the bus.
        assert_eq!(events.recv().await.unwrap().kind, EventKind::DelegateRequested);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::DelegateTimedOut);
    }

    #[tokio::test]
    async fn targets_are_preserved_on_routing() {
        let (broker, mut rx, _bus) = broker();
        let mut req = request("lookup_done");
        req.targets = Some(vec![7, 9]);
        broker.handle_request(7, req);
        broker.resolve("lookup_done", json!({"key": "a"}));
        let out = rx.recv().await.unwrap();
        assert_eq!(out.targets, Some(vec![7, 9]));
    }

    #[tokio::test]
    async fn notification_registration_is_idempotent() {
        let (broker, mut rx, _bus) = broker();
        let mut req = request("updates");
        req.notification = true;
        req.timeout_ms = Some(5_000);

        // Two outstanding requests, both registering the same topic.
        broker.handle_request(1, req.clone());
        broker.handle_request(2, req);
        broker.resolve("updates", json!({"key": "a", "rev": 1}));
        broker.resolve("updates", json!({"key": "a", "rev": 2}));
        // Both pendings resolved; drain those two.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        // A later push on the registered topic routes exactly once.
        broker.resolve("updates", json!({"key": "zzz", "rev": 3}));
        let out = rx.recv().await.unwrap();
        let ControlMessage::Notify { body, .. } = out.message else {
            panic!("expected notify");
        };
        assert_eq!(body, json!({"key": "zzz", "rev": 3}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_survives_a_timed_out_request() {
        let (broker, mut rx, _bus) = broker();
        let mut req = request("updates");
        req.notification = true;
        req.timeout_ms = Some(30);
        broker.handle_request(1, req);

        // The direct response never comes: the origin is redelivered with
        // the timeout error.
        let out = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ControlMessage::Notify { error, .. } = out.message else {
            panic!("expected notify");
        };
        assert_eq!(error.as_deref(), Some("timeout"));

        // The topic registration must outlive the timeout: a later push
        // still routes.
        broker.resolve("updates", json!({"key": "zzz", "rev": 1}));
        let out = rx.recv().await.unwrap();
        let ControlMessage::Notify { body, error, .. } = out.message else {
            panic!("expected notify");
        };
        assert_eq!(body, json!({"key": "zzz", "rev": 1}));
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn resolved_request_does_not_fire_timeout() {
        let (broker, mut rx, bus) = broker();
        let mut events = bus.subscribe();
        broker.handle_request(100, request("lookup_done"));
        broker.resolve("lookup_done", json!({"key": "a"}));
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
        // Requested then Resolved, never TimedOut.
        assert_eq!(events.recv().await.unwrap().kind, EventKind::DelegateRequested);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::DelegateResolved);
        assert!(events.try_recv().is_err());
    }
}
