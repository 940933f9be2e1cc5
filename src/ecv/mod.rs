//! # ECV health-check responder.
//!
//! Each worker serves a probe endpoint for external traffic managers on a
//! dedicated port shared across the pool (`SO_REUSEPORT`, like the
//! application ports), so probing the cluster address exercises whichever
//! worker the kernel picks.
//!
//! The probe result is a three-way decision rendered in a fixed
//! `key=value&`-joined plain-text body:
//!
//! - **disabled** → `400`, `status=DISABLED`, `ServeTraffic=false`
//! - **validator passed** → `200`, `status=AVAILABLE`, `ServeTraffic=true`
//! - **validator failed or panicked** → `500`, `status=WARNING`,
//!   `ServeTraffic=false`
//!
//! With `control = true`, `POST <path>/disable` and `POST <path>/enable`
//! flip the disabled flag locally and ask the master to broadcast the same
//! command to the whole pool, so one probe endpoint can take the entire
//! cluster out of rotation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Local};
use futures::FutureExt;

use crate::config::EcvConfig;
use crate::events::{Bus, Event, EventKind};
use crate::protocol::Command;
use crate::worker::{ControlHandle, DrainState};

/// Application-health probe used by the ECV endpoint.
///
/// The default ([`TcpProbe`]) only checks that the worker accepts TCP on
/// its first application port; richer applications substitute their own
/// (e.g. a dependency ping).
#[async_trait]
pub trait Validator: Send + Sync + 'static {
    /// Returns `Ok` when the worker should serve traffic.
    async fn validate(&self) -> Result<(), String>;
}

/// Default validator: a loopback TCP connect against an application port.
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    /// Probes `127.0.0.1:port`.
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Validator for TcpProbe {
    async fn validate(&self) -> Result<(), String> {
        tokio::net::TcpStream::connect(("127.0.0.1", self.port))
            .await
            .map(drop)
            .map_err(|e| format!("tcp probe on port {} failed: {e}", self.port))
    }
}

/// Shared state of one worker's ECV responder.
pub struct EcvState {
    cfg: EcvConfig,
    drain: Arc<DrainState>,
    started: SystemTime,
    port: u16,
    hostname: String,
    ip: String,
    validator: Arc<dyn Validator>,
    ctl: ControlHandle,
    bus: Bus,
}

impl EcvState {
    /// Creates the responder state for a worker serving `port`.
    pub fn new(
        cfg: EcvConfig,
        drain: Arc<DrainState>,
        port: u16,
        validator: Arc<dyn Validator>,
        ctl: ControlHandle,
        bus: Bus,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            drain,
            started: SystemTime::now(),
            port,
            hostname: hostname(),
            ip: local_ip(),
            validator,
            ctl,
            bus,
        })
    }

    fn respond(&self, code: StatusCode, status: &str, serve_traffic: bool) -> Response {
        let now: DateTime<Local> = Local::now();
        let since: DateTime<Local> = self.started.into();
        let body = format!(
            "status={status}&ServeTraffic={serve_traffic}&ip={}&hostname={}&port={}&time={}",
            self.ip,
            self.hostname,
            self.port,
            now.to_rfc2822(),
        );
        (
            code,
            [
                ("since", since.to_rfc2822()),
                ("cache-control", "no-cache".to_string()),
                ("connection", "close".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

/// Builds the ECV router for `state`. Control routes are only mounted
/// when the configuration enables them.
pub fn router(state: Arc<EcvState>) -> Router {
    let mut r = Router::new().route(&state.cfg.path, get(probe));
    if state.cfg.control {
        r = r
            .route(&format!("{}/disable", state.cfg.path), post(disable))
            .route(&format!("{}/enable", state.cfg.path), post(enable));
    }
    r.with_state(state)
}

async fn probe(State(st): State<Arc<EcvState>>) -> Response {
    if st.drain.is_disabled() {
        return st.respond(StatusCode::BAD_REQUEST, "DISABLED", false);
    }
    let checked = std::panic::AssertUnwindSafe(st.validator.validate())
        .catch_unwind()
        .await;
    match checked {
        Ok(Ok(())) => st.respond(StatusCode::OK, "AVAILABLE", true),
        Ok(Err(reason)) => {
            eprintln!("[clustervisor] ecv validator failed: {reason}");
            st.respond(StatusCode::INTERNAL_SERVER_ERROR, "WARNING", false)
        }
        Err(_) => {
            eprintln!("[clustervisor] ecv validator panicked");
            st.respond(StatusCode::INTERNAL_SERVER_ERROR, "WARNING", false)
        }
    }
}

async fn disable(State(st): State<Arc<EcvState>>) -> StatusCode {
    if !st.drain.set_disabled(true) {
        st.bus
            .publish(Event::new(EventKind::WorkerDisabled).with_pid(st.ctl.pid()));
    }
    st.ctl.command(Command::Disable).await;
    StatusCode::NO_CONTENT
}

async fn enable(State(st): State<Arc<EcvState>>) -> StatusCode {
    if st.drain.set_disabled(false) {
        st.bus
            .publish(Event::new(EventKind::WorkerEnabled).with_pid(st.ctl.pid()));
    }
    st.ctl.command(Command::Enable).await;
    StatusCode::NO_CONTENT
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Best-effort local address discovery: a connected UDP socket picks the
/// outbound interface without sending anything.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct Always(Result<(), String>);

    #[async_trait]
    impl Validator for Always {
        async fn validate(&self) -> Result<(), String> {
            self.0.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl Validator for Panicking {
        async fn validate(&self) -> Result<(), String> {
            panic!("validator blew up");
        }
    }

    fn state(
        validator: Arc<dyn Validator>,
        control: bool,
    ) -> (Arc<EcvState>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let st = EcvState::new(
            EcvConfig {
                control,
                ..EcvConfig::default()
            },
            DrainState::new(),
            8080,
            validator,
            ControlHandle::new(77, tx),
            Bus::new(8),
        );
        (st, rx)
    }

    async fn get_probe(router: Router) -> (StatusCode, String) {
        let res = router
            .oneshot(Request::builder().uri("/ecv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = res.status();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (code, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthy_worker_is_available() {
        let (st, _rx) = state(Arc::new(Always(Ok(()))), false);
        let (code, body) = get_probe(router(st)).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.starts_with("status=AVAILABLE&ServeTraffic=true&"));
        assert!(body.contains("&port=8080&"));
    }

    #[tokio::test]
    async fn failing_validator_reports_warning() {
        let (st, _rx) = state(Arc::new(Always(Err("db down".into()))), false);
        let (code, body) = get_probe(router(st)).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("status=WARNING&ServeTraffic=false&"));
    }

    #[tokio::test]
    async fn panicking_validator_reports_warning() {
        let (st, _rx) = state(Arc::new(Panicking), false);
        let (code, body) = get_probe(router(st)).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("status=WARNING"));
    }

    #[tokio::test]
    async fn disable_flips_state_and_requests_a_broadcast() {
        let (st, mut rx) = state(Arc::new(Always(Ok(()))), true);
        let app = router(st.clone());

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ecv/disable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlMessage::Command {
                command: Command::Disable
            }
        );

        let (code, body) = get_probe(app).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("status=DISABLED&ServeTraffic=false&"));
    }

    #[tokio::test]
    async fn control_routes_are_absent_by_default() {
        let (st, _rx) = state(Arc::new(Always(Ok(()))), false);
        let res = router(st)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ecv/disable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn since_header_is_set() {
        let (st, _rx) = state(Arc::new(Always(Ok(()))), false);
        let res = router(st)
            .oneshot(Request::builder().uri("/ecv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.headers().contains_key("since"));
        assert_eq!(res.headers()["cache-control"], "no-cache");
    }
}
