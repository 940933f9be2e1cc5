//! # Connection accounting and draining.
//!
//! Every worker binds the application ports with `SO_REUSEPORT`, so the
//! kernel load-balances accepted connections across the pool without a
//! userspace proxy. [`DrainState`] tracks the live/total/timed-out counts
//! the heartbeat reports and the drain wait polls.
//!
//! Draining means: stop accepting (cancel the accept loops, which closes
//! the listeners), let in-flight connections finish, poll the live count
//! down to zero. In-flight work is never cut off by the drain itself; the
//! configured idle timeout is the only forced teardown.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};

use super::handler::{ConnectionHandler, ControlHandle};

/// Shared connection counters for one worker.
#[derive(Default)]
pub struct DrainState {
    live: AtomicU64,
    total: AtomicU64,
    timedout: AtomicU64,
    disabled: AtomicBool,
}

impl DrainState {
    /// Creates fresh counters.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Currently open connections.
    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Cumulative accepted connections.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Connections destroyed by the timeout.
    pub fn timedout(&self) -> u64 {
        self.timedout.load(Ordering::SeqCst)
    }

    /// Health-check disabled flag.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Sets the disabled flag, returning the previous value.
    pub fn set_disabled(&self, disabled: bool) -> bool {
        self.disabled.swap(disabled, Ordering::SeqCst)
    }

    fn opened(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn timed_out(&self) {
        self.timedout.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Inactivity clock shared between a [`Connection`] and its idle
/// watchdog. The connection stamps it on every successful read or write;
/// the watchdog compares the stamp against the configured limit.
pub(crate) struct IdleClock {
    anchor: Instant,
    last_ms: AtomicU64,
}

impl IdleClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            anchor: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    fn touch(&self) {
        self.last_ms
            .store(self.anchor.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last successful I/O (or since accept, before any).
    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.anchor.elapsed().saturating_sub(last)
    }
}

/// One accepted connection, handed to the [`ConnectionHandler`].
///
/// Wraps the TCP stream so the runtime can observe activity: every
/// successful read or write rearms the idle timeout. A connection that
/// keeps exchanging traffic is never timed out, however long it lives.
pub struct Connection {
    inner: TcpStream,
    clock: Arc<IdleClock>,
}

impl Connection {
    /// Remote peer address.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Local address of the accepting listener.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.clock.touch();
        }
        res
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.clock.touch();
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.clock.touch();
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Binds `addr` with `SO_REUSEADDR` + `SO_REUSEPORT` so sibling workers
/// can share it.
pub(crate) fn bind_shared(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Accepts connections until `accept_token` cancels, spawning one handler
/// task per connection.
///
/// With a `timeout`, a connection idle for that long is destroyed: the
/// handler future (and the stream with it) is dropped, the connection is
/// counted as timed out and a warning event is published. Any read or
/// write on the stream rearms the timer.
pub(crate) async fn serve_listener(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    ctl: ControlHandle,
    state: Arc<DrainState>,
    timeout: Option<Duration>,
    bus: Bus,
    accept_token: CancellationToken,
    conn_token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = accept_token.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _peer)) => stream,
                Err(e) => {
                    eprintln!("[clustervisor] accept failed: {e}");
                    continue;
                }
            },
        };

        state.opened();
        let handler = Arc::clone(&handler);
        let ctl = ctl.clone();
        let state = Arc::clone(&state);
        let bus = bus.clone();
        let shutdown = conn_token.child_token();
        tokio::spawn(async move {
            let pid = ctl.pid();
            let clock = IdleClock::new();
            let conn = Connection {
                inner: stream,
                clock: Arc::clone(&clock),
            };
            let served = handler.handle(conn, ctl, shutdown);
            let timed_out = match timeout {
                Some(limit) => {
                    tokio::pin!(served);
                    loop {
                        let idle = clock.idle_for();
                        if idle >= limit {
                            // Dropping the pinned future tears the
                            // stream down with it.
                            break true;
                        }
                        tokio::select! {
                            result = &mut served => {
                                warn_on_error(result);
                                break false;
                            }
                            _ = tokio::time::sleep(limit - idle) => {}
                        }
                    }
                }
                None => {
                    warn_on_error(served.await);
                    false
                }
            };
            if timed_out {
                state.timed_out();
                bus.publish(Event::new(EventKind::ConnectionTimedOut).with_pid(pid));
            }
            state.closed();
        });
    }
}

fn warn_on_error(result: std::io::Result<()>) {
    if let Err(e) = result {
        eprintln!("[clustervisor] connection handler failed: {e}");
    }
}

/// Polls the live-connection count until it reaches zero.
pub(crate) async fn wait_drained(state: &DrainState, poll: Duration) {
    while state.live() > 0 {
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;
    use crate::worker::handler::HandlerFn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn ctl() -> ControlHandle {
        let (tx, _rx) = mpsc::channel::<ControlMessage>(8);
        // The receiving half is dropped: sends become no-ops, which is
        // all these tests need.
        ControlHandle::new(0, tx)
    }

    fn echo_handler() -> Arc<dyn ConnectionHandler> {
        HandlerFn::new(|mut stream, _ctl, _shutdown| async move {
            let mut buf = [0u8; 256];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        })
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn shared_binding_allows_two_listeners_on_one_port() {
        let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
        let a = bind_shared(addr).unwrap();
        let b = bind_shared(addr).unwrap();
        drop((a, b));
    }

    #[tokio::test]
    async fn connections_are_served_and_counted() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_shared(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let state = DrainState::new();

        tokio::spawn(serve_listener(
            listener,
            echo_handler(),
            ctl(),
            state.clone(),
            None,
            Bus::new(8),
            CancellationToken::new(),
            CancellationToken::new(),
        ));

        let mut client = tokio::net::TcpStream::connect(local).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        wait_drained(&state, Duration::from_millis(10)).await;
        assert_eq!(state.total(), 1);
        assert_eq!(state.live(), 0);
        assert_eq!(state.timedout(), 0);
    }

    #[tokio::test]
    async fn active_connection_outlives_the_idle_limit() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_shared(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let state = DrainState::new();

        tokio::spawn(serve_listener(
            listener,
            echo_handler(),
            ctl(),
            state.clone(),
            Some(Duration::from_millis(100)),
            Bus::new(8),
            CancellationToken::new(),
            CancellationToken::new(),
        ));

        // Pings every 30ms for well past the 100ms limit: each round trip
        // rearms the timer, so the connection must survive.
        let mut client = tokio::net::TcpStream::connect(local).await.unwrap();
        for _ in 0..10 {
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(state.timedout(), 0);
        assert_eq!(state.live(), 1);

        // Now go quiet: only inactivity is a timeout.
        let mut buf = [0u8; 1];
        let read = client.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));
        wait_drained(&state, Duration::from_millis(10)).await;
        assert_eq!(state.timedout(), 1);
    }

    #[tokio::test]
    async fn timed_out_connection_is_destroyed_and_reported() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_shared(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let state = DrainState::new();
        let bus = Bus::new(8);
        let mut events = bus.subscribe();

        let stuck: Arc<dyn ConnectionHandler> =
            HandlerFn::new(|_stream, _ctl, _shutdown| async move {
                std::future::pending::<std::io::Result<()>>().await
            });
        tokio::spawn(serve_listener(
            listener,
            stuck,
            ctl(),
            state.clone(),
            Some(Duration::from_millis(50)),
            bus.clone(),
            CancellationToken::new(),
            CancellationToken::new(),
        ));

        let mut client = tokio::net::TcpStream::connect(local).await.unwrap();
        // The handler never touches the stream; the timeout drops it and
        // our read observes the teardown.
        let mut buf = [0u8; 1];
        let read = client.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));

        wait_drained(&state, Duration::from_millis(10)).await;
        assert_eq!(state.timedout(), 1);
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::ConnectionTimedOut);
    }

    #[tokio::test]
    async fn drain_stops_acceptance_but_finishes_in_flight_work() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_shared(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let state = DrainState::new();
        let accept_token = CancellationToken::new();

        let slow: Arc<dyn ConnectionHandler> =
            HandlerFn::new(|mut stream, _ctl, _shutdown| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                stream.write_all(b"done").await
            });
        let serve = tokio::spawn(serve_listener(
            listener,
            slow,
            ctl(),
            state.clone(),
            None,
            Bus::new(8),
            accept_token.clone(),
            CancellationToken::new(),
        ));

        let mut client = tokio::net::TcpStream::connect(local).await.unwrap();
        // Let the accept happen before draining starts.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.live(), 1);

        accept_token.cancel();
        serve.await.unwrap();

        // The in-flight connection still completes.
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"done");
        wait_drained(&state, Duration::from_millis(10)).await;

        // The listener is gone; a fresh connect cannot be served.
        assert_eq!(state.total(), 1);
    }
}
