//! # Reconnecting Gateway Transport
//!
//! Maintains one persistent WebSocket connection to the EDDN gateway and
//! keeps it alive across drops: exponential back-off with jitter, a
//! connection-timeout watchdog on pending dials, link up/down integration,
//! and forced-close semantics. Decoded frames and lifecycle transitions are
//! surfaced through a typed [`Emitter`].
//!
//! The transport runs as a single tokio task. Callers talk to it through a
//! command channel (`send` / `reconnect` / `close`), mirroring how the rest
//! of the engine isolates socket ownership inside one select loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::core::emitter::Emitter;

/// Close code synthesised when a pending dial exceeds `connection_timeout`.
pub const TIMEOUT_CLOSE_CODE: u16 = 4008;

/// One decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Lifecycle and data events surfaced by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket reached the open state.
    Open,
    /// A data frame arrived.
    Message(Frame),
    /// The connection ended. `was_clean` is true only for the synthetic
    /// close emitted by a permanent [`Transport::close`].
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    /// A socket-level error. Details are coarse; the retry path handles
    /// recovery on its own.
    Error(String),
    /// `max_reconnect_attempts` consecutive failures; the transport idles
    /// until `reconnect()` or the link coming back up.
    MaxReconnects,
}

/// Mirror of the underlying socket state. Reports `Connecting` during
/// back-off waits and `Closed` after a permanent close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is not open")]
    NotOpen,
    #[error("transport has been closed permanently")]
    ClosedPermanently,
    #[error("invalid gateway url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Configuration for the reconnect policy. Defaults follow the gateway
/// client this transport is modelled on: first retry around a second,
/// multiplied by 1.4 per consecutive failure, capped at 30 s, with a
/// ±25% jitter band and a 4 s dial watchdog.
#[derive(Clone)]
pub struct TransportOptions {
    pub url: String,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub base_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub reconnect_decay: f64,
    pub jitter_factor: f64,
    pub connection_timeout: Duration,
    /// Link state feed. `false` blocks dialing; a rising edge cancels any
    /// pending back-off, resets the attempt counter and connects at once.
    pub link: Option<watch::Receiver<bool>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: None,
            base_reconnect_interval: Duration::from_millis(1100),
            max_reconnect_interval: Duration::from_secs(30),
            reconnect_decay: 1.4,
            jitter_factor: 0.25,
            connection_timeout: Duration::from_secs(4),
            link: None,
        }
    }
}

impl TransportOptions {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// The seam the ingestion client programs against; production code uses
/// [`ReconnectingTransport`], tests substitute a mock.
pub trait Transport: Send + Sync {
    fn events(&self) -> &Emitter<TransportEvent>;
    fn send(&self, frame: Frame) -> Result<(), TransportError>;
    fn reconnect(&self) -> Result<(), TransportError>;
    fn close(&self, code: u16, reason: &str);
    fn ready_state(&self) -> ReadyState;
    fn url(&self) -> &str;
}

enum Cmd {
    Send(Frame),
    Reconnect,
    Close { code: u16, reason: String },
}

struct SharedState {
    ready: AtomicU8,
    attempts: AtomicU32,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            ready: AtomicU8::new(ReadyState::Connecting as u8),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::Relaxed);
    }

    fn ready(&self) -> ReadyState {
        match self.ready.load(Ordering::Relaxed) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stamps a new socket generation and returns it. Events are only
    /// forwarded while their generation is still the current one, which
    /// keeps already-replaced sockets from leaking events upstream.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn owns(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Relaxed) == generation
    }
}

/// A persistent, self-healing WebSocket connection to one URL.
pub struct ReconnectingTransport {
    url: String,
    shared: Arc<SharedState>,
    events: Emitter<TransportEvent>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl ReconnectingTransport {
    /// Validates the URL and spawns the connection task. A URL syntax error
    /// is fatal: no task is started and the transport never exists.
    pub fn start(opts: TransportOptions) -> Result<Self, TransportError> {
        url::Url::parse(&opts.url)?;

        let shared = Arc::new(SharedState::new());
        let events = Emitter::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let url = opts.url.clone();
        tokio::spawn(run_loop(
            opts,
            Arc::clone(&shared),
            events.clone(),
            cmd_rx,
        ));

        Ok(Self {
            url,
            shared,
            events,
            cmd_tx,
        })
    }
}

impl Transport for ReconnectingTransport {
    fn events(&self) -> &Emitter<TransportEvent> {
        &self.events
    }

    /// Writes on the underlying socket. There is no offline buffering: a
    /// frame handed over while the socket is anything but OPEN is refused.
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::ClosedPermanently);
        }
        if self.shared.ready() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.cmd_tx
            .send(Cmd::Send(frame))
            .map_err(|_| TransportError::NotOpen)
    }

    /// Force-drops the current socket without surfacing its close, resets
    /// the attempt counter and dials again immediately.
    fn reconnect(&self) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::ClosedPermanently);
        }
        self.shared.attempts.store(0, Ordering::Relaxed);
        let _ = self.cmd_tx.send(Cmd::Reconnect);
        Ok(())
    }

    /// Permanent close. Cancels the connection task and emits one synthetic
    /// `Close { was_clean: true }`. Idempotent; every later operation fails
    /// with `ClosedPermanently`.
    fn close(&self, code: u16, reason: &str) {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.shared.set_ready(ReadyState::Closed);
        let _ = self.cmd_tx.send(Cmd::Close {
            code,
            reason: reason.to_string(),
        });
        self.events.emit(&TransportEvent::Close {
            code,
            reason: reason.to_string(),
            was_clean: true,
        });
    }

    fn ready_state(&self) -> ReadyState {
        if self.shared.is_closed() {
            ReadyState::Closed
        } else {
            self.shared.ready()
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}

enum SessionEnd {
    /// Permanent close; the synthetic close was already emitted.
    Shutdown,
    /// `reconnect()` — drop the socket silently and dial again.
    Forced,
    /// The remote or the network ended the session.
    Dropped { code: u16, reason: String },
}

/// Un-jittered retry delay: `min(max, base · decay^attempt)`.
fn unjittered_delay(opts: &TransportOptions, attempt: u32) -> Duration {
    let base = opts.base_reconnect_interval.as_secs_f64();
    let cap = opts.max_reconnect_interval.as_secs_f64();
    let delay = base * opts.reconnect_decay.powi(attempt as i32);
    Duration::from_secs_f64(delay.min(cap))
}

/// Retry delay with the jitter band applied, clamped at zero.
fn retry_delay(opts: &TransportOptions, attempt: u32) -> Duration {
    let delay = unjittered_delay(opts, attempt).as_secs_f64();
    if opts.jitter_factor > 0.0 {
        let spread = delay * opts.jitter_factor;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    } else {
        Duration::from_secs_f64(delay)
    }
}

/// Waits for the link to come back up. Pends forever without a link feed.
async fn wait_link_up(link: &mut Option<watch::Receiver<bool>>) -> bool {
    match link {
        Some(rx) => loop {
            if rx.changed().await.is_err() {
                return false;
            }
            if *rx.borrow() {
                return true;
            }
        },
        None => std::future::pending().await,
    }
}

async fn run_loop(
    opts: TransportOptions,
    shared: Arc<SharedState>,
    events: Emitter<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let mut link = opts.link.clone();

    'outer: loop {
        if shared.is_closed() {
            break;
        }

        // Refuse to dial while the link is reported down. The next rising
        // edge connects immediately with a fresh attempt counter.
        if let Some(rx) = link.as_mut() {
            while !*rx.borrow() {
                shared.set_ready(ReadyState::Connecting);
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            link = None;
                            break;
                        }
                        shared.attempts.store(0, Ordering::Relaxed);
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        None | Some(Cmd::Close { .. }) => break 'outer,
                        _ => {}
                    }
                }
            }
        }

        let generation = shared.next_generation();
        shared.set_ready(ReadyState::Connecting);
        log::debug!("Dialing {} (socket generation {})", opts.url, generation);

        let dial = tokio::time::timeout(opts.connection_timeout, connect_async(opts.url.as_str()));
        let connected = tokio::select! {
            result = dial => result,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Cmd::Close { .. }) => break 'outer,
                Some(Cmd::Reconnect) => continue 'outer,
                Some(Cmd::Send(_)) => continue 'outer, // unreachable: send() guards on Open
            },
        };

        match connected {
            Err(_) => {
                // Open timeout: detach from the pending socket and drive the
                // retry path without surfacing anything (internal close 4008).
                log::warn!(
                    "Connection attempt timed out after {:?} (close {})",
                    opts.connection_timeout,
                    TIMEOUT_CLOSE_CODE
                );
            }
            Ok(Err(e)) => {
                log::warn!("Connection to {} failed: {}", opts.url, e);
                if shared.owns(generation) && !shared.is_closed() {
                    events.emit(&TransportEvent::Error(e.to_string()));
                }
            }
            Ok(Ok((stream, _response))) => {
                log::info!("Connected to {}", opts.url);
                shared.attempts.store(0, Ordering::Relaxed);
                shared.set_ready(ReadyState::Open);
                if shared.owns(generation) && !shared.is_closed() {
                    events.emit(&TransportEvent::Open);
                }

                let (mut write, mut read) = stream.split();
                let outcome = loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            None => break SessionEnd::Shutdown,
                            Some(Cmd::Close { code, reason }) => {
                                shared.set_ready(ReadyState::Closing);
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.into(),
                                };
                                let _ = write.send(Message::Close(Some(frame))).await;
                                break SessionEnd::Shutdown;
                            }
                            Some(Cmd::Reconnect) => break SessionEnd::Forced,
                            Some(Cmd::Send(frame)) => {
                                let msg = match frame {
                                    Frame::Text(text) => Message::Text(text.into()),
                                    Frame::Binary(data) => Message::Binary(data.into()),
                                };
                                if let Err(e) = write.send(msg).await {
                                    if shared.owns(generation) && !shared.is_closed() {
                                        events.emit(&TransportEvent::Error(e.to_string()));
                                    }
                                    break SessionEnd::Dropped { code: 1006, reason: String::new() };
                                }
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if shared.owns(generation) && !shared.is_closed() {
                                    events.emit(&TransportEvent::Message(Frame::Text(text.to_string())));
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                if shared.owns(generation) && !shared.is_closed() {
                                    events.emit(&TransportEvent::Message(Frame::Binary(data.to_vec())));
                                }
                            }
                            // tungstenite answers pings on flush; nothing to forward
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = frame
                                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                                    .unwrap_or((1005, String::new()));
                                break SessionEnd::Dropped { code, reason };
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                if shared.owns(generation) && !shared.is_closed() {
                                    events.emit(&TransportEvent::Error(e.to_string()));
                                }
                                break SessionEnd::Dropped { code: 1006, reason: String::new() };
                            }
                            None => {
                                break SessionEnd::Dropped {
                                    code: 1006,
                                    reason: "stream ended".to_string(),
                                };
                            }
                        },
                    }
                };

                match outcome {
                    SessionEnd::Shutdown => break 'outer,
                    SessionEnd::Forced => continue 'outer,
                    SessionEnd::Dropped { code, reason } => {
                        log::warn!("Connection dropped: code {} {}", code, reason);
                        shared.set_ready(ReadyState::Connecting);
                        if shared.owns(generation) && !shared.is_closed() {
                            events.emit(&TransportEvent::Close {
                                code,
                                reason,
                                was_clean: false,
                            });
                        }
                    }
                }
            }
        }

        if shared.is_closed() {
            break;
        }

        // Retry path.
        let attempt = shared.attempts.load(Ordering::Relaxed);
        if let Some(max) = opts.max_reconnect_attempts {
            if attempt >= max {
                log::error!("Giving up after {} reconnect attempts", attempt);
                events.emit(&TransportEvent::MaxReconnects);
                shared.set_ready(ReadyState::Closed);
                // Idle until an explicit reconnect() or the link coming back.
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            None | Some(Cmd::Close { .. }) => break 'outer,
                            Some(Cmd::Reconnect) => continue 'outer,
                            Some(Cmd::Send(_)) => {}
                        },
                        up = wait_link_up(&mut link) => {
                            if up {
                                shared.attempts.store(0, Ordering::Relaxed);
                                continue 'outer;
                            }
                        }
                    }
                }
            }
        }

        shared.set_ready(ReadyState::Connecting);
        let delay = retry_delay(&opts, attempt);
        log::debug!("Reconnect attempt {} in {:?}", attempt + 1, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                shared.attempts.fetch_add(1, Ordering::Relaxed);
            }
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Cmd::Close { .. }) => break 'outer,
                // Attempt counter was already reset in reconnect(); fall
                // through and dial immediately.
                Some(Cmd::Reconnect) => {}
                Some(Cmd::Send(_)) => {} // unreachable: send() guards on Open
            },
            up = wait_link_up(&mut link) => {
                if up {
                    shared.attempts.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    shared.set_ready(ReadyState::Closed);
    log::debug!("Transport task for {} ended", opts.url);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, decay: f64, max_ms: u64, jitter: f64) -> TransportOptions {
        TransportOptions {
            url: "ws://example.invalid/".to_string(),
            base_reconnect_interval: Duration::from_millis(base_ms),
            max_reconnect_interval: Duration::from_millis(max_ms),
            reconnect_decay: decay,
            jitter_factor: jitter,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_schedule_is_monotone_and_capped() {
        let opts = policy(1000, 1.5, 30_000, 0.0);
        let expected_ms = [
            1000.0, 1500.0, 2250.0, 3375.0, 5062.5, 7593.75, 11390.625, 17085.9375, 25628.90625,
            30000.0, 30000.0,
        ];
        for (attempt, expected) in expected_ms.iter().enumerate() {
            let got = retry_delay(&opts, attempt as u32).as_secs_f64() * 1000.0;
            assert!(
                (got - expected).abs() < 1e-6,
                "attempt {attempt}: got {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn jitter_stays_within_the_band() {
        for jitter in [0.1, 0.25, 0.5, 1.0] {
            let opts = policy(1000, 1.4, 30_000, jitter);
            for attempt in 0..8 {
                let d = unjittered_delay(&opts, attempt).as_secs_f64();
                let lo = (d * (1.0 - jitter)).max(0.0);
                let hi = d * (1.0 + jitter);
                for _ in 0..50 {
                    let got = retry_delay(&opts, attempt).as_secs_f64();
                    assert!(
                        got >= lo - 1e-9 && got <= hi + 1e-9,
                        "jitter {jitter} attempt {attempt}: {got} outside [{lo}, {hi}]"
                    );
                }
            }
        }
    }

    #[test]
    fn generation_guard_disowns_replaced_sockets() {
        let shared = SharedState::new();
        let first = shared.next_generation();
        assert!(shared.owns(first));
        let second = shared.next_generation();
        assert!(!shared.owns(first));
        assert!(shared.owns(second));
    }

    #[tokio::test]
    async fn constructor_rejects_malformed_urls() {
        let err = ReconnectingTransport::start(TransportOptions::for_url("not a url"))
            .err()
            .expect("expected a constructor error");
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn permanent_close_is_terminal_and_clean() {
        let transport =
            ReconnectingTransport::start(TransportOptions::for_url("ws://127.0.0.1:9/"))
                .expect("valid url");

        let closes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&closes);
        transport.events().on(move |ev: &TransportEvent| {
            if let TransportEvent::Close { code, was_clean, .. } = ev {
                sink.lock().unwrap().push((*code, *was_clean));
            }
        });

        transport.close(1000, "done");
        transport.close(1000, "done again");

        assert_eq!(transport.ready_state(), ReadyState::Closed);
        assert!(matches!(
            transport.send(Frame::Text("x".into())),
            Err(TransportError::ClosedPermanently)
        ));
        assert!(matches!(
            transport.reconnect(),
            Err(TransportError::ClosedPermanently)
        ));
        // Exactly one synthetic clean close, despite the double call.
        assert_eq!(closes.lock().unwrap().as_slice(), &[(1000, true)]);
    }
}
