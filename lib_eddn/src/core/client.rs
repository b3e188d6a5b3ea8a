//! # Ingestion Client
//!
//! Turns the transport's frame stream into typed, validated, filtered
//! [`NormalizedEvent`]s and hides reconnection from consumers. Each frame is
//! decoded (binary frames are UTF-8 text), JSON-parsed, shape-checked and
//! normalized; malformed frames surface as `ParseError` events and never
//! stop the stream. An idle watchdog forces the transport to reconnect when
//! the gateway goes quiet for longer than the configured reset timeout.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::emitter::Emitter;
use crate::core::event::{has_required_shape, NormalizedEvent};
use crate::core::transport::{
    Frame, ReconnectingTransport, Transport, TransportError, TransportEvent, TransportOptions,
};
use crate::regions::region_map::RegionMap;

/// Global event filter; returning false drops the event silently.
pub type EventFilter = Arc<dyn Fn(&NormalizedEvent) -> bool + Send + Sync>;

/// Factory seam so tests can substitute a scripted transport.
pub type TransportFactory =
    Arc<dyn Fn(&ClientOptions) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Why a frame was rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Not UTF-8, or not JSON.
    Parse,
    /// A required top-level field is missing.
    Validation,
    /// No event type could be derived from the schema reference.
    UnknownSchema,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("frame is not valid JSON: {0}")]
    Parse(String),
    #[error("payload is missing a required field: {0}")]
    Validation(String),
    #[error("no event type derivable from schema ref {0:?}")]
    UnknownSchema(String),
}

impl IngestError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            IngestError::Parse(_) => ParseErrorKind::Parse,
            IngestError::Validation(_) => ParseErrorKind::Validation,
            IngestError::UnknownSchema(_) => ParseErrorKind::UnknownSchema,
        }
    }
}

#[derive(Clone)]
pub struct ClientOptions {
    /// Transport configuration, including the gateway URL.
    pub transport: TransportOptions,
    /// Idle watchdog threshold; zero disables the watchdog.
    pub reset_timeout: Duration,
    pub filter: Option<EventFilter>,
    pub transport_factory: Option<TransportFactory>,
    /// Accepted for interface parity with the gateway handshake; not
    /// otherwise interpreted.
    pub protocols: Vec<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            reset_timeout: Duration::from_secs(60),
            filter: None,
            transport_factory: None,
            protocols: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            transport: TransportOptions::for_url(url),
            ..Default::default()
        }
    }
}

/// Events surfaced to consumers. `Message` carries the shared normalized
/// event; `ParseError` carries the rejection kind and detail.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Open,
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
    Message(Arc<NormalizedEvent>),
    ParseError {
        kind: ParseErrorKind,
        detail: String,
    },
}

struct Active {
    transport: Arc<dyn Transport>,
    token: CancellationToken,
}

pub struct IngestionClient {
    opts: ClientOptions,
    region_map: Arc<RegionMap>,
    events: Emitter<ClientEvent>,
    active: Mutex<Option<Active>>,
    last_message_at: Arc<Mutex<Instant>>,
}

impl IngestionClient {
    pub fn new(opts: ClientOptions, region_map: Arc<RegionMap>) -> Self {
        Self {
            opts,
            region_map,
            events: Emitter::new(),
            active: Mutex::new(None),
            last_message_at: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn events(&self) -> &Emitter<ClientEvent> {
        &self.events
    }

    pub fn url(&self) -> &str {
        &self.opts.transport.url
    }

    /// Creates (or replaces) the transport and attaches the frame handlers.
    /// A previous transport is detached and closed first.
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut active = self.active.lock().expect("client lock poisoned");
        if let Some(prev) = active.take() {
            prev.token.cancel();
            prev.transport.close(1000, "superseded");
        }

        let transport: Arc<dyn Transport> = match &self.opts.transport_factory {
            Some(factory) => factory(&self.opts)?,
            None => Arc::new(ReconnectingTransport::start(self.opts.transport.clone())?),
        };

        let token = CancellationToken::new();
        self.attach(&transport, &token);
        if !self.opts.reset_timeout.is_zero() {
            self.spawn_watchdog(Arc::clone(&transport), token.clone());
        }

        *active = Some(Active { transport, token });
        Ok(())
    }

    /// Cancels the watchdog, detaches the transport handlers, closes the
    /// transport, and emits one synthetic clean close to consumers.
    pub fn close(&self) {
        let mut active = self.active.lock().expect("client lock poisoned");
        if let Some(prev) = active.take() {
            prev.token.cancel();
            prev.transport.close(1000, "client closed");
        }
        drop(active);
        self.events.emit(&ClientEvent::Close {
            code: 1000,
            reason: String::new(),
            was_clean: true,
        });
    }

    fn attach(&self, transport: &Arc<dyn Transport>, token: &CancellationToken) {
        let events = self.events.clone();
        let region_map = Arc::clone(&self.region_map);
        let filter = self.opts.filter.clone();
        let last_message_at = Arc::clone(&self.last_message_at);

        transport
            .events()
            .on_with_token(token.clone(), move |ev: &TransportEvent| match ev {
                TransportEvent::Open => {
                    *last_message_at.lock().expect("client lock poisoned") = Instant::now();
                    events.emit(&ClientEvent::Open);
                }
                TransportEvent::Close {
                    code,
                    reason,
                    was_clean,
                } => {
                    events.emit(&ClientEvent::Close {
                        code: *code,
                        reason: reason.clone(),
                        was_clean: *was_clean,
                    });
                }
                TransportEvent::Error(detail) => {
                    events.emit(&ClientEvent::Error(detail.clone()));
                }
                TransportEvent::MaxReconnects => {
                    events.emit(&ClientEvent::Error(
                        "reconnect attempts exhausted".to_string(),
                    ));
                }
                TransportEvent::Message(frame) => {
                    match decode_frame(frame, &region_map) {
                        Err(err) => {
                            log::debug!("Dropping frame: {err}");
                            events.emit(&ClientEvent::ParseError {
                                kind: err.kind(),
                                detail: err.to_string(),
                            });
                        }
                        Ok(event) => {
                            // The frame was well-formed; it feeds the idle
                            // watchdog even when the filter rejects it.
                            *last_message_at.lock().expect("client lock poisoned") =
                                Instant::now();
                            let event = Arc::new(event);
                            let keep = filter.as_ref().map_or(true, |f| f(&event));
                            if keep {
                                events.emit(&ClientEvent::Message(event));
                            } else {
                                log::trace!("Filter dropped {}", event.event_type());
                            }
                        }
                    }
                }
            });
    }

    fn spawn_watchdog(&self, transport: Arc<dyn Transport>, token: CancellationToken) {
        let reset = self.opts.reset_timeout;
        let last_message_at = Arc::clone(&self.last_message_at);
        tokio::spawn(async move {
            loop {
                let wake = watchdog_wake(reset);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wake) => {
                        let idle = last_message_at
                            .lock()
                            .expect("client lock poisoned")
                            .elapsed();
                        if idle > reset {
                            log::warn!("No gateway traffic for {:?}; forcing a reconnect", idle);
                            if transport.reconnect().is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Wake spread: uniform in `[reset, 2·reset]`, re-armed after every wake.
fn watchdog_wake(reset: Duration) -> Duration {
    let base = reset.as_secs_f64();
    Duration::from_secs_f64(rand::rng().random_range(base..=base * 2.0))
}

fn decode_frame(frame: &Frame, region_map: &Arc<RegionMap>) -> Result<NormalizedEvent, IngestError> {
    let text = match frame {
        Frame::Text(text) => text.clone(),
        Frame::Binary(data) => {
            String::from_utf8(data.clone()).map_err(|e| IngestError::Parse(e.to_string()))?
        }
    };

    let value: Value =
        serde_json::from_str(&text).map_err(|e| IngestError::Parse(e.to_string()))?;
    if !has_required_shape(&value) {
        return Err(IngestError::Validation(
            "$schemaRef, header and message are required".to_string(),
        ));
    }

    let event = NormalizedEvent::new(value, Arc::clone(region_map));
    if event.event_type().is_empty() {
        return Err(IngestError::UnknownSchema(event.schema_ref().to_string()));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map() -> Arc<RegionMap> {
        Arc::new(RegionMap::new())
    }

    fn valid_payload() -> String {
        json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/commodity/3",
            "header": { "uploaderID": "x" },
            "message": { "commodities": [] }
        })
        .to_string()
    }

    #[test]
    fn text_and_binary_frames_decode_identically() {
        let text = decode_frame(&Frame::Text(valid_payload()), &map()).expect("text");
        let binary =
            decode_frame(&Frame::Binary(valid_payload().into_bytes()), &map()).expect("binary");
        assert_eq!(text.event_type(), "commodity");
        assert_eq!(binary.event_type(), "commodity");
    }

    #[test]
    fn malformed_frames_map_to_their_kinds() {
        let cases: [(Frame, ParseErrorKind); 4] = [
            (Frame::Binary(vec![0xff, 0xfe]), ParseErrorKind::Parse),
            (Frame::Text("{not json".to_string()), ParseErrorKind::Parse),
            (
                Frame::Text(json!({"header": {}, "message": {}}).to_string()),
                ParseErrorKind::Validation,
            ),
            (
                Frame::Text(
                    json!({
                        "$schemaRef": "https://example.com/elsewhere",
                        "header": {},
                        "message": {}
                    })
                    .to_string(),
                ),
                ParseErrorKind::UnknownSchema,
            ),
        ];
        for (frame, expected) in cases {
            let err = decode_frame(&frame, &map()).expect_err("should reject");
            assert_eq!(err.kind(), expected);
        }
    }

    #[test]
    fn non_object_payload_is_a_validation_error() {
        let err = decode_frame(&Frame::Text("[1,2,3]".to_string()), &map()).expect_err("reject");
        assert_eq!(err.kind(), ParseErrorKind::Validation);
    }

    #[test]
    fn watchdog_wake_stays_in_latitude() {
        let reset = Duration::from_secs(60);
        for _ in 0..100 {
            let wake = watchdog_wake(reset);
            assert!(wake >= reset && wake <= reset * 2, "wake {wake:?}");
        }
    }
}
