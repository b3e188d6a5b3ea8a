//! # Normalized Telemetry Event
//!
//! An immutable view over one raw gateway payload. The payload itself stays
//! an opaque `serde_json::Value` tree; everything a display module needs is
//! exposed through narrow accessors whose derivations are computed on first
//! access and memoized. One event is shared by `Arc` across every subscriber,
//! so the payload is never cloned on the fan-out path.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::regions::region_map::{RegionHit, RegionMap};

/// Which game flavour produced a message, derived from the gameversion
/// header and the horizons/odyssey flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameType {
    Odyssey,
    Horizons,
    Base,
    Legacy,
    Unknown,
}

impl GameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::Odyssey => "Odyssey",
            GameType::Horizons => "Horizons",
            GameType::Base => "Base",
            GameType::Legacy => "Legacy",
            GameType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when the payload carries the three required top-level keys.
pub fn has_required_shape(value: &Value) -> bool {
    value.is_object()
        && value.get("$schemaRef").is_some()
        && value.get("header").is_some()
        && value.get("message").is_some()
}

fn schema_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/schemas/([^/]+)/(\d+)(/test)?$").expect("schema regex"))
}

/// JavaScript-style truthiness over a JSON value, used for the odyssey /
/// taxi / multicrew flags which upstream software sends in several shapes.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        _ => false,
    }
}

fn derive_game_type(header: &Value, message: &Value) -> GameType {
    if let Some(gv) = header.get("gameversion").and_then(Value::as_str) {
        if gv.starts_with("CAPI-Legacy-") {
            return GameType::Legacy;
        }
        // Leading integer of the version string; "3.8.0.404" gates to Legacy,
        // "4.0" and non-numeric versions fall through to the flags.
        let major: String = gv.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = major.parse::<u32>() {
            if n < 4 {
                return GameType::Legacy;
            }
        }
    }

    if truthy(message.get("odyssey")) {
        return GameType::Odyssey;
    }
    match message.get("horizons") {
        Some(Value::Bool(true)) => GameType::Horizons,
        Some(Value::Bool(false)) => GameType::Base,
        _ => GameType::Unknown,
    }
}

/// Gateway timestamp minus sender timestamp, in milliseconds. `None` when
/// either timestamp is missing or unparsable.
fn compute_age(header: &Value, message: &Value) -> Option<i64> {
    let gateway = header.get("gatewayTimestamp").and_then(Value::as_str)?;
    let sender = message.get("timestamp").and_then(Value::as_str)?;
    let gateway = DateTime::parse_from_rfc3339(gateway).ok()?;
    let sender = DateTime::parse_from_rfc3339(sender).ok()?;
    Some(gateway.signed_duration_since(sender).num_milliseconds())
}

fn route_head(message: &Value) -> Option<&Value> {
    message.get("Route").and_then(|route| route.get(0))
}

fn compute_star_pos(message: &Value) -> Option<[f64; 3]> {
    let pos = message
        .get("StarPos")
        .or_else(|| route_head(message).and_then(|entry| entry.get("StarPos")))?;
    let arr = pos.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some([arr[0].as_f64()?, arr[1].as_f64()?, arr[2].as_f64()?])
}

/// A lazy, memoized view over one raw payload.
pub struct NormalizedEvent {
    raw: Value,
    received_at: DateTime<Utc>,
    region_map: Arc<RegionMap>,

    event_type: OnceLock<String>,
    game_type: OnceLock<GameType>,
    age: OnceLock<Option<i64>>,
    star_system: OnceLock<String>,
    star_pos: OnceLock<Option<[f64; 3]>>,
    region: OnceLock<RegionHit>,
    is_taxi: OnceLock<bool>,
    is_multicrew: OnceLock<bool>,
}

impl NormalizedEvent {
    /// Wraps a raw payload. Shape validation is the caller's business
    /// (see `IngestionClient`); the accessors are total either way.
    pub fn new(raw: Value, region_map: Arc<RegionMap>) -> Self {
        Self {
            raw,
            received_at: Utc::now(),
            region_map,
            event_type: OnceLock::new(),
            game_type: OnceLock::new(),
            age: OnceLock::new(),
            star_system: OnceLock::new(),
            star_pos: OnceLock::new(),
            region: OnceLock::new(),
            is_taxi: OnceLock::new(),
            is_multicrew: OnceLock::new(),
        }
    }

    /// The original payload, untouched.
    pub fn data(&self) -> &Value {
        &self.raw
    }

    pub fn schema_ref(&self) -> &str {
        self.raw.get("$schemaRef").and_then(Value::as_str).unwrap_or("")
    }

    pub fn header(&self) -> &Value {
        self.raw.get("header").unwrap_or(&Value::Null)
    }

    pub fn message(&self) -> &Value {
        self.raw.get("message").unwrap_or(&Value::Null)
    }

    /// Local clock at ingestion.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Lowercased event tag derived from the schema reference; journal
    /// schemas gain a `journal:<event>` sub-tag. Empty when the schema
    /// reference does not match the expected shape.
    pub fn event_type(&self) -> &str {
        self.event_type.get_or_init(|| {
            let Some(caps) = schema_regex().captures(self.schema_ref()) else {
                return String::new();
            };
            let tag = caps[1].to_lowercase();
            if tag == "journal" {
                if let Some(event) = self.message().get("event").and_then(Value::as_str) {
                    return format!("journal:{}", event.to_lowercase());
                }
            }
            tag
        })
    }

    /// The journal event name in its original spelling, falling back to the
    /// derived event type for non-journal schemas.
    pub fn event_name(&self) -> String {
        self.message()
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.event_type().to_string())
    }

    pub fn game_type(&self) -> GameType {
        *self
            .game_type
            .get_or_init(|| derive_game_type(self.header(), self.message()))
    }

    /// Gateway latency of the message in milliseconds; `None` when a
    /// timestamp is missing. Consumers pick their own old/new thresholds.
    pub fn age(&self) -> Option<i64> {
        *self
            .age
            .get_or_init(|| compute_age(self.header(), self.message()))
    }

    pub fn is_taxi(&self) -> bool {
        *self.is_taxi.get_or_init(|| truthy(self.message().get("Taxi")))
    }

    pub fn is_multicrew(&self) -> bool {
        *self
            .is_multicrew
            .get_or_init(|| truthy(self.message().get("Multicrew")))
    }

    /// First non-empty of the known star-system spellings, else empty.
    pub fn star_system(&self) -> &str {
        self.star_system.get_or_init(|| {
            for key in ["StarSystem", "systemName", "SystemName", "System"] {
                if let Some(s) = self.message().get(key).and_then(Value::as_str) {
                    if !s.is_empty() {
                        return s.to_string();
                    }
                }
            }
            if let Some(s) = route_head(self.message())
                .and_then(|entry| entry.get("StarSystem"))
                .and_then(Value::as_str)
            {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
            String::new()
        })
    }

    pub fn star_pos(&self) -> Option<[f64; 3]> {
        *self
            .star_pos
            .get_or_init(|| compute_star_pos(self.message()))
    }

    /// Galactic region of the star position, if one is present.
    pub fn region(&self) -> RegionHit {
        *self.region.get_or_init(|| match self.star_pos() {
            Some([x, y, z]) => self.region_map.find(x, y, z),
            None => RegionHit::default(),
        })
    }
}

impl fmt::Debug for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedEvent")
            .field("event_type", &self.event_type())
            .field("schema_ref", &self.schema_ref())
            .field("received_at", &self.received_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::region_map::MAP_SIZE;
    use serde_json::json;

    fn event(raw: Value) -> NormalizedEvent {
        NormalizedEvent::new(raw, Arc::new(RegionMap::new()))
    }

    /// Map with a single populated row putting Sol's cell (1012, 488) in
    /// region 18 "Inner Orion Spur".
    fn sol_map() -> Arc<RegionMap> {
        let mut row_index = vec![0u32; MAP_SIZE + 1];
        for entry in row_index.iter_mut().skip(489) {
            *entry = 4;
        }
        let rle_data = vec![1012, 0, 1, 18];
        Arc::new(RegionMap::from_parts(row_index, rle_data).expect("sol map"))
    }

    #[test]
    fn commodity_schema_derivation() {
        let e = event(json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/commodity/3",
            "header": { "uploaderID": "x", "softwareName": "s", "softwareVersion": "1" },
            "message": { "commodities": [] }
        }));
        assert_eq!(e.event_type(), "commodity");
        assert_eq!(e.event_name(), "commodity");
        assert_eq!(e.game_type(), GameType::Unknown);
        assert_eq!(e.star_system(), "");
        assert_eq!(e.region(), RegionHit::default());
        assert_eq!(e.age(), None);
    }

    #[test]
    fn journal_sub_tag_and_derived_attributes() {
        let raw = json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
            "header": {
                "gatewayTimestamp": "2024-01-01T00:00:01Z",
                "gameversion": "4.0"
            },
            "message": {
                "event": "FSDJump",
                "StarSystem": "Sol",
                "StarPos": [0, 0, 0],
                "horizons": true,
                "timestamp": "2024-01-01T00:00:00Z"
            }
        });
        let e = NormalizedEvent::new(raw, sol_map());
        assert_eq!(e.event_type(), "journal:fsdjump");
        assert_eq!(e.event_name(), "FSDJump");
        assert_eq!(e.game_type(), GameType::Horizons);
        assert_eq!(e.age(), Some(1000));
        assert_eq!(e.star_system(), "Sol");
        assert_eq!(e.region().name, Some("Inner Orion Spur"));
    }

    #[test]
    fn accessors_are_total_without_header_or_message() {
        let e = event(json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/commodity/3"
        }));
        assert_eq!(*e.header(), Value::Null);
        assert_eq!(*e.message(), Value::Null);
        assert_eq!(e.event_type(), "commodity");
        assert_eq!(e.game_type(), GameType::Unknown);
        assert_eq!(e.star_system(), "");
    }

    #[test]
    fn journal_without_event_keeps_bare_tag() {
        let e = event(json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
            "header": {},
            "message": {}
        }));
        assert_eq!(e.event_type(), "journal");
    }

    #[test]
    fn test_schemas_still_derive() {
        let e = event(json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/navroute/1/test",
            "header": {},
            "message": {}
        }));
        assert_eq!(e.event_type(), "navroute");
    }

    #[test]
    fn unmatched_schema_ref_yields_empty_tag() {
        let e = event(json!({
            "$schemaRef": "https://example.com/not-a-schema",
            "header": {},
            "message": {}
        }));
        assert_eq!(e.event_type(), "");
    }

    #[test]
    fn legacy_version_gates_before_flags() {
        for gv in ["3.8.0.404", "CAPI-Legacy-commodity"] {
            let e = event(json!({
                "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
                "header": { "gameversion": gv },
                "message": { "event": "Docked", "horizons": true, "odyssey": true }
            }));
            assert_eq!(e.game_type(), GameType::Legacy, "gameversion {gv}");
        }
    }

    #[test]
    fn flag_precedence_odyssey_horizons_base() {
        let base = |message: Value| {
            event(json!({
                "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
                "header": { "gameversion": "4.0.0.100" },
                "message": message
            }))
        };
        assert_eq!(base(json!({"odyssey": true, "horizons": true})).game_type(), GameType::Odyssey);
        assert_eq!(base(json!({"horizons": true})).game_type(), GameType::Horizons);
        assert_eq!(base(json!({"horizons": false})).game_type(), GameType::Base);
        assert_eq!(base(json!({})).game_type(), GameType::Unknown);
        // horizons must be a strict boolean, unlike odyssey
        assert_eq!(base(json!({"horizons": 1})).game_type(), GameType::Unknown);
        assert_eq!(base(json!({"odyssey": 1})).game_type(), GameType::Odyssey);
    }

    #[test]
    fn star_system_fallback_chain() {
        let shapes = [
            (json!({"StarSystem": "Sol"}), "Sol"),
            (json!({"systemName": "Achenar"}), "Achenar"),
            (json!({"SystemName": "Alioth"}), "Alioth"),
            (json!({"System": "Lave"}), "Lave"),
            (json!({"Route": [{"StarSystem": "Diso"}]}), "Diso"),
            (json!({"StarSystem": "", "System": "Leesti"}), "Leesti"),
            (json!({}), ""),
        ];
        for (message, expected) in shapes {
            let e = event(json!({
                "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
                "header": {},
                "message": message
            }));
            assert_eq!(e.star_system(), expected);
        }
    }

    #[test]
    fn derivations_are_memoized() {
        let map = Arc::new(RegionMap::new());
        let e = NormalizedEvent::new(
            json!({
                "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
                "header": {},
                "message": { "event": "FSDJump", "StarPos": [0, 0, 0] }
            }),
            Arc::clone(&map),
        );

        // First access resolves against the unloaded map.
        assert_eq!(e.region(), RegionHit::default());

        // Loading afterwards must not change the answer: the derivation is
        // computed once and memoized.
        let mut row_index = vec![0u32; MAP_SIZE + 1];
        for entry in row_index.iter_mut().skip(489) {
            *entry = 4;
        }
        map.load_bytes(
            &{
                let mut bytes = Vec::new();
                for w in &row_index {
                    bytes.extend_from_slice(&w.to_le_bytes());
                }
                for w in [1012u16, 0, 1, 18] {
                    bytes.extend_from_slice(&w.to_le_bytes());
                }
                bytes
            },
            crate::regions::region_map::Endian::Little,
        )
        .expect("load");
        assert!(map.is_ready());
        assert_eq!(e.region(), RegionHit::default());

        // And the pointer identity of string derivations is stable.
        let first = e.event_type() as *const str;
        let second = e.event_type() as *const str;
        assert_eq!(first, second);
    }

    #[test]
    fn taxi_and_multicrew_flags() {
        let e = event(json!({
            "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
            "header": {},
            "message": { "event": "Docked", "Taxi": true, "Multicrew": false }
        }));
        assert!(e.is_taxi());
        assert!(!e.is_multicrew());
    }
}
