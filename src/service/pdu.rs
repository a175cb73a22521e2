// =============================================================================
// Nucleon Matrix Federation Server - Pdu Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-14
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Persistent data unit model for the federation ingress path. Incoming
//   raw event JSON is converted to strict canonical form, assigned its
//   reference-hash event ID under the room's protocol version, and parsed
//   into a typed event for routing and submission to the roomserver.
//
// =============================================================================

use base64::{engine::general_purpose, Engine as _};
use ruma::{
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomVersionId, UInt,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Content hashes of a PDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash.
    pub sha256: String,
}

/// A persistent data unit as it arrives over federation. Only the fields
/// the ingress path routes on are typed; the event content stays opaque.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: UInt,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub prev_events: Vec<OwnedEventId>,
    #[serde(default)]
    pub depth: UInt,
    #[serde(default)]
    pub auth_events: Vec<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<EventHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Box<RawJsonValue>>,
}

/// An event tagged with the protocol version of its room, ready for
/// submission to the roomserver.
#[derive(Clone, Debug)]
pub struct HeaderedPdu {
    pub room_version: RoomVersionId,
    pub pdu: PduEvent,
    /// Canonical event JSON including the derived `event_id`.
    pub json: Box<RawJsonValue>,
}

/// Convert raw event JSON into strict canonical form.
///
/// Room version 6 requires homeservers to enforce canonical JSON on PDUs,
/// and a violation here rejects the entire transaction. The check is
/// applied to every room version.
pub fn to_canonical_object(raw: &RawJsonValue) -> Result<CanonicalJsonObject> {
    let value: serde_json::Value = serde_json::from_str(raw.get())
        .map_err(|e| Error::BadJson(format!("PDU is not valid JSON: {e}")))?;
    let canonical = CanonicalJsonValue::try_from(value)
        .map_err(|e| Error::BadJson(format!("PDU contains bad JSON: {e}")))?;
    match canonical {
        CanonicalJsonValue::Object(object) => Ok(object),
        _ => Err(Error::BadJson("PDU is not a JSON object".to_owned())),
    }
}

/// Derive the event ID for a canonical event under the given room version.
///
/// Room versions 1 and 2 carry the event ID inside the event; later
/// versions derive it from the SHA-256 reference hash of the canonical
/// form without `signatures`, `unsigned` and `event_id`. Version 3 encodes
/// the hash with standard base64, everything newer with the URL-safe
/// alphabet, both unpadded.
pub fn gen_event_id(
    object: &CanonicalJsonObject,
    room_version: &RoomVersionId,
) -> Result<OwnedEventId> {
    match room_version {
        RoomVersionId::V1 | RoomVersionId::V2 => match object.get("event_id") {
            Some(CanonicalJsonValue::String(id)) => EventId::parse(id.as_str())
                .map_err(|e| Error::BadJson(format!("PDU has an invalid event_id: {e}"))),
            _ => Err(Error::BadJson("PDU is missing its event_id".to_owned())),
        },
        room_version => {
            let mut reference = object.clone();
            for field in ["signatures", "unsigned", "event_id"] {
                reference.remove(field);
            }
            let canonical = serde_json::to_string(&reference)
                .map_err(|e| Error::BadJson(format!("PDU cannot be canonicalized: {e}")))?;
            let hash = Sha256::digest(canonical.as_bytes());
            let encoded = if *room_version == RoomVersionId::V3 {
                general_purpose::STANDARD_NO_PAD.encode(hash)
            } else {
                general_purpose::URL_SAFE_NO_PAD.encode(hash)
            };
            EventId::parse(format!("${encoded}"))
                .map_err(|e| Error::BadJson(format!("derived event_id is invalid: {e}")))
        }
    }
}

/// Parse a canonical event under its room version into a version-tagged
/// PDU. Structural failures here are per-event and skip only this PDU.
pub fn parse_incoming_pdu(
    object: &CanonicalJsonObject,
    room_version: RoomVersionId,
) -> Result<HeaderedPdu> {
    let event_id = gen_event_id(object, &room_version)?;

    let mut with_id = object.clone();
    with_id.insert(
        "event_id".to_owned(),
        CanonicalJsonValue::String(event_id.as_str().to_owned()),
    );
    let json = serde_json::to_string(&with_id)
        .map_err(|e| Error::BadJson(format!("PDU cannot be serialized: {e}")))?;

    let pdu: PduEvent = serde_json::from_str(&json)
        .map_err(|e| Error::BadJson(format!("Failed to parse event JSON: {e}")))?;
    let json = RawJsonValue::from_string(json)
        .map_err(|e| Error::BadJson(format!("PDU cannot be serialized: {e}")))?;

    Ok(HeaderedPdu {
        room_version,
        pdu,
        json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> Box<RawJsonValue> {
        RawJsonValue::from_string(value.to_string()).expect("raw json")
    }

    fn sample_event() -> serde_json::Value {
        json!({
            "room_id": "!meeting:remote.example",
            "sender": "@alice:remote.example",
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000u64,
            "content": { "body": "hi", "msgtype": "m.text" },
            "depth": 12,
            "prev_events": ["$previous"],
            "auth_events": ["$create", "$member"],
            "hashes": { "sha256": "abc123" },
            "signatures": { "remote.example": { "ed25519:a_key": "sigsigsig" } },
        })
    }

    #[test]
    fn test_parse_incoming_pdu_assigns_reference_hash_id() {
        let object = to_canonical_object(&raw(sample_event())).expect("canonical");
        let headered =
            parse_incoming_pdu(&object, RoomVersionId::V10).expect("event should parse");

        assert!(headered.pdu.event_id.as_str().starts_with('$'));
        assert_eq!(headered.pdu.room_id.as_str(), "!meeting:remote.example");
        assert_eq!(headered.pdu.kind, "m.room.message");
        assert_eq!(headered.room_version, RoomVersionId::V10);

        // The submitted JSON must carry the derived event ID.
        let submitted: serde_json::Value =
            serde_json::from_str(headered.json.get()).expect("valid json");
        assert_eq!(
            submitted["event_id"].as_str(),
            Some(headered.pdu.event_id.as_str())
        );
    }

    #[test]
    fn test_event_id_is_deterministic_and_signature_independent() {
        let object = to_canonical_object(&raw(sample_event())).expect("canonical");
        let a = gen_event_id(&object, &RoomVersionId::V10).expect("id");
        let b = gen_event_id(&object, &RoomVersionId::V10).expect("id");
        assert_eq!(a, b, "same canonical event must hash to the same ID");

        let mut resigned = sample_event();
        resigned["signatures"] = json!({ "remote.example": { "ed25519:other": "different" } });
        let resigned = to_canonical_object(&raw(resigned)).expect("canonical");
        let c = gen_event_id(&resigned, &RoomVersionId::V10).expect("id");
        assert_eq!(a, c, "signatures are stripped before hashing");
    }

    #[test]
    fn test_room_version_one_uses_embedded_event_id() {
        let mut event = sample_event();
        event["event_id"] = json!("$legacy:remote.example");
        let object = to_canonical_object(&raw(event)).expect("canonical");
        let id = gen_event_id(&object, &RoomVersionId::V1).expect("id");
        assert_eq!(id.as_str(), "$legacy:remote.example");
    }

    #[test]
    fn test_float_values_violate_canonical_json() {
        let mut event = sample_event();
        event["content"] = json!({ "body": "hi", "weight": 1.5 });
        let result = to_canonical_object(&raw(event));
        match result {
            Err(Error::BadJson(_)) => {}
            other => panic!("floats must fail canonicalization, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_sender_fails_structural_parse_only() {
        let mut event = sample_event();
        event.as_object_mut().expect("object").remove("sender");
        let object = to_canonical_object(&raw(event)).expect("still canonical json");
        assert!(
            parse_incoming_pdu(&object, RoomVersionId::V10).is_err(),
            "sender is a required field"
        );
    }

    #[test]
    fn test_non_object_pdu_is_bad_json() {
        assert!(to_canonical_object(&raw(json!(["not", "an", "event"]))).is_err());
    }
}
