//! OBS WebSocket v5 wire protocol (§6 "OBS WebSocket v5").
//!
//! Every frame is `{ "op": <int>, "d": <object> }`. [`ServerMessage`] mirrors
//! `dnaka91-obws::responses::ServerMessage`'s hand-rolled tagged-enum `Deserialize`, switching on
//! the numeric opcode instead of deriving `#[serde(tag = ...)]` because the tag and payload live
//! in separate JSON fields.

use bitflags::bitflags;
use serde::{de, Deserialize, Deserializer, Serialize};

bitflags! {
    /// Event subscription bitmask (§6 "Event subscription mask").
    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EventSubscription: u32 {
        /// `General` category.
        const GENERAL = 1 << 0;
        /// `Config` category.
        const CONFIG = 1 << 1;
        /// `Scenes` category.
        const SCENES = 1 << 2;
        /// `Inputs` category.
        const INPUTS = 1 << 3;
        /// `Transitions` category.
        const TRANSITIONS = 1 << 4;
        /// `Filters` category.
        const FILTERS = 1 << 5;
        /// `Outputs` category.
        const OUTPUTS = 1 << 6;
        /// `SceneItems` category.
        const SCENE_ITEMS = 1 << 7;
        /// `MediaInputs` category.
        const MEDIA_INPUTS = 1 << 8;
        /// `Vendors` category.
        const VENDORS = 1 << 9;
        /// `Ui` category.
        const UI = 1 << 10;

        /// All non-volatile categories, explicitly excluding high-volume ones (§4.2).
        const ALL_NONVOLATILE = Self::GENERAL.bits()
            | Self::CONFIG.bits()
            | Self::SCENES.bits()
            | Self::INPUTS.bits()
            | Self::TRANSITIONS.bits()
            | Self::FILTERS.bits()
            | Self::OUTPUTS.bits()
            | Self::SCENE_ITEMS.bits()
            | Self::MEDIA_INPUTS.bits()
            | Self::VENDORS.bits()
            | Self::UI.bits();
    }
}

/// `Hello` (opcode 0): the first message sent by obs-websocket on connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// obs-websocket plugin version string.
    #[serde(default)]
    pub obs_web_socket_version: String,
    /// RPC version the server would like to negotiate.
    pub rpc_version: u32,
    /// Present only when the server requires authentication.
    pub authentication: Option<Authentication>,
}

/// Authentication challenge carried in [`Hello`].
#[derive(Debug, Deserialize)]
pub struct Authentication {
    /// Random challenge string, combined with the password digest.
    pub challenge: String,
    /// Salt used when hashing the password.
    pub salt: String,
}

/// `Identify` (opcode 1): client's response to `Hello`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    /// RPC version the client supports.
    pub rpc_version: u32,
    /// Base64-encoded auth digest, if authentication was required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    /// Event categories to subscribe to.
    pub event_subscriptions: EventSubscription,
}

/// `Identified` (opcode 2): server confirms identification succeeded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    /// RPC version the server actually negotiated.
    pub negotiated_rpc_version: u32,
}

/// `Request` (opcode 6): a client-initiated RPC call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    /// Caller-chosen identifier, echoed back in the matching [`RequestResponse`].
    pub request_id: &'a str,
    /// Name of the OBS request type, e.g. `GetSceneList`.
    pub request_type: &'a str,
    /// Request payload.
    pub request_data: serde_json::Value,
}

/// `requestStatus` payload nested in a [`RequestResponse`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    /// Whether the request succeeded.
    pub result: bool,
    /// Numeric status code (see obs-websocket's `RequestStatus` enum).
    pub code: i32,
    /// Optional human-readable comment, usually present on failure.
    pub comment: Option<String>,
}

/// `RequestResponse` (opcode 7): reply to a single [`Request`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    /// Echoes the request's `requestId`.
    pub request_id: String,
    /// Name of the request type this is responding to.
    #[serde(default)]
    pub request_type: String,
    /// Success/failure status.
    pub request_status: RequestStatus,
    /// Response payload, present on success.
    #[serde(default)]
    pub response_data: serde_json::Value,
}

/// `Event` (opcode 5): an OBS-originated event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Event type name, e.g. `CurrentProgramSceneChanged`.
    pub event_type: String,
    /// Bitmask of the intent categories this event belongs to.
    #[serde(default)]
    pub event_intent: u32,
    /// Event payload.
    #[serde(default)]
    pub event_data: serde_json::Value,
}

/// A fully decoded message received from obs-websocket.
#[derive(Debug)]
pub enum ServerMessage {
    /// Opcode 0.
    Hello(Hello),
    /// Opcode 2.
    Identified(Identified),
    /// Opcode 5.
    Event(EventFrame),
    /// Opcode 7.
    RequestResponse(RequestResponse),
    /// Any opcode this crate does not act on (3 Reidentify ack, 8/9 batch). Logged and dropped
    /// per §9 "Polymorphic variants... unknown variants are logged and dropped, never crash."
    Other {
        /// The raw opcode, preserved for logging.
        op: u8,
    },
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Envelope {
            op: u8,
            d: serde_json::Value,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        Ok(match envelope.op {
            0 => ServerMessage::Hello(serde_json::from_value(envelope.d).map_err(de::Error::custom)?),
            2 => ServerMessage::Identified(serde_json::from_value(envelope.d).map_err(de::Error::custom)?),
            5 => ServerMessage::Event(serde_json::from_value(envelope.d).map_err(de::Error::custom)?),
            7 => ServerMessage::RequestResponse(serde_json::from_value(envelope.d).map_err(de::Error::custom)?),
            op => ServerMessage::Other { op },
        })
    }
}

/// Client-to-server envelope, serialized as `{ "op": ..., "d": ... }`.
pub enum ClientMessage<'a> {
    /// Opcode 1.
    Identify(Identify),
    /// Opcode 6.
    Request(Request<'a>),
}

impl Serialize for ClientMessage<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let (op, d) = match self {
            ClientMessage::Identify(value) => (1u8, serde_json::to_value(value)),
            ClientMessage::Request(value) => (6u8, serde_json::to_value(value)),
        };
        let d = d.map_err(serde::ser::Error::custom)?;

        let mut state = serializer.serialize_struct("ClientMessage", 2)?;
        state.serialize_field("op", &op)?;
        state.serialize_field("d", &d)?;
        state.end()
    }
}

/// Close codes that are unrecoverable per §4.2: unsupported protocol version, unsupported
/// feature, authentication failed. All other close codes trigger normal reconnect.
#[must_use]
pub fn is_fatal_close_code(code: u16) -> bool {
    matches!(code, 4002 | 4003 | 4008)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_nonvolatile_matches_seed_scenario_bitmask() {
        assert_eq!(EventSubscription::ALL_NONVOLATILE.bits(), 2047);
    }

    #[test]
    fn fatal_close_codes_match_spec_table() {
        for code in [4002, 4003, 4008] {
            assert!(is_fatal_close_code(code));
        }
        for code in [1000, 1001, 4000, 4009] {
            assert!(!is_fatal_close_code(code));
        }
    }

    #[test]
    fn decodes_hello_by_opcode() {
        let raw = r#"{"op":0,"d":{"obsWebSocketVersion":"5.0.0","rpcVersion":1}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ServerMessage::Hello(Hello { rpc_version: 1, .. })));
    }

    #[test]
    fn decodes_request_response_by_opcode() {
        let raw = r#"{"op":7,"d":{"requestId":"1","requestType":"GetVersion","requestStatus":{"result":true,"code":100},"responseData":{"obsVersion":"30.0.0"}}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ServerMessage::RequestResponse(resp) => {
                assert_eq!(resp.request_id, "1");
                assert!(resp.request_status.result);
                assert_eq!(resp.response_data["obsVersion"], "30.0.0");
            }
            _ => panic!("expected RequestResponse"),
        }
    }

    #[test]
    fn unknown_opcode_is_dropped_not_erroring() {
        let raw = r#"{"op":9,"d":{}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ServerMessage::Other { op: 9 }));
    }

    #[test]
    fn identify_serializes_with_op_envelope() {
        let identify = Identify {
            rpc_version: 1,
            authentication: Some("digest".to_owned()),
            event_subscriptions: EventSubscription::ALL_NONVOLATILE,
        };
        let value = serde_json::to_value(ClientMessage::Identify(identify)).unwrap();
        assert_eq!(value["op"], 1);
        assert_eq!(value["d"]["rpcVersion"], 1);
        assert_eq!(value["d"]["authentication"], "digest");
    }
}
