//! Tagged decode of raw transport frames.
//!
//! Every frame is converted into one of a closed set of variants at the
//! transport boundary before anything else sees it. Message shape
//! discriminates the type: objects with an `event` field are control
//! messages, arrays beginning with a channel id are market-data frames
//! (with the reserved `[chan_id, "hb"]` heartbeat form), and objects with a
//! correlation `token` field are responses to queued account operations.

use serde_json::Value;

use crate::error::{MarlinError, Result};

/// Heartbeat marker in the reserved two-element array form.
const HEARTBEAT_MARKER: &str = "hb";

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// A channel subscription was confirmed.
    Subscribed { chan_id: u64, channel: String },
    /// Server info/version banner.
    Info { payload: Value },
    /// The account-channel handshake succeeded.
    AuthOk { chan_id: u64 },
    /// The account-channel handshake failed.
    AuthError { message: String },
    /// A control message this client does not care about.
    UnknownControl { event: String },
    /// Keep-alive marker, to be ignored.
    Heartbeat { chan_id: u64 },
    /// Market-data or account-channel frame; `payload` is everything after
    /// the channel id.
    ChannelData { chan_id: u64, payload: Vec<Value> },
    /// Response to a queued account operation, correlated by token.
    Reply { token: String, data: Value },
}

impl WireFrame {
    /// Decode one raw frame.
    pub fn parse(raw: &str) -> Result<WireFrame> {
        let value: Value = serde_json::from_str(raw)?;
        match value {
            Value::Object(obj) => Self::parse_object(obj),
            Value::Array(arr) => Self::parse_array(arr),
            other => Err(MarlinError::MalformedFrame(format!(
                "expected object or array, got {other}"
            ))),
        }
    }

    fn parse_object(obj: serde_json::Map<String, Value>) -> Result<WireFrame> {
        if let Some(event) = obj.get("event").and_then(Value::as_str) {
            return Ok(match event {
                "subscribed" => {
                    let chan_id = require_u64(&obj, "chanId")?;
                    let channel = obj
                        .get("channel")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    WireFrame::Subscribed { chan_id, channel }
                }
                "info" => WireFrame::Info {
                    payload: Value::Object(obj),
                },
                "auth" => {
                    let ok = obj.get("status").and_then(Value::as_str) == Some("OK");
                    if ok {
                        WireFrame::AuthOk {
                            chan_id: require_u64(&obj, "chanId")?,
                        }
                    } else {
                        WireFrame::AuthError {
                            message: obj
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("auth refused")
                                .to_string(),
                        }
                    }
                }
                other => WireFrame::UnknownControl {
                    event: other.to_string(),
                },
            });
        }
        if let Some(token) = obj.get("token").and_then(Value::as_str) {
            let token = token.to_string();
            let data = obj.get("data").cloned().unwrap_or(Value::Null);
            return Ok(WireFrame::Reply { token, data });
        }
        Err(MarlinError::MalformedFrame(
            "object frame without event or token field".to_string(),
        ))
    }

    fn parse_array(arr: Vec<Value>) -> Result<WireFrame> {
        let chan_id = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| MarlinError::MalformedFrame("array frame without channel id".into()))?;
        if arr.len() == 2 && arr[1].as_str() == Some(HEARTBEAT_MARKER) {
            return Ok(WireFrame::Heartbeat { chan_id });
        }
        Ok(WireFrame::ChannelData {
            chan_id,
            payload: arr.into_iter().skip(1).collect(),
        })
    }
}

fn require_u64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<u64> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| MarlinError::MalformedFrame(format!("missing numeric field {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribed_control() {
        let frame =
            WireFrame::parse(r#"{"event":"subscribed","channel":"book","chanId":42,"pair":"BTCUSD"}"#)
                .unwrap();
        assert_eq!(
            frame,
            WireFrame::Subscribed {
                chan_id: 42,
                channel: "book".to_string()
            }
        );
    }

    #[test]
    fn parses_heartbeat() {
        let frame = WireFrame::parse(r#"[7,"hb"]"#).unwrap();
        assert_eq!(frame, WireFrame::Heartbeat { chan_id: 7 });
    }

    #[test]
    fn parses_channel_data() {
        let frame = WireFrame::parse(r#"[6,"312653-BTCUSD",1448398210,319.97,0.40357]"#).unwrap();
        match frame {
            WireFrame::ChannelData { chan_id, payload } => {
                assert_eq!(chan_id, 6);
                assert_eq!(payload.len(), 4);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_auth_results() {
        let ok = WireFrame::parse(r#"{"event":"auth","status":"OK","chanId":0}"#).unwrap();
        assert_eq!(ok, WireFrame::AuthOk { chan_id: 0 });

        let err =
            WireFrame::parse(r#"{"event":"auth","status":"FAILED","message":"bad key"}"#).unwrap();
        assert_eq!(
            err,
            WireFrame::AuthError {
                message: "bad key".to_string()
            }
        );
    }

    #[test]
    fn parses_reply_with_token() {
        let frame = WireFrame::parse(r#"{"token":"balances","data":[]}"#).unwrap();
        match frame {
            WireFrame::Reply { token, data } => {
                assert_eq!(token, "balances");
                assert!(data.as_array().unwrap().is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_control_is_not_an_error() {
        let frame = WireFrame::parse(r#"{"event":"pong"}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::UnknownControl {
                event: "pong".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(WireFrame::parse("not json").is_err());
        assert!(WireFrame::parse("3.5").is_err());
        assert!(WireFrame::parse(r#"{"foo":1}"#).is_err());
        assert!(WireFrame::parse(r#"["not-a-chan-id"]"#).is_err());
    }
}
