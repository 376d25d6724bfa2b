// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SDCP wire codec.
//
// Inbound messages are JSON objects routed by `Topic`:
//
//   sdcp/status/<id>      {"Status": {...}, "MainboardID", "TimeStamp"}
//   sdcp/attributes/<id>  {"Attributes": {...}, "MainboardID", "TimeStamp"}
//   sdcp/response/<id>    {"Data": {"Cmd", "Data": {...}, "RequestID", "MainboardID", "TimeStamp"}}
//   sdcp/error/<id>       {"Data": {"Data": {"ErrorCode"}, ...}}
//   sdcp/notice/<id>      {"Data": {"Data": {"Message"}, ...}}
//
// Both directions are pure functions. Anything the codec does not recognise
// decodes to `FrameBody::Unknown` so newer firmware never breaks a session.

use std::fmt;

use serde_json::{Value, json};
use uuid::Uuid;

use chitui_core::error::{ChituiError, Result};
use chitui_core::types::{AttributesSnapshot, RemoteFile, StatusSnapshot, TaskDetail};

use crate::command::{CMD_LIST_FILES, CMD_TASK_DETAILS, Command, KNOWN_CODES};

/// Discriminant of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Status,
    Attributes,
    FileList,
    TaskDetails,
    Error,
    Notice,
    CommandAck,
    Unknown,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed payload of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Status(StatusSnapshot),
    Attributes(AttributesSnapshot),
    FileList(Vec<RemoteFile>),
    TaskDetails(Vec<TaskDetail>),
    Error { code: i64 },
    Notice { message: String },
    /// Generic acknowledgement; `ack` is 0 on success.
    CommandAck { cmd: u16, ack: i64 },
    Unknown { raw: Value },
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub device_id: String,
    /// `RequestID` echoed by responses, errors, and notices.
    pub correlation_id: Option<String>,
    pub timestamp: Option<i64>,
    pub body: FrameBody,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match &self.body {
            FrameBody::Status(_) => FrameKind::Status,
            FrameBody::Attributes(_) => FrameKind::Attributes,
            FrameBody::FileList(_) => FrameKind::FileList,
            FrameBody::TaskDetails(_) => FrameKind::TaskDetails,
            FrameBody::Error { .. } => FrameKind::Error,
            FrameBody::Notice { .. } => FrameKind::Notice,
            FrameBody::CommandAck { .. } => FrameKind::CommandAck,
            FrameBody::Unknown { .. } => FrameKind::Unknown,
        }
    }
}

fn malformed(detail: impl Into<String>) -> ChituiError {
    ChituiError::MalformedFrame(detail.into())
}

/// Decode one WebSocket text message.
pub fn decode(raw: &str) -> Result<Frame> {
    let mut value: Value =
        serde_json::from_str(raw).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let topic = value
        .get("Topic")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing Topic"))?
        .to_string();
    let mut parts = topic.splitn(3, '/');
    let (prefix, channel, topic_device) = (parts.next(), parts.next(), parts.next());
    if prefix != Some("sdcp") {
        return unknown(value, topic_device);
    }

    match channel {
        Some("status") => {
            let device_id = device_id(&value, topic_device)?;
            let timestamp = value.get("TimeStamp").and_then(Value::as_i64);
            let payload = take_payload(&mut value, "Status")?;
            let status = serde_json::from_value(payload)
                .map_err(|e| malformed(format!("status payload: {e}")))?;
            Ok(Frame {
                device_id,
                correlation_id: None,
                timestamp,
                body: FrameBody::Status(status),
            })
        }
        Some("attributes") => {
            let device_id = device_id(&value, topic_device)?;
            let timestamp = value.get("TimeStamp").and_then(Value::as_i64);
            let payload = take_payload(&mut value, "Attributes")?;
            let attributes = serde_json::from_value(payload)
                .map_err(|e| malformed(format!("attributes payload: {e}")))?;
            Ok(Frame {
                device_id,
                correlation_id: None,
                timestamp,
                body: FrameBody::Attributes(attributes),
            })
        }
        Some(channel @ ("response" | "error" | "notice")) => {
            let mut data = take_payload(&mut value, "Data")?;
            let device_id = match data.get("MainboardID").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => device_id(&value, topic_device)?,
            };
            let correlation_id = data
                .get("RequestID")
                .and_then(Value::as_str)
                .map(str::to_string);
            let timestamp = data.get("TimeStamp").and_then(Value::as_i64);
            let cmd = data.get("Cmd").and_then(Value::as_u64);
            let inner = data.get_mut("Data").map(Value::take).unwrap_or(Value::Null);

            let body = match channel {
                "error" => FrameBody::Error {
                    code: inner
                        .get("ErrorCode")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| malformed("error frame without ErrorCode"))?,
                },
                "notice" => FrameBody::Notice {
                    message: match inner.get("Message") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => return Err(malformed("notice frame without Message")),
                    },
                },
                _ => decode_response(cmd, inner, data)?,
            };
            Ok(Frame {
                device_id,
                correlation_id,
                timestamp,
                body,
            })
        }
        _ => unknown(value, topic_device),
    }
}

fn decode_response(cmd: Option<u64>, mut inner: Value, data: Value) -> Result<FrameBody> {
    let Some(cmd) = cmd.and_then(|c| u16::try_from(c).ok()) else {
        return Ok(FrameBody::Unknown { raw: data });
    };
    let body = match cmd {
        CMD_LIST_FILES => {
            let list = inner.get_mut("FileList").map(Value::take).unwrap_or(json!([]));
            FrameBody::FileList(
                serde_json::from_value(list).map_err(|e| malformed(format!("FileList: {e}")))?,
            )
        }
        CMD_TASK_DETAILS => {
            let list = inner
                .get_mut("HistoryDetailList")
                .map(Value::take)
                .unwrap_or(json!([]));
            FrameBody::TaskDetails(
                serde_json::from_value(list)
                    .map_err(|e| malformed(format!("HistoryDetailList: {e}")))?,
            )
        }
        c if KNOWN_CODES.contains(&c) => FrameBody::CommandAck {
            cmd: c,
            ack: inner.get("Ack").and_then(Value::as_i64).unwrap_or(0),
        },
        _ => FrameBody::Unknown { raw: data },
    };
    Ok(body)
}

fn unknown(value: Value, topic_device: Option<&str>) -> Result<Frame> {
    let device_id = device_id(&value, topic_device)?;
    Ok(Frame {
        device_id,
        correlation_id: None,
        timestamp: value.get("TimeStamp").and_then(Value::as_i64),
        body: FrameBody::Unknown { raw: value },
    })
}

/// `MainboardID` at the top level, else the last topic segment.
fn device_id(value: &Value, topic_device: Option<&str>) -> Result<String> {
    value
        .get("MainboardID")
        .and_then(Value::as_str)
        .or(topic_device)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed("missing device id"))
}

fn take_payload(value: &mut Value, key: &str) -> Result<Value> {
    match value.get_mut(key).map(Value::take) {
        Some(Value::Null) | None => Err(malformed(format!("missing {key} payload"))),
        Some(payload) => Ok(payload),
    }
}

/// Everything needed to encode one request.
#[derive(Debug, Clone)]
pub struct OutboundRequest<'a> {
    /// SDCP connection id (`Id`).
    pub connection_id: &'a str,
    pub device_id: &'a str,
    pub correlation_id: &'a str,
    /// Unix seconds.
    pub timestamp: i64,
    pub command: &'a Command,
}

/// Encode a request. Identical input yields identical output.
pub fn encode(req: &OutboundRequest<'_>) -> Result<String> {
    let message = json!({
        "Id": req.connection_id,
        "Data": {
            "Cmd": req.command.code(),
            "Data": req.command.params(),
            "RequestID": req.correlation_id,
            "MainboardID": req.device_id,
            "TimeStamp": req.timestamp,
            "From": 0,
        },
        "Topic": format!("sdcp/request/{}", req.device_id),
    });
    Ok(serde_json::to_string(&message)?)
}

/// Fresh `RequestID`: 16 lowercase hex characters.
pub fn new_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chitui_core::types::{MachineStatus, PrintStatus};

    #[test]
    fn decodes_status_frame() {
        let frame = decode(
            r#"{"Status":{"CurrentStatus":[1],"PrintInfo":{"Status":3,"CurrentLayer":10,"TotalLayer":100}},
                "MainboardID":"abc","TimeStamp":1700000000,"Topic":"sdcp/status/abc"}"#,
        )
        .unwrap();
        assert_eq!(frame.device_id, "abc");
        assert_eq!(frame.timestamp, Some(1_700_000_000));
        let FrameBody::Status(status) = frame.body else {
            panic!("expected status");
        };
        assert_eq!(status.machine_status(), Some(MachineStatus::Printing));
        let info = status.print_info.unwrap();
        assert_eq!(info.status, Some(PrintStatus::Exposing));
        assert_eq!(info.current_layer, Some(10));
    }

    #[test]
    fn decodes_attributes_with_device_from_topic() {
        let frame =
            decode(r#"{"Attributes":{"RemainingMemory":1024},"Topic":"sdcp/attributes/xyz"}"#)
                .unwrap();
        assert_eq!(frame.device_id, "xyz");
        assert_eq!(frame.kind(), FrameKind::Attributes);
    }

    #[test]
    fn decodes_file_list_response() {
        let frame = decode(
            r#"{"Id":"c1","Data":{"Cmd":258,"RequestID":"r1","MainboardID":"abc","TimeStamp":1,
                "Data":{"Ack":0,"FileList":[{"name":"/local/a.ctb","type":1,"usedSize":10},{"name":"/local/sub","type":0}]}},
                "Topic":"sdcp/response/abc"}"#,
        )
        .unwrap();
        assert_eq!(frame.correlation_id.as_deref(), Some("r1"));
        let FrameBody::FileList(files) = frame.body else {
            panic!("expected file list");
        };
        assert_eq!(files.len(), 2);
        assert!(files[1].is_directory());
    }

    #[test]
    fn decodes_task_details_response() {
        let frame = decode(
            r#"{"Data":{"Cmd":321,"RequestID":"r2","MainboardID":"abc",
                "Data":{"Ack":0,"HistoryDetailList":[{"TaskId":"t1","TaskName":"benchy.ctb","Thumbnail":"http://p/t.bmp"}]}},
                "Topic":"sdcp/response/abc"}"#,
        )
        .unwrap();
        let FrameBody::TaskDetails(details) = frame.body else {
            panic!("expected task details");
        };
        assert_eq!(details[0].thumbnail.as_deref(), Some("http://p/t.bmp"));
    }

    #[test]
    fn other_known_commands_decode_to_ack() {
        let frame = decode(
            r#"{"Data":{"Cmd":129,"RequestID":"r3","MainboardID":"abc","Data":{"Ack":1}},"Topic":"sdcp/response/abc"}"#,
        )
        .unwrap();
        assert_eq!(frame.body, FrameBody::CommandAck { cmd: 129, ack: 1 });
    }

    #[test]
    fn error_and_notice_frames() {
        let err = decode(
            r#"{"Data":{"Data":{"ErrorCode":3},"MainboardID":"abc","RequestID":"r4"},"Topic":"sdcp/error/abc"}"#,
        )
        .unwrap();
        assert_eq!(err.body, FrameBody::Error { code: 3 });
        assert_eq!(err.correlation_id.as_deref(), Some("r4"));

        let notice = decode(
            r#"{"Data":{"Data":{"Message":"Resin low"},"MainboardID":"abc"},"Topic":"sdcp/notice/abc"}"#,
        )
        .unwrap();
        assert_eq!(
            notice.body,
            FrameBody::Notice {
                message: "Resin low".into()
            }
        );
    }

    #[test]
    fn unknown_command_and_topic_are_not_errors() {
        let cmd = decode(
            r#"{"Data":{"Cmd":999,"MainboardID":"abc","Data":{}},"Topic":"sdcp/response/abc"}"#,
        )
        .unwrap();
        assert_eq!(cmd.kind(), FrameKind::Unknown);

        let topic = decode(r#"{"MainboardID":"abc","Topic":"sdcp/video/abc"}"#).unwrap();
        assert_eq!(topic.kind(), FrameKind::Unknown);
        assert_eq!(topic.device_id, "abc");
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for raw in [
            "not json",
            r#"{"Status":{}}"#,
            r#"{"Status":{},"Topic":"sdcp/status/"}"#,
            r#"{"MainboardID":"abc","Topic":"sdcp/status/abc"}"#,
            r#"{"Topic":"sdcp/response/abc"}"#,
        ] {
            assert!(
                matches!(decode(raw), Err(ChituiError::MalformedFrame(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn encode_is_deterministic_and_shaped() {
        let cmd = Command::ListFiles {
            path: "/usb".into(),
        };
        let req = OutboundRequest {
            connection_id: "conn",
            device_id: "abc",
            correlation_id: "0011223344556677",
            timestamp: 1_700_000_000,
            command: &cmd,
        };
        let a = encode(&req).unwrap();
        assert_eq!(a, encode(&req).unwrap());

        let v: Value = serde_json::from_str(&a).unwrap();
        assert_eq!(v["Topic"], "sdcp/request/abc");
        assert_eq!(v["Id"], "conn");
        assert_eq!(v["Data"]["Cmd"], 258);
        assert_eq!(v["Data"]["Data"]["Url"], "/usb");
        assert_eq!(v["Data"]["From"], 0);
    }

    #[test]
    fn request_ids_are_short_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_request_id());
    }
}
