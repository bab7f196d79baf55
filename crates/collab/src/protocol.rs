//! Frames exchanged between a participant and its session controller.
//!
//! Clients send bare [`Operation`]s; the server answers with one of the
//! tagged frames below. All frames are JSON with lowercase field names.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full document state sent to a participant right after attach.
    InitialState { content: String, version: u64 },
    /// A canonical, version-stamped operation accepted by the server.
    Operation { op: Operation },
    /// Resync directive for a client whose basis version went stale.
    OutOfSync { content: String, version: u64 },
    Error { error: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_operations_decode_from_wire_format() {
        let op: Operation =
            serde_json::from_str(r#"{"type":"insert","pos":2,"text":"!","version":0}"#).unwrap();
        assert_eq!(
            op,
            Operation::Insert {
                pos: 2,
                text: "!".to_string(),
                version: 0
            }
        );

        let op: Operation =
            serde_json::from_str(r#"{"type":"delete","pos":1,"len":1,"version":4}"#).unwrap();
        assert_eq!(
            op,
            Operation::Delete {
                pos: 1,
                len: 1,
                text: String::new(),
                version: 4
            }
        );

        let op: Operation = serde_json::from_str(r#"{"type":"undo"}"#).unwrap();
        assert!(op.is_undo());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(serde_json::from_str::<Operation>(r#"{"type":"paste","pos":0}"#).is_err());
        assert!(serde_json::from_str::<Operation>("not json").is_err());
    }

    #[test]
    fn server_frames_encode_to_wire_format() {
        let frame = ServerFrame::InitialState {
            content: "Hi".to_string(),
            version: 0,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"initial_state","content":"Hi","version":0})
        );

        let frame = ServerFrame::Operation {
            op: Operation::Insert {
                pos: 2,
                text: "!".to_string(),
                version: 1,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"operation","op":{"type":"insert","pos":2,"text":"!","version":1}})
        );

        let frame = ServerFrame::OutOfSync {
            content: "Hi!".to_string(),
            version: 1,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"out_of_sync","content":"Hi!","version":1})
        );

        let frame = ServerFrame::error("nothing to undo");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"error","error":"nothing to undo"})
        );
    }

    #[test]
    fn delete_broadcast_carries_captured_text() {
        let frame = ServerFrame::Operation {
            op: Operation::Delete {
                pos: 1,
                len: 1,
                text: "b".to_string(),
                version: 1,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type":"operation","op":{"type":"delete","pos":1,"len":1,"text":"b","version":1}})
        );
    }
}
