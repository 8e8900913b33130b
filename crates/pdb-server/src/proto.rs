//! Line-delimited JSON records exchanged before and beside the BSON data
//! streams, plus the parent→child control messages.

use pdb_types::Version;
use serde::{Deserialize, Serialize};

/// Head-lookup requests are single lines capped at this size.
pub const MAX_HEAD_LOOKUP_LINE: usize = 512;

/// First record on a fresh connection; the supervisor verifies it against
/// the passdb before handing the connection to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub db: String,
}

/// `start` of a data request: send nothing, send everything, or send from a
/// version (exclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartFrom {
    Offset(Version),
    Send(bool),
}

/// Both peers exchange one of these before items flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub start: StartFrom,
}

impl DataRequest {
    pub fn wants_data(&self) -> bool {
        !matches!(self.start, StartFrom::Send(false))
    }
}

/// Parent→child control messages. Exhaustively matched by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMsg {
    Init,
    Listen,
    HeadLookup,
    LocalDataChannel,
    #[serde(rename_all = "camelCase")]
    RemoteDataChannel {
        perspective: String,
        #[serde(default)]
        receive_before_send: bool,
    },
    AutoMerge,
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_request_accepts_bool_and_version() {
        let yes: DataRequest = serde_json::from_str(r#"{"start": true}"#).unwrap();
        assert_eq!(yes.start, StartFrom::Send(true));
        assert!(yes.wants_data());

        let no: DataRequest = serde_json::from_str(r#"{"start": false}"#).unwrap();
        assert!(!no.wants_data());

        let from: DataRequest = serde_json::from_str(r#"{"start": "Aaaa"}"#).unwrap();
        assert_eq!(from.start, StartFrom::Offset("Aaaa".parse().unwrap()));
        assert!(from.wants_data());
    }

    #[test]
    fn data_request_round_trips() {
        let req = DataRequest {
            start: StartFrom::Offset("Aaaa".parse().unwrap()),
        };
        let line = serde_json::to_string(&req).unwrap();
        assert_eq!(line, r#"{"start":"Aaaa"}"#);
        assert_eq!(serde_json::from_str::<DataRequest>(&line).unwrap(), req);
    }

    #[test]
    fn control_messages_are_tagged() {
        let msg: ControlMsg = serde_json::from_str(
            r#"{"type": "remoteDataChannel", "perspective": "someClient", "receiveBeforeSend": true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMsg::RemoteDataChannel {
                perspective: "someClient".into(),
                receive_before_send: true,
            }
        );

        let kill: ControlMsg = serde_json::from_str(r#"{"type": "kill"}"#).unwrap();
        assert_eq!(kill, ControlMsg::Kill);

        assert!(serde_json::from_str::<ControlMsg>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn auth_request_parses() {
        let auth: AuthRequest = serde_json::from_str(
            r#"{"username": "joe", "password": "secret", "db": "inventory"}"#,
        )
        .unwrap();
        assert_eq!(auth.username, "joe");
        assert_eq!(auth.db, "inventory");
    }
}
