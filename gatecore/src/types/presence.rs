use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatPresence {
    Composing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChatPresenceMedia {
    #[serde(rename = "")]
    #[default]
    Text,
    #[serde(rename = "audio")]
    Audio,
}

/// Receipt kinds as the protocol reports them. Unrecognized kinds are kept
/// verbatim in `Other` rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReceiptType {
    Delivered,
    Sender,
    Retry,
    Read,
    ReadSelf,
    Played,
    PlayedSelf,
    ServerError,
    Inactive,
    Other(String),
}

impl From<String> for ReceiptType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" | "delivered" => Self::Delivered,
            "sender" => Self::Sender,
            "retry" => Self::Retry,
            "read" => Self::Read,
            "read-self" => Self::ReadSelf,
            "played" => Self::Played,
            "played-self" => Self::PlayedSelf,
            "server-error" => Self::ServerError,
            "inactive" => Self::Inactive,
            _ => Self::Other(s),
        }
    }
}

impl From<ReceiptType> for String {
    fn from(r: ReceiptType) -> Self {
        match r {
            ReceiptType::Delivered => "delivered".into(),
            ReceiptType::Sender => "sender".into(),
            ReceiptType::Retry => "retry".into(),
            ReceiptType::Read => "read".into(),
            ReceiptType::ReadSelf => "read-self".into(),
            ReceiptType::Played => "played".into(),
            ReceiptType::PlayedSelf => "played-self".into(),
            ReceiptType::ServerError => "server-error".into(),
            ReceiptType::Inactive => "inactive".into(),
            ReceiptType::Other(s) => s,
        }
    }
}
