use crate::types::presence::{ChatPresence, ChatPresenceMedia, ReceiptType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Callback the protocol client invokes for every event it produces.
///
/// Called on the client's shared delivery path, so implementations must
/// return quickly and must not block.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Connected(Connected),
    Disconnected(Disconnected),
    LoggedOut(LoggedOut),
    /// A batch of pairing codes. Only the first one needs surfacing.
    Qr(QrCodes),
    PairSuccess(PairSuccess),
    PairError(PairError),
    Message(MessageReceived),
    Receipt(Receipt),
    Presence(PresenceUpdate),
    ChatPresence(ChatPresenceUpdate),
    HistorySync(HistorySyncSummary),
    /// Anything the gateway does not model. Logged and dropped.
    Unknown(UnknownEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected(_) => "connected",
            Event::Disconnected(_) => "disconnected",
            Event::LoggedOut(_) => "logged_out",
            Event::Qr(_) => "qr",
            Event::PairSuccess(_) => "pair_success",
            Event::PairError(_) => "pair_error",
            Event::Message(_) => "message",
            Event::Receipt(_) => "receipt",
            Event::Presence(_) => "presence",
            Event::ChatPresence(_) => "chat_presence",
            Event::HistorySync(_) => "history_sync",
            Event::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnected;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOut {
    pub on_connect: bool,
    pub reason: ConnectFailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCodes {
    pub codes: Vec<String>,
    /// Validity of the first code.
    #[serde(default, with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSuccess {
    pub id: String,
    pub lid: Option<String>,
    pub business_name: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairError {
    pub id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub id: String,
    pub chat: String,
    pub sender: String,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_ids: Vec<String>,
    pub chat: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub receipt_type: ReceiptType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub from: String,
    pub unavailable: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPresenceUpdate {
    pub chat: String,
    pub sender: String,
    pub state: ChatPresence,
    pub media: ChatPresenceMedia,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySyncSummary {
    pub sync_type: String,
    pub conversations: usize,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownEvent {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ConnectFailureReason {
    Generic,
    LoggedOut,
    TempBanned,
    MainDeviceGone,
    UnknownLogout,
    ClientOutdated,
    BadUserAgent,
    CatExpired,
    CatInvalid,
    NotFound,
    ClientUnknown,
    InternalServerError,
    Experimental,
    ServiceUnavailable,
    Unknown(i32),
}

impl From<i32> for ConnectFailureReason {
    fn from(code: i32) -> Self {
        match code {
            400 => Self::Generic,
            401 => Self::LoggedOut,
            402 => Self::TempBanned,
            403 => Self::MainDeviceGone,
            405 => Self::ClientOutdated,
            406 => Self::UnknownLogout,
            409 => Self::BadUserAgent,
            413 => Self::CatExpired,
            414 => Self::CatInvalid,
            415 => Self::NotFound,
            418 => Self::ClientUnknown,
            500 => Self::InternalServerError,
            501 => Self::Experimental,
            503 => Self::ServiceUnavailable,
            _ => Self::Unknown(code),
        }
    }
}

impl From<ConnectFailureReason> for i32 {
    fn from(reason: ConnectFailureReason) -> Self {
        reason.code()
    }
}

impl ConnectFailureReason {
    pub fn code(&self) -> i32 {
        match self {
            Self::Generic => 400,
            Self::LoggedOut => 401,
            Self::TempBanned => 402,
            Self::MainDeviceGone => 403,
            Self::ClientOutdated => 405,
            Self::UnknownLogout => 406,
            Self::BadUserAgent => 409,
            Self::CatExpired => 413,
            Self::CatInvalid => 414,
            Self::NotFound => 415,
            Self::ClientUnknown => 418,
            Self::InternalServerError => 500,
            Self::Experimental => 501,
            Self::ServiceUnavailable => 503,
            Self::Unknown(code) => *code,
        }
    }

    /// The server invalidated this device's credentials.
    pub fn is_logged_out(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::MainDeviceGone | Self::UnknownLogout
        )
    }

    pub fn should_reconnect(&self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::InternalServerError)
    }
}

impl fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Generic => "generic failure",
            Self::LoggedOut => "logged out from another device",
            Self::TempBanned => "account temporarily banned",
            Self::MainDeviceGone => "primary device was logged out",
            Self::UnknownLogout => "logged out for unknown reason",
            Self::ClientOutdated => "client is out of date",
            Self::BadUserAgent => "client user agent was rejected",
            Self::CatExpired => "crypto auth token expired",
            Self::CatInvalid => "crypto auth token invalid",
            Self::NotFound => "not found",
            Self::ClientUnknown => "unknown client",
            Self::InternalServerError => "internal server error",
            Self::Experimental => "experimental",
            Self::ServiceUnavailable => "service unavailable",
            Self::Unknown(_) => "unknown reason",
        };
        write!(f, "{}: {}", self.code(), msg)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
