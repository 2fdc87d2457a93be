use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a session, shared by the live handle and the durable row.
///
/// Valid edges are `disconnected -> connecting -> connected`,
/// `connected -> disconnected` and `connecting -> disconnected`. Staying in the
/// same state is also accepted so a fresh QR code can re-assert `connecting`
/// and a repeated disconnect can re-assert `disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    pub fn can_transition_to(self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        self == target
            || matches!(
                (self, target),
                (Disconnected, Connecting)
                    | (Connecting, Connected)
                    | (Connected, Disconnected)
                    | (Connecting, Disconnected)
            )
    }

    /// Resolves a requested transition. An invalid request leaves the status
    /// where it is, so the caller ends up re-asserting the current state.
    pub fn transition(self, target: SessionStatus) -> SessionStatus {
        if self.can_transition_to(target) {
            target
        } else {
            self
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Disconnected
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown session status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyConfigError {
    #[error("proxy host must not be empty")]
    EmptyHost,
    #[error("proxy port must be non-zero")]
    InvalidPort,
    #[error("proxy password given without a username")]
    PasswordWithoutUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        if self.host.trim().is_empty() {
            return Err(ProxyConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ProxyConfigError::InvalidPort);
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ProxyConfigError::PasswordWithoutUser);
        }
        Ok(())
    }

    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (Some(user), None) => format!("{user}@"),
            _ => String::new(),
        };
        format!("{}://{}{}:{}", self.kind.scheme(), auth, self.host, self.port)
    }
}

/// The durable session aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub device_jid: Option<String>,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    pub qr_code_expires_at: Option<DateTime<Utc>>,
    pub proxy_config: Option<ProxyConfig>,
    pub connection_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            device_jid: None,
            status: SessionStatus::Disconnected,
            qr_code: None,
            qr_code_expires_at: None,
            proxy_config: None,
            connection_error: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.device_jid.is_some()
    }

    pub fn can_connect(&self) -> bool {
        self.status != SessionStatus::Connected
    }

    pub fn can_logout(&self) -> bool {
        self.status != SessionStatus::Disconnected
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_jid: String,
    pub platform: Option<String>,
    pub business_name: Option<String>,
    pub paired_at: Option<DateTime<Utc>>,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCodeResponse {
    /// Raw pairing payload, the string encoded in the QR code.
    pub code: String,
    /// Scannable rendering as a `data:` URI.
    pub image: String,
    pub expires_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSessionsRequest {
    #[serde(default)]
    pub status: Option<SessionStatus>,
    /// Zero means "use the service default".
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}
