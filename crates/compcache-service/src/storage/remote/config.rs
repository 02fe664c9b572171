use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Which operations a secondary backend takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::ReadOnly)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::WriteOnly)
    }
}

/// A secondary storage backend, shared between machines.
///
/// The scheme of the URL selects the backend: `file://` for a shared directory, `http://` and
/// `https://` for a server that answers `GET`, `PUT` and `HEAD` on `<url>/<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryStorageConfig {
    pub url: Url,

    #[serde(default)]
    pub mode: AccessMode,

    /// Time budget of a single operation against this backend.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Sent as `Authorization: Bearer <token>` to HTTP backends.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl SecondaryStorageConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            mode: AccessMode::default(),
            timeout: default_timeout(),
            bearer_token: None,
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}
