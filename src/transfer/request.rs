//! Request/response records exchanged with the device driver.
//!
//! The driver speaks a richer JSON dialect; these records carry only the fields
//! the transfer engine reads or writes. Field names serialize in the driver's
//! kebab-case form (`cobs-length`, ...), absent fields are skipped.
use serde::{Deserialize, Serialize};

/// Operation the driver should perform for a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    /// Report the device's staging buffer capacity (`max`).
    Capacity,
    /// Reset the staging buffer and expect `cobs-length` encoded bytes.
    BeginStage,
    /// Report how many decoded bytes are staged (`length`, optional `status`).
    QueryStaged,
    /// Consume the staged bytes at `offset` of `total`.
    Commit,
    /// Poll an asynchronous commit.
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Request {
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cobs_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    /// MD5 (lowercase hex) of the decoded chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Staged binary is attached to this request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
    /// Relay destination for forwarded commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl Request {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            cobs_length: None,
            offset: None,
            total: None,
            status: None,
            binary: false,
            route: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Response {
    pub fn error(&self) -> Option<(ErrorClass, &str)> {
        self.err.as_deref().map(|e| (ErrorClass::of(e), e))
    }
}

/// Class of a device error string, from its brace tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// `{io}`: link-level corruption or timeout; retry.
    Io,
    /// `{bad-bin}`: staged binary failed the device's own checks; retry.
    BadBin,
    /// `{not-ready}`: device busy or past the operation.
    NotReady,
    Other,
}

impl ErrorClass {
    pub fn of(err: &str) -> Self {
        if err.contains("{io}") {
            ErrorClass::Io
        } else if err.contains("{bad-bin}") {
            ErrorClass::BadBin
        } else if err.contains("{not-ready}") {
            ErrorClass::NotReady
        } else {
            ErrorClass::Other
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Io | ErrorClass::BadBin)
    }
}
