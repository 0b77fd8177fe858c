use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Commit mode of a contribution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMode {
    Stream,
    Accrue,
    Replace,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Stream => "STREAM",
            SessionMode::Accrue => "ACCRUE",
            SessionMode::Replace => "REPLACE",
        }
    }

    pub fn parse(token: &str) -> Result<Self, BrokerError> {
        match token.trim() {
            "STREAM" => Ok(SessionMode::Stream),
            "ACCRUE" => Ok(SessionMode::Accrue),
            "REPLACE" => Ok(SessionMode::Replace),
            other => Err(BrokerError::bad_request(format!(
                "session mode `{}` must be one of STREAM, ACCRUE, REPLACE",
                other
            ))),
        }
    }
}

/// Operation requested for a batch of records. Closed set; matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Upsert,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Upsert => "UPSERT",
            Action::Delete => "DELETE",
        }
    }

    pub fn parse(token: &str) -> Result<Self, BrokerError> {
        match token.trim() {
            "UPSERT" => Ok(Action::Upsert),
            "DELETE" => Ok(Action::Delete),
            other => Err(BrokerError::bad_request(format!(
                "action `{}` must be one of UPSERT, DELETE",
                other
            ))),
        }
    }
}

/// One record as submitted by a connector. `id` is the connector's own
/// (vendor) identifier; it never leaves the broker unhashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSubmission {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "empty_object")]
    pub entity: serde_json::Value,
    #[serde(default = "empty_object")]
    pub instance: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The persisted, consumer-visible document built from a submission. The
/// timeseries descriptor map comes from the entity registry, not the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "empty_object")]
    pub entity: serde_json::Value,
    #[serde(default = "empty_object")]
    pub instance: serde_json::Value,
    #[serde(default)]
    pub timeseries: BTreeMap<String, serde_json::Value>,
}

impl RecordDocument {
    pub fn from_submission(
        submission: &RecordSubmission,
        timeseries: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            name: submission.name.clone(),
            entity: submission.entity.clone(),
            instance: submission.instance.clone(),
            timeseries,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| empty_object())
    }
}

/// Per-item diagnostic for an all-or-nothing batch rejection. `index` is the
/// position in the submitted array the message refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIssue {
    pub index: usize,
    pub message: String,
}

impl BatchIssue {
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Error taxonomy shared by every tributary crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    NotFound {
        resource: &'static str,
        id: String,
    },
    Unauthorized {
        message: String,
    },
    BadRequest {
        message: String,
        issues: Vec<BatchIssue>,
    },
    Internal {
        message: String,
    },
}

impl BrokerError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        BrokerError::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        BrokerError::Unauthorized {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        BrokerError::BadRequest {
            message: message.into(),
            issues: Vec::new(),
        }
    }

    pub fn bad_batch(message: impl Into<String>, issues: Vec<BatchIssue>) -> Self {
        BrokerError::BadRequest {
            message: message.into(),
            issues,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        BrokerError::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotFound { .. } => "ERR_NOT_FOUND",
            BrokerError::Unauthorized { .. } => "ERR_UNAUTHORIZED",
            BrokerError::BadRequest { .. } => "ERR_BAD_REQUEST",
            BrokerError::Internal { .. } => "ERR_INTERNAL",
        }
    }

    pub fn issues(&self) -> &[BatchIssue] {
        match self {
            BrokerError::BadRequest { issues, .. } => issues,
            _ => &[],
        }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NotFound { resource, id } => {
                write!(f, "{} `{}` not found", resource, id)
            }
            BrokerError::Unauthorized { message } => write!(f, "{}", message),
            BrokerError::BadRequest { message, issues } => {
                if issues.is_empty() {
                    write!(f, "{}", message)
                } else {
                    write!(f, "{} ({} invalid item(s))", message, issues.len())
                }
            }
            BrokerError::Internal { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for BrokerError {}
