//! Pipeline and viewer session identity types.
//!
//! A pipeline is named after the stream kind it carries; viewer sessions are
//! identified by the client-supplied id plus a short random suffix so that two
//! dashboards using the same client id never collide in a session set.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::kind::StreamKind;

/// Name of one independent ingest→batch→persist→broadcast chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(pub String);

impl PipelineName {
    /// Pipeline name for a stream kind.
    pub fn for_kind(kind: StreamKind) -> Self {
        PipelineName(kind.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<StreamKind> for PipelineName {
    fn from(kind: StreamKind) -> Self {
        PipelineName::for_kind(kind)
    }
}

/// Viewer session ID.
///
/// Format: `<client_id>-<random>`
/// Example: `dashboard-1-3fa9c2`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new session ID for a client.
    pub fn new(client_id: &str) -> Self {
        let random: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect();
        let client = if client_id.trim().is_empty() {
            "anonymous"
        } else {
            client_id.trim()
        };
        SessionId(format!("{}-{}", client, random))
    }

    /// Client id portion of the session id.
    pub fn client_id(&self) -> &str {
        match self.0.rsplit_once('-') {
            Some((client, _)) => client,
            None => &self.0,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
