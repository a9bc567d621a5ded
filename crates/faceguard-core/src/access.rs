//! Access-log model and the persistence collaborator contracts.

use crate::types::{FaceMatch, GalleryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOutcome {
    Granted,
    Denied,
}

impl AccessOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessOutcome::Granted => "granted",
            AccessOutcome::Denied => "denied",
        }
    }
}

impl fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AccessOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "granted" => Ok(AccessOutcome::Granted),
            "denied" => Ok(AccessOutcome::Denied),
            other => Err(format!("unknown access outcome: {other}")),
        }
    }
}

/// One access attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub user_id: Option<i64>,
    pub outcome: AccessOutcome,
    /// Match confidence, 0–100.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl AccessLogEntry {
    /// Known faces are granted, everything else denied.
    pub fn from_match(face: &FaceMatch) -> Self {
        let outcome = if face.is_known() {
            AccessOutcome::Granted
        } else {
            AccessOutcome::Denied
        };
        Self {
            user_id: face.user_id,
            outcome,
            confidence: face.confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Where access attempts are recorded.
pub trait AccessLogSink: Send + Sync {
    fn append_log(&self, entry: &AccessLogEntry) -> Result<(), CollaboratorError>;
}

/// Where the enrolled gallery comes from.
pub trait GallerySource: Send + Sync {
    fn load_gallery(&self) -> Result<Vec<GalleryEntry>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn face(user_id: Option<i64>, confidence: f32) -> FaceMatch {
        FaceMatch {
            user_id,
            name: user_id.map(|id| format!("user{id}")),
            distance: 0.3,
            confidence,
            location: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.99,
                landmarks: None,
            },
        }
    }

    #[test]
    fn test_known_face_is_granted() {
        let entry = AccessLogEntry::from_match(&face(Some(7), 70.0));
        assert_eq!(entry.outcome, AccessOutcome::Granted);
        assert_eq!(entry.user_id, Some(7));
        assert_eq!(entry.confidence, 70.0);
    }

    #[test]
    fn test_unknown_face_is_denied() {
        let entry = AccessLogEntry::from_match(&face(None, 0.0));
        assert_eq!(entry.outcome, AccessOutcome::Denied);
        assert_eq!(entry.user_id, None);
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!("granted".parse::<AccessOutcome>(), Ok(AccessOutcome::Granted));
        assert_eq!("denied".parse::<AccessOutcome>(), Ok(AccessOutcome::Denied));
        assert!("maybe".parse::<AccessOutcome>().is_err());
        assert_eq!(AccessOutcome::Denied.to_string(), "denied");
    }
}
