//! The verdict document written to the durable mirror.

use crate::verdict::{AnalysisSummary, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// `{session}_response.json`. Error documents carry `is_injected: null` and
/// a message instead of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictDocument {
    pub status: ReportStatus,
    pub is_injected: Option<bool>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisSummary>,
}

impl VerdictDocument {
    pub fn success(verdict: Verdict) -> Self {
        Self {
            status: ReportStatus::Success,
            is_injected: Some(verdict.is_injected),
            timestamp: Utc::now(),
            message: None,
            analysis: Some(verdict.analysis),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            is_injected: None,
            timestamp: Utc::now(),
            message: Some(message.into()),
            analysis: None,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
