//! Download progress resources
//!
//! Resource URIs look like `litert://downloads/{model}`. Their text content is
//! JSON in one of two shapes: the canonical [`ProgressRecord`] or the download
//! payload the model server publishes (`{model, progress, status}`).

use crate::monitor::error::ReadError;
use crate::monitor::record::{ProgressRecord, TaskStatus};
use serde::{Deserialize, Serialize};

pub const DOWNLOADS_PREFIX: &str = "litert://downloads/";

/// Resource URI for a model's download progress
pub fn download_uri(model: &str) -> String {
    format!("{}{}", DOWNLOADS_PREFIX, model)
}

/// Extract the model name from a download resource URI
pub fn model_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(DOWNLOADS_PREFIX)
        .filter(|model| !model.is_empty())
}

/// Status as published by the model server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Verifying,
    Complete,
    Cancelled,
    Failed(String),
}

/// Download progress payload as published by the model server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub model: String,
    /// 0-100
    pub progress: u8,
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl DownloadProgress {
    pub fn new(model: impl Into<String>, progress: u8, status: DownloadStatus) -> Self {
        Self {
            model: model.into(),
            progress,
            status,
            sequence: None,
        }
    }

    /// Convert to a record, using `fallback_sequence` when none was published
    pub fn into_record(self, fallback_sequence: u64) -> ProgressRecord {
        let (status, detail) = match self.status {
            DownloadStatus::Pending => (TaskStatus::Pending, None),
            DownloadStatus::Downloading => (TaskStatus::Running, None),
            DownloadStatus::Verifying => (TaskStatus::Verifying, None),
            DownloadStatus::Complete => (TaskStatus::Complete, None),
            DownloadStatus::Cancelled => (TaskStatus::Cancelled, None),
            DownloadStatus::Failed(error) => (TaskStatus::Failed, Some(error)),
        };
        ProgressRecord {
            task_id: self.model,
            status,
            percent: self.progress,
            sequence: self.sequence.unwrap_or(fallback_sequence),
            detail,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResourcePayload {
    Record(ProgressRecord),
    Download(DownloadProgress),
}

/// Decode resource text into a record.
///
/// `fallback_sequence` is only called for payloads that carry no sequence.
pub fn decode(text: &str, fallback_sequence: impl FnOnce() -> u64) -> Result<ProgressRecord, ReadError> {
    let payload: ResourcePayload =
        serde_json::from_str(text).map_err(|e| ReadError::Decode(e.to_string()))?;
    Ok(match payload {
        ResourcePayload::Record(record) => record,
        ResourcePayload::Download(download) => {
            let sequence = match download.sequence {
                Some(sequence) => sequence,
                None => fallback_sequence(),
            };
            download.into_record(sequence)
        }
    })
}

/// Encode a payload the way the model server publishes it
pub fn encode(progress: &DownloadProgress) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_helpers() {
        assert_eq!(download_uri("gemma3-1b"), "litert://downloads/gemma3-1b");
        assert_eq!(model_from_uri("litert://downloads/gemma3-1b"), Some("gemma3-1b"));
        assert_eq!(model_from_uri("litert://downloads/"), None);
        assert_eq!(model_from_uri("file:///tmp/x"), None);
    }

    #[test]
    fn test_decode_server_payload() {
        let text = r#"{"model": "gemma3-1b", "progress": 40, "status": "downloading"}"#;
        let record = decode(text, || 17).unwrap();
        assert_eq!(record.task_id, "gemma3-1b");
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.percent, 40);
        assert_eq!(record.sequence, 17);
    }

    #[test]
    fn test_decode_failed_payload_keeps_error_text() {
        let text = r#"{"model": "gemma3-1b", "progress": 0, "status": {"failed": "HTTP 401"}, "sequence": 9}"#;
        let record = decode(text, || unreachable!()).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.detail.as_deref(), Some("HTTP 401"));
        assert_eq!(record.sequence, 9);
    }

    #[test]
    fn test_decode_canonical_record() {
        let text = r#"{"task_id": "t1", "status": "verifying", "percent": 95, "sequence": 12}"#;
        let record = decode(text, || 0).unwrap();
        assert_eq!(record, ProgressRecord::new("t1", TaskStatus::Verifying, 95, 12));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json", || 0), Err(ReadError::Decode(_))));
        assert!(matches!(
            decode(r#"{"model": "m", "progress": 10, "status": "paused"}"#, || 0),
            Err(ReadError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_matches_server_shape() {
        let text = encode(&DownloadProgress::new(
            "gemma3-1b",
            0,
            DownloadStatus::Failed("boom".to_string()),
        ))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"]["failed"], "boom");
        assert_eq!(value["progress"], 0);
        assert!(value.get("sequence").is_none());
    }
}
