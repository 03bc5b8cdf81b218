use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::utils::keys;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no object key")]
    MissingKey,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("object key '{0}' is not a safe relative path")]
    UnsafeKey(String),
}

/// One "convert or copy the object at this key" message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionTask {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub s3key: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

fn default_version() -> u8 {
    ENVELOPE_VERSION
}

/// Wrapper used by framework-style publishers: `{ "pattern": ..., "data": ... }`,
/// with `data` either an object or a JSON string holding one.
#[derive(Deserialize)]
struct PatternWrapper {
    #[allow(dead_code)]
    pattern: serde_json::Value,
    data: serde_json::Value,
}

impl ConversionTask {
    pub fn new(s3key: impl Into<String>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: Uuid::new_v4(),
            s3key: s3key.into(),
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same task, republished for another delivery.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;

        let value = match serde_json::from_value::<PatternWrapper>(value.clone()) {
            Ok(wrapper) => match wrapper.data {
                serde_json::Value::String(inner) => serde_json::from_str(&inner)?,
                other => other,
            },
            Err(_) => value,
        };

        let task: ConversionTask = serde_json::from_value(value)?;
        task.validate()?;
        Ok(task)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        if self.s3key.trim().is_empty() {
            return Err(EnvelopeError::MissingKey);
        }
        if keys::relative_path(&self.s3key).is_none() {
            return Err(EnvelopeError::UnsafeKey(self.s3key.clone()));
        }
        Ok(())
    }
}

/// Output format of the conversion engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Jpeg,
    Png,
}

impl TargetFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    pub fn mime_type(&self) -> mime::Mime {
        match self {
            Self::Jpeg => mime::IMAGE_JPEG,
            Self::Png => mime::IMAGE_PNG,
        }
    }
}

/// Pipeline step a task failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Staging,
    Conversion,
    Upload,
    Delete,
    Verification,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Staging => "staging",
            Stage::Conversion => "conversion",
            Stage::Upload => "upload",
            Stage::Delete => "delete",
            Stage::Verification => "verification",
        };
        f.write_str(name)
    }
}

/// Terminal result of processing one task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Converted { dest_key: String },
    CopiedVerbatim { dest_key: String },
    /// The store was mutated but the expected final state could not be confirmed,
    /// e.g. the new object was written and the original could not be removed.
    Partial { dest_key: String, reason: String },
    Failed { stage: Stage, reason: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converted { .. } | Self::CopiedVerbatim { .. })
    }
}

/// Content type inferred from the key's extension
pub fn content_type_for(key: &str) -> mime::Mime {
    let ext = keys::extension(key).map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("png") => mime::IMAGE_PNG,
        Some("gif") => mime::IMAGE_GIF,
        Some("webp") => "image/webp".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        Some("heic") => "image/heic".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        Some("heif") => "image/heif".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        Some("txt") => mime::TEXT_PLAIN,
        Some("json") => mime::APPLICATION_JSON,
        Some("pdf") => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}
