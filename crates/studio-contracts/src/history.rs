use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An image carried as transportable text: base64 payload plus the MIME
/// type it was encoded from. This is the only image form the session
/// keeps; raw bytes are decoded on demand for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Parses either a `data:<mime>;base64,<payload>` URL or a bare base64
    /// string (assumed PNG). Providers differ on which form they hand back.
    pub fn from_data_url(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("empty image payload");
        }
        let Some(rest) = trimmed.strip_prefix("data:") else {
            return Ok(Self {
                mime_type: "image/png".to_string(),
                data: trimmed.to_string(),
            });
        };
        let (header, payload) = rest
            .split_once(',')
            .context("malformed data URL: missing comma")?;
        let mime_type = header
            .strip_suffix(";base64")
            .context("malformed data URL: not base64-encoded")?;
        if mime_type.is_empty() {
            bail!("malformed data URL: missing MIME type");
        }
        Ok(Self {
            mime_type: mime_type.to_string(),
            data: payload.to_string(),
        })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("image base64 decode failed")
    }

    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }

    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        "png"
    }
}

/// One completed generation. Immutable once appended to the history:
/// the store only ever removes records wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub original: EncodedImage,
    pub generated: EncodedImage,
    pub prompt: String,
    pub timestamp_ms: u64,
}

impl GenerationRecord {
    pub fn new(original: EncodedImage, generated: EncodedImage, prompt: impl Into<String>) -> Self {
        Self {
            id: short_token(),
            original,
            generated,
            prompt: prompt.into(),
            timestamp_ms: timestamp_millis(),
        }
    }

    /// Deterministic export filename, `clone-<id>.<ext>` with the
    /// extension taken from the generated image's MIME type.
    pub fn export_filename(&self) -> String {
        format!("clone-{}.{}", self.id, self.generated.extension())
    }
}

/// In-memory, newest-first collection of past generations for the
/// current session. Single writer, no persistence.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    records: Vec<GenerationRecord>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend(&mut self, record: GenerationRecord) {
        self.records.insert(0, record);
    }

    /// Removes the record with the given id. Returns whether anything
    /// changed, so repeated deletes are observable no-ops.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|record| record.id != id);
        self.records.len() != before
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, id: &str) -> Option<&GenerationRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn records(&self) -> &[GenerationRecord] {
        self.records.as_slice()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Short random record token. Collisions are accepted for a
/// single-session history; this is not a durable identifier.
pub fn short_token() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..8].to_string()
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
