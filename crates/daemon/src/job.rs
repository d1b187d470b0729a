//! Ingestion job model.
//!
//! A [`FileOffer`] arrives from an ingress adapter, is turned into an
//! [`IngestionJob`] at submit time and is consumed exactly once by a worker.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Byte stream delivering the offered file's content.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Video file extensions (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v", ".webm", ".ts"];

/// Audio file extensions (case-insensitive matching).
pub const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".flac", ".ogg", ".opus", ".m4a", ".wav", ".aac"];

/// Kind of media carried by an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Document,
    Video,
    Audio,
}

impl Default for MediaKind {
    fn default() -> Self {
        Self::Document
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Document => write!(f, "document"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

impl MediaKind {
    /// Classifies a file by its extension; anything unrecognised is a document.
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!(".{}", ext.to_lowercase()),
            None => return MediaKind::Document,
        };

        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    /// Name used when the sender did not supply one.
    pub fn default_file_name(&self, unique: &str) -> String {
        match self {
            MediaKind::Document => format!("file_{}", unique),
            MediaKind::Video => format!("video_{}.mp4", unique),
            MediaKind::Audio => format!("audio_{}.mp3", unique),
        }
    }
}

/// A file delivered by an ingress adapter.
pub struct FileOffer {
    pub kind: MediaKind,
    /// Sender-supplied name, possibly missing or unsafe
    pub name: Option<String>,
    /// Declared size in bytes
    pub size: u64,
    pub source: ByteSource,
    /// Opaque reference back to whoever sent the file
    pub requester: String,
}

impl FileOffer {
    pub fn new(
        kind: MediaKind,
        name: Option<String>,
        size: u64,
        source: ByteSource,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name,
            size,
            source,
            requester: requester.into(),
        }
    }
}

impl std::fmt::Debug for FileOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOffer")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("requester", &self.requester)
            .finish_non_exhaustive()
    }
}

/// Caller-facing reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub requester: String,
}

/// Stage of a job in the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Holding a worker slot, not yet receiving.
    Admitted,
    /// Receiving bytes from the ingress stream.
    Transferring,
    /// Hashing pieces and encoding the descriptor.
    Building,
    /// Handing the artifact to the distribution engine.
    Registering,
    /// Writing the outcome record.
    Recording,
}

impl Default for JobStage {
    fn default() -> Self {
        Self::Admitted
    }
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Admitted => "admitted",
            JobStage::Transferring => "transferring",
            JobStage::Building => "building",
            JobStage::Registering => "registering",
            JobStage::Recording => "recording",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work. Immutable once enqueued.
pub struct IngestionJob {
    /// Unique job identifier (UUID).
    pub id: String,
    pub requester: String,
    pub kind: MediaKind,
    /// Sanitized single-component file name.
    pub file_name: String,
    pub declared_size: u64,
    pub source: ByteSource,
    /// Unix timestamp (milliseconds) of submission.
    pub submitted_at_ms: i64,
}

impl IngestionJob {
    /// Creates a job from an offer, assigning an id and a safe file name.
    pub fn from_offer(offer: FileOffer) -> Self {
        let id = Uuid::new_v4().to_string();
        let unique = id.split('-').next().unwrap_or(&id).to_string();

        let file_name = offer
            .name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| offer.kind.default_file_name(&unique));

        Self {
            id,
            requester: offer.requester,
            kind: offer.kind,
            file_name,
            declared_size: offer.size,
            source: offer.source,
            submitted_at_ms: current_timestamp_ms(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            requester: self.requester.clone(),
        }
    }
}

impl std::fmt::Debug for IngestionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionJob")
            .field("id", &self.id)
            .field("requester", &self.requester)
            .field("kind", &self.kind)
            .field("file_name", &self.file_name)
            .field("declared_size", &self.declared_size)
            .field("submitted_at_ms", &self.submitted_at_ms)
            .finish_non_exhaustive()
    }
}

/// Reduces a sender-supplied name to a single safe path component.
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
