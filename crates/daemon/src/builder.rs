//! Torrent artifact builder.
//!
//! Turns a local file into a [`TorrentArtifact`]: piece-size selection, SHA-1
//! piece hashing, canonical descriptor encoding, info hash and magnet URI.
//! Everything here is synchronous and CPU/disk bound; callers run it on the
//! blocking pool.

use crate::bencode::{self, Value};
use crate::config::{PieceTier, TorrentConfig};
use crate::job::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Width of a single piece hash in bytes.
pub const HASH_LEN: usize = 20;

pub type PieceHash = [u8; HASH_LEN];

/// Errors produced while building an artifact.
#[derive(Debug, Error)]
pub enum ArtifactBuildError {
    #[error("I/O error while hashing: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot create a torrent from an empty file")]
    EmptyFile,

    #[error("File is {actual} bytes but {declared} were declared")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("File name is missing or not valid UTF-8: {0}")]
    InvalidName(PathBuf),

    #[error("Build cancelled")]
    Cancelled,
}

/// Info hash identifying an artifact in the distribution network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId([u8; HASH_LEN]);

impl ContentId {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid content id {:?}: {}", s, e))?;
        let array: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| format!("content id {:?} must be {} bytes", s, HASH_LEN))?;
        Ok(Self(array))
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for ContentId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_hex()
    }
}

/// Step function from file size to piece size.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceSizePolicy {
    tiers: Vec<PieceTier>,
    fallback: u64,
}

impl PieceSizePolicy {
    /// `tiers` must be ordered by increasing threshold.
    pub fn new(tiers: Vec<PieceTier>, fallback: u64) -> Self {
        Self { tiers, fallback }
    }

    pub fn piece_size_for(&self, file_size: u64) -> u64 {
        self.tiers
            .iter()
            .find(|tier| file_size < tier.below_bytes)
            .map(|tier| tier.piece_size)
            .unwrap_or(self.fallback)
    }
}

impl Default for PieceSizePolicy {
    fn default() -> Self {
        let defaults = TorrentConfig::default();
        Self::new(defaults.piece_tiers, defaults.fallback_piece_size)
    }
}

/// Picks the piece size for a file under the given policy.
pub fn select_piece_size(file_size: u64, policy: &PieceSizePolicy) -> u64 {
    policy.piece_size_for(file_size)
}

/// Immutable result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentArtifact {
    pub content_id: ContentId,
    /// Display name (the file name)
    pub name: String,
    pub file_size: u64,
    pub piece_size: u64,
    pub piece_hashes: Vec<PieceHash>,
    pub tracker_tiers: Vec<Vec<String>>,
    /// Bencoded `.torrent` bytes
    pub descriptor: Vec<u8>,
    pub magnet_uri: String,
    pub source_file: PathBuf,
    pub created_at_ms: i64,
}

impl TorrentArtifact {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Directory the engine should seed from.
    pub fn save_dir(&self) -> &Path {
        self.source_file.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Descriptor settings shared by every build.
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub trackers: Vec<String>,
    pub creator: String,
    pub comment: String,
    pub piece_policy: PieceSizePolicy,
}

impl BuilderSettings {
    pub fn from_config(cfg: &TorrentConfig) -> Self {
        Self {
            trackers: cfg.trackers.clone(),
            creator: cfg.creator.clone(),
            comment: cfg.comment.clone(),
            piece_policy: PieceSizePolicy::new(cfg.piece_tiers.clone(), cfg.fallback_piece_size),
        }
    }

    /// Every tracker in its own tier, preserving order.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        self.trackers.iter().map(|t| vec![t.clone()]).collect()
    }
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self::from_config(&TorrentConfig::default())
    }
}

/// Builds torrent artifacts from local files.
#[derive(Debug, Clone, Default)]
pub struct ArtifactBuilder {
    settings: BuilderSettings,
}

impl ArtifactBuilder {
    pub fn new(settings: BuilderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    /// Build an artifact for `file_path`, which must be exactly `file_size` bytes.
    pub fn build(&self, file_path: &Path, file_size: u64) -> Result<TorrentArtifact, ArtifactBuildError> {
        self.build_cancellable(file_path, file_size, &AtomicBool::new(false))
    }

    /// Like [`build`](Self::build), but stops between pieces once `cancel` is set.
    pub fn build_cancellable(
        &self,
        file_path: &Path,
        file_size: u64,
        cancel: &AtomicBool,
    ) -> Result<TorrentArtifact, ArtifactBuildError> {
        if file_size == 0 {
            return Err(ArtifactBuildError::EmptyFile);
        }

        let name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArtifactBuildError::InvalidName(file_path.to_path_buf()))?
            .to_string();

        let piece_size = select_piece_size(file_size, &self.settings.piece_policy);
        let (piece_hashes, actual) = hash_pieces(file_path, piece_size, cancel)?;
        if actual != file_size {
            return Err(ArtifactBuildError::SizeMismatch {
                declared: file_size,
                actual,
            });
        }

        let info = info_dict(&name, file_size, piece_size, &piece_hashes);
        let info_bytes = bencode::encode(&info);
        let content_id = ContentId::from_bytes(Sha1::digest(&info_bytes).into());

        let tracker_tiers = self.settings.tracker_tiers();
        let created_at_ms = current_timestamp_ms();

        let mut root = vec![
            ("announce-list", tiers_value(&tracker_tiers)),
            ("comment", Value::str(&self.settings.comment)),
            ("created by", Value::str(&self.settings.creator)),
            ("creation date", Value::Int(created_at_ms / 1000)),
            ("info", info),
        ];
        if let Some(first) = self.settings.trackers.first() {
            root.push(("announce", Value::str(first)));
        }
        let descriptor = bencode::encode(&Value::dict(root));

        let magnet_uri = magnet_uri(&content_id, &name, &tracker_tiers);

        Ok(TorrentArtifact {
            content_id,
            name,
            file_size,
            piece_size,
            piece_hashes,
            tracker_tiers,
            descriptor,
            magnet_uri,
            source_file: file_path.to_path_buf(),
            created_at_ms,
        })
    }
}

/// Hashes `file_path` piece by piece.
///
/// Returns the ordered piece hashes and the number of bytes read. The last
/// piece may be shorter than `piece_size`.
pub fn hash_pieces(
    file_path: &Path,
    piece_size: u64,
    cancel: &AtomicBool,
) -> Result<(Vec<PieceHash>, u64), ArtifactBuildError> {
    let mut reader = BufReader::new(File::open(file_path)?);
    let mut buffer = vec![0u8; piece_size as usize];
    let mut hashes = Vec::new();
    let mut total = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ArtifactBuildError::Cancelled);
        }

        let filled = fill_piece(&mut reader, &mut buffer)?;
        if filled == 0 {
            break;
        }

        hashes.push(Sha1::digest(&buffer[..filled]).into());
        total += filled as u64;

        if filled < buffer.len() {
            break;
        }
    }

    Ok((hashes, total))
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill_piece<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn info_dict(name: &str, length: u64, piece_size: u64, hashes: &[PieceHash]) -> Value {
    let pieces: Vec<u8> = hashes.iter().flat_map(|h| h.iter().copied()).collect();
    Value::dict([
        ("length", Value::Int(length as i64)),
        ("name", Value::str(name)),
        ("piece length", Value::Int(piece_size as i64)),
        ("pieces", Value::Bytes(pieces)),
        ("private", Value::Int(0)),
    ])
}

fn tiers_value(tiers: &[Vec<String>]) -> Value {
    Value::List(
        tiers
            .iter()
            .map(|tier| Value::List(tier.iter().map(|url| Value::str(url)).collect()))
            .collect(),
    )
}

/// Magnet URI carrying the identifier, display name and flattened tracker list.
pub fn magnet_uri(content_id: &ContentId, name: &str, tiers: &[Vec<String>]) -> String {
    let mut uri = format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        content_id.to_hex(),
        urlencoding::encode(name)
    );
    for tracker in tiers.iter().flatten() {
        uri.push_str("&tr=");
        uri.push_str(&urlencoding::encode(tracker));
    }
    uri
}
