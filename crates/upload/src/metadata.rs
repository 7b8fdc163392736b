//! Local image metadata stored on the destination for resume validation.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Key of the destination metadata entry holding the encoded [`ImageMetadata`].
pub const METADATA_KEY: &str = "pagesync_metadata";

const HASH_BUFFER: usize = 1024 * 1024;

/// Identity of a local image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub file_name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// SHA-256 of the whole image, lowercase hex.
    pub content_hash: String,
}

impl ImageMetadata {
    /// Reads and hashes the file at `path`. Blocking.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file_name,
            size: meta.len(),
            last_modified: DateTime::<Utc>::from(meta.modified()?),
            content_hash: hash_reader(file)?,
        })
    }

    /// Encodes as a single destination metadata entry (base64 JSON).
    pub fn to_object_metadata(&self) -> Result<HashMap<String, String>, StorageError> {
        let json = serde_json::to_vec(self)?;
        Ok(HashMap::from([(METADATA_KEY.to_string(), STANDARD.encode(json))]))
    }

    /// Decodes the entry written by [`to_object_metadata`](Self::to_object_metadata).
    ///
    /// Returns `Ok(None)` when the entry is absent.
    pub fn from_object_metadata(
        metadata: &HashMap<String, String>,
    ) -> Result<Option<Self>, StorageError> {
        let Some(encoded) = metadata.get(METADATA_KEY) else {
            return Ok(None);
        };
        let json = STANDARD
            .decode(encoded)
            .map_err(|e| StorageError::InvalidMetadata(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&json)?))
    }
}

/// SHA-256 of everything `reader` yields, as lowercase hex.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One difference between the destination's recorded metadata and the local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMismatch {
    Size { remote: u64, local: u64 },
    ContentHash { remote: String, local: String },
    LastModified { remote: DateTime<Utc>, local: DateTime<Utc> },
}

impl fmt::Display for MetadataMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size { remote, local } => {
                write!(f, "size differs (remote {remote}, local {local})")
            }
            Self::ContentHash { remote, local } => {
                write!(f, "content hash differs (remote {remote}, local {local})")
            }
            Self::LastModified { remote, local } => {
                write!(
                    f,
                    "last modified differs (remote {}, local {})",
                    remote.to_rfc3339(),
                    local.to_rfc3339()
                )
            }
        }
    }
}

/// Lists every difference that makes `remote` unsafe to resume from `local`.
///
/// An empty result means the upload can resume.
pub fn compare_metadata(remote: &ImageMetadata, local: &ImageMetadata) -> Vec<MetadataMismatch> {
    let mut mismatches = Vec::new();
    if remote.size != local.size {
        mismatches.push(MetadataMismatch::Size {
            remote: remote.size,
            local: local.size,
        });
    }
    if remote.content_hash != local.content_hash {
        mismatches.push(MetadataMismatch::ContentHash {
            remote: remote.content_hash.clone(),
            local: local.content_hash.clone(),
        });
    }
    if remote.last_modified != local.last_modified {
        mismatches.push(MetadataMismatch::LastModified {
            remote: remote.last_modified,
            local: local.last_modified,
        });
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::TimeZone;

    use super::*;

    fn sample() -> ImageMetadata {
        ImageMetadata {
            file_name: "disk.img".into(),
            size: 4096,
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            content_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn hash_of_known_input() {
        assert_eq!(
            hash_reader(&b"abc"[..]).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn from_file_reads_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        let meta = ImageMetadata::from_file(&path).unwrap();
        assert_eq!(meta.file_name, "disk.img");
        assert_eq!(meta.size, 3);
        assert_eq!(meta.content_hash, hash_reader(&b"abc"[..]).unwrap());
    }

    #[test]
    fn object_metadata_entry() {
        let meta = sample();
        let entry = meta.to_object_metadata().unwrap();
        assert_eq!(entry.len(), 1);
        assert!(!entry[METADATA_KEY].contains('{'), "value must be encoded");
        assert_eq!(ImageMetadata::from_object_metadata(&entry).unwrap(), Some(meta));
    }

    #[test]
    fn missing_or_garbled_entry() {
        assert_eq!(ImageMetadata::from_object_metadata(&HashMap::new()).unwrap(), None);

        let garbled = HashMap::from([(METADATA_KEY.to_string(), "%%%".to_string())]);
        assert!(matches!(
            ImageMetadata::from_object_metadata(&garbled),
            Err(StorageError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn compare_reports_each_difference() {
        let local = sample();
        assert!(compare_metadata(&local, &local).is_empty());

        let mut remote = sample();
        remote.size = 8192;
        remote.content_hash = "cd".repeat(32);
        let mismatches = compare_metadata(&remote, &local);
        assert_eq!(mismatches.len(), 2);
        assert!(matches!(mismatches[0], MetadataMismatch::Size { remote: 8192, local: 4096 }));
        assert!(matches!(mismatches[1], MetadataMismatch::ContentHash { .. }));
    }

    #[test]
    fn renamed_image_still_resumes() {
        let local = sample();
        let remote = ImageMetadata {
            file_name: "old-name.img".into(),
            ..sample()
        };
        assert!(compare_metadata(&remote, &local).is_empty());
    }
}
