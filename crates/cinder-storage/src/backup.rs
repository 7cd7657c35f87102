//! Backup meta list and manifest.
//!
//! A backup is a directory of files plus a `MANIFEST` recording the backup
//! id and the sequence number the snapshot covers. The meta list - the
//! `(file name, CRC32)` pairs a master hands a slave over `_fetch_meta` -
//! has a line-oriented text form fixed by the wire protocol:
//!
//! ```text
//! MANIFEST 7f3a0c11
//! cf_default.kv deadbeef
//! cf_pubsub.kv 00c0ffee
//! ```

use std::path::Path;

use cinder_types::{BackupId, SequenceNumber};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Name of the manifest file inside a backup directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// One file in a backup, with the CRC32 of its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileEntry {
    /// File name relative to the backup directory.
    pub name: String,
    /// CRC32 of the file contents.
    pub crc32: u32,
}

/// The meta list describing one backup.
///
/// Transient: valid only for the full-sync attempt that fetched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Identifier of the backup on the master.
    pub id: BackupId,
    /// Files making up the backup, with their CRCs.
    pub files: Vec<BackupFileEntry>,
}

impl BackupMeta {
    /// Renders the meta list in its wire text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.files {
            out.push_str(&entry.name);
            out.push(' ');
            out.push_str(&format!("{:08x}", entry.crc32));
            out.push('\n');
        }
        out
    }

    /// Parses the wire text form received from `_fetch_meta`.
    pub fn parse_text(id: BackupId, text: &str) -> StorageResult<Self> {
        let mut files = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, crc)) = line.rsplit_once(' ') else {
                return Err(StorageError::InvalidBackupMeta(format!(
                    "missing crc in line '{line}'"
                )));
            };
            let crc32 = u32::from_str_radix(crc, 16).map_err(|_| {
                StorageError::InvalidBackupMeta(format!("bad crc '{crc}' for file '{name}'"))
            })?;
            files.push(BackupFileEntry {
                name: name.to_string(),
                crc32,
            });
        }
        Ok(Self { id, files })
    }
}

/// The manifest written into every backup directory.
///
/// Restoring a backup resumes replication from `sequence + 1`, so the
/// manifest is what makes a snapshot PSYNC-resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// The backup's identifier.
    pub id: BackupId,
    /// The last sequence number the snapshot covers.
    pub sequence: SequenceNumber,
}

impl Manifest {
    /// Renders the manifest file contents.
    pub fn to_text(&self) -> String {
        format!("id {}\nsequence {}\n", self.id.as_u32(), self.sequence.as_u64())
    }

    /// Parses manifest file contents.
    pub fn parse_text(text: &str) -> StorageResult<Self> {
        let mut id = None;
        let mut sequence = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some(("id", value)) => {
                    id = Some(value.parse::<u32>().map_err(|_| {
                        StorageError::InvalidBackupMeta(format!("bad manifest id '{value}'"))
                    })?);
                }
                Some(("sequence", value)) => {
                    sequence = Some(value.parse::<u64>().map_err(|_| {
                        StorageError::InvalidBackupMeta(format!("bad manifest sequence '{value}'"))
                    })?);
                }
                _ => {
                    return Err(StorageError::InvalidBackupMeta(format!(
                        "unrecognized manifest line '{line}'"
                    )));
                }
            }
        }

        match (id, sequence) {
            (Some(id), Some(sequence)) => Ok(Self {
                id: BackupId::new(id),
                sequence: SequenceNumber::new(sequence),
            }),
            _ => Err(StorageError::InvalidBackupMeta(
                "manifest missing id or sequence".into(),
            )),
        }
    }

    /// Reads the manifest from a backup directory.
    pub fn read_from(dir: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Self::parse_text(&text)
    }

    /// Writes the manifest into a backup directory.
    pub fn write_to(&self, dir: &Path) -> StorageResult<()> {
        std::fs::write(dir.join(MANIFEST_FILE), self.to_text())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_text_roundtrip() {
        let meta = BackupMeta {
            id: BackupId::new(7),
            files: vec![
                BackupFileEntry {
                    name: "a".into(),
                    crc32: 0xdead_beef,
                },
                BackupFileEntry {
                    name: "b".into(),
                    crc32: 0x00c0_ffee,
                },
            ],
        };

        let text = meta.to_text();
        assert_eq!(text, "a deadbeef\nb 00c0ffee\n");

        let parsed = BackupMeta::parse_text(BackupId::new(7), &text).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn empty_meta_parses() {
        let meta = BackupMeta::parse_text(BackupId::new(1), "").unwrap();
        assert!(meta.files.is_empty());
    }

    #[test]
    fn meta_rejects_bad_lines() {
        assert!(BackupMeta::parse_text(BackupId::new(1), "no-crc-here").is_err());
        assert!(BackupMeta::parse_text(BackupId::new(1), "file zzzz_not_hex").is_err());
    }

    #[test]
    fn manifest_roundtrip() {
        let manifest = Manifest {
            id: BackupId::new(3),
            sequence: SequenceNumber::new(1234),
        };
        let parsed = Manifest::parse_text(&manifest.to_text()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn manifest_requires_both_fields() {
        assert!(Manifest::parse_text("id 3\n").is_err());
        assert!(Manifest::parse_text("sequence 9\n").is_err());
        assert!(Manifest::parse_text("junk\n").is_err());
    }

    #[test]
    fn manifest_file_io() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            id: BackupId::new(11),
            sequence: SequenceNumber::new(500),
        };
        manifest.write_to(dir.path()).unwrap();
        assert_eq!(Manifest::read_from(dir.path()).unwrap(), manifest);
    }
}
