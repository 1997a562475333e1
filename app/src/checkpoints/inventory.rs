use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::clients::RemoteCheckpoint;

use super::{CheckpointRecord, RemoteMetadata};

/// What a scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of matching remote records against the local set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachSummary {
    /// Local records that now carry remote metadata.
    pub matched: usize,
    /// Whether any record's metadata changed.
    pub changed: bool,
}

/// Local checkpoint files keyed by path, plus the records that disappeared
/// from disk since the user last acknowledged them.
///
/// Paths are map keys, so a path can never appear twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointInventory {
    records: BTreeMap<PathBuf, CheckpointRecord>,
    recently_removed: BTreeMap<PathBuf, CheckpointRecord>,
}

impl CheckpointInventory {
    pub fn records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.records.values()
    }

    pub fn recently_removed(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.recently_removed.values()
    }

    pub fn get(&self, path: &Path) -> Option<&CheckpointRecord> {
        self.records.get(path)
    }

    pub fn was_recently_removed(&self, path: &Path) -> bool {
        self.recently_removed.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces the local side of the inventory with a fresh directory
    /// listing. Removal and the move into `recently_removed` happen together.
    /// Remote metadata of surviving records is untouched.
    pub fn apply_scan(&mut self, scanned: impl IntoIterator<Item = PathBuf>) -> ScanDiff {
        let scanned: BTreeSet<PathBuf> = scanned.into_iter().collect();
        let mut diff = ScanDiff::default();

        let gone: Vec<PathBuf> = self
            .records
            .keys()
            .filter(|path| !scanned.contains(*path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(record) = self.records.remove(&path) {
                self.recently_removed.insert(path.clone(), record);
                diff.removed.push(path);
            }
        }

        for path in scanned {
            if self.records.contains_key(&path) {
                continue;
            }
            self.recently_removed.remove(&path);
            self.records
                .insert(path.clone(), CheckpointRecord::local(path.clone()));
            diff.added.push(path);
        }

        diff
    }

    /// Attaches remote metadata by exact final-path-component equality.
    /// Records with no remote counterpart lose any metadata they had.
    pub fn attach_remote(&mut self, remote: &[RemoteCheckpoint]) -> AttachSummary {
        let mut by_filename: HashMap<&str, &RemoteCheckpoint> = HashMap::new();
        for checkpoint in remote {
            by_filename
                .entry(file_name_of(&checkpoint.filename))
                .or_insert(checkpoint);
        }

        let mut summary = AttachSummary::default();
        for record in self.records.values_mut() {
            let metadata = record
                .file_name()
                .and_then(|name| by_filename.get(name))
                .map(|checkpoint| RemoteMetadata::from(*checkpoint));
            if metadata.is_some() {
                summary.matched += 1;
            }
            if record.remote != metadata {
                record.remote = metadata;
                summary.changed = true;
            }
        }
        summary
    }

    /// Re-attaches cached metadata to records that have none yet.
    pub fn restore_remote(&mut self, cached: &[CheckpointRecord]) -> usize {
        let mut restored = 0;
        for cached in cached {
            let Some(metadata) = &cached.remote else {
                continue;
            };
            if let Some(record) = self.records.get_mut(&cached.path) {
                if record.remote.is_none() {
                    record.remote = Some(metadata.clone());
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Resolves a title reported by the engine. Exact title match first,
    /// then the title without its hash suffix against the model name.
    pub fn find_by_title(&self, title: &str) -> Option<&CheckpointRecord> {
        let exact = self
            .records
            .values()
            .find(|record| record.remote_title() == Some(title));
        exact.or_else(|| {
            let bare = strip_hash_suffix(title);
            self.records.values().find(|record| {
                record
                    .remote
                    .as_ref()
                    .is_some_and(|remote| remote.model_name == bare || remote.title == bare)
            })
        })
    }

    /// Records that currently carry remote metadata.
    pub fn matched_records(&self) -> Vec<CheckpointRecord> {
        self.records
            .values()
            .filter(|record| record.remote.is_some())
            .cloned()
            .collect()
    }

    pub fn clear_recently_removed(&mut self) -> bool {
        let had_any = !self.recently_removed.is_empty();
        self.recently_removed.clear();
        had_any
    }
}

/// True when two engine titles name the same checkpoint, ignoring the
/// optional ` [hash]` suffix.
pub fn titles_match(a: &str, b: &str) -> bool {
    a == b || strip_hash_suffix(a) == strip_hash_suffix(b)
}

fn strip_hash_suffix(title: &str) -> &str {
    match title.rfind(" [") {
        Some(index) if title.ends_with(']') => &title[..index],
        _ => title,
    }
}

/// Final path component; engines on Windows report backslash paths.
fn file_name_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
