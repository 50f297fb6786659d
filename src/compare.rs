//! Manifest comparison: derives the ordered action plan the client applies
//! to its destination.

use std::collections::{HashMap, HashSet};

use crate::protocol::FileInfo;

/// Reconciliation policy selected by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Remove target entries that no longer exist on the source.
    pub delete: bool,
    /// Replace every target file unconditionally.
    pub overwrite: bool,
    /// Let content hashes participate in comparison.
    pub checksum: bool,
    /// Negotiate zlib on the wire.
    pub compress: bool,
    /// Restore mtime and mode on the destination after writes.
    pub archive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Copy,
    Delete,
}

/// One decision. `info` carries the metadata needed to execute: the source
/// entry for copies, the target entry for deletes.
#[derive(Debug, Clone)]
pub struct FileAction {
    pub path: String,
    pub kind: ActionKind,
    pub reason: &'static str,
    pub info: FileInfo,
}

/// Pure policy function. Copies come out in source iteration order, then
/// deletes in target iteration order. Change is never inferred from size or
/// mtime; only presence, the overwrite flag, and hashes decide.
pub fn compare(source: &[FileInfo], target: &[FileInfo], opts: &SyncOptions) -> Vec<FileAction> {
    let target_map: HashMap<&str, &FileInfo> =
        target.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut actions = Vec::new();

    for src in source {
        let Some(tgt) = target_map.get(src.path.as_str()) else {
            actions.push(FileAction {
                path: src.path.clone(),
                kind: ActionKind::Copy,
                reason: "new",
                info: src.clone(),
            });
            continue;
        };

        if src.is_dir {
            continue;
        }

        if opts.overwrite {
            actions.push(FileAction {
                path: src.path.clone(),
                kind: ActionKind::Copy,
                reason: "overwrite",
                info: src.clone(),
            });
            continue;
        }

        if opts.checksum && !src.hash.is_empty() && !tgt.hash.is_empty() && src.hash != tgt.hash {
            actions.push(FileAction {
                path: src.path.clone(),
                kind: ActionKind::Copy,
                reason: "checksum_diff",
                info: src.clone(),
            });
        }
    }

    if opts.delete {
        let source_paths: HashSet<&str> = source.iter().map(|f| f.path.as_str()).collect();
        for tgt in target {
            if !source_paths.contains(tgt.path.as_str()) {
                actions.push(FileAction {
                    path: tgt.path.clone(),
                    kind: ActionKind::Delete,
                    reason: "extraneous",
                    info: tgt.clone(),
                });
            }
        }
    }

    actions
}
