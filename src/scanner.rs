//! Tree scanning: walks a root, applies exclude patterns, and emits the
//! manifest entries exchanged over the wire.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use walkdir::WalkDir;

use crate::fsutil;
use crate::logger::Logger;
use crate::protocol::{FileInfo, CHUNK_SIZE};

/// Compiled exclude patterns. A pattern containing `/` matches the
/// slash-normalized relative path; a bare pattern matches the basename.
/// Matching directories are pruned from the walk.
#[derive(Default)]
pub struct ExcludeSet {
    patterns: Vec<ExcludePattern>,
}

struct ExcludePattern {
    matcher: GlobMatcher,
    full_path: bool,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> ExcludeSet {
        let mut compiled = Vec::new();
        for raw in patterns {
            // Trailing separators (directory patterns like "cache/") are
            // trimmed so they match the directory entry itself.
            let pat = raw.as_ref().trim().trim_end_matches('/');
            if pat.is_empty() {
                continue;
            }
            let Ok(glob) = GlobBuilder::new(pat).literal_separator(true).build() else {
                continue;
            };
            compiled.push(ExcludePattern {
                matcher: glob.compile_matcher(),
                full_path: pat.contains('/'),
            });
        }
        ExcludeSet { patterns: compiled }
    }

    /// Builds from the comma-separated form used in config files and the
    /// `AuthResp.exclude` field.
    pub fn from_comma_list(list: &str) -> ExcludeSet {
        ExcludeSet::new(&list.split(',').collect::<Vec<_>>())
    }

    pub fn matches(&self, rel: &str) -> bool {
        let base = rel.rsplit('/').next().unwrap_or(rel);
        self.patterns.iter().any(|p| {
            if p.full_path {
                p.matcher.is_match(rel)
            } else {
                p.matcher.is_match(base)
            }
        })
    }
}

/// Streaming MD5 of a file's contents, lowercase hex. A change indicator,
/// not a security primitive.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Walks `root` and produces one manifest entry per surviving node, sorted by
/// name at each level. The root itself is never emitted. Symlinks are not
/// followed. Errors on the root abort the scan; anything below it is logged
/// and skipped.
pub fn scan(
    root: &Path,
    excludes: &ExcludeSet,
    want_hash: bool,
    log: &Logger,
) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(e) => e,
            Err(err) => {
                if err.depth() == 0 {
                    return Err(err.into());
                }
                log.warn(&format!("scan: skipping entry: {err}"));
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => rel_slash(r),
            Err(_) => continue,
        };
        if excludes.matches(&rel) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(err) => {
                log.warn(&format!("scan: skipping {rel}: {err}"));
                continue;
            }
        };
        let is_dir = md.is_dir();
        let mut info = FileInfo {
            path: rel,
            size: if is_dir { 0 } else { md.len() },
            mod_time: fsutil::mod_time(&md),
            mode: fsutil::file_mode(&md),
            is_dir,
            hash: String::new(),
        };
        if want_hash && md.is_file() {
            match hash_file(entry.path()) {
                Ok(h) => info.hash = h,
                Err(err) => log.warn(&format!("scan: hashing {} failed: {err:#}", info.path)),
            }
        }
        files.push(info);
    }
    Ok(files)
}

fn rel_slash(rel: &Path) -> String {
    let mut s = String::new();
    for comp in rel.components() {
        if !s.is_empty() {
            s.push('/');
        }
        s.push_str(&comp.as_os_str().to_string_lossy());
    }
    s
}
