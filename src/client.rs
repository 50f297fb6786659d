//! Client-side sync drivers: local↔local, remote pull, and local push.
//!
//! The client owns reconciliation: scan both sides, compare, apply. Remote
//! transfers always run on a dedicated, re-authenticated connection per file
//! so frames never interleave; the primary connection carries only auth,
//! manifest exchange, and the final `Done`.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use crate::compare::{self, ActionKind, FileAction, SyncOptions};
use crate::fsutil;
use crate::logger::Logger;
use crate::protocol::{
    AuthRequest, AuthResponse, FileInfo, FileListRequest, MsgType, ProtocolError, StartFileMsg,
    Transport, CHUNK_SIZE,
};
use crate::scanner::{self, ExcludeSet};
use crate::url::{self, RemoteSpec};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub sync: SyncOptions,
    /// Worker pool size; capped at the number of actions.
    pub threads: usize,
    pub verbose: bool,
}

pub fn run(source: &str, target: &str, opts: RunOptions, log: Arc<Logger>) -> Result<()> {
    let src_remote = url::parse_remote(source);
    let tgt_remote = url::parse_remote(target);
    if src_remote.is_some() && tgt_remote.is_some() {
        bail!("source and target cannot both be remote");
    }

    let start = Instant::now();
    match (src_remote, tgt_remote) {
        (Some(remote), None) => sync_remote_local(&remote, Path::new(target), &opts, &log)?,
        (None, Some(remote)) => sync_local_remote(Path::new(source), &remote, &opts, &log)?,
        _ => sync_local_local(Path::new(source), Path::new(target), &opts, &log)?,
    }
    log.info(&format!("sync completed in {:.2?}", start.elapsed()));
    Ok(())
}

fn connect_and_auth(
    remote: &RemoteSpec,
    is_sender: bool,
    opts: &SyncOptions,
) -> Result<(Transport, String)> {
    let stream = TcpStream::connect((remote.host.as_str(), remote.port))
        .with_context(|| format!("connecting to {}:{}", remote.host, remote.port))?;
    let mut transport = Transport::new(stream)?;
    transport.send_json(
        MsgType::AuthReq,
        &AuthRequest {
            instance: remote.instance.clone(),
            password: remote.password.clone(),
            is_sender,
            compress: opts.compress,
        },
    )?;
    let (msg, resp): (MsgType, AuthResponse) = transport.read_json()?;
    if msg != MsgType::AuthResp {
        bail!(ProtocolError::Unexpected(msg));
    }
    if !resp.success {
        bail!("authentication failed: {}", resp.message);
    }
    if opts.compress {
        transport.enable_compression()?;
    }
    Ok((transport, resp.exclude))
}

fn sync_local_local(source: &Path, target: &Path, opts: &RunOptions, log: &Arc<Logger>) -> Result<()> {
    log.info(&format!(
        "syncing local {} -> local {}",
        source.display(),
        target.display()
    ));

    let excludes = ExcludeSet::default();
    let src_files = scanner::scan(source, &excludes, opts.sync.checksum, log)
        .with_context(|| format!("scanning source {}", source.display()))?;
    let tgt_files = scan_target_or_empty(target, &excludes, opts, log);

    let actions = compare::compare(&src_files, &tgt_files, &opts.sync);
    report_plan(&src_files, &tgt_files, &actions, opts, log);

    execute_actions(actions, opts.threads, log, |action| {
        let tgt_path = fsutil::secure_join(target, &action.path)?;
        match action.kind {
            ActionKind::Delete => {
                log.info(&format!("deleting {}", action.path));
                fsutil::remove_tree(&tgt_path)?;
            }
            ActionKind::Copy => {
                if action.info.is_dir {
                    log.info(&format!("creating directory {}", action.path));
                    fs::create_dir_all(&tgt_path)?;
                } else {
                    log.info(&format!("copying {}", action.path));
                    let src_path = fsutil::secure_join(source, &action.path)?;
                    fsutil::copy_file(&src_path, &tgt_path)?;
                    if opts.sync.archive {
                        fsutil::apply_attributes(
                            &tgt_path,
                            action.info.mode,
                            action.info.mod_time,
                        )?;
                    }
                }
            }
        }
        Ok(())
    })
}

fn sync_remote_local(
    remote: &RemoteSpec,
    target: &Path,
    opts: &RunOptions,
    log: &Arc<Logger>,
) -> Result<()> {
    log.info(&format!(
        "syncing remote {}:{}/{} -> local {}",
        remote.host,
        remote.port,
        remote.instance,
        target.display()
    ));

    let (mut transport, server_excludes) = connect_and_auth(remote, false, &opts.sync)?;

    transport.send_json(
        MsgType::FileList,
        &FileListRequest {
            checksum: opts.sync.checksum,
        },
    )?;
    let src_files = read_manifest(&mut transport)?;

    let excludes = ExcludeSet::from_comma_list(&server_excludes);
    let tgt_files = scan_target_or_empty(target, &excludes, opts, log);

    let actions = compare::compare(&src_files, &tgt_files, &opts.sync);
    report_plan(&src_files, &tgt_files, &actions, opts, log);

    execute_actions(actions, opts.threads, log, |action| {
        let tgt_path = fsutil::secure_join(target, &action.path)?;
        match action.kind {
            ActionKind::Delete => {
                log.info(&format!("deleting {}", action.path));
                fsutil::remove_entry(&tgt_path)?;
                Ok(())
            }
            ActionKind::Copy => {
                log.info(&format!("pulling {}", action.path));
                pull_one(remote, &opts.sync, action, &tgt_path)
            }
        }
    })?;

    transport.send(MsgType::Done, &[])?;
    Ok(())
}

/// Fetches one entry over its own connection and writes it below the local
/// target root.
fn pull_one(
    remote: &RemoteSpec,
    opts: &SyncOptions,
    action: &FileAction,
    tgt_path: &Path,
) -> Result<()> {
    let (mut transport, _) = connect_and_auth(remote, false, opts)?;
    transport.send(MsgType::FileReq, action.path.as_bytes())?;

    let (msg, payload) = transport.read_frame()?;
    let start: StartFileMsg = match msg {
        MsgType::StartFile => {
            serde_json::from_slice(&payload).context("decoding StartFile")?
        }
        MsgType::Error => bail!("remote error: {}", String::from_utf8_lossy(&payload)),
        other => bail!(ProtocolError::Unexpected(other)),
    };

    if let Some(parent) = tgt_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    if fsutil::mode_is_dir(start.mode) {
        fs::create_dir_all(tgt_path)
            .with_context(|| format!("creating {}", tgt_path.display()))?;
        drain_to_end(&mut transport)?;
        return transport.send(MsgType::Done, &[]);
    }

    let mut file = File::create(tgt_path)
        .with_context(|| format!("creating {}", tgt_path.display()))?;
    loop {
        let (msg, len) = transport.read_header()?;
        match msg {
            MsgType::EndFile => {
                transport.discard_payload(len)?;
                break;
            }
            MsgType::Data => transport.read_payload_to(len, &mut file)?,
            MsgType::FileData => transport.discard_payload(len)?,
            other => bail!(ProtocolError::Unexpected(other)),
        }
    }
    drop(file);

    if opts.archive {
        fsutil::apply_attributes(tgt_path, start.mode, start.mod_time)?;
    }
    // An explicit Done lets a compressed session wind down cleanly instead
    // of ending in a truncated zlib stream.
    transport.send(MsgType::Done, &[])
}

fn sync_local_remote(
    source: &Path,
    remote: &RemoteSpec,
    opts: &RunOptions,
    log: &Arc<Logger>,
) -> Result<()> {
    log.info(&format!(
        "syncing local {} -> remote {}:{}/{}",
        source.display(),
        remote.host,
        remote.port,
        remote.instance
    ));

    let (mut transport, server_excludes) = connect_and_auth(remote, true, &opts.sync)?;

    // An empty FileList payload asks the daemon for its manifest.
    transport.send(MsgType::FileList, &[])?;
    let tgt_files = read_manifest(&mut transport)?;

    let excludes = ExcludeSet::from_comma_list(&server_excludes);
    let src_files = scanner::scan(source, &excludes, opts.sync.checksum, log)
        .with_context(|| format!("scanning source {}", source.display()))?;

    let actions = compare::compare(&src_files, &tgt_files, &opts.sync);
    report_plan(&src_files, &tgt_files, &actions, opts, log);

    execute_actions(actions, opts.threads, log, |action| match action.kind {
        ActionKind::Delete => {
            log.info(&format!("remote-deleting {}", action.path));
            let (mut wt, _) = connect_and_auth(remote, true, &opts.sync)?;
            wt.send(MsgType::DeleteFile, action.path.as_bytes())?;
            wt.send(MsgType::Done, &[])
        }
        ActionKind::Copy => {
            log.info(&format!("pushing {}", action.path));
            push_one(source, remote, &opts.sync, action)
        }
    })?;

    transport.send(MsgType::Done, &[])?;
    Ok(())
}

/// Sends one entry over its own connection. Files are stat'ed fresh at send
/// time so the daemon restores current metadata, not scan-time metadata.
fn push_one(
    source: &Path,
    remote: &RemoteSpec,
    opts: &SyncOptions,
    action: &FileAction,
) -> Result<()> {
    let (mut transport, _) = connect_and_auth(remote, true, opts)?;

    if action.info.is_dir {
        transport.send_json(
            MsgType::StartFile,
            &StartFileMsg {
                path: action.path.clone(),
                size: 0,
                mode: action.info.mode,
                mod_time: 0,
            },
        )?;
        transport.send(MsgType::EndFile, &[])?;
        return transport.send(MsgType::Done, &[]);
    }

    let src_path = fsutil::secure_join(source, &action.path)?;
    let mut file =
        File::open(&src_path).with_context(|| format!("opening {}", src_path.display()))?;
    let md = file.metadata()?;
    transport.send_json(
        MsgType::StartFile,
        &StartFileMsg {
            path: action.path.clone(),
            size: md.len(),
            mode: fsutil::file_mode(&md),
            mod_time: fsutil::mod_time(&md),
        },
    )?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        transport.send(MsgType::Data, &buf[..n])?;
    }
    transport.send(MsgType::EndFile, &[])?;
    transport.send(MsgType::Done, &[])
}

fn read_manifest(transport: &mut Transport) -> Result<Vec<FileInfo>> {
    let (msg, payload) = transport.read_frame()?;
    match msg {
        MsgType::FileList => {
            serde_json::from_slice(&payload).context("decoding remote manifest")
        }
        MsgType::Error => bail!("remote error: {}", String::from_utf8_lossy(&payload)),
        other => bail!(ProtocolError::Unexpected(other)),
    }
}

/// A target that cannot be scanned is treated as empty; everything gets
/// copied. Only warn when something actually exists there.
fn scan_target_or_empty(
    target: &Path,
    excludes: &ExcludeSet,
    opts: &RunOptions,
    log: &Arc<Logger>,
) -> Vec<FileInfo> {
    match scanner::scan(target, excludes, opts.sync.checksum, log) {
        Ok(files) => files,
        Err(err) => {
            if target.exists() {
                log.warn(&format!("target scan failed, treating as empty: {err:#}"));
            }
            Vec::new()
        }
    }
}

fn report_plan(
    src: &[FileInfo],
    tgt: &[FileInfo],
    actions: &[FileAction],
    opts: &RunOptions,
    log: &Arc<Logger>,
) {
    if opts.verbose {
        log.info(&format!(
            "source manifest: {} entries, target manifest: {} entries",
            src.len(),
            tgt.len()
        ));
    }
    log.info(&format!("{} actions to apply", actions.len()));
}

/// Drains the action queue with a pool of workers. Per-action failures are
/// logged and never abort the run.
fn execute_actions<F>(
    actions: Vec<FileAction>,
    threads: usize,
    log: &Arc<Logger>,
    handler: F,
) -> Result<()>
where
    F: Fn(&FileAction) -> Result<()> + Send + Sync,
{
    let workers = threads.max(1).min(actions.len());
    if workers == 0 {
        return Ok(());
    }
    let queue = Mutex::new(VecDeque::from(actions));
    let handler = &handler;
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let action = queue.lock().ok().and_then(|mut q| q.pop_front());
                let Some(action) = action else {
                    break;
                };
                if let Err(err) = handler(&action) {
                    log.error(&format!("{}: {err:#}", action.path));
                }
            });
        }
    });
    Ok(())
}

/// Consumes frames up to and including `EndFile`.
fn drain_to_end(transport: &mut Transport) -> Result<()> {
    loop {
        let (msg, len) = transport.read_header()?;
        transport.discard_payload(len)?;
        if msg == MsgType::EndFile {
            return Ok(());
        }
    }
}
