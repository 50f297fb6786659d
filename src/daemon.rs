//! Daemon: accepts connections and serves named instances over the framed
//! protocol. One OS thread per connection; instance configuration is
//! read-only after load.

use std::fs::{self, File};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};

use crate::config::{Config, InstanceConfig};
use crate::logger::{Level, Logger};
use crate::protocol::{
    AuthRequest, AuthResponse, MsgType, ProtocolError, StartFileMsg, Transport, CHUNK_SIZE,
};
use crate::scanner::{self, ExcludeSet};
use crate::{access, fsutil};

pub fn run(cfg: Config, log: Arc<Logger>) -> Result<()> {
    let listener = TcpListener::bind((cfg.address.as_str(), cfg.port))
        .with_context(|| format!("binding {}:{}", cfg.address, cfg.port))?;
    log.info(&format!("listening on {}:{}", cfg.address, cfg.port));
    let cfg = Arc::new(cfg);
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let cfg = Arc::clone(&cfg);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    if let Err(err) = handle_conn(stream, &cfg, &log) {
                        log.error(&format!("connection error: {err:#}"));
                    }
                });
            }
            Err(err) => log.error(&format!("accept error: {err}")),
        }
    }
    Ok(())
}

fn deny(message: &str) -> AuthResponse {
    AuthResponse {
        success: false,
        message: message.to_string(),
        exclude: String::new(),
    }
}

/// Auth phase: one `AuthReq` frame, instance resolution, host filter,
/// password check. A successful reply carries the instance exclude list and
/// is followed by the compression upgrade when negotiated.
fn handle_conn(stream: TcpStream, cfg: &Config, log: &Logger) -> Result<()> {
    let peer_ip = stream.peer_addr().context("peer address")?.ip();
    log.info(&format!("new connection from {peer_ip}"));

    let mut transport = Transport::new(stream)?;
    let (msg, payload) = transport.read_frame()?;
    if msg != MsgType::AuthReq {
        bail!(ProtocolError::Unexpected(msg));
    }
    let auth: AuthRequest =
        serde_json::from_slice(&payload).context("decoding auth request")?;

    let Some(instance) = cfg.instances.iter().find(|i| i.name == auth.instance) else {
        transport.send_json(MsgType::AuthResp, &deny("Instance not found"))?;
        log.warn(&format!(
            "unknown instance {:?} requested by {peer_ip}",
            auth.instance
        ));
        return Ok(());
    };

    let ilog = Arc::new(Logger::from_target(
        &instance.log_file,
        Level::parse(&instance.log_level),
        &instance.name,
    ));

    if !access::check_access(peer_ip, &instance.host_allow, &instance.host_deny) {
        transport.send_json(MsgType::AuthResp, &deny("Access denied"))?;
        ilog.warn(&format!("access denied for {peer_ip}"));
        return Ok(());
    }

    if !instance.password.is_empty() && instance.password != auth.password {
        transport.send_json(MsgType::AuthResp, &deny("Invalid password"))?;
        ilog.warn(&format!("invalid password from {peer_ip}"));
        return Ok(());
    }

    transport.send_json(
        MsgType::AuthResp,
        &AuthResponse {
            success: true,
            message: String::new(),
            exclude: instance.exclude.clone(),
        },
    )?;
    ilog.info(&format!("client {peer_ip} connected"));

    if auth.compress {
        transport.enable_compression()?;
    }

    Session::new(transport, instance, ilog).run()
}

/// Per-connection dispatcher. Lives for exactly one TCP connection.
struct Session {
    transport: Transport,
    root: PathBuf,
    excludes: ExcludeSet,
    log: Arc<Logger>,
}

impl Session {
    fn new(transport: Transport, instance: &InstanceConfig, log: Arc<Logger>) -> Session {
        Session {
            transport,
            root: instance.path.clone(),
            excludes: ExcludeSet::from_comma_list(&instance.exclude),
            log,
        }
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let Some((msg, len)) = self.transport.read_header_opt()? else {
                // Peer closed between frames: clean end of session.
                return Ok(());
            };
            match msg {
                MsgType::FileList => self.handle_file_list(len)?,
                MsgType::FileReq => self.handle_file_req(len)?,
                MsgType::StartFile => self.handle_start_file(len)?,
                MsgType::DeleteFile => self.handle_delete(len)?,
                MsgType::FileData => self.transport.discard_payload(len)?,
                MsgType::Done => return Ok(()),
                other => bail!(ProtocolError::Unexpected(other)),
            }
        }
    }

    /// Manifest request. The payload ({checksum} from pull clients, empty
    /// from push clients) is drained; hashes are always computed server-side.
    fn handle_file_list(&mut self, len: u32) -> Result<()> {
        eprintln!("DEBUG handle_file_list: discarding payload len={len}");
        self.transport.discard_payload(len)?;
        eprintln!("DEBUG handle_file_list: discarded, scanning");
        match scanner::scan(&self.root, &self.excludes, true, &self.log) {
            Ok(files) => {
                eprintln!("DEBUG handle_file_list: scanned {} entries, sending", files.len());
                self.log
                    .info(&format!("sending manifest ({} entries)", files.len()));
                let r = self.transport.send_json(MsgType::FileList, &files);
                eprintln!("DEBUG handle_file_list: send_json done: {:?}", r.is_ok());
                r
            }
            Err(err) => {
                self.log.error(&format!("scan failed: {err:#}"));
                self.transport
                    .send(MsgType::Error, format!("{err:#}").as_bytes())?;
                bail!("manifest scan failed")
            }
        }
    }

    fn handle_file_req(&mut self, len: u32) -> Result<()> {
        let raw = self.transport.read_payload(len)?;
        let rel = String::from_utf8_lossy(&raw).into_owned();
        let abs = match fsutil::secure_join(&self.root, &rel) {
            Ok(p) => p,
            Err(err) => {
                self.log.warn(&format!("rejected file request: {err}"));
                return self.transport.send(MsgType::Error, b"invalid path");
            }
        };
        let mut file = match File::open(&abs) {
            Ok(f) => f,
            Err(err) => {
                self.log.error(&format!("open {rel}: {err}"));
                return self
                    .transport
                    .send(MsgType::Error, err.to_string().as_bytes());
            }
        };
        let md = match file.metadata() {
            Ok(md) => md,
            Err(err) => {
                self.log.error(&format!("stat {rel}: {err}"));
                return self
                    .transport
                    .send(MsgType::Error, err.to_string().as_bytes());
            }
        };
        self.transport.send_json(
            MsgType::StartFile,
            &StartFileMsg {
                path: rel.clone(),
                size: if md.is_dir() { 0 } else { md.len() },
                mode: fsutil::file_mode(&md),
                mod_time: fsutil::mod_time(&md),
            },
        )?;
        self.log.info(&format!("sending {rel}"));
        if md.is_dir() {
            return self.transport.send(MsgType::EndFile, &[]);
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            // A mid-stream read failure truncates the transfer but keeps the
            // session alive; the client sees a short file, not a dead socket.
            let n = match file.read(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    self.log.error(&format!("read {rel}: {err}"));
                    break;
                }
            };
            if n == 0 {
                break;
            }
            self.transport.send(MsgType::Data, &buf[..n])?;
        }
        self.transport.send(MsgType::EndFile, &[])
    }

    /// Inbound file from a pushing client: `StartFile`, `Data`*, `EndFile`.
    /// Path and open failures drain the inner frames and keep the session
    /// alive; an unexpected frame inside the transfer kills the connection.
    fn handle_start_file(&mut self, len: u32) -> Result<()> {
        let payload = self.transport.read_payload(len)?;
        let start: StartFileMsg =
            serde_json::from_slice(&payload).context("decoding StartFile")?;
        let abs = match fsutil::secure_join(&self.root, &start.path) {
            Ok(p) => p,
            Err(err) => {
                self.log.warn(&format!("rejected incoming file: {err}"));
                return self.drain_transfer();
            }
        };
        if let Some(parent) = abs.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                self.log
                    .error(&format!("mkdir for {}: {err}", start.path));
                return self.drain_transfer();
            }
        }
        if fsutil::mode_is_dir(start.mode) {
            if let Err(err) = fs::create_dir_all(&abs) {
                self.log.error(&format!("mkdir {}: {err}", start.path));
            }
            return self.drain_transfer();
        }
        let mut file = match File::create(&abs) {
            Ok(f) => f,
            Err(err) => {
                self.log.error(&format!("create {}: {err}", start.path));
                return self.drain_transfer();
            }
        };
        loop {
            let (msg, dlen) = self.transport.read_header()?;
            match msg {
                MsgType::EndFile => {
                    self.transport.discard_payload(dlen)?;
                    break;
                }
                MsgType::Data => self.transport.read_payload_to(dlen, &mut file)?,
                MsgType::FileData => self.transport.discard_payload(dlen)?,
                other => bail!(ProtocolError::Unexpected(other)),
            }
        }
        drop(file);
        if let Err(err) = fsutil::apply_attributes(&abs, start.mode, start.mod_time) {
            self.log
                .warn(&format!("restoring attributes on {}: {err:#}", start.path));
        }
        self.log.info(&format!("received {}", start.path));
        Ok(())
    }

    fn handle_delete(&mut self, len: u32) -> Result<()> {
        let raw = self.transport.read_payload(len)?;
        let rel = String::from_utf8_lossy(&raw).into_owned();
        match fsutil::secure_join(&self.root, &rel) {
            Ok(abs) => match fsutil::remove_entry(&abs) {
                Ok(()) => self.log.info(&format!("deleted {rel}")),
                Err(err) => self.log.warn(&format!("delete {rel}: {err}")),
            },
            Err(err) => self.log.warn(&format!("rejected delete: {err}")),
        }
        Ok(())
    }

    /// Consumes frames up to and including `EndFile` for a transfer whose
    /// contents are being discarded.
    fn drain_transfer(&mut self) -> Result<()> {
        loop {
            let (msg, len) = self.transport.read_header()?;
            self.transport.discard_payload(len)?;
            if msg == MsgType::EndFile {
                return Ok(());
            }
        }
    }
}
