//! Framed wire protocol shared by the client and the daemon.
//!
//! Every message is `[type:1][len:u32 big-endian][payload:len]`. Payloads are
//! either raw bytes or JSON depending on the type.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size of a single frame payload (10 MiB). A peer announcing a larger
/// frame is rejected before the payload is allocated.
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Chunk size for streaming file contents through `Data` frames.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Message type IDs (ordinals must stay stable for wire compat).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    AuthReq = 0,
    AuthResp = 1,
    FileList = 2,
    FileReq = 3,
    /// Legacy slot, never sent; drained and ignored on receive.
    FileData = 4,
    StartFile = 5,
    Data = 6,
    EndFile = 7,
    DeleteFile = 8,
    Error = 9,
    Done = 10,
}

impl MsgType {
    fn from_byte(b: u8) -> Option<MsgType> {
        Some(match b {
            0 => MsgType::AuthReq,
            1 => MsgType::AuthResp,
            2 => MsgType::FileList,
            3 => MsgType::FileReq,
            4 => MsgType::FileData,
            5 => MsgType::StartFile,
            6 => MsgType::Data,
            7 => MsgType::EndFile,
            8 => MsgType::DeleteFile,
            9 => MsgType::Error,
            10 => MsgType::Done,
            _ => return None,
        })
    }
}

/// Framing violations. All of these are fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame payload of {0} bytes exceeds the {} byte cap", MAX_MESSAGE_SIZE)]
    Oversize(u32),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unexpected message type {0:?}")]
    Unexpected(MsgType),
    #[error("connection closed mid-frame")]
    TruncatedFrame,
}

/// First frame on every connection. Field names are PascalCase on the wire for
/// compatibility with existing peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    pub instance: String,
    pub password: String,
    /// true when the client pushes files to the daemon, false when it pulls.
    pub is_sender: bool,
    pub compress: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Comma-separated exclude patterns the client must honor when scanning
    /// its local side.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exclude: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileListRequest {
    pub checksum: bool,
}

/// One manifest entry. `path` is relative to the tree root with forward
/// slashes, never empty, never absolute, never containing `..`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub mod_time: i64,
    pub mode: u32,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFileMsg {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    #[serde(default)]
    pub mod_time: i64,
}

/// Framed transport over one TCP connection, with optional zlib compression
/// of the post-auth stream (one independent zlib stream per direction).
pub struct Transport {
    rd: TcpStream,
    wr: TcpStream,
    zr: Option<ZlibDecoder<TcpStream>>,
    zw: Option<ZlibEncoder<TcpStream>>,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Result<Transport> {
        let rd = stream.try_clone().context("cloning socket handle")?;
        Ok(Transport {
            rd,
            wr: stream,
            zr: None,
            zw: None,
        })
    }

    /// Switch both directions to zlib. Called right after a successful auth
    /// exchange when compression was negotiated. The decoder reads the zlib
    /// stream header lazily on the first frame read, so installing it here
    /// cannot stall the handshake.
    pub fn enable_compression(&mut self) -> Result<()> {
        let wr = self.wr.try_clone().context("cloning socket for compression")?;
        let rd = self.rd.try_clone().context("cloning socket for compression")?;
        self.zw = Some(ZlibEncoder::new(wr, Compression::default()));
        self.zr = Some(ZlibDecoder::new(rd));
        Ok(())
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.zw {
            Some(z) => z,
            None => &mut self.wr,
        }
    }

    fn reader(&mut self) -> &mut dyn Read {
        match &mut self.zr {
            Some(z) => z,
            None => &mut self.rd,
        }
    }

    pub fn send(&mut self, msg: MsgType, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(ProtocolError::Oversize(payload.len() as u32).into());
        }
        let mut header = [0u8; 5];
        header[0] = msg as u8;
        header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        let w = self.writer();
        w.write_all(&header)?;
        if !payload.is_empty() {
            w.write_all(payload)?;
        }
        // Sync-flush after every frame; a compressed frame sitting in the
        // encoder's buffer would stall the peer.
        w.flush()?;
        Ok(())
    }

    pub fn send_json<T: Serialize>(&mut self, msg: MsgType, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).context("encoding payload")?;
        self.send(msg, &data)
    }

    /// Reads a frame header. Returns `None` when the peer closed the stream
    /// between frames; EOF inside a header is an error.
    pub fn read_header_opt(&mut self) -> Result<Option<(MsgType, u32)>> {
        let mut header = [0u8; 5];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader().read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ProtocolError::TruncatedFrame.into()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::Oversize(len).into());
        }
        let msg = MsgType::from_byte(header[0]).ok_or(ProtocolError::UnknownType(header[0]))?;
        Ok(Some((msg, len)))
    }

    pub fn read_header(&mut self) -> Result<(MsgType, u32)> {
        self.read_header_opt()?
            .ok_or_else(|| ProtocolError::TruncatedFrame.into())
    }

    pub fn read_payload(&mut self, len: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len as usize];
        self.reader().read_exact(&mut data).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                anyhow::Error::new(ProtocolError::TruncatedFrame)
            } else {
                err.into()
            }
        })?;
        Ok(data)
    }

    /// Streams exactly `len` payload bytes into `out` without buffering the
    /// whole frame.
    pub fn read_payload_to(&mut self, len: u32, out: &mut dyn Write) -> Result<()> {
        let r = self.reader();
        let copied = io::copy(&mut r.take(u64::from(len)), out)?;
        if copied < u64::from(len) {
            return Err(ProtocolError::TruncatedFrame.into());
        }
        Ok(())
    }

    pub fn discard_payload(&mut self, len: u32) -> Result<()> {
        self.read_payload_to(len, &mut io::sink())
    }

    pub fn read_frame(&mut self) -> Result<(MsgType, Vec<u8>)> {
        let (msg, len) = self.read_header()?;
        let data = self.read_payload(len)?;
        Ok((msg, data))
    }

    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<(MsgType, T)> {
        let (msg, data) = self.read_frame()?;
        let value =
            serde_json::from_slice(&data).with_context(|| format!("decoding {msg:?} payload"))?;
        Ok((msg, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Transport::new(client).unwrap(), Transport::new(server).unwrap())
    }

    #[test]
    fn frame_round_trip_plain() {
        let (mut a, mut b) = socket_pair();
        a.send(MsgType::FileReq, b"dir/file.txt").unwrap();
        a.send(MsgType::Done, &[]).unwrap();
        let (msg, payload) = b.read_frame().unwrap();
        assert_eq!(msg, MsgType::FileReq);
        assert_eq!(payload, b"dir/file.txt");
        let (msg, payload) = b.read_frame().unwrap();
        assert_eq!(msg, MsgType::Done);
        assert!(payload.is_empty());
    }

    #[test]
    fn frame_round_trip_compressed_both_directions() {
        let (mut a, mut b) = socket_pair();
        a.enable_compression().unwrap();
        b.enable_compression().unwrap();
        let blob = vec![7u8; 100_000];
        a.send(MsgType::Data, &blob).unwrap();
        let (msg, payload) = b.read_frame().unwrap();
        assert_eq!(msg, MsgType::Data);
        assert_eq!(payload, blob);
        b.send(MsgType::EndFile, &[]).unwrap();
        let (msg, _) = a.read_frame().unwrap();
        assert_eq!(msg, MsgType::EndFile);
    }

    #[test]
    fn json_round_trip_auth() {
        let (mut a, mut b) = socket_pair();
        let req = AuthRequest {
            instance: "default".into(),
            password: "secret".into(),
            is_sender: true,
            compress: false,
        };
        a.send_json(MsgType::AuthReq, &req).unwrap();
        let (msg, got): (MsgType, AuthRequest) = b.read_json().unwrap();
        assert_eq!(msg, MsgType::AuthReq);
        assert_eq!(got.instance, "default");
        assert!(got.is_sender);
    }

    #[test]
    fn auth_request_uses_pascal_case_on_the_wire() {
        let req = AuthRequest {
            instance: "i".into(),
            password: "p".into(),
            is_sender: false,
            compress: true,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"Instance\""));
        assert!(json.contains("\"IsSender\""));
        assert!(json.contains("\"Compress\""));
    }

    #[test]
    fn oversize_header_rejected_before_payload() {
        let (a, mut b) = socket_pair();
        // Hand-craft a header announcing a payload over the cap.
        let mut raw = a.wr.try_clone().unwrap();
        let mut header = [0u8; 5];
        header[0] = MsgType::Data as u8;
        header[1..5].copy_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        raw.write_all(&header).unwrap();
        let err = b.read_header().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Oversize(_))
        ));
    }

    #[test]
    fn clean_eof_between_frames_reads_as_none() {
        let (a, mut b) = socket_pair();
        drop(a);
        assert!(b.read_header_opt().unwrap().is_none());
    }

    #[test]
    fn empty_hash_omitted_from_manifest_json() {
        let info = FileInfo {
            path: "a".into(),
            size: 1,
            mod_time: 0,
            mode: 0o100644,
            is_dir: false,
            hash: String::new(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("hash"));
    }
}
