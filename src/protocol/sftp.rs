//! Read-only SFTP v3 file area.
//!
//! Runs as the application of an `Sftp` session: packets arrive as raw bytes on the
//! session's [`TerminalIo`]. Directory listing, stat and download are served from
//! the configured root; every write-side request answers `OP_UNSUPPORTED` or
//! `PERMISSION_DENIED`.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::bbs::session::{SessionApp, SessionContext};
use crate::config::SftpConfig;
use crate::error::{BbsError, Result};
use crate::logutil::escape_log;
use crate::validation::resolve_area_path;

const SFTP_VERSION: u32 = 3;
const MAX_PACKET: usize = 256 * 1024;
const MAX_HANDLES: usize = 64;
const READDIR_BATCH: usize = 64;

const FXP_INIT: u8 = 1;
const FXP_VERSION: u8 = 2;
const FXP_OPEN: u8 = 3;
const FXP_CLOSE: u8 = 4;
const FXP_READ: u8 = 5;
const FXP_LSTAT: u8 = 7;
const FXP_FSTAT: u8 = 8;
const FXP_OPENDIR: u8 = 11;
const FXP_READDIR: u8 = 12;
const FXP_REALPATH: u8 = 16;
const FXP_STAT: u8 = 17;
const FXP_STATUS: u8 = 101;
const FXP_HANDLE: u8 = 102;
const FXP_DATA: u8 = 103;
const FXP_NAME: u8 = 104;
const FXP_ATTRS: u8 = 105;

const FX_OK: u32 = 0;
const FX_EOF: u32 = 1;
const FX_NO_SUCH_FILE: u32 = 2;
const FX_PERMISSION_DENIED: u32 = 3;
const FX_FAILURE: u32 = 4;
const FX_BAD_MESSAGE: u32 = 5;
const FX_OP_UNSUPPORTED: u32 = 8;

const ATTR_SIZE: u32 = 0x1;
const ATTR_PERMISSIONS: u32 = 0x4;
const ATTR_ACMODTIME: u32 = 0x8;

const PFLAG_WRITE: u32 = 0x2;
const PFLAG_APPEND: u32 = 0x4;
const PFLAG_CREAT: u32 = 0x8;
const PFLAG_TRUNC: u32 = 0x10;

/// File attributes as sent on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attrs {
    pub size: u64,
    pub permissions: u32,
    pub mtime: u32,
    pub is_dir: bool,
}

impl Attrs {
    fn from_metadata(md: &std::fs::Metadata) -> Self {
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        // Served read-only, whatever the file mode on disk is.
        let permissions = if md.is_dir() { 0o040555 } else { 0o100444 };
        Self {
            size: md.len(),
            permissions,
            mtime,
            is_dir: md.is_dir(),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(ATTR_SIZE | ATTR_PERMISSIONS | ATTR_ACMODTIME);
        out.put_u64(self.size);
        out.put_u32(self.permissions);
        out.put_u32(self.mtime);
        out.put_u32(self.mtime);
    }

    fn long_name(&self, name: &str) -> String {
        let mode = if self.is_dir { "dr-xr-xr-x" } else { "-r--r--r--" };
        let when = DateTime::<Utc>::from_timestamp(i64::from(self.mtime), 0)
            .map(|t| t.format("%b %d %H:%M").to_string())
            .unwrap_or_default();
        format!("{} 1 bbs bbs {:>10} {} {}", mode, self.size, when, name)
    }
}

enum OpenHandle {
    File { file: tokio::fs::File, path: PathBuf },
    Dir { entries: Vec<(String, Attrs)> },
}

/// Incremental packet reader.
struct Packet {
    kind: u8,
    body: bytes::Bytes,
}

fn next_packet(buf: &mut BytesMut) -> std::result::Result<Option<Packet>, BbsError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_PACKET {
        return Err(BbsError::Protocol(format!("bad sftp packet length {}", len)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let mut body = buf.split_to(len).freeze();
    let kind = body.get_u8();
    Ok(Some(Packet { kind, body }))
}

fn take_u32(b: &mut bytes::Bytes) -> Option<u32> {
    (b.remaining() >= 4).then(|| b.get_u32())
}

fn take_u64(b: &mut bytes::Bytes) -> Option<u64> {
    (b.remaining() >= 8).then(|| b.get_u64())
}

fn take_string(b: &mut bytes::Bytes) -> Option<bytes::Bytes> {
    let len = take_u32(b)? as usize;
    (b.remaining() >= len).then(|| b.split_to(len))
}

fn take_text(b: &mut bytes::Bytes) -> Option<String> {
    take_string(b).map(|s| String::from_utf8_lossy(&s).into_owned())
}

fn put_string(out: &mut BytesMut, s: &[u8]) {
    out.put_u32(s.len() as u32);
    out.put_slice(s);
}

fn frame(kind: u8, body: BytesMut) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u32(body.len() as u32 + 1);
    out.put_u8(kind);
    out.extend_from_slice(&body);
    out.to_vec()
}

fn status(id: u32, code: u32, msg: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(id);
    body.put_u32(code);
    put_string(&mut body, msg.as_bytes());
    put_string(&mut body, b"en");
    frame(FXP_STATUS, body)
}

fn io_status(id: u32, e: &std::io::Error) -> Vec<u8> {
    match e.kind() {
        std::io::ErrorKind::NotFound => status(id, FX_NO_SUCH_FILE, "no such file"),
        std::io::ErrorKind::PermissionDenied => {
            status(id, FX_PERMISSION_DENIED, "permission denied")
        }
        _ => status(id, FX_FAILURE, "failure"),
    }
}

/// Serves one SFTP client. State lives only as long as the connection.
pub struct SftpServer {
    root: PathBuf,
    max_read: u32,
}

struct Conn {
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpServer {
    pub fn new<P: Into<PathBuf>>(root: P, max_read: u32) -> Self {
        Self {
            root: root.into(),
            max_read: max_read.max(512),
        }
    }

    pub fn from_config(cfg: &SftpConfig) -> Self {
        Self::new(&cfg.root, cfg.max_read)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client path into the area. Symlinks that lead outside the root are
    /// treated as missing.
    fn locate(&self, requested: &str) -> Option<(PathBuf, String)> {
        let (path, virt) = resolve_area_path(&self.root, requested)?;
        let root = std::fs::canonicalize(&self.root).ok()?;
        match std::fs::canonicalize(&path) {
            Ok(real) if real.starts_with(&root) => Some((real, virt)),
            Ok(_) => None,
            // Missing paths still resolve so the caller can report NO_SUCH_FILE.
            Err(_) => Some((path, virt)),
        }
    }

    /// Answer one request packet. Returns the encoded reply.
    async fn handle(&self, conn: &mut Conn, pkt: Packet) -> Vec<u8> {
        let Packet { kind, mut body } = pkt;
        if kind == FXP_INIT {
            let mut out = BytesMut::new();
            out.put_u32(SFTP_VERSION);
            return frame(FXP_VERSION, out);
        }
        let Some(id) = take_u32(&mut body) else {
            return status(0, FX_BAD_MESSAGE, "truncated request");
        };
        match kind {
            FXP_REALPATH => match take_text(&mut body).and_then(|p| resolve_area_path(&self.root, &p)) {
                Some((_, virt)) => {
                    let attrs = Attrs {
                        is_dir: true,
                        permissions: 0o040555,
                        ..Attrs::default()
                    };
                    self.name_reply(id, &[(virt, attrs)], false)
                }
                None => status(id, FX_NO_SUCH_FILE, "outside file area"),
            },
            FXP_STAT | FXP_LSTAT => {
                let Some(path) = take_text(&mut body) else {
                    return status(id, FX_BAD_MESSAGE, "missing path");
                };
                let Some((fs_path, _)) = self.locate(&path) else {
                    return status(id, FX_NO_SUCH_FILE, "no such file");
                };
                match tokio::fs::metadata(&fs_path).await {
                    Ok(md) => attrs_reply(id, &Attrs::from_metadata(&md)),
                    Err(e) => io_status(id, &e),
                }
            }
            FXP_OPENDIR => {
                let Some(path) = take_text(&mut body) else {
                    return status(id, FX_BAD_MESSAGE, "missing path");
                };
                let Some((fs_path, _)) = self.locate(&path) else {
                    return status(id, FX_NO_SUCH_FILE, "no such directory");
                };
                match read_dir(&fs_path).await {
                    Ok(entries) => self.open_handle(id, conn, OpenHandle::Dir { entries }),
                    Err(e) => io_status(id, &e),
                }
            }
            FXP_READDIR => {
                let Some(h) = take_text(&mut body) else {
                    return status(id, FX_BAD_MESSAGE, "missing handle");
                };
                match conn.handles.get_mut(&h) {
                    Some(OpenHandle::Dir { entries }) => {
                        if entries.is_empty() {
                            return status(id, FX_EOF, "end of directory");
                        }
                        let n = entries.len().min(READDIR_BATCH);
                        let batch: Vec<(String, Attrs)> = entries.drain(..n).collect();
                        self.name_reply(id, &batch, true)
                    }
                    _ => status(id, FX_FAILURE, "invalid handle"),
                }
            }
            FXP_OPEN => {
                let (Some(path), Some(pflags)) = (take_text(&mut body), take_u32(&mut body)) else {
                    return status(id, FX_BAD_MESSAGE, "malformed open");
                };
                if pflags & (PFLAG_WRITE | PFLAG_APPEND | PFLAG_CREAT | PFLAG_TRUNC) != 0 {
                    return status(id, FX_PERMISSION_DENIED, "file area is read-only");
                }
                let Some((fs_path, virt)) = self.locate(&path) else {
                    return status(id, FX_NO_SUCH_FILE, "no such file");
                };
                match tokio::fs::File::open(&fs_path).await {
                    Ok(file) => {
                        debug!("sftp open {}", escape_log(&virt));
                        self.open_handle(id, conn, OpenHandle::File { file, path: fs_path })
                    }
                    Err(e) => io_status(id, &e),
                }
            }
            FXP_READ => {
                let (Some(h), Some(offset), Some(len)) =
                    (take_text(&mut body), take_u64(&mut body), take_u32(&mut body))
                else {
                    return status(id, FX_BAD_MESSAGE, "malformed read");
                };
                let Some(OpenHandle::File { file, .. }) = conn.handles.get_mut(&h) else {
                    return status(id, FX_FAILURE, "invalid handle");
                };
                let len = len.min(self.max_read) as usize;
                match read_at(file, offset, len).await {
                    Ok(data) if data.is_empty() => status(id, FX_EOF, "end of file"),
                    Ok(data) => {
                        let mut out = BytesMut::with_capacity(data.len() + 8);
                        out.put_u32(id);
                        put_string(&mut out, &data);
                        frame(FXP_DATA, out)
                    }
                    Err(e) => io_status(id, &e),
                }
            }
            FXP_FSTAT => {
                let Some(h) = take_text(&mut body) else {
                    return status(id, FX_BAD_MESSAGE, "missing handle");
                };
                match conn.handles.get(&h) {
                    Some(OpenHandle::File { path, .. }) => match tokio::fs::metadata(path).await {
                        Ok(md) => attrs_reply(id, &Attrs::from_metadata(&md)),
                        Err(e) => io_status(id, &e),
                    },
                    _ => status(id, FX_FAILURE, "invalid handle"),
                }
            }
            FXP_CLOSE => {
                let Some(h) = take_text(&mut body) else {
                    return status(id, FX_BAD_MESSAGE, "missing handle");
                };
                match conn.handles.remove(&h) {
                    Some(_) => status(id, FX_OK, "ok"),
                    None => status(id, FX_FAILURE, "invalid handle"),
                }
            }
            other => {
                debug!("sftp request type {} unsupported", other);
                status(id, FX_OP_UNSUPPORTED, "operation not supported")
            }
        }
    }

    fn open_handle(&self, id: u32, conn: &mut Conn, handle: OpenHandle) -> Vec<u8> {
        if conn.handles.len() >= MAX_HANDLES {
            return status(id, FX_FAILURE, "too many open handles");
        }
        conn.next_handle += 1;
        let name = conn.next_handle.to_string();
        conn.handles.insert(name.clone(), handle);
        let mut out = BytesMut::new();
        out.put_u32(id);
        put_string(&mut out, name.as_bytes());
        frame(FXP_HANDLE, out)
    }

    fn name_reply(&self, id: u32, names: &[(String, Attrs)], long: bool) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u32(id);
        out.put_u32(names.len() as u32);
        for (name, attrs) in names {
            put_string(&mut out, name.as_bytes());
            let long_name = if long { attrs.long_name(name) } else { name.clone() };
            put_string(&mut out, long_name.as_bytes());
            attrs.encode(&mut out);
        }
        frame(FXP_NAME, out)
    }

    /// Serve packets from `ctx` until the client goes away.
    pub async fn serve(&self, ctx: &mut SessionContext) -> Result<()> {
        let mut buf = BytesMut::new();
        let mut conn = Conn {
            handles: HashMap::new(),
            next_handle: 0,
        };
        while let Some(chunk) = ctx.io.read_bytes().await? {
            buf.extend_from_slice(&chunk);
            while let Some(pkt) = next_packet(&mut buf)? {
                let reply = self.handle(&mut conn, pkt).await;
                if !ctx.io.write_bytes(&reply) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn attrs_reply(id: u32, attrs: &Attrs) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u32(id);
    attrs.encode(&mut out);
    frame(FXP_ATTRS, out)
}

async fn read_dir(path: &Path) -> std::io::Result<Vec<(String, Attrs)>> {
    let mut rd = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let Ok(md) = entry.metadata().await else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, Attrs::from_metadata(&md)));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

async fn read_at(file: &mut tokio::fs::File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut data[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

#[async_trait]
impl SessionApp for SftpServer {
    async fn run(&self, ctx: &mut SessionContext) -> Result<()> {
        info!(
            "sftp session {} for {} serving {}",
            ctx.info.id,
            ctx.info.username.as_deref().unwrap_or("anonymous"),
            self.root.display()
        );
        let result = self.serve(ctx).await;
        if let Err(e) = &result {
            warn!("sftp session {} ended: {}", ctx.info.id, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: u8, id: u32, fill: impl FnOnce(&mut BytesMut)) -> Packet {
        let mut body = BytesMut::new();
        body.put_u32(id);
        fill(&mut body);
        Packet {
            kind,
            body: body.freeze(),
        }
    }

    fn parse(reply: &[u8]) -> (u8, bytes::Bytes) {
        let mut buf = BytesMut::from(reply);
        let pkt = next_packet(&mut buf).unwrap().unwrap();
        (pkt.kind, pkt.body)
    }

    fn area() -> (tempfile::TempDir, SftpServer, Conn) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/readme.txt"), b"hello sftp").unwrap();
        let server = SftpServer::new(tmp.path(), 4096);
        let conn = Conn {
            handles: HashMap::new(),
            next_handle: 0,
        };
        (tmp, server, conn)
    }

    #[tokio::test]
    async fn init_answers_version_3() {
        let (_tmp, server, mut conn) = area();
        let mut body = BytesMut::new();
        body.put_u32(3);
        let reply = server
            .handle(&mut conn, Packet { kind: FXP_INIT, body: body.freeze() })
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_VERSION);
        assert_eq!(body.get_u32(), 3);
    }

    #[tokio::test]
    async fn open_read_close_file() {
        let (_tmp, server, mut conn) = area();
        let reply = server
            .handle(
                &mut conn,
                request(FXP_OPEN, 1, |b| {
                    put_string(b, b"/docs/readme.txt");
                    b.put_u32(0x1);
                    b.put_u32(0);
                }),
            )
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_HANDLE);
        assert_eq!(body.get_u32(), 1);
        let handle = take_string(&mut body).unwrap();

        let reply = server
            .handle(
                &mut conn,
                request(FXP_READ, 2, |b| {
                    put_string(b, &handle);
                    b.put_u64(6);
                    b.put_u32(100);
                }),
            )
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_DATA);
        assert_eq!(body.get_u32(), 2);
        assert_eq!(&take_string(&mut body).unwrap()[..], b"sftp");

        let reply = server
            .handle(
                &mut conn,
                request(FXP_READ, 3, |b| {
                    put_string(b, &handle);
                    b.put_u64(100);
                    b.put_u32(100);
                }),
            )
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_STATUS);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_EOF);

        let reply = server
            .handle(&mut conn, request(FXP_CLOSE, 4, |b| put_string(b, &handle)))
            .await;
        let (_, mut body) = parse(&reply);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_OK);
    }

    #[tokio::test]
    async fn writes_are_refused() {
        let (_tmp, server, mut conn) = area();
        let reply = server
            .handle(
                &mut conn,
                request(FXP_OPEN, 9, |b| {
                    put_string(b, b"/new.txt");
                    b.put_u32(PFLAG_WRITE | PFLAG_CREAT);
                    b.put_u32(0);
                }),
            )
            .await;
        let (_, mut body) = parse(&reply);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_PERMISSION_DENIED);

        // REMOVE is not implemented at all.
        let reply = server
            .handle(&mut conn, request(13, 10, |b| put_string(b, b"/docs/readme.txt")))
            .await;
        let (_, mut body) = parse(&reply);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_OP_UNSUPPORTED);
    }

    #[tokio::test]
    async fn readdir_lists_then_eof() {
        let (_tmp, server, mut conn) = area();
        let reply = server
            .handle(&mut conn, request(FXP_OPENDIR, 1, |b| put_string(b, b"/docs")))
            .await;
        let (_, mut body) = parse(&reply);
        body.get_u32();
        let handle = take_string(&mut body).unwrap();

        let reply = server
            .handle(&mut conn, request(FXP_READDIR, 2, |b| put_string(b, &handle)))
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_NAME);
        body.get_u32();
        assert_eq!(body.get_u32(), 1);
        assert_eq!(&take_string(&mut body).unwrap()[..], b"readme.txt");

        let reply = server
            .handle(&mut conn, request(FXP_READDIR, 3, |b| put_string(b, &handle)))
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_STATUS);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_EOF);
    }

    #[tokio::test]
    async fn realpath_and_escape_attempts() {
        let (_tmp, server, mut conn) = area();
        let reply = server
            .handle(&mut conn, request(FXP_REALPATH, 1, |b| put_string(b, b".")))
            .await;
        let (kind, mut body) = parse(&reply);
        assert_eq!(kind, FXP_NAME);
        body.get_u32();
        body.get_u32();
        assert_eq!(&take_string(&mut body).unwrap()[..], b"/");

        let reply = server
            .handle(&mut conn, request(FXP_STAT, 2, |b| put_string(b, b"/../../etc/passwd")))
            .await;
        let (_, mut body) = parse(&reply);
        body.get_u32();
        assert_eq!(body.get_u32(), FX_NO_SUCH_FILE);
    }

    #[test]
    fn oversized_packet_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(next_packet(&mut buf), Err(BbsError::Protocol(_))));
    }
}
