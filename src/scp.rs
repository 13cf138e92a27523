//! Sink side of the scp-over-shell protocol (`scp -t`).
//!
//! Frames are `<type><fields>\n` with type one of `C` (file), `D` (enter
//! directory), `E` (leave directory) or `T` (timestamps). Every frame, and
//! every file payload, is answered with a single `0x00`.

use crate::error::{DecoyError, DecoyResult};
use crate::sandbox::SandboxMount;
use crate::shell::{resolve_path, MAX_LINE};
use crate::throttle::ThrottledWriter;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite};
use tracing::{debug, info};

const ACK: [u8; 1] = [0];
const CAPTURE_DIR: &str = "scp-uploads";
/// Largest single payload accepted.
pub const MAX_UPLOAD: u64 = 64 * 1024 * 1024;

/// A file received during one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Sandbox path the file was written to.
    pub path: String,
    pub mode: u32,
    pub declared: u64,
    pub received: u64,
    /// Host path of the read-only capture copy, if one was written.
    pub capture: Option<PathBuf>,
}

pub struct ScpSink<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut ThrottledWriter<W>,
    mount: Option<&'a SandboxMount>,
    captures: &'a Path,
    base: String,
    rename: Option<String>,
    dirs: Vec<String>,
    uploads: Vec<Upload>,
}

impl<'a, R, W> ScpSink<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `base` is the sandbox directory files land in. `rename` overrides the
    /// name of the first top-level file or directory
    /// (`scp file host:/tmp/other-name`).
    pub fn new(
        reader: &'a mut R,
        writer: &'a mut ThrottledWriter<W>,
        mount: Option<&'a SandboxMount>,
        captures: &'a Path,
        base: String,
        rename: Option<String>,
    ) -> Self {
        Self {
            reader,
            writer,
            mount,
            captures,
            base,
            rename,
            dirs: Vec::new(),
            uploads: Vec::new(),
        }
    }

    /// Announce readiness and consume frames until the peer hangs up.
    /// An error abandons the transfer; files already written stay in the
    /// sandbox and in the capture directory.
    pub async fn run(mut self) -> DecoyResult<Vec<Upload>> {
        self.ack().await?;
        loop {
            let mut kind = [0u8; 1];
            match self.reader.read(&mut kind).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            match kind[0] {
                b'C' => self.single_file().await?,
                b'D' => self.enter_dir().await?,
                b'E' => {
                    self.read_line().await?;
                    self.dirs.pop();
                    self.ack().await?;
                }
                b'T' => {
                    self.read_line().await?;
                    self.ack().await?;
                }
                // status byte after a payload, stray line endings
                0 | b'\n' | b'\r' => {}
                other => {
                    return Err(DecoyError::ProtocolDecode(format!(
                        "unexpected message type {other:#04x}"
                    )))
                }
            }
        }
        Ok(self.uploads)
    }

    async fn ack(&mut self) -> DecoyResult<()> {
        self.writer.write_all(&ACK).await?;
        Ok(())
    }

    fn current_dir(&self) -> String {
        self.dirs
            .iter()
            .fold(self.base.clone(), |dir, name| resolve_path(&dir, name))
    }

    /// Read a field up to `delim`. Fields longer than [`MAX_LINE`] abort.
    async fn read_until(&mut self, delim: u8) -> DecoyResult<String> {
        let mut buf = Vec::new();
        (&mut *self.reader)
            .take(MAX_LINE as u64)
            .read_until(delim, &mut buf)
            .await?;
        if buf.pop() != Some(delim) {
            if buf.len() + 1 >= MAX_LINE {
                return Err(DecoyError::ProtocolDecode("frame too long".into()));
            }
            return Err(DecoyError::ProtocolDecode("truncated frame".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn read_line(&mut self) -> DecoyResult<String> {
        let line = self.read_until(b'\n').await?;
        Ok(line.trim_end_matches('\r').to_string())
    }

    /// `<mode> <length> <name>\n`
    async fn header(&mut self) -> DecoyResult<(u32, u64, String)> {
        let mode = self.read_until(b' ').await?;
        let mode = u32::from_str_radix(mode.trim(), 8)
            .map_err(|_| DecoyError::ProtocolDecode(format!("bad mode {mode:?}")))?;
        let length = self.read_until(b' ').await?;
        let length = length
            .trim()
            .parse::<u64>()
            .map_err(|_| DecoyError::ProtocolDecode(format!("bad length {length:?}")))?;
        let name = unquote(&self.read_line().await?).to_string();
        if name.is_empty() {
            return Err(DecoyError::ProtocolDecode("empty name".into()));
        }
        Ok((mode, length, name))
    }

    async fn single_file(&mut self) -> DecoyResult<()> {
        let (mode, declared, name) = self.header().await?;
        if declared > MAX_UPLOAD {
            return Err(DecoyError::ProtocolDecode(format!("payload too large: {declared}")));
        }
        let name = self.top_level_name(name);
        self.ack().await?;

        let mut data = Vec::with_capacity(declared.min(64 * 1024) as usize);
        (&mut *self.reader).take(declared).read_to_end(&mut data).await?;

        let path = resolve_path(&self.current_dir(), &name);
        let mount = self
            .mount
            .ok_or_else(|| DecoyError::Unmounted(path.clone()))?;
        mount.write(&path, &data, mode)?;
        let capture = persist_capture(self.captures, &path, &data)?;
        debug!(path = %path, bytes = data.len(), "Received scp payload");

        self.uploads.push(Upload {
            path,
            mode,
            declared,
            received: data.len() as u64,
            capture,
        });
        self.ack().await
    }

    /// The first top-level file or directory takes the target's name when the
    /// target did not exist (`scp -r dir host:/tmp/new-name`).
    fn top_level_name(&mut self, name: String) -> String {
        if !self.dirs.is_empty() {
            return name;
        }
        self.rename.take().unwrap_or(name)
    }

    async fn enter_dir(&mut self) -> DecoyResult<()> {
        let (mode, _length, name) = self.header().await?;
        let name = self.top_level_name(name);
        self.dirs.push(name);
        let path = self.current_dir();
        let mount = self
            .mount
            .ok_or_else(|| DecoyError::Unmounted(path.clone()))?;
        mount.make_dir_all(&path, mode)?;
        self.ack().await
    }
}

fn unquote(name: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = name.strip_prefix(quote).and_then(|n| n.strip_suffix(quote)) {
            return inner;
        }
    }
    name
}

/// Keep a read-only copy of `data` under `<captures>/scp-uploads/<path>`.
/// The first upload to a given path wins.
pub fn persist_capture(captures: &Path, path: &str, data: &[u8]) -> DecoyResult<Option<PathBuf>> {
    let mut dest = captures.join(CAPTURE_DIR);
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => dest.push(segment),
            Component::RootDir | Component::CurDir => {}
            _ => return Err(DecoyError::PathEscape(path.to_string())),
        }
    }
    if dest.exists() {
        return Ok(None);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&dest, data)?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o400))?;
    info!(path = %path, capture = ?dest, bytes = data.len(), "Captured upload");
    Ok(Some(dest))
}
