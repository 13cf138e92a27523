//! Per-session command interpreter backed by the session's sandbox.

use crate::error::{DecoyError, DecoyResult};
use crate::profile::{DeceptionProfile, Recorder, Renderer, RequestContext, ResponseClass};
use crate::sandbox::{Access, IdentityPolicy, SandboxIdentity, SandboxManager, SandboxMount};
use crate::scp::ScpSink;
use crate::session::{Session, Stats};
use crate::throttle::{ThrottledWriter, TokenBucket};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

/// Longest input line accepted from a peer, terminator included.
pub const MAX_LINE: usize = 4096;

/// Collaborators and settings shared by every shell in the process.
pub struct ShellEnv {
    pub profile: DeceptionProfile,
    pub renderer: Arc<dyn Renderer>,
    pub recorder: Arc<dyn Recorder>,
    pub stats: Arc<Stats>,
    pub hostname: String,
    /// Root of the upload capture tree.
    pub captures: PathBuf,
    /// `(bytes per second, burst)` for untrusted peers; `None` disables throttling.
    pub rate: Option<(u64, u64)>,
}

/// Resolve `path` against the virtual working directory `cwd`. `..` stops
/// at the root the way a real shell does.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = if path.starts_with('/') {
        Vec::new()
    } else {
        cwd.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn home_dir(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}

/// Split a line into commands on unquoted `;`, `&&` and `||`.
fn split_commands(line: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';') => commands.push(std::mem::take(&mut current)),
            (None, '&' | '|') if chars.peek() == Some(&c) => {
                chars.next();
                commands.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    commands.push(current);
    commands
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Whitespace tokenizer honouring single/double quotes and backslashes.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_token = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Look up (or register) the sandbox for `session` and mount it. The mount
/// is attached to the session before mounting so that teardown releases it
/// even when mounting fails. A session that already holds a sandbox keeps
/// it and takes no further reference.
pub async fn acquire_sandbox(
    manager: &SandboxManager,
    session: &Session,
    policy: IdentityPolicy,
    bucket_secs: u64,
) -> DecoyResult<Arc<SandboxMount>> {
    let mount = match session.sandbox() {
        Some(mount) => mount,
        None => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let identity = SandboxIdentity::for_peer(policy, session.host(), now, bucket_secs)?;
            let mount = manager.get_or_create(&identity).await;
            session.attach_sandbox(mount.clone());
            mount
        }
    };

    let mounting = mount.clone();
    tokio::task::spawn_blocking(move || mounting.mount())
        .await
        .map_err(|e| DecoyError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
    Ok(mount)
}

/// Line-oriented command channel with raw byte access for scp.
///
/// In terminal mode (a pty was requested) the peer sends raw keystrokes:
/// input is echoed, `\r` ends a line, backspace edits it, and output
/// newlines go out as `\r\n`.
pub struct Transport<R, W> {
    reader: R,
    writer: ThrottledWriter<W>,
    terminal: bool,
    skip_lf: bool,
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: ThrottledWriter<W>) -> Self {
        Self {
            reader,
            writer,
            terminal: false,
            skip_lf: false,
        }
    }

    pub fn set_terminal(&mut self, terminal: bool) {
        self.terminal = terminal;
    }

    /// Next line without its terminator; `None` at end of stream. A line
    /// longer than [`MAX_LINE`] is an `InvalidData` error.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        if self.terminal {
            return self.read_terminal_line().await;
        }
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if buf.len() >= MAX_LINE && buf.last() != Some(&b'\n') {
            return Err(too_long());
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn read_terminal_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        let mut escape = false;
        loop {
            let mut byte = [0u8; 1];
            if self.reader.read(&mut byte).await? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            let skip_lf = std::mem::take(&mut self.skip_lf);
            match byte[0] {
                // arrow keys and friends: ESC [ ... final byte
                _ if escape => escape = !(byte[0].is_ascii_alphabetic() || byte[0] == b'~'),
                0x1b => escape = true,
                b'\n' if skip_lf => {}
                b'\r' | b'\n' => {
                    self.skip_lf = byte[0] == b'\r';
                    self.writer.write_all(b"\r\n").await?;
                    break;
                }
                0x7f | 0x08 => {
                    if line.pop().is_some() {
                        self.writer.write_all(b"\x08 \x08").await?;
                    }
                }
                0x03 => {
                    self.writer.write_all(b"^C\r\n").await?;
                    line.clear();
                    break;
                }
                0x04 if line.is_empty() => return Ok(None),
                b if b < 0x20 => {}
                b => {
                    if line.len() + 1 >= MAX_LINE {
                        return Err(too_long());
                    }
                    line.push(b);
                    self.writer.write_all(&byte).await?;
                }
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        if self.terminal && text.contains('\n') {
            let text = text.replace("\r\n", "\n").replace('\n', "\r\n");
            return self.writer.write_all(text.as_bytes()).await;
        }
        self.writer.write_all(text.as_bytes()).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer.into_inner())
    }
}

fn too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "input line too long")
}

/// Interprets attacker input against one sandbox.
pub struct ShellEngine<R, W> {
    transport: Transport<R, W>,
    env: Arc<ShellEnv>,
    session: Arc<Session>,
    mount: Option<Arc<SandboxMount>>,
    user: String,
    home: String,
    cwd: String,
    prompt: String,
    executed: u64,
    history: Vec<String>,
}

impl<R, W> ShellEngine<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Attach a shell to `session`. Output is throttled unless the peer is whitelisted.
    pub fn new(env: Arc<ShellEnv>, session: Arc<Session>, reader: R, writer: W) -> Self {
        let bucket = match env.rate {
            Some((rate, burst)) if !session.whitelisted() => Some(TokenBucket::new(rate, burst)),
            _ => None,
        };
        let user = session.user().unwrap_or_else(|| "root".to_string());
        let home = home_dir(&user);
        let mount = session.sandbox();
        let writer = ThrottledWriter::new(writer, bucket);
        debug!(session = %session.id(), throttled = writer.is_throttled(), "Shell attached");
        let mut engine = Self {
            transport: Transport::new(reader, writer),
            env,
            session,
            mount,
            cwd: home.clone(),
            home,
            user,
            prompt: String::new(),
            executed: 0,
            history: Vec::new(),
        };
        engine.update_prompt();
        engine
    }

    /// Switch the transport to terminal mode for pty channels.
    pub fn with_terminal(mut self, terminal: bool) -> Self {
        self.transport.set_terminal(terminal);
        self
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn into_transport(self) -> Transport<R, W> {
        self.transport
    }

    fn update_prompt(&mut self) {
        let segment = if self.cwd == self.home {
            "~"
        } else {
            self.cwd.rsplit('/').find(|s| !s.is_empty()).unwrap_or("/")
        };
        let sigil = if self.user == "root" { '#' } else { '$' };
        self.prompt = format!("[{}@{} {}]{} ", self.user, self.env.hostname, segment, sigil);
    }

    /// Prompt, read, dispatch until the peer leaves, an exit command runs,
    /// or the registry asks the session to close.
    pub async fn run_interactive(&mut self) -> DecoyResult<()> {
        if !self.env.profile.banner.is_empty() {
            let banner = self.env.profile.banner.clone();
            self.respond(&banner).await?;
        }
        loop {
            let prompt = self.prompt.clone();
            self.transport.write_str(&prompt).await?;
            let session = self.session.clone();
            let line = tokio::select! {
                line = self.transport.read_line() => line?,
                _ = session.close_requested() => {
                    debug!(session = %session.id(), "Close requested");
                    break;
                }
            };
            let Some(line) = line else { break };
            if self.dispatch(&line).await? {
                break;
            }
        }
        self.transport.close().await?;
        Ok(())
    }

    /// Run a pre-supplied command string line by line, then close.
    pub async fn run_exec(&mut self, command: &str) -> DecoyResult<()> {
        for line in command.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if self.dispatch(line).await? {
                break;
            }
        }
        self.transport.close().await?;
        Ok(())
    }

    /// Handle one input line. Returns true when the session should end.
    pub async fn dispatch(&mut self, line: &str) -> DecoyResult<bool> {
        let line = line.trim();
        self.env.recorder.record_input(self.session.id(), line);
        self.session.update_activity();
        if line.is_empty() {
            return Ok(false);
        }
        self.executed += 1;
        self.history.push(line.to_string());
        debug!(session = %self.session.id(), line, "Dispatch");

        if self.env.profile.is_exit(line) {
            self.respond("").await?;
            return Ok(true);
        }
        for command in split_commands(line) {
            if self.run_command(&command).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn run_command(&mut self, command: &str) -> DecoyResult<bool> {
        let tokens = tokenize(command);
        let Some((name, args)) = tokens.split_first() else {
            return Ok(false);
        };
        let ctx = self.context(name, args);

        if let Some(class) = self.env.profile.classify(command) {
            let text = self
                .env
                .renderer
                .render(class.template_name(name), &ctx)
                .unwrap_or_else(|| class.fallback(&ctx));
            self.respond(&text).await?;
            return Ok(false);
        }

        match name.as_str() {
            "cd" => self.cd(args).await?,
            "ls" | "dir" => self.ls(args).await?,
            "pwd" => {
                let cwd = self.cwd.clone();
                self.respond(&cwd).await?;
            }
            "cat" => self.cat(args).await?,
            "touch" => self.touch(args).await?,
            "rm" => self.rm(args).await?,
            "mkdir" => self.mkdir(args).await?,
            "scp" => {
                if self.scp(args).await? {
                    return Ok(true);
                }
            }
            "echo" => self.respond(&args.join(" ")).await?,
            "whoami" => {
                let user = self.user.clone();
                self.respond(&user).await?;
            }
            "hostname" => {
                let hostname = self.env.hostname.clone();
                self.respond(&hostname).await?;
            }
            "history" => {
                let listing = self
                    .history
                    .iter()
                    .enumerate()
                    .map(|(i, l)| format!("{:>5}  {}", i + 1, l))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.respond(&listing).await?;
            }
            "exit" | "logout" => return Ok(true),
            _ => {
                let text = self
                    .env
                    .renderer
                    .render(name, &ctx)
                    .or_else(|| {
                        let class = ResponseClass::CommandNotFound;
                        self.env.renderer.render(class.template_name(name), &ctx)
                    })
                    .unwrap_or_else(|| ResponseClass::CommandNotFound.fallback(&ctx));
                self.respond(&text).await?;
            }
        }
        Ok(false)
    }

    fn context(&self, name: &str, args: &[String]) -> RequestContext {
        RequestContext {
            user: self.user.clone(),
            ip: self.session.host().to_string(),
            command: name.to_string(),
            args: args.join(" "),
            hostname: self.env.hostname.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// Write `text` as one line, recording it.
    async fn respond(&mut self, text: &str) -> DecoyResult<()> {
        self.env.recorder.record_output(self.session.id(), text);
        let mut out = String::with_capacity(text.len() + 1);
        out.push_str(text);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        self.transport.write_str(&out).await?;
        self.session.update_activity();
        Ok(())
    }

    /// Slow, near-empty acknowledgement for commands that would otherwise
    /// return suspiciously fast.
    async fn pace(&mut self) -> DecoyResult<()> {
        if self.env.profile.pacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.env.profile.pacing_ms)).await;
        }
        self.respond("").await
    }

    fn expand(&self, arg: &str) -> String {
        let arg = if arg == "~" {
            self.home.clone()
        } else if let Some(rest) = arg.strip_prefix("~/") {
            format!("{}/{}", self.home, rest)
        } else {
            arg.to_string()
        };
        resolve_path(&self.cwd, &arg)
    }

    fn operands(args: &[String]) -> (String, Vec<&String>) {
        let flags = args
            .iter()
            .filter(|a| a.starts_with('-') && a.len() > 1)
            .flat_map(|a| a.trim_start_matches('-').chars())
            .collect();
        let operands = args.iter().filter(|a| !a.starts_with('-') || a.len() == 1).collect();
        (flags, operands)
    }

    async fn cd(&mut self, args: &[String]) -> DecoyResult<()> {
        let arg = args.first().map(String::as_str).unwrap_or("~");
        let target = self.expand(arg);
        let exists = self.mount.as_ref().is_some_and(|m| m.is_dir(&target));
        if !exists {
            return self.respond(&format!("cd: {arg}: no such file or directory")).await;
        }
        self.cwd = target;
        self.update_prompt();
        self.pace().await
    }

    async fn ls(&mut self, args: &[String]) -> DecoyResult<()> {
        let (_, operands) = Self::operands(args);
        let arg = operands.first().map(|s| s.as_str()).unwrap_or(".");
        let target = self.expand(arg);
        let Some(mount) = self.mount.clone() else {
            return self.respond(&format!("ls: cannot access '{arg}': No such file or directory")).await;
        };
        if !mount.is_dir(&target) {
            if mount.exists(&target) {
                return self.respond(arg).await;
            }
            return self.respond(&format!("ls: cannot access '{arg}': No such file or directory")).await;
        }
        match mount.read_dir(&target) {
            Ok(entries) if entries.is_empty() => Ok(()),
            Ok(entries) => self.respond(&entries.join(" ")).await,
            Err(e) => self.respond(&format!("ls: cannot open directory '{arg}': {}", e.shell_message())).await,
        }
    }

    async fn cat(&mut self, args: &[String]) -> DecoyResult<()> {
        let (_, operands) = Self::operands(args);
        if operands.is_empty() {
            return self.respond("cat: missing operand").await;
        }
        for arg in operands {
            let target = self.expand(arg);
            let result = match &self.mount {
                Some(mount) => mount.read(&target),
                None => Err(DecoyError::NotFound(target.clone())),
            };
            match result {
                Ok(data) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    self.respond(&text).await?;
                }
                Err(e) => self.respond(&format!("cat: {arg}: {}", e.shell_message())).await?,
            }
        }
        Ok(())
    }

    async fn touch(&mut self, args: &[String]) -> DecoyResult<()> {
        let (_, operands) = Self::operands(args);
        if operands.is_empty() {
            return self.respond("touch: missing file operand").await;
        }
        for arg in operands {
            let target = self.expand(arg);
            let result = match &self.mount {
                Some(mount) => mount.open(&target, Access::Touch).map(drop),
                None => Err(DecoyError::NotFound(target.clone())),
            };
            if let Err(e) = result {
                self.respond(&format!("touch: cannot touch '{arg}': {}", e.shell_message()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn rm(&mut self, args: &[String]) -> DecoyResult<()> {
        let (flags, operands) = Self::operands(args);
        if operands.is_empty() {
            return self
                .respond("rm: missing operand\nTry 'rm --help' for more information.")
                .await;
        }
        let recursive = flags.contains('r') || flags.contains('R');
        for arg in operands {
            let target = self.expand(arg);
            let result = match &self.mount {
                Some(mount) => mount.remove(&target, recursive),
                None => Err(DecoyError::NotFound(target.clone())),
            };
            if let Err(e) = result {
                return self
                    .respond(&format!("rm: cannot remove '{arg}': {}", e.shell_message()))
                    .await;
            }
        }
        self.pace().await
    }

    async fn mkdir(&mut self, args: &[String]) -> DecoyResult<()> {
        let (flags, operands) = Self::operands(args);
        if operands.is_empty() {
            return self.respond("mkdir: missing operand").await;
        }
        let parents = flags.contains('p');
        for arg in operands {
            let target = self.expand(arg);
            let result = match &self.mount {
                Some(mount) if parents => mount.make_dir_all(&target, 0o755),
                Some(mount) => mount.make_dir(&target, 0o755),
                None => Err(DecoyError::NotFound(target.clone())),
            };
            if let Err(e) = result {
                self.respond(&format!("mkdir: cannot create directory '{arg}': {}", e.shell_message()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Run `scp -t`. Returns true when the session has to end: the stream
    /// is mid-transfer after a protocol error, so nothing that follows can be
    /// read as commands, and a close request interrupts a stalled upload.
    async fn scp(&mut self, args: &[String]) -> DecoyResult<bool> {
        let (flags, operands) = Self::operands(args);
        if !flags.contains('t') {
            self.respond("usage: scp [-346BCpqrTv] [-c cipher] [-F ssh_config] [-i identity_file] source ... target")
                .await?;
            return Ok(false);
        }
        let target = self.expand(operands.last().map(|s| s.as_str()).unwrap_or("."));
        let (base, rename) = match &self.mount {
            Some(mount) if !mount.is_dir(&target) => {
                let parent = resolve_path(&target, "..");
                let name = target.rsplit('/').next().map(str::to_string);
                (parent, name.filter(|n| !n.is_empty()))
            }
            _ => (target, None),
        };

        let mount = self.mount.clone();
        let captures = self.env.captures.clone();
        let session = self.session.clone();
        let sink = ScpSink::new(
            &mut self.transport.reader,
            &mut self.transport.writer,
            mount.as_deref(),
            &captures,
            base,
            rename,
        );
        let outcome = tokio::select! {
            outcome = sink.run() => outcome,
            _ = session.close_requested() => {
                debug!(session = %session.id(), "Close requested during scp");
                return Ok(true);
            }
        };
        self.session.update_activity();
        match outcome {
            Ok(uploads) => {
                for upload in uploads {
                    self.env.stats.record_upload();
                    info!(
                        session = %self.session.id(),
                        path = %upload.path,
                        bytes = upload.received,
                        mode = format!("{:o}", upload.mode),
                        "File uploaded"
                    );
                }
                Ok(false)
            }
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "scp transfer aborted");
                Ok(true)
            }
        }
    }
}
