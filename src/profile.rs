//! Deception profile and the collaborators the shell talks to: the
//! template renderer for canned output and the session recorder.

use crate::error::{DecoyError, DecoyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Canned response classes, checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    Simple,
    PermissionDenied,
    DiskError,
    CommandNotFound,
    FileNotFound,
    NotImplemented,
    Bullshit,
}

impl ResponseClass {
    pub const ALL: [ResponseClass; 7] = [
        ResponseClass::Simple,
        ResponseClass::PermissionDenied,
        ResponseClass::DiskError,
        ResponseClass::CommandNotFound,
        ResponseClass::FileNotFound,
        ResponseClass::NotImplemented,
        ResponseClass::Bullshit,
    ];

    /// Template used for this class. `Simple` renders the command's own template.
    pub fn template_name<'a>(&self, command: &'a str) -> &'a str {
        match self {
            ResponseClass::Simple => command,
            ResponseClass::PermissionDenied => "permission-denied",
            ResponseClass::DiskError => "disk-error",
            ResponseClass::CommandNotFound => "command-not-found",
            ResponseClass::FileNotFound => "file-not-found",
            ResponseClass::NotImplemented => "not-implemented",
            ResponseClass::Bullshit => "bullshit",
        }
    }

    /// Output used when no template is installed.
    pub fn fallback(&self, ctx: &RequestContext) -> String {
        let cmd = &ctx.command;
        match self {
            ResponseClass::Simple => String::new(),
            ResponseClass::PermissionDenied => format!("-bash: {cmd}: Permission denied"),
            ResponseClass::DiskError => format!("{cmd}: write error: No space left on device"),
            ResponseClass::CommandNotFound => format!("-bash: {cmd}: command not found"),
            ResponseClass::FileNotFound if ctx.args.is_empty() => {
                format!("-bash: {cmd}: No such file or directory")
            }
            ResponseClass::FileNotFound => format!("{cmd}: {}: No such file or directory", ctx.args),
            ResponseClass::NotImplemented => format!("{cmd}: Function not implemented"),
            ResponseClass::Bullshit => "Segmentation fault (core dumped)".to_string(),
        }
    }
}

/// Operator-tunable behaviour of the fake shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeceptionProfile {
    /// Lines that end the session after a near-empty reply.
    pub exit_patterns: Vec<String>,
    pub simple: Vec<String>,
    pub permission_denied: Vec<String>,
    pub disk_error: Vec<String>,
    pub command_not_found: Vec<String>,
    pub file_not_found: Vec<String>,
    pub not_implemented: Vec<String>,
    pub bullshit: Vec<String>,
    /// Delay before the acknowledgement line of fast commands like `cd` and `rm`.
    pub pacing_ms: u64,
    /// Shown after a successful login.
    pub banner: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for DeceptionProfile {
    fn default() -> Self {
        Self {
            exit_patterns: strings(&["cat /proc/cpuinfo | grep name | wc -l", "echo -e \"\\x6F\\x6B\""]),
            simple: strings(&["uname", "id", "w", "uptime", "free", "nproc", "lscpu", "ifconfig"]),
            permission_denied: strings(&["sudo", "su", "chattr", "iptables", "passwd", "useradd", "crontab"]),
            disk_error: strings(&["wget", "curl", "tftp", "dd"]),
            command_not_found: strings(&["python", "python3", "perl", "gcc", "nc", "busybox"]),
            file_not_found: strings(&["./", "sh ", "bash "]),
            not_implemented: strings(&["systemctl", "service"]),
            bullshit: strings(&["kill", "pkill", "killall"]),
            pacing_ms: 300,
            banner: String::new(),
        }
    }
}

/// `line` starts with `prefix` and the match ends on a word boundary.
pub fn matches_prefix(line: &str, prefix: &str) -> bool {
    if prefix.is_empty() || !line.starts_with(prefix) {
        return false;
    }
    let open_ended = prefix.ends_with(|c: char| !c.is_ascii_alphanumeric());
    match line[prefix.len()..].chars().next() {
        None => true,
        Some(next) => open_ended || next.is_whitespace() || matches!(next, ';' | '|' | '&'),
    }
}

impl DeceptionProfile {
    pub fn load(path: &Path) -> DecoyResult<Self> {
        let raw = fs::read_to_string(path)?;
        let profile = serde_json::from_str(&raw)
            .map_err(|e| DecoyError::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = ?path, "Loaded deception profile");
        Ok(profile)
    }

    pub fn is_exit(&self, line: &str) -> bool {
        self.exit_patterns.iter().any(|p| matches_prefix(line, p))
    }

    fn table(&self, class: ResponseClass) -> &[String] {
        match class {
            ResponseClass::Simple => &self.simple,
            ResponseClass::PermissionDenied => &self.permission_denied,
            ResponseClass::DiskError => &self.disk_error,
            ResponseClass::CommandNotFound => &self.command_not_found,
            ResponseClass::FileNotFound => &self.file_not_found,
            ResponseClass::NotImplemented => &self.not_implemented,
            ResponseClass::Bullshit => &self.bullshit,
        }
    }

    /// First canned class whose table has a prefix matching `line`.
    pub fn classify(&self, line: &str) -> Option<ResponseClass> {
        ResponseClass::ALL
            .into_iter()
            .find(|class| self.table(*class).iter().any(|p| matches_prefix(line, p)))
    }
}

/// Everything a template may refer to. Closed on purpose; bump
/// [`RequestContext::VERSION`] when adding fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub user: String,
    pub ip: String,
    pub command: String,
    pub args: String,
    pub hostname: String,
    pub cwd: String,
}

impl RequestContext {
    pub const VERSION: u32 = 1;

    fn lookup(&self, key: &str) -> Option<&str> {
        Some(match key {
            "user" => &self.user,
            "ip" => &self.ip,
            "command" => &self.command,
            "args" => &self.args,
            "hostname" => &self.hostname,
            "cwd" => &self.cwd,
            _ => return None,
        })
    }
}

/// Renders canned command output.
pub trait Renderer: Send + Sync {
    /// `None` when no template named `name` exists.
    fn render(&self, name: &str, ctx: &RequestContext) -> Option<String>;
}

/// Plain-text templates with `{{field}}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, String>,
}

impl TemplateSet {
    /// Load every `<name>.tmpl` file in `dir`.
    pub fn load_dir(dir: &Path) -> DecoyResult<Self> {
        let mut set = Self::default();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tmpl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let body = fs::read_to_string(&path)?;
            set.insert(name, body.trim_end_matches('\n'));
        }
        info!(dir = ?dir, count = set.templates.len(), "Loaded templates");
        Ok(set)
    }

    pub fn insert(&mut self, name: &str, body: &str) {
        self.templates.insert(name.to_string(), body.to_string());
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Renderer for TemplateSet {
    fn render(&self, name: &str, ctx: &RequestContext) -> Option<String> {
        let body = self.templates.get(name)?;
        let mut out = String::with_capacity(body.len());
        let mut rest = body.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    match ctx.lookup(key) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&rest[start..start + end + 4]),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        debug!(template = name, "Rendered template");
        Some(out)
    }
}

/// Sink for the session recording.
pub trait Recorder: Send + Sync {
    fn record_input(&self, session: &str, line: &str);
    fn record_output(&self, session: &str, text: &str);
}

/// Emits recording events as tracing events on the `decoy::record` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl Recorder for TracingRecorder {
    fn record_input(&self, session: &str, line: &str) {
        info!(target: "decoy::record", session, line, "input");
    }

    fn record_output(&self, session: &str, text: &str) {
        debug!(target: "decoy::record", session, bytes = text.len(), "output");
    }
}
