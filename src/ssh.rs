//! SSH front end on russh: password admission, pty/shell/exec channel
//! requests, and the host key.

use crate::error::{DecoyError, DecoyResult};
use crate::session::{Session, SessionKind};
use crate::shell::{acquire_sandbox, ShellEngine, MAX_LINE};
use crate::state::AppState;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Handle, Msg};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

/// Password attempts per connection.
pub const LOGIN_ATTEMPTS: usize = 3;

fn password_only() -> MethodSet {
    MethodSet::from([MethodKind::Password].as_slice())
}

/// russh server settings for the honeypot listener.
pub fn server_config(key: PrivateKey, version: &str, idle: Duration) -> russh::server::Config {
    russh::server::Config {
        server_id: russh::SshId::Standard(version.to_string()),
        methods: password_only(),
        inactivity_timeout: Some(idle),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        max_auth_attempts: LOGIN_ATTEMPTS,
        keys: vec![key],
        ..Default::default()
    }
}

/// Load the host key at `path`, or generate an Ed25519 key and store it
/// there (mode 0600) so the fingerprint survives restarts.
pub fn load_host_key(path: &Path) -> DecoyResult<PrivateKey> {
    if path.exists() {
        return russh::keys::load_secret_key(path, None)
            .map_err(|e| DecoyError::Config(format!("cannot load host key {}: {e}", path.display())));
    }

    warn!(path = ?path, "Host key not found, generating one");
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| DecoyError::Config(format!("cannot generate host key: {e}")))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| DecoyError::Config(format!("cannot encode host key: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded.as_bytes())?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(key)
}

/// What a channel was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelJob {
    Shell,
    Exec(String),
}

/// Per-connection russh handler. The registry session is created before
/// the handshake; this type only moves it through its transitions.
pub struct SshSession {
    state: AppState,
    session: Arc<Session>,
    authenticated: bool,
    channels: HashMap<ChannelId, Channel<Msg>>,
    terminals: HashSet<ChannelId>,
}

impl SshSession {
    pub fn new(state: AppState, session: Arc<Session>) -> Self {
        Self {
            state,
            session,
            authenticated: false,
            channels: HashMap::new(),
            terminals: HashSet::new(),
        }
    }

    /// Hand the channel to a shell task, mounting the sandbox first. Runs
    /// inside the handler so that several channels on one connection take
    /// a single sandbox reference between them.
    async fn start(
        &mut self,
        id: ChannelId,
        job: ChannelJob,
        session: &mut russh::server::Session,
    ) -> DecoyResult<()> {
        let Some(channel) = self.channels.remove(&id) else {
            let _ = session.channel_failure(id);
            return Ok(());
        };
        let kind = match job {
            ChannelJob::Shell => SessionKind::Shell,
            ChannelJob::Exec(_) => SessionKind::Exec,
        };
        self.session.set_kind(kind).activate();

        if let Err(e) = acquire_sandbox(
            self.state.sandboxes(),
            &self.session,
            self.state.identity,
            self.state.bucket_secs,
        )
        .await
        {
            warn!(session = %self.session.id(), error = %e, "Sandbox unavailable");
            let _ = session.channel_failure(id);
            let _ = session.close(id);
            self.session.request_close();
            return Ok(());
        }

        let _ = session.channel_success(id);
        let terminal = self.terminals.contains(&id);
        tokio::spawn(run_channel(
            self.state.clone(),
            self.session.clone(),
            channel,
            session.handle(),
            job,
            terminal,
        ));
        Ok(())
    }
}

impl russh::server::Handler for SshSession {
    type Error = DecoyError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.session.negotiate_user(user).set_password(password);
        let host = self.session.host().to_string();
        let loot = self.state.loot.lookup(&host, user, password);
        if self.state.admission.admit(&self.session, &loot) {
            self.state.loot.remember(&host, user, password);
            self.authenticated = true;
            info!(session = %self.session.id(), user, "Login accepted");
            return Ok(Auth::Accept);
        }
        info!(session = %self.session.id(), user, "Login rejected");
        Ok(Auth::Reject {
            proceed_with_methods: Some(password_only()),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut russh::server::Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }
        debug!(session = %self.session.id(), channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut russh::server::Session,
    ) -> Result<(), Self::Error> {
        self.session.set_term(term);
        self.terminals.insert(channel);
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut russh::server::Session,
    ) -> Result<(), Self::Error> {
        self.start(channel, ChannelJob::Shell, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut russh::server::Session,
    ) -> Result<(), Self::Error> {
        if data.len() > MAX_LINE {
            warn!(session = %self.session.id(), bytes = data.len(), "exec request too large");
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        let command = String::from_utf8_lossy(data).into_owned();
        debug!(session = %self.session.id(), command = %command, "exec request");
        self.start(channel, ChannelJob::Exec(command), session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut russh::server::Session,
    ) -> Result<(), Self::Error> {
        self.session.set_kind(SessionKind::Subsystem);
        info!(session = %self.session.id(), subsystem = name, "Subsystem refused");
        self.channels.remove(&channel);
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut russh::server::Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        self.terminals.remove(&channel);
        Ok(())
    }
}

/// Drive one shell or exec channel to completion, then report an exit
/// status and close it.
async fn run_channel(
    state: AppState,
    session: Arc<Session>,
    channel: Channel<Msg>,
    handle: Handle,
    job: ChannelJob,
    terminal: bool,
) {
    let id = channel.id();
    let (reader, writer) = tokio::io::split(channel.into_stream());
    let mut shell = ShellEngine::new(state.shell.clone(), session.clone(), BufReader::new(reader), writer)
        .with_terminal(terminal);

    let result = match &job {
        ChannelJob::Shell => shell.run_interactive().await,
        ChannelJob::Exec(command) => shell.run_exec(command).await,
    };
    let status = match result {
        Ok(()) => 0,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "Channel failed");
            1
        }
    };
    info!(session = %session.id(), commands = shell.executed(), status, "Channel finished");

    let _ = handle.exit_status_request(id, status).await;
    let _ = handle.close(id).await;
    if job == ChannelJob::Shell {
        // an interactive shell ending is the peer logging out
        session.request_close();
    }
}
