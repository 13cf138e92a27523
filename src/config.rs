//! Command line and the settings derived from it.

use crate::error::{DecoyError, DecoyResult};
use crate::profile::{DeceptionProfile, TemplateSet};
use crate::sandbox::{IdentityPolicy, LayerNaming};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "decoy")]
#[command(about = "SSH honeypot with per-attacker overlay sandboxes")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Accept attacker connections
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "2222")]
    pub port: u16,

    /// Port of the stats API (0 disables it)
    #[arg(long, default_value = "8080")]
    pub stats_port: u16,

    /// Holds `defaultfs/` and `sandboxes/`
    #[arg(long, default_value = "/var/lib/decoy")]
    pub base_dir: PathBuf,

    /// Upload captures (defaults to `<base-dir>/captures`)
    #[arg(long)]
    pub captures_dir: Option<PathBuf>,

    /// SSH host key, generated on first start (defaults to `<base-dir>/ssh_host_ed25519_key`)
    #[arg(long)]
    pub host_key: Option<PathBuf>,

    /// Identification string sent before key exchange
    #[arg(long, default_value = "SSH-2.0-OpenSSH_7.4")]
    pub ssh_version: String,

    /// Hostname shown in prompts
    #[arg(long, default_value = "web01")]
    pub hostname: String,

    /// Idle seconds before a session is expired
    #[arg(long, default_value = "3600")]
    pub max_session_age: u64,

    #[arg(long, default_value = "60")]
    pub session_sweep_interval: u64,

    #[arg(long, default_value = "30")]
    pub sandbox_sweep_interval: u64,

    /// Output rate for untrusted peers in bytes per second
    #[arg(long, default_value = "1024")]
    pub rate: u64,

    /// Output burst in bytes
    #[arg(long, default_value = "256")]
    pub burst: u64,

    /// Trusted peer address (repeatable)
    #[arg(long = "trusted")]
    pub trusted: Vec<String>,

    #[arg(long, value_enum, default_value_t = IdentityPolicy::PerSource)]
    pub identity: IdentityPolicy,

    /// Window length for `--identity time-bucket`
    #[arg(long, default_value = "3600")]
    pub bucket_secs: u64,

    /// JSON deception profile
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Directory of `<name>.tmpl` files
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Admit one login attempt in this many
    #[arg(long, default_value = "3")]
    pub admit_one_in: u64,

    #[arg(long, value_enum, default_value_t = LayerNaming::Shared)]
    pub layers: LayerNaming,
}

/// Validated settings for [`crate::server::run`].
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub port: u16,
    pub stats_port: Option<u16>,
    pub base_dir: PathBuf,
    pub captures_dir: PathBuf,
    pub host_key: PathBuf,
    pub ssh_version: String,
    pub hostname: String,
    pub max_session_age: Duration,
    pub session_sweep_interval: Duration,
    pub sandbox_sweep_interval: Duration,
    pub rate: Option<(u64, u64)>,
    pub trusted: Vec<String>,
    pub identity: IdentityPolicy,
    pub bucket_secs: u64,
    pub profile: DeceptionProfile,
    pub templates: TemplateSet,
    pub admit_one_in: u64,
    pub layers: LayerNaming,
}

impl ServeArgs {
    /// Load the profile and templates and check the numeric settings.
    pub fn into_config(self) -> DecoyResult<ServeConfig> {
        for (name, value) in [
            ("session-sweep-interval", self.session_sweep_interval),
            ("sandbox-sweep-interval", self.sandbox_sweep_interval),
            ("bucket-secs", self.bucket_secs),
            ("admit-one-in", self.admit_one_in),
        ] {
            if value == 0 {
                return Err(DecoyError::Config(format!("--{name} must be positive")));
            }
        }

        let profile = match &self.profile {
            Some(path) => DeceptionProfile::load(path)?,
            None => DeceptionProfile::default(),
        };
        let templates = match &self.templates {
            Some(dir) => TemplateSet::load_dir(dir)?,
            None => {
                warn!("No templates configured, using built-in responses");
                TemplateSet::default()
            }
        };
        if !self.ssh_version.starts_with("SSH-2.0-") {
            return Err(DecoyError::Config("--ssh-version must start with SSH-2.0-".into()));
        }
        let rate = (self.rate > 0).then_some((self.rate, self.burst.max(1)));

        Ok(ServeConfig {
            port: self.port,
            stats_port: (self.stats_port != 0).then_some(self.stats_port),
            captures_dir: self
                .captures_dir
                .unwrap_or_else(|| self.base_dir.join("captures")),
            host_key: self
                .host_key
                .unwrap_or_else(|| self.base_dir.join("ssh_host_ed25519_key")),
            ssh_version: self.ssh_version,
            base_dir: self.base_dir,
            hostname: self.hostname,
            max_session_age: Duration::from_secs(self.max_session_age),
            session_sweep_interval: Duration::from_secs(self.session_sweep_interval),
            sandbox_sweep_interval: Duration::from_secs(self.sandbox_sweep_interval),
            rate,
            trusted: self.trusted,
            identity: self.identity,
            bucket_secs: self.bucket_secs,
            profile,
            templates,
            admit_one_in: self.admit_one_in,
            layers: self.layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(argv: &[&str]) -> ServeArgs {
        let Commands::Serve(args) = Args::try_parse_from(argv).unwrap().command;
        args
    }

    #[test]
    fn defaults() {
        let config = parse(&["decoy", "serve"]).into_config().unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.stats_port, Some(8080));
        assert_eq!(config.captures_dir, PathBuf::from("/var/lib/decoy/captures"));
        assert_eq!(config.host_key, PathBuf::from("/var/lib/decoy/ssh_host_ed25519_key"));
        assert_eq!(config.ssh_version, "SSH-2.0-OpenSSH_7.4");
        assert_eq!(config.rate, Some((1024, 256)));
        assert_eq!(config.identity, IdentityPolicy::PerSource);
        assert_eq!(config.layers, LayerNaming::Shared);
        assert_eq!(config.profile.pacing_ms, 300);
    }

    #[test]
    fn flags_override() {
        let config = parse(&[
            "decoy", "serve", "--stats-port", "0", "--trusted", "10.0.0.1", "--trusted", "10.0.0.2",
            "--identity", "time-bucket", "--layers", "timestamped", "--rate", "0",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.stats_port, None);
        assert_eq!(config.trusted, ["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.identity, IdentityPolicy::TimeBucket);
        assert_eq!(config.layers, LayerNaming::Timestamped);
        assert_eq!(config.rate, None);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = parse(&["decoy", "serve", "--admit-one-in", "0"]).into_config().unwrap_err();
        assert!(matches!(err, DecoyError::Config(_)));
    }

    #[test]
    fn ssh_version_must_be_a_v2_banner() {
        let err = parse(&["decoy", "serve", "--ssh-version", "OpenSSH_7.4"]).into_config().unwrap_err();
        assert!(matches!(err, DecoyError::Config(_)));
        let config = parse(&["decoy", "serve", "--host-key", "/etc/decoy/key"]).into_config().unwrap();
        assert_eq!(config.host_key, PathBuf::from("/etc/decoy/key"));
    }

    #[test]
    fn profile_and_templates_load_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let profile = dir.path().join("profile.json");
        fs::write(&profile, r#"{"pacing_ms": 5, "banner": "Welcome"}"#).unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir(&templates).unwrap();
        fs::write(templates.join("uname.tmpl"), "Linux").unwrap();

        let config = parse(&[
            "decoy",
            "serve",
            "--profile",
            profile.to_str().unwrap(),
            "--templates",
            templates.to_str().unwrap(),
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.profile.pacing_ms, 5);
        assert_eq!(config.profile.banner, "Welcome");
        assert_eq!(config.templates.len(), 1);
    }

    #[test]
    fn malformed_profile_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let profile = dir.path().join("bad.json");
        fs::write(&profile, "{not json").unwrap();
        let err = parse(&["decoy", "serve", "--profile", profile.to_str().unwrap()])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, DecoyError::Config(_)));
    }
}
