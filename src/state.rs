//! Shared application state handed to every connection task and the stats API.

use crate::admission::{AdmissionPolicy, DiceRoll, LootStore};
use crate::config::ServeConfig;
use crate::error::DecoyResult;
use crate::mounter::Mounter;
use crate::profile::TracingRecorder;
use crate::sandbox::{IdentityPolicy, SandboxManager};
use crate::session::{AllowList, SessionRegistry};
use crate::shell::ShellEnv;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub shell: Arc<ShellEnv>,
    pub admission: Arc<dyn AdmissionPolicy>,
    pub loot: Arc<LootStore>,
    pub identity: IdentityPolicy,
    pub bucket_secs: u64,
}

impl AppState {
    pub fn new(config: &ServeConfig, mounter: Arc<dyn Mounter>) -> DecoyResult<Self> {
        let sandboxes = SandboxManager::new(config.base_dir.clone(), config.layers, mounter)?;
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(AllowList::new(config.trusted.iter().cloned())),
            Arc::new(sandboxes),
            config.max_session_age,
        ));
        let shell = Arc::new(ShellEnv {
            profile: config.profile.clone(),
            renderer: Arc::new(config.templates.clone()),
            recorder: Arc::new(TracingRecorder),
            stats: registry.stats().clone(),
            hostname: config.hostname.clone(),
            captures: config.captures_dir.clone(),
            rate: config.rate,
        });
        Ok(Self {
            registry,
            shell,
            admission: Arc::new(DiceRoll::new(config.admit_one_in)),
            loot: Arc::new(LootStore::default()),
            identity: config.identity,
            bucket_secs: config.bucket_secs,
        })
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        self.registry.sandboxes()
    }
}
