//! Which authenticated peers are let into a shell.

use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Prior knowledge about a credential pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LootLookup {
    /// The pair has been admitted before.
    pub known_credential: bool,
    /// The peer itself has been admitted before.
    pub previously_admitted: bool,
}

pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, session: &Session, loot: &LootLookup) -> bool;
}

/// Admit roughly one attempt in `one_in`, keyed on wall-clock seconds.
/// Known credentials, returning peers and whitelisted peers always get in.
#[derive(Debug, Clone)]
pub struct DiceRoll {
    one_in: u64,
}

impl DiceRoll {
    pub fn new(one_in: u64) -> Self {
        Self { one_in: one_in.max(1) }
    }

    pub fn admit_at(&self, session: &Session, loot: &LootLookup, now_unix: u64) -> bool {
        if session.whitelisted() || loot.known_credential || loot.previously_admitted {
            return true;
        }
        let admitted = now_unix % self.one_in == 0;
        debug!(session = %session.id(), admitted, "Admission roll");
        admitted
    }
}

impl AdmissionPolicy for DiceRoll {
    fn admit(&self, session: &Session, loot: &LootLookup) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.admit_at(session, loot, now)
    }
}

/// In-memory record of admitted credentials and hosts.
#[derive(Debug, Default)]
pub struct LootStore {
    credentials: Mutex<HashSet<(String, String)>>,
    hosts: Mutex<HashSet<String>>,
}

impl LootStore {
    pub fn lookup(&self, host: &str, user: &str, password: &str) -> LootLookup {
        LootLookup {
            known_credential: self
                .credentials
                .lock()
                .contains(&(user.to_string(), password.to_string())),
            previously_admitted: self.hosts.lock().contains(host),
        }
    }

    pub fn remember(&self, host: &str, user: &str, password: &str) {
        self.credentials
            .lock()
            .insert((user.to_string(), password.to_string()));
        self.hosts.lock().insert(host.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LayerNaming, SandboxManager};
    use crate::session::{AllowList, SessionRegistry};
    use crate::testutil::{provision, FakeMounter};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> SessionRegistry {
        provision(dir.path());
        let mgr = SandboxManager::new(dir.path(), LayerNaming::Shared, Arc::new(FakeMounter::default())).unwrap();
        SessionRegistry::new(
            Arc::new(AllowList::new(["10.0.0.99".to_string()])),
            Arc::new(mgr),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn roll_depends_on_clock() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let session = reg.create("10.0.0.1:1000").await.unwrap();
        let dice = DiceRoll::new(3);
        let loot = LootLookup::default();
        assert!(dice.admit_at(&session, &loot, 300));
        assert!(!dice.admit_at(&session, &loot, 301));
        assert!(!dice.admit_at(&session, &loot, 302));
    }

    #[tokio::test]
    async fn known_and_trusted_peers_always_admitted() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let dice = DiceRoll::new(1_000_000);
        let stranger = reg.create("10.0.0.1:1000").await.unwrap();
        let trusted = reg.create("10.0.0.99:1000").await.unwrap();

        assert!(dice.admit_at(&trusted, &LootLookup::default(), 1));

        let store = LootStore::default();
        assert!(!dice.admit_at(&stranger, &store.lookup("10.0.0.1", "root", "admin"), 1));
        store.remember("10.0.0.1", "root", "admin");
        assert!(dice.admit_at(&stranger, &store.lookup("10.0.0.1", "root", "admin"), 1));
        assert!(dice.admit_at(&stranger, &store.lookup("10.0.0.2", "root", "admin"), 1));
        assert!(dice.admit_at(&stranger, &store.lookup("10.0.0.1", "pi", "raspberry"), 1));
    }
}
