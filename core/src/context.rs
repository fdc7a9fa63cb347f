//! Shared agent state (spec §9 design note "globals replaced by
//! session-owned state"). The original agent keeps `connectedBoard`,
//! `Upgrading`, `ConsoleUp` and `WS` as package-level globals; here they
//! become fields on one context, constructed once in `main` and handed to
//! the Port Monitor and Control Gateway as an `Arc`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::collaborators::{
    ArchiveExtractor, ArchiveFetcher, CommitIndex, HttpArchiveFetcher, HttpCommitIndex,
    HttpPrerequisitesSource, PrerequisitesSource, ZipExtractor,
};
use crate::config::AgentConfig;
use crate::notification::SinkRouter;
use crate::registry::AdapterRegistry;
use crate::session::BoardSession;

pub struct AgentContext {
    pub session: Arc<BoardSession>,
    /// The Board Session is built once and outlives any number of IDE
    /// connections; the Control Gateway registers/unregisters the active
    /// connection's sink here rather than the session holding one fixed
    /// sink for its whole lifetime.
    pub notification_router: Arc<SinkRouter>,
    pub registry: Mutex<AdapterRegistry>,
    upgrading: Arc<AtomicBool>,
    pub config: AgentConfig,
    pub prerequisites: Option<Arc<dyn PrerequisitesSource>>,
    pub commit_index: Option<Arc<dyn CommitIndex>>,
    pub archive_fetcher: Option<Arc<dyn ArchiveFetcher>>,
    pub archive_extractor: Arc<dyn ArchiveExtractor>,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        let registry = AdapterRegistry::load_from_dir(&config.adapter_descriptor_dir);
        let cache_dir =
            AgentConfig::default_cache_dir().unwrap_or_else(|| PathBuf::from("./cache"));

        let prerequisites = config.prerequisites_url.clone().map(|url| {
            Arc::new(HttpPrerequisitesSource {
                url,
                cache_dir: cache_dir.clone(),
            }) as Arc<dyn PrerequisitesSource>
        });

        let commit_index = config
            .commit_index_url
            .clone()
            .map(|base_url| Arc::new(HttpCommitIndex { base_url }) as Arc<dyn CommitIndex>);

        let archive_fetcher = match (&config.flasher_url, &config.firmware_base_url) {
            (Some(flasher_url), Some(firmware_base_url)) => Some(Arc::new(HttpArchiveFetcher {
                flasher_url: flasher_url.clone(),
                firmware_base_url: firmware_base_url.clone(),
                scratch_dir: cache_dir.join("scratch"),
            }) as Arc<dyn ArchiveFetcher>),
            _ => None,
        };

        let notification_router = Arc::new(SinkRouter::new());

        Self {
            session: Arc::new(BoardSession::new(notification_router.clone())),
            notification_router,
            registry: Mutex::new(registry),
            upgrading: Arc::new(AtomicBool::new(false)),
            config,
            prerequisites,
            commit_index,
            archive_fetcher,
            archive_extractor: Arc::new(ZipExtractor),
        }
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::Acquire)
    }

    /// Claims the process-wide upgrade gate. Returns `false` if an upgrade
    /// is already in progress (spec §4.4 tie-break (c): while set, the
    /// Port Monitor must not attempt to attach).
    pub fn begin_upgrade(&self) -> bool {
        self.upgrading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_upgrade(&self) {
        self.upgrading.store(false, Ordering::Release);
    }

    pub fn upgrading_flag(&self) -> Arc<AtomicBool> {
        self.upgrading.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_gate_is_exclusive() {
        let ctx = AgentContext::new(AgentConfig::default());
        assert!(ctx.begin_upgrade());
        assert!(!ctx.begin_upgrade());
        ctx.end_upgrade();
        assert!(ctx.begin_upgrade());
    }
}
