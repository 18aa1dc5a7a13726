//! Service wiring
//!
//! [`Lifeline`] owns every component and hands out `Arc`s to the transport
//! layer. Collaborators (identity, object storage, authority, channels, ids)
//! are injected so the same wiring runs in the daemon and in tests.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::collaborators::{AuthorityNotifier, IdentityDirectory, ObjectStore};
use crate::config::LifelineConfig;
use crate::dispatch::{ChannelSet, Dispatcher};
use crate::evidence::{spawn_session_gc_task, ChunkStore, EvidenceAccess, EvidenceLedger};
use crate::ids::IdGenerator;
use crate::incident::orchestrator::OrchestratorDeps;
use crate::incident::{IncidentOrchestrator, IncidentStore};
use crate::responders::ResponderDirectory;
use crate::topics::IncidentTopics;
use crate::types::Result;

/// External collaborators the core depends on
pub struct Collaborators {
    pub ids: Arc<dyn IdGenerator>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub object_store: Arc<dyn ObjectStore>,
    pub authority: Arc<dyn AuthorityNotifier>,
    pub channels: ChannelSet,
}

/// All running components
pub struct Lifeline {
    pub config: LifelineConfig,
    pub chunks: Arc<ChunkStore>,
    pub ledger: Arc<EvidenceLedger>,
    pub access: Arc<EvidenceAccess>,
    pub directory: Arc<ResponderDirectory>,
    pub store: Arc<IncidentStore>,
    pub topics: Arc<IncidentTopics>,
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<IncidentOrchestrator>,
}

impl Lifeline {
    pub fn build(config: LifelineConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            ids,
            identity,
            object_store,
            authority,
            channels,
        } = collaborators;

        let chunks = Arc::new(ChunkStore::new(config.evidence.clone(), ids.clone()));
        let ledger = Arc::new(EvidenceLedger::new(object_store, ids.clone()));
        let access = Arc::new(EvidenceAccess::new(&config.access, ledger.clone())?);
        let directory = Arc::new(ResponderDirectory::new(config.directory.clone()));
        let store = Arc::new(IncidentStore::new());
        let topics = Arc::new(IncidentTopics::new(config.topics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            store.clone(),
            topics.clone(),
            channels,
        ));
        let orchestrator = Arc::new(IncidentOrchestrator::new(
            config.incident.clone(),
            OrchestratorDeps {
                ids,
                identity,
                directory: directory.clone(),
                dispatcher: dispatcher.clone(),
                store: store.clone(),
                topics: topics.clone(),
                chunks: chunks.clone(),
                ledger: ledger.clone(),
                authority,
            },
        ));

        Ok(Self {
            config,
            chunks,
            ledger,
            access,
            directory,
            store,
            topics,
            dispatcher,
            orchestrator,
        })
    }

    /// Start upload GC and the evidence listener
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let gc = spawn_session_gc_task(self.chunks.clone(), self.config.evidence.gc_interval());
        let listener = self.orchestrator.spawn_evidence_listener();
        info!(
            gc_interval_secs = self.config.evidence.gc_interval_secs,
            "Background tasks started"
        );
        vec![gc, listener]
    }
}
