//! Branch-addressable chat conversations with live streaming.
//!
//! [`ChatCore`] bundles the process-wide state: one [`ConversationStore`]
//! backend, the stream session registry, the steer channel and the agent warm
//! pool. Build it once at startup and hand it to request handlers.

pub mod branch;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod runtime;
pub mod storage;
pub mod version;

pub use branch::{BranchPath, Direction};
pub use config::{BackendKind, CoreConfig};
pub use error::{StoreError, StoreResult};
pub use storage::{ConversationStore, FileConversationStore, TableConversationStore};
pub use version::VersionInfo;

use branchline_storage::paths;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use models::AgentSettings;
use runtime::{AgentWarmPool, StartupParams, SteerChannel, StreamCoordinator, StreamSessionRegistry};

pub struct ChatCore {
    pub config: CoreConfig,
    pub store: Arc<dyn ConversationStore>,
    pub sessions: Arc<StreamSessionRegistry>,
    pub steer: Arc<SteerChannel>,
    pub warm_pool: Arc<AgentWarmPool>,
    data_dir: PathBuf,
}

impl ChatCore {
    pub fn new(config: CoreConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let data_dir = config.resolved_data_dir()?;
        std::fs::create_dir_all(&data_dir)?;

        let store: Arc<dyn ConversationStore> = match config.backend {
            BackendKind::Files => {
                Arc::new(FileConversationStore::new(paths::conversations_dir(&data_dir))?)
            }
            BackendKind::Table => Arc::new(TableConversationStore::open(
                paths::database_path(&data_dir),
                paths::workspaces_dir(&data_dir),
            )?),
        };
        info!(backend = ?config.backend, data_dir = %data_dir.display(), "Initializing Branchline");

        let warm_pool = Arc::new(AgentWarmPool::new(
            config.warm_pool.max_entries,
            config.warm_pool.ttl(),
        ));

        Ok(Self {
            config,
            store,
            sessions: Arc::new(StreamSessionRegistry::new()),
            steer: Arc::new(SteerChannel::new()),
            warm_pool,
            data_dir,
        })
    }

    /// Load `config.toml` from the default data directory, then build.
    pub fn open_default() -> anyhow::Result<Self> {
        let base = paths::ensure_branchline_dir()?;
        let config = CoreConfig::load_or_default(&paths::config_path(&base))?;
        Self::new(config)
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn coordinator(&self) -> StreamCoordinator {
        StreamCoordinator::new(
            self.store.clone(),
            self.sessions.clone(),
            self.steer.clone(),
            self.config.streaming.clone(),
        )
    }

    /// Start background upkeep. Returns `None` outside a Tokio runtime.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        self.warm_pool
            .spawn_cleanup(self.config.warm_pool.cleanup_interval())
    }

    /// Resolve startup parameters for an agent conversation and keep them warm.
    pub fn warm_session(
        &self,
        id: &str,
        defaults: &AgentSettings,
        project: Option<&AgentSettings>,
    ) -> anyhow::Result<StartupParams> {
        let conversation = self.store.get_metadata(id)?;
        let workspace = self.store.workspace_path(id)?;
        let params = StartupParams::prepare(
            &conversation,
            &workspace,
            &paths::memory_dir(&self.data_dir),
            defaults,
            project,
        )?;
        self.warm_pool.warm(id, params.clone());
        Ok(params)
    }

    /// Warm parameters when fresh, otherwise resolve them again.
    pub fn session_params(
        &self,
        id: &str,
        defaults: &AgentSettings,
        project: Option<&AgentSettings>,
    ) -> anyhow::Result<StartupParams> {
        match self.warm_pool.try_get(id) {
            Some(params) => Ok(params),
            None => self.warm_session(id, defaults, project),
        }
    }
}
