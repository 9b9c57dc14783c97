//! Explicitly constructed dependencies of one update session.

use super::{Epoch, EpochStamp, UpdateEvent};
use crate::engine::config::Config;
use crate::engine::content::{ContentIndex, ModuleLoader};
use crate::engine::error::UpdateError;
use crate::engine::updater::remote::ResourceDescriptor;
use crate::engine::updater::{
    BuildIdentity, DownloadOptions, Downloader, ExtractJob, LocalUpdateState, ModuleSlot,
    RemoteUpdateInfo, SandboxLayout, VersionResolver,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Pipeline knobs taken from the config
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub package: String,
    pub modules: Vec<String>,
    pub strict_manifest_reload: bool,
    pub tick_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            package: "DefaultPackage".to_string(),
            modules: vec!["HotUpdate.dll".to_string()],
            strict_manifest_reload: false,
            tick_interval: Duration::from_millis(16),
        }
    }
}

/// The update resolved by `CheckNeed`
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub from: u64,
    pub to: u64,
    pub url: String,
    pub resource: ResourceDescriptor,
    pub archive_path: PathBuf,
}

/// Optional observer channel
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<UpdateEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn emit(&self, event: UpdateEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Downstream consumer of the loaded modules
pub trait EntryPoint: Send {
    fn run(&mut self, modules: &BTreeMap<String, ModuleSlot>) -> Result<(), UpdateError>;
}

/// Entry point that only reports what was loaded
#[derive(Debug, Default)]
pub struct LogEntry;

impl EntryPoint for LogEntry {
    fn run(&mut self, modules: &BTreeMap<String, ModuleSlot>) -> Result<(), UpdateError> {
        for (id, slot) in modules {
            match slot.bytes() {
                Some(bytes) => info!(module = %id, size = bytes.len(), "module ready"),
                None => info!(module = %id, "module unavailable"),
            }
        }
        Ok(())
    }
}

/// Extraction worker together with the epoch it was started under
pub(crate) struct ActiveExtract {
    pub(crate) stamp: EpochStamp,
    pub(crate) job: ExtractJob,
    pub(crate) archive: PathBuf,
    pub(crate) version: String,
}

pub struct UpdateContext {
    pub(crate) settings: PipelineSettings,
    pub(crate) layout: SandboxLayout,
    pub(crate) resolver: Option<VersionResolver>,
    pub(crate) downloader: Downloader,
    pub(crate) state: LocalUpdateState,
    pub(crate) content: ContentIndex,
    pub(crate) loader: ModuleLoader,
    pub(crate) entry: Box<dyn EntryPoint>,
    pub(crate) events: EventSink,
    pub(crate) epoch: Epoch,
    pub(crate) remote: Option<RemoteUpdateInfo>,
    pub(crate) plan: Option<UpdatePlan>,
    pub(crate) extract: Option<ActiveExtract>,
}

impl UpdateContext {
    /// Assemble a context. Initializes the layout and loads (or bootstraps)
    /// the local version.
    pub fn new(
        settings: PipelineSettings,
        layout: SandboxLayout,
        resolver: Option<VersionResolver>,
        downloader: Downloader,
    ) -> Result<Self, UpdateError> {
        layout
            .init()
            .map_err(|e| UpdateError::fatal(format!("layout: {e}")))?;
        let state = LocalUpdateState::load(&layout)?;
        let content = ContentIndex::new(settings.package.clone(), layout.builtin_root().to_path_buf());
        let loader = ModuleLoader::new(
            layout.sandbox_dir(),
            layout.builtin_root().to_path_buf(),
            settings.package.clone(),
        );

        Ok(Self {
            settings,
            layout,
            resolver,
            downloader,
            state,
            content,
            loader,
            entry: Box::new(LogEntry),
            events: EventSink::default(),
            epoch: Epoch::new(),
            remote: None,
            plan: None,
            extract: None,
        })
    }

    /// Build everything from a project config
    pub fn from_config(config: &Config, project_dir: &Path) -> Result<Self, UpdateError> {
        let builtin_root = Config::resolve(project_dir, &config.storage.builtin_root);
        let layout = match &config.storage.base_dir {
            Some(base) => SandboxLayout::with_base_dir(Config::resolve(project_dir, base), builtin_root),
            None => SandboxLayout::new(builtin_root).map_err(|e| UpdateError::fatal(e.to_string()))?,
        };

        let downloader = Downloader::new(&DownloadOptions {
            timeout: Duration::from_secs(config.download.timeout_secs),
            connect_timeout: Duration::from_secs(config.download.connect_timeout_secs),
            user_agent: config.download.user_agent.clone(),
            system_proxy: config.download.system_proxy,
        })?;

        let resolver = if config.endpoint.url.is_empty() {
            None
        } else {
            let device_id = match &config.endpoint.device_id {
                Some(id) => id.clone(),
                None => layout
                    .device_id()
                    .map_err(|e| UpdateError::fatal(format!("device id: {e}")))?,
            };
            let identity = BuildIdentity {
                game: config.package.game.clone(),
                core_version: config.endpoint.core_version.clone(),
                cpp_version: config.endpoint.cpp_version.clone(),
                client_version: config.endpoint.client_version.clone(),
                channel_code: config.endpoint.channel_code.clone(),
                device_id,
            };
            Some(VersionResolver::new(
                config.endpoint.url.clone(),
                identity,
                config.endpoint.info_timeout(),
                config.download.system_proxy,
            )?)
        };

        let settings = PipelineSettings {
            package: config.package.name.clone(),
            modules: config.modules.entries.clone(),
            strict_manifest_reload: config.modules.strict_manifest_reload,
            tick_interval: config.modules.tick_interval(),
        };

        Self::new(settings, layout, resolver, downloader)
    }

    pub fn with_entry(mut self, entry: Box<dyn EntryPoint>) -> Self {
        self.entry = entry;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn state(&self) -> &LocalUpdateState {
        &self.state
    }

    pub fn content(&self) -> &ContentIndex {
        &self.content
    }

    pub fn plan(&self) -> Option<&UpdatePlan> {
        self.plan.as_ref()
    }
}
