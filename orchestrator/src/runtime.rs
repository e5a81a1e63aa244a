//! Process runtime for the orchestrator
//!
//! The `Runtime` replaces process globals with one explicit object: it owns
//! the store handle, the durable log sink, the optional broker producer and
//! the monitor configuration, and carries the hook through which
//! `TaskItem::create` hands tasks to the in-process task runner. Construct
//! it once per process and inject it into every subsystem.

use serde_json::json;
use shared::config::{MonitorConfig, StoreConfig};
use shared::OrchestratorError;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::database::Store;
use crate::logs::LogManager;
use crate::tasks::TaskItem;
use mqueue::Producer;

/// Options for constructing a runtime.
pub struct RuntimeOptions {
    /// Name recorded for this process in the init log entry
    pub app_name: String,
    /// Producer used to publish `run_failed`; None disables publishing
    /// (the failure is still recorded in the log sink)
    pub producer: Option<Producer>,
    /// Shared monitor/alert settings
    pub monitor_config: MonitorConfig,
    /// Test-only escape hatch: allow `TaskItem::create` to proceed without
    /// a task runner registered in this process
    pub skip_registration_check: bool,
}

impl RuntimeOptions {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            producer: None,
            monitor_config: MonitorConfig::default(),
            skip_registration_check: false,
        }
    }
}

/// Shared process state for all orchestrator subsystems.
pub struct Runtime {
    /// The store sits behind a Mutex rather than a RwLock: the SQLite
    /// connection is Send but not Sync, and every operation needs it
    /// mutably anyway.
    store: Arc<Mutex<Store>>,
    producer: Option<Producer>,
    monitor_config: MonitorConfig,
    app_name: String,
    skip_registration_check: bool,
    /// Installed by the task runner; `TaskItem::create` sends tasks here
    register_hook: StdRwLock<Option<mpsc::UnboundedSender<TaskItem>>>,
}

impl Runtime {
    /// Open and initialize the store, then build the runtime.
    ///
    /// This must complete before any task or run operation; an
    /// uninitialized store refuses every operation with a distinct
    /// `NotInitialised` error.
    pub async fn initialise(
        store_config: &StoreConfig,
        options: RuntimeOptions,
    ) -> shared::Result<Arc<Runtime>> {
        let mut store = Store::new(store_config)?;
        store.initialize().await?;

        let runtime = Arc::new(Runtime {
            store: Arc::new(Mutex::new(store)),
            producer: options.producer,
            monitor_config: options.monitor_config,
            app_name: options.app_name,
            skip_registration_check: options.skip_registration_check,
            register_hook: StdRwLock::new(None),
        });

        runtime
            .logs("orchestrator")
            .add_entry(
                "status",
                "Initialised orchestrator runtime",
                json!({ "app_name": runtime.app_name }),
            )
            .await?;
        info!("Orchestrator runtime initialised for '{}'", runtime.app_name);

        Ok(runtime)
    }

    /// Handle to the shared store.
    pub fn store(&self) -> Arc<Mutex<Store>> {
        Arc::clone(&self.store)
    }

    /// A log writer for the given source name.
    pub fn logs(&self, source: &str) -> LogManager {
        LogManager::new(self.store(), source)
    }

    /// The producer used to publish `run_failed`, when configured.
    pub fn producer(&self) -> Option<&Producer> {
        self.producer.as_ref()
    }

    pub fn monitor_config(&self) -> &MonitorConfig {
        &self.monitor_config
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Install the task runner's registration channel. Only one runner may
    /// claim the default registration per process.
    pub(crate) fn set_register_hook(
        &self,
        sender: mpsc::UnboundedSender<TaskItem>,
    ) -> shared::Result<()> {
        let mut hook = self
            .register_hook
            .write()
            .expect("register hook lock poisoned");
        if hook.is_some() {
            return Err(OrchestratorError::Config(
                "Default task runner already set for this runtime".to_string(),
            )
            .into());
        }
        *hook = Some(sender);
        Ok(())
    }

    /// Hand a task to the in-process runner for (re)binding.
    pub(crate) fn register_with_runner(&self, task: TaskItem) -> shared::Result<()> {
        if self.skip_registration_check {
            return Ok(());
        }

        let hook = self
            .register_hook
            .read()
            .expect("register hook lock poisoned");
        match hook.as_ref() {
            Some(sender) => sender.send(task).map_err(|_| {
                anyhow::Error::from(OrchestratorError::Config(
                    "Task runner registration channel closed".to_string(),
                ))
            }),
            None => Err(OrchestratorError::Config(
                "No task runner registered; construct a TaskRunner first".to_string(),
            )
            .into()),
        }
    }
}
