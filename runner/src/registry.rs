use crate::{
    config::{check_executor, ExecutorConfig, RunnerConfig, SUPPORTED_EXECUTORS},
    executors::{self, ExecutorError, JobExecutor},
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

pub type ExecutorFactory =
    Box<dyn Fn() -> Result<Arc<dyn JobExecutor>, ExecutorError> + Send + Sync>;

enum Entry {
    Factory(ExecutorFactory),
    Loaded(Arc<dyn JobExecutor>),
    Broken(String),
}

/// Maps executor names to implementations. Each name is instantiated at most once, on first
/// use. Load errors are stored and reported when the broken name is requested, never when an
/// unrelated executor is.
pub struct ExecutorRegistry {
    entries: Mutex<BTreeMap<String, Entry>>,
}

static GLOBAL: Lazy<ExecutorRegistry> = Lazy::new(ExecutorRegistry::with_defaults);

/// process wide registry holding one default instance per supported backend
pub fn global() -> &'static ExecutorRegistry {
    &GLOBAL
}

pub fn get_instance(name: &str) -> Result<Arc<dyn JobExecutor>, ExecutorError> {
    global().get_instance(name)
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// registry with every supported backend under its own name and default settings
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        for kind in SUPPORTED_EXECUTORS {
            registry.register_config(kind, ExecutorConfig::new(kind));
        }

        registry
    }

    /// Defaults plus every executor in `config`, entries in `config` win on name clashes
    pub fn from_config(config: &RunnerConfig) -> Self {
        let registry = Self::with_defaults();

        for (name, executor) in config.executors.iter() {
            match check_executor(executor) {
                Ok(()) => registry.register_config(name, executor.clone()),
                Err(reason) => {
                    debug!(executor = %name, reason = %reason, "Deferring executor load error");
                    registry.register_error(name, reason)
                }
            }
        }

        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: ExecutorFactory) {
        self.entries.lock().insert(name.into(), Entry::Factory(factory));
    }

    pub fn register_config(&self, name: impl Into<String>, config: ExecutorConfig) {
        let name = name.into();
        let instance_name = name.clone();

        self.register(
            name,
            Box::new(move || executors::create(&instance_name, &config)),
        );
    }

    /// Record that `name` exists but cannot be loaded
    pub fn register_error(&self, name: impl Into<String>, reason: impl Into<String>) {
        self.entries
            .lock()
            .insert(name.into(), Entry::Broken(reason.into()));
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn get_instance(&self, name: &str) -> Result<Arc<dyn JobExecutor>, ExecutorError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ExecutorError::NotFound(name.to_string()))?;

        let result = match entry {
            Entry::Loaded(executor) => return Ok(executor.clone()),
            Entry::Broken(reason) => {
                return Err(ExecutorError::LoadFailed {
                    name: name.to_string(),
                    reason: reason.clone(),
                })
            }
            Entry::Factory(factory) => factory(),
        };

        match result {
            Ok(executor) => {
                *entry = Entry::Loaded(executor.clone());
                Ok(executor)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(executor = %name, error = ?e, "Executor failed to load");
                *entry = Entry::Broken(reason.clone());

                Err(ExecutorError::LoadFailed {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }
}
