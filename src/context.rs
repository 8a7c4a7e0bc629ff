//! Application context: the single composition root.
//!
//! There are no process-wide singletons; everything a module or subsystem
//! needs hangs off one [`AppContext`] built by the entry point. Modules and
//! the subsystems owned by the context get a `Weak` back-reference
//! (constructed via [`Arc::new_cyclic`]) so nothing can keep the application
//! alive past its teardown.

use crate::config::{Config, RemoteServerConfig};
use crate::error::CoreResult;
use crate::module::ModuleFactoryRegistry;
use crate::registry::ModuleRegistry;
use crate::remote::RemoteAccessService;
use crate::threads::ThreadRegistry;
use log::{info, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long process teardown waits for each worker thread.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner of all orchestration subsystems.
pub struct AppContext {
    threads: Arc<ThreadRegistry>,
    factories: Arc<ModuleFactoryRegistry>,
    registry: ModuleRegistry,
    remote: Arc<RemoteAccessService>,
    app_data_root: PathBuf,
    startup: Mutex<Vec<String>>,
    remote_server: Mutex<Option<RemoteServerConfig>>,
}

impl AppContext {
    /// Build the context around a factory registry.
    ///
    /// `app_data_root` overrides where per-module app-data files live;
    /// without it a platform data directory is used.
    pub fn new(factories: Arc<ModuleFactoryRegistry>, app_data_root: Option<PathBuf>) -> Arc<Self> {
        let app_data_root = app_data_root.unwrap_or_else(default_app_data_root);
        Arc::new_cyclic(|weak| {
            let threads = Arc::new(ThreadRegistry::new());
            Self {
                registry: ModuleRegistry::new(
                    weak.clone(),
                    Arc::clone(&threads),
                    Arc::clone(&factories),
                    app_data_root.clone(),
                ),
                remote: Arc::new(RemoteAccessService::new(weak.clone())),
                threads,
                factories,
                app_data_root,
                startup: Mutex::new(Vec::new()),
                remote_server: Mutex::new(None),
            }
        })
    }

    /// The managed-module registry.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The remote access share table.
    pub fn remote(&self) -> &RemoteAccessService {
        &self.remote
    }

    /// Shared handle to the remote access service, for serving it over TCP.
    pub fn remote_service(&self) -> Arc<RemoteAccessService> {
        Arc::clone(&self.remote)
    }

    /// The worker-thread registry.
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// The implementation factory registry.
    pub fn factories(&self) -> &Arc<ModuleFactoryRegistry> {
        &self.factories
    }

    /// Directory holding per-module app-data files.
    pub fn app_data_root(&self) -> &Path {
        &self.app_data_root
    }

    /// Remote access server section of the applied configuration.
    pub fn remote_server_config(&self) -> Option<RemoteServerConfig> {
        self.remote_server.lock().clone()
    }

    /// Instantiate managed-module records from a configuration.
    ///
    /// Every descriptor is registered and the resulting wiring is validated
    /// as a whole, so capability mismatches surface here rather than at
    /// first activation.
    pub fn apply_config(&self, config: &Config) -> CoreResult<()> {
        config.validate()?;
        std::fs::create_dir_all(&self.app_data_root)?;

        for (base, name, descriptor) in config.modules() {
            self.registry.add_module(name, base, descriptor, false)?;
        }
        self.registry.validate_links()?;

        *self.startup.lock() = config.startup.clone();
        *self.remote_server.lock() = config.remote_server.clone();
        info!(
            "Applied configuration with {} managed modules",
            self.registry.module_names().len()
        );
        Ok(())
    }

    /// Activate the configured startup modules. Returns `false` if any of
    /// them failed; failures are logged per module.
    pub fn startup(&self) -> bool {
        let startup = self.startup.lock().clone();
        let mut success = true;
        for name in &startup {
            if !self.registry.activate_module(name) {
                warn!("Startup module \"{name}\" failed to activate");
                success = false;
            }
        }
        success
    }

    /// Deactivate everything in dependency order and wind down the worker
    /// threads.
    pub fn teardown(&self) {
        info!("Shutting down: deactivating all modules");
        self.registry.stop_all_modules();
        self.threads.quit_all_threads(TEARDOWN_TIMEOUT);
    }
}

fn default_app_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("labcore")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleDescriptor;
    use crate::module::{Module, ModuleBase, ModuleFactory};
    use anyhow::Result;

    struct NullModule;

    impl Module for NullModule {
        fn on_activate(&mut self) -> Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn test_context() -> Arc<AppContext> {
        let factories = Arc::new(ModuleFactoryRegistry::new());
        factories.register(
            "hardware.mock.NullModule",
            ModuleFactory::new(ModuleBase::Hardware, |_ctx| Ok(NullModule)),
        );
        let dir = tempfile::tempdir().unwrap();
        AppContext::new(factories, Some(dir.path().to_path_buf()))
    }

    #[test]
    fn apply_config_registers_and_startup_activates() {
        let ctx = test_context();
        let mut config = Config::default();
        config.hardware.insert(
            "null_hw".to_string(),
            ModuleDescriptor::local("hardware.mock", "NullModule"),
        );
        config.startup = vec!["null_hw".to_string()];

        ctx.apply_config(&config).unwrap();
        assert_eq!(ctx.registry().module_names(), vec!["null_hw".to_string()]);

        assert!(ctx.startup());
        assert!(ctx.registry().is_active("null_hw"));

        ctx.teardown();
        assert!(!ctx.registry().is_active("null_hw"));
    }

    #[test]
    fn apply_config_rejects_unknown_implementation() {
        let ctx = test_context();
        let mut config = Config::default();
        config.hardware.insert(
            "ghost_hw".to_string(),
            ModuleDescriptor::local("hardware.ghost", "Ghost"),
        );
        assert!(ctx.apply_config(&config).is_err());
        assert!(ctx.registry().module_names().is_empty());
    }
}
