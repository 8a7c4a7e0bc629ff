//! Module registry and per-module lifecycle state machine.
//!
//! The registry owns every managed module record in one arena (name ->
//! record) behind a single mutex. Cross-record dependency edges are plain
//! name sets recomputed by a synchronous [`refresh`](ModuleRegistry) pass
//! whenever membership changes, so removal prunes edges deterministically
//! instead of relying on destructor timing.
//!
//! All lifecycle operations are serialized: recursive activation of required
//! modules and recursive deactivation of dependents walk the arena inside a
//! single critical section. Activation flows top-down (a module's
//! requirements activate before it), deactivation flows bottom-up (dependents
//! deactivate before their dependency). Thread-affine modules run their hooks
//! on a dedicated [`ThreadRegistry`](crate::threads::ThreadRegistry) worker
//! while the calling thread blocks.
//!
//! Hook failures never propagate to the caller as errors or panics: they are
//! logged with context and converted into a `false` result plus a `Broken`
//! record state, observable through state queries and the event channel.

use crate::config::ModuleDescriptor;
use crate::context::AppContext;
use crate::error::{CoreError, CoreResult};
use crate::module::{ModuleBase, ModuleContext, ModuleFactoryRegistry, ModuleInstance, ModuleState};
use crate::remote::RemoteModuleStub;
use crate::threads::ThreadRegistry;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a released worker thread gets to wind down its loop.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle notifications emitted synchronously after successful
/// transitions.
#[derive(Clone, Debug)]
pub enum ModuleEvent {
    /// A module reached a new lifecycle state.
    StateChanged {
        /// Base category of the module.
        base: ModuleBase,
        /// Unique module name.
        name: String,
        /// The state just entered.
        state: ModuleState,
    },
    /// A module's persisted app-data file appeared or disappeared.
    AppDataChanged {
        /// Base category of the module.
        base: ModuleBase,
        /// Unique module name.
        name: String,
        /// Whether an app-data file currently exists.
        has_app_data: bool,
    },
}

/// One managed module record: descriptor-derived configuration, the lazily
/// created instance, lifecycle state and the dependency edges.
struct ManagedModule {
    name: String,
    base: ModuleBase,
    impl_key: Option<String>,
    class_name: String,
    connect_cfg: BTreeMap<String, String>,
    options: HashMap<String, serde_json::Value>,
    allow_remote_access: bool,
    remote_url: Option<String>,
    remote_certfile: Option<String>,
    remote_keyfile: Option<String>,
    instance: Option<ModuleInstance>,
    state: ModuleState,
    required: BTreeSet<String>,
    dependents: BTreeSet<String>,
    thread_name: Option<String>,
}

impl ManagedModule {
    fn from_descriptor(name: &str, base: ModuleBase, descriptor: &ModuleDescriptor) -> Self {
        Self {
            name: name.to_string(),
            base,
            impl_key: descriptor.impl_key(),
            class_name: descriptor.class_name().to_string(),
            connect_cfg: descriptor.connect.clone(),
            options: descriptor.options.clone(),
            allow_remote_access: descriptor.effective_remote_access(),
            remote_url: descriptor.remote.clone(),
            remote_certfile: descriptor.certfile.clone(),
            remote_keyfile: descriptor.keyfile.clone(),
            instance: None,
            state: ModuleState::NotLoaded,
            required: BTreeSet::new(),
            dependents: BTreeSet::new(),
            thread_name: None,
        }
    }

    fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Externally visible state; `Busy` is derived from the live instance.
    fn reported_state(&self) -> ModuleState {
        if self.state != ModuleState::Idle {
            return self.state;
        }
        match &self.instance {
            Some(instance) => match instance.try_lock() {
                Some(guard) => {
                    if guard.is_busy() {
                        ModuleState::Busy
                    } else {
                        ModuleState::Idle
                    }
                }
                // A held instance lock means a hook or call is running.
                None => ModuleState::Busy,
            },
            None => ModuleState::Idle,
        }
    }

    fn worker_name(&self) -> String {
        format!("mod-{}-{}", self.base, self.name)
    }

    fn describe(&self) -> String {
        match &self.remote_url {
            Some(url) => format!("remote {} module \"{url}\"", self.base),
            None => format!(
                "{} module \"{}\"",
                self.base,
                self.impl_key.as_deref().unwrap_or(&self.name)
            ),
        }
    }
}

struct RegistryInner {
    modules: HashMap<String, ManagedModule>,
}

/// Arena of managed modules plus the dependency graph over them.
pub struct ModuleRegistry {
    app: Weak<AppContext>,
    threads: Arc<ThreadRegistry>,
    factories: Arc<ModuleFactoryRegistry>,
    app_data_root: PathBuf,
    events: broadcast::Sender<ModuleEvent>,
    inner: Mutex<RegistryInner>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub(crate) fn new(
        app: Weak<AppContext>,
        threads: Arc<ThreadRegistry>,
        factories: Arc<ModuleFactoryRegistry>,
        app_data_root: PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            app,
            threads,
            factories,
            app_data_root,
            events,
            inner: Mutex::new(RegistryInner {
                modules: HashMap::new(),
            }),
        }
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ModuleEvent> {
        self.events.subscribe()
    }

    /// Register a managed module from its descriptor.
    ///
    /// Validates the descriptor eagerly, resolves the implementation against
    /// the factory registry and checks the configured connector slots against
    /// the implementation's declared connectors. On success the dependency
    /// links of the whole registry are refreshed and the module is shared via
    /// the remote access service if its descriptor asks for that.
    pub fn add_module(
        &self,
        name: &str,
        base: ModuleBase,
        descriptor: &ModuleDescriptor,
        allow_overwrite: bool,
    ) -> CoreResult<()> {
        descriptor.validate(name)?;

        if !descriptor.is_remote() {
            let key = descriptor.impl_key().ok_or_else(|| {
                CoreError::Configuration(format!("module \"{name}\" has no implementation key"))
            })?;
            let factory = self
                .factories
                .get(&key)
                .ok_or_else(|| CoreError::Import(key.clone()))?;
            if factory.base() != base {
                return Err(CoreError::Interface(format!(
                    "implementation \"{key}\" is a {} module but \"{name}\" is configured as {base}",
                    factory.base()
                )));
            }
            for slot in descriptor.connect.keys() {
                if factory.connector(slot).is_none() {
                    return Err(CoreError::Configuration(format!(
                        "module \"{name}\" configures unknown connector slot \"{slot}\""
                    )));
                }
            }
            for spec in factory.connectors() {
                if !spec.optional && !descriptor.connect.contains_key(&spec.name) {
                    return Err(CoreError::Configuration(format!(
                        "mandatory connector \"{}\" of module \"{name}\" is not configured",
                        spec.name
                    )));
                }
            }
        }

        let mut inner = self.inner.lock();
        if allow_overwrite {
            self.remove_module_locked(&mut inner, name, true);
        } else if inner.modules.contains_key(name) {
            return Err(CoreError::Configuration(format!(
                "module with name \"{name}\" already registered, unable to add module of same name"
            )));
        }

        let record = ManagedModule::from_descriptor(name, base, descriptor);
        let share = record.allow_remote_access;
        inner.modules.insert(name.to_string(), record);
        Self::refresh_links(&mut inner);
        drop(inner);

        info!("Registered {base} module \"{name}\"");
        if share {
            match self.app.upgrade() {
                Some(ctx) => {
                    ctx.remote().share_module(name, base);
                    info!("Start sharing module \"{name}\" via remote access service");
                }
                None => warn!(
                    "Unable to share module \"{name}\": no application context available"
                ),
            }
        }
        Ok(())
    }

    /// Deactivate, unshare and drop a managed module.
    ///
    /// With `ignore_missing` an unknown name is a no-op success; otherwise it
    /// is logged and reported as failure.
    pub fn remove_module(&self, name: &str, ignore_missing: bool) -> bool {
        let mut inner = self.inner.lock();
        self.remove_module_locked(&mut inner, name, ignore_missing)
    }

    fn remove_module_locked(
        &self,
        inner: &mut RegistryInner,
        name: &str,
        ignore_missing: bool,
    ) -> bool {
        if !inner.modules.contains_key(name) {
            if !ignore_missing {
                error!("No module with name \"{name}\" registered, unable to remove module");
            }
            return ignore_missing;
        }
        self.deactivate_locked(inner, name);
        let Some(record) = inner.modules.remove(name) else {
            return ignore_missing;
        };
        if record.allow_remote_access {
            if let Some(ctx) = self.app.upgrade() {
                ctx.remote().remove_shared_module(name);
            }
        }
        // Synchronous pruning pass: no surviving record keeps an edge to the
        // removed name.
        Self::refresh_links(inner);
        info!("Removed {} module \"{name}\"", record.base);
        true
    }

    /// Activate the named module, recursively activating its requirements
    /// first. Returns `false` on any failure; failures are logged.
    pub fn activate_module(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.modules.contains_key(name) {
            error!("No module named \"{name}\" found in managed modules, activation aborted");
            return false;
        }
        self.activate_locked(&mut inner, name)
    }

    /// Deactivate the named module, recursively deactivating its dependents
    /// first. Deactivating an inactive module is a no-op success.
    pub fn deactivate_module(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.modules.contains_key(name) {
            error!("No module named \"{name}\" found in managed modules, deactivation aborted");
            return false;
        }
        self.deactivate_locked(&mut inner, name)
    }

    /// Reload the named module: deactivate it (and its active dependents),
    /// rebuild the instance from the factory registry and reactivate
    /// whatever was active before.
    pub fn reload_module(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.modules.contains_key(name) {
            error!("No module named \"{name}\" found in managed modules, reload aborted");
            return false;
        }
        self.reload_locked(&mut inner, name)
    }

    /// Activate every managed module.
    pub fn start_all_modules(&self) {
        let mut inner = self.inner.lock();
        let names: Vec<String> = Self::sorted_names(&inner);
        for name in names {
            self.activate_locked(&mut inner, &name);
        }
    }

    /// Deactivate every managed module, dependents first by construction.
    pub fn stop_all_modules(&self) {
        let mut inner = self.inner.lock();
        let names: Vec<String> = Self::sorted_names(&inner);
        for name in names {
            self.deactivate_locked(&mut inner, &name);
        }
    }

    /// Validate the whole wiring against the factory declarations.
    ///
    /// Run after configuration has been applied: every configured peer must
    /// exist and provide the capability the slot declares. Remote-hosted
    /// peers are trusted to satisfy their slots on the hosting process.
    pub fn validate_links(&self) -> CoreResult<()> {
        let inner = self.inner.lock();
        if let Some(cycle) = Self::find_cycle(&inner) {
            return Err(CoreError::Configuration(format!(
                "circular connector dependency: {}",
                cycle.join(" -> ")
            )));
        }
        for (name, module) in &inner.modules {
            let Some(key) = &module.impl_key else { continue };
            let factory = self
                .factories
                .get(key)
                .ok_or_else(|| CoreError::Import(key.clone()))?;
            for (slot, peer_name) in &module.connect_cfg {
                let Some(spec) = factory.connector(slot) else { continue };
                let peer = inner.modules.get(peer_name).ok_or_else(|| {
                    CoreError::Configuration(format!(
                        "module \"{name}\" connects slot \"{slot}\" to unknown module \"{peer_name}\""
                    ))
                })?;
                let Some(peer_key) = &peer.impl_key else {
                    debug!(
                        "Slot \"{slot}\" of \"{name}\" is wired to remote-hosted \"{peer_name}\", \
                         capability check deferred to the hosting process"
                    );
                    continue;
                };
                let peer_factory = self
                    .factories
                    .get(peer_key)
                    .ok_or_else(|| CoreError::Import(peer_key.clone()))?;
                if !peer_factory.provides_capability(&spec.capability) {
                    return Err(CoreError::Interface(format!(
                        "module \"{peer_name}\" does not provide capability \"{}\" required by \
                         slot \"{slot}\" of \"{name}\"",
                        spec.capability
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Names of all managed modules, sorted.
    pub fn module_names(&self) -> Vec<String> {
        Self::sorted_names(&self.inner.lock())
    }

    /// Whether a module with this name is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.lock().modules.contains_key(name)
    }

    /// Whether the named module has a live instance.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner
            .lock()
            .modules
            .get(name)
            .is_some_and(ManagedModule::is_loaded)
    }

    /// Whether the named module is active.
    pub fn is_active(&self, name: &str) -> bool {
        self.inner
            .lock()
            .modules
            .get(name)
            .is_some_and(ManagedModule::is_active)
    }

    /// Reported lifecycle state of the named module.
    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.inner
            .lock()
            .modules
            .get(name)
            .map(ManagedModule::reported_state)
    }

    /// Reported state of every managed module.
    pub fn module_states(&self) -> BTreeMap<String, ModuleState> {
        self.inner
            .lock()
            .modules
            .iter()
            .map(|(name, module)| (name.clone(), module.reported_state()))
            .collect()
    }

    /// Live instance handle of the named module, if loaded.
    pub fn instance(&self, name: &str) -> Option<ModuleInstance> {
        self.inner
            .lock()
            .modules
            .get(name)
            .and_then(|module| module.instance.clone())
    }

    /// Names of the modules the named module requires.
    pub fn required_of(&self, name: &str) -> Option<BTreeSet<String>> {
        self.inner
            .lock()
            .modules
            .get(name)
            .map(|module| module.required.clone())
    }

    /// Names of the modules depending on the named module.
    pub fn dependents_of(&self, name: &str) -> Option<BTreeSet<String>> {
        self.inner
            .lock()
            .modules
            .get(name)
            .map(|module| module.dependents.clone())
    }

    // ------------------------------------------------------------------
    // App data
    // ------------------------------------------------------------------

    /// Whether the named module has a persisted app-data file.
    pub fn has_app_data(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        match inner.modules.get(name) {
            Some(record) => self.status_file_path(record).exists(),
            None => {
                error!("No module named \"{name}\" found, can not check for app-data file");
                false
            }
        }
    }

    /// Delete the named module's persisted app-data file. Pure side effect,
    /// independent of runtime state; the file's contents are never inspected.
    pub fn clear_module_app_data(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        let Some(record) = inner.modules.get(name) else {
            error!("No module named \"{name}\" found, can not clear app data");
            return false;
        };
        let path = self.status_file_path(record);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.emit_app_data(record, false);
                true
            }
            Err(err) => {
                warn!(
                    "Unable to remove app-data file {} of module \"{name}\": {err}",
                    path.display()
                );
                false
            }
        }
    }

    /// Path of the app-data file addressed by `(class name, base, name)`.
    fn status_file_path(&self, record: &ManagedModule) -> PathBuf {
        self.app_data_root.join(format!(
            "status-{}_{}_{}.cfg",
            record.class_name, record.base, record.name
        ))
    }

    // ------------------------------------------------------------------
    // Lifecycle internals (all under the arena lock)
    // ------------------------------------------------------------------

    fn sorted_names(inner: &RegistryInner) -> Vec<String> {
        let mut names: Vec<String> = inner.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Rebuild every record's required/dependent name sets from the static
    /// connector configuration. Names without a registered record are left
    /// out; they re-enter the graph when the module is added.
    fn refresh_links(inner: &mut RegistryInner) {
        let names: BTreeSet<String> = inner.modules.keys().cloned().collect();
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (name, module) in &inner.modules {
            for peer in module.connect_cfg.values() {
                if names.contains(peer) {
                    dependents
                        .entry(peer.clone())
                        .or_default()
                        .insert(name.clone());
                }
            }
        }
        for (name, module) in inner.modules.iter_mut() {
            module.required = module
                .connect_cfg
                .values()
                .filter(|peer| names.contains(*peer))
                .cloned()
                .collect();
            module.dependents = dependents.remove(name).unwrap_or_default();
        }
    }

    /// Walk the connector graph depth-first; a name revisited while still on
    /// the walk's path is a cycle, returned as the names along it.
    fn find_cycle(inner: &RegistryInner) -> Option<Vec<String>> {
        fn visit(
            inner: &RegistryInner,
            name: &str,
            done: &mut BTreeSet<String>,
            path: &mut Vec<String>,
        ) -> bool {
            if done.contains(name) {
                return false;
            }
            if path.iter().any(|n| n == name) {
                path.push(name.to_string());
                return true;
            }
            path.push(name.to_string());
            if let Some(record) = inner.modules.get(name) {
                for peer in record.connect_cfg.values() {
                    if inner.modules.contains_key(peer) && visit(inner, peer, done, path) {
                        return true;
                    }
                }
            }
            path.pop();
            done.insert(name.to_string());
            false
        }

        let mut done = BTreeSet::new();
        for name in Self::sorted_names(inner) {
            let mut path = Vec::new();
            if visit(inner, &name, &mut done, &mut path) {
                // Trim the lead-in so the path starts at the cycle entry.
                let entry = path.last().cloned().unwrap_or_default();
                let start = path.iter().position(|n| *n == entry).unwrap_or(0);
                return Some(path.split_off(start));
            }
        }
        None
    }

    fn activate_locked(&self, inner: &mut RegistryInner, name: &str) -> bool {
        let mut visiting = BTreeSet::new();
        self.activate_rec(inner, name, &mut visiting)
    }

    fn activate_rec(
        &self,
        inner: &mut RegistryInner,
        name: &str,
        visiting: &mut BTreeSet<String>,
    ) -> bool {
        match inner.modules.get(name) {
            Some(record) if record.is_active() => return true,
            Some(_) => {}
            None => {
                error!("No module named \"{name}\" found, activation aborted");
                return false;
            }
        }
        // Guards against cyclic wiring registered without a validation pass.
        if !visiting.insert(name.to_string()) {
            error!(
                "Circular dependency detected at module \"{name}\", activation aborted"
            );
            return false;
        }
        let result = self.activate_steps(inner, name, visiting);
        visiting.remove(name);
        result
    }

    fn activate_steps(
        &self,
        inner: &mut RegistryInner,
        name: &str,
        visiting: &mut BTreeSet<String>,
    ) -> bool {
        // Requirements first; any failure aborts with no state change here.
        let required: Vec<String> = inner
            .modules
            .get(name)
            .map(|record| record.required.iter().cloned().collect())
            .unwrap_or_default();
        for dep in &required {
            let dep_active = inner
                .modules
                .get(dep)
                .is_some_and(ManagedModule::is_active);
            if !dep_active && !self.activate_rec(inner, dep, visiting) {
                error!(
                    "Required module \"{dep}\" failed to activate, aborting activation of \"{name}\""
                );
                return false;
            }
        }

        let loaded = inner
            .modules
            .get(name)
            .is_some_and(ManagedModule::is_loaded);
        if !loaded && !self.load_locked(inner, name, false) {
            return false;
        }

        if let Some(record) = inner.modules.get(name) {
            info!("Activating {}", record.describe());
        }

        if !self.connect_locked(inner, name) {
            self.teardown_instance_locked(inner, name, ModuleState::NotLoaded);
            return false;
        }

        // Run the activation hook, on the assigned worker thread for
        // thread-affine modules.
        let (instance, base, affine, worker) = {
            let Some(record) = inner.modules.get(name) else { return false };
            let Some(instance) = record.instance.clone() else {
                error!("Module \"{name}\" lost its instance during activation");
                return false;
            };
            let affine = instance.lock().thread_affine();
            (instance, record.base, affine, record.worker_name())
        };

        let hook_result: anyhow::Result<()> = if affine {
            if !self.threads.get_new_thread(&worker) {
                error!("Unable to obtain worker thread \"{worker}\" for module \"{name}\"");
                self.teardown_instance_locked(inner, name, ModuleState::NotLoaded);
                return false;
            }
            if let Some(record) = inner.modules.get_mut(name) {
                record.thread_name = Some(worker.clone());
            }
            let hook_instance = Arc::clone(&instance);
            match self
                .threads
                .run_blocking(&worker, move || hook_instance.lock().on_activate())
            {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            }
        } else {
            instance.lock().on_activate()
        };

        match hook_result {
            Ok(()) => {
                let has_app_data = inner
                    .modules
                    .get(name)
                    .map(|record| self.status_file_path(record).exists())
                    .unwrap_or(false);
                let Some(record) = inner.modules.get_mut(name) else { return false };
                record.state = ModuleState::Idle;
                self.emit_state(record);
                self.emit_app_data(record, has_app_data);
                true
            }
            Err(err) => {
                error!("Error during activation of {base} module \"{name}\": {err:#}");
                self.release_worker_locked(inner, name);
                self.teardown_instance_locked(inner, name, ModuleState::Broken);
                false
            }
        }
    }

    fn deactivate_locked(&self, inner: &mut RegistryInner, name: &str) -> bool {
        let mut visiting = BTreeSet::new();
        self.deactivate_rec(inner, name, &mut visiting)
    }

    fn deactivate_rec(
        &self,
        inner: &mut RegistryInner,
        name: &str,
        visiting: &mut BTreeSet<String>,
    ) -> bool {
        match inner.modules.get(name) {
            // Idempotent: no teardown, no duplicate notification.
            Some(record) if !record.is_active() => return true,
            Some(record) => info!("Deactivating {}", record.describe()),
            None => {
                error!("No module named \"{name}\" found, deactivation aborted");
                return false;
            }
        }
        if !visiting.insert(name.to_string()) {
            error!(
                "Circular dependency detected at module \"{name}\", deactivation aborted"
            );
            return false;
        }

        // Dependents first; a module cannot be torn down while something
        // still needs it. Failures are aggregated, teardown continues.
        let mut success = true;
        let dependents: Vec<String> = inner
            .modules
            .get(name)
            .map(|record| record.dependents.iter().cloned().collect())
            .unwrap_or_default();
        for dep in &dependents {
            let dep_active = inner
                .modules
                .get(dep)
                .is_some_and(ManagedModule::is_active);
            if dep_active {
                success &= self.deactivate_rec(inner, dep, visiting);
            }
        }

        let (instance, base, worker) = {
            let Some(record) = inner.modules.get(name) else { return false };
            let Some(instance) = record.instance.clone() else {
                error!("Active module \"{name}\" has no instance, marking broken");
                if let Some(record) = inner.modules.get_mut(name) {
                    record.state = ModuleState::Broken;
                }
                return false;
            };
            (instance, record.base, record.thread_name.clone())
        };

        let hook_result: anyhow::Result<()> = if let Some(worker) = &worker {
            let hook_instance = Arc::clone(&instance);
            match self
                .threads
                .run_blocking(worker, move || hook_instance.lock().on_deactivate())
            {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            }
        } else {
            instance.lock().on_deactivate()
        };

        self.release_worker_locked(inner, name);
        instance.lock().disconnect_all();

        let has_app_data = inner
            .modules
            .get(name)
            .map(|record| self.status_file_path(record).exists())
            .unwrap_or(false);
        let Some(record) = inner.modules.get_mut(name) else { return false };
        match hook_result {
            Ok(()) => record.state = ModuleState::Deactivated,
            Err(err) => {
                error!("Error during deactivation of {base} module \"{name}\": {err:#}");
                record.state = ModuleState::Broken;
                success = false;
            }
        }
        self.emit_state(record);
        self.emit_app_data(record, has_app_data);
        success
    }

    fn reload_locked(&self, inner: &mut RegistryInner, name: &str) -> bool {
        let Some(record) = inner.modules.get(name) else {
            error!("No module named \"{name}\" found, reload aborted");
            return false;
        };
        let was_active = record.is_active();

        // Remember the deepest active dependents; they define what has to
        // come back up after the reload.
        let to_reactivate: Vec<String> = if was_active {
            self.ranking_active_dependents(inner, name)
                .into_iter()
                .collect()
        } else {
            Vec::new()
        };

        if was_active && !self.deactivate_locked(inner, name) {
            return false;
        }

        // Rebuild the instance from the factory registry; this is the live
        // code replacement seam.
        if let Some(record) = inner.modules.get_mut(name) {
            record.instance = None;
            record.state = ModuleState::NotLoaded;
        }
        if !self.load_locked(inner, name, true) {
            return false;
        }

        if !was_active {
            return true;
        }
        if to_reactivate.is_empty() {
            return self.activate_locked(inner, name);
        }
        for module in &to_reactivate {
            if !self.activate_locked(inner, module) {
                return false;
            }
        }
        true
    }

    /// Deepest active dependents of a module: for every active dependent,
    /// its own deepest active dependents, or the dependent itself when it is
    /// a leaf of the active subgraph.
    fn ranking_active_dependents(&self, inner: &RegistryInner, name: &str) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let dependents = match inner.modules.get(name) {
            Some(record) => record.dependents.clone(),
            None => return result,
        };
        for dep in dependents {
            if inner.modules.get(&dep).is_some_and(ManagedModule::is_active) {
                let deeper = self.ranking_active_dependents(inner, &dep);
                if deeper.is_empty() {
                    result.insert(dep);
                } else {
                    result.extend(deeper);
                }
            }
        }
        result
    }

    /// Create the instance: factory build for local modules, a remote stub
    /// for remote-hosted ones.
    fn load_locked(&self, inner: &mut RegistryInner, name: &str, reload: bool) -> bool {
        let Some(record) = inner.modules.get_mut(name) else { return false };
        if record.is_loaded() && !reload {
            return true;
        }

        let built: anyhow::Result<ModuleInstance> = if let Some(url) = &record.remote_url {
            Ok(Arc::new(parking_lot::Mutex::new(RemoteModuleStub::new(
                record.name.clone(),
                url.clone(),
                record.remote_certfile.clone(),
                record.remote_keyfile.clone(),
            ))) as ModuleInstance)
        } else {
            match &record.impl_key {
                Some(key) => match self.factories.get(key) {
                    Some(factory) => factory.build(ModuleContext {
                        name: record.name.clone(),
                        base: record.base,
                        options: record.options.clone(),
                        app: self.app.clone(),
                    }),
                    None => {
                        error!("Implementation \"{key}\" for module \"{name}\" is not registered");
                        record.instance = None;
                        record.state = ModuleState::NotLoaded;
                        return false;
                    }
                },
                None => {
                    error!("Module \"{name}\" has neither implementation key nor remote URL");
                    return false;
                }
            }
        };

        match built {
            Ok(instance) => {
                record.instance = Some(instance);
                record.state = ModuleState::Deactivated;
                self.emit_state(record);
                true
            }
            Err(err) => {
                error!(
                    "Error during initialization of {} module \"{name}\": {err:#}",
                    record.base
                );
                record.instance = None;
                record.state = ModuleState::NotLoaded;
                false
            }
        }
    }

    /// Resolve every declared connector slot to its configured peer instance
    /// and hand the peers to the module.
    fn connect_locked(&self, inner: &RegistryInner, name: &str) -> bool {
        let Some(record) = inner.modules.get(name) else { return false };
        let Some(key) = &record.impl_key else {
            // Remote-hosted modules resolve their wiring on the hosting process.
            return true;
        };
        let Some(factory) = self.factories.get(key) else {
            error!("Implementation \"{key}\" for module \"{name}\" is not registered");
            return false;
        };
        let Some(instance) = record.instance.clone() else {
            error!("Connection failed, no instance found for module \"{name}\"");
            return false;
        };

        let mut resolved: Vec<(String, ModuleInstance)> = Vec::new();
        for spec in factory.connectors() {
            let Some(peer_name) = record.connect_cfg.get(&spec.name) else {
                if spec.optional {
                    continue;
                }
                error!(
                    "Mandatory connector \"{}\" of module \"{name}\" is not configured",
                    spec.name
                );
                return false;
            };
            let Some(peer) = inner.modules.get(peer_name) else {
                error!(
                    "Module \"{name}\" connects slot \"{}\" to unknown module \"{peer_name}\"",
                    spec.name
                );
                return false;
            };
            if let Some(peer_key) = &peer.impl_key {
                match self.factories.get(peer_key) {
                    Some(peer_factory) if peer_factory.provides_capability(&spec.capability) => {}
                    Some(_) => {
                        error!(
                            "Module \"{peer_name}\" does not provide capability \"{}\" required \
                             by slot \"{}\" of \"{name}\"",
                            spec.capability, spec.name
                        );
                        return false;
                    }
                    None => {
                        error!(
                            "Implementation \"{peer_key}\" of peer \"{peer_name}\" is not registered"
                        );
                        return false;
                    }
                }
            }
            let Some(peer_instance) = peer.instance.clone() else {
                error!(
                    "Peer \"{peer_name}\" for slot \"{}\" of module \"{name}\" has no instance",
                    spec.name
                );
                return false;
            };
            resolved.push((spec.name.clone(), peer_instance));
        }

        let mut guard = instance.lock();
        for (slot, peer_instance) in resolved {
            if let Err(err) = guard.connect(&slot, peer_instance) {
                error!("Failed to connect slot \"{slot}\" of module \"{name}\": {err:#}");
                guard.disconnect_all();
                return false;
            }
        }
        true
    }

    fn release_worker_locked(&self, inner: &mut RegistryInner, name: &str) {
        let worker = inner
            .modules
            .get_mut(name)
            .and_then(|record| record.thread_name.take());
        if let Some(worker) = worker {
            self.threads.quit_thread(&worker);
            if !self.threads.join_thread(&worker, WORKER_JOIN_TIMEOUT) {
                error!("Worker thread \"{worker}\" did not terminate within {WORKER_JOIN_TIMEOUT:?}");
            }
        }
    }

    fn teardown_instance_locked(
        &self,
        inner: &mut RegistryInner,
        name: &str,
        to_state: ModuleState,
    ) {
        let Some(record) = inner.modules.get_mut(name) else { return };
        if let Some(instance) = record.instance.take() {
            instance.lock().disconnect_all();
        }
        record.state = to_state;
        self.emit_state(record);
    }

    fn emit_state(&self, record: &ManagedModule) {
        let _ = self.events.send(ModuleEvent::StateChanged {
            base: record.base,
            name: record.name.clone(),
            state: record.reported_state(),
        });
    }

    fn emit_app_data(&self, record: &ManagedModule, has_app_data: bool) {
        let _ = self.events.send(ModuleEvent::AppDataChanged {
            base: record.base,
            name: record.name.clone(),
            has_app_data,
        });
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        // Full teardown deactivates everything in dependency order.
        self.stop_all_modules();
    }
}
