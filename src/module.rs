//! Module traits, lifecycle states and implementation factories.
//!
//! A *module* is a pluggable gui/logic/hardware unit managed by the
//! [`ModuleRegistry`](crate::registry::ModuleRegistry). This file defines the
//! pieces a module implementation interacts with:
//!
//! - [`Module`]: the lifecycle and connector interface every implementation
//!   provides. Hooks return `anyhow::Result` so implementations can bubble up
//!   arbitrary device errors; the registry converts them into log entries and
//!   state transitions, never into panics.
//! - [`ModuleBase`] / [`ModuleState`]: coarse category and lifecycle state.
//! - [`ModuleFactory`] / [`ModuleFactoryRegistry`]: the implementation
//!   resolution seam. Configuration refers to implementations by a dotted
//!   `"<path>.<Type>"` key; the factory registry maps that key to a build
//!   function plus the implementation's declared base, capabilities and
//!   connector slots. Declaring capabilities up front lets wiring be validated
//!   when configuration is applied instead of at first use.
//!
//! # Connectors
//!
//! A connector is a named dependency slot: `ConnectorSpec { name, capability,
//! optional }`. At activation time the registry resolves each configured slot
//! to the peer module's live instance and hands it to
//! [`Module::connect`]. Mandatory slots without a configured, satisfying peer
//! abort the activation.

use crate::context::AppContext;
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

/// Coarse module category used for dependency and namespacing rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleBase {
    Gui,
    Logic,
    Hardware,
}

impl fmt::Display for ModuleBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleBase::Gui => "gui",
            ModuleBase::Logic => "logic",
            ModuleBase::Hardware => "hardware",
        };
        f.write_str(s)
    }
}

impl FromStr for ModuleBase {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gui" => Ok(ModuleBase::Gui),
            "logic" => Ok(ModuleBase::Logic),
            "hardware" => Ok(ModuleBase::Hardware),
            other => Err(crate::error::CoreError::Configuration(format!(
                "no valid module base \"{other}\" (expected gui, logic or hardware)"
            ))),
        }
    }
}

/// Lifecycle state of a managed module.
///
/// ```text
/// NotLoaded ──load──> Deactivated ──activate──> Idle ⇄ Busy
///                          ^                      │
///                          └───── deactivate ─────┘
/// ```
///
/// `Broken` is absorbing: it is entered when a lifecycle hook fails and only
/// a reload can leave it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// No instance exists yet.
    NotLoaded,
    /// Instance exists but the activation hook has not run (or deactivation completed).
    Deactivated,
    /// Active and idle.
    Idle,
    /// Active and busy running module logic.
    Busy,
    /// A lifecycle hook failed; the instance can no longer be trusted.
    Broken,
}

impl ModuleState {
    /// Whether the module counts as active (idle or busy).
    pub fn is_active(self) -> bool {
        matches!(self, ModuleState::Idle | ModuleState::Busy)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::NotLoaded => "not loaded",
            ModuleState::Deactivated => "deactivated",
            ModuleState::Idle => "idle",
            ModuleState::Busy => "busy",
            ModuleState::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Shared handle to a live module instance.
///
/// The managed record owns the instance; connector peers and worker threads
/// hold clones of the `Arc` for the duration of a hook or connection.
pub type ModuleInstance = Arc<Mutex<dyn Module>>;

/// Lifecycle and connector interface of a module implementation.
///
/// Implementations must be `Send` so thread-affine modules can run their
/// hooks on a dedicated worker thread.
pub trait Module: Send {
    /// Activation hook. Runs after all required modules are active and all
    /// connectors are resolved. For thread-affine modules this executes on
    /// the assigned worker thread while the caller blocks.
    fn on_activate(&mut self) -> Result<()>;

    /// Deactivation hook. Runs after all dependent modules have been
    /// deactivated, with the same cross-thread discipline as activation.
    fn on_deactivate(&mut self) -> Result<()>;

    /// Receive the live instance of the peer configured for `slot`.
    ///
    /// Called once per configured slot before the activation hook. The
    /// default rejects every slot; implementations declaring connectors in
    /// their factory must override this.
    fn connect(&mut self, slot: &str, peer: ModuleInstance) -> Result<()> {
        let _ = peer;
        Err(anyhow::anyhow!("module does not accept connector \"{slot}\""))
    }

    /// Drop all peer handles taken in [`Module::connect`].
    fn disconnect_all(&mut self) {}

    /// Whether the module is currently busy. An active module reporting busy
    /// shows up as [`ModuleState::Busy`].
    fn is_busy(&self) -> bool {
        false
    }

    /// Thread-affine modules get a dedicated worker thread and have their
    /// lifecycle hooks executed there via a blocking cross-thread call.
    fn thread_affine(&self) -> bool {
        false
    }

    /// Dynamic dispatch entry point used by the remote access layer and the
    /// transparent proxy. Method names starting with `_` are considered
    /// private by the proxy and bypass argument marshalling.
    fn call(
        &mut self,
        method: &str,
        args: Vec<serde_json::Value>,
        kwargs: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let _ = (args, kwargs);
        Err(anyhow::anyhow!(
            "module has no remote-callable method \"{method}\""
        ))
    }
}

/// A named, typed dependency slot a module implementation declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorSpec {
    /// Slot name referenced by the `connect` table in configuration.
    pub name: String,
    /// Capability the configured peer must provide.
    pub capability: String,
    /// Optional slots may stay unconfigured.
    pub optional: bool,
}

impl ConnectorSpec {
    /// Mandatory connector slot.
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            optional: false,
        }
    }

    /// Mark the slot as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Construction context injected into every module instance.
///
/// Carries the configured options verbatim plus a weak back-reference to the
/// owning [`AppContext`]; modules must never hold a strong reference to the
/// application.
#[derive(Clone)]
pub struct ModuleContext {
    /// Unique module name from configuration.
    pub name: String,
    /// Declared base category.
    pub base: ModuleBase,
    /// Opaque configuration options (everything the descriptor schema does
    /// not claim for itself).
    pub options: HashMap<String, serde_json::Value>,
    /// Weak back-reference to the host application.
    pub app: Weak<AppContext>,
}

impl ModuleContext {
    /// Look up a configuration option by key.
    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .finish()
    }
}

type BuildFn = Box<dyn Fn(ModuleContext) -> Result<ModuleInstance> + Send + Sync>;

/// Factory entry for one module implementation.
///
/// Stands in for dynamic class import: the build function plus the statically
/// declared base, capabilities and connector slots of the implementation.
pub struct ModuleFactory {
    base: ModuleBase,
    provides: Vec<String>,
    connectors: Vec<ConnectorSpec>,
    build: BuildFn,
}

impl ModuleFactory {
    /// Create a factory from a plain constructor function.
    pub fn new<M, F>(base: ModuleBase, build: F) -> Self
    where
        M: Module + 'static,
        F: Fn(ModuleContext) -> Result<M> + Send + Sync + 'static,
    {
        Self {
            base,
            provides: Vec::new(),
            connectors: Vec::new(),
            build: Box::new(move |ctx| {
                let instance = build(ctx)?;
                Ok(Arc::new(Mutex::new(instance)) as ModuleInstance)
            }),
        }
    }

    /// Declare a capability this implementation provides to connector peers.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.provides.push(capability.into());
        self
    }

    /// Declare a connector slot this implementation exposes.
    pub fn with_connector(mut self, spec: ConnectorSpec) -> Self {
        self.connectors.push(spec);
        self
    }

    /// Declared base category.
    pub fn base(&self) -> ModuleBase {
        self.base
    }

    /// Declared capabilities.
    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    /// Declared connector slots.
    pub fn connectors(&self) -> &[ConnectorSpec] {
        &self.connectors
    }

    /// Look up a declared connector slot by name.
    pub fn connector(&self, name: &str) -> Option<&ConnectorSpec> {
        self.connectors.iter().find(|c| c.name == name)
    }

    /// Whether the implementation provides the given capability.
    pub fn provides_capability(&self, capability: &str) -> bool {
        self.provides.iter().any(|c| c == capability)
    }

    /// Instantiate the implementation.
    pub fn build(&self, ctx: ModuleContext) -> Result<ModuleInstance> {
        (self.build)(ctx)
    }
}

impl fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("base", &self.base)
            .field("provides", &self.provides)
            .field("connectors", &self.connectors)
            .finish()
    }
}

/// Registry of module implementation factories, keyed by the dotted
/// `"<path>.<Type>"` implementation reference used in configuration.
#[derive(Default)]
pub struct ModuleFactoryRegistry {
    factories: Mutex<HashMap<String, Arc<ModuleFactory>>>,
}

impl ModuleFactoryRegistry {
    /// Create an empty factory registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under its dotted key. Replaces any previous
    /// entry for the same key.
    pub fn register(&self, key: impl Into<String>, factory: ModuleFactory) {
        self.factories.lock().insert(key.into(), Arc::new(factory));
    }

    /// Resolve an implementation key.
    pub fn get(&self, key: &str) -> Option<Arc<ModuleFactory>> {
        self.factories.lock().get(key).cloned()
    }

    /// Whether a key is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.factories.lock().contains_key(key)
    }

    /// All registered implementation keys.
    pub fn keys(&self) -> Vec<String> {
        self.factories.lock().keys().cloned().collect()
    }
}
