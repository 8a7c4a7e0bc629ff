//! Orchestration core for modular laboratory instrument-control software.
//!
//! An application is assembled from pluggable gui/logic/hardware modules
//! described in a TOML configuration. This crate manages their shared
//! lifecycle machinery:
//!
//! - [`config`]: declarative module descriptors, eagerly validated.
//! - [`module`]: the [`Module`](module::Module) trait, lifecycle states and
//!   the implementation factory registry.
//! - [`registry`]: the managed-module arena with dependency-ordered
//!   activation, cascade deactivation and live reload.
//! - [`threads`]: named worker threads for thread-affine modules.
//! - [`remote`]: sharing modules with other processes over TCP.
//! - [`proxy`]: weak-reference call wrapper with argument localization.
//! - [`context`]: the composition root tying it all together.
//!
//! The registry treats hook failures as data, not as crashes: a failing
//! module ends up `Broken` and logged, and the rest of the application keeps
//! running.

pub mod config;
pub mod context;
pub mod error;
pub mod module;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod threads;

pub use config::{Config, ModuleDescriptor, RemoteServerConfig};
pub use context::AppContext;
pub use error::{CoreError, CoreResult};
pub use module::{
    ConnectorSpec, Module, ModuleBase, ModuleContext, ModuleFactory, ModuleFactoryRegistry,
    ModuleInstance, ModuleState,
};
pub use proxy::{ArgValue, RemoteRef, TransparentProxy};
pub use registry::{ModuleEvent, ModuleRegistry};
pub use remote::{InstanceRef, RemoteAccessServer, RemoteAccessService, RemoteModuleClient};
pub use threads::ThreadRegistry;
