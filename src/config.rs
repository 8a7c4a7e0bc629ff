//! Configuration schema for the module orchestration core.
//!
//! Configuration is a TOML document with one table of module descriptors per
//! base category, an optional startup list and an optional remote access
//! server section:
//!
//! ```toml
//! startup = ["scope_gui"]
//!
//! [remote_server]
//! host = "127.0.0.1"
//! port = 12345
//!
//! [hardware.laser_dummy]
//! module = "hardware.laser.dummy"
//! class = "DummyLaser"
//! remoteaccess = true
//! wavelength_nm = 780.0
//!
//! [logic.scan_logic]
//! module = "logic.scanning"
//! class = "ScanLogic"
//! [logic.scan_logic.connect]
//! laser = "laser_dummy"
//! ```
//!
//! Descriptor keys the schema does not claim for itself (`wavelength_nm`
//! above) are collected verbatim into an opaque options map and handed to the
//! module instance at construction time.
//!
//! Validation is eager: every semantic error in a descriptor raises
//! [`CoreError::Configuration`] at load time, so misconfiguration surfaces
//! before any activation is attempted. Descriptors are immutable once a
//! managed record has been created from them; changing one requires removing
//! and re-adding the module.

use crate::error::{CoreError, CoreResult};
use crate::module::ModuleBase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Declarative description of one managed module.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Implementation import path (e.g. `"hardware.laser.dummy"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Implementation type name within the import path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Connector slot name -> peer module name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connect: BTreeMap<String, String>,

    /// Whether remote processes may obtain this module through the remote
    /// access service.
    #[serde(default)]
    pub remoteaccess: bool,

    /// URL of the hosting process if this module lives elsewhere
    /// (e.g. `"tcp://192.168.1.4:12345/laser_dummy"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Client certificate for the connection to the remote host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<String>,

    /// Client key for the connection to the remote host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,

    /// Opaque module options; every key not claimed by the schema above.
    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

impl ModuleDescriptor {
    /// Local descriptor with an implementation reference.
    pub fn local(module: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            class: Some(class.into()),
            ..Self::default()
        }
    }

    /// Descriptor for a module hosted by a remote process.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            remote: Some(url.into()),
            ..Self::default()
        }
    }

    /// Add a connector wiring entry.
    pub fn with_connection(mut self, slot: impl Into<String>, peer: impl Into<String>) -> Self {
        self.connect.insert(slot.into(), peer.into());
        self
    }

    /// Allow remote processes to obtain this module.
    pub fn with_remote_access(mut self) -> Self {
        self.remoteaccess = true;
        self
    }

    /// Add an opaque option.
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Whether this module lives in another process.
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Dotted factory key for local descriptors.
    pub fn impl_key(&self) -> Option<String> {
        match (&self.module, &self.class) {
            (Some(module), Some(class)) => Some(format!("{module}.{class}")),
            _ => None,
        }
    }

    /// Implementation type name; remote-hosted modules report `"REMOTE"`.
    pub fn class_name(&self) -> &str {
        self.class.as_deref().unwrap_or("REMOTE")
    }

    /// Eager semantic validation, run at configuration load time.
    pub fn validate(&self, name: &str) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::Configuration(
                "module name must be a non-empty string".to_string(),
            ));
        }
        match (&self.module, &self.class, &self.remote) {
            (Some(_), Some(_), Some(_)) => {
                return Err(CoreError::Configuration(format!(
                    "module \"{name}\" declares both a local implementation and a remote URL"
                )));
            }
            (None, None, None) => {
                return Err(CoreError::Configuration(format!(
                    "module \"{name}\" must declare either module + class or a remote URL"
                )));
            }
            (Some(module), Some(class), None) => {
                if module.is_empty() || class.is_empty() {
                    return Err(CoreError::Configuration(format!(
                        "module \"{name}\" has an empty implementation reference"
                    )));
                }
            }
            (None, None, Some(url)) => {
                if url.is_empty() {
                    return Err(CoreError::Configuration(format!(
                        "module \"{name}\" has an empty remote URL"
                    )));
                }
                if !self.connect.is_empty() {
                    return Err(CoreError::Configuration(format!(
                        "remote-hosted module \"{name}\" must not declare connections; \
                         wiring is resolved on the hosting process"
                    )));
                }
            }
            _ => {
                return Err(CoreError::Configuration(format!(
                    "module \"{name}\" declares only one of module and class"
                )));
            }
        }
        if self.certfile.is_some() != self.keyfile.is_some() {
            return Err(CoreError::Configuration(format!(
                "module \"{name}\" must configure certfile and keyfile together"
            )));
        }
        if self.certfile.is_some() && self.remote.is_none() {
            return Err(CoreError::Configuration(format!(
                "module \"{name}\" configures certfile/keyfile without a remote URL"
            )));
        }
        Ok(())
    }

    /// Effective remote access flag: never propagated for remote-hosted
    /// modules, so a shared module is only ever served by its owning process.
    pub fn effective_remote_access(&self) -> bool {
        self.remoteaccess && self.remote.is_none()
    }
}

/// Remote access server section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    /// Listen address, `"localhost"` by default.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server certificate handed to the TLS terminator in front of the socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<String>,
    /// Server key handed to the TLS terminator in front of the socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    12345
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            certfile: None,
            keyfile: None,
        }
    }
}

/// Top-level configuration of the orchestration core.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// GUI module descriptors.
    #[serde(default)]
    pub gui: BTreeMap<String, ModuleDescriptor>,
    /// Logic module descriptors.
    #[serde(default)]
    pub logic: BTreeMap<String, ModuleDescriptor>,
    /// Hardware module descriptors.
    #[serde(default)]
    pub hardware: BTreeMap<String, ModuleDescriptor>,
    /// Modules to activate at application start.
    #[serde(default)]
    pub startup: Vec<String>,
    /// Remote access server section; absent means no server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_server: Option<RemoteServerConfig>,
    /// Override for the app-data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appdata_dir: Option<PathBuf>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let cfg: Config = raw.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Iterate all module descriptors with their base and name.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleBase, &String, &ModuleDescriptor)> {
        let gui = self.gui.iter().map(|(n, d)| (ModuleBase::Gui, n, d));
        let logic = self.logic.iter().map(|(n, d)| (ModuleBase::Logic, n, d));
        let hardware = self
            .hardware
            .iter()
            .map(|(n, d)| (ModuleBase::Hardware, n, d));
        gui.chain(logic).chain(hardware)
    }

    /// Eager validation of every descriptor plus cross-references.
    pub fn validate(&self) -> CoreResult<()> {
        let mut names: Vec<&String> = Vec::new();
        for (_base, name, descriptor) in self.modules() {
            if names.contains(&name) {
                return Err(CoreError::Configuration(format!(
                    "module name \"{name}\" is used more than once"
                )));
            }
            descriptor.validate(name)?;
            names.push(name);
        }
        for startup_name in &self.startup {
            if !names.iter().any(|n| *n == startup_name) {
                return Err(CoreError::Configuration(format!(
                    "startup module \"{startup_name}\" is not configured"
                )));
            }
        }
        if let Some(server) = &self.remote_server {
            if server.certfile.is_some() != server.keyfile.is_some() {
                return Err(CoreError::Configuration(
                    "remote_server must configure certfile and keyfile together".to_string(),
                ));
            }
        }
        Ok(())
    }
}
