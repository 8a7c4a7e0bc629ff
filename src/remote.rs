//! Remote access: sharing modules with other processes over TCP.
//!
//! Three pieces:
//!
//! - [`RemoteAccessService`]: the in-process share table. Holds its own lock,
//!   independent of the registry lock, and never calls into the registry
//!   while holding it. Transports that forward method calls obtain a
//!   [`TransparentProxy`] through it so compound arguments are localized
//!   before the module runs.
//! - [`RemoteAccessServer`]: a tokio TCP listener speaking newline-delimited
//!   JSON frames ([`RemoteRequest`] / [`RemoteResponse`]), one task per
//!   connection. The wire surface is exactly the four service operations;
//!   instances cross the wire as [`InstanceRef`] tokens, never as objects.
//! - [`RemoteModuleClient`] / [`RemoteModuleStub`]: the consuming side. A
//!   remote-hosted descriptor loads a stub instead of a factory-built
//!   instance; the stub obtains its `InstanceRef` eagerly on activation.
//!
//! Encryption is delegated to the transport layer: certfile/keyfile settings
//! are accepted and passed through, no TLS handshake happens in this crate.

use crate::context::AppContext;
use crate::error::{CoreError, CoreResult};
use crate::module::{Module, ModuleBase, ModuleState};
use crate::proxy::{RemoteRef, TransparentProxy};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Transport-level reference to a module instance living in this process.
///
/// This is what a client gets instead of the object itself: enough to name
/// the module in follow-up requests and to mirror its lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Module name on the hosting process.
    pub name: String,
    /// Lifecycle state at the time of the request.
    pub state: ModuleState,
}

/// Request frames of the remote access protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteRequest {
    /// Obtain an instance reference, optionally activating the module first.
    GetModuleInstance {
        id: String,
        name: String,
        #[serde(default)]
        activate: bool,
    },
    /// Names of all shared modules.
    GetAvailableModuleNames { id: String },
    /// Names of shared modules that currently have an instance.
    GetLoadedModuleNames { id: String },
    /// Names of shared modules that are currently active.
    GetActiveModuleNames { id: String },
}

impl RemoteRequest {
    fn id(&self) -> &str {
        match self {
            RemoteRequest::GetModuleInstance { id, .. }
            | RemoteRequest::GetAvailableModuleNames { id }
            | RemoteRequest::GetLoadedModuleNames { id }
            | RemoteRequest::GetActiveModuleNames { id } => id,
        }
    }
}

/// Response frames of the remote access protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum RemoteResponse {
    /// Answer to `get_module_instance`; `instance` is absent for unknown or
    /// unshared names.
    ModuleInstance {
        id: String,
        ts: String,
        instance: Option<InstanceRef>,
    },
    /// Answer to the three name-list operations.
    ModuleNames {
        id: String,
        ts: String,
        names: Vec<String>,
    },
    /// Malformed or unserviceable request.
    Error { id: String, ts: String, message: String },
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a `tcp://host:port/module_name` remote URL.
pub fn parse_remote_url(url: &str) -> CoreResult<(String, u16, String)> {
    let malformed = || {
        CoreError::Remote(format!(
            "malformed remote URL \"{url}\", expected tcp://host:port/module_name"
        ))
    };
    let rest = url.strip_prefix("tcp://").ok_or_else(malformed)?;
    let (addr, name) = rest.split_once('/').ok_or_else(malformed)?;
    let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
    let port: u16 = port.parse().map_err(|_| malformed())?;
    if host.is_empty() || name.is_empty() {
        return Err(malformed());
    }
    Ok((host.to_string(), port, name.to_string()))
}

struct SharedEntry {
    base: ModuleBase,
}

/// Table of modules this process shares with remote clients.
///
/// Entries are added when a descriptor enables remote access and pruned
/// synchronously when the module is removed from the registry.
pub struct RemoteAccessService {
    app: Weak<AppContext>,
    shared: Mutex<BTreeMap<String, SharedEntry>>,
}

impl RemoteAccessService {
    pub(crate) fn new(app: Weak<AppContext>) -> Self {
        Self {
            app,
            shared: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a module to the share table. Re-sharing an already shared name
    /// just updates the entry.
    pub fn share_module(&self, name: &str, base: ModuleBase) {
        self.shared
            .lock()
            .insert(name.to_string(), SharedEntry { base });
        debug!("Shared {base} module \"{name}\" for remote access");
    }

    /// Remove a module from the share table. Unknown names are a no-op.
    pub fn remove_shared_module(&self, name: &str) -> bool {
        let removed = self.shared.lock().remove(name);
        if let Some(entry) = &removed {
            info!(
                "Stopped sharing {} module \"{name}\" via remote access service",
                entry.base
            );
        }
        removed.is_some()
    }

    /// Whether the named module is shared.
    pub fn is_shared(&self, name: &str) -> bool {
        self.shared.lock().contains_key(name)
    }

    /// Names of all shared modules, sorted.
    pub fn get_available_module_names(&self) -> Vec<String> {
        self.shared.lock().keys().cloned().collect()
    }

    /// Names of shared modules that currently have an instance.
    pub fn get_loaded_module_names(&self) -> Vec<String> {
        let names = self.get_available_module_names();
        match self.app.upgrade() {
            Some(ctx) => names
                .into_iter()
                .filter(|name| ctx.registry().is_loaded(name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Names of shared modules that are currently active.
    pub fn get_active_module_names(&self) -> Vec<String> {
        let names = self.get_available_module_names();
        match self.app.upgrade() {
            Some(ctx) => names
                .into_iter()
                .filter(|name| ctx.registry().is_active(name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve a shared module to an [`InstanceRef`], optionally activating
    /// it first.
    ///
    /// Unknown or unshared names log a warning and return `None` without
    /// mutating anything. A failed activation also returns `None`; the
    /// failure itself is logged by the registry.
    pub fn get_module_instance(&self, name: &str, activate: bool) -> Option<InstanceRef> {
        if !self.is_shared(name) {
            warn!("Client requested module \"{name}\" which is not shared");
            return None;
        }
        let ctx = self.app.upgrade()?;
        let registry = ctx.registry();
        if !registry.is_registered(name) {
            warn!("Shared module \"{name}\" is no longer registered");
            return None;
        }
        if activate && !registry.is_active(name) && !registry.activate_module(name) {
            return None;
        }
        let state = registry.module_state(name)?;
        Some(InstanceRef {
            name: name.to_string(),
            state,
        })
    }

    /// Wrap a shared module's live instance for marshalled dispatch.
    ///
    /// This is the hand-off point for transports that forward method calls
    /// into the module: the returned proxy holds the instance weakly and
    /// pulls by-ref arguments through `pull` before the module sees them.
    /// Returns `None` for unshared names or when the instance does not exist
    /// (pass `activate` to bring it up first).
    pub fn get_module_proxy<F>(
        &self,
        name: &str,
        activate: bool,
        pull: F,
    ) -> Option<TransparentProxy<dyn Module>>
    where
        F: Fn(&RemoteRef) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.get_module_instance(name, activate)?;
        let ctx = self.app.upgrade()?;
        let instance = ctx.registry().instance(name)?;
        Some(TransparentProxy::new(name, &instance, pull))
    }

    fn dispatch(&self, request: RemoteRequest) -> RemoteResponse {
        match request {
            RemoteRequest::GetModuleInstance { id, name, activate } => {
                RemoteResponse::ModuleInstance {
                    id,
                    ts: timestamp(),
                    instance: self.get_module_instance(&name, activate),
                }
            }
            RemoteRequest::GetAvailableModuleNames { id } => RemoteResponse::ModuleNames {
                id,
                ts: timestamp(),
                names: self.get_available_module_names(),
            },
            RemoteRequest::GetLoadedModuleNames { id } => RemoteResponse::ModuleNames {
                id,
                ts: timestamp(),
                names: self.get_loaded_module_names(),
            },
            RemoteRequest::GetActiveModuleNames { id } => RemoteResponse::ModuleNames {
                id,
                ts: timestamp(),
                names: self.get_active_module_names(),
            },
        }
    }
}

/// TCP front end for a [`RemoteAccessService`].
pub struct RemoteAccessServer {
    service: Arc<RemoteAccessService>,
    host: String,
    port: u16,
    certfile: Option<String>,
}

impl RemoteAccessServer {
    /// Create a server for the given service and listen address.
    pub fn new(service: Arc<RemoteAccessService>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service,
            host: host.into(),
            port,
            certfile: None,
        }
    }

    /// Record the certificate handed to the transport-layer TLS terminator.
    pub fn with_certfile(mut self, certfile: Option<String>) -> Self {
        self.certfile = certfile;
        self
    }

    /// Bind the listen socket. Port 0 binds an ephemeral port, observable
    /// through [`BoundRemoteServer::local_addr`].
    pub async fn bind(self) -> CoreResult<BoundRemoteServer> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!(
            "Remote access server listening on {}",
            listener.local_addr()?
        );
        if self.certfile.is_some() {
            info!("Remote access encryption delegated to transport layer (certfile configured)");
        }
        Ok(BoundRemoteServer {
            listener,
            service: self.service,
        })
    }
}

/// A bound remote access server, ready to accept connections.
pub struct BoundRemoteServer {
    listener: TcpListener,
    service: Arc<RemoteAccessService>,
}

impl BoundRemoteServer {
    /// Actual listen address.
    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped, one session task per
    /// client.
    pub async fn serve(self) -> CoreResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let session = Uuid::new_v4();
            let service = Arc::clone(&self.service);
            info!("Client connected from {peer} (session {session})");
            tokio::spawn(async move {
                if let Err(err) = handle_session(stream, &service).await {
                    warn!("Session {session} with {peer} ended with error: {err}");
                }
                info!("Client {peer} disconnected (session {session})");
            });
        }
    }
}

async fn handle_session(stream: TcpStream, service: &RemoteAccessService) -> CoreResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RemoteRequest>(&line) {
            Ok(request) => {
                debug!("Remote request {}: {line}", request.id());
                service.dispatch(request)
            }
            Err(err) => RemoteResponse::Error {
                id: String::new(),
                ts: timestamp(),
                message: format!("malformed request: {err}"),
            },
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

/// Blocking client for a remote access server.
///
/// Used from the synchronous registry path, so it deliberately speaks plain
/// `std::net` instead of the async stack; one connection per request keeps it
/// free of session state.
pub struct RemoteModuleClient {
    host: String,
    port: u16,
}

impl RemoteModuleClient {
    /// Client for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn roundtrip(&self, request: &RemoteRequest) -> CoreResult<RemoteResponse> {
        let stream = std::net::TcpStream::connect((self.host.as_str(), self.port))?;
        let mut writer = stream.try_clone()?;
        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes())?;
        writer.flush()?;

        let mut reader = std::io::BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(CoreError::Remote(format!(
                "server {}:{} closed the connection without replying",
                self.host, self.port
            )));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Obtain an instance reference for a shared module on the server.
    pub fn get_module_instance(
        &self,
        name: &str,
        activate: bool,
    ) -> CoreResult<Option<InstanceRef>> {
        let request = RemoteRequest::GetModuleInstance {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            activate,
        };
        match self.roundtrip(&request)? {
            RemoteResponse::ModuleInstance { instance, .. } => Ok(instance),
            RemoteResponse::Error { message, .. } => Err(CoreError::Remote(message)),
            other => Err(CoreError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Names of all modules the server shares.
    pub fn get_available_module_names(&self) -> CoreResult<Vec<String>> {
        self.name_list(RemoteRequest::GetAvailableModuleNames {
            id: Uuid::new_v4().to_string(),
        })
    }

    /// Names of shared modules with an instance on the server.
    pub fn get_loaded_module_names(&self) -> CoreResult<Vec<String>> {
        self.name_list(RemoteRequest::GetLoadedModuleNames {
            id: Uuid::new_v4().to_string(),
        })
    }

    /// Names of shared modules active on the server.
    pub fn get_active_module_names(&self) -> CoreResult<Vec<String>> {
        self.name_list(RemoteRequest::GetActiveModuleNames {
            id: Uuid::new_v4().to_string(),
        })
    }

    fn name_list(&self, request: RemoteRequest) -> CoreResult<Vec<String>> {
        match self.roundtrip(&request)? {
            RemoteResponse::ModuleNames { names, .. } => Ok(names),
            RemoteResponse::Error { message, .. } => Err(CoreError::Remote(message)),
            other => Err(CoreError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }
}

/// In-registry stand-in for a module hosted by another process.
///
/// Loaded instead of a factory-built instance when a descriptor carries a
/// remote URL. Activation eagerly asks the hosting process for the module,
/// activating it there if necessary; deactivation only drops the local
/// reference, the hosting process owns the module's lifetime.
pub struct RemoteModuleStub {
    local_name: String,
    url: String,
    certfile: Option<String>,
    keyfile: Option<String>,
    client: Option<RemoteModuleClient>,
    remote_name: Option<String>,
    instance: Option<InstanceRef>,
}

impl RemoteModuleStub {
    /// Stub for the given local module name and remote URL. The URL is
    /// parsed on activation, not here.
    pub fn new(
        local_name: String,
        url: String,
        certfile: Option<String>,
        keyfile: Option<String>,
    ) -> Self {
        Self {
            local_name,
            url,
            certfile,
            keyfile,
            client: None,
            remote_name: None,
            instance: None,
        }
    }

    /// The instance reference obtained at activation, if any.
    pub fn instance_ref(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }
}

impl Module for RemoteModuleStub {
    fn on_activate(&mut self) -> anyhow::Result<()> {
        let (host, port, remote_name) = parse_remote_url(&self.url)?;
        if self.certfile.is_some() && self.keyfile.is_some() {
            debug!(
                "Connecting to remote module \"{remote_name}\" with transport-layer encryption"
            );
        }
        let client = RemoteModuleClient::new(host, port);
        match client.get_module_instance(&remote_name, true)? {
            Some(instance) => {
                info!(
                    "Module \"{}\" bound to remote module \"{remote_name}\" (state \"{}\")",
                    self.local_name, instance.state
                );
                self.client = Some(client);
                self.remote_name = Some(remote_name);
                self.instance = Some(instance);
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "remote host does not share a module named \"{remote_name}\""
            )),
        }
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        // The hosting process owns the remote module's lifetime; only the
        // local reference is dropped.
        self.client = None;
        self.remote_name = None;
        self.instance = None;
        Ok(())
    }

    fn is_busy(&self) -> bool {
        let (Some(client), Some(remote_name)) = (&self.client, &self.remote_name) else {
            return false;
        };
        match client.get_module_instance(remote_name, false) {
            Ok(Some(instance)) => instance.state == ModuleState::Busy,
            _ => false,
        }
    }
}
