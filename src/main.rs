//! Demo binary: load a configuration, run the startup modules and serve the
//! remote access socket until interrupted.
//!
//! Ships two mock implementations (a dummy counter and a logic module wired
//! to it) so a sample configuration can exercise the full lifecycle without
//! real instruments.

use anyhow::{anyhow, Result};
use clap::Parser;
use labcore::{
    AppContext, Config, ConnectorSpec, Module, ModuleBase, ModuleContext, ModuleFactory,
    ModuleFactoryRegistry, ModuleInstance, RemoteAccessServer,
};
use log::{error, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "labcore", about = "Module orchestration core demo")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, e.g. "info" or "labcore=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Simulated counting hardware. Thread-affine so it gets a dedicated worker.
struct DummyCounter {
    name: String,
    rate_hz: f64,
    ticks: u64,
}

impl DummyCounter {
    fn new(ctx: ModuleContext) -> Result<Self> {
        let rate_hz = ctx
            .option("rate_hz")
            .and_then(Value::as_f64)
            .unwrap_or(10.0);
        Ok(Self {
            name: ctx.name,
            rate_hz,
            ticks: 0,
        })
    }
}

impl Module for DummyCounter {
    fn on_activate(&mut self) -> Result<()> {
        info!(
            "Dummy counter \"{}\" online at {} Hz on thread {:?}",
            self.name,
            self.rate_hz,
            std::thread::current().name()
        );
        Ok(())
    }

    fn on_deactivate(&mut self) -> Result<()> {
        info!("Dummy counter \"{}\" offline", self.name);
        Ok(())
    }

    fn thread_affine(&self) -> bool {
        true
    }

    fn call(
        &mut self,
        method: &str,
        _args: Vec<Value>,
        _kwargs: HashMap<String, Value>,
    ) -> Result<Value> {
        match method {
            "count" => {
                self.ticks += 1;
                Ok(json!({ "ticks": self.ticks, "rate_hz": self.rate_hz }))
            }
            other => Err(anyhow!("dummy counter has no method \"{other}\"")),
        }
    }
}

/// Logic module reading from a connected counter.
struct CounterLogic {
    counter: Option<ModuleInstance>,
}

impl CounterLogic {
    fn new(_ctx: ModuleContext) -> Result<Self> {
        Ok(Self { counter: None })
    }
}

impl Module for CounterLogic {
    fn on_activate(&mut self) -> Result<()> {
        if self.counter.is_none() {
            return Err(anyhow!("counter connector not satisfied"));
        }
        Ok(())
    }

    fn on_deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, slot: &str, peer: ModuleInstance) -> Result<()> {
        match slot {
            "counter" => {
                self.counter = Some(peer);
                Ok(())
            }
            other => Err(anyhow!("counter logic has no connector \"{other}\"")),
        }
    }

    fn disconnect_all(&mut self) {
        self.counter = None;
    }

    fn call(
        &mut self,
        method: &str,
        _args: Vec<Value>,
        _kwargs: HashMap<String, Value>,
    ) -> Result<Value> {
        match method {
            "read" => {
                let counter = self
                    .counter
                    .as_ref()
                    .ok_or_else(|| anyhow!("counter not connected"))?;
                counter.lock().call("count", Vec::new(), HashMap::new())
            }
            other => Err(anyhow!("counter logic has no method \"{other}\"")),
        }
    }
}

fn register_demo_modules(factories: &ModuleFactoryRegistry) {
    factories.register(
        "hardware.dummy.DummyCounter",
        ModuleFactory::new(ModuleBase::Hardware, DummyCounter::new).with_capability("counter"),
    );
    factories.register(
        "logic.counter.CounterLogic",
        ModuleFactory::new(ModuleBase::Logic, CounterLogic::new)
            .with_capability("counter_logic")
            .with_connector(ConnectorSpec::new("counter", "counter")),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.as_str()),
    )
    .init();

    let config = Config::from_file(&cli.config)?;
    let factories = Arc::new(ModuleFactoryRegistry::new());
    register_demo_modules(&factories);

    let ctx = AppContext::new(factories, config.appdata_dir.clone());
    ctx.apply_config(&config)?;
    if !ctx.startup() {
        error!("Not all startup modules came up, continuing with partial application");
    }

    let server_task = match ctx.remote_server_config() {
        Some(server_config) => {
            let server = RemoteAccessServer::new(
                ctx.remote_service(),
                server_config.host.clone(),
                server_config.port,
            )
            .with_certfile(server_config.certfile.clone());
            let bound = server.bind().await?;
            Some(tokio::spawn(async move {
                if let Err(err) = bound.serve().await {
                    error!("Remote access server failed: {err}");
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    if let Some(task) = server_task {
        task.abort();
    }
    ctx.teardown();
    Ok(())
}
