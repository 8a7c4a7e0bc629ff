//! End-to-end lifecycle scenarios: dependency-ordered activation, cascade
//! deactivation, failure containment, reload and removal.

use anyhow::{anyhow, Result};
use labcore::{
    AppContext, Config, ConnectorSpec, Module, ModuleBase, ModuleContext, ModuleDescriptor,
    ModuleEvent, ModuleFactory, ModuleFactoryRegistry, ModuleInstance, ModuleState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type EventLog = Arc<Mutex<Vec<String>>>;

/// Test module that records its lifecycle on a shared log.
struct Probe {
    name: String,
    log: EventLog,
    fail_activation: bool,
    peers: Vec<ModuleInstance>,
}

impl Module for Probe {
    fn on_activate(&mut self) -> Result<()> {
        if self.fail_activation {
            return Err(anyhow!("probe \"{}\" told to fail", self.name));
        }
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.log.lock().push(format!("activate {} on {thread}", self.name));
        Ok(())
    }

    fn on_deactivate(&mut self) -> Result<()> {
        self.log.lock().push(format!("deactivate {}", self.name));
        Ok(())
    }

    fn connect(&mut self, _slot: &str, peer: ModuleInstance) -> Result<()> {
        self.peers.push(peer);
        Ok(())
    }

    fn disconnect_all(&mut self) {
        self.peers.clear();
    }
}

struct Fixture {
    ctx: Arc<AppContext>,
    log: EventLog,
    source_builds: Arc<AtomicUsize>,
    // Keeps the app-data directory alive for the fixture's lifetime.
    appdata: tempfile::TempDir,
}

impl Fixture {
    fn log_entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn clear_log(&self) {
        self.log.lock().clear();
    }
}

/// Three-module chain: hardware "a" <- logic "b" <- gui "c".
fn chain_fixture(fail_source: bool, affine_source: bool) -> Fixture {
    let log: EventLog = Arc::default();
    let source_builds = Arc::new(AtomicUsize::new(0));
    let factories = Arc::new(ModuleFactoryRegistry::new());

    {
        let log = log.clone();
        let source_builds = source_builds.clone();
        let build = move |ctx: ModuleContext| {
            source_builds.fetch_add(1, Ordering::SeqCst);
            Ok(AffineProbe {
                inner: Probe {
                    name: ctx.name,
                    log: log.clone(),
                    fail_activation: fail_source,
                    peers: Vec::new(),
                },
                affine: affine_source,
            })
        };
        factories.register(
            "hardware.test.Source",
            ModuleFactory::new(ModuleBase::Hardware, build).with_capability("source"),
        );
    }
    {
        let log = log.clone();
        factories.register(
            "logic.test.Processor",
            ModuleFactory::new(ModuleBase::Logic, move |ctx: ModuleContext| {
                Ok(Probe {
                    name: ctx.name,
                    log: log.clone(),
                    fail_activation: false,
                    peers: Vec::new(),
                })
            })
            .with_capability("processor")
            .with_connector(ConnectorSpec::new("source", "source")),
        );
    }
    {
        let log = log.clone();
        factories.register(
            "gui.test.Display",
            ModuleFactory::new(ModuleBase::Gui, move |ctx: ModuleContext| {
                Ok(Probe {
                    name: ctx.name,
                    log: log.clone(),
                    fail_activation: false,
                    peers: Vec::new(),
                })
            })
            .with_connector(ConnectorSpec::new("processor", "processor")),
        );
    }

    let appdata = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(factories, Some(appdata.path().to_path_buf()));

    let mut config = Config::default();
    config.hardware.insert(
        "a".to_string(),
        ModuleDescriptor::local("hardware.test", "Source"),
    );
    config.logic.insert(
        "b".to_string(),
        ModuleDescriptor::local("logic.test", "Processor").with_connection("source", "a"),
    );
    config.gui.insert(
        "c".to_string(),
        ModuleDescriptor::local("gui.test", "Display").with_connection("processor", "b"),
    );
    ctx.apply_config(&config).unwrap();

    Fixture {
        ctx,
        log,
        source_builds,
        appdata,
    }
}

/// Probe with a configurable thread affinity.
struct AffineProbe {
    inner: Probe,
    affine: bool,
}

impl Module for AffineProbe {
    fn on_activate(&mut self) -> Result<()> {
        self.inner.on_activate()
    }

    fn on_deactivate(&mut self) -> Result<()> {
        self.inner.on_deactivate()
    }

    fn connect(&mut self, slot: &str, peer: ModuleInstance) -> Result<()> {
        self.inner.connect(slot, peer)
    }

    fn disconnect_all(&mut self) {
        self.inner.disconnect_all();
    }

    fn thread_affine(&self) -> bool {
        self.affine
    }
}

#[test]
fn activation_runs_requirements_first() {
    let fx = chain_fixture(false, false);
    assert!(fx.ctx.registry().activate_module("c"));

    let entries = fx.log_entries();
    let order: Vec<&str> = entries
        .iter()
        .map(|e| e.split_whitespace().nth(1).unwrap())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    for name in ["a", "b", "c"] {
        assert!(fx.ctx.registry().is_active(name));
    }
}

#[test]
fn deactivation_cascades_to_dependents() {
    let fx = chain_fixture(false, false);
    assert!(fx.ctx.registry().activate_module("c"));
    fx.clear_log();

    assert!(fx.ctx.registry().deactivate_module("a"));
    assert_eq!(
        fx.log_entries(),
        vec!["deactivate c", "deactivate b", "deactivate a"]
    );
    for name in ["a", "b", "c"] {
        assert!(!fx.ctx.registry().is_active(name));
        assert_eq!(
            fx.ctx.registry().module_state(name),
            Some(ModuleState::Deactivated)
        );
    }
}

#[test]
fn failed_requirement_leaves_dependent_unchanged() {
    let fx = chain_fixture(true, false);
    let before = fx.ctx.registry().module_state("b");

    assert!(!fx.ctx.registry().activate_module("b"));

    // The failing requirement is marked broken, the dependent is untouched.
    assert_eq!(
        fx.ctx.registry().module_state("a"),
        Some(ModuleState::Broken)
    );
    assert_eq!(fx.ctx.registry().module_state("b"), before);
    assert!(fx
        .log_entries()
        .iter()
        .all(|entry| !entry.starts_with("activate")));
}

#[test]
fn deactivate_is_idempotent_without_duplicate_events() {
    let fx = chain_fixture(false, false);
    assert!(fx.ctx.registry().activate_module("b"));

    let mut events = fx.ctx.registry().subscribe();
    assert!(fx.ctx.registry().deactivate_module("b"));
    assert!(fx.ctx.registry().deactivate_module("b"));

    let mut b_state_changes = 0;
    while let Ok(event) = events.try_recv() {
        if let ModuleEvent::StateChanged { name, .. } = event {
            if name == "b" {
                b_state_changes += 1;
            }
        }
    }
    assert_eq!(b_state_changes, 1);
}

#[test]
fn reload_restores_active_closure_with_fresh_instance() {
    let fx = chain_fixture(false, false);
    assert!(fx.ctx.registry().activate_module("c"));
    assert_eq!(fx.source_builds.load(Ordering::SeqCst), 1);

    assert!(fx.ctx.registry().reload_module("a"));

    assert_eq!(fx.source_builds.load(Ordering::SeqCst), 2);
    for name in ["a", "b", "c"] {
        assert!(fx.ctx.registry().is_active(name), "{name} should be active");
    }
}

#[test]
fn remove_module_prunes_dependency_edges() {
    let fx = chain_fixture(false, false);
    assert!(fx.ctx.registry().remove_module("b", false));

    assert!(!fx.ctx.registry().is_registered("b"));
    assert!(fx.ctx.registry().required_of("c").unwrap().is_empty());
    assert!(fx.ctx.registry().dependents_of("a").unwrap().is_empty());
    // Unknown name is only accepted when missing modules are ignored.
    assert!(!fx.ctx.registry().remove_module("b", false));
    assert!(fx.ctx.registry().remove_module("b", true));
}

#[test]
fn duplicate_module_names_are_rejected() {
    let fx = chain_fixture(false, false);
    let result = fx.ctx.registry().add_module(
        "a",
        ModuleBase::Hardware,
        &ModuleDescriptor::local("hardware.test", "Source"),
        false,
    );
    assert!(result.is_err());
}

#[test]
fn thread_affine_hooks_run_on_the_module_worker() {
    let fx = chain_fixture(false, true);
    assert!(fx.ctx.registry().activate_module("a"));
    assert_eq!(
        fx.log_entries(),
        vec!["activate a on mod-hardware-a".to_string()]
    );
    assert!(fx.ctx.threads().has_thread("mod-hardware-a"));

    assert!(fx.ctx.registry().deactivate_module("a"));
    // The worker is released with its module.
    assert!(!fx.ctx.threads().has_thread("mod-hardware-a"));
}

#[test]
fn app_data_files_are_addressed_by_class_base_and_name() {
    let fx = chain_fixture(false, false);
    let path = fx.appdata.path().join("status-Source_hardware_a.cfg");
    std::fs::write(&path, "count=42\n").unwrap();

    assert!(fx.ctx.registry().has_app_data("a"));
    assert!(fx.ctx.registry().clear_module_app_data("a"));
    assert!(!fx.ctx.registry().has_app_data("a"));
    // Clearing again fails, there is nothing left to remove.
    assert!(!fx.ctx.registry().clear_module_app_data("a"));
}

/// Two logic modules wired to each other: a.pong -> b, b.ping -> a.
fn cyclic_fixture() -> (Arc<AppContext>, Config, tempfile::TempDir) {
    let factories = Arc::new(ModuleFactoryRegistry::new());
    for (key, capability, slot, peer_capability) in [
        ("logic.test.Ping", "ping", "pong", "pong"),
        ("logic.test.Pong", "pong", "ping", "ping"),
    ] {
        factories.register(
            key,
            ModuleFactory::new(ModuleBase::Logic, |ctx: ModuleContext| {
                Ok(Probe {
                    name: ctx.name,
                    log: Arc::default(),
                    fail_activation: false,
                    peers: Vec::new(),
                })
            })
            .with_capability(capability)
            .with_connector(ConnectorSpec::new(slot, peer_capability)),
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(factories, Some(dir.path().to_path_buf()));
    let mut config = Config::default();
    config.logic.insert(
        "a".to_string(),
        ModuleDescriptor::local("logic.test", "Ping").with_connection("pong", "b"),
    );
    config.logic.insert(
        "b".to_string(),
        ModuleDescriptor::local("logic.test", "Pong").with_connection("ping", "a"),
    );
    (ctx, config, dir)
}

#[test]
fn cyclic_wiring_is_rejected_when_config_is_applied() {
    let (ctx, config, _dir) = cyclic_fixture();
    let err = ctx.apply_config(&config).unwrap_err();
    assert!(err.to_string().contains("circular"), "got: {err}");
}

#[test]
fn cyclic_wiring_fails_activation_instead_of_recursing() {
    let (ctx, config, _dir) = cyclic_fixture();
    // Register the records one by one, skipping the whole-config validation.
    for (base, name, descriptor) in config.modules() {
        ctx.registry()
            .add_module(name, base, descriptor, false)
            .unwrap();
    }

    assert!(!ctx.registry().activate_module("a"));
    for name in ["a", "b"] {
        assert_eq!(
            ctx.registry().module_state(name),
            Some(ModuleState::NotLoaded)
        );
    }
}

#[test]
fn capability_mismatch_is_rejected_at_config_time() {
    let factories = Arc::new(ModuleFactoryRegistry::new());
    factories.register(
        "hardware.test.Source",
        ModuleFactory::new(ModuleBase::Hardware, |ctx: ModuleContext| {
            Ok(Probe {
                name: ctx.name,
                log: Arc::default(),
                fail_activation: false,
                peers: Vec::new(),
            })
        })
        .with_capability("source"),
    );
    factories.register(
        "logic.test.Processor",
        ModuleFactory::new(ModuleBase::Logic, |ctx: ModuleContext| {
            Ok(Probe {
                name: ctx.name,
                log: Arc::default(),
                fail_activation: false,
                peers: Vec::new(),
            })
        })
        .with_connector(ConnectorSpec::new("source", "wavemeter")),
    );

    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(factories, Some(dir.path().to_path_buf()));
    let mut config = Config::default();
    config.hardware.insert(
        "a".to_string(),
        ModuleDescriptor::local("hardware.test", "Source"),
    );
    config.logic.insert(
        "b".to_string(),
        ModuleDescriptor::local("logic.test", "Processor").with_connection("source", "a"),
    );

    let err = ctx.apply_config(&config).unwrap_err();
    assert!(err.to_string().contains("wavemeter"));
}
