//! Remote access service behavior and the TCP wire protocol.

use anyhow::{anyhow, Result};
use labcore::{
    AppContext, ArgValue, Config, Module, ModuleBase, ModuleDescriptor, ModuleFactory,
    ModuleFactoryRegistry, ModuleState, RemoteAccessServer, RemoteModuleClient, RemoteRef,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;

struct NullLaser {
    last_power_curve: Option<Value>,
}

impl NullLaser {
    fn new() -> Self {
        Self {
            last_power_curve: None,
        }
    }
}

impl Module for NullLaser {
    fn on_activate(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    fn call(
        &mut self,
        method: &str,
        mut args: Vec<Value>,
        _kwargs: HashMap<String, Value>,
    ) -> Result<Value> {
        match method {
            "set_power_curve" => {
                let curve = args.pop().ok_or_else(|| anyhow!("missing curve argument"))?;
                if !curve.is_array() {
                    return Err(anyhow!("power curve must arrive as a local array"));
                }
                self.last_power_curve = Some(curve);
                Ok(json!("ok"))
            }
            other => Err(anyhow!("laser has no method \"{other}\"")),
        }
    }
}

struct Fixture {
    ctx: Arc<AppContext>,
    _appdata: tempfile::TempDir,
}

/// One shared module ("laser") and one private one ("stage").
fn shared_fixture() -> Fixture {
    let factories = Arc::new(ModuleFactoryRegistry::new());
    factories.register(
        "hardware.test.NullLaser",
        ModuleFactory::new(ModuleBase::Hardware, |_ctx| Ok(NullLaser::new()))
            .with_capability("laser"),
    );

    let appdata = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(factories, Some(appdata.path().to_path_buf()));

    let mut config = Config::default();
    config.hardware.insert(
        "laser".to_string(),
        ModuleDescriptor::local("hardware.test", "NullLaser").with_remote_access(),
    );
    config.hardware.insert(
        "stage".to_string(),
        ModuleDescriptor::local("hardware.test", "NullLaser"),
    );
    ctx.apply_config(&config).unwrap();

    Fixture {
        ctx,
        _appdata: appdata,
    }
}

#[test]
fn unknown_or_unshared_modules_yield_nothing_and_mutate_nothing() {
    let fx = shared_fixture();
    let service = fx.ctx.remote();

    assert!(service.get_module_instance("ghost", true).is_none());
    assert!(service.get_module_instance("stage", true).is_none());

    // Nothing was loaded or activated along the way.
    assert_eq!(
        fx.ctx.registry().module_state("stage"),
        Some(ModuleState::NotLoaded)
    );
    assert_eq!(
        fx.ctx.registry().module_state("laser"),
        Some(ModuleState::NotLoaded)
    );
}

#[test]
fn name_lists_track_registry_state() {
    let fx = shared_fixture();
    let service = fx.ctx.remote();

    assert_eq!(service.get_available_module_names(), vec!["laser"]);
    assert!(service.get_loaded_module_names().is_empty());
    assert!(service.get_active_module_names().is_empty());

    let instance = service.get_module_instance("laser", true).unwrap();
    assert_eq!(instance.name, "laser");
    assert_eq!(instance.state, ModuleState::Idle);
    assert_eq!(service.get_loaded_module_names(), vec!["laser"]);
    assert_eq!(service.get_active_module_names(), vec!["laser"]);
}

#[test]
fn unsharing_a_module_hides_it_from_clients() {
    let fx = shared_fixture();
    let service = fx.ctx.remote();

    assert!(service.remove_shared_module("laser"));
    assert!(service.get_available_module_names().is_empty());
    assert!(service.get_module_instance("laser", true).is_none());
    // The module itself is still managed, only the share is gone.
    assert!(fx.ctx.registry().is_registered("laser"));
}

#[test]
fn module_proxy_localizes_by_ref_arguments() {
    let fx = shared_fixture();
    let service = fx.ctx.remote();

    // The resolver stands in for the transport pulling a compound value
    // out of the calling process.
    let proxy = service
        .get_module_proxy("laser", true, |remote_ref: &RemoteRef| {
            match remote_ref.id.as_str() {
                "curve-7" => Ok(json!([[0.0, 1.0], [10.0, 0.8]])),
                other => Err(anyhow!("unknown remote ref \"{other}\"")),
            }
        })
        .unwrap();
    assert!(proxy.is_alive());

    let result = proxy
        .call(
            "set_power_curve",
            vec![ArgValue::ByRef(RemoteRef {
                id: "curve-7".to_string(),
                type_name: Some("ndarray".to_string()),
            })],
            HashMap::new(),
        )
        .unwrap();
    assert_eq!(result, json!("ok"));

    // Unshared modules never hand out a proxy.
    assert!(service
        .get_module_proxy("stage", true, |_: &RemoteRef| Ok(Value::Null))
        .is_none());

    // The proxy does not keep the instance alive past its removal.
    assert!(fx.ctx.registry().remove_module("laser", false));
    assert!(!proxy.is_alive());
    assert!(proxy
        .call("set_power_curve", Vec::new(), HashMap::new())
        .is_err());
}

#[tokio::test]
#[serial]
async fn wire_round_trip_activates_and_lists() {
    let fx = shared_fixture();
    let server = RemoteAccessServer::new(fx.ctx.remote_service(), "127.0.0.1", 0);
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());

    let client = RemoteModuleClient::new("127.0.0.1", addr.port());
    let instance = tokio::task::spawn_blocking(move || {
        let instance = client.get_module_instance("laser", true)?;
        let names = client.get_active_module_names()?;
        Ok::<_, labcore::CoreError>((instance, names))
    })
    .await
    .unwrap()
    .unwrap();

    let (instance, active) = instance;
    let instance = instance.unwrap();
    assert_eq!(instance.name, "laser");
    assert_eq!(instance.state, ModuleState::Idle);
    assert_eq!(active, vec!["laser"]);
    assert!(fx.ctx.registry().is_active("laser"));
}

#[tokio::test]
#[serial]
async fn remote_hosted_module_activates_the_target_eagerly() {
    let host = shared_fixture();
    let server = RemoteAccessServer::new(host.ctx.remote_service(), "127.0.0.1", 0);
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());

    // A second application sees the host's laser as a remote-hosted module.
    let factories = Arc::new(ModuleFactoryRegistry::new());
    let appdata = tempfile::tempdir().unwrap();
    let consumer = AppContext::new(factories, Some(appdata.path().to_path_buf()));
    let mut config = Config::default();
    config.hardware.insert(
        "laser_link".to_string(),
        ModuleDescriptor::remote(format!("tcp://127.0.0.1:{}/laser", addr.port())),
    );
    consumer.apply_config(&config).unwrap();

    // Registering the stub alone touches nothing on the hosting side.
    assert_eq!(
        host.ctx.registry().module_state("laser"),
        Some(ModuleState::NotLoaded)
    );

    let activated = {
        let consumer = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || consumer.registry().activate_module("laser_link"))
            .await
            .unwrap()
    };
    assert!(activated);
    assert!(consumer.registry().is_active("laser_link"));
    // Referencing the stub activated the target where it lives.
    assert!(host.ctx.registry().is_active("laser"));

    // Dropping the local reference leaves the hosting side untouched.
    assert!(consumer.registry().deactivate_module("laser_link"));
    assert!(!consumer.registry().is_active("laser_link"));
    assert!(host.ctx.registry().is_active("laser"));
}

#[tokio::test]
#[serial]
async fn malformed_requests_get_an_error_reply() {
    let fx = shared_fixture();
    let server = RemoteAccessServer::new(fx.ctx.remote_service(), "127.0.0.1", 0);
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());

    let reply = tokio::task::spawn_blocking(move || {
        use std::io::{BufRead, BufReader, Write};
        let stream = std::net::TcpStream::connect(addr)?;
        let mut writer = stream.try_clone()?;
        writer.write_all(b"{\"op\":\"launch_missiles\"}\n")?;
        writer.flush()?;
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line)?;
        Ok::<_, std::io::Error>(line)
    })
    .await
    .unwrap()
    .unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(parsed["reply"], "error");
    assert!(parsed["message"]
        .as_str()
        .unwrap()
        .contains("malformed request"));
}
