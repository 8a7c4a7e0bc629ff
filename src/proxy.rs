//! Transparent proxy for dispatching marshalled calls onto a live module.
//!
//! A [`TransparentProxy`] wraps a module instance for callers that address it
//! through the dynamic [`Module::call`](crate::module::Module::call) seam,
//! typically on behalf of another process. It does two jobs:
//!
//! - Lifetime safety: the proxy holds a `Weak` reference and never extends
//!   the target's lifetime. Calls against a dropped target fail cleanly.
//! - Argument localization: scalar arguments cross as plain JSON values
//!   ([`ArgValue::Inline`]); compound values owned by the caller's process
//!   arrive as [`ArgValue::ByRef`] tokens and are pulled into local values
//!   through the proxy's resolver before the target ever sees them, with
//!   positional order preserved.
//!
//! Methods whose name starts with `_` are treated as private plumbing:
//! by-ref arguments bypass the resolver and reach the target in their
//! serialized token form.
//!
//! The proxy surface is a fixed, enumerated set of operations; no call
//! forwarding is synthesized at runtime beyond [`TransparentProxy::call`].

use crate::module::Module;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Token naming a value that lives in another process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Opaque identifier assigned by the owning process.
    pub id: String,
    /// Optional type hint for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

/// One call argument as it arrives at the proxy.
#[derive(Clone, Debug)]
pub enum ArgValue {
    /// Scalar or already-local value, passed through untouched.
    Inline(serde_json::Value),
    /// Compound value owned by the calling process, resolved before dispatch.
    ByRef(RemoteRef),
}

/// Resolver that pulls a by-ref argument into a local value.
pub type PullFn = Box<dyn Fn(&RemoteRef) -> Result<serde_json::Value> + Send + Sync>;

/// Weak-reference call wrapper around a module instance.
pub struct TransparentProxy<T: Module + ?Sized> {
    name: String,
    target: Weak<Mutex<T>>,
    pull: PullFn,
}

impl<T: Module + ?Sized> TransparentProxy<T> {
    /// Proxy for the given instance with a by-ref resolver.
    pub fn new<F>(name: impl Into<String>, target: &Arc<Mutex<T>>, pull: F) -> Self
    where
        F: Fn(&RemoteRef) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            target: Arc::downgrade(target),
            pull: Box::new(pull),
        }
    }

    /// Name of the proxied module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the proxied instance still exists.
    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Busy probe against the live instance; `None` once the target is gone.
    pub fn is_busy(&self) -> Option<bool> {
        self.target.upgrade().map(|target| target.lock().is_busy())
    }

    /// One-line human-readable description.
    pub fn describe(&self) -> String {
        let liveness = if self.is_alive() { "live" } else { "dead" };
        format!("proxy for module \"{}\" ({liveness} target)", self.name)
    }

    /// Localize the arguments and dispatch onto the target's dynamic call
    /// seam.
    ///
    /// Fails if the target has been dropped or a by-ref argument cannot be
    /// pulled. Target errors, including unknown methods, propagate
    /// unmodified.
    pub fn call(
        &self,
        method: &str,
        args: Vec<ArgValue>,
        kwargs: HashMap<String, ArgValue>,
    ) -> Result<serde_json::Value> {
        let target = self.target.upgrade().ok_or_else(|| {
            anyhow!(
                "target of proxy for module \"{}\" no longer exists",
                self.name
            )
        })?;

        // Private plumbing methods get their arguments verbatim.
        let marshal = !method.starts_with('_');
        let args = args
            .into_iter()
            .map(|arg| self.localize(arg, marshal))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(key, arg)| Ok((key, self.localize(arg, marshal)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let result = target.lock().call(method, args, kwargs);
        result
    }

    fn localize(&self, arg: ArgValue, marshal: bool) -> Result<serde_json::Value> {
        match arg {
            ArgValue::Inline(value) => Ok(value),
            ArgValue::ByRef(remote_ref) if marshal => (self.pull)(&remote_ref),
            ArgValue::ByRef(remote_ref) => Ok(serde_json::to_value(&remote_ref)?),
        }
    }
}

impl<T: Module + ?Sized> fmt::Debug for TransparentProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransparentProxy")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Records every dispatched call for inspection.
    struct EchoModule {
        calls: Vec<(String, Vec<Value>)>,
    }

    impl EchoModule {
        fn new() -> Self {
            Self { calls: Vec::new() }
        }
    }

    impl Module for EchoModule {
        fn on_activate(&mut self) -> Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self) -> Result<()> {
            Ok(())
        }

        fn call(
            &mut self,
            method: &str,
            args: Vec<Value>,
            _kwargs: HashMap<String, Value>,
        ) -> Result<Value> {
            if method == "fail" {
                return Err(anyhow!("fail asked to fail"));
            }
            self.calls.push((method.to_string(), args.clone()));
            Ok(json!(args.len()))
        }
    }

    fn pull_table(remote_ref: &RemoteRef) -> Result<Value> {
        match remote_ref.id.as_str() {
            "scan-points" => Ok(json!([[0.0, 0.0], [1.0, 0.5]])),
            other => Err(anyhow!("unknown remote ref \"{other}\"")),
        }
    }

    #[test]
    fn by_ref_arguments_are_localized_in_order() {
        let target = Arc::new(Mutex::new(EchoModule::new()));
        let proxy = TransparentProxy::new("scan_logic", &target, pull_table);

        let result = proxy
            .call(
                "set_scan",
                vec![
                    ArgValue::Inline(json!(3)),
                    ArgValue::ByRef(RemoteRef {
                        id: "scan-points".to_string(),
                        type_name: None,
                    }),
                ],
                HashMap::new(),
            )
            .unwrap();
        assert_eq!(result, json!(2));

        let guard = target.lock();
        let (method, args) = &guard.calls[0];
        assert_eq!(method, "set_scan");
        assert_eq!(args[0], json!(3));
        // The target sees a local value, not the reference token.
        assert_eq!(args[1], json!([[0.0, 0.0], [1.0, 0.5]]));
    }

    #[test]
    fn private_methods_bypass_marshalling() {
        let target = Arc::new(Mutex::new(EchoModule::new()));
        let proxy = TransparentProxy::new("scan_logic", &target, pull_table);

        proxy
            .call(
                "_raw",
                vec![ArgValue::ByRef(RemoteRef {
                    id: "scan-points".to_string(),
                    type_name: Some("ScanTable".to_string()),
                })],
                HashMap::new(),
            )
            .unwrap();

        let guard = target.lock();
        let (_, args) = &guard.calls[0];
        // Serialized token, untouched by the resolver.
        assert_eq!(args[0]["id"], json!("scan-points"));
        assert_eq!(args[0]["type_name"], json!("ScanTable"));
    }

    #[test]
    fn dead_target_is_an_error_not_a_panic() {
        let target = Arc::new(Mutex::new(EchoModule::new()));
        let proxy = TransparentProxy::new("scan_logic", &target, pull_table);
        drop(target);

        assert!(!proxy.is_alive());
        assert!(proxy.is_busy().is_none());
        assert!(proxy.call("anything", Vec::new(), HashMap::new()).is_err());
    }

    #[test]
    fn target_errors_propagate_unmodified() {
        let target = Arc::new(Mutex::new(EchoModule::new()));
        let proxy = TransparentProxy::new("scan_logic", &target, pull_table);

        let err = proxy
            .call("fail", Vec::new(), HashMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "fail asked to fail");
    }
}
