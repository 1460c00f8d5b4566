//! Named, versioned lookup tables for orchestration and activity handlers.
//!
//! Orchestrations register under a semver version (unversioned registration
//! lands on `1.0.0`). New orchestration instances resolve through a per-name
//! [`VersionPolicy`]; replayed executions always resolve the exact version
//! pinned in their `OrchestrationStarted` event, so upgrading a registry never
//! rewrites the behavior of in-flight instances.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use semver::Version;
use tracing::debug;

use crate::_typed_codec::{Codec, Json};
use crate::runtime::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;

/// Version registered by the unversioned `register` helpers.
pub const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// How new instances of an orchestration pick a version at start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Start new instances on the highest registered version.
    Latest,
    /// Pin new instances to one registered version.
    Exact(Version),
}

/// Immutable handler table shared by the runtime and client.
///
/// Cloning is cheap; clones share the underlying maps. The version policy map
/// stays mutable behind a lock so deployments can repin names at runtime.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Registry<H> {
    /// Resolve `name` for a new instance according to its version policy.
    ///
    /// Returns the chosen version alongside the handler so the caller can pin
    /// it into history.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let versions = match self.inner.get(name) {
            Some(v) => v,
            None => {
                self.log_miss(name, None);
                return None;
            }
        };
        let policy = self
            .policy
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);
        let resolved = match policy {
            VersionPolicy::Latest => versions
                .iter()
                .next_back()
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.get(&v).map(|h| (v.clone(), Arc::clone(h))),
        };
        if resolved.is_none() {
            self.log_miss(name, Some(versions.keys().cloned().collect()));
        }
        resolved
    }

    /// Resolve the exact version pinned in a recorded `OrchestrationStarted`.
    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let found = self.inner.get(name).and_then(|m| m.get(version)).cloned();
        if found.is_none() {
            self.log_miss(name, self.inner.get(name).map(|m| m.keys().cloned().collect()));
        }
        found
    }

    /// Replace the version policy for `name`. Affects only instances started
    /// after the call.
    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy.lock().unwrap().insert(name.to_string(), policy);
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered versions for `name`, ascending.
    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn log_miss(&self, name: &str, versions: Option<Vec<Version>>) {
        match versions {
            Some(versions) => debug!(
                target: "duratask::runtime::registry",
                name,
                registered = ?versions.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                "no handler at requested version"
            ),
            None => debug!(
                target: "duratask::runtime::registry",
                name,
                registered = ?self.list_names(),
                "no handler registered under this name"
            ),
        }
    }
}

/// Registry of orchestration handlers keyed by name and version.
pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;

/// Registry of activity handlers. Activities are unversioned; every entry
/// lives at [`DEFAULT_VERSION`].
pub type ActivityRegistry = Registry<dyn ActivityHandler>;

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder::default()
    }
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }
}

/// Builder for [`OrchestrationRegistry`].
///
/// Recoverable mistakes (duplicate or unparsable versions) accumulate and
/// surface from [`build_result`](Self::build_result); registering versions out
/// of order is a programming error and panics at registration time.
#[derive(Default)]
pub struct OrchestrationRegistryBuilder {
    entries: HashMap<String, BTreeMap<Version, Arc<dyn OrchestrationHandler>>>,
    policies: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    /// Register `f` under `name` at [`DEFAULT_VERSION`].
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let version = DEFAULT_VERSION.to_string();
        self.register_versioned(name, version, f)
    }

    /// Register `f` under `name` at an explicit semver version.
    ///
    /// Versions for one name must be registered in ascending order; the
    /// `BTreeMap` ordering is what `VersionPolicy::Latest` resolves against.
    pub fn register_versioned<F, Fut>(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let version = version.into();
        let version = match Version::parse(&version) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version '{version}' for {name}: {e}"));
                return self;
            }
        };
        if self.check_duplicate(&name, &version) {
            return self;
        }
        let entry = self.entries.entry(name.clone()).or_default();
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!(
                    "non-monotonic orchestration version for {name}: {version} is not later than existing latest {latest}"
                );
            }
        }
        entry.insert(version, Arc::new(FnOrchestration(f)));
        self
    }

    /// Register a handler taking and returning serde values, encoded through
    /// the JSON payload codec.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let name = name.into();
        let version = DEFAULT_VERSION.to_string();
        self.register_versioned_typed(name, version, f)
    }

    /// Versioned form of [`register_typed`](Self::register_typed).
    pub fn register_versioned_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        version: impl Into<String>,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapped = move |ctx: OrchestrationContext, raw: String| {
            let f = f.clone();
            async move {
                let input: In =
                    Json::decode(&raw).map_err(|e| format!("decode input: {e}"))?;
                let out = f(ctx, input).await?;
                Json::encode(&out).map_err(|e| format!("encode output: {e}"))
            }
        };
        self.register_versioned(name, version, wrapped)
    }

    /// Set the start-time version policy for `name`.
    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    /// Finish the registry, panicking on accumulated registration errors.
    pub fn build(self) -> OrchestrationRegistry {
        match self.build_result() {
            Ok(registry) => registry,
            Err(errors) => panic!("orchestration registry errors: {errors:?}"),
        }
    }

    /// Finish the registry, returning accumulated registration errors.
    pub fn build_result(self) -> Result<OrchestrationRegistry, Vec<String>> {
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(Registry {
            inner: Arc::new(self.entries),
            policy: Arc::new(Mutex::new(self.policies)),
        })
    }

    fn check_duplicate(&mut self, name: &str, version: &Version) -> bool {
        let duplicate = self
            .entries
            .get(name)
            .map_or(false, |m| m.contains_key(version));
        if duplicate {
            self.errors
                .push(format!("duplicate registration for {name}@{version}"));
        }
        duplicate
    }
}

/// Builder for [`ActivityRegistry`].
#[derive(Default)]
pub struct ActivityRegistryBuilder {
    entries: HashMap<String, BTreeMap<Version, Arc<dyn ActivityHandler>>>,
    errors: Vec<String>,
}

impl ActivityRegistryBuilder {
    /// Register an activity taking the raw `String` payload.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self.check_duplicate(&name) {
            return self;
        }
        let mut versions: BTreeMap<Version, Arc<dyn ActivityHandler>> = BTreeMap::new();
        versions.insert(DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self.entries.insert(name, versions);
        self
    }

    /// Register an activity taking and returning serde values, encoded through
    /// the JSON payload codec.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapped = move |raw: String| {
            let f = f.clone();
            async move {
                let input: In =
                    Json::decode(&raw).map_err(|e| format!("decode input: {e}"))?;
                let out = f(input).await?;
                Json::encode(&out).map_err(|e| format!("encode output: {e}"))
            }
        };
        self.register(name, wrapped)
    }

    pub fn build(self) -> ActivityRegistry {
        match self.build_result() {
            Ok(registry) => registry,
            Err(errors) => panic!("activity registry errors: {errors:?}"),
        }
    }

    pub fn build_result(self) -> Result<ActivityRegistry, Vec<String>> {
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(Registry {
            inner: Arc::new(self.entries),
            policy: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn check_duplicate(&mut self, name: &str) -> bool {
        let duplicate = self.entries.contains_key(name);
        if duplicate {
            self.errors
                .push(format!("duplicate registration for activity {name}"));
        }
        duplicate
    }
}
