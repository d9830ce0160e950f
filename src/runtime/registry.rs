//! Name-to-handler registries for orchestrators and activities.
//!
//! Both are a `Registry<H>` keyed by name and semver version. Activities always
//! live at 1.0.0 and resolve with `Latest`; orchestrators may register several
//! versions and pick one for new executions with a `VersionPolicy`. Registries
//! are built once and are read-only afterwards.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type Versions<H> = BTreeMap<Version, Arc<H>>;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Versions<H>>>,
    pub(crate) policy: Arc<HashMap<String, VersionPolicy>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Versions<H>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            policy: reg.policy.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    /// Handler selected by the name's version policy (`Latest` by default).
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self.policy.get(name).cloned().unwrap_or(VersionPolicy::Latest);
        let versions = self.inner.get(name);
        let result = match &policy {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.and_then(|m| m.get(v)).map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            self.log_registry_miss(name, None, Some(&policy));
        }
        result
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|m| m.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "durabletask::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            tracing::warn!(
                target: "durabletask::runtime::registry",
                errors = %self.errors.join("; "),
                "registry built with rejected registrations"
            );
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(self.policy),
        }
    }

    /// Build, failing if any registration was rejected.
    ///
    /// # Errors
    ///
    /// All rejected registrations joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions {
                if entry.contains_key(version) {
                    self.errors
                        .push(format!("duplicate {error_prefix} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), Arc::clone(handler));
                }
            }
        }
        self
    }

    /// Records an error and returns false if `name@version` cannot be added.
    fn accept(&mut self, name: &str, version: &Version, error_prefix: &str) -> bool {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(version) {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}@{version}"));
            return false;
        }
        if let Some((latest, _)) = entry.iter().next_back()
            && version < latest
        {
            self.errors.push(format!(
                "non-monotonic {error_prefix} version for {name}: {version} is older than {latest}"
            ));
            return false;
        }
        true
    }

    fn parse_version(&mut self, name: &str, version: &str) -> Option<Version> {
        match Version::parse(version) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid version '{version}' for {name}: {e}"));
                None
            }
        }
    }
}

fn typed_orchestration<In, Out, F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, String>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(FnOrchestration(move |ctx: OrchestrationContext, input: Option<String>| {
        let f = Arc::clone(&f);
        async move {
            let input: In = Json::decode(input.as_deref())?;
            let out: Out = f(ctx, input).await?;
            Json::encode(&out).map(Some)
        }
    }))
}

impl OrchestrationRegistryBuilder {
    /// Register a raw orchestrator working on JSON text.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)))
    }

    /// Register an orchestrator with typed input and output, JSON encoded.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, typed_orchestration(f))
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        let name = name.into();
        match self.parse_version(&name, version.as_ref()) {
            Some(v) => self.insert(name, v, Arc::new(FnOrchestration(f))),
            None => self,
        }
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        mut self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let name = name.into();
        match self.parse_version(&name, version.as_ref()) {
            Some(v) => self.insert(name, v, typed_orchestration(f)),
            None => self,
        }
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }

    fn insert(mut self, name: String, version: Version, handler: Arc<dyn OrchestrationHandler>) -> Self {
        if self.accept(&name, &version, "orchestration") {
            self.map.entry(name).or_default().insert(version, handler);
        }
        self
    }
}

impl ActivityRegistryBuilder {
    /// Register a raw activity working on JSON text.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)))
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input: Option<String>| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(input.as_deref())?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out).map(Some)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)))
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }

    fn insert(mut self, name: String, handler: Arc<dyn ActivityHandler>) -> Self {
        if self.accept(&name, &DEFAULT_VERSION, "activity") {
            self.map.entry(name.clone()).or_default().insert(DEFAULT_VERSION, handler);
            self.policy.insert(name, VersionPolicy::Latest);
        }
        self
    }
}
