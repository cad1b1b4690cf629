//! Per-request resolution context.

use crate::extensions::cache_control::{CacheControlExtension, CacheHint};
use crate::extensions::ExtensionStack;
use crate::pubsub::PubSubEngine;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use subkit_core::{ResponsePath, Variables};

/// Request-scoped state handed to every resolver and directive.
///
/// Cloning is cheap and every clone shares the same state. A context is never
/// shared across requests.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    user: Option<Value>,
    headers: IndexMap<String, String>,
    variables: OnceLock<Arc<Variables>>,
    pubsub: Option<Arc<dyn PubSubEngine>>,
    /// The data bag as built, restored by [`Context::fork`].
    seed: Map<String, Value>,
    data: Mutex<Map<String, Value>>,
    memo: Mutex<FxHashMap<String, Arc<dyn Any + Send + Sync>>>,
    extensions: OnceLock<Arc<ExtensionStack>>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// A context for another execution with the same user, headers, bus and
    /// built data bag. Memoized values, later data writes, bound variables
    /// and the extension stack are not carried over.
    #[must_use]
    pub fn fork(&self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                user: self.inner.user.clone(),
                headers: self.inner.headers.clone(),
                variables: OnceLock::new(),
                pubsub: self.inner.pubsub.clone(),
                seed: self.inner.seed.clone(),
                data: Mutex::new(self.inner.seed.clone()),
                memo: Mutex::default(),
                extensions: OnceLock::new(),
            }),
        }
    }

    /// The authenticated user, if any.
    pub fn user(&self) -> Option<&Value> {
        self.inner.user.as_ref()
    }

    /// Gets a request header. Names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner
            .headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All request headers, with lower-cased names.
    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.inner.headers
    }

    /// The operation variables, empty until bound.
    pub fn variables(&self) -> Arc<Variables> {
        self.inner
            .variables
            .get()
            .cloned()
            .unwrap_or_default()
    }

    /// Binds the operation variables. Only the first call has an effect.
    pub fn bind_variables(&self, variables: Arc<Variables>) -> bool {
        self.inner.variables.set(variables).is_ok()
    }

    /// The publish/subscribe bus, if one was provided.
    pub fn pubsub(&self) -> Option<&Arc<dyn PubSubEngine>> {
        self.inner.pubsub.as_ref()
    }

    /// Sets a value in the context data bag.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data().insert(key.into(), v);
        }
    }

    /// Gets a value from the context data bag.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data()
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a raw value from the context data bag.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.data().get(key).cloned()
    }

    fn data(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the request-scoped value stored under `key`, creating it with
    /// `init` on first use.
    pub fn memo<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut memo = self.inner.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = memo
            .get(key)
            .and_then(|existing| Arc::clone(existing).downcast::<T>().ok())
        {
            return found;
        }
        let value = Arc::new(init());
        memo.insert(key.to_string(), Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        value
    }

    /// Attaches the request's extension stack. Only the first call has an
    /// effect.
    pub fn attach_extensions(&self, stack: Arc<ExtensionStack>) -> bool {
        self.inner.extensions.set(stack).is_ok()
    }

    /// The active extension stack.
    pub fn extensions(&self) -> Option<&Arc<ExtensionStack>> {
        self.inner.extensions.get()
    }

    /// Records a cache hint for `path` through the active cache-control
    /// extension. Does nothing when none is attached.
    pub fn set_cache_hint(&self, path: &ResponsePath, hint: CacheHint) {
        if let Some(cache) = self
            .extensions()
            .and_then(|stack| stack.find::<CacheControlExtension>())
        {
            cache.set_hint(path, hint);
        }
    }

    /// A JSON view for templates: the data bag plus `user`, `headers` and
    /// `variables`.
    pub fn to_json(&self) -> Value {
        let mut view = self.data().clone();
        view.entry("user")
            .or_insert_with(|| self.user().cloned().unwrap_or(Value::Object(Map::new())));
        view.entry("headers").or_insert_with(|| {
            Value::Object(
                self.headers()
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        });
        view.entry("variables")
            .or_insert_with(|| Value::Object((*self.variables()).clone()));
        Value::Object(view)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("user", &self.inner.user)
            .field("headers", &self.inner.headers)
            .field("has_pubsub", &self.inner.pubsub.is_some())
            .field("has_extensions", &self.inner.extensions.get().is_some())
            .finish()
    }
}

/// Builder for [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    user: Option<Value>,
    headers: IndexMap<String, String>,
    variables: Option<Variables>,
    pubsub: Option<Arc<dyn PubSubEngine>>,
    data: Map<String, Value>,
}

impl ContextBuilder {
    pub fn user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self = self.header(name, value);
        }
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSubEngine>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Context {
        let variables = OnceLock::new();
        if let Some(vars) = self.variables {
            let _ = variables.set(Arc::new(vars));
        }
        Context {
            inner: Arc::new(ContextInner {
                user: self.user,
                headers: self.headers,
                variables,
                pubsub: self.pubsub,
                seed: self.data.clone(),
                data: Mutex::new(self.data),
                memo: Mutex::new(FxHashMap::default()),
                extensions: OnceLock::new(),
            }),
        }
    }
}
