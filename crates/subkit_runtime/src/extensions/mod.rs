//! Request lifecycle extensions.
//!
//! An [`Extension`] observes one request: parsing, validation, execution and
//! every field resolution. Extensions are registered into an
//! [`ExtensionStack`], which is attached to the request [`Context`] and invoked
//! around each compiled field resolver by [`Instrumented`].
//!
//! Hooks run inside `catch_unwind`; a panicking extension is logged and
//! skipped, never failing the request.

pub mod cache_control;
pub mod trace;

use crate::context::Context;
use crate::resolver::{
    Resolver, ResolverArgs, ResolverFuture, ResolverInfo, ResolverResult, SharedResolver,
};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub use cache_control::{CacheControlExtension, CacheHint, CachePolicy, CacheScope};
pub use trace::TracingExtension;

/// Callback invoked once with the field's result.
///
/// `None` means the resolution ended without a result (for example, the
/// resolution future was dropped).
pub type FieldCallback = Box<dyn FnOnce(Option<&ResolverResult>) + Send>;

/// Observer of the request lifecycle. Every hook defaults to a no-op.
pub trait Extension: Any + Send + Sync {
    fn request_did_start(&self) {}

    fn parsing_did_start(&self) {}

    fn parsing_did_end(&self) {}

    fn validation_did_start(&self) {}

    fn validation_did_end(&self) {}

    fn execution_did_start(&self) {}

    /// Called immediately before a field resolves. The returned callback runs
    /// once the field's value is known.
    fn will_resolve_field(
        &self,
        _parent: &Value,
        _args: &ResolverArgs,
        _ctx: &Context,
        _info: &ResolverInfo,
    ) -> Option<FieldCallback> {
        None
    }

    fn execution_did_end(&self) {}

    fn request_did_end(&self) {}

    /// A named fragment to merge into the response extensions.
    fn format(&self) -> Option<(String, Value)> {
        None
    }
}

struct Entry {
    name: &'static str,
    hooks: Arc<dyn Extension>,
    any: Arc<dyn Any + Send + Sync>,
}

/// The ordered set of extensions active for one request.
#[derive(Default)]
pub struct ExtensionStack {
    entries: Vec<Entry>,
}

impl ExtensionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension.
    pub fn with<E: Extension>(mut self, extension: E) -> Self {
        self.push(Arc::new(extension));
        self
    }

    /// Adds a shared extension.
    pub fn push<E: Extension>(&mut self, extension: Arc<E>) {
        self.entries.push(Entry {
            name: std::any::type_name::<E>(),
            hooks: Arc::clone(&extension) as Arc<dyn Extension>,
            any: extension as Arc<dyn Any + Send + Sync>,
        });
    }

    /// Returns the first registered extension of type `E`.
    pub fn find<E: Extension>(&self) -> Option<Arc<E>> {
        self.entries
            .iter()
            .find_map(|entry| Arc::clone(&entry.any).downcast::<E>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn request_did_start(&self) {
        self.each("request_did_start", |e| e.request_did_start());
    }

    pub fn parsing_did_start(&self) {
        self.each("parsing_did_start", |e| e.parsing_did_start());
    }

    pub fn parsing_did_end(&self) {
        self.each("parsing_did_end", |e| e.parsing_did_end());
    }

    pub fn validation_did_start(&self) {
        self.each("validation_did_start", |e| e.validation_did_start());
    }

    pub fn validation_did_end(&self) {
        self.each("validation_did_end", |e| e.validation_did_end());
    }

    pub fn execution_did_start(&self) {
        self.each("execution_did_start", |e| e.execution_did_start());
    }

    pub fn execution_did_end(&self) {
        self.each("execution_did_end", |e| e.execution_did_end());
    }

    pub fn request_did_end(&self) {
        self.each("request_did_end", |e| e.request_did_end());
    }

    /// Notifies every extension that a field is about to resolve.
    pub fn will_resolve_field(
        &self,
        parent: &Value,
        args: &ResolverArgs,
        ctx: &Context,
        info: &ResolverInfo,
    ) -> FieldCompletion {
        let callbacks = self
            .entries
            .iter()
            .filter_map(|entry| {
                guarded(entry.name, "will_resolve_field", || {
                    entry.hooks.will_resolve_field(parent, args, ctx, info)
                })
                .flatten()
            })
            .collect();
        FieldCompletion { callbacks }
    }

    /// Merges every extension's named fragment into one object.
    pub fn format(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for entry in &self.entries {
            if let Some((key, value)) = guarded(entry.name, "format", || entry.hooks.format()).flatten() {
                merged.insert(key, value);
            }
        }
        merged
    }

    fn each(&self, hook: &'static str, f: impl Fn(&dyn Extension)) {
        for entry in &self.entries {
            guarded(entry.name, hook, || f(entry.hooks.as_ref()));
        }
    }
}

impl fmt::Debug for ExtensionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.name))
            .finish()
    }
}

fn guarded<R>(extension: &str, hook: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(extension, hook, "extension hook panicked");
            None
        }
    }
}

/// Pending field callbacks.
///
/// Every callback runs exactly once: through [`FieldCompletion::complete`],
/// or with no result when the guard is dropped first.
#[must_use = "dropping a FieldCompletion completes the field without a result"]
pub struct FieldCompletion {
    callbacks: Vec<FieldCallback>,
}

impl FieldCompletion {
    /// A completion with no callbacks.
    pub fn empty() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Runs every callback with the field's result.
    pub fn complete(mut self, result: Option<&ResolverResult>) {
        self.run(result);
    }

    fn run(&mut self, result: Option<&ResolverResult>) {
        for callback in self.callbacks.drain(..) {
            guarded("field", "completion", || callback(result));
        }
    }
}

impl Drop for FieldCompletion {
    fn drop(&mut self) {
        if !self.callbacks.is_empty() {
            self.run(None);
        }
    }
}

/// Wraps a compiled field resolver with the request's extension hooks.
pub struct Instrumented {
    inner: SharedResolver,
}

impl Instrumented {
    pub fn new(inner: SharedResolver) -> Self {
        Self { inner }
    }
}

impl Resolver for Instrumented {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let completion = ctx
                .extensions()
                .map(|stack| stack.will_resolve_field(parent, args, ctx, info));
            let result = self.inner.resolve(parent, args, ctx, info).await;
            if let Some(completion) = completion {
                completion.complete(Some(&result));
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::FnResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        completions: Arc<Mutex<Vec<Option<Value>>>>,
    }

    impl Extension for Counting {
        fn request_did_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn will_resolve_field(
            &self,
            _parent: &Value,
            _args: &ResolverArgs,
            _ctx: &Context,
            _info: &ResolverInfo,
        ) -> Option<FieldCallback> {
            let completions = Arc::clone(&self.completions);
            Some(Box::new(move |result| {
                let value = result.and_then(|r| r.as_ref().ok().cloned());
                completions.lock().unwrap().push(value);
            }))
        }

        fn format(&self) -> Option<(String, Value)> {
            Some(("counting".to_string(), serde_json::json!(1)))
        }
    }

    struct Panicking;

    impl Extension for Panicking {
        fn request_did_start(&self) {
            panic!("boom");
        }

        fn will_resolve_field(
            &self,
            _parent: &Value,
            _args: &ResolverArgs,
            _ctx: &Context,
            _info: &ResolverInfo,
        ) -> Option<FieldCallback> {
            Some(Box::new(|_| panic!("boom")))
        }
    }

    #[test]
    fn test_find_and_format() {
        let stack = ExtensionStack::new().with(Counting::default()).with(Panicking);
        assert_eq!(stack.len(), 2);
        assert!(stack.find::<Counting>().is_some());
        assert!(stack.find::<TracingExtension>().is_none());

        stack.request_did_start();
        assert_eq!(stack.find::<Counting>().unwrap().starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            Value::Object(stack.format()),
            serde_json::json!({"counting": 1})
        );
    }

    #[test]
    fn test_dropped_completion_runs_once_without_result() {
        let stack = ExtensionStack::new().with(Counting::default());
        let ctx = Context::new();
        let info = ResolverInfo::new("a", "Query");
        let completion =
            stack.will_resolve_field(&Value::Null, &ResolverArgs::new(), &ctx, &info);
        drop(completion);

        let counting = stack.find::<Counting>().unwrap();
        assert_eq!(*counting.completions.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_instrumented_resolver_completes_with_result() {
        let stack = Arc::new(ExtensionStack::new().with(Counting::default()).with(Panicking));
        let ctx = Context::new();
        ctx.attach_extensions(Arc::clone(&stack));

        let resolver = Instrumented::new(Arc::new(FnResolver::new(|_, _, _, _| {
            Ok(serde_json::json!("value"))
        })));
        let info = ResolverInfo::new("a", "Query");
        let result = resolver
            .resolve(&Value::Null, &ResolverArgs::new(), &ctx, &info)
            .await;

        assert_eq!(result.unwrap(), serde_json::json!("value"));
        let counting = stack.find::<Counting>().unwrap();
        assert_eq!(
            *counting.completions.lock().unwrap(),
            vec![Some(serde_json::json!("value"))]
        );
    }
}
