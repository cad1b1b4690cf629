//! Schema directive middleware.
//!
//! A [`DirectiveHandler`] wraps a field's resolution. Handlers are registered
//! by name in a [`DirectiveRegistry`] together with the directive's
//! definition, and composed per field by [`DirectiveChain`].

mod chain;

pub use chain::DirectiveChain;
pub(crate) use chain::merge_arguments;

use crate::context::Context;
use crate::resolver::{ResolverArgs, ResolverFuture, ResolverInfo};
use crate::subscription::SubscriptionSource;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use subkit_core::{DirectiveDefinition, TemplateError, TemplateScope};

/// The continuation of a directive link: produces the previous link's value.
pub struct Next<'a> {
    run: Box<dyn FnOnce() -> ResolverFuture<'a> + Send + 'a>,
}

impl<'a> Next<'a> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> ResolverFuture<'a> + Send + 'a,
    {
        Self { run: Box::new(f) }
    }

    /// A continuation yielding an already computed value.
    pub fn ready(value: Value) -> Self {
        Self::new(move || Box::pin(async move { Ok(value) }))
    }

    /// Runs the rest of the chain.
    pub fn run(self) -> ResolverFuture<'a> {
        (self.run)()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}

/// Behavior attached to a schema directive.
pub trait DirectiveHandler: Send + Sync {
    /// Resolves the field. `args` holds the directive's arguments merged with
    /// the field's runtime arguments.
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        args: ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;

    /// Expands the template written for the string argument `name`.
    /// Placeholders reading a deferred root must be left as they are.
    fn expand_argument(
        &self,
        _name: &str,
        template: &str,
        scope: &TemplateScope<'_>,
    ) -> Result<String, TemplateError> {
        scope.expand(template)
    }

    /// How a subscription root field carrying this directive gets its events.
    fn subscription_source(&self) -> Option<&dyn SubscriptionSource> {
        None
    }
}

/// A registered directive.
#[derive(Clone)]
pub struct DirectiveEntry {
    pub definition: DirectiveDefinition,
    pub handler: Arc<dyn DirectiveHandler>,
}

impl fmt::Debug for DirectiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveEntry")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Directive handlers by name. Immutable once handed to a compiled schema.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    entries: IndexMap<String, Arc<DirectiveEntry>>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the definition's name.
    pub fn with<H: DirectiveHandler + 'static>(
        mut self,
        definition: DirectiveDefinition,
        handler: H,
    ) -> Self {
        self.register(definition, Arc::new(handler));
        self
    }

    pub fn register(&mut self, definition: DirectiveDefinition, handler: Arc<dyn DirectiveHandler>) {
        self.entries.insert(
            definition.name.clone(),
            Arc::new(DirectiveEntry {
                definition,
                handler,
            }),
        );
    }

    /// Registers the entry of `target` under a second name.
    pub fn alias(mut self, name: impl Into<String>, target: &str) -> Self {
        if let Some(entry) = self.entries.get(target) {
            let name = name.into();
            let mut definition = entry.definition.clone();
            definition.name.clone_from(&name);
            let handler = Arc::clone(&entry.handler);
            self.entries
                .insert(name, Arc::new(DirectiveEntry { definition, handler }));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DirectiveEntry>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &DirectiveDefinition> {
        self.entries.values().map(|entry| &entry.definition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
