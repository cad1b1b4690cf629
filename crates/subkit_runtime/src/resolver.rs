//! Resolver system.
//!
//! This module provides the resolver trait and infrastructure for field resolution.

use crate::context::Context;
use crate::extensions::cache_control::CacheHint;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use subkit_core::{CoercionError, DirectiveInvocation, ResponsePath, Schema, TemplateError, TypeRef};
use thiserror::Error;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverArgs {
    args: IndexMap<String, Value>,
}

impl ResolverArgs {
    /// Creates new resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets a string argument.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        self.args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResolverError::ArgumentParseError(name.to_string(), e.to_string()))
            })
    }

    /// Returns all arguments.
    pub fn all(&self) -> &IndexMap<String, Value> {
        &self.args
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }

    /// Overwrites arguments with every entry of `other`.
    pub fn merge(&mut self, other: &ResolverArgs) {
        for (name, value) in &other.args {
            self.args.insert(name.clone(), value.clone());
        }
    }

    /// Returns the arguments as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl From<IndexMap<String, Value>> for ResolverArgs {
    fn from(args: IndexMap<String, Value>) -> Self {
        Self { args }
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    /// The field name being resolved.
    pub field_name: String,

    /// The response key (alias or field name).
    pub response_key: String,

    /// The declared return type.
    pub return_type: TypeRef,

    /// The parent type name.
    pub parent_type: String,

    /// Path to this field.
    pub path: ResponsePath,

    /// Selected sub-fields (for composite types).
    pub selected_fields: Vec<String>,

    /// Directives written on the field in the operation document.
    pub operation_directives: Vec<DirectiveInvocation>,

    /// Complexity score computed for this field node, when admission ran.
    pub score: Option<u64>,

    /// The schema being executed.
    pub schema: Arc<Schema>,
}

impl ResolverInfo {
    /// Creates new resolver info.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            response_key: field_name.clone(),
            path: ResponsePath::root().child(field_name.as_str()),
            field_name,
            return_type: TypeRef::named("JSON"),
            parent_type: parent_type.into(),
            selected_fields: Vec::new(),
            operation_directives: Vec::new(),
            score: None,
            schema: Arc::new(Schema::default()),
        }
    }

    /// Sets the return type.
    pub fn with_return_type(mut self, ty: TypeRef) -> Self {
        self.return_type = ty;
        self
    }

    /// Sets the path.
    pub fn with_path(mut self, path: ResponsePath) -> Self {
        self.path = path;
        self
    }

    /// Sets the selected fields.
    pub fn with_selected_fields(mut self, fields: Vec<String>) -> Self {
        self.selected_fields = fields;
        self
    }

    /// Sets the schema.
    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = schema;
        self
    }

    /// The static cache hint declared for this field and its return type.
    pub fn cache_hint(&self) -> CacheHint {
        CacheHint::for_field(
            &self.schema,
            &self.parent_type,
            &self.field_name,
            &self.return_type,
        )
    }
}

/// Result type for resolvers.
pub type ResolverResult = Result<Value, ResolverError>;

/// Future type for async resolvers.
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult> + Send + 'a>>;

/// Error from a resolver.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    /// Field not found.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Missing required argument.
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// Argument parse error.
    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParseError(String, String),

    /// Directive argument coercion failed.
    #[error(transparent)]
    Coercion(#[from] CoercionError),

    /// Directive argument template failed to expand.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Custom error.
    #[error("{0}")]
    Custom(String),
}

impl ResolverError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    /// Resolves a field value.
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

/// A shared resolver.
pub type SharedResolver = Arc<dyn Resolver>;

/// A sync resolver function.
pub type SyncResolverFn =
    Arc<dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync>;

/// A wrapper for sync resolver functions.
pub struct FnResolver {
    func: SyncResolverFn,
}

impl FnResolver {
    /// Creates a new function resolver.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for FnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info);
        Box::pin(async move { result })
    }
}

/// An async resolver function type.
pub type AsyncResolverFn = Arc<
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> ResolverFuture<'static> + Send + Sync,
>;

/// A wrapper for async resolver functions.
pub struct AsyncFnResolver {
    func: AsyncResolverFn,
}

impl AsyncFnResolver {
    /// Creates a new async function resolver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |parent, args, ctx, info| Box::pin(f(parent, args, ctx, info))),
        }
    }
}

impl Resolver for AsyncFnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let parent = parent.clone();
        let args = args.clone();
        let ctx = ctx.clone();
        let info = info.clone();
        let func = Arc::clone(&self.func);
        Box::pin(async move { func(parent, args, ctx, info).await })
    }
}

/// Default resolver that accesses properties from the parent object.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let field_name = &info.field_name;
        let result = match parent {
            Value::Object(map) => {
                if let Some(value) = map.get(field_name) {
                    Ok(value.clone())
                } else {
                    // Try snake_case version
                    let snake_case = to_snake_case(field_name);
                    Ok(map.get(&snake_case).cloned().unwrap_or(Value::Null))
                }
            }
            Value::Null => Ok(Value::Null),
            _ => Err(ResolverError::FieldNotFound(field_name.clone())),
        };
        Box::pin(async move { result })
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Storage for resolvers organized by type and field.
pub struct ResolverMap {
    /// Resolvers indexed by "TypeName.fieldName".
    resolvers: FxHashMap<String, SharedResolver>,

    /// Default resolver for unregistered fields.
    default_resolver: SharedResolver,
}

impl Default for ResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMap {
    /// Creates a new resolver map.
    pub fn new() -> Self {
        Self {
            resolvers: FxHashMap::default(),
            default_resolver: Arc::new(DefaultResolver),
        }
    }

    /// Registers a resolver for a specific type and field.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, Arc::new(resolver));
    }

    /// Registers a sync function as a resolver.
    pub fn register_fn<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Registers an async function as a resolver.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnResolver::new(f));
    }

    /// Gets the registered resolver for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<SharedResolver> {
        let key = format!("{type_name}.{field_name}");
        self.resolvers.get(&key).cloned()
    }

    /// Gets the resolver for a type and field, falling back to the default.
    pub fn get_or_default(&self, type_name: &str, field_name: &str) -> SharedResolver {
        self.get(type_name, field_name)
            .unwrap_or_else(|| Arc::clone(&self.default_resolver))
    }

    /// Sets the default resolver.
    pub fn set_default<R: Resolver + 'static>(&mut self, resolver: R) {
        self.default_resolver = Arc::new(resolver);
    }
}

impl Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_args() {
        let mut args = ResolverArgs::new();
        args.set("id", serde_json::json!(123));
        args.set("name", serde_json::json!("test"));

        assert_eq!(args.get_as::<i64>("id"), Some(123));
        assert_eq!(args.get_as::<String>("name"), Some("test".to_string()));
        assert_eq!(args.get_as::<i64>("missing"), None);

        let mut overrides = ResolverArgs::new();
        overrides.set("id", serde_json::json!(7));
        args.merge(&overrides);
        assert_eq!(args.to_json(), serde_json::json!({"id": 7, "name": "test"}));
    }

    #[test]
    fn test_resolver_error_variants() {
        let mut args = ResolverArgs::new();
        args.set("take", serde_json::json!("many"));
        assert!(matches!(
            args.require::<usize>("skip"),
            Err(ResolverError::MissingArgument(name)) if name == "skip"
        ));
        assert!(matches!(
            args.require::<usize>("take"),
            Err(ResolverError::ArgumentParseError(name, _)) if name == "take"
        ));

        let template = ResolverError::from(TemplateError::Unrenderable("nul".to_string()));
        assert!(matches!(template, ResolverError::Template(_)));
        assert_eq!(ResolverError::custom("boom").to_string(), "boom");
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("lastName"), "last_name");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_snake_case("ID"), "i_d");
    }

    #[tokio::test]
    async fn test_default_resolver() {
        let resolver = DefaultResolver;
        let parent = serde_json::json!({"name": "Alice", "created_at": 30});
        let args = ResolverArgs::new();
        let ctx = Context::new();

        let info = ResolverInfo::new("name", "User");
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(result.unwrap(), serde_json::json!("Alice"));

        let info = ResolverInfo::new("createdAt", "User");
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(result.unwrap(), serde_json::json!(30));

        let info = ResolverInfo::new("name", "User");
        let result = resolver.resolve(&serde_json::json!(1), &args, &ctx, &info).await;
        assert!(matches!(result, Err(ResolverError::FieldNotFound(_))));
    }

    #[tokio::test]
    async fn test_fn_resolver() {
        let resolver = FnResolver::new(|_parent, args, _ctx, _info| {
            let id: i64 = args.require("id")?;
            Ok(serde_json::json!({"id": id, "name": "User"}))
        });

        let parent = serde_json::json!({});
        let mut args = ResolverArgs::new();
        args.set("id", serde_json::json!(42));
        let ctx = Context::new();
        let info = ResolverInfo::new("user", "Query");

        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(
            result.unwrap(),
            serde_json::json!({"id": 42, "name": "User"})
        );
    }

    #[tokio::test]
    async fn test_resolver_map() {
        let mut map = ResolverMap::new();

        map.register_fn("Query", "hello", |_parent, _args, _ctx, _info| {
            Ok(serde_json::json!("Hello, World!"))
        });

        let resolver = map.get("Query", "hello").unwrap();
        let parent = serde_json::json!({});
        let args = ResolverArgs::new();
        let ctx = Context::new();
        let info = ResolverInfo::new("hello", "Query");

        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(result.unwrap(), serde_json::json!("Hello, World!"));
        assert!(map.get("Query", "missing").is_none());
    }

    #[tokio::test]
    async fn test_resolver_map_default_fallback() {
        let map = ResolverMap::new();

        // Should use default resolver for unregistered fields
        let resolver = map.get_or_default("User", "name");
        let parent = serde_json::json!({"name": "Bob"});
        let args = ResolverArgs::new();
        let ctx = Context::new();
        let info = ResolverInfo::new("name", "User");

        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(result.unwrap(), serde_json::json!("Bob"));
    }
}
