//! Cache-hint collection.

use super::{Extension, FieldCallback};
use crate::context::Context;
use crate::resolver::{ResolverArgs, ResolverInfo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use subkit_core::directive::{int_argument, name_argument};
use subkit_core::{DirectiveInvocation, ResponsePath, Schema, TypeRef};

const CACHE_CONTROL: &str = "cacheControl";

/// Who may cache a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheScope {
    Public,
    Private,
}

impl CacheScope {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PUBLIC" => Some(Self::Public),
            "PRIVATE" => Some(Self::Private),
            _ => None,
        }
    }
}

/// A cache recommendation for one response path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<CacheScope>,
}

impl CacheHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_scope(mut self, scope: CacheScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// True when either part of the hint is set.
    pub fn is_defined(&self) -> bool {
        self.max_age.is_some() || self.scope.is_some()
    }

    /// Overlays `incoming`. Unset values in `incoming` never erase.
    pub fn merge(self, incoming: CacheHint) -> CacheHint {
        CacheHint {
            max_age: incoming.max_age.or(self.max_age),
            scope: incoming.scope.or(self.scope),
        }
    }

    /// Reads the first `@cacheControl` among `directives`.
    pub fn from_directives(directives: &[DirectiveInvocation]) -> CacheHint {
        let Some(directive) = directives.iter().find(|d| d.name == CACHE_CONTROL) else {
            return CacheHint::default();
        };
        CacheHint {
            max_age: int_argument(directive, "maxAge").and_then(|age| u32::try_from(age).ok()),
            scope: name_argument(directive, "scope").and_then(CacheScope::from_name),
        }
    }

    /// The static hint of `parent_type.field_name`.
    ///
    /// The returned type's annotation applies first and the field's own
    /// annotation overrides it. Fields returning a composite type default to
    /// `maxAge: 0`.
    pub fn for_field(
        schema: &Schema,
        parent_type: &str,
        field_name: &str,
        return_type: &TypeRef,
    ) -> CacheHint {
        let target = return_type.named_type();
        let mut hint = schema
            .get_type(target)
            .map(|ty| CacheHint::from_directives(ty.directives()))
            .unwrap_or_default();

        if let Some(field) = schema.field(parent_type, field_name) {
            hint = hint.merge(CacheHint::from_directives(&field.directives));
        }

        if schema.is_composite(target) && hint.max_age.is_none() {
            hint.max_age = Some(0);
        }
        hint
    }
}

/// The policy for a whole response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: u32,
    pub scope: CacheScope,
}

impl CachePolicy {
    /// The `Cache-Control` header value.
    pub fn to_header_value(&self) -> String {
        let scope = match self.scope {
            CacheScope::Public => "public",
            CacheScope::Private => "private",
        };
        format!("max-age={}, {scope}", self.max_age)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HintEntry<'a> {
    path: &'a ResponsePath,
    #[serde(flatten)]
    hint: &'a CacheHint,
}

/// Collects one cache hint per response path.
#[derive(Debug, Default)]
pub struct CacheControlExtension {
    hints: Mutex<IndexMap<ResponsePath, CacheHint>>,
}

impl CacheControlExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `hint` into the entry for `path`.
    pub fn set_hint(&self, path: &ResponsePath, hint: CacheHint) {
        let mut hints = self.hints.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = hints.entry(path.clone()).or_default();
        *entry = entry.merge(hint);
    }

    /// A snapshot of the collected hints, in recording order.
    pub fn hints(&self) -> IndexMap<ResponsePath, CacheHint> {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The lowest recorded `maxAge`, private if any hint is private.
    ///
    /// `None` when the response must not be cached.
    pub fn overall_policy(&self) -> Option<CachePolicy> {
        let hints = self.hints.lock().unwrap_or_else(PoisonError::into_inner);
        let mut lowest: Option<u32> = None;
        let mut scope = CacheScope::Public;
        for hint in hints.values() {
            if let Some(age) = hint.max_age {
                lowest = Some(lowest.map_or(age, |current| current.min(age)));
            }
            if hint.scope == Some(CacheScope::Private) {
                scope = CacheScope::Private;
            }
        }
        lowest
            .filter(|age| *age > 0)
            .map(|max_age| CachePolicy { max_age, scope })
    }

    /// The `Cache-Control` header value for the response, if cacheable.
    pub fn header_value(&self) -> Option<String> {
        self.overall_policy().map(|policy| policy.to_header_value())
    }
}

impl Extension for CacheControlExtension {
    fn will_resolve_field(
        &self,
        _parent: &Value,
        _args: &ResolverArgs,
        _ctx: &Context,
        info: &ResolverInfo,
    ) -> Option<FieldCallback> {
        let hint = info.cache_hint();
        if hint.is_defined() {
            self.set_hint(&info.path, hint);
        }
        None
    }

    fn format(&self) -> Option<(String, Value)> {
        let hints = self.hints.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<HintEntry<'_>> = hints
            .iter()
            .map(|(path, hint)| HintEntry { path, hint })
            .collect();
        Some(("cacheHints".to_string(), json!(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SDL: &str = r#"
        type Query {
            me: User
            cached: User @cacheControl(maxAge: 30, scope: PRIVATE)
            hello: String
            stamped: String @cacheControl(maxAge: 5)
        }

        type User @cacheControl(maxAge: 60) {
            id: ID
            posts: [Post]
        }

        type Post {
            title: String
        }
    "#;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::parse(SDL).unwrap())
    }

    fn info(schema: &Arc<Schema>, parent: &str, field: &str) -> ResolverInfo {
        let ty = schema.field(parent, field).unwrap().ty.clone();
        ResolverInfo::new(field, parent)
            .with_return_type(ty)
            .with_schema(Arc::clone(schema))
    }

    #[test]
    fn test_static_hints() {
        let schema = schema();
        assert_eq!(info(&schema, "Query", "me").cache_hint(), CacheHint::new().with_max_age(60));
        assert_eq!(
            info(&schema, "Query", "cached").cache_hint(),
            CacheHint::new()
                .with_max_age(30)
                .with_scope(CacheScope::Private)
        );
        assert_eq!(info(&schema, "User", "posts").cache_hint(), CacheHint::new().with_max_age(0));
        assert!(!info(&schema, "Query", "hello").cache_hint().is_defined());
        assert_eq!(info(&schema, "Query", "stamped").cache_hint(), CacheHint::new().with_max_age(5));
    }

    #[test]
    fn test_merge_never_erases() {
        let ext = CacheControlExtension::new();
        let path = ResponsePath::root().child("me");
        ext.set_hint(&path, CacheHint::new().with_max_age(10).with_scope(CacheScope::Private));
        ext.set_hint(&path, CacheHint::new());
        ext.set_hint(&path, CacheHint::new().with_max_age(3));

        assert_eq!(
            ext.hints()[&path],
            CacheHint::new().with_max_age(3).with_scope(CacheScope::Private)
        );
    }

    #[test]
    fn test_overall_policy() {
        let ext = CacheControlExtension::new();
        assert_eq!(ext.overall_policy(), None);

        ext.set_hint(&ResponsePath::root().child("a"), CacheHint::new().with_max_age(60));
        ext.set_hint(
            &ResponsePath::root().child("b"),
            CacheHint::new().with_max_age(30).with_scope(CacheScope::Private),
        );
        assert_eq!(ext.header_value().as_deref(), Some("max-age=30, private"));

        ext.set_hint(&ResponsePath::root().child("c"), CacheHint::new().with_max_age(0));
        assert_eq!(ext.overall_policy(), None);
    }

    #[test]
    fn test_format() {
        let ext = CacheControlExtension::new();
        ext.set_hint(
            &ResponsePath::root().child("me").child(0),
            CacheHint::new().with_max_age(60),
        );
        let (key, value) = ext.format().unwrap();
        assert_eq!(key, "cacheHints");
        assert_eq!(value, json!([{"path": ["me", 0], "maxAge": 60}]));
    }
}
