//! Helpers shared by the directive handlers.

use crate::error::DirectiveError;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::time::Duration;
use subkit_core::template::{render, select};
use subkit_core::{DirectiveDefinition, DirectiveLocation, TemplateError, TemplateRoot, TemplateScope, TypeRef};
use subkit_runtime::ResolverArgs;

/// A directive usable on field definitions and on operation fields.
pub(crate) fn field_directive(name: &str, description: &str) -> DirectiveDefinition {
    DirectiveDefinition::new(name)
        .with_description(description)
        .with_location(DirectiveLocation::FieldDefinition)
        .with_location(DirectiveLocation::Field)
}

pub(crate) fn named(name: &str) -> TypeRef {
    TypeRef::named(name)
}

pub(crate) fn required(name: &str) -> TypeRef {
    TypeRef::non_null(TypeRef::named(name))
}

/// Applies the `jsonQuery` argument, if any. A path that selects nothing
/// yields null.
pub(crate) fn project(value: Value, args: &ResolverArgs) -> Result<Value, TemplateError> {
    match args.get_str("jsonQuery").filter(|query| !query.is_empty()) {
        Some(query) => Ok(select(&value, query)?.cloned().unwrap_or(Value::Null)),
        None => Ok(value),
    }
}

/// Expands the `${data...}` placeholders left in an argument.
pub(crate) fn expand_data(template: &str, data: &Value) -> Result<String, TemplateError> {
    TemplateScope::new()
        .with(TemplateRoot::Data, data)
        .expand(template)
}

/// Expands the `${ids}` placeholders of a batched call with the
/// comma-separated keys.
pub(crate) fn expand_ids(template: &str, keys: &[String]) -> Result<String, TemplateError> {
    let ids = Value::String(keys.join(","));
    TemplateScope::new()
        .with(TemplateRoot::Ids, &ids)
        .expand(template)
}

/// The `timeout` argument in milliseconds. Zero or less means no limit.
pub(crate) fn timeout(args: &ResolverArgs) -> Option<Duration> {
    args.get_as::<i64>("timeout")
        .and_then(|ms| u64::try_from(ms).ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// The batch key of `parent`: the rendered value of its `field` entry.
pub(crate) fn batch_key(parent: &Value, field: &str) -> Option<String> {
    parent
        .get(field)
        .filter(|value| !value.is_null())
        .map(|value| render(Some(value)))
}

/// Pairs the keys of a batched call with the entries of its array result.
pub(crate) fn align(
    keys: Vec<String>,
    result: Value,
) -> Result<FxHashMap<String, Value>, DirectiveError> {
    match result {
        Value::Array(items) if items.len() == keys.len() => Ok(keys.into_iter().zip(items).collect()),
        other => Err(DirectiveError::BatchShape {
            expected: keys.len(),
            found: describe(&other),
        }),
    }
}

pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "a boolean".to_string(),
        Value::Number(_) => "a number".to_string(),
        Value::String(_) => "a string".to_string(),
        Value::Array(items) => format!("an array of {} entries", items.len()),
        Value::Object(_) => "an object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project() {
        let mut args = ResolverArgs::new();
        let value = json!({"items": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(project(value.clone(), &args).unwrap(), value);

        args.set("jsonQuery", json!("items[1].name"));
        assert_eq!(project(value.clone(), &args).unwrap(), json!("b"));

        args.set("jsonQuery", json!("missing.name"));
        assert_eq!(project(value, &args).unwrap(), Value::Null);
    }

    #[test]
    fn test_expand_data_and_ids() {
        let data = json!({"id": 7});
        assert_eq!(
            expand_data("/users/${data.id}", &data).unwrap(),
            "/users/7"
        );
        let keys = vec!["1".to_string(), "2".to_string()];
        assert_eq!(expand_ids("get ${ids}", &keys).unwrap(), "get 1,2");
    }

    #[test]
    fn test_timeout() {
        let mut args = ResolverArgs::new();
        assert_eq!(timeout(&args), None);
        args.set("timeout", json!(0));
        assert_eq!(timeout(&args), None);
        args.set("timeout", json!(-5));
        assert_eq!(timeout(&args), None);
        args.set("timeout", json!(250));
        assert_eq!(timeout(&args), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_batch_key_and_align() {
        let parent = json!({"authorId": 3, "missing": null});
        assert_eq!(batch_key(&parent, "authorId").as_deref(), Some("3"));
        assert_eq!(batch_key(&parent, "missing"), None);

        let keys = vec!["a".to_string(), "b".to_string()];
        let aligned = align(keys.clone(), json!([1, 2])).unwrap();
        assert_eq!(aligned["b"], json!(2));

        let error = align(keys, json!([1])).unwrap_err();
        assert_eq!(
            error.to_string(),
            "batched result must be an array of 2 entries, found an array of 1 entries"
        );
    }
}
