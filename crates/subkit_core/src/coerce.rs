//! Coercion of literal argument values to their declared input types.

use async_graphql_value::Value;
use indexmap::IndexMap;
use serde_json::{Map, Number, Value as JsonValue};

use crate::error::CoercionError;
use crate::schema::{InputFieldDef, Schema, TypeDef, TypeRef};

/// Request variables, as JSON.
pub type Variables = Map<String, JsonValue>;

/// Converts a literal to JSON without type information.
///
/// Variables are substituted; unknown variables become `null`.
pub fn literal_to_json(value: &Value, variables: &Variables) -> JsonValue {
    match value {
        Value::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(JsonValue::Null),
        Value::Null => JsonValue::Null,
        Value::Number(n) => JsonValue::Number(n.clone()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Enum(name) => JsonValue::String(name.to_string()),
        Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| literal_to_json(item, variables))
                .collect(),
        ),
        Value::Object(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), literal_to_json(v, variables)))
                .collect(),
        ),
        _ => JsonValue::Null,
    }
}

/// Coerces one literal against `ty`.
pub fn coerce_value(
    schema: &Schema,
    ty: &TypeRef,
    value: &Value,
    variables: &Variables,
) -> Result<JsonValue, CoercionError> {
    if let Value::Variable(name) = value {
        return match variables.get(name.as_str()) {
            Some(JsonValue::Null) | None if ty.is_non_null() => {
                Err(CoercionError::MissingVariable {
                    name: name.to_string(),
                    ty: ty.to_string(),
                })
            }
            Some(v) => Ok(v.clone()),
            None => Ok(JsonValue::Null),
        };
    }

    match ty {
        TypeRef::NonNull(inner) => {
            let coerced = coerce_value(schema, inner, value, variables)?;
            if coerced.is_null() {
                return Err(CoercionError::NullForNonNull { ty: ty.to_string() });
            }
            Ok(coerced)
        }
        TypeRef::List(inner) => match value {
            Value::Null => Ok(JsonValue::Null),
            Value::List(items) => items
                .iter()
                .map(|item| coerce_value(schema, inner, item, variables))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            // A single item is accepted where a list is expected.
            other => Ok(JsonValue::Array(vec![coerce_value(
                schema, inner, other, variables,
            )?])),
        },
        TypeRef::Named(name) => match value {
            Value::Null => Ok(JsonValue::Null),
            other => coerce_named(schema, name, other, variables),
        },
    }
}

fn coerce_named(
    schema: &Schema,
    type_name: &str,
    value: &Value,
    variables: &Variables,
) -> Result<JsonValue, CoercionError> {
    let invalid = || CoercionError::InvalidValue {
        ty: type_name.to_string(),
        value: literal_to_json(value, variables).to_string(),
    };

    match schema.get_type(type_name) {
        Some(TypeDef::Scalar(_)) => match (type_name, value) {
            ("Int", Value::Number(n)) => n
                .as_i64()
                .filter(|i| i32::try_from(*i).is_ok())
                .map(|i| JsonValue::Number(i.into()))
                .ok_or_else(invalid),
            ("Float", Value::Number(n)) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(JsonValue::Number)
                .ok_or_else(invalid),
            ("String", Value::String(s)) => Ok(JsonValue::String(s.clone())),
            ("Boolean", Value::Boolean(b)) => Ok(JsonValue::Bool(*b)),
            ("ID", Value::String(s)) => Ok(JsonValue::String(s.clone())),
            ("ID", Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(JsonValue::String(n.to_string()))
            }
            ("Int" | "Float" | "String" | "Boolean" | "ID", _) => Err(invalid()),
            _ => Ok(literal_to_json(value, variables)),
        },
        Some(TypeDef::Enum(def)) => match value {
            Value::Enum(name) if def.contains(name.as_str()) => {
                Ok(JsonValue::String(name.to_string()))
            }
            _ => Err(invalid()),
        },
        Some(TypeDef::InputObject(def)) => {
            let Value::Object(fields) = value else {
                return Err(invalid());
            };
            if let Some((unknown, _)) = fields
                .iter()
                .find(|(k, _)| !def.fields.contains_key(k.as_str()))
            {
                return Err(CoercionError::InvalidValue {
                    ty: type_name.to_string(),
                    value: format!("unknown field \"{unknown}\""),
                });
            }
            let supplied = fields.iter().map(|(k, v)| (k.as_str(), v));
            let coerced = coerce_arguments(schema, &def.fields, supplied, variables)?;
            Ok(JsonValue::Object(coerced.into_iter().collect()))
        }
        Some(_) | None => Err(CoercionError::NotInputType(type_name.to_string())),
    }
}

/// Coerces supplied arguments against their definitions.
///
/// Omitted arguments take their default value when one is declared and are
/// otherwise left out; omitted non-null arguments without a default are an
/// error. A variable with no runtime value counts as omitted.
pub fn coerce_arguments<'a>(
    schema: &Schema,
    definitions: &IndexMap<String, InputFieldDef>,
    supplied: impl IntoIterator<Item = (&'a str, &'a Value)>,
    variables: &Variables,
) -> Result<IndexMap<String, JsonValue>, CoercionError> {
    let supplied: Vec<(&str, &Value)> = supplied.into_iter().collect();
    let mut coerced = IndexMap::with_capacity(definitions.len());

    for (name, def) in definitions {
        let value = supplied
            .iter()
            .find(|(arg, _)| *arg == name.as_str())
            .map(|(_, value)| *value)
            .filter(|value| match value {
                Value::Variable(var) => variables.contains_key(var.as_str()),
                _ => true,
            });

        match value {
            Some(value) => {
                let json = coerce_value(schema, &def.ty, value, variables).map_err(|source| {
                    CoercionError::Argument {
                        name: name.clone(),
                        source: Box::new(source),
                    }
                })?;
                coerced.insert(name.clone(), json);
            }
            None => {
                if let Some(default) = &def.default_value {
                    coerced.insert(name.clone(), default.clone());
                } else if def.ty.is_non_null() {
                    return Err(CoercionError::MissingArgument {
                        name: name.clone(),
                        ty: def.ty.to_string(),
                    });
                }
            }
        }
    }

    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::parse(
            r#"
            enum Color { RED GREEN }
            input Filter { color: Color!, limit: Int = 10 }
            type Query { a: Int }
            "#,
        )
        .unwrap()
    }

    fn string(s: &str) -> Value {
        Value::String(s.to_string())
    }

    #[test]
    fn test_scalars() {
        let schema = schema();
        let vars = Variables::new();

        let int = TypeRef::named("Int");
        assert_eq!(
            coerce_value(&schema, &int, &Value::Number(5.into()), &vars).unwrap(),
            json!(5)
        );
        assert!(coerce_value(&schema, &int, &string("5"), &vars).is_err());
        assert!(coerce_value(&schema, &int, &Value::Number(i64::MAX.into()), &vars).is_err());

        let id = TypeRef::named("ID");
        assert_eq!(
            coerce_value(&schema, &id, &Value::Number(7.into()), &vars).unwrap(),
            json!("7")
        );

        let custom = TypeRef::named("JSON");
        assert_eq!(
            coerce_value(&schema, &custom, &string("x"), &vars).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn test_lists_and_non_null() {
        let schema = schema();
        let vars = Variables::new();
        let ty = TypeRef::list(TypeRef::non_null(TypeRef::named("String")));

        assert_eq!(
            coerce_value(&schema, &ty, &string("a"), &vars).unwrap(),
            json!(["a"])
        );
        assert_eq!(
            coerce_value(&schema, &ty, &Value::List(vec![Value::Null]), &vars).unwrap_err(),
            CoercionError::NullForNonNull {
                ty: "String!".to_string()
            }
        );
    }

    #[test]
    fn test_input_objects_and_enums() {
        let schema = schema();
        let vars = Variables::new();
        let ty = TypeRef::named("Filter");

        let mut fields = IndexMap::new();
        fields.insert(
            async_graphql_value::Name::new("color"),
            Value::Enum(async_graphql_value::Name::new("RED")),
        );
        assert_eq!(
            coerce_value(&schema, &ty, &Value::Object(fields), &vars).unwrap(),
            json!({"color": "RED", "limit": 10})
        );

        let mut fields = IndexMap::new();
        fields.insert(
            async_graphql_value::Name::new("color"),
            Value::Enum(async_graphql_value::Name::new("BLUE")),
        );
        assert!(coerce_value(&schema, &ty, &Value::Object(fields), &vars).is_err());
    }

    #[test]
    fn test_arguments_with_variables() {
        let schema = schema();
        let mut defs = IndexMap::new();
        defs.insert(
            "id".to_string(),
            InputFieldDef::new("id", TypeRef::non_null(TypeRef::named("ID"))),
        );
        defs.insert(
            "first".to_string(),
            InputFieldDef::new("first", TypeRef::named("Int")).with_default(json!(20)),
        );
        defs.insert(
            "after".to_string(),
            InputFieldDef::new("after", TypeRef::named("String")),
        );

        let mut vars = Variables::new();
        vars.insert("id".to_string(), json!("u1"));
        let id = Value::Variable(async_graphql_value::Name::new("id"));
        let missing = Value::Variable(async_graphql_value::Name::new("cursor"));

        let args =
            coerce_arguments(&schema, &defs, [("id", &id), ("after", &missing)], &vars).unwrap();
        assert_eq!(args["id"], json!("u1"));
        assert_eq!(args["first"], json!(20));
        assert!(!args.contains_key("after"));

        let err = coerce_arguments(&schema, &defs, [], &vars).unwrap_err();
        assert_eq!(
            err,
            CoercionError::MissingArgument {
                name: "id".to_string(),
                ty: "ID!".to_string()
            }
        );
    }
}
