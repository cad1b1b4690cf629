//! Directive definitions and invocations.

use async_graphql_parser::types as ast;
use async_graphql_value::{ConstValue, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::{InputFieldDef, TypeRef};

/// Directive definition.
///
/// `builtin` marks directives that the directive engine never wraps around a
/// resolver (`@skip`, `@include`, `@deprecated`, `@complexity`,
/// `@cacheControl`). They are interpreted by the executor, the complexity
/// walker or the cache-hint collector instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveDefinition {
    pub name: String,
    pub description: Option<String>,
    pub arguments: IndexMap<String, InputFieldDef>,
    pub locations: Vec<DirectiveLocation>,
    pub repeatable: bool,
    pub builtin: bool,
}

impl DirectiveDefinition {
    /// Creates a definition with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: IndexMap::new(),
            locations: Vec::new(),
            repeatable: false,
            builtin: false,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Adds an argument.
    pub fn with_argument(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        let name = name.into();
        self.arguments.insert(name.clone(), InputFieldDef::new(name, ty));
        self
    }

    /// Adds an argument with a default value.
    pub fn with_default_argument(
        mut self,
        name: impl Into<String>,
        ty: TypeRef,
        default: serde_json::Value,
    ) -> Self {
        let name = name.into();
        self.arguments.insert(
            name.clone(),
            InputFieldDef::new(name, ty).with_default(default),
        );
        self
    }

    /// Adds a location.
    pub fn with_location(mut self, location: DirectiveLocation) -> Self {
        self.locations.push(location);
        self
    }

    /// Marks the directive as repeatable.
    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    /// Marks the directive as interpreted by the runtime itself.
    pub fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    /// Converts a parsed `directive @name(...) on ...` definition.
    pub fn from_ast(def: &ast::DirectiveDefinition) -> Self {
        Self {
            name: def.name.node.to_string(),
            description: def.description.as_ref().map(|d| d.node.clone()),
            arguments: def
                .arguments
                .iter()
                .map(|arg| {
                    let field = InputFieldDef::from_ast(&arg.node);
                    (field.name.clone(), field)
                })
                .collect(),
            locations: def
                .locations
                .iter()
                .map(|loc| DirectiveLocation::from_ast(loc.node))
                .collect(),
            repeatable: def.is_repeatable,
            builtin: false,
        }
    }

    /// Returns true if the directive may appear at `location`.
    pub fn allows(&self, location: DirectiveLocation) -> bool {
        self.locations.contains(&location)
    }
}

/// Directive location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectiveLocation {
    Query,
    Mutation,
    Subscription,
    Field,
    FragmentDefinition,
    FragmentSpread,
    InlineFragment,
    VariableDefinition,
    Schema,
    Scalar,
    Object,
    FieldDefinition,
    ArgumentDefinition,
    Interface,
    Union,
    Enum,
    EnumValue,
    InputObject,
    InputFieldDefinition,
}

impl DirectiveLocation {
    pub fn from_ast(location: ast::DirectiveLocation) -> Self {
        match location {
            ast::DirectiveLocation::Query => Self::Query,
            ast::DirectiveLocation::Mutation => Self::Mutation,
            ast::DirectiveLocation::Subscription => Self::Subscription,
            ast::DirectiveLocation::Field => Self::Field,
            ast::DirectiveLocation::FragmentDefinition => Self::FragmentDefinition,
            ast::DirectiveLocation::FragmentSpread => Self::FragmentSpread,
            ast::DirectiveLocation::InlineFragment => Self::InlineFragment,
            ast::DirectiveLocation::VariableDefinition => Self::VariableDefinition,
            ast::DirectiveLocation::Schema => Self::Schema,
            ast::DirectiveLocation::Scalar => Self::Scalar,
            ast::DirectiveLocation::Object => Self::Object,
            ast::DirectiveLocation::FieldDefinition => Self::FieldDefinition,
            ast::DirectiveLocation::ArgumentDefinition => Self::ArgumentDefinition,
            ast::DirectiveLocation::Interface => Self::Interface,
            ast::DirectiveLocation::Union => Self::Union,
            ast::DirectiveLocation::Enum => Self::Enum,
            ast::DirectiveLocation::EnumValue => Self::EnumValue,
            ast::DirectiveLocation::InputObject => Self::InputObject,
            ast::DirectiveLocation::InputFieldDefinition => Self::InputFieldDefinition,
        }
    }
}

/// Where a directive invocation was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationLocation {
    /// On a field selection in an operation document.
    Field,
    /// On a field definition in the schema.
    FieldDefinition,
    /// On an object, interface or union type definition.
    Type,
}

/// A directive as written at one location, with its literal arguments.
#[derive(Debug, Clone)]
pub struct DirectiveInvocation {
    pub name: String,
    pub arguments: Vec<(String, Value)>,
    pub location: InvocationLocation,
}

impl DirectiveInvocation {
    pub fn new(name: impl Into<String>, location: InvocationLocation) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            location,
        }
    }

    /// Adds a literal argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.push((name.into(), value));
        self
    }

    /// Converts a schema directive.
    pub fn from_const(directive: &ast::ConstDirective, location: InvocationLocation) -> Self {
        Self {
            name: directive.name.node.to_string(),
            arguments: directive
                .arguments
                .iter()
                .map(|(name, value)| (name.node.to_string(), value.node.clone().into_value()))
                .collect(),
            location,
        }
    }

    /// Converts a directive written in an operation document.
    pub fn from_operation(directive: &ast::Directive) -> Self {
        Self {
            name: directive.name.node.to_string(),
            arguments: directive
                .arguments
                .iter()
                .map(|(name, value)| (name.node.to_string(), value.node.clone()))
                .collect(),
            location: InvocationLocation::Field,
        }
    }

    /// Looks up a literal argument.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }
}

/// Name of the enum used by `@cacheControl(scope:)`.
pub const CACHE_CONTROL_SCOPE: &str = "CacheControlScope";

/// Definitions of the directives the runtime interprets itself.
pub fn builtins() -> Vec<DirectiveDefinition> {
    use DirectiveLocation as L;

    vec![
        DirectiveDefinition::new("skip")
            .with_description("Directs the executor to skip this field or fragment when the `if` argument is true.")
            .with_argument("if", TypeRef::non_null(TypeRef::named("Boolean")))
            .with_location(L::Field)
            .with_location(L::FragmentSpread)
            .with_location(L::InlineFragment)
            .builtin(),
        DirectiveDefinition::new("include")
            .with_description("Directs the executor to include this field or fragment only when the `if` argument is true.")
            .with_argument("if", TypeRef::non_null(TypeRef::named("Boolean")))
            .with_location(L::Field)
            .with_location(L::FragmentSpread)
            .with_location(L::InlineFragment)
            .builtin(),
        DirectiveDefinition::new("deprecated")
            .with_default_argument(
                "reason",
                TypeRef::named("String"),
                serde_json::Value::String("No longer supported".to_string()),
            )
            .with_location(L::FieldDefinition)
            .with_location(L::ArgumentDefinition)
            .with_location(L::InputFieldDefinition)
            .with_location(L::EnumValue)
            .builtin(),
        DirectiveDefinition::new("complexity")
            .with_description("Declares the static cost of a field for admission control.")
            .with_argument("cost", TypeRef::named("Int"))
            .with_argument("multiplier", TypeRef::named("String"))
            .with_location(L::FieldDefinition)
            .builtin(),
        DirectiveDefinition::new("cacheControl")
            .with_description("Declares a cache hint for a field or for every field returning a type.")
            .with_argument("maxAge", TypeRef::named("Int"))
            .with_argument("scope", TypeRef::named(CACHE_CONTROL_SCOPE))
            .with_location(L::FieldDefinition)
            .with_location(L::Object)
            .with_location(L::Interface)
            .with_location(L::Union)
            .builtin(),
    ]
}

/// Reads an integer literal argument.
pub fn int_argument(invocation: &DirectiveInvocation, name: &str) -> Option<i64> {
    match invocation.argument(name)? {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Reads a string or enum literal argument.
pub fn name_argument<'a>(invocation: &'a DirectiveInvocation, name: &str) -> Option<&'a str> {
    match invocation.argument(name)? {
        Value::String(s) => Some(s.as_str()),
        Value::Enum(e) => Some(e.as_str()),
        _ => None,
    }
}

pub(crate) fn const_to_json(value: &ConstValue) -> serde_json::Value {
    value.clone().into_json().unwrap_or(serde_json::Value::Null)
}
