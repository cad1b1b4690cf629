//! Schema model and SDL loader.

use async_graphql_parser::types as ast;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::directive::{
    builtins, const_to_json, DirectiveDefinition, DirectiveInvocation, InvocationLocation,
    CACHE_CONTROL_SCOPE,
};
use crate::error::SchemaError;
use crate::operation::OperationKind;

/// Names of the scalars every schema starts with.
pub const BUILTIN_SCALARS: [&str; 6] = ["Int", "Float", "String", "Boolean", "ID", "JSON"];

/// A GraphQL schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
    pub types: IndexMap<String, TypeDef>,
    pub directives: IndexMap<String, DirectiveDefinition>,
}

impl Schema {
    /// Parses SDL into a schema with the built-in scalars and directives.
    pub fn parse(sdl: &str) -> Result<Self, SchemaError> {
        SchemaBuilder::new().sdl(sdl)?.build()
    }

    /// Gets a type by name.
    pub fn get_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Returns all types.
    pub fn types(&self) -> impl Iterator<Item = (&String, &TypeDef)> {
        self.types.iter()
    }

    /// Gets a directive definition by name.
    pub fn directive(&self, name: &str) -> Option<&DirectiveDefinition> {
        self.directives.get(name)
    }

    /// Returns the root type name for an operation kind.
    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    /// Looks up a field on an object or interface type.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.get_type(type_name)?.fields()?.get(field_name)
    }

    /// Returns the object types a value of `type_name` may have at runtime.
    pub fn possible_types(&self, type_name: &str) -> Vec<&str> {
        match self.get_type(type_name) {
            Some(TypeDef::Object(o)) => vec![o.name.as_str()],
            Some(TypeDef::Union(u)) => u.members.iter().map(String::as_str).collect(),
            Some(TypeDef::Interface(i)) => self
                .types
                .values()
                .filter_map(|ty| match ty {
                    TypeDef::Object(o) if o.implements.contains(&i.name) => Some(o.name.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns true if an object of type `object_type` satisfies `condition`.
    pub fn is_possible_type(&self, condition: &str, object_type: &str) -> bool {
        condition == object_type || self.possible_types(condition).contains(&object_type)
    }

    /// Returns true for object, interface and union types.
    pub fn is_composite(&self, type_name: &str) -> bool {
        matches!(
            self.get_type(type_name),
            Some(TypeDef::Object(_) | TypeDef::Interface(_) | TypeDef::Union(_))
        )
    }

    /// Returns true for scalar and enum types.
    pub fn is_leaf(&self, type_name: &str) -> bool {
        matches!(
            self.get_type(type_name),
            Some(TypeDef::Scalar(_) | TypeDef::Enum(_))
        )
    }
}

/// A type definition.
#[derive(Debug, Clone)]
pub enum TypeDef {
    Scalar(ScalarDef),
    Object(ObjectDef),
    Interface(InterfaceDef),
    Union(UnionDef),
    Enum(EnumDef),
    InputObject(InputObjectDef),
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Scalar(s) => &s.name,
            TypeDef::Object(o) => &o.name,
            TypeDef::Interface(i) => &i.name,
            TypeDef::Union(u) => &u.name,
            TypeDef::Enum(e) => &e.name,
            TypeDef::InputObject(i) => &i.name,
        }
    }

    /// Fields of an object or interface type.
    pub fn fields(&self) -> Option<&IndexMap<String, FieldDef>> {
        match self {
            TypeDef::Object(o) => Some(&o.fields),
            TypeDef::Interface(i) => Some(&i.fields),
            _ => None,
        }
    }

    /// Directives declared on an object, interface or union type.
    pub fn directives(&self) -> &[DirectiveInvocation] {
        match self {
            TypeDef::Object(o) => &o.directives,
            TypeDef::Interface(i) => &i.directives,
            TypeDef::Union(u) => &u.directives,
            _ => &[],
        }
    }
}

/// Scalar type definition.
#[derive(Debug, Clone)]
pub struct ScalarDef {
    pub name: String,
    pub description: Option<String>,
}

/// Object type definition.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDef>,
    pub implements: Vec<String>,
    pub directives: Vec<DirectiveInvocation>,
}

/// Interface type definition.
#[derive(Debug, Clone)]
pub struct InterfaceDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDef>,
    pub implements: Vec<String>,
    pub directives: Vec<DirectiveInvocation>,
}

/// Union type definition.
#[derive(Debug, Clone)]
pub struct UnionDef {
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<String>,
    pub directives: Vec<DirectiveInvocation>,
}

/// Enum type definition.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub description: Option<String>,
    pub values: Vec<EnumValueDef>,
}

impl EnumDef {
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v.name == value)
    }
}

/// Enum value definition.
#[derive(Debug, Clone)]
pub struct EnumValueDef {
    pub name: String,
    pub description: Option<String>,
    pub deprecated: bool,
    pub deprecation_reason: Option<String>,
}

/// Input object type definition.
#[derive(Debug, Clone)]
pub struct InputObjectDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, InputFieldDef>,
}

/// Field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub arguments: IndexMap<String, InputFieldDef>,
    /// Declared directives in source order.
    pub directives: Vec<DirectiveInvocation>,
    pub deprecated: bool,
    pub deprecation_reason: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            description: None,
            ty,
            arguments: IndexMap::new(),
            directives: Vec::new(),
            deprecated: false,
            deprecation_reason: None,
        }
    }

    /// Returns the first declared directive called `name`.
    pub fn directive(&self, name: &str) -> Option<&DirectiveInvocation> {
        self.directives.iter().find(|d| d.name == name)
    }

    fn from_ast(def: &ast::FieldDefinition) -> Self {
        let directives: Vec<DirectiveInvocation> = def
            .directives
            .iter()
            .map(|d| DirectiveInvocation::from_const(&d.node, InvocationLocation::FieldDefinition))
            .collect();
        let deprecated = directives.iter().find(|d| d.name == "deprecated");
        let deprecation_reason = deprecated.and_then(|d| match d.argument("reason") {
            Some(async_graphql_value::Value::String(s)) => Some(s.clone()),
            _ => None,
        });

        Self {
            name: def.name.node.to_string(),
            description: def.description.as_ref().map(|d| d.node.clone()),
            ty: TypeRef::from_ast(&def.ty.node),
            arguments: def
                .arguments
                .iter()
                .map(|arg| {
                    let input = InputFieldDef::from_ast(&arg.node);
                    (input.name.clone(), input)
                })
                .collect(),
            deprecated: deprecated.is_some(),
            deprecation_reason,
            directives,
        }
    }
}

/// Input field or argument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFieldDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub default_value: Option<serde_json::Value>,
}

impl InputFieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            description: None,
            ty,
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub(crate) fn from_ast(def: &ast::InputValueDefinition) -> Self {
        Self {
            name: def.name.node.to_string(),
            description: def.description.as_ref().map(|d| d.node.clone()),
            ty: TypeRef::from_ast(&def.ty.node),
            default_value: def.default_value.as_ref().map(|v| const_to_json(&v.node)),
        }
    }
}

/// Type reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeRef {
    Named(String),
    NonNull(Box<TypeRef>),
    List(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        Self::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        Self::List(Box::new(inner))
    }

    /// The innermost named type.
    pub fn named_type(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::NonNull(inner) | TypeRef::List(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// Strips one level of non-null.
    pub fn nullable(&self) -> &TypeRef {
        match self {
            TypeRef::NonNull(inner) => inner,
            other => other,
        }
    }

    pub fn from_ast(ty: &ast::Type) -> Self {
        let base = match &ty.base {
            ast::BaseType::Named(name) => TypeRef::Named(name.to_string()),
            ast::BaseType::List(inner) => TypeRef::List(Box::new(Self::from_ast(inner))),
        };
        if ty.nullable {
            base
        } else {
            TypeRef::NonNull(Box::new(base))
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
        }
    }
}

/// Schema builder.
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBuilder {
    /// Creates a builder holding the built-in scalars, the built-in
    /// directives and the `CacheControlScope` enum.
    pub fn new() -> Self {
        let mut schema = Schema::default();
        for name in BUILTIN_SCALARS {
            schema.types.insert(
                name.to_string(),
                TypeDef::Scalar(ScalarDef {
                    name: name.to_string(),
                    description: Some(format!("Built-in {name} scalar")),
                }),
            );
        }
        schema.types.insert(
            CACHE_CONTROL_SCOPE.to_string(),
            TypeDef::Enum(EnumDef {
                name: CACHE_CONTROL_SCOPE.to_string(),
                description: None,
                values: ["PUBLIC", "PRIVATE"]
                    .into_iter()
                    .map(|name| EnumValueDef {
                        name: name.to_string(),
                        description: None,
                        deprecated: false,
                        deprecation_reason: None,
                    })
                    .collect(),
            }),
        );
        for directive in builtins() {
            schema.directives.insert(directive.name.clone(), directive);
        }
        Self { schema }
    }

    /// Sets the query type.
    pub fn query_type(mut self, name: impl Into<String>) -> Self {
        self.schema.query_type = Some(name.into());
        self
    }

    /// Sets the mutation type.
    pub fn mutation_type(mut self, name: impl Into<String>) -> Self {
        self.schema.mutation_type = Some(name.into());
        self
    }

    /// Sets the subscription type.
    pub fn subscription_type(mut self, name: impl Into<String>) -> Self {
        self.schema.subscription_type = Some(name.into());
        self
    }

    /// Adds or replaces a type.
    pub fn add_type(mut self, type_def: TypeDef) -> Self {
        self.schema
            .types
            .insert(type_def.name().to_string(), type_def);
        self
    }

    /// Adds a directive definition.
    ///
    /// Re-declaring a built-in directive keeps its `builtin` flag.
    pub fn add_directive(mut self, mut directive: DirectiveDefinition) -> Self {
        if let Some(existing) = self.schema.directives.get(&directive.name) {
            directive.builtin |= existing.builtin;
        }
        self.schema
            .directives
            .insert(directive.name.clone(), directive);
        self
    }

    /// Merges an SDL document into the schema.
    pub fn sdl(mut self, source: &str) -> Result<Self, SchemaError> {
        let document =
            async_graphql_parser::parse_schema(source).map_err(|e| SchemaError::Parse(e.to_string()))?;

        for definition in &document.definitions {
            match definition {
                ast::TypeSystemDefinition::Schema(schema) => {
                    let schema = &schema.node;
                    if let Some(query) = &schema.query {
                        self.schema.query_type = Some(query.node.to_string());
                    }
                    if let Some(mutation) = &schema.mutation {
                        self.schema.mutation_type = Some(mutation.node.to_string());
                    }
                    if let Some(subscription) = &schema.subscription {
                        self.schema.subscription_type = Some(subscription.node.to_string());
                    }
                }
                ast::TypeSystemDefinition::Type(ty) => self.merge_type(&ty.node)?,
                ast::TypeSystemDefinition::Directive(directive) => {
                    self = self.add_directive(DirectiveDefinition::from_ast(&directive.node));
                }
            }
        }
        Ok(self)
    }

    fn merge_type(&mut self, def: &ast::TypeDefinition) -> Result<(), SchemaError> {
        let name = def.name.node.to_string();
        let description = def.description.as_ref().map(|d| d.node.clone());
        let directives: Vec<DirectiveInvocation> = def
            .directives
            .iter()
            .map(|d| DirectiveInvocation::from_const(&d.node, InvocationLocation::Type))
            .collect();

        let incoming = match &def.kind {
            ast::TypeKind::Scalar => TypeDef::Scalar(ScalarDef {
                name: name.clone(),
                description,
            }),
            ast::TypeKind::Object(object) => TypeDef::Object(ObjectDef {
                name: name.clone(),
                description,
                fields: fields_from_ast(&object.fields),
                implements: object.implements.iter().map(|i| i.node.to_string()).collect(),
                directives,
            }),
            ast::TypeKind::Interface(interface) => TypeDef::Interface(InterfaceDef {
                name: name.clone(),
                description,
                fields: fields_from_ast(&interface.fields),
                implements: interface
                    .implements
                    .iter()
                    .map(|i| i.node.to_string())
                    .collect(),
                directives,
            }),
            ast::TypeKind::Union(union_type) => TypeDef::Union(UnionDef {
                name: name.clone(),
                description,
                members: union_type.members.iter().map(|m| m.node.to_string()).collect(),
                directives,
            }),
            ast::TypeKind::Enum(enum_type) => TypeDef::Enum(EnumDef {
                name: name.clone(),
                description,
                values: enum_type
                    .values
                    .iter()
                    .map(|v| {
                        let deprecated = v
                            .node
                            .directives
                            .iter()
                            .any(|d| d.node.name.node.as_str() == "deprecated");
                        EnumValueDef {
                            name: v.node.value.node.to_string(),
                            description: v.node.description.as_ref().map(|d| d.node.clone()),
                            deprecated,
                            deprecation_reason: None,
                        }
                    })
                    .collect(),
            }),
            ast::TypeKind::InputObject(input) => TypeDef::InputObject(InputObjectDef {
                name: name.clone(),
                description,
                fields: input
                    .fields
                    .iter()
                    .map(|f| {
                        let field = InputFieldDef::from_ast(&f.node);
                        (field.name.clone(), field)
                    })
                    .collect(),
            }),
        };

        if def.extend {
            return self.extend_type(incoming);
        }

        match self.schema.types.get(&name) {
            None => {
                self.schema.types.insert(name, incoming);
                Ok(())
            }
            // Custom scalars are commonly declared by every SDL fragment.
            Some(TypeDef::Scalar(_)) if matches!(incoming, TypeDef::Scalar(_)) => Ok(()),
            Some(_) => Err(SchemaError::DuplicateType(name)),
        }
    }

    fn extend_type(&mut self, incoming: TypeDef) -> Result<(), SchemaError> {
        let name = incoming.name().to_string();
        let Some(existing) = self.schema.types.get_mut(&name) else {
            return Err(SchemaError::InvalidExtension(name));
        };

        match (existing, incoming) {
            (TypeDef::Object(target), TypeDef::Object(ext)) => {
                target.fields.extend(ext.fields);
                target.implements.extend(ext.implements);
                target.directives.extend(ext.directives);
            }
            (TypeDef::Interface(target), TypeDef::Interface(ext)) => {
                target.fields.extend(ext.fields);
                target.implements.extend(ext.implements);
                target.directives.extend(ext.directives);
            }
            (TypeDef::Union(target), TypeDef::Union(ext)) => {
                target.members.extend(ext.members);
                target.directives.extend(ext.directives);
            }
            (TypeDef::Enum(target), TypeDef::Enum(ext)) => target.values.extend(ext.values),
            (TypeDef::InputObject(target), TypeDef::InputObject(ext)) => {
                target.fields.extend(ext.fields);
            }
            (TypeDef::Scalar(_), TypeDef::Scalar(_)) => {}
            _ => return Err(SchemaError::InvalidExtension(name)),
        }
        Ok(())
    }

    /// Builds the schema, defaulting root types to `Query`, `Mutation` and
    /// `Subscription` when they exist.
    pub fn build(mut self) -> Result<Schema, SchemaError> {
        for (slot, default) in [
            (&mut self.schema.query_type, "Query"),
            (&mut self.schema.mutation_type, "Mutation"),
            (&mut self.schema.subscription_type, "Subscription"),
        ] {
            if slot.is_none() && self.schema.types.contains_key(default) {
                *slot = Some(default.to_string());
            }
        }

        let Some(query) = &self.schema.query_type else {
            return Err(SchemaError::MissingQueryType);
        };
        for root in [
            Some(query),
            self.schema.mutation_type.as_ref(),
            self.schema.subscription_type.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if !matches!(self.schema.types.get(root), Some(TypeDef::Object(_))) {
                return Err(SchemaError::InvalidRootType(root.clone()));
            }
        }

        Ok(self.schema)
    }
}

fn fields_from_ast(
    fields: &[async_graphql_parser::Positioned<ast::FieldDefinition>],
) -> IndexMap<String, FieldDef> {
    fields
        .iter()
        .map(|f| {
            let field = FieldDef::from_ast(&f.node);
            (field.name.clone(), field)
        })
        .collect()
}
