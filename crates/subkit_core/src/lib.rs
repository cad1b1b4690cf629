//! SubKit core: the schema model shared by the runtime and the directive
//! catalogue.
//!
//! - [`schema`]: types, fields and the SDL loader
//! - [`directive`]: directive definitions and invocations
//! - [`coerce`]: typed argument coercion
//! - [`template`]: sandboxed `${...}` expansion and path selection
//! - [`operation`]: operation kinds and selection

pub mod coerce;
pub mod directive;
pub mod error;
pub mod operation;
pub mod path;
pub mod schema;
pub mod template;

pub use coerce::{coerce_arguments, coerce_value, literal_to_json, Variables};
pub use directive::{
    DirectiveDefinition, DirectiveInvocation, DirectiveLocation, InvocationLocation,
};
pub use error::{CoercionError, OperationError, SchemaError, TemplateError};
pub use operation::{select_operation, OperationKind, SelectedOperation};
pub use path::{PathSegment, ResponsePath};
pub use schema::{
    EnumDef, FieldDef, InputFieldDef, InputObjectDef, InterfaceDef, ObjectDef, ScalarDef, Schema,
    SchemaBuilder, TypeDef, TypeRef, UnionDef,
};
pub use template::{TemplateRoot, TemplateScope};

/// Re-exported parser and value crates so downstream crates agree on versions.
pub use async_graphql_parser as parser;
pub use async_graphql_value as value;
