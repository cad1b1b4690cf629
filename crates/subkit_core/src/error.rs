//! Error types shared across SubKit crates.

use thiserror::Error;

/// Errors raised while building or compiling a schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// The SDL source could not be parsed.
    #[error("failed to parse schema: {0}")]
    Parse(String),

    /// A type was declared twice without `extend`.
    #[error("type \"{0}\" is defined more than once")]
    DuplicateType(String),

    /// `extend type` targets a type that does not exist or has another kind.
    #[error("cannot extend type \"{0}\"")]
    InvalidExtension(String),

    /// The schema declares no query root type.
    #[error("schema has no query root type")]
    MissingQueryType,

    /// A root operation type points at an unknown object type.
    #[error("root type \"{0}\" is not an object type in the schema")]
    InvalidRootType(String),

    /// A field declares a directive that no registry entry handles.
    #[error("unknown directive @{directive} on {type_name}.{field_name}")]
    UnknownDirective {
        directive: String,
        type_name: String,
        field_name: String,
    },
}

/// Errors raised while coercing literal arguments to their declared types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoercionError {
    /// The literal does not match the declared type.
    #[error("expected a value of type {ty}, found {value}")]
    InvalidValue { ty: String, value: String },

    /// A non-null position received `null`.
    #[error("expected a non-null value of type {ty}")]
    NullForNonNull { ty: String },

    /// A required argument was omitted.
    #[error("argument \"{name}\" of required type {ty} was not provided")]
    MissingArgument { name: String, ty: String },

    /// A required argument referenced a variable with no runtime value.
    #[error("variable \"${name}\" of required type {ty} was not provided")]
    MissingVariable { name: String, ty: String },

    /// The named type cannot be used as an input.
    #[error("type \"{0}\" is not an input type")]
    NotInputType(String),

    /// Coercion failure inside a named argument or input field.
    #[error("argument \"{name}\": {source}")]
    Argument {
        name: String,
        #[source]
        source: Box<CoercionError>,
    },
}

/// Errors raised by template expansion and path selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The expression starts with a root outside the allowed set.
    #[error("unknown template variable \"{0}\"")]
    UnknownVariable(String),

    /// The expression is not a plain path.
    #[error("invalid template expression \"{0}\"")]
    InvalidExpression(String),

    /// The value cannot be rendered into the target text.
    #[error("cannot render template value: {0}")]
    Unrenderable(String),
}

/// Errors raised while picking the operation to run from a document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// No operation matches the requested name.
    #[error("Unknown operation named \"{0}\".")]
    UnknownOperation(String),

    /// The document holds several operations and no name was given.
    #[error("Must provide operation name if query contains multiple operations.")]
    AmbiguousOperation,

    /// The schema has no root type for this kind of operation.
    #[error("Schema is not configured for {0}s.")]
    UnsupportedOperation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_coercion_message() {
        let err = CoercionError::Argument {
            name: "first".to_string(),
            source: Box::new(CoercionError::InvalidValue {
                ty: "Int".to_string(),
                value: "\"ten\"".to_string(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "argument \"first\": expected a value of type Int, found \"ten\""
        );
    }

    #[test]
    fn test_operation_error_messages() {
        assert_eq!(
            OperationError::UnsupportedOperation("subscription".to_string()).to_string(),
            "Schema is not configured for subscriptions."
        );
    }
}
