//! Operation selection.

use async_graphql_parser::types::{
    DocumentOperations, ExecutableDocument, OperationDefinition, OperationType,
};
use async_graphql_parser::Positioned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::OperationError;

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl From<OperationType> for OperationKind {
    fn from(ty: OperationType) -> Self {
        match ty {
            OperationType::Query => OperationKind::Query,
            OperationType::Mutation => OperationKind::Mutation,
            OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation picked from a document for execution.
#[derive(Debug, Clone, Copy)]
pub struct SelectedOperation<'d> {
    pub name: Option<&'d str>,
    pub definition: &'d Positioned<OperationDefinition>,
}

impl SelectedOperation<'_> {
    pub fn kind(&self) -> OperationKind {
        self.definition.node.ty.into()
    }
}

/// Picks the operation named `name`, or the only operation in the document.
pub fn select_operation<'d>(
    document: &'d ExecutableDocument,
    name: Option<&str>,
) -> Result<SelectedOperation<'d>, OperationError> {
    match (&document.operations, name) {
        (DocumentOperations::Single(definition), None) => Ok(SelectedOperation {
            name: None,
            definition,
        }),
        (DocumentOperations::Single(_), Some(name)) => {
            Err(OperationError::UnknownOperation(name.to_string()))
        }
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .iter()
            .find(|(op_name, _)| op_name.as_str() == name)
            .map(|(op_name, definition)| SelectedOperation {
                name: Some(op_name.as_str()),
                definition,
            })
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string())),
        (DocumentOperations::Multiple(operations), None) => {
            let mut iter = operations.iter();
            match (iter.next(), iter.next()) {
                (Some((op_name, definition)), None) => Ok(SelectedOperation {
                    name: Some(op_name.as_str()),
                    definition,
                }),
                _ => Err(OperationError::AmbiguousOperation),
            }
        }
    }
}
