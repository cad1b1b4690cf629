//! Document checks run before execution.
//!
//! These cover what the executor relies on: known root types, fields,
//! fragments and type conditions, leaf/composite selection shape, required
//! arguments and acyclic fragments. Subscriptions additionally need a single
//! root field selected without fragments.

use crate::error::ValidationError;
use async_graphql_parser::types::{
    ExecutableDocument, Field, FragmentDefinition, Selection, SelectionSet,
};
use async_graphql_parser::{Pos, Positioned};
use subkit_core::{OperationError, OperationKind, Schema, SelectedOperation};

/// Checks `operation` and every fragment of `document`.
pub fn validate(
    schema: &Schema,
    document: &ExecutableDocument,
    operation: &SelectedOperation<'_>,
) -> Vec<ValidationError> {
    let mut validator = Validator {
        schema,
        document,
        errors: Vec::new(),
    };

    let kind = operation.kind();
    match schema.root_type(kind) {
        Some(root) => {
            validator.selection_set(&operation.definition.node.selection_set.node, root);
        }
        None => validator.errors.push(
            ValidationError::new(OperationError::UnsupportedOperation(kind.to_string()).to_string())
                .at(operation.definition.pos),
        ),
    }

    for (name, fragment) in &document.fragments {
        validator.fragment(name.as_str(), fragment);
    }
    validator.errors
}

/// Checks that a subscription selects exactly one root field and no
/// fragments.
pub fn subscription_single_root(operation: &SelectedOperation<'_>) -> Vec<ValidationError> {
    if operation.kind() != OperationKind::Subscription {
        return Vec::new();
    }

    let mut errors = Vec::new();
    let mut fields = 0;
    for selection in &operation.definition.node.selection_set.node.items {
        match &selection.node {
            Selection::Field(_) => fields += 1,
            Selection::FragmentSpread(_) | Selection::InlineFragment(_) => errors.push(
                ValidationError::new("Subscriptions do not support fragments on the root field")
                    .at(selection.pos),
            ),
        }
    }
    if fields > 1 {
        errors.push(ValidationError::new(format!(
            "Subscription \"{}\" must have only one field.",
            operation.name.unwrap_or_default()
        )));
    }
    errors
}

struct Validator<'a> {
    schema: &'a Schema,
    document: &'a ExecutableDocument,
    errors: Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, message: String, pos: Pos) {
        self.errors.push(ValidationError::new(message).at(pos));
    }

    fn fragment(&mut self, name: &str, fragment: &'a Positioned<FragmentDefinition>) {
        let condition = &fragment.node.type_condition.node.on;
        let type_name = condition.node.as_str();
        if self.schema.get_type(type_name).is_none() {
            self.error(format!("Unknown type \"{type_name}\"."), condition.pos);
            return;
        }
        if !self.schema.is_composite(type_name) {
            self.error(
                format!("Fragment \"{name}\" cannot condition on non composite type \"{type_name}\"."),
                condition.pos,
            );
            return;
        }
        if self.spreads_itself(name, &fragment.node.selection_set.node, &mut Vec::new()) {
            self.error(
                format!("Cannot spread fragment \"{name}\" within itself."),
                fragment.pos,
            );
            return;
        }
        self.selection_set(&fragment.node.selection_set.node, type_name);
    }

    fn spreads_itself(&self, target: &str, set: &'a SelectionSet, visited: &mut Vec<&'a str>) -> bool {
        set.items.iter().any(|selection| match &selection.node {
            Selection::Field(field) => {
                self.spreads_itself(target, &field.node.selection_set.node, visited)
            }
            Selection::InlineFragment(inline) => {
                self.spreads_itself(target, &inline.node.selection_set.node, visited)
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.as_str();
                if name == target {
                    return true;
                }
                if visited.contains(&name) {
                    return false;
                }
                visited.push(name);
                self.document
                    .fragments
                    .get(name)
                    .is_some_and(|f| self.spreads_itself(target, &f.node.selection_set.node, visited))
            }
        })
    }

    fn selection_set(&mut self, set: &'a SelectionSet, type_name: &str) {
        for selection in &set.items {
            match &selection.node {
                Selection::Field(field) => self.field(field, type_name),
                Selection::FragmentSpread(spread) => {
                    let name = &spread.node.fragment_name;
                    if !self.document.fragments.contains_key(name.node.as_str()) {
                        self.error(format!("Unknown fragment \"{}\".", name.node), name.pos);
                    }
                }
                Selection::InlineFragment(inline) => {
                    let narrowed = match &inline.node.type_condition {
                        Some(condition) => {
                            let on = &condition.node.on;
                            if !self.schema.is_composite(on.node.as_str()) {
                                self.error(format!("Unknown type \"{}\".", on.node), on.pos);
                                continue;
                            }
                            on.node.as_str()
                        }
                        None => type_name,
                    };
                    self.selection_set(&inline.node.selection_set.node, narrowed);
                }
            }
        }
    }

    fn field(&mut self, field: &'a Positioned<Field>, type_name: &str) {
        let name = field.node.name.node.as_str();
        let has_selection = !field.node.selection_set.node.items.is_empty();

        if name == "__typename" {
            if has_selection {
                self.error(
                    "Field \"__typename\" must not have a selection since type \"String!\" has no subfields."
                        .to_string(),
                    field.pos,
                );
            }
            return;
        }

        let Some(definition) = self.schema.field(type_name, name) else {
            self.error(
                format!("Cannot query field \"{name}\" on type \"{type_name}\"."),
                field.pos,
            );
            return;
        };

        for (arg_name, arg) in &definition.arguments {
            let supplied = field
                .node
                .arguments
                .iter()
                .any(|(supplied, _)| supplied.node.as_str() == arg_name);
            if arg.ty.is_non_null() && arg.default_value.is_none() && !supplied {
                self.error(
                    format!(
                        "Field \"{name}\" argument \"{arg_name}\" of type \"{}\" is required, but it was not provided.",
                        arg.ty
                    ),
                    field.pos,
                );
            }
        }
        for (supplied, _) in &field.node.arguments {
            if !definition.arguments.contains_key(supplied.node.as_str()) {
                self.error(
                    format!(
                        "Unknown argument \"{}\" on field \"{type_name}.{name}\".",
                        supplied.node
                    ),
                    supplied.pos,
                );
            }
        }

        let target = definition.ty.named_type();
        if self.schema.is_composite(target) {
            if has_selection {
                self.selection_set(&field.node.selection_set.node, target);
            } else {
                self.error(
                    format!(
                        "Field \"{name}\" of type \"{}\" must have a selection of subfields. Did you mean \"{name} {{ ... }}\"?",
                        definition.ty
                    ),
                    field.pos,
                );
            }
        } else if has_selection {
            self.error(
                format!(
                    "Field \"{name}\" must not have a selection since type \"{}\" has no subfields.",
                    definition.ty
                ),
                field.pos,
            );
        }
    }
}
