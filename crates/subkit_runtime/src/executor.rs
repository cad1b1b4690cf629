//! Operation execution.

use crate::complexity::ComplexityReport;
use crate::context::Context;
use crate::error::{ErrorCode, GraphQLError};
use crate::resolver::{ResolverArgs, ResolverInfo};
use crate::schema::CompiledSchema;
use async_graphql_parser::types::{
    Directive, ExecutableDocument, Field, OperationDefinition, Selection, SelectionSet,
};
use async_graphql_parser::Positioned;
use async_graphql_value::Value as Literal;
use futures::future::{join_all, BoxFuture};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use subkit_core::{
    coerce_arguments, select_operation, DirectiveInvocation, OperationKind, ResponsePath,
    SelectedOperation, TypeDef, TypeRef, Variables,
};
use tracing::debug;

/// A response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The data; `null` when execution did not run or a non-null root failed.
    pub data: Option<Value>,
    /// The errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,
    /// The request report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Response {
    /// Creates a successful response with data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Creates an error response.
    pub fn error(error: impl Into<GraphQLError>) -> Self {
        Self::errors(vec![error.into()])
    }

    /// Creates an error response with multiple errors.
    pub fn errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
            extensions: None,
        }
    }

    /// Attaches the report.
    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Returns true if the response has errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Returns true if the response has data.
    pub fn has_data(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_null())
    }
}

/// The inputs of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'d> {
    pub document: &'d ExecutableDocument,
    pub operation_name: Option<&'d str>,
    pub variables: Variables,
    pub root_value: Value,
    /// Per-field scores for resolver info and tracing.
    pub complexity: Option<&'d ComplexityReport>,
}

impl<'d> ExecutionRequest<'d> {
    pub fn new(document: &'d ExecutableDocument) -> Self {
        Self {
            document,
            operation_name: None,
            variables: Variables::new(),
            root_value: Value::Object(Map::new()),
            complexity: None,
        }
    }

    pub fn operation_name(mut self, name: Option<&'d str>) -> Self {
        self.operation_name = name;
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn root_value(mut self, root: Value) -> Self {
        self.root_value = root;
        self
    }

    pub fn complexity(mut self, report: &'d ComplexityReport) -> Self {
        self.complexity = Some(report);
        self
    }
}

/// Executes operations against a compiled schema.
#[derive(Debug, Clone)]
pub struct Executor {
    compiled: Arc<CompiledSchema>,
}

impl Executor {
    pub fn new(compiled: Arc<CompiledSchema>) -> Self {
        Self { compiled }
    }

    pub fn compiled(&self) -> &Arc<CompiledSchema> {
        &self.compiled
    }

    /// Selects the requested operation, binds its variables on `ctx` and
    /// executes it.
    pub async fn execute(&self, request: ExecutionRequest<'_>, ctx: &Context) -> Response {
        let operation = match select_operation(request.document, request.operation_name) {
            Ok(operation) => operation,
            Err(e) => return Response::error(GraphQLError::new(e.to_string()).with_code(ErrorCode::ValidationError)),
        };
        let variables = match effective_variables(&operation.definition.node, request.variables) {
            Ok(variables) => Arc::new(variables),
            Err(errors) => return Response::errors(errors),
        };
        ctx.bind_variables(Arc::clone(&variables));

        self.execute_operation(
            request.document,
            &operation,
            request.root_value,
            ctx,
            variables,
            request.complexity,
        )
        .await
    }

    /// Executes an already selected and checked operation.
    pub async fn execute_operation(
        &self,
        document: &ExecutableDocument,
        operation: &SelectedOperation<'_>,
        root_value: Value,
        ctx: &Context,
        variables: Arc<Variables>,
        complexity: Option<&ComplexityReport>,
    ) -> Response {
        let kind = operation.kind();
        let Some(root_type) = self.compiled.schema().root_type(kind) else {
            return Response::error(
                GraphQLError::new(format!("Schema is not configured for {kind}s."))
                    .with_code(ErrorCode::ValidationError),
            );
        };

        debug!(operation = ?operation.name, %kind, "executing operation");
        let execution = Execution {
            compiled: &self.compiled,
            document,
            ctx,
            variables,
            complexity,
            errors: Mutex::new(Vec::new()),
        };
        let data = execution
            .execute_selection(
                root_type.to_string(),
                vec![&operation.definition.node.selection_set.node],
                root_value,
                ResponsePath::root(),
                kind == OperationKind::Mutation,
            )
            .await
            .unwrap_or(Value::Null);

        let errors = execution
            .errors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        Response {
            data: Some(data),
            errors: (!errors.is_empty()).then_some(errors),
            extensions: None,
        }
    }
}

/// Supplied variables with declared defaults filled in.
pub(crate) fn effective_variables(
    operation: &OperationDefinition,
    mut supplied: Variables,
) -> Result<Variables, Vec<GraphQLError>> {
    let mut errors = Vec::new();
    for definition in &operation.variable_definitions {
        let name = definition.node.name.node.as_str();
        if supplied.get(name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        if let Some(default) = &definition.node.default_value {
            if !supplied.contains_key(name) {
                supplied.insert(
                    name.to_string(),
                    default.node.clone().into_json().unwrap_or(Value::Null),
                );
            }
            continue;
        }
        if !definition.node.var_type.node.nullable {
            errors.push(
                GraphQLError::new(format!(
                    "Variable \"${name}\" of required type \"{}\" was not provided.",
                    definition.node.var_type.node
                ))
                .with_location(definition.pos)
                .with_code(ErrorCode::ValidationError),
            );
        }
    }
    if errors.is_empty() {
        Ok(supplied)
    } else {
        Err(errors)
    }
}

/// Marks a `null` that must propagate to the nearest nullable position.
#[derive(Debug, Clone, Copy)]
struct Bubble;

type Completion = Result<Value, Bubble>;

/// Null at a nullable position absorbs a propagating null.
fn absorb(ty: &TypeRef, completion: Completion) -> Completion {
    match completion {
        Err(Bubble) if !ty.is_non_null() => Ok(Value::Null),
        other => other,
    }
}

type FieldGroups<'a> = IndexMap<String, Vec<&'a Positioned<Field>>>;

struct Execution<'a> {
    compiled: &'a CompiledSchema,
    document: &'a ExecutableDocument,
    ctx: &'a Context,
    variables: Arc<Variables>,
    complexity: Option<&'a ComplexityReport>,
    errors: Mutex<Vec<GraphQLError>>,
}

impl<'a> Execution<'a> {
    fn push_error(&self, error: GraphQLError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    fn execute_selection<'b>(
        &'b self,
        object_type: String,
        sets: Vec<&'a SelectionSet>,
        parent: Value,
        path: ResponsePath,
        serial: bool,
    ) -> BoxFuture<'b, Completion> {
        Box::pin(async move {
            let mut groups = FieldGroups::new();
            let mut visited = Vec::new();
            for set in sets {
                self.collect_fields(&object_type, set, &mut groups, &mut visited);
            }

            let mut data = Map::new();
            if serial {
                for (key, nodes) in &groups {
                    let value = self
                        .execute_field(&object_type, &parent, &path, key, nodes)
                        .await?;
                    data.insert(key.clone(), value);
                }
            } else {
                let values = join_all(groups.iter().map(|(key, nodes)| {
                    self.execute_field(&object_type, &parent, &path, key, nodes)
                }))
                .await;
                for (key, value) in groups.keys().zip(values) {
                    data.insert(key.clone(), value?);
                }
            }
            Ok(Value::Object(data))
        })
    }

    fn collect_fields(
        &self,
        object_type: &str,
        set: &'a SelectionSet,
        groups: &mut FieldGroups<'a>,
        visited: &mut Vec<&'a str>,
    ) {
        let schema = self.compiled.schema();
        for selection in &set.items {
            match &selection.node {
                Selection::Field(field) => {
                    if self.included(&field.node.directives) {
                        groups
                            .entry(field.node.response_key().node.to_string())
                            .or_default()
                            .push(field);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    if visited.contains(&name) || !self.included(&spread.node.directives) {
                        continue;
                    }
                    visited.push(name);
                    if let Some(fragment) = self.document.fragments.get(name) {
                        let condition = fragment.node.type_condition.node.on.node.as_str();
                        if schema.is_possible_type(condition, object_type) {
                            self.collect_fields(
                                object_type,
                                &fragment.node.selection_set.node,
                                groups,
                                visited,
                            );
                        }
                    }
                }
                Selection::InlineFragment(inline) => {
                    if !self.included(&inline.node.directives) {
                        continue;
                    }
                    let applies = inline.node.type_condition.as_ref().map_or(true, |condition| {
                        schema.is_possible_type(condition.node.on.node.as_str(), object_type)
                    });
                    if applies {
                        self.collect_fields(object_type, &inline.node.selection_set.node, groups, visited);
                    }
                }
            }
        }
    }

    /// Evaluates `@skip` and `@include`.
    fn included(&self, directives: &[Positioned<Directive>]) -> bool {
        directives.iter().all(|directive| {
            let condition = || {
                directive
                    .node
                    .get_argument("if")
                    .and_then(|value| match &value.node {
                        Literal::Boolean(b) => Some(*b),
                        Literal::Variable(name) => {
                            self.variables.get(name.as_str()).and_then(Value::as_bool)
                        }
                        _ => None,
                    })
                    .unwrap_or(false)
            };
            match directive.node.name.node.as_str() {
                "skip" => !condition(),
                "include" => condition(),
                _ => true,
            }
        })
    }

    fn execute_field<'b>(
        &'b self,
        object_type: &'b str,
        parent: &'b Value,
        path: &'b ResponsePath,
        key: &'b str,
        nodes: &'b [&'a Positioned<Field>],
    ) -> BoxFuture<'b, Completion> {
        Box::pin(async move {
            let Some(&field) = nodes.first() else {
                return Ok(Value::Null);
            };
            let name = field.node.name.node.as_str();
            if name == "__typename" {
                return Ok(Value::String(object_type.to_string()));
            }
            let Some(descriptor) = self.compiled.field(object_type, name) else {
                return Ok(Value::Null);
            };
            let field_path = path.child(key);

            let args = match coerce_arguments(
                self.compiled.schema(),
                &descriptor.arguments,
                field
                    .node
                    .arguments
                    .iter()
                    .map(|(name, value)| (name.node.as_str(), &value.node)),
                &self.variables,
            ) {
                Ok(args) => ResolverArgs::from(args),
                Err(e) => {
                    self.push_error(
                        GraphQLError::new(e.to_string())
                            .with_location(field.pos)
                            .with_path(field_path)
                            .with_code(ErrorCode::ValidationError),
                    );
                    return absorb(&descriptor.ty, Err(Bubble));
                }
            };

            let info = ResolverInfo {
                field_name: name.to_string(),
                response_key: key.to_string(),
                return_type: descriptor.ty.clone(),
                parent_type: object_type.to_string(),
                path: field_path.clone(),
                selected_fields: selected_fields(nodes),
                operation_directives: field
                    .node
                    .directives
                    .iter()
                    .map(|d| DirectiveInvocation::from_operation(&d.node))
                    .collect(),
                score: self
                    .complexity
                    .and_then(|report| report.field_score(&field_path, field.pos)),
                schema: Arc::clone(self.compiled.schema()),
            };

            let completion = match descriptor.resolver.resolve(parent, &args, self.ctx, &info).await {
                Ok(value) => {
                    self.complete_value(&descriptor.ty, &info, nodes, value, field_path)
                        .await
                }
                Err(e) => {
                    self.push_error(
                        GraphQLError::new(e.to_string())
                            .with_location(field.pos)
                            .with_path(field_path)
                            .with_code(ErrorCode::ResolverError),
                    );
                    Err(Bubble)
                }
            };
            absorb(&descriptor.ty, completion)
        })
    }

    fn complete_value<'b>(
        &'b self,
        ty: &'b TypeRef,
        info: &'b ResolverInfo,
        nodes: &'b [&'a Positioned<Field>],
        value: Value,
        path: ResponsePath,
    ) -> BoxFuture<'b, Completion> {
        Box::pin(async move {
            match ty {
                TypeRef::NonNull(inner) => {
                    let completed = self.complete_value(inner, info, nodes, value, path.clone()).await?;
                    if completed.is_null() {
                        self.push_error(self.field_error(
                            format!(
                                "Cannot return null for non-nullable field {}.{}.",
                                info.parent_type, info.field_name
                            ),
                            nodes,
                            path,
                            ErrorCode::NonNullViolation,
                        ));
                        return Err(Bubble);
                    }
                    Ok(completed)
                }
                _ if value.is_null() => Ok(Value::Null),
                TypeRef::List(inner) => {
                    let Value::Array(items) = value else {
                        self.push_error(self.field_error(
                            format!(
                                "Expected a list for field {}.{}.",
                                info.parent_type, info.field_name
                            ),
                            nodes,
                            path,
                            ErrorCode::ExecutionError,
                        ));
                        return Err(Bubble);
                    };
                    let completed = join_all(items.into_iter().enumerate().map(|(index, item)| {
                        self.complete_value(inner, info, nodes, item, path.child(index))
                    }))
                    .await;
                    completed
                        .into_iter()
                        .map(|item| absorb(inner, item))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array)
                }
                TypeRef::Named(name) => {
                    let schema = self.compiled.schema();
                    if !schema.is_composite(name) {
                        return Ok(value);
                    }
                    let Some(object_type) = self.runtime_type(name, &value) else {
                        self.push_error(self.field_error(
                            format!(
                                "Abstract type \"{name}\" must resolve to an Object type at runtime for field \"{}.{}\".",
                                info.parent_type, info.field_name
                            ),
                            nodes,
                            path,
                            ErrorCode::ExecutionError,
                        ));
                        return Err(Bubble);
                    };
                    let sets = nodes
                        .iter()
                        .map(|node| &node.node.selection_set.node)
                        .collect();
                    self.execute_selection(object_type, sets, value, path, false)
                        .await
                }
            }
        })
    }

    /// The object type of a composite value: `__typename` or the only possible
    /// type.
    fn runtime_type(&self, declared: &str, value: &Value) -> Option<String> {
        let schema = self.compiled.schema();
        if matches!(schema.get_type(declared), Some(TypeDef::Object(_))) {
            return Some(declared.to_string());
        }
        if let Some(typename) = value.get("__typename").and_then(Value::as_str) {
            return schema
                .is_possible_type(declared, typename)
                .then(|| typename.to_string());
        }
        match schema.possible_types(declared).as_slice() {
            [only] => Some((*only).to_string()),
            _ => None,
        }
    }

    fn field_error(
        &self,
        message: String,
        nodes: &[&'a Positioned<Field>],
        path: ResponsePath,
        code: ErrorCode,
    ) -> GraphQLError {
        let mut error = GraphQLError::new(message).with_path(path).with_code(code);
        if let Some(field) = nodes.first() {
            error = error.with_location(field.pos);
        }
        error
    }
}

fn selected_fields(nodes: &[&Positioned<Field>]) -> Vec<String> {
    let mut names = Vec::new();
    for node in nodes {
        for selection in &node.node.selection_set.node.items {
            if let Selection::Field(field) = &selection.node {
                let name = field.node.name.node.to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}
