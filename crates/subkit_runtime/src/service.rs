//! Request service: parse, check, admit, execute and report.

use crate::complexity::{ComplexityReport, QueryComplexity};
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{ErrorCode, GraphQLError};
use crate::executor::{effective_variables, Executor, Response};
use crate::extensions::{CacheControlExtension, ExtensionStack, TracingExtension};
use crate::pubsub::PubSubEngine;
use crate::schema::CompiledSchema;
use crate::subscription::SubscriptionManager;
use crate::validation::{subscription_single_root, validate};
use async_graphql_parser::parse_query;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use subkit_core::{select_operation, Variables};
use tracing::{debug, info_span, warn, Instrument};

/// A request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub query: String,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

/// Receives the complexity score of every scored request.
pub type ComplexityCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Runs requests against one compiled schema.
#[derive(Clone)]
pub struct Service {
    executor: Executor,
    config: RuntimeConfig,
    root_value: Value,
    on_complexity: Option<ComplexityCallback>,
}

impl Service {
    pub fn new(compiled: Arc<CompiledSchema>, config: RuntimeConfig) -> Self {
        Self {
            executor: Executor::new(compiled),
            config,
            root_value: Value::Object(Map::new()),
            on_complexity: None,
        }
    }

    /// Sets the root value passed to root field resolvers.
    pub fn with_root_value(mut self, root: Value) -> Self {
        self.root_value = root;
        self
    }

    /// Registers a callback that receives every computed complexity score.
    pub fn with_complexity_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_complexity = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn compiled(&self) -> &Arc<CompiledSchema> {
        self.executor.compiled()
    }

    /// Creates a subscription manager over the same compiled schema and
    /// complexity ceiling.
    pub fn subscription_manager(&self, pubsub: Arc<dyn PubSubEngine>) -> SubscriptionManager {
        let manager = SubscriptionManager::new(Arc::clone(self.compiled()), pubsub);
        match self.config.ceiling() {
            Some(ceiling) => manager.with_max_complexity(ceiling),
            None => manager,
        }
    }

    /// Executes one request.
    pub async fn execute(&self, request: Request, ctx: Context) -> Response {
        let span = info_span!("request", operation = ?request.operation_name);
        self.execute_inner(request, ctx).instrument(span).await
    }

    async fn execute_inner(&self, request: Request, ctx: Context) -> Response {
        let started = Instant::now();
        let stack = self.config.extensions.then(|| self.attach_stack(&ctx)).flatten();
        let mut run = Run {
            started,
            stack,
            score: None,
            ceiling: self.config.ceiling(),
        };
        run.hook(ExtensionStack::request_did_start);

        run.hook(ExtensionStack::parsing_did_start);
        let parsed = parse_query(&request.query);
        run.hook(ExtensionStack::parsing_did_end);
        let document = match parsed {
            Ok(document) => document,
            Err(e) => {
                let mut error = GraphQLError::new(e.to_string()).with_code(ErrorCode::ParseError);
                for pos in e.positions() {
                    error = error.with_location(pos);
                }
                return self.finish(run, Response::error(error));
            }
        };

        run.hook(ExtensionStack::validation_did_start);
        let checked = self.check(&document, &request, &mut run);
        run.hook(ExtensionStack::validation_did_end);
        let (operation, variables, report) = match checked {
            Ok(checked) => checked,
            Err(errors) => return self.finish(run, Response::errors(errors)),
        };

        let variables = Arc::new(variables);
        ctx.bind_variables(Arc::clone(&variables));
        run.hook(ExtensionStack::execution_did_start);
        let response = self
            .executor
            .execute_operation(
                &document,
                &operation,
                self.root_value.clone(),
                &ctx,
                variables,
                Some(&report),
            )
            .await;
        run.hook(ExtensionStack::execution_did_end);

        self.finish(run, response)
    }

    /// Document checks and admission control.
    fn check<'d>(
        &self,
        document: &'d async_graphql_parser::types::ExecutableDocument,
        request: &'d Request,
        run: &mut Run,
    ) -> Result<(subkit_core::SelectedOperation<'d>, Variables, ComplexityReport), Vec<GraphQLError>>
    {
        let schema = self.compiled().schema();
        let operation = select_operation(document, request.operation_name.as_deref()).map_err(|e| {
            vec![GraphQLError::new(e.to_string()).with_code(ErrorCode::ValidationError)]
        })?;

        let errors: Vec<GraphQLError> = validate(schema, document, &operation)
            .into_iter()
            .chain(subscription_single_root(&operation))
            .map(GraphQLError::from)
            .collect();
        if !errors.is_empty() {
            return Err(errors);
        }

        let variables = effective_variables(&operation.definition.node, request.variables.clone())?;
        let report = QueryComplexity::analyze(self.compiled(), document, &operation, &variables);
        run.score = Some(report.score);
        if let Some(callback) = &self.on_complexity {
            callback(report.score);
        }
        report.check(run.ceiling).map_err(|e| {
            debug!(score = e.score, ceiling = e.ceiling, "request rejected by admission control");
            vec![GraphQLError::from(e)]
        })?;

        Ok((operation, variables, report))
    }

    fn attach_stack(&self, ctx: &Context) -> Option<Arc<ExtensionStack>> {
        let stack = Arc::new(
            ExtensionStack::new()
                .with(CacheControlExtension::new())
                .with(TracingExtension::new()),
        );
        if !ctx.attach_extensions(Arc::clone(&stack)) {
            warn!("context already carries an extension stack, reusing it");
        }
        ctx.extensions().cloned()
    }

    fn finish(&self, run: Run, response: Response) -> Response {
        run.hook(ExtensionStack::request_did_end);
        let Some(stack) = &run.stack else {
            return response;
        };

        let mut report = Map::new();
        let duration = u64::try_from(run.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        report.insert("duration_ns".to_string(), json!(duration));
        if let Some(score) = run.score {
            report.insert("complexityScore".to_string(), json!(score));
        }
        if let Some(ceiling) = run.ceiling {
            report.insert("complexityCeiling".to_string(), json!(ceiling));
        }
        report.extend(stack.format());
        response.with_extensions(report)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("compiled", self.compiled())
            .finish_non_exhaustive()
    }
}

/// Per-request bookkeeping for the report.
struct Run {
    started: Instant,
    stack: Option<Arc<ExtensionStack>>,
    score: Option<u64>,
    ceiling: Option<u64>,
}

impl Run {
    fn hook(&self, hook: fn(&ExtensionStack)) {
        if let Some(stack) = &self.stack {
            hook(stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use subkit_core::Schema;

    const SDL: &str = r#"
        type Query {
            hello: String
            me: User @cacheControl(maxAge: 30)
        }

        type User @cacheControl(maxAge: 60, scope: PRIVATE) {
            id: ID
            name: String
        }
    "#;

    fn service(config: RuntimeConfig) -> Service {
        let mut resolvers = ResolverMap::new();
        resolvers.register_fn("Query", "hello", |_, _, _, _| Ok(json!("world")));
        resolvers.register_fn("Query", "me", |_, _, _, _| Ok(json!({"id": "1", "name": "Ada"})));
        let compiled = CompiledSchema::builder(Schema::parse(SDL).unwrap())
            .resolvers(resolvers)
            .build()
            .unwrap();
        Service::new(Arc::new(compiled), config)
    }

    #[tokio::test]
    async fn test_execute_without_report() {
        let response = service(RuntimeConfig::new())
            .execute(Request::new("{ hello }"), Context::new())
            .await;
        assert_eq!(response.data, Some(json!({"hello": "world"})));
        assert!(response.errors.is_none());
        assert!(response.extensions.is_none());
    }

    #[tokio::test]
    async fn test_parse_and_validation_errors() {
        let service = service(RuntimeConfig::new().with_extensions(true));

        let response = service.execute(Request::new("{ hello"), Context::new()).await;
        assert_eq!(response.data, None);
        assert_eq!(response.errors.unwrap()[0].code(), Some("PARSE_ERROR"));

        let response = service.execute(Request::new("{ nope }"), Context::new()).await;
        assert_eq!(response.data, None);
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].message, "Cannot query field \"nope\" on type \"Query\".");
        assert!(response.extensions.unwrap().contains_key("duration_ns"));
    }

    #[tokio::test]
    async fn test_admission_control() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let service = service(RuntimeConfig::new().with_max_complexity(2))
            .with_complexity_callback(move |score| sink.store(score, Ordering::SeqCst));

        let response = service
            .execute(Request::new("{ me { id name } }"), Context::new())
            .await;
        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "The query exceeds the maximum complexity of 2. Actual complexity is 3"
        );
        assert_eq!(response.data, None);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_report_shape() {
        let service = service(
            RuntimeConfig::new()
                .with_extensions(true)
                .with_max_complexity(10),
        );
        let ctx = Context::new();
        let response = service
            .execute(Request::new("{ me { id } hello }"), ctx.clone())
            .await;

        let report = response.extensions.unwrap();
        assert_eq!(report["complexityScore"], json!(3));
        assert_eq!(report["complexityCeiling"], json!(10));
        assert_eq!(
            report["cacheHints"],
            json!([{"path": ["me"], "maxAge": 30, "scope": "PRIVATE"}])
        );
        assert!(report["trace"]["startTime"].is_string());
        assert_eq!(
            report["trace"]["resolvers"]
                .as_array()
                .unwrap()
                .len(),
            3
        );

        let cache = ctx
            .extensions()
            .unwrap()
            .find::<CacheControlExtension>()
            .unwrap();
        assert_eq!(cache.header_value().as_deref(), Some("max-age=30, private"));
    }
}
