//! Subscription manager: bridges bus events to document executions.
//!
//! `subscribe` checks and scores the document, derives a trigger map from the
//! single root field and registers one bus handler per topic. Every event
//! that passes its topic's filter executes the document with the event
//! payload as root value and hands the response to the subscriber's callback.
//!
//! The trigger map comes from, in order: a setup function registered for the
//! root field, a directive on the field that is a [`SubscriptionSource`], or
//! a single topic named after the field.

use crate::complexity::QueryComplexity;
use crate::context::Context;
use crate::directives::{merge_arguments, DirectiveEntry};
use crate::error::{ErrorCode, GraphQLError, SubscriptionError};
use crate::executor::{effective_variables, ExecutionRequest, Executor, Response};
use crate::pubsub::{ChannelOptions, EventHandler, PubSubEngine, PubSubError, SubscriptionId};
use crate::resolver::{ResolverArgs, ResolverInfo};
use crate::schema::CompiledSchema;
use crate::validation::{subscription_single_root, validate};
use async_graphql_parser::types::{ExecutableDocument, Selection};
use async_graphql_parser::parse_query;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use subkit_core::{coerce_arguments, select_operation, OperationKind, Variables};
use tracing::{debug, warn};

/// Decides whether an event is delivered: `(payload, context) -> bool`.
pub type FilterFn = Arc<dyn Fn(&Value, &Context) -> bool + Send + Sync>;

/// Builds the trigger map of a root field: `(options, args, field name)`.
pub type SetupFn =
    Arc<dyn Fn(&SubscribeOptions, &ResolverArgs, &str) -> TriggerMap + Send + Sync>;

/// Produces a fresh context for each event.
pub type ContextFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Context, String>> + Send + Sync>;

/// Receives one result per delivered event.
pub type SubscriptionCallback =
    Arc<dyn Fn(Result<Response, SubscriptionError>) + Send + Sync>;

/// Topics a subscription listens on.
pub type TriggerMap = IndexMap<String, Trigger>;

/// How one topic is listened to.
#[derive(Clone, Default)]
pub struct Trigger {
    pub channel_options: ChannelOptions,
    pub filter: Option<FilterFn>,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_options(mut self, options: ChannelOptions) -> Self {
        self.channel_options = options;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value, &Context) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, payload: &Value, ctx: &Context) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(payload, ctx))
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("channel_options", &self.channel_options)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Where each delivery gets its context from.
#[derive(Clone)]
pub enum ContextSource {
    /// Every delivery runs on a [fork](Context::fork) of this context.
    Value(Context),
    /// A context built per delivery.
    Factory(ContextFactory),
}

impl ContextSource {
    async fn resolve(&self) -> Result<Context, SubscriptionError> {
        match self {
            Self::Value(ctx) => Ok(ctx.fork()),
            Self::Factory(factory) => factory().await.map_err(SubscriptionError::Context),
        }
    }
}

impl Default for ContextSource {
    fn default() -> Self {
        Self::Value(Context::new())
    }
}

/// A subscription request.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Variables,
    pub context: ContextSource,
    pub callback: SubscriptionCallback,
}

impl SubscribeOptions {
    pub fn new<F>(query: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Result<Response, SubscriptionError>) + Send + Sync + 'static,
    {
        Self {
            query: query.into(),
            operation_name: None,
            variables: Variables::new(),
            context: ContextSource::default(),
            callback: Arc::new(callback),
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

    pub fn context(mut self, ctx: Context) -> Self {
        self.context = ContextSource::Value(ctx);
        self
    }

    pub fn context_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Context, String>> + Send + Sync + 'static,
    {
        self.context = ContextSource::Factory(Arc::new(factory));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("query", &self.query)
            .field("operation_name", &self.operation_name)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Events for subscription root fields that carry a directive.
///
/// A directive handler opts in through
/// [`DirectiveHandler::subscription_source`](crate::DirectiveHandler::subscription_source).
/// `args` holds the directive's arguments merged with the root field's.
pub trait SubscriptionSource: Send + Sync {
    /// The topics a new subscription listens on.
    fn triggers(&self, args: &ResolverArgs, ctx: &Context) -> TriggerMap;

    /// Starts producing events once every topic of `triggers` is listened
    /// on. An error cancels the subscription.
    fn start(
        &self,
        _args: &ResolverArgs,
        _ctx: &Context,
        _triggers: &TriggerMap,
        _bus: Arc<dyn PubSubEngine>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// The directive a root field gets its events from, with its arguments.
struct SourceLink {
    entry: Arc<DirectiveEntry>,
    args: ResolverArgs,
    ctx: Context,
}

impl SourceLink {
    fn triggers(&self) -> TriggerMap {
        self.entry
            .handler
            .subscription_source()
            .map(|source| source.triggers(&self.args, &self.ctx))
            .unwrap_or_default()
    }

    fn start(&self, triggers: &TriggerMap, bus: Arc<dyn PubSubEngine>) -> Result<(), String> {
        match self.entry.handler.subscription_source() {
            Some(source) => source.start(&self.args, &self.ctx, triggers, bus),
            None => Ok(()),
        }
    }
}

/// The checked root field of a subscription document.
struct RootField {
    name: String,
    args: ResolverArgs,
    variables: Variables,
}

/// External handle of an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything one bus handler needs to run a delivery.
struct Delivery {
    executor: Executor,
    document: ExecutableDocument,
    operation_name: Option<String>,
    variables: Variables,
    context: ContextSource,
    callback: SubscriptionCallback,
    /// Cleared by `unsubscribe` before the bus handlers are removed.
    active: AtomicBool,
}

impl Delivery {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn deliver(&self, payload: Value, trigger: &Trigger) {
        if !self.is_active() {
            return;
        }
        let ctx = match self.context.resolve().await {
            Ok(ctx) => ctx,
            Err(e) => {
                if self.is_active() {
                    (self.callback)(Err(e));
                }
                return;
            }
        };
        if !self.is_active() || !trigger.accepts(&payload, &ctx) {
            return;
        }

        let request = ExecutionRequest::new(&self.document)
            .operation_name(self.operation_name.as_deref())
            .variables(self.variables.clone())
            .root_value(payload);
        let response = self.executor.execute(request, &ctx).await;
        if !self.is_active() {
            debug!("dropping event for a cancelled subscription");
            return;
        }
        if response.data.is_none() {
            let message = response
                .errors
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            (self.callback)(Err(SubscriptionError::Execution(message)));
        } else {
            (self.callback)(Ok(response));
        }
    }
}

/// The bus registrations of one subscription.
struct Registration {
    ids: Vec<SubscriptionId>,
    delivery: Arc<Delivery>,
}

/// Manages the subscriptions of one compiled schema on one bus.
pub struct SubscriptionManager {
    executor: Executor,
    pubsub: Arc<dyn PubSubEngine>,
    setup: FxHashMap<String, SetupFn>,
    ceiling: Option<u64>,
    subscriptions: Mutex<FxHashMap<u64, Registration>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(compiled: Arc<CompiledSchema>, pubsub: Arc<dyn PubSubEngine>) -> Self {
        Self {
            executor: Executor::new(compiled),
            pubsub,
            setup: FxHashMap::default(),
            ceiling: None,
            subscriptions: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Rejects subscription documents scoring above `ceiling`. `0` disables
    /// the check.
    pub fn with_max_complexity(mut self, ceiling: u64) -> Self {
        self.ceiling = Some(ceiling).filter(|ceiling| *ceiling > 0);
        self
    }

    /// Registers the trigger setup for a subscription root field.
    pub fn with_setup<F>(mut self, field_name: impl Into<String>, setup: F) -> Self
    where
        F: Fn(&SubscribeOptions, &ResolverArgs, &str) -> TriggerMap + Send + Sync + 'static,
    {
        self.setup.insert(field_name.into(), Arc::new(setup));
        self
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSubEngine> {
        &self.pubsub
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Bus ids owned by `handle`.
    pub fn bus_ids(&self, handle: SubscriptionHandle) -> Option<Vec<SubscriptionId>> {
        self.table().get(&handle.0).map(|registration| registration.ids.clone())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, FxHashMap<u64, Registration>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks and scores the document, derives its triggers and listens on
    /// every topic.
    pub async fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let document = parse_query(&options.query).map_err(|e| {
            SubscriptionError::Validation(vec![
                GraphQLError::new(e.to_string()).with_code(ErrorCode::ParseError)
            ])
        })?;
        let root = self.root_field(&document, &options)?;
        let field_name = root.name.clone();

        let source = match self.setup.get(&field_name) {
            Some(_) => None,
            None => self.source_link(&root, &options).await?,
        };
        let triggers = match (self.setup.get(&field_name), &source) {
            (Some(setup), _) => setup(&options, &root.args, &field_name),
            (None, Some(link)) => link.triggers(),
            (None, None) => TriggerMap::from([(field_name.clone(), Trigger::new())]),
        };

        let delivery = Arc::new(Delivery {
            executor: self.executor.clone(),
            document,
            operation_name: options.operation_name.clone(),
            variables: options.variables.clone(),
            context: options.context.clone(),
            callback: Arc::clone(&options.callback),
            active: AtomicBool::new(true),
        });

        let mut ids = Vec::with_capacity(triggers.len());
        for (topic, trigger) in &triggers {
            let handler = event_handler(Arc::clone(&delivery), trigger.clone());
            match self
                .pubsub
                .subscribe(topic, handler, &trigger.channel_options)
                .await
            {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.release(&ids).await;
                    return Err(SubscriptionError::Setup(e.to_string()));
                }
            }
        }

        if let Some(link) = &source {
            if let Err(reason) = link.start(&triggers, Arc::clone(&self.pubsub)) {
                self.release(&ids).await;
                return Err(SubscriptionError::Setup(reason));
            }
        }

        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%handle, field = %field_name, topics = ids.len(), "subscription established");
        self.table().insert(handle.0, Registration { ids, delivery });
        Ok(handle)
    }

    /// Stops deliveries for `handle`, including events already taken off
    /// the bus.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SubscriptionError> {
        let registration = self
            .table()
            .remove(&handle.0)
            .ok_or(SubscriptionError::UnknownSubscription(handle.0))?;
        registration.delivery.active.store(false, Ordering::Release);
        self.release(&registration.ids).await;
        debug!(%handle, "subscription removed");
        Ok(())
    }

    /// Publishes `payload` on `topic`.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<usize, PubSubError> {
        self.pubsub.publish(topic, payload).await
    }

    async fn release(&self, ids: &[SubscriptionId]) {
        for id in ids {
            if let Err(e) = self.pubsub.unsubscribe(*id).await {
                warn!(%id, error = %e, "failed to cancel bus subscription");
            }
        }
    }

    /// The directive of the root field that produces its events, with its
    /// arguments expanded against a subscribe-time context.
    async fn source_link(
        &self,
        root: &RootField,
        options: &SubscribeOptions,
    ) -> Result<Option<SourceLink>, SubscriptionError> {
        let compiled = self.executor.compiled();
        let schema = compiled.schema();
        let Some(type_name) = schema.root_type(OperationKind::Subscription) else {
            return Ok(None);
        };
        let Some(descriptor) = compiled.field(type_name, &root.name) else {
            return Ok(None);
        };
        let Some((invocation, entry)) = descriptor.directives.iter().find_map(|invocation| {
            compiled
                .registry()
                .get(&invocation.name)
                .filter(|entry| entry.handler.subscription_source().is_some())
                .map(|entry| (invocation, Arc::clone(entry)))
        }) else {
            return Ok(None);
        };

        let ctx = options.context.resolve().await?;
        ctx.bind_variables(Arc::new(root.variables.clone()));
        let info = ResolverInfo::new(root.name.as_str(), type_name)
            .with_return_type(descriptor.ty.clone())
            .with_schema(Arc::clone(schema));
        let args = merge_arguments(&entry, invocation, &Value::Null, &root.args, &ctx, &info)
            .map_err(|e| SubscriptionError::Setup(e.to_string()))?;
        debug!(field = %root.name, directive = %invocation.name, "root field events come from a directive");

        Ok(Some(SourceLink { entry, args, ctx }))
    }

    /// Validates and scores the operation and returns its root field.
    fn root_field(
        &self,
        document: &ExecutableDocument,
        options: &SubscribeOptions,
    ) -> Result<RootField, SubscriptionError> {
        let invalid = |message: String| {
            SubscriptionError::Validation(vec![
                GraphQLError::new(message).with_code(ErrorCode::ValidationError)
            ])
        };

        let operation = select_operation(document, options.operation_name.as_deref())
            .map_err(|e| invalid(e.to_string()))?;
        if operation.kind() != OperationKind::Subscription {
            return Err(invalid(format!(
                "Expected a subscription operation, found a {}.",
                operation.kind()
            )));
        }

        let schema = self.executor.compiled().schema();
        let errors: Vec<GraphQLError> = validate(schema, document, &operation)
            .into_iter()
            .chain(subscription_single_root(&operation))
            .map(GraphQLError::from)
            .collect();
        if !errors.is_empty() {
            return Err(SubscriptionError::Validation(errors));
        }

        let Some(field) = operation
            .definition
            .node
            .selection_set
            .node
            .items
            .iter()
            .find_map(|selection| match &selection.node {
                Selection::Field(field) => Some(field),
                _ => None,
            })
        else {
            return Err(invalid("Subscription has no root field.".to_string()));
        };
        let field_name = field.node.name.node.to_string();

        let variables = effective_variables(&operation.definition.node, options.variables.clone())
            .map_err(SubscriptionError::Validation)?;
        QueryComplexity::analyze(self.executor.compiled(), document, &operation, &variables)
            .check(self.ceiling)
            .map_err(|e| {
                debug!(score = e.score, ceiling = e.ceiling, "subscription rejected by admission control");
                SubscriptionError::Admission(e)
            })?;
        let definitions = schema
            .root_type(OperationKind::Subscription)
            .and_then(|root| schema.field(root, &field_name))
            .map(|definition| definition.arguments.clone())
            .unwrap_or_default();
        let args = coerce_arguments(
            schema,
            &definitions,
            field
                .node
                .arguments
                .iter()
                .map(|(name, value)| (name.node.as_str(), &value.node)),
            &variables,
        )
        .map_err(|e| {
            SubscriptionError::Validation(vec![GraphQLError::new(e.to_string())
                .with_location(field.pos)
                .with_code(ErrorCode::ValidationError)])
        })?;

        Ok(RootField {
            name: field_name,
            args: ResolverArgs::from(args),
            variables,
        })
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.len())
            .field("setup", &self.setup.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn event_handler(delivery: Arc<Delivery>, trigger: Trigger) -> EventHandler {
    let trigger = Arc::new(trigger);
    Arc::new(move |payload: Value| -> BoxFuture<'static, ()> {
        let delivery = Arc::clone(&delivery);
        let trigger = Arc::clone(&trigger);
        Box::pin(async move { delivery.deliver(payload, &trigger).await })
    })
}
