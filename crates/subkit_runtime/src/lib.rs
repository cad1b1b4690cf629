//! Runtime for SubKit.
//!
//! This crate turns a schema and a directive registry into an executable
//! service:
//! - `schema`: compiled fields with their directive chains
//! - `directives`: directive handlers, the registry and the chain resolver
//! - `extensions`: request lifecycle hooks, cache hints and tracing
//! - `complexity`: admission control
//! - `executor`: operation execution
//! - `subscription`: subscriptions over a publish/subscribe bus
//! - `service`: the per-request pipeline
//! - `dataloader`: request-scoped batching

pub mod complexity;
pub mod config;
pub mod context;
pub mod dataloader;
pub mod directives;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod pubsub;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod subscription;
pub mod validation;

pub use complexity::{ComplexityReport, QueryComplexity};
pub use config::{RuntimeConfig, UnknownDirectivePolicy};
pub use context::{Context, ContextBuilder};
pub use dataloader::{DataLoader, LoadError};
pub use directives::{DirectiveChain, DirectiveEntry, DirectiveHandler, DirectiveRegistry, Next};
pub use error::{
    AdmissionError, ErrorCode, GraphQLError, Location, SubscriptionError, ValidationError,
};
pub use executor::{ExecutionRequest, Executor, Response};
pub use extensions::{
    CacheControlExtension, CacheHint, CachePolicy, CacheScope, Extension, ExtensionStack,
    FieldCallback, FieldCompletion, Instrumented, TracingExtension,
};
pub use pubsub::{ChannelOptions, EventHandler, PubSub, PubSubEngine, PubSubError, SubscriptionId};
pub use resolver::{
    DefaultResolver, Resolver, ResolverArgs, ResolverError, ResolverFuture, ResolverInfo,
    ResolverMap, ResolverResult, SharedResolver,
};
pub use schema::{CompiledSchema, CompiledSchemaBuilder, CostFn, FieldCost, FieldDescriptor};
pub use service::{Request, Service};
pub use subscription::{
    ContextSource, FilterFn, SetupFn, SubscribeOptions, SubscriptionCallback, SubscriptionHandle,
    SubscriptionManager, SubscriptionSource, Trigger, TriggerMap,
};
