//! Directives that shape a field's value in process.

use crate::common::{describe, expand_data, field_directive, named, project, required};
use crate::error::DirectiveError;
use serde_json::{json, Map, Value};
use subkit_core::template::select;
use subkit_core::DirectiveDefinition;
use subkit_runtime::{
    Context, DirectiveHandler, Next, ResolverArgs, ResolverFuture, ResolverInfo,
};
use tracing::{debug, info};

/// `@constant(value: JSON!)`: resolves to `value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Constant;

impl Constant {
    pub fn definition() -> DirectiveDefinition {
        field_directive("constant", "Return a constant value.")
            .with_argument("value", required("JSON"))
            .with_argument("demo", named("String"))
    }
}

impl DirectiveHandler for Constant {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            args.require::<Value>("value")
        })
    }
}

/// `@log`: logs the parent, the arguments and the value, then passes the
/// value on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Log;

impl Log {
    pub fn definition() -> DirectiveDefinition {
        field_directive("log", "Log the resolved value.")
    }
}

impl DirectiveHandler for Log {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        args: ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = next.run().await?;
            info!(
                path = %info.path,
                parent = %parent,
                args = %args.to_json(),
                data = %data,
                "field resolved"
            );
            Ok(data)
        })
    }
}

/// `@paged(skip: Int!, take: Int!, jsonQuery: String)`: slices a list, or
/// the values of an object.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paged;

impl Paged {
    pub fn definition() -> DirectiveDefinition {
        field_directive("paged", "Slice a list to a page of results.")
            .with_argument("skip", required("Int"))
            .with_argument("take", required("Int"))
            .with_argument("jsonQuery", named("String"))
    }
}

impl DirectiveHandler for Paged {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = project(next.run().await?, &args)?;
            let skip: usize = args.require("skip")?;
            let take: usize = args.require("take")?;

            let items: Vec<Value> = match data {
                Value::Null => return Ok(Value::Null),
                Value::Array(items) => items,
                Value::Object(map) => map.into_iter().map(|(_, value)| value).collect(),
                other => return Err(DirectiveError::NotACollection(describe(&other)).into()),
            };
            Ok(Value::Array(items.into_iter().skip(skip).take(take).collect()))
        })
    }
}

/// `@map(to, from, jsonQuery, format)`: projects the view
/// `{parent, args, context, data}`.
///
/// The first present argument wins: `from` reads a top-level key of the view,
/// `jsonQuery` selects a path in it, `format` is a string with `${data...}`
/// placeholders and `to` yields an empty object. With none of them the field
/// resolves to null.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapValue;

impl MapValue {
    pub fn definition() -> DirectiveDefinition {
        field_directive("map", "Map a field from its parent, arguments or value.")
            .with_argument("to", named("String"))
            .with_argument("from", named("String"))
            .with_argument("jsonQuery", named("String"))
            .with_argument("format", named("String"))
    }
}

impl DirectiveHandler for MapValue {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        args: ResolverArgs,
        ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = next.run().await?;
            let view = || {
                json!({
                    "parent": parent,
                    "args": args.to_json(),
                    "context": ctx.to_json(),
                    "data": &data,
                })
            };

            if let Some(from) = args.get_str("from") {
                return Ok(view().get(from).cloned().unwrap_or(Value::Null));
            }
            if let Some(query) = args.get_str("jsonQuery") {
                return Ok(select(&view(), query)?.cloned().unwrap_or(Value::Null));
            }
            if let Some(format) = args.get_str("format") {
                return Ok(Value::String(expand_data(format, &data)?));
            }
            if args.get_str("to").is_some() {
                return Ok(Value::Object(Map::new()));
            }
            Ok(Value::Null)
        })
    }
}

/// `@contextify`: stores the value in the context data bag under the field
/// name, for fields resolved later in the same request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Contextify;

impl Contextify {
    pub fn definition() -> DirectiveDefinition {
        field_directive(
            "contextify",
            "Store the field value in the context for later fields.",
        )
    }
}

impl DirectiveHandler for Contextify {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        _args: ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = next.run().await?;
            ctx.set(info.field_name.clone(), &data);
            Ok(data)
        })
    }
}

/// `@mapInput(to: String!, from: String!)`: resolves to the field's
/// arguments with `input[to]` set to `from`. A missing `input` starts empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapInput;

impl MapInput {
    pub fn definition() -> DirectiveDefinition {
        field_directive("mapInput", "Set a property of the input argument.")
            .with_argument("to", required("String"))
            .with_argument("from", required("String"))
    }
}

impl DirectiveHandler for MapInput {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            let to: String = args.require("to")?;
            let from: Value = args.require("from")?;

            let mut all = match args.to_json() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            let input = all.entry("input").or_insert(Value::Null);
            if input.is_null() {
                *input = Value::Object(Map::new());
            }
            match input {
                Value::Object(fields) => {
                    fields.insert(to, from);
                }
                other => return Err(DirectiveError::NotAnObject(describe(other)).into()),
            }
            Ok(Value::Object(all))
        })
    }
}

/// `@publish(topic: String!, payload: JSON)`: publishes `payload`, or the
/// value when no payload is given, and resolves to what was published.
#[derive(Debug, Clone, Copy, Default)]
pub struct Publish;

impl Publish {
    pub fn definition() -> DirectiveDefinition {
        field_directive("publish", "Publish an event on the context's bus.")
            .with_argument("topic", required("String"))
            .with_argument("payload", named("JSON"))
    }
}

impl DirectiveHandler for Publish {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        args: ResolverArgs,
        ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = next.run().await?;
            let topic: String = args.require("topic")?;
            let event = match args.get("payload") {
                Some(payload) if !payload.is_null() => payload.clone(),
                _ => data,
            };

            let bus = ctx.pubsub().ok_or(DirectiveError::NoBus)?;
            let handlers = bus
                .publish(&topic, event.clone())
                .await
                .map_err(DirectiveError::from)?;
            debug!(topic = %topic, handlers, "published event");
            Ok(event)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::{Arc, Mutex};
    use subkit_runtime::{PubSub, PubSubEngine};

    async fn run<H: DirectiveHandler>(
        handler: &H,
        value: Value,
        parent: &Value,
        args: ResolverArgs,
        ctx: &Context,
    ) -> Result<Value, String> {
        let info = ResolverInfo::new("items", "Query");
        handler
            .resolve(Next::ready(value), parent, args, ctx, &info)
            .await
            .map_err(|e| e.to_string())
    }

    fn args(value: Value) -> ResolverArgs {
        let Value::Object(map) = value else {
            panic!("arguments must be an object");
        };
        ResolverArgs::from_pairs(map.into_iter().collect())
    }

    #[tokio::test]
    async fn test_constant_replaces_value() {
        let ctx = Context::new();
        let value = run(
            &Constant,
            json!("ignored"),
            &Value::Null,
            args(json!({"value": {"a": 1}})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_paged_slices_lists_and_objects() {
        let ctx = Context::new();
        let page = run(
            &Paged,
            json!([1, 2, 3, 4, 5]),
            &Value::Null,
            args(json!({"skip": 1, "take": 2})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(page, json!([2, 3]));

        let page = run(
            &Paged,
            json!({"list": {"a": 1, "b": 2, "c": 3}}),
            &Value::Null,
            args(json!({"skip": 2, "take": 10, "jsonQuery": "list"})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(page, json!([3]));

        let error = run(&Paged, json!(4), &Value::Null, args(json!({"skip": 0, "take": 1})), &ctx)
            .await
            .unwrap_err();
        assert_eq!(error, "expected a list or an object, found a number");
    }

    #[tokio::test]
    async fn test_map_projections() {
        let ctx = Context::builder().data("tenant", json!("acme")).build();
        let parent = json!({"first": "Ada", "last": "Lovelace"});

        let value = run(&MapValue, json!(1), &parent, args(json!({"from": "parent"})), &ctx)
            .await
            .unwrap();
        assert_eq!(value, parent);

        let value = run(
            &MapValue,
            json!(1),
            &parent,
            args(json!({"jsonQuery": "context.tenant"})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(value, json!("acme"));

        let value = run(
            &MapValue,
            json!({"n": 2}),
            &parent,
            args(json!({"format": "count=${data.n}"})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(value, json!("count=2"));

        let value = run(&MapValue, json!(1), &parent, args(json!({"to": "x"})), &ctx)
            .await
            .unwrap();
        assert_eq!(value, json!({}));

        let value = run(&MapValue, json!(1), &parent, ResolverArgs::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_map_input_sets_input_property() {
        let ctx = Context::new();
        let value = run(
            &MapInput,
            Value::Null,
            &Value::Null,
            args(json!({"to": "role", "from": "admin", "input": {"name": "Ada"}})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(value["input"], json!({"name": "Ada", "role": "admin"}));

        let value = run(
            &MapInput,
            Value::Null,
            &Value::Null,
            args(json!({"to": "role", "from": "admin"})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(value["input"], json!({"role": "admin"}));

        let error = run(
            &MapInput,
            Value::Null,
            &Value::Null,
            args(json!({"to": "role", "from": "admin", "input": [1]})),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(error, "expected an object, found an array of 1 entries");
    }

    #[tokio::test]
    async fn test_contextify_stores_value() {
        let ctx = Context::new();
        run(&Contextify, json!([1]), &Value::Null, ResolverArgs::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(ctx.get_value("items"), Some(json!([1])));
    }

    #[tokio::test]
    async fn test_publish_uses_payload_or_value() {
        let bus = Arc::new(PubSub::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "news",
            Arc::new(move |event| -> BoxFuture<'static, ()> {
                sink.lock().unwrap().push(event);
                Box::pin(async {})
            }),
            &Map::new(),
        )
        .await
        .unwrap();
        let ctx = Context::builder().pubsub(bus).build();

        let value = run(&Publish, json!("v"), &Value::Null, args(json!({"topic": "news"})), &ctx)
            .await
            .unwrap();
        assert_eq!(value, json!("v"));
        run(
            &Publish,
            json!("v"),
            &Value::Null,
            args(json!({"topic": "news", "payload": {"p": 1}})),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("v"), json!({"p": 1})]);

        let error = run(
            &Publish,
            json!("v"),
            &Value::Null,
            args(json!({"topic": "news"})),
            &Context::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(error, "no publish/subscribe bus is available on the context");
    }
}
