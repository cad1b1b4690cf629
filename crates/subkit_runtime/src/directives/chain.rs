use super::{DirectiveEntry, DirectiveRegistry, Next};
use crate::context::Context;
use crate::resolver::{
    Resolver, ResolverArgs, ResolverError, ResolverFuture, ResolverInfo, SharedResolver,
};
use async_graphql_value::Value as Literal;
use serde_json::Value;
use std::sync::Arc;
use subkit_core::{coerce_arguments, DirectiveInvocation, TemplateRoot, TemplateScope};

/// A field resolver composed from its base resolver and its directives.
///
/// Links run in declaration order: the first link's [`Next`] runs the base
/// resolver and every later link's [`Next`] yields the previous link's value.
/// Directives written on the field in the operation document follow the
/// schema's. A failing link ends the chain.
pub struct DirectiveChain {
    base: SharedResolver,
    links: Vec<(DirectiveInvocation, Arc<DirectiveEntry>)>,
    registry: Arc<DirectiveRegistry>,
}

impl DirectiveChain {
    pub fn new(base: SharedResolver, registry: Arc<DirectiveRegistry>) -> Self {
        Self {
            base,
            links: Vec::new(),
            registry,
        }
    }

    /// Appends a link.
    pub fn with_link(mut self, invocation: DirectiveInvocation, entry: Arc<DirectiveEntry>) -> Self {
        self.links.push((invocation, entry));
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Names of the compiled links, in order.
    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.links.iter().map(|(invocation, _)| invocation.name.as_str())
    }
}

impl Resolver for DirectiveChain {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let operation_links = info.operation_directives.iter().filter_map(|invocation| {
                self.registry
                    .get(&invocation.name)
                    .filter(|entry| !entry.definition.builtin)
                    .map(|entry| (invocation, entry))
            });
            let links: Vec<(&DirectiveInvocation, &Arc<DirectiveEntry>)> = self
                .links
                .iter()
                .map(|(invocation, entry)| (invocation, entry))
                .chain(operation_links)
                .collect();

            if links.is_empty() {
                return self.base.resolve(parent, args, ctx, info).await;
            }

            let mut value: Option<Value> = None;
            for (invocation, entry) in links {
                let merged = merge_arguments(entry, invocation, parent, args, ctx, info)?;
                let next = match value.take() {
                    Some(previous) => Next::ready(previous),
                    None => {
                        let base = &self.base;
                        Next::new(move || base.resolve(parent, args, ctx, info))
                    }
                };
                value = Some(entry.handler.resolve(next, parent, merged, ctx, info).await?);
            }
            Ok(value.unwrap_or(Value::Null))
        })
    }
}

/// The directive's literal arguments, with strings expanded and every value
/// coerced to its declared type, overridden by the field's runtime arguments.
///
/// Each handler expands its own string arguments. `${data...}` and `${ids}`
/// placeholders are kept for the handler to expand once those values are
/// known.
pub(crate) fn merge_arguments(
    entry: &DirectiveEntry,
    invocation: &DirectiveInvocation,
    parent: &Value,
    args: &ResolverArgs,
    ctx: &Context,
    info: &ResolverInfo,
) -> Result<ResolverArgs, ResolverError> {
    let variables = ctx.variables();
    let args_json = args.to_json();
    let context_json = ctx.to_json();
    let user = ctx.user().cloned().unwrap_or(Value::Null);
    let variables_json = Value::Object((*variables).clone());
    let scope = TemplateScope::new()
        .with(TemplateRoot::Parent, parent)
        .with(TemplateRoot::Args, &args_json)
        .with(TemplateRoot::Context, &context_json)
        .with(TemplateRoot::User, &user)
        .with(TemplateRoot::Variables, &variables_json)
        .defer(TemplateRoot::Data)
        .defer(TemplateRoot::Ids);

    let literals = invocation
        .arguments
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Literal::String(template) => {
                    Literal::String(entry.handler.expand_argument(name, template, &scope)?)
                }
                other => other.clone(),
            };
            Ok((name.as_str(), value))
        })
        .collect::<Result<Vec<_>, ResolverError>>()?;

    let coerced = coerce_arguments(
        &info.schema,
        &entry.definition.arguments,
        literals.iter().map(|(name, value)| (*name, value)),
        &variables,
    )?;

    let mut merged = ResolverArgs::from(coerced);
    merged.merge(args);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::DirectiveHandler;
    use crate::resolver::FnResolver;
    use serde_json::json;
    use std::sync::Mutex;
    use subkit_core::{DirectiveDefinition, InvocationLocation, TypeRef};

    /// Records when it is entered and appends its name to the value.
    struct Tag {
        name: &'static str,
        entered: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DirectiveHandler for Tag {
        fn resolve<'a>(
            &'a self,
            next: Next<'a>,
            _parent: &'a Value,
            _args: ResolverArgs,
            _ctx: &'a Context,
            _info: &'a ResolverInfo,
        ) -> ResolverFuture<'a> {
            Box::pin(async move {
                self.entered.lock().unwrap().push(self.name);
                let value = next.run().await?;
                Ok(json!(format!("{}{}", value.as_str().unwrap_or_default(), self.name)))
            })
        }
    }

    /// Returns its merged arguments.
    struct Echo;

    impl DirectiveHandler for Echo {
        fn resolve<'a>(
            &'a self,
            _next: Next<'a>,
            _parent: &'a Value,
            args: ResolverArgs,
            _ctx: &'a Context,
            _info: &'a ResolverInfo,
        ) -> ResolverFuture<'a> {
            Box::pin(async move { Ok(args.to_json()) })
        }
    }

    /// Echoes its arguments, rendering template values inside angle brackets.
    struct Bracketed;

    impl DirectiveHandler for Bracketed {
        fn resolve<'a>(
            &'a self,
            _next: Next<'a>,
            _parent: &'a Value,
            args: ResolverArgs,
            _ctx: &'a Context,
            _info: &'a ResolverInfo,
        ) -> ResolverFuture<'a> {
            Box::pin(async move { Ok(args.to_json()) })
        }

        fn expand_argument(
            &self,
            _name: &str,
            template: &str,
            scope: &TemplateScope<'_>,
        ) -> Result<String, subkit_core::TemplateError> {
            scope.expand_with(template, |_, value| {
                Ok(format!("<{}>", subkit_core::template::render(value)))
            })
        }
    }

    struct Fail;

    impl DirectiveHandler for Fail {
        fn resolve<'a>(
            &'a self,
            _next: Next<'a>,
            _parent: &'a Value,
            _args: ResolverArgs,
            _ctx: &'a Context,
            _info: &'a ResolverInfo,
        ) -> ResolverFuture<'a> {
            Box::pin(async { Err(ResolverError::custom("failed")) })
        }
    }

    fn base() -> SharedResolver {
        Arc::new(FnResolver::new(|_, _, _, _| Ok(json!("base:"))))
    }

    fn field_link(registry: &DirectiveRegistry, name: &str) -> (DirectiveInvocation, Arc<DirectiveEntry>) {
        (
            DirectiveInvocation::new(name, InvocationLocation::FieldDefinition),
            Arc::clone(registry.get(name).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_links_are_entered_in_declaration_order() {
        let entered = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            DirectiveRegistry::new()
                .with(
                    DirectiveDefinition::new("a"),
                    Tag { name: "a", entered: Arc::clone(&entered) },
                )
                .with(
                    DirectiveDefinition::new("b"),
                    Tag { name: "b", entered: Arc::clone(&entered) },
                ),
        );
        let (a, a_entry) = field_link(&registry, "a");
        let (b, b_entry) = field_link(&registry, "b");
        let chain = DirectiveChain::new(base(), Arc::clone(&registry))
            .with_link(a, a_entry)
            .with_link(b, b_entry);

        let ctx = Context::new();
        let info = ResolverInfo::new("field", "Query");
        let value = chain
            .resolve(&Value::Null, &ResolverArgs::new(), &ctx, &info)
            .await
            .unwrap();

        assert_eq!(value, json!("base:ab"));
        assert_eq!(*entered.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_arguments_are_expanded_coerced_and_overridden() {
        let registry = Arc::new(DirectiveRegistry::new().with(
            DirectiveDefinition::new("echo")
                .with_argument("url", TypeRef::named("String"))
                .with_argument("body", TypeRef::named("String"))
                .with_argument("limit", TypeRef::named("Int"))
                .with_argument("id", TypeRef::named("ID")),
            Echo,
        ));
        let invocation = DirectiveInvocation::new("echo", InvocationLocation::FieldDefinition)
            .with_argument("url", Literal::String("/users/${parent.id}/${user.name}".to_string()))
            .with_argument("body", Literal::String("${data.name}".to_string()))
            .with_argument("limit", Literal::Number(3.into()))
            .with_argument("id", Literal::String("literal".to_string()));
        let entry = Arc::clone(registry.get("echo").unwrap());
        let chain = DirectiveChain::new(base(), Arc::clone(&registry)).with_link(invocation, entry);

        let ctx = Context::builder().user(json!({"name": "ada"})).build();
        let mut args = ResolverArgs::new();
        args.set("id", json!("from-field"));
        let info = ResolverInfo::new("field", "Query");
        let value = chain
            .resolve(&json!({"id": 7}), &args, &ctx, &info)
            .await
            .unwrap();

        assert_eq!(
            value,
            json!({
                "url": "/users/7/ada",
                "body": "${data.name}",
                "limit": 3,
                "id": "from-field"
            })
        );
    }

    #[tokio::test]
    async fn test_handler_expands_its_own_arguments() {
        let registry = Arc::new(DirectiveRegistry::new().with(
            DirectiveDefinition::new("bracketed").with_argument("cmd", TypeRef::named("String")),
            Bracketed,
        ));
        let invocation = DirectiveInvocation::new("bracketed", InvocationLocation::FieldDefinition)
            .with_argument("cmd", Literal::String("run ${parent.id} ${data.x}".to_string()));
        let entry = Arc::clone(registry.get("bracketed").unwrap());
        let chain = DirectiveChain::new(base(), Arc::clone(&registry)).with_link(invocation, entry);

        let ctx = Context::new();
        let info = ResolverInfo::new("field", "Query");
        let value = chain
            .resolve(&json!({"id": 7}), &ResolverArgs::new(), &ctx, &info)
            .await
            .unwrap();
        assert_eq!(value, json!({"cmd": "run <7> ${data.x}"}));
    }

    #[tokio::test]
    async fn test_failure_stops_the_chain() {
        let entered = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            DirectiveRegistry::new()
                .with(DirectiveDefinition::new("fail"), Fail)
                .with(
                    DirectiveDefinition::new("after"),
                    Tag { name: "after", entered: Arc::clone(&entered) },
                ),
        );
        let (fail, fail_entry) = field_link(&registry, "fail");
        let (after, after_entry) = field_link(&registry, "after");
        let chain = DirectiveChain::new(base(), Arc::clone(&registry))
            .with_link(fail, fail_entry)
            .with_link(after, after_entry);

        let ctx = Context::new();
        let info = ResolverInfo::new("field", "Query");
        let result = chain
            .resolve(&Value::Null, &ResolverArgs::new(), &ctx, &info)
            .await;

        assert_eq!(result.unwrap_err().to_string(), "failed");
        assert!(entered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operation_directives_follow_schema_links() {
        let entered = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(DirectiveRegistry::new().with(
            DirectiveDefinition::new("tag"),
            Tag { name: "tag", entered: Arc::clone(&entered) },
        ));
        let chain = DirectiveChain::new(base(), Arc::clone(&registry));

        let ctx = Context::new();
        let mut info = ResolverInfo::new("field", "Query");
        info.operation_directives = vec![
            DirectiveInvocation::new("unknown", InvocationLocation::Field),
            DirectiveInvocation::new("tag", InvocationLocation::Field),
        ];
        let value = chain
            .resolve(&Value::Null, &ResolverArgs::new(), &ctx, &info)
            .await
            .unwrap();

        assert_eq!(value, json!("base:tag"));
    }
}
