//! Compiled schema: every field's resolver composed once.

use crate::config::UnknownDirectivePolicy;
use crate::directives::{DirectiveChain, DirectiveRegistry};
use crate::extensions::Instrumented;
use crate::resolver::{ResolverArgs, ResolverMap, SharedResolver};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use subkit_core::directive::{int_argument, name_argument};
use subkit_core::{
    DirectiveInvocation, FieldDef, InputFieldDef, Schema, SchemaError, TypeDef, TypeRef,
};
use tracing::{debug, warn};

/// A custom cost function: `(arguments, child complexity) -> cost`.
pub type CostFn = Arc<dyn Fn(&ResolverArgs, i64) -> i64 + Send + Sync>;

/// How a field's complexity is computed.
#[derive(Clone)]
pub enum FieldCost {
    /// A registered cost function.
    Custom(CostFn),
    /// Values read from `@complexity`.
    Declared {
        cost: Option<i64>,
        multiplier: Option<String>,
    },
}

impl fmt::Debug for FieldCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldCost::Custom(_) => f.write_str("Custom"),
            FieldCost::Declared { cost, multiplier } => f
                .debug_struct("Declared")
                .field("cost", cost)
                .field("multiplier", multiplier)
                .finish(),
        }
    }
}

/// A field with its compiled resolver.
pub struct FieldDescriptor {
    pub name: String,
    pub parent_type: String,
    pub ty: TypeRef,
    pub arguments: IndexMap<String, InputFieldDef>,
    /// Declared directives in source order.
    pub directives: Vec<DirectiveInvocation>,
    pub cost: Option<FieldCost>,
    /// Names of the directive links compiled into the resolver.
    pub links: Vec<String>,
    /// The instrumented directive chain.
    pub resolver: SharedResolver,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("parent_type", &self.parent_type)
            .field("ty", &self.ty)
            .field("links", &self.links)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

/// An immutable schema whose field resolvers are compiled.
pub struct CompiledSchema {
    schema: Arc<Schema>,
    registry: Arc<DirectiveRegistry>,
    fields: FxHashMap<String, FxHashMap<String, Arc<FieldDescriptor>>>,
}

impl CompiledSchema {
    pub fn builder(schema: Schema) -> CompiledSchemaBuilder {
        CompiledSchemaBuilder::new(schema)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<DirectiveRegistry> {
        &self.registry
    }

    /// Looks up a compiled field on an object or interface type.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&Arc<FieldDescriptor>> {
        self.fields.get(type_name)?.get(field_name)
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("types", &self.fields.len())
            .field("directives", &self.registry.len())
            .finish()
    }
}

/// Builder for [`CompiledSchema`].
pub struct CompiledSchemaBuilder {
    schema: Schema,
    resolvers: ResolverMap,
    registry: DirectiveRegistry,
    costs: FxHashMap<(String, String), CostFn>,
    unknown_directives: UnknownDirectivePolicy,
}

impl CompiledSchemaBuilder {
    fn new(schema: Schema) -> Self {
        Self {
            schema,
            resolvers: ResolverMap::new(),
            registry: DirectiveRegistry::new(),
            costs: FxHashMap::default(),
            unknown_directives: UnknownDirectivePolicy::default(),
        }
    }

    /// Sets the base resolvers.
    pub fn resolvers(mut self, resolvers: ResolverMap) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Sets the directive registry.
    pub fn directives(mut self, registry: DirectiveRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers a custom cost function for `type_name.field_name`.
    pub fn complexity<F>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        cost: F,
    ) -> Self
    where
        F: Fn(&ResolverArgs, i64) -> i64 + Send + Sync + 'static,
    {
        self.costs
            .insert((type_name.into(), field_name.into()), Arc::new(cost));
        self
    }

    pub fn unknown_directives(mut self, policy: UnknownDirectivePolicy) -> Self {
        self.unknown_directives = policy;
        self
    }

    /// Compiles every field of every object and interface type.
    pub fn build(self) -> Result<CompiledSchema, SchemaError> {
        let Self {
            mut schema,
            resolvers,
            registry,
            mut costs,
            unknown_directives,
        } = self;

        for definition in registry.definitions() {
            schema
                .directives
                .entry(definition.name.clone())
                .or_insert_with(|| definition.clone());
        }

        let schema = Arc::new(schema);
        let registry = Arc::new(registry);
        let mut fields: FxHashMap<String, FxHashMap<String, Arc<FieldDescriptor>>> =
            FxHashMap::default();

        for (type_name, type_def) in schema.types() {
            let defs = match type_def {
                TypeDef::Object(o) => &o.fields,
                TypeDef::Interface(i) => &i.fields,
                _ => continue,
            };

            let mut compiled = FxHashMap::default();
            for field in defs.values() {
                let cost = costs.remove(&(type_name.clone(), field.name.clone()));
                let descriptor = compile_field(
                    &schema,
                    &registry,
                    &resolvers,
                    type_name,
                    field,
                    cost,
                    unknown_directives,
                )?;
                compiled.insert(field.name.clone(), Arc::new(descriptor));
            }
            fields.insert(type_name.clone(), compiled);
        }

        for (type_name, field_name) in costs.keys() {
            warn!(
                type_name = %type_name,
                field_name = %field_name,
                "cost function registered for an unknown field"
            );
        }

        Ok(CompiledSchema {
            schema,
            registry,
            fields,
        })
    }
}

fn compile_field(
    schema: &Arc<Schema>,
    registry: &Arc<DirectiveRegistry>,
    resolvers: &ResolverMap,
    type_name: &str,
    field: &FieldDef,
    custom_cost: Option<CostFn>,
    policy: UnknownDirectivePolicy,
) -> Result<FieldDescriptor, SchemaError> {
    let mut chain = DirectiveChain::new(
        resolvers.get_or_default(type_name, &field.name),
        Arc::clone(registry),
    );

    for invocation in &field.directives {
        if let Some(entry) = registry.get(&invocation.name) {
            if !entry.definition.builtin {
                chain = chain.with_link(invocation.clone(), Arc::clone(entry));
            }
            continue;
        }
        if schema
            .directive(&invocation.name)
            .is_some_and(|definition| definition.builtin)
        {
            continue;
        }
        match policy {
            UnknownDirectivePolicy::Skip => warn!(
                directive = %invocation.name,
                type_name,
                field_name = %field.name,
                "no handler registered for directive, treating it as a passthrough"
            ),
            UnknownDirectivePolicy::Reject => {
                return Err(SchemaError::UnknownDirective {
                    directive: invocation.name.clone(),
                    type_name: type_name.to_string(),
                    field_name: field.name.clone(),
                })
            }
        }
    }

    let cost = custom_cost.map(FieldCost::Custom).or_else(|| {
        field.directive("complexity").map(|complexity| FieldCost::Declared {
            cost: int_argument(complexity, "cost"),
            multiplier: name_argument(complexity, "multiplier").map(str::to_string),
        })
    });

    let links: Vec<String> = chain.link_names().map(str::to_string).collect();
    if !links.is_empty() {
        debug!(type_name, field_name = %field.name, ?links, "compiled directive chain");
    }

    Ok(FieldDescriptor {
        name: field.name.clone(),
        parent_type: type_name.to_string(),
        ty: field.ty.clone(),
        arguments: field.arguments.clone(),
        directives: field.directives.clone(),
        cost,
        links,
        resolver: Arc::new(Instrumented::new(Arc::new(chain))),
    })
}
