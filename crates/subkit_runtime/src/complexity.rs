//! Static query complexity for admission control.
//!
//! The walker visits the selected operation once, bottom-up. A field's own
//! contribution is, in priority order: a registered cost function, `child *
//! args[multiplier]` from `@complexity(multiplier:)`, `cost + child` from
//! `@complexity(cost:)`, or `1 + child`. Fragments add their inner complexity
//! at no extra cost. Every contribution is clamped to zero before it is
//! summed.

use crate::error::AdmissionError;
use crate::resolver::ResolverArgs;
use crate::schema::{CompiledSchema, FieldCost};
use async_graphql_parser::types::{ExecutableDocument, Selection, SelectionSet};
use async_graphql_parser::Pos;
use rustc_hash::FxHashMap;
use subkit_core::{coerce_arguments, PathSegment, ResponsePath, SelectedOperation, Variables};
use tracing::debug;

/// A field node reached through a chain of response keys. The same node
/// inside a fragment spread under different parents gets one key per parent.
type FieldKey = (Vec<String>, usize, usize);

/// The outcome of a complexity walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplexityReport {
    /// Total score of the operation.
    pub score: u64,
    field_scores: FxHashMap<FieldKey, u64>,
}

impl ComplexityReport {
    /// The score of the field node at `pos` resolved at `path`. List indices
    /// on the path are ignored.
    pub fn field_score(&self, path: &ResponsePath, pos: Pos) -> Option<u64> {
        let keys = path
            .segments()
            .iter()
            .filter_map(|segment| match segment {
                PathSegment::Field(key) => Some(key.clone()),
                PathSegment::Index(_) => None,
            })
            .collect();
        self.field_scores.get(&(keys, pos.line, pos.column)).copied()
    }

    /// Rejects the report when `ceiling` is enabled and exceeded.
    pub fn check(&self, ceiling: Option<u64>) -> Result<(), AdmissionError> {
        match ceiling.filter(|c| *c > 0) {
            Some(ceiling) if self.score > ceiling => Err(AdmissionError {
                ceiling,
                score: self.score,
            }),
            _ => Ok(()),
        }
    }
}

/// Complexity walker over one document.
pub struct QueryComplexity<'a> {
    compiled: &'a CompiledSchema,
    document: &'a ExecutableDocument,
    variables: &'a Variables,
    field_scores: FxHashMap<FieldKey, u64>,
    active_fragments: Vec<&'a str>,
    response_keys: Vec<String>,
}

impl<'a> QueryComplexity<'a> {
    /// Scores `operation`.
    pub fn analyze(
        compiled: &'a CompiledSchema,
        document: &'a ExecutableDocument,
        operation: &SelectedOperation<'a>,
        variables: &'a Variables,
    ) -> ComplexityReport {
        let mut walker = Self {
            compiled,
            document,
            variables,
            field_scores: FxHashMap::default(),
            active_fragments: Vec::new(),
            response_keys: Vec::new(),
        };

        let score = compiled
            .schema()
            .root_type(operation.kind())
            .map_or(0, |root| {
                walker.selection_set(&operation.definition.node.selection_set.node, root)
            });
        let score = u64::try_from(score).unwrap_or(0);
        debug!(score, operation = ?operation.name, "computed query complexity");

        ComplexityReport {
            score,
            field_scores: walker.field_scores,
        }
    }

    fn selection_set(&mut self, set: &'a SelectionSet, type_name: &str) -> i64 {
        set.items.iter().fold(0_i64, |total, selection| {
            let contribution = match &selection.node {
                Selection::Field(field) => {
                    self.response_keys
                        .push(field.node.response_key().node.to_string());
                    let score = self.field(field, type_name).max(0);
                    self.field_scores.insert(
                        (self.response_keys.clone(), field.pos.line, field.pos.column),
                        u64::try_from(score).unwrap_or(0),
                    );
                    self.response_keys.pop();
                    score
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    match self.document.fragments.get(name) {
                        Some(fragment) if !self.active_fragments.contains(&name) => {
                            self.active_fragments.push(name);
                            let score = self.selection_set(
                                &fragment.node.selection_set.node,
                                fragment.node.type_condition.node.on.node.as_str(),
                            );
                            self.active_fragments.pop();
                            score
                        }
                        _ => 0,
                    }
                }
                Selection::InlineFragment(inline) => {
                    let narrowed = inline
                        .node
                        .type_condition
                        .as_ref()
                        .map_or(type_name, |condition| condition.node.on.node.as_str());
                    self.selection_set(&inline.node.selection_set.node, narrowed)
                }
            };
            total.saturating_add(contribution.max(0))
        })
    }

    fn field(
        &mut self,
        field: &'a async_graphql_parser::Positioned<async_graphql_parser::types::Field>,
        type_name: &str,
    ) -> i64 {
        let Some(descriptor) = self.compiled.field(type_name, field.node.name.node.as_str()) else {
            return 0;
        };

        let target = descriptor.ty.named_type();
        let child = if self.compiled.schema().is_composite(target) {
            self.selection_set(&field.node.selection_set.node, target)
        } else {
            0
        };

        let args = || {
            coerce_arguments(
                self.compiled.schema(),
                &descriptor.arguments,
                field
                    .node
                    .arguments
                    .iter()
                    .map(|(name, value)| (name.node.as_str(), &value.node)),
                self.variables,
            )
            .map(ResolverArgs::from)
            .unwrap_or_default()
        };

        match &descriptor.cost {
            Some(FieldCost::Custom(cost)) => cost(&args(), child),
            Some(FieldCost::Declared { cost, multiplier }) => {
                let factor = multiplier
                    .as_deref()
                    .and_then(|name| args().get(name).and_then(numeric));
                match (factor, cost) {
                    (Some(factor), _) => child.saturating_mul(factor),
                    (None, Some(cost)) => cost.saturating_add(child),
                    (None, None) => child.saturating_add(1),
                }
            }
            None => child.saturating_add(1),
        }
    }
}

fn numeric(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_graphql_parser::parse_query;
    use subkit_core::{select_operation, Schema};

    const SDL: &str = r#"
        type Query {
            hello: String
            user(id: ID): User
            users(first: Int = 10): [User] @complexity(multiplier: "first")
            expensive: String @complexity(cost: 50)
            search(term: String): [SearchResult]
            custom(n: Int): User
            negative: User
        }

        type User {
            id: ID
            name: String
            friends: [User] @complexity(cost: 2)
        }

        type Post {
            title: String
        }

        union SearchResult = User | Post
    "#;

    fn compiled() -> CompiledSchema {
        CompiledSchema::builder(Schema::parse(SDL).unwrap())
            .complexity("Query", "custom", |args, child| {
                args.get_as::<i64>("n").unwrap_or(0) * 10 + child
            })
            .complexity("Query", "negative", |_, _| -100)
            .build()
            .unwrap()
    }

    fn score(query: &str) -> u64 {
        score_with(query, &Variables::new())
    }

    fn score_with(query: &str, variables: &Variables) -> u64 {
        let compiled = compiled();
        let document = parse_query(query).unwrap();
        let operation = select_operation(&document, None).unwrap();
        QueryComplexity::analyze(&compiled, &document, &operation, variables).score
    }

    #[test]
    fn test_single_field_scores_one() {
        assert_eq!(score("{ hello }"), 1);
    }

    #[test]
    fn test_nested_default_costs() {
        // user: 1 + (id 1 + name 1)
        assert_eq!(score("{ user(id: 1) { id name } }"), 3);
        // friends: 2 + (id 1)
        assert_eq!(score("{ user { friends { id } } }"), 4);
    }

    #[test]
    fn test_declared_costs() {
        assert_eq!(score("{ expensive }"), 50);
        // multiplier with the default argument: 10 * (1 + 1)
        assert_eq!(score("{ users { id name } }"), 20);
        assert_eq!(score("{ users(first: 3) { id } }"), 3);

        let mut variables = Variables::new();
        variables.insert("n".to_string(), serde_json::json!(5));
        assert_eq!(
            score_with("query($n: Int) { users(first: $n) { id } }", &variables),
            5
        );
    }

    #[test]
    fn test_custom_cost_and_clamping() {
        assert_eq!(score("{ custom(n: 2) { id } }"), 21);
        assert_eq!(score("{ negative { id } hello }"), 1);
    }

    #[test]
    fn test_fragments_add_no_cost() {
        assert_eq!(
            score("{ user { ...F } } fragment F on User { id name }"),
            3
        );
        assert_eq!(score("{ search(term: \"x\") { ... on User { id } ... on Post { title } } }"), 3);
        // __typename and unknown fields contribute nothing
        assert_eq!(score("{ __typename hello }"), 1);
    }

    #[test]
    fn test_field_scores_by_position() {
        let compiled = compiled();
        let document = parse_query("{ user { id } }").unwrap();
        let operation = select_operation(&document, None).unwrap();
        let report = QueryComplexity::analyze(&compiled, &document, &operation, &Variables::new());

        let user = ResponsePath::root().child("user");
        assert_eq!(report.score, 2);
        assert_eq!(report.field_score(&user, Pos { line: 1, column: 3 }), Some(2));
        assert_eq!(
            report.field_score(&user.child("id"), Pos { line: 1, column: 10 }),
            Some(1)
        );
    }

    #[test]
    fn test_shared_fragment_scored_per_parent() {
        let compiled = compiled();
        let document = parse_query(
            "{ a: user { ...F } b: user { friends { ...F } } }\nfragment F on User { friends { id } }",
        )
        .unwrap();
        let operation = select_operation(&document, None).unwrap();
        let report = QueryComplexity::analyze(&compiled, &document, &operation, &Variables::new());

        // friends inside F sits at line 2, column 22
        let pos = Pos { line: 2, column: 22 };
        let under_a = ResponsePath::root().child("a").child("friends");
        let under_b = ResponsePath::root()
            .child("b")
            .child("friends")
            .child(0)
            .child("friends");
        assert_eq!(report.field_score(&under_a, pos), Some(3));
        assert_eq!(report.field_score(&under_b, pos), Some(3));
        let outer = ResponsePath::root().child("b").child("friends");
        assert_eq!(report.field_score(&outer, Pos { line: 1, column: 30 }), Some(5));
    }

    #[test]
    fn test_check() {
        let report = ComplexityReport {
            score: 12,
            field_scores: FxHashMap::default(),
        };
        assert!(report.check(None).is_ok());
        assert!(report.check(Some(0)).is_ok());
        assert!(report.check(Some(12)).is_ok());
        assert_eq!(
            report.check(Some(10)).unwrap_err(),
            AdmissionError {
                ceiling: 10,
                score: 12
            }
        );
    }
}
