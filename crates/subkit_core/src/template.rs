//! Sandboxed `${root.path}` template expansion.
//!
//! Expressions are plain paths over a fixed set of roots. Nothing is
//! evaluated: `${args.user.ids[0]}` walks the `args` value and renders what it
//! finds. Missing values render as the empty string, strings render as-is and
//! every other value renders as compact JSON.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

use crate::error::TemplateError;

/// The values a template may read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRoot {
    Parent,
    Args,
    Context,
    User,
    Variables,
    Data,
    /// Keys of a batched load.
    Ids,
}

impl TemplateRoot {
    pub const ALL: [TemplateRoot; 7] = [
        TemplateRoot::Parent,
        TemplateRoot::Args,
        TemplateRoot::Context,
        TemplateRoot::User,
        TemplateRoot::Variables,
        TemplateRoot::Data,
        TemplateRoot::Ids,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateRoot::Parent => "parent",
            TemplateRoot::Args => "args",
            TemplateRoot::Context => "context",
            TemplateRoot::User => "user",
            TemplateRoot::Variables => "variables",
            TemplateRoot::Data => "data",
            TemplateRoot::Ids => "ids",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|root| root.as_str() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One step of a path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

/// Bindings for template expansion.
#[derive(Debug, Default, Clone)]
pub struct TemplateScope<'a> {
    roots: [Option<&'a JsonValue>; 7],
    deferred: [bool; 7],
}

impl<'a> TemplateScope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a root.
    pub fn with(mut self, root: TemplateRoot, value: &'a JsonValue) -> Self {
        self.roots[root.index()] = Some(value);
        self
    }

    /// Leaves placeholders reading `root` untouched, for a later expansion
    /// once the root is known.
    pub fn defer(mut self, root: TemplateRoot) -> Self {
        self.deferred[root.index()] = true;
        self
    }

    fn is_deferred(&self, expression: &str) -> bool {
        let name = expression
            .trim()
            .split(|c: char| c == '.' || c == '[')
            .next()
            .unwrap_or_default();
        TemplateRoot::from_name(name).is_some_and(|root| self.deferred[root.index()])
    }

    /// Evaluates one expression such as `args.items[0].name`.
    pub fn lookup(&self, expression: &str) -> Result<Option<&'a JsonValue>, TemplateError> {
        let steps = parse_path(expression)?;
        let Some((PathStep::Key(root), rest)) = steps.split_first() else {
            return Err(TemplateError::InvalidExpression(expression.to_string()));
        };
        let root = TemplateRoot::from_name(root)
            .ok_or_else(|| TemplateError::UnknownVariable(root.clone()))?;

        Ok(self.roots[root.index()].and_then(|value| walk(value, rest)))
    }

    /// Replaces every `${...}` placeholder in `template`.
    pub fn expand(&self, template: &str) -> Result<String, TemplateError> {
        self.expand_with(template, |_, value| Ok(render(value)))
    }

    /// Replaces every `${...}` placeholder in `template` with the text
    /// `emit` produces for the looked-up value. `emit` also receives the
    /// output written so far.
    pub fn expand_with<F>(&self, template: &str, mut emit: F) -> Result<String, TemplateError>
    where
        F: FnMut(&str, Option<&'a JsonValue>) -> Result<String, TemplateError>,
    {
        let pattern = placeholder()?;
        if !pattern.is_match(template) {
            return Ok(template.to_string());
        }

        let mut output = String::with_capacity(template.len());
        let mut last = 0;
        for captures in pattern.captures_iter(template) {
            let (Some(whole), Some(expression)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            output.push_str(&template[last..whole.start()]);
            if self.is_deferred(expression.as_str()) {
                output.push_str(whole.as_str());
            } else {
                let text = emit(&output, self.lookup(expression.as_str())?)?;
                output.push_str(&text);
            }
            last = whole.end();
        }
        output.push_str(&template[last..]);
        Ok(output)
    }
}

/// Selects a value by a path such as `items[0].name`.
pub fn select<'v>(value: &'v JsonValue, path: &str) -> Result<Option<&'v JsonValue>, TemplateError> {
    let steps = parse_path(path)?;
    Ok(walk(value, &steps))
}

/// Renders a looked-up value for interpolation.
pub fn render(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn walk<'v>(value: &'v JsonValue, steps: &[PathStep]) -> Option<&'v JsonValue> {
    steps.iter().try_fold(value, |current, step| match (current, step) {
        (JsonValue::Object(map), PathStep::Key(key)) => map.get(key),
        (JsonValue::Object(map), PathStep::Index(i)) => map.get(&i.to_string()),
        (JsonValue::Array(items), PathStep::Index(i)) => items.get(*i),
        (JsonValue::Array(items), PathStep::Key(key)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    })
}

fn placeholder() -> Result<&'static Regex, TemplateError> {
    static PLACEHOLDER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([^}]*)\}"))
        .as_ref()
        .map_err(|e| TemplateError::InvalidExpression(e.to_string()))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-')
}

/// Parses `a.b[0]["c d"]` into steps.
pub fn parse_path(expression: &str) -> Result<Vec<PathStep>, TemplateError> {
    let invalid = || TemplateError::InvalidExpression(expression.to_string());
    let source = expression.trim();
    let mut chars = source.char_indices().peekable();
    let mut steps = Vec::new();
    let mut expect_key = true;

    while let Some(&(start, c)) = chars.peek() {
        match c {
            '.' if !expect_key && !steps.is_empty() => {
                chars.next();
                expect_key = true;
            }
            '[' if !steps.is_empty() => {
                chars.next();
                let Some(&(open, first)) = chars.peek() else {
                    return Err(invalid());
                };
                if first == '"' || first == '\'' {
                    chars.next();
                    let close = source[open + 1..].find(first).ok_or_else(invalid)? + open + 1;
                    steps.push(PathStep::Key(source[open + 1..close].to_string()));
                    while chars.peek().is_some_and(|&(i, _)| i <= close) {
                        chars.next();
                    }
                } else {
                    let end = source[open..].find(']').ok_or_else(invalid)? + open;
                    let index = source[open..end].trim().parse().map_err(|_| invalid())?;
                    steps.push(PathStep::Index(index));
                    while chars.peek().is_some_and(|&(i, _)| i < end) {
                        chars.next();
                    }
                }
                if chars.next().map(|(_, c)| c) != Some(']') {
                    return Err(invalid());
                }
                expect_key = false;
            }
            c if expect_key && is_key_char(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_key_char(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                steps.push(PathStep::Key(source[start..end].to_string()));
                expect_key = false;
            }
            _ => return Err(invalid()),
        }
    }

    if steps.is_empty() || expect_key {
        return Err(invalid());
    }
    Ok(steps)
}
