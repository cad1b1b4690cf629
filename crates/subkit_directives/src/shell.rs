//! Template expansion for shell command lines.
//!
//! Every substituted value reaches the shell as one literal word, whatever
//! quoting surrounds its placeholder. The value is quoted with `shlex`, and
//! when the placeholder sits inside a single- or double-quoted string that
//! string is closed before the word and reopened after it.

use serde_json::Value;
use subkit_core::template::render;
use subkit_core::{TemplateError, TemplateRoot, TemplateScope};

/// The quoting in effect at the end of a partial command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

fn quote_state(text: &str) -> Quote {
    let mut state = Quote::None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (state, c) {
            (Quote::Single, '\'') => state = Quote::None,
            (Quote::Single, _) => {}
            (_, '\\') => {
                chars.next();
            }
            // a placeholder left for a later pass
            (_, '$') if chars.peek() == Some(&'{') => {
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                }
            }
            (Quote::None, '\'') => state = Quote::Single,
            (Quote::None, '"') | (Quote::Double, '"') => {
                state = if state == Quote::None {
                    Quote::Double
                } else {
                    Quote::None
                };
            }
            _ => {}
        }
    }
    state
}

fn word(written: &str, value: Option<&Value>) -> Result<String, TemplateError> {
    let text = render(value);
    let quoted = shlex::try_quote(&text)
        .map_err(|_| TemplateError::Unrenderable("value contains a NUL byte".to_string()))?;
    Ok(match quote_state(written) {
        Quote::None => quoted.into_owned(),
        Quote::Single => format!("'{quoted}'"),
        Quote::Double => format!("\"{quoted}\""),
    })
}

/// Expands `template` as a command line.
pub fn expand(template: &str, scope: &TemplateScope<'_>) -> Result<String, TemplateError> {
    scope.expand_with(template, word)
}

/// Expands the `${data...}` placeholders left in a command.
pub(crate) fn expand_data(template: &str, data: &Value) -> Result<String, TemplateError> {
    expand(template, &TemplateScope::new().with(TemplateRoot::Data, data))
}

/// Expands `${ids}` in a batched command with the comma-separated keys.
pub(crate) fn expand_ids(template: &str, keys: &[String]) -> Result<String, TemplateError> {
    let ids = Value::String(keys.join(","));
    expand(template, &TemplateScope::new().with(TemplateRoot::Ids, &ids))
}
