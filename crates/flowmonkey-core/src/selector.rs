//! Input selectors
//!
//! A step derives its handler input from the execution context through a
//! selector. Six forms: single key, multi-key pick, dot path, template
//! interpolation, full context, static literal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ContextMap;
use crate::error::EngineError;

/// Policy for template expressions whose path does not resolve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePolicy {
    /// Unresolved expressions fail input resolution
    #[default]
    Fail,

    /// Unresolved expressions expand to the empty string
    Empty,
}

/// Selector deriving a step's input from the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSelector {
    /// A single context key
    Key {
        key: String,

        /// Whether a missing key fails the step (default true)
        #[serde(default = "default_required")]
        required: bool,
    },

    /// A sub-mapping containing exactly the named keys
    Keys { keys: Vec<String> },

    /// Dot-path traversal; non-object intermediates yield null
    Path { path: String },

    /// String with `${path}` interpolation
    ///
    /// Substitution only: no arithmetic, no code execution.
    Template { template: String },

    /// The whole context
    Full,

    /// A literal value; context ignored
    Static { value: Value },
}

fn default_required() -> bool {
    true
}

impl Default for InputSelector {
    fn default() -> Self {
        Self::Full
    }
}

impl InputSelector {
    /// Resolve the selector against a context
    pub fn resolve(
        &self,
        context: &ContextMap,
        policy: TemplatePolicy,
    ) -> Result<Value, EngineError> {
        match self {
            Self::Key { key, required } => match context.get(key) {
                Some(value) => Ok(value.clone()),
                None if *required => Err(EngineError::InputKeyMissing(key.clone())),
                None => Ok(Value::Null),
            },

            Self::Keys { keys } => {
                let mut picked = Map::new();
                for key in keys {
                    if let Some(value) = context.get(key) {
                        picked.insert(key.clone(), value.clone());
                    }
                }
                Ok(Value::Object(picked))
            }

            Self::Path { path } => Ok(lookup_path_in(context, path).cloned().unwrap_or(Value::Null)),

            Self::Template { template } => {
                let rendered = render_template(template, context, policy)?;
                if rendered.chars().any(char::is_control) {
                    return Err(EngineError::InputTemplateUnresolved(format!(
                        "rendered template contains control characters: {template}"
                    )));
                }
                Ok(Value::String(rendered))
            }

            Self::Full => Ok(Value::Object(context.clone())),

            Self::Static { value } => Ok(value.clone()),
        }
    }
}

/// Traverse a dot path into a context map
pub fn lookup_path_in<'a>(context: &'a ContextMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = context.get(first)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}

/// Traverse a dot path into an arbitrary value
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Render `${path}` expressions in a template against the context
fn render_template(
    template: &str,
    context: &ContextMap,
    policy: TemplatePolicy,
) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated expression; pass the remainder through verbatim
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let path = &after[..end];
        match lookup_path_in(context, path) {
            Some(value) => out.push_str(&render_value(value)),
            None => match policy {
                TemplatePolicy::Fail => {
                    return Err(EngineError::InputTemplateUnresolved(path.to_string()))
                }
                TemplatePolicy::Empty => {}
            },
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Interpolated rendering: strings verbatim, scalars via display, the rest
/// as compact JSON
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
