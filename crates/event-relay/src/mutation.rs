//! Mutation document builder.
//!
//! Payload values are never spliced into the document as raw text: every
//! name is checked against the GraphQL name grammar and every value is
//! rendered as a GraphQL literal with its string content escaped.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A value or name that cannot be embedded in a mutation document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("argument {name}: {reason}")]
    UnsupportedValue { name: String, reason: String },
}

/// Request body posted to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
    pub query: String,
}

/// Builds `mutation { op(arg: literal, ...) { field ... } }` documents.
#[derive(Debug, Clone)]
pub struct MutationBuilder {
    operation: String,
    arguments: Vec<(String, String)>,
    selection: Vec<String>,
}

impl MutationBuilder {
    pub fn new(operation: &str) -> Result<Self, MutationError> {
        Ok(Self {
            operation: checked_name(operation)?,
            arguments: Vec::new(),
            selection: Vec::new(),
        })
    }

    /// Add an argument rendered from a JSON value.
    pub fn arg(mut self, name: &str, value: &Value) -> Result<Self, MutationError> {
        let name = checked_name(name)?;
        let literal = render_literal(value).map_err(|reason| MutationError::UnsupportedValue {
            name: name.clone(),
            reason,
        })?;
        self.arguments.push((name, literal));
        Ok(self)
    }

    /// Add a field to the selection set.
    pub fn select(mut self, field: &str) -> Result<Self, MutationError> {
        self.selection.push(checked_name(field)?);
        Ok(self)
    }

    pub fn build(self) -> MutationRequest {
        let mut query = format!("mutation {{ {}", self.operation);

        if !self.arguments.is_empty() {
            let args: Vec<String> = self
                .arguments
                .iter()
                .map(|(name, literal)| format!("{name}: {literal}"))
                .collect();
            query.push('(');
            query.push_str(&args.join(", "));
            query.push(')');
        }

        if !self.selection.is_empty() {
            query.push_str(" { ");
            query.push_str(&self.selection.join(" "));
            query.push_str(" }");
        }

        query.push_str(" }");
        MutationRequest { query }
    }
}

/// Names follow `[_A-Za-z][_0-9A-Za-z]*`.
fn checked_name(name: &str) -> Result<String, MutationError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first == '_' || first.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        None => false,
    };

    if valid {
        Ok(name.to_string())
    } else {
        Err(MutationError::InvalidName(name.to_string()))
    }
}

/// Render a scalar JSON value as a GraphQL literal.
///
/// JSON string escaping is a subset of GraphQL's, so serde_json's encoder
/// produces a valid, fully escaped GraphQL string.
fn render_literal(value: &Value) -> Result<String, String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => serde_json::to_string(s).map_err(|e| e.to_string()),
        Value::Array(_) => Err("lists are not supported".to_string()),
        Value::Object(_) => Err("objects are not supported".to_string()),
    }
}
