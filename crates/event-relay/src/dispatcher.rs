//! Event kind to gateway mutation translation.

use crate::envelope::kinds;
use crate::mutation::{MutationBuilder, MutationError, MutationRequest};
use serde_json::{Map, Value};
use thiserror::Error;

/// A recognized event whose payload cannot produce a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    #[error("{kind}: missing required field {field:?}")]
    MissingField { kind: String, field: String },

    #[error("{kind}: field {field:?} {reason}")]
    InvalidField {
        kind: String,
        field: String,
        reason: String,
    },

    #[error("{kind}: {source}")]
    Mutation {
        kind: String,
        #[source]
        source: MutationError,
    },
}

/// Expected JSON type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Text,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Text => value.is_string(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldType::Integer => "must be an integer",
            FieldType::Text => "must be a string",
        }
    }
}

/// How one event kind maps onto a gateway mutation.
#[derive(Debug, Clone)]
pub struct Route {
    pub kind: &'static str,
    pub operation: &'static str,
    pub fields: &'static [(&'static str, FieldType)],
    pub selection: &'static [&'static str],
}

const ROUTES: &[Route] = &[
    Route {
        kind: kinds::TEAM_CREATED,
        operation: "create_team",
        fields: &[("team_id", FieldType::Integer), ("team_name", FieldType::Text)],
        selection: &["team_id", "team_name"],
    },
    Route {
        kind: kinds::PLAYER_CREATED,
        operation: "create_player",
        fields: &[
            ("player_id", FieldType::Integer),
            ("player_name", FieldType::Text),
            ("player_team_id", FieldType::Integer),
        ],
        selection: &["player_id", "player_name"],
    },
    Route {
        kind: kinds::TEAM_JOINED,
        operation: "join_team",
        fields: &[("team_id", FieldType::Integer), ("team_name", FieldType::Text)],
        selection: &["team_id", "team_name"],
    },
];

/// Maps event kinds to gateway mutations. Unknown kinds are inert.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: Vec<Route>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(ROUTES.to_vec())
    }
}

impl Dispatcher {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Whether `kind` is forwarded to the gateway.
    pub fn recognizes(&self, kind: &str) -> bool {
        self.route(kind).is_some()
    }

    /// Translate an event into a gateway request.
    ///
    /// `Ok(None)` means the kind is not forwarded.
    pub fn translate(
        &self,
        kind: &str,
        payload: &Map<String, Value>,
    ) -> Result<Option<MutationRequest>, TranslationError> {
        let Some(route) = self.route(kind) else {
            return Ok(None);
        };

        let mutation_err = |source| TranslationError::Mutation {
            kind: kind.to_string(),
            source,
        };

        let mut builder = MutationBuilder::new(route.operation).map_err(mutation_err)?;

        for (field, ty) in route.fields {
            let value = payload
                .get(*field)
                .ok_or_else(|| TranslationError::MissingField {
                    kind: kind.to_string(),
                    field: field.to_string(),
                })?;

            if !ty.accepts(value) {
                return Err(TranslationError::InvalidField {
                    kind: kind.to_string(),
                    field: field.to_string(),
                    reason: ty.describe().to_string(),
                });
            }

            builder = builder.arg(field, value).map_err(mutation_err)?;
        }

        for field in route.selection {
            builder = builder.select(field).map_err(mutation_err)?;
        }

        Ok(Some(builder.build()))
    }

    fn route(&self, kind: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.kind == kind)
    }
}
