//! Error types for the resource engine

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Malformed user input in the search/filter grammar.
///
/// Every variant maps to HTTP 400 at the request boundary; none of these are
/// retried by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("unknown property '{segment}' in path '{path}'")]
    InvalidPath { path: String, segment: String },

    #[error("intermediate property '{segment}' in path '{path}' is collection-valued and cannot be dotted through")]
    NonScalarIntermediate { path: String, segment: String },

    #[error("nested object property '{path}' cannot be used as a comparable value")]
    InvalidObjectUsage { path: String },

    #[error("invalid value '{raw}': expected {expected}")]
    InvalidValue { raw: String, expected: String },

    #[error("unknown transformation '{token}'")]
    UnknownTransformation { token: String },

    #[error("transformation '{token}' expects {expected} argument(s)")]
    TransformArity { token: String, expected: String },

    #[error("transformation '{token}' is not applicable to {value_type} values")]
    TransformNotApplicable { token: String, value_type: String },

    #[error("unknown operator '{token}'")]
    UnknownOperator { token: String },

    #[error("expression is not allowed here without an explicit operator")]
    ExpressionNotAllowed,

    #[error("operator '{token}' is not applicable to {value_type} values")]
    OperatorNotApplicable { token: String, value_type: String },

    #[error("operation '{token}' is not applicable to collection property '{path}'")]
    IllegalCollectionOperation { path: String, token: String },

    #[error("collection property '{path}' does not support a nested element filter")]
    InvalidCollectionFilter { path: String },

    #[error("circular nested group reference '{group_id}'")]
    CircularGroupReference { group_id: String },

    #[error("invalid filter group directive '{token}'")]
    InvalidGroupDirective { token: String },

    #[error("empty filter group id")]
    EmptyGroupId,

    #[error("filter groups nested more than {max} levels deep")]
    NestingTooDeep { max: usize },

    #[error("missing operand for filter on '{path}'")]
    MissingOperand { path: String },

    #[error("more than one range specification")]
    DuplicateRange,

    #[error("invalid range specification '{raw}'")]
    InvalidRange { raw: String },
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request input (filter grammar, values, range, ordering).
    #[error("search syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    /// Internal invariant violated (e.g. a supposedly-unique filter matched
    /// more than one record). Never user-recoverable.
    #[error("data integrity error: {0}")]
    Data(String),

    /// Patch document could not be applied to the record.
    #[error("patch error: {0}")]
    Patch(String),

    /// Failure reported by the database collaborator (connection acquisition,
    /// transaction control, or statement execution).
    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Error::Syntax(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Patch(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            Error::Data(_) | Error::Database(_) | Error::Internal(_) | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": status_code_label(status),
                "message": error_message,
            }
        }));

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        response
    }
}

fn status_code_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid-request",
        StatusCode::UNPROCESSABLE_ENTITY => "unprocessable",
        _ => "internal",
    }
}
