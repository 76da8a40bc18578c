//! Error type shared by the HTTP handlers

use crate::server::models::{OperationOutcome, RequestError};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] octofhir_fhirpath::FhirPathError),

    #[error("model provider failure: {0}")]
    Model(#[from] octofhir_fhir_model::ModelError),

    #[error("unknown FHIR version '{version}', expected one of r4, r4b, r5, r6")]
    InvalidFhirVersion { version: String },

    #[error("response serialization failed: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("{message}")]
    BadRequest { message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServerError {
    /// OperationOutcome issue code for this error.
    fn issue_code(&self) -> &'static str {
        match self {
            Self::Evaluation(_) => "processing",
            Self::Model(_) | Self::Internal(_) => "exception",
            Self::InvalidFhirVersion { .. } => "not-supported",
            Self::InvalidJson(_) | Self::BadRequest { .. } => "invalid",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Model(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let outcome = OperationOutcome::error(
            self.issue_code(),
            &self.to_string(),
            Some(format!("{:?}", self)),
        );
        (self.status(), Json(outcome)).into_response()
    }
}

impl From<RequestError> for ServerError {
    fn from(error: RequestError) -> Self {
        Self::BadRequest {
            message: error.to_string(),
        }
    }
}
