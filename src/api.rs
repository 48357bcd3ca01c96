use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{catch, post, State};
use thiserror::Error;

use crate::app_state::{AppState, PredictError};
use crate::types::{ErrorResponse, GeneratedSequence, PredictRequest};

/// Errors surfaced to HTTP callers. Only the public message goes on the
/// wire; internal detail stays in the logs.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("request body exceeds the {0} limit")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Predict(#[from] PredictError),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::PayloadTooLarge(_) => Status::PayloadTooLarge,
            ApiError::Predict(PredictError::TimedOut(_)) => Status::ServiceUnavailable,
            ApiError::Predict(_) => Status::InternalServerError,
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::Predict(PredictError::TimedOut(_)) => "generation timed out".to_string(),
            ApiError::Predict(_) => "text generation failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            tracing::error!(error = %self, uri = %req.uri(), "request failed");
        } else {
            tracing::debug!(error = %self, uri = %req.uri(), "request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.public_message(),
        });
        (status, body).respond_to(req)
    }
}

#[post("/predict", data = "<req>")]
pub async fn predict(
    state: &State<AppState>,
    req: Result<PredictRequest, ApiError>,
) -> Result<Json<Vec<GeneratedSequence>>, ApiError> {
    let req = req?;
    let result = state.predict(&req.text).await?;
    Ok(Json(result))
}

#[catch(default)]
pub fn default_catcher(status: Status, _req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    let error = status.reason().unwrap_or("request failed").to_string();
    (status, Json(ErrorResponse { error }))
}
