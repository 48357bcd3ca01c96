use rocket::data::{self, Data, FromData, ToByteUnit};
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiError;

/// Body of `POST /predict`.
///
/// Only `text` is recognised. A missing key, or an empty JSON body, reads as
/// the empty prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub text: String,
}

/// One record of a generation result, serialized as `{"generated_text": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSequence {
    pub generated_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl PredictRequest {
    /// Validates a raw body against the `/predict` schema.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("request body is not valid JSON: {e}")))?;

        let Value::Object(mut fields) = value else {
            return Err(ApiError::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        };

        match fields.remove("text") {
            None => Ok(Self::default()),
            Some(Value::String(text)) => Ok(Self { text }),
            Some(other) => Err(ApiError::BadRequest(format!(
                "`text` must be a string, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[rocket::async_trait]
impl<'r> FromData<'r> for PredictRequest {
    type Error = ApiError;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        match req.content_type() {
            Some(ct) if ct.is_json() => {}
            Some(ct) => {
                return Outcome::Error((
                    Status::BadRequest,
                    ApiError::BadRequest(format!("expected a JSON body, got content type `{ct}`")),
                ))
            }
            None => {
                return Outcome::Error((
                    Status::BadRequest,
                    ApiError::BadRequest("missing `Content-Type: application/json`".to_string()),
                ))
            }
        }

        let limit = req.limits().get("json").unwrap_or(1.mebibytes());
        let body = match data.open(limit).into_bytes().await {
            Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
            Ok(_) => {
                return Outcome::Error((
                    Status::PayloadTooLarge,
                    ApiError::PayloadTooLarge(limit.to_string()),
                ))
            }
            Err(e) => {
                return Outcome::Error((
                    Status::BadRequest,
                    ApiError::BadRequest(format!("failed to read request body: {e}")),
                ))
            }
        };

        match Self::from_body(&body) {
            Ok(request) => Outcome::Success(request),
            Err(e) => Outcome::Error((e.status(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_text_field() {
        let req = PredictRequest::from_body(br#"{"text": "Hello"}"#).unwrap();
        assert_eq!(req.text, "Hello");
    }

    #[test]
    fn missing_text_is_empty_prompt() {
        assert_eq!(PredictRequest::from_body(b"{}").unwrap(), PredictRequest::default());
        assert_eq!(
            PredictRequest::from_body(br#"{"prompt": "ignored"}"#).unwrap().text,
            ""
        );
    }

    #[test]
    fn blank_body_is_empty_prompt() {
        assert_eq!(PredictRequest::from_body(b"").unwrap().text, "");
        assert_eq!(PredictRequest::from_body(b" \n").unwrap().text, "");
    }

    #[test]
    fn rejects_non_string_text() {
        let bodies: [&[u8]; 3] = [br#"{"text": 42}"#, br#"{"text": null}"#, br#"{"text": ["a"]}"#];
        for body in bodies {
            let err = PredictRequest::from_body(body).unwrap_err();
            assert_eq!(err.status(), Status::BadRequest);
        }
    }

    #[test]
    fn rejects_malformed_and_non_object_bodies() {
        let bodies: [&[u8]; 4] = [b"{\"text\": ", b"not json", b"[1, 2]", b"\"Hello\""];
        for body in bodies {
            let err = PredictRequest::from_body(body).unwrap_err();
            assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");
        }
    }

    #[test]
    fn generated_sequence_wire_shape() {
        let seq = GeneratedSequence {
            generated_text: "Hello there".to_string(),
        };
        assert_eq!(
            serde_json::to_value(vec![seq]).unwrap(),
            serde_json::json!([{ "generated_text": "Hello there" }])
        );
    }
}
