//! JSON extractor whose rejections are structured `AppError` bodies instead of
//! axum's plain-text 422.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();
    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_from_serde_message(&body_text).unwrap_or_else(|| "body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the schema at /api-doc/openapi.json (Swagger UI at /swagger-ui)."
                .to_string(),
        ),
    }
}

/// Field named by serde's "missing field `x`" / "unknown field `x`" /
/// "unknown variant `x`" messages.
fn field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `", "unknown variant `"]
        .iter()
        .find_map(|marker| {
            let after = &msg[msg.find(marker)? + marker.len()..];
            after.find('`').map(|end| after[..end].to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize the JSON body into the target type: missing field `reason` at line 1 column 20";
        assert_eq!(field_from_serde_message(msg), Some("reason".to_string()));
    }

    #[test]
    fn extracts_unknown_variant() {
        let msg = "scope: unknown variant `galaxy`, expected one of `global`, `client`";
        assert_eq!(field_from_serde_message(msg), Some("galaxy".to_string()));
    }

    #[test]
    fn no_field_for_syntax_errors() {
        assert_eq!(field_from_serde_message("expected value at line 1 column 1"), None);
    }
}
