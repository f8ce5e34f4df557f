use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use marshal_core::auth::verify_operator_token;

use crate::error::AppError;
use crate::state::AppState;

pub const OPERATOR_ID_HEADER: &str = "x-operator-id";

/// Caller of an operator route. Extraction checks the bearer token when the
/// server has one configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub operator_id: Option<String>,
}

impl Operator {
    /// Identity recorded on mutations. Mutating routes refuse anonymous callers.
    pub fn require_identity(&self, operation: &str) -> Result<&str, AppError> {
        match self.operator_id.as_deref() {
            Some(operator_id) => {
                tracing::info!(
                    operator_id = operator_id,
                    operation = operation,
                    decision = "allow",
                    "operator authorization decision"
                );
                Ok(operator_id)
            }
            None => {
                tracing::warn!(
                    operation = operation,
                    decision = "deny",
                    "operator authorization decision"
                );
                Err(AppError::Forbidden {
                    message: format!("Operation '{operation}' requires an operator identity"),
                    docs_hint: Some(format!(
                        "Send the acting operator in the '{OPERATOR_ID_HEADER}' header."
                    )),
                })
            }
        }
    }
}

impl FromRequestParts<AppState> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(expected) = state.operator_token_sha256.as_deref() {
            let auth_header = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AppError::Unauthorized {
                    message: "Missing Authorization header".to_string(),
                    docs_hint: Some("Include 'Authorization: Bearer <operator token>' header.".to_string()),
                })?;

            let token = auth_header
                .strip_prefix("Bearer ")
                .ok_or_else(|| AppError::Unauthorized {
                    message: "Authorization header must use Bearer scheme".to_string(),
                    docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
                })?;

            if !verify_operator_token(token, expected) {
                tracing::warn!(path = %parts.uri.path(), "rejected operator token");
                return Err(AppError::Unauthorized {
                    message: "Invalid operator token".to_string(),
                    docs_hint: Some(
                        "The server compares the SHA-256 digest of the token with MARSHAL_OPERATOR_TOKEN_SHA256."
                            .to_string(),
                    ),
                });
            }
        }

        let operator_id = parts
            .headers
            .get(OPERATOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Operator { operator_id })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;
    use crate::state::test_support::{OPERATOR_TOKEN, test_app};

    async fn extract(secured: bool, headers: &[(&str, &str)]) -> Result<Operator, AppError> {
        let app = test_app(secured);
        let mut builder = Request::builder().uri("/v1/kill-switches/overview");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, ()) = builder.body(()).expect("request should build").into_parts();
        Operator::from_request_parts(&mut parts, &app.state).await
    }

    #[tokio::test]
    async fn open_mode_accepts_anonymous_reads() {
        let operator = extract(false, &[]).await.expect("open mode should accept");
        assert_eq!(operator.operator_id, None);
        assert!(operator.require_identity("POST /v1/kill-switches/activate").is_err());
    }

    #[tokio::test]
    async fn secured_mode_requires_matching_token() {
        assert!(matches!(
            extract(true, &[]).await,
            Err(AppError::Unauthorized { .. })
        ));
        assert!(matches!(
            extract(true, &[("authorization", "Bearer wrong")]).await,
            Err(AppError::Unauthorized { .. })
        ));
        assert!(matches!(
            extract(true, &[("authorization", OPERATOR_TOKEN)]).await,
            Err(AppError::Unauthorized { .. })
        ));

        let bearer = format!("Bearer {OPERATOR_TOKEN}");
        let operator = extract(true, &[("authorization", &bearer), (OPERATOR_ID_HEADER, "  alice ")])
            .await
            .expect("valid token should pass");
        assert_eq!(operator.require_identity("POST /v1/episodes").ok(), Some("alice"));
    }
}
