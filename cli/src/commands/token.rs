use serde_json::json;

use crate::util::{exit_error, print_json};

/// Print the SHA-256 digest the API expects in MARSHAL_OPERATOR_TOKEN_SHA256.
pub fn run(token: Option<&str>) -> i32 {
    let token = match token {
        Some(t) if !t.trim().is_empty() => t,
        _ => exit_error(
            "an operator token is required",
            Some("Pass --token or set MARSHAL_OPERATOR_TOKEN"),
        ),
    };

    print_json(
        &json!({
            "env": "MARSHAL_OPERATOR_TOKEN_SHA256",
            "sha256": marshal_core::auth::hash_token(token.trim()),
        }),
        false,
    );
    0
}
