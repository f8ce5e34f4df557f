use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

use crate::auth::OPERATOR_ID_HEADER;

const DEFAULT_ORIGINS: &str = "http://localhost:3000";

/// Comma-separated origins; blanks and unparsable entries are dropped.
fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect()
}

/// CORS for the operator dashboard, origins from `MARSHAL_CORS_ORIGINS`
/// (default `http://localhost:3000`).
pub fn build_cors_layer() -> CorsLayer {
    let origins = std::env::var("MARSHAL_CORS_ORIGINS").unwrap_or_else(|_| DEFAULT_ORIGINS.to_string());

    CorsLayer::new()
        .allow_origin(parse_origins(&origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static(OPERATOR_ID_HEADER),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_origins() {
        let origins = parse_origins(" https://ops.example.com, ,http://localhost:5173 ");
        assert_eq!(
            origins,
            vec![
                HeaderValue::from_static("https://ops.example.com"),
                HeaderValue::from_static("http://localhost:5173"),
            ]
        );
    }

    #[test]
    fn drops_values_that_are_not_header_safe() {
        assert!(parse_origins("https://bad\norigin.example").is_empty());
    }
}
