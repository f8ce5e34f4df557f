use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    print_json(&err, true);
    std::process::exit(4);
}

/// Connection settings shared by every operator command.
pub struct Target {
    pub api_url: String,
    pub token: Option<String>,
    pub operator_id: Option<String>,
}

impl Target {
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> i32 {
        api_request(self, reqwest::Method::GET, path, None, query).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> i32 {
        api_request(self, reqwest::Method::POST, path, Some(body), &[]).await
    }
}

/// Execute an operator API request, print the JSON response, return an exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(
    target: &Target,
    method: reqwest::Method,
    path: &str,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
) -> i32 {
    let url = match reqwest::Url::parse(&format!("{}{path}", target.api_url)) {
        Ok(mut u) => {
            if !query.is_empty() {
                let mut q = u.query_pairs_mut();
                for (k, v) in query {
                    q.append_pair(k, v);
                }
            }
            u
        }
        Err(e) => {
            print_json(
                &json!({
                    "error": "cli_error",
                    "message": format!("Invalid URL: {}{path}: {e}", target.api_url)
                }),
                true,
            );
            return 4;
        }
    };

    let mut req = client().request(method, url);
    if let Some(t) = &target.token {
        req = req.header("Authorization", format!("Bearer {t}"));
    }
    if let Some(id) = &target.operator_id {
        req = req.header("x-operator-id", id.as_str());
    }
    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            print_json(
                &json!({
                    "error": "connection_error",
                    "message": format!("{e}"),
                    "docs_hint": "Is the Marshal API running? Check MARSHAL_API_URL."
                }),
                true,
            );
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for(status);

    let resp_body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    print_json(&resp_body, exit_code != 0);
    exit_code
}

pub fn exit_code_for(status: u16) -> i32 {
    match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    }
}

pub fn print_json(value: &serde_json::Value, to_stderr: bool) {
    let formatted = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    if to_stderr {
        eprintln!("{formatted}");
    } else {
        println!("{formatted}");
    }
}

/// Read JSON from a file path or stdin (when path is "-").
pub fn read_json_from_file(path: &str) -> Result<serde_json::Value, String> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin()).map_err(|e| format!("Failed to read stdin: {e}"))?
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}
