//! Tool gateway implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use marshal_core::tool::{ToolCall, ToolGateway, ToolOutcome, VerificationProbe};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

/// Calls a remote tool executor over HTTP.
///
/// `POST {base}/v1/tools/{tool_id}/invoke` executes a call, carrying the
/// idempotency key in the `Idempotency-Key` header.
/// `GET {base}/v1/tools/{tool_id}/actions/{action_id}` answers whether the
/// effect of an earlier call exists.
#[derive(Debug, Clone)]
pub struct HttpToolGateway {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    proof: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    applied: Option<bool>,
    #[serde(default)]
    proof: Option<String>,
}

/// What an HTTP status says about whether the effect happened.
pub fn classify_status(status: StatusCode) -> Option<fn(String) -> ToolOutcome> {
    if status.is_success() {
        return None;
    }
    let classify: fn(String) -> ToolOutcome = match status {
        // The request was refused before any work started.
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            |message| ToolOutcome::Transient { message }
        }
        // The executor may have applied the effect before answering.
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::CONFLICT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT => |message| ToolOutcome::Unknown { message },
        s if s.is_client_error() => |message| ToolOutcome::Permanent { message },
        _ => |message| ToolOutcome::Unknown { message },
    };
    Some(classify)
}

impl HttpToolGateway {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Option<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().ok()?.pop_if_empty().extend(segments);
        Some(url)
    }
}

#[async_trait]
impl ToolGateway for HttpToolGateway {
    async fn invoke(&self, action_id: Uuid, call: &ToolCall) -> ToolOutcome {
        let Some(url) = self.endpoint(&["v1", "tools", &call.tool_id, "invoke"]) else {
            return ToolOutcome::Permanent {
                message: format!("gateway base url {} cannot carry a path", self.base_url),
            };
        };
        let mut request = self.client.post(url).json(&json!({
            "action_id": action_id,
            "input": call.input,
            "platform": call.platform,
            "lane": call.lane,
            "capability": call.capability,
        }));
        if let Some(key) = call.key() {
            request = request.header("Idempotency-Key", key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Nothing left the process; safe to retry.
            Err(err) if err.is_connect() || err.is_builder() => {
                return ToolOutcome::Transient {
                    message: err.to_string(),
                };
            }
            Err(err) => {
                return ToolOutcome::Unknown {
                    message: err.to_string(),
                };
            }
        };

        let status = response.status();
        if let Some(classify) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                action_id = %action_id,
                tool_id = %call.tool_id,
                status = status.as_u16(),
                "tool executor returned an error status"
            );
            return classify(format!("{status}: {body}"));
        }
        match response.json::<InvokeResponse>().await {
            Ok(body) => ToolOutcome::Success {
                output: body.output,
                proof: body.proof,
            },
            // Accepted but the acknowledgement was lost.
            Err(err) => ToolOutcome::Unknown {
                message: format!("unreadable success response: {err}"),
            },
        }
    }

    async fn verify(&self, action_id: Uuid, call: &ToolCall) -> VerificationProbe {
        let action = action_id.to_string();
        let Some(url) = self.endpoint(&["v1", "tools", &call.tool_id, "actions", &action]) else {
            return VerificationProbe::Inconclusive;
        };
        let mut request = self.client.get(url);
        if let Some(key) = call.key() {
            request = request.query(&[("idempotency_key", key)]);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(action_id = %action_id, error = %err, "verification probe failed");
                return VerificationProbe::Inconclusive;
            }
        };
        if response.status() == StatusCode::NOT_FOUND {
            return VerificationProbe::NotApplied;
        }
        if !response.status().is_success() {
            return VerificationProbe::Inconclusive;
        }
        match response.json::<ProbeResponse>().await {
            Ok(ProbeResponse {
                applied: Some(true),
                proof,
            }) => VerificationProbe::Applied { proof },
            Ok(ProbeResponse {
                applied: Some(false), ..
            }) => VerificationProbe::NotApplied,
            _ => VerificationProbe::Inconclusive,
        }
    }
}

/// In-process gateway that records every call and answers from scripted
/// queues, falling back to success for invocations and inconclusive probes.
/// Backs dry-run deployments and tests.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    invocations: Vec<(Uuid, ToolCall)>,
    probes: usize,
    outcomes: HashMap<String, VecDeque<ToolOutcome>>,
    probe_answers: HashMap<String, VecDeque<VerificationProbe>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_outcome(&self, tool_id: &str, outcomes: impl IntoIterator<Item = ToolOutcome>) {
        self.lock()
            .outcomes
            .entry(tool_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn push_probe(&self, tool_id: &str, probes: impl IntoIterator<Item = VerificationProbe>) {
        self.lock()
            .probe_answers
            .entry(tool_id.to_string())
            .or_default()
            .extend(probes);
    }

    pub fn invocations(&self) -> Vec<(Uuid, ToolCall)> {
        self.lock().invocations.clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.lock().invocations.len()
    }

    pub fn probe_count(&self) -> usize {
        self.lock().probes
    }
}

#[async_trait]
impl ToolGateway for RecordingGateway {
    async fn invoke(&self, action_id: Uuid, call: &ToolCall) -> ToolOutcome {
        let mut state = self.lock();
        state.invocations.push((action_id, call.clone()));
        let scripted = state
            .outcomes
            .get_mut(&call.tool_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| ToolOutcome::Success {
            output: json!({ "tool_id": call.tool_id, "dry_run": true }),
            proof: Some(format!("recorded:{action_id}")),
        })
    }

    async fn verify(&self, _action_id: Uuid, call: &ToolCall) -> VerificationProbe {
        let mut state = self.lock();
        state.probes += 1;
        state
            .probe_answers
            .get_mut(&call.tool_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(VerificationProbe::Inconclusive)
    }
}
