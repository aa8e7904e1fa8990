use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};

use crate::config::PluginConfig;
use crate::key_extractor;
use crate::limiter::token_rate;
use crate::state::{PerRequestState, RequestStateStore};

const PERIOD: Duration = Duration::from_secs(1);

/// What the host should do next: either forward the request/response
/// unchanged, or short-circuit with a local HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Continue,
    LocalResponse(u16),
}

/// HTTP status used for every limiter/admission denial. `429 Too Many
/// Requests` would be the more conventional choice; this filter keeps `409`
/// to match the upstream plugin's existing clients (see DESIGN.md).
const DENIED_STATUS: u16 = 409;

/// Orchestrates the tokenizer, adapter, key extractor, limiter, and
/// predictor across the three filter phases. One `Filter` is constructed
/// per inbound request attempt and borrows the shared, immutable
/// [`PluginConfig`] plus the shared per-request state store.
pub struct Filter {
    config: Arc<PluginConfig>,
    request_state: Arc<RequestStateStore>,
}

impl Filter {
    pub fn new(config: Arc<PluginConfig>, request_state: Arc<RequestStateStore>) -> Self {
        Self {
            config,
            request_state,
        }
    }

    /// Tokenizes and admits an inbound request: parses it, runs the cold/warm
    /// admission check, extracts rate-limit keys, predicts a completion cost,
    /// and provisionally debits that prediction from the limiter. On success,
    /// stashes the prediction and keys under `req_id` for the matching
    /// `encode_response`/`encode_data` call to reconcile against.
    #[tracing::instrument(skip(self, headers, body), fields(req_id))]
    pub async fn decode_request(
        &self,
        req_id: &str,
        headers: &HeaderMap,
        uri: &Uri,
        host: &str,
        body: &[u8],
    ) -> FilterAction {
        let req = match self.config.adapter.convert_request(body) {
            Ok(req) => req,
            Err(err) => {
                tracing::error!(error = %err, "failed to convert request to HTNN format");
                return FilterAction::Continue;
            }
        };

        if self.config.stats.is_exceeded(req.prompt_token) {
            tracing::warn!(prompt_token = req.prompt_token, "token budget exceeded for prompt");
            return FilterAction::LocalResponse(DENIED_STATUS);
        }

        let keys = key_extractor::extract(headers, uri, host, &self.config.rule, &self.config.regexps);
        if keys.is_empty() {
            tracing::debug!("no rate-limit key extracted, request is unmetered for this rule");
            return FilterAction::Continue;
        }

        let predicted = self.config.stats.predict_completion(req.prompt_token);

        let allowed = token_rate(
            self.config.limiter.as_ref(),
            &keys,
            self.config.rule.rate,
            self.config.rule.burst,
            PERIOD,
            predicted as i64,
        )
        .await;
        if !allowed {
            tracing::warn!(keys = ?keys, predicted, "token rate exceeded in decode_request");
            return FilterAction::LocalResponse(DENIED_STATUS);
        }

        self.request_state.set(
            req_id,
            PerRequestState {
                predicted,
                keys,
                prompt_token: req.prompt_token,
                stream_delta: None,
            },
        );

        FilterAction::Continue
    }

    /// Reconciles a non-streamed response against the prediction debited in
    /// `decode_request`: debits the gap between realized and predicted
    /// completion tokens (a credit if negative), then records the observed
    /// `(prompt, completion)` pair for future predictions.
    #[tracing::instrument(skip(self, body), fields(req_id))]
    pub async fn encode_response(&self, req_id: &str, body: &[u8]) -> FilterAction {
        let resp = match self.config.adapter.convert_response(body) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::error!(error = %err, "failed to convert response from HTNN");
                return FilterAction::Continue;
            }
        };

        let Some(state) = self.request_state.get(req_id) else {
            tracing::error!(req_id, "missing per-request state in encode_response");
            return FilterAction::Continue;
        };

        let gap = resp.completion_tokens as i64 - state.predicted as i64;
        let allowed = token_rate(
            self.config.limiter.as_ref(),
            &state.keys,
            self.config.rule.rate,
            self.config.rule.burst,
            PERIOD,
            gap,
        )
        .await;
        if !allowed {
            tracing::warn!(keys = ?state.keys, gap, "token rate exceeded in encode_response");
            return FilterAction::LocalResponse(DENIED_STATUS);
        }

        self.request_state.clear(req_id);
        self.config.stats.add(resp.prompt_tokens, resp.completion_tokens);

        FilterAction::Continue
    }

    /// Accumulates one streamed response chunk. Once a chunk carries a
    /// finish reason, reconciles the realized completion cost against the
    /// prediction (same gap-debit as `encode_response`) and clears the
    /// per-request state; otherwise stores the updated accumulator back
    /// under `req_id` for the next chunk.
    #[tracing::instrument(skip(self, chunk), fields(req_id))]
    pub async fn encode_data(&self, req_id: &str, chunk: &[u8]) -> FilterAction {
        let Some(mut state) = self.request_state.get(req_id) else {
            tracing::error!(req_id, "missing per-request state in encode_data");
            return FilterAction::Continue;
        };

        let prior = state.stream_delta.take().unwrap_or_default();
        let delta = match self.config.adapter.convert_stream_chunk(prior, chunk) {
            Ok(delta) => delta,
            Err(err) => {
                tracing::error!(error = %err, "failed to convert stream chunk");
                return FilterAction::Continue;
            }
        };

        if delta.finish {
            let gap = delta.completion_tokens as i64 - state.predicted as i64;
            let allowed = token_rate(
                self.config.limiter.as_ref(),
                &state.keys,
                self.config.rule.rate,
                self.config.rule.burst,
                PERIOD,
                gap,
            )
            .await;
            if !allowed {
                tracing::warn!(keys = ?state.keys, gap, "token rate exceeded in encode_data");
                return FilterAction::LocalResponse(DENIED_STATUS);
            }

            self.config
                .stats
                .add(state.prompt_token, delta.completion_tokens);
            self.request_state.clear(req_id);
        } else {
            state.stream_delta = Some(delta);
            self.request_state.set(req_id, state);
        }

        FilterAction::Continue
    }
}

/// Derives a request ID stable for the duration of one request attempt from
/// the worker, remote peer, and retry count, so that an attempt's three
/// filter calls can find each other's per-request state.
pub fn request_id(worker_id: u64, remote_ip: &str, remote_port: u16, attempt_count: u32) -> String {
    format!("{worker_id}-{remote_ip}-{remote_port}-{attempt_count}")
}
