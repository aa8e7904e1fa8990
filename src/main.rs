use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use llm_token_ratelimit::cli::CliArgs;
use llm_token_ratelimit::config::{PluginConfig, RawConfig};
use llm_token_ratelimit::routes::{chat_completions, AppState};
use llm_token_ratelimit::state::RequestStateStore;

const REQUEST_STATE_TTL: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    let mut raw = match &cli.config {
        Some(path) => RawConfig::from_file(path)?,
        None => RawConfig::default(),
    };
    apply_overrides(&mut raw, &cli);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&raw.log.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let host = raw.server.host.clone();
    let port = raw.server.port;
    let upstream = raw.server.upstream.clone();

    let config = Arc::new(PluginConfig::build(raw).await?);
    let request_state = Arc::new(RequestStateStore::new(REQUEST_STATE_TTL));

    let sweeper = request_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = sweeper.sweep_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "swept expired per-request state entries");
            }
        }
    });

    let state = AppState {
        config,
        request_state,
        http: reqwest::Client::new(),
        upstream,
    };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!(%addr, "starting token-aware rate-limiting gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

fn apply_overrides(raw: &mut RawConfig, cli: &CliArgs) {
    if let Some(host) = &cli.host {
        raw.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        raw.server.port = port;
    }
    if let Some(upstream) = &cli.upstream {
        raw.server.upstream = upstream.clone();
    }
    if let Some(redis_addr) = &cli.redis_addr {
        raw.redis.service_addr = redis_addr.clone();
    }
    if let Some(log_level) = &cli.log_level {
        raw.log.level = log_level.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post as axum_post;
    use llm_token_ratelimit::config::RawConfig;
    use llm_token_ratelimit::limiter::InMemoryLimiter;

    /// Spawns a canned upstream that always returns the same chat-completion
    /// response, and the gateway pointed at it, returning the gateway's base
    /// URL.
    async fn spawn_app() -> String {
        async fn upstream_completion() -> axum::Json<serde_json::Value> {
            axum::Json(serde_json::json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "model": "gpt-3.5-turbo-0613",
                "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21},
            }))
        }

        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream_router = Router::new().route("/v1/chat/completions", axum_post(upstream_completion));
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream_router).await.unwrap();
        });

        let mut raw = RawConfig::default();
        raw.server.upstream = format!("http://{upstream_addr}");
        raw.redis.allow_in_memory_fallback = true;
        let mut config = PluginConfig::build(raw).await.unwrap();
        config.limiter = Arc::new(InMemoryLimiter::new());

        let state = AppState {
            config: Arc::new(config),
            request_state: Arc::new(RequestStateStore::new(Duration::from_secs(60))),
            http: reqwest::Client::new(),
            upstream: format!("http://{upstream_addr}"),
        };

        let gateway_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                gateway_listener,
                app(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        format!("http://{gateway_addr}")
    }

    #[tokio::test]
    async fn scenario_s1_request_is_forwarded_and_reconciled() {
        let base_url = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("{base_url}/v1/chat/completions"))
            .json(&serde_json::json!({
                "model": "gpt-3.5-turbo-0613",
                "messages": [{"role": "user", "content": "hello there"}],
                "stream": false,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["usage"]["completion_tokens"], 12);
    }
}
