//! Health probes and the plain-text counter endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tracing::info;

/// Counters exposed on `/metrics`. `jwt_push_ambiguous_total` records JWT
/// re-pushes that happened while the prior push was already acknowledged,
/// surfacing the push-on-rewrite ambiguity as an observable signal.
#[derive(Debug, Default)]
pub struct Metrics {
    pub jwt_pushes_total: AtomicU64,
    pub jwt_push_ambiguous_total: AtomicU64,
    pub jwt_deletes_total: AtomicU64,
}

impl Metrics {
    fn render(&self) -> String {
        format!(
            "# TYPE nats_accounts_operator_jwt_pushes_total counter\n\
             nats_accounts_operator_jwt_pushes_total {}\n\
             # TYPE nats_accounts_operator_jwt_push_ambiguous_total counter\n\
             nats_accounts_operator_jwt_push_ambiguous_total {}\n\
             # TYPE nats_accounts_operator_jwt_deletes_total counter\n\
             nats_accounts_operator_jwt_deletes_total {}\n",
            self.jwt_pushes_total.load(Ordering::Relaxed),
            self.jwt_push_ambiguous_total.load(Ordering::Relaxed),
            self.jwt_deletes_total.load(Ordering::Relaxed),
        )
    }
}

async fn metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

async fn ok() -> &'static str {
    "ok"
}

/// Serves the probe endpoints and the metrics endpoint until the process
/// exits.
pub async fn serve(
    metrics_addr: String,
    probe_addr: String,
    metrics_state: Arc<Metrics>,
) -> anyhow::Result<()> {
    let metrics_router = Router::new()
        .route("/metrics", get(metrics))
        .with_state(metrics_state);
    let probe_router = Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
    let probe_listener = tokio::net::TcpListener::bind(&probe_addr).await?;
    info!(metrics = %metrics_addr, probes = %probe_addr, "serving http endpoints");

    tokio::try_join!(
        async { axum::serve(metrics_listener, metrics_router).await },
        async { axum::serve(probe_listener, probe_router).await },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_as_prometheus_text() {
        let metrics = Metrics::default();
        metrics.jwt_pushes_total.fetch_add(3, Ordering::Relaxed);
        metrics.jwt_push_ambiguous_total.fetch_add(1, Ordering::Relaxed);

        let text = metrics.render();
        assert!(text.contains("nats_accounts_operator_jwt_pushes_total 3"));
        assert!(text.contains("nats_accounts_operator_jwt_push_ambiguous_total 1"));
        assert!(text.contains("nats_accounts_operator_jwt_deletes_total 0"));
    }
}
