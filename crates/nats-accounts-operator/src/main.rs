use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::Client;
use nats_accounts_operator::{
    account_controller as acc, cli::Cli, events::EventRecorder, http, http::Metrics,
    operator_controller as op, signing_key_controller as skc, user_controller as usr,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("nats-accounts-operator starting up");

    let client = Client::try_default().await?;
    let recorder = EventRecorder::new(client.clone());
    let metrics = Arc::new(Metrics::default());

    let http_server = tokio::spawn(http::serve(
        cli.metrics_bind_address,
        cli.health_probe_bind_address,
        metrics.clone(),
    ));

    // Operator controller
    let op_ctx = Arc::new(op::Ctx {
        client: client.clone(),
        recorder: recorder.clone(),
    });
    let op_controller = op::controller(client.clone())
        .run(op::reconcile, op::error_policy, op_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = ?e, "operator reconcile error");
            }
        });

    // SigningKey controller
    let sk_ctx = Arc::new(skc::Ctx {
        client: client.clone(),
        recorder: recorder.clone(),
    });
    let sk_controller = skc::controller(client.clone())
        .run(skc::reconcile, skc::error_policy, sk_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = ?e, "signing key reconcile error");
            }
        });

    // Account controller
    let acc_ctx = Arc::new(acc::Ctx {
        client: client.clone(),
        recorder: recorder.clone(),
        metrics,
    });
    let acc_controller = acc::controller(client.clone())
        .run(acc::reconcile, acc::error_policy, acc_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = ?e, "account reconcile error");
            }
        });

    // User controller
    let usr_ctx = Arc::new(usr::Ctx {
        client: client.clone(),
        recorder,
    });
    let usr_controller = usr::controller(client)
        .run(usr::reconcile, usr::error_policy, usr_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = ?e, "user reconcile error");
            }
        });

    tokio::select! {
        _ = op_controller => {},
        _ = sk_controller => {},
        _ = acc_controller => {},
        _ = usr_controller => {},
        res = http_server => {
            if let Ok(Err(e)) = res {
                warn!(error = ?e, "http server exited");
            }
        },
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
