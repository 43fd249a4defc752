use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use modelgate::auth::{Authenticator, CredentialStore};
use modelgate::gateway::http::AppState;
use modelgate::gateway::{
    health, Gateway, HealthGate, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_INTERVAL,
};
use modelgate::providers::build_adapters;
use modelgate::router::Router;
use modelgate::transport::Transport;
use modelgate::{ProviderSecrets, RoutingFile};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const SESSION_SWEEP_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut listen = format!(
        "0.0.0.0:{}",
        std::env::var("PORT").unwrap_or_else(|_| "8080".to_string())
    );
    let mut config_path =
        std::env::var("MODELGATE_CONFIG").unwrap_or_else(|_| "models.yaml".to_string());
    let mut db_path = std::env::var("MODELGATE_DB").unwrap_or_else(|_| "modelgate.db".to_string());
    let mut enroll: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => listen = args.next().ok_or("missing value for --listen")?,
            "--config" => config_path = args.next().ok_or("missing value for --config")?,
            "--db" => db_path = args.next().ok_or("missing value for --db")?,
            "--enroll-key" => {
                enroll = Some(args.next().ok_or("missing value for --enroll-key")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let store = CredentialStore::new(&db_path);
    store.init().await?;

    if let Some(name) = enroll {
        let credential = store.enroll(&name, "", "enrolled via cli", None).await?;
        println!("{credential}");
        println!("store this credential now; it is not recoverable later");
        return Ok(());
    }

    let file = Arc::new(RoutingFile::load(&config_path)?);
    file.validate()?;
    let secrets = ProviderSecrets::from_env();

    let adapters = build_adapters(&file, &secrets);
    let transport = Arc::new(Transport::new(&file, &secrets)?);
    let router = Router::new(file.clone());
    let mut gateway = Gateway::new(router, adapters.clone(), transport.clone());
    if let Ok(rpm) = std::env::var("RATE_LIMIT_RPM") {
        gateway = gateway.with_rate_limit(rpm.parse()?);
    }

    let mut authenticator = Authenticator::new(store.clone());
    if std::env::var("REQUIRE_TWO_FACTOR").as_deref() == Ok("true") {
        authenticator = authenticator.with_required_two_factor(true);
    }
    if let Ok(secs) = std::env::var("SESSION_LIFETIME_SECS") {
        authenticator = authenticator.with_session_lifetime(Duration::from_secs(secs.parse()?));
    }

    let gate = HealthGate::new(DEFAULT_FAILURE_THRESHOLD);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let probe_interval = std::env::var("HEALTH_INTERVAL_SECS")
        .ok()
        .and_then(|secs| secs.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PROBE_INTERVAL);
    let probe_task = health::spawn_probes(
        gate.clone(),
        adapters,
        transport,
        probe_interval,
        shutdown_rx.clone(),
    );

    let sweep_store = store.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            match sweep_store.sweep_sessions(SESSION_SWEEP_GRACE).await {
                Ok(0) => {}
                Ok(deleted) => tracing::info!(deleted, "swept expired sessions"),
                Err(err) => tracing::warn!(error = %err, "session sweep failed"),
            }
        }
    });

    let state = AppState::new(gateway, authenticator, gate);
    let app = modelgate::gateway::http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = listen.as_str(), config = config_path.as_str(), "modelgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    probe_task.abort();
    sweep_task.abort();
    Ok(())
}
