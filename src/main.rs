use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use enrol_core::config::{
    autosave_interval_from_env_value, consent_catalogue_from_env_value, data_dir_from_env_value,
    verification_policy_from_env_values,
};
use enrol_core::{
    CodeDispatcher, CoreConfig, DraftPersistence, EnrollmentSession, FileDraftStorage,
    FixedCodeDispatcher, InMemoryCodeDispatcher, RestoreStatus, YamlRecordSink,
};

/// Main entry point for the enrolment service
///
/// Resolves configuration once, restores the stored draft, then serves the REST surface with
/// autosave running until Ctrl-C. On shutdown autosave is stopped and any unsaved change is
/// written.
///
/// # Environment Variables
/// - `ENROL_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `ENROL_DATA_DIR`: Root for drafts, records and photos (default: "enrolment_data")
/// - `ENROL_OTP_MAX_ATTEMPTS`, `ENROL_OTP_TTL_SECS`: verification policy
/// - `ENROL_AUTOSAVE_SECS`: autosave interval
/// - `ENROL_CONSENT_CATALOGUE`: optional consent catalogue YAML file
/// - `ENROL_DEV_OTP`: fixed development code; without it codes stay in memory
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("enrol_run=info".parse()?)
                .add_directive("enrol_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("ENROL_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = Arc::new(CoreConfig::new(
        data_dir_from_env_value(std::env::var("ENROL_DATA_DIR").ok()),
        verification_policy_from_env_values(
            std::env::var("ENROL_OTP_MAX_ATTEMPTS").ok(),
            std::env::var("ENROL_OTP_TTL_SECS").ok(),
        )?,
        autosave_interval_from_env_value(std::env::var("ENROL_AUTOSAVE_SECS").ok())?,
        consent_catalogue_from_env_value(std::env::var("ENROL_CONSENT_CATALOGUE").ok())?,
    )?);

    let dispatcher: Arc<dyn CodeDispatcher> = match std::env::var("ENROL_DEV_OTP") {
        Ok(code) if !code.trim().is_empty() => {
            tracing::warn!("using fixed development verification code");
            Arc::new(FixedCodeDispatcher::new(code.trim()))
        }
        _ => {
            tracing::warn!("no code delivery gateway configured; codes are held in memory only");
            Arc::new(InMemoryCodeDispatcher::new())
        }
    };

    let storage = FileDraftStorage::new(&cfg.drafts_dir())?;
    let (session, status) = EnrollmentSession::start(
        cfg.clone(),
        dispatcher,
        DraftPersistence::new(Arc::new(storage)),
    );
    match &status {
        RestoreStatus::Fresh => tracing::info!("starting a new enrolment"),
        RestoreStatus::Resumed { position, .. } => {
            tracing::info!(position = position.position(), "resuming stored enrolment")
        }
        RestoreStatus::Discarded { reason } => {
            tracing::warn!(%reason, "stored enrolment discarded; starting a new one")
        }
    }

    let session = Arc::new(Mutex::new(session));
    let sink = Arc::new(YamlRecordSink::new(&cfg.records_dir()));
    let state = AppState::new(cfg.clone(), session.clone(), sink);
    state.ensure_autosave().await;

    tracing::info!("++ Starting enrolment REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.stop_autosave().await;
    let mut session = session.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(Err(e)) = session.autosave() {
        tracing::warn!(error = %e, "final draft save failed");
    }
    tracing::info!("-- enrolment service stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
    }
}
