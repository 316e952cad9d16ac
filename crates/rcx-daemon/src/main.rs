// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use rcx_core::{License, LicenseKey};
use rcx_daemon::state::AppState;
use rcx_secrets::{InProcessSecretBroker, SecretBroker};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rcx-daemon", version, about = "Rule engine job orchestration control plane")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8088")]
    bind: String,

    /// On-disk settings overlay (see `rcx_config::load_settings`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for the filesystem-backed record and blob stores.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Max requests accepted per client-visible minute.
    #[arg(long, default_value_t = 600)]
    rate_limit_per_minute: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = rcx_config::load_settings(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("loading runtime settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("rcx={}", settings.log_level)))
        .init();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("create data dir {}", args.data_dir.display()))?;

    let secrets: Box<dyn SecretBroker> = Box::new(InProcessSecretBroker::new());
    let identity_key_ref = secrets
        .seal("development-signing-key")
        .context("sealing runtime identity key")?;

    let license = License {
        license_key: LicenseKey::new("development"),
        customer_id: "development".into(),
        allowed_rulesets: Default::default(),
        rule_quota: u32::MAX,
        job_quota_per_period: 10_000,
        valid_from: Utc::now() - ChronoDuration::days(1),
        valid_until: Utc::now() + ChronoDuration::days(365),
        signing_algorithm: "sha256-keyed".into(),
        signing_key_id: "development".into(),
        activations: BTreeMap::new(),
    };

    let state = Arc::new(
        AppState::open_fs(
            &args.data_dir,
            license,
            secrets,
            identity_key_ref,
            settings.allow_simultaneous_jobs_per_tenant,
            settings.policy_evaluator_command.clone(),
            settings.worker_timeout_secs,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("opening filesystem-backed record stores")?,
    );

    tokio::spawn(run_background_sweeps(Arc::clone(&state), settings.tenant_slot_ttl_secs));

    let app = rcx_daemon::router(state, args.rate_limit_per_minute);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(target: "rcx.daemon.startup", bind = %args.bind, data_dir = %args.data_dir.display(), "rcx-daemon listening");

    axum::serve(listener, app).await.context("serve")
}

/// Every minute: fire due scheduled jobs and reclaim tenant slots whose
/// holder has gone silent past `tenant_slot_ttl_secs`. The one-shot CLI
/// equivalents (`rcx job scheduled tick`) exist for operators without a
/// running daemon; this is what keeps both ticking in production.
async fn run_background_sweeps(state: Arc<AppState>, tenant_slot_ttl_secs: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        match rcx_daemon::scheduler::tick(&state, Utc::now()) {
            Ok(report) if !report.fired.is_empty() || !report.submission_failures.is_empty() => {
                info!(target: "rcx.daemon.scheduler", fired = report.fired.len(), failures = report.submission_failures.len(), "scheduler tick");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(target: "rcx.daemon.scheduler", error = %e, "scheduler tick failed"),
        }
        match rcx_daemon::scheduler::reclaim_expired_slots(&state, tenant_slot_ttl_secs as i64) {
            Ok(0) => {}
            Ok(n) => info!(target: "rcx.daemon.janitor", reclaimed = n, "tenant slots reclaimed"),
            Err(e) => tracing::error!(target: "rcx.daemon.janitor", error = %e, "slot reclaim sweep failed"),
        }
    }
}
