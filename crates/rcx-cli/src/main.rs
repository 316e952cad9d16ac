// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use rcx_cli::commands::build_registry;
use rcx_cli::config::{load_profile, CliProfile};
use rcx_cli::registry::CommandKey;
use rcx_core::{License, LicenseKey};
use rcx_daemon::state::AppState;
use rcx_secrets::{InProcessSecretBroker, SecretBroker};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for a failed command (unknown command, validation failure,
/// or a core-crate error).
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code for a malformed command invocation; clap itself exits 2 for
/// argument-parsing failures, this is for path-shape errors caught by hand.
const EXIT_USAGE_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "rcx", version, about = "Rule engine job orchestration command line")]
struct Cli {
    /// Command path: `<group> <verb>` or `<group> <subgroup> <verb>`,
    /// e.g. `job submit`, `job scheduled tick`, `license show`.
    #[arg(required = true, num_args = 1..)]
    path: Vec<String>,

    /// JSON payload file. Defaults to reading stdin, or `{}` if stdin is
    /// empty, when omitted.
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Operator profile file (see `rcx_cli::config::CliProfile`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for the filesystem-backed record and blob stores
    /// this invocation opens in-process. Overrides the profile's
    /// `data_dir` when set.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(format!("rcx={level}"))).init();

    match run(cli) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<serde_json::Value> {
    if cli.path == ["meta", "commands"] {
        return Ok(list_commands());
    }

    let key = command_key(&cli.path)?;
    let payload = read_payload(cli.payload.as_deref())?;

    let profile = match &cli.config {
        Some(path) => load_profile(path)?,
        None => CliProfile::default(),
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| profile.data_dir.clone());
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir {}", data_dir.display()))?;

    let settings = rcx_config::load_settings(None).map_err(|e| anyhow::anyhow!("{e}")).context("loading runtime settings")?;
    let state = open_state(&data_dir, &profile, &settings)?;
    let registry = build_registry();
    registry.dispatch(&key, &state, payload)
}

/// `rcx meta commands` needs no open store, so it's handled before the
/// record stores are wired.
fn list_commands() -> serde_json::Value {
    let registry = build_registry();
    let commands: Vec<serde_json::Value> = registry
        .iter()
        .map(|spec| serde_json::json!({ "command": spec.key.to_string(), "summary": spec.summary }))
        .collect();
    serde_json::json!({ "commands": commands })
}

fn command_key(path: &[String]) -> Result<CommandKey> {
    match path {
        [group, verb] => Ok(CommandKey::new(group.clone(), "", verb.clone())),
        [group, subgroup, verb] => Ok(CommandKey::new(group.clone(), subgroup.clone(), verb.clone())),
        _ => {
            eprintln!("usage: rcx <group> [subgroup] <verb> [--payload FILE]");
            std::process::exit(EXIT_USAGE_ERROR);
        }
    }
}

fn read_payload(path: Option<&std::path::Path>) -> Result<serde_json::Value> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading payload {}", path.display()))?,
        None => {
            let mut buf = String::new();
            if atty_is_terminal() {
                String::new()
            } else {
                std::io::stdin().read_to_string(&mut buf).context("reading payload from stdin")?;
                buf
            }
        }
    };
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&raw).context("parsing payload as JSON")
}

fn atty_is_terminal() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

fn open_state(data_dir: &std::path::Path, profile: &CliProfile, settings: &rcx_config::RuntimeSettings) -> Result<AppState> {
    let secrets: Box<dyn SecretBroker> = Box::new(InProcessSecretBroker::new());
    let identity_key_ref = secrets.seal("development-signing-key").context("sealing runtime identity key")?;
    let license = License {
        license_key: LicenseKey::new("development"),
        customer_id: profile.default_customer_id.clone().unwrap_or_else(|| "development".into()),
        allowed_rulesets: Default::default(),
        rule_quota: u32::MAX,
        job_quota_per_period: 10_000,
        valid_from: Utc::now() - ChronoDuration::days(1),
        valid_until: Utc::now() + ChronoDuration::days(365),
        signing_algorithm: "sha256-keyed".into(),
        signing_key_id: "development".into(),
        activations: BTreeMap::new(),
    };
    AppState::open_fs(
        data_dir,
        license,
        secrets,
        identity_key_ref,
        false,
        settings.policy_evaluator_command.clone(),
        settings.worker_timeout_secs,
    )
    .map_err(|e| anyhow::anyhow!("{e}"))
    .context("opening filesystem-backed record stores")
}
