//! Shipline CLI
//!
//! The `shipline` command delivers a change set to a hosted application and
//! reports it live only once the deployment has been verified.
//!
//! ## Commands
//!
//! - `deliver`: Commit, build, deploy and verify a change set
//! - `resume`: Continue an interrupted session from its checkpoint
//! - `sessions`: List interrupted sessions
//! - `domain`: Re-check a custom domain
//! - `classify`: Classify a build log
//! - `config`: Print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use shipline_core::telemetry::init_tracing;
use shipline_core::{
    classify_build_log, Capabilities, ChangeSet, CommandRemediator, DeliveryRequest,
    DomainBinding, FsSessionStore, GitSourceControl, HttpProber, LifecycleOrchestrator,
    LiveDeployment, NoRemediation, PlatformClient, Remediator, SessionId, ShiplineConfig,
    ShiplineError, TracingSink, WorkloadSelector, WorkspaceLocks,
};

#[derive(Parser)]
#[command(name = "shipline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deployment lifecycle orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "SHIPLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Platform API base URL
    #[arg(long, global = true, env = "SHIPLINE_PLATFORM_URL")]
    platform_url: Option<String>,

    /// Platform API bearer token
    #[arg(long, global = true, env = "SHIPLINE_PLATFORM_TOKEN", hide_env_values = true)]
    platform_token: Option<String>,

    /// Directory holding session checkpoints
    #[arg(long, global = true, env = "SHIPLINE_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Workspace repository (a git clone of the application)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit a change set and follow it until it is verified live
    Deliver {
        /// Workspace identifier; deliveries to one workspace run one at a time
        #[arg(short, long)]
        workspace: String,

        /// Change set file (JSON)
        #[arg(long)]
        changes: PathBuf,

        /// Scheduler selector of the application workload
        #[arg(short, long)]
        selector: String,

        /// Default public endpoint of the application
        #[arg(short, long)]
        endpoint: String,

        /// Custom hostname to verify after the endpoint is live
        #[arg(long, requires = "domain_token")]
        domain: Option<String>,

        /// Ownership token expected in the domain's TXT record
        #[arg(long, requires = "domain")]
        domain_token: Option<String>,

        #[command(flatten)]
        fixer: FixerArgs,
    },

    /// Continue an interrupted session
    Resume {
        /// Session ID
        id: String,

        #[command(flatten)]
        fixer: FixerArgs,
    },

    /// List interrupted sessions
    Sessions,

    /// Re-check DNS and certificate state of a custom domain
    Domain {
        /// Custom hostname
        #[arg(long)]
        hostname: String,

        /// Ownership token expected in the TXT record
        #[arg(long)]
        token: String,
    },

    /// Classify a build log into a failure reason
    Classify {
        /// Build log file
        log: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Clone)]
struct FixerArgs {
    /// Shell command that proposes corrective change sets for failed builds
    #[arg(long, env = "SHIPLINE_FIX_COMMAND")]
    fix_command: Option<String>,

    /// Seconds the fix command may run
    #[arg(long, default_value = "300")]
    fix_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Deliver {
            workspace,
            changes,
            selector,
            endpoint,
            domain,
            domain_token,
            fixer,
        } => {
            let change_set = read_change_set(changes)?;
            let domain = match (domain, domain_token) {
                (Some(host), Some(token)) => Some(DomainBinding::new(host, token)),
                _ => None,
            };
            let request = DeliveryRequest {
                workspace: workspace.clone(),
                change_set,
                selector: WorkloadSelector::new(selector),
                endpoint: endpoint.clone(),
                domain,
            };
            let orchestrator = build_orchestrator(&config, &cli.repo, fixer)?;
            cmd_deliver(&orchestrator, request, cli.json).await
        }
        Commands::Resume { id, fixer } => {
            let orchestrator = build_orchestrator(&config, &cli.repo, fixer)?;
            cmd_resume(&orchestrator, id, cli.json).await
        }
        Commands::Sessions => {
            let orchestrator = build_orchestrator(&config, &cli.repo, &FixerArgs::none())?;
            cmd_sessions(&orchestrator, cli.json).await
        }
        Commands::Domain { hostname, token } => {
            let orchestrator = build_orchestrator(&config, &cli.repo, &FixerArgs::none())?;
            cmd_domain(&orchestrator, hostname, token, cli.json).await
        }
        Commands::Classify { log } => cmd_classify(log, cli.json),
        Commands::Config => cmd_config(&config),
    }
}

impl FixerArgs {
    fn none() -> Self {
        Self {
            fix_command: None,
            fix_timeout: 300,
        }
    }
}

/// Configuration file first, then command-line and environment overrides.
fn load_config(cli: &Cli) -> Result<ShiplineConfig> {
    let mut config =
        ShiplineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = &cli.platform_url {
        config.platform.base_url = url.clone();
    }
    if let Some(token) = &cli.platform_token {
        config.platform.api_token = Some(token.clone());
    }
    if let Some(dir) = &cli.sessions_dir {
        config.sessions.dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn read_change_set(path: &Path) -> Result<ChangeSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read change set {}", path.display()))?;
    let change_set: ChangeSet = serde_json::from_str(&content)
        .with_context(|| format!("Invalid change set JSON in {}", path.display()))?;
    change_set.validate()?;
    Ok(change_set)
}

fn build_orchestrator(
    config: &ShiplineConfig,
    repo: &Path,
    fixer: &FixerArgs,
) -> Result<LifecycleOrchestrator> {
    let platform = Arc::new(PlatformClient::new(&config.platform)?);
    let remediator: Arc<dyn Remediator> = match &fixer.fix_command {
        Some(command) => Arc::new(
            CommandRemediator::new(
                vec!["sh".to_string(), "-c".to_string(), command.clone()],
                Duration::from_secs(fixer.fix_timeout),
            )
            .in_dir(repo),
        ),
        None => Arc::new(NoRemediation),
    };

    let locks = WorkspaceLocks::with_lock_dir(config.sessions.dir.join("locks"));
    Ok(LifecycleOrchestrator::with_locks(
        config,
        Capabilities {
            source: Arc::new(GitSourceControl::new(repo, &config.git)),
            builds: platform.clone(),
            workloads: platform.clone(),
            prober: Arc::new(HttpProber::new()),
            registrar: platform,
            remediator,
            store: Arc::new(FsSessionStore::new(&config.sessions.dir)),
            sink: Arc::new(TracingSink),
        },
        Arc::new(locks),
    ))
}

/// Cancel `token` on Ctrl-C so the session checkpoints and stops.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after checkpoint");
            child.cancel();
        }
    });
    token
}

async fn cmd_deliver(
    orchestrator: &LifecycleOrchestrator,
    request: DeliveryRequest,
    json: bool,
) -> Result<()> {
    info!(
        workspace = %request.workspace,
        files = request.change_set.changes.len(),
        "delivering change set"
    );
    let cancel = cancel_on_interrupt();
    let outcome = orchestrator.deliver(request, &cancel).await;
    report(outcome, json)
}

async fn cmd_resume(orchestrator: &LifecycleOrchestrator, id: &str, json: bool) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let outcome = orchestrator
        .resume(&SessionId(id.to_string()), &cancel)
        .await;
    report(outcome, json)
}

fn report(outcome: shipline_core::Result<LiveDeployment>, json: bool) -> Result<()> {
    match outcome {
        Ok(live) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&live)?);
            } else {
                print_live(&live);
            }
            Ok(())
        }
        Err(ShiplineError::Cancelled { phase }) => {
            eprintln!("Cancelled during {phase}; the session was checkpointed.");
            eprintln!("Run 'shipline sessions' to find it and 'shipline resume <id>' to continue.");
            bail!("delivery cancelled")
        }
        Err(e) => Err(e).context("Delivery did not go live"),
    }
}

fn print_live(live: &LiveDeployment) {
    println!("Session:  {}", live.session_id);
    for step in &live.narration {
        println!(
            "  {:<16} attempt {}  {}",
            step.phase.as_str(),
            step.attempt,
            step.note
        );
    }
    println!("Revision: {}", live.revision);
    println!("Live at:  {}", live.endpoint);
    if let Some(domain) = &live.domain {
        let state = if domain.is_active() {
            "active"
        } else {
            "pending DNS or certificate"
        };
        println!("Domain:   {} ({state})", domain.endpoint());
    }
    println!(
        "Attempts: {} build, {} deploy",
        live.build_attempts, live.deploy_attempts
    );
}

async fn cmd_sessions(orchestrator: &LifecycleOrchestrator, json: bool) -> Result<()> {
    let sessions = orchestrator.pending_sessions().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No interrupted sessions.");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "{}  {:<16} {}  (updated {})",
            session.id,
            session.phase().as_str(),
            session.request.workspace,
            session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn cmd_domain(
    orchestrator: &LifecycleOrchestrator,
    hostname: &str,
    token: &str,
    json: bool,
) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let binding = orchestrator
        .reverify_domain(DomainBinding::new(hostname, token), &cancel)
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&binding)?);
        return Ok(());
    }
    println!("Domain:      {}", binding.hostname);
    println!("Status:      {:?}", binding.status);
    println!("Ownership:   {:?}", binding.ownership_record);
    println!("Connection:  {:?}", binding.connection_record);
    println!("Certificate: {:?}", binding.certificate);
    Ok(())
}

fn cmd_classify(path: &Path, json: bool) -> Result<()> {
    let log = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read build log {}", path.display()))?;
    let classification = classify_build_log(&log);
    if json {
        let value = serde_json::json!({
            "reason": classification.reason,
            "fixable": classification.reason.is_fixable(),
            "evidence": classification.evidence,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Reason:   {}", classification.reason);
        println!("Fixable:  {}", classification.reason.is_fixable());
        if let Some(evidence) = &classification.evidence {
            println!("Evidence: {evidence}");
        }
    }
    Ok(())
}

fn cmd_config(config: &ShiplineConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.platform.api_token.is_some() {
        shown.platform.api_token = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_deliver_arguments_parse() {
        let cli = Cli::try_parse_from([
            "shipline",
            "--json",
            "deliver",
            "--workspace",
            "storefront",
            "--changes",
            "changes.json",
            "--selector",
            "app=storefront",
            "--endpoint",
            "https://storefront.shipline.app",
            "--fix-command",
            "./fixer.sh",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Deliver {
                workspace, fixer, ..
            } => {
                assert_eq!(workspace, "storefront");
                assert_eq!(fixer.fix_command.as_deref(), Some("./fixer.sh"));
                assert_eq!(fixer.fix_timeout, 300);
            }
            _ => panic!("expected deliver"),
        }
    }

    #[test]
    fn test_domain_requires_token() {
        let result = Cli::try_parse_from([
            "shipline",
            "deliver",
            "--workspace",
            "storefront",
            "--changes",
            "changes.json",
            "--selector",
            "app=storefront",
            "--endpoint",
            "https://storefront.shipline.app",
            "--domain",
            "shop.example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply_over_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipline.toml");
        std::fs::write(
            &path,
            "[platform]\nbase_url = \"http://file.test\"\n\n[build]\nmax_attempts = 2\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "shipline",
            "--config",
            path.to_str().unwrap(),
            "--platform-url",
            "http://flag.test",
            "--sessions-dir",
            "/tmp/shipline-sessions",
            "sessions",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.platform.base_url, "http://flag.test");
        assert_eq!(config.build.max_attempts, 2);
        assert_eq!(config.sessions.dir, PathBuf::from("/tmp/shipline-sessions"));
    }

    #[test]
    fn test_read_change_set_rejects_unreplaced_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.json");
        std::fs::write(
            &path,
            r#"{"message":"drop old","changes":[{"path":"src/old.ts","op":"delete"}]}"#,
        )
        .unwrap();
        let err = read_change_set(&path).unwrap_err();
        assert!(err.to_string().contains("no replacement"));
    }

    #[test]
    fn test_classify_reads_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        std::fs::write(&path, "error TS2304: Cannot find name 'foo'.\n").unwrap();
        assert!(cmd_classify(&path, true).is_ok());
        assert!(cmd_classify(&dir.path().join("missing.log"), false).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_wires_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShiplineConfig::default();
        config.sessions.dir = dir.path().join("sessions");
        let orchestrator = build_orchestrator(&config, dir.path(), &FixerArgs::none()).unwrap();
        assert!(orchestrator.pending_sessions().await.unwrap().is_empty());
    }
}
