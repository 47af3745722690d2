use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use quarry_auth::{build_access_mode, build_auth_chain, AccessMode, OauthConfig};
use quarry_cluster::{Coordinator, DependentNode, LocalTransport, NodeState};
use quarry_core::ReconcileError;
use quarry_persist::{AppliedRecord, SqliteStore, Store};
use quarry_reconcile::{ArtifactSink, FsSink, ReconcilePlan, Reconciler};
use quarry_secrets::FileSecretStore;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "quarryctl", version, about = "Quarry catalog configuration reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Base state directory (catalog/ and conf/ live underneath)
    #[arg(long = "state-dir", global = true, env = "QUARRY_STATE_DIR", default_value = "/var/lib/quarry")]
    state_dir: PathBuf,

    /// Directory the file-backed secret store reads {id}.json bundles from
    #[arg(long = "secrets-dir", global = true, env = "QUARRY_SECRETS_DIR", default_value = "/var/lib/quarry/secrets")]
    secrets_dir: PathBuf,

    /// Node name recorded with applied sets
    #[arg(long = "node", global = true, env = "QUARRY_NODE", default_value = "coordinator")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a declarative catalog spec
    Apply {
        /// Spec document (catalogs + backends + certs)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Compute the plan without writing anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show what applying a spec would change
    Diff {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Remove one catalog by name
    Remove { name: String },
    /// Show the currently applied set
    Status,
    /// Ask the engine supervisor for a restart
    Restart,
    /// Deliver the applied set to dependent worker directories
    Propagate {
        /// Coordinator discovery endpoint advertised to dependents
        #[arg(long = "discovery-uri")]
        discovery_uri: String,
        /// One state directory per dependent; the directory name is the node name
        #[arg(long = "worker-dir", required = true)]
        worker_dirs: Vec<PathBuf>,
    },
    /// Materialize the authentication chain and report the access mode
    Auth {
        /// Static user file (`user:password` lines)
        #[arg(long = "users-file")]
        users_file: Option<PathBuf>,
        #[arg(long = "oauth-issuer", env = "QUARRY_OAUTH_ISSUER")]
        oauth_issuer: Option<String>,
        #[arg(long = "oauth-client-id", env = "QUARRY_OAUTH_CLIENT_ID")]
        oauth_client_id: Option<String>,
        #[arg(long = "oauth-client-secret", env = "QUARRY_OAUTH_CLIENT_SECRET", hide_env_values = true)]
        oauth_client_secret: Option<String>,
        /// An external authorization engine is expected to be related
        #[arg(long = "policy-expected", action = ArgAction::SetTrue)]
        policy_expected: bool,
        /// The external authorization engine is reachable right now
        #[arg(long = "policy-active", action = ArgAction::SetTrue)]
        policy_active: bool,
        /// Default access when no external engine governs
        #[arg(long = "default-access", value_enum, default_value_t = DefaultAccess::None)]
        default_access: DefaultAccess,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DefaultAccess {
    All,
    None,
}

fn init_tracing() {
    let env = std::env::var("QUARRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("QUARRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid QUARRY_METRICS_ADDR; expected host:port");
        }
    }
}

struct Dirs {
    catalog: PathBuf,
    conf: PathBuf,
}

fn dirs(state_dir: &std::path::Path) -> Dirs {
    Dirs { catalog: state_dir.join("catalog"), conf: state_dir.join("conf") }
}

/// Seed the reconciler with the last set this node successfully applied, so
/// the first pass after a process restart diffs instead of re-applying.
fn warm_reconciler(conf_dir: &std::path::Path, db: &SqliteStore, node: &str) -> Result<Reconciler> {
    let prior = db.last_applied(node)?.map(|r| r.set);
    Ok(Reconciler::new(conf_dir, prior))
}

fn print_plan(output: Output, plan: &ReconcilePlan) -> Result<()> {
    match output {
        Output::Human => {
            if plan.is_noop() {
                println!("no changes");
                return Ok(());
            }
            for name in &plan.to_add {
                println!("add     {name}");
            }
            for name in &plan.to_update {
                println!("update  {name}");
            }
            for name in &plan.to_remove {
                println!("remove  {name}");
            }
        }
        Output::Json => {
            let body = serde_json::json!({
                "add": plan.to_add,
                "update": plan.to_update,
                "remove": plan.to_remove,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

/// Per-catalog failure reporting; a multi-catalog pass never collapses into
/// one aggregate boolean.
fn print_reconcile_error(output: Output, err: &ReconcileError) {
    match (output, err) {
        (Output::Human, ReconcileError::Catalogs { failures }) => {
            for (name, cause) in failures {
                eprintln!("FAIL {name}: {cause}");
            }
        }
        (Output::Json, ReconcileError::Catalogs { failures }) => {
            let body: Vec<_> = failures
                .iter()
                .map(|(name, cause)| {
                    serde_json::json!({ "catalog": name, "error": cause.to_string() })
                })
                .collect();
            eprintln!("{}", serde_json::json!({ "failures": body }));
        }
        (Output::Human, other) => eprintln!("error: {other}"),
        (Output::Json, other) => {
            eprintln!("{}", serde_json::json!({ "error": other.to_string() }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let d = dirs(&cli.state_dir);

    match cli.command {
        Commands::Apply { file, dry_run } => {
            let spec_text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let db = SqliteStore::open_default()?;
            let reconciler = warm_reconciler(&d.conf, &db, &cli.node)?;
            let secrets = FileSecretStore::new(&cli.secrets_dir);
            let sink = FsSink::new(&d.catalog, &d.conf)?;

            match reconciler.reconcile(&spec_text, &secrets, &sink, dry_run).await {
                Ok(plan) => {
                    if !dry_run && !plan.is_noop() {
                        let applied = reconciler.applied();
                        db.put_applied(AppliedRecord {
                            node: cli.node.clone(),
                            fingerprint: applied.fingerprint.clone(),
                            ts: quarry_persist::now_ts(),
                            set: (*applied).clone(),
                        })?;
                    }
                    print_plan(cli.output, &plan)?;
                }
                Err(e) => {
                    error!(error = %e, "apply failed");
                    print_reconcile_error(cli.output, &e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Diff { file } => {
            let spec_text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let db = SqliteStore::open_default()?;
            let reconciler = warm_reconciler(&d.conf, &db, &cli.node)?;
            let secrets = FileSecretStore::new(&cli.secrets_dir);
            let sink = FsSink::new(&d.catalog, &d.conf)?;
            match reconciler.reconcile(&spec_text, &secrets, &sink, true).await {
                Ok(plan) => print_plan(cli.output, &plan)?,
                Err(e) => {
                    print_reconcile_error(cli.output, &e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Remove { name } => {
            let db = SqliteStore::open_default()?;
            let reconciler = warm_reconciler(&d.conf, &db, &cli.node)?;
            let sink = FsSink::new(&d.catalog, &d.conf)?;
            if reconciler.remove(&name, &sink)? {
                let applied = reconciler.applied();
                db.put_applied(AppliedRecord {
                    node: cli.node.clone(),
                    fingerprint: applied.fingerprint.clone(),
                    ts: quarry_persist::now_ts(),
                    set: (*applied).clone(),
                })?;
                println!("removed {name}");
            } else {
                eprintln!("no such catalog {name:?}");
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let db = SqliteStore::open_default()?;
            match db.last_applied(&cli.node)? {
                Some(record) => match cli.output {
                    Output::Human => {
                        println!("fingerprint {}", record.fingerprint);
                        for (name, rc) in &record.set.catalogs {
                            println!("{:<24} {}", name, rc.content_hash);
                        }
                    }
                    Output::Json => {
                        let catalogs: Vec<_> = record
                            .set
                            .catalogs
                            .iter()
                            .map(|(name, rc)| {
                                serde_json::json!({ "name": name, "hash": rc.content_hash })
                            })
                            .collect();
                        let body = serde_json::json!({
                            "fingerprint": record.fingerprint,
                            "catalogs": catalogs,
                        });
                        println!("{}", serde_json::to_string_pretty(&body)?);
                    }
                },
                None => println!("nothing applied yet"),
            }
        }
        Commands::Restart => {
            let db = SqliteStore::open_default()?;
            let fingerprint = db
                .last_applied(&cli.node)?
                .map(|r| r.fingerprint)
                .unwrap_or_default();
            let sink = FsSink::new(&d.catalog, &d.conf)?;
            sink.signal_restart(&fingerprint)?;
            println!("restart requested");
        }
        Commands::Propagate { discovery_uri, worker_dirs } => {
            let db = SqliteStore::open_default()?;
            let record = db
                .last_applied(&cli.node)?
                .context("nothing applied yet; run apply first")?;
            let msg = quarry_cluster::package(&discovery_uri, &record.set);

            let mut transport = LocalTransport::new();
            let mut names = Vec::new();
            let mut prior_fp: HashMap<String, String> = HashMap::new();
            for dir in &worker_dirs {
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context("worker dir needs a terminal path component")?;
                let wd = dirs(dir);
                let sink: Arc<dyn ArtifactSink> = Arc::new(FsSink::new(&wd.catalog, &wd.conf)?);
                // Seed each worker from its last converged set so redelivery
                // of an identical fingerprint stays a no-op across runs.
                let node = match db.last_applied(&name)? {
                    Some(rec) => {
                        prior_fp.insert(name.clone(), rec.fingerprint.clone());
                        DependentNode::restore(&name, sink, &rec.set)
                    }
                    None => DependentNode::new(&name, sink),
                };
                transport.register(name.clone(), Arc::new(Mutex::new(node)));
                names.push(name);
            }

            let coordinator = Coordinator::new(Arc::new(transport), names);
            let results = coordinator.propagate(&msg).await;
            let mut failed = false;
            for (node, outcome) in &results {
                match outcome {
                    Ok(ack) => match &ack.state {
                        NodeState::Converged { fingerprint } => {
                            if prior_fp.get(node) != Some(fingerprint) {
                                db.put_applied(AppliedRecord {
                                    node: node.clone(),
                                    fingerprint: fingerprint.clone(),
                                    ts: quarry_persist::now_ts(),
                                    set: record.set.clone(),
                                })?;
                            }
                            println!("{node}: converged {fingerprint}")
                        }
                        other => println!("{node}: {other:?}"),
                    },
                    Err(e) => {
                        failed = true;
                        eprintln!("{node}: {e}");
                    }
                }
            }
            info!(nodes = results.len(), fingerprint = %msg.fingerprint, "propagation pass done");
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Auth {
            users_file,
            oauth_issuer,
            oauth_client_id,
            oauth_client_secret,
            policy_expected,
            policy_active,
            default_access,
        } => {
            let oauth = match (oauth_issuer, oauth_client_id, oauth_client_secret) {
                (Some(issuer), Some(client_id), Some(client_secret)) => {
                    Some(OauthConfig { issuer, client_id, client_secret })
                }
                (None, None, None) => None,
                _ => anyhow::bail!(
                    "oauth needs issuer, client id and client secret together"
                ),
            };
            let users = match &users_file {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };

            let chain = build_auth_chain(&d.conf, oauth.as_ref(), users.as_deref())?;
            let sink = FsSink::new(&d.catalog, &d.conf)?;
            for (file, body) in &chain.artifacts {
                sink.write_aux(file, body)?;
            }

            let configured = match default_access {
                DefaultAccess::All => AccessMode::All,
                DefaultAccess::None => AccessMode::None,
            };
            let mode = build_access_mode(policy_expected, policy_active, configured);
            match cli.output {
                Output::Human => {
                    if chain.is_open() {
                        println!("authentication: open (no mechanisms enabled)");
                    } else {
                        println!("authentication: {}", chain.mechanisms.join(","));
                    }
                    println!("access mode: {mode:?}");
                }
                Output::Json => {
                    let body = serde_json::json!({
                        "mechanisms": chain.mechanisms,
                        "artifacts": chain.artifacts.iter().map(|(f, _)| f).collect::<Vec<_>>(),
                        "access_mode": format!("{mode:?}"),
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
            }
        }
    }
    Ok(())
}
