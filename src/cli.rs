use crate::aggregator::{self, AggregatorOptions, DashboardStatus, MalformedPolicy};
use crate::config::{self, Config};
use crate::logging::ndjson;
use crate::record::TelemetryRecord;
use crate::registry::{
    FileRegistrySource, RegistryCache, ResolutionOutcome, resolve as resolve_registry,
};
use crate::store::{AppendOnlyRemoteLog, Layout};
use crate::store::fs::FsRemoteLog;
use crate::store::git::GitRemoteLog;
use crate::validator::{ValidatorOptions, validate_tree};
use crate::writer::{AppendOutcome, LogWriter, WriterPolicy};
use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_TELEMETRY_ROOT: &str = "TELEMETRY_ROOT";
const ENV_DASHBOARD_ROOT: &str = "DASHBOARD_ROOT";
const ENV_TELEMETRY_REPO: &str = "TELEMETRY_REPO";
const ENV_TELEMETRY_BRANCH: &str = "TELEMETRY_BRANCH";

#[derive(Parser, Debug)]
#[command(name = "opslog", version)]
#[command(
    about = "Append-only operational telemetry pipeline",
    long_about = "opslog emits structured telemetry records into a shared append-only log, validates the log tree against the record schema and placement rules, and derives per-repo dashboard snapshots from it."
)]
#[command(arg_required_else_help = true)]
#[command(after_long_help = "Examples:
  opslog emit --file event.json --remote git@github.com:acme/telemetry.git
  cat event.json | opslog emit --local-root /var/lib/opslog
  opslog validate --root telemetry/v1/repos
  opslog dashboard --root telemetry/v1/repos --out dashboards
  opslog resolve acme/demo --registry-root ./registry
  opslog completion zsh > ~/.zsh/completions/_opslog
  opslog man > opslog.1")]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to config file (default: .opslog/config.toml)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Emit one telemetry record into the shared log",
        long_about = "Read a telemetry record as JSON (from --file or stdin), validate it, and append it to the configured remote log with bounded conflict retry. Best-effort by default: delivery failure is reported as a structured outcome and the exit code stays zero so callers are never broken by telemetry."
    )]
    #[command(after_long_help = "Examples:
  opslog emit --file event.json
  cat event.json | opslog emit --remote git@github.com:acme/telemetry.git --branch main
  opslog emit --file event.json --local-root /var/lib/opslog --strict")]
    Emit {
        #[arg(long, value_name = "PATH", help = "Read the record from a file instead of stdin")]
        file: Option<PathBuf>,
        #[arg(
            long,
            value_name = "URL",
            help = "Git remote of the shared telemetry repository (default: $TELEMETRY_REPO or config)"
        )]
        remote: Option<String>,
        #[arg(
            long,
            value_name = "BRANCH",
            help = "Branch to publish on (default: $TELEMETRY_BRANCH, config, or main)"
        )]
        branch: Option<String>,
        #[arg(
            long,
            value_name = "PATH",
            help = "Use a local filesystem store instead of a git remote"
        )]
        local_root: Option<PathBuf>,
        #[arg(
            long,
            value_name = "LAYOUT",
            value_parser = ["hierarchical", "flat"],
            help = "Partition layout (default: config or hierarchical)"
        )]
        layout: Option<String>,
        #[arg(long, value_name = "N", help = "Publish attempts before giving up")]
        max_retries: Option<u32>,
        #[arg(long, help = "Fail the process when the record cannot be delivered")]
        strict: bool,
        #[arg(long, value_name = "PATH", help = "Mirror the append outcome to an NDJSON file")]
        log: Option<PathBuf>,
    },
    #[command(
        about = "Validate a telemetry log tree",
        long_about = "Walk a telemetry log tree and check every record against the schema and its placement rules. All violations are collected and reported as a JSON report; an absent tree is valid and empty."
    )]
    #[command(after_long_help = "Examples:
  opslog validate --root telemetry/v1/repos
  opslog validate --root telemetry/v1/repos --layout flat
  opslog validate --root telemetry/v1/repos --no-parse-json --permissive")]
    Validate {
        #[arg(
            long,
            value_name = "PATH",
            help = "Telemetry log root (default: $TELEMETRY_ROOT or config)"
        )]
        root: Option<PathBuf>,
        #[arg(
            long,
            value_name = "LAYOUT",
            value_parser = ["hierarchical", "flat"],
            help = "Partition layout (default: config or hierarchical)"
        )]
        layout: Option<String>,
        #[arg(long, help = "Skip record contents; check layout and existence only")]
        no_parse_json: bool,
        #[arg(long, help = "Exit zero even when violations are found")]
        permissive: bool,
    },
    #[command(
        about = "Build dashboard snapshots from the telemetry log",
        long_about = "Aggregate each repo partition into a derived dashboard snapshot. With --repo the snapshot is printed to stdout; otherwise one dashboard.json per repo is written under the output directory. A repo that fails to aggregate gets an error-status dashboard without aborting the rest."
    )]
    #[command(after_long_help = "Examples:
  opslog dashboard --root telemetry/v1/repos --out dashboards
  opslog dashboard --root telemetry/v1/repos --repo demo
  opslog dashboard --root telemetry/v1/repos --out dashboards --permissive --strict-exit")]
    Dashboard {
        #[arg(
            long,
            value_name = "PATH",
            help = "Telemetry log root (default: $TELEMETRY_ROOT or config)"
        )]
        root: Option<PathBuf>,
        #[arg(
            long,
            value_name = "PATH",
            help = "Dashboard output directory (default: $DASHBOARD_ROOT or dashboards)"
        )]
        out: Option<PathBuf>,
        #[arg(long, value_name = "REPO", help = "Aggregate a single repo and print to stdout")]
        repo: Option<String>,
        #[arg(
            long,
            value_name = "LAYOUT",
            value_parser = ["hierarchical", "flat"],
            help = "Partition layout (default: config or hierarchical)"
        )]
        layout: Option<String>,
        #[arg(long, help = "Skip malformed records with a warning instead of failing the repo")]
        permissive: bool,
        #[arg(long, help = "Exit nonzero when any dashboard is not healthy")]
        strict_exit: bool,
    },
    #[command(
        about = "Resolve the telemetry repository for a target repo",
        long_about = "Look up the target repository in the routing registry (v2 preferred, v1 as legacy fallback) and print the telemetry repository it routes to. Warnings go to stderr; an unresolvable target exits with status 2."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Examples:
  opslog resolve acme/demo --registry-root ./registry
  opslog resolve acme/demo --registry-root ./registry --reference develop --json")]
    Resolve {
        #[arg(value_name = "OWNER/REPO", help = "Target repository to route")]
        target: String,
        #[arg(long, value_name = "PATH", help = "Local checkout holding the registry documents")]
        registry_root: PathBuf,
        #[arg(
            long,
            default_value = "main",
            value_name = "REF",
            help = "Published revision the registry is read at"
        )]
        reference: String,
        #[arg(long, help = "Print the full resolution as JSON")]
        json: bool,
    },
    #[command(
        about = "Generate shell completion script",
        long_about = "Generate shell completion script for your shell. Redirect output to your shell completion directory."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Examples:
  opslog completion bash > ~/.local/share/bash-completion/completions/opslog
  opslog completion zsh > ~/.zsh/completions/_opslog
  opslog completion fish > ~/.config/fish/completions/opslog.fish")]
    Completion {
        #[arg(value_enum, value_name = "SHELL", help = "Target shell")]
        shell: Shell,
    },
    #[command(
        about = "Generate a man page",
        long_about = "Generate a roff man page for opslog."
    )]
    #[command(after_long_help = "Examples:
  opslog man > opslog.1
  opslog man --output docs/opslog.1")]
    Man {
        #[arg(
            long,
            value_name = "PATH",
            help = "Write man page to file (stdout when omitted)"
        )]
        output: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_workspace_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Emit {
            file,
            remote,
            branch,
            local_root,
            layout,
            max_retries,
            strict,
            log,
        } => emit(
            &config,
            EmitArgs {
                file,
                remote,
                branch,
                local_root,
                layout,
                max_retries,
                strict,
                log,
            },
        ),
        Commands::Validate {
            root,
            layout,
            no_parse_json,
            permissive,
        } => validate(&config, root, layout, no_parse_json, permissive),
        Commands::Dashboard {
            root,
            out,
            repo,
            layout,
            permissive,
            strict_exit,
        } => dashboard(&config, root, out, repo, layout, permissive, strict_exit),
        Commands::Resolve {
            target,
            registry_root,
            reference,
            json,
        } => resolve(&target, &registry_root, &reference, json),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Commands::Man { output } => {
            let man = clap_mangen::Man::new(Cli::command());
            match output {
                Some(path) => {
                    let mut bytes = Vec::new();
                    man.render(&mut bytes)?;
                    fs::write(path, bytes)?;
                }
                None => {
                    man.render(&mut io::stdout())?;
                }
            }
            Ok(())
        }
    }
}

fn load_workspace_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return config::load_config_file(path);
    }
    let cwd = std::env::current_dir().context("determine working directory")?;
    Ok(config::load_config(&cwd)?.unwrap_or_default())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_layout(flag: Option<String>, config: &Config) -> Result<Layout> {
    match flag {
        None => Ok(config.log.layout),
        Some(raw) => {
            // The value_parser already constrains this; parse keeps the
            // mapping in one place.
            Layout::parse(&raw).ok_or_else(|| anyhow::anyhow!("unsupported layout: {raw}"))
        }
    }
}

fn resolve_log_root(flag: Option<PathBuf>, config: &Config) -> PathBuf {
    flag.or_else(|| env_var(ENV_TELEMETRY_ROOT).map(PathBuf::from))
        .unwrap_or_else(|| config.log.root.clone())
}

struct EmitArgs {
    file: Option<PathBuf>,
    remote: Option<String>,
    branch: Option<String>,
    local_root: Option<PathBuf>,
    layout: Option<String>,
    max_retries: Option<u32>,
    strict: bool,
    log: Option<PathBuf>,
}

fn emit(config: &Config, args: EmitArgs) -> Result<()> {
    let strict = args.strict || config.writer.strict;

    // Telemetry must never break the instrumented workflow: outside strict
    // mode an unreadable or invalid record is reported as a structured
    // failure outcome, and the exit code stays zero.
    let record = match read_record(&args) {
        Ok(record) => record,
        Err(err) if strict => return Err(err),
        Err(err) => {
            let outcome = AppendOutcome::Failed {
                error: format!("{err:#}"),
            };
            if let Some(log_path) = &args.log {
                ndjson::mirror_outcome(log_path, None, &outcome)?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            return Ok(());
        }
    };

    let policy = WriterPolicy {
        layout: resolve_layout(args.layout, config)?,
        max_retries: args.max_retries.unwrap_or(config.writer.max_retries).max(1),
        backoff_base: Duration::from_millis(config.writer.backoff_base_ms),
        strict,
        identity: config.writer.identity.clone(),
    };

    let backend: Option<Box<dyn AppendOnlyRemoteLog>> = if let Some(root) = &args.local_root {
        Some(Box::new(FsRemoteLog::init(root)?))
    } else {
        let remote = args
            .remote
            .or_else(|| env_var(ENV_TELEMETRY_REPO))
            .or_else(|| config.log.remote.clone());
        let branch = args
            .branch
            .or_else(|| env_var(ENV_TELEMETRY_BRANCH))
            .unwrap_or_else(|| config.log.branch.clone());
        remote.map(|remote| {
            Box::new(GitRemoteLog::new(&remote, &branch)) as Box<dyn AppendOnlyRemoteLog>
        })
    };

    let writer = match backend {
        Some(backend) => LogWriter::new(backend, policy),
        None => LogWriter::unconfigured(policy),
    };

    let outcome = writer.append(&record)?;
    if let Some(log_path) = &args.log {
        ndjson::mirror_outcome(log_path, Some(&record), &outcome)?;
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn read_record(args: &EmitArgs) -> Result<TelemetryRecord> {
    let raw = match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("read record {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("read record from stdin")?;
            buf
        }
    };
    let value: serde_json::Value =
        serde_json::from_str(raw.trim()).context("record is not valid JSON")?;
    Ok(TelemetryRecord::from_json(&value)?)
}

fn validate(
    config: &Config,
    root: Option<PathBuf>,
    layout: Option<String>,
    no_parse_json: bool,
    permissive: bool,
) -> Result<()> {
    let root = resolve_log_root(root, config);
    let options = ValidatorOptions {
        layout: resolve_layout(layout, config)?,
        parse_json: !no_parse_json,
    };
    let report = validate_tree(&root, options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ok && config.validator.fail_on_invalid && !permissive {
        bail!("{} violation(s) found under {}", report.violations.len(), root.display());
    }
    Ok(())
}

fn dashboard(
    config: &Config,
    root: Option<PathBuf>,
    out: Option<PathBuf>,
    repo: Option<String>,
    layout: Option<String>,
    permissive: bool,
    strict_exit: bool,
) -> Result<()> {
    let root = resolve_log_root(root, config);
    let options = AggregatorOptions {
        layout: resolve_layout(layout, config)?,
        on_malformed: if permissive {
            MalformedPolicy::SkipAndNote
        } else {
            MalformedPolicy::Fail
        },
    };

    if let Some(repo) = repo {
        let snapshot = aggregator::aggregate(&root, &repo, options);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        if strict_exit && !status_is_ok(snapshot.status) {
            bail!("dashboard for {repo} is {}", status_name(snapshot.status));
        }
        return Ok(());
    }

    let out = out
        .or_else(|| env_var(ENV_DASHBOARD_ROOT).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("dashboards"));
    let built = aggregator::build_all(&root, &out, options)?;
    for (repo, snapshot) in &built {
        eprintln!("{repo}: {}", status_name(snapshot.status));
    }
    // An empty partition is fine under --strict-exit; bad telemetry is not.
    let failing: Vec<&str> = built
        .iter()
        .filter(|(_, s)| !status_is_ok(s.status))
        .map(|(repo, _)| repo.as_str())
        .collect();
    if strict_exit && !failing.is_empty() {
        bail!("failing dashboards: {}", failing.join(", "));
    }
    Ok(())
}

fn status_is_ok(status: DashboardStatus) -> bool {
    matches!(status, DashboardStatus::Healthy | DashboardStatus::NoTelemetry)
}

fn status_name(status: DashboardStatus) -> &'static str {
    match status {
        DashboardStatus::NoTelemetry => "no-telemetry",
        DashboardStatus::Healthy => "healthy",
        DashboardStatus::InvalidTelemetry => "invalid-telemetry",
        DashboardStatus::Error => "error",
    }
}

fn resolve(target: &str, registry_root: &Path, reference: &str, json: bool) -> Result<()> {
    let source = FileRegistrySource::new(registry_root);
    let mut cache = RegistryCache::new();
    let resolution = resolve_registry(&mut cache, &source, reference, target)?;

    for warning in &resolution.warnings {
        eprintln!("warning: {warning}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
    } else if let Some(telemetry_repo) = &resolution.telemetry_repo {
        // Machine-readable: the routed telemetry repo, nothing else.
        println!("{telemetry_repo}");
    }

    if resolution.outcome == ResolutionOutcome::Unresolvable {
        for reason in &resolution.reasons {
            eprintln!("error: {reason}");
        }
        std::process::exit(2);
    }
    Ok(())
}
