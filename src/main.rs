use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fieldsync::api::types::NewFormResponse;
use fieldsync::api::ListParams;
use fieldsync::config::Config;
use fieldsync::intercept::commands::{ListBeneficiaries, ListProjects, ProjectTree};
use fieldsync::AppContext;

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first cache and sync for the project management console")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Never touch the network; serve and queue everything locally
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Download everything needed to work offline
  Preload {
    /// User whose assignments are preloaded (defaults to `user_id` from the config)
    #[arg(long)]
    user: Option<String>,
    /// Clear cached entities first
    #[arg(long)]
    force: bool,
  },
  /// Push pending writes and pull fresh data
  Sync,
  /// Connectivity and sync state
  Status,
  /// Row counts and timestamps of the local cache
  Stats,
  /// Log in, online or against cached credentials (password from FIELDSYNC_PASSWORD)
  Login {
    #[arg(long)]
    email: String,
  },
  /// Forget cached credentials (all of them without an email)
  Logout {
    #[arg(long)]
    email: Option<String>,
  },
  /// List projects
  Projects {
    /// Include subprojects and activities
    #[arg(long)]
    tree: bool,
    #[arg(long)]
    project: Option<String>,
  },
  /// List beneficiaries, filtered by key=value pairs
  Beneficiaries {
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
  },
  /// Record a form response; it is queued until the server confirms it
  Submit {
    #[arg(long)]
    template: String,
    #[arg(long)]
    entity: String,
    #[arg(long, default_value = "beneficiary")]
    entity_type: String,
    /// Answers as a JSON object
    #[arg(long)]
    data: String,
  },
  /// Writes waiting for the server
  Pending,
  /// Put a mutation back at the head of the queue with a fresh retry budget
  Retry { id: String },
  /// Drop a mutation without sending it
  Discard { id: String },
  /// Wipe the local cache, pending writes and cached credentials included
  Clear,
  /// Follow connectivity and sync state until interrupted
  Watch,
}

fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
    .filter(|(k, _)| !k.is_empty())
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// Daily rolling log file in `logs_dir`.
fn log_file_writer(logs_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
  std::fs::create_dir_all(logs_dir)
    .map_err(|e| eyre!("Failed to create logs directory {}: {}", logs_dir.display(), e))?;

  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix("fieldsync")
    .filename_suffix("log")
    .build(logs_dir)
    .map_err(|e| eyre!("Failed to open log file in {}: {}", logs_dir.display(), e))?;

  Ok(tracing_appender::non_blocking(appender))
}

/// Log to stderr, and to a file in the data directory when it is writable.
fn init_logging() -> Result<Option<WorkerGuard>> {
  let file = fieldsync::data_dir().and_then(|dir| log_file_writer(&dir.join("logs")));
  let (file_layer, guard, file_error) = match file {
    Ok((writer, guard)) => (
      Some(fmt::layer().with_writer(writer).with_ansi(false)),
      Some(guard),
      None,
    ),
    Err(e) => (None, None, Some(e)),
  };

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldsync=info")))
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  if let Some(e) = file_error {
    warn!("File logging disabled: {}", e);
  }
  Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let ctx = AppContext::build(config, args.offline)?;
  ctx.init().await?;

  run(&ctx, args.command).await
}

async fn run(ctx: &AppContext, command: Command) -> Result<()> {
  match command {
    Command::Preload { user, force } => {
      let _progress = ctx.preloader.subscribe_to_progress(|p| {
        info!(percentage = p.percentage, "{} ({}/{})", p.current, p.completed, p.total);
      });
      let summary = if force {
        ctx.force_refresh(user.as_deref()).await?
      } else {
        ctx.preload_all_data(user.as_deref()).await?
      };
      print_json(&summary)
    }
    Command::Sync => print_json(&ctx.orchestrator.sync_now().await?),
    Command::Status => print_json(&ctx.orchestrator.get_state()),
    Command::Stats => print_json(&ctx.preloader.get_stats()?),
    Command::Login { email } => {
      let password = Config::get_password()?;
      let outcome = ctx.auth.login(&email, &password).await?;
      print_json(&outcome)?;
      if !outcome.success {
        return Err(eyre!("Login failed"));
      }
      Ok(())
    }
    Command::Logout { email } => {
      ctx.auth.logout();
      ctx.auth.cache().clear(email.as_deref())
    }
    Command::Projects { tree, project } => {
      if tree || project.is_some() {
        let command = match project.as_deref() {
          Some(id) => ProjectTree::for_project(id),
          None => ProjectTree::default(),
        };
        print_json(&ctx.interceptor.dispatch(&command).await?.into_inner())
      } else {
        print_json(&ctx.interceptor.dispatch(&ListProjects).await?.into_inner())
      }
    }
    Command::Beneficiaries { filters } => {
      let params = filters
        .iter()
        .fold(ListParams::new(), |params, (k, v)| params.with(k, v));
      let command = ListBeneficiaries { params };
      print_json(&ctx.interceptor.dispatch(&command).await?.into_inner())
    }
    Command::Submit {
      template,
      entity,
      entity_type,
      data,
    } => {
      let data: Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Failed to parse --data as JSON: {}", e))?;
      let submission = ctx
        .reader
        .submit_form_response(NewFormResponse {
          template_id: template,
          entity_id: entity,
          entity_type,
          data,
        })
        .await?;
      print_json(&submission)
    }
    Command::Pending => print_json(&ctx.orchestrator.queue().pending()?),
    Command::Retry { id } => {
      if !ctx.orchestrator.retry_mutation(&id)? {
        return Err(eyre!("No pending mutation with id {}", id));
      }
      print_json(&ctx.orchestrator.sync_now().await?)
    }
    Command::Discard { id } => {
      if !ctx.orchestrator.discard_mutation(&id)? {
        return Err(eyre!("No pending mutation with id {}", id));
      }
      Ok(())
    }
    Command::Clear => ctx.orchestrator.clear_cache(),
    Command::Watch => {
      let _state = ctx.orchestrator.subscribe(|state| {
        if let Ok(line) = serde_json::to_string(state) {
          println!("{}", line);
        }
      });
      let _refresh = ctx.reader.subscribe(|event| {
        info!(table = %event.table, scope = %event.scope, "Refreshed");
      });
      print_json(&ctx.orchestrator.get_state())?;
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for interrupt: {}", e))?;
      Ok(())
    }
  }
}
