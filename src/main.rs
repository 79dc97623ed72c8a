use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fanout_pilot::cli::{Cli, Commands, ConfigAction, OutputFormat, RunArgs, SimulationArgs};
use fanout_pilot::config::{PilotConfig, ProjectPaths};
use fanout_pilot::error::{PilotError, Result};
use fanout_pilot::external::SimulatedBackends;
use fanout_pilot::notification::Notifier;
use fanout_pilot::output::{OutputWriter, SessionSummaryOutput};
use fanout_pilot::session::{
    Backends, PaymentReceipt, SessionController, SessionId, SessionPhase, SessionRequest,
};
use fanout_pilot::storage::{FileStore, SessionStore};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let writer = OutputWriter::new(cli.output);
    match run(cli, &writer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            writer
                .display()
                .print_error(&format!("[{}] {}", e.kind(), e));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("fanout_pilot=debug")
    } else {
        EnvFilter::new("fanout_pilot=info")
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

async fn run(cli: Cli, out: &OutputWriter) -> Result<()> {
    let data_dir = cli.data_dir;

    match cli.command {
        Commands::Init => cmd_init(out, &data_dir).await,
        Commands::Run(args) => cmd_run(out, &data_dir, args).await,
        Commands::Status { session_id } => cmd_status(out, &data_dir, &session_id.into()).await,
        Commands::List => cmd_list(out, &data_dir).await,
        Commands::Resume { session_id, sim } => {
            cmd_resume(out, &data_dir, &session_id.into(), sim).await
        }
        Commands::Report { session_id, export } => {
            cmd_report(out, &data_dir, &session_id.into(), export.as_deref()).await
        }
        Commands::Checkpoints { session_id } => {
            cmd_checkpoints(out, &data_dir, &session_id.into()).await
        }
        Commands::Refund { session_id } => cmd_refund(out, &data_dir, &session_id.into()).await,
        Commands::Config { action } => cmd_config(out, &data_dir, action).await,
    }
}

/// Everything a command needs to talk to sessions in `data_dir`.
struct Workspace {
    controller: SessionController,
    sim: SimulatedBackends,
    store: Arc<FileStore>,
}

async fn open_workspace(data_dir: &Path, sim_args: &SimulationArgs) -> Result<Workspace> {
    let config = PilotConfig::load(data_dir).await?;
    let paths = ProjectPaths::new(data_dir);
    let store = Arc::new(FileStore::new(paths.clone()));
    store.init().await?;

    let notifier = Notifier::new(config.notification.clone(), Some(paths.logs_dir.clone()));
    let sim = simulated_backends(&config, sim_args);
    let controller = SessionController::new(
        config,
        Backends::from(&sim),
        Arc::clone(&store) as Arc<dyn SessionStore>,
        notifier,
    )?;

    Ok(Workspace {
        controller,
        sim,
        store,
    })
}

fn simulated_backends(config: &PilotConfig, args: &SimulationArgs) -> SimulatedBackends {
    let args = args.clone();
    SimulatedBackends::new(config.accounts.operating_account.clone(), move |router| {
        let router = router
            .with_failure_rate(args.failure_rate)
            .with_yield(args.yield_rate)
            .with_latency(Duration::from_millis(args.latency_ms));
        match args.seed {
            Some(seed) => router.with_seed(seed),
            None => router,
        }
    })
}

fn default_simulation() -> SimulationArgs {
    SimulationArgs {
        failure_rate: 0.0,
        yield_rate: rust_decimal::Decimal::ZERO,
        latency_ms: 0,
        seed: None,
    }
}

async fn cmd_init(out: &OutputWriter, data_dir: &Path) -> Result<()> {
    let paths = ProjectPaths::new(data_dir);
    let config_path = data_dir.join("config.toml");

    if config_path.exists() {
        if out.is_text() {
            out.display()
                .print_warning("fanout-pilot is already initialized here.");
        }
        return Ok(());
    }

    paths.ensure_dirs().await?;
    PilotConfig::default().save(data_dir).await?;

    if out.is_text() {
        out.display().print_success("Initialized fanout-pilot.");
        out.display()
            .print_info(&format!("Configuration: {}", config_path.display()));
        out.display()
            .print_info(&format!("Sessions: {}", paths.sessions_dir.display()));
    } else {
        out.emit_message("Initialized fanout-pilot");
    }
    Ok(())
}

async fn cmd_run(out: &OutputWriter, data_dir: &Path, args: RunArgs) -> Result<()> {
    let ws = open_workspace(data_dir, &args.sim).await?;
    let controller = &ws.controller;

    let mut request = SessionRequest::from_defaults(&controller.config().session, &args.payer);
    if let Some(total) = args.total {
        request = request.with_total(total);
    }
    if let Some(units) = args.units {
        request = request.with_unit_count(units);
    }
    let activation = args
        .activation_window
        .unwrap_or(request.activation_window_secs);
    let collection = args
        .collection_window
        .unwrap_or(request.collection_window_secs);
    request = request.with_windows(activation, collection);
    if args.min_amount.is_some() || args.max_amount.is_some() {
        let min = args.min_amount.unwrap_or(request.bounds.min);
        let max = args.max_amount.unwrap_or(request.bounds.max);
        request = request.with_bounds(min, max);
    }
    if let Some(target) = args.profit_target {
        request = request.with_profit_target(target);
    }
    if let Some(destination) = &args.destination {
        request = request.with_destination(destination);
    }
    let total = request.total;

    let id = controller.create_session(request).await?;
    if out.is_text() {
        out.display()
            .print_success(&format!("Created session: {}", id));
    }

    let payment = ws
        .sim
        .pay_in(&args.payer, total)
        .await
        .map_err(|e| PilotError::PaymentFailed {
            session_id: id.to_string(),
            reason: e.to_string(),
        })?;
    controller
        .confirm_payment(
            &id,
            PaymentReceipt::new(payment.correlation_ref, &args.payer, total),
        )
        .await?;
    controller.start_session(&id).await?;

    follow_session(out, controller, &id, args.stop_at).await?;
    finish(out, controller, &id).await
}

/// Poll status until the session ends, stopping it on `stop_at` or Ctrl-C.
async fn follow_session(
    out: &OutputWriter,
    controller: &SessionController,
    id: &SessionId,
    stop_at: Option<f64>,
) -> Result<()> {
    let bar = out.is_text().then(|| out.display().create_session_bar());
    let mut stop_requested = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !stop_requested => {
                stop_requested = true;
                if let Some(bar) = &bar {
                    bar.set_message("stopping");
                }
                request_stop(controller, id).await?;
            }
            _ = ticker.tick() => {}
        }

        let view = controller.get_session_status(id).await?;
        if let Some(bar) = &bar {
            bar.set_position(view.progress as u64);
            bar.set_message(format!("{} | {}", view.phase, view.status.message));
        }
        if view.phase.is_terminal() {
            break;
        }
        if !stop_requested
            && let Some(threshold) = stop_at
            && view.progress >= threshold
        {
            stop_requested = true;
            request_stop(controller, id).await?;
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(())
}

/// A session that ended on its own before the stop landed is not an error.
async fn request_stop(controller: &SessionController, id: &SessionId) -> Result<()> {
    match controller.stop_session(id).await {
        Ok(()) => Ok(()),
        Err(PilotError::SessionNotFound(_)) | Err(PilotError::InvalidStateTransition { .. }) => {
            tracing::debug!(session_id = %id, "Session ended before the stop request");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn finish(out: &OutputWriter, controller: &SessionController, id: &SessionId) -> Result<()> {
    let phase = controller.wait_for_terminal(id).await?;
    let report = controller.get_session_report(id).await?;

    if out.is_text() {
        match phase {
            SessionPhase::Completed => out
                .display()
                .print_success(&format!("Session {} completed", id)),
            SessionPhase::Stopped => out
                .display()
                .print_warning(&format!("Session {} stopped", id)),
            _ => out
                .display()
                .print_error(&format!("Session {} ended as {}", id, phase)),
        }
        if let Some(escalation) = controller
            .list_checkpoints(id)
            .await?
            .first()
            .and_then(|cp| cp.session.escalation.clone())
        {
            out.display().print_escalation(&escalation);
        }
    }
    out.emit_report(&report);
    if out.is_text() {
        out.emit_metrics(&controller.metrics());
    }
    Ok(())
}

async fn cmd_status(out: &OutputWriter, data_dir: &Path, id: &SessionId) -> Result<()> {
    let ws = open_workspace(data_dir, &default_simulation()).await?;
    let view = ws.controller.get_session_status(id).await?;
    out.emit_status(&view);
    Ok(())
}

async fn cmd_list(out: &OutputWriter, data_dir: &Path) -> Result<()> {
    let ws = open_workspace(data_dir, &default_simulation()).await?;
    let ids = ws.controller.list_sessions().await?;
    let views = join_all(ids.iter().map(|id| ws.controller.get_session_status(id))).await;

    let mut sessions = Vec::new();
    for (id, view) in ids.iter().zip(views) {
        match view {
            Ok(view) => sessions.push(SessionSummaryOutput::from(&view)),
            Err(e) => tracing::debug!(session_id = %id, error = %e, "Skipping unreadable session"),
        }
    }

    if out.is_text() {
        out.display().print_header("Sessions");
    }
    out.emit_sessions(&sessions);
    Ok(())
}

async fn cmd_resume(
    out: &OutputWriter,
    data_dir: &Path,
    id: &SessionId,
    sim: SimulationArgs,
) -> Result<()> {
    let ws = open_workspace(data_dir, &sim).await?;
    let checkpoint = ws
        .store
        .latest_checkpoint(id)
        .await?
        .ok_or_else(|| PilotError::CheckpointNotFound(id.to_string()))?;

    // The simulated ledger starts empty in every process.
    ws.sim
        .ledger
        .credit(ws.sim.operating_account(), checkpoint.session.total);

    ws.controller.resume_session(id).await?;
    if out.is_text() {
        out.display().print_info(&format!(
            "Resumed {} from checkpoint {} ({})",
            id, checkpoint.id, checkpoint.phase
        ));
    }

    follow_session(out, &ws.controller, id, None).await?;
    finish(out, &ws.controller, id).await
}

async fn cmd_report(
    out: &OutputWriter,
    data_dir: &Path,
    id: &SessionId,
    export: Option<&Path>,
) -> Result<()> {
    let ws = open_workspace(data_dir, &default_simulation()).await?;

    match export {
        Some(path) => {
            let json = ws.controller.export_session_report(id).await?;
            tokio::fs::write(path, json).await?;
            if out.is_text() {
                out.display()
                    .print_success(&format!("Report written to {}", path.display()));
            } else {
                out.emit_message(&format!("Report written to {}", path.display()));
            }
        }
        None => {
            let report = ws.controller.get_session_report(id).await?;
            out.emit_report(&report);
        }
    }
    Ok(())
}

async fn cmd_checkpoints(out: &OutputWriter, data_dir: &Path, id: &SessionId) -> Result<()> {
    let ws = open_workspace(data_dir, &default_simulation()).await?;
    let checkpoints = ws.controller.list_checkpoints(id).await?;
    if out.is_text() {
        out.display().print_header(&format!("Checkpoints: {}", id));
    }
    out.emit_checkpoints(&checkpoints);
    Ok(())
}

async fn cmd_refund(out: &OutputWriter, data_dir: &Path, id: &SessionId) -> Result<()> {
    let ws = open_workspace(data_dir, &default_simulation()).await?;
    if let Some(record) = ws.store.find_refund(id).await? {
        ws.sim
            .ledger
            .credit(ws.sim.operating_account(), record.amount);
    }

    let record = ws.controller.retry_refund(id).await?;
    out.emit_refund(&record);
    Ok(())
}

async fn cmd_config(out: &OutputWriter, data_dir: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = PilotConfig::load(data_dir).await?;
            match out.format() {
                OutputFormat::Text => {
                    let yaml = serde_yaml_bw::to_string(&config)?;
                    println!("{}", yaml);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&config)?;
                    println!("{}", json);
                }
            }
        }
        ConfigAction::Validate => {
            PilotConfig::load(data_dir).await?;
            if out.is_text() {
                out.display().print_success("Configuration is valid.");
            } else {
                out.emit_message("Configuration is valid");
            }
        }
        ConfigAction::Reset => {
            PilotConfig::default().save(data_dir).await?;
            if out.is_text() {
                out.display()
                    .print_success("Configuration reset to defaults.");
            }
        }
    }
    Ok(())
}
