use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use serde::Serialize;
use thesisflow_admin_core::filename::resolve_backup_filename;
use thesisflow_admin_core::run_log::{init_logging, start_run_log};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use thesisflow_admin_core::{
    APP_NAME, BackupApi, BackupSummary, ClientConfig, Error, HttpBackupApi, Reloader,
    RestoreWorkflow, WizardSnapshot, WorkflowOptions, inspect_backup_text,
};

#[derive(Parser)]
#[command(name = "thesisflow-admin")]
#[command(about = "ThesisFlow administration: backups and guided restore", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit one NDJSON line per wizard step change on stdout.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long, env = "THESISFLOW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
}

#[derive(Subcommand)]
enum BackupCmd {
    /// Download a fresh backup from the server.
    Create {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a backup file and show how many rows each table holds.
    Inspect { file: PathBuf },
    /// Replace all server data with the contents of a backup file.
    Restore { file: PathBuf },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(code, message)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(!cli.json);
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("THESISFLOW_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("THESISFLOW_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    let mut config = ClientConfig::load(&config_dir).map_err(map_core_err)?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    config.access_token = cli.token.filter(|t| !t.trim().is_empty());
    config.validate().map_err(map_core_err)?;

    match cli.cmd {
        Command::Backup { cmd } => match cmd {
            BackupCmd::Create { out } => {
                let out_dir = out.unwrap_or_else(|| config.backup_dir_or(&data_dir));
                backup_create(config, &out_dir, cli.json).await
            }
            BackupCmd::Inspect { file } => backup_inspect(&file, cli.json),
            BackupCmd::Restore { file } => {
                backup_restore(config, &data_dir, &file, cli.json, cli.events).await
            }
        },
    }
}

async fn backup_create(config: ClientConfig, out_dir: &Path, json: bool) -> Result<(), CliError> {
    let prefix = config.filename_prefix.clone();
    let api = HttpBackupApi::new(config).map_err(map_core_err)?;
    let download = api.create_backup().await.map_err(map_core_err)?;

    let filename = resolve_backup_filename(
        download.content_disposition.as_deref(),
        &prefix,
        chrono_now_naive(),
    );
    let path = write_backup(out_dir, &filename, &download.bytes)?;
    tracing::info!(event = "backup.saved", path = %path.display(), bytes = download.bytes.len(), "backup.saved");

    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "bytes": download.bytes.len() })
        );
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

fn backup_inspect(file: &Path, json: bool) -> Result<(), CliError> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| CliError::new("file.read_failed", format!("{}: {e}", file.display())))?;
    let summary = inspect_backup_text(&text).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "summary": summary }));
    } else {
        print_summary(&summary);
    }
    Ok(())
}

struct CliReloader {
    json: bool,
}

impl Reloader for CliReloader {
    fn reload(&self) {
        if !self.json {
            eprintln!("Recargando datos del cliente...");
        }
    }
}

async fn backup_restore(
    config: ClientConfig,
    data_dir: &Path,
    file: &Path,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _run_log = start_run_log("restore", &run_id, data_dir)
        .map_err(|e| CliError::new("log.failed", e.to_string()))?;
    tracing::info!(event = "run.start", kind = "restore", run_id = %run_id, "run.start");

    let backup_dir = config.backup_dir_or(data_dir);
    let options = WorkflowOptions::from(&config);
    let api = Arc::new(HttpBackupApi::new(config).map_err(map_core_err)?);
    let mut wf = RestoreWorkflow::new(api, options);
    if events {
        wf.wizard_mut().subscribe(move |s: &WizardSnapshot| {
            let line = serde_json::json!({ "type": "restore.step", "snapshot": s });
            println!("{line}");
        });
    }

    let result = drive_restore(&mut wf, &backup_dir, file, json).await;
    let status = if result.is_ok() { "succeeded" } else { "failed" };
    tracing::info!(event = "run.finish", kind = "restore", run_id = %run_id, status, "run.finish");
    result
}

async fn drive_restore<A: BackupApi + 'static>(
    wf: &mut RestoreWorkflow<A>,
    backup_dir: &Path,
    file: &Path,
    json: bool,
) -> Result<(), CliError> {
    let mut input = Prompt::stdin();

    wf.start().map_err(map_core_err)?;
    eprintln!(
        "ATENCIÓN: restaurar reemplaza TODOS los datos actuales (carreras, personas, \
         profesores, estudiantes, dominios, etiquetas y proyectos) con el contenido del respaldo."
    );
    if !input.confirm("¿Deseas continuar? [s/N] ")? {
        return cancelled(wf);
    }
    wf.confirm_risk().map_err(map_core_err)?;

    let backup_in_flight = Arc::new(AtomicBool::new(false));
    let _interrupts = watch_interrupts(wf.cancel_handle(), Arc::clone(&backup_in_flight));

    loop {
        eprintln!("Creando respaldo de seguridad de los datos actuales... (Ctrl-C para cancelar)");
        backup_in_flight.store(true, Ordering::SeqCst);
        let outcome = wf.run_auto_backup().await;
        backup_in_flight.store(false, Ordering::SeqCst);
        match outcome {
            Ok(pre) => {
                let path = write_backup(backup_dir, &pre.filename, &pre.bytes)?;
                eprintln!(
                    "Respaldo de seguridad guardado en {} ({})",
                    path.display(),
                    pre.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                break;
            }
            Err(Error::Cancelled) => {
                eprintln!("Restauración cancelada.");
                return Err(CliError::new("restore.cancelled", "cancelled by user"));
            }
            Err(e) => {
                eprintln!("No se pudo crear el respaldo de seguridad: {e}");
                if !input.confirm("¿Reintentar? [s/N] ")? {
                    return cancelled(wf);
                }
            }
        }
    }

    let question = wf.continue_to_challenge().map_err(map_core_err)?;
    loop {
        let answer = input.line(&format!("Verificación: {question} (vacío para cancelar) "))?;
        if answer.trim().is_empty() {
            return cancelled(wf);
        }
        match wf.submit_answer(&answer) {
            Ok(()) => break,
            Err(Error::ChallengeFailed) => {
                eprintln!("{}", wf.wizard().error().unwrap_or("respuesta incorrecta"));
            }
            Err(e) => return Err(map_core_err(e)),
        }
    }

    let summary = match wf.select_file(file).await {
        Ok(summary) => summary.clone(),
        Err(e) => {
            let err = map_core_err(e);
            let _ = wf.cancel();
            return Err(err);
        }
    };
    if json {
        println!("{}", serde_json::json!({ "summary": summary }));
    } else {
        print_summary(&summary);
    }
    wf.continue_to_confirm().map_err(map_core_err)?;

    loop {
        if !input.confirm("¿Confirmas la restauración? Esta acción no se puede deshacer. [s/N] ")? {
            return cancelled(wf);
        }
        eprintln!("Restaurando...");
        match wf.confirm_restore().await {
            Ok(()) => break,
            Err(e) => eprintln!("La restauración falló: {e}"),
        }
    }

    drop(input);

    eprintln!("Restauración completada.");
    let reloader = Arc::new(CliReloader { json });
    let timer = wf.schedule_reload(Arc::clone(&reloader)).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "restored": true, "totalRecords": summary.total_records }));
    } else {
        eprintln!(
            "La aplicación se recargará en {} s. Pulsa Enter para recargar ahora.",
            wf.options().reload_delay.as_secs_f32()
        );
    }
    await_reload(wf, reloader.as_ref(), timer, enter_pressed()).await
}

/// Waits for the armed reload timer, or reloads at once when `refresh`
/// resolves to `true` first.
async fn await_reload<A, F>(
    wf: &mut RestoreWorkflow<A>,
    reloader: &CliReloader,
    mut timer: JoinHandle<bool>,
    refresh: F,
) -> Result<(), CliError>
where
    A: BackupApi + 'static,
    F: Future<Output = bool>,
{
    tokio::select! {
        _ = &mut timer => wf.finish().map_err(map_core_err),
        true = refresh => wf.refresh_now(reloader).map_err(map_core_err),
    }
}

/// Resolves to `true` once a line is entered on stdin, `false` on EOF.
fn enter_pressed() -> impl Future<Output = bool> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let pressed = matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0);
        let _ = tx.send(pressed);
    });
    async move { rx.await.unwrap_or(false) }
}

/// Ctrl-C aborts the safety backup while it is in flight. At any other point
/// it ends the process like the default handler would.
fn watch_interrupts(token: CancellationToken, backup_in_flight: Arc<AtomicBool>) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt_backup(&token, &backup_in_flight) {
                eprintln!();
                std::process::exit(130);
            }
        }
    }))
}

fn interrupt_backup(token: &CancellationToken, backup_in_flight: &AtomicBool) -> bool {
    if !backup_in_flight.load(Ordering::SeqCst) {
        return false;
    }
    tracing::info!(event = "restore.interrupt", "restore.interrupt");
    token.cancel();
    true
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn cancelled<A: BackupApi + 'static>(wf: &mut RestoreWorkflow<A>) -> Result<(), CliError> {
    wf.cancel().map_err(map_core_err)?;
    eprintln!("Restauración cancelada.");
    Err(CliError::new("restore.cancelled", "cancelled by user"))
}

struct Prompt<R> {
    reader: R,
}

impl Prompt<std::io::StdinLock<'static>> {
    fn stdin() -> Self {
        Self {
            reader: std::io::stdin().lock(),
        }
    }
}

impl<R: BufRead> Prompt<R> {
    fn line(&mut self, prompt: &str) -> Result<String, CliError> {
        eprint!("{prompt}");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| CliError::new("input.read_failed", e.to_string()))?;
        if n == 0 {
            return Err(CliError::new("input.closed", "input closed before answering"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool, CliError> {
        let answer = self.line(prompt)?;
        Ok(is_yes(&answer))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(
        answer.trim().to_lowercase().as_str(),
        "s" | "si" | "sí" | "y" | "yes"
    )
}

fn print_summary(summary: &BackupSummary) {
    println!("Registros totales: {}", summary.total_records);
    for t in summary.restore_summary_entries() {
        println!("  {:<22} {}", t.table, t.count);
    }
}

fn write_backup(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, CliError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CliError::new("file.write_failed", format!("{}: {e}", dir.display())))?;
    let path = unique_path(dir, filename);
    std::fs::write(&path, bytes)
        .map_err(|e| CliError::new("file.write_failed", format!("{}: {e}", path.display())))?;
    Ok(path)
}

fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (filename, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn chrono_now_naive() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_CONFIG_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    home_dir().join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_DATA_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    home_dir().join(".local").join("share").join(APP_NAME)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn map_core_err(e: Error) -> CliError {
    let retryable = e.is_retryable();
    let code = match &e {
        Error::InvalidConfig { .. } => "config.invalid",
        Error::Io(_) => "file.read_failed",
        Error::Http { .. } => "backend.unavailable",
        Error::Api { .. } => "backend.error",
        Error::InvalidBackup { .. } => "backup.invalid",
        Error::ChallengeFailed => "challenge.failed",
        Error::InvalidTransition { .. } => "restore.invalid_state",
        Error::Cancelled => "restore.cancelled",
    };
    let mut err = if retryable {
        CliError::retryable(code, e.to_string())
    } else {
        CliError::new(code, e.to_string())
    };
    if let Error::Api { status, .. } = e {
        err.details = serde_json::json!({ "status": status });
    }
    err
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
