//! runt-bridge: run code on an already-running Jupyter kernel.
//!
//! Attaches to the kernel described by a connection file, executes code
//! through the bridge, prints outputs on the terminal and hosts widgets in a
//! headless model store.

mod terminal;

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use clap::Parser;
use jupyter_protocol::ReplyStatus;
use kernel_bridge::config::{load_config, load_config_from};
use kernel_bridge::diagnostics::{DumpTap, LogTap, Taps};
use kernel_bridge::jupyter::load_connection_info;
use kernel_bridge::{Bridge, ExecutionOutcome, JupyterSession, WidgetModelStore};
use log::{info, warn};

use crate::terminal::TerminalSurface;

#[derive(Parser, Debug)]
#[command(name = "runt-bridge")]
#[command(about = "Run code on a running Jupyter kernel and host its widgets")]
struct Cli {
    /// Path to the kernel's connection file
    connection_file: PathBuf,

    /// Code to execute (reads from stdin if neither --code nor --file is given)
    #[arg(long, short = 'c', conflicts_with_all = ["file", "repl"])]
    code: Option<String>,

    /// Execute the contents of a file
    #[arg(long, short = 'f', conflicts_with = "repl")]
    file: Option<PathBuf>,

    /// Read and execute one line at a time
    #[arg(long)]
    repl: bool,

    /// Connection key to use instead of the one in the connection file
    #[arg(long)]
    key: Option<String>,

    /// Write every kernel message as JSON lines to this file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Settings file (default: <config dir>/runt-bridge/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print widget models known after execution
    #[arg(long)]
    widgets: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_config(),
    };
    if cli.dump.is_some() {
        config.dump_path = cli.dump.clone();
    }

    let mut taps = Taps::new().with(Arc::new(LogTap));
    if let Some(path) = &config.dump_path {
        info!("Dumping kernel messages to {}", path.display());
        taps = taps.with(Arc::new(DumpTap::create(path)?));
    }

    let connection_info = load_connection_info(&cli.connection_file, cli.key.as_deref()).await?;
    let session = JupyterSession::connect(connection_info, &config, Some(Arc::new(taps)))
        .await
        .with_context(|| format!("Failed to attach to {}", cli.connection_file.display()))?;
    if let Some(language) = session.language() {
        info!("Attached to {} kernel", language);
    }

    let store = Arc::new(WidgetModelStore::new());
    let bridge = Bridge::new(config, store.clone(), Arc::new(TerminalSurface::stdio()));
    bridge.connect(Arc::new(session));

    let succeeded = if cli.repl {
        repl(&bridge).await?
    } else {
        let code = match (&cli.code, &cli.file) {
            (Some(code), _) => code.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            (None, None) => {
                let mut buffer = String::new();
                io::stdin().read_to_string(&mut buffer)?;
                buffer
            }
        };
        run(&bridge, &code).await?
    };

    if cli.widgets {
        print_widgets(&store)?;
    }

    bridge.disconnect();
    store.clear();

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute `code` and wait for it. Returns whether the kernel replied ok.
async fn run(bridge: &Bridge, code: &str) -> anyhow::Result<bool> {
    let handle = bridge.execute(code)?;
    Ok(report(handle.wait().await))
}

fn report(outcome: ExecutionOutcome) -> bool {
    match outcome {
        ExecutionOutcome::Completed { status, .. } => status == ReplyStatus::Ok,
        ExecutionOutcome::Failed { error, .. } => {
            warn!("Execution failed: {}", error);
            false
        }
    }
}

/// Line-at-a-time loop. The typed line is the editor text the bridge runs.
async fn repl(bridge: &Bridge) -> anyhow::Result<bool> {
    let line = Arc::new(Mutex::new(String::new()));
    let editor = line.clone();
    bridge.mount_editor(Box::new(move || {
        editor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }));

    let mut all_ok = true;
    let mut count = 0;
    loop {
        count += 1;
        print!("In [{}]: ", count);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let code = input.trim();
        if code.is_empty() {
            count -= 1;
            continue;
        }

        *line.lock().unwrap_or_else(PoisonError::into_inner) = code.to_string();
        let handle = bridge.execute_current()?;
        all_ok &= report(handle.wait().await);
    }

    bridge.context().unmount_editor();
    Ok(all_ok)
}

fn print_widgets(store: &WidgetModelStore) -> anyhow::Result<()> {
    let snapshots = store.snapshots();
    if snapshots.is_empty() {
        println!("No widgets");
        return Ok(());
    }
    for snapshot in snapshots {
        println!(
            "{} {} ({}{})",
            snapshot.model_id,
            snapshot.model_name.as_deref().unwrap_or("unknown"),
            snapshot.model_module.as_deref().unwrap_or("unknown module"),
            if snapshot.live { ", live" } else { "" }
        );
        println!("  {}", serde_json::to_string(&snapshot.state)?);
    }
    Ok(())
}
