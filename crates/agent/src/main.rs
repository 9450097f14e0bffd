use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use dotbot_agent::channel::{ChannelClient, ExitReason, UiEvent};
use dotbot_agent::periodic::{ActivityTracker, PeriodicManager};
use dotbot_agent::reconnect::{EXIT_PERMANENT, EXIT_RESTART};
use dotbot_agent::reminders::ReminderStore;
use dotbot_agent::tools::{FilesystemTools, ToolRegistry};
use dotbot_agent::vault::Vault;
use dotbot_agent::{envfile, tasks, validate, AgentPaths};

#[derive(Parser)]
#[command(name = "dotbot-agent", about = "DotBot local agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the server and run interactively (default).
    Run,
    /// Show device registration status and exit.
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Status => status(),
    };
    std::process::exit(code);
}

fn status() -> i32 {
    let paths = AgentPaths::from_home();
    match dotbot_agent::identity::DeviceCredential::load(&paths.device_file()) {
        Some(cred) => {
            println!("device_id: {}", cred.device_id);
            println!("label:     {}", cred.label);
            println!("server:    {}", cred.server_url);
            println!("registered {}", cred.registered_at);
            0
        }
        None => {
            println!("not registered (no {}).", paths.device_file().display());
            1
        }
    }
}

async fn run() -> i32 {
    let paths = AgentPaths::from_home();
    let env = envfile::load(&paths.env_file());

    let Some(raw_server) = env.get("DOTBOT_SERVER") else {
        eprintln!("DOTBOT_SERVER is not set. Add it to {} or the environment.",
            paths.env_file().display());
        return EXIT_PERMANENT;
    };
    let server_url = envfile::normalize_server_url(raw_server);
    let device_name = env
        .get("DEVICE_NAME")
        .cloned()
        .unwrap_or_else(|| "local-agent".to_string());

    // Startup validation: personas/councils scanned, CRLF fixed, indexes
    // rebuilt. Malformed files are held for post-auth correction.
    match validate::validate(paths.root()) {
        Ok(report) => {
            if !report.malformed.is_empty() {
                for (path, error) in &report.malformed {
                    tracing::warn!(path = %path.display(), error = %error, "skipped malformed file");
                }
                eprintln!(
                    "{} persona/council file(s) failed validation; \
                     ask me to fix them once connected.",
                    report.malformed.len()
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "startup validation failed"),
    }

    // Tool registry: built-in filesystem handlers; real tool packs
    // (shell, discord, ocr) register here from their own crates.
    let fs = Arc::new(FilesystemTools::new(
        dirs::home_dir().unwrap_or_else(|| ".".into()),
    ));
    let mut registry = ToolRegistry::new();
    registry.register(fs.create_handler());
    registry.register(fs.read_handler());

    let vault = Arc::new(Vault::open(paths.vault_file()));
    let activity = Arc::new(ActivityTracker::new());
    let reminders = Arc::new(ReminderStore::open(paths.reminders_file()));

    let (ui_tx, mut ui_rx) = mpsc::channel::<UiEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match event {
                UiEvent::Line(line) => println!("{line}"),
                UiEvent::Final(text) => println!("\n{text}\n"),
            }
        }
    });

    let client = Arc::new(ChannelClient::new(
        paths.clone(),
        server_url,
        device_name,
        env.get("DOTBOT_INVITE_TOKEN").cloned(),
        env.get("DOTBOT_TEMP_DIR").cloned(),
        registry,
        vault,
        activity.clone(),
        ui_tx,
    ));

    // Periodic loops.
    let manager = PeriodicManager::new(activity.clone());
    for task in tasks::standard_tasks(&env, client.clone(), reminders, paths.clone()) {
        manager.spawn(task);
    }

    // Run-log retention.
    {
        let logs = dotbot_agent::runlog::RunLogDir::new(paths.run_logs_dir());
        let _ = logs.prune(chrono::Utc::now());
    }

    // Interactive prompt loop (rustyline is blocking — own thread, with
    // a runtime handle captured for submissions).
    {
        let client = client.clone();
        let activity = activity.clone();
        let handle = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            let Ok(mut editor) = rustyline::DefaultEditor::new() else {
                return;
            };
            loop {
                match editor.readline("you> ") {
                    Ok(line) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let _ = editor.add_history_entry(&line);
                        activity.notify_activity();
                        let client = client.clone();
                        handle.spawn(async move {
                            if !client.send_prompt(&line, "cli").await {
                                eprintln!("(not connected yet — try again in a moment)");
                            }
                        });
                    }
                    // Ctrl-C / Ctrl-D in the prompt is a clean shutdown.
                    Err(_) => std::process::exit(0),
                }
            }
        });
    }

    let reason = client.run().await;
    manager.stop();
    printer.abort();

    match reason {
        ExitReason::Normal => 0,
        ExitReason::Permanent(message) => {
            eprintln!("fatal: {message}");
            EXIT_PERMANENT
        }
        ExitReason::Restart => EXIT_RESTART,
    }
}
