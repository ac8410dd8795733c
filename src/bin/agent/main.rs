mod brain;
mod dom;
mod face;
mod hands;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use task_agent::actions::ActionRegistry;
use task_agent::config::EngineConfig;
use task_agent::interactive::{InteractiveRunner, MAX_SESSION_IDLE, SWEEP_INTERVAL, SessionStore};
use task_agent::logging;
use task_agent::oracle::DecisionOracle;
use task_agent::process::ProcessManager;
use task_agent::reporter::{ChannelReporter, LogReporter, ProgressEvent, ProgressReporter};
use task_agent::runner::TaskRunner;
use task_agent::types::RunResult;

use brain::OpenAiOracle;
use face::UiCommand;
use hands::ChromePage;

const UI_PORTS: std::ops::Range<u16> = 3000..3010;

#[derive(Parser)]
#[command(name = "agent", version, about = "Plan and execute tasks in a browser and a shell")]
struct Cli {
    /// Launch Chrome without a window.
    #[arg(long, global = true)]
    headless: bool,
    /// Shell and process actions only.
    #[arg(long, global = true)]
    no_browser: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the web UI and run tasks submitted from it.
    Serve,
    /// Run one task and print the result as JSON.
    Run {
        task: String,
        /// Let the oracle drive tool calls and ask questions on stdin.
        #[arg(long)]
        interactive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init("info,task_agent=info");
    let cli = Cli::parse();

    let config = EngineConfig::from_env().context("load engine config")?;
    let brain = OpenAiOracle::from_env()?;
    info!(model = brain.model(), "oracle configured");
    let oracle: Arc<dyn DecisionOracle> = Arc::new(brain);
    let processes = ProcessManager::default();

    let page = if cli.no_browser {
        None
    } else {
        let headless = cli.headless;
        let page = tokio::task::spawn_blocking(move || ChromePage::launch(headless))
            .await
            .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
        Some(Arc::new(page))
    };

    let mut registry = ActionRegistry::new(config, processes.clone()).with_oracle(oracle.clone());
    if let Some(page) = &page {
        registry = registry.with_page(page.clone());
    }
    let registry = Arc::new(registry);

    let on_interrupt = processes.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let stopped = on_interrupt.shutdown().await;
            info!(stopped, "interrupted, background processes stopped");
            std::process::exit(130);
        }
    });

    let outcome = match cli.command {
        Command::Serve => serve(oracle, registry, page, processes.clone()).await,
        Command::Run { task, interactive } => run_once(oracle, registry, &task, interactive).await,
    };

    let stopped = processes.shutdown().await;
    if stopped > 0 {
        info!(stopped, "stopped background processes");
    }
    outcome
}

async fn run_once(
    oracle: Arc<dyn DecisionOracle>,
    registry: Arc<ActionRegistry>,
    task: &str,
    interactive: bool,
) -> Result<()> {
    let reporter: Arc<dyn ProgressReporter> = Arc::new(LogReporter);
    let result = if interactive {
        let runner = InteractiveRunner::new(oracle, registry, reporter, SessionStore::default());
        let mut result = runner.start(task).await;
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let (Some(question), Some(session_id)) = (result.question.clone(), result.session_id.clone()) {
            eprintln!("{question}");
            eprint!("> ");
            let Some(answer) = stdin.next_line().await? else {
                break;
            };
            result = runner.resume(&session_id, answer.trim()).await;
        }
        result
    } else {
        TaskRunner::new(oracle, registry, reporter).run(task).await
    };
    print_result(&result)
}

fn print_result(result: &RunResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if result.success {
        Ok(())
    } else {
        Err(anyhow!(result.summary.clone()))
    }
}

/// Fans progress out to the web UI and the log.
struct UiReporter {
    channel: ChannelReporter,
}

impl ProgressReporter for UiReporter {
    fn on_progress(&self, message: &str) {
        LogReporter.on_progress(message);
        self.channel.on_progress(message);
    }

    fn on_event(&self, event: &ProgressEvent) {
        LogReporter.on_event(event);
        self.channel.on_event(event);
    }
}

async fn serve(
    oracle: Arc<dyn DecisionOracle>,
    registry: Arc<ActionRegistry>,
    page: Option<Arc<ChromePage>>,
    processes: ProcessManager,
) -> Result<()> {
    let mut face = face::start_server(processes, UI_PORTS).await?;
    let reporter = Arc::new(UiReporter {
        channel: ChannelReporter::new(face.events.clone()),
    });
    let sessions = SessionStore::default();
    let sweeper = sessions.spawn_sweeper(SWEEP_INTERVAL, MAX_SESSION_IDLE);
    let runner = InteractiveRunner::new(oracle, registry, reporter, sessions);
    info!(port = face.port, "ready for tasks");

    while let Some(command) = face.commands.recv().await {
        match command {
            UiCommand::Task(task) => {
                if let Some(page) = &page {
                    let page = page.clone();
                    let opened = tokio::task::spawn_blocking(move || page.new_tab())
                        .await
                        .map_err(|e| anyhow!("tab task panicked: {e}"))?;
                    if let Err(err) = opened {
                        warn!(error = %err, "could not open a fresh tab, reusing the current one");
                    }
                }
                let result = runner.start(&task).await;
                info!(success = result.success, summary = %result.summary, "task returned");
            }
            UiCommand::Answer { session_id, answer } => {
                let result = runner.resume(&session_id, &answer).await;
                info!(success = result.success, summary = %result.summary, "session returned");
            }
        }
    }

    sweeper.abort();
    Ok(())
}
