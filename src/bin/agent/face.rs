use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use task_agent::process::{ProcessManager, ProcessSnapshot};
use task_agent::reporter::ProgressEvent;

/// What the browser UI asks the agent to do.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Task(String),
    Answer { session_id: String, answer: String },
}

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<UiCommand>,
    events: broadcast::Sender<ProgressEvent>,
    processes: ProcessManager,
}

#[derive(Deserialize)]
struct TaskPayload {
    task: String,
}

#[derive(Deserialize)]
struct AnswerPayload {
    session_id: String,
    answer: String,
}

pub struct Face {
    pub commands: mpsc::Receiver<UiCommand>,
    pub events: broadcast::Sender<ProgressEvent>,
    pub port: u16,
}

/// Serve the UI on the first free port in `ports`.
pub async fn start_server(processes: ProcessManager, ports: std::ops::Range<u16>) -> Result<Face> {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (event_tx, _) = broadcast::channel(256);
    let state = Arc::new(AppState {
        commands: cmd_tx,
        events: event_tx.clone(),
        processes,
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/task", post(submit_task))
        .route("/answer", post(submit_answer))
        .route("/events", get(events))
        .route("/processes", get(list_processes))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for port in ports.clone() {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("no free port in {}..{}", ports.start, ports.end))?;
    info!(url = %format!("http://localhost:{port}"), "web UI listening");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "web UI server stopped");
        }
    });

    Ok(Face {
        commands: cmd_rx,
        events: event_tx,
        port,
    })
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskPayload>,
) -> StatusCode {
    let task = payload.task.trim().to_string();
    if task.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    debug!(%task, "task submitted");
    match state.commands.send(UiCommand::Task(task)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnswerPayload>,
) -> StatusCode {
    let command = UiCommand::Answer {
        session_id: payload.session_id,
        answer: payload.answer,
    };
    match state.commands.send(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessSnapshot>> {
    Json(state.processes.list_processes())
}

fn event_name(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::Planned { .. } => "planned",
        ProgressEvent::StepStarted { .. } => "step",
        ProgressEvent::StepFinished { .. } => "step_finished",
        ProgressEvent::Retrying { .. } => "retrying",
        ProgressEvent::Replanning { .. } => "replanning",
        ProgressEvent::Status { .. } => "status",
        ProgressEvent::Question { .. } => "question",
        ProgressEvent::Finished { .. } => "finished",
        ProgressEvent::Note { .. } => "note",
    }
}

fn to_sse(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_name(event)).data(data)
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe())
        .filter_map(|received| received.ok().map(|event| Ok(to_sse(&event))));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>task-agent</title>
<style>
  body { margin: 0; font: 14px/1.5 system-ui, sans-serif; background: #101317; color: #d8dde3; }
  main { max-width: 860px; margin: 0 auto; padding: 20px; display: grid; gap: 14px; }
  h1 { font-size: 17px; margin: 0; display: flex; gap: 8px; align-items: center; }
  #state { font-size: 12px; padding: 2px 8px; border-radius: 10px; background: #1f2a36; }
  form { display: flex; gap: 8px; }
  input { flex: 1; padding: 9px 11px; border-radius: 6px; border: 1px solid #2b3440; background: #161b21; color: inherit; }
  button { padding: 9px 14px; border: 0; border-radius: 6px; background: #3b82f6; color: #fff; cursor: pointer; }
  #log { background: #161b21; border: 1px solid #222a33; border-radius: 6px; padding: 10px; min-height: 260px; max-height: 55vh; overflow-y: auto; }
  #log div { padding: 2px 0; border-bottom: 1px solid #1c232b; }
  .ok { color: #4ade80; } .bad { color: #f87171; } .dim { color: #7c8794; } .ask { color: #facc15; }
  #question { display: none; background: #2a2410; border: 1px solid #5c4d12; border-radius: 6px; padding: 10px; }
  table { width: 100%; border-collapse: collapse; font-size: 12px; }
  td, th { text-align: left; padding: 3px 6px; border-bottom: 1px solid #222a33; }
</style>
</head>
<body>
<main>
  <h1>task-agent <span id="state">idle</span></h1>
  <form id="task-form"><input id="task" placeholder="Describe a task" autocomplete="off"><button>Run</button></form>
  <div id="question">
    <div id="question-text" class="ask"></div>
    <form id="answer-form"><input id="answer" placeholder="Your answer" autocomplete="off"><button>Answer</button></form>
  </div>
  <div id="log"></div>
  <section>
    <h1>Background processes</h1>
    <table><thead><tr><th>id</th><th>status</th><th>url</th><th>command</th></tr></thead><tbody id="procs"></tbody></table>
  </section>
</main>
<script>
const log = document.getElementById('log');
const stateEl = document.getElementById('state');
let pendingSession = null;

function line(text, cls) {
  const el = document.createElement('div');
  el.textContent = text;
  if (cls) el.className = cls;
  log.appendChild(el);
  log.scrollTop = log.scrollHeight;
}

async function post(path, body) {
  const res = await fetch(path, { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify(body) });
  if (!res.ok) line('request failed: ' + res.status, 'bad');
}

document.getElementById('task-form').onsubmit = (e) => {
  e.preventDefault();
  const input = document.getElementById('task');
  if (!input.value.trim()) return;
  line('> ' + input.value);
  post('/task', { task: input.value });
  input.value = '';
};

document.getElementById('answer-form').onsubmit = (e) => {
  e.preventDefault();
  const input = document.getElementById('answer');
  if (!pendingSession) return;
  line('> ' + input.value);
  post('/answer', { session_id: pendingSession, answer: input.value });
  pendingSession = null;
  input.value = '';
  document.getElementById('question').style.display = 'none';
};

const source = new EventSource('/events');
const on = (name, fn) => source.addEventListener(name, (e) => fn(JSON.parse(e.data)));
on('planned', (d) => line(`plan: ${d.steps} step(s)${d.fallback ? ' (fallback)' : ''}`, 'dim'));
on('step', (d) => line(`${d.number}/${d.total} ${d.description}`));
on('step_finished', (d) => line(`  ${d.success ? 'ok' : 'failed'}: ${d.detail}`, d.success ? 'ok' : 'bad'));
on('retrying', (d) => line(`retry ${d.attempt} of step ${d.number}: ${d.error}`, 'dim'));
on('replanning', (d) => line(`replanning: ${d.reason}`, 'dim'));
on('status', (d) => { stateEl.textContent = d.status; });
on('note', (d) => line(d.message, 'dim'));
on('question', (d) => {
  pendingSession = d.session_id;
  document.getElementById('question-text').textContent = d.question;
  document.getElementById('question').style.display = 'block';
  stateEl.textContent = 'waiting';
});
on('finished', (d) => { line(d.summary, d.success ? 'ok' : 'bad'); stateEl.textContent = d.success ? 'completed' : 'failed'; });

async function refreshProcesses() {
  try {
    const procs = await (await fetch('/processes')).json();
    document.getElementById('procs').innerHTML = '';
    for (const p of procs) {
      const row = document.createElement('tr');
      for (const v of [p.id, p.status, p.url || '', p.command]) {
        const cell = document.createElement('td');
        cell.textContent = v;
        row.appendChild(cell);
      }
      document.getElementById('procs').appendChild(row);
    }
  } catch (_) {}
}
refreshProcesses();
setInterval(refreshProcesses, 5000);
</script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_names_match_the_page_listeners() {
        let event = ProgressEvent::Question {
            session_id: "s1".to_string(),
            question: "Which?".to_string(),
        };
        assert_eq!(event_name(&event), "question");
        assert!(INDEX_HTML.contains("on('question'"));
        assert!(INDEX_HTML.contains("on('step_finished'"));
    }
}
