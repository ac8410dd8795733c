//! Progress reporting. Fire-and-forget: reporters must never block the loop.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::types::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Planned {
        steps: usize,
        fallback: bool,
    },
    StepStarted {
        number: usize,
        total: usize,
        description: String,
    },
    StepFinished {
        number: usize,
        success: bool,
        detail: String,
    },
    Retrying {
        number: usize,
        attempt: u32,
        error: String,
    },
    Replanning {
        reason: String,
    },
    Status {
        status: RunStatus,
    },
    Question {
        session_id: String,
        question: String,
    },
    Finished {
        success: bool,
        summary: String,
    },
    Note {
        message: String,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Planned { steps, fallback } => {
                let suffix = if *fallback { " (fallback)" } else { "" };
                write!(f, "Planned {steps} step(s){suffix}")
            }
            ProgressEvent::StepStarted {
                number,
                total,
                description,
            } => write!(f, "Step {number}/{total}: {description}"),
            ProgressEvent::StepFinished {
                number,
                success: true,
                detail,
            } => write!(f, "Step {number} done: {detail}"),
            ProgressEvent::StepFinished { number, detail, .. } => {
                write!(f, "Step {number} failed: {detail}")
            }
            ProgressEvent::Retrying {
                number,
                attempt,
                error,
            } => write!(f, "Retrying step {number} (attempt {attempt}): {error}"),
            ProgressEvent::Replanning { reason } => write!(f, "Replanning: {reason}"),
            ProgressEvent::Status { status } => write!(f, "Status: {status}"),
            ProgressEvent::Question { question, .. } => write!(f, "Question: {question}"),
            ProgressEvent::Finished {
                success: true,
                summary,
            } => write!(f, "Completed: {summary}"),
            ProgressEvent::Finished { summary, .. } => write!(f, "Failed: {summary}"),
            ProgressEvent::Note { message } => f.write_str(message),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, message: &str);

    /// Structured hook; defaults to the rendered message.
    fn on_event(&self, event: &ProgressEvent) {
        self.on_progress(&event.to_string());
    }
}

/// Writes progress to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn on_progress(&self, message: &str) {
        info!(target: "task_agent::progress", "{message}");
    }
}

/// Forwards events to every subscriber of a broadcast channel. Lagging or absent receivers are ignored.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&self, message: &str) {
        let _ = self.tx.send(ProgressEvent::Note {
            message: message.to_string(),
        });
    }

    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_for_humans() {
        let event = ProgressEvent::StepStarted {
            number: 2,
            total: 3,
            description: "screenshot".to_string(),
        };
        assert_eq!(event.to_string(), "Step 2/3: screenshot");
        let failed = ProgressEvent::Finished {
            success: false,
            summary: "boom".to_string(),
        };
        assert_eq!(failed.to_string(), "Failed: boom");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ProgressEvent::Replanning {
            reason: "stuck".to_string(),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "replanning");
        assert_eq!(json["reason"], "stuck");
    }

    #[tokio::test]
    async fn channel_reporter_without_receivers_does_not_fail() {
        let (tx, _) = broadcast::channel(4);
        let reporter = ChannelReporter::new(tx);
        reporter.on_progress("nobody listening");
        let mut rx = reporter.subscribe();
        reporter.on_event(&ProgressEvent::Note {
            message: "hi".to_string(),
        });
        assert_eq!(
            rx.recv().await.expect("event"),
            ProgressEvent::Note {
                message: "hi".to_string()
            }
        );
    }
}
