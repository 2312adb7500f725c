#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Scanning,
    Indexing,
    Indexed,
    Error,
}

impl ProgressStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Indexed | ProgressStatus::Error)
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Scanning => "scanning",
            ProgressStatus::Indexing => "indexing",
            ProgressStatus::Indexed => "indexed",
            ProgressStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub subproject: String,
    pub status: ProgressStatus,
    pub files_done: usize,
    pub files_total: usize,
    pub chunks_total: usize,
    /// Repository the event refers to, when it is repository specific
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only event log of one run; every subscriber sees the full log from the start
#[derive(Debug)]
pub struct ProgressStream {
    history: Mutex<Vec<ProgressEvent>>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressStream {
    #[inline]
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: Mutex::new(Vec::new()),
            sender,
        }
    }
}

impl ProgressStream {
    #[inline]
    pub fn publish(&self, event: ProgressEvent) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(event.clone());
        // No receivers is fine; the history keeps the event
        let _ = self.sender.send(event);
    }

    #[inline]
    pub fn subscribe(&self) -> ProgressReceiver {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        ProgressReceiver {
            backlog: history.iter().cloned().collect(),
            live: self.sender.subscribe(),
            finished: false,
        }
    }

    #[inline]
    pub fn history(&self) -> Vec<ProgressEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent event, if any
    #[inline]
    pub fn latest(&self) -> Option<ProgressEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

/// Replays the past events of a run, then follows live ones until the terminal event
#[derive(Debug)]
pub struct ProgressReceiver {
    backlog: VecDeque<ProgressEvent>,
    live: broadcast::Receiver<ProgressEvent>,
    finished: bool,
}

impl ProgressReceiver {
    /// Next event, or `None` once the terminal event has been delivered
    #[inline]
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        let event = match self.backlog.pop_front() {
            Some(event) => event,
            None => loop {
                match self.live.recv().await {
                    Ok(event) => break event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Progress subscriber lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        };

        if event.status.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }
}

/// Latest progress stream per subproject, so consumers can reconnect by name
#[derive(Debug, Default)]
pub struct ProgressHub {
    streams: Mutex<HashMap<String, Arc<ProgressStream>>>,
}

impl ProgressHub {
    /// Fresh stream for a new run, replacing the previous run's
    #[inline]
    pub fn start_run(&self, subproject: &str) -> Arc<ProgressStream> {
        let stream = Arc::new(ProgressStream::default());
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subproject.to_string(), Arc::clone(&stream));
        stream
    }

    #[inline]
    pub fn subscribe(&self, subproject: &str) -> Option<ProgressReceiver> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subproject)
            .map(|stream| stream.subscribe())
    }

    #[inline]
    pub fn latest(&self, subproject: &str) -> Option<ProgressEvent> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subproject)
            .and_then(|stream| stream.latest())
    }
}
