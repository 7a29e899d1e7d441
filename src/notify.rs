use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::Notification;

/// Receives a notification for every fault raised inside a pipeline.
pub trait ErrorSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Reports faults through the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        error!(
            title = notification.title.as_str(),
            subtitle = notification.subtitle.as_str(),
            "{}",
            notification.message
        );
    }
}

/// Keeps notifications in memory for tests and end-of-session summaries.
///
/// A bounded sink retains only the most recent notifications but still
/// counts every one it received.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

#[derive(Debug, Default)]
struct Collected {
    recent: VecDeque<Notification>,
    total: usize,
    limit: Option<usize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collected {
                limit: Some(limit),
                ..Collected::default()
            })),
        }
    }

    /// Retained notifications, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner
            .lock()
            .map(|g| g.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of notifications received, including dropped ones.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.total).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorSink for CollectingSink {
    fn notify(&self, notification: &Notification) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total += 1;
            if guard.limit == Some(0) {
                return;
            }
            if let Some(limit) = guard.limit
                && guard.recent.len() >= limit
            {
                guard.recent.pop_front();
            }
            guard.recent.push_back(notification.clone());
        }
    }
}

/// Fans a notification out to several sinks.
#[derive(Default, Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ErrorSink for SinkSet {
    fn notify(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.notify(notification);
        }
    }
}
