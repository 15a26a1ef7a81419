//! Handler registry mapping queue types to the code that processes them.
//!
//! A handler receives an immutable [`JobEnvelope`](crate::job::JobEnvelope)
//! plus a [`HandlerContext`] carrying a cancellation signal and a progress
//! channel, and returns either a JSON result document or an error. Handlers
//! must be idempotent with respect to observable external effects when
//! executed up to `max_retries + 1` times; the core does not enforce this.
//!
//! The registry is populated at startup and read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::QueueConfig;
use crate::job::JobEnvelope;
use crate::Result;

/// Boxed future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

/// Type-erased task handler.
pub type TaskHandler = Arc<dyn Fn(JobEnvelope, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Execution-scoped collaborators handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    cancel: watch::Receiver<bool>,
    progress: mpsc::Sender<u8>,
}

impl HandlerContext {
    pub fn new(cancel: watch::Receiver<bool>, progress: mpsc::Sender<u8>) -> Self {
        Self { cancel, progress }
    }

    /// Reports completion percentage. Values above 100 are clamped; sends
    /// never block and may be coalesced downstream.
    pub fn report_progress(&self, pct: u8) {
        let _ = self.progress.try_send(pct.min(100));
    }

    /// True once shutdown or an admin cancel has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is signalled. Handlers that run long
    /// should select on this alongside their work.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Registration {
    handler: TaskHandler,
    config: QueueConfig,
}

/// Maps queue types to handlers and their queue configuration.
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a handler together with its queue configuration.
    ///
    /// # Panics
    ///
    /// Panics when the type is already registered; registration happens
    /// once at startup and a duplicate is a programming error.
    pub fn register<F, Fut>(&mut self, config: QueueConfig, handler: F)
    where
        F: Fn(JobEnvelope, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let name = config.name.clone();
        let erased: TaskHandler = Arc::new(move |envelope, ctx| Box::pin(handler(envelope, ctx)));
        if self
            .entries
            .insert(
                name.clone(),
                Registration {
                    handler: erased,
                    config,
                },
            )
            .is_some()
        {
            panic!("handler for type {name} already registered");
        }
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    pub fn handler(&self, job_type: &str) -> Option<TaskHandler> {
        self.entries.get(job_type).map(|r| r.handler.clone())
    }

    pub fn queue_config(&self, job_type: &str) -> Option<&QueueConfig> {
        self.entries.get(job_type).map(|r| &r.config)
    }

    pub fn queue_configs(&self) -> impl Iterator<Item = &QueueConfig> {
        self.entries.values().map(|r| &r.config)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use serde_json::json;

    fn noop_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(QueueConfig::new("email"), |_envelope, _ctx| async {
            Ok(json!({"sent": true}))
        });
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = noop_registry();
        assert!(registry.contains("email"));
        assert!(!registry.contains("image"));
        assert!(registry.handler("email").is_some());
        assert_eq!(registry.queue_config("email").unwrap().name, "email");
    }

    #[test]
    #[should_panic]
    fn test_duplicate_registration_panics() {
        let mut registry = noop_registry();
        registry.register(QueueConfig::new("email"), |_envelope, _ctx| async {
            Ok(json!({}))
        });
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let registry = noop_registry();
        let handler = registry.handler("email").unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, _progress_rx) = mpsc::channel(8);
        let ctx = HandlerContext::new(cancel_rx, progress_tx);
        let envelope = JobEnvelope {
            id: uuid::Uuid::new_v4(),
            job_type: "email".to_string(),
            priority: Priority::default(),
            payload: json!({"to": ["a@b"]}),
        };

        let result = handler(envelope, ctx).await.unwrap();
        assert_eq!(result, json!({"sent": true}));
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, _progress_rx) = mpsc::channel(8);
        let ctx = HandlerContext::new(cancel_rx, progress_tx);

        assert!(!ctx.is_cancelled());
        cancel_tx.send(true).unwrap();
        assert!(ctx.is_cancelled());
        // Resolves immediately once the flag is set.
        ctx.cancelled().await;
    }

    #[tokio::test]
    async fn test_progress_clamped_and_non_blocking() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, mut progress_rx) = mpsc::channel(2);
        let ctx = HandlerContext::new(cancel_rx, progress_tx);

        ctx.report_progress(150);
        assert_eq!(progress_rx.recv().await, Some(100));

        // A full channel drops updates instead of blocking the handler.
        ctx.report_progress(10);
        ctx.report_progress(20);
        ctx.report_progress(30);
        assert_eq!(progress_rx.recv().await, Some(10));
        assert_eq!(progress_rx.recv().await, Some(20));
    }
}
