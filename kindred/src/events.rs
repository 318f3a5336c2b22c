//! Lifecycle hooks around mutations.
//!
//! Pre handlers run before the store write and abort the operation by
//! returning an error. Post handlers run after a committed write; their
//! failures are logged and never undo the write.

use crate::driver::Document;
use crate::error::Result;
use crate::hydrate::HydratedDocument;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// Payload of a `pre<Operation>` event
#[derive(Debug)]
pub struct PreMutation<'a> {
    pub operation: Operation,
    pub model: &'a str,
    pub id: Option<&'a Value>,
    pub input: &'a Document,
    pub at: DateTime<Utc>,
}

/// Payload of a `post<Operation>` event
#[derive(Debug)]
pub struct PostMutation<'a> {
    pub operation: Operation,
    pub model: &'a str,
    pub result: &'a HydratedDocument,
    pub at: DateTime<Utc>,
}

pub type PreHandler = Arc<dyn Fn(&PreMutation<'_>) -> Result<()> + Send + Sync>;
pub type PostHandler = Arc<dyn Fn(&PostMutation<'_>) -> Result<()> + Send + Sync>;

/// Registered handlers per operation, built once at startup.
#[derive(Clone, Default)]
pub struct Hooks {
    pre: HashMap<Operation, Vec<PreHandler>>,
    post: HashMap<Operation, Vec<PostHandler>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre<F>(&mut self, operation: Operation, handler: F) -> &mut Self
    where
        F: Fn(&PreMutation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.pre.entry(operation).or_default().push(Arc::new(handler));
        self
    }

    pub fn on_post<F>(&mut self, operation: Operation, handler: F) -> &mut Self
    where
        F: Fn(&PostMutation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.post.entry(operation).or_default().push(Arc::new(handler));
        self
    }

    /// Run pre handlers in registration order; the first error aborts.
    pub fn emit_pre(&self, event: &PreMutation<'_>) -> Result<()> {
        for handler in self.pre.get(&event.operation).into_iter().flatten() {
            handler(event)?;
        }
        Ok(())
    }

    pub fn emit_post(&self, event: &PostMutation<'_>) {
        for handler in self.post.get(&event.operation).into_iter().flatten() {
            if let Err(e) = handler(event) {
                log::warn!(
                    "post{} observer failed for {}: {e}",
                    event.operation,
                    event.model
                );
            }
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &self.pre.values().map(Vec::len).sum::<usize>())
            .field("post", &self.post.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KindredError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pre_error_aborts_and_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        hooks.on_pre(Operation::Create, |_| {
            Err(KindredError::Authorization("denied".into()))
        });
        let counter = Arc::clone(&calls);
        hooks.on_pre(Operation::Create, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let input = Document::new();
        let event = PreMutation {
            operation: Operation::Create,
            model: "Person",
            id: None,
            input: &input,
            at: Utc::now(),
        };
        assert!(hooks.emit_pre(&event).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let update = PreMutation {
            operation: Operation::Update,
            ..event
        };
        assert!(hooks.emit_pre(&update).is_ok());
    }
}
