use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::error;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Minimal named-event subscription primitive.
///
/// Handlers run synchronously on the emitting task, in registration order.
/// A panicking handler is logged and does not stop the handlers after it.
#[derive(Default)]
pub struct Emitter {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("lock not poisoned")
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn emit(&self, name: &str, payload: &Value) {
        // Snapshot outside the lock so handlers may register more handlers.
        let snapshot: Vec<Handler> = match self
            .handlers
            .read()
            .expect("lock not poisoned")
            .get(name)
        {
            Some(list) => list.clone(),
            None => return,
        };

        for handler in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(event = name, panic = %msg, "event handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().expect("lock not poisoned");
        f.debug_struct("Emitter")
            .field("events", &handlers.len())
            .finish()
    }
}
