//! Causal tracing.
//!
//! A causal trace binds every job spawned transitively from one external
//! action to a single correlation id. The current trace id lives in a
//! task-local stack: entering a trace pushes its id for the duration of the
//! wrapped future, nested traces shadow the outer one (LIFO), and job
//! submission reads the innermost active id unless the caller overrides it.

use std::cell::RefCell;
use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static CAUSE_STACK: RefCell<Vec<String>>;
}

/// Correlation id for one external action and everything it spawns.
#[derive(Debug, Clone)]
pub struct CausalTrace {
    id: String,
}

impl CausalTrace {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `fut` with this trace as the innermost active trace.
    pub async fn scope<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let id = self.id.clone();
        let already_inside = CAUSE_STACK
            .try_with(|stack| {
                stack.borrow_mut().push(id.clone());
            })
            .is_ok();

        if already_inside {
            let out = fut.await;
            CAUSE_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            out
        } else {
            CAUSE_STACK.scope(RefCell::new(vec![id]), fut).await
        }
    }
}

impl Default for CausalTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// The innermost active trace id, or None outside any trace.
pub fn current_cause_id() -> Option<String> {
    CAUSE_STACK
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten()
}
