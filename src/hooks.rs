//! Hook lifecycle around every instrumented call.
//!
//! Each call moves through `before → dispatch → after | on_error` exactly
//! once. [`Interceptor`] owns that sequence so every wrapped object (driver
//! connection, statement, SeaORM connection) runs it identically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::context::{CallContext, Context};
use crate::driver::Value;
use crate::error::{HookError, ObservedError};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

impl TxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxOutcome::Commit => "commit",
            TxOutcome::Rollback => "rollback",
        }
    }
}

/// What happens when the `after` hook fails on an otherwise successful call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookErrorPolicy {
    /// The hook error replaces the successful result.
    #[default]
    Propagate,
    /// Log a warning and return the successful result.
    LogAndContinue,
}

/// Extension points invoked around every execute / query call.
pub trait Hooks: Send + Sync {
    /// Runs before dispatch. An error aborts the call before the driver is
    /// touched.
    fn before(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<CallContext, HookError>;

    /// Runs after a successful dispatch.
    fn after(&self, call: &CallContext, query: &str, args: &[Value]) -> Result<(), HookError>;

    /// Observes a failed dispatch. Cannot change the error the caller gets.
    fn on_error(
        &self,
        _call: &CallContext,
        _err: &dyn ObservedError,
        _query: &str,
        _args: &[Value],
    ) {
    }

    /// Observes the end of a transaction, `elapsed` after it began.
    fn on_transaction_end(&self, _elapsed: Duration, _outcome: TxOutcome) {}
}

/// Runs the hook lifecycle around a dispatch.
#[derive(Clone)]
pub struct Interceptor {
    hooks: Arc<dyn Hooks>,
    after_errors: HookErrorPolicy,
}

impl Interceptor {
    pub fn new(hooks: Arc<dyn Hooks>) -> Self {
        Self {
            hooks,
            after_errors: HookErrorPolicy::default(),
        }
    }

    pub fn with_after_hook_errors(mut self, policy: HookErrorPolicy) -> Self {
        self.after_errors = policy;
        self
    }

    pub fn hooks(&self) -> &dyn Hooks {
        self.hooks.as_ref()
    }

    pub fn after_hook_errors(&self) -> HookErrorPolicy {
        self.after_errors
    }

    /// Run `dispatch` between the hooks.
    ///
    /// `dispatch` is only called when `before` succeeds, and exactly once.
    /// Dispatch errors reach the caller unchanged after `on_error` has seen
    /// them.
    pub async fn intercept<T, E, F, Fut>(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
        dispatch: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ObservedError + From<HookError>,
    {
        let call = self.hooks.before(ctx, query, args)?;

        let span = tracing::debug_span!(
            "db.query",
            db.operation = call.op().map(|op| op.as_str()).unwrap_or("unknown"),
            db.sql.table = call.table().unwrap_or(""),
        );

        match dispatch().instrument(span).await {
            Ok(value) => match self.hooks.after(&call, query, args) {
                Ok(()) => Ok(value),
                Err(err) => match self.after_errors {
                    HookErrorPolicy::Propagate => Err(err.into()),
                    HookErrorPolicy::LogAndContinue => {
                        tracing::warn!(error = %err, "after hook failed, keeping query result");
                        Ok(value)
                    }
                },
            },
            Err(err) => {
                self.hooks.on_error(&call, &err, query, args);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("after_errors", &self.after_errors)
            .finish_non_exhaustive()
    }
}
