//! The ambient call context.
//!
//! A [`Context`] travels with every database call. It carries the
//! cancellation signal and, inside [`crate::conn::Conn::transaction`], the
//! open transaction, so `exec`/`query` pick it up without extra parameters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::conn::Transaction;
use crate::error::{MigrateError, Result};

/// Cancellation signal plus an optional open transaction.
#[derive(Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    transaction: Option<Arc<dyn Transaction>>,
}

impl Context {
    /// A fresh context with its own cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an external token.
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            transaction: None,
        }
    }

    /// The cancellation token; cancelling it aborts in-flight statements.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels the context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`MigrateError::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    /// The transaction carried by this context.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// Whether a transaction is open in this context.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// A derived context that shares the cancellation token and carries
    /// `transaction`.
    #[must_use]
    pub fn with_transaction(&self, transaction: Arc<dyn Transaction>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            transaction: Some(transaction),
        }
    }

    /// Runs `fut` unless the context is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            res = fut => res,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}
