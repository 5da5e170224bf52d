//! The fetch → diff → revoke → grant protocol shared by every resource kind.
//!
//! A [`Reconciler`] holds no state between passes: each pass re-reads the
//! provider's view of the resource, so a failed pass is corrected by the next
//! one. Callers must not run two passes against the same resource at once.

use crate::{
    diff::{diff, EqualityPolicy},
    labels::{Labels, Selector},
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Result};
use std::{fmt, future::Future};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

/// Entries that carry provenance labels.
pub trait Labeled {
    fn labels(&self) -> &Labels;
}

/// Fetches and mutates the entries attached to a provider resource.
///
/// `revoke` and `grant` must be atomic: either every listed entry is applied
/// or the call fails having applied none. `fetch_state` must report unknown
/// ids as errors and must never serve cached state.
#[async_trait::async_trait]
pub trait ResourceManager: Send + Sync {
    type Entry: Clone + Labeled + Send + Sync + 'static;

    async fn fetch_state(&self, ids: &[&str]) -> Result<HashMap<String, Vec<Self::Entry>>>;

    async fn revoke(&self, id: &str, entries: Vec<Self::Entry>) -> Result<()>;

    async fn grant(&self, id: &str, entries: Vec<Self::Entry>) -> Result<()>;
}

/// Per-pass settings.
#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// Scopes which observed entries may be revoked. Entries outside the
    /// selector are left alone even when they are not desired. Defaults to
    /// matching everything.
    pub selector: Selector,

    /// Aborts the in-flight provider call when cancelled. Defaults to a token
    /// that is never cancelled.
    pub cancel: CancellationToken,
}

/// The mutations one pass will apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan<T> {
    pub revoke: Vec<T>,
    pub grant: Vec<T>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Observed state could not be read; nothing was mutated.
    #[error(transparent)]
    Fetch(anyhow::Error),

    /// Revocation failed; grants were not attempted.
    #[error(transparent)]
    Revoke(anyhow::Error),

    #[error(transparent)]
    Grant(anyhow::Error),

    /// The pass was interrupted by its cancellation token or deadline.
    #[error("reconcile cancelled")]
    Cancelled,
}

/// Runs reconcile passes for one resource kind.
#[derive(Clone, Debug)]
pub struct Reconciler<M, P> {
    manager: M,
    policy: P,
}

// === impl ReconcileOptions ===

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            selector: Selector::everything(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ReconcileOptions {
    pub fn with_selector(self, selector: Selector) -> Self {
        Self { selector, ..self }
    }

    pub fn with_cancel(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }
}

// === impl Plan ===

impl<T: Clone + Labeled> Plan<T> {
    /// Computes the entries to revoke (observed, not desired, and selected)
    /// and the entries to grant (desired, not observed).
    pub fn compute<P>(observed: &[T], desired: &[T], selector: &Selector, policy: &P) -> Self
    where
        P: EqualityPolicy<T> + ?Sized,
    {
        let revoke = diff(observed, desired, policy)
            .into_iter()
            .filter(|entry| selector.matches(entry.labels()))
            .collect();
        let grant = diff(desired, observed, policy);
        Self { revoke, grant }
    }
}

impl<T> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.revoke.is_empty() && self.grant.is_empty()
    }
}

// === impl Error ===

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// === impl Reconciler ===

impl<M, P> Reconciler<M, P>
where
    M: ResourceManager,
    P: EqualityPolicy<M::Entry> + Sync,
{
    pub fn new(manager: M, policy: P) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Converges the entries on `id` toward `desired`.
    ///
    /// Revocations are applied before grants. When the revoke call fails the
    /// grant call is skipped so stale and new entries never coexist because
    /// of a half-applied pass.
    pub async fn reconcile(
        &self,
        id: &str,
        desired: &[M::Entry],
        options: ReconcileOptions,
    ) -> Result<(), Error>
    where
        M::Entry: fmt::Display,
    {
        let ReconcileOptions { selector, cancel } = options;

        let mut states = interruptible(&cancel, self.manager.fetch_state(&[id]))
            .await?
            .map_err(Error::Fetch)?;
        let observed = states
            .remove(id)
            .ok_or_else(|| Error::Fetch(anyhow!("no state returned for {id}")))?;

        let Plan { revoke, grant } = Plan::compute(&observed, desired, &selector, &self.policy);
        if revoke.is_empty() && grant.is_empty() {
            tracing::debug!(%id, observed = observed.len(), "Already converged");
            return Ok(());
        }

        let revoked = if revoke.is_empty() {
            Ok(())
        } else {
            tracing::info!(%id, entries = %Entries(&revoke), "Revoking");
            let count = revoke.len();
            interruptible(&cancel, self.manager.revoke(id, revoke))
                .await?
                .map(|()| tracing::debug!(%id, count, "Revoked"))
                .map_err(Error::Revoke)
        };
        if let Err(error) = revoked {
            if !grant.is_empty() {
                tracing::warn!(%id, skipped = grant.len(), "Skipping grants after failed revoke");
            }
            return Err(error);
        }

        if !grant.is_empty() {
            tracing::info!(%id, entries = %Entries(&grant), "Granting");
            interruptible(&cancel, self.manager.grant(id, grant))
                .await?
                .map_err(Error::Grant)?;
        }

        Ok(())
    }
}

/// Races a provider call against cancellation. Dropping the call aborts it.
async fn interruptible<F, T>(cancel: &CancellationToken, call: F) -> Result<T, Error>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        out = call => Ok(out),
    }
}

struct Entries<'a, T>(&'a [T]);

impl<T: fmt::Display> fmt::Display for Entries<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{entry}")?;
        }
        f.write_str("]")
    }
}
