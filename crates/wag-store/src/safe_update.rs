//! Optimistic read-modify-write.
//!
//! `safe_update` reads a key, lets the caller compute a replacement, and
//! commits it only if the key's `mod_revision` is unchanged, retrying from
//! the fresh value on conflict. All mutual exclusion in the control plane
//! goes through this primitive; nothing holds locks across await points.

use crate::error::StoreError;
use crate::types::Compare;
use crate::types::Op;
use crate::types::OpResult;
use crate::types::StoreEntry;
use crate::types::Txn;
use crate::Store;

/// Outcome of a mutation callback.
pub enum Mutation<E> {
    /// Commit this value.
    Put(String),
    /// Commit this value, then surface the error to the caller anyway.
    ///
    /// Used to persist a best-effort value when post-processing noticed a
    /// non-fatal anomaly. Without this explicit opt-in a mutation error
    /// aborts before anything is written.
    PutDespite(String, E),
}

/// Compare-and-swap loop on a key's `mod_revision`.
///
/// Fails with [`StoreError::NotFound`] if the key is absent. The loop is
/// unbounded; foreground callers bound it with a timeout, the reconciler
/// runs it to completion.
pub async fn safe_update<S, F, E>(store: &S, key: &str, mut mutate: F) -> Result<u64, E>
where
    S: Store + ?Sized,
    F: FnMut(&StoreEntry) -> Result<Mutation<E>, E> + Send,
    E: From<StoreError>,
{
    let mut current = store
        .get(key)
        .await?
        .ok_or_else(|| StoreError::NotFound { key: key.to_string() })?;

    loop {
        let (new_value, deferred) = match mutate(&current)? {
            Mutation::Put(value) => (value, None),
            Mutation::PutDespite(value, err) => (value, Some(err)),
        };

        let outcome = store
            .txn(Txn {
                compares: vec![Compare::ModRevisionEquals {
                    key: key.to_string(),
                    revision: current.mod_revision,
                }],
                then_ops: vec![Op::Put {
                    key: key.to_string(),
                    value: new_value,
                }],
                else_ops: vec![Op::Get { key: key.to_string() }],
            })
            .await?;

        if outcome.succeeded {
            return match deferred {
                Some(err) => Err(err),
                None => Ok(outcome.revision),
            };
        }

        // Lost the race: restart from the value that beat us.
        current = match outcome.results.first() {
            Some(OpResult::Kvs { entries }) if !entries.is_empty() => entries[0].clone(),
            _ => return Err(StoreError::NotFound { key: key.to_string() }.into()),
        };
    }
}
