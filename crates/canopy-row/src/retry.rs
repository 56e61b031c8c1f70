//! Transactional retry.

use canopy_storage::{Database, Transaction};

use crate::error::{RowResult, RowStoreError};

/// Runs `body` in a fresh transaction and commits it, retrying rollbacks up
/// to `max_attempts` times in total.
///
/// `on_commit` runs once, after the commit that succeeded, with the body's
/// result and the commit sequence number. Errors other than a rollback are
/// returned immediately and the transaction is discarded.
pub(crate) fn run<T, B, C>(
    db: &Database,
    max_attempts: u32,
    label: &str,
    mut body: B,
    mut on_commit: C,
) -> RowResult<T>
where
    B: FnMut(&mut Transaction<'_>) -> RowResult<T>,
    C: FnMut(&mut T, u64),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut txn = db.begin();
        let outcome = body(&mut txn).and_then(|mut value| {
            txn.commit_with(|seq| on_commit(&mut value, seq))?;
            Ok(value)
        });
        match outcome {
            Ok(value) => return Ok(value),
            Err(RowStoreError::Store(source)) if source.is_retryable() => {
                if attempt >= max_attempts {
                    tracing::warn!(label = %label, attempts = attempt, "retry budget exhausted");
                    return Err(RowStoreError::TransactionFailed {
                        table: label.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                tracing::debug!(label = %label, attempt, error = %source, "retrying transaction");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use canopy_common::types::Value;
    use canopy_storage::StoreError;

    #[test]
    fn test_commits_and_notifies_once() {
        let db = Database::new();
        let mut notified = Vec::new();
        let value = run(
            &db,
            3,
            "t",
            |txn| {
                txn.put("t", Bytes::from_static(b"k"), Value::from_bytes(b"v"));
                Ok(7)
            },
            |value, _| notified.push(*value),
        )
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(notified, vec![7]);
        assert_eq!(db.tree_len("t"), 1);
    }

    #[test]
    fn test_exhausts_budget_on_conflicts() {
        let db = Database::new();
        let mut attempts = 0;
        let err = run(
            &db,
            4,
            "t",
            |_| -> RowResult<()> {
                attempts += 1;
                Err(StoreError::Rollback { tree: "t".into() }.into())
            },
            |_, _| panic!("never commits"),
        )
        .unwrap_err();
        assert_eq!(attempts, 4);
        assert!(matches!(err, RowStoreError::TransactionFailed { attempts: 4, .. }));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let db = Database::new();
        let mut attempts = 0;
        let err = run(
            &db,
            10,
            "t",
            |_| -> RowResult<()> {
                attempts += 1;
                Err(RowStoreError::no_such_table("t"))
            },
            |_, _| {},
        )
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(err.is_not_found());
    }
}
