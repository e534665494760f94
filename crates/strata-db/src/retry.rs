use std::collections::HashMap;

use bson::raw::RawDocumentBuf;
use parking_lot::Mutex;

/// Identity of a retryable write: the session plus its transaction
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub session: u64,
    pub txn_number: u64,
}

/// Bookkeeping that makes retried writes idempotent: the first execution
/// records its result document; a retry with the same key returns that
/// document without touching the data again.
#[derive(Default)]
pub struct RetryRecordStore {
    records: Mutex<HashMap<RetryKey, RawDocumentBuf>>,
}

impl RetryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded result of a previous execution, if any.
    pub fn find(&self, key: RetryKey) -> Option<RawDocumentBuf> {
        self.records.lock().get(&key).cloned()
    }

    pub fn record(&self, key: RetryKey, response: RawDocumentBuf) {
        self.records.lock().insert(key, response);
    }

    /// Drop records for a finished session.
    pub fn forget_session(&self, session: u64) {
        self.records.lock().retain(|k, _| k.session != session);
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn replay_returns_recorded_response() {
        let store = RetryRecordStore::new();
        let key = RetryKey {
            session: 1,
            txn_number: 9,
        };
        assert!(store.find(key).is_none());
        store.record(key, rawdoc! { "ok": 1, "n": 3 });
        assert_eq!(store.find(key), Some(rawdoc! { "ok": 1, "n": 3 }));
    }

    #[test]
    fn keys_are_session_scoped() {
        let store = RetryRecordStore::new();
        store.record(
            RetryKey {
                session: 1,
                txn_number: 1,
            },
            rawdoc! { "ok": 1 },
        );
        assert!(
            store
                .find(RetryKey {
                    session: 2,
                    txn_number: 1
                })
                .is_none()
        );
        store.forget_session(1);
        assert!(
            store
                .find(RetryKey {
                    session: 1,
                    txn_number: 1
                })
                .is_none()
        );
    }
}
