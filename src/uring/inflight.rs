use crate::context::Context;
use crate::errors::{Error, Result};
use parking_lot::Mutex;
use slab::Slab;
use std::any::Any;

/// One submitted operation awaiting its completion.
pub(crate) struct InflightOp {
    pub(crate) context: Context,
    // Holds iovec arrays, msghdrs, and similar marshalling structures that
    // the kernel reads from user memory until the operation completes.
    #[allow(dead_code)]
    keepalive: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for InflightOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightOp")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// The table of in-flight operations, keyed by the slab index carried in
/// each SQE's `user_data`.
///
/// Keys are reused after removal, but never while their operation is still
/// outstanding, so a CQE always resolves to the context of the submission
/// that produced it.
#[derive(Debug)]
pub(crate) struct InflightTable {
    slab: Mutex<Slab<InflightOp>>,
    capacity: usize,
}

impl InflightTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
        }
    }

    /// Inserts an operation and returns its key. Fails with
    /// [`Error::TemporarilyUnavailable`] when the table is at capacity;
    /// reaping completions frees slots.
    pub(crate) fn insert(
        &self,
        context: Context,
        keepalive: Option<Box<dyn Any + Send>>,
    ) -> Result<usize> {
        let mut slab = self.slab.lock();
        if slab.len() >= self.capacity {
            return Err(Error::TemporarilyUnavailable);
        }
        Ok(slab.insert(InflightOp { context, keepalive }))
    }

    /// Removes the operation for `key`, returning its context.
    pub(crate) fn remove(&self, key: usize) -> Option<Context> {
        self.slab.lock().try_remove(key).map(|op| op.context)
    }

    /// Clones out the context for `key` without releasing the slot, for
    /// completions that will be followed by more (`CqeFlags::MORE`).
    pub(crate) fn get_cloned(&self, key: usize) -> Option<Context> {
        self.slab.lock().get(key).map(|op| op.context.clone())
    }

    pub(crate) fn pending(&self) -> usize {
        self.slab.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_round_trip() {
        let table = InflightTable::new(4);
        let key = table
            .insert(Context::new().with_fd(9).with_value(42u32), None)
            .unwrap();
        assert_eq!(table.pending(), 1);

        let ctx = table.remove(key).unwrap();
        assert_eq!(ctx.fd(), 9);
        assert_eq!(ctx.value::<u32>(), Some(&42));
        assert_eq!(table.pending(), 0);
        assert!(table.remove(key).is_none());
    }

    #[test]
    fn test_full_table_is_unavailable() {
        let table = InflightTable::new(2);
        table.insert(Context::new(), None).unwrap();
        table.insert(Context::new(), None).unwrap();
        assert_eq!(
            table.insert(Context::new(), None).unwrap_err(),
            Error::TemporarilyUnavailable
        );
    }

    #[test]
    fn test_get_cloned_keeps_slot() {
        let table = InflightTable::new(2);
        let key = table.insert(Context::new().with_fd(3), None).unwrap();
        let ctx = table.get_cloned(key).unwrap();
        assert_eq!(ctx.fd(), 3);
        assert_eq!(table.pending(), 1);
        assert!(table.remove(key).is_some());
    }

    #[test]
    fn test_keys_are_reused_after_removal() {
        let table = InflightTable::new(2);
        let key1 = table.insert(Context::new(), None).unwrap();
        table.remove(key1).unwrap();
        let key2 = table.insert(Context::new(), None).unwrap();
        assert_eq!(key1, key2);
    }
}
