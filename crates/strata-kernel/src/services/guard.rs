//! Thread-confined guard against recursive resolution.

use crate::types::ModuleId;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolveKey {
    capability: TypeId,
    consumer: Option<ModuleId>,
}

thread_local! {
    static RESOLVING: RefCell<HashSet<ResolveKey>> = RefCell::new(HashSet::new());
}

/// Marks `(capability, consumer)` as being resolved on the current thread.
///
/// Released on drop, so the mark is cleared on every exit path of the
/// provider call.
#[derive(Debug)]
pub(super) struct ResolveGuard {
    key: ResolveKey,
}

impl ResolveGuard {
    /// Returns `None` if the pair is already being resolved on this thread.
    pub(super) fn acquire(capability: TypeId, consumer: Option<&ModuleId>) -> Option<Self> {
        let key = ResolveKey {
            capability,
            consumer: consumer.cloned(),
        };
        let inserted = RESOLVING.with(|set| set.borrow_mut().insert(key.clone()));
        inserted.then_some(Self { key })
    }
}

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        RESOLVING.with(|set| {
            set.borrow_mut().remove(&self.key);
        });
    }
}
