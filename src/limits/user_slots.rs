use crate::types::UserId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-user concurrent job counter
///
/// All mutations go through one mutex; they are a hash lookup and an
/// increment, so per-user locking would buy nothing.
#[derive(Default)]
pub struct UserSlots {
    counts: Mutex<HashMap<UserId, usize>>,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

/// A held user slot; released on drop
pub struct UserSlot {
    slots: Arc<UserSlots>,
    user_id: UserId,
}

impl UserSlot {
    /// Owner of the slot
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

impl std::fmt::Debug for UserSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSlot")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Drop for UserSlot {
    fn drop(&mut self) {
        self.slots.release(self.user_id);
    }
}

impl UserSlots {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot for `user_id` if they hold fewer than `max_slots`
    ///
    /// Never waits. Returns false when the user is at their ceiling.
    pub fn try_acquire(&self, user_id: UserId, max_slots: usize) -> bool {
        let mut counts = self.lock();
        let count = counts.entry(user_id).or_insert(0);
        if *count >= max_slots {
            if *count == 0 {
                counts.remove(&user_id);
            }
            return false;
        }
        *count += 1;
        self.acquired_total.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(user_id = %user_id, active = *count, "user slot acquired");
        true
    }

    /// Return a slot taken with [`try_acquire`](Self::try_acquire)
    ///
    /// Releasing a slot the user does not hold is a bug in the caller; it is
    /// logged and otherwise ignored so the count never goes negative.
    pub fn release(&self, user_id: UserId) {
        let mut counts = self.lock();
        match counts.get_mut(&user_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                self.released_total.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(user_id = %user_id, active = *count, "user slot released");
                if *count == 0 {
                    counts.remove(&user_id);
                }
            }
            _ => {
                tracing::error!(
                    user_id = %user_id,
                    "user slot released more times than acquired; clamping at zero"
                );
            }
        }
    }

    /// RAII form of [`try_acquire`](Self::try_acquire)
    pub fn try_acquire_slot(self: &Arc<Self>, user_id: UserId, max_slots: usize) -> Option<UserSlot> {
        self.try_acquire(user_id, max_slots).then(|| UserSlot {
            slots: Arc::clone(self),
            user_id,
        })
    }

    /// Slots currently held by `user_id`
    pub fn active(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).copied().unwrap_or(0)
    }

    /// Slots currently held across all users
    pub fn total_active(&self) -> usize {
        self.lock().values().sum()
    }

    /// Number of users currently holding at least one slot
    pub fn users_with_slots(&self) -> usize {
        self.lock().len()
    }

    /// Successful acquisitions and releases since startup
    pub fn totals(&self) -> (u64, u64) {
        (
            self.acquired_total.load(Ordering::SeqCst),
            self.released_total.load(Ordering::SeqCst),
        )
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_respects_per_user_ceiling() {
        let slots = UserSlots::new();
        let alice = UserId(1);
        let bob = UserId(2);

        assert!(slots.try_acquire(alice, 2));
        assert!(slots.try_acquire(alice, 2));
        assert!(!slots.try_acquire(alice, 2), "third slot must be refused");
        assert!(slots.try_acquire(bob, 2), "other users are independent");

        assert_eq!(slots.active(alice), 2);
        assert_eq!(slots.total_active(), 3);
    }

    #[test]
    fn release_frees_a_slot_and_drops_empty_entries() {
        let slots = UserSlots::new();
        let user = UserId(9);

        assert!(slots.try_acquire(user, 1));
        slots.release(user);
        assert_eq!(slots.active(user), 0);
        assert_eq!(slots.users_with_slots(), 0);
        assert!(slots.try_acquire(user, 1));
    }

    #[test]
    fn over_release_clamps_at_zero() {
        let slots = UserSlots::new();
        let user = UserId(3);

        slots.release(user);
        assert_eq!(slots.active(user), 0);

        assert!(slots.try_acquire(user, 1));
        slots.release(user);
        slots.release(user);
        assert_eq!(slots.active(user), 0);
        assert_eq!(slots.totals(), (1, 1), "only the real release is counted");
    }

    #[test]
    fn refused_acquire_with_zero_ceiling_leaves_no_entry() {
        let slots = UserSlots::new();
        assert!(!slots.try_acquire(UserId(4), 0));
        assert_eq!(slots.users_with_slots(), 0);
    }

    #[test]
    fn guard_releases_exactly_once() {
        let slots = Arc::new(UserSlots::new());
        let user = UserId(5);

        let guard = slots.try_acquire_slot(user, 1).unwrap();
        assert_eq!(guard.user_id(), user);
        assert!(slots.try_acquire_slot(user, 1).is_none());

        drop(guard);
        assert_eq!(slots.active(user), 0);
        assert_eq!(slots.totals(), (1, 1));
    }

    #[test]
    fn guard_is_released_when_holder_panics() {
        let slots = Arc::new(UserSlots::new());
        let user = UserId(6);

        let cloned = Arc::clone(&slots);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire_slot(user, 1).unwrap();
            panic!("job blew up");
        }));

        assert!(result.is_err());
        assert_eq!(slots.active(user), 0);
        assert_eq!(slots.totals(), (1, 1));
    }

    #[tokio::test]
    async fn concurrent_acquire_release_balances() {
        let slots = Arc::new(UserSlots::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let slots = Arc::clone(&slots);
            tasks.push(tokio::spawn(async move {
                let user = UserId(i % 4);
                if let Some(_slot) = slots.try_acquire_slot(user, 2) {
                    assert!(slots.active(user) <= 2);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(slots.total_active(), 0);
        let (acquired, released) = slots.totals();
        assert_eq!(acquired, released);
    }
}
