//! Wake-all conditions.
//!
//! A [`Condition`] is the notification primitive objects use to tell their
//! waiters about progress, completion, or abort. `signal` wakes every waiter
//! registered at that instant exactly once; a waiter that registers while a
//! signal is being delivered is not woken until the next signal. Waiters
//! re-inspect object state when they wake, so an abort is expressed as
//! "set the flag, then signal".
//!
//! Because waiters resume as separate tasks rather than as callbacks run
//! inside `signal`, signalling can never re-enter handler code; the
//! recursive-signal hazard of callback-style condition lists does not arise.

use tokio::sync::Notify;

/// A list of waiters to notify on state change.
#[derive(Debug, Default)]
pub struct Condition {
    notify: Notify,
}

impl Condition {
    /// Creates an empty condition.
    pub fn new() -> Condition {
        Condition { notify: Notify::new() }
    }

    /// Wake every currently-registered waiter once.
    pub fn signal(&self) {
        self.notify.notify_waiters();
    }

    /// Wait for the next signal.
    ///
    /// The caller must check the guarded state *before* awaiting and again
    /// after waking; on a single-threaded executor no signal can slip in
    /// between the check and the first poll of this future.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test]
    async fn signal_wakes_all_registered_waiters() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cond = Rc::new(Condition::new());
                let woken = Rc::new(Cell::new(0));

                let mut handles = Vec::new();
                for _ in 0..3 {
                    let cond = cond.clone();
                    let woken = woken.clone();
                    handles.push(tokio::task::spawn_local(async move {
                        cond.wait().await;
                        woken.set(woken.get() + 1);
                    }));
                }
                // Let the waiters register.
                tokio::task::yield_now().await;
                cond.signal();
                for h in handles {
                    h.await.unwrap();
                }
                assert_eq!(woken.get(), 3);
            })
            .await;
    }

    #[tokio::test]
    async fn late_registration_waits_for_next_signal() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cond = Rc::new(Condition::new());
                // A signal with no waiters is a no-op.
                cond.signal();

                let cond2 = cond.clone();
                let handle = tokio::task::spawn_local(async move {
                    cond2.wait().await;
                });
                tokio::task::yield_now().await;
                cond.signal();
                handle.await.unwrap();
            })
            .await;
    }
}
