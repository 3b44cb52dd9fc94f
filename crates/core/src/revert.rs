//! Scoped-cleanup helper (spec §2 item 1, §9 "Revert semantics").
//!
//! Every multi-step lifecycle function opens one of these at entry, pushes a
//! compensating closure after each effect it commits, and either `fail()`s
//! (unwinding in reverse) or `success()`s (discarding) before returning.
//! Mirrors the teacher's `Drop for Firecracker` best-effort synchronous kill:
//! closures here are plain `FnOnce() + Send`, so an async cleanup must spawn
//! and block_on/join inside the closure rather than being async itself.
#[derive(Default)]
pub struct RevertStack {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl RevertStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Run every compensating action in reverse order. A panicking closure
    /// is caught so one bad revert does not abort the rest.
    pub fn fail(&mut self) {
        for action in std::mem::take(&mut self.actions).into_iter().rev() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(action));
        }
    }

    /// Discard the stack without running anything.
    pub fn success(&mut self) {
        self.actions.clear();
    }

    /// Move the remaining actions into a new, independent stack. Used when a
    /// function succeeds but wants to hand its caller a cleanup callback for
    /// later (the "`Clone().Fail`" detachable tail from spec §9).
    pub fn detach(&mut self) -> RevertStack {
        RevertStack {
            actions: std::mem::take(&mut self.actions),
        }
    }
}

impl Drop for RevertStack {
    /// A stack dropped without an explicit `success()`/`fail()` call still
    /// unwinds — callers that `return Err(..)` via `?` before reaching the
    /// tail `success()` call are still covered.
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            self.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fail_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = RevertStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(move || order.lock().unwrap().push(i));
        }
        stack.fail();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn success_discards_without_running() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = RevertStack::new();
        let ran2 = ran.clone();
        stack.push(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        stack.success();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_without_success_still_unwinds() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran2 = ran.clone();
            let mut stack = RevertStack::new();
            stack.push(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_bad_revert_does_not_abort_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = RevertStack::new();
        stack.push(|| panic!("boom"));
        let ran2 = ran.clone();
        stack.push(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        stack.fail();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_hands_off_remaining_actions() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = RevertStack::new();
        let ran2 = ran.clone();
        stack.push(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        let mut tail = stack.detach();
        assert!(stack.is_empty());
        tail.fail();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
