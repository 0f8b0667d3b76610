/// Runs a closure when the scope is exited, whether by normal return, early
/// return, or panic.
///
/// The guard is armed on creation; `disarm` prevents the closure from
/// running. The closure is wrapped in an `Option` and taken out on drop so it
/// can only ever run once.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    #[allow(unused)]
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let mut hit = false;
        {
            let _guard = ScopeGuard::new(|| hit = true);
        }
        assert!(hit);
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let mut hit = false;
        {
            let mut guard = ScopeGuard::new(|| hit = true);
            guard.disarm();
        }
        assert!(!hit);
    }
}
