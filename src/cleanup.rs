//! LIFO release stack for acquired OS resources.
//!
//! Each acquisition (image file, loop binding, mount, mount point) pushes its
//! release action here at the moment it succeeds. On failure the stack is
//! unwound newest-first; on success callers release entries one by one so
//! that release errors can still fail the operation.

use tracing::{debug, warn};

use crate::error::Result;

type Release = Box<dyn FnOnce() -> Result<()>>;

#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, Release)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action for a resource that was just acquired.
    pub fn push<F>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let name = name.into();
        debug!(resource = %name, "acquired");
        self.actions.push((name, Box::new(release)));
    }

    /// Forget the newest action called `name` without running it.
    pub fn disarm(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                drop(self.actions.remove(index));
                true
            }
            None => false,
        }
    }

    /// Run the newest action called `name` now and return its outcome.
    ///
    /// Returns `Ok(())` if no such action is registered.
    pub fn release(&mut self, name: &str) -> Result<()> {
        match self.position(name) {
            Some(index) => {
                let (name, action) = self.actions.remove(index);
                debug!(resource = %name, "releasing");
                action()
            }
            None => Ok(()),
        }
    }

    /// Run every remaining action newest-first. Failures are logged, never
    /// propagated, so they cannot mask the error that triggered the unwind.
    /// Returns how many releases failed.
    pub fn unwind(&mut self) -> usize {
        let mut failures = 0;
        while let Some((name, action)) = self.actions.pop() {
            debug!(resource = %name, "unwinding");
            if let Err(err) = action() {
                warn!(resource = %name, error = %err, "cleanup failed");
                failures += 1;
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.actions.iter().rposition(|(n, _)| n == name)
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            self.unwind();
        }
    }
}
