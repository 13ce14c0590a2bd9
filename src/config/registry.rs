//! Registry of target values claimed by validated receivers.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Target values already claimed by a successful validation.
///
/// One registry spans whatever scope the caller picks: the binary keeps one
/// per process start, tests keep one per test.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    seen: Mutex<HashSet<String>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set holds no invariant a panicking holder could break.
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check `targets` for duplicates and, if `commit` is set and none are
    /// found, claim all of them.
    ///
    /// Returns the indices of targets already claimed or repeated earlier in
    /// `targets`. The check and the claim happen under one lock acquisition.
    pub fn claim(&self, targets: &[&str], commit: bool) -> Vec<usize> {
        let mut seen = self.lock();
        let mut local = HashSet::with_capacity(targets.len());
        let mut duplicates = Vec::new();

        for (i, target) in targets.iter().enumerate() {
            if seen.contains(*target) || !local.insert(*target) {
                duplicates.push(i);
            }
        }

        if commit && duplicates.is_empty() {
            seen.extend(targets.iter().map(|t| t.to_string()));
        }

        duplicates
    }

    pub fn contains(&self, target: &str) -> bool {
        self.lock().contains(target)
    }

    /// Give up a claim, e.g. when a receiver is torn down.
    pub fn release(&self, target: &str) -> bool {
        self.lock().remove(target)
    }

    /// Forget every claim.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
