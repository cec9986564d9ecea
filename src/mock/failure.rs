//! Failure injection for the in-memory services

use std::collections::HashMap;
use std::hash::Hash;

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Message carried by the returned error
    pub message: String,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fail_count: None,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

/// Per-operation failure injector
#[derive(Debug)]
pub struct FailureInjector<Op> {
    configs: HashMap<Op, FailureConfig>,
    /// Calls seen since the failure was injected
    call_counts: HashMap<Op, u32>,
}

impl<Op> Default for FailureInjector<Op> {
    fn default() -> Self {
        Self {
            configs: HashMap::new(),
            call_counts: HashMap::new(),
        }
    }
}

impl<Op: Hash + Eq + Clone> FailureInjector<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: Op, config: FailureConfig) {
        self.configs.insert(op.clone(), config);
        self.call_counts.insert(op, 0);
    }

    pub fn inject_error(&mut self, op: Op, message: impl Into<String>) {
        self.inject(op, FailureConfig::error(message));
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    pub fn clear_op(&mut self, op: &Op) {
        self.configs.remove(op);
        self.call_counts.remove(op);
    }

    /// Message to fail with if `op` should fail on this call
    pub fn check(&mut self, op: &Op) -> Option<String> {
        let config = self.configs.get(op)?;
        let count = self.call_counts.entry(op.clone()).or_insert(0);
        *count += 1;

        match config.fail_count {
            Some(limit) if *count > limit => None,
            _ => Some(config.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Op {
        Put,
        Get,
    }

    #[test]
    fn test_failure_injector_basic() {
        let mut injector = FailureInjector::new();
        assert!(injector.check(&Op::Get).is_none());

        injector.inject_error(Op::Put, "disk full");
        assert_eq!(injector.check(&Op::Put).as_deref(), Some("disk full"));
        assert!(injector.check(&Op::Get).is_none());
    }

    #[test]
    fn test_failure_injector_fail_count() {
        let mut injector = FailureInjector::new();
        injector.inject(Op::Put, FailureConfig::error("busy").with_fail_count(2));

        assert!(injector.check(&Op::Put).is_some());
        assert!(injector.check(&Op::Put).is_some());
        assert!(injector.check(&Op::Put).is_none());
    }

    #[test]
    fn test_failure_injector_clear() {
        let mut injector = FailureInjector::new();
        injector.inject_error(Op::Put, "x");
        injector.clear_op(&Op::Put);
        assert!(injector.check(&Op::Put).is_none());

        injector.inject_error(Op::Get, "y");
        injector.clear();
        assert!(injector.check(&Op::Get).is_none());
    }
}
