//! Logging port handed to every stage.
//!
//! Stages never reach for a process-wide logger; they receive a `&dyn Reporter`.
//! The binary wires in [`TracingReporter`], tests use [`MemoryReporter`].

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait Reporter: Send + Sync {
    fn emit(&self, level: Level, stage: &'static str, message: &str);

    fn debug(&self, stage: &'static str, message: &str) {
        self.emit(Level::Debug, stage, message);
    }

    fn info(&self, stage: &'static str, message: &str) {
        self.emit(Level::Info, stage, message);
    }

    fn warn(&self, stage: &'static str, message: &str) {
        self.emit(Level::Warn, stage, message);
    }

    fn error(&self, stage: &'static str, message: &str) {
        self.emit(Level::Error, stage, message);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn emit(&self, level: Level, stage: &'static str, message: &str) {
        match level {
            Level::Debug => tracing::debug!(stage, "{}", message),
            Level::Info => tracing::info!(stage, "{}", message),
            Level::Warn => tracing::warn!(stage, "{}", message),
            Level::Error => tracing::error!(stage, "{}", message),
        }
    }
}

/// Records every event; used to assert on warnings in tests.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<(Level, &'static str, String)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Level, &'static str, String)> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn at_level(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, _, m)| m)
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn emit(&self, level: Level, stage: &'static str, message: &str) {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((level, stage, message.to_string()));
    }
}
