//! Structured message sink for the pipeline (spec §6 "Log sink"). The
//! engine itself only ever calls through this type; routing the messages
//! anywhere is the caller's business, same as the `log` crate is for the
//! rest of this binary's own diagnostics.
//!
//! The default callback forwards to `log`'s macros so a caller who never
//! installs their own sink still gets everything on the same stream that
//! `env_logger` (installed by the CLI binary) is already watching.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Verbose = 10,
    Progress = 20,
    Info = 30,
    Error = 40,
}

pub type LogCallback = dyn Fn(LogLevel, &str) + Send + Sync;

fn default_callback(level: LogLevel, message: &str) {
    match level {
        LogLevel::Verbose => log::debug!("{message}"),
        LogLevel::Progress => log::info!("{message}"),
        LogLevel::Info => log::info!("{message}"),
        LogLevel::Error => log::error!("{message}"),
    }
}

struct Inner {
    level: LogLevel,
    callback: Arc<LogCallback>,
}

/// Cloning a `Logger` shares the same callback and level (the scheduler,
/// orchestrator, and every task clone their handle to it); any thread may
/// log, and the inner mutex serialises level/callback changes without
/// serialising the calls themselves.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                level: LogLevel::Progress,
                callback: Arc::new(default_callback),
            })),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().level = level;
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().callback = Arc::new(callback);
    }

    fn log(&self, level: LogLevel, message: &str) {
        let (min_level, callback) = {
            let inner = self.inner.lock().unwrap();
            (inner.level, inner.callback.clone())
        };
        if level >= min_level {
            callback(level, message);
        }
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Verbose, message.as_ref());
    }

    pub fn progress(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Progress, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn level_filter_suppresses_below_threshold() {
        let logger = Logger::new();
        logger.set_level(LogLevel::Error);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        logger.set_callback(move |_, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        logger.verbose("should be filtered");
        logger.progress("should be filtered too");
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        logger.error("should land");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cloned_logger_shares_callback() {
        let logger = Logger::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        logger.set_callback(move |_, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        let clone = logger.clone();
        clone.info("hello");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
