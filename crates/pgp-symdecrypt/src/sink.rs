//! Single-character output: where plaintext and diagnostics go.

use core::fmt;
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

/// The environment's `put_char` primitive.
pub trait CharSink {
    fn put_char(&mut self, byte: u8);

    /// Called when bytes already written can no longer be trusted (failed integrity check or a
    /// failure after output started). Bytes cannot be taken back, only flagged.
    fn mark_untrusted(&mut self) {}

    fn put_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_char(b);
        }
    }
}

impl<S: CharSink + ?Sized> CharSink for &mut S {
    fn put_char(&mut self, byte: u8) {
        (**self).put_char(byte);
    }

    fn mark_untrusted(&mut self) {
        (**self).mark_untrusted();
    }
}

/// Adapts a closure such as a UART write routine.
pub struct PutChar<F>(pub F);

impl<F: FnMut(u8)> CharSink for PutChar<F> {
    fn put_char(&mut self, byte: u8) {
        (self.0)(byte);
    }
}

/// Collects output in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectSink {
    pub bytes: Vec<u8>,
    pub trusted: bool,
}

impl CollectSink {
    pub fn new() -> Self {
        CollectSink {
            bytes: Vec::new(),
            trusted: true,
        }
    }
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CharSink for CollectSink {
    fn put_char(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn mark_untrusted(&mut self) {
        self.trusted = false;
    }
}

struct SinkWriter<'a, S: ?Sized>(&'a mut S);

impl<S: CharSink + ?Sized> fmt::Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_bytes(s.as_bytes());
        Ok(())
    }
}

/// `log` backend that prints `LEVEL target: message` lines through a [`CharSink`].
pub struct PutCharLogger<S> {
    sink: Mutex<S>,
    level: LevelFilter,
}

impl<S: CharSink + Send> PutCharLogger<S> {
    pub fn new(sink: S, level: LevelFilter) -> Self {
        PutCharLogger {
            sink: Mutex::new(sink),
            level,
        }
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<(), log::SetLoggerError>
    where
        S: 'static,
    {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn into_inner(self) -> S {
        match self.sink.into_inner() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<S: CharSink + Send> Log for PutCharLogger<S> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = fmt::write(
            &mut SinkWriter(&mut *sink),
            format_args!("{} {}: {}\n", record.level(), record.target(), record.args()),
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn closure_sink_sees_every_byte() {
        let mut seen: Vec<u8> = Vec::new();
        PutChar(|b: u8| seen.push(b)).put_bytes(b"abc");
        assert_eq!(seen, b"abc");
    }

    #[test]
    fn logger_writes_lines_through_the_sink() {
        let logger = PutCharLogger::new(CollectSink::new(), LevelFilter::Info);
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("pgp")
                .args(format_args!("quick-check {}", "mismatch"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("pgp")
                .args(format_args!("hidden"))
                .build(),
        );
        let out = logger.into_inner();
        assert_eq!(out.bytes, b"WARN pgp: quick-check mismatch\n");
    }
}
