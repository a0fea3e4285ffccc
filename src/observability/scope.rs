//! Begin/complete logging around one unit of apply work
//!
//! - `{NAME}_BEGIN` on creation
//! - `{NAME}_COMPLETE` with elapsed micros on `complete`
//! - `{NAME}_FAILED` on `fail`
//! - `{NAME}_INCOMPLETE` at WARN if dropped without either

use std::time::Instant;

use super::logger::{Logger, Severity};

/// Scope wrapping a batch, a recovery pass, or a service run
pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    started: Instant,
    finished: bool,
    begin_severity: Severity,
}

impl ObservationScope {
    /// Open a scope, logging `{name}_BEGIN` at INFO.
    pub fn new(name: &'static str) -> Self {
        Self::open(name, Vec::new(), Severity::Info)
    }

    /// Open a scope carrying `fields` on every line it logs.
    pub fn with_fields(name: &'static str, fields: Vec<(&'static str, String)>) -> Self {
        Self::open(name, fields, Severity::Info)
    }

    /// Open a per-batch scope; its BEGIN line is TRACE to keep INFO quiet.
    pub fn quiet(name: &'static str, fields: Vec<(&'static str, String)>) -> Self {
        Self::open(name, fields, Severity::Trace)
    }

    fn open(
        name: &'static str,
        fields: Vec<(&'static str, String)>,
        begin_severity: Severity,
    ) -> Self {
        let scope = Self {
            name,
            fields,
            started: Instant::now(),
            finished: false,
            begin_severity,
        };
        scope.emit(begin_severity, "BEGIN", &[]);
        scope
    }

    fn emit(&self, severity: Severity, suffix: &str, extra: &[(&str, &str)]) {
        let event = format!("{}_{}", self.name, suffix);
        let mut all: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        all.extend_from_slice(extra);
        Logger::log(severity, &event, &all);
    }

    /// Microseconds since the scope opened.
    pub fn elapsed_micros(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    /// Log `{name}_COMPLETE` with `extra` fields; returns elapsed micros.
    pub fn complete(mut self, extra: &[(&str, &str)]) -> u64 {
        self.finished = true;
        let micros = self.elapsed_micros();
        let elapsed = micros.to_string();
        let mut all = vec![("elapsed_us", elapsed.as_str())];
        all.extend_from_slice(extra);
        let severity = self.begin_severity.max(Severity::Info);
        self.emit(severity, "COMPLETE", &all);
        micros
    }

    /// Log `{name}_FAILED` at FATAL.
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        self.emit(Severity::Fatal, "FAILED", &[("reason", reason)]);
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(Severity::Warn, "INCOMPLETE", &[]);
        }
    }
}
