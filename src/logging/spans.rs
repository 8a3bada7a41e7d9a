//! Structured spans for registration operations
//!
//! Every session operation runs inside an [`OperationSpan`] so that grid
//! definitions, refinements and peak searches of one session correlate
//! through its id in the JSON log files.

use std::time::Instant;
use tracing::field::Empty;
use tracing::{span, Level, Span};
use uuid::Uuid;

/// Span around one registration operation (grid definition, refinement, undo, peak search)
pub struct OperationSpan {
    span: Span,
    start_time: Instant,
    operation: String,
}

impl OperationSpan {
    pub fn new(operation: &str, session_id: Option<Uuid>) -> Self {
        let span = span!(
            Level::INFO,
            "registration_operation",
            operation = operation,
            session_id = Empty,
            points = Empty,
            rms = Empty,
            std_x = Empty,
            std_y = Empty,
            peaks_found = Empty,
            unresolved = Empty,
            success = Empty,
            execution_time_ms = Empty,
        );
        if let Some(id) = session_id {
            span.record("session_id", tracing::field::display(id));
        }

        Self {
            span,
            start_time: Instant::now(),
            operation: operation.to_string(),
        }
    }

    /// Number of points or pairs the operation consumed
    pub fn record_points(&self, points: usize) {
        self.span.record("points", points);
        tracing::debug!(parent: &self.span, points, "Operation input recorded");
    }

    pub fn record_precision(&self, rms: f64, std: (f64, f64)) {
        self.span.record("rms", rms);
        self.span.record("std_x", std.0);
        self.span.record("std_y", std.1);
        tracing::info!(
            parent: &self.span,
            rms = format!("{:.3}", rms),
            std_x = format!("{:.3}", std.0),
            std_y = format!("{:.3}", std.1),
            "Precision estimate recorded"
        );
    }

    pub fn record_peaks(&self, found: usize, unresolved: usize) {
        self.span.record("peaks_found", found);
        self.span.record("unresolved", unresolved);
        tracing::info!(
            parent: &self.span,
            peaks_found = found,
            unresolved_overlaps = unresolved,
            "Peak detection recorded"
        );
    }

    /// Record the outcome together with the elapsed time
    pub fn record_result(&self, success: bool, description: &str) {
        let duration = self.start_time.elapsed();
        self.span.record("success", success);
        self.span.record("execution_time_ms", duration.as_millis() as f64);

        if success {
            tracing::info!(
                parent: &self.span,
                operation = %self.operation,
                execution_time_ms = duration.as_millis(),
                description,
                "Operation completed"
            );
        } else {
            tracing::warn!(
                parent: &self.span,
                operation = %self.operation,
                execution_time_ms = duration.as_millis(),
                description,
                "Operation failed"
            );
        }
    }

    /// Records the outcome of a `Result` and passes it through.
    pub fn finish<T, E: std::fmt::Display>(&self, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.record_result(true, "ok"),
            Err(e) => self.record_result(false, &e.to_string()),
        }
        result
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_operation_span_records_precision() {
        let span = OperationSpan::new("refine", Some(Uuid::new_v4()));
        let _enter = span.enter();
        span.record_points(12);
        span.record_precision(3.25, (1.5, 2.0));
        span.record_result(true, "round 1");

        assert!(logs_contain("Precision estimate recorded"));
        assert!(logs_contain("Operation completed"));
    }

    #[traced_test]
    #[test]
    fn test_finish_logs_failures() {
        let span = OperationSpan::new("define_grid", None);
        let result: Result<(), String> = span.finish(Err("three corners".to_string()));

        assert!(result.is_err());
        assert!(logs_contain("Operation failed"));
        assert_eq!(span.operation(), "define_grid");
    }

    #[traced_test]
    #[test]
    fn test_peak_span() {
        let span = OperationSpan::new("find_peaks", None);
        let _enter = span.enter();
        span.record_peaks(42, 1);

        assert!(logs_contain("Peak detection recorded"));
    }
}
