//! Deterministic classification of failed executions.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ErrorCategory, ErrorClass, ExitStatus};

static ERROR_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\w+(?:Error|Exception)):").expect("valid regex"));
static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"line (\d+)").expect("valid regex"));

/// Classify a finished execution from its exit status and captured stderr.
///
/// - Success, infrastructure failures and cancellations are never classified.
/// - Timeouts always classify as [`ErrorCategory::Timeout`].
/// - Otherwise the last `<Name>Error:` / `<Name>Exception:` in stderr picks the
///   category; the last `line N` gives the line; the last non-empty stderr
///   line is the message.
pub fn classify(status: &ExitStatus, stderr: &str) -> Option<ErrorClass> {
    match status {
        ExitStatus::Success | ExitStatus::InfrastructureFailure { .. } | ExitStatus::Cancelled => {
            None
        }
        ExitStatus::Timeout => Some(ErrorClass {
            category: ErrorCategory::Timeout,
            error_type: None,
            line: None,
            message: Some("the program did not terminate in time".to_string()),
            fixable: false,
        }),
        ExitStatus::NonZeroExit { code } => {
            let error_type = ERROR_TYPE_RE
                .captures_iter(stderr)
                .last()
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            let line = LINE_RE
                .captures_iter(stderr)
                .last()
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok());
            let message = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            let category = categorize(error_type.as_deref(), message.as_deref(), stderr, *code);
            Some(ErrorClass {
                category,
                error_type,
                line,
                message,
                fixable: category.likely_fixable(),
            })
        }
    }
}

fn categorize(
    error_type: Option<&str>,
    message: Option<&str>,
    stderr: &str,
    code: Option<i32>,
) -> ErrorCategory {
    let ty = error_type.unwrap_or_default().to_lowercase();
    let msg = message.unwrap_or_default().to_lowercase();

    if ty.contains("syntaxerror") || ty.contains("indentationerror") {
        return ErrorCategory::Syntax;
    }
    if ty.contains("importerror") || ty.contains("modulenotfounderror") {
        return ErrorCategory::Import;
    }
    if ty.contains("memoryerror") {
        return ErrorCategory::Memory;
    }
    if ty.contains("typeerror") {
        return ErrorCategory::Type;
    }
    if ty.contains("valueerror") {
        if msg.contains("shape") || msg.contains("dimension") {
            return ErrorCategory::ShapeMismatch;
        }
        return ErrorCategory::Value;
    }
    if ty.contains("indexerror") || ty.contains("keyerror") {
        return ErrorCategory::Index;
    }
    if ty.contains("attributeerror") {
        return ErrorCategory::Attribute;
    }
    if msg.contains("shape") || msg.contains("dimension") {
        return ErrorCategory::ShapeMismatch;
    }
    // 137 = SIGKILL, typically the OOM killer under a memory limit.
    if code == Some(137) || msg.contains("memory") || stderr.to_lowercase().contains("killed") {
        return ErrorCategory::Memory;
    }
    ErrorCategory::Runtime
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEBACK: &str = "Traceback (most recent call last):\n  File \"main.py\", line 12, in <module>\n    import torch\nModuleNotFoundError: No module named 'torch'\n";

    fn failed(code: i32) -> ExitStatus {
        ExitStatus::NonZeroExit { code: Some(code) }
    }

    #[test]
    fn success_and_infra_are_unclassified() {
        assert!(classify(&ExitStatus::Success, TRACEBACK).is_none());
        let infra = ExitStatus::InfrastructureFailure {
            reason: "docker".to_string(),
        };
        assert!(classify(&infra, TRACEBACK).is_none());
    }

    #[test]
    fn python_traceback_is_parsed() {
        let class = classify(&failed(1), TRACEBACK).expect("classified");
        assert_eq!(class.category, ErrorCategory::Import);
        assert_eq!(class.error_type.as_deref(), Some("ModuleNotFoundError"));
        assert_eq!(class.line, Some(12));
        assert_eq!(
            class.message.as_deref(),
            Some("ModuleNotFoundError: No module named 'torch'")
        );
        assert!(class.fixable);
    }

    #[test]
    fn shape_mismatch_from_value_error() {
        let stderr = "ValueError: operands could not be broadcast together with shapes (3,) (4,)";
        let class = classify(&failed(1), stderr).expect("classified");
        assert_eq!(class.category, ErrorCategory::ShapeMismatch);
    }

    #[test]
    fn timeout_is_not_fixable() {
        let class = classify(&ExitStatus::Timeout, "").expect("classified");
        assert_eq!(class.category, ErrorCategory::Timeout);
        assert!(!class.fixable);
    }

    #[test]
    fn sigkill_exit_is_memory() {
        let class = classify(&failed(137), "").expect("classified");
        assert_eq!(class.category, ErrorCategory::Memory);
        assert!(class.message.is_none());
    }

    #[test]
    fn unknown_failure_is_runtime() {
        let class = classify(&failed(3), "boom\n").expect("classified");
        assert_eq!(class.category, ErrorCategory::Runtime);
        assert_eq!(class.message.as_deref(), Some("boom"));
    }
}
