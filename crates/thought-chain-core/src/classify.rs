//! Interpreter-failure classification for code-execution steps.
//!
//! The server marks code steps finished as soon as the interpreter returns,
//! whether or not the code raised. The step text is the ground truth.

use std::sync::LazyLock;

use regex::RegexSet;

use crate::{Step, StepStatus};

static FAILURE_SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"Traceback \(most recent call last\)",
        r"\b(?:Name|Syntax|Type|Value|Key|Index|Attribute|ZeroDivision|Import|ModuleNotFound|FileNotFound|Runtime|Assertion|OS|IO|Memory|Recursion|NotImplemented|UnboundLocal|Indentation|Permission|Overflow|Parser|Database|Operational|Programming)Error\b",
        r"\bException:",
        r"(?i)\b(?:execution failed|failed to execute|an error occurred|error executing)\b",
        r"执行失败|运行错误|代码错误|执行出错",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Whether `text` carries an interpreter failure signature.
#[must_use]
pub fn has_failure_signature(text: &str) -> bool {
    !text.is_empty() && FAILURE_SIGNATURES.is_match(text)
}

/// Reconciles wire status with actual execution outcome.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    code_roles: Vec<String>,
}

impl ErrorClassifier {
    #[must_use]
    pub const fn new(code_roles: Vec<String>) -> Self {
        Self { code_roles }
    }

    #[must_use]
    pub fn is_code_role(&self, role: Option<&str>) -> bool {
        role.is_some_and(|role| self.code_roles.iter().any(|r| r.eq_ignore_ascii_case(role)))
    }

    /// Status to display for `step`.
    #[must_use]
    pub fn display_status(&self, step: &Step) -> StepStatus {
        if self.is_code_role(step.role.as_deref())
            && (has_failure_signature(&step.description) || has_failure_signature(&step.content))
        {
            StepStatus::Error
        } else {
            step.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_step(content: &str) -> Step {
        let mut step = Step::new("p1", Some("CodeInterpreter".into()), "code");
        step.content = content.to_string();
        step.status = StepStatus::Finish;
        step
    }

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(vec!["CodeInterpreter".into()])
    }

    #[test]
    fn test_signatures() {
        assert!(has_failure_signature(
            "Traceback (most recent call last):\n  File \"<stdin>\", line 1"
        ));
        assert!(has_failure_signature("KeyError: 'revenue'"));
        assert!(has_failure_signature("ModuleNotFoundError: No module named 'x'"));
        assert!(has_failure_signature("代码执行失败"));
        assert!(has_failure_signature("The execution failed after 3s"));
        assert!(!has_failure_signature("Total revenue: 1200"));
        assert!(!has_failure_signature("no errors found"));
        assert!(!has_failure_signature(""));
    }

    #[test]
    fn test_code_step_forced_to_error() {
        let step = code_step("ValueError: could not convert string to float");
        assert_eq!(classifier().display_status(&step), StepStatus::Error);
    }

    #[test]
    fn test_clean_code_step_keeps_wire_status() {
        let step = code_step("df.shape = (10, 3)");
        assert_eq!(classifier().display_status(&step), StepStatus::Finish);
    }

    #[test]
    fn test_other_roles_not_scanned() {
        let mut step = code_step("TypeError in the plan text");
        step.role = Some("Planner".into());
        assert_eq!(classifier().display_status(&step), StepStatus::Finish);
    }
}
