//! Validation problems collected while preparing and running work.

use std::fmt;
use tracing::{error, warn};

/// How serious a problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Reported, execution continues.
    Warning,
    /// The work is not executed.
    Error,
}

/// Kind of a validation problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationProblemId {
    /// A task consumes another task's output without any declared order.
    ImplicitDependency,
    /// An input file collection could not be resolved.
    UnresolvableInput,
    /// Reported by the work itself.
    InvalidWork,
}

/// One problem with a description, its reason and possible solutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationProblem {
    /// Kind of problem.
    pub id: ValidationProblemId,
    /// Severity.
    pub severity: Severity,
    /// Work the problem was found for.
    pub subject: String,
    /// Input or output property involved.
    pub property: Option<String>,
    /// What was detected.
    pub description: String,
    /// Why it is a problem.
    pub reason: String,
    /// Ways to fix it.
    pub solutions: Vec<String>,
}

impl ValidationProblem {
    /// Warning-level problem.
    #[must_use]
    pub fn warning(id: ValidationProblemId, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            severity: Severity::Warning,
            subject: subject.into(),
            property: None,
            description: description.into(),
            reason: String::new(),
            solutions: Vec::new(),
        }
    }

    /// Error-level problem.
    #[must_use]
    pub fn error(id: ValidationProblemId, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::warning(id, subject, description)
        }
    }

    /// Attach the property involved.
    #[must_use]
    pub fn for_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    /// Attach the reason.
    #[must_use]
    pub fn happens_because(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Add a possible solution.
    #[must_use]
    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solutions.push(solution.into());
        self
    }
}

impl fmt::Display for ValidationProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}: property '{property}' {}", self.subject, self.description)?,
            None => write!(f, "{}: {}", self.subject, self.description)?,
        }
        if !self.reason.is_empty() {
            write!(f, "\n  Reason: {}", self.reason)?;
        }
        if !self.solutions.is_empty() {
            write!(f, "\n  Possible solutions:")?;
            for (i, solution) in self.solutions.iter().enumerate() {
                write!(f, "\n    {}. {solution}", i + 1)?;
            }
        }
        Ok(())
    }
}

/// Collects the problems found for one unit of work.
///
/// Every problem is logged when recorded; logging never replaces
/// collection.
#[derive(Debug, Default)]
pub struct WorkValidationContext {
    problems: Vec<ValidationProblem>,
}

impl WorkValidationContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `problem`.
    pub fn visit_problem(&mut self, problem: ValidationProblem) {
        match problem.severity {
            Severity::Warning => warn!(subject = %problem.subject, id = ?problem.id, "{problem}"),
            Severity::Error => error!(subject = %problem.subject, id = ?problem.id, "{problem}"),
        }
        self.problems.push(problem);
    }

    /// Every recorded problem.
    #[must_use]
    pub fn problems(&self) -> &[ValidationProblem] {
        &self.problems
    }

    /// Whether an error was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.problems.iter().any(|p| p.severity == Severity::Error)
    }

    /// Errors rendered one per line.
    #[must_use]
    pub fn render_errors(&self) -> String {
        self.problems
            .iter()
            .filter(|p| p.severity == Severity::Error)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Consume into the recorded problems.
    #[must_use]
    pub fn into_problems(self) -> Vec<ValidationProblem> {
        self.problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_problems_are_logged_and_collected() {
        let mut context = WorkValidationContext::new();
        context.visit_problem(
            ValidationProblem::warning(ValidationProblemId::UnresolvableInput, ":lint", "cannot be resolved")
                .for_property("sources")
                .happens_because("An input file collection couldn't be resolved")
                .with_solution("Consider using depends_on instead"),
        );
        assert!(!context.has_errors());
        assert_eq!(context.problems().len(), 1);
        assert!(logs_contain("cannot be resolved"));

        let rendered = context.problems()[0].to_string();
        assert!(rendered.starts_with(":lint: property 'sources' cannot be resolved"));
        assert!(rendered.contains("1. Consider using depends_on instead"));
    }

    #[test]
    fn test_errors_are_rendered() {
        let mut context = WorkValidationContext::new();
        context.visit_problem(ValidationProblem::error(ValidationProblemId::InvalidWork, "w", "is broken"));
        assert!(context.has_errors());
        assert_eq!(context.render_errors(), "w: is broken");
    }
}
