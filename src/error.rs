//! Error taxonomy for the whole runtime.
//!
//! Four families, matching where an error can surface:
//! - compile-time template errors (malformed markup, conflicting directives),
//!   fatal to that compilation only
//! - lifecycle errors (thrown/rejected inside a hook or render), captured on
//!   the fiber and resolved through the component ancestor chain
//! - reactivity contract violations (mutating observed state during a render),
//!   returned synchronously and never ignored
//! - mount target validation errors, raised before any rendering begins

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CinderError {
    /// Malformed markup or an invalid directive combination, detected while
    /// compiling a template.
    #[error("template `{template}`: {message}")]
    Template { template: String, message: String },

    /// An expression string that could not be compiled.
    #[error("invalid expression `{expr}`: {message}")]
    Expression { expr: String, message: String },

    /// Failure while evaluating a compiled expression at render time.
    #[error("evaluation error: {0}")]
    Eval(String),

    /// An error raised (or a rejected future) inside a lifecycle hook.
    #[error("error in {hook} of component `{component}`: {message}")]
    Lifecycle {
        component: String,
        hook: String,
        message: String,
    },

    /// Duplicate key within a single keyed list render (dev mode only;
    /// production skips the check).
    #[error("duplicate key `{0}` in keyed list")]
    DuplicateKey(String),

    /// Observed state was mutated while mutations are disallowed (i.e. while
    /// a render is executing). Hard contract: silently accepting the write
    /// would produce inconsistent renders.
    #[error("cannot mutate observed state while a render is executing")]
    ReactivityViolation,

    /// The mount target is not a valid, attached DOM element.
    #[error("cannot mount component: {0}")]
    InvalidMountTarget(String),

    /// Catch-all for runtime failures that do not fit the families above
    /// (unknown template names, missing component definitions, ...).
    #[error("{0}")]
    Runtime(String),
}

impl CinderError {
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        CinderError::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    pub fn expression(expr: impl Into<String>, message: impl Into<String>) -> Self {
        CinderError::Expression {
            expr: expr.into(),
            message: message.into(),
        }
    }

    pub fn lifecycle(
        component: impl Into<String>,
        hook: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CinderError::Lifecycle {
            component: component.into(),
            hook: hook.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CinderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CinderError::template("counter", "unclosed tag <div>");
        assert_eq!(err.to_string(), "template `counter`: unclosed tag <div>");

        let err = CinderError::lifecycle("Child", "will_start", "boom");
        assert_eq!(
            err.to_string(),
            "error in will_start of component `Child`: boom"
        );
    }
}
