//! Evaluator capability - abstracts the Scheme interpreter.
//!
//! The interpreter is synchronous and not reentrant. Callers in this crate
//! only ever invoke it from `spawn_blocking` tasks, one evaluation at a time
//! per connection. `interrupt` may run concurrently with `evaluate`.

use crate::completeness::is_balanced_expression;

/// Errors reported by the evaluator.
///
/// These never end a connection: they are rendered as `"Error: <message>"`
/// and sent back like any other result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("{message}")]
    Failed { message: String },

    #[error("evaluator panicked")]
    Panicked,
}

impl EvalError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Client-visible response text.
    pub fn render(&self) -> String {
        format!("Error: {}", self)
    }
}

pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate one complete expression and return its printed result.
    fn evaluate(&self, expression: &str) -> Result<String, EvalError>;

    /// Best-effort request to stop the running evaluation.
    ///
    /// `Some(status)` is sent back to the client as a response; `None`
    /// sends nothing.
    fn interrupt(&self) -> Result<Option<String>, EvalError>;

    /// Whether `buffer` is a syntactically complete unit.
    fn is_complete_expression(&self, buffer: &str) -> bool {
        is_balanced_expression(buffer)
    }
}

/// Run a blocking evaluator call off the async runtime.
///
/// A panic inside `call` becomes [`EvalError::Panicked`].
pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T, EvalError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EvalError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            tracing::error!("Evaluator panicked");
            Err(EvalError::Panicked)
        }
        Err(e) => Err(EvalError::failed(format!("evaluator task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Evaluator for Echo {
        fn evaluate(&self, expression: &str) -> Result<String, EvalError> {
            Ok(expression.to_string())
        }

        fn interrupt(&self) -> Result<Option<String>, EvalError> {
            Ok(None)
        }
    }

    #[test]
    fn render_prefixes_error() {
        assert_eq!(
            EvalError::failed("car: not a pair").render(),
            "Error: car: not a pair"
        );
        assert_eq!(EvalError::Panicked.render(), "Error: evaluator panicked");
    }

    #[tokio::test]
    async fn run_blocking_catches_panics() {
        let ok = run_blocking(|| Echo.evaluate("42")).await;
        assert_eq!(ok, Ok("42".to_string()));

        let panicked: Result<String, _> = run_blocking(|| panic!("boom")).await;
        assert_eq!(panicked, Err(EvalError::Panicked));
    }

    #[test]
    fn default_completeness_uses_balanced_check() {
        assert!(Echo.is_complete_expression("(+ 1 2)"));
        assert!(!Echo.is_complete_expression("(+ 1"));
    }
}
