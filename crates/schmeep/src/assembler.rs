//! Expression buffer for one connection.
//!
//! Block payloads are appended as raw bytes. Text is only decoded when the
//! client asks for evaluation, so multi-byte UTF-8 sequences may straddle
//! block boundaries.

use bytes::BytesMut;

use crate::evaluator::Evaluator;

/// Appending a block would push the buffer past its limit.
///
/// The buffer has already been cleared when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expression exceeds {limit} bytes")]
pub struct Overflow {
    pub limit: usize,
}

/// Outcome of [`ExpressionAssembler::try_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Nothing buffered.
    Empty,
    /// Not yet a complete expression; the buffer is untouched.
    Incomplete,
    /// Complete expression; the buffer has been cleared.
    Complete(String),
}

#[derive(Debug)]
pub struct ExpressionAssembler {
    buffer: BytesMut,
    max_bytes: usize,
}

impl ExpressionAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_bytes,
        }
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<(), Overflow> {
        if self.buffer.len() + payload.len() > self.max_bytes {
            tracing::warn!(
                buffered = self.buffer.len(),
                len = payload.len(),
                limit = self.max_bytes,
                "Expression too large, discarding buffer"
            );
            self.reset();
            return Err(Overflow {
                limit: self.max_bytes,
            });
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    /// Take the buffer if `evaluator` considers it a complete expression.
    pub fn try_complete(&mut self, evaluator: &dyn Evaluator) -> Assembly {
        if self.buffer.is_empty() {
            return Assembly::Empty;
        }

        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text.to_owned(),
            // Truncated multi-byte sequence at the end: the rest is still coming.
            Err(e) if e.error_len().is_none() => return Assembly::Incomplete,
            Err(e) => {
                tracing::warn!(error = %e, "Expression is not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(&self.buffer).into_owned()
            }
        };

        if !evaluator.is_complete_expression(&text) {
            return Assembly::Incomplete;
        }

        self.reset();
        Assembly::Complete(text)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalError;

    struct Scheme;

    impl Evaluator for Scheme {
        fn evaluate(&self, expression: &str) -> Result<String, EvalError> {
            Ok(expression.to_string())
        }

        fn interrupt(&self) -> Result<Option<String>, EvalError> {
            Ok(None)
        }
    }

    #[test]
    fn complete_expression_is_taken_once() {
        let mut assembler = ExpressionAssembler::new(1024);
        assembler.append(b"(+ 1").unwrap();
        assembler.append(b" 2)").unwrap();

        assert_eq!(
            assembler.try_complete(&Scheme),
            Assembly::Complete("(+ 1 2)".to_string())
        );
        assert!(assembler.is_empty());
        assert_eq!(assembler.try_complete(&Scheme), Assembly::Empty);
    }

    #[test]
    fn incomplete_keeps_buffer() {
        let mut assembler = ExpressionAssembler::new(1024);
        assembler.append(b"(define (f x)").unwrap();

        assert_eq!(assembler.try_complete(&Scheme), Assembly::Incomplete);
        assert_eq!(assembler.len(), 13);

        assembler.append(b" x)").unwrap();
        assert_eq!(
            assembler.try_complete(&Scheme),
            Assembly::Complete("(define (f x) x)".to_string())
        );
    }

    #[test]
    fn utf8_split_across_blocks() {
        let text = "(display \"λ\")";
        let bytes = text.as_bytes();
        let split = text.find('λ').unwrap() + 1;

        let mut assembler = ExpressionAssembler::new(1024);
        assembler.append(&bytes[..split]).unwrap();
        assert_eq!(assembler.try_complete(&Scheme), Assembly::Incomplete);

        assembler.append(&bytes[split..]).unwrap();
        assert_eq!(
            assembler.try_complete(&Scheme),
            Assembly::Complete(text.to_string())
        );
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let mut assembler = ExpressionAssembler::new(1024);
        assembler.append(b"(f \xff)").unwrap();
        assert_eq!(
            assembler.try_complete(&Scheme),
            Assembly::Complete("(f \u{fffd})".to_string())
        );
    }

    #[test]
    fn overflow_clears_buffer() {
        let mut assembler = ExpressionAssembler::new(8);
        assembler.append(b"(+ 1 ").unwrap();
        assert_eq!(assembler.append(b"2 3 4)"), Err(Overflow { limit: 8 }));
        assert!(assembler.is_empty());

        assembler.append(b"(+ 1 2)").unwrap();
        assert_eq!(assembler.len(), 7);
    }

    #[test]
    fn reset_discards_partial_expression() {
        let mut assembler = ExpressionAssembler::new(64);
        assembler.append(b"(loop").unwrap();
        assembler.reset();
        assert_eq!(assembler.try_complete(&Scheme), Assembly::Empty);
    }
}
