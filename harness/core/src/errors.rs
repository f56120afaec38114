use std::fmt;

/// A joined list of failures from a batch operation that does not
/// short-circuit. The message keeps one line per underlying error.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ErrorList {
    message: String,
    count: usize,
}

impl ErrorList {
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Joins the collected errors, or returns `Ok(())` when there are none.
    pub fn join<E: fmt::Display>(errors: Vec<E>) -> Result<(), Self> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut message = String::new();
        for error in &errors {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str("- ");
            message.push_str(&error.to_string());
        }
        Err(Self {
            message,
            count: errors.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_is_ok() {
        assert!(ErrorList::join(Vec::<String>::new()).is_ok());
    }

    #[test]
    fn joined_message_keeps_every_failure() {
        let err = ErrorList::join(vec!["first", "second"]).unwrap_err();
        assert_eq!(err.count(), 2);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }
}
