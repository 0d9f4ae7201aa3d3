//! Pluggable constraint checks for inbound envelopes and outbound records

use std::fmt;

/// A single violated constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Path of the offending field, e.g. `data.foo`
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates values of type `T`. An empty result means the value is valid.
pub trait Validator<T>: Send + Sync {
    fn validate(&self, value: &T) -> Vec<Violation>;
}

impl<T, F> Validator<T> for F
where
    F: Fn(&T) -> Vec<Violation> + Send + Sync,
{
    fn validate(&self, value: &T) -> Vec<Violation> {
        self(value)
    }
}

/// Runs `validator` over every value and collects all violations
pub fn validate_all<'a, T: 'a>(
    validator: &dyn Validator<T>,
    values: impl IntoIterator<Item = &'a T>,
) -> Vec<Violation> {
    values
        .into_iter()
        .flat_map(|value| validator.validate(value))
        .collect()
}
