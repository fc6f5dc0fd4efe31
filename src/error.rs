use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("negative {field} in input rows: {value}")]
    NegativeValue { field: &'static str, value: i64 },

    #[error("{field} total overflows a 64-bit count")]
    Overflow { field: &'static str },

    #[error("unknown production scope code: {0} (expected 0 for final assembly, 1 for other)")]
    UnknownScope(i32),

    #[error("invalid week range '{0}', expected START..END such as 202641..202642")]
    InvalidWeekRange(String),
}
