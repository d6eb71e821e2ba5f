pub mod sanitize;

pub use sanitize::*;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SafetyError {
    #[error("Query is empty after sanitization")]
    EmptyQuery,
}
