pub mod conversation;
pub mod document;
pub mod knowledge;

pub use conversation::*;
pub use document::*;
pub use knowledge::*;

use chrono::NaiveDateTime;
use uuid::Uuid;

use super::DatabaseError;

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|_| DatabaseError::InvalidEnum {
        field: field.to_string(),
        value: value.to_string(),
    })
}

pub(crate) fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}
