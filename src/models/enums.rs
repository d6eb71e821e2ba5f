use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(ExtractionStatus {
    Pending => "pending",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
});

impl ExtractionStatus {
    /// `done` and `failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

str_enum!(ExtractionMethod {
    PdfText => "pdf_text",
    PdfOcr => "pdf_ocr",
    PdfMixed => "pdf_mixed",
    ImageOcr => "image_ocr",
});

str_enum!(TurnRole {
    User => "user",
    Assistant => "assistant",
});

str_enum!(SessionState {
    Active => "active",
    Deleted => "deleted",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
            ExtractionStatus::Done,
            ExtractionStatus::Failed,
        ] {
            assert_eq!(ExtractionStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = TurnRole::from_str("system").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { ref field, .. } if field == "TurnRole"));
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(!ExtractionStatus::Pending.is_terminal());
        assert!(!ExtractionStatus::Processing.is_terminal());
        assert!(ExtractionStatus::Done.is_terminal());
        assert!(ExtractionStatus::Failed.is_terminal());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ExtractionMethod::PdfText).unwrap();
        assert_eq!(json, "\"pdf_text\"");
    }
}
