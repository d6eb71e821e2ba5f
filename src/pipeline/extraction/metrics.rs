//! Clinical metric vocabulary and the `<label> <value> <unit>` parser.
//!
//! The table is static and versioned. Entries are tried in table order and
//! every span a matched entry covers is claimed, so specific labels (HDL,
//! LDL, HbA1c) must precede the general ones (cholesterol, hemoglobin)
//! whose patterns would otherwise match inside them.

use std::collections::HashSet;
use std::ops::Range;

use regex::Regex;
use thiserror::Error;

use crate::models::{MetricMap, MetricValue};

/// Bump whenever an entry is added, removed or its pattern changes.
pub const VOCABULARY_VERSION: u32 = 2;

pub struct MetricDefinition {
    pub key: &'static str,
    /// Regex alternation of label spellings, matched case-insensitively.
    pub label: &'static str,
    pub value: &'static str,
    /// Regex alternation of unit spellings.
    pub units: &'static str,
    /// Used when the text carries no unit.
    pub default_unit: &'static str,
}

/// Comma-grouped thousands first, then plain numbers whose comma can only
/// be a decimal mark (one or two digits after it).
const NUMBER: &str = r"\d{1,3}(?:,\d{3})+(?:\.\d{1,3})?|\d{1,6}(?:\.\d{1,3}|,\d{1,2})?";
const CHEM_UNITS: &str = r"mg\s*/\s*dL|mmol\s*/\s*L";
const COUNT_UNITS: &str = r"x?\s*10\s*\^?\s*3\s*/\s*[uµμ]L|x?\s*10\s*\^?\s*9\s*/\s*L|K\s*/\s*[uµμ]L|cells\s*/\s*[uµμ]L|/\s*[uµμ]L";

pub static METRIC_TABLE: &[MetricDefinition] = &[
    MetricDefinition {
        key: "blood_pressure",
        label: r"blood\s+pressure|BP",
        value: r"\d{2,3}\s*/\s*\d{2,3}",
        units: r"mm\s*Hg",
        default_unit: "mmHg",
    },
    MetricDefinition {
        key: "pulse",
        label: r"pulse(?:\s+rate)?|heart\s+rate|HR",
        value: r"\d{2,3}",
        units: r"bpm|beats?\s*/\s*min|/\s*min",
        default_unit: "bpm",
    },
    MetricDefinition {
        key: "hba1c",
        label: r"HbA1c|A1c|glycated\s+ha?emoglobin|glycosylated\s+ha?emoglobin",
        value: NUMBER,
        units: r"%|mmol\s*/\s*mol",
        default_unit: "%",
    },
    MetricDefinition {
        key: "glucose",
        label: r"(?:fasting\s+)?(?:blood\s+|plasma\s+)?glucose|blood\s+sugar|FBS|FBG|BS",
        value: NUMBER,
        units: CHEM_UNITS,
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "hdl",
        label: r"HDL(?:[\s-]*(?:cholesterol|chol|C))?",
        value: NUMBER,
        units: CHEM_UNITS,
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "ldl",
        label: r"LDL(?:[\s-]*(?:cholesterol|chol|C))?",
        value: NUMBER,
        units: CHEM_UNITS,
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "triglycerides",
        label: r"triglycerides?|TG",
        value: NUMBER,
        units: CHEM_UNITS,
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "cholesterol",
        label: r"(?:total\s+)?cholesterol|(?:total\s+)?chol",
        value: NUMBER,
        units: CHEM_UNITS,
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "hemoglobin",
        label: r"ha?emoglobin|Hb|HGB",
        value: NUMBER,
        units: r"g\s*/\s*dL|g\s*/\s*L",
        default_unit: "g/dL",
    },
    MetricDefinition {
        key: "creatinine",
        label: r"(?:serum\s+)?creatinine|Cr",
        value: NUMBER,
        units: r"mg\s*/\s*dL|[uµμ]mol\s*/\s*L",
        default_unit: "mg/dL",
    },
    MetricDefinition {
        key: "tsh",
        label: r"TSH|thyroid\s+stimulating\s+hormone",
        value: NUMBER,
        units: r"[uµμ]IU\s*/\s*mL|mIU\s*/\s*L",
        default_unit: "mIU/L",
    },
    MetricDefinition {
        key: "temperature",
        label: r"temp(?:erature)?",
        value: NUMBER,
        units: r"°\s*[CF]|deg(?:rees)?\s*[CF]|fahrenheit|celsius|[CF]\b",
        default_unit: "°C",
    },
    MetricDefinition {
        key: "spo2",
        label: r"SpO2|O2\s+sat(?:uration)?|oxygen\s+saturation",
        value: r"\d{2,3}",
        units: r"%",
        default_unit: "%",
    },
    MetricDefinition {
        key: "bmi",
        label: r"BMI|body\s+mass\s+index",
        value: NUMBER,
        units: r"kg\s*/\s*m(?:2|²|\^2)",
        default_unit: "kg/m²",
    },
    MetricDefinition {
        key: "wbc",
        label: r"WBC|white\s+blood\s+cells?(?:\s+count)?|leukocytes",
        value: NUMBER,
        units: COUNT_UNITS,
        default_unit: "x10^3/µL",
    },
    MetricDefinition {
        key: "platelets",
        label: r"platelets?(?:\s+count)?|PLT",
        value: NUMBER,
        units: COUNT_UNITS,
        default_unit: "x10^3/µL",
    },
];

#[derive(Error, Debug, PartialEq)]
pub enum VocabularyError {
    #[error("Duplicate metric key: {0}")]
    DuplicateKey(&'static str),

    #[error("Metric {key} has an invalid pattern: {reason}")]
    InvalidPattern { key: &'static str, reason: String },
}

struct CompiledMetric {
    key: &'static str,
    default_unit: &'static str,
    pattern: Regex,
}

/// The compiled vocabulary. Built once at startup, shared read-only.
pub struct MetricVocabulary {
    metrics: Vec<CompiledMetric>,
}

impl MetricVocabulary {
    pub fn new() -> Result<Self, VocabularyError> {
        Self::from_table(METRIC_TABLE)
    }

    /// Validate and compile a table: keys unique, every pattern compiles.
    pub fn from_table(table: &'static [MetricDefinition]) -> Result<Self, VocabularyError> {
        let mut seen = HashSet::new();
        let mut metrics = Vec::with_capacity(table.len());

        for def in table {
            if !seen.insert(def.key) {
                return Err(VocabularyError::DuplicateKey(def.key));
            }
            let source = format!(
                r"(?i)\b(?:{label})\b(?:\s*\([^)\n]{{0,30}}\))?\s*(?:[:=]|\bis\b|-)?\s*(?P<value>{value})(?:\s*(?P<unit>{units}))?",
                label = def.label,
                value = def.value,
                units = def.units,
            );
            let pattern = Regex::new(&source).map_err(|e| VocabularyError::InvalidPattern {
                key: def.key,
                reason: e.to_string(),
            })?;
            metrics.push(CompiledMetric {
                key: def.key,
                default_unit: def.default_unit,
                pattern,
            });
        }

        Ok(Self { metrics })
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Extract every known metric from `text`. The first occurrence of a
    /// metric wins; unmatched text is simply ignored.
    pub fn parse(&self, text: &str) -> MetricMap {
        let mut found = MetricMap::new();
        let mut claimed: Vec<Range<usize>> = Vec::new();

        for metric in &self.metrics {
            for caps in metric.pattern.captures_iter(text) {
                let Some(whole) = caps.get(0) else { continue };
                let span = whole.range();
                if claimed.iter().any(|c| c.start < span.end && span.start < c.end) {
                    continue;
                }
                claimed.push(span);

                if found.contains_key(metric.key) {
                    continue;
                }
                let Some(value) = caps.name("value") else { continue };
                let unit = caps
                    .name("unit")
                    .map(|u| canonical_unit(u.as_str()))
                    .unwrap_or_else(|| metric.default_unit.to_string());
                found.insert(
                    metric.key.to_string(),
                    MetricValue::new(canonical_value(value.as_str()), unit),
                );
            }
        }

        found
    }
}

/// `"120 / 80"` → `"120/80"`, `"13,5"` → `"13.5"`, `"250,000"` → `"250000"`.
fn canonical_value(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let integer = compact.split('.').next().unwrap_or_default();
    let grouped = integer.contains(',') && integer.split(',').skip(1).all(|g| g.len() == 3);
    if grouped {
        compact.replace(',', "")
    } else {
        compact.replace(',', ".")
    }
}

fn canonical_unit(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let key = compact.to_lowercase().replace('μ', "µ").replace('^', "");
    let canonical = match key.as_str() {
        "mg/dl" => "mg/dL",
        "mmol/l" => "mmol/L",
        "mmol/mol" => "mmol/mol",
        "g/dl" => "g/dL",
        "g/l" => "g/L",
        "mmhg" => "mmHg",
        "%" => "%",
        "bpm" | "beats/min" | "beat/min" | "/min" => "bpm",
        "µmol/l" | "umol/l" => "µmol/L",
        "miu/l" => "mIU/L",
        "µiu/ml" | "uiu/ml" => "µIU/mL",
        "°c" | "degc" | "degreesc" | "celsius" | "c" => "°C",
        "°f" | "degf" | "degreesf" | "fahrenheit" | "f" => "°F",
        "kg/m2" | "kg/m²" => "kg/m²",
        "x103/µl" | "103/µl" | "x103/ul" | "103/ul" | "k/µl" | "k/ul" => "x10^3/µL",
        "x109/l" | "109/l" => "x10^9/L",
        "cells/µl" | "cells/ul" => "cells/µL",
        "/µl" | "/ul" => "/µL",
        _ => return compact,
    };
    canonical.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> MetricMap {
        MetricVocabulary::new().unwrap().parse(text)
    }

    fn shown(map: &MetricMap, key: &str) -> Option<String> {
        map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn builtin_table_is_consistent() {
        let vocab = MetricVocabulary::new().unwrap();
        assert_eq!(vocab.len(), METRIC_TABLE.len());
        assert_eq!(VOCABULARY_VERSION, 2);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        static DUPED: &[MetricDefinition] = &[
            MetricDefinition { key: "x", label: "a", value: NUMBER, units: "%", default_unit: "%" },
            MetricDefinition { key: "x", label: "b", value: NUMBER, units: "%", default_unit: "%" },
        ];
        assert_eq!(
            MetricVocabulary::from_table(DUPED).err(),
            Some(VocabularyError::DuplicateKey("x"))
        );
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        static BROKEN: &[MetricDefinition] = &[MetricDefinition {
            key: "broken",
            label: "(unclosed",
            value: NUMBER,
            units: "%",
            default_unit: "%",
        }];
        assert!(matches!(
            MetricVocabulary::from_table(BROKEN),
            Err(VocabularyError::InvalidPattern { key: "broken", .. })
        ));
    }

    #[test]
    fn glucose_with_colon_and_unit() {
        let m = parse("Glucose: 95 mg/dL");
        assert_eq!(m.len(), 1);
        assert_eq!(shown(&m, "glucose").as_deref(), Some("95 mg/dL"));
    }

    #[test]
    fn labels_are_case_insensitive_and_units_canonical() {
        let m = parse("FASTING BLOOD GLUCOSE 5,4 MMOL/L");
        assert_eq!(shown(&m, "glucose").as_deref(), Some("5.4 mmol/L"));
    }

    #[test]
    fn blood_pressure_value_and_default_unit() {
        let m = parse("Blood Pressure: 120/80 mmHg");
        assert_eq!(shown(&m, "blood_pressure").as_deref(), Some("120/80 mmHg"));
        let m = parse("BP 130 / 85");
        assert_eq!(shown(&m, "blood_pressure").as_deref(), Some("130/85 mmHg"));
    }

    #[test]
    fn specific_fractions_win_over_total_cholesterol() {
        let m = parse(
            "Total Cholesterol: 190 mg/dL\nHDL Cholesterol: 52 mg/dL\nLDL-C 110 mg/dL\nTriglycerides 140 mg/dL",
        );
        assert_eq!(shown(&m, "cholesterol").as_deref(), Some("190 mg/dL"));
        assert_eq!(shown(&m, "hdl").as_deref(), Some("52 mg/dL"));
        assert_eq!(shown(&m, "ldl").as_deref(), Some("110 mg/dL"));
        assert_eq!(shown(&m, "triglycerides").as_deref(), Some("140 mg/dL"));
    }

    #[test]
    fn fraction_alone_does_not_leak_into_total() {
        let m = parse("HDL cholesterol 48 mg/dL");
        assert_eq!(shown(&m, "hdl").as_deref(), Some("48 mg/dL"));
        assert!(!m.contains_key("cholesterol"));
    }

    #[test]
    fn hba1c_is_not_hemoglobin() {
        let m = parse("HbA1c 6.1%\nHemoglobin 13,5 g/dl");
        assert_eq!(shown(&m, "hba1c").as_deref(), Some("6.1 %"));
        assert_eq!(shown(&m, "hemoglobin").as_deref(), Some("13.5 g/dL"));
    }

    #[test]
    fn first_occurrence_wins() {
        let m = parse("Glucose 95 mg/dL (fasting)\nGlucose 140 mg/dL (2h post meal)");
        assert_eq!(shown(&m, "glucose").as_deref(), Some("95 mg/dL"));
    }

    #[test]
    fn parenthetical_between_label_and_value() {
        let m = parse("Glucose (fasting): 101 mg/dL");
        assert_eq!(shown(&m, "glucose").as_deref(), Some("101 mg/dL"));
    }

    #[test]
    fn vitals_and_counts() {
        let m = parse(
            "Pulse: 72 bpm\nTemp 37.2 °C\nSpO2 98 %\nBMI 24.3 kg/m2\nWBC 6.8 x10^3/uL\nPlatelets 250 K/µL\nTSH 2.1 uIU/mL\nCreatinine 88 umol/L",
        );
        assert_eq!(shown(&m, "pulse").as_deref(), Some("72 bpm"));
        assert_eq!(shown(&m, "temperature").as_deref(), Some("37.2 °C"));
        assert_eq!(shown(&m, "spo2").as_deref(), Some("98 %"));
        assert_eq!(shown(&m, "bmi").as_deref(), Some("24.3 kg/m²"));
        assert_eq!(shown(&m, "wbc").as_deref(), Some("6.8 x10^3/µL"));
        assert_eq!(shown(&m, "platelets").as_deref(), Some("250 x10^3/µL"));
        assert_eq!(shown(&m, "tsh").as_deref(), Some("2.1 µIU/mL"));
        assert_eq!(shown(&m, "creatinine").as_deref(), Some("88 µmol/L"));
    }

    #[test]
    fn thousands_separators_are_not_decimal_marks() {
        let m = parse("Platelets: 250,000 /uL");
        assert_eq!(shown(&m, "platelets").as_deref(), Some("250000 /µL"));
        let m = parse("WBC 7,200 cells/uL");
        assert_eq!(shown(&m, "wbc").as_deref(), Some("7200 cells/µL"));
        let m = parse("Hemoglobin 13,5 g/dL");
        assert_eq!(shown(&m, "hemoglobin").as_deref(), Some("13.5 g/dL"));
    }

    #[test]
    fn bare_temperature_units() {
        let m = parse("Temp: 98.6 F");
        assert_eq!(shown(&m, "temperature").as_deref(), Some("98.6 °F"));
        let m = parse("Temperature 37.1 C");
        assert_eq!(shown(&m, "temperature").as_deref(), Some("37.1 °C"));
        let m = parse("Temp 38 Celsius");
        assert_eq!(shown(&m, "temperature").as_deref(), Some("38 °C"));
    }

    #[test]
    fn bs_is_a_glucose_label() {
        let m = parse("BS 110 mg/dL");
        assert_eq!(shown(&m, "glucose").as_deref(), Some("110 mg/dL"));
    }

    #[test]
    fn unmatched_text_yields_empty_map() {
        assert!(parse("Patient seen for routine follow-up. No complaints.").is_empty());
        assert!(parse("").is_empty());
    }
}
