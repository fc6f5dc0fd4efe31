use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::AggregateError;

/// Production type id the line uses for final-assembly records. Every other
/// id is grouped under [`ProductionScope::Other`].
pub const FINAL_ASSEMBLY_TYPE_ID: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionScope {
    FinalAssembly,
    Other,
}

impl ProductionScope {
    /// Maps the dashboard selection code (`0` final assembly, `1` other).
    pub fn from_code(code: i32) -> Result<Self, AggregateError> {
        match code {
            0 => Ok(Self::FinalAssembly),
            1 => Ok(Self::Other),
            other => Err(AggregateError::UnknownScope(other)),
        }
    }

    pub fn matches(self, production_type_id: i32) -> bool {
        match self {
            Self::FinalAssembly => production_type_id == FINAL_ASSEMBLY_TYPE_ID,
            Self::Other => production_type_id != FINAL_ASSEMBLY_TYPE_ID,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FinalAssembly => "final assembly",
            Self::Other => "other production types",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekRange {
    pub start: i32,
    pub end: i32,
}

impl FromStr for WeekRange {
    type Err = AggregateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || AggregateError::InvalidWeekRange(value.to_string());
        let (start, end) = value.split_once("..").ok_or_else(invalid)?;
        let start: i32 = start.trim().parse().map_err(|_| invalid())?;
        let end: i32 = end.trim().parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryWindow {
    /// The N most recent distinct production dates.
    LastDays(u32),
    /// Inclusive range of week keys.
    Weeks(WeekRange),
}

impl fmt::Display for QueryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastDays(days) => write!(f, "last {days} production days"),
            Self::Weeks(range) if range.start == range.end => write!(f, "week {}", range.start),
            Self::Weeks(range) => write!(f, "weeks {} to {}", range.start, range.end),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefectRow {
    pub criterion: String,
    pub quantity: i64,
    pub production_type_id: i32,
    pub defect_id: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct DailyRecord {
    pub date_id: i32,
    pub week_number: i32,
    pub model_name: String,
    pub production_input: i64,
    pub production_output: i64,
    /// `None` when no defects were logged for the date and model.
    pub defect_quantity: Option<i64>,
    pub production_type_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Defect,
    Total,
    NoFailures,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedDefect {
    pub criterion: String,
    pub quantity: i64,
    pub defect_id: Option<i32>,
    pub dppm: Option<i64>,
    pub kind: RowKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WeeklyRate {
    pub defect_quantity: i64,
    pub production_input: i64,
}

impl WeeklyRate {
    pub fn failure_rate_pct(&self) -> Option<f64> {
        percentage(self.defect_quantity, self.production_input)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub scope: ProductionScope,
    pub defects: Vec<RankedDefect>,
    pub weekly_rates: BTreeMap<i32, WeeklyRate>,
    pub model_outputs: BTreeMap<String, i64>,
    pub total_production_input: i64,
    pub total_defect_quantity: i64,
    pub earliest_date_id: Option<i32>,
    pub top_defect_ids: Vec<i32>,
}

impl AggregationResult {
    pub fn overall_failure_rate_pct(&self) -> Option<f64> {
        percentage(self.total_defect_quantity, self.total_production_input)
    }

    pub fn has_failures(&self) -> bool {
        self.defects
            .iter()
            .any(|row| row.kind != RowKind::NoFailures)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalRate {
    pub defect_id: i32,
    pub criterion: String,
    pub quantity: i64,
    pub production_input: i64,
    pub dppm: Option<i64>,
}

fn percentage(part: i64, whole: i64) -> Option<f64> {
    if whole <= 0 {
        None
    } else {
        Some(part as f64 / whole as f64 * 100.0)
    }
}
