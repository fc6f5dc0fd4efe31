use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::AggregateError;
use crate::models::{
    AggregationResult, DailyRecord, DefectRow, ProductionScope, RankedDefect, RowKind, WeeklyRate,
};

pub const PARETO_LIMIT: usize = 9;
pub const TOP_DEFECT_LIMIT: usize = 5;
pub const TOP_DEFECT_COVERAGE: f64 = 0.7;
pub const TOTAL_LABEL: &str = "TOTAL";
pub const NO_FAILURES_LABEL: &str = "(no failures reported)";

/// Builds the dashboard view for one scope from unfiltered row sets.
///
/// Rows from every production type may be passed in; only those matching
/// `scope` contribute. Any negative count in either input is rejected
/// before anything is computed.
pub fn aggregate(
    scope: ProductionScope,
    defect_rows: &[DefectRow],
    daily_records: &[DailyRecord],
) -> Result<AggregationResult, AggregateError> {
    validate(defect_rows, daily_records)?;

    let defects: Vec<&DefectRow> = defect_rows
        .iter()
        .filter(|row| scope.matches(row.production_type_id))
        .collect();
    let records: Vec<&DailyRecord> = daily_records
        .iter()
        .filter(|record| scope.matches(record.production_type_id))
        .collect();

    let total_production_input = checked_sum(
        "production_input",
        records.iter().map(|r| r.production_input),
    )?;
    let total_defect_quantity =
        checked_sum("quantity", defects.iter().map(|r| r.quantity))?;
    let totals = DailyTotals::accumulate(&records)?;
    let defects = merge_by_criterion(defects)?;

    if defects.is_empty() {
        debug!(scope = scope.label(), records = records.len(), "no defects in window");
        return Ok(AggregationResult {
            scope,
            defects: vec![RankedDefect {
                criterion: NO_FAILURES_LABEL.to_string(),
                quantity: 0,
                defect_id: None,
                dppm: None,
                kind: RowKind::NoFailures,
            }],
            weekly_rates: totals.weekly_rates,
            model_outputs: totals.model_outputs,
            total_production_input,
            total_defect_quantity,
            earliest_date_id: None,
            top_defect_ids: Vec::new(),
        });
    }

    let ranked = rank_defects(defects, total_defect_quantity, total_production_input);
    let top_defect_ids = select_top_defect_ids(&ranked);

    debug!(
        scope = scope.label(),
        defects = ranked.len(),
        records = records.len(),
        total_production_input,
        total_defect_quantity,
        "aggregated dashboard window"
    );

    Ok(AggregationResult {
        scope,
        defects: ranked,
        weekly_rates: totals.weekly_rates,
        model_outputs: totals.model_outputs,
        total_production_input,
        total_defect_quantity,
        earliest_date_id: totals.earliest_date_id,
        top_defect_ids,
    })
}

/// Defects per million against `production_input`, rounded half up.
/// Returns `None` when there is no input to measure against.
pub fn dppm(quantity: i64, production_input: i64) -> Option<i64> {
    if production_input <= 0 {
        return None;
    }
    let scaled = i128::from(quantity) * 1_000_000;
    let denominator = i128::from(production_input);
    let rounded = (scaled * 2 + denominator) / (denominator * 2);
    Some(i64::try_from(rounded).unwrap_or(i64::MAX))
}

fn validate(defect_rows: &[DefectRow], daily_records: &[DailyRecord]) -> Result<(), AggregateError> {
    for row in defect_rows {
        non_negative("quantity", row.quantity)?;
    }
    for record in daily_records {
        non_negative("production_input", record.production_input)?;
        non_negative("production_output", record.production_output)?;
        if let Some(quantity) = record.defect_quantity {
            non_negative("defect_quantity", quantity)?;
        }
    }
    Ok(())
}

fn non_negative(field: &'static str, value: i64) -> Result<(), AggregateError> {
    if value < 0 {
        Err(AggregateError::NegativeValue { field, value })
    } else {
        Ok(())
    }
}

fn checked_sum(
    field: &'static str,
    mut values: impl Iterator<Item = i64>,
) -> Result<i64, AggregateError> {
    values.try_fold(0_i64, |total, value| checked_add(field, total, value))
}

fn checked_add(field: &'static str, total: i64, value: i64) -> Result<i64, AggregateError> {
    total
        .checked_add(value)
        .ok_or(AggregateError::Overflow { field })
}

/// Collapses rows sharing a criterion (the same defect logged under several
/// production types of one scope) into one row, keeping first-seen order.
/// The merged row carries the lowest defect id of its members.
fn merge_by_criterion(defects: Vec<&DefectRow>) -> Result<Vec<DefectRow>, AggregateError> {
    let mut merged: Vec<DefectRow> = Vec::with_capacity(defects.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for row in defects {
        match positions.get(row.criterion.as_str()) {
            Some(&index) => {
                let existing = &mut merged[index];
                existing.quantity = checked_add("quantity", existing.quantity, row.quantity)?;
                existing.defect_id = match (existing.defect_id, row.defect_id) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            None => {
                positions.insert(row.criterion.as_str(), merged.len());
                merged.push(row.clone());
            }
        }
    }

    Ok(merged)
}

fn rank_defects(
    mut defects: Vec<DefectRow>,
    total_defect_quantity: i64,
    total_production_input: i64,
) -> Vec<RankedDefect> {
    defects.sort_by(|a, b| compare_for_pareto(a, b));

    let mut ranked: Vec<RankedDefect> = defects
        .into_iter()
        .take(PARETO_LIMIT)
        .map(|row| RankedDefect {
            dppm: dppm(row.quantity, total_production_input),
            criterion: row.criterion,
            quantity: row.quantity,
            defect_id: row.defect_id,
            kind: RowKind::Defect,
        })
        .collect();

    ranked.push(RankedDefect {
        criterion: TOTAL_LABEL.to_string(),
        quantity: total_defect_quantity,
        defect_id: None,
        dppm: dppm(total_defect_quantity, total_production_input),
        kind: RowKind::Total,
    });
    ranked
}

fn compare_for_pareto(a: &DefectRow, b: &DefectRow) -> Ordering {
    b.quantity
        .cmp(&a.quantity)
        .then_with(|| a.criterion.cmp(&b.criterion))
}

/// Picks the defect ids fed to the historical comparison query.
fn select_top_defect_ids(ranked: &[RankedDefect]) -> Vec<i32> {
    // Suspect: the running share divides each dppm by the number of ranked
    // rows (TOTAL included), not by the total quantity, so the 0.7 cut-off
    // is usually crossed by the first row. Existing dashboards depend on
    // this selection, so the formula stays literal.
    let divisor = ranked.len() as f64;
    let mut coverage = 0.0;
    let mut ids = Vec::new();

    for (scanned, row) in ranked
        .iter()
        .filter(|row| row.kind == RowKind::Defect)
        .enumerate()
    {
        // Rows without an id still count toward the share.
        if let Some(defect_id) = row.defect_id {
            ids.push(defect_id);
        }
        coverage += row.dppm.unwrap_or(0) as f64 / divisor;
        if scanned + 1 >= TOP_DEFECT_LIMIT || coverage > TOP_DEFECT_COVERAGE {
            break;
        }
    }

    ids
}

#[derive(Default)]
struct DailyTotals {
    weekly_rates: BTreeMap<i32, WeeklyRate>,
    model_outputs: BTreeMap<String, i64>,
    earliest_date_id: Option<i32>,
}

impl DailyTotals {
    fn accumulate(records: &[&DailyRecord]) -> Result<Self, AggregateError> {
        let mut totals = Self::default();

        for record in records {
            let week = totals.weekly_rates.entry(record.week_number).or_default();
            // A missing defect reading means nothing was logged that day.
            week.defect_quantity = checked_add(
                "defect_quantity",
                week.defect_quantity,
                record.defect_quantity.unwrap_or(0),
            )?;
            week.production_input =
                checked_add("production_input", week.production_input, record.production_input)?;

            let output = totals
                .model_outputs
                .entry(record.model_name.clone())
                .or_insert(0);
            *output = checked_add("production_output", *output, record.production_output)?;

            totals.earliest_date_id = Some(match totals.earliest_date_id {
                Some(current) => current.min(record.date_id),
                None => record.date_id,
            });
        }

        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FINAL_ASSEMBLY_TYPE_ID;

    const OTHER_TYPE_ID: i32 = 1;

    fn defect(criterion: &str, quantity: i64, defect_id: i32) -> DefectRow {
        DefectRow {
            criterion: criterion.to_string(),
            quantity,
            production_type_id: FINAL_ASSEMBLY_TYPE_ID,
            defect_id: Some(defect_id),
        }
    }

    fn record(
        date_id: i32,
        week_number: i32,
        model_name: &str,
        production_input: i64,
        production_output: i64,
        defect_quantity: Option<i64>,
    ) -> DailyRecord {
        DailyRecord {
            date_id,
            week_number,
            model_name: model_name.to_string(),
            production_input,
            production_output,
            defect_quantity,
            production_type_id: FINAL_ASSEMBLY_TYPE_ID,
        }
    }

    fn twelve_defects() -> Vec<DefectRow> {
        [100, 90, 80, 70, 60, 50, 40, 30, 20, 10, 5, 1]
            .iter()
            .enumerate()
            .map(|(index, quantity)| defect(&format!("defect-{index:02}"), *quantity, index as i32 + 1))
            .collect()
    }

    #[test]
    fn worked_scenario_matches_dashboard_numbers() {
        let defects = vec![defect("solder bridge", 5, 11), defect("scratch", 2, 12)];
        let records = vec![
            record(20261012, 1, "A", 100, 90, Some(5)),
            record(20261013, 1, "A", 50, 45, Some(2)),
        ];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        assert_eq!(
            result.weekly_rates.get(&1),
            Some(&WeeklyRate {
                defect_quantity: 7,
                production_input: 150,
            })
        );
        assert_eq!(result.model_outputs.get("A"), Some(&135));
        assert_eq!(result.total_production_input, 150);

        let total = result.defects.last().unwrap();
        assert_eq!(total.kind, RowKind::Total);
        assert_eq!(total.quantity, 7);
        assert_eq!(total.dppm, Some(46667));

        assert_eq!(result.defects[0].dppm, Some(33333));
        assert_eq!(result.defects[1].dppm, Some(13333));
        assert_eq!(result.earliest_date_id, Some(20261012));
        assert_eq!(result.top_defect_ids, vec![11]);
    }

    #[test]
    fn empty_defects_yield_single_sentinel_row() {
        let mut other = defect("cosmetic", 4, 1);
        other.production_type_id = OTHER_TYPE_ID;
        let records = vec![record(20261012, 42, "A", 100, 95, None)];

        let result = aggregate(ProductionScope::FinalAssembly, &[other], &records).unwrap();

        assert_eq!(result.defects.len(), 1);
        assert_eq!(result.defects[0].criterion, NO_FAILURES_LABEL);
        assert_eq!(result.defects[0].quantity, 0);
        assert_eq!(result.defects[0].kind, RowKind::NoFailures);
        assert!(result.top_defect_ids.is_empty());
        assert_eq!(result.earliest_date_id, None);
        assert!(!result.has_failures());
        assert_eq!(result.model_outputs.get("A"), Some(&95));
    }

    #[test]
    fn pareto_truncates_to_nine_plus_total() {
        let defects = twelve_defects();
        let records = vec![record(20261012, 42, "A", 1_000_000, 990_000, Some(556))];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        assert_eq!(result.defects.len(), 10);
        let quantities: Vec<i64> = result.defects[..9].iter().map(|r| r.quantity).collect();
        assert_eq!(quantities, vec![100, 90, 80, 70, 60, 50, 40, 30, 20]);

        let total = result.defects.last().unwrap();
        assert_eq!(total.criterion, TOTAL_LABEL);
        assert_eq!(total.kind, RowKind::Total);
        assert_eq!(total.quantity, 556);
        assert_eq!(result.total_defect_quantity, 556);
    }

    #[test]
    fn total_row_is_last_and_sums_filtered_rows() {
        let mut defects = vec![defect("a", 3, 1), defect("b", 40, 2)];
        let mut foreign = defect("c", 500, 3);
        foreign.production_type_id = OTHER_TYPE_ID;
        defects.push(foreign);

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &[]).unwrap();

        assert_eq!(result.defects.len(), 3);
        assert_eq!(result.defects[0].criterion, "b");
        let total = result.defects.last().unwrap();
        assert_eq!(total.kind, RowKind::Total);
        assert_eq!(total.quantity, 43);
    }

    #[test]
    fn every_row_shares_one_denominator() {
        let defects = twelve_defects();
        let records = vec![
            record(20261012, 202642, "A", 1_234, 1_200, Some(10)),
            record(20261013, 202642, "B", 4_321, 4_300, Some(20)),
        ];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        assert_eq!(result.total_production_input, 5_555);
        for row in &result.defects {
            assert_eq!(row.dppm, dppm(row.quantity, 5_555));
        }
    }

    #[test]
    fn zero_input_leaves_every_dppm_unset() {
        let defects = twelve_defects();

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &[]).unwrap();

        assert!(result.defects.iter().all(|row| row.dppm.is_none()));
        assert!(result.weekly_rates.is_empty());
        assert!(result.model_outputs.is_empty());
        assert_eq!(result.overall_failure_rate_pct(), None);
        // No rate ever accrues, so selection stops at the count cap.
        assert_eq!(result.top_defect_ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn top_defect_share_divides_by_row_count() {
        let defects = vec![
            defect("a", 3, 1),
            defect("b", 2, 2),
            defect("c", 1, 3),
            defect("d", 1, 4),
            defect("e", 1, 5),
            defect("f", 1, 6),
        ];
        let records = vec![record(20261012, 202642, "A", 1_000_000, 999_000, Some(9))];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        // 3/7 + 2/7 crosses 0.7 after two rows; dividing by the total
        // quantity (9) would have taken four.
        assert_eq!(result.defects.len(), 7);
        assert_eq!(result.top_defect_ids, vec![1, 2]);
    }

    #[test]
    fn top_defect_scan_skips_rows_without_ids() {
        let mut unnamed = defect("unclassified", 10, 0);
        unnamed.defect_id = None;
        let defects = vec![unnamed, defect("a", 1, 7)];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &[]).unwrap();

        assert_eq!(result.defects[0].criterion, "unclassified");
        assert_eq!(result.top_defect_ids, vec![7]);
    }

    #[test]
    fn unclassified_rows_count_toward_top_defect_share() {
        let mut unnamed = defect("unclassified", 3, 0);
        unnamed.defect_id = None;
        let defects = vec![unnamed, defect("a", 2, 7), defect("b", 1, 8), defect("c", 1, 9)];
        let records = vec![record(20261012, 202642, "A", 1_000_000, 999_000, Some(7))];

        let result = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        // 3/5 from the unclassified row plus 2/5 crosses 0.7 at "a".
        assert_eq!(result.defects.len(), 5);
        assert_eq!(result.top_defect_ids, vec![7]);
    }

    #[test]
    fn shared_criterion_merges_across_production_types() {
        let mut cosmetic_smt = defect("cosmetic", 4, 21);
        cosmetic_smt.production_type_id = OTHER_TYPE_ID;
        let mut cosmetic_dip = defect("cosmetic", 6, 20);
        cosmetic_dip.production_type_id = 2;
        let mut burr = defect("burr", 5, 22);
        burr.production_type_id = OTHER_TYPE_ID;

        let result =
            aggregate(ProductionScope::Other, &[cosmetic_smt, cosmetic_dip, burr], &[]).unwrap();

        assert_eq!(result.defects.len(), 3);
        assert_eq!(result.defects[0].criterion, "cosmetic");
        assert_eq!(result.defects[0].quantity, 10);
        assert_eq!(result.defects[0].defect_id, Some(20));
        assert_eq!(result.defects[1].criterion, "burr");
        assert_eq!(result.defects.last().unwrap().quantity, 15);
    }

    #[test]
    fn overflowing_totals_fail_closed() {
        let records = vec![
            record(20261012, 202642, "A", i64::MAX, 0, None),
            record(20261013, 202642, "A", i64::MAX, 0, None),
        ];
        let err = aggregate(ProductionScope::FinalAssembly, &[], &records).unwrap_err();
        assert_eq!(
            err,
            AggregateError::Overflow {
                field: "production_input",
            }
        );

        let defects = vec![defect("a", i64::MAX, 1), defect("b", 1, 2)];
        let err = aggregate(ProductionScope::FinalAssembly, &defects, &[]).unwrap_err();
        assert_eq!(err, AggregateError::Overflow { field: "quantity" });

        let outputs = vec![
            record(20261012, 202642, "A", 1, i64::MAX, None),
            record(20261013, 202642, "A", 1, 1, None),
        ];
        let err = aggregate(ProductionScope::FinalAssembly, &[], &outputs).unwrap_err();
        assert_eq!(
            err,
            AggregateError::Overflow {
                field: "production_output",
            }
        );
    }

    #[test]
    fn daily_accumulation_ignores_record_order() {
        let defects = vec![defect("a", 4, 1)];
        let records = vec![
            record(20261005, 202641, "A", 100, 98, Some(2)),
            record(20261006, 202641, "B", 80, 80, None),
            record(20261012, 202642, "A", 120, 117, Some(3)),
            record(20261013, 202642, "B", 60, 59, Some(1)),
        ];
        let mut shuffled = records.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);

        let forward = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();
        let backward = aggregate(ProductionScope::FinalAssembly, &defects, &shuffled).unwrap();

        assert_eq!(forward.weekly_rates, backward.weekly_rates);
        assert_eq!(forward.model_outputs, backward.model_outputs);
        assert_eq!(forward.earliest_date_id, Some(20261005));
        assert_eq!(backward.earliest_date_id, Some(20261005));
        assert_eq!(
            forward.weekly_rates.get(&202641),
            Some(&WeeklyRate {
                defect_quantity: 2,
                production_input: 180,
            })
        );
    }

    #[test]
    fn aggregation_is_repeatable() {
        let defects = twelve_defects();
        let records = vec![
            record(20261012, 202642, "A", 10_000, 9_900, Some(100)),
            record(20261013, 202642, "B", 7_000, 6_950, Some(50)),
        ];

        let first = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();
        let second = aggregate(ProductionScope::FinalAssembly, &defects, &records).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn ties_rank_the_same_regardless_of_input_order() {
        let forward = vec![defect("dent", 5, 1), defect("burr", 5, 2), defect("crack", 9, 3)];
        let mut backward = forward.clone();
        backward.reverse();

        let a = aggregate(ProductionScope::FinalAssembly, &forward, &[]).unwrap();
        let b = aggregate(ProductionScope::FinalAssembly, &backward, &[]).unwrap();

        let names: Vec<&str> = a.defects.iter().map(|r| r.criterion.as_str()).collect();
        assert_eq!(names, vec!["crack", "burr", "dent", TOTAL_LABEL]);
        assert_eq!(a.defects, b.defects);
    }

    #[test]
    fn other_scope_excludes_final_assembly_rows() {
        let mut cosmetic = defect("cosmetic", 6, 1);
        cosmetic.production_type_id = OTHER_TYPE_ID;
        let defects = vec![cosmetic, defect("solder", 50, 2)];

        let mut smt = record(20261012, 202642, "SMT", 300, 290, Some(6));
        smt.production_type_id = OTHER_TYPE_ID;
        let records = vec![smt, record(20261012, 202642, "A", 1_000, 950, Some(50))];

        let result = aggregate(ProductionScope::Other, &defects, &records).unwrap();

        assert_eq!(result.total_production_input, 300);
        assert_eq!(result.defects.len(), 2);
        assert_eq!(result.defects[0].criterion, "cosmetic");
        assert_eq!(result.defects[0].dppm, Some(20000));
        assert_eq!(result.model_outputs.len(), 1);
        assert_eq!(result.model_outputs.get("SMT"), Some(&290));
    }

    #[test]
    fn missing_defect_readings_count_as_zero() {
        let records = vec![
            record(20261012, 202642, "A", 100, 100, None),
            record(20261013, 202642, "A", 100, 97, Some(3)),
        ];

        let result = aggregate(ProductionScope::FinalAssembly, &[defect("a", 3, 1)], &records).unwrap();

        assert_eq!(
            result.weekly_rates.get(&202642),
            Some(&WeeklyRate {
                defect_quantity: 3,
                production_input: 200,
            })
        );
    }

    #[test]
    fn negative_counts_are_rejected() {
        let err = aggregate(ProductionScope::FinalAssembly, &[defect("a", -1, 1)], &[]).unwrap_err();
        assert_eq!(
            err,
            AggregateError::NegativeValue {
                field: "quantity",
                value: -1,
            }
        );

        let records = vec![record(20261012, 202642, "A", 100, 100, Some(-4))];
        let err = aggregate(ProductionScope::FinalAssembly, &[], &records).unwrap_err();
        assert_eq!(
            err,
            AggregateError::NegativeValue {
                field: "defect_quantity",
                value: -4,
            }
        );
    }

    #[test]
    fn dppm_rounds_half_up() {
        assert_eq!(dppm(7, 150), Some(46667));
        assert_eq!(dppm(1, 2_000_000), Some(1));
        assert_eq!(dppm(1, 3_000_000), Some(0));
        assert_eq!(dppm(0, 500), Some(0));
        assert_eq!(dppm(5, 0), None);
    }
}
