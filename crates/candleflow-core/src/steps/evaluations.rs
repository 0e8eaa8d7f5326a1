//! Evaluations return `true` when the condition they check for is present,
//! i.e. when the dataset fails the check.

use polars::prelude::*;
use serde::Deserialize;

use crate::config::StepArgs;
use crate::dates::{date_days, parse_date_range};
use crate::error::Result;
use crate::steps::{group_indices, NoArgs};

pub fn null_data_check(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    let _: NoArgs = args.parse("null_data_check")?;
    Ok(data.get_columns().iter().any(|column| column.null_count() > 0))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateRangeArgs {
    date_range: [String; 2],
    date_column: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupedDateRangeArgs {
    groupby_columns: Vec<String>,
    date_range: [String; 2],
    date_column: String,
}

/// True when any date lies before the range start or after the range end.
pub fn date_range_check(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    const STEP: &str = "date_range_check";
    let args: DateRangeArgs = args.parse(STEP)?;
    let (start, end) = parse_date_range(STEP, &args.date_range)?;
    let days = date_days(data, &args.date_column, STEP)?;
    Ok(outside_range(days.iter().flatten().copied(), start, end))
}

pub fn date_range_check_by_group(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    const STEP: &str = "date_range_check_by_group";
    let args: GroupedDateRangeArgs = args.parse(STEP)?;
    let (start, end) = parse_date_range(STEP, &args.date_range)?;
    let days = date_days(data, &args.date_column, STEP)?;
    let groups = group_indices(data, &args.groupby_columns, STEP)?;

    Ok(groups.iter().any(|rows| {
        outside_range(rows.iter().filter_map(|&row| days[row]), start, end)
    }))
}

fn outside_range(mut days: impl Iterator<Item = i32>, start: i32, end: i32) -> bool {
    days.any(|day| day < start || day > end)
}

/// True when the dates do not reach back to the range start or forward to the
/// range end.
pub fn date_coverage_check(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    const STEP: &str = "date_coverage_check";
    let args: DateRangeArgs = args.parse(STEP)?;
    let (start, end) = parse_date_range(STEP, &args.date_range)?;
    let days = date_days(data, &args.date_column, STEP)?;

    let present = days.iter().flatten();
    match (present.clone().min(), present.max()) {
        (Some(&first), Some(&last)) => Ok(first > start || last < end),
        _ => Ok(true),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContinuityArgs {
    date_column: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupedContinuityArgs {
    groupby_columns: Vec<String>,
    date_column: String,
}

pub fn date_continuity_check(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    const STEP: &str = "date_continuity_check";
    let args: ContinuityArgs = args.parse(STEP)?;
    let days = date_days(data, &args.date_column, STEP)?;
    Ok(has_gap(days.into_iter().flatten().collect()))
}

pub fn date_continuity_check_by_group(data: &DataFrame, args: &StepArgs) -> Result<bool> {
    const STEP: &str = "date_continuity_check_by_group";
    let args: GroupedContinuityArgs = args.parse(STEP)?;
    let days = date_days(data, &args.date_column, STEP)?;
    let groups = group_indices(data, &args.groupby_columns, STEP)?;

    Ok(groups
        .iter()
        .any(|rows| has_gap(rows.iter().filter_map(|&row| days[row]).collect())))
}

fn has_gap(mut days: Vec<i32>) -> bool {
    days.sort_unstable();
    days.windows(2).any(|pair| pair[1] - pair[0] > 1)
}
