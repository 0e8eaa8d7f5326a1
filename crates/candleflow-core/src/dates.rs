use chrono::{Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;

use crate::error::{PipelineError, Result};

// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

pub(crate) fn day_number(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub(crate) fn from_day_number(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

pub(crate) fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches('Z');
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    parse_datetime(trimmed).map(|dt| dt.date())
}

/// Parses a `[start, end]` pair from step arguments into inclusive day numbers.
pub(crate) fn parse_date_range(step: &str, range: &[String; 2]) -> Result<(i32, i32)> {
    let start = parse_date(&range[0]).ok_or_else(|| {
        PipelineError::step_failed(step, format!("invalid range start {:?}", range[0]))
    })?;
    let end = parse_date(&range[1]).ok_or_else(|| {
        PipelineError::step_failed(step, format!("invalid range end {:?}", range[1]))
    })?;
    if end < start {
        return Err(PipelineError::step_failed(
            step,
            format!("range end {end} precedes range start {start}"),
        ));
    }
    Ok((day_number(start), day_number(end)))
}

/// Reads a date-like column (string, Date or Datetime) as day numbers since the epoch.
pub(crate) fn date_days(df: &DataFrame, column: &str, step: &str) -> Result<Vec<Option<i32>>> {
    let source = df
        .column(column)
        .map_err(|_| PipelineError::step_failed(step, format!("column {column} not found")))?;

    match source.dtype() {
        DataType::Date => physical_days(source),
        DataType::Datetime(_, _) => physical_days(&source.cast(&DataType::Date)?),
        DataType::String => {
            let values = source.as_materialized_series().str()?;
            let mut days = Vec::with_capacity(values.len());
            for value in values.into_iter() {
                match value {
                    None => days.push(None),
                    Some(raw) => {
                        let date = parse_date(raw).ok_or_else(|| {
                            PipelineError::step_failed(
                                step,
                                format!("column {column} has unparseable date {raw:?}"),
                            )
                        })?;
                        days.push(Some(day_number(date)));
                    }
                }
            }
            Ok(days)
        }
        other => Err(PipelineError::step_failed(
            step,
            format!("column {column} has dtype {other}, expected a date"),
        )),
    }
}

fn physical_days(column: &Column) -> Result<Vec<Option<i32>>> {
    let physical = column.cast(&DataType::Int32)?;
    let days = physical.as_materialized_series().i32()?;
    Ok(days.into_iter().collect())
}

pub(crate) fn date_column(name: &str, days: Vec<Option<i32>>) -> Result<Column> {
    let series = Series::new(name.into(), days).cast(&DataType::Date)?;
    Ok(series.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_numbers_are_epoch_relative() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(day_number(epoch), 0);
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_eq!(day_number(date), 18_262);
        assert_eq!(from_day_number(18_262), Some(date));
    }

    #[test]
    fn parses_common_date_spellings() {
        let expected = NaiveDate::from_ymd_opt(2021, 3, 1);
        assert_eq!(parse_date("2021-03-01"), expected);
        assert_eq!(parse_date("2021-03-01 00:00:00"), expected);
        assert_eq!(parse_date("2021-03-01T13:45:00.000000000"), expected);
        assert_eq!(parse_date("03/01/2021"), expected);
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let range = ["2020-12-31".to_string(), "2020-01-01".to_string()];
        assert!(parse_date_range("date_range_check", &range).is_err());
    }

    #[test]
    fn string_dates_are_read_as_day_numbers() {
        let df = df!["date" => [Some("1970-01-02"), None, Some("1970-01-10")]].unwrap();
        let days = date_days(&df, "date", "test").unwrap();
        assert_eq!(days, vec![Some(1), None, Some(9)]);
    }

    #[test]
    fn unparseable_dates_fail_the_step() {
        let df = df!["date" => ["not a date"]].unwrap();
        let err = date_days(&df, "date", "format_date_columns").unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { step, .. } if step == "format_date_columns"));
    }
}
