use std::collections::BTreeMap;

use polars::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::StepArgs;
use crate::dates::{date_column, date_days, parse_date_range};
use crate::error::{PipelineError, Result};
use crate::steps::{
    group_indices, keep_rows, partition_exprs, per_group, require_column, sort_by_group_then_date,
    NoArgs,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FormatDateArgs {
    date_columns: Vec<String>,
}

pub fn format_date_columns(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "format_date_columns";
    let args: FormatDateArgs = args.parse(STEP)?;
    let mut data = data;
    for column in &args.date_columns {
        to_date_column(&mut data, column, STEP)?;
    }
    Ok(data)
}

fn to_date_column(data: &mut DataFrame, column: &str, step: &str) -> Result<Vec<Option<i32>>> {
    let days = date_days(data, column, step)?;
    if require_column(data, column, step)?.dtype() != &DataType::Date {
        data.with_column(date_column(column, days.clone())?)?;
    }
    Ok(days)
}

pub fn drop_rows_with_any_null_values(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    let _: NoArgs = args.parse("drop_rows_with_any_null_values")?;
    Ok(data.drop_nulls::<String>(None)?)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DropDuplicateArgs {
    subset: Option<Vec<String>>,
    keep: Option<Value>,
}

pub fn drop_duplicate_rows(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "drop_duplicate_rows";
    let args: DropDuplicateArgs = args.parse(STEP)?;
    let keep = match &args.keep {
        None | Some(Value::Null) => UniqueKeepStrategy::First,
        Some(Value::Bool(false)) => UniqueKeepStrategy::None,
        Some(Value::String(raw)) => match raw.to_ascii_lowercase().as_str() {
            "first" => UniqueKeepStrategy::First,
            "last" => UniqueKeepStrategy::Last,
            "none" | "false" => UniqueKeepStrategy::None,
            other => {
                return Err(PipelineError::step_failed(
                    STEP,
                    format!("keep must be first, last or none, got {other:?}"),
                ))
            }
        },
        Some(other) => {
            return Err(PipelineError::step_failed(
                STEP,
                format!("keep must be first, last or false, got {other}"),
            ))
        }
    };

    if let Some(subset) = &args.subset {
        for column in subset {
            require_column(&data, column, STEP)?;
        }
    }
    Ok(data.unique_stable(args.subset.as_deref(), keep, None)?)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateRangeArgs {
    date_range: [String; 2],
    date_column: String,
}

pub fn filter_by_date_range(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "filter_by_date_range";
    let args: DateRangeArgs = args.parse(STEP)?;
    let (start, end) = parse_date_range(STEP, &args.date_range)?;

    let mut data = data;
    let days = to_date_column(&mut data, &args.date_column, STEP)?;
    let keep: Vec<bool> = days
        .iter()
        .map(|day| matches!(day, Some(d) if *d >= start && *d <= end))
        .collect();
    keep_rows(&data, &keep)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggInsertArgs {
    groupby_columns: Vec<String>,
    agg_dict: BTreeMap<String, String>,
    #[serde(default)]
    insert_dict: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
enum Aggregate {
    Sum,
    Mean,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl Aggregate {
    fn parse(raw: &str) -> Option<Self> {
        let parsed = match raw {
            "sum" => Aggregate::Sum,
            "mean" => Aggregate::Mean,
            "min" => Aggregate::Min,
            "max" => Aggregate::Max,
            "count" => Aggregate::Count,
            "first" => Aggregate::First,
            "last" => Aggregate::Last,
            _ => return None,
        };
        Some(parsed)
    }

    fn is_numeric(self) -> bool {
        matches!(self, Aggregate::Sum | Aggregate::Mean | Aggregate::Min | Aggregate::Max)
    }

    // first and last skip nulls
    fn expr(self, column: &str) -> Expr {
        let values = col(column);
        match self {
            Aggregate::Sum => values.sum(),
            Aggregate::Mean => values.mean(),
            Aggregate::Min => values.min(),
            Aggregate::Max => values.max(),
            Aggregate::Count => values.count(),
            Aggregate::First => values.drop_nulls().first(),
            Aggregate::Last => values.drop_nulls().last(),
        }
    }
}

/// Appends one aggregate row per group, groups ordered by key. Aggregated
/// columns keep their dtype, `insert_dict` columns are set to the given value,
/// all other columns are null.
pub fn agg_insert_by_group(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "agg_insert_by_group";
    let args: AggInsertArgs = args.parse(STEP)?;

    let mut aggregations = Vec::with_capacity(args.agg_dict.len());
    for (column, raw) in &args.agg_dict {
        let aggregate = Aggregate::parse(raw).ok_or_else(|| {
            PipelineError::step_failed(STEP, format!("unsupported aggregation {raw:?} for {column}"))
        })?;
        let dtype = require_column(&data, column, STEP)?.dtype();
        if aggregate.is_numeric() && !(dtype.is_integer() || dtype.is_float()) {
            return Err(PipelineError::step_failed(
                STEP,
                format!("column {column} of type {dtype} cannot be aggregated numerically"),
            ));
        }
        if args.groupby_columns.contains(column) {
            return Err(PipelineError::step_failed(
                STEP,
                format!("column {column} cannot be both grouped and aggregated"),
            ));
        }
        if !args.insert_dict.contains_key(column) {
            aggregations.push(aggregate.expr(column));
        }
    }
    for column in &args.groupby_columns {
        require_column(&data, column, STEP)?;
    }

    let mut data = data;
    for column in args.insert_dict.keys() {
        if data.column(column).is_err() {
            let filler = Series::full_null(column.as_str().into(), data.height(), &DataType::String);
            data.with_column(filler)?;
        }
    }
    if data.height() == 0 {
        return Ok(data);
    }

    let (grouped, rows) = if args.groupby_columns.is_empty() {
        let totals = data.clone().lazy().select(aggregations).collect()?;
        (totals, 1)
    } else {
        let grouped = data
            .clone()
            .lazy()
            .group_by(partition_exprs(&args.groupby_columns))
            .agg(aggregations)
            .sort(
                args.groupby_columns.iter().map(String::as_str),
                SortMultipleOptions::default(),
            )
            .collect()?;
        let rows = grouped.height();
        (grouped, rows)
    };

    let mut columns = Vec::with_capacity(data.width());
    for source in data.get_columns() {
        let name = source.name().as_str();
        let column = match (args.insert_dict.get(name), grouped.column(name)) {
            (Some(value), _) => {
                Column::from(inserted_values(source.as_materialized_series(), value, rows, STEP)?)
            }
            (None, Ok(values)) => values.cast(source.dtype())?,
            (None, Err(_)) => Column::full_null(source.name().clone(), rows, source.dtype()),
        };
        columns.push(column);
    }

    let aggregated = DataFrame::new(columns)?;
    let mut combined = data;
    combined.vstack_mut(&aggregated)?;
    Ok(combined)
}

fn inserted_values(source: &Series, value: &Value, rows: usize, step: &str) -> Result<Series> {
    if value.is_null() {
        return Ok(Series::full_null(source.name().clone(), rows, source.dtype()));
    }
    let rendered = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let literal = Series::new(source.name().clone(), vec![rendered; rows]);
    let casted = literal.cast(source.dtype())?;
    if casted.null_count() > 0 {
        return Err(PipelineError::step_failed(
            step,
            format!("value {value} does not fit column {} of type {}", source.name(), source.dtype()),
        ));
    }
    Ok(casted)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RollingArgs {
    groupby_columns: Vec<String>,
    metric_columns: Vec<String>,
    date_column: String,
    window: usize,
}

/// Adds `{metric}_rolling`: the mean of the trailing `window` rows of each group,
/// over whatever non-null values the window holds.
pub fn rolling_mean_by_date_by_group(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "rolling_mean_by_date_by_group";
    let args: RollingArgs = args.parse(STEP)?;
    if args.window == 0 {
        return Err(PipelineError::step_failed(STEP, "window must be at least 1"));
    }

    let sorted = sort_by_group_then_date(&data, &args.groupby_columns, &args.date_column, STEP)?;
    let partition = partition_exprs(&args.groupby_columns);
    let options = RollingOptionsFixedWindow {
        window_size: args.window,
        min_periods: 1,
        ..Default::default()
    };

    let mut rolled = Vec::with_capacity(args.metric_columns.len());
    for metric in &args.metric_columns {
        require_column(&sorted, metric, STEP)?;
        let mean = col(metric.as_str())
            .cast(DataType::Float64)
            .rolling_mean(options.clone());
        rolled.push(
            per_group(mean, &partition)
                .cast(DataType::Float32)
                .alias(format!("{metric}_rolling")),
        );
    }
    Ok(sorted.lazy().with_columns(rolled).collect()?)
}

const YOY_PERIODS: i64 = 365;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct YoyArgs {
    groupby_columns: Vec<String>,
    metric_columns: Vec<String>,
    date_column: String,
}

/// Adds `{metric}_yoy_pct_change` against the row 365 positions earlier in
/// the same group. Null without a prior row or when the base is zero.
pub fn yoy_percent_change_by_group(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "yoy_percent_change_by_group";
    let args: YoyArgs = args.parse(STEP)?;

    let sorted = sort_by_group_then_date(&data, &args.groupby_columns, &args.date_column, STEP)?;
    let partition = partition_exprs(&args.groupby_columns);

    let mut changes = Vec::with_capacity(args.metric_columns.len());
    for metric in &args.metric_columns {
        require_column(&sorted, metric, STEP)?;
        let current = col(metric.as_str()).cast(DataType::Float64);
        let base = per_group(current.clone().shift(lit(YOY_PERIODS)), &partition);
        changes.push(
            when(base.clone().neq(lit(0.0)))
                .then(current / base - lit(1.0))
                .otherwise(lit(NULL))
                .cast(DataType::Float32)
                .alias(format!("{metric}_yoy_pct_change")),
        );
    }
    Ok(sorted.lazy().with_columns(changes).collect()?)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FillDatesArgs {
    groupby_columns: Vec<String>,
    fill_method: Option<String>,
    date_range: [String; 2],
    date_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FillMethod {
    Forward,
    Backward,
    Nulls,
}

/// Reindexes every group to each calendar day of the range. Rows outside the
/// range are dropped; group key columns are carried onto the filled rows.
pub fn fill_missing_dates_by_group(data: DataFrame, args: &StepArgs) -> Result<DataFrame> {
    const STEP: &str = "fill_missing_dates_by_group";
    let args: FillDatesArgs = args.parse(STEP)?;
    let method = match args.fill_method.as_deref() {
        None => FillMethod::Nulls,
        Some("ffill") | Some("pad") => FillMethod::Forward,
        Some("bfill") | Some("backfill") => FillMethod::Backward,
        Some(other) => {
            return Err(PipelineError::step_failed(
                STEP,
                format!("unsupported fill method {other:?}"),
            ))
        }
    };
    let (start, end) = parse_date_range(STEP, &args.date_range)?;

    let sorted = sort_by_group_then_date(&data, &args.groupby_columns, &args.date_column, STEP)?;
    let groups = group_indices(&sorted, &args.groupby_columns, STEP)?;
    let days = date_days(&sorted, &args.date_column, STEP)?;

    let span = (end - start + 1) as usize;
    let mut picks: Vec<Option<IdxSize>> = Vec::with_capacity(groups.len() * span);
    let mut leaders: Vec<Option<IdxSize>> = Vec::with_capacity(groups.len() * span);
    let mut calendar: Vec<Option<i32>> = Vec::with_capacity(groups.len() * span);

    for rows in &groups {
        let mut by_day: BTreeMap<i32, usize> = BTreeMap::new();
        for &row in rows {
            if let Some(day) = days[row] {
                by_day.entry(day).or_insert(row);
            }
        }
        for day in start..=end {
            let pick = match by_day.get(&day) {
                Some(&row) => Some(row),
                None => match method {
                    FillMethod::Nulls => None,
                    FillMethod::Forward => by_day.range(..day).next_back().map(|(_, &row)| row),
                    FillMethod::Backward => by_day.range(day..).next().map(|(_, &row)| row),
                },
            };
            picks.push(pick.map(|row| row as IdxSize));
            leaders.push(Some(rows[0] as IdxSize));
            calendar.push(Some(day));
        }
    }

    let mut filled = sorted.take(&IdxCa::from_iter_options("idx".into(), picks.into_iter()))?;
    if !args.groupby_columns.is_empty() {
        let keys = sorted
            .select(args.groupby_columns.iter().map(|c| c.as_str()))?
            .take(&IdxCa::from_iter_options("idx".into(), leaders.into_iter()))?;
        for column in keys.get_columns() {
            filled.with_column(column.clone())?;
        }
    }
    filled.with_column(date_column(&args.date_column, calendar)?)?;
    Ok(filled)
}
