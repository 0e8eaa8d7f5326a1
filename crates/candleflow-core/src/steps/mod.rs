//! Built-in transformations and evaluations.
//!
//! Steps are plain functions over a `DataFrame`; the registry maps configured
//! names onto them.

pub mod evaluations;
pub mod transformations;

use polars::prelude::*;
use serde::Deserialize;

use crate::error::{PipelineError, Result};

const ROW_INDEX: &str = "__candleflow_row";
const SORT_DAY: &str = "__candleflow_day";

/// Argument struct for steps that take none.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NoArgs {}

pub(crate) fn require_column<'a>(df: &'a DataFrame, column: &str, step: &str) -> Result<&'a Column> {
    df.column(column)
        .map_err(|_| PipelineError::step_failed(step, format!("column {column} not found")))
}

pub(crate) fn partition_exprs(columns: &[String]) -> Vec<Expr> {
    columns.iter().map(|name| col(name.as_str())).collect()
}

/// Evaluates `expr` per group when there are group columns, over the whole
/// frame otherwise.
pub(crate) fn per_group(expr: Expr, partition: &[Expr]) -> Expr {
    if partition.is_empty() {
        expr
    } else {
        expr.over(partition)
    }
}

/// Row indices of each group of `columns`, groups ordered by key with null
/// keys first, rows in frame order.
pub(crate) fn group_indices(df: &DataFrame, columns: &[String], step: &str) -> Result<Vec<Vec<usize>>> {
    for name in columns {
        require_column(df, name, step)?;
    }
    if columns.is_empty() {
        let all: Vec<usize> = (0..df.height()).collect();
        return Ok(if all.is_empty() { Vec::new() } else { vec![all] });
    }

    let grouped = df
        .clone()
        .lazy()
        .with_row_index(ROW_INDEX, None)
        .group_by_stable(partition_exprs(columns))
        .agg([col(ROW_INDEX)])
        .sort(
            columns.iter().map(String::as_str),
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()?;

    let mut groups = Vec::with_capacity(grouped.height());
    for rows in grouped.column(ROW_INDEX)?.list()?.into_iter().flatten() {
        groups.push(rows.idx()?.into_no_null_iter().map(|row| row as usize).collect());
    }
    Ok(groups)
}

pub(crate) fn keep_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    let mask = BooleanChunked::from_slice("mask".into(), keep);
    Ok(df.filter(&mask)?)
}

/// Sorts rows by group key, then by day number, keeping input order on ties.
pub(crate) fn sort_by_group_then_date(
    df: &DataFrame,
    groupby_columns: &[String],
    date_column: &str,
    step: &str,
) -> Result<DataFrame> {
    for name in groupby_columns {
        require_column(df, name, step)?;
    }
    let days = crate::dates::date_days(df, date_column, step)?;

    let mut keyed = df.clone();
    keyed.with_column(Column::new(SORT_DAY.into(), days))?;
    let by = groupby_columns
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(SORT_DAY));
    let sorted = keyed
        .lazy()
        .sort(by, SortMultipleOptions::default().with_maintain_order(true))
        .collect()?;
    Ok(sorted.drop(SORT_DAY)?)
}
