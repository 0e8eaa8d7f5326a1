use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;

use crate::dates::{self, parse_datetime};
use crate::error::{PipelineError, Result};

/// Column name -> declared type name, as persisted in the configuration record.
pub type ColumnSchema = BTreeMap<String, String>;

/// Scalar types a schema may declare. Names follow the pandas spellings the
/// configuration records were written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Boolean,
    String,
    Date,
    Datetime(TimeUnit),
}

impl ColumnType {
    pub fn dtype(&self) -> DataType {
        match self {
            ColumnType::Int8 => DataType::Int8,
            ColumnType::Int16 => DataType::Int16,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::UInt8 => DataType::UInt8,
            ColumnType::UInt16 => DataType::UInt16,
            ColumnType::UInt32 => DataType::UInt32,
            ColumnType::UInt64 => DataType::UInt64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::String => DataType::String,
            ColumnType::Date => DataType::Date,
            ColumnType::Datetime(unit) => DataType::Datetime(*unit, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownColumnType(pub String);

impl fmt::Display for UnknownColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognised type name {:?}", self.0)
    }
}

impl FromStr for ColumnType {
    type Err = UnknownColumnType;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let parsed = match raw.trim().to_ascii_lowercase().as_str() {
            "int8" => ColumnType::Int8,
            "int16" => ColumnType::Int16,
            "int32" => ColumnType::Int32,
            "int64" | "int" | "integer" => ColumnType::Int64,
            "uint8" => ColumnType::UInt8,
            "uint16" => ColumnType::UInt16,
            "uint32" => ColumnType::UInt32,
            "uint64" => ColumnType::UInt64,
            "float32" => ColumnType::Float32,
            "float64" | "float" | "double" => ColumnType::Float64,
            "bool" | "boolean" => ColumnType::Boolean,
            "str" | "string" | "object" | "category" => ColumnType::String,
            "date" => ColumnType::Date,
            "datetime" | "datetime64" | "datetime64[ns]" => {
                ColumnType::Datetime(TimeUnit::Nanoseconds)
            }
            "datetime64[us]" => ColumnType::Datetime(TimeUnit::Microseconds),
            "datetime64[ms]" => ColumnType::Datetime(TimeUnit::Milliseconds),
            _ => return Err(UnknownColumnType(raw.to_string())),
        };
        Ok(parsed)
    }
}

/// Casts every declared column to its declared type, in place.
///
/// Column order is untouched and undeclared columns pass through. A cast that
/// would turn a non-null value into null is reported as `SchemaCastError`, so
/// applying the same schema twice is a no-op on the second pass.
pub fn enforce_schema(mut data: DataFrame, schema: &ColumnSchema) -> Result<DataFrame> {
    for (column, type_name) in schema {
        let cast_error = |reason: String| PipelineError::SchemaCastError {
            column: column.clone(),
            dtype: type_name.clone(),
            reason,
        };

        let target: ColumnType = type_name
            .parse()
            .map_err(|err: UnknownColumnType| cast_error(err.to_string()))?;
        let source = data
            .column(column)
            .map_err(|_| cast_error("column not found".to_string()))?;

        if source.dtype() == &target.dtype() {
            continue;
        }

        let casted = cast_column(source, target).map_err(cast_error)?;
        data.with_column(casted)?;
    }
    Ok(data)
}

fn cast_column(source: &Column, target: ColumnType) -> std::result::Result<Column, String> {
    let name = source.name().clone();
    let casted: Column = match (source.dtype(), target) {
        (DataType::String, ColumnType::Date) => {
            let values = source.as_materialized_series().str().map_err(|e| e.to_string())?;
            let mut days = Vec::with_capacity(values.len());
            for value in values.into_iter() {
                match value {
                    None => days.push(None),
                    Some(raw) => {
                        let date = dates::parse_date(raw)
                            .ok_or_else(|| format!("value {raw:?} is not a date"))?;
                        days.push(Some(dates::day_number(date)));
                    }
                }
            }
            dates::date_column(name.as_str(), days).map_err(|e| e.to_string())?
        }
        (DataType::String, ColumnType::Datetime(unit)) => {
            let values = source.as_materialized_series().str().map_err(|e| e.to_string())?;
            let mut ticks = Vec::with_capacity(values.len());
            for value in values.into_iter() {
                match value {
                    None => ticks.push(None),
                    Some(raw) => {
                        let parsed = parse_datetime(raw)
                            .ok_or_else(|| format!("value {raw:?} is not a datetime"))?;
                        let utc = parsed.and_utc();
                        let tick = match unit {
                            TimeUnit::Nanoseconds => utc.timestamp_nanos_opt(),
                            TimeUnit::Microseconds => Some(utc.timestamp_micros()),
                            TimeUnit::Milliseconds => Some(utc.timestamp_millis()),
                        }
                        .ok_or_else(|| format!("value {raw:?} is out of range"))?;
                        ticks.push(Some(tick));
                    }
                }
            }
            Series::new(name, ticks)
                .cast(&target.dtype())
                .map_err(|e| e.to_string())?
                .into()
        }
        _ => source.cast(&target.dtype()).map_err(|e| e.to_string())?,
    };

    if casted.null_count() > source.null_count() {
        return Err(format!(
            "{} value(s) of type {} could not be converted",
            casted.null_count() - source.null_count(),
            source.dtype()
        ));
    }
    Ok(casted)
}
