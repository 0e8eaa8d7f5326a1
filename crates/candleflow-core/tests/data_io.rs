use anyhow::Result;
use polars::prelude::*;

use candleflow_core::data_io::{read_dataset, write_dataset};
use candleflow_core::PipelineError;

fn sample() -> PolarsResult<DataFrame> {
    df![
        "date" => ["2020-01-01", "2020-01-02", "2020-01-03"],
        "symbol" => ["CMG", "CMG", "CMG"],
        "close" => [Some(1.5f64), None, Some(3.25)],
    ]
}

#[test]
fn csv_and_parquet_round_trip_shape() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data = sample()?;

    for file in ["prices.csv", "prices.parquet"] {
        let path = dir.path().join(file);
        write_dataset(&data, &path)?;
        let back = read_dataset(&path)?;
        assert_eq!(back.height(), 3, "{file}");
        assert_eq!(back.get_column_names(), data.get_column_names(), "{file}");
        assert_eq!(back.column("close")?.null_count(), 1, "{file}");
    }
    Ok(())
}

#[test]
fn csv_has_no_index_column() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("prices.csv");
    write_dataset(&sample()?, &path)?;

    let text = std::fs::read_to_string(&path)?;
    assert_eq!(text.lines().next(), Some("date,symbol,close"));
    Ok(())
}

#[test]
fn unsupported_extensions_never_touch_the_filesystem() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data = sample()?;

    for file in ["prices.xlsx", "prices.json", "prices"] {
        let path = dir.path().join(file);
        assert!(matches!(
            write_dataset(&data, &path),
            Err(PipelineError::UnsupportedFormat { .. })
        ));
        assert!(!path.exists(), "{file} should not have been created");
    }

    let err = read_dataset(&dir.path().join("prices.txt")).unwrap_err();
    assert!(err.to_string().contains(".txt"));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn json_is_readable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("prices.json");
    std::fs::write(
        &path,
        r#"[{"date":"2020-01-01","close":1.0},{"date":"2020-01-02","close":2.0}]"#,
    )?;
    let data = read_dataset(&path)?;
    assert_eq!(data.height(), 2);
    assert_eq!(data.width(), 2);
    Ok(())
}
