//! Feature CSV files: one row per instance, one column per feature dimension.

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Writer};
use ndarray::{Array2, ArrayView2};

use crate::util::error::{MilError, MilResult};

/// Header names pandas gives an unnamed index column.
const INDEX_HEADERS: [&str; 2] = ["", "Unnamed: 0"];

/// Reads an instance feature matrix.
///
/// A leading index column is skipped when its header is empty or `Unnamed: 0`, or
/// when the file has exactly one column more than `expected_dim`.
///
/// # Errors
/// [`MilError::Data`] when a value does not parse or the width differs from
/// `expected_dim`; I/O and CSV errors otherwise.
pub fn read_features(path: &Path, expected_dim: Option<usize>) -> MilResult<Array2<f32>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let has_index = has_index_column(&headers, expected_dim);
    let offset = usize::from(has_index);
    let dim = headers.len().saturating_sub(offset);

    if let Some(expected) = expected_dim {
        if dim != expected {
            return Err(MilError::data(
                path.display(),
                format!("expected {expected} feature columns, found {dim}"),
            ));
        }
    }

    let mut values = Vec::new();
    let mut rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (column, field) in record.iter().skip(offset).enumerate() {
            let value = field.trim().parse::<f32>().map_err(|error| {
                MilError::data(
                    path.display(),
                    format!("row {row}, column {column}: {error}"),
                )
            })?;
            values.push(value);
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, dim), values)
        .map_err(|error| MilError::data(path.display(), error.to_string()))
}

/// Writes a feature matrix with a leading index column and 4-decimal values.
///
/// # Errors
/// I/O and CSV errors.
pub fn write_features(path: &Path, features: ArrayView2<'_, f32>) -> MilResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = Writer::from_writer(File::create(path)?);

    let mut header = vec![String::new()];
    header.extend((0..features.ncols()).map(|column| column.to_string()));
    writer.write_record(&header)?;

    for (index, row) in features.rows().into_iter().enumerate() {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(index.to_string());
        record.extend(row.iter().map(|value| format!("{value:.4}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn has_index_column(headers: &StringRecord, expected_dim: Option<usize>) -> bool {
    let named_index = headers
        .get(0)
        .is_some_and(|first| INDEX_HEADERS.contains(&first.trim()));
    let one_extra = expected_dim.is_some_and(|dim| headers.len() == dim + 1);
    named_index || one_extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use tempfile::tempdir;

    #[test]
    fn written_features_read_back_with_index_column() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("feats").join("slide_1.csv");
        let features = arr2(&[[0.123_456_f32, 1.0, -2.5], [3.0, 0.0, 0.000_04]]);

        write_features(&path, features.view()).expect("write");
        let raw = std::fs::read_to_string(&path).expect("read raw");
        assert!(raw.starts_with(",0,1,2\n0,0.1235,1.0000,-2.5000\n"));

        let loaded = read_features(&path, Some(3)).expect("read");
        assert_eq!(loaded.dim(), (2, 3));
        assert!((loaded[[0, 0]] - 0.1235).abs() < 1e-6);
        assert_eq!(loaded[[1, 2]], 0.0);
    }

    #[test]
    fn files_without_index_column_are_accepted() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("plain.csv");
        std::fs::write(&path, "a,b\n1.5,2.5\n3.5,4.5\n").expect("write");

        let loaded = read_features(&path, Some(2)).expect("read");
        assert_eq!(loaded, arr2(&[[1.5_f32, 2.5], [3.5, 4.5]]));
    }

    #[test]
    fn dimension_mismatch_is_a_data_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("narrow.csv");
        std::fs::write(&path, ",0,1\n0,1.0,2.0\n").expect("write");

        let error = read_features(&path, Some(512)).expect_err("width differs");
        assert!(matches!(error, MilError::Data { .. }));
    }

    #[test]
    fn unparsable_value_is_a_data_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, ",0,1\n0,1.0,abc\n").expect("write");

        let error = read_features(&path, Some(2)).expect_err("bad value");
        assert!(error.to_string().contains("column 1"));
    }

    #[test]
    fn header_only_file_yields_zero_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, ",0,1\n").expect("write");

        let loaded = read_features(&path, Some(2)).expect("read");
        assert_eq!(loaded.nrows(), 0);
    }
}
