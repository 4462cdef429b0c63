/*!
CSV chain export.

A flat alternative to the MATLAB-format sink for tooling that prefers
tabular input. The file carries a header row `sample,dim_0,..,dim_{D-1}`
and one row per chain position. Write-only: chain input always uses the
MATLAB format.
*/

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use nalgebra::DVector;

/// Appends one window of positions. A window starting at position 0
/// truncates the file and writes the header first.
pub fn append_window(
    path: &Path,
    dim: usize,
    start: usize,
    rows: &[DVector<f64>],
) -> io::Result<()> {
    let file = if start == 0 {
        File::create(path)?
    } else {
        OpenOptions::new().append(true).open(path)?
    };
    let mut writer = csv::Writer::from_writer(file);

    if start == 0 {
        let mut header: Vec<String> = vec!["sample".to_string()];
        header.extend((0..dim).map(|i| format!("dim_{i}")));
        writer
            .write_record(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    for (offset, row) in rows.iter().enumerate() {
        let mut record = vec![(start + offset).to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer
            .write_record(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    writer.flush()
}

/// Appends one window of scalar values (a one-column chain).
pub fn append_scalar_window(path: &Path, start: usize, values: &[f64]) -> io::Result<()> {
    let rows: Vec<DVector<f64>> = values.iter().map(|&v| DVector::from_element(1, v)).collect();
    append_window(path, 1, start, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;
    use tempfile::TempDir;

    #[test]
    fn windows_concatenate_under_one_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.csv");
        append_window(&path, 2, 0, &[dvector![1.0, 2.0], dvector![3.0, 4.0]]).unwrap();
        append_window(&path, 2, 2, &[dvector![5.0, 6.0]]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let expected = "sample,dim_0,dim_1\n0,1,2\n1,3,4\n2,5,6\n";
        assert_eq!(contents, expected);
    }

    #[test]
    fn header_matches_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.csv");
        append_window(&path, 3, 0, &[dvector![1.0, 2.0, 3.0]]).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "sample");
        assert_eq!(&headers[3], "dim_2");
        assert_eq!(reader.records().count(), 1);
    }
}
