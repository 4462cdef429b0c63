/*!
MATLAB-compatible ASCII chain files.

Each sequence is emitted as a named variable: a `zeros(N,D)` preallocation
followed by one or more indexed bracketed assignments, so the file can be
`eval`'ed by a MATLAB/Octave post-processor:

```text
rawChain_sub0 = zeros(1000,2);
rawChain_sub0(1:200,:) = [
1.2 3.4
...
];
rawChain_sub0(201:400,:) = [
...
];
```

Periodic checkpointing appends one assignment block per window; the reader
accepts any number of blocks and reassembles the full sequence.
*/

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};

use crate::error::{McmcError, Result};

fn open_for_window(path: &Path, start: usize) -> io::Result<BufWriter<File>> {
    let file = if start == 0 {
        File::create(path)?
    } else {
        OpenOptions::new().append(true).open(path)?
    };
    Ok(BufWriter::new(file))
}

/// Appends one window of a vector sequence. A window starting at position 0
/// truncates the file and emits the `zeros` preallocation first.
pub fn append_vector_window(
    path: &Path,
    name: &str,
    total_len: usize,
    dim: usize,
    start: usize,
    rows: &[DVector<f64>],
) -> io::Result<()> {
    let mut writer = open_for_window(path, start)?;
    if start == 0 {
        writeln!(writer, "{name} = zeros({total_len},{dim});")?;
    }
    writeln!(writer, "{name}({}:{},:) = [", start + 1, start + rows.len())?;
    for row in rows {
        let mut line = String::new();
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                line.push(' ');
            }
            line.push_str(&format!("{value:.17e}"));
        }
        writeln!(writer, "{line}")?;
    }
    writeln!(writer, "];")?;
    writer.flush()
}

/// Appends one window of a scalar sequence (a one-column chain).
pub fn append_scalar_window(
    path: &Path,
    name: &str,
    total_len: usize,
    start: usize,
    values: &[f64],
) -> io::Result<()> {
    let rows: Vec<DVector<f64>> = values.iter().map(|&v| DVector::from_element(1, v)).collect();
    append_vector_window(path, name, total_len, 1, start, &rows)
}

/// Writes a whole matrix as a single-window variable (adapted-covariance
/// debug dumps).
pub fn write_matrix(path: &Path, name: &str, matrix: &DMatrix<f64>) -> io::Result<()> {
    let rows: Vec<DVector<f64>> = (0..matrix.nrows())
        .map(|i| DVector::from_iterator(matrix.ncols(), matrix.row(i).iter().copied()))
        .collect();
    append_vector_window(path, name, matrix.nrows(), matrix.ncols(), 0, &rows)
}

/// Appends a whole scalar variable to an existing (possibly multi-variable)
/// file without truncating it, used by the chain-info writer.
pub fn append_scalar_variable(path: &Path, name: &str, values: &[f64]) -> io::Result<()> {
    let mut writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(path)?);
    writeln!(writer, "{name} = zeros({},1);", values.len())?;
    writeln!(writer, "{name}(1:{},:) = [", values.len())?;
    for value in values {
        writeln!(writer, "{value:.17e}")?;
    }
    writeln!(writer, "];")?;
    writer.flush()
}

/// Appends a bare scalar assignment (`name = value;`), used by the
/// chain-info writer.
pub fn append_scalar_assignment(path: &Path, name: &str, value: f64) -> io::Result<()> {
    let mut writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(path)?);
    writeln!(writer, "{name} = {value:.17e};")?;
    writer.flush()
}

fn malformed(path: &Path, reason: impl Into<String>) -> McmcError {
    McmcError::MalformedChainFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Reads a sequence file back: returns the variable name and the rows, in
/// position order. Every position declared by the `zeros` preallocation
/// must be covered by some assignment block.
pub fn read_vector_sequence(path: &Path) -> Result<(String, Vec<DVector<f64>>)> {
    let file = File::open(path).map_err(|source| McmcError::Io {
        sub_id: 0,
        rank: 0,
        source,
    })?;
    let reader = BufReader::new(file);

    let mut name = String::new();
    let mut total_len = 0usize;
    let mut dim = 0usize;
    let mut rows: Vec<Option<DVector<f64>>> = Vec::new();
    let mut block_next: Option<(usize, usize)> = None; // (next index, end index)

    for line in reader.lines() {
        let line = line.map_err(|source| McmcError::Io {
            sub_id: 0,
            rank: 0,
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some((var, dims)) = trimmed.split_once(" = zeros(") {
            let dims = dims
                .strip_suffix(");")
                .ok_or_else(|| malformed(path, "unterminated zeros declaration"))?;
            let (n, d) = dims
                .split_once(',')
                .ok_or_else(|| malformed(path, "zeros declaration without dimensions"))?;
            name = var.trim().to_string();
            total_len = n
                .trim()
                .parse()
                .map_err(|_| malformed(path, format!("bad row count `{n}`")))?;
            dim = d
                .trim()
                .parse()
                .map_err(|_| malformed(path, format!("bad column count `{d}`")))?;
            rows = vec![None; total_len];
            continue;
        }

        if let Some(rest) = trimmed.strip_suffix(",:) = [") {
            let open = rest
                .rfind('(')
                .ok_or_else(|| malformed(path, "assignment block without index range"))?;
            let range = &rest[open + 1..];
            let (a, b) = range
                .split_once(':')
                .ok_or_else(|| malformed(path, format!("bad index range `{range}`")))?;
            let a: usize = a
                .trim()
                .parse()
                .map_err(|_| malformed(path, format!("bad range start `{a}`")))?;
            let b: usize = b
                .trim()
                .parse()
                .map_err(|_| malformed(path, format!("bad range end `{b}`")))?;
            if a < 1 || b > total_len || a > b {
                return Err(malformed(path, format!("range {a}:{b} outside 1:{total_len}")));
            }
            block_next = Some((a - 1, b));
            continue;
        }

        if trimmed == "];" {
            if let Some((next, end)) = block_next.take() {
                if next != end {
                    return Err(malformed(
                        path,
                        format!("block ended early: expected {end} rows, got {next}"),
                    ));
                }
            }
            continue;
        }

        if trimmed.ends_with(';') {
            // Bare scalar assignment (info file); not part of a sequence.
            continue;
        }

        let Some((next, end)) = block_next.as_mut() else {
            return Err(malformed(path, format!("unexpected line `{trimmed}`")));
        };
        if *next >= *end {
            return Err(malformed(path, "more rows than the block range declares"));
        }
        let values: std::result::Result<Vec<f64>, _> =
            trimmed.split_whitespace().map(str::parse::<f64>).collect();
        let values = values.map_err(|_| malformed(path, format!("bad row `{trimmed}`")))?;
        if values.len() != dim {
            return Err(malformed(
                path,
                format!("row has {} values, expected {dim}", values.len()),
            ));
        }
        rows[*next] = Some(DVector::from_vec(values));
        *next += 1;
    }

    if name.is_empty() {
        return Err(malformed(path, "no zeros declaration found"));
    }
    let mut out = Vec::with_capacity(total_len);
    for (i, row) in rows.into_iter().enumerate() {
        out.push(row.ok_or_else(|| malformed(path, format!("position {i} never assigned")))?);
    }
    Ok((name, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;
    use tempfile::TempDir;

    #[test]
    fn windowed_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain_sub0.m");
        let rows: Vec<DVector<f64>> = (0..10)
            .map(|i| dvector![i as f64, -0.5 * i as f64])
            .collect();

        append_vector_window(&path, "rawChain_sub0", 10, 2, 0, &rows[..4]).unwrap();
        append_vector_window(&path, "rawChain_sub0", 10, 2, 4, &rows[4..8]).unwrap();
        append_vector_window(&path, "rawChain_sub0", 10, 2, 8, &rows[8..]).unwrap();

        let (name, read_back) = read_vector_sequence(&path).unwrap();
        assert_eq!(name, "rawChain_sub0");
        assert_eq!(read_back, rows);
    }

    #[test]
    fn scalar_window_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target_sub0.m");
        let values = [0.25, -1.5, 3.0];
        append_scalar_window(&path, "logTargets_sub0", 3, 0, &values).unwrap();
        let (_, rows) = read_vector_sequence(&path).unwrap();
        let read: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        assert_eq!(read, values);
    }

    #[test]
    fn gap_in_windows_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gap.m");
        let rows = vec![dvector![1.0], dvector![2.0]];
        append_vector_window(&path, "chain", 4, 1, 0, &rows).unwrap();
        // Positions 2..4 never written.
        assert!(matches!(
            read_vector_sequence(&path),
            Err(McmcError::MalformedChainFile { .. })
        ));
    }

    #[test]
    fn matrix_dump_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mat_am100.m");
        let m = nalgebra::dmatrix![1.0, 0.25; 0.25, 2.0];
        write_matrix(&path, "mat_am100", &m).unwrap();
        let (name, rows) = read_vector_sequence(&path).unwrap();
        assert_eq!(name, "mat_am100");
        assert_eq!(rows[0], dvector![1.0, 0.25]);
        assert_eq!(rows[1], dvector![0.25, 2.0]);
    }
}
