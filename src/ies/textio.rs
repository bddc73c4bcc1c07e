//! Whitespace-separated text dumps of dense matrices, in row-major and
//! column-major element order. Shapes are implied by the allocation on the
//! reading side. Values are written with the shortest representation that
//! round-trips, so a dump re-read through the matching reader is bit-equal.

use std::io::{self, BufRead, Write};

use ndarray::Array2;

pub fn write_row_major<W: Write>(writer: &mut W, matrix: &Array2<f64>) -> io::Result<()> {
    for row in matrix.rows() {
        let mut first = true;
        for value in row.iter() {
            if !first {
                write!(writer, " ")?;
            }
            write!(writer, "{value}")?;
            first = false;
        }
        writeln!(writer)?;
    }
    Ok(())
}

pub fn write_column_major<W: Write>(writer: &mut W, matrix: &Array2<f64>) -> io::Result<()> {
    for col in matrix.columns() {
        let mut first = true;
        for value in col.iter() {
            if !first {
                write!(writer, " ")?;
            }
            write!(writer, "{value}")?;
            first = false;
        }
        writeln!(writer)?;
    }
    Ok(())
}

fn read_values<R: BufRead>(reader: &mut R, count: usize) -> io::Result<Vec<f64>> {
    let mut values = Vec::with_capacity(count);
    let mut line = String::new();
    while values.len() < count {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {count} values, found {}", values.len()),
            ));
        }
        for token in line.split_whitespace() {
            let value: f64 = token.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("not a floating point number: {token:?}"),
                )
            })?;
            values.push(value);
        }
    }
    if values.len() > count {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {count} values, found {}", values.len()),
        ));
    }
    Ok(values)
}

pub fn read_row_major<R: BufRead>(
    reader: &mut R,
    rows: usize,
    cols: usize,
) -> io::Result<Array2<f64>> {
    let values = read_values(reader, rows * cols)?;
    Ok(Array2::from_shape_vec((rows, cols), values)
        .expect("shape consistent with the value count"))
}

pub fn read_column_major<R: BufRead>(
    reader: &mut R,
    rows: usize,
    cols: usize,
) -> io::Result<Array2<f64>> {
    let values = read_values(reader, rows * cols)?;
    let mut matrix = Array2::zeros((rows, cols));
    for (index, value) in values.into_iter().enumerate() {
        matrix[(index % rows, index / rows)] = value;
    }
    Ok(matrix)
}
