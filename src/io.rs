// io.rs — Text input and output formats.
//
// Convolution input:   N M            Scan input:   N
//                      N rows of A                  N values of A
//                      M rows of B
//
// Values are whitespace-separated; line breaks are not significant beyond
// error reporting, and anything after the last expected value is ignored.
// Output values are written with three decimals, one space apart, one
// matrix row (or the whole scan) per line.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::error::{ParseError, Result};
use crate::matrix::Matrix;

/// Whitespace tokenizer that remembers the line of every token.
struct Tokens<'a> {
    inner: Box<dyn Iterator<Item = (usize, &'a str)> + 'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        let inner = text
            .lines()
            .enumerate()
            .flat_map(|(i, line)| line.split_whitespace().map(move |tok| (i + 1, tok)));
        Tokens { inner: Box::new(inner) }
    }

    fn next<T: FromStr>(
        &mut self,
        expected: &'static str,
        what: impl FnOnce() -> String,
    ) -> std::result::Result<T, ParseError> {
        let (line, token) = self
            .inner
            .next()
            .ok_or_else(|| ParseError::Truncated { expected: what() })?;
        token.parse().map_err(|_| ParseError::Invalid {
            line,
            token: token.to_string(),
            expected,
        })
    }

    fn matrix(&mut self, name: &str, side: usize) -> std::result::Result<Matrix, ParseError> {
        let count = side.checked_mul(side).ok_or_else(|| ParseError::Truncated {
            expected: format!("{side}x{side} values of {name}"),
        })?;
        let mut data: Vec<f32> = Vec::with_capacity(count.min(1 << 24));
        for k in 0..count {
            let (r, c) = (k / side, k % side);
            data.push(self.next("a float", || format!("{name}[{r}][{c}] of {side}x{side} {name}"))?);
        }
        Ok(Matrix::from_vec(side, data))
    }
}

/// Parse a convolution problem: returns (A, B).
pub fn parse_convolution_input(text: &str) -> std::result::Result<(Matrix, Matrix), ParseError> {
    let mut tokens = Tokens::new(text);
    let n: usize = tokens.next("a matrix side", || "N".to_string())?;
    let m: usize = tokens.next("a kernel side", || "M".to_string())?;
    let a = tokens.matrix("A", n)?;
    let b = tokens.matrix("B", m)?;
    Ok((a, b))
}

/// Parse a scan problem: returns A.
pub fn parse_scan_input(text: &str) -> std::result::Result<Vec<f32>, ParseError> {
    let mut tokens = Tokens::new(text);
    let n: usize = tokens.next("an element count", || "N".to_string())?;
    let mut values: Vec<f32> = Vec::with_capacity(n.min(1 << 24));
    for i in 0..n {
        values.push(tokens.next("a float", || format!("A[{i}] of {n} values"))?);
    }
    Ok(values)
}

fn write_row<W: Write>(out: &mut W, values: &[f32]) -> io::Result<()> {
    let mut first = true;
    for v in values {
        if !first {
            out.write_all(b" ")?;
        }
        write!(out, "{v:.3}")?;
        first = false;
    }
    writeln!(out)
}

pub fn write_convolution_output<W: Write>(out: &mut W, c: &Matrix) -> io::Result<()> {
    for row in c.rows() {
        write_row(out, row)?;
    }
    Ok(())
}

pub fn write_scan_output<W: Write>(out: &mut W, values: &[f32]) -> io::Result<()> {
    write_row(out, values)
}

pub fn read_convolution_file(path: &Path) -> Result<(Matrix, Matrix)> {
    let text = fs::read_to_string(path)?;
    Ok(parse_convolution_input(&text)?)
}

pub fn read_scan_file(path: &Path) -> Result<Vec<f32>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_scan_input(&text)?)
}

pub fn write_convolution_file(path: &Path, c: &Matrix) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    write_convolution_output(&mut out, c)?;
    out.flush()?;
    Ok(())
}

pub fn write_scan_file(path: &Path, values: &[f32]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    write_scan_output(&mut out, values)?;
    out.flush()?;
    Ok(())
}
