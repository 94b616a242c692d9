//! Delimited-text sample logs.
//!
//! Layout: a header line with the column names in schema order, then one line
//! per sample. Floats are written unquoted in shortest round-trip form; text
//! cells are always double-quoted (embedded quotes doubled), which is how the
//! reader tells text columns from numeric ones.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ::csv::{QuoteStyle, ReaderBuilder, Writer, WriterBuilder};
use anyhow::Context;
use tracing::debug;

use crate::error::{LabError, Result};
use crate::record::{Cell, Column, ColumnType, Row, Schema};
use crate::sink::Logger;
use crate::table::{ColumnData, Snapshot};

pub const DEFAULT_SEPARATOR: char = ',';

/// Logger writing one CSV line per sample.
///
/// The file is created in `start` and must not exist yet.
#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    separator: char,
    writer: Option<Writer<File>>,
}

impl CsvLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            separator: DEFAULT_SEPARATOR,
            writer: None,
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, fields: impl Iterator<Item = String>) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("CSV logger used before start")?;
        writer.write_record(fields)?;
        writer.flush()?;
        Ok(())
    }
}

impl Logger for CsvLogger {
    fn start(&mut self, first: &Row) -> anyhow::Result<()> {
        let delimiter = delimiter(self.separator)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .with_context(|| format!("cannot create {}", self.path.display()))?;
        self.writer = Some(writer(file, delimiter));
        let sep = self.separator;
        self.write_record(first.schema().names().map(|n| encode_name(n, sep)))?;
        debug!(path = %self.path.display(), "CSV log started");
        Ok(())
    }

    fn log(&mut self, row: &Row) -> anyhow::Result<()> {
        self.write_record(row.cells().iter().map(encode_cell))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(path = %self.path.display(), "CSV log closed");
        }
        Ok(())
    }
}

/// Write a whole snapshot in the same layout `CsvLogger` produces.
pub fn write_csv(out: impl Write, snapshot: &Snapshot, sep: char) -> Result<()> {
    if snapshot.schema().is_empty() {
        return Ok(());
    }
    let mut wtr = writer(out, delimiter(sep)?);
    wtr.write_record(snapshot.schema().names().map(|n| encode_name(n, sep)))?;
    for row in snapshot.rows() {
        wtr.write_record(row.cells().iter().map(encode_cell))?;
    }
    wtr.flush()?;
    Ok(())
}

fn delimiter(sep: char) -> Result<u8> {
    u8::try_from(sep)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| LabError::Construction(format!("separator {sep:?} is not a single ASCII byte")))
}

/// Fields arrive already encoded: the writer must not re-quote them.
fn writer<W: Write>(out: W, delimiter: u8) -> Writer<W> {
    WriterBuilder::new()
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Never)
        .from_writer(out)
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn encode_name(name: &str, sep: char) -> String {
    if name.contains(sep) || name.contains('"') || name.contains('\n') {
        quote(name)
    } else {
        name.to_string()
    }
}

fn encode_cell(cell: &Cell) -> String {
    match cell {
        Cell::Float(f) => f.to_string(),
        Cell::Text(s) => quote(s),
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read a file written by `CsvLogger` back into a snapshot.
pub fn read_csv(path: &Path, sep: char) -> Result<Snapshot> {
    let content = fs::read_to_string(path)?;
    parse_csv(&content, sep)
}

pub fn parse_csv(content: &str, sep: char) -> Result<Snapshot> {
    let delimiter = delimiter(sep)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(content.as_bytes());

    let names: Vec<String> = reader
        .headers()
        .map_err(parse_error)?
        .iter()
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Ok(Snapshot::default());
    }

    // (line, fields, quoted flags) per record
    let mut body = Vec::new();
    for record in reader.records() {
        let record = record.map_err(parse_error)?;
        let (line, offset) = record
            .position()
            .map_or((0, 0), |p| (p.line() as usize, p.byte() as usize));
        let quoted = quoted_fields(&content.as_bytes()[offset..], delimiter, record.len());
        body.push((line, record, quoted));
    }

    let mut columns = Vec::with_capacity(names.len());
    let mut data = Vec::with_capacity(names.len());
    for (idx, name) in names.into_iter().enumerate() {
        let quoted = body.iter().filter(|(_, _, q)| q[idx]).count();
        if quoted == body.len() && !body.is_empty() {
            columns.push(Column {
                name,
                kind: ColumnType::Text,
            });
            data.push(ColumnData::Text(
                body.iter().map(|(_, r, _)| r[idx].to_string()).collect(),
            ));
        } else if quoted == 0 {
            let values = body
                .iter()
                .map(|(line, r, _)| {
                    r[idx].parse::<f64>().map_err(|e| LabError::Parse {
                        line: *line,
                        message: format!("column `{name}`: {e}"),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            columns.push(Column {
                name,
                kind: ColumnType::Float,
            });
            data.push(ColumnData::Float(values));
        } else {
            return Err(LabError::Parse {
                line: 1,
                message: format!("column `{name}` mixes quoted and unquoted values"),
            });
        }
    }

    Snapshot::from_columns(Schema::new(columns), data)
}

fn parse_error(err: ::csv::Error) -> LabError {
    LabError::Parse {
        line: err.position().map_or(0, |p| p.line() as usize),
        message: err.to_string(),
    }
}

/// Which of the first `n` fields of the raw record at the start of `raw`
/// open with a quote. The record itself was already validated by the reader.
fn quoted_fields(raw: &[u8], sep: u8, n: usize) -> Vec<bool> {
    let mut flags = Vec::with_capacity(n);
    let mut pos = 0;
    while flags.len() < n {
        let quoted = raw.get(pos) == Some(&b'"');
        flags.push(quoted);
        if quoted {
            pos += 1;
            while pos < raw.len() {
                if raw[pos] == b'"' {
                    if raw.get(pos + 1) == Some(&b'"') {
                        pos += 2;
                        continue;
                    }
                    break;
                }
                pos += 1;
            }
        }
        pos = match raw.get(pos..).and_then(|rest| rest.iter().position(|&b| b == sep)) {
            Some(offset) => pos + offset + 1,
            None => raw.len(),
        };
    }
    flags
}
