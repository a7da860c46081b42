//! Append-only prediction log and its exactly-once reader.
//!
//! One comma-separated row per classified window:
//!
//! ```text
//! timestamp,predicted_class,p_0,...,p_{k-1},f_0,...,f_{m-1}
//! ```
//!
//! `predicted_class` is `-1` for a rejected (Unknown) window. The trailing
//! feature columns carry what the adaptation loop needs to turn a row into a
//! memory record. Floats are written with their shortest exact representation,
//! so a row parses back to the same bits.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::memory::ClassId;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PredictionRecord {
    pub timestamp: f64,
    pub predicted: Option<ClassId>,
    pub probabilities: Vec<f32>,
    pub features: Vec<f32>,
}

impl PredictionRecord {
    pub fn to_row(&self) -> String {
        let cols = 2 + self.probabilities.len() + self.features.len();
        let mut row = String::with_capacity(16 * cols);
        let class = self.predicted.map(i64::from).unwrap_or(-1);
        let _ = write!(row, "{},{}", self.timestamp, class);
        for v in self.probabilities.iter().chain(&self.features) {
            let _ = write!(row, ",{v}");
        }
        row
    }

    /// Parse one row (without its newline). `None` if it is malformed.
    pub fn parse_row(line: &str, num_classes: usize) -> Option<Self> {
        let mut cols = line.trim_end_matches('\r').split(',');
        let timestamp: f64 = cols.next()?.trim().parse().ok()?;
        let class: i64 = cols.next()?.trim().parse().ok()?;
        let predicted = match class {
            -1 => None,
            c => Some(ClassId::try_from(c).ok()?),
        };
        let rest: Vec<f32> = cols
            .map(|c| c.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .ok()?;
        if rest.len() < num_classes {
            return None;
        }
        let (probabilities, features) = rest.split_at(num_classes);
        Some(Self {
            timestamp,
            predicted,
            probabilities: probabilities.to_vec(),
            features: features.to_vec(),
        })
    }
}

/// Writer side. Each row is flushed as it is written so readers in other
/// threads or processes see it immediately.
#[derive(Debug)]
pub struct PredictionLogWriter {
    path: PathBuf,
    file: File,
    rows: u64,
}

impl PredictionLogWriter {
    /// Start a fresh log, truncating any previous session's rows.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            rows: 0,
        })
    }

    pub fn append(&mut self, record: &PredictionRecord) -> io::Result<()> {
        let mut row = record.to_row();
        row.push('\n');
        // One write call per row keeps concurrent readers from seeing a torn
        // prefix in the common case; the cursor tolerates it regardless.
        self.file.write_all(row.as_bytes())?;
        self.file.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of one [`LogCursor::poll`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Polled {
    pub records: Vec<PredictionRecord>,
    /// Complete rows that failed to parse; consumed and not returned again.
    pub skipped: usize,
}

/// Byte-offset cursor over a prediction log. Every complete row is returned
/// by exactly one `poll`; a trailing partial row waits for the next one.
#[derive(Debug, Clone)]
pub struct LogCursor {
    path: PathBuf,
    num_classes: usize,
    offset: u64,
}

impl LogCursor {
    pub fn new(path: &Path, num_classes: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            num_classes,
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn poll(&mut self) -> io::Result<Polled> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Polled::default()),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // The log was recreated underneath us; start over.
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Polled::default());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let mut polled = Polled::default();
        for line in complete.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let parsed = std::str::from_utf8(line)
                .ok()
                .and_then(|s| PredictionRecord::parse_row(s, self.num_classes));
            match parsed {
                Some(rec) => polled.records.push(rec),
                None => polled.skipped += 1,
            }
        }
        Ok(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ts: f64, predicted: Option<ClassId>) -> PredictionRecord {
        PredictionRecord {
            timestamp: ts,
            predicted,
            probabilities: vec![0.1, 0.2, 0.7],
            features: vec![1.5, -2.25],
        }
    }

    #[test]
    fn row_round_trip_keeps_bits() {
        let r = PredictionRecord {
            timestamp: 1_717_000_000.123_456_7,
            predicted: Some(2),
            probabilities: vec![0.1, 1.0 / 3.0, 0.0],
            features: vec![f32::MIN_POSITIVE, 12345.678],
        };
        let back = PredictionRecord::parse_row(&r.to_row(), 3).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.timestamp.to_bits(), r.timestamp.to_bits());
    }

    #[test]
    fn unknown_class_is_minus_one() {
        let r = rec(1.0, None);
        assert!(r.to_row().starts_with("1,-1,"));
        assert_eq!(PredictionRecord::parse_row(&r.to_row(), 3).unwrap().predicted, None);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(PredictionRecord::parse_row("", 3).is_none());
        assert!(PredictionRecord::parse_row("1.0,abc,0.1,0.2,0.3", 3).is_none());
        assert!(PredictionRecord::parse_row("1.0,1,0.1,0.2", 3).is_none());
        assert!(PredictionRecord::parse_row("1.0,-5,0.1,0.2,0.3", 3).is_none());
    }

    #[test]
    fn second_poll_over_same_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.csv");
        let mut w = PredictionLogWriter::create(&path).unwrap();
        for i in 0..3 {
            w.append(&rec(i as f64, Some(i))).unwrap();
        }

        let mut cursor = LogCursor::new(&path, 3);
        let first = cursor.poll().unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.records[1], rec(1.0, Some(1)));
        assert!(cursor.poll().unwrap().records.is_empty());

        w.append(&rec(3.0, Some(0))).unwrap();
        let third = cursor.poll().unwrap();
        assert_eq!(third.records, vec![rec(3.0, Some(0))]);
        assert_eq!(w.rows_written(), 4);
    }

    #[test]
    fn partial_row_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.csv");
        let row = rec(7.0, Some(1)).to_row();
        let (head, tail) = row.split_at(row.len() / 2);
        std::fs::write(&path, head).unwrap();

        let mut cursor = LogCursor::new(&path, 3);
        assert!(cursor.poll().unwrap().records.is_empty());
        assert_eq!(cursor.offset(), 0);

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{tail}").unwrap();
        assert_eq!(cursor.poll().unwrap().records, vec![rec(7.0, Some(1))]);
    }

    #[test]
    fn garbage_rows_are_counted_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.csv");
        let good = rec(1.0, Some(0)).to_row();
        std::fs::write(&path, format!("not,a,row\n{good}\n")).unwrap();
        let mut cursor = LogCursor::new(&path, 3);
        let polled = cursor.poll().unwrap();
        assert_eq!(polled.skipped, 1);
        assert_eq!(polled.records.len(), 1);
        assert_eq!(cursor.poll().unwrap(), Polled::default());
    }

    #[test]
    fn missing_file_polls_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = LogCursor::new(&dir.path().join("absent.csv"), 3);
        assert_eq!(cursor.poll().unwrap(), Polled::default());
    }

    #[test]
    fn recreated_log_restarts_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.csv");
        let mut w = PredictionLogWriter::create(&path).unwrap();
        w.append(&rec(1.0, Some(0))).unwrap();
        w.append(&rec(2.0, Some(0))).unwrap();
        let mut cursor = LogCursor::new(&path, 3);
        assert_eq!(cursor.poll().unwrap().records.len(), 2);

        let mut w = PredictionLogWriter::create(&path).unwrap();
        w.append(&rec(9.0, Some(2))).unwrap();
        assert_eq!(cursor.poll().unwrap().records, vec![rec(9.0, Some(2))]);
    }
}
