//! Decoding and logging of published records on the subscriber side.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::record::MagnetometerMessage;

/// Client identifier used by the listener.
pub const LISTENER_CLIENT_ID: &str = "MagnetometerRecv";

/// Number of records between timestamp delta reports.
pub const DELTA_REPORT_EVERY: usize = 6;

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Error, Debug)]
pub enum ListenError {
    #[error("Expected a {expected} byte record, got {0} bytes", expected = MagnetometerMessage::SIZE)]
    WrongLength(usize),

    #[error("Timestamp {0} is outside the representable date range")]
    Timestamp(i64),

    #[error("Malformed log line {line:?}: {reason}")]
    MalformedLine { line: String, reason: String },

    #[error("{} is not named YYYY-MM-DD.txt", .0.display())]
    FileName(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Milliseconds since the epoch at UTC midnight of `date`.
fn midnight_millis(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// A decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// nT
    pub bx: f64,
    /// nT
    pub by: f64,
    /// nT
    pub bz: f64,
    /// °C
    pub temperature: f64,
}

impl From<MagnetometerMessage> for Sample {
    fn from(message: MagnetometerMessage) -> Self {
        let [bx, by, bz, temperature] = message.data();
        Self {
            timestamp: message.timestamp(),
            bx,
            by,
            bz,
            temperature,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Bx={:.3} nT By={:.3} nT Bz={:.3} nT T={:.3} °C",
            self.timestamp, self.bx, self.by, self.bz, self.temperature
        )
    }
}

impl Sample {
    /// Decode a published payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ListenError> {
        MagnetometerMessage::from_bytes(payload)
            .map(Self::from)
            .ok_or(ListenError::WrongLength(payload.len()))
    }

    pub fn datetime(&self) -> Result<DateTime<Utc>, ListenError> {
        DateTime::from_timestamp_millis(self.timestamp).ok_or(ListenError::Timestamp(self.timestamp))
    }

    /// Name of the daily file this sample belongs to, `YYYY-MM-DD.txt` (UTC).
    pub fn daily_file_name(&self) -> Result<String, ListenError> {
        Ok(format!("{}.txt", self.datetime()?.format("%Y-%m-%d")))
    }

    /// Daily file line: `<ms since UTC midnight> <bx> <by> <bz> <t>`.
    pub fn text_line(&self) -> String {
        format!(
            "{} {:?} {:?} {:?} {:?}",
            self.timestamp.rem_euclid(MILLIS_PER_DAY),
            self.bx,
            self.by,
            self.bz,
            self.temperature
        )
    }

    /// Parse a line written by [`text_line`](Self::text_line) back into a
    /// sample, given the UTC date of the file it was read from.
    pub fn from_text_line(date: NaiveDate, line: &str) -> Result<Self, ListenError> {
        let malformed = |reason: String| ListenError::MalformedLine {
            line: line.to_string(),
            reason,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [offset, bx, by, bz, temperature] = fields.as_slice() else {
            return Err(malformed(format!("expected 5 fields, got {}", fields.len())));
        };

        let offset: i64 = offset
            .parse()
            .map_err(|e| malformed(format!("time of day {offset:?}: {e}")))?;
        if !(0..MILLIS_PER_DAY).contains(&offset) {
            return Err(malformed(format!("time of day {offset} is not within a day")));
        }
        let value = |field: &str| {
            field
                .parse::<f64>()
                .map_err(|e| malformed(format!("value {field:?}: {e}")))
        };

        Ok(Self {
            timestamp: midnight_millis(date) + offset,
            bx: value(*bx)?,
            by: value(*by)?,
            bz: value(*bz)?,
            temperature: value(*temperature)?,
        })
    }

    pub fn to_json(&self) -> Result<String, ListenError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Collects timestamps and reports consecutive differences every
/// [`DELTA_REPORT_EVERY`] records.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: Option<i64>,
    pending: Vec<i64>,
    received: usize,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a timestamp. Every sixth call returns the differences between
    /// consecutive timestamps since the previous report, including the step
    /// from the last timestamp of that report.
    pub fn record(&mut self, timestamp: i64) -> Option<Vec<i64>> {
        self.pending.push(timestamp);
        self.received += 1;
        if self.received % DELTA_REPORT_EVERY != 0 {
            return None;
        }

        let series: Vec<i64> = self.previous.iter().copied().chain(self.pending.drain(..)).collect();
        self.previous = series.last().copied();
        Some(series.windows(2).map(|w| w[1] - w[0]).collect())
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

/// Appends samples to one text file per UTC day.
#[derive(Debug, Clone)]
pub struct DailyLog {
    dir: PathBuf,
}

impl DailyLog {
    /// Log into `dir`, creating it if necessary.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `sample` to its day's file and return the file path.
    pub fn append(&self, sample: &Sample) -> Result<PathBuf, ListenError> {
        let path = self.dir.join(sample.daily_file_name()?);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", sample.text_line())?;
        Ok(path)
    }

    /// Daily files in the log directory, oldest first.
    pub fn day_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read every sample back from a daily file. The date comes from the
    /// file name, the time of day from the first column.
    pub fn read_day(path: &Path) -> Result<Vec<Sample>, ListenError> {
        let date = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok())
            .ok_or_else(|| ListenError::FileName(path.to_path_buf()))?;

        fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Sample::from_text_line(date, line))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T12:34:56.789Z
    const NOON_ISH: i64 = 1_710_506_096_789;

    fn sample(timestamp: i64) -> Sample {
        Sample {
            timestamp,
            bx: 17_250.5,
            by: -1.0,
            bz: 44_012.125,
            temperature: 21.5,
        }
    }

    #[test]
    fn test_decode_record() {
        let message = MagnetometerMessage::new(NOON_ISH, [1.0, 2.0, 3.0, 4.0]);
        let decoded = Sample::decode(message.as_bytes()).unwrap();
        assert_eq!(decoded.timestamp, NOON_ISH);
        assert_eq!(
            [decoded.bx, decoded.by, decoded.bz, decoded.temperature],
            [1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(matches!(
            Sample::decode(&[0u8; 32]),
            Err(ListenError::WrongLength(32))
        ));
        assert_eq!(
            ListenError::WrongLength(32).to_string(),
            "Expected a 40 byte record, got 32 bytes"
        );
    }

    #[test]
    fn test_text_line() {
        let line = sample(NOON_ISH).text_line();
        assert_eq!(line, "45296789 17250.5 -1.0 44012.125 21.5");
    }

    #[test]
    fn test_daily_file_name() {
        assert_eq!(sample(NOON_ISH).daily_file_name().unwrap(), "2024-03-15.txt");
        // Last millisecond of the day stays on the same file.
        let midnight = NOON_ISH - 45_296_789;
        assert_eq!(
            sample(midnight + MILLIS_PER_DAY - 1).daily_file_name().unwrap(),
            "2024-03-15.txt"
        );
        assert_eq!(
            sample(midnight + MILLIS_PER_DAY).daily_file_name().unwrap(),
            "2024-03-16.txt"
        );
        assert!(sample(i64::MAX).daily_file_name().is_err());
    }

    #[test]
    fn test_json() {
        let json: serde_json::Value =
            serde_json::from_str(&sample(NOON_ISH).to_json().unwrap()).unwrap();
        assert_eq!(json["timestamp"], NOON_ISH);
        assert_eq!(json["bx"], 17_250.5);
        assert_eq!(json["temperature"], 21.5);
    }

    #[test]
    fn test_delta_reports() {
        let mut tracker = DeltaTracker::new();
        let t0 = NOON_ISH;
        let mut reports = Vec::new();
        for i in 0..12 {
            if let Some(deltas) = tracker.record(t0 + i * 3000) {
                reports.push(deltas);
            }
        }
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], vec![3000; 5]);
        assert_eq!(reports[1], vec![3000; 6]);
        assert_eq!(tracker.received(), 12);
    }

    #[test]
    fn test_daily_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = DailyLog::new(dir.path().join("mag")).unwrap();

        let first = log.append(&sample(NOON_ISH)).unwrap();
        let second = log.append(&sample(NOON_ISH + 3000)).unwrap();
        let next_day = log.append(&sample(NOON_ISH + MILLIS_PER_DAY)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.file_name().unwrap(), "2024-03-15.txt");
        assert_eq!(next_day.file_name().unwrap(), "2024-03-16.txt");

        let contents = fs::read_to_string(&first).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("45296789 "));
        assert!(lines[1].starts_with("45299789 "));
    }

    #[test]
    fn test_daily_log_reads_back_what_it_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let log = DailyLog::new(dir.path()).unwrap();
        let midnight = NOON_ISH - 45_296_789;

        let written = vec![
            sample(midnight),
            sample(NOON_ISH),
            Sample {
                timestamp: midnight + MILLIS_PER_DAY - 1,
                bx: -0.1,
                by: 1e-9,
                bz: 48_123.456_789_012_3,
                temperature: -3.25,
            },
        ];
        for s in &written {
            log.append(s).unwrap();
        }
        // Just after midnight lands in the next day's file.
        let next_day = sample(midnight + MILLIS_PER_DAY + 1);
        log.append(&next_day).unwrap();

        let files = log.day_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_name().unwrap(), "2024-03-15.txt");
        assert_eq!(files[1].file_name().unwrap(), "2024-03-16.txt");

        assert_eq!(DailyLog::read_day(&files[0]).unwrap(), written);
        assert_eq!(DailyLog::read_day(&files[1]).unwrap(), vec![next_day]);
    }

    #[test]
    fn test_from_text_line() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let parsed = Sample::from_text_line(date, "45296789 17250.5 -1.0 44012.125 21.5").unwrap();
        assert_eq!(parsed, sample(NOON_ISH));

        for line in [
            "",
            "45296789 1.0 2.0 3.0",
            "45296789 1.0 2.0 3.0 4.0 5.0",
            "noon 1.0 2.0 3.0 4.0",
            "86400000 1.0 2.0 3.0 4.0",
            "-1 1.0 2.0 3.0 4.0",
            "0 1.0 x 3.0 4.0",
        ] {
            assert!(
                matches!(
                    Sample::from_text_line(date, line),
                    Err(ListenError::MalformedLine { .. })
                ),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn test_read_day_needs_dated_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("today.txt");
        fs::write(&path, "0 1.0 2.0 3.0 4.0\n").unwrap();
        assert!(matches!(
            DailyLog::read_day(&path),
            Err(ListenError::FileName(_))
        ));
    }
}
