//! Capture logs in candump format
//!
//! One line per frame: `(1697712000.123456) can1 123#0011223344556677`.
//! The interface token is written as `can<channel>` and ignored on parse.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flashcheck_core::{CanId, ChannelId, Frame};
use tracing::{debug, trace};

use crate::error::CaptureError;

/// A frame and when it arrived, relative to the start of the capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRecord {
    pub offset: Duration,
    pub frame: Frame,
}

/// Every frame seen on one channel during a capture window
#[derive(Debug, Clone)]
pub struct CaptureLog {
    channel: ChannelId,
    started_at: DateTime<Utc>,
    records: Vec<CaptureRecord>,
    path: Option<PathBuf>,
}

impl CaptureLog {
    pub fn new(channel: ChannelId, started_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            started_at,
            records: Vec::new(),
            path: None,
        }
    }

    /// Record `frame` at `offset`, truncated to the microsecond resolution
    /// of the on-disk format
    pub fn push(&mut self, offset: Duration, frame: Frame) {
        let offset = Duration::new(offset.as_secs(), offset.subsec_micros() * 1000);
        self.records.push(CaptureRecord { offset, frame });
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// File this log was saved to or loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Arrival offsets of `id`, in capture order
    pub fn timestamps_for(&self, id: CanId) -> Vec<Duration> {
        self.records
            .iter()
            .filter(|r| r.frame.identifier() == id)
            .map(|r| r.offset)
            .collect()
    }

    pub fn write_candump<W: Write>(&self, mut out: W) -> io::Result<()> {
        let base = self.started_at.timestamp_micros();
        for record in &self.records {
            let micros = base + record.offset.as_micros() as i64;
            writeln!(
                out,
                "({}.{:06}) can{} {:03X}#{}",
                micros.div_euclid(1_000_000),
                micros.rem_euclid(1_000_000),
                self.channel.get(),
                record.frame.identifier().raw(),
                hex::encode_upper(record.frame.payload()),
            )?;
        }
        Ok(())
    }

    /// Write the log to `path`, creating parent directories
    pub fn save(&mut self, path: &Path) -> Result<(), CaptureError> {
        let io_err = |source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut buf = Vec::new();
        self.write_candump(&mut buf).map_err(io_err)?;
        fs::write(path, buf).map_err(io_err)?;

        debug!(path = %path.display(), frames = self.records.len(), "Capture log saved");
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Read a candump log from disk
    pub fn load(path: &Path, channel: ChannelId) -> Result<Self, CaptureError> {
        let content = fs::read_to_string(path).map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut log = Self::parse(&content, channel)?;
        log.path = Some(path.to_path_buf());
        Ok(log)
    }

    /// Parse candump text
    ///
    /// Offsets are relative to the first frame. Extended and remote frames
    /// are skipped, as are blank lines and `#` comments.
    pub fn parse(content: &str, channel: ChannelId) -> Result<Self, CaptureError> {
        let mut first: Option<i64> = None;
        let mut records = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parse_err = |message: String| CaptureError::Parse {
                line: line_no,
                message,
            };

            let mut tokens = line.split_whitespace();
            let (Some(stamp), Some(_interface), Some(data)) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(parse_err("expected '(timestamp) interface id#data'".into()));
            };

            let micros = parse_timestamp(stamp).ok_or_else(|| parse_err(format!("bad timestamp '{}'", stamp)))?;
            let Some((id, payload)) = data.split_once('#') else {
                return Err(parse_err(format!("bad frame '{}'", data)));
            };

            // Extended identifiers use 8 hex digits
            if id.len() > 3 || payload.starts_with('R') {
                trace!(line = line_no, frame = data, "Skipping non-standard frame");
                continue;
            }

            let raw = u32::from_str_radix(id, 16).map_err(|_| parse_err(format!("bad identifier '{}'", id)))?;
            let identifier = CanId::new(raw).map_err(|e| parse_err(e.to_string()))?;
            let bytes = hex::decode(payload).map_err(|e| parse_err(format!("bad payload: {}", e)))?;
            let frame = Frame::new(channel, identifier, &bytes).map_err(|e| parse_err(e.to_string()))?;

            let start = *first.get_or_insert(micros);
            let offset = Duration::from_micros(micros.saturating_sub(start).max(0) as u64);
            records.push(CaptureRecord { offset, frame });
        }

        let started_at = first
            .and_then(DateTime::from_timestamp_micros)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Self {
            channel,
            started_at,
            records,
            path: None,
        })
    }
}

/// `(seconds.fraction)` to microseconds since the epoch
fn parse_timestamp(token: &str) -> Option<i64> {
    let inner = token.strip_prefix('(')?.strip_suffix(')')?;
    let (secs, frac) = inner.split_once('.').unwrap_or((inner, ""));
    if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let frac_micros: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).parse().ok()?
    };
    secs.checked_mul(1_000_000)?.checked_add(frac_micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn id(raw: u32) -> CanId {
        CanId::new(raw).unwrap()
    }

    #[test]
    fn test_write_candump_format() {
        let started = DateTime::from_timestamp_micros(1_697_712_000_000_000).unwrap();
        let mut log = CaptureLog::new(ch(1), started);
        log.push(
            Duration::from_micros(123_456),
            Frame::new(ch(1), id(0x123), &[0x00, 0x11, 0x22]).unwrap(),
        );

        let mut out = Vec::new();
        log.write_candump(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "(1697712000.123456) can1 123#0011220000000000\n"
        );
    }

    #[test]
    fn test_parse_offsets_relative_to_first_frame() {
        let content = "\
# recorded on the bench
(1697712000.100000) can0 123#01
(1697712000.145000) can0 456#0102
(1697712000.190000) can0 123#02
(1697712000.200000) can0 18DAF110#00
(1697712000.210000) can0 123#R
";
        let log = CaptureLog::parse(content, ch(1)).unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(
            log.timestamps_for(id(0x123)),
            vec![Duration::ZERO, Duration::from_millis(90)]
        );
        assert_eq!(log.timestamps_for(id(0x456)), vec![Duration::from_millis(45)]);
        assert_eq!(log.started_at.timestamp_micros(), 1_697_712_000_100_000);
    }

    #[test]
    fn test_parse_reports_line_number() {
        let content = "(1.000000) can0 123#00\n(oops) can0 123#00\n";
        let err = CaptureLog::parse(content, ch(1)).unwrap_err();
        assert!(matches!(err, CaptureError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_short_fraction() {
        assert_eq!(parse_timestamp("(12.5)"), Some(12_500_000));
        assert_eq!(parse_timestamp("(12)"), Some(12_000_000));
        assert_eq!(parse_timestamp("12.5"), None);
    }

    #[test]
    fn test_push_truncates_to_microseconds() {
        let mut log = CaptureLog::new(ch(1), DateTime::UNIX_EPOCH);
        let frame = Frame::new(ch(1), id(0x123), &[]).unwrap();
        log.push(Duration::from_nanos(1_500_999), frame);

        assert_eq!(log.timestamps_for(id(0x123)), vec![Duration::from_micros(1_500)]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run_ch2.log");

        let started = DateTime::from_timestamp_micros(1_000_000).unwrap();
        let mut log = CaptureLog::new(ch(2), started);
        for k in 0..3u64 {
            log.push(
                Duration::from_millis(10 * k),
                Frame::new(ch(2), id(0x7FF), &[k as u8]).unwrap(),
            );
        }
        log.save(&path).unwrap();
        assert_eq!(log.path(), Some(path.as_path()));

        let loaded = CaptureLog::load(&path, ch(2)).unwrap();
        assert_eq!(loaded.records(), log.records());
        assert_eq!(loaded.path(), Some(path.as_path()));
    }
}
