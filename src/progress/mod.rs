//! Byte accounting for transfers
//!
//! [`CountingWriter`] is a write-through decorator: every write is forwarded
//! unchanged to the underlying destination and its byte count passed to a
//! caller-supplied callback. The callback owns any throttling; the writer
//! itself never rate-limits. Both the upload and download paths wrap their
//! sinks in it.
//!
//! [`ProgressMeter`] is the throttled callback target used for interactive
//! output: cumulative megabytes and instantaneous throughput, printed to
//! stderr at most once per second.

use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Minimum interval between progress reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Write-through decorator that reports byte counts to a callback.
pub struct CountingWriter<W, F> {
    inner: W,
    on_write: F,
}

impl<W: Write, F: FnMut(u64)> CountingWriter<W, F> {
    /// Wrap `inner`, invoking `on_write` with the size of each completed write.
    pub fn new(inner: W, on_write: F) -> Self {
        Self { inner, on_write }
    }

    /// Unwrap, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write, F: FnMut(u64)> Write for CountingWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        (self.on_write)(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Throttled throughput reporter for one transfer session.
#[derive(Debug)]
pub struct ProgressMeter {
    transferred: u64,
    started: Instant,
    last_report: Instant,
}

impl ProgressMeter {
    /// Start a meter; the session clock begins now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            transferred: 0,
            started: now,
            last_report: now,
        }
    }

    /// Total bytes recorded so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Record `n` transferred bytes, emitting a progress line if at least
    /// [`REPORT_INTERVAL`] has passed since the last one.
    pub fn record(&mut self, n: u64) {
        self.transferred += n;
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            eprint!("\r{}", self.line());
            self.last_report = Instant::now();
        }
    }

    /// Emit a final line with the session totals.
    pub fn finish(&self) {
        eprintln!("\r{}", self.line());
    }

    /// Format the current totals as `<MB> MB, <rate> MB/s`.
    pub fn line(&self) -> String {
        let mb = self.transferred as f64 / 1_000_000.0;
        let secs = self.started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { mb / secs } else { 0.0 };
        format!("{:.0} MB, {:.2} MB/s", mb, rate)
    }
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_writer_forwards_bytes_unchanged() {
        let mut seen = 0u64;
        let mut sink = Vec::new();
        {
            let mut writer = CountingWriter::new(&mut sink, |n| seen += n);
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"world").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(sink, b"hello world");
        assert_eq!(seen, 11);
    }

    #[test]
    fn test_counting_writer_reports_each_write() {
        let mut counts = Vec::new();
        let mut writer = CountingWriter::new(Vec::new(), |n| counts.push(n));
        writer.write_all(&[0u8; 4096]).unwrap();
        writer.write_all(&[0u8; 10]).unwrap();
        assert_eq!(counts.iter().sum::<u64>(), 4106);
    }

    #[test]
    fn test_meter_accumulates() {
        let mut meter = ProgressMeter::new();
        meter.record(500_000);
        meter.record(1_500_000);
        assert_eq!(meter.transferred(), 2_000_000);
        assert!(meter.line().starts_with("2 MB"));
    }
}
