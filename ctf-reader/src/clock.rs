//! Trace clock descriptor and timestamp rendering
//!
//! Timestamps travel through the reader at clock frequency. Rendering
//! rescales them to nanoseconds, applies the clock's own offset and the
//! display offset, and prints wall-clock time, a date-prefixed form, or
//! raw `seconds.nanoseconds` depending on the display configuration.

use std::io::{self, Write};

use chrono::{Local, TimeZone, Utc};
use uuid::Uuid;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Clock block from the trace metadata
#[derive(Debug, Clone)]
pub struct ClockDecl {
    pub name: String,
    pub uuid: Option<Uuid>,
    pub description: Option<String>,
    /// Frequency in Hz
    pub freq: u64,
    pub precision: u64,
    /// Offset in seconds from the clock origin
    pub offset_s: i64,
    /// Offset in clock cycles, added on top of `offset_s`
    pub offset: i64,
    pub absolute: bool,
}

impl Default for ClockDecl {
    fn default() -> Self {
        ClockDecl {
            name: String::new(),
            uuid: None,
            description: None,
            freq: NSEC_PER_SEC,
            precision: 0,
            offset_s: 0,
            offset: 0,
            absolute: false,
        }
    }
}

impl ClockDecl {
    /// Rescale a cycle count to nanoseconds.
    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        if self.freq == NSEC_PER_SEC {
            cycles
        } else {
            (u128::from(cycles) * u128::from(NSEC_PER_SEC) / u128::from(self.freq.max(1))) as u64
        }
    }

    /// Nanoseconds with the clock's own offsets applied.
    pub fn timestamp_ns(&self, cycles: u64) -> u64 {
        let ns = i128::from(self.cycles_to_ns(cycles));
        let offset_cycles_ns = i128::from(self.offset) * i128::from(NSEC_PER_SEC)
            / i128::from(self.freq.max(1));
        let total = ns + i128::from(self.offset_s) * i128::from(NSEC_PER_SEC) + offset_cycles_ns;
        total.clamp(0, i128::from(u64::MAX)) as u64
    }
}

/// Display configuration for timestamp rendering, carried explicitly
/// instead of process globals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockDisplay {
    /// Print the clock value without the clock offset
    pub raw: bool,
    /// Print `seconds.nanoseconds` instead of wall-clock time
    pub seconds: bool,
    /// Prefix wall-clock time with `YYYY-MM-DD`
    pub date: bool,
    /// Use GMT instead of local time
    pub gmt: bool,
    /// Extra display offset in seconds
    pub offset: i64,
}

/// Nanosecond value of a stream timestamp under the given display rules.
pub fn timestamp_ns(clock: Option<&ClockDecl>, timestamp: u64, raw: bool) -> u64 {
    match clock {
        None => timestamp,
        Some(c) if raw => c.cycles_to_ns(timestamp),
        Some(c) => c.timestamp_ns(timestamp),
    }
}

/// Render a timestamp, `HH:MM:SS.nnnnnnnnn` by default.
pub fn write_timestamp(
    w: &mut dyn Write,
    clock: Option<&ClockDecl>,
    timestamp: u64,
    opts: &ClockDisplay,
) -> io::Result<()> {
    let ns_total = timestamp_ns(clock, timestamp, opts.raw);
    let ts_sec_signed = (ns_total / NSEC_PER_SEC) as i64 + opts.offset;
    let ts_sec = ts_sec_signed.max(0) as u64;
    let ts_nsec = ns_total % NSEC_PER_SEC;

    if !opts.seconds {
        let rendered = if opts.gmt {
            Utc.timestamp_opt(ts_sec as i64, ts_nsec as u32)
                .single()
                .map(|dt| {
                    let date = opts.date.then(|| dt.format("%Y-%m-%d ").to_string());
                    (date, dt.format("%H:%M:%S").to_string())
                })
        } else {
            Local
                .timestamp_opt(ts_sec as i64, ts_nsec as u32)
                .single()
                .map(|dt| {
                    let date = opts.date.then(|| dt.format("%Y-%m-%d ").to_string());
                    (date, dt.format("%H:%M:%S").to_string())
                })
        };
        match rendered {
            Some((date, time)) => {
                if let Some(date) = date {
                    write!(w, "{date}")?;
                }
                return write!(w, "{time}.{ts_nsec:09}");
            }
            None => {
                eprintln!("[warning] Unable to get localtime.");
            }
        }
    }
    write!(w, "{ts_sec:3}.{ts_nsec:09}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(clock: Option<&ClockDecl>, timestamp: u64, opts: &ClockDisplay) -> String {
        let mut out = Vec::new();
        write_timestamp(&mut out, clock, timestamp, opts).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_clock__cycles_to_ns__then_rescaled() {
        let khz = ClockDecl {
            freq: 1_000,
            ..Default::default()
        };
        assert_eq!(khz.cycles_to_ns(1_500), 1_500_000_000);

        let ghz = ClockDecl::default();
        assert_eq!(ghz.cycles_to_ns(42), 42);
    }

    #[test]
    fn test_clock__timestamp_ns__then_offsets_applied() {
        let clock = ClockDecl {
            freq: NSEC_PER_SEC,
            offset_s: 2,
            offset: 500,
            ..Default::default()
        };
        assert_eq!(clock.timestamp_ns(100), 100 + 2 * NSEC_PER_SEC + 500);
    }

    #[test]
    fn test_write_timestamp__seconds_mode__then_sec_dot_ns() {
        let opts = ClockDisplay {
            seconds: true,
            ..Default::default()
        };
        let rendered = render(None, 5 * NSEC_PER_SEC + 123, &opts);
        assert_eq!(rendered, "  5.000000123");
    }

    #[test]
    fn test_write_timestamp__gmt_epoch__then_midnight() {
        let opts = ClockDisplay {
            gmt: true,
            ..Default::default()
        };
        let rendered = render(None, 0, &opts);
        assert_eq!(rendered, "00:00:00.000000000");
    }

    #[test]
    fn test_write_timestamp__gmt_with_date__then_date_prefixed() {
        let opts = ClockDisplay {
            gmt: true,
            date: true,
            ..Default::default()
        };
        let rendered = render(None, 0, &opts);
        assert_eq!(rendered, "1970-01-01 00:00:00.000000000");
    }

    #[test]
    fn test_write_timestamp__raw_skips_clock_offset__then_unshifted() {
        let clock = ClockDecl {
            offset_s: 3600,
            ..Default::default()
        };
        let raw = ClockDisplay {
            raw: true,
            seconds: true,
            ..Default::default()
        };
        let cooked = ClockDisplay {
            seconds: true,
            ..Default::default()
        };
        assert_eq!(render(Some(&clock), 0, &raw), "  0.000000000");
        assert_eq!(render(Some(&clock), 0, &cooked), "3600.000000000");
    }

    #[test]
    fn test_write_timestamp__display_offset__then_added_to_seconds() {
        let opts = ClockDisplay {
            seconds: true,
            offset: 10,
            ..Default::default()
        };
        assert_eq!(render(None, NSEC_PER_SEC, &opts), " 11.000000000");
    }
}
