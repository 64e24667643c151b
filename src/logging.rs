//! Single-line structured logging for the referral engine.
//!
//! Every line carries a wall-clock timestamp and the source location of the
//! call site:
//!
//! ```text
//! 20261017T09:12:44.031 - src/orchestrator.rs:211 - join: u-42 attributed to u-1 (pending)
//! ```
//!
//! User ids and invite codes are rendered through [`user`] and [`code`] so
//! they look the same everywhere and, on a terminal, get a stable colour.
//!
//! Output goes to stderr unless [`set_writer`] installs another destination.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::UserId;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Enable colour when stderr is a terminal. Call once at startup.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Send all subsequent [`rlog!`] output to `w`. Disables colour.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    let mut writer = LOG_WRITER.lock().unwrap_or_else(|e| e.into_inner());
    *writer = w;
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const CODE_COLOUR: &str = "\x1b[96m";

const USER_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[31m", "\x1b[32m",
    "\x1b[33m", "\x1b[34m", "\x1b[35m",
];

fn colour_for(id: UserId) -> &'static str {
    // Fibonacci hashing spreads sequential ids across the palette.
    let mixed = id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    USER_COLOURS[(mixed >> 59) as usize % USER_COLOURS.len()]
}

/// Render a user id as `u-<id>`.
pub fn user(id: UserId) -> String {
    if colour_enabled() {
        format!("{}u-{}{RESET}", colour_for(id), id.0)
    } else {
        format!("u-{}", id.0)
    }
}

const MAX_CODE_IN_LOG: usize = 24;

/// Render an invite code as received, truncated so hostile input cannot
/// flood the log.
pub fn code(raw: &str) -> String {
    let shown: String = raw
        .chars()
        .take(MAX_CODE_IN_LOG)
        .map(|c| if c.is_control() { '?' } else { c })
        .collect();
    let ellipsis = if raw.chars().count() > MAX_CODE_IN_LOG {
        "…"
    } else {
        ""
    };
    if colour_enabled() {
        format!("{CODE_COLOUR}\"{shown}{ellipsis}\"{RESET}")
    } else {
        format!("\"{shown}{ellipsis}\"")
    }
}

/// Gregorian (year, month, day) for a count of days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `YYYYMMDDTHH:MM:SS.mmm` for a millisecond Unix timestamp.
pub fn format_millis(unix_millis: u64) -> String {
    let secs = unix_millis / 1000;
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let tod = secs % 86_400;
    format!(
        "{y:04}{m:02}{d:02}T{:02}:{:02}:{:02}.{:03}",
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60,
        unix_millis % 1000
    )
}

pub fn format_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    format_millis(millis)
}

/// Write one line. Used by [`rlog!`]; call the macro instead.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(*writer, "{formatted}");
}

/// Log a formatted line with timestamp and call-site location.
///
/// ```ignore
/// rlog!("join: {} ignored, {}", logging::user(id), reason);
/// ```
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_for_known_instant() {
        // 2026-10-17 09:12:44.031 UTC
        assert_eq!(format_millis(1_792_228_364_031), "20261017T09:12:44.031");
        assert_eq!(format_millis(0), "19700101T00:00:00.000");
    }

    #[test]
    fn leap_day_is_rendered() {
        // 2024-02-29 12:00:00 UTC
        assert_eq!(format_millis(1_709_208_000_000), "20240229T12:00:00.000");
    }

    #[test]
    fn hostile_codes_are_truncated_and_sanitised() {
        let long = "A".repeat(100);
        let shown = code(&long);
        assert!(shown.contains('…'));
        assert!(shown.len() < 40);
        assert_eq!(code("ab\ncd"), "\"ab?cd\"");
    }

    #[test]
    fn user_ids_render_plainly_without_colour() {
        assert_eq!(user(UserId(42)), "u-42");
    }
}
