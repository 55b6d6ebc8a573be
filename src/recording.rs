//! Labelled tick recordings for training data.
//!
//! A [`RecordingSession`] collects the tick features of one player under a status label
//! (`CHEAT...`, `LEGIT...`, anything else is unlabeled) and writes them out as CSV.
//! Recording is independent of classification: it samples every non-echo movement
//! report while the player is within [`RECORDING_COMBAT_TICKS`] of their last attack.

use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::AimwatchResult;
use crate::sampler::TickFeature;

/// Ticks after an attack during which movement is recorded.
pub const RECORDING_COMBAT_TICKS: u32 = 40;

/// First line of every exported file.
pub const CSV_HEADER: &str = "is_cheating,delta_yaw,delta_pitch,accel_yaw,accel_pitch,\
jerk_yaw,jerk_pitch,gcd_error_yaw,gcd_error_pitch";

/// Training label derived from a session's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingLabel {
    /// Status starts with `CHEAT`.
    Cheat,
    /// Status starts with `LEGIT`.
    Legit,
    /// Anything else.
    Unlabeled,
}

impl RecordingLabel {
    /// Derives the label from a free-form status.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        if status.starts_with("CHEAT") {
            Self::Cheat
        } else if status.starts_with("LEGIT") {
            Self::Legit
        } else {
            Self::Unlabeled
        }
    }

    /// Value of the `is_cheating` column.
    #[must_use]
    pub const fn is_cheating(self) -> u8 {
        match self {
            Self::Cheat => 1,
            Self::Legit | Self::Unlabeled => 0,
        }
    }
}

/// One player's recording.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    player_name: String,
    status: String,
    started: DateTime<Local>,
    ticks: Vec<TickFeature>,
}

impl RecordingSession {
    /// Starts a session now.
    #[must_use]
    pub fn new(player_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self::started_at(player_name, status, Local::now())
    }

    /// Starts a session with an explicit start time.
    #[must_use]
    pub fn started_at(
        player_name: impl Into<String>,
        status: impl Into<String>,
        started: DateTime<Local>,
    ) -> Self {
        Self {
            player_name: player_name.into(),
            status: status.into(),
            started,
            ticks: Vec::new(),
        }
    }

    /// Appends a tick.
    pub fn record(&mut self, tick: TickFeature) {
        self.ticks.push(tick);
    }

    /// Ticks recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// The status the session was started with.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Label derived from the status.
    #[must_use]
    pub fn label(&self) -> RecordingLabel {
        RecordingLabel::from_status(&self.status)
    }

    /// Writes the header and one row per tick. Writes nothing for an empty session.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::RecordingError`](crate::AimwatchError::RecordingError) if
    /// the writer fails.
    pub fn write_csv<W: Write>(&self, mut out: W) -> AimwatchResult<()> {
        if self.ticks.is_empty() {
            return Ok(());
        }
        let flag = self.label().is_cheating();
        let mut line = String::with_capacity(128);
        writeln!(out, "{CSV_HEADER}")?;
        for tick in &self.ticks {
            line.clear();
            // writing into a String cannot fail
            let _ = write!(line, "{flag}");
            for value in tick.as_array() {
                line.push(',');
                push_fixed6(&mut line, value);
            }
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(())
    }

    /// File name for the export: `<status>_<player>_<yyyyMMdd-HHmmss>.csv` in server
    /// local time.
    ///
    /// Spaces in the status become `#`, path-hostile characters become `-`, and anything
    /// from `_GLOBAL_` on is cut.
    #[must_use]
    pub fn file_name(&self) -> String {
        let mut status: String = self
            .status
            .chars()
            .map(|c| match c {
                ' ' => '#',
                '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' | '\'' => '-',
                other => other,
            })
            .collect();
        if let Some(index) = status.find("_GLOBAL_") {
            status.truncate(index);
        }
        format!(
            "{status}_{}_{}.csv",
            self.player_name,
            self.started.format("%Y%m%d-%H%M%S")
        )
    }

    /// Writes the session into `dir` (created if missing) and returns the file path.
    /// Returns `None` without touching the filesystem when the session is empty.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::RecordingError`](crate::AimwatchError::RecordingError) on
    /// any I/O failure.
    pub fn save(&self, dir: &Path) -> AimwatchResult<Option<PathBuf>> {
        if self.ticks.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let file = fs::File::create(&path)?;
        self.write_csv(BufWriter::new(file))?;
        tracing::info!(
            path = %path.display(),
            ticks = self.ticks.len(),
            "saved recording"
        );
        Ok(Some(path))
    }
}

fn push_fixed6(out: &mut String, value: f32) {
    if !value.is_finite() {
        out.push_str("0.000000");
        return;
    }
    let value = f64::from(value);
    let scaled = (value.abs() * 1_000_000.0).round() as u64;
    if value < 0.0 {
        out.push('-');
    }
    let _ = write!(out, "{}.{:06}", scaled / 1_000_000, scaled % 1_000_000);
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(value: f32) -> TickFeature {
        TickFeature {
            delta_yaw: value,
            delta_pitch: -value,
            accel_yaw: 0.0,
            accel_pitch: f32::NAN,
            jerk_yaw: f32::INFINITY,
            jerk_pitch: 1.0,
            gcd_error_yaw: 0.000_000_4,
            gcd_error_pitch: 12.5,
        }
    }

    fn fixed6(value: f32) -> String {
        let mut out = String::new();
        push_fixed6(&mut out, value);
        out
    }

    #[test]
    fn labels_follow_status_prefix() {
        assert_eq!(RecordingLabel::from_status("CHEAT killaura"), RecordingLabel::Cheat);
        assert_eq!(RecordingLabel::from_status("LEGIT_GLOBAL_1"), RecordingLabel::Legit);
        assert_eq!(RecordingLabel::from_status("cheat"), RecordingLabel::Unlabeled);
        assert_eq!(RecordingLabel::from_status(""), RecordingLabel::Unlabeled);
    }

    #[test]
    fn fixed_point_formatting() {
        assert_eq!(fixed6(1.5), "1.500000");
        assert_eq!(fixed6(-0.25), "-0.250000");
        assert_eq!(fixed6(0.0), "0.000000");
        assert_eq!(fixed6(f32::NAN), "0.000000");
        assert_eq!(fixed6(f32::NEG_INFINITY), "0.000000");
        assert_eq!(fixed6(0.000_000_4), "0.000000");
    }

    #[test]
    fn csv_has_header_and_rows() {
        let mut session = RecordingSession::new("Steve", "CHEAT");
        session.record(tick(1.5));
        session.record(tick(0.25));

        let mut out = Vec::new();
        session.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "1,1.500000,-1.500000,0.000000,0.000000,0.000000,1.000000,0.000000,12.500000"
        );
        assert!(lines[2].starts_with("1,0.250000,-0.250000,"));
    }

    #[test]
    fn unlabeled_rows_are_not_cheating() {
        let mut session = RecordingSession::new("Alex", "warmup");
        session.record(tick(1.0));
        let mut out = Vec::new();
        session.write_csv(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().lines().nth(1).unwrap().starts_with("0,"));
    }

    #[test]
    fn empty_session_writes_nothing() {
        let session = RecordingSession::new("Steve", "LEGIT");
        let mut out = Vec::new();
        session.write_csv(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(session.save(Path::new("/nonexistent/aimwatch")).unwrap(), None);
    }

    #[test]
    fn file_name_is_sanitized() {
        let started = Local.with_ymd_and_hms(2024, 2, 29, 13, 45, 7).unwrap();
        let session = RecordingSession::started_at("Steve", "CHEAT aim/bot: v2_GLOBAL_x", started);
        assert_eq!(session.file_name(), "CHEAT#aim-bot-#v2_Steve_20240229-134507.csv");
    }

    #[test]
    fn file_name_pads_the_local_timestamp() {
        let started = Local.with_ymd_and_hms(2000, 1, 2, 3, 4, 5).unwrap();
        let session = RecordingSession::started_at("Alex", "LEGIT", started);
        assert_eq!(session.file_name(), "LEGIT_Alex_20000102-030405.csv");
    }

    #[test]
    fn save_writes_into_directory() {
        let dir = std::env::temp_dir().join(format!("aimwatch-recording-{}", std::process::id()));
        let mut session = RecordingSession::new("Steve", "LEGIT");
        session.record(tick(1.0));

        let path = session.save(&dir).unwrap().expect("non-empty session is saved");
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(CSV_HEADER));
        fs::remove_dir_all(&dir).unwrap();
    }
}
