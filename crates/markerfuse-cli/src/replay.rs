//! JSON-lines input and output.
//!
//! Input is one [`ObservationBatch`] per line; blank lines are skipped.
//! Output is one [`StampedPose`] per line.
//!
//! A recorded log may hold several sessions, each numbered from the start.
//! [`replay_frames`] treats a sequence number lower than the previous one as
//! the start of a new session; a repeated number is skipped.

use markerfuse_runtime::tracker::{FrameOutcome, Tracker};
use markerfuse_types::{ObservationBatch, StampedPose};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Open `path` for reading, or stdin for `"-"`.
pub fn open_input(path: &str) -> Result<Box<dyn BufRead + Send>, String> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).map_err(|e| format!("Failed to open frames at {path}: {e}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Open `path` for writing, or stdout when `None`.
pub fn open_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>, String> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// Iterator over the batches of a JSON-lines stream.
///
/// Errors carry the 1-based line number.
pub struct BatchReader<R> {
    lines: io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> BatchReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for BatchReader<R> {
    type Item = Result<ObservationBatch, String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(format!("line {}: read error: {}", self.line_no, e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line)
                    .map_err(|e| format!("line {}: invalid frame: {}", self.line_no, e)),
            );
        }
    }
}

/// Counters from one [`replay_frames`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    pub learned: u64,
    pub fused: u64,
    /// Frames whose sequence number repeated the previous one.
    pub skipped: u64,
    /// Times the sequence numbering went backwards.
    pub restarts: u64,
}

/// Feed every frame of a log to `tracker`, handing fresh poses to `on_pose`.
pub fn replay_frames<I, F>(
    tracker: &mut Tracker,
    batches: I,
    mut on_pose: F,
) -> Result<ReplayStats, String>
where
    I: IntoIterator<Item = Result<ObservationBatch, String>>,
    F: FnMut(&StampedPose) -> Result<(), String>,
{
    let mut stats = ReplayStats::default();
    for batch in batches {
        let batch = batch?;
        stats.frames += 1;
        if let Some(last) = tracker.last_sequence()
            && batch.sequence < last
        {
            warn!(
                last,
                sequence = batch.sequence,
                "Sequence numbering restarted; replaying as a new session"
            );
            tracker.restart_sequence();
            stats.restarts += 1;
        }
        match tracker.process_batch(&batch).map_err(|e| e.to_string())? {
            FrameOutcome::Learned { .. } => stats.learned += 1,
            FrameOutcome::Fused(pose) => {
                on_pose(&pose)?;
                stats.fused += 1;
            }
            FrameOutcome::Duplicate => stats.skipped += 1,
            FrameOutcome::Held | FrameOutcome::NoPose => {}
        }
    }
    if stats.skipped > 0 {
        warn!(skipped = stats.skipped, "Skipped frames with a repeated sequence number");
    }
    Ok(stats)
}

/// Writes fused poses as JSON lines.
pub struct PoseWriter<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> PoseWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn write(&mut self, pose: &StampedPose) -> Result<(), String> {
        serde_json::to_writer(&mut self.out, pose)
            .map_err(|e| format!("Failed to encode pose: {e}"))?;
        writeln!(self.out).map_err(|e| format!("Failed to write pose: {e}"))?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<W, String> {
        self.out.flush().map_err(|e| format!("Failed to flush output: {e}"))?;
        Ok(self.out)
    }
}
