// THEORY:
// A `RecordSink` is where finished records go. The session hands every record to
// its sink exactly once, in the order it was produced, and never asks for it back.
// Two sinks ship with the crate: `MemorySink` keeps the typed records (tests,
// embedding), and `FileSink` appends them to the three text streams.

use crate::core_modules::records::{CellSummary, SessionMetadata, SessionSummary, StepRecord, StillRecord};
use crate::error::EngineResult;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only destination for session records.
pub trait RecordSink {
    fn write_metadata(&mut self, metadata: &SessionMetadata) -> EngineResult<()>;
    fn write_step(&mut self, step: &StepRecord) -> EngineResult<()>;
    fn write_session_summary(&mut self, summary: &SessionSummary) -> EngineResult<()>;
    fn write_cell_summary(&mut self, summary: &CellSummary) -> EngineResult<()>;
    /// The density block of a still image. Goes to the same stream as step records.
    fn write_still(&mut self, still: &StillRecord) -> EngineResult<()>;
}

impl<K: RecordSink + ?Sized> RecordSink for Box<K> {
    fn write_metadata(&mut self, metadata: &SessionMetadata) -> EngineResult<()> {
        (**self).write_metadata(metadata)
    }

    fn write_step(&mut self, step: &StepRecord) -> EngineResult<()> {
        (**self).write_step(step)
    }

    fn write_session_summary(&mut self, summary: &SessionSummary) -> EngineResult<()> {
        (**self).write_session_summary(summary)
    }

    fn write_cell_summary(&mut self, summary: &CellSummary) -> EngineResult<()> {
        (**self).write_cell_summary(summary)
    }

    fn write_still(&mut self, still: &StillRecord) -> EngineResult<()> {
        (**self).write_still(still)
    }
}

/// Keeps every record in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySink {
    pub metadata: Vec<SessionMetadata>,
    pub steps: Vec<StepRecord>,
    pub session_summaries: Vec<SessionSummary>,
    pub cell_summaries: Vec<CellSummary>,
    pub stills: Vec<StillRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordSink for MemorySink {
    fn write_metadata(&mut self, metadata: &SessionMetadata) -> EngineResult<()> {
        self.metadata.push(*metadata);
        Ok(())
    }

    fn write_step(&mut self, step: &StepRecord) -> EngineResult<()> {
        self.steps.push(step.clone());
        Ok(())
    }

    fn write_session_summary(&mut self, summary: &SessionSummary) -> EngineResult<()> {
        self.session_summaries.push(summary.clone());
        Ok(())
    }

    fn write_cell_summary(&mut self, summary: &CellSummary) -> EngineResult<()> {
        self.cell_summaries.push(summary.clone());
        Ok(())
    }

    fn write_still(&mut self, still: &StillRecord) -> EngineResult<()> {
        self.stills.push(still.clone());
        Ok(())
    }
}

/// Appends records to `<prefix>_data_frame.txt`, `<prefix>_data_meta.txt` and `<prefix>_data_cell.txt`.
#[derive(Debug)]
pub struct FileSink {
    frame: BufWriter<File>,
    meta: BufWriter<File>,
    cell: BufWriter<File>,
    paths: StreamPaths,
}

/// Locations of the three record streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPaths {
    pub frame: PathBuf,
    pub meta: PathBuf,
    pub cell: PathBuf,
}

impl StreamPaths {
    pub fn new(directory: impl AsRef<Path>, prefix: &str) -> Self {
        let directory = directory.as_ref();
        Self {
            frame: directory.join(format!("{prefix}_data_frame.txt")),
            meta: directory.join(format!("{prefix}_data_meta.txt")),
            cell: directory.join(format!("{prefix}_data_cell.txt")),
        }
    }
}

impl FileSink {
    /// Opens (creating if needed) the three streams for appending. The directory must exist.
    pub fn create(directory: impl AsRef<Path>, prefix: &str) -> EngineResult<Self> {
        let paths = StreamPaths::new(directory, prefix);
        let open = |path: &Path| -> EngineResult<BufWriter<File>> {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BufWriter::new(file))
        };
        Ok(Self {
            frame: open(&paths.frame)?,
            meta: open(&paths.meta)?,
            cell: open(&paths.cell)?,
            paths,
        })
    }

    pub fn paths(&self) -> &StreamPaths {
        &self.paths
    }

    pub fn flush(&mut self) -> EngineResult<()> {
        self.frame.flush()?;
        self.meta.flush()?;
        self.cell.flush()?;
        Ok(())
    }
}

impl RecordSink for FileSink {
    fn write_metadata(&mut self, metadata: &SessionMetadata) -> EngineResult<()> {
        write!(self.meta, "{metadata}")?;
        self.meta.flush()?;
        Ok(())
    }

    // Step blocks stay buffered; summaries flush everything.
    fn write_step(&mut self, step: &StepRecord) -> EngineResult<()> {
        write!(self.frame, "{step}")?;
        Ok(())
    }

    fn write_session_summary(&mut self, summary: &SessionSummary) -> EngineResult<()> {
        write!(self.meta, "{summary}")?;
        self.flush()
    }

    fn write_cell_summary(&mut self, summary: &CellSummary) -> EngineResult<()> {
        write!(self.cell, "{summary}")?;
        self.flush()
    }

    fn write_still(&mut self, still: &StillRecord) -> EngineResult<()> {
        write!(self.frame, "{still}")?;
        self.flush()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            tracing::warn!(%error, "failed to flush record streams");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_records_in_order() {
        let mut sink = MemorySink::new();
        for step_index in 0..3 {
            sink.write_step(&StepRecord {
                step_index,
                average_speed: 0.0,
                polarization: 0.0,
                angular_momentum: 0.0,
                cells: Vec::new(),
            })
            .unwrap();
        }
        let indices: Vec<u64> = sink.steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn stream_paths_follow_the_prefix() {
        let paths = StreamPaths::new("/tmp/out", "10_18_09_30");
        assert_eq!(paths.frame, PathBuf::from("/tmp/out/10_18_09_30_data_frame.txt"));
        assert_eq!(paths.meta, PathBuf::from("/tmp/out/10_18_09_30_data_meta.txt"));
        assert_eq!(paths.cell, PathBuf::from("/tmp/out/10_18_09_30_data_cell.txt"));
    }
}
