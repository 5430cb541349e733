//! Append-only artifact writer.
//!
//! Samplers and the benchmark runner append records as they go rather
//! than buffering a whole series in memory. Every appended line is
//! flushed immediately: if the rig dies mid-run, everything already
//! appended remains usable. Each writer exclusively owns its output
//! file; components never share one.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::json::SeriesMeta;

/// Errors produced by [`ArtifactWriter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`]
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Wrapper for [`serde_json::Error`]
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
/// Writes one artifact file, one JSON line per record.
pub struct ArtifactWriter<T> {
    fp: BufWriter<File>,
    path: PathBuf,
    records: u64,
    _record: PhantomData<T>,
}

impl<T> ArtifactWriter<T>
where
    T: Serialize,
{
    /// Create the artifact file, truncating any previous run's output, and
    /// write the series meta as its first line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the meta line
    /// cannot be written.
    pub fn create<P: AsRef<Path>>(path: P, meta: &SeriesMeta) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let fp = File::create(&path)?;
        let mut writer = Self {
            fp: BufWriter::new(fp),
            path,
            records: 0,
            _record: PhantomData,
        };
        writer.write_line(meta)?;
        Ok(writer)
    }

    /// Append one record and flush it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails. The caller
    /// decides whether a failed append is fatal; the writer itself remains
    /// usable.
    pub fn append(&mut self, record: &T) -> Result<(), Error> {
        self.write_line(record)?;
        self.records += 1;
        Ok(())
    }

    fn write_line<S: Serialize>(&mut self, line: &S) -> Result<(), Error> {
        let pyld = serde_json::to_string(line)?;
        self.fp.write_all(pyld.as_bytes())?;
        self.fp.write_all(b"\n")?;
        self.fp.flush()?;
        Ok(())
    }

    /// The number of records appended so far, excluding the meta line.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// The path of the artifact file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use uuid::Uuid;

    use super::*;
    use crate::json::{RawSample, SeriesKind};

    fn meta() -> SeriesMeta {
        SeriesMeta {
            run_id: Uuid::new_v4(),
            label: String::from("nanos"),
            kind: SeriesKind::RawSamples,
        }
    }

    #[test]
    fn appended_lines_are_durable_before_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nanos_raw.jsonl");
        let mut writer: ArtifactWriter<RawSample> =
            ArtifactWriter::create(&path, &meta()).expect("create writer");

        writer
            .append(&RawSample {
                time: 100.0,
                cpu_percent: 5.0,
                memory_bytes: 204_800_000,
            })
            .expect("append");

        // The writer is still alive; the line must already be on disk.
        let contents = fs::read_to_string(&path).expect("read artifact");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let sample: RawSample = serde_json::from_str(lines[1]).expect("sample line parses");
        assert_eq!(sample.memory_bytes, 204_800_000);
        assert_eq!(writer.records(), 1);
    }

    #[test]
    fn meta_line_identifies_the_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docker_raw.jsonl");
        let m = meta();
        let _writer: ArtifactWriter<RawSample> =
            ArtifactWriter::create(&path, &m).expect("create writer");

        let contents = fs::read_to_string(&path).expect("read artifact");
        let first = contents.lines().next().expect("meta line present");
        let parsed: SeriesMeta = serde_json::from_str(first).expect("meta line parses");
        assert_eq!(parsed, m);
    }
}
