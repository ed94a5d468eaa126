//! Acceptance check for a stress run: everything written to the log and its
//! rotated siblings must have reached the sink exactly once.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::stress::StressRecord;

#[derive(Debug)]
pub enum VerifyError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Pattern(glob::PatternError),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            VerifyError::Pattern(e) => write!(f, "invalid log pattern: {e}"),
        }
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VerifyError::Io { source, .. } => Some(source),
            VerifyError::Pattern(e) => Some(e),
        }
    }
}

impl From<glob::PatternError> for VerifyError {
    fn from(e: glob::PatternError) -> Self {
        VerifyError::Pattern(e)
    }
}

fn open(path: &Path) -> Result<std::fs::File, VerifyError> {
    std::fs::File::open(path).map_err(|e| VerifyError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Number of newline characters in the file.
pub fn count_lines(path: &Path) -> Result<u64, VerifyError> {
    let mut file = open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut lines = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| VerifyError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            return Ok(lines);
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
}

/// Lines across `log` and every sibling whose name starts with it.
/// Compressed siblings cannot be counted and are skipped.
pub fn expected_lines(log: &Path) -> Result<u64, VerifyError> {
    let pattern = format!("{}*", glob::Pattern::escape(&log.to_string_lossy()));
    let mut total = 0;
    for entry in glob::glob(&pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "gz") {
            warn!(path = %path.display(), "skipping compressed rotation");
            continue;
        }
        let lines = count_lines(&path)?;
        debug!(path = %path.display(), lines, "counted log lines");
        total += lines;
    }
    Ok(total)
}

/// Sequence numbers of the sink's records tagged with `key`.
pub fn collect_sequence(output: &Path, key: &str) -> Result<Vec<u64>, VerifyError> {
    let reader = BufReader::new(open(output)?);
    let mut sequence = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| VerifyError::Io {
            path: output.to_path_buf(),
            source: e,
        })?;
        match serde_json::from_str::<StressRecord>(&line) {
            Ok(record) if record.key == key => sequence.push(record.i),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "skipping non-record line"),
        }
    }
    Ok(sequence)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub expected_lines: u64,
    pub actual_lines: u64,
    /// Sequence numbers in `0..count` never delivered.
    pub missing: Vec<u64>,
    /// Sequence numbers delivered more than once.
    pub duplicated: Vec<u64>,
    /// Sequence numbers outside `0..count`.
    pub unexpected: Vec<u64>,
}

impl VerifyReport {
    pub fn from_sequence(expected_lines: u64, actual_lines: u64, count: u64, sequence: &[u64]) -> Self {
        let mut seen: BTreeMap<u64, u32> = BTreeMap::new();
        for &i in sequence {
            *seen.entry(i).or_default() += 1;
        }
        Self {
            expected_lines,
            actual_lines,
            missing: (0..count).filter(|i| !seen.contains_key(i)).collect(),
            duplicated: seen
                .iter()
                .filter(|(_, n)| **n > 1)
                .map(|(&i, _)| i)
                .collect(),
            unexpected: seen.keys().copied().filter(|&i| i >= count).collect(),
        }
    }

    pub fn passed(&self) -> bool {
        self.expected_lines == self.actual_lines
            && self.missing.is_empty()
            && self.duplicated.is_empty()
    }
}

impl std::fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed() {
            return write!(f, "ok: {} lines delivered", self.actual_lines);
        }
        writeln!(f, "assert failed")?;
        writeln!(f, "  expected: {}", self.expected_lines)?;
        write!(f, "    actual: {}", self.actual_lines)?;
        if !self.missing.is_empty() {
            write!(f, "\n   missing: {:?}", self.missing)?;
        }
        if !self.duplicated.is_empty() {
            write!(f, "\nduplicated: {:?}", self.duplicated)?;
        }
        if !self.unexpected.is_empty() {
            write!(f, "\nunexpected: {:?}", self.unexpected)?;
        }
        Ok(())
    }
}

pub fn verify(log: &Path, output: &Path, count: u64, key: &str) -> Result<VerifyReport, VerifyError> {
    let expected = expected_lines(log)?;
    let actual = count_lines(output)?;
    let sequence = collect_sequence(output, key)?;
    Ok(VerifyReport::from_sequence(expected, actual, count, &sequence))
}
