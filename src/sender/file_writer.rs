use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, warn};

use super::{SendClient, SendError};
use crate::payload::Record;

/// Append-only output that can drop a torn tail after a failed write.
pub trait AppendTarget: Write + Send {
    fn end_offset(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end_offset(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Local sink: appends each record's bytes to a file.
pub struct FileWriter {
    path: PathBuf,
    file: Mutex<Box<dyn AppendTarget>>,
}

impl FileWriter {
    pub fn open(path: &Path) -> Result<Self, SendError> {
        let io_err = |e| SendError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Box::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> SendError {
        SendError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SendClient for FileWriter {
    /// Records are written one at a time. When a write fails, the torn bytes
    /// are cut off and that record plus every later one is stamped failed;
    /// earlier records stay accepted. `Err` only when nothing was written.
    async fn put_records(&self, records: &mut [Record]) -> Result<(), SendError> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..records.len() {
            let start = file.end_offset().map_err(|e| self.io_err(e))?;
            let bytes = records[i].to_bytes();
            let written = file.write_all(&bytes).and_then(|()| file.flush());
            let Err(e) = written else {
                records[i].error_code = None;
                records[i].error_message = None;
                continue;
            };

            if let Err(cut) = file.truncate_to(start) {
                error!(
                    path = %self.path.display(),
                    offset = start,
                    error = %cut,
                    "failed to drop partially written record"
                );
            }
            if i == 0 {
                return Err(self.io_err(e));
            }
            warn!(
                path = %self.path.display(),
                written = i,
                failed = records.len() - i,
                error = %e,
                "write failed mid-batch"
            );
            let message = self.io_err(e).to_string();
            for record in &mut records[i..] {
                record.error_code = Some("IoError".to_string());
                record.error_message = Some(message.clone());
            }
            return Ok(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Chunk;
    use crate::state::{ReadRange, SendInfo};
    use std::sync::Arc;

    fn record(body: &str) -> Record {
        Record::with_chunk(Chunk {
            send_info: SendInfo {
                inode: 1,
                range: ReadRange::new(0, body.len() as u64),
                succeeded: false,
                generation: 0,
            },
            body: body.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn test_appends_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/sink.log");
        let writer = FileWriter::open(&path).unwrap();

        let mut records = vec![record("a\nb\n"), record("c\n")];
        records[1].error_code = Some("stale".into());
        writer.put_records(&mut records).await.unwrap();
        writer.put_records(&mut [record("d\n")]).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\nd\n");
        assert!(records.iter().all(|r| !r.failed()));
        assert_eq!(writer.path(), path);
    }

    /// In-memory output that accepts `accept` writes, then writes one byte
    /// of the next and fails.
    struct FullDisk {
        data: Arc<Mutex<Vec<u8>>>,
        accept: usize,
        torn: bool,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            if self.accept > 0 {
                self.accept -= 1;
                data.extend_from_slice(buf);
                return Ok(buf.len());
            }
            if !self.torn && !buf.is_empty() {
                self.torn = true;
                data.push(buf[0]);
                return Ok(1);
            }
            Err(io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendTarget for FullDisk {
        fn end_offset(&self) -> io::Result<u64> {
            Ok(self.data.lock().unwrap().len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.lock().unwrap().truncate(len as usize);
            Ok(())
        }
    }

    fn full_disk(accept: usize) -> (FileWriter, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let writer = FileWriter {
            path: PathBuf::from("/dev/full"),
            file: Mutex::new(Box::new(FullDisk {
                data: Arc::clone(&data),
                accept,
                torn: false,
            })),
        };
        (writer, data)
    }

    #[tokio::test]
    async fn test_mid_batch_failure_keeps_written_records() {
        let (writer, data) = full_disk(1);
        let mut records = vec![record("a\n"), record("b\n"), record("c\n")];

        writer.put_records(&mut records).await.unwrap();

        assert_eq!(*data.lock().unwrap(), b"a\n".to_vec());
        assert!(!records[0].failed());
        assert!(records[1].failed());
        assert!(records[2].failed());
        assert_eq!(records[1].error_code.as_deref(), Some("IoError"));
    }

    #[tokio::test]
    async fn test_failure_on_first_record_is_an_error() {
        let (writer, data) = full_disk(0);
        let mut records = vec![record("a\n"), record("b\n")];

        let err = writer.put_records(&mut records).await.unwrap_err();
        assert!(matches!(err, SendError::Io { .. }));
        assert!(data.lock().unwrap().is_empty());
    }
}
