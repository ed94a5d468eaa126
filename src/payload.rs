/// Units flowing from readers to the sink: chunks of complete lines, records
/// aggregated from chunks, and payloads (one put request worth of records).
use crate::state::SendInfo;

/// Complete lines read from one inode.
///
/// `body.len()` can be smaller than `send_info.range.len()` when oversized
/// lines inside the range were diverted instead of shipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub send_info: SendInfo,
    pub body: Vec<u8>,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// One sink record: the concatenated bodies of its chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub chunks: Vec<Chunk>,
    pub size: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(chunk: Chunk) -> Self {
        let mut record = Self::new();
        record.add_chunk(chunk);
        record
    }

    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.size += chunk.size();
        self.chunks.push(chunk);
    }

    pub fn failed(&self) -> bool {
        self.error_code.is_some()
    }

    /// Mark every chunk as accepted by the sink.
    pub fn mark_succeeded(&mut self) {
        for chunk in &mut self.chunks {
            chunk.send_info.succeeded = true;
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size as usize);
        for chunk in &self.chunks {
            bytes.extend_from_slice(&chunk.body);
        }
        bytes
    }
}

/// A batch of records submitted in one put request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub size: u64,
    pub count: u64,
    pub records: Vec<Record>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, record: Record) {
        self.size += record.size;
        self.count += 1;
        self.records.push(record);
    }

    /// Append a chunk to the last record, creating one if the payload is empty.
    pub fn append_to_last(&mut self, chunk: Chunk) {
        let size = chunk.size();
        match self.records.last_mut() {
            Some(last) => {
                last.add_chunk(chunk);
                self.size += size;
            }
            None => self.add_record(Record::with_chunk(chunk)),
        }
    }

    pub fn last_record_size(&self) -> u64 {
        self.records.last().map(|r| r.size).unwrap_or(0)
    }

    /// No records at all. A payload of zero-size records is not empty: it
    /// still carries read ranges that must be acknowledged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
