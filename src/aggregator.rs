//! Packs chunks into records and records into payloads.
//!
//! Small chunks are concatenated into records of up to `record_unit_size`
//! bytes so that each put carries a reasonable amount of data; a payload is
//! emitted when adding another chunk would exceed the request size or record
//! count limits, or when the flush interval elapses.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::metrics::AggregatorMetrics;
use crate::payload::{Chunk, Payload, Record};
use crate::sender::{PAYLOAD_SIZE_MAX, RECORD_COUNT_MAX, RECORD_UNIT_SIZE};

#[derive(Debug)]
pub struct PayloadBuffer {
    payload: Payload,
    pub record_unit_size: u64,
    pub records_per_payload_max: u64,
    pub payload_size_max: u64,
}

impl Default for PayloadBuffer {
    fn default() -> Self {
        Self {
            payload: Payload::new(),
            record_unit_size: RECORD_UNIT_SIZE,
            records_per_payload_max: RECORD_COUNT_MAX,
            payload_size_max: PAYLOAD_SIZE_MAX,
        }
    }
}

impl PayloadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Add a chunk, returning a full payload if one had to be cut to fit it.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Option<Payload> {
        let size = chunk.size();

        if self.payload.size + size > self.payload_size_max {
            let full = self.flush();
            self.payload.add_record(Record::with_chunk(chunk));
            return full;
        }

        let needs_own_record = size > self.record_unit_size
            || (!self.payload.is_empty()
                && self.payload.last_record_size() + size > self.record_unit_size);
        if needs_own_record {
            let full = if self.payload.count + 1 > self.records_per_payload_max {
                self.flush()
            } else {
                None
            };
            self.payload.add_record(Record::with_chunk(chunk));
            return full;
        }

        self.payload.append_to_last(chunk);
        None
    }

    /// Take the buffered payload, if any.
    pub fn flush(&mut self) -> Option<Payload> {
        if self.payload.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.payload))
    }
}

pub struct Aggregator {
    buffer: PayloadBuffer,
    flush_interval: Duration,
    metrics: AggregatorMetrics,
}

impl Aggregator {
    pub fn new(flush_interval: Duration, metrics: AggregatorMetrics) -> Self {
        Self {
            buffer: PayloadBuffer::new(),
            flush_interval,
            metrics,
        }
    }

    /// Run until the chunk channel closes, then flush what is left and
    /// close the payload channel.
    pub async fn run(
        mut self,
        mut chunk_rx: mpsc::Receiver<Chunk>,
        payload_tx: mpsc::Sender<Payload>,
    ) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let ready = tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => self.buffer.add_chunk(chunk),
                    None => break,
                },
                _ = ticker.tick() => {
                    let flushed = self.buffer.flush();
                    if flushed.is_some() {
                        tracing::trace!("aggregator interval flush");
                    }
                    flushed
                }
            };

            if let Some(payload) = ready {
                if !self.output(&payload_tx, payload).await {
                    return;
                }
            }
            self.publish();
        }

        if let Some(payload) = self.buffer.flush() {
            tracing::debug!(records = payload.count, "aggregator final flush");
            self.output(&payload_tx, payload).await;
        }
        self.publish();
        tracing::debug!("aggregator stopped");
    }

    async fn output(&self, payload_tx: &mpsc::Sender<Payload>, payload: Payload) -> bool {
        tracing::debug!(
            records = payload.count,
            bytes = payload.size,
            "payload ready"
        );
        if payload_tx.send(payload).await.is_err() {
            tracing::warn!("sender is gone, dropping payload");
            return false;
        }
        self.metrics.payload_emitted();
        true
    }

    fn publish(&self) {
        let payload = self.buffer.payload();
        self.metrics.set_buffer(payload.size, payload.count);
    }
}
