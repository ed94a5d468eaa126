//! Kinesis Data Streams sink (`PutRecords`).

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::{PutRecordsRequestEntry, PutRecordsResultEntry};
use aws_sdk_kinesis::Client;
use tracing::{info, warn};

use super::{SendClient, SendError};
use crate::config::SenderConfig;
use crate::payload::Record;

pub struct KinesisClient {
    client: Client,
    stream_name: String,
}

impl KinesisClient {
    pub async fn from_config(config: &SenderConfig) -> Result<Self, SendError> {
        let stream_name = config
            .stream_name
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SendError::Config {
                reason: "sender.stream_name is required for the kinesis sink".to_string(),
            })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        info!(stream = %stream_name, "kinesis sink configured");

        Ok(Self {
            client: Client::new(&sdk_config),
            stream_name,
        })
    }
}

/// Random 128-bit hex key, spreading records across shards.
fn partition_key() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Copy per-entry outcomes onto `records`; entries are positional. Records
/// with no matching entry are marked failed.
fn apply_results(records: &mut [Record], results: &[PutRecordsResultEntry]) {
    if results.len() != records.len() {
        warn!(
            records = records.len(),
            results = results.len(),
            "PutRecords returned a different number of results"
        );
    }
    for (i, record) in records.iter_mut().enumerate() {
        match results.get(i) {
            Some(entry) => {
                record.error_code = entry.error_code().map(str::to_string);
                record.error_message = entry.error_message().map(str::to_string);
            }
            None => {
                record.error_code = Some("MissingResult".to_string());
                record.error_message = Some("no result entry returned for record".to_string());
            }
        }
    }
}

#[async_trait]
impl SendClient for KinesisClient {
    async fn put_records(&self, records: &mut [Record]) -> Result<(), SendError> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records.iter() {
            let entry = PutRecordsRequestEntry::builder()
                .data(Blob::new(record.to_bytes()))
                .partition_key(partition_key())
                .build()
                .map_err(|e| SendError::Client {
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }

        let output = self
            .client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| SendError::Client {
                message: DisplayErrorContext(e).to_string(),
            })?;

        apply_results(records, output.records());
        Ok(())
    }
}
