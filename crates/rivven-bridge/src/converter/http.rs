//! HTTP publish body converters
//!
//! Both formats share one envelope:
//!
//! ```json
//! {"records": [{"key": ..., "value": ..., "partition": 0,
//!               "headers": [{"key": "trace", "value": "YWJj"}]}]}
//! ```
//!
//! JSON embeds keys and values as JSON documents, binary as base64 strings.
//! Header values are base64 in both.

use super::{ConvertError, HttpMessageConverter};
use crate::broker::ProducerRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope<R> {
    records: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct Header {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    key: Option<serde_json::Value>,
    value: serde_json::Value,
    #[serde(default)]
    partition: Option<u32>,
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct BinaryRecord {
    #[serde(default)]
    key: Option<String>,
    value: String,
    #[serde(default)]
    partition: Option<u32>,
    #[serde(default)]
    headers: Vec<Header>,
}

fn parse_envelope<R: DeserializeOwned>(body: &[u8]) -> Result<Vec<R>, ConvertError> {
    serde_json::from_slice::<Envelope<R>>(body)
        .map(|e| e.records)
        .map_err(|e| ConvertError::invalid(format!("Invalid request body: {}", e)))
}

fn decode_base64(index: usize, field: &str, value: &str) -> Result<Bytes, ConvertError> {
    STANDARD.decode(value).map(Bytes::from).map_err(|e| {
        ConvertError::invalid(format!("Record {}: invalid base64 in {}: {}", index, field, e))
    })
}

fn decode_headers(index: usize, headers: Vec<Header>) -> Result<Vec<(String, Bytes)>, ConvertError> {
    headers
        .into_iter()
        .map(|h| Ok((h.key, decode_base64(index, "header", &h.value)?)))
        .collect()
}

fn build_record(
    topic: &str,
    partition: Option<u32>,
    key: Option<Bytes>,
    value: Bytes,
    headers: Vec<(String, Bytes)>,
) -> ProducerRecord {
    let mut record = ProducerRecord::new(topic, value);
    record.partition = partition;
    record.key = key;
    record.headers = headers;
    record
}

/// Keys and values as embedded JSON documents
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHttpConverter;

impl HttpMessageConverter for JsonHttpConverter {
    fn to_records(
        &self,
        topic: &str,
        partition: Option<u32>,
        body: &[u8],
    ) -> Result<Vec<ProducerRecord>, ConvertError> {
        parse_envelope::<JsonRecord>(body)?
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let key = match r.key {
                    None | Some(serde_json::Value::Null) => None,
                    Some(key) => Some(Bytes::from(key.to_string())),
                };
                let value = Bytes::from(r.value.to_string());
                let headers = decode_headers(i, r.headers)?;
                Ok(build_record(topic, partition.or(r.partition), key, value, headers))
            })
            .collect()
    }
}

/// Keys and values as base64 encoded bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryHttpConverter;

impl HttpMessageConverter for BinaryHttpConverter {
    fn to_records(
        &self,
        topic: &str,
        partition: Option<u32>,
        body: &[u8],
    ) -> Result<Vec<ProducerRecord>, ConvertError> {
        parse_envelope::<BinaryRecord>(body)?
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let key = r
                    .key
                    .as_deref()
                    .map(|k| decode_base64(i, "key", k))
                    .transpose()?;
                let value = decode_base64(i, "value", &r.value)?;
                let headers = decode_headers(i, r.headers)?;
                Ok(build_record(topic, partition.or(r.partition), key, value, headers))
            })
            .collect()
    }
}
