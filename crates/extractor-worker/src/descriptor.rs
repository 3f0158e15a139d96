// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound job descriptors and payload decoding.
//!
//! A descriptor is parsed once per message and never modified afterwards,
//! except for the broker-supplied routing key which is filled in when the
//! payload does not carry one. The untouched JSON object is kept next to the
//! typed view so a resubmission republishes exactly what was received, plus
//! the updated retry count.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use extractor_repository::Endpoint;

/// Text encodings tried, in order, when decoding a payload.
pub const PAYLOAD_ENCODINGS: &[TextEncoding] = &[TextEncoding::Utf8, TextEncoding::Latin1];

/// A text encoding a payload may arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8 (strict)
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
}

impl TextEncoding {
    /// Decode `bytes`, or `None` if they are not valid in this encoding.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Payload that could not be turned into a job descriptor.
#[derive(Debug, Error)]
#[error("Malformed payload: {reason}")]
pub struct MalformedPayload {
    /// Why the last decoding attempt failed
    pub reason: String,
}

/// An inbound job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Routing key of the event (broker-supplied when absent from the payload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    /// Target ID (file, dataset or annotated resource)
    pub id: String,
    /// Legacy field, carried for wire compatibility only
    #[serde(
        default,
        rename = "intermediateId",
        skip_serializing_if = "Option::is_none"
    )]
    pub intermediate_id: Option<String>,
    /// Dataset the target belongs to, or the target itself for dataset jobs
    #[serde(default, rename = "datasetId", skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    /// Base URL of the hosting repository
    #[serde(default)]
    pub host: String,
    /// Secret key for repository calls
    #[serde(default, rename = "secretKey")]
    pub secret_key: String,
    /// Reported file size (number or string on the wire)
    #[serde(default, rename = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<Value>,
    /// Arbitrary flags
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub flags: Value,
    /// Name of the target file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Addresses to notify after successful processing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifies: Vec<String>,
    /// Number of times this job has already been resubmitted
    #[serde(default)]
    pub retry_count: u32,
    /// Protocol version of the sender
    #[serde(
        default,
        rename = "clowderVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub protocol_version: Option<Value>,
    /// Job correlation ID (current field name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobid: Option<Value>,
    /// Job correlation ID (older field name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Value>,
    /// Resource a metadata event annotates (falls back to `id`)
    #[serde(default, rename = "resourceId", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Kind of resource a metadata event annotates
    #[serde(
        default,
        rename = "resourceType",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_type: Option<String>,
    /// Metadata body of a metadata event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl JobDescriptor {
    /// Job correlation ID: `jobid` if present, otherwise `job_id`.
    pub fn job_id(&self) -> Option<String> {
        self.jobid
            .as_ref()
            .or(self.job_id.as_ref())
            .and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    }

    /// Repository endpoint for this job, optionally with the host replaced.
    pub fn endpoint(&self, host_override: Option<&str>) -> Endpoint {
        Endpoint::new(host_override.unwrap_or(&self.host), self.secret_key.clone())
    }
}

/// A descriptor together with the JSON object it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedJob {
    /// Typed view
    pub descriptor: JobDescriptor,
    /// Original payload object
    pub raw: Map<String, Value>,
}

impl DecodedJob {
    /// Parse a descriptor from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, MalformedPayload> {
        let Value::Object(raw) = value else {
            return Err(MalformedPayload {
                reason: "payload is not a JSON object".to_string(),
            });
        };
        let descriptor = serde_json::from_value(Value::Object(raw.clone())).map_err(|e| {
            MalformedPayload {
                reason: e.to_string(),
            }
        })?;
        Ok(Self { descriptor, raw })
    }

    /// Fill in the routing key when the payload has none.
    pub fn inject_routing_key(&mut self, routing_key: &str) {
        if self.descriptor.routing_key.is_none() && !routing_key.is_empty() {
            self.descriptor.routing_key = Some(routing_key.to_string());
        }
    }

    /// Payload to republish on resubmission.
    ///
    /// Carries the new retry count. The routing key and exchange the message
    /// originally arrived with are added when the payload lacks them, unless
    /// the routing key is just the work queue's own name.
    pub fn resubmission_payload(
        &self,
        retry_count: u32,
        delivery_exchange: &str,
        delivery_routing_key: &str,
        work_queue: &str,
    ) -> Map<String, Value> {
        let mut body = self.raw.clone();
        body.insert("retry_count".to_string(), Value::from(retry_count));
        if !body.contains_key("exchange") && !delivery_exchange.is_empty() {
            body.insert(
                "exchange".to_string(),
                Value::String(delivery_exchange.to_string()),
            );
        }
        if !body.contains_key("routing_key")
            && !delivery_routing_key.is_empty()
            && delivery_routing_key != work_queue
        {
            body.insert(
                "routing_key".to_string(),
                Value::String(delivery_routing_key.to_string()),
            );
        }
        body
    }
}

/// Decode a raw broker payload into a job descriptor.
///
/// Each encoding in [`PAYLOAD_ENCODINGS`] is tried in turn; the first one
/// that yields a well-formed descriptor wins.
pub fn decode_payload(bytes: &[u8]) -> Result<DecodedJob, MalformedPayload> {
    let mut last_error = "empty encoding list".to_string();

    for encoding in PAYLOAD_ENCODINGS {
        let Some(text) = encoding.decode(bytes) else {
            last_error = format!("not valid {:?}", encoding);
            continue;
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => match DecodedJob::from_value(value) {
                Ok(job) => return Ok(job),
                Err(e) => last_error = e.reason,
            },
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(MalformedPayload { reason: last_error })
}
