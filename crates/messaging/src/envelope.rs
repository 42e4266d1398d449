//! Wire shapes: the JSON envelope, staged records and broker messages.

use std::collections::BTreeMap;

use common::TransactionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Header carrying the tenant as `UUID|region|major|minor`.
pub const TENANT_HEADER: &str = "tenant";

/// Header carrying the trace context.
pub const SPAN_HEADER: &str = "span";

/// Message headers, carried outside the JSON body.
pub type Headers = BTreeMap<String, String>;

/// Routing fields shared by command and status envelopes.
///
/// Only the fields meaningful to a topic are set; the rest are omitted
/// from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<u32>,
}

impl Routing {
    pub fn character(character_id: u32) -> Self {
        Self {
            character_id: Some(character_id),
            ..Self::default()
        }
    }

    pub fn world(mut self, world_id: u8) -> Self {
        self.world_id = Some(world_id);
        self
    }

    pub fn channel(mut self, channel_id: u8) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn account(mut self, account_id: u32) -> Self {
        self.account_id = Some(account_id);
        self
    }
}

/// JSON document wrapping a typed body.
///
/// `transaction_id` lives in the body rather than a header so it survives
/// format conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<E> {
    pub transaction_id: TransactionId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub routing: Routing,
    pub body: E,
}

impl<E> Envelope<E> {
    pub fn new(transaction_id: TransactionId, kind: impl Into<String>, body: E) -> Self {
        Self {
            transaction_id,
            kind: kind.into(),
            routing: Routing::default(),
            body,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }
}

/// A status event decoded without knowing its schema.
///
/// Domain status topics carry events that have nothing to do with sagas;
/// those may lack a transaction id entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl StatusEnvelope {
    /// Returns the correlation id, treating the nil UUID as absent.
    pub fn correlation(&self) -> Option<TransactionId> {
        self.transaction_id.filter(|id| !id.as_uuid().is_nil())
    }
}

/// Encodes an integer entity id as a partition key (base-10 text).
pub fn partition_key(id: u64) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// Encodes a transaction id as a partition key.
pub fn transaction_key(id: TransactionId) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// A serialized message staged for a topic, before headers are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// Serializes a payload as JSON under the given partition key.
    pub fn json<T: Serialize>(key: Vec<u8>, payload: &T) -> Result<Self> {
        Ok(Self {
            key,
            value: serde_json::to_vec(payload)?,
        })
    }
}

/// A message as it travels through a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Physical topic name.
    pub topic: String,
    pub key: Vec<u8>,
    pub headers: Headers,
    pub value: Vec<u8>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}
