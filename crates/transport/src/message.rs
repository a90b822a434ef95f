//! Message format carried by the transport

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque message: a serialized body plus string headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message body (serialized data)
    pub body: Vec<u8>,

    /// Headers for metadata
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    pub fn with_body(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Message::with_body(body)
    }
}
