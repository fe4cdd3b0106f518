//! Transport-agnostic request and reply
//!
//! Any HTTP server adapts to these two types:
//! - [`InboundRequest`] carries method, path, headers, peer address and body
//! - [`ApiReply`] carries the transport status and the `{code, message, data}` envelope
//!
//! Header names are case-insensitive; they are stored lower-cased.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rdp_types::ErrorKind;

/// Business codes carried in the envelope
pub mod codes {
    pub const SUCCESS: u32 = 0;

    pub const VALIDATION: u32 = 4000;
    pub const INVALID_BODY: u32 = 4001;
    pub const DEPENDENCY_CYCLE: u32 = 4002;

    pub const MISSING_AUTHORIZATION: u32 = 4010;
    pub const BAD_AUTHORIZATION_FORMAT: u32 = 4011;
    pub const INVALID_TOKEN: u32 = 4012;
    pub const INVALID_CREDENTIALS: u32 = 4013;
    pub const INVALID_REFRESH_TOKEN: u32 = 4014;
    pub const TOKEN_EXPIRED: u32 = 4016;
    pub const TOKEN_REVOKED: u32 = 4017;

    pub const NO_ROLE: u32 = 4030;
    pub const INSUFFICIENT_PERMISSION: u32 = 4031;
    pub const INSUFFICIENT_ROLE: u32 = 4032;

    pub const NOT_FOUND: u32 = 4040;

    pub const STATE_CONFLICT: u32 = 4090;
    pub const DUPLICATE: u32 = 4091;

    pub const INTERNAL: u32 = 5000;
}

/// Generic code for an error class
#[must_use]
pub const fn code_for(kind: ErrorKind) -> u32 {
    match kind {
        ErrorKind::Validation => codes::VALIDATION,
        ErrorKind::Unauthenticated => codes::INVALID_TOKEN,
        ErrorKind::Forbidden => codes::INSUFFICIENT_PERMISSION,
        ErrorKind::NotFound => codes::NOT_FOUND,
        ErrorKind::Conflict => codes::STATE_CONFLICT,
        ErrorKind::Internal => codes::INTERNAL,
    }
}

/// `{code, message, data}` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: u32,
    pub message: String,
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            code: codes::SUCCESS,
            message: "success".into(),
            data,
        }
    }

    #[must_use]
    pub fn failure(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Transport status plus envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: u16,
    pub envelope: Envelope,
}

impl ApiReply {
    /// 200 with `data`; serialization failures become a 500
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                status: 200,
                envelope: Envelope::success(value),
            },
            Err(err) => Self::internal(format!("response encoding failed: {err}")),
        }
    }

    #[must_use]
    pub fn error(status: u16, code: u32, message: impl Into<String>) -> Self {
        Self {
            status,
            envelope: Envelope::failure(code, message),
        }
    }

    /// Reply for an error class with the class's generic code
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::error(kind.http_status(), code_for(kind), message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(500, codes::INTERNAL, message)
    }

    #[must_use]
    pub fn not_found(what: &str) -> Self {
        Self::error(404, codes::NOT_FOUND, format!("{what} not found"))
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.envelope.data = data;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Serialized envelope, as written on the wire
    #[must_use]
    pub fn body(&self) -> String {
        serde_json::to_string(&self.envelope).unwrap_or_default()
    }
}

/// One inbound API call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    headers: BTreeMap<String, String>,
    /// Transport peer, `host:port` or bare host
    pub peer: Option<String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    /// Create new request with no headers or body
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {token}"))
    }

    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Body from any serializable value
    #[must_use]
    pub fn with_json<T: Serialize>(self, body: &T) -> Self {
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        self.with_body(bytes)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Path without the query string
    #[must_use]
    pub fn route_path(&self) -> &str {
        self.path.split_once('?').map_or(&self.path, |(p, _)| p)
    }

    /// Raw query parameters (no percent-decoding); later duplicates win
    #[must_use]
    pub fn query(&self) -> BTreeMap<String, String> {
        let Some((_, query)) = self.path.split_once('?') else {
            return BTreeMap::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect()
    }

    /// Decode the JSON body, or a 400 reply with code 4001
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiReply> {
        serde_json::from_slice(&self.body).map_err(|err| {
            ApiReply::error(400, codes::INVALID_BODY, format!("invalid request body: {err}"))
        })
    }
}
