//! Identifier helpers.
//!
//! `spec.md` §3 fixes the primary key type as UUID v4 unless noted. This
//! module wraps `uuid::Uuid` in a couple of newtypes that carry semantic
//! meaning (a `RequestId` should not be accidentally compared to a
//! `ButlerName`), and wires request-ID generation into tower-http's
//! `SetRequestIdLayer` the way the teacher framework does, minus the
//! TypeID/prefix machinery this domain does not need.

use http::Request;
use std::fmt;
use std::str::FromStr;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;

/// A request-scoped identifier, propagated through `request_context.request_id`
/// (`spec.md` §3.1, §6.1) and used to correlate inbox rows, route inbox rows,
/// and session rows end-to-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random (v4) request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. read back from the database).
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s).map_err(RequestIdError::Parse)?))
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<RequestId> for Uuid {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

/// Error parsing a [`RequestId`] from a string.
#[derive(Debug, thiserror::Error)]
pub enum RequestIdError {
    #[error("failed to parse request id: {0}")]
    Parse(#[from] uuid::Error),
}

/// A `MakeRequestId` implementation generating [`RequestId`]s for inbound
/// HTTP requests (the ingest and heartbeat endpoints of `spec.md` §6.1–6.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let id = RequestId::new();
        let header_value = http::HeaderValue::from_str(&id.to_string()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn round_trips_through_string() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_string() {
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn make_typed_request_id_sets_header() {
        let mut maker = MakeTypedRequestId;
        let request = http::Request::builder().body(()).unwrap();
        let id = maker.make_request_id(&request);
        assert!(id.is_some());
        let header_value = id.unwrap().into_header_value();
        let id_str = header_value.to_str().unwrap();
        assert!(Uuid::from_str(id_str).is_ok());
    }
}
