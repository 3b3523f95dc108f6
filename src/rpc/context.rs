//! Per-call state handed to method implementations.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};

/// Deadline, cancellation and metadata of one RPC.
///
/// Cloning shares the cancellation token and the response-metadata sink.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    metadata: MetadataMap,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    response_metadata: Arc<Mutex<MetadataMap>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the deadline passes. Never resolves without a deadline.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Adds a header to the call's response metadata.
    pub fn insert_response_metadata(&self, key: &str, value: &str) -> Result<(), Status> {
        let key = AsciiMetadataKey::from_bytes(key.as_bytes())
            .map_err(|_| Status::internal(format!("invalid metadata key `{key}`")))?;
        let value = AsciiMetadataValue::try_from(value)
            .map_err(|_| Status::internal(format!("invalid metadata value for `{}`", key.as_str())))?;
        self.response_metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(key, value);
        Ok(())
    }

    /// Drains the response metadata written so far.
    pub fn take_response_metadata(&self) -> MetadataMap {
        std::mem::take(
            &mut *self
                .response_metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Parses a `grpc-timeout` header value: up to eight digits and a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
