//! Error classification for the streaming path.
//!
//! Per-packet problems are transient: the packet is discarded and the next
//! one is tried. Problems with the feed itself are fatal to the session.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::packet::PacketError;
use crate::source::SourceError;

/// Whether an error may be retried with a fresh packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

/// Errors produced while turning packets into segments.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("Packet source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Implausible start time {timestamp} on {channel}: feed is at {reference}")]
    ImplausibleTimestamp {
        channel: String,
        timestamp: DateTime<Utc>,
        reference: DateTime<Utc>,
    },
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Packet(_) | StreamError::ImplausibleTimestamp { .. } => {
                ErrorKind::Transient
            }
            StreamError::Source(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
