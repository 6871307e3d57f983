//! Packet schema and parser for Raspberry Shake UDP datagrams.
//!
//! Every datagram on the feed carries one channel's worth of samples for a
//! single transmission interval. This module uses `nom` to turn the raw text
//! into a validated [`Packet`]; anything that does not match the schema is a
//! [`PacketError`].
//!
//! # Datagram Format
//!
//! ```text
//! {'CHANNEL', EPOCH_SECONDS, SAMPLE, SAMPLE, ...}
//! ```
//!
//! Example:
//! ```text
//! {'EHZ', 1582315130.292, 14168, 14927, 16112, 17537, 18052, 17246}
//! ```

use chrono::{DateTime, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::take_while1,
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map_res, opt, recognize, value},
    multi::many1,
    sequence::{delimited, preceded},
};
use std::fmt;
use thiserror::Error;

/// Longest channel code accepted from the feed.
pub const MAX_CHANNEL_LEN: usize = 8;

/// Errors that can occur while decoding a datagram.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Packet is not valid UTF-8")]
    NotUtf8,

    #[error("Invalid packet format: {0}")]
    InvalidFormat(String),

    #[error("Invalid channel code: {0}")]
    InvalidChannel(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(f64),
}

/// Result type for packet decoding.
pub type PacketResult<T> = Result<T, PacketError>;

/// One validated data packet from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Channel code, e.g. `EHZ`.
    pub channel: String,

    /// Time of the first sample.
    pub timestamp: DateTime<Utc>,

    /// Raw counts in transmission order.
    pub samples: Vec<i32>,
}

impl Packet {
    /// Decode and validate a raw datagram.
    pub fn from_bytes(data: &[u8]) -> PacketResult<Self> {
        let text = std::str::from_utf8(data).map_err(|_| PacketError::NotUtf8)?;
        parse_packet(text)
    }

    /// Epoch seconds of the first sample.
    pub fn epoch(&self) -> f64 {
        utc_to_epoch(self.timestamp)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{'{}', {:.3}", self.channel, self.epoch())?;
        for sample in &self.samples {
            write!(f, ", {}", sample)?;
        }
        write!(f, "}}")
    }
}

/// Convert epoch seconds to a UTC timestamp with microsecond precision.
pub fn epoch_to_utc(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    DateTime::from_timestamp_micros((epoch * 1e6).round() as i64)
}

/// Convert a UTC timestamp back to epoch seconds.
pub fn utc_to_epoch(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1e6
}

/// Parse the quoted channel code.
fn parse_channel(input: &str) -> IResult<&str, &str> {
    delimited(
        char('\''),
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        char('\''),
    )
    .parse(input)
}

/// Parse the comma between fields, with any surrounding whitespace.
fn parse_separator(input: &str) -> IResult<&str, ()> {
    value((), (multispace0, char(','), multispace0)).parse(input)
}

/// Parse the epoch timestamp in seconds.
fn parse_epoch(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse a single signed integer sample.
fn parse_sample(input: &str) -> IResult<&str, i32> {
    map_res(recognize((opt(char('-')), digit1)), |s: &str| {
        s.parse::<i32>()
    })
    .parse(input)
}

/// Parse the braces-delimited packet body.
fn parse_body(input: &str) -> IResult<&str, (&str, f64, Vec<i32>)> {
    delimited(
        (char('{'), multispace0),
        (
            parse_channel,
            preceded(parse_separator, parse_epoch),
            many1(preceded(parse_separator, parse_sample)),
        ),
        (multispace0, char('}')),
    )
    .parse(input)
}

/// Parse a complete datagram into a [`Packet`].
///
/// # Example
///
/// ```
/// use shake_stream::packet::parse_packet;
///
/// let packet = parse_packet("{'EHZ', 1582315130.292, 14168, 14927, 16112}").unwrap();
/// assert_eq!(packet.channel, "EHZ");
/// assert_eq!(packet.samples, vec![14168, 14927, 16112]);
/// ```
pub fn parse_packet(input: &str) -> PacketResult<Packet> {
    let input = input.trim();

    let (channel, epoch, samples) = match all_consuming(parse_body).parse(input) {
        Ok((_, body)) => body,
        Err(e) => return Err(PacketError::InvalidFormat(format!("{:?}", e))),
    };

    if channel.len() > MAX_CHANNEL_LEN {
        return Err(PacketError::InvalidChannel(channel.to_string()));
    }

    let timestamp = epoch_to_utc(epoch).ok_or(PacketError::InvalidTimestamp(epoch))?;

    Ok(Packet {
        channel: channel.to_ascii_uppercase(),
        timestamp,
        samples,
    })
}

/// Quick check that a datagram could be a data packet.
#[inline]
pub fn looks_like_packet(data: &[u8]) -> bool {
    let data = data.trim_ascii_start();
    data.len() > 6 && data.starts_with(b"{'")
}
