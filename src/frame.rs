use crate::proto::command::{Channel, StreamSample};
use crate::proto::parser::{ParseError, parse_f64};

/// Tag that opens every unsolicited stream packet.
pub const PACKET_TAG: &str = "DATA";

/// Decode a stream packet: `DATA <ch>,<timestamp>,<voltage>,<current>`.
///
/// Returns `None` when the line is not a packet at all, so callers can tell
/// interleaved command replies apart from telemetry.
pub fn parse_packet(line: &str) -> Option<Result<StreamSample, ParseError>> {
    let body = line.trim().strip_prefix(PACKET_TAG)?;
    if !body.starts_with(' ') {
        return None;
    }
    Some(parse_body(body.trim()))
}

fn parse_body(body: &str) -> Result<StreamSample, ParseError> {
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(ParseError::FieldCount {
            expected: 4,
            got: parts.len(),
        });
    }
    let channel = parts[0]
        .parse::<u8>()
        .ok()
        .and_then(|n| Channel::try_from(n).ok())
        .ok_or_else(|| ParseError::BadEnum("channel", parts[0].to_string()))?;
    Ok(StreamSample {
        channel,
        timestamp: parse_f64(parts[1])?,
        voltage: parse_f64(parts[2])?,
        current: parse_f64(parts[3])?,
    })
}

pub fn build_packet(sample: &StreamSample) -> String {
    format!(
        "{} {},{:.3},{:.6},{:e}",
        PACKET_TAG, sample.channel, sample.timestamp, sample.voltage, sample.current
    )
}
