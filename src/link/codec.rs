//! Wire codec for the I/O board's newline-framed text protocol.
//!
//! Requests: `SET <relay> <0|1>`, `GET_RELAYS`, `GET_DIGITAL`, `GET_ANALOG`,
//! `ALL_OFF`. Responses: `OK`, `ERROR`, or a labeled CSV line such as
//! `RELAYS:1,0,0,...`. The board announces `READY` after boot and
//! `SAFETY_HALT <reason>` when its park check fails.

use arrayvec::ArrayString;
use heapless::Vec;

use crate::channel::{MAX_ANALOG_CHANNELS, MAX_DIGITAL_INPUTS, MAX_RELAYS};

pub const MAX_LINE_LEN: usize = 160;

pub const BANNER_READY: &str = "READY";
pub const BANNER_HALT: &str = "SAFETY_HALT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardCommand {
    SetRelay { id: u8, on: bool },
    GetRelays,
    GetDigital,
    GetAnalog,
    AllOff,
}

impl BoardCommand {
    pub fn encode(&self) -> ArrayString<MAX_LINE_LEN> {
        let mut line = ArrayString::new();
        // Commands fit well inside the line buffer.
        let _ = match self {
            BoardCommand::SetRelay { id, on } => {
                use std::fmt::Write;
                write!(line, "SET {} {}", id, if *on { 1 } else { 0 })
            }
            BoardCommand::GetRelays => {
                line.push_str("GET_RELAYS");
                Ok(())
            }
            BoardCommand::GetDigital => {
                line.push_str("GET_DIGITAL");
                Ok(())
            }
            BoardCommand::GetAnalog => {
                line.push_str("GET_ANALOG");
                Ok(())
            }
            BoardCommand::AllOff => {
                line.push_str("ALL_OFF");
                Ok(())
            }
        };
        line
    }

    /// Whether `resp` is the reply this command is waiting for. Anything else
    /// on the wire is an unsolicited or stale line and gets skipped.
    pub fn matches(&self, resp: &BoardResponse) -> bool {
        match self {
            BoardCommand::SetRelay { .. } | BoardCommand::AllOff => {
                matches!(resp, BoardResponse::Ok | BoardResponse::Error)
            }
            BoardCommand::GetRelays => matches!(resp, BoardResponse::Relays(_)),
            BoardCommand::GetDigital => matches!(resp, BoardResponse::Digital(_)),
            BoardCommand::GetAnalog => matches!(resp, BoardResponse::Analog(_)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardResponse {
    Ok,
    Error,
    Relays(Vec<bool, MAX_RELAYS>),
    Digital(Vec<bool, MAX_DIGITAL_INPUTS>),
    Analog(Vec<u16, MAX_ANALOG_CHANNELS>),
    /// Board-side interlock halt announced mid-session or at boot.
    Halted(String),
}

/// Decode one received line. `None` means the line is not a recognized
/// response (noise, debug output) and should be skipped.
pub fn decode(line: &str) -> Option<BoardResponse> {
    let line = line.trim();
    match line {
        "OK" => return Some(BoardResponse::Ok),
        "ERROR" => return Some(BoardResponse::Error),
        _ => {}
    }
    if let Some(reason) = line.strip_prefix(BANNER_HALT) {
        return Some(BoardResponse::Halted(reason.trim().to_string()));
    }
    if let Some(body) = line.strip_prefix("RELAYS:") {
        return parse_bits(body).map(BoardResponse::Relays);
    }
    if let Some(body) = line.strip_prefix("DIGITAL:") {
        return parse_bits(body).map(BoardResponse::Digital);
    }
    if let Some(body) = line.strip_prefix("ANALOG:") {
        return parse_raw(body).map(BoardResponse::Analog);
    }
    None
}

fn parse_bits<const N: usize>(body: &str) -> Option<Vec<bool, N>> {
    let mut out = Vec::new();
    for field in body.split(',') {
        let bit = match field.trim() {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        if out.push(bit).is_err() {
            // More channels on the wire than we track; extras are ignorable.
            break;
        }
    }
    Some(out)
}

fn parse_raw<const N: usize>(body: &str) -> Option<Vec<u16, N>> {
    let mut out = Vec::new();
    for field in body.split(',') {
        let sample: u16 = field.trim().parse().ok()?;
        if out.push(sample).is_err() {
            break;
        }
    }
    Some(out)
}
