//! Board firmware contract and its in-process model.
//!
//! The I/O board enforces one rule on its own, below the supervisor: the
//! critical mains output is asserted only while every interlock input in its
//! set (cooling water, rod home, door) reads safe, regardless of the last
//! `SET` received. At boot it runs a park check and answers `SAFETY_HALT`
//! instead of `READY` if an interlock is already unsafe.
//!
//! [`BoardModel`] implements that contract line for line so the rest of the
//! crate can be exercised against it: [`MockConnector`] plugs it in where
//! production uses [`TcpConnector`](crate::link::TcpConnector).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use crate::channel::{ADC_MAX, ADC_REF_VOLTS};
use crate::config::SystemConfig;
use crate::error::LinkError;
use crate::link::codec::{BANNER_HALT, BANNER_READY};
use crate::link::transport::{Connector, Transport};

struct RelaySlot {
    id: u8,
    role: String,
    commanded: bool,
    critical: bool,
}

struct DigitalSlot {
    id: u8,
    role: String,
    raw: bool,
    active_low: bool,
}

struct AnalogSlot {
    id: u8,
    role: String,
    raw: u16,
}

/// Register-level model of the board. All channels start at power-on values:
/// relays off, interlocks satisfied, analog channels at zero.
pub struct BoardModel {
    relays: Vec<RelaySlot>,
    digital: Vec<DigitalSlot>,
    analog: Vec<AnalogSlot>,
    interlock_ids: Vec<u8>,
    online: bool,
    /// Mutating lines (`SET`, `ALL_OFF`) in arrival order. Polls are not
    /// recorded.
    write_log: Vec<String>,
}

impl BoardModel {
    pub fn new(config: &SystemConfig) -> Self {
        let relays = config
            .relays
            .iter()
            .map(|r| RelaySlot {
                id: r.id,
                role: r.role.clone(),
                commanded: false,
                critical: r.critical,
            })
            .collect();
        let digital = config
            .digital_inputs
            .iter()
            .map(|d| DigitalSlot {
                id: d.id,
                role: d.role.clone(),
                // Start satisfied: raw level is the safe-side level.
                raw: !d.active_low,
                active_low: d.active_low,
            })
            .collect();
        let analog = config
            .analog_channels
            .iter()
            .map(|a| AnalogSlot {
                id: a.id,
                role: a.role.clone(),
                raw: 0,
            })
            .collect();
        let interlock_ids = config
            .board
            .interlock_roles
            .iter()
            .filter_map(|role| {
                config
                    .digital_inputs
                    .iter()
                    .find(|d| &d.role == role)
                    .map(|d| d.id)
            })
            .collect();
        Self {
            relays,
            digital,
            analog,
            interlock_ids,
            online: true,
            write_log: Vec::new(),
        }
    }

    fn input_safe(&self, id: u8) -> bool {
        self.digital
            .iter()
            .find(|d| d.id == id)
            .map_or(false, |d| if d.active_low { !d.raw } else { d.raw })
    }

    fn interlocks_ok(&self) -> bool {
        self.interlock_ids.iter().all(|&id| self.input_safe(id))
    }

    /// What the output pin actually drives. Critical relays are hard-gated on
    /// the interlock set no matter what was commanded.
    fn effective(&self, slot: &RelaySlot) -> bool {
        slot.commanded && (!slot.critical || self.interlocks_ok())
    }

    fn handle_line(&mut self, line: &str) -> String {
        let line = line.trim();
        if line.starts_with("SET ") || line == "ALL_OFF" {
            self.write_log.push(line.to_string());
        }
        if let Some(rest) = line.strip_prefix("SET ") {
            let mut parts = rest.split_whitespace();
            let id = parts.next().and_then(|s| s.parse::<u8>().ok());
            let value = match parts.next() {
                Some("0") => Some(false),
                Some("1") => Some(true),
                _ => None,
            };
            if let (Some(id), Some(value), None) = (id, value, parts.next()) {
                if let Some(slot) = self.relays.iter_mut().find(|r| r.id == id) {
                    slot.commanded = value;
                    return "OK".to_string();
                }
            }
            return "ERROR".to_string();
        }
        match line {
            "GET_RELAYS" => {
                let max_id = self.relays.iter().map(|r| r.id).max().unwrap_or(0);
                let mut bits = vec![false; usize::from(max_id)];
                for slot in &self.relays {
                    bits[usize::from(slot.id) - 1] = self.effective(slot);
                }
                format!("RELAYS:{}", join_bits(&bits))
            }
            "GET_DIGITAL" => {
                let max_id = self.digital.iter().map(|d| d.id).max().unwrap_or(0);
                let mut bits = vec![false; usize::from(max_id) + 1];
                for slot in &self.digital {
                    bits[usize::from(slot.id)] = slot.raw;
                }
                format!("DIGITAL:{}", join_bits(&bits))
            }
            "GET_ANALOG" => {
                let max_id = self.analog.iter().map(|a| a.id).max().unwrap_or(0);
                let mut raw = vec![0u16; usize::from(max_id) + 1];
                for slot in &self.analog {
                    raw[usize::from(slot.id)] = slot.raw;
                }
                let body: Vec<String> = raw.iter().map(|v| v.to_string()).collect();
                format!("ANALOG:{}", body.join(","))
            }
            "ALL_OFF" => {
                for slot in self.relays.iter_mut() {
                    slot.commanded = false;
                }
                "OK".to_string()
            }
            _ => "ERROR".to_string(),
        }
    }
}

fn join_bits(bits: &[bool]) -> String {
    let fields: Vec<&str> = bits.iter().map(|&b| if b { "1" } else { "0" }).collect();
    fields.join(",")
}

/// Shared handle on a [`BoardModel`]: tests hold one side and mutate plant
/// conditions while the link talks to the other.
#[derive(Clone)]
pub struct MockBoard {
    inner: Arc<Mutex<BoardModel>>,
}

impl MockBoard {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoardModel::new(config))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardModel> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drive a digital interlock to safe or unsafe, honoring its wiring
    /// polarity.
    pub fn set_input_safe(&self, role: &str, safe: bool) {
        let mut board = self.lock();
        if let Some(slot) = board.digital.iter_mut().find(|d| d.role == role) {
            slot.raw = if slot.active_low { !safe } else { safe };
        }
    }

    pub fn set_analog_volts(&self, role: &str, volts: f64) {
        let raw = ((volts / ADC_REF_VOLTS) * f64::from(ADC_MAX))
            .round()
            .clamp(0.0, f64::from(ADC_MAX)) as u16;
        let mut board = self.lock();
        if let Some(slot) = board.analog.iter_mut().find(|a| a.role == role) {
            slot.raw = raw;
        }
    }

    /// Take the board off the wire (power cycle, cable pull). Pending and new
    /// exchanges fail until it comes back.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn relay_commanded(&self, role: &str) -> bool {
        let board = self.lock();
        board
            .relays
            .iter()
            .find(|r| r.role == role)
            .map_or(false, |r| r.commanded)
    }

    /// What the output actually drives, interlock gating included.
    pub fn relay_effective(&self, role: &str) -> bool {
        let board = self.lock();
        board
            .relays
            .iter()
            .find(|r| r.role == role)
            .map_or(false, |slot| board.effective(slot))
    }

    pub fn park_ok(&self) -> bool {
        self.lock().interlocks_ok()
    }

    /// Mutating wire lines received so far, in arrival order.
    pub fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }
}

pub struct MockConnector {
    board: MockBoard,
}

impl MockConnector {
    pub fn new(board: MockBoard) -> Self {
        Self { board }
    }
}

impl Connector for MockConnector {
    type Conn = MockTransport;

    async fn connect(&mut self) -> Result<MockTransport, LinkError> {
        if !self.board.lock().online {
            return Err(LinkError::Disconnected);
        }
        let banner = if self.board.park_ok() {
            BANNER_READY.to_string()
        } else {
            format!("{} park check failed", BANNER_HALT)
        };
        let mut outbox = VecDeque::new();
        outbox.push_back(banner);
        Ok(MockTransport {
            board: self.board.clone(),
            outbox,
        })
    }

    fn forget_endpoint(&mut self) {}
}

pub struct MockTransport {
    board: MockBoard,
    outbox: VecDeque<String>,
}

impl Transport for MockTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        let mut board = self.board.lock();
        if !board.online {
            return Err(LinkError::Disconnected);
        }
        let response = board.handle_line(line);
        self.outbox.push_back(response);
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String, LinkError> {
        loop {
            if !self.board.lock().online {
                return Err(LinkError::Disconnected);
            }
            if let Some(line) = self.outbox.pop_front() {
                return Ok(line);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn critical_output_follows_interlocks_not_commands() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);

        assert_eq!(board.lock().handle_line("SET 1 1"), "OK");
        assert!(board.relay_effective("mains_power"));

        board.set_input_safe("door_closed", false);
        assert!(board.relay_commanded("mains_power"));
        assert!(!board.relay_effective("mains_power"));

        board.set_input_safe("door_closed", true);
        assert!(board.relay_effective("mains_power"));
    }

    #[test]
    fn noncritical_relays_ignore_interlocks() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);
        board.set_input_safe("water_flow", false);
        assert_eq!(board.lock().handle_line("SET 2 1"), "OK");
        assert!(board.relay_effective("rough_pump"));
    }

    #[test]
    fn relay_echo_reports_effective_values() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);
        board.lock().handle_line("SET 1 1");
        board.set_input_safe("water_flow", false);
        let echo = board.lock().handle_line("GET_RELAYS");
        assert!(echo.starts_with("RELAYS:0,"));
    }

    #[test]
    fn bad_commands_get_error() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);
        assert_eq!(board.lock().handle_line("SET 99 1"), "ERROR");
        assert_eq!(board.lock().handle_line("SET 1 2"), "ERROR");
        assert_eq!(board.lock().handle_line("FROB"), "ERROR");
    }

    #[test]
    fn all_off_clears_every_relay() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);
        board.lock().handle_line("SET 2 1");
        board.lock().handle_line("SET 5 1");
        assert_eq!(board.lock().handle_line("ALL_OFF"), "OK");
        assert!(!board.relay_commanded("rough_pump"));
        assert!(!board.relay_commanded("turbo_pump"));
    }

    #[test]
    fn digital_wire_levels_respect_polarity() {
        let cfg = default_config().unwrap();
        let board = MockBoard::new(&cfg);
        // Active-low inputs read 0 on the wire when safe.
        let line = board.lock().handle_line("GET_DIGITAL");
        assert_eq!(line, "DIGITAL:0,0,0,1");
        board.set_input_safe("water_flow", false);
        let line = board.lock().handle_line("GET_DIGITAL");
        assert_eq!(line, "DIGITAL:1,0,0,1");
    }
}
