use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_RELAYS: usize = 32;
pub const MAX_DIGITAL_INPUTS: usize = 8;
pub const MAX_ANALOG_CHANNELS: usize = 8;

/// ADC full scale of the I/O board (10-bit, 0..=1023 for 0..=5 V).
pub const ADC_MAX: u16 = 1023;
pub const ADC_REF_VOLTS: f64 = 5.0;

/// One relay output on the I/O board.
///
/// `commanded` is the last value the supervisor asked for; `confirmed` is the
/// last value the board echoed back. The two diverge when a command is in
/// flight or when board-side interlocking overrides the supervisor (the
/// life-safety mains output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayChannel {
    pub id: u8,
    pub role: String,
    pub commanded: bool,
    pub confirmed: bool,
    /// Channel with board-side interlock enforcement.
    pub critical: bool,
}

/// A polarity-normalized digital interlock input: `safe == true` always means
/// the interlock is satisfied, regardless of wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalInput {
    pub id: u8,
    pub role: String,
    pub safe: bool,
}

/// One analog sensor channel with its scaling into engineering units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogChannel {
    pub id: u8,
    pub role: String,
    pub raw: u16,
    pub scale: f64,
    pub offset: f64,
}

impl AnalogChannel {
    pub fn volts(&self) -> f64 {
        f64::from(self.raw.min(ADC_MAX)) * ADC_REF_VOLTS / f64::from(ADC_MAX)
    }

    /// Engineering value, e.g. turbo spin percent = volts * 25.0 - 12.5.
    pub fn engineering(&self) -> f64 {
        self.volts() * self.scale + self.offset
    }
}

/// An immutable, timestamped aggregate of every channel value at one instant.
///
/// All rule evaluation and state detection operate on a snapshot copy, never
/// on live channels, so a decision can never observe a half-updated view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Milliseconds since the device link started.
    pub taken_at_ms: u64,
    pub connected: bool,
    pub relays: Vec<RelayChannel, MAX_RELAYS>,
    pub digital: Vec<DigitalInput, MAX_DIGITAL_INPUTS>,
    pub analog: Vec<AnalogChannel, MAX_ANALOG_CHANNELS>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at_ms: 0,
            connected: false,
            relays: Vec::new(),
            digital: Vec::new(),
            analog: Vec::new(),
        }
    }

    pub fn relay(&self, role: &str) -> Option<&RelayChannel> {
        self.relays.iter().find(|r| r.role == role)
    }

    pub fn digital(&self, role: &str) -> Option<&DigitalInput> {
        self.digital.iter().find(|d| d.role == role)
    }

    pub fn analog(&self, role: &str) -> Option<&AnalogChannel> {
        self.analog.iter().find(|a| a.role == role)
    }

    /// True when every digital interlock reads safe.
    pub fn all_interlocks_safe(&self) -> bool {
        self.digital.iter().all(|d| d.safe)
    }
}
