//! Declarative configuration document.
//!
//! The whole plant is described in one YAML file: channel maps, thresholds,
//! rules, state definitions and procedures. Loading is two-stage: raw serde
//! structs mirror the document, then every expression is parsed and every
//! cross-reference checked. A configuration problem is the only error class
//! that aborts startup; after `from_yaml` succeeds nothing downstream
//! re-validates names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::channel::{
    AnalogChannel, DigitalInput, RelayChannel, StateSnapshot, MAX_ANALOG_CHANNELS,
    MAX_DIGITAL_INPUTS, MAX_RELAYS,
};
use crate::error::ConfigError;
use crate::expr::{self, Expr, RefKind};
use crate::procedure::{ProcedureDefinition, RelaySet, Slot, Step};
use crate::rules::{ModePolicy, Rule, RuleKind, Severity, StateDefinition};

#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    /// Address of the serial device server fronting the I/O board.
    pub address: String,
    /// Digital roles wired into the board-side mains interlock.
    pub interlock_roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub id: u8,
    pub role: String,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigitalInputConfig {
    pub id: u8,
    pub role: String,
    /// Input reads low when the interlock is satisfied (pull-up wiring).
    pub active_low: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannelConfig {
    pub id: u8,
    pub role: String,
    pub scale: f64,
    pub offset: f64,
}

/// Fully validated configuration. Expressions are compiled, every referenced
/// role and threshold exists, and channel counts fit the snapshot bounds.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub board: BoardConfig,
    pub relays: Vec<RelayConfig>,
    pub digital_inputs: Vec<DigitalInputConfig>,
    pub analog_channels: Vec<AnalogChannelConfig>,
    pub thresholds: BTreeMap<String, f64>,
    pub states: Vec<StateDefinition>,
    pub rules: Vec<Rule>,
    pub procedures: Vec<ProcedureDefinition>,
    pub modes: ModePolicy,
}

impl SystemConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        compile(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).copied()
    }

    pub fn relay(&self, role: &str) -> Option<&RelayConfig> {
        self.relays.iter().find(|r| r.role == role)
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureDefinition> {
        self.procedures.iter().find(|p| p.name == name)
    }

    /// Snapshot skeleton with every configured channel at its power-on value
    /// (relays off, interlocks unsafe, analog zero). The link fills it in as
    /// polls complete.
    pub fn blank_snapshot(&self) -> StateSnapshot {
        let mut snap = StateSnapshot::empty();
        // Channel counts were bounds-checked at load.
        for r in &self.relays {
            let _ = snap.relays.push(RelayChannel {
                id: r.id,
                role: r.role.clone(),
                commanded: false,
                confirmed: false,
                critical: r.critical,
            });
        }
        for d in &self.digital_inputs {
            let _ = snap.digital.push(DigitalInput {
                id: d.id,
                role: d.role.clone(),
                safe: false,
            });
        }
        for a in &self.analog_channels {
            let _ = snap.analog.push(AnalogChannel {
                id: a.id,
                role: a.role.clone(),
                raw: 0,
                scale: a.scale,
                offset: a.offset,
            });
        }
        snap
    }
}

// ---------------------------------------------------------------------------
// Raw document shape

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    board: RawBoard,
    relays: Vec<RawRelay>,
    digital_inputs: Vec<RawDigital>,
    analog_channels: Vec<RawAnalog>,
    #[serde(default)]
    thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    states: Vec<RawState>,
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    procedures: Vec<RawProcedure>,
    #[serde(default)]
    modes: ModePolicy,
}

#[derive(Debug, Deserialize)]
struct RawBoard {
    address: String,
    #[serde(default)]
    interlock_roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelay {
    id: u8,
    role: String,
    #[serde(default)]
    critical: bool,
}

#[derive(Debug, Deserialize)]
struct RawDigital {
    id: u8,
    role: String,
    #[serde(default)]
    active_low: bool,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RawAnalog {
    id: u8,
    role: String,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    offset: f64,
}

#[derive(Debug, Deserialize)]
struct RawState {
    name: String,
    #[serde(default)]
    priority: i32,
    when: String,
}

fn default_severity() -> Severity {
    Severity::Warning
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: String,
    kind: RuleKind,
    when: String,
    #[serde(default = "default_severity")]
    severity: Severity,
    message: String,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawStep {
    SetRelay {
        role: String,
        value: bool,
    },
    PulseRelay {
        role: String,
        hold_ms: u64,
    },
    WaitMs(u64),
    WaitFor {
        when: String,
        timeout_ms: u64,
    },
    StartGas {
        gas: String,
        sccm: f64,
    },
    Branch {
        when: String,
        then: Vec<RawStep>,
        #[serde(default)]
        otherwise: Vec<RawStep>,
    },
}

#[derive(Debug, Deserialize)]
struct RawRelaySet {
    role: String,
    value: bool,
}

#[derive(Debug, Deserialize)]
struct RawProcedure {
    name: String,
    slot: Slot,
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    steps: Vec<RawStep>,
    #[serde(default)]
    rollback: Vec<RawRelaySet>,
    #[serde(default)]
    grants: Vec<String>,
}

// ---------------------------------------------------------------------------
// Compilation and validation

struct Names {
    relays: BTreeSet<String>,
    digital: BTreeSet<String>,
    analog: BTreeSet<String>,
    thresholds: BTreeSet<String>,
}

fn compile(raw: RawConfig) -> Result<SystemConfig, ConfigError> {
    // Relay ids are 1-based on the wire; id 0 has no slot.
    if let Some(r) = raw.relays.iter().find(|r| r.id == 0) {
        return Err(ConfigError::Invalid(format!(
            "relay `{}` has id 0; relay ids start at 1",
            r.role
        )));
    }
    check_channels("relay", raw.relays.iter().map(|r| (r.id, r.role.as_str())), MAX_RELAYS)?;
    check_channels(
        "digital input",
        raw.digital_inputs.iter().map(|d| (d.id, d.role.as_str())),
        MAX_DIGITAL_INPUTS,
    )?;
    check_channels(
        "analog channel",
        raw.analog_channels.iter().map(|a| (a.id, a.role.as_str())),
        MAX_ANALOG_CHANNELS,
    )?;

    let names = Names {
        relays: raw.relays.iter().map(|r| r.role.clone()).collect(),
        digital: raw.digital_inputs.iter().map(|d| d.role.clone()).collect(),
        analog: raw.analog_channels.iter().map(|a| a.role.clone()).collect(),
        thresholds: raw.thresholds.keys().cloned().collect(),
    };

    for role in &raw.board.interlock_roles {
        if !names.digital.contains(role) {
            return Err(ConfigError::UnknownReference {
                rule: "board.interlock_roles".into(),
                kind: "digital input",
                name: role.clone(),
            });
        }
    }

    let mut states = Vec::with_capacity(raw.states.len());
    let mut state_names = BTreeSet::new();
    for s in raw.states {
        if !state_names.insert(s.name.clone()) {
            return Err(ConfigError::DuplicateRole {
                kind: "state",
                role: s.name,
            });
        }
        let context = format!("state `{}`", s.name);
        let when = parse_expr(&s.when, &context)?;
        validate_refs(&when, &context, &names, false)
            .map_err(|e| state_error(e, &s.name))?;
        states.push(StateDefinition {
            name: s.name,
            priority: s.priority,
            when,
        });
    }

    let mut rules = Vec::with_capacity(raw.rules.len());
    let mut rule_ids = BTreeSet::new();
    for r in raw.rules {
        if !rule_ids.insert(r.id.clone()) {
            return Err(ConfigError::DuplicateRole {
                kind: "rule",
                role: r.id,
            });
        }
        let context = format!("rule `{}`", r.id);
        let when = parse_expr(&r.when, &context)?;
        validate_refs(&when, &context, &names, true)?;
        for role in &r.scope {
            if !names.relays.contains(role) {
                return Err(ConfigError::UnknownReference {
                    rule: context,
                    kind: "relay",
                    name: role.clone(),
                });
            }
        }
        rules.push(Rule {
            id: r.id,
            kind: r.kind,
            when,
            severity: r.severity,
            message: r.message,
            scope: r.scope,
            confirm: r.confirm,
        });
    }

    let mut procedures = Vec::with_capacity(raw.procedures.len());
    let mut proc_names = BTreeSet::new();
    for p in raw.procedures {
        if !proc_names.insert(p.name.clone()) {
            return Err(ConfigError::DuplicateRole {
                kind: "procedure",
                role: p.name,
            });
        }
        let steps = compile_steps(&p.name, p.steps, &names, &mut 0)?;
        let mut rollback = Vec::with_capacity(p.rollback.len());
        for rb in p.rollback {
            if !names.relays.contains(&rb.role) {
                return Err(ConfigError::UnknownReference {
                    rule: format!("procedure `{}` rollback", p.name),
                    kind: "relay",
                    name: rb.role,
                });
            }
            rollback.push(RelaySet {
                role: rb.role,
                on: rb.value,
            });
        }
        for role in &p.grants {
            if !names.relays.contains(role) {
                return Err(ConfigError::UnknownReference {
                    rule: format!("procedure `{}` grants", p.name),
                    kind: "relay",
                    name: role.clone(),
                });
            }
        }
        procedures.push(ProcedureDefinition {
            name: p.name,
            slot: p.slot,
            steps,
            rollback,
            grants: p.grants,
        });
    }

    for role in &raw.modes.normal_allow {
        if !names.relays.contains(role) {
            return Err(ConfigError::UnknownReference {
                rule: "modes.normal_allow".into(),
                kind: "relay",
                name: role.clone(),
            });
        }
    }

    Ok(SystemConfig {
        board: BoardConfig {
            address: raw.board.address,
            interlock_roles: raw.board.interlock_roles,
        },
        relays: raw
            .relays
            .into_iter()
            .map(|r| RelayConfig {
                id: r.id,
                role: r.role,
                critical: r.critical,
            })
            .collect(),
        digital_inputs: raw
            .digital_inputs
            .into_iter()
            .map(|d| DigitalInputConfig {
                id: d.id,
                role: d.role,
                active_low: d.active_low,
            })
            .collect(),
        analog_channels: raw
            .analog_channels
            .into_iter()
            .map(|a| AnalogChannelConfig {
                id: a.id,
                role: a.role,
                scale: a.scale,
                offset: a.offset,
            })
            .collect(),
        thresholds: raw.thresholds,
        states,
        rules,
        procedures,
        modes: raw.modes,
    })
}

fn check_channels<'a>(
    kind: &'static str,
    items: impl Iterator<Item = (u8, &'a str)>,
    limit: usize,
) -> Result<(), ConfigError> {
    let mut ids = BTreeSet::new();
    let mut roles = BTreeSet::new();
    let mut count = 0usize;
    for (id, role) in items {
        count += 1;
        if !ids.insert(id) {
            return Err(ConfigError::DuplicateId { kind, id });
        }
        if !roles.insert(role.to_string()) {
            return Err(ConfigError::DuplicateRole {
                kind,
                role: role.to_string(),
            });
        }
    }
    if count > limit {
        return Err(ConfigError::TooManyChannels { kind, limit });
    }
    Ok(())
}

fn parse_expr(text: &str, context: &str) -> Result<Expr, ConfigError> {
    expr::parse(text).map_err(|e| ConfigError::BadExpression {
        context: context.to_string(),
        message: e.to_string(),
    })
}

/// Check every reference in `expr` against the configured names.
/// `allow_state` is false for state definitions, which may not read the
/// detected state they are defining.
fn validate_refs(
    expr: &Expr,
    context: &str,
    names: &Names,
    allow_state: bool,
) -> Result<(), ConfigError> {
    let mut err: Option<ConfigError> = None;
    expr.visit_refs(&mut |r| {
        if err.is_some() {
            return;
        }
        let missing = |kind: &'static str, name: &str| ConfigError::UnknownReference {
            rule: context.to_string(),
            kind,
            name: name.to_string(),
        };
        match r {
            RefKind::Relay(n) if !names.relays.contains(n) => err = Some(missing("relay", n)),
            RefKind::Digital(n) if !names.digital.contains(n) => {
                err = Some(missing("digital input", n))
            }
            RefKind::Analog(n) if !names.analog.contains(n) => {
                err = Some(missing("analog channel", n))
            }
            RefKind::Threshold(n) if !names.thresholds.contains(n) => {
                err = Some(missing("threshold", n))
            }
            RefKind::DetectedState if !allow_state => {
                err = Some(ConfigError::RecursiveStateDefinition(context.to_string()))
            }
            _ => {}
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn state_error(e: ConfigError, name: &str) -> ConfigError {
    match e {
        ConfigError::RecursiveStateDefinition(_) => {
            ConfigError::RecursiveStateDefinition(name.to_string())
        }
        other => other,
    }
}

fn compile_steps(
    procedure: &str,
    raw: Vec<RawStep>,
    names: &Names,
    index: &mut usize,
) -> Result<Vec<Step>, ConfigError> {
    let mut out = Vec::with_capacity(raw.len());
    for step in raw {
        let step_index = *index;
        *index += 1;
        let bad = |message: String| ConfigError::BadStep {
            procedure: procedure.to_string(),
            step: step_index,
            message,
        };
        let check_relay = |role: &str| {
            if names.relays.contains(role) {
                Ok(())
            } else {
                Err(bad(format!("unknown relay role `{}`", role)))
            }
        };
        match step {
            RawStep::SetRelay { role, value } => {
                check_relay(&role)?;
                out.push(Step::SetRelay { role, on: value });
            }
            RawStep::PulseRelay { role, hold_ms } => {
                check_relay(&role)?;
                if hold_ms == 0 {
                    return Err(bad("pulse hold must be nonzero".into()));
                }
                out.push(Step::PulseRelay { role, hold_ms });
            }
            RawStep::WaitMs(ms) => out.push(Step::WaitDuration { ms }),
            RawStep::WaitFor { when, timeout_ms } => {
                let context = format!("procedure `{}` step {}", procedure, step_index);
                let expr = parse_expr(&when, &context)?;
                validate_refs(&expr, &context, names, true)?;
                if timeout_ms == 0 {
                    return Err(bad("wait_for timeout must be nonzero".into()));
                }
                out.push(Step::WaitForCondition {
                    expr,
                    timeout_ms,
                });
            }
            RawStep::StartGas { gas, sccm } => {
                if !(sccm > 0.0) {
                    return Err(bad("gas flow rate must be positive".into()));
                }
                out.push(Step::StartGas { gas, sccm });
            }
            RawStep::Branch {
                when,
                then,
                otherwise,
            } => {
                let context = format!("procedure `{}` step {}", procedure, step_index);
                let cond = parse_expr(&when, &context)?;
                validate_refs(&cond, &context, names, true)?;
                let then = compile_steps(procedure, then, names, index)?;
                let otherwise = compile_steps(procedure, otherwise, names, index)?;
                out.push(Step::Branch {
                    cond,
                    then,
                    otherwise,
                });
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Default document

/// Channel map and rule set for the single-chamber sputter tool this daemon
/// was written for. Tests build engines and links from this.
pub const DEFAULT_CONFIG_YAML: &str = r#"
board:
  address: "127.0.0.1:9600"
  interlock_roles: [water_flow, rod_home, door_closed]

relays:
  - { id: 1,  role: mains_power, critical: true }
  - { id: 2,  role: rough_pump }
  - { id: 3,  role: rough_valve_chamber }
  - { id: 4,  role: rough_valve_loadlock }
  - { id: 5,  role: turbo_pump }
  - { id: 6,  role: gate_valve }
  - { id: 7,  role: vent_valve_chamber }
  - { id: 8,  role: vent_valve_loadlock }
  - { id: 9,  role: ion_gauge_toggle }
  - { id: 10, role: gas_valve_ar }
  - { id: 11, role: gas_valve_n2 }
  - { id: 12, role: sputter_power }

digital_inputs:
  - { id: 0, role: water_flow,  active_low: true }
  - { id: 1, role: rod_home,    active_low: true }
  - { id: 2, role: door_closed, active_low: true }
  - { id: 3, role: spare }

analog_channels:
  - { id: 0, role: loadlock_pressure }
  - { id: 1, role: chamber_pressure }
  - { id: 2, role: ion_gauge }
  - { id: 3, role: turbo_spin, scale: 25.0, offset: -12.5 }

thresholds:
  chamber_atmospheric: 4.5
  chamber_medium_vacuum: 2.0
  chamber_high_vacuum: 0.7
  loadlock_rough_vacuum: 1.6
  turbo_spun_up: 90.0

states:
  - name: sputter
    priority: 50
    when: "relay.sputter_power && relay.mains_power"
  - name: high_vacuum
    priority: 40
    when: "relay.turbo_pump && analog.chamber_pressure.volts < threshold.chamber_high_vacuum"
  - name: rough_vacuum
    priority: 30
    when: "analog.chamber_pressure.volts < threshold.chamber_medium_vacuum"
  - name: vented
    priority: 20
    when: "analog.chamber_pressure.volts > threshold.chamber_atmospheric"
  - name: pumping
    priority: 10
    when: "relay.rough_pump"

rules:
  - id: mains_interlocks
    kind: required
    scope: [mains_power]
    when: "digital.water_flow && digital.rod_home && digital.door_closed"
    severity: critical
    message: "mains power requires water flow, rod home and a closed door"
  - id: water_loss
    kind: emergency
    when: "relay.mains_power && !digital.water_flow"
    severity: critical
    message: "cooling water lost while mains power is on"
  - id: no_vent_with_turbo
    kind: forbidden
    scope: [vent_valve_chamber]
    when: "relay.turbo_pump"
    severity: critical
    message: "cannot vent the chamber while the turbo pump is running"
  - id: gate_needs_rough_loadlock
    kind: forbidden
    scope: [gate_valve]
    when: "analog.loadlock_pressure.volts > threshold.loadlock_rough_vacuum"
    severity: warning
    message: "load lock must be rough-pumped before the gate valve opens"
  - id: turbo_needs_rough
    kind: required
    scope: [turbo_pump]
    when: "analog.chamber_pressure.volts < threshold.chamber_medium_vacuum"
    severity: warning
    message: "chamber must be rough-pumped before the turbo pump starts"
  - id: ion_gauge_pressure_limit
    kind: threshold
    scope: [ion_gauge_toggle]
    when: "analog.chamber_pressure.volts > threshold.chamber_high_vacuum"
    severity: warning
    message: "ion gauge may only run below the high-vacuum crossover"
  - id: confirm_sputter_power
    kind: forbidden
    scope: [sputter_power]
    when: "true"
    severity: notice
    confirm: true
    message: "confirm sputter power enable"

modes:
  normal_allow: [vent_valve_loadlock, rough_valve_loadlock, ion_gauge_toggle]
  manual_level: 1
  override_level: 2

procedures:
  - name: pump_down
    slot: main_chamber
    steps:
      - set_relay: { role: rough_pump, value: true }
      - set_relay: { role: rough_valve_chamber, value: true }
      - wait_for:
          when: "analog.chamber_pressure.volts < threshold.chamber_medium_vacuum"
          timeout_ms: 600000
      - set_relay: { role: turbo_pump, value: true }
      - wait_for:
          when: "analog.turbo_spin.value > threshold.turbo_spun_up"
          timeout_ms: 900000
      - pulse_relay: { role: ion_gauge_toggle, hold_ms: 500 }
    rollback:
      - { role: turbo_pump, value: false }
      - { role: rough_valve_chamber, value: false }
      - { role: rough_pump, value: false }

  - name: vent_chamber
    slot: main_chamber
    steps:
      - set_relay: { role: turbo_pump, value: false }
      - wait_for:
          when: "analog.turbo_spin.value < 10.0"
          timeout_ms: 600000
      - set_relay: { role: vent_valve_chamber, value: true }
      - wait_for:
          when: "analog.chamber_pressure.volts > threshold.chamber_atmospheric"
          timeout_ms: 600000
      - set_relay: { role: vent_valve_chamber, value: false }
    rollback:
      - { role: vent_valve_chamber, value: false }

  - name: vent_load_lock
    slot: load_lock
    steps:
      - set_relay: { role: vent_valve_loadlock, value: true }
      - wait_for:
          when: "analog.loadlock_pressure.volts > threshold.chamber_atmospheric"
          timeout_ms: 300000
      - set_relay: { role: vent_valve_loadlock, value: false }
    rollback:
      - { role: vent_valve_loadlock, value: false }

  - name: load_unload
    slot: load_lock
    steps:
      - branch:
          when: "analog.loadlock_pressure.volts > threshold.loadlock_rough_vacuum"
          then:
            - set_relay: { role: rough_valve_loadlock, value: true }
            - wait_for:
                when: "analog.loadlock_pressure.volts < threshold.loadlock_rough_vacuum"
                timeout_ms: 300000
            - set_relay: { role: rough_valve_loadlock, value: false }
      - set_relay: { role: gate_valve, value: true }
    rollback:
      - { role: gate_valve, value: false }
      - { role: rough_valve_loadlock, value: false }

  - name: sputter_entry
    slot: main_chamber
    grants: [gas_valve_ar, gas_valve_n2]
    steps:
      - set_relay: { role: mains_power, value: true }
      - wait_ms: 1000
      - set_relay: { role: gas_valve_ar, value: true }
      - start_gas: { gas: ar, sccm: 20.0 }
      - set_relay: { role: sputter_power, value: true }
    rollback:
      - { role: sputter_power, value: false }
      - { role: gas_valve_ar, value: false }
      - { role: gas_valve_n2, value: false }
      - { role: mains_power, value: false }
"#;

pub fn default_config() -> Result<SystemConfig, ConfigError> {
    SystemConfig::from_yaml(DEFAULT_CONFIG_YAML)
}
