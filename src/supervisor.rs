//! Console-facing facade.
//!
//! Everything an operator console may do goes through one [`Supervisor`]:
//! read the snapshot and detected state, toggle relays manually, run and
//! cancel procedures, switch enforcement modes. A monitor task watches the
//! snapshot stream for emergency rule matches and pushes them on a dedicated
//! channel the console drains ahead of ordinary updates; a new emergency also
//! cancels every active run.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::channel::StateSnapshot;
use crate::config::SystemConfig;
use crate::error::{ActionError, LinkError, ProcedureError};
use crate::gas::GasInterface;
use crate::link::DeviceLink;
use crate::procedure::{Orchestrator, OrchestratorSettings, RunHandle, Slot};
use crate::rules::{ActionOrigin, ActionScope, Decision, EnforcementMode, EvalContext, ModePolicy, RuleEngine};

const EMERGENCY_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyEvent {
    pub message: String,
    /// Snapshot timestamp the condition was first seen on.
    pub at_ms: u64,
}

/// Point-in-time report for the console, serializable as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub state: String,
    pub mode: EnforcementMode,
    pub active_runs: Vec<String>,
    pub snapshot: StateSnapshot,
}

pub struct Supervisor {
    link: DeviceLink,
    engine: Arc<RuleEngine>,
    policy: ModePolicy,
    orchestrator: Orchestrator,
    mode: Arc<Mutex<EnforcementMode>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Supervisor {
    /// Assemble the supervisor over an already-spawned link. Returns the
    /// emergency channel alongside; the console must drain it.
    pub fn new(
        config: &SystemConfig,
        link: DeviceLink,
        gas: Arc<dyn GasInterface>,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::Receiver<EmergencyEvent>) {
        let engine = Arc::new(RuleEngine::new(config));
        let orchestrator = Orchestrator::new(
            link.clone(),
            Arc::clone(&engine),
            config.modes.clone(),
            config.procedures.clone(),
            gas,
            settings,
        );

        let (em_tx, em_rx) = mpsc::channel(EMERGENCY_QUEUE_DEPTH);
        tokio::spawn(monitor(
            link.clone(),
            Arc::clone(&engine),
            orchestrator.clone(),
            em_tx,
        ));

        let supervisor = Self {
            link,
            engine,
            policy: config.modes.clone(),
            orchestrator,
            mode: Arc::new(Mutex::new(EnforcementMode::Normal)),
        };
        (supervisor, em_rx)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.link.current_snapshot()
    }

    pub fn detected_state(&self) -> String {
        self.engine.detect_state(&self.snapshot()).to_string()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn mode(&self) -> EnforcementMode {
        *lock(&self.mode)
    }

    /// Switch enforcement mode. The role level must clear the configured bar
    /// for the target mode; nothing else about authentication lives here.
    pub fn set_mode(&self, mode: EnforcementMode, role_level: u8) -> Result<(), ActionError> {
        if !self.policy.mode_allowed(mode, role_level) {
            return Err(ActionError::Blocked(format!(
                "role level {} may not enter {:?} mode",
                role_level, mode
            )));
        }
        *lock(&self.mode) = mode;
        info!(?mode, role_level, "enforcement mode changed");
        Ok(())
    }

    /// Direct console relay toggle, through the same rule gate procedures
    /// use. Pass `confirmed` on the retry after a
    /// [`ActionError::ConfirmationRequired`].
    pub async fn manual_set_relay(
        &self,
        role: &str,
        on: bool,
        confirmed: bool,
    ) -> Result<(), ActionError> {
        if self.link.relay_id(role).is_none() {
            return Err(ActionError::UnknownRelay(role.to_string()));
        }
        let snap = self.snapshot();
        let grants = self.orchestrator.active_grants();
        let decision = self.engine.evaluate(
            &snap,
            &self.policy,
            &ActionScope {
                relay_role: role,
                origin: ActionOrigin::Manual,
            },
            &EvalContext {
                mode: self.mode(),
                confirmed,
                grants: &grants,
            },
        );
        match decision {
            Decision::Allow => self.link.set_relay(role, on).await,
            Decision::Block(reason) => Err(ActionError::Blocked(reason)),
            Decision::Emergency(reason) => Err(ActionError::Emergency(reason)),
            Decision::RequireConfirmation(reason) => {
                Err(ActionError::ConfirmationRequired(reason))
            }
        }
    }

    pub fn start_procedure(&self, name: &str) -> Result<RunHandle, ProcedureError> {
        self.orchestrator.start(name, self.mode())
    }

    pub fn cancel_procedure(&self, name: &str) -> bool {
        self.orchestrator.cancel(name)
    }

    /// Confirm the parked step of the named run.
    pub fn confirm_procedure(&self, name: &str) -> bool {
        self.orchestrator.confirm(name)
    }

    pub fn active_runs(&self) -> Vec<(Slot, String)> {
        self.orchestrator.active_runs()
    }

    pub async fn all_off(&self) -> Result<(), LinkError> {
        self.link.all_off().await
    }

    pub fn status_report(&self) -> StatusReport {
        let snapshot = self.snapshot();
        StatusReport {
            connected: snapshot.connected,
            state: self.engine.detect_state(&snapshot).to_string(),
            mode: self.mode(),
            active_runs: self
                .orchestrator
                .active_runs()
                .into_iter()
                .map(|(_, name)| name)
                .collect(),
            snapshot,
        }
    }
}

/// Watch the snapshot stream for emergency rule matches. Each newly raised
/// condition cancels all active runs and is pushed to the console.
async fn monitor(
    link: DeviceLink,
    engine: Arc<RuleEngine>,
    orchestrator: Orchestrator,
    em_tx: mpsc::Sender<EmergencyEvent>,
) {
    let mut rx = link.watch_snapshot();
    let mut active: Vec<String> = Vec::new();
    loop {
        let snap = rx.borrow_and_update().clone();
        let now = engine.active_emergencies(&snap);
        for message in &now {
            if !active.contains(message) {
                error!(message = %message, "emergency condition raised");
                orchestrator.cancel_all();
                let _ = em_tx.try_send(EmergencyEvent {
                    message: message.clone(),
                    at_ms: snap.taken_at_ms,
                });
            }
        }
        active = now;
        if rx.changed().await.is_err() {
            break;
        }
    }
}
