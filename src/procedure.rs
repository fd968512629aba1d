//! Procedure orchestrator.
//!
//! Procedures are linear step lists compiled from the configuration document
//! and run as tokio tasks, one per vessel slot at most. Every relay set is
//! gated through the rule engine with procedure scope; a confirmation demand
//! parks exactly that step until the console confirms or the run is
//! cancelled. Cancellation and failure both drive the procedure's rollback
//! list, which moves relays toward their safe state without re-entering the
//! rule gate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{ActionError, FailReason, ProcedureError};
use crate::expr::Expr;
use crate::gas::GasInterface;
use crate::link::DeviceLink;
use crate::rules::{
    ActionOrigin, ActionScope, Decision, EnforcementMode, EvalContext, ModePolicy, RuleEngine,
};

/// Consecutive disconnected polls a waiting step tolerates before failing.
pub const STALE_SNAPSHOT_LIMIT: u32 = 5;

/// Vessel a procedure occupies. Runs in different slots proceed
/// concurrently; a slot admits one run at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    MainChamber,
    LoadLock,
}

impl Slot {
    pub fn name(&self) -> &'static str {
        match self {
            Slot::MainChamber => "main_chamber",
            Slot::LoadLock => "load_lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    SetRelay {
        role: String,
        on: bool,
    },
    /// Momentary contact: on, hold, off. Used for toggle-style inputs such
    /// as the ion gauge controller.
    PulseRelay {
        role: String,
        hold_ms: u64,
    },
    WaitDuration {
        ms: u64,
    },
    WaitForCondition {
        expr: Expr,
        timeout_ms: u64,
    },
    /// Ask the gas subsystem for approval, then command the flow setpoint.
    /// A refusal fails the run.
    StartGas {
        gas: String,
        sccm: f64,
    },
    Branch {
        cond: Expr,
        then: Vec<Step>,
        otherwise: Vec<Step>,
    },
}

/// One rollback action. Rollback lists are flat on purpose: they must be
/// executable without reading any sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySet {
    pub role: String,
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureDefinition {
    pub name: String,
    pub slot: Slot,
    pub steps: Vec<Step>,
    pub rollback: Vec<RelaySet>,
    /// Relay roles manually operable in Normal mode while this run is
    /// active.
    pub grants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed(FailReason),
}

/// Cooperative cancellation flag, checked at step boundaries and every wait
/// tick.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Console-side handle on one run.
pub struct RunHandle {
    name: String,
    slot: Slot,
    status_rx: watch::Receiver<RunStatus>,
    cancel: CancelToken,
    confirm_tx: mpsc::Sender<()>,
}

impl RunHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Release a step parked on a confirmation demand.
    pub fn confirm(&self) -> bool {
        self.confirm_tx.try_send(()).is_ok()
    }

    /// Wait for the run to leave `Running`.
    pub async fn wait(&mut self) -> RunStatus {
        loop {
            let status = self.status_rx.borrow().clone();
            if status != RunStatus::Running {
                return status;
            }
            if self.status_rx.changed().await.is_err() {
                return self.status_rx.borrow().clone();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Poll cadence for `WaitForCondition` and branch evaluation.
    pub condition_poll: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            condition_poll: Duration::from_millis(200),
        }
    }
}

struct ActiveRun {
    name: String,
    cancel: CancelToken,
    status_rx: watch::Receiver<RunStatus>,
    confirm_tx: mpsc::Sender<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    link: DeviceLink,
    engine: Arc<RuleEngine>,
    policy: ModePolicy,
    gas: Arc<dyn GasInterface>,
    procedures: Arc<Vec<ProcedureDefinition>>,
    slots: Arc<Mutex<HashMap<Slot, ActiveRun>>>,
    grants: Arc<Mutex<Vec<String>>>,
    settings: OrchestratorSettings,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Orchestrator {
    pub fn new(
        link: DeviceLink,
        engine: Arc<RuleEngine>,
        policy: ModePolicy,
        procedures: Vec<ProcedureDefinition>,
        gas: Arc<dyn GasInterface>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            link,
            engine,
            policy,
            gas,
            procedures: Arc::new(procedures),
            slots: Arc::new(Mutex::new(HashMap::new())),
            grants: Arc::new(Mutex::new(Vec::new())),
            settings,
        }
    }

    /// Relay roles currently granted to Normal-mode manual control by active
    /// runs.
    pub fn active_grants(&self) -> Vec<String> {
        lock(&self.grants).clone()
    }

    pub fn active_runs(&self) -> Vec<(Slot, String)> {
        lock(&self.slots)
            .iter()
            .filter(|(_, run)| *run.status_rx.borrow() == RunStatus::Running)
            .map(|(slot, run)| (*slot, run.name.clone()))
            .collect()
    }

    pub fn start(
        &self,
        name: &str,
        mode: EnforcementMode,
    ) -> Result<RunHandle, ProcedureError> {
        let def = self
            .procedures
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| ProcedureError::UnknownProcedure(name.to_string()))?;

        let mut slots = lock(&self.slots);
        for run in slots.values() {
            if run.name == def.name && *run.status_rx.borrow() == RunStatus::Running {
                return Err(ProcedureError::AlreadyRunning(def.name));
            }
        }
        if let Some(active) = slots.get(&def.slot) {
            if *active.status_rx.borrow() == RunStatus::Running {
                return Err(ProcedureError::SlotBusy(
                    def.slot.name(),
                    active.name.clone(),
                ));
            }
        }

        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let cancel = CancelToken::new();
        let (confirm_tx, confirm_rx) = mpsc::channel(1);

        if !def.grants.is_empty() {
            lock(&self.grants).extend(def.grants.iter().cloned());
        }

        slots.insert(
            def.slot,
            ActiveRun {
                name: def.name.clone(),
                cancel: cancel.clone(),
                status_rx: status_rx.clone(),
                confirm_tx: confirm_tx.clone(),
            },
        );
        drop(slots);

        let handle = RunHandle {
            name: def.name.clone(),
            slot: def.slot,
            status_rx,
            cancel: cancel.clone(),
            confirm_tx,
        };

        let runner = Runner {
            link: self.link.clone(),
            engine: Arc::clone(&self.engine),
            policy: self.policy.clone(),
            gas: Arc::clone(&self.gas),
            grants: Arc::clone(&self.grants),
            slots: Arc::clone(&self.slots),
            condition_poll: self.settings.condition_poll,
            cancel,
            confirm_rx,
        };
        info!(procedure = %def.name, slot = def.slot.name(), "procedure started");
        tokio::spawn(runner.run(def, mode, status_tx));

        Ok(handle)
    }

    /// Cancel the active run with this name, if any.
    pub fn cancel(&self, name: &str) -> bool {
        let slots = lock(&self.slots);
        for run in slots.values() {
            if run.name == name && *run.status_rx.borrow() == RunStatus::Running {
                run.cancel.cancel();
                return true;
            }
        }
        false
    }

    pub fn cancel_all(&self) {
        for run in lock(&self.slots).values() {
            run.cancel.cancel();
        }
    }

    /// Confirm the parked step of the named run, if any.
    pub fn confirm(&self, name: &str) -> bool {
        let slots = lock(&self.slots);
        for run in slots.values() {
            if run.name == name && *run.status_rx.borrow() == RunStatus::Running {
                return run.confirm_tx.try_send(()).is_ok();
            }
        }
        false
    }
}

enum RunEnd {
    Cancelled,
    Failed(FailReason),
}

struct Runner {
    link: DeviceLink,
    engine: Arc<RuleEngine>,
    policy: ModePolicy,
    gas: Arc<dyn GasInterface>,
    grants: Arc<Mutex<Vec<String>>>,
    slots: Arc<Mutex<HashMap<Slot, ActiveRun>>>,
    condition_poll: Duration,
    cancel: CancelToken,
    confirm_rx: mpsc::Receiver<()>,
}

impl Runner {
    async fn run(
        mut self,
        def: ProcedureDefinition,
        mode: EnforcementMode,
        status_tx: watch::Sender<RunStatus>,
    ) {
        let mut step_index = 0usize;
        let outcome = self.exec_steps(&def.steps, mode, &mut step_index).await;

        let status = match outcome {
            Ok(()) => {
                info!(procedure = %def.name, "procedure completed");
                RunStatus::Completed
            }
            Err(RunEnd::Cancelled) => {
                warn!(procedure = %def.name, "procedure cancelled, rolling back");
                self.rollback(&def).await;
                RunStatus::Cancelled
            }
            Err(RunEnd::Failed(reason)) => {
                warn!(procedure = %def.name, reason = %reason, "procedure failed, rolling back");
                self.rollback(&def).await;
                RunStatus::Failed(reason)
            }
        };

        if !def.grants.is_empty() {
            let mut grants = lock(&self.grants);
            for role in &def.grants {
                if let Some(pos) = grants.iter().position(|g| g == role) {
                    grants.remove(pos);
                }
            }
        }
        let mut slots = lock(&self.slots);
        if slots.get(&def.slot).map(|r| r.name == def.name) == Some(true) {
            slots.remove(&def.slot);
        }
        drop(slots);

        let _ = status_tx.send(status);
    }

    fn exec_steps<'a>(
        &'a mut self,
        steps: &'a [Step],
        mode: EnforcementMode,
        idx: &'a mut usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), RunEnd>> + Send + 'a>> {
        Box::pin(async move {
            for step in steps {
                if self.cancel.is_cancelled() {
                    return Err(RunEnd::Cancelled);
                }
                let step_index = *idx;
                *idx += 1;
                match step {
                    Step::SetRelay { role, on } => {
                        self.gated_set(role, *on, mode).await?;
                    }
                    Step::PulseRelay { role, hold_ms } => {
                        self.gated_set(role, true, mode).await?;
                        let cancelled = tokio::select! {
                            _ = sleep(Duration::from_millis(*hold_ms)) => false,
                            _ = self.cancel.cancelled() => true,
                        };
                        // The falling edge always happens, cancelled or not.
                        self.link
                            .set_relay(role, false)
                            .await
                            .map_err(|e| RunEnd::Failed(action_fail(e)))?;
                        if cancelled {
                            return Err(RunEnd::Cancelled);
                        }
                    }
                    Step::WaitDuration { ms } => {
                        tokio::select! {
                            _ = sleep(Duration::from_millis(*ms)) => {}
                            _ = self.cancel.cancelled() => return Err(RunEnd::Cancelled),
                        }
                    }
                    Step::WaitForCondition { expr, timeout_ms } => {
                        self.wait_for(expr, *timeout_ms, step_index).await?;
                    }
                    Step::StartGas { gas, sccm } => {
                        if !self.gas.request_flow_approval(gas, *sccm) {
                            return Err(RunEnd::Failed(FailReason::GasRefused(gas.clone())));
                        }
                        info!(gas = %gas, sccm = *sccm, "gas flow approved");
                        self.gas.command_flow(gas, *sccm);
                    }
                    Step::Branch {
                        cond,
                        then,
                        otherwise,
                    } => {
                        let snap = self.link.current_snapshot();
                        let taken = if self.engine.eval_condition(cond, &snap) {
                            then
                        } else {
                            otherwise
                        };
                        self.exec_steps(taken, mode, idx).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// One relay set through the rule gate. A confirmation demand parks this
    /// step only; the rest of the system keeps moving.
    async fn gated_set(
        &mut self,
        role: &str,
        on: bool,
        mode: EnforcementMode,
    ) -> Result<(), RunEnd> {
        let mut confirmed = false;
        loop {
            let snap = self.link.current_snapshot();
            let grants = lock(&self.grants).clone();
            let decision = self.engine.evaluate(
                &snap,
                &self.policy,
                &ActionScope {
                    relay_role: role,
                    origin: ActionOrigin::Procedure,
                },
                &EvalContext {
                    mode,
                    confirmed,
                    grants: &grants,
                },
            );
            match decision {
                Decision::Allow => {
                    return self
                        .link
                        .set_relay(role, on)
                        .await
                        .map_err(|e| RunEnd::Failed(action_fail(e)));
                }
                Decision::Block(reason) => {
                    return Err(RunEnd::Failed(FailReason::RuleBlocked(reason)));
                }
                Decision::Emergency(reason) => {
                    return Err(RunEnd::Failed(FailReason::RuleEmergency(reason)));
                }
                Decision::RequireConfirmation(reason) => {
                    info!(role, reason = %reason, "step parked awaiting confirmation");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RunEnd::Cancelled),
                        got = self.confirm_rx.recv() => match got {
                            Some(()) => confirmed = true,
                            None => return Err(RunEnd::Cancelled),
                        }
                    }
                }
            }
        }
    }

    async fn wait_for(
        &mut self,
        expr: &Expr,
        timeout_ms: u64,
        step_index: usize,
    ) -> Result<(), RunEnd> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut stale = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RunEnd::Cancelled);
            }
            let snap = self.link.current_snapshot();
            if !snap.connected {
                stale += 1;
                if stale >= STALE_SNAPSHOT_LIMIT {
                    return Err(RunEnd::Failed(FailReason::StaleSnapshot(stale)));
                }
            } else {
                stale = 0;
                if self.engine.eval_condition(expr, &snap) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(RunEnd::Failed(FailReason::Timeout {
                    step: step_index,
                    timeout_ms,
                }));
            }
            tokio::select! {
                _ = sleep(self.condition_poll) => {}
                _ = self.cancel.cancelled() => return Err(RunEnd::Cancelled),
            }
        }
    }

    /// Drive the rollback list. Rollback moves relays toward their safe
    /// values; it bypasses the rule gate and failures are logged, not
    /// propagated.
    async fn rollback(&self, def: &ProcedureDefinition) {
        for set in &def.rollback {
            if let Err(e) = self.link.set_relay(&set.role, set.on).await {
                warn!(role = %set.role, error = %e, "rollback relay set failed");
            }
        }
        if uses_gas(&def.steps) || !def.grants.is_empty() {
            self.gas.stop_all_flows();
        }
    }
}

fn uses_gas(steps: &[Step]) -> bool {
    steps.iter().any(|s| match s {
        Step::StartGas { .. } => true,
        Step::Branch {
            then, otherwise, ..
        } => uses_gas(then) || uses_gas(otherwise),
        _ => false,
    })
}

fn action_fail(e: ActionError) -> FailReason {
    match e {
        ActionError::Link(link) => FailReason::Link(link),
        other => FailReason::RuleBlocked(other.to_string()),
    }
}
