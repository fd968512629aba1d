//! Device link: the single owner of the board connection.
//!
//! Exactly one task talks to the board. All commands funnel through a bounded
//! queue and execute strictly one at a time (the bus is half duplex), with a
//! per-command timeout and a mandatory settle delay between exchanges. Sensor
//! and relay-echo polls run on their own cadences through the same task, so a
//! poll can never interleave with a command mid-exchange.
//!
//! The latest [`StateSnapshot`] is published through a `watch` channel;
//! reading it never touches the transport.

pub mod codec;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::StateSnapshot;
use crate::config::SystemConfig;
use crate::error::{ActionError, LinkError};

pub use codec::{BoardCommand, BoardResponse};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Digital + analog poll cadence.
    pub sensor_poll: Duration,
    /// Relay echo poll cadence.
    pub relay_poll: Duration,
    pub command_timeout: Duration,
    /// Settle time between exchanges on the half-duplex bus.
    pub inter_command_delay: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            sensor_poll: Duration::from_millis(700),
            relay_poll: Duration::from_millis(1000),
            command_timeout: Duration::from_millis(2000),
            inter_command_delay: Duration::from_millis(50),
            reconnect_backoff: Duration::from_millis(2000),
        }
    }
}

struct QueuedCommand {
    cmd: BoardCommand,
    reply: oneshot::Sender<Result<BoardResponse, LinkError>>,
}

/// Handle to the link task. Cheap to clone; dropping every handle shuts the
/// task down once the queue drains.
#[derive(Clone)]
pub struct DeviceLink {
    cmd_tx: mpsc::Sender<QueuedCommand>,
    snapshot_rx: watch::Receiver<StateSnapshot>,
    relay_ids: Arc<BTreeMap<String, u8>>,
}

impl DeviceLink {
    pub fn spawn<C: Connector>(connector: C, config: &SystemConfig, settings: LinkSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snap_tx, snapshot_rx) = watch::channel(config.blank_snapshot());

        let relay_ids: BTreeMap<String, u8> = config
            .relays
            .iter()
            .map(|r| (r.role.clone(), r.id))
            .collect();
        let active_low: Vec<bool> =
            config.digital_inputs.iter().map(|d| d.active_low).collect();

        let task = LinkTask {
            connector,
            settings,
            snap: config.blank_snapshot(),
            active_low,
            snap_tx,
            started: Instant::now(),
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx,
            snapshot_rx,
            relay_ids: Arc::new(relay_ids),
        }
    }

    /// Latest published snapshot. Cheap clone, never blocks on the bus.
    pub fn current_snapshot(&self) -> StateSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().connected
    }

    pub fn relay_id(&self, role: &str) -> Option<u8> {
        self.relay_ids.get(role).copied()
    }

    /// Queue one command and wait for its board response.
    pub async fn send(&self, cmd: BoardCommand) -> Result<BoardResponse, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(QueuedCommand { cmd, reply: tx })
            .await
            .map_err(|_| LinkError::QueueClosed)?;
        rx.await.map_err(|_| LinkError::QueueClosed)?
    }

    pub async fn set_relay(&self, role: &str, on: bool) -> Result<(), ActionError> {
        let id = self
            .relay_id(role)
            .ok_or_else(|| ActionError::UnknownRelay(role.to_string()))?;
        self.send(BoardCommand::SetRelay { id, on })
            .await
            .map(|_| ())
            .map_err(ActionError::Link)
    }

    pub async fn all_off(&self) -> Result<(), LinkError> {
        self.send(BoardCommand::AllOff).await.map(|_| ())
    }
}

struct LinkTask<C: Connector> {
    connector: C,
    settings: LinkSettings,
    snap: StateSnapshot,
    /// Polarity flags aligned with `snap.digital`.
    active_low: Vec<bool>,
    snap_tx: watch::Sender<StateSnapshot>,
    started: Instant,
}

impl<C: Connector> LinkTask<C> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<QueuedCommand>) {
        let mut transport: Option<C::Conn> = None;
        let mut sensor_tick = interval(self.settings.sensor_poll);
        let mut relay_tick = interval(self.settings.relay_poll);
        sensor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        relay_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'main: loop {
            let mut conn = match transport.take() {
                Some(c) => c,
                None => {
                    // The backoff timer spans the whole disconnected episode.
                    // Failing queued commands fast must not push it back.
                    let backoff = sleep(self.settings.reconnect_backoff);
                    tokio::pin!(backoff);
                    loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(q) => {
                                    let _ = q.reply.send(Err(LinkError::Disconnected));
                                }
                                None => break 'main,
                            },
                            _ = backoff.as_mut() => {
                                match self.connect().await {
                                    Ok(conn) => {
                                        info!("board link established");
                                        self.set_connected(true);
                                        sensor_tick.reset();
                                        relay_tick.reset();
                                        break conn;
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "board connect failed");
                                        self.connector.forget_endpoint();
                                        backoff.as_mut().reset(
                                            Instant::now() + self.settings.reconnect_backoff,
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            };

            let health = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(q) => self.run_command(&mut conn, q).await,
                    None => break,
                },
                _ = sensor_tick.tick() => self.poll_sensors(&mut conn).await,
                _ = relay_tick.tick() => self.poll_relays(&mut conn).await,
            };
            match health {
                Ok(()) => transport = Some(conn),
                Err(e) => {
                    warn!(error = %e, "board link lost");
                    self.connector.forget_endpoint();
                    self.set_connected(false);
                }
            }
        }
        debug!("device link task stopped");
    }

    async fn connect(&mut self) -> Result<C::Conn, LinkError> {
        let mut conn = self.connector.connect().await?;
        // Boot banner: READY, or SAFETY_HALT if the park check failed.
        let deadline = Instant::now() + self.settings.command_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = timeout(remaining, conn.recv_line())
                .await
                .map_err(|_| LinkError::Timeout)??;
            let line = line.trim();
            if line == codec::BANNER_READY {
                return Ok(conn);
            }
            if let Some(reason) = line.strip_prefix(codec::BANNER_HALT) {
                return Err(LinkError::BoardHalted(reason.trim().to_string()));
            }
            debug!(line, "skipping boot noise");
        }
    }

    /// Run one queued exchange. The returned result is connection health:
    /// a board `ERROR` fails the command but leaves the link up.
    async fn run_command(
        &mut self,
        conn: &mut C::Conn,
        q: QueuedCommand,
    ) -> Result<(), LinkError> {
        let result = exchange(conn, &q.cmd, self.settings.command_timeout).await;
        let health = match &result {
            Ok(_) | Err(LinkError::Rejected) => Ok(()),
            Err(e) => Err(e.clone()),
        };
        if let Ok(resp) = &result {
            self.apply(&q.cmd, resp);
        }
        let _ = q.reply.send(result);
        sleep(self.settings.inter_command_delay).await;
        health
    }

    async fn poll_sensors(&mut self, conn: &mut C::Conn) -> Result<(), LinkError> {
        for cmd in [BoardCommand::GetDigital, BoardCommand::GetAnalog] {
            let resp = exchange(conn, &cmd, self.settings.command_timeout).await?;
            self.apply(&cmd, &resp);
            sleep(self.settings.inter_command_delay).await;
        }
        Ok(())
    }

    async fn poll_relays(&mut self, conn: &mut C::Conn) -> Result<(), LinkError> {
        let cmd = BoardCommand::GetRelays;
        let resp = exchange(conn, &cmd, self.settings.command_timeout).await?;
        self.apply(&cmd, &resp);
        sleep(self.settings.inter_command_delay).await;
        Ok(())
    }

    fn apply(&mut self, cmd: &BoardCommand, resp: &BoardResponse) {
        match (cmd, resp) {
            (BoardCommand::SetRelay { id, on }, BoardResponse::Ok) => {
                if let Some(r) = self.snap.relays.iter_mut().find(|r| r.id == *id) {
                    r.commanded = *on;
                }
            }
            (BoardCommand::AllOff, BoardResponse::Ok) => {
                for r in self.snap.relays.iter_mut() {
                    r.commanded = false;
                }
            }
            (_, BoardResponse::Relays(bits)) => {
                // Relay ids are 1-based on the wire.
                for r in self.snap.relays.iter_mut() {
                    if let Some(&bit) = bits.get(usize::from(r.id).wrapping_sub(1)) {
                        r.confirmed = bit;
                    }
                }
            }
            (_, BoardResponse::Digital(bits)) => {
                for (i, d) in self.snap.digital.iter_mut().enumerate() {
                    if let Some(&raw) = bits.get(usize::from(d.id)) {
                        let invert = self.active_low.get(i).copied().unwrap_or(false);
                        d.safe = if invert { !raw } else { raw };
                    }
                }
            }
            (_, BoardResponse::Analog(samples)) => {
                for a in self.snap.analog.iter_mut() {
                    if let Some(&raw) = samples.get(usize::from(a.id)) {
                        a.raw = raw;
                    }
                }
            }
            _ => {}
        }
        self.publish();
    }

    fn set_connected(&mut self, connected: bool) {
        self.snap.connected = connected;
        self.publish();
    }

    fn publish(&mut self) {
        self.snap.taken_at_ms = self.started.elapsed().as_millis() as u64;
        let _ = self.snap_tx.send(self.snap.clone());
    }
}

/// One half-duplex exchange: send the command, then read lines until the
/// matching response arrives or the timeout budget runs out. Unsolicited and
/// stale lines are skipped; a mid-session `SAFETY_HALT` kills the connection.
async fn exchange<T: Transport>(
    conn: &mut T,
    cmd: &BoardCommand,
    budget: Duration,
) -> Result<BoardResponse, LinkError> {
    conn.send_line(cmd.encode().as_str()).await?;
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = timeout(remaining, conn.recv_line())
            .await
            .map_err(|_| LinkError::Timeout)??;
        match codec::decode(&line) {
            Some(BoardResponse::Halted(reason)) => {
                return Err(LinkError::BoardHalted(reason));
            }
            Some(resp) if cmd.matches(&resp) => {
                if resp == BoardResponse::Error {
                    return Err(LinkError::Rejected);
                }
                return Ok(resp);
            }
            _ => debug!(line = %line, "skipping unsolicited line"),
        }
    }
}
