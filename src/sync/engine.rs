//! The synchronization engine
//!
//! Owns the presentation schedule and the group membership, and runs
//! the periodic sync check. Everything reaches it by message; the
//! engine task is the single writer of playback state.

use super::delay::DeviceDelay;
use super::egress::{
    EgressCommand, EgressConfig, EgressRuntime, SEND_FAILURE_LIMIT, SyncReport, spawn_egress,
};
use super::schedule::PresentationSchedule;
use crate::config::{SyncAlgorithm, SyncConfig};
use crate::fanout::FanoutBuffer;
use crate::protocol::sdp::StreamFormat;
use crate::registry::ReceiverRegistry;
use crate::stats::{PlaybackState, ServerStats};
use crate::types::{Receiver, ReceiverId, ReceiverStatus};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Joining receivers start at the first frame at least this far out
pub const JOIN_MARGIN: Duration = Duration::from_millis(200);

/// Egress queues get this long to drain on stop or leave
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Skew violations on this many consecutive checks evict a receiver
pub const SKEW_STRIKE_LIMIT: u32 = 3;

/// Default cadence of sync checks
pub const SYNC_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Engine-reported failures
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The receiver id is not registered
    #[error("receiver not found: {0}")]
    NotFound(ReceiverId),

    /// The receiver cannot join the group right now
    #[error("receiver {id} incompatible: {reason}")]
    Incompatible {
        /// Receiver id
        id: ReceiverId,
        /// Why it cannot join
        reason: String,
    },

    /// `start_playback` without an attached sender stream
    #[error("no active stream")]
    NoActiveStream,

    /// The engine task is gone
    #[error("engine stopped")]
    Stopped,
}

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Playback state moved
    PlaybackChanged(PlaybackState),
    /// A receiver was removed from the group for exceeding skew
    /// tolerance or losing its transport
    ReceiverEvicted {
        /// Which receiver
        id: ReceiverId,
        /// Human-readable reason
        reason: String,
    },
}

enum Command {
    Join {
        id: ReceiverId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Leave {
        id: ReceiverId,
        reply: oneshot::Sender<()>,
    },
    Attach {
        format: StreamFormat,
        fanout: FanoutBuffer,
        start_seq: u64,
    },
    Detach,
    Start {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop,
    Flush {
        next_seq: u64,
    },
}

/// Cloneable handle to the engine task
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Add a receiver to the active group; repeated joins are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown ids and
    /// [`EngineError::Incompatible`] for unavailable receivers.
    pub async fn join(&self, id: ReceiverId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join { id, reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Remove a receiver from the group; unknown ids are no-ops
    pub async fn leave(&self, id: ReceiverId) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Leave { id, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Attach a sender stream; playback starts immediately
    pub async fn attach_stream(&self, format: StreamFormat, fanout: FanoutBuffer, start_seq: u64) {
        let _ = self
            .commands
            .send(Command::Attach {
                format,
                fanout,
                start_seq,
            })
            .await;
    }

    /// Detach the sender stream; playback stops
    pub async fn detach_stream(&self) {
        let _ = self.commands.send(Command::Detach).await;
    }

    /// Start playback of an already-attached stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveStream`] when nothing is attached.
    pub async fn start_playback(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Stop playback, keeping group membership and the attached stream
    pub async fn stop_playback(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    /// Propagate a sender flush to every receiver
    pub async fn flush(&self, next_seq: u64) {
        let _ = self.commands.send(Command::Flush { next_seq }).await;
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

struct Member {
    receiver: Receiver,
    delay: Arc<Mutex<DeviceDelay>>,
    egress: Option<EgressRuntime>,
    strikes: u32,
}

struct ActiveStream {
    format: StreamFormat,
    fanout: FanoutBuffer,
    start_seq: u64,
}

/// The engine task
pub struct SyncEngine {
    config: SyncConfig,
    sync_interval: Duration,
    registry: Arc<ReceiverRegistry>,
    stats: Arc<ServerStats>,
    members: HashMap<ReceiverId, Member>,
    stream: Option<ActiveStream>,
    schedule: Option<Arc<PresentationSchedule>>,
    events: broadcast::Sender<EngineEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncEngine {
    /// Create the engine and spawn its task.
    ///
    /// `shutdown` is the server-wide stop signal; egress tasks observe
    /// it as well.
    #[must_use]
    pub fn spawn(
        config: SyncConfig,
        registry: Arc<ReceiverRegistry>,
        stats: Arc<ServerStats>,
        shutdown: broadcast::Sender<()>,
    ) -> EngineHandle {
        Self::spawn_with_interval(config, registry, stats, shutdown, SYNC_CHECK_INTERVAL)
    }

    /// Like [`SyncEngine::spawn`], with a custom sync-check cadence
    /// (tests shorten it)
    #[must_use]
    pub fn spawn_with_interval(
        config: SyncConfig,
        registry: Arc<ReceiverRegistry>,
        stats: Arc<ServerStats>,
        shutdown: broadcast::Sender<()>,
        sync_interval: Duration,
    ) -> EngineHandle {
        let (commands, command_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(64);

        let engine = Self {
            config,
            sync_interval,
            registry,
            stats,
            members: HashMap::new(),
            stream: None,
            schedule: None,
            events: events.clone(),
            shutdown_tx: shutdown,
        };
        tokio::spawn(engine.run(command_rx));

        EngineHandle { commands, events }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut sync_tick = tokio::time::interval(self.sync_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync_tick.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                _ = sync_tick.tick() => {
                    if self.schedule.is_some() {
                        self.run_sync_checks().await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.stop_playback_internal().await;
        tracing::debug!("sync engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { id, reply } => {
                let _ = reply.send(self.join(id).await);
            }
            Command::Leave { id, reply } => {
                self.leave(&id).await;
                let _ = reply.send(());
            }
            Command::Attach {
                format,
                fanout,
                start_seq,
            } => {
                // A new sender supersedes any stream already playing
                self.stop_playback_internal().await;
                self.stream = Some(ActiveStream {
                    format,
                    fanout,
                    start_seq,
                });
                self.start_playback_internal();
            }
            Command::Detach => {
                self.stop_playback_internal().await;
                self.stream = None;
            }
            Command::Start { reply } => {
                let result = if self.stream.is_some() {
                    self.start_playback_internal();
                    Ok(())
                } else {
                    Err(EngineError::NoActiveStream)
                };
                let _ = reply.send(result);
            }
            Command::Stop => self.stop_playback_internal().await,
            Command::Flush { next_seq } => self.flush(next_seq).await,
        }
    }

    async fn join(&mut self, id: ReceiverId) -> Result<(), EngineError> {
        if self.members.contains_key(&id) {
            return Ok(()); // idempotent
        }

        let receiver = self
            .registry
            .get(&id)
            .await
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if !receiver.is_available() {
            return Err(EngineError::Incompatible {
                id: id.clone(),
                reason: format!("receiver is {:?}", receiver.status),
            });
        }
        let Some(address) = receiver.address() else {
            return Err(EngineError::Incompatible {
                id: id.clone(),
                reason: "no IPv4 address".to_string(),
            });
        };

        let base = self
            .config
            .device_delays
            .get(id.as_str())
            .copied()
            .map_or(Duration::ZERO, |s| Duration::from_secs_f64(s.max(0.0)));
        let delay = Arc::new(Mutex::new(DeviceDelay::with_base(base)));

        let mut member = Member {
            receiver: receiver.clone(),
            delay,
            egress: None,
            strikes: 0,
        };

        // Mid-playback joins begin at the next frame still comfortably
        // in the future; no history is replayed
        if let (Some(schedule), Some(stream)) = (&self.schedule, &self.stream) {
            let start_seq = schedule.first_seq_at_or_after(Instant::now() + JOIN_MARGIN);
            member.egress = Some(self.spawn_member_egress(
                &receiver,
                address,
                schedule.clone(),
                &member.delay,
                stream,
                start_seq,
            ));
        }

        tracing::info!(id = %id, "receiver joined group");
        self.members.insert(id.clone(), member);
        self.stats.set_devices_connected(self.members.len());
        let _ = self
            .registry
            .set_status(&id, ReceiverStatus::Connected, None)
            .await;
        Ok(())
    }

    async fn leave(&mut self, id: &ReceiverId) {
        let Some(member) = self.members.remove(id) else {
            return;
        };
        if let Some(egress) = member.egress {
            stop_egress(egress).await;
        }
        tracing::info!(id = %id, "receiver left group");
        self.stats.set_devices_connected(self.members.len());
        let _ = self
            .registry
            .set_status(id, ReceiverStatus::Discovered, None)
            .await;
    }

    fn start_playback_internal(&mut self) {
        let Some(stream) = &self.stream else { return };
        if self.schedule.is_some() {
            return; // already playing
        }

        let schedule = Arc::new(PresentationSchedule::anchor(
            Instant::now(),
            self.config.global_delay_duration(),
            stream.start_seq,
            stream.format.packet_duration(),
        ));
        self.schedule = Some(schedule.clone());

        let receivers: Vec<(ReceiverId, Receiver, Option<SocketAddr>)> = self
            .members
            .iter()
            .map(|(id, m)| {
                (
                    id.clone(),
                    m.receiver.clone(),
                    m.receiver.address().map(|a| SocketAddr::from((a, m.receiver.port))),
                )
            })
            .collect();

        for (id, receiver, addr) in receivers {
            if addr.is_none() {
                continue;
            }
            let delay = self.members[&id].delay.clone();
            let stream = self.stream.as_ref().expect("stream checked above");
            let egress = self.spawn_member_egress(
                &receiver,
                receiver.address().expect("addr checked"),
                schedule.clone(),
                &delay,
                stream,
                schedule.seq0(),
            );
            if let Some(member) = self.members.get_mut(&id) {
                member.egress = Some(egress);
                member.strikes = 0;
            }
        }

        self.stats.set_playback_state(PlaybackState::Playing);
        let _ = self
            .events
            .send(EngineEvent::PlaybackChanged(PlaybackState::Playing));
        tracing::info!(
            members = self.members.len(),
            global_delay_ms = self.config.global_delay_duration().as_millis(),
            "playback started"
        );
    }

    fn spawn_member_egress(
        &self,
        receiver: &Receiver,
        address: std::net::Ipv4Addr,
        schedule: Arc<PresentationSchedule>,
        delay: &Arc<Mutex<DeviceDelay>>,
        stream: &ActiveStream,
        start_seq: u64,
    ) -> EgressRuntime {
        // Downstream receivers take audio datagrams on their advertised
        // port; the control channel sits one above
        let config = EgressConfig {
            receiver_id: receiver.id.clone(),
            audio_addr: SocketAddr::from((address, receiver.port)),
            control_addr: SocketAddr::from((address, receiver.port.wrapping_add(1))),
            algorithm: self.config.sync_algorithm,
            sample_rate: stream.format.sample_rate,
        };
        spawn_egress(
            config,
            schedule,
            delay.clone(),
            stream.fanout.tap(),
            start_seq,
            self.stats.clone(),
            self.shutdown_tx.subscribe(),
        )
    }

    async fn stop_playback_internal(&mut self) {
        if self.schedule.take().is_none() {
            return;
        }
        // Drain every member concurrently: the whole group stop is
        // bounded by one 2 s deadline, not one per member
        let mut draining = Vec::with_capacity(self.members.len());
        for member in self.members.values_mut() {
            if let Some(egress) = member.egress.take() {
                draining.push(stop_egress(egress));
            }
            member.strikes = 0;
        }
        futures::future::join_all(draining).await;
        self.stats.set_playback_state(PlaybackState::Stopped);
        let _ = self
            .events
            .send(EngineEvent::PlaybackChanged(PlaybackState::Stopped));
        tracing::info!("playback stopped");
    }

    async fn flush(&mut self, next_seq: u64) {
        let Some(stream) = &mut self.stream else { return };
        stream.start_seq = next_seq;
        let Some(old) = &self.schedule else { return };

        // Re-anchor: the flushed stream restarts its timeline
        let schedule = Arc::new(PresentationSchedule::anchor(
            Instant::now(),
            old.global_delay(),
            next_seq,
            old.frame_duration(),
        ));
        self.schedule = Some(schedule.clone());

        for member in self.members.values() {
            if let Some(egress) = &member.egress {
                let _ = egress
                    .commands
                    .send(EgressCommand::Flush {
                        next_seq,
                        schedule: schedule.clone(),
                    })
                    .await;
            }
        }
        tracing::debug!(next_seq, "flush propagated to group");
    }

    /// Run one sync-check round and evict repeat offenders
    async fn run_sync_checks(&mut self) {
        let tolerance = self.config.tolerance_duration();
        let mut reports: Vec<(ReceiverId, Option<SyncReport>)> = Vec::new();

        for (id, member) in &self.members {
            let Some(egress) = &member.egress else { continue };
            let (reply, rx) = oneshot::channel();
            if egress
                .commands
                .send(EgressCommand::SyncCheck { reply })
                .await
                .is_err()
            {
                reports.push((id.clone(), None));
                continue;
            }
            let report = tokio::time::timeout(Duration::from_secs(1), rx).await;
            reports.push((id.clone(), report.ok().and_then(Result::ok)));
        }

        let mut evict: Vec<(ReceiverId, String)> = Vec::new();
        for (id, report) in reports {
            let Some(member) = self.members.get_mut(&id) else { continue };
            let violation = match report {
                Some(report) => {
                    if report.send_errors >= SEND_FAILURE_LIMIT {
                        Some(format!("{} consecutive send failures", report.send_errors))
                    } else if report.timing_failed {
                        Some("timing probe unanswered".to_string())
                    } else if report.skew > tolerance {
                        Some(format!(
                            "skew {}ms over tolerance {}ms",
                            report.skew.as_millis(),
                            tolerance.as_millis()
                        ))
                    } else {
                        None
                    }
                }
                None => Some("egress unresponsive".to_string()),
            };

            match violation {
                Some(reason) => {
                    member.strikes += 1;
                    tracing::warn!(id = %id, strikes = member.strikes, %reason, "sync violation");
                    if member.strikes >= SKEW_STRIKE_LIMIT {
                        evict.push((id.clone(), reason));
                    }
                }
                None => member.strikes = 0,
            }
        }

        for (id, reason) in evict {
            self.evict(&id, &reason).await;
        }
    }

    async fn evict(&mut self, id: &ReceiverId, reason: &str) {
        let Some(member) = self.members.remove(id) else { return };
        if let Some(egress) = member.egress {
            // No graceful drain for a receiver we cannot reach
            egress.task.abort();
        }
        tracing::warn!(id = %id, %reason, "receiver evicted from group");
        self.stats.set_devices_connected(self.members.len());
        let _ = self
            .registry
            .set_status(id, ReceiverStatus::Error, Some(reason.to_string()))
            .await;
        let _ = self.events.send(EngineEvent::ReceiverEvicted {
            id: id.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Graceful egress stop: command, then drain with the 2 s deadline
async fn stop_egress(egress: EgressRuntime) {
    let _ = egress.commands.send(EgressCommand::Stop).await;
    if tokio::time::timeout(DRAIN_DEADLINE, egress.task).await.is_err() {
        tracing::warn!("egress drain deadline exceeded");
    }
}
