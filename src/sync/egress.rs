//! Per-receiver egress task
//!
//! One task per group member. It consumes the fan-out tap, sleeps each
//! frame until its transmit moment, and sends RTP audio plus periodic
//! sync packets over UDP. Commands arrive from the engine: stop, flush
//! (with a re-anchored schedule), and sync checks.

use super::delay::DeviceDelay;
use super::schedule::PresentationSchedule;
use crate::config::SyncAlgorithm;
use crate::fanout::{FrameTap, TapItem};
use crate::protocol::rtp::control::{ControlPacket, PlaybackCommand};
use crate::protocol::rtp::{NtpTimestamp, RtpPacket, TimingRequest, TimingResponse};
use crate::stats::ServerStats;
use crate::types::{AudioFrame, ReceiverId};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Transmit this far ahead of the presentation deadline
const SEND_LEAD: Duration = Duration::from_millis(100);

/// Cadence of sync packets restating the timestamp mapping
const SYNC_PACKET_INTERVAL: Duration = Duration::from_secs(1);

/// How long a timing probe waits for its response
const TIMING_REPLY_TIMEOUT: Duration = Duration::from_millis(300);

/// Consecutive UDP send failures treated as a dead receiver
pub const SEND_FAILURE_LIMIT: u32 = 10;

/// Commands from the engine
#[derive(Debug)]
pub enum EgressCommand {
    /// Graceful stop: send the stop control frame and exit
    Stop,
    /// Flush: drop queued frames, adopt the re-anchored schedule
    Flush {
        /// First frame that remains valid
        next_seq: u64,
        /// Replacement schedule
        schedule: Arc<PresentationSchedule>,
    },
    /// Run one sync check and report
    SyncCheck {
        /// Where to deliver the report
        reply: oneshot::Sender<SyncReport>,
    },
}

/// One sync-check result
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    /// Filtered send lateness (zero when transmitting on time)
    pub skew: Duration,
    /// Measured round trip, when the probe succeeded
    pub rtt: Option<Duration>,
    /// The timing probe got no response (advanced mode only)
    pub timing_failed: bool,
    /// Consecutive UDP send failures
    pub send_errors: u32,
}

/// Static egress parameters
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Which receiver this task feeds
    pub receiver_id: ReceiverId,
    /// Audio datagram sink
    pub audio_addr: SocketAddr,
    /// Control channel sink
    pub control_addr: SocketAddr,
    /// Sync-check routine
    pub algorithm: SyncAlgorithm,
    /// Stream sample rate, for timestamp arithmetic in sync packets
    pub sample_rate: u32,
}

/// Running egress task handle
pub struct EgressRuntime {
    /// Command channel
    pub commands: mpsc::Sender<EgressCommand>,
    /// Task handle, awaited on graceful stop
    pub task: JoinHandle<()>,
}

/// Spawn the egress task for one receiver
pub fn spawn_egress(
    config: EgressConfig,
    schedule: Arc<PresentationSchedule>,
    delay: Arc<Mutex<DeviceDelay>>,
    tap: FrameTap,
    start_seq: u64,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Receiver<()>,
) -> EgressRuntime {
    let (commands, command_rx) = mpsc::channel(8);
    let task = tokio::spawn(run_egress(
        config,
        schedule,
        delay,
        tap,
        start_seq,
        stats,
        command_rx,
        shutdown,
    ));
    EgressRuntime { commands, task }
}

struct EgressState {
    config: EgressConfig,
    schedule: Arc<PresentationSchedule>,
    delay: Arc<Mutex<DeviceDelay>>,
    start_seq: u64,
    stats: Arc<ServerStats>,
    audio: UdpSocket,
    control: UdpSocket,
    control_seq: u16,
    lateness_ewma: Duration,
    send_errors: u32,
    last_timestamp: u32,
}

#[allow(clippy::too_many_arguments)]
async fn run_egress(
    config: EgressConfig,
    schedule: Arc<PresentationSchedule>,
    delay: Arc<Mutex<DeviceDelay>>,
    mut tap: FrameTap,
    start_seq: u64,
    stats: Arc<ServerStats>,
    mut commands: mpsc::Receiver<EgressCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (audio, control) = match open_sockets(&config).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(id = %config.receiver_id, error = %e, "egress socket setup failed");
            return;
        }
    };

    let mut state = EgressState {
        schedule,
        delay,
        start_seq,
        stats,
        audio,
        control,
        control_seq: 0,
        lateness_ewma: Duration::ZERO,
        send_errors: 0,
        last_timestamp: 0,
        config,
    };

    state.send_start().await;

    let mut sync_tick = tokio::time::interval(SYNC_PACKET_INTERVAL);
    sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tap_open = true;

    loop {
        tokio::select! {
            item = tap.next(), if tap_open => {
                match item {
                    Some(TapItem::Frame(frame)) => state.transmit(frame).await,
                    Some(TapItem::Discontinuity { skipped }) => {
                        tracing::debug!(id = %state.config.receiver_id, skipped, "skipped forward after lag");
                    }
                    None => tap_open = false,
                }
            }
            _ = sync_tick.tick() => {
                state.send_sync().await;
            }
            command = commands.recv() => {
                match command {
                    Some(EgressCommand::Stop) | None => {
                        state.send_command(PlaybackCommand::Stop).await;
                        tracing::debug!(id = %state.config.receiver_id, "egress stopped");
                        return;
                    }
                    Some(EgressCommand::Flush { next_seq, schedule }) => {
                        tap.drain();
                        state.start_seq = next_seq;
                        state.schedule = schedule;
                        state.send_command(PlaybackCommand::Flush { next_seq }).await;
                    }
                    Some(EgressCommand::SyncCheck { reply }) => {
                        let report = state.sync_check().await;
                        let _ = reply.send(report);
                    }
                }
            }
            _ = shutdown.recv() => {
                state.send_command(PlaybackCommand::Stop).await;
                return;
            }
        }
    }
}

async fn open_sockets(config: &EgressConfig) -> std::io::Result<(UdpSocket, UdpSocket)> {
    let audio = UdpSocket::bind(("0.0.0.0", 0)).await?;
    audio.connect(config.audio_addr).await?;
    let control = UdpSocket::bind(("0.0.0.0", 0)).await?;
    control.connect(config.control_addr).await?;
    Ok((audio, control))
}

impl EgressState {
    /// Announce "start at T0" on the control channel
    async fn send_start(&mut self) {
        let lead = self
            .schedule
            .t0()
            .saturating_duration_since(Instant::now());
        let command = PlaybackCommand::Start {
            start_at: ntp_after(lead),
            start_seq: self.schedule.seq0(),
        };
        self.send_command(command).await;
    }

    async fn send_command(&mut self, command: PlaybackCommand) {
        let wire = ControlPacket::Command(command).encode(self.next_control_seq());
        let _ = self.control.send(&wire).await;
    }

    async fn send_sync(&mut self) {
        let frames_per_packet = u32::try_from(
            self.schedule.frame_duration().as_nanos() * u128::from(self.config.sample_rate)
                / 1_000_000_000,
        )
        .unwrap_or(352);
        let packet = ControlPacket::Sync {
            rtp_timestamp: self.last_timestamp,
            ntp_time: NtpTimestamp::now(),
            next_timestamp: self.last_timestamp.wrapping_add(frames_per_packet),
        };
        let wire = packet.encode(self.next_control_seq());
        let _ = self.control.send(&wire).await;
    }

    fn next_control_seq(&mut self) -> u16 {
        self.control_seq = self.control_seq.wrapping_add(1);
        self.control_seq
    }

    /// Schedule and transmit one frame.
    ///
    /// Never reorders. A frame that already missed its presentation
    /// deadline is dropped and counted; everything else is sent at
    /// `P(f, r) - lead`, preferring early over late.
    async fn transmit(&mut self, frame: AudioFrame) {
        if frame.seq < self.start_seq {
            return;
        }

        let device_delay = self.delay.lock().expect("delay lock").total();
        let target = self.schedule.presentation_time_for(frame.seq, device_delay);
        let now = Instant::now();

        if now > target {
            self.stats.record_late_frame();
            self.note_lateness(now - target);
            return;
        }

        // A frame scheduled far beyond the pre-buffer horizon means the
        // sequence domain and the schedule disagree (e.g. a flush is
        // mid-propagation); sleeping on it would stall the task
        let horizon = self.schedule.global_delay() + Duration::from_secs(2);
        if target.saturating_duration_since(now) > horizon {
            tracing::debug!(
                id = %self.config.receiver_id,
                seq = frame.seq,
                "dropping frame scheduled beyond the horizon"
            );
            return;
        }

        let send_at = target.checked_sub(SEND_LEAD).unwrap_or(target);
        if send_at > now {
            tokio::time::sleep_until(send_at).await;
        }
        self.note_lateness(Instant::now().saturating_duration_since(target));

        #[allow(clippy::cast_possible_truncation)]
        let packet = RtpPacket::audio(
            frame.seq as u16,
            frame.timestamp as u32,
            0x4D52_4F4F, // stream identity tag
            frame.pcm.to_vec(),
        );
        self.last_timestamp = frame.timestamp as u32;

        match self.audio.send(&packet.encode()).await {
            Ok(_) => {
                self.send_errors = 0;
                self.stats.record_frame_sent();
            }
            Err(e) => {
                self.send_errors = self.send_errors.saturating_add(1);
                tracing::debug!(
                    id = %self.config.receiver_id,
                    error = %e,
                    consecutive = self.send_errors,
                    "audio send failed"
                );
            }
        }
    }

    fn note_lateness(&mut self, sample: Duration) {
        // EWMA with the same 1/8 gain as the delay filter
        let old = self.lateness_ewma.as_nanos() as u64;
        let s = sample.as_nanos() as u64;
        self.lateness_ewma = Duration::from_nanos(old - (old >> 3) + (s >> 3));
    }

    /// One sync check: advanced probes the receiver clock, simple only
    /// reports local deadline adherence.
    async fn sync_check(&mut self) -> SyncReport {
        let mut rtt = None;
        let mut timing_failed = false;

        if self.config.algorithm == SyncAlgorithm::Advanced {
            match self.measure_rtt().await {
                Some(measured) => {
                    rtt = Some(measured);
                    let changed = self
                        .delay
                        .lock()
                        .expect("delay lock")
                        .update_from_rtt(measured);
                    if changed {
                        self.stats.record_sync_correction();
                    }
                }
                None => timing_failed = true,
            }
        }

        SyncReport {
            skew: self.lateness_ewma,
            rtt,
            timing_failed,
            send_errors: self.send_errors,
        }
    }

    async fn measure_rtt(&mut self) -> Option<Duration> {
        let seq = self.next_control_seq();
        let request = TimingRequest::now();
        self.control.send(&request.encode(seq)).await.ok()?;

        let deadline = Instant::now() + TIMING_REPLY_TIMEOUT;
        let mut buf = [0u8; 64];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let len = tokio::time::timeout(remaining, self.control.recv(&mut buf))
                .await
                .ok()?
                .ok()?;
            if len >= TimingResponse::SIZE && buf[1] & 0x7F == 0x53 {
                let response = TimingResponse::decode(&buf[..len]).ok()?;
                return Some(response.round_trip(NtpTimestamp::now()));
            }
            // Not a timing response (sync echo, stray datagram): keep waiting
        }
    }
}

/// NTP timestamp a duration into the future
#[allow(clippy::cast_possible_truncation)]
fn ntp_after(lead: Duration) -> NtpTimestamp {
    let micros = NtpTimestamp::now().as_micros() + u64::try_from(lead.as_micros()).unwrap_or(0);
    NtpTimestamp {
        seconds: (micros / 1_000_000) as u32,
        fraction: (((micros % 1_000_000) << 32) / 1_000_000) as u32,
    }
}
