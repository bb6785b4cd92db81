//! UDP audio intake for one recording session
//!
//! Receives RTP audio on the negotiated port, restores packet order,
//! fills losses with silence, decodes to PCM and publishes contiguous
//! [`AudioFrame`]s into the fan-out buffer. The control port answers
//! sender timing requests and absorbs sync packets.

use super::decoder::AudioDecoder;
use super::reorder::{IntakeItem, ReorderWindow, TimestampExtender};
use crate::fanout::FanoutBuffer;
use crate::protocol::rtp::packet::{PayloadType, RtpPacket};
use crate::protocol::rtp::{NtpTimestamp, TimingResponse};
use crate::protocol::sdp::StreamFormat;
use crate::stats::ServerStats;
use crate::types::AudioFrame;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

/// Commands the connection driver sends into a running intake
#[derive(Debug)]
pub enum IntakeCommand {
    /// Clear held packets and reset the sequence expectation
    Flush {
        /// New expectation from the FLUSH request, when present
        next_seq: Option<u16>,
    },
    /// Pause or resume publication
    Pause(bool),
}

/// Handle to a running intake task
#[derive(Debug, Clone)]
pub struct IntakeHandle {
    commands: mpsc::Sender<IntakeCommand>,
}

impl IntakeHandle {
    /// Send a command; a closed intake ignores it
    pub async fn send(&self, command: IntakeCommand) {
        let _ = self.commands.send(command).await;
    }
}

/// Spawn the intake task for a session entering `Recording`.
pub fn spawn_intake(
    audio_socket: UdpSocket,
    control_socket: UdpSocket,
    format: StreamFormat,
    initial_seq: Option<u16>,
    fanout: FanoutBuffer,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Receiver<()>,
) -> IntakeHandle {
    let (commands, command_rx) = mpsc::channel(8);
    tokio::spawn(run_intake(
        audio_socket,
        control_socket,
        format,
        initial_seq,
        fanout,
        stats,
        command_rx,
        shutdown,
    ));
    IntakeHandle { commands }
}

#[allow(clippy::too_many_arguments)]
async fn run_intake(
    audio_socket: UdpSocket,
    control_socket: UdpSocket,
    format: StreamFormat,
    initial_seq: Option<u16>,
    fanout: FanoutBuffer,
    stats: Arc<ServerStats>,
    mut commands: mpsc::Receiver<IntakeCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut decoder = match AudioDecoder::new(&format) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!(error = %e, "cannot start audio intake");
            return;
        }
    };

    let mut reorder = ReorderWindow::new();
    if let Some(seq) = initial_seq {
        reorder.reset_to(seq);
    }
    let mut extender = TimestampExtender::new();
    let mut frame_seq = u64::from(initial_seq.unwrap_or(0));
    let mut last_timestamp: u64 = 0;
    let mut paused = false;

    let mut audio_buf = [0u8; 8192];
    let mut control_buf = [0u8; 256];
    let mut poll_tick = tokio::time::interval(Duration::from_millis(25));
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::debug!(codec = ?format.codec, initial_seq, "audio intake running");

    loop {
        tokio::select! {
            received = audio_socket.recv_from(&mut audio_buf) => {
                let Ok((len, _)) = received else { break };
                if paused {
                    continue;
                }
                match RtpPacket::decode(&audio_buf[..len]) {
                    Ok(packet) if packet.header.payload_type == PayloadType::Audio => {
                        let items = reorder.push(
                            packet.header.sequence,
                            packet.header.timestamp,
                            packet.payload,
                            Instant::now(),
                        );
                        publish_items(
                            items,
                            &format,
                            &mut decoder,
                            &mut extender,
                            &mut frame_seq,
                            &mut last_timestamp,
                            &fanout,
                            &stats,
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed RTP packet");
                    }
                }
            }
            _ = poll_tick.tick() => {
                let items = reorder.poll(Instant::now());
                publish_items(
                    items,
                    &format,
                    &mut decoder,
                    &mut extender,
                    &mut frame_seq,
                    &mut last_timestamp,
                    &fanout,
                    &stats,
                );
            }
            received = control_socket.recv_from(&mut control_buf) => {
                if let Ok((len, from)) = received {
                    answer_control(&control_socket, &control_buf[..len], from).await;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(IntakeCommand::Flush { next_seq }) => {
                        if let Some(seq) = next_seq {
                            reorder.reset_to(seq);
                            frame_seq = u64::from(seq);
                        }
                        tracing::debug!(next_seq, "intake flushed");
                    }
                    Some(IntakeCommand::Pause(p)) => {
                        paused = p;
                    }
                    None => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    tracing::debug!(
        lost = reorder.lost_count(),
        duplicates = reorder.duplicate_count(),
        "audio intake finished"
    );
}

#[allow(clippy::too_many_arguments)]
fn publish_items(
    items: Vec<IntakeItem>,
    format: &StreamFormat,
    decoder: &mut AudioDecoder,
    extender: &mut TimestampExtender,
    frame_seq: &mut u64,
    last_timestamp: &mut u64,
    fanout: &FanoutBuffer,
    stats: &ServerStats,
) {
    for item in items {
        let frame = match item {
            IntakeItem::Packet {
                timestamp, payload, ..
            } => {
                let ts64 = extender.extend(timestamp);
                *last_timestamp = ts64;
                match decoder.decode(&payload, ts64) {
                    Ok(pcm) => {
                        let sample_count = sample_count(&pcm, format.channels);
                        AudioFrame {
                            seq: *frame_seq,
                            timestamp: ts64,
                            pcm: Bytes::from(pcm),
                            sample_count,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "decode failed, substituting silence");
                        stats.record_decode_error();
                        AudioFrame::silence(
                            *frame_seq,
                            ts64,
                            format.frames_per_packet,
                            format.channels,
                        )
                    }
                }
            }
            IntakeItem::Lost { seq } => {
                // Timestamps advance as if the packet had arrived
                let ts64 = *last_timestamp + u64::from(format.frames_per_packet);
                *last_timestamp = ts64;
                tracing::trace!(seq, "lost packet replaced with silence");
                AudioFrame::silence(*frame_seq, ts64, format.frames_per_packet, format.channels)
            }
        };
        *frame_seq += 1;
        fanout.publish(frame);
    }
}

fn sample_count(pcm: &[u8], channels: u8) -> u32 {
    let per_frame = usize::from(channels.max(1)) * 2;
    u32::try_from(pcm.len() / per_frame).unwrap_or(0)
}

/// Answer a sender timing request; ignore everything else
async fn answer_control(socket: &UdpSocket, datagram: &[u8], from: std::net::SocketAddr) {
    if datagram.len() < 32 || datagram[1] & 0x7F != 0x52 {
        return;
    }
    let mut origin = [0u8; 8];
    origin.copy_from_slice(&datagram[24..32]);
    let now = NtpTimestamp::now();
    let response = TimingResponse {
        origin_time: NtpTimestamp::decode(&origin),
        receive_time: now,
        send_time: now,
    };
    let sequence = u16::from_be_bytes([datagram[2], datagram[3]]);
    let _ = socket.send_to(&response.encode(sequence), from).await;
}
