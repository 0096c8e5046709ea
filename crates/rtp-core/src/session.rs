//! Paced RTP media session
//!
//! One session per answered dialog. The socket is bound (and its port
//! leased) before the INVITE goes out so the SDP offer can carry the
//! port; streaming starts once the answer tells us where the far end
//! listens. Outbound audio is paced at one 160-byte G.711 frame every
//! 20 ms, with silence injected before the announcement and after it
//! runs out so the packet clock never stalls. The inbound task watches
//! for telephone-event packets and forwards de-duplicated digit
//! observations to the dialog layer.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dtmf::{DtmfDeduper, TelephoneEvent};
use crate::g711::ALAW_SILENCE;
use crate::packet::{PayloadKind, RtpHeader, RtpPacket};
use crate::port::{PortAllocator, PortRange};
use crate::{Result, RtpTimestamp, FRAME_SIZE, PTIME_MS, SAMPLES_PER_PACKET};

/// A single de-duplicated DTMF key press seen on the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfObservation {
    pub digit: char,
    pub event: u8,
    /// RTP timestamp of the press, the de-duplication key
    pub timestamp: RtpTimestamp,
    /// Press length in timestamp units
    pub duration: u16,
}

/// Streaming parameters for one call
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Payload type for outbound audio (8 = PCMA)
    pub payload_type: u8,
    /// Silence lead-in before the announcement starts
    pub preroll: Duration,
    /// How many times the announcement is played back to back
    pub repeat: u32,
    /// Trailing silence keepalive after the last repeat; the sender
    /// task stops once this runs out (call timers end the call first
    /// in practice)
    pub max_trailing_silence: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            payload_type: crate::packet::PT_PCMA,
            preroll: Duration::from_secs(2),
            repeat: 3,
            max_trailing_silence: Duration::from_secs(60),
        }
    }
}

/// Counters published by the send/receive tasks
#[derive(Debug, Default)]
struct SessionCounters {
    packets_sent: AtomicU64,
    silence_packets: AtomicU64,
    packets_received: AtomicU64,
    dtmf_observed: AtomicU64,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub silence_packets: u64,
    pub packets_received: u64,
    pub dtmf_observed: u64,
}

/// Per-call RTP endpoint
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    ssrc: u32,
    allocator: PortAllocator,
    /// Taken on first release so the port goes back exactly once
    lease: Mutex<Option<u16>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<SessionCounters>,
}

impl RtpSession {
    /// Lease a port from `range` and bind the session socket.
    ///
    /// `is_live` is consulted only when the range is exhausted, to sweep
    /// leases whose call has ended. A port whose bind fails is released
    /// and the next one tried; a handful of failures in a row means the
    /// host networking is broken and the error propagates.
    pub async fn bind<F>(
        allocator: &PortAllocator,
        range: PortRange,
        owner: &str,
        local_ip: IpAddr,
        is_live: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let mut last_err = None;
        for _ in 0..5 {
            let port = allocator.allocate(range, owner, &is_live);
            match UdpSocket::bind(SocketAddr::new(local_ip, port)).await {
                Ok(socket) => {
                    debug!("RTP session for {} bound on port {}", owner, port);
                    return Ok(Self {
                        socket: Arc::new(socket),
                        ssrc: rand::thread_rng().gen(),
                        allocator: allocator.clone(),
                        lease: Mutex::new(Some(port)),
                        send_task: Mutex::new(None),
                        recv_task: Mutex::new(None),
                        counters: Arc::new(SessionCounters::default()),
                    });
                }
                Err(e) => {
                    warn!("bind failed on leased RTP port {}: {}", port, e);
                    allocator.release(port);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(crate::Error::Io)
            .unwrap_or_else(|| crate::Error::Session("no bindable RTP port".into())))
    }

    /// The locally bound port, for embedding in the SDP offer
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Start streaming `audio` (raw G.711 bytes) to `remote` and
    /// watching for inbound DTMF.
    ///
    /// Digit observations go out on `dtmf_tx`. Calling `start` twice
    /// replaces the previous tasks.
    pub fn start(
        &self,
        remote: SocketAddr,
        audio: Bytes,
        config: StreamConfig,
        dtmf_tx: mpsc::UnboundedSender<DtmfObservation>,
    ) {
        let send = tokio::spawn(send_loop(
            self.socket.clone(),
            remote,
            audio,
            config,
            self.ssrc,
            self.counters.clone(),
        ));
        let recv = tokio::spawn(recv_loop(
            self.socket.clone(),
            dtmf_tx,
            self.counters.clone(),
        ));

        if let Some(old) = self.send_task.lock().replace(send) {
            old.abort();
        }
        if let Some(old) = self.recv_task.lock().replace(recv) {
            old.abort();
        }
    }

    /// Snapshot the session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            silence_packets: self.counters.silence_packets.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            dtmf_observed: self.counters.dtmf_observed.load(Ordering::Relaxed),
        }
    }

    /// Stop both tasks and release the port lease. Safe to call more
    /// than once.
    pub fn close(&self) {
        if let Some(task) = self.send_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if let Some(port) = self.lease.lock().take() {
            self.allocator.release(port);
        }
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sequence of 160-byte frames for one playback: preroll silence, the
/// announcement repeated, then bounded trailing silence.
fn frame_at(audio: &Bytes, config: &StreamConfig, index: u64) -> Option<Bytes> {
    static SILENCE: once_cell::sync::Lazy<Bytes> =
        once_cell::sync::Lazy::new(|| Bytes::from(vec![ALAW_SILENCE; FRAME_SIZE]));

    let preroll_frames = config.preroll.as_millis() as u64 / PTIME_MS as u64;
    if index < preroll_frames {
        return Some(SILENCE.clone());
    }

    let audio_frames = (audio.len() as u64).div_ceil(FRAME_SIZE as u64);
    let total_audio = audio_frames * config.repeat as u64;
    let offset = index - preroll_frames;
    if offset < total_audio {
        let frame = offset % audio_frames;
        let start = (frame as usize) * FRAME_SIZE;
        let end = (start + FRAME_SIZE).min(audio.len());
        if end - start == FRAME_SIZE {
            return Some(audio.slice(start..end));
        }
        // Pad the final partial frame with silence
        let mut padded = Vec::with_capacity(FRAME_SIZE);
        padded.extend_from_slice(&audio[start..end]);
        padded.resize(FRAME_SIZE, ALAW_SILENCE);
        return Some(Bytes::from(padded));
    }

    let trailing_frames = config.max_trailing_silence.as_millis() as u64 / PTIME_MS as u64;
    if offset - total_audio < trailing_frames {
        return Some(SILENCE.clone());
    }
    None
}

/// Whether the frame at `index` is injected silence rather than audio
fn is_silence_frame(audio: &Bytes, config: &StreamConfig, index: u64) -> bool {
    let preroll_frames = config.preroll.as_millis() as u64 / PTIME_MS as u64;
    if index < preroll_frames {
        return true;
    }
    let audio_frames = (audio.len() as u64).div_ceil(FRAME_SIZE as u64);
    index - preroll_frames >= audio_frames * config.repeat as u64
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    audio: Bytes,
    config: StreamConfig,
    ssrc: u32,
    counters: Arc<SessionCounters>,
) {
    // ThreadRng must not live across an await point
    let (mut seq, mut timestamp): (u16, u32) = {
        let mut rng = rand::thread_rng();
        (rng.gen(), rng.gen())
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(PTIME_MS as u64));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut index: u64 = 0;
    loop {
        ticker.tick().await;

        let Some(payload) = frame_at(&audio, &config, index) else {
            debug!("RTP sender to {} finished after {} frames", remote, index);
            return;
        };

        let mut header = RtpHeader::new(config.payload_type, seq, timestamp, ssrc);
        // Marker flags the start of the talkspurt
        header.marker = index == 0;

        let packet = RtpPacket {
            header,
            payload: payload.clone(),
        };
        if let Err(e) = socket.send_to(&packet.serialize(), remote).await {
            warn!("RTP send to {} failed: {}", remote, e);
        } else {
            counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            if is_silence_frame(&audio, &config, index) {
                counters.silence_packets.fetch_add(1, Ordering::Relaxed);
            }
        }

        seq = seq.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        index += 1;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    dtmf_tx: mpsc::UnboundedSender<DtmfObservation>,
    counters: Arc<SessionCounters>,
) {
    let mut buf = vec![0u8; 2048];
    let mut deduper = DtmfDeduper::new();

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("RTP receive error: {}", e);
                return;
            }
        };

        // Malformed datagrams are dropped without affecting the call
        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                trace!("dropping malformed RTP datagram from {}: {}", from, e);
                continue;
            }
        };
        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        if packet.payload_kind() != PayloadKind::TelephoneEvent {
            continue;
        }
        let event = match TelephoneEvent::parse(&packet.payload) {
            Ok(ev) => ev,
            Err(e) => {
                trace!("dropping malformed telephone-event from {}: {}", from, e);
                continue;
            }
        };

        // Interim reports and retransmitted end packets are noise
        if !event.end || !deduper.accept(event.event, packet.header.timestamp) {
            continue;
        }
        let Some(digit) = event.digit() else {
            continue;
        };

        counters.dtmf_observed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "DTMF digit {} observed from {} (ts {})",
            digit, from, packet.header.timestamp
        );
        let _ = dtmf_tx.send(DtmfObservation {
            digit,
            event: event.event,
            timestamp: packet.header.timestamp,
            duration: event.duration,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn test_session(pool: &PortAllocator) -> RtpSession {
        RtpSession::bind(pool, PortRange::for_instance(0), "call-1", LOCALHOST, |_| true)
            .await
            .unwrap()
    }

    #[test]
    fn test_frame_sequence() {
        let config = StreamConfig {
            payload_type: 8,
            preroll: Duration::from_millis(40),
            repeat: 2,
            max_trailing_silence: Duration::from_millis(40),
        };
        // One full frame plus a partial one
        let audio = Bytes::from(vec![0x11u8; FRAME_SIZE + 10]);

        // 2 preroll + 2 frames x 2 repeats + 2 trailing
        for i in 0..2 {
            assert!(is_silence_frame(&audio, &config, i));
            assert_eq!(frame_at(&audio, &config, i).unwrap()[0], ALAW_SILENCE);
        }
        for i in 2..6 {
            assert!(!is_silence_frame(&audio, &config, i));
            let frame = frame_at(&audio, &config, i).unwrap();
            assert_eq!(frame.len(), FRAME_SIZE);
        }
        // Partial frame is padded out with silence
        let partial = frame_at(&audio, &config, 3).unwrap();
        assert_eq!(partial[0], 0x11);
        assert_eq!(partial[10], ALAW_SILENCE);

        for i in 6..8 {
            assert!(is_silence_frame(&audio, &config, i));
        }
        assert!(frame_at(&audio, &config, 8).is_none());
    }

    #[tokio::test]
    async fn test_streams_paced_audio() {
        let pool = PortAllocator::new();
        let session = test_session(&pool).await;

        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let config = StreamConfig {
            payload_type: 8,
            preroll: Duration::ZERO,
            repeat: 1,
            max_trailing_silence: Duration::ZERO,
        };
        let audio = Bytes::from(vec![0x2Au8; FRAME_SIZE * 3]);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start(peer_addr, audio, config, tx);

        let mut buf = [0u8; 2048];
        let mut last_seq = None;
        for i in 0..3 {
            let len = timeout(Duration::from_secs(2), peer.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = RtpPacket::parse(&buf[..len]).unwrap();
            assert_eq!(packet.header.payload_type, 8);
            assert_eq!(packet.header.marker, i == 0);
            assert_eq!(packet.payload.len(), FRAME_SIZE);
            if let Some(prev) = last_seq {
                assert_eq!(packet.header.sequence_number, u16::wrapping_add(prev, 1));
            }
            last_seq = Some(packet.header.sequence_number);
        }

        let stats = session.stats();
        assert!(stats.packets_sent >= 3);
        assert_eq!(stats.silence_packets, 0);
        session.close();
    }

    #[tokio::test]
    async fn test_inbound_dtmf_deduplicated() {
        let pool = PortAllocator::new();
        let session = test_session(&pool).await;
        let session_addr = SocketAddr::new(LOCALHOST, session.local_port().unwrap());

        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(
            SocketAddr::new(LOCALHOST, peer.local_addr().unwrap().port()),
            Bytes::new(),
            StreamConfig {
                preroll: Duration::ZERO,
                max_trailing_silence: Duration::ZERO,
                ..StreamConfig::default()
            },
            tx,
        );

        // Digit 1 press: one interim report, then three end reports
        let ts = 48000u32;
        let interim = RtpPacket {
            header: RtpHeader::new(101, 10, ts, 0xABCD),
            payload: TelephoneEvent {
                event: 1,
                end: false,
                volume: 10,
                duration: 160,
            }
            .serialize(),
        };
        peer.send_to(&interim.serialize(), session_addr).await.unwrap();
        for seq in 11..14u16 {
            let end = RtpPacket {
                header: RtpHeader::new(101, seq, ts, 0xABCD),
                payload: TelephoneEvent {
                    event: 1,
                    end: true,
                    volume: 10,
                    duration: 800,
                }
                .serialize(),
            };
            peer.send_to(&end.serialize(), session_addr).await.unwrap();
        }

        let obs = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.digit, '1');
        assert_eq!(obs.timestamp, ts);

        // The retransmitted ends must not produce further observations
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "duplicate end-of-event leaked through"
        );
        session.close();
    }

    #[tokio::test]
    async fn test_sender_future_is_spawnable() {
        // send_loop is handed to tokio::spawn, so its future must be
        // Send; this fails to compile if a non-Send binding (like a
        // thread-local rng) is held across one of its await points
        fn spawnable<F>(f: F) -> F
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
            f
        }
        let socket = Arc::new(UdpSocket::bind((LOCALHOST, 0)).await.unwrap());
        let fut = spawnable(send_loop(
            socket,
            SocketAddr::new(LOCALHOST, 9),
            Bytes::new(),
            StreamConfig::default(),
            7,
            Arc::new(SessionCounters::default()),
        ));
        drop(fut);
    }

    #[tokio::test]
    async fn test_close_releases_port_once() {
        let pool = PortAllocator::new();
        let session = test_session(&pool).await;
        assert_eq!(pool.leased_count(), 1);
        session.close();
        session.close();
        assert_eq!(pool.leased_count(), 0);
    }
}
