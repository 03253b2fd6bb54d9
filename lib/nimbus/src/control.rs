//! Control stream state machine.
//!
//! Owns the control transport and the three control-plane workers: the
//! receive loop (reliable-UDP generations only), the loss-stats/ping loop
//! and the reference frame invalidation worker. Frame notifications from
//! the depayloaders come in through `ControlCore` and either mutate counters
//! or wake the invalidation worker; everything outbound funnels through the
//! transport.

use crate::config::{StreamConfig, CONTROL_PORT_ENET, CONTROL_PORT_TCP};
use crate::enet::{self, HostEvent, Link};
use crate::envelope;
use crate::health::FrameHealth;
use crate::input::InputSink;
use crate::proto::{AppVersion, Generation, Op, PACKET_TYPE_ENCRYPTED, PACKET_TYPE_PING};
use crate::queue::BlockingQueue;
use crate::shared::{
    ConnectionListener, StreamError, StreamResult, TERMINATION_GRACEFUL,
    TERMINATION_PROTECTED_CONTENT, TERMINATION_TRANSPORT_FAILURE, TERMINATION_UNEXPECTED_EARLY,
};
use crate::sync::{Event, Interrupt};
use crate::transport::{EnetChannel, Transport};
use crate::wire::SizedRead;
use basalt::crypto::GcmCipher;
use basalt::logging::{self, Logger};
use basalt::time::timestamp_millis;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};
use std::net::{IpAddr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LOSS_REPORT_INTERVAL_MS: u64 = 50;
const PERIODIC_PING_INTERVAL_MS: u64 = 250;
const CONNECT_TIMEOUT_SEC: u64 = 10;
const PEER_INACTIVITY_TIMEOUT_MS: u32 = 10_000;

// The idle sleep bounds the earliest possible retransmission after a loss
// event; keep it short.
const RECEIVE_POLL_SLEEP_MS: u64 = 10;
const DISCONNECT_DRAIN_MS: u32 = 100;
const DISCONNECT_GRACE_MS: u32 = 1000;

const INVALIDATION_QUEUE_BOUND: usize = 20;
// How far back an IDR request invalidates when no explicit range is known.
const IDR_BACKSTOP_FRAMES: i64 = 0x20;

/// Inclusive range of frames lost by the decoder, awaiting invalidation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameRange {
    pub start: i32,
    pub end: i32,
}

/// State shared between the public notification API and the worker threads.
pub(crate) struct ControlCore {
    version: AppVersion,
    generation: &'static Generation,
    transport: Transport,
    tcp_breaker: Option<TcpStream>,
    listener: Arc<dyn ConnectionListener>,
    log: Logger,

    interrupt: Interrupt,
    invalidate_event: Event,
    stopping: AtomicBool,
    terminated: AtomicBool,

    reference_frame_invalidation: bool,
    idr_frame_required: AtomicBool,
    invalidation_queue: BlockingQueue<FrameRange>,

    loss_count_since_report: AtomicI32,
    last_good_frame: AtomicI32,
    last_seen_frame: AtomicI32,
    health: Mutex<FrameHealth>,
}

impl ControlCore {
    /// Queues a lost frame range for the invalidation worker. Overflow and
    /// disabled invalidation both degrade to a full IDR request.
    pub(crate) fn detected_frame_loss(&self, start_frame: i32, end_frame: i32) {
        debug_assert!(start_frame <= end_frame);

        let range = FrameRange {
            start: start_frame,
            end: end_frame,
        };

        if queue_frame_invalidation(
            &self.invalidation_queue,
            self.reference_frame_invalidation,
            range,
        ) {
            self.idr_frame_required.store(true, Ordering::SeqCst);
        }

        self.invalidate_event.set();
    }

    /// Demands an IDR frame on behalf of the decoder.
    pub(crate) fn request_idr_on_demand(&self) {
        self.idr_frame_required.store(true, Ordering::SeqCst);
        self.invalidate_event.set();
    }

    pub(crate) fn received_complete_frame(&self, frame_index: i32) {
        self.last_good_frame.store(frame_index, Ordering::SeqCst);
        self.lock_health().received_frame();
    }

    pub(crate) fn saw_frame(&self, frame_index: i32) {
        let update = self.lock_health().saw_frame(frame_index, timestamp_millis());

        self.last_seen_frame.store(frame_index, Ordering::SeqCst);

        if let Some(status) = update {
            logging::info!(self.log, "connection status changed";
                           "context" => "health",
                           "status" => ?status);
            self.listener.connection_status_update(status);
        }
    }

    pub(crate) fn lost_packets(&self, last_received: i32, next_received: i32) {
        self.loss_count_since_report
            .fetch_add(next_received - last_received - 1, Ordering::SeqCst);
    }

    /// Reports the end of the session upward. Delivered at most once, and
    /// not at all when the shutdown was locally requested.
    fn terminate(&self, code: i32) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::info!(self.log, "connection terminated"; "context" => "control", "code" => code);
        self.listener.connection_terminated(code);
    }

    #[inline]
    fn lock_health(&self) -> MutexGuard<'_, FrameHealth> {
        self.health.lock().expect("Health mutex poisoned")
    }
}

impl InputSink for ControlCore {
    fn send_input_packet(&self, data: &[u8]) -> StreamResult<()> {
        let packet_type = self
            .generation
            .packet_type(Op::InputData)
            .ok_or(StreamError::Framing)?;
        self.transport.send_message(packet_type, data)
    }

    fn fatal(&self, code: i32) {
        self.terminate(code);
    }
}

/// The control stream. Constructed in the stopped state by `start`, torn
/// down by `stop`.
pub struct ControlStream {
    core: Arc<ControlCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ControlStream {
    /// Opens the control transport, performs the start handshake and spawns
    /// the control-plane workers. Tears down again on any failure.
    pub fn start(
        config: &StreamConfig,
        listener: Arc<dyn ConnectionListener>,
        log: Logger,
    ) -> StreamResult<ControlStream> {
        let version = config.app_version;
        let generation = Generation::select(version);

        let (transport, tcp_breaker) = open_transport(config)?;

        logging::debug!(log, "control transport connected";
                        "context" => "start",
                        "version" => ?version,
                        "reliable_udp" => version.uses_reliable_udp(),
                        "encrypted" => version.encrypted_control());

        let core = Arc::new(ControlCore {
            version,
            generation,
            transport,
            tcp_breaker,
            listener,
            log,
            interrupt: Interrupt::new(),
            invalidate_event: Event::new(),
            stopping: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            reference_frame_invalidation: config.reference_frame_invalidation,
            idr_frame_required: AtomicBool::new(false),
            invalidation_queue: BlockingQueue::new(INVALIDATION_QUEUE_BOUND),
            loss_count_since_report: AtomicI32::new(0),
            last_good_frame: AtomicI32::new(0),
            last_seen_frame: AtomicI32::new(0),
            health: Mutex::new(FrameHealth::new()),
        });

        let stream = ControlStream {
            core: core.clone(),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        // Replies only ever arrive on the reliable-UDP channel, so the
        // receive loop must be running before the handshake.
        if version.uses_reliable_udp() {
            let worker = core.clone();
            if let Err(err) = stream.spawn_worker("control-recv", move || receive_loop(&worker)) {
                stream.stop();
                return Err(err);
            }
        }

        if let Err(err) = stream.handshake() {
            logging::warn!(core.log, "start handshake failed"; "context" => "start", "error" => ?err);
            stream.stop();
            return Err(err);
        }

        let worker = core.clone();
        if let Err(err) = stream.spawn_worker("loss-stats", move || loss_stats_loop(&worker)) {
            stream.stop();
            return Err(err);
        }

        let worker = core.clone();
        if let Err(err) = stream.spawn_worker("invalidate-ref-frames", move || {
            invalidation_loop(&worker)
        }) {
            stream.stop();
            return Err(err);
        }

        Ok(stream)
    }

    /// Interrupts and joins the workers, then closes the transport. Safe to
    /// call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let core = &self.core;

        core.stopping.store(true, Ordering::SeqCst);
        core.invalidation_queue.shutdown();
        core.invalidate_event.set();
        core.interrupt.trigger();

        // Severs any blocking read on the request/reply socket.
        if let Some(breaker) = &core.tcp_breaker {
            let _ = breaker.shutdown(std::net::Shutdown::Both);
        }

        let workers: Vec<_> = self
            .threads
            .lock()
            .expect("Thread list mutex poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }

        if let Some(channel) = core.transport.enet() {
            channel
                .lock()
                .expect("Transport mutex poisoned")
                .link
                .close();
        }

        logging::debug!(core.log, "control stream stopped"; "context" => "stop");
    }

    /// Shared state handle for the session wrapper and the input plane.
    pub(crate) fn core(&self) -> &Arc<ControlCore> {
        &self.core
    }

    fn handshake(&self) -> StreamResult<()> {
        let core = &self.core;

        let start_a = core
            .generation
            .packet_type(Op::StartA)
            .expect("Start A must be defined for every generation");
        core.transport
            .send_and_discard_reply(start_a, core.generation.preconstructed(Op::StartA))?;

        logging::debug!(core.log, "start A acknowledged"; "context" => "start");

        let start_b = core
            .generation
            .packet_type(Op::StartB)
            .expect("Start B must be defined for every generation");
        core.transport
            .send_and_discard_reply(start_b, core.generation.preconstructed(Op::StartB))?;

        logging::debug!(core.log, "start B acknowledged"; "context" => "start");

        Ok(())
    }

    fn spawn_worker<F>(&self, name: &str, body: F) -> StreamResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(name.to_owned()).spawn(body) {
            Ok(handle) => {
                self.threads
                    .lock()
                    .expect("Thread list mutex poisoned")
                    .push(handle);
                Ok(())
            }
            Err(_) => Err(StreamError::Thread),
        }
    }
}

impl Drop for ControlStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_transport(config: &StreamConfig) -> StreamResult<(Transport, Option<TcpStream>)> {
    let version = config.app_version;

    if version.uses_reliable_udp() {
        let ip = match config.remote_addr {
            IpAddr::V4(ip) => ip,
            // The reliable-UDP library binds IPv4 only.
            IpAddr::V6(_) => return Err(StreamError::Transport(io::ErrorKind::AddrNotAvailable)),
        };

        let mut link = Link::connect(
            SocketAddrV4::new(ip, CONTROL_PORT_ENET),
            CONNECT_TIMEOUT_SEC as u32 * 1000,
        )?;
        link.set_peer_timeout(
            enet::PEER_TIMEOUT_LIMIT,
            enet::PEER_TIMEOUT_MINIMUM,
            PEER_INACTIVITY_TIMEOUT_MS,
        );
        link.install_disconnect_hold();

        let cipher = if version.encrypted_control() {
            Some(GcmCipher::new(&config.remote_input_aes_key))
        } else {
            None
        };

        Ok((
            Transport::Enet {
                channel: Mutex::new(EnetChannel {
                    link,
                    sequence: 0,
                    cipher,
                }),
            },
            None,
        ))
    } else {
        let addr = SocketAddr::new(config.remote_addr, CONTROL_PORT_TCP);
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_secs(CONNECT_TIMEOUT_SEC))?;
        stream.set_nodelay(true)?;

        let breaker = stream.try_clone()?;

        Ok((
            Transport::Tcp {
                stream: Mutex::new(stream),
            },
            Some(breaker),
        ))
    }
}

fn receive_loop(core: &Arc<ControlCore>) {
    let channel = match core.transport.enet() {
        Some(channel) => channel,
        None => return,
    };

    while !core.interrupt.is_set() {
        let serviced = {
            let mut guard = lock_channel(channel);
            guard.link.service(0)
        };

        let event = match serviced {
            Ok(Some(event)) => event,
            Ok(None) => {
                let pending = lock_channel(channel).link.disconnect_pending();
                if !pending {
                    core.interrupt
                        .sleep(Duration::from_millis(RECEIVE_POLL_SLEEP_MS));
                    continue;
                }

                // Drain receives buffered behind the held disconnect, then
                // give the real disconnect a grace window before declaring
                // the peer gone.
                let drained = {
                    let mut guard = lock_channel(channel);
                    let timeout = if guard.link.holding_disconnect() {
                        DISCONNECT_DRAIN_MS
                    } else {
                        DISCONNECT_GRACE_MS
                    };

                    match guard.link.service(timeout) {
                        Ok(Some(event)) => Some(event),
                        Ok(None) => {
                            if guard.link.holding_disconnect() {
                                guard.link.remove_disconnect_hold();
                                None
                            } else {
                                drop(guard);
                                logging::info!(core.log, "disconnect grace window expired";
                                               "context" => "receive");
                                core.terminate(TERMINATION_TRANSPORT_FAILURE);
                                return;
                            }
                        }
                        Err(err) => {
                            drop(guard);
                            logging::warn!(core.log, "control channel failed";
                                           "context" => "receive",
                                           "error" => ?err);
                            core.terminate(TERMINATION_TRANSPORT_FAILURE);
                            return;
                        }
                    }
                };

                match drained {
                    Some(event) => event,
                    None => continue,
                }
            }
            Err(err) => {
                logging::warn!(core.log, "control channel failed";
                               "context" => "receive",
                               "error" => ?err);
                core.terminate(TERMINATION_TRANSPORT_FAILURE);
                return;
            }
        };

        match event {
            HostEvent::Receive(packet) => {
                if handle_control_packet(core, channel, packet) {
                    return;
                }
            }
            HostEvent::Disconnect => {
                logging::warn!(core.log, "unexpected disconnect event"; "context" => "receive");
                core.terminate(TERMINATION_TRANSPORT_FAILURE);
                return;
            }
            HostEvent::Connect => {}
        }
    }
}

// Dispatches one received control packet. Returns true when the receive
// thread must exit because the peer terminated the session.
fn handle_control_packet(
    core: &Arc<ControlCore>,
    channel: &Mutex<EnetChannel>,
    packet: Vec<u8>,
) -> bool {
    if packet.len() < envelope::HEADER_V1_SIZE {
        logging::info!(core.log, "discarding runt control packet";
                       "context" => "receive",
                       "length" => packet.len());
        return false;
    }

    let frame = if core.version.encrypted_control() {
        if envelope::frame_type(&packet) != PACKET_TYPE_ENCRYPTED {
            logging::warn!(core.log, "discarding plaintext packet on encrypted stream";
                           "context" => "receive",
                           "packet_type" => envelope::frame_type(&packet));
            return false;
        }

        // The cipher context shares the channel mutex with the host.
        let opened = {
            let guard = lock_channel(channel);
            let cipher = guard
                .cipher
                .as_ref()
                .expect("Encrypted control stream must have a cipher");
            envelope::open(cipher, &packet)
        };

        match opened {
            Ok(frame) => frame,
            Err(err) => {
                logging::warn!(core.log, "discarding undecryptable control packet";
                               "context" => "receive",
                               "length" => packet.len(),
                               "error" => ?err);
                return false;
            }
        }
    } else {
        packet
    };

    let packet_type = envelope::frame_type(&frame);
    let payload = &frame[envelope::HEADER_V1_SIZE..];

    if Some(packet_type) == core.generation.packet_type(Op::RumbleData) {
        match parse_rumble(payload) {
            Some((controller, low_freq, high_freq)) => {
                core.listener.rumble(controller, low_freq, high_freq)
            }
            None => logging::info!(core.log, "discarding runt rumble packet";
                                   "context" => "receive",
                                   "length" => payload.len()),
        }
        false
    } else if Some(packet_type) == core.generation.packet_type(Op::Termination) {
        let saw_frames = core.last_seen_frame.load(Ordering::SeqCst) != 0;
        let code = map_termination(payload, saw_frames);

        logging::info!(core.log, "server notified termination";
                       "context" => "receive",
                       "code" => code);
        core.terminate(code);
        true
    } else {
        logging::trace!(core.log, "ignoring control packet";
                        "context" => "receive",
                        "packet_type" => packet_type);
        false
    }
}

fn loss_stats_loop(core: &Arc<ControlCore>) {
    if core.version.periodic_ping() {
        let payload = ping_payload();

        while !core.interrupt.is_set() {
            if core
                .transport
                .send_message(PACKET_TYPE_PING, &payload)
                .is_err()
            {
                logging::warn!(core.log, "heartbeat ping failed"; "context" => "loss_stats");
                core.terminate(TERMINATION_TRANSPORT_FAILURE);
                return;
            }

            core.interrupt
                .sleep(Duration::from_millis(PERIODIC_PING_INTERVAL_MS));
        }
    } else {
        let packet_type = core
            .generation
            .packet_type(Op::LossStats)
            .expect("Loss stats must be defined for every generation");

        while !core.interrupt.is_set() {
            let payload = loss_stats_payload(
                core.loss_count_since_report.load(Ordering::SeqCst),
                core.last_good_frame.load(Ordering::SeqCst),
            );

            if core.transport.send_message(packet_type, &payload).is_err() {
                logging::warn!(core.log, "loss report failed"; "context" => "loss_stats");
                core.terminate(TERMINATION_TRANSPORT_FAILURE);
                return;
            }

            core.loss_count_since_report.store(0, Ordering::SeqCst);

            core.interrupt
                .sleep(Duration::from_millis(LOSS_REPORT_INTERVAL_MS));
        }
    }
}

fn invalidation_loop(core: &Arc<ControlCore>) {
    loop {
        core.invalidate_event.wait_and_clear();

        if core.stopping.load(Ordering::SeqCst) || core.interrupt.is_set() {
            return;
        }

        if core.idr_frame_required.swap(false, Ordering::SeqCst) {
            // Pending ranges are superseded by the full resync.
            core.invalidation_queue.drain();
            request_idr_frame(core);
        } else {
            request_invalidation(core);
        }
    }
}

fn request_idr_frame(core: &Arc<ControlCore>) {
    let result = if core.version.uses_reliable_udp() {
        let last_seen = i64::from(core.last_seen_frame.load(Ordering::SeqCst));
        let (start, end) = idr_request_range(last_seen);

        let packet_type = core
            .generation
            .packet_type(Op::InvalidateRefFrames)
            .expect("Invalidation must be defined for every generation");

        core.transport
            .send_and_discard_reply(packet_type, &invalidate_payload(start, end))
    } else {
        // Gen3/4 reuse the Start A slot as the legacy IDR frame request.
        let packet_type = core
            .generation
            .packet_type(Op::StartA)
            .expect("IDR request must be defined for every generation");

        core.transport
            .send_and_discard_reply(packet_type, core.generation.preconstructed(Op::StartA))
    };

    match result {
        Ok(()) => logging::debug!(core.log, "IDR frame request sent"; "context" => "invalidate"),
        Err(err) => {
            logging::warn!(core.log, "IDR frame request failed";
                           "context" => "invalidate",
                           "error" => ?err);
            core.terminate(TERMINATION_TRANSPORT_FAILURE);
        }
    }
}

fn request_invalidation(core: &Arc<ControlCore>) {
    let range = match coalesce_ranges(&core.invalidation_queue) {
        Some(range) => range,
        None => return,
    };

    let packet_type = core
        .generation
        .packet_type(Op::InvalidateRefFrames)
        .expect("Invalidation must be defined for every generation");

    let payload = invalidate_payload(i64::from(range.start), i64::from(range.end));

    match core.transport.send_and_discard_reply(packet_type, &payload) {
        Ok(()) => logging::debug!(core.log, "reference frame invalidation sent";
                                  "context" => "invalidate",
                                  "start" => range.start,
                                  "end" => range.end),
        Err(err) => {
            logging::warn!(core.log, "reference frame invalidation failed";
                           "context" => "invalidate",
                           "error" => ?err);
            core.terminate(TERMINATION_TRANSPORT_FAILURE);
        }
    }
}

#[inline]
fn lock_channel(channel: &Mutex<EnetChannel>) -> MutexGuard<'_, EnetChannel> {
    channel.lock().expect("Transport mutex poisoned")
}

// Returns true when the loss must degrade to a full IDR request instead of
// a queued range.
fn queue_frame_invalidation(
    queue: &BlockingQueue<FrameRange>,
    invalidation_enabled: bool,
    range: FrameRange,
) -> bool {
    if !invalidation_enabled {
        return true;
    }

    queue.offer(range).is_err()
}

/// Folds every queued range into a single request spanning the first start
/// and the furthest end.
fn coalesce_ranges(queue: &BlockingQueue<FrameRange>) -> Option<FrameRange> {
    let mut range = queue.poll()?;

    while let Some(next) = queue.poll() {
        if next.end > range.end {
            range.end = next.end;
        }
    }

    Some(range)
}

/// Invalidation range for an IDR request synthesized without explicit loss
/// information.
fn idr_request_range(last_seen_frame: i64) -> (i64, i64) {
    if last_seen_frame < IDR_BACKSTOP_FRAMES {
        (0, last_seen_frame)
    } else {
        (last_seen_frame - IDR_BACKSTOP_FRAMES, last_seen_frame)
    }
}

/// `[start][end][0]` as 64 bit big-endian fields.
fn invalidate_payload(start_frame: i64, end_frame: i64) -> [u8; 24] {
    let mut payload = [0u8; 24];
    BigEndian::write_i64(&mut payload[0..8], start_frame);
    BigEndian::write_i64(&mut payload[8..16], end_frame);
    payload
}

/// 32 byte little-endian loss report.
fn loss_stats_payload(loss_count: i32, last_good_frame: i32) -> [u8; 32] {
    let mut payload = [0u8; 32];
    {
        let mut cursor = Cursor::new(&mut payload[..]);
        cursor
            .write_i32::<LittleEndian>(loss_count)
            .expect("Error writing loss report");
        cursor
            .write_u32::<LittleEndian>(LOSS_REPORT_INTERVAL_MS as u32)
            .expect("Error writing loss report");
        cursor
            .write_u32::<LittleEndian>(1000)
            .expect("Error writing loss report");
        cursor
            .write_u64::<LittleEndian>(last_good_frame as u64)
            .expect("Error writing loss report");
        cursor
            .write_u32::<LittleEndian>(0)
            .expect("Error writing loss report");
        cursor
            .write_u32::<LittleEndian>(0)
            .expect("Error writing loss report");
        cursor
            .write_u32::<LittleEndian>(0x14)
            .expect("Error writing loss report");
    }
    payload
}

/// 8 byte heartbeat payload: a 16 bit length followed by a zero timestamp.
fn ping_payload() -> [u8; 8] {
    let mut payload = [0u8; 8];
    {
        let mut cursor = Cursor::new(&mut payload[..]);
        cursor
            .write_u16::<LittleEndian>(4)
            .expect("Error writing ping");
        cursor
            .write_u32::<LittleEndian>(0)
            .expect("Error writing ping");
    }
    payload
}

// Rumble payload: four opaque bytes, then controller number and the two
// motor intensities, little endian.
fn parse_rumble(payload: &[u8]) -> Option<(u16, u16, u16)> {
    let mut cursor = Cursor::new(payload);

    if cursor.remaining_data() < 10 {
        return None;
    }

    cursor.set_position(4);

    let controller = cursor.read_u16::<LittleEndian>().ok()?;
    let low_freq = cursor.read_u16::<LittleEndian>().ok()?;
    let high_freq = cursor.read_u16::<LittleEndian>().ok()?;

    Some((controller, low_freq, high_freq))
}

// The extended termination form carries a full 32 bit status and is
// distinguished from the short form by packet length alone.
fn map_termination(payload: &[u8], saw_frames: bool) -> i32 {
    if payload.len() >= 4 {
        let code = BigEndian::read_u32(&payload[0..4]);
        match code {
            // The peer's expected shutdown path.
            0x8003_0023 => graceful_or_early(saw_frames),
            // Protected content on screen.
            0x800e_9302 => TERMINATION_PROTECTED_CONTENT,
            other => other as i32,
        }
    } else if payload.len() >= 2 {
        let reason = LittleEndian::read_u16(&payload[0..2]);
        if reason == 0x0100 {
            graceful_or_early(saw_frames)
        } else {
            i32::from(reason)
        }
    } else {
        TERMINATION_TRANSPORT_FAILURE
    }
}

fn graceful_or_early(saw_frames: bool) -> i32 {
    if saw_frames {
        TERMINATION_GRACEFUL
    } else {
        TERMINATION_UNEXPECTED_EARLY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_ranges_spans_first_start_to_furthest_end() {
        let queue = BlockingQueue::new(INVALIDATION_QUEUE_BOUND);

        queue.offer(FrameRange { start: 10, end: 12 }).unwrap();
        queue.offer(FrameRange { start: 15, end: 20 }).unwrap();
        queue.offer(FrameRange { start: 22, end: 22 }).unwrap();

        assert_eq!(
            coalesce_ranges(&queue),
            Some(FrameRange { start: 10, end: 22 })
        );
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_coalesce_ranges_empty_queue() {
        let queue: BlockingQueue<FrameRange> = BlockingQueue::new(INVALIDATION_QUEUE_BOUND);

        assert_eq!(coalesce_ranges(&queue), None);
    }

    #[test]
    fn test_coalesce_ranges_keeps_furthest_end() {
        let queue = BlockingQueue::new(INVALIDATION_QUEUE_BOUND);

        queue.offer(FrameRange { start: 5, end: 30 }).unwrap();
        queue.offer(FrameRange { start: 8, end: 9 }).unwrap();

        assert_eq!(
            coalesce_ranges(&queue),
            Some(FrameRange { start: 5, end: 30 })
        );
    }

    #[test]
    fn test_queue_overflow_degrades_to_idr() {
        let queue = BlockingQueue::new(INVALIDATION_QUEUE_BOUND);

        for i in 0..INVALIDATION_QUEUE_BOUND as i32 {
            assert!(!queue_frame_invalidation(
                &queue,
                true,
                FrameRange { start: i, end: i }
            ));
        }

        // The 21st range does not fit and must force a full resync.
        assert!(queue_frame_invalidation(
            &queue,
            true,
            FrameRange {
                start: 100,
                end: 101
            }
        ));
        assert_eq!(queue.len(), INVALIDATION_QUEUE_BOUND);
    }

    #[test]
    fn test_disabled_invalidation_always_demands_idr() {
        let queue = BlockingQueue::new(INVALIDATION_QUEUE_BOUND);

        assert!(queue_frame_invalidation(
            &queue,
            false,
            FrameRange { start: 1, end: 2 }
        ));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_idr_request_range_clamps_to_zero() {
        assert_eq!(idr_request_range(5), (0, 5));
        assert_eq!(idr_request_range(0x1f), (0, 0x1f));
        assert_eq!(idr_request_range(0x20), (0, 0x20));
        assert_eq!(idr_request_range(100), (68, 100));
    }

    #[test]
    fn test_invalidate_payload_is_big_endian() {
        let payload = invalidate_payload(10, 22);

        assert_eq!(&payload[0..8], &[0, 0, 0, 0, 0, 0, 0, 10]);
        assert_eq!(&payload[8..16], &[0, 0, 0, 0, 0, 0, 0, 22]);
        assert_eq!(&payload[16..24], &[0; 8]);
    }

    #[test]
    fn test_loss_stats_payload_layout() {
        let payload = loss_stats_payload(7, 1234);

        assert_eq!(LittleEndian::read_i32(&payload[0..4]), 7);
        assert_eq!(LittleEndian::read_u32(&payload[4..8]), 50);
        assert_eq!(LittleEndian::read_u32(&payload[8..12]), 1000);
        assert_eq!(LittleEndian::read_u64(&payload[12..20]), 1234);
        assert_eq!(LittleEndian::read_u32(&payload[20..24]), 0);
        assert_eq!(LittleEndian::read_u32(&payload[24..28]), 0);
        assert_eq!(LittleEndian::read_u32(&payload[28..32]), 0x14);
    }

    #[test]
    fn test_ping_payload_layout() {
        assert_eq!(ping_payload(), [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_rumble() {
        let mut payload = vec![0u8; 10];
        LittleEndian::write_u16(&mut payload[4..6], 2);
        LittleEndian::write_u16(&mut payload[6..8], 0x8000);
        LittleEndian::write_u16(&mut payload[8..10], 0x4000);

        assert_eq!(parse_rumble(&payload), Some((2, 0x8000, 0x4000)));
    }

    #[test]
    fn test_parse_rumble_rejects_runt() {
        assert_eq!(parse_rumble(&[0; 9]), None);
    }

    #[test]
    fn test_map_termination_short_graceful_after_frames() {
        assert_eq!(map_termination(&[0x00, 0x01], true), TERMINATION_GRACEFUL);
    }

    #[test]
    fn test_map_termination_short_early_without_frames() {
        assert_eq!(
            map_termination(&[0x00, 0x01], false),
            TERMINATION_UNEXPECTED_EARLY
        );
    }

    #[test]
    fn test_map_termination_short_passthrough() {
        assert_eq!(map_termination(&[0x02, 0x01], true), 0x0102);
    }

    #[test]
    fn test_map_termination_extended_graceful() {
        let payload = [0x80, 0x03, 0x00, 0x23];

        assert_eq!(map_termination(&payload, true), TERMINATION_GRACEFUL);
        assert_eq!(map_termination(&payload, false), TERMINATION_UNEXPECTED_EARLY);
    }

    #[test]
    fn test_map_termination_extended_protected_content() {
        let payload = [0x80, 0x0e, 0x93, 0x02];

        assert_eq!(map_termination(&payload, true), TERMINATION_PROTECTED_CONTENT);
    }

    #[test]
    fn test_map_termination_extended_passthrough() {
        let payload = [0x80, 0x00, 0x00, 0x01];

        assert_eq!(map_termination(&payload, true), 0x8000_0001u32 as i32);
    }

    #[test]
    fn test_map_termination_runt() {
        assert_eq!(map_termination(&[0x01], true), TERMINATION_TRANSPORT_FAILURE);
    }
}
