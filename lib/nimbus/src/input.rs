//! Input plane: typed input packets, the bounded send queue, the batching
//! rules and the legacy encryption path.
//!
//! Callers enqueue typed events; the send thread drains the queue, batches
//! adjacent packets of the same kind, and either forwards plaintext to the
//! control stream (encrypted control generations), seals packets itself and
//! forwards them (Gen5-7), or writes them to the dedicated input socket
//! (Gen3/4).

use crate::config::{StreamConfig, INPUT_PORT_TCP};
use crate::proto::AppVersion;
use crate::queue::BlockingQueue;
use crate::shared::{StreamError, StreamResult, TERMINATION_TRANSPORT_FAILURE};
use basalt::crypto::{CbcCipher, GcmCipher, GCM_TAG_SIZE, IV_SIZE, KEY_SIZE};
use basalt::logging::{self, Logger};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const INPUT_QUEUE_BOUND: usize = 30;
const CONNECT_TIMEOUT_SEC: u64 = 10;

pub const PACKET_TYPE_KEYBOARD: u32 = 0x0a03;
pub const PACKET_TYPE_MOUSE_BUTTON: u32 = 0x0005;
pub const PACKET_TYPE_ABS_MOUSE_MOVE: u32 = 0x0006;
pub const PACKET_TYPE_REL_MOUSE_MOVE: u32 = 0x0008;
pub const PACKET_TYPE_SCROLL: u32 = 0x000a;
pub const PACKET_TYPE_CONTROLLER: u32 = 0x0018;
pub const PACKET_TYPE_MULTI_CONTROLLER: u32 = 0x001e;
pub const PACKET_TYPE_HAPTICS: u32 = 0x0022;

const MOUSE_MOVE_REL_MAGIC: u32 = 0x06;
const MOUSE_MOVE_ABS_MAGIC: u32 = 0x05;
const SCROLL_MAGIC: u8 = 0x09;

const C_HEADER_A: u32 = 0x0a;
const C_HEADER_B: u16 = 0x1400;
const C_TAIL_A: u32 = 0x9c;
const C_TAIL_B: u16 = 0x55;

const MC_HEADER_A: u32 = 0x1e;
const MC_HEADER_B: u16 = 0x1400;
const MC_MID_B: u16 = 0x0700;
const MC_TAIL_A: u32 = 0x55;
const MC_TAIL_B: u16 = 0x55;

const HAPTICS_MAGIC_A: u16 = 0x0d;
const HAPTICS_MAGIC_B: u16 = 0x00;

pub const KEY_ACTION_DOWN: u8 = 0x03;
pub const KEY_ACTION_UP: u8 = 0x04;

pub const MODIFIER_SHIFT: u8 = 0x01;
pub const MODIFIER_CTRL: u8 = 0x02;
pub const MODIFIER_ALT: u8 = 0x04;
pub const MODIFIER_META: u8 = 0x08;

pub const BUTTON_ACTION_PRESS: u8 = 0x07;
pub const BUTTON_ACTION_RELEASE: u8 = 0x08;

const ENCODE_ERR: &str = "Error writing input packet";

/// Where finished input packets go. The control stream implements this by
/// forwarding them on its transport; fatal send failures escalate through
/// it as well.
pub trait InputSink: Send + Sync {
    fn send_input_packet(&self, data: &[u8]) -> StreamResult<()>;
    fn fatal(&self, code: i32);
}

/// Analog and digital state of one gamepad sample.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ControllerState {
    pub button_flags: i16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_stick_x: i16,
    pub left_stick_y: i16,
    pub right_stick_x: i16,
    pub right_stick_y: i16,
}

impl ControllerState {
    fn encode(&self, out: &mut Vec<u8>) {
        out.write_i16::<LittleEndian>(self.button_flags).expect(ENCODE_ERR);
        out.write_u8(self.left_trigger).expect(ENCODE_ERR);
        out.write_u8(self.right_trigger).expect(ENCODE_ERR);
        out.write_i16::<LittleEndian>(self.left_stick_x).expect(ENCODE_ERR);
        out.write_i16::<LittleEndian>(self.left_stick_y).expect(ENCODE_ERR);
        out.write_i16::<LittleEndian>(self.right_stick_x).expect(ENCODE_ERR);
        out.write_i16::<LittleEndian>(self.right_stick_y).expect(ENCODE_ERR);
    }
}

/// One queued input event. The variant mirrors the on-wire packet type; the
/// queue holds the caller's values and generation adjustments happen at
/// encode time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InputPacket {
    Keyboard {
        action: u8,
        key_code: i16,
        modifiers: u8,
    },
    MouseMoveRel {
        delta_x: i16,
        delta_y: i16,
    },
    MouseMoveAbs {
        x: i16,
        y: i16,
        width: i16,
        height: i16,
    },
    MouseButton {
        action: u8,
        button: i32,
    },
    Controller(ControllerState),
    MultiController {
        number: i16,
        active_mask: i16,
        state: ControllerState,
    },
    Scroll {
        amount: i16,
    },
    HapticsEnable,
}

impl InputPacket {
    /// On-wire discriminant, written big-endian at the front of every
    /// packet.
    pub fn packet_type(&self) -> u32 {
        match self {
            InputPacket::Keyboard { .. } => PACKET_TYPE_KEYBOARD,
            InputPacket::MouseMoveRel { .. } => PACKET_TYPE_REL_MOUSE_MOVE,
            InputPacket::MouseMoveAbs { .. } => PACKET_TYPE_ABS_MOUSE_MOVE,
            InputPacket::MouseButton { .. } => PACKET_TYPE_MOUSE_BUTTON,
            InputPacket::Controller(_) => PACKET_TYPE_CONTROLLER,
            InputPacket::MultiController { .. } => PACKET_TYPE_MULTI_CONTROLLER,
            InputPacket::Scroll { .. } => PACKET_TYPE_SCROLL,
            InputPacket::HapticsEnable => PACKET_TYPE_HAPTICS,
        }
    }

    /// Serializes the packet to its wire image. Header codes that shifted in
    /// Gen5 are adjusted here.
    pub fn encode(&self, version: AppVersion) -> Vec<u8> {
        let gen5 = version.uses_reliable_udp();

        let mut out = Vec::with_capacity(40);
        out.write_u32::<BigEndian>(self.packet_type()).expect(ENCODE_ERR);

        match self {
            InputPacket::Keyboard {
                action,
                key_code,
                modifiers,
            } => {
                out.write_u8(*action).expect(ENCODE_ERR);
                out.write_u32::<LittleEndian>(0).expect(ENCODE_ERR);
                out.write_i16::<LittleEndian>(*key_code).expect(ENCODE_ERR);
                out.write_u8(*modifiers).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(0).expect(ENCODE_ERR);
            }
            InputPacket::MouseMoveRel { delta_x, delta_y } => {
                let magic = if gen5 {
                    MOUSE_MOVE_REL_MAGIC + 1
                } else {
                    MOUSE_MOVE_REL_MAGIC
                };
                out.write_u32::<LittleEndian>(magic).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*delta_x).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*delta_y).expect(ENCODE_ERR);
            }
            InputPacket::MouseMoveAbs {
                x,
                y,
                width,
                height,
            } => {
                out.write_u32::<LittleEndian>(MOUSE_MOVE_ABS_MAGIC).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*x).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*y).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(0).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*width).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*height).expect(ENCODE_ERR);
            }
            InputPacket::MouseButton { action, button } => {
                let action = if gen5 { *action + 1 } else { *action };
                out.write_u8(action).expect(ENCODE_ERR);
                out.write_i32::<BigEndian>(*button).expect(ENCODE_ERR);
            }
            InputPacket::Controller(state) => {
                out.write_u32::<LittleEndian>(C_HEADER_A).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(C_HEADER_B).expect(ENCODE_ERR);
                state.encode(&mut out);
                out.write_u32::<LittleEndian>(C_TAIL_A).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(C_TAIL_B).expect(ENCODE_ERR);
            }
            InputPacket::MultiController {
                number,
                active_mask,
                state,
            } => {
                let header_a = if gen5 { MC_HEADER_A - 1 } else { MC_HEADER_A };
                out.write_u32::<LittleEndian>(header_a).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(MC_HEADER_B).expect(ENCODE_ERR);
                out.write_i16::<LittleEndian>(*number).expect(ENCODE_ERR);
                out.write_i16::<LittleEndian>(*active_mask).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(MC_MID_B).expect(ENCODE_ERR);
                state.encode(&mut out);
                out.write_u32::<LittleEndian>(MC_TAIL_A).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(MC_TAIL_B).expect(ENCODE_ERR);
            }
            InputPacket::Scroll { amount } => {
                let magic = if gen5 { SCROLL_MAGIC + 1 } else { SCROLL_MAGIC };
                out.write_u8(magic).expect(ENCODE_ERR);
                out.write_u8(0).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(0).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*amount).expect(ENCODE_ERR);
                out.write_i16::<BigEndian>(*amount).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(0).expect(ENCODE_ERR);
            }
            InputPacket::HapticsEnable => {
                out.write_u16::<LittleEndian>(HAPTICS_MAGIC_A).expect(ENCODE_ERR);
                out.write_u16::<LittleEndian>(HAPTICS_MAGIC_B).expect(ENCODE_ERR);
            }
        }

        out
    }
}

struct InputCore {
    version: AppVersion,
    queue: BlockingQueue<InputPacket>,
    running: AtomicBool,
    tcp_breaker: Option<TcpStream>,
    log: Logger,
}

/// The input stream. Public senders enqueue; one worker thread drains,
/// batches, encrypts and transmits.
pub struct InputStream {
    core: Arc<InputCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl InputStream {
    /// Connects the dedicated input socket on Gen3/4, spawns the send
    /// thread, and enables the enqueue API. On 7.1+ hosts the haptics
    /// enable packet is queued immediately so rumble events will flow.
    pub fn start(
        config: &StreamConfig,
        sink: Arc<dyn InputSink>,
        log: Logger,
    ) -> StreamResult<InputStream> {
        let version = config.app_version;

        let socket = if version.uses_reliable_udp() {
            None
        } else {
            let addr = SocketAddr::new(config.remote_addr, INPUT_PORT_TCP);
            let stream =
                TcpStream::connect_timeout(&addr, Duration::from_secs(CONNECT_TIMEOUT_SEC))?;
            stream.set_nodelay(true)?;
            Some(stream)
        };

        let tcp_breaker = match &socket {
            Some(stream) => Some(stream.try_clone()?),
            None => None,
        };

        let core = Arc::new(InputCore {
            version,
            queue: BlockingQueue::new(INPUT_QUEUE_BOUND),
            running: AtomicBool::new(false),
            tcp_breaker,
            log,
        });

        let key = config.remote_input_aes_key;
        let initial_iv = config.remote_input_aes_iv;

        let worker = core.clone();
        let handle = thread::Builder::new()
            .name("input-send".to_owned())
            .spawn(move || input_send_loop(&worker, sink, socket, key, initial_iv))
            .map_err(|_| StreamError::Thread)?;

        core.running.store(true, Ordering::SeqCst);

        logging::debug!(core.log, "input stream started";
                        "context" => "start",
                        "reliable_udp" => version.uses_reliable_udp(),
                        "gcm_input" => version.gcm_input());

        let stream = InputStream {
            core,
            thread: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        };

        if version.supports_haptics() {
            // The peer will not deliver rumble events without this.
            let _ = stream.core.queue.offer(InputPacket::HapticsEnable);
        }

        Ok(stream)
    }

    /// Disables the enqueue API, drains the send thread and closes the
    /// legacy socket. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.core.running.store(false, Ordering::SeqCst);
        self.core.queue.shutdown();

        if let Some(breaker) = &self.core.tcp_breaker {
            let _ = breaker.shutdown(std::net::Shutdown::Both);
        }

        if let Some(handle) = self
            .thread
            .lock()
            .expect("Input thread mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }

        logging::debug!(self.core.log, "input stream stopped"; "context" => "stop");
    }

    /// Queues a relative mouse motion. Zero deltas are dropped.
    pub fn send_mouse_move(&self, delta_x: i16, delta_y: i16) -> StreamResult<()> {
        self.ensure_running()?;

        if delta_x == 0 && delta_y == 0 {
            return Ok(());
        }

        self.core
            .queue
            .offer(InputPacket::MouseMoveRel { delta_x, delta_y })
    }

    /// Queues an absolute mouse position in the given reference space.
    pub fn send_mouse_position(
        &self,
        x: i16,
        y: i16,
        reference_width: i16,
        reference_height: i16,
    ) -> StreamResult<()> {
        self.ensure_running()?;

        // The peer's scaler misses the far edge of the screen unless the
        // reference dimensions are shrunk by one.
        self.core.queue.offer(InputPacket::MouseMoveAbs {
            x,
            y,
            width: reference_width - 1,
            height: reference_height - 1,
        })
    }

    pub fn send_mouse_button(&self, action: u8, button: i32) -> StreamResult<()> {
        self.ensure_running()?;

        self.core
            .queue
            .offer(InputPacket::MouseButton { action, button })
    }

    pub fn send_keyboard_event(
        &self,
        key_code: i16,
        action: u8,
        modifiers: u8,
    ) -> StreamResult<()> {
        self.ensure_running()?;

        self.core.queue.offer(InputPacket::Keyboard {
            action,
            key_code,
            modifiers: fixup_modifiers(key_code, modifiers),
        })
    }

    /// Queues a gamepad sample for the single-controller topology.
    pub fn send_controller_event(&self, state: ControllerState) -> StreamResult<()> {
        self.controller_event(0, 0x1, state)
    }

    /// Queues a gamepad sample with controller number and attach mask.
    pub fn send_multi_controller_event(
        &self,
        controller_number: i16,
        active_gamepad_mask: i16,
        state: ControllerState,
    ) -> StreamResult<()> {
        self.controller_event(controller_number, active_gamepad_mask, state)
    }

    /// Queues a scroll of whole wheel clicks.
    pub fn send_scroll(&self, clicks: i8) -> StreamResult<()> {
        self.send_high_res_scroll(i16::from(clicks) * 120)
    }

    /// Queues a high resolution scroll. Zero amounts are dropped.
    pub fn send_high_res_scroll(&self, amount: i16) -> StreamResult<()> {
        self.ensure_running()?;

        if amount == 0 {
            return Ok(());
        }

        self.core.queue.offer(InputPacket::Scroll { amount })
    }

    fn controller_event(
        &self,
        number: i16,
        active_mask: i16,
        state: ControllerState,
    ) -> StreamResult<()> {
        self.ensure_running()?;

        // Gen3 hosts only understand the single-controller packet.
        let packet = if self.core.version.major == 3 {
            InputPacket::Controller(state)
        } else {
            InputPacket::MultiController {
                number,
                active_mask,
                state,
            }
        };

        self.core.queue.offer(packet)
    }

    #[inline]
    fn ensure_running(&self) -> StreamResult<()> {
        if self.core.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StreamError::NotRunning)
        }
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// The extended modifier keys on the right side of the keyboard must not set
// their own modifier flag, and the meta flag is stripped entirely: the peer
// drops any event carrying it and would synthesize a stuck key otherwise.
fn fixup_modifiers(key_code: i16, modifiers: u8) -> u8 {
    match key_code as u8 {
        0x5b | 0x5c => modifiers & !MODIFIER_META,
        0xa0 => modifiers | MODIFIER_SHIFT,
        0xa1 => modifiers & !MODIFIER_SHIFT,
        0xa2 => modifiers | MODIFIER_CTRL,
        0xa3 => modifiers & !MODIFIER_CTRL,
        0xa4 => modifiers | MODIFIER_ALT,
        0xa5 => modifiers & !MODIFIER_ALT,
        _ => modifiers,
    }
}

// Cipher for generations where the input plane encrypts its own packets.
// Created lazily on the first packet.
enum LegacyCipher {
    Gcm { cipher: GcmCipher, iv: [u8; IV_SIZE] },
    Cbc(CbcCipher),
}

impl LegacyCipher {
    fn new(version: AppVersion, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> LegacyCipher {
        if version.gcm_input() {
            LegacyCipher::Gcm {
                cipher: GcmCipher::new(key),
                iv: *iv,
            }
        } else {
            LegacyCipher::Cbc(CbcCipher::new(key, iv))
        }
    }

    /// Tag-prefixed GCM ciphertext, or chained CBC ciphertext.
    fn encrypt(&mut self, plain: &[u8]) -> Option<Vec<u8>> {
        match self {
            LegacyCipher::Gcm { cipher, iv } => {
                let mut out = vec![0u8; GCM_TAG_SIZE + plain.len()];
                out[GCM_TAG_SIZE..].copy_from_slice(plain);

                let tag = cipher.seal(iv, &mut out[GCM_TAG_SIZE..])?;
                out[0..GCM_TAG_SIZE].copy_from_slice(&tag);

                Some(out)
            }
            LegacyCipher::Cbc(cipher) => Some(cipher.encrypt(plain)),
        }
    }

    /// The peer reuses the tail of the previous ciphertext as the next IV.
    /// Mimic it or the session desyncs after the first controller packet.
    fn rotate_iv(&mut self, sealed: &[u8]) {
        if let LegacyCipher::Gcm { iv, .. } = self {
            if sealed.len() >= GCM_TAG_SIZE + IV_SIZE {
                iv.copy_from_slice(&sealed[sealed.len() - IV_SIZE..]);
            }
        }
    }
}

/// Length-prefixed ciphertext frame: `[len: u32 BE][ciphertext]`.
fn frame_ciphertext(sealed: &[u8]) -> Vec<u8> {
    let mut framed = vec![0u8; 4 + sealed.len()];
    BigEndian::write_u32(&mut framed[0..4], sealed.len() as u32);
    framed[4..].copy_from_slice(sealed);
    framed
}

fn input_send_loop(
    core: &Arc<InputCore>,
    sink: Arc<dyn InputSink>,
    mut socket: Option<TcpStream>,
    key: [u8; KEY_SIZE],
    initial_iv: [u8; IV_SIZE],
) {
    let encrypted_control = core.version.encrypted_control();
    let mut cipher: Option<LegacyCipher> = None;

    loop {
        let mut holder = match core.queue.wait() {
            Ok(packet) => packet,
            Err(_) => return,
        };

        coalesce(&core.queue, &mut holder);

        let plain = holder.encode(core.version);

        if encrypted_control {
            // The control stream applies the outer envelope.
            if let Err(err) = sink.send_input_packet(&plain) {
                logging::warn!(core.log, "input forward failed";
                               "context" => "input_send",
                               "error" => ?err);
                sink.fatal(TERMINATION_TRANSPORT_FAILURE);
                return;
            }
            continue;
        }

        let cipher =
            cipher.get_or_insert_with(|| LegacyCipher::new(core.version, &key, &initial_iv));

        let sealed = match cipher.encrypt(&plain) {
            Some(sealed) => sealed,
            None => {
                logging::warn!(core.log, "input encryption failed"; "context" => "input_send");
                sink.fatal(TERMINATION_TRANSPORT_FAILURE);
                return;
            }
        };

        let framed = frame_ciphertext(&sealed);

        match socket.as_mut() {
            Some(stream) => {
                if stream.write_all(&framed).is_err() {
                    logging::warn!(core.log, "input socket write failed"; "context" => "input_send");
                    sink.fatal(TERMINATION_TRANSPORT_FAILURE);
                    return;
                }
            }
            None => {
                cipher.rotate_iv(&sealed);

                if let Err(err) = sink.send_input_packet(&framed) {
                    logging::warn!(core.log, "input forward failed";
                                   "context" => "input_send",
                                   "error" => ?err);
                    sink.fatal(TERMINATION_TRANSPORT_FAILURE);
                    return;
                }
            }
        }
    }
}

/// Applies the per-type batching rules, folding adjacent queue entries into
/// `holder`, which becomes the packet actually sent.
fn coalesce(queue: &BlockingQueue<InputPacket>, holder: &mut InputPacket) {
    match holder {
        // The peer silently drops gamepad packets arriving close together,
        // so the latest analog sample must win. Only packets with identical
        // digital state may be folded.
        InputPacket::MultiController {
            number,
            active_mask,
            state,
        } => {
            let key = (*number, *active_mask, state.button_flags);

            loop {
                let next = queue.poll_if(|candidate| match candidate {
                    InputPacket::MultiController {
                        number,
                        active_mask,
                        state,
                    } => (*number, *active_mask, state.button_flags) == key,
                    _ => false,
                });

                match next {
                    Some(InputPacket::MultiController { state: newer, .. }) => {
                        state.left_trigger = newer.left_trigger;
                        state.right_trigger = newer.right_trigger;
                        state.left_stick_x = newer.left_stick_x;
                        state.left_stick_y = newer.left_stick_y;
                        state.right_stick_x = newer.right_stick_x;
                        state.right_stick_y = newer.right_stick_y;
                    }
                    _ => break,
                }
            }
        }
        InputPacket::MouseMoveRel { delta_x, delta_y } => loop {
            let total_x = i32::from(*delta_x);
            let total_y = i32::from(*delta_y);

            let next = queue.poll_if(|candidate| match candidate {
                InputPacket::MouseMoveRel { delta_x, delta_y } => {
                    let x = total_x + i32::from(*delta_x);
                    let y = total_y + i32::from(*delta_y);

                    x <= i32::from(i16::max_value())
                        && x >= i32::from(i16::min_value())
                        && y <= i32::from(i16::max_value())
                        && y >= i32::from(i16::min_value())
                }
                _ => false,
            });

            match next {
                Some(InputPacket::MouseMoveRel {
                    delta_x: x,
                    delta_y: y,
                }) => {
                    *delta_x += x;
                    *delta_y += y;
                }
                _ => break,
            }
        },
        InputPacket::MouseMoveAbs { .. } => loop {
            // Only the latest position matters.
            let next = queue.poll_if(|candidate| match candidate {
                InputPacket::MouseMoveAbs { .. } => true,
                _ => false,
            });

            match next {
                Some(newer) => *holder = newer,
                None => break,
            }
        },
        _ => {}
    }
}
