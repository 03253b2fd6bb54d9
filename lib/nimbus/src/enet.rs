//! Thin safe wrapper around the reliable-UDP library. The library is not
//! thread safe across host operations, so the control stream keeps the
//! `Link` behind a single mutex and every call here assumes that lock is
//! held.

use crate::shared::{StreamError, StreamResult};
use ctor::ctor;
use enet_sys::{
    enet_host_connect, enet_host_create, enet_host_destroy, enet_host_flush, enet_host_service,
    enet_initialize, enet_packet_create, enet_packet_destroy, enet_peer_disconnect_now,
    enet_peer_reset, enet_peer_send, enet_peer_timeout, ENetAddress, ENetEvent, ENetHost,
    ENetPeer,
};
use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::raw::c_int;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

const EVENT_TYPE_NONE: u32 = 0;
const EVENT_TYPE_CONNECT: u32 = 1;
const EVENT_TYPE_DISCONNECT: u32 = 2;
const EVENT_TYPE_RECEIVE: u32 = 3;

const PACKET_FLAG_RELIABLE: u32 = 1;

// Wire-level command layout: a 4 byte protocol header followed by an 8 byte
// disconnect command, whose first byte carries the command number in the
// low nibble.
const PROTOCOL_HEADER_SIZE: usize = 4;
const PROTOCOL_DISCONNECT_SIZE: usize = 8;
const PROTOCOL_COMMAND_MASK: u8 = 0x0f;
const PROTOCOL_COMMAND_DISCONNECT: u8 = 4;

/// Library default retransmission limit before a peer is considered lost.
pub const PEER_TIMEOUT_LIMIT: u32 = 32;
/// Library default minimum peer timeout in milliseconds.
pub const PEER_TIMEOUT_MINIMUM: u32 = 5000;

#[ctor]
fn INIT_ENET() {
    unsafe {
        if enet_initialize() != 0 {
            panic!("Reliable-UDP library initialization failed")
        }
    }
}

// Raised by the intercept when the peer's disconnect command is being held
// back so buffered receives can drain first. Only one live host exists per
// process, which matches the stateless shape of the intercept callback.
static DISCONNECT_PENDING: AtomicBool = AtomicBool::new(false);

// Suppresses the wire-level disconnect command exactly once, giving already
// buffered receive events a chance to be delivered before the disconnect is
// processed. Works around receive loss in the library when a disconnect is
// pending.
unsafe extern "C" fn hold_disconnect_intercept(
    host: *mut ENetHost,
    event: *mut ENetEvent,
) -> c_int {
    if (*host).receivedDataLength == PROTOCOL_HEADER_SIZE + PROTOCOL_DISCONNECT_SIZE {
        let command = *(*host).receivedData.add(PROTOCOL_HEADER_SIZE);

        if command & PROTOCOL_COMMAND_MASK == PROTOCOL_COMMAND_DISCONNECT {
            DISCONNECT_PENDING.store(true, Ordering::SeqCst);
            if !event.is_null() {
                (*event).type_ = EVENT_TYPE_NONE;
            }
            return 1;
        }
    }

    0
}

/// Events surfaced by `Link::service`. Receive events copy the packet data
/// out so the underlying packet can be returned to the library immediately.
#[derive(Debug)]
pub enum HostEvent {
    Connect,
    Disconnect,
    Receive(Vec<u8>),
}

/// One outgoing reliable-UDP link: a client host with its single peer and
/// single channel.
pub struct Link {
    host: *mut ENetHost,
    peer: *mut ENetPeer,
}

unsafe impl Send for Link {}

impl Link {
    /// Creates a client host and connects it to `addr`, waiting up to
    /// `timeout_ms` for the connect handshake to complete.
    pub fn connect(addr: SocketAddrV4, timeout_ms: u32) -> StreamResult<Link> {
        DISCONNECT_PENDING.store(false, Ordering::SeqCst);

        let address = ENetAddress {
            host: u32::from_ne_bytes(addr.ip().octets()),
            port: addr.port(),
        };

        unsafe {
            let host = enet_host_create(ptr::null(), 1, 1, 0, 0);
            if host.is_null() {
                return Err(StreamError::Transport(io::ErrorKind::Other));
            }

            let peer = enet_host_connect(host, &address, 1, 0);
            if peer.is_null() {
                enet_host_destroy(host);
                return Err(StreamError::Transport(io::ErrorKind::Other));
            }

            let mut event: ENetEvent = mem::zeroed();
            if enet_host_service(host, &mut event, timeout_ms) <= 0
                || event.type_ != EVENT_TYPE_CONNECT
            {
                enet_peer_reset(peer);
                enet_host_destroy(host);
                return Err(StreamError::Timeout);
            }

            // Flush so the connect verify ACK goes out immediately.
            enet_host_flush(host);

            Ok(Link { host, peer })
        }
    }

    /// Sets the peer inactivity timeout parameters.
    pub fn set_peer_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        unsafe { enet_peer_timeout(self.peer, limit, minimum, maximum) }
    }

    /// Installs the hook that holds back the peer's disconnect command.
    pub fn install_disconnect_hold(&mut self) {
        unsafe { (*self.host).intercept = Some(hold_disconnect_intercept) }
    }

    /// Removes the hook, letting the retransmitted disconnect through.
    pub fn remove_disconnect_hold(&mut self) {
        unsafe { (*self.host).intercept = None }
    }

    /// True while the hold hook is installed.
    #[inline]
    pub fn holding_disconnect(&self) -> bool {
        unsafe { (*self.host).intercept.is_some() }
    }

    /// True once the peer's disconnect command has been intercepted.
    #[inline]
    pub fn disconnect_pending(&self) -> bool {
        DISCONNECT_PENDING.load(Ordering::SeqCst)
    }

    /// Services the host, pumping retransmissions and acknowledgements, and
    /// returns at most one event. A zero timeout polls.
    pub fn service(&mut self, timeout_ms: u32) -> StreamResult<Option<HostEvent>> {
        unsafe {
            let mut event: ENetEvent = mem::zeroed();

            let serviced = enet_host_service(self.host, &mut event, timeout_ms);
            if serviced < 0 {
                return Err(StreamError::Transport(io::ErrorKind::Other));
            }
            if serviced == 0 {
                return Ok(None);
            }

            Ok(match event.type_ {
                EVENT_TYPE_CONNECT => Some(HostEvent::Connect),
                EVENT_TYPE_DISCONNECT => Some(HostEvent::Disconnect),
                EVENT_TYPE_RECEIVE => {
                    let packet = event.packet;
                    let data =
                        slice::from_raw_parts((*packet).data, (*packet).dataLength).to_vec();
                    enet_packet_destroy(packet);
                    Some(HostEvent::Receive(data))
                }
                _ => None,
            })
        }
    }

    /// Queues `data` as a reliable packet on channel 0. The caller must
    /// follow up with `flush` for it to hit the wire promptly.
    pub fn send(&mut self, data: &[u8]) -> StreamResult<()> {
        unsafe {
            let packet = enet_packet_create(
                data.as_ptr() as *const _,
                data.len(),
                PACKET_FLAG_RELIABLE,
            );
            if packet.is_null() {
                return Err(StreamError::Transport(io::ErrorKind::Other));
            }

            if enet_peer_send(self.peer, 0, packet) < 0 {
                enet_packet_destroy(packet);
                return Err(StreamError::Transport(io::ErrorKind::Other));
            }
        }

        Ok(())
    }

    /// Pushes queued packets onto the wire without servicing events.
    pub fn flush(&mut self) {
        unsafe { enet_host_flush(self.host) }
    }

    /// Tells the peer immediately and releases the host. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        unsafe {
            if !self.peer.is_null() {
                enet_peer_disconnect_now(self.peer, 0);
                self.peer = ptr::null_mut();
            }
            if !self.host.is_null() {
                enet_host_destroy(self.host);
                self.host = ptr::null_mut();
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}
