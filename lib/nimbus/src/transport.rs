//! Uniform control message sending over the two transport modes.
//!
//! Gen3/4 hosts speak a framed request/reply protocol over TCP; Gen5 and
//! later use a single reliable-ordered channel. The reliable-UDP host, the
//! outbound sequence counter and the cipher context are all guarded by one
//! mutex: they are touched together on every send, and the library is not
//! thread safe across host operations.

use crate::enet::Link;
use crate::envelope;
use crate::shared::StreamResult;
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard};

use basalt::crypto::GcmCipher;

/// Shared state of the reliable-UDP transport.
pub struct EnetChannel {
    pub link: Link,
    pub sequence: u32,
    /// Present when the host generation encrypts the control stream.
    pub cipher: Option<GcmCipher>,
}

pub enum Transport {
    /// Request/reply socket used by Gen3/4 hosts.
    Tcp { stream: Mutex<TcpStream> },
    /// Reliable-UDP channel used from Gen5 on.
    Enet { channel: Mutex<EnetChannel> },
}

impl Transport {
    /// The reliable-UDP channel, when that is the active mode. The receive
    /// loop services the host through this.
    #[inline]
    pub fn enet(&self) -> Option<&Mutex<EnetChannel>> {
        match self {
            Transport::Enet { channel } => Some(channel),
            Transport::Tcp { .. } => None,
        }
    }

    /// Sends one control message without waiting for a reply.
    pub fn send_message(&self, packet_type: u16, payload: &[u8]) -> StreamResult<()> {
        match self {
            Transport::Tcp { stream } => {
                let mut stream = lock(stream);
                let frame = build_tcp_frame(packet_type, payload);
                stream.write_all(&frame)?;
                Ok(())
            }
            Transport::Enet { channel } => {
                let mut channel = lock(channel);
                let channel = &mut *channel;

                let packet = match channel.cipher.as_ref() {
                    Some(cipher) => {
                        let sequence = channel.sequence;
                        channel.sequence += 1;
                        envelope::seal(cipher, sequence, packet_type, payload)?
                    }
                    None => build_plain_frame(packet_type, payload),
                };

                channel.link.send(&packet)?;
                channel.link.flush();
                Ok(())
            }
        }
    }

    /// Sends a message and, on the request/reply transport, reads and
    /// discards the peer's reply. The reliable-UDP transport never replies
    /// inline; anything the peer says arrives on the receive loop.
    pub fn send_and_discard_reply(&self, packet_type: u16, payload: &[u8]) -> StreamResult<()> {
        self.send_message(packet_type, payload)?;

        if let Transport::Tcp { stream } = self {
            let mut stream = lock(stream);
            discard_reply(&mut *stream)?;
        }

        Ok(())
    }
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("Transport mutex poisoned")
}

/// `[type][payload length][payload]`, header fields little endian.
pub fn build_tcp_frame(packet_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 4 + payload.len()];
    LittleEndian::write_u16(&mut frame[0..2], packet_type);
    LittleEndian::write_u16(&mut frame[2..4], payload.len() as u16);
    frame[4..].copy_from_slice(payload);
    frame
}

/// Plain V1 frame for the reliable-UDP channel.
pub fn build_plain_frame(packet_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 2 + payload.len()];
    LittleEndian::write_u16(&mut frame[0..2], packet_type);
    frame[2..].copy_from_slice(payload);
    frame
}

/// Reads one framed reply off the request/reply socket and throws it away.
/// A short read is fatal for the transport.
pub fn discard_reply<R: Read>(reader: &mut R) -> StreamResult<()> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;

    let payload_length = LittleEndian::read_u16(&header[2..4]) as usize;
    if payload_length > 0 {
        let mut payload = vec![0u8; payload_length];
        reader.read_exact(&mut payload)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::StreamError;
    use std::io::Cursor;

    #[test]
    fn test_tcp_frame_layout() {
        let frame = build_tcp_frame(0x1407, &[0x02, 0x00]);

        assert_eq!(frame, vec![0x07, 0x14, 0x02, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_tcp_frame_gen3_start_b() {
        let frame = build_tcp_frame(0x1410, &[0, 0, 0, 0x0a]);

        assert_eq!(frame, vec![0x10, 0x14, 0x04, 0x00, 0, 0, 0, 0x0a]);
    }

    #[test]
    fn test_plain_frame_layout() {
        let frame = build_plain_frame(0x0305, &[0, 0]);

        assert_eq!(frame, vec![0x05, 0x03, 0, 0]);
    }

    #[test]
    fn test_discard_reply_consumes_header_and_payload() {
        let reply = [0x07u8, 0x14, 0x03, 0x00, 1, 2, 3, 0xff];
        let mut cursor = Cursor::new(&reply[..]);

        discard_reply(&mut cursor).unwrap();

        // The trailing byte belongs to the next frame and must survive.
        assert_eq!(cursor.position(), 7);
    }

    #[test]
    fn test_discard_reply_handles_empty_payload() {
        let reply = [0x07u8, 0x14, 0x00, 0x00];
        let mut cursor = Cursor::new(&reply[..]);

        discard_reply(&mut cursor).unwrap();

        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_discard_reply_fails_on_truncated_payload() {
        let reply = [0x07u8, 0x14, 0x04, 0x00, 1, 2];
        let mut cursor = Cursor::new(&reply[..]);

        match discard_reply(&mut cursor) {
            Err(StreamError::Transport(_)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_discard_reply_fails_on_missing_header() {
        let reply = [0x07u8, 0x14];
        let mut cursor = Cursor::new(&reply[..]);

        match discard_reply(&mut cursor) {
            Err(StreamError::Transport(_)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
