//! Control packet headers and the encrypted envelope spoken by 7.1.431+
//! hosts.
//!
//! Plain packets carry a V1 header (just the 16 bit type) or a V2 header
//! (type plus payload length). Encrypted packets wrap a V2 frame in an outer
//! header of `[0x0001][length][sequence]` followed by the 16 byte GCM tag
//! and the ciphertext. Decryption reshapes the inner V2 frame back into V1
//! form so one parsing path serves both wire modes.

use crate::proto::PACKET_TYPE_ENCRYPTED;
use crate::shared::{StreamError, StreamResult};
use basalt::crypto::{self, GcmCipher};
use byteorder::{ByteOrder, LittleEndian};

/// Plain header: packet type only.
pub const HEADER_V1_SIZE: usize = 2;
/// Typed header with an explicit payload length; always the inner form of
/// an encrypted packet.
pub const HEADER_V2_SIZE: usize = 4;
/// Outer header of an encrypted packet: type tag, length, sequence number.
pub const ENCRYPTED_HEADER_SIZE: usize = 8;

// The outer length field covers the sequence number, the tag and at least
// one V2 header.
const MIN_ENCRYPTED_LENGTH: usize = 4 + crypto::GCM_TAG_SIZE + HEADER_V2_SIZE;

/// Packet type of a V1 (or V2) frame.
#[inline]
pub fn frame_type(frame: &[u8]) -> u16 {
    LittleEndian::read_u16(&frame[0..2])
}

/// Builds the complete encrypted wire packet for one control message:
/// `[0x0001][length][seq][tag][ciphertext of V2 header + payload]`.
pub fn seal(
    cipher: &GcmCipher,
    sequence: u32,
    packet_type: u16,
    payload: &[u8],
) -> StreamResult<Vec<u8>> {
    let body_len = HEADER_V2_SIZE + payload.len();
    let mut out = vec![0u8; ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE + body_len];

    let length = 4 + crypto::GCM_TAG_SIZE + body_len;
    LittleEndian::write_u16(&mut out[0..2], PACKET_TYPE_ENCRYPTED);
    LittleEndian::write_u16(&mut out[2..4], length as u16);
    LittleEndian::write_u32(&mut out[4..8], sequence);

    // The plaintext V2 frame is assembled where the ciphertext will live and
    // encrypted in place.
    {
        let body = &mut out[ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE..];
        LittleEndian::write_u16(&mut body[0..2], packet_type);
        LittleEndian::write_u16(&mut body[2..4], payload.len() as u16);
        body[HEADER_V2_SIZE..].copy_from_slice(payload);
    }

    let iv = crypto::sequence_iv(sequence);
    let tag = {
        let body = &mut out[ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE..];
        cipher.seal(&iv, body).ok_or(StreamError::Crypto)?
    };
    out[ENCRYPTED_HEADER_SIZE..ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE]
        .copy_from_slice(&tag);

    Ok(out)
}

/// Decrypts an encrypted control packet and returns its contents reshaped
/// as a V1 frame: `[type][payload]`. Fails on runts, short buffers and tag
/// mismatches; the caller drops the packet either way.
pub fn open(cipher: &GcmCipher, packet: &[u8]) -> StreamResult<Vec<u8>> {
    if packet.len() < ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE {
        return Err(StreamError::Framing);
    }

    let length = LittleEndian::read_u16(&packet[2..4]) as usize;
    let sequence = LittleEndian::read_u32(&packet[4..8]);

    if length < MIN_ENCRYPTED_LENGTH {
        return Err(StreamError::Framing);
    }

    // The length field counts from the sequence number onward.
    let body_len = length - 4 - crypto::GCM_TAG_SIZE;
    if packet.len() < ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE + body_len {
        return Err(StreamError::Framing);
    }

    let mut tag = [0u8; crypto::GCM_TAG_SIZE];
    tag.copy_from_slice(&packet[ENCRYPTED_HEADER_SIZE..ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE]);

    let mut body =
        packet[ENCRYPTED_HEADER_SIZE + crypto::GCM_TAG_SIZE..][..body_len].to_vec();

    let iv = crypto::sequence_iv(sequence);
    if !cipher.open(&iv, &mut body, &tag) {
        return Err(StreamError::Crypto);
    }

    Ok(downshift_v2(&body))
}

/// Reshapes a V2 frame into V1 form by removing the 16 bit payload length
/// that follows the type.
pub fn downshift_v2(frame: &[u8]) -> Vec<u8> {
    let mut v1 = Vec::with_capacity(frame.len() - 2);
    v1.extend_from_slice(&frame[0..2]);
    v1.extend_from_slice(&frame[HEADER_V2_SIZE..]);
    v1
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [3; 16];

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = GcmCipher::new(&KEY);

        let packet = seal(&cipher, 17, 0x0301, &[1, 2, 3, 4]).unwrap();

        // Outer header is plaintext little endian.
        assert_eq!(&packet[0..2], &[0x01, 0x00]);
        assert_eq!(LittleEndian::read_u16(&packet[2..4]) as usize, 4 + 16 + 4 + 4);
        assert_eq!(LittleEndian::read_u32(&packet[4..8]), 17);

        let frame = open(&cipher, &packet).unwrap();

        assert_eq!(frame_type(&frame), 0x0301);
        assert_eq!(&frame[HEADER_V1_SIZE..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_seal_open_empty_payload() {
        let cipher = GcmCipher::new(&KEY);

        let packet = seal(&cipher, 0, 0x0200, &[]).unwrap();
        let frame = open(&cipher, &packet).unwrap();

        assert_eq!(frame_type(&frame), 0x0200);
        assert_eq!(frame.len(), HEADER_V1_SIZE);
    }

    #[test]
    fn test_open_rejects_runt_packet() {
        let cipher = GcmCipher::new(&KEY);

        assert_eq!(
            open(&cipher, &[0x01, 0x00, 0x04, 0x00]),
            Err(StreamError::Framing)
        );
    }

    #[test]
    fn test_open_rejects_undersized_length_field() {
        let cipher = GcmCipher::new(&KEY);

        let mut packet = seal(&cipher, 1, 0x0301, &[9; 8]).unwrap();
        // Claim less than seq + tag + V2 header.
        LittleEndian::write_u16(&mut packet[2..4], 16);

        assert_eq!(open(&cipher, &packet), Err(StreamError::Framing));
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let cipher = GcmCipher::new(&KEY);

        let mut packet = seal(&cipher, 2, 0x0301, &[5; 8]).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x80;

        assert_eq!(open(&cipher, &packet), Err(StreamError::Crypto));
    }

    #[test]
    fn test_open_requires_matching_sequence_iv() {
        let cipher = GcmCipher::new(&KEY);

        let mut packet = seal(&cipher, 9, 0x0301, &[5; 8]).unwrap();
        // Rewriting the sequence changes the derived IV and must break the
        // authentication.
        LittleEndian::write_u32(&mut packet[4..8], 10);

        assert_eq!(open(&cipher, &packet), Err(StreamError::Crypto));
    }

    #[test]
    fn test_sequences_differing_only_in_high_bytes_share_an_iv() {
        let cipher = GcmCipher::new(&KEY);

        let packet = seal(&cipher, 0x0105, 0x0301, &[5; 8]).unwrap();

        let mut twin = packet.clone();
        // 0x0105 and 0x0005 truncate to the same IV byte, so the envelope
        // still authenticates after the rewrite.
        LittleEndian::write_u32(&mut twin[4..8], 0x0005);

        assert!(open(&cipher, &twin).is_ok());
    }

    #[test]
    fn test_downshift_removes_length_field() {
        let v2 = [0x06, 0x02, 0x03, 0x00, 0xaa, 0xbb, 0xcc];

        let v1 = downshift_v2(&v2);

        assert_eq!(v1, vec![0x06, 0x02, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_downshift_reprefix_reproduces_v2() {
        let v2 = [0x06, 0x02, 0x03, 0x00, 0xaa, 0xbb, 0xcc];

        let v1 = downshift_v2(&v2);

        let mut rebuilt = Vec::new();
        rebuilt.extend_from_slice(&v1[0..2]);
        rebuilt.extend_from_slice(&[0x03, 0x00]);
        rebuilt.extend_from_slice(&v1[2..]);

        assert_eq!(rebuilt, v2.to_vec());
    }
}
