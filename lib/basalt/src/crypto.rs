use aes::cipher::generic_array::typenum::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{AesGcm, KeyInit};

pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const GCM_TAG_SIZE: usize = 16;
pub const CBC_BLOCK_SIZE: usize = 16;

/// The peer speaks AES-128-GCM with a full 16 byte IV rather than the usual
/// 12 byte nonce.
type Aes128Gcm16 = AesGcm<Aes128, U16>;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Derives a 16 byte GCM IV from a packet sequence number. Only the low byte
/// of the sequence is used; the truncation matches the peer and must not be
/// widened.
#[inline]
pub fn sequence_iv(sequence: u32) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[0] = sequence as u8;
    iv
}

/// AES-128-GCM context. The key schedule is computed once per connection and
/// reused for every packet, with the IV supplied per call.
pub struct GcmCipher {
    cipher: Aes128Gcm16,
}

impl GcmCipher {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE]) -> GcmCipher {
        GcmCipher {
            cipher: Aes128Gcm16::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypts `buf` in place and returns the detached 16 byte tag, or
    /// `None` if the cipher fails for any reason.
    pub fn seal(&self, iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Option<[u8; GCM_TAG_SIZE]> {
        match self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(iv), &[], buf)
        {
            Ok(tag) => {
                let mut out = [0u8; GCM_TAG_SIZE];
                out.copy_from_slice(tag.as_slice());
                Some(out)
            }
            Err(_) => None,
        }
    }

    /// Decrypts `buf` in place, authenticating it against `tag`. Returns
    /// false on any failure, including a tag mismatch.
    pub fn open(&self, iv: &[u8; IV_SIZE], buf: &mut [u8], tag: &[u8; GCM_TAG_SIZE]) -> bool {
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                &[],
                buf,
                GenericArray::from_slice(tag),
            )
            .is_ok()
    }
}

/// Streaming AES-128-CBC encryptor. The block chaining state persists across
/// calls, so each packet is implicitly chained to the tail of the previous
/// ciphertext exactly as the peer expects.
pub struct CbcCipher {
    cipher: Aes128CbcEnc,
}

impl CbcCipher {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> CbcCipher {
        CbcCipher {
            cipher: Aes128CbcEnc::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// Pads `plain` with the peer's PKCS#7 variant and encrypts it into a
    /// fresh buffer. Block aligned plaintext is sent without padding.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        pad_in_place(&mut buf);

        for block in buf.chunks_exact_mut(CBC_BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        buf
    }
}

/// Length of `len` bytes of plaintext after padding to the block boundary.
/// An already aligned length stays unchanged; the peer does not append a
/// full padding block in that case.
#[inline]
pub fn padded_len(len: usize) -> usize {
    (len + CBC_BLOCK_SIZE - 1) / CBC_BLOCK_SIZE * CBC_BLOCK_SIZE
}

fn pad_in_place(buf: &mut Vec<u8>) {
    let padded = padded_len(buf.len());
    let pad_byte = (CBC_BLOCK_SIZE - buf.len() % CBC_BLOCK_SIZE) as u8;
    buf.resize(padded, pad_byte);
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [7; KEY_SIZE];
    const IV: [u8; IV_SIZE] = [9; IV_SIZE];

    #[test]
    fn test_gcm_roundtrip() {
        let cipher = GcmCipher::new(&KEY);

        let mut buf = b"control message".to_vec();
        let tag = cipher.seal(&IV, &mut buf).unwrap();

        assert_ne!(&buf[..], b"control message");

        assert!(cipher.open(&IV, &mut buf, &tag));
        assert_eq!(&buf[..], b"control message");
    }

    #[test]
    fn test_gcm_rejects_bad_tag() {
        let cipher = GcmCipher::new(&KEY);

        let mut buf = b"control message".to_vec();
        let mut tag = cipher.seal(&IV, &mut buf).unwrap();
        tag[0] ^= 0xff;

        assert!(!cipher.open(&IV, &mut buf, &tag));
    }

    #[test]
    fn test_gcm_rejects_wrong_iv() {
        let cipher = GcmCipher::new(&KEY);

        let mut buf = b"control message".to_vec();
        let tag = cipher.seal(&IV, &mut buf).unwrap();

        let other_iv = sequence_iv(3);

        assert!(!cipher.open(&other_iv, &mut buf, &tag));
    }

    #[test]
    fn test_sequence_iv_truncates() {
        assert_eq!(sequence_iv(0)[0], 0);
        assert_eq!(sequence_iv(5)[0], 5);
        assert_eq!(sequence_iv(0x1fe)[0], 0xfe);
        assert_eq!(sequence_iv(0x100)[0], 0);
        assert_eq!(&sequence_iv(0xffff_ffff)[1..], &[0u8; 15][..]);
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 16);
        assert_eq!(padded_len(15), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(17), 32);
    }

    #[test]
    fn test_cbc_pads_to_block_boundary() {
        let mut cipher = CbcCipher::new(&KEY, &IV);

        assert_eq!(cipher.encrypt(&[1, 2, 3]).len(), 16);
        assert_eq!(cipher.encrypt(&[0; 16]).len(), 16);
        assert_eq!(cipher.encrypt(&[0; 17]).len(), 32);
    }

    #[test]
    fn test_cbc_state_chains_across_packets() {
        let mut cipher = CbcCipher::new(&KEY, &IV);

        let first = cipher.encrypt(b"identical input!");
        let second = cipher.encrypt(b"identical input!");

        // The chaining state advanced, so equal plaintext must not produce
        // equal ciphertext.
        assert_ne!(first, second);
    }

    #[test]
    fn test_cbc_fresh_state_is_deterministic() {
        let mut a = CbcCipher::new(&KEY, &IV);
        let mut b = CbcCipher::new(&KEY, &IV);

        assert_eq!(a.encrypt(b"identical input!"), b.encrypt(b"identical input!"));
    }
}
