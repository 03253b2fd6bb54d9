use serde_derive::{Deserialize, Serialize};

/// Four-part server version, compared lexicographically.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct AppVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
}

impl AppVersion {
    #[inline]
    pub fn new(major: u16, minor: u16, patch: u16, build: u16) -> AppVersion {
        AppVersion {
            major,
            minor,
            patch,
            build,
        }
    }

    /// True when the version is at least `major.minor.patch`.
    #[inline]
    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Gen5 and later talk to the control port over reliable-UDP and carry
    /// input on the same channel.
    #[inline]
    pub fn uses_reliable_udp(&self) -> bool {
        self.major >= 5
    }

    /// 7.1.431 and later wrap every control packet in AES-GCM; input packets
    /// travel as plaintext into the control sender, which seals them.
    #[inline]
    pub fn encrypted_control(&self) -> bool {
        self.at_least(7, 1, 431)
    }

    /// 7.1.415 and later replace the legacy loss report with a heartbeat
    /// ping.
    #[inline]
    pub fn periodic_ping(&self) -> bool {
        self.at_least(7, 1, 415)
    }

    /// Input packets are GCM-sealed from Gen7 on, CBC-chained before that.
    #[inline]
    pub fn gcm_input(&self) -> bool {
        self.major >= 7
    }

    /// Hosts older than 7.1 may drop the connection on unknown packets, so
    /// the haptics-enable packet is only sent from 7.1 on.
    #[inline]
    pub fn supports_haptics(&self) -> bool {
        self.at_least(7, 1, 0)
    }
}

/// Logical control operations, indexed into the generation tables. Gen3/4
/// reuse the `StartA` slot for their legacy IDR frame request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    StartA = 0,
    StartB = 1,
    InvalidateRefFrames = 2,
    LossStats = 3,
    FrameStats = 4,
    InputData = 5,
    RumbleData = 6,
    Termination = 7,
}

/// Outer type tag of an encrypted control packet.
pub const PACKET_TYPE_ENCRYPTED: u16 = 0x0001;
/// Heartbeat ping emitted by 7.1.415+ clients.
pub const PACKET_TYPE_PING: u16 = 0x0200;

/// Wire table for one server generation. A `-1` slot means the operation
/// does not exist in that generation: senders must not emit it and the
/// receive loop will never match it.
pub struct Generation {
    packet_types: [i16; 8],
    payload_lengths: [i16; 6],
    preconstructed: [&'static [u8]; 2],
}

impl Generation {
    /// Packet type for `op`, or `None` when this generation does not define
    /// the operation.
    #[inline]
    pub fn packet_type(&self, op: Op) -> Option<u16> {
        match self.packet_types[op as usize] {
            -1 => None,
            ptype => Some(ptype as u16),
        }
    }

    /// Fixed payload length of `op`. Only meaningful for operations the
    /// generation defines with a fixed layout.
    #[inline]
    pub fn payload_length(&self, op: Op) -> usize {
        self.payload_lengths[op as usize] as usize
    }

    /// Opaque preconstructed payload for the two handshake slots.
    #[inline]
    pub fn preconstructed(&self, op: Op) -> &'static [u8] {
        self.preconstructed[op as usize]
    }

    /// Table for the given server version.
    pub fn select(version: AppVersion) -> &'static Generation {
        match version.major {
            3 => &GEN3,
            4 => &GEN4,
            5 | 6 => &GEN5,
            _ => {
                if version.encrypted_control() {
                    &GEN7_ENC
                } else {
                    &GEN7
                }
            }
        }
    }
}

const REQUEST_IDR_FRAME_GEN3: [u8; 2] = [0, 0];
const START_B_GEN3: [u8; 4] = [0, 0, 0, 0x0a];
const REQUEST_IDR_FRAME_GEN4: [u8; 2] = [0, 0];
const START_B_GEN4: [u8; 1] = [0];
const START_A_GEN5: [u8; 2] = [0, 0];
const START_B_GEN5: [u8; 1] = [0];

pub static GEN3: Generation = Generation {
    packet_types: [
        0x1407, // Request IDR frame
        0x1410, // Start B
        0x1404, // Invalidate reference frames
        0x140c, // Loss stats
        0x1417, // Frame stats
        -1,     // Input data
        -1,     // Rumble data
        -1,     // Termination
    ],
    payload_lengths: [2, 4, 24, 32, 64, -1],
    preconstructed: [&REQUEST_IDR_FRAME_GEN3, &START_B_GEN3],
};

pub static GEN4: Generation = Generation {
    packet_types: [
        0x0606, // Request IDR frame
        0x0609, // Start B
        0x0604, // Invalidate reference frames
        0x060a, // Loss stats
        0x0611, // Frame stats
        -1,     // Input data
        -1,     // Rumble data
        -1,     // Termination
    ],
    payload_lengths: [2, 1, 24, 32, 64, -1],
    preconstructed: [&REQUEST_IDR_FRAME_GEN4, &START_B_GEN4],
};

pub static GEN5: Generation = Generation {
    packet_types: [
        0x0305, // Start A
        0x0307, // Start B
        0x0301, // Invalidate reference frames
        0x0201, // Loss stats
        0x0204, // Frame stats
        0x0207, // Input data
        -1,     // Rumble data
        -1,     // Termination
    ],
    payload_lengths: [2, 1, 24, 32, 80, -1],
    preconstructed: [&START_A_GEN5, &START_B_GEN5],
};

pub static GEN7: Generation = Generation {
    packet_types: [
        0x0305, // Start A
        0x0307, // Start B
        0x0301, // Invalidate reference frames
        0x0201, // Loss stats
        0x0204, // Frame stats
        0x0206, // Input data
        0x010b, // Rumble data
        0x0100, // Termination
    ],
    payload_lengths: [2, 1, 24, 32, 80, -1],
    preconstructed: [&START_A_GEN5, &START_B_GEN5],
};

pub static GEN7_ENC: Generation = Generation {
    packet_types: [
        0x0305, // Start A
        0x0307, // Start B
        0x0301, // Invalidate reference frames
        0x0201, // Loss stats
        0x0204, // Frame stats
        0x0206, // Input data
        0x010b, // Rumble data
        0x0109, // Termination (extended)
    ],
    payload_lengths: [2, 1, 24, 32, 80, -1],
    preconstructed: [&START_A_GEN5, &START_B_GEN5],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering_is_lexicographic() {
        assert!(AppVersion::new(7, 1, 431, 0) > AppVersion::new(7, 1, 430, 9));
        assert!(AppVersion::new(7, 2, 0, 0) > AppVersion::new(7, 1, 431, 0));
        assert!(AppVersion::new(3, 9, 9, 9) < AppVersion::new(4, 0, 0, 0));
    }

    #[test]
    fn test_at_least_ignores_build_component() {
        let version = AppVersion::new(7, 1, 431, 0);

        assert!(version.at_least(7, 1, 431));
        assert!(version.at_least(7, 1, 415));
        assert!(!version.at_least(7, 1, 432));
        assert!(!version.at_least(8, 0, 0));
    }

    #[test]
    fn test_dispatch_predicates() {
        let gen4 = AppVersion::new(4, 0, 0, 0);
        let gen5 = AppVersion::new(5, 0, 0, 0);
        let gen7_plain = AppVersion::new(7, 1, 420, 0);
        let gen7_enc = AppVersion::new(7, 1, 431, 0);

        assert!(!gen4.uses_reliable_udp());
        assert!(gen5.uses_reliable_udp());

        assert!(!gen7_plain.encrypted_control());
        assert!(gen7_enc.encrypted_control());

        assert!(!gen5.periodic_ping());
        assert!(gen7_plain.periodic_ping());

        assert!(!gen5.gcm_input());
        assert!(gen7_plain.gcm_input());
    }

    #[test]
    fn test_generation_selection() {
        assert!(std::ptr::eq(
            Generation::select(AppVersion::new(3, 0, 0, 0)),
            &GEN3
        ));
        assert!(std::ptr::eq(
            Generation::select(AppVersion::new(4, 1, 0, 0)),
            &GEN4
        ));
        assert!(std::ptr::eq(
            Generation::select(AppVersion::new(5, 0, 0, 0)),
            &GEN5
        ));
        assert!(std::ptr::eq(
            Generation::select(AppVersion::new(7, 1, 420, 0)),
            &GEN7
        ));
        assert!(std::ptr::eq(
            Generation::select(AppVersion::new(7, 1, 431, 0)),
            &GEN7_ENC
        ));
    }

    #[test]
    fn test_undefined_slots_have_no_packet_type() {
        assert_eq!(GEN3.packet_type(Op::InputData), None);
        assert_eq!(GEN3.packet_type(Op::Termination), None);
        assert_eq!(GEN5.packet_type(Op::RumbleData), None);
        assert_eq!(GEN7.packet_type(Op::RumbleData), Some(0x010b));
        assert_eq!(GEN7.packet_type(Op::Termination), Some(0x0100));
        assert_eq!(GEN7_ENC.packet_type(Op::Termination), Some(0x0109));
    }

    #[test]
    fn test_legacy_idr_request_payload() {
        assert_eq!(GEN3.preconstructed(Op::StartA), &[0, 0][..]);
        assert_eq!(GEN3.payload_length(Op::StartA), 2);
        assert_eq!(GEN3.preconstructed(Op::StartB), &[0, 0, 0, 0x0a][..]);
        assert_eq!(GEN3.payload_length(Op::StartB), 4);
    }
}
