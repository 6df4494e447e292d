//! Packet definitions plus the conversions between the typed data model
//! and its wire form: postcard-encoded frames and `"---"` status strings.

use bytes::Bytes;

use crate::config::{MAX_MESSAGE_SIZE, UNKNOWN};
use crate::error::CoordError;
use crate::protocol::{Frame, PeerReport, msg_types};
use crate::types::{CharacterStatus, PeerId, PeerStatus};

/// In-memory representation of a framed packet as produced by
/// `PacketCodec`. `msg_type` names the `Frame` variant carried in
/// `payload`; `flags` is reserved and always zero for now.
#[derive(Clone, Debug)]
pub struct RawPacket {
    pub msg_type: u16,
    pub flags: u8,
    pub payload: Bytes,
}

fn frame_type(frame: &Frame) -> u16 {
    match frame {
        Frame::Handshake { .. } => msg_types::HANDSHAKE,
        Frame::HandshakeAck { .. } => msg_types::HANDSHAKE_ACK,
        Frame::Leave { .. } => msg_types::LEAVE,
        Frame::RelayCommand { .. } => msg_types::RELAY_COMMAND,
        Frame::Mail(_) => msg_types::MAIL,
    }
}

/// Serialize a frame into a packet, refusing anything over
/// `MAX_MESSAGE_SIZE`.
pub fn encode_frame(frame: &Frame) -> Result<RawPacket, CoordError> {
    let payload = postcard::to_allocvec(frame)?;

    if payload.len() as u32 > MAX_MESSAGE_SIZE {
        return Err(CoordError::MessageTooLarge(payload.len() as u32));
    }

    Ok(RawPacket {
        msg_type: frame_type(frame),
        flags: 0,
        payload: Bytes::from(payload),
    })
}

/// Decode a packet back into a frame. The header type must agree with
/// the decoded variant.
pub fn decode_frame(packet: &RawPacket) -> Result<Frame, CoordError> {
    let frame: Frame = postcard::from_bytes(&packet.payload)?;
    let expected = frame_type(&frame);
    if expected != packet.msg_type {
        return Err(CoordError::InvalidArgument(format!(
            "packet type {:#06x} does not match frame type {expected:#06x}",
            packet.msg_type
        )));
    }
    Ok(frame)
}

/// `None` for the sentinel (or an empty string), otherwise the value.
pub fn known(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

pub fn or_unknown(field: Option<&String>) -> String {
    field.cloned().unwrap_or_else(|| UNKNOWN.to_owned())
}

/// Build the `PeerData` payload for `name`. A character whose status
/// cannot be read reports every field as unknown.
pub fn report_from_status(name: &PeerId, status: Option<&CharacterStatus>) -> PeerReport {
    let empty = CharacterStatus::default();
    let s = status.unwrap_or(&empty);
    PeerReport {
        name: name.as_str().to_owned(),
        class: or_unknown(s.class.as_ref()),
        level: or_unknown(s.level.as_ref()),
        ac: or_unknown(s.ac.as_ref()),
        max_hp: or_unknown(s.max_hp.as_ref()),
        max_mana: or_unknown(s.max_mana.as_ref()),
        max_endurance: or_unknown(s.max_endurance.as_ref()),
        zone: or_unknown(s.zone.as_ref()),
    }
}

pub fn status_from_report(report: &PeerReport) -> PeerStatus {
    PeerStatus::from_report(
        PeerId::new(report.name.trim()),
        CharacterStatus {
            class: known(&report.class),
            level: known(&report.level),
            ac: known(&report.ac),
            max_hp: known(&report.max_hp),
            max_mana: known(&report.max_mana),
            max_endurance: known(&report.max_endurance),
            zone: known(&report.zone),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::Message;

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::Mail(Message::QueryGroup {
            target: "Bob".into(),
            query_id: 7,
        });
        let packet = encode_frame(&frame).unwrap();
        assert_eq!(packet.msg_type, msg_types::MAIL);
        match decode_frame(&packet).unwrap() {
            Frame::Mail(Message::QueryGroup { target, query_id }) => {
                assert_eq!(target, "Bob");
                assert_eq!(query_id, 7);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_frame_type_mismatch_rejected() {
        let mut packet = encode_frame(&Frame::Leave {
            name: "Bob".into(),
        })
        .unwrap();
        assert_eq!(packet.msg_type, msg_types::LEAVE);
        packet.msg_type = msg_types::RELAY_COMMAND;
        assert!(matches!(
            decode_frame(&packet),
            Err(CoordError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::RelayCommand {
            command: "x".repeat(MAX_MESSAGE_SIZE as usize + 1),
        };
        assert!(matches!(
            encode_frame(&frame),
            Err(CoordError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let packet = RawPacket {
            msg_type: msg_types::MAIL,
            flags: 0,
            payload: Bytes::from_static(&[0xFF, 0xFF, 0xFF]),
        };
        assert!(matches!(
            decode_frame(&packet),
            Err(CoordError::Serialization(_))
        ));
    }

    #[test]
    fn test_sentinel_never_becomes_a_value() {
        assert_eq!(known("---"), None);
        assert_eq!(known(" --- "), None);
        assert_eq!(known(""), None);
        assert_eq!(known("65").as_deref(), Some("65"));
    }

    #[test]
    fn test_report_with_unknown_status() {
        let report = report_from_status(&PeerId::new("Bob"), None);
        assert_eq!(report.name, "Bob");
        assert_eq!(report.class, UNKNOWN);
        assert_eq!(report.zone, UNKNOWN);

        let status = status_from_report(&report);
        assert!(status.class.is_none());
        assert!(status.max_endurance.is_none());
    }

    #[test]
    fn test_report_partial_status() {
        let status = CharacterStatus {
            class: Some("Warrior".into()),
            level: Some("65".into()),
            zone: Some("Plane of Knowledge".into()),
            ..CharacterStatus::default()
        };
        let report = report_from_status(&PeerId::new("Tank"), Some(&status));
        assert_eq!(report.class, "Warrior");
        assert_eq!(report.ac, UNKNOWN);

        let back = status_from_report(&report);
        assert_eq!(back.name.as_str(), "Tank");
        assert_eq!(back.level.as_deref(), Some("65"));
        assert!(back.ac.is_none());
        assert!(!back.stale);
    }
}
