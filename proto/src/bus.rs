//! Message bus frame shapes (spec §4.F, §4.G).
//!
//! The bus itself — point-to-point, reliable, ordered per (sender,
//! receiver) pair — is an external collaborator per spec.md §1; this module
//! only fixes the minimal concrete frame needed to carry the keymgr
//! request/response catalogue over the control socketpair described in §6.

use std::fmt;

/// Fixed width of the domain-name slot carried in every keymgr frame header.
pub const DOMAIN_LEN: usize = 256;
/// Size of an entropy response payload (spec §4.F).
pub const ENTROPY_LEN: usize = 1024;

const HEADER_LEN: usize = 2 + 4 + DOMAIN_LEN; // msg_id + data_len + domain slot

/// Destination of a bus send: a specific worker, the parent, or a broadcast
/// to every worker (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Worker(crate::worker::WorkerId),
    Parent,
    AllWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageId {
    CertificateReq = 1,
    EntropyReq = 2,
    Certificate = 3,
    Crl = 4,
    EntropyResp = 5,
    AcmeChallengeSetCert = 6,
    AcmeChallengeClearCert = 7,
    AcceptAvailable = 8,
    Shutdown = 9,
}

impl MessageId {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::CertificateReq,
            2 => Self::EntropyReq,
            3 => Self::Certificate,
            4 => Self::Crl,
            5 => Self::EntropyResp,
            6 => Self::AcmeChallengeSetCert,
            7 => Self::AcmeChallengeClearCert,
            8 => Self::AcceptAvailable,
            9 => Self::Shutdown,
            _ => return None,
        })
    }
}

/// Header every keymgr-bus frame carries: `(id, length)` plus a fixed-width
/// NUL-terminated domain slot, per spec.md §4.F / §4.G delivery primitives.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub id: MessageId,
    pub length: u32,
}

/// A fully parsed, validated keymgr bus message.
#[derive(Debug, Clone)]
pub enum KeymgrMessage {
    CertificateReq { domain: DomainName },
    EntropyReq,
    Certificate { domain: DomainName, chain_pem: Vec<u8> },
    Crl { domain: DomainName, crl_pem: Vec<u8> },
    EntropyResp { buf: Box<[u8; ENTROPY_LEN]> },
    AcmeChallengeSetCert { domain: DomainName, der: Vec<u8> },
    AcmeChallengeClearCert { domain: DomainName },
    AcceptAvailable,
    Shutdown,
}

/// A fixed-width, NUL-terminated domain name as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainName {
    bytes: [u8; DOMAIN_LEN],
    len: usize,
}

impl DomainName {
    pub fn new(s: &str) -> Result<Self, BusError> {
        if s.is_empty() || s.len() >= DOMAIN_LEN {
            return Err(BusError::DomainTooLong(s.len()));
        }
        let mut bytes = [0u8; DOMAIN_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self { bytes, len: s.len() })
    }

    pub fn as_str(&self) -> &str {
        // Safety of the unwrap: constructed only from valid UTF-8 input in
        // `new`, or validated byte-for-byte in `parse_nul_terminated`.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    fn parse_nul_terminated(slot: &[u8; DOMAIN_LEN]) -> Result<Self, BusError> {
        let nul_at = slot
            .iter()
            .position(|&b| b == 0)
            .ok_or(BusError::DomainNotTerminated)?;
        if nul_at == 0 {
            return Err(BusError::DomainNotTerminated);
        }
        let s = std::str::from_utf8(&slot[..nul_at]).map_err(|_| BusError::DomainNotTerminated)?;
        Self::new(s)
    }

    fn write_slot(&self, out: &mut [u8; DOMAIN_LEN]) {
        out.fill(0);
        out[..self.len].copy_from_slice(&self.bytes[..self.len]);
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainName({:?})", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("short keymgr message ({0})")]
    ShortMessage(usize),
    #[error("keymgr message length field ({declared}) does not match frame size ({actual})")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("domain name is not NUL-terminated within its fixed-width slot")]
    DomainNotTerminated,
    #[error("domain name too long for its slot ({0} bytes)")]
    DomainTooLong(usize),
    #[error("unknown message id {0}")]
    UnknownMessageId(u16),
    #[error("entropy payload must be exactly {ENTROPY_LEN} bytes, got {0}")]
    BadEntropyLength(usize),
}

/// Validate and parse a raw frame: minimum size, declared length matches
/// actual size, domain NUL-terminated (spec.md §4.F validation rules).
/// Domain *membership* (known/unknown) is an application-layer concern,
/// checked by the receiver against its configured domain set.
pub fn parse_keymgr_frame(buf: &[u8]) -> Result<KeymgrMessage, BusError> {
    if buf.len() < HEADER_LEN {
        return Err(BusError::ShortMessage(buf.len()));
    }
    let msg_id_raw = u16::from_le_bytes([buf[0], buf[1]]);
    let data_len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let mut domain_slot = [0u8; DOMAIN_LEN];
    domain_slot.copy_from_slice(&buf[6..6 + DOMAIN_LEN]);

    let declared_total = HEADER_LEN + data_len;
    if declared_total != buf.len() {
        return Err(BusError::LengthMismatch {
            declared: data_len as u32,
            actual: buf.len(),
        });
    }
    let payload = &buf[HEADER_LEN..];
    let msg_id = MessageId::from_u16(msg_id_raw).ok_or(BusError::UnknownMessageId(msg_id_raw))?;

    Ok(match msg_id {
        MessageId::CertificateReq => KeymgrMessage::CertificateReq {
            domain: DomainName::parse_nul_terminated(&domain_slot)?,
        },
        MessageId::EntropyReq => KeymgrMessage::EntropyReq,
        MessageId::Certificate => KeymgrMessage::Certificate {
            domain: DomainName::parse_nul_terminated(&domain_slot)?,
            chain_pem: payload.to_vec(),
        },
        MessageId::Crl => KeymgrMessage::Crl {
            domain: DomainName::parse_nul_terminated(&domain_slot)?,
            crl_pem: payload.to_vec(),
        },
        MessageId::EntropyResp => {
            if payload.len() != ENTROPY_LEN {
                return Err(BusError::BadEntropyLength(payload.len()));
            }
            let mut buf = Box::new([0u8; ENTROPY_LEN]);
            buf.copy_from_slice(payload);
            KeymgrMessage::EntropyResp { buf }
        }
        MessageId::AcmeChallengeSetCert => KeymgrMessage::AcmeChallengeSetCert {
            domain: DomainName::parse_nul_terminated(&domain_slot)?,
            der: payload.to_vec(),
        },
        MessageId::AcmeChallengeClearCert => KeymgrMessage::AcmeChallengeClearCert {
            domain: DomainName::parse_nul_terminated(&domain_slot)?,
        },
        MessageId::AcceptAvailable => KeymgrMessage::AcceptAvailable,
        MessageId::Shutdown => KeymgrMessage::Shutdown,
    })
}

/// Encode a frame. Used by both producers (workers sending requests) and
/// the key-manager (sending responses) so both sides share one wire format.
pub fn encode_keymgr_frame(id: MessageId, domain: Option<&DomainName>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(id as u16).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut slot = [0u8; DOMAIN_LEN];
    if let Some(d) = domain {
        d.write_slot(&mut slot);
    }
    out.extend_from_slice(&slot);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_certificate_req() {
        let domain = DomainName::new("example.com").unwrap();
        let frame = encode_keymgr_frame(MessageId::CertificateReq, Some(&domain), &[]);
        match parse_keymgr_frame(&frame).unwrap() {
            KeymgrMessage::CertificateReq { domain: d } => assert_eq!(d.as_str(), "example.com"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn short_message_is_rejected() {
        let err = parse_keymgr_frame(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.to_string(), "short keymgr message (3)");
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let domain = DomainName::new("example.com").unwrap();
        let mut frame = encode_keymgr_frame(MessageId::Certificate, Some(&domain), b"cert-bytes");
        // Corrupt the declared length field.
        frame[2..6].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            parse_keymgr_frame(&frame),
            Err(BusError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn entropy_resp_round_trips_fixed_size() {
        let payload = [7u8; ENTROPY_LEN];
        let frame = encode_keymgr_frame(MessageId::EntropyResp, None, &payload);
        match parse_keymgr_frame(&frame).unwrap() {
            KeymgrMessage::EntropyResp { buf } => assert_eq!(*buf, payload),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn acme_set_then_clear_round_trip() {
        let domain = DomainName::new("acme.example").unwrap();
        let set = encode_keymgr_frame(MessageId::AcmeChallengeSetCert, Some(&domain), b"der-bytes");
        let clear = encode_keymgr_frame(MessageId::AcmeChallengeClearCert, Some(&domain), &[]);
        assert!(matches!(
            parse_keymgr_frame(&set).unwrap(),
            KeymgrMessage::AcmeChallengeSetCert { .. }
        ));
        assert!(matches!(
            parse_keymgr_frame(&clear).unwrap(),
            KeymgrMessage::AcmeChallengeClearCert { .. }
        ));
    }
}
