use bytes::Bytes;
use rtp_rs::{RtpPacketBuilder, RtpReader, Seq};
use thiserror::Error;

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpParseError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("empty payload")]
    EmptyPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// Header length including CSRC list and extension.
    pub header_len: usize,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Decode one datagram. The payload excludes CSRCs, the extension
    /// header and any trailing padding.
    pub fn parse(buf: &[u8]) -> Result<Self, RtpParseError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(RtpParseError::TooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpParseError::UnsupportedVersion(version));
        }
        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_count = buf[0] & 0x0F;

        let reader =
            RtpReader::new(buf).map_err(|e| RtpParseError::Malformed(format!("{:?}", e)))?;

        let mut header_len = RTP_HEADER_LEN + csrc_count as usize * 4;
        if extension {
            if buf.len() < header_len + 4 {
                return Err(RtpParseError::Malformed("truncated extension".to_string()));
            }
            let words = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
            header_len += 4 + words * 4;
        }

        let pad = if padding {
            buf[buf.len() - 1] as usize
        } else {
            0
        };
        if header_len + pad > buf.len() {
            return Err(RtpParseError::Malformed(format!(
                "header {} + padding {} exceeds {} bytes",
                header_len,
                pad,
                buf.len()
            )));
        }
        let payload = &buf[header_len..buf.len() - pad];
        if payload.is_empty() {
            return Err(RtpParseError::EmptyPayload);
        }

        Ok(Self {
            header: RtpHeader {
                version,
                padding,
                extension,
                csrc_count,
                marker: reader.mark(),
                payload_type: reader.payload_type(),
                sequence_number: u16::from(reader.sequence_number()),
                timestamp: reader.timestamp(),
                ssrc: reader.ssrc(),
            },
            header_len,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Build a plain RTP packet: no padding, no extension, no CSRCs.
pub fn encode_packet(
    payload_type: u8,
    marker: bool,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    RtpPacketBuilder::new()
        .payload_type(payload_type)
        .marked(marker)
        .sequence(Seq::from(sequence_number))
        .timestamp(timestamp)
        .ssrc(ssrc)
        .payload(payload)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build RTP packet: {:?}", e))
}
