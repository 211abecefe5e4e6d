use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header marker for a datagram envelope carried over the stream
/// channel. A block that does not start with it is not a datagram.
pub const ENVELOPE_MAGIC: u32 = 0xDEAD_BEEF;

/// Largest payload we will accept or produce; matches the frame layer so an
/// encoded envelope always fits in one block.
pub const MAX_PAYLOAD_BYTES: usize = crate::neolink::transport::MAX_FRAME_BYTES as usize - 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad envelope magic: {0:#010x}")]
    BadMagic(u32),
    #[error("bad address length: {0}")]
    BadAddressLength(u32),
    #[error("envelope truncated")]
    Truncated,
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
}

/// One decoded datagram: where it came from, and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope {
    pub source: SocketAddr,
    pub payload: Bytes,
}

/// Layout, all integers big-endian:
/// magic u32, payload length u32, address length u32 (4 or 16),
/// address bytes, port u16, payload.
pub fn encode(source: SocketAddr, payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let addr_bytes: Vec<u8> = match source.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };

    let mut buf = BytesMut::with_capacity(14 + addr_bytes.len() + payload.len());
    buf.put_u32(ENVELOPE_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(addr_bytes.len() as u32);
    buf.put_slice(&addr_bytes);
    buf.put_u16(source.port());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn decode(block: &[u8]) -> Result<UdpEnvelope, CodecError> {
    if block.len() < 12 {
        return Err(CodecError::Truncated);
    }
    let magic = u32::from_be_bytes(block[0..4].try_into().unwrap());
    if magic != ENVELOPE_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let payload_len = u32::from_be_bytes(block[4..8].try_into().unwrap()) as usize;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }
    let addr_len = u32::from_be_bytes(block[8..12].try_into().unwrap());

    let ip: IpAddr = match addr_len {
        4 => {
            let raw: [u8; 4] = block
                .get(12..16)
                .ok_or(CodecError::Truncated)?
                .try_into()
                .unwrap();
            IpAddr::from(raw)
        }
        16 => {
            let raw: [u8; 16] = block
                .get(12..28)
                .ok_or(CodecError::Truncated)?
                .try_into()
                .unwrap();
            IpAddr::from(raw)
        }
        other => return Err(CodecError::BadAddressLength(other)),
    };

    let off = 12 + addr_len as usize;
    let port_raw: [u8; 2] = block
        .get(off..off + 2)
        .ok_or(CodecError::Truncated)?
        .try_into()
        .unwrap();
    let port = u16::from_be_bytes(port_raw);

    let payload = block
        .get(off + 2..off + 2 + payload_len)
        .ok_or(CodecError::Truncated)?;

    Ok(UdpEnvelope {
        source: SocketAddr::new(ip, port),
        payload: Bytes::copy_from_slice(payload),
    })
}
