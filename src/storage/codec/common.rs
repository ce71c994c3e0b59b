use crate::error::{QuarryError, QuarryResult};
use crate::storage::codec::DecodedData;

/// Little-endian primitive codec; all on-disk integers go through here.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_bool(data: bool) -> Vec<u8> {
        vec![data as u8]
    }

    pub fn decode_bool(bytes: &[u8]) -> QuarryResult<DecodedData<bool>> {
        if bytes.is_empty() {
            return Err(too_short(bytes.len(), 1));
        }
        Ok((bytes[0] != 0, 1))
    }

    pub fn encode_u8(data: u8) -> Vec<u8> {
        vec![data]
    }

    pub fn decode_u8(bytes: &[u8]) -> QuarryResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(too_short(bytes.len(), 1));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u16(data: u16) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u16(bytes: &[u8]) -> QuarryResult<DecodedData<u16>> {
        if bytes.len() < 2 {
            return Err(too_short(bytes.len(), 2));
        }
        Ok((u16::from_le_bytes([bytes[0], bytes[1]]), 2))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> QuarryResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(too_short(bytes.len(), 4));
        }
        Ok((u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 4))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_le_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> QuarryResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(too_short(bytes.len(), 8));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Ok((u64::from_le_bytes(buf), 8))
    }
}

fn too_short(actual: usize, expected: usize) -> QuarryError {
    QuarryError::Internal(format!(
        "bytes length {actual} is less than {expected}"
    ))
}
