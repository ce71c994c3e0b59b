use crate::error::QuarryResult;
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::heap::{HeapFileHeader, HeapPageHeader};

pub const HEAP_PAGE_HEADER_SIZE: usize = 8;

pub struct HeapFileHeaderCodec;

impl HeapFileHeaderCodec {
    pub fn encode(header: &HeapFileHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(header.record_size));
        bytes.extend(CommonCodec::encode_u32(header.num_pages));
        bytes.extend(CommonCodec::encode_u32(header.records_per_page));
        bytes.extend(CommonCodec::encode_u32(header.bitmap_size));
        bytes.extend(CommonCodec::encode_u32(header.first_free_page));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> QuarryResult<DecodedData<HeapFileHeader>> {
        let mut left = bytes;
        let (record_size, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (num_pages, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (records_per_page, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (bitmap_size, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (first_free_page, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        Ok((
            HeapFileHeader {
                record_size,
                num_pages,
                records_per_page,
                bitmap_size,
                first_free_page,
            },
            bytes.len() - left.len(),
        ))
    }
}

pub struct HeapPageHeaderCodec;

impl HeapPageHeaderCodec {
    pub fn encode(header: &HeapPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(header.next_free_page));
        bytes.extend(CommonCodec::encode_u32(header.num_records));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> QuarryResult<DecodedData<HeapPageHeader>> {
        let mut left = bytes;
        let (next_free_page, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (num_records, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        Ok((
            HeapPageHeader {
                next_free_page,
                num_records,
            },
            bytes.len() - left.len(),
        ))
    }
}
