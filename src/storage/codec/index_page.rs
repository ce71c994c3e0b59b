use crate::buffer::PAGE_SIZE;
use crate::catalog::DataType;
use crate::error::{QuarryError, QuarryResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::index::{
    IndexFileHeader, IndexKeySchema, TreeNodeHeader, TreeNodePage, RID_SIZE,
    TREE_NODE_HEADER_SIZE,
};
use crate::storage::Rid;

pub struct IndexFileHeaderCodec;

impl IndexFileHeaderCodec {
    pub fn encode(header: &IndexFileHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(header.root_page_no));
        bytes.extend(CommonCodec::encode_u32(header.first_leaf));
        bytes.extend(CommonCodec::encode_u32(header.last_leaf));
        bytes.extend(CommonCodec::encode_u32(header.btree_order));
        bytes.extend(CommonCodec::encode_u32(header.num_pages));
        bytes.extend(CommonCodec::encode_u32(header.key_schema.col_tot_len));
        bytes.extend(CommonCodec::encode_u32(header.key_schema.num_cols() as u32));
        for (col_type, col_len) in header
            .key_schema
            .col_types
            .iter()
            .zip(header.key_schema.col_lens.iter())
        {
            bytes.extend(CommonCodec::encode_u8(col_type.tag()));
            bytes.extend(CommonCodec::encode_u32(*col_len));
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> QuarryResult<DecodedData<IndexFileHeader>> {
        let mut left = bytes;
        let (root_page_no, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (first_leaf, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (last_leaf, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (btree_order, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (num_pages, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (col_tot_len, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (num_cols, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];

        let mut col_types = Vec::with_capacity(num_cols as usize);
        let mut col_lens = Vec::with_capacity(num_cols as usize);
        for _ in 0..num_cols {
            let (tag, offset) = CommonCodec::decode_u8(left)?;
            left = &left[offset..];
            col_types.push(DataType::from_tag(tag)?);
            let (len, offset) = CommonCodec::decode_u32(left)?;
            left = &left[offset..];
            col_lens.push(len);
        }

        let key_schema = IndexKeySchema::new(col_types, col_lens);
        if key_schema.col_tot_len != col_tot_len {
            return Err(QuarryError::Internal(format!(
                "index header col_tot_len {} does not match column widths {}",
                col_tot_len, key_schema.col_tot_len
            )));
        }
        Ok((
            IndexFileHeader {
                root_page_no,
                first_leaf,
                last_leaf,
                btree_order,
                num_pages,
                key_schema,
            },
            bytes.len() - left.len(),
        ))
    }
}

pub struct TreeNodePageCodec;

impl TreeNodePageCodec {
    /// Fixed layout: node header, then `capacity` key slots of
    /// `col_tot_len` bytes, then `capacity` rid slots. Unused slots stay
    /// zeroed.
    pub fn encode(node: &TreeNodePage, header: &IndexFileHeader) -> Vec<u8> {
        let key_len = header.key_schema.col_tot_len as usize;
        let mut bytes = vec![0u8; PAGE_SIZE];
        let mut cursor = 0usize;
        for chunk in [
            CommonCodec::encode_bool(node.header.is_leaf),
            CommonCodec::encode_u32(node.header.num_keys),
            CommonCodec::encode_u32(node.header.parent),
            CommonCodec::encode_u32(node.header.prev_leaf),
            CommonCodec::encode_u32(node.header.next_leaf),
        ] {
            bytes[cursor..cursor + chunk.len()].copy_from_slice(&chunk);
            cursor += chunk.len();
        }
        debug_assert_eq!(cursor, TREE_NODE_HEADER_SIZE);

        let keys_base = TREE_NODE_HEADER_SIZE;
        for (i, key) in node.keys.iter().enumerate() {
            let at = keys_base + i * key_len;
            bytes[at..at + key_len].copy_from_slice(key);
        }
        let rids_base = keys_base + header.capacity() * key_len;
        for (i, rid) in node.rids.iter().enumerate() {
            let at = rids_base + i * RID_SIZE;
            bytes[at..at + 4].copy_from_slice(&CommonCodec::encode_u32(rid.page_no));
            bytes[at + 4..at + 8].copy_from_slice(&CommonCodec::encode_u32(rid.slot_no));
        }
        bytes
    }

    pub fn decode(bytes: &[u8], header: &IndexFileHeader) -> QuarryResult<TreeNodePage> {
        if bytes.len() != PAGE_SIZE {
            return Err(QuarryError::Internal(format!(
                "tree node page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left = bytes;
        let (is_leaf, offset) = CommonCodec::decode_bool(left)?;
        left = &left[offset..];
        let (num_keys, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (parent, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (prev_leaf, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];
        let (next_leaf, _) = CommonCodec::decode_u32(left)?;

        let key_len = header.key_schema.col_tot_len as usize;
        if num_keys as usize > header.capacity() {
            return Err(QuarryError::Internal(format!(
                "tree node holds {} keys, capacity is {}",
                num_keys,
                header.capacity()
            )));
        }

        let keys_base = TREE_NODE_HEADER_SIZE;
        let mut keys = Vec::with_capacity(num_keys as usize);
        for i in 0..num_keys as usize {
            let at = keys_base + i * key_len;
            keys.push(bytes[at..at + key_len].to_vec());
        }
        let rids_base = keys_base + header.capacity() * key_len;
        let mut rids = Vec::with_capacity(num_keys as usize);
        for i in 0..num_keys as usize {
            let at = rids_base + i * RID_SIZE;
            let (page_no, _) = CommonCodec::decode_u32(&bytes[at..])?;
            let (slot_no, _) = CommonCodec::decode_u32(&bytes[at + 4..])?;
            rids.push(Rid::new(page_no, slot_no));
        }

        Ok(TreeNodePage {
            header: TreeNodeHeader {
                is_leaf,
                num_keys,
                parent,
                prev_leaf,
                next_leaf,
            },
            keys,
            rids,
        })
    }
}
