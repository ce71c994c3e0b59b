pub mod common;
pub mod heap_page;
pub mod index_page;

pub use common::CommonCodec;
pub use heap_page::{HeapFileHeaderCodec, HeapPageHeaderCodec};
pub use index_page::{IndexFileHeaderCodec, TreeNodePageCodec};

// decoded value + bytes consumed
pub type DecodedData<T> = (T, usize);
