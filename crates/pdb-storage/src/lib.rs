pub mod keys;
pub mod kv;
pub mod tree;

pub use kv::{decode, decode_item, encode, encode_item, fjall_err, item_get, rtl_get, Store};
pub use tree::{HeadFilter, ReadOptions, Tree, TreeStats, WriteExtra};
