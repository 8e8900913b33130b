use anyhow::{bail, ensure};
use bytes::{Buf, BytesMut};
use pdb_types::Item;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for one wire item. A body larger than this is a protocol
/// violation, not data.
const MAX_ITEM_SIZE: usize = 16 * 1024 * 1024;

/// Frames raw BSON documents: BSON is self-delimiting through its leading
/// 4-byte little-endian length, so no extra envelope is needed.
#[derive(Debug, Default)]
pub struct BsonItemCodec;

impl Decoder for BsonItemCodec {
    type Item = Item;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len < 5 {
            bail!("bson frame of {frame_len} bytes is impossible");
        }
        ensure!(
            frame_len <= MAX_ITEM_SIZE,
            "received item that is too large: {frame_len}"
        );
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let item: Item = bson::from_slice(&src[..frame_len])?;
        src.advance(frame_len);
        Ok(Some(item))
    }
}

impl Encoder<&Item> for BsonItemCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: &Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bson::to_vec(item)?;
        ensure!(
            bytes.len() <= MAX_ITEM_SIZE,
            "attempting to send item that is too large: {}",
            bytes.len()
        );
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Encoder<Item> for BsonItemCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Item>>::encode(self, &item, dst)
    }
}
