pub mod channels;
pub mod codec;
pub mod proto;

pub use channels::{
    read_control_line, serve_head_lookup, serve_local_data_channel, serve_remote_data_channel,
    RemoteChannelConfig,
};
pub use codec::BsonItemCodec;
pub use proto::{AuthRequest, ControlMsg, DataRequest, StartFrom};
