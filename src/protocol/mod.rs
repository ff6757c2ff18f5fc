//! Wire protocol between `RemoteBus` and the broker server.
//!
//! Frame: length (4 bytes BE) | api_key (2 bytes BE) | bincode payload.

mod codec;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, Request, Response,
    MAX_FRAME_LEN,
};
