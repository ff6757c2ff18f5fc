//! Request/response codec (length-prefixed, api_key, bincode payload).

use crate::bus::{Delivery, FetchLimits, GroupState, Poll};
use crate::config::{RequiredAcks, StartOffset};
use crate::error::{BusError, RelayError, Result};
use crate::types::{PublishRecord, RecordPosition};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_APPEND: u16 = 0;
const API_JOIN: u16 = 1;
const API_SYNC: u16 = 2;
const API_POLL: u16 = 3;
const API_COMMIT: u16 = 4;
const API_LEAVE: u16 = 5;
const API_PUBLISH: u16 = 6;
const API_CONSUME: u16 = 7;
const API_ACK: u16 = 8;
const API_ERROR: u16 = u16::MAX;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Client request. Log requests mirror `LogBus`, queue requests mirror `QueueBus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Append {
        topic: String,
        records: Vec<PublishRecord>,
        acks: RequiredAcks,
    },
    Join {
        group: String,
        topic: String,
        start: StartOffset,
    },
    Sync {
        member: String,
    },
    Poll {
        member: String,
        generation: u64,
        positions: Vec<(i32, i64)>,
        limits: FetchLimits,
    },
    Commit {
        member: String,
        offsets: Vec<(i32, i64)>,
    },
    Leave {
        member: String,
    },
    Publish {
        queue: String,
        record: PublishRecord,
        confirm: bool,
    },
    Consume {
        queue: String,
        max: usize,
        wait: Duration,
    },
    Ack {
        delivery_tag: u64,
        multiple: bool,
    },
}

impl Request {
    pub fn api_key(&self) -> u16 {
        match self {
            Request::Append { .. } => API_APPEND,
            Request::Join { .. } => API_JOIN,
            Request::Sync { .. } => API_SYNC,
            Request::Poll { .. } => API_POLL,
            Request::Commit { .. } => API_COMMIT,
            Request::Leave { .. } => API_LEAVE,
            Request::Publish { .. } => API_PUBLISH,
            Request::Consume { .. } => API_CONSUME,
            Request::Ack { .. } => API_ACK,
        }
    }
}

/// Server response. `Error` carries the bus error so retry classification
/// survives the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Appended(Vec<RecordPosition>),
    Joined(String),
    Group(GroupState),
    Polled(Poll),
    Done,
    Deliveries(Vec<Delivery>),
    Error(BusError),
}

impl Response {
    fn api_key(&self) -> u16 {
        match self {
            Response::Appended(_) => API_APPEND,
            Response::Joined(_) => API_JOIN,
            Response::Group(_) => API_SYNC,
            Response::Polled(_) => API_POLL,
            Response::Done => API_COMMIT,
            Response::Deliveries(_) => API_CONSUME,
            Response::Error(_) => API_ERROR,
        }
    }
}

fn protocol_err(e: impl std::fmt::Display) -> RelayError {
    RelayError::Protocol(e.to_string())
}

fn write_frame(api_key: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let frame_len = 2 + payload.len();
    if frame_len > MAX_FRAME_LEN {
        return Err(protocol_err(format!("frame of {} bytes too large", frame_len)));
    }
    dst.reserve(4 + frame_len);
    dst.extend_from_slice(&(frame_len as u32).to_be_bytes());
    dst.extend_from_slice(&api_key.to_be_bytes());
    dst.extend_from_slice(payload);
    Ok(())
}

/// Split one complete frame off `src`, returning its api key and payload.
fn read_frame(src: &mut BytesMut) -> Result<Option<(u16, BytesMut)>> {
    if src.len() < 6 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len < 2 || len > MAX_FRAME_LEN {
        return Err(protocol_err(format!("invalid frame length {}", len)));
    }
    if src.len() < 4 + len {
        return Ok(None);
    }
    let api_key = u16::from_be_bytes([src[4], src[5]]);
    let mut frame = src.split_to(4 + len);
    Ok(Some((api_key, frame.split_off(6))))
}

pub fn encode_request(req: &Request, dst: &mut BytesMut) -> Result<()> {
    let payload = bincode::serialize(req).map_err(protocol_err)?;
    write_frame(req.api_key(), &payload, dst)
}

/// Decode a single request, consuming its frame. `None` until a whole frame is buffered.
pub fn decode_request(src: &mut BytesMut) -> Result<Option<Request>> {
    let Some((api_key, payload)) = read_frame(src)? else {
        return Ok(None);
    };
    let request: Request = bincode::deserialize(&payload).map_err(protocol_err)?;
    if request.api_key() != api_key {
        return Err(protocol_err(format!(
            "api_key {} does not match request {}",
            api_key,
            request.api_key()
        )));
    }
    Ok(Some(request))
}

pub fn encode_response(resp: &Response, dst: &mut BytesMut) -> Result<()> {
    let payload = bincode::serialize(resp).map_err(protocol_err)?;
    write_frame(resp.api_key(), &payload, dst)
}

pub fn decode_response(src: &mut BytesMut) -> Result<Option<Response>> {
    let Some((api_key, payload)) = read_frame(src)? else {
        return Ok(None);
    };
    let response: Response = bincode::deserialize(&payload).map_err(protocol_err)?;
    if response.api_key() != api_key {
        return Err(protocol_err(format!(
            "api_key {} does not match response {}",
            api_key,
            response.api_key()
        )));
    }
    Ok(Some(response))
}
