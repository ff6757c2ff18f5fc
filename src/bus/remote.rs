//! TCP client for the broker server. One instance is one connection.

use super::{BusResult, Delivery, FetchLimits, GroupState, LogBus, Poll, QueueBus};
use crate::config::{RequiredAcks, StartOffset};
use crate::error::{BusError, RelayError};
use crate::protocol::{decode_response, encode_request, Request, Response};
use crate::types::{PublishRecord, RecordPosition};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Remote binding implementing both bus shapes over the wire protocol.
///
/// Requests are sequential. The socket is taken out of its slot for the
/// duration of a request, so a request dropped mid-flight discards the
/// connection; the next call dials again and opens a new session.
pub struct RemoteBus {
    brokers: Vec<String>,
    io_timeout: Duration,
    stream: Mutex<Option<Session>>,
    sessions: AtomicU64,
    closed: AtomicBool,
}

/// One dialed connection. Queue delivery tags are only meaningful within it.
struct Session {
    id: u64,
    stream: TcpStream,
}

impl RemoteBus {
    /// Create a client that dials lazily on first use.
    pub fn new(brokers: Vec<String>, io_timeout: Duration) -> Self {
        Self {
            brokers,
            io_timeout,
            stream: Mutex::new(None),
            sessions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a client and dial immediately.
    pub async fn connect(brokers: Vec<String>, io_timeout: Duration) -> BusResult<Self> {
        let bus = Self::new(brokers, io_timeout);
        let session = bus.dial().await?;
        *bus.stream.lock().await = Some(session);
        Ok(bus)
    }

    /// Sessions opened so far; the id of the newest one.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    async fn dial(&self) -> BusResult<Session> {
        let mut last = String::from("no brokers configured");
        for addr in &self.brokers {
            match tokio::time::timeout(self.io_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let id = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(broker = %addr, session = id, "connected");
                    return Ok(Session { id, stream });
                }
                Ok(Err(e)) => last = format!("{}: {}", addr, e),
                Err(_) => last = format!("{}: connect timed out", addr),
            }
        }
        Err(BusError::Unavailable(last))
    }

    async fn call(&self, request: Request) -> BusResult<Response> {
        self.call_in_session(request).await.map(|(response, _)| response)
    }

    /// Like `call`, also returning the session the response arrived on.
    async fn call_in_session(&self, request: Request) -> BusResult<(Response, u64)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut slot = self.stream.lock().await;
        let session = match slot.take() {
            Some(session) => session,
            None => self.dial().await?,
        };
        self.exchange(&mut slot, session, &request).await
    }

    /// Send `request` only if `session` is still the open one. `Ok(None)`
    /// means it is gone and nothing was sent.
    async fn call_pinned(&self, session: u64, request: Request) -> BusResult<Option<Response>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut slot = self.stream.lock().await;
        match slot.take() {
            Some(open) if open.id == session => self
                .exchange(&mut slot, open, &request)
                .await
                .map(|(response, _)| Some(response)),
            other => {
                *slot = other;
                Ok(None)
            }
        }
    }

    /// One round trip on `session`, putting it back in `slot` unless the
    /// connection failed.
    async fn exchange(
        &self,
        slot: &mut Option<Session>,
        mut session: Session,
        request: &Request,
    ) -> BusResult<(Response, u64)> {
        let budget = self.io_timeout + server_wait(request);
        let id = session.id;
        match tokio::time::timeout(budget, round_trip(&mut session.stream, request)).await {
            Ok(Ok(Response::Error(e))) => {
                *slot = Some(session);
                Err(e)
            }
            Ok(Ok(response)) => {
                *slot = Some(session);
                Ok((response, id))
            }
            Ok(Err(RelayError::Io(e))) => {
                warn!(session = id, error = %e, "connection lost");
                Err(BusError::Unavailable(e.to_string()))
            }
            Ok(Err(e)) => Err(BusError::Protocol(e.to_string())),
            Err(_) => Err(BusError::Timeout(budget)),
        }
    }
}

/// How long the server may legitimately hold a request before answering.
fn server_wait(request: &Request) -> Duration {
    match request {
        Request::Poll { limits, .. } => limits.max_wait,
        Request::Consume { wait, .. } => *wait,
        _ => Duration::ZERO,
    }
}

async fn round_trip(stream: &mut TcpStream, request: &Request) -> crate::error::Result<Response> {
    let mut buf = BytesMut::new();
    encode_request(request, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(response) = decode_response(&mut read_buf)? {
            return Ok(response);
        }
        read_buf.reserve(4096);
        if stream.read_buf(&mut read_buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the connection",
            )
            .into());
        }
    }
}

fn unexpected(response: Response) -> BusError {
    BusError::Protocol(format!("unexpected response {:?}", response))
}

#[async_trait]
impl LogBus for RemoteBus {
    async fn append(
        &self,
        topic: &str,
        records: &[PublishRecord],
        acks: RequiredAcks,
    ) -> BusResult<Vec<RecordPosition>> {
        match self
            .call(Request::Append {
                topic: topic.to_string(),
                records: records.to_vec(),
                acks,
            })
            .await?
        {
            Response::Appended(positions) => Ok(positions),
            other => Err(unexpected(other)),
        }
    }

    async fn join(&self, group: &str, topic: &str, start: StartOffset) -> BusResult<String> {
        match self
            .call(Request::Join {
                group: group.to_string(),
                topic: topic.to_string(),
                start,
            })
            .await?
        {
            Response::Joined(member) => Ok(member),
            other => Err(unexpected(other)),
        }
    }

    async fn sync(&self, member: &str) -> BusResult<GroupState> {
        match self
            .call(Request::Sync {
                member: member.to_string(),
            })
            .await?
        {
            Response::Group(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    async fn poll(
        &self,
        member: &str,
        generation: u64,
        positions: &[(i32, i64)],
        limits: FetchLimits,
    ) -> BusResult<Poll> {
        match self
            .call(Request::Poll {
                member: member.to_string(),
                generation,
                positions: positions.to_vec(),
                limits,
            })
            .await?
        {
            Response::Polled(poll) => Ok(poll),
            other => Err(unexpected(other)),
        }
    }

    async fn commit(&self, member: &str, offsets: &[(i32, i64)]) -> BusResult<()> {
        match self
            .call(Request::Commit {
                member: member.to_string(),
                offsets: offsets.to_vec(),
            })
            .await?
        {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn leave(&self, member: &str) -> BusResult<()> {
        match self
            .call(Request::Leave {
                member: member.to_string(),
            })
            .await?
        {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) -> BusResult<()> {
        shutdown(self).await
    }
}

#[async_trait]
impl QueueBus for RemoteBus {
    async fn publish(&self, queue: &str, record: &PublishRecord, confirm: bool) -> BusResult<()> {
        match self
            .call(Request::Publish {
                queue: queue.to_string(),
                record: record.clone(),
                confirm,
            })
            .await?
        {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn consume(&self, queue: &str, max: usize, wait: Duration) -> BusResult<Vec<Delivery>> {
        let (response, session) = self
            .call_in_session(Request::Consume {
                queue: queue.to_string(),
                max,
                wait,
            })
            .await?;
        match response {
            Response::Deliveries(mut deliveries) => {
                for d in &mut deliveries {
                    d.session = session;
                }
                Ok(deliveries)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn ack(&self, session: u64, delivery_tag: u64, multiple: bool) -> BusResult<()> {
        let request = Request::Ack {
            delivery_tag,
            multiple,
        };
        match self.call_pinned(session, request).await? {
            Some(Response::Done) => Ok(()),
            Some(other) => Err(unexpected(other)),
            None => {
                debug!(session, delivery_tag, "ack for a closed session dropped");
                Ok(())
            }
        }
    }

    async fn close(&self) -> BusResult<()> {
        shutdown(self).await
    }
}

/// Dropping the socket makes the server release everything held for this connection.
async fn shutdown(bus: &RemoteBus) -> BusResult<()> {
    if bus.closed.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    if let Some(mut session) = bus.stream.lock().await.take() {
        let _ = session.stream.shutdown().await;
    }
    Ok(())
}
