//! Handle client connections: decode requests, call the brokers, encode responses.

use crate::bus::{
    BusResult, LogBus, MemoryLog, MemoryLogClient, MemoryQueue, MemoryQueueClient, QueueBus,
};
use crate::error::{RelayError, Result};
use crate::protocol::{decode_request, encode_response, Request, Response, MAX_FRAME_LEN};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The brokers one server exposes.
#[derive(Clone)]
pub struct Brokers {
    pub log: Arc<MemoryLog>,
    pub queue: Arc<MemoryQueue>,
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn run_server(brokers: Brokers, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    run_server_on_listener(brokers, listener, shutdown).await
}

pub async fn run_server_on_listener(
    brokers: Brokers,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("relay broker listening on {}", addr);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(x) => x,
                Err(e) => {
                    error!("accept error: {}", e);
                    continue;
                }
            },
        };
        let brokers = brokers.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(brokers, stream, shutdown).await {
                error!("connection {} error: {}", peer, e);
            }
        });
    }
    info!("relay broker on {} stopped accepting", addr);
    Ok(())
}

/// Each connection gets its own clients; closing them on disconnect leaves
/// groups and requeues unacknowledged deliveries.
async fn handle_connection(
    brokers: Brokers,
    mut stream: TcpStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let log = brokers.log.connect();
    let queue = brokers.queue.connect();
    let result = serve(&log, &queue, &mut stream, shutdown).await;
    let _ = LogBus::close(&log).await;
    let _ = QueueBus::close(&queue).await;
    debug!("connection released");
    result
}

async fn serve(
    log: &MemoryLogClient,
    queue: &MemoryQueueClient,
    stream: &mut TcpStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        while let Some(req) = decode_request(&mut read_buf)? {
            let resp = dispatch(log, queue, req).await;
            let mut write_buf = BytesMut::new();
            encode_response(&resp, &mut write_buf)?;
            stream.write_all(&write_buf).await?;
            stream.flush().await?;
        }
        if read_buf.len() > MAX_FRAME_LEN {
            return Err(RelayError::Protocol("Frame too large".into()));
        }
        read_buf.reserve(4096);
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            n = stream.read_buf(&mut read_buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }
    }
}

fn respond<T>(result: BusResult<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => Response::Error(e),
    }
}

async fn dispatch(log: &MemoryLogClient, queue: &MemoryQueueClient, req: Request) -> Response {
    match req {
        Request::Append {
            topic,
            records,
            acks,
        } => respond(log.append(&topic, &records, acks).await, Response::Appended),
        Request::Join {
            group,
            topic,
            start,
        } => respond(log.join(&group, &topic, start).await, Response::Joined),
        Request::Sync { member } => respond(log.sync(&member).await, Response::Group),
        Request::Poll {
            member,
            generation,
            positions,
            limits,
        } => respond(
            log.poll(&member, generation, &positions, limits).await,
            Response::Polled,
        ),
        Request::Commit { member, offsets } => {
            respond(log.commit(&member, &offsets).await, |_| Response::Done)
        }
        Request::Leave { member } => respond(log.leave(&member).await, |_| Response::Done),
        Request::Publish {
            queue: name,
            record,
            confirm,
        } => respond(queue.publish(&name, &record, confirm).await, |_| {
            Response::Done
        }),
        Request::Consume {
            queue: name,
            max,
            wait,
        } => respond(queue.consume(&name, max, wait).await, Response::Deliveries),
        Request::Ack {
            delivery_tag,
            multiple,
        } => respond(queue.ack(0, delivery_tag, multiple).await, |_| Response::Done),
    }
}
