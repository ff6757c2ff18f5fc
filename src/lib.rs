//! Weather relay: at-least-once delivery of weather events into log-style and
//! queue-style message buses, and back out again.

pub mod backoff;
pub mod bus;
pub mod codec;
pub mod compression;
pub mod config;
pub mod consume;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod publish;
pub mod relay;
pub mod server;
pub mod types;

pub use bus::{Connection, LogBus, MemoryLog, MemoryLogConfig, MemoryQueue, QueueBus, RemoteBus};
pub use codec::EventCodec;
pub use config::{BusKind, ChannelConfig, CommitStrategy, RelayConfig, RequiredAcks, StartOffset};
pub use consume::{ConsumeChannel, RebalanceListener};
pub use error::{
    BusError, CodecError, ConsumeError, PublishError, RelayError, Result, ShutdownError,
};
pub use lifecycle::{Drain, FatalReporter, LifecycleController, LifecycleState, StopReason};
pub use publish::PublishChannel;
pub use relay::{ForwardReport, RelayBridge};
pub use types::{Ack, ConsumedRecord, PublishRecord, WeatherEvent};
