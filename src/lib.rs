#![doc = include_str!("../README.md")]

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod heartbeat;
pub mod intake;
pub mod publisher;
pub mod queue;
pub mod spool;
pub mod transport;

#[doc(inline)]
pub use envelope::{DeliveryState, Envelope, EnvelopeId, MessageKind};

#[doc(inline)]
pub use config::{ConfigError, ConfigErrorKind, PublisherConfig};

#[doc(inline)]
pub use spool::{FileSpool, InMemorySpool, SpoolError, SpoolErrorKind, SpoolStore};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use heartbeat::HeartbeatMonitor;

#[doc(inline)]
pub use intake::SpoolIntake;

#[doc(inline)]
pub use publisher::{
    DefaultPublisherHook, DeliveryOutcome, EnvelopeFailed, PublishError, PublishErrorKind,
    Publisher, PublisherBuilder, PublisherHook, ShutdownReport, StartError, StartErrorKind,
};
