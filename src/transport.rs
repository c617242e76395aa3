//! Transport abstractions and broker backends.
//!
//! This module defines a Tower-compatible transport layer used to send
//! [`Envelope`]s to a broker. The publisher never speaks a wire protocol
//! itself; it only relies on the capability set exposed here:
//!
//! - [`Connector`]: opens a connection to a broker address
//! - [`Sender`]: sends one envelope and waits for the broker acknowledgment,
//!   then closes the connection when asked
//! - [`Transport`]: Tower wrapper around a sender that bounds every send with
//!   an acknowledgment timeout and normalizes errors into [`TransportError`]
//!
//! Backends: [`InMemory`] for tests and local pipelines, and
//! `rabbitmq::RabbitMqConnector` behind the `rabbitmq` feature.

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tower::{BoxError, Service, ServiceExt, timeout::Timeout};
use tracing_error::SpanTrace;

use crate::envelope::Envelope;

pub use inmemory::{InMemory, Scripted};

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the entry point the drain workers use to send envelopes.
/// It wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Maps an elapsed acknowledgment timeout to
///   [`TransportErrorKind::AckTimeout`]
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
    ack_timeout: Option<Duration>,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a connected sender.
    pub fn new(sender: D) -> Self {
        Self {
            service: SenderService::new(sender),
            ack_timeout: None,
        }
    }
}

impl<S> Transport<S> {
    /// Fail any send whose acknowledgment takes longer than `timeout`.
    pub fn with_ack_timeout(self, timeout: Duration) -> Transport<Timeout<S>> {
        Transport {
            service: Timeout::new(self.service, timeout),
            ack_timeout: Some(timeout),
        }
    }

    /// Send an [`Envelope`] and wait for the broker acknowledgment.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError>
    where
        S: Service<Envelope, Response = ()> + Send,
        S::Future: Send,
        S::Error: Into<BoxError>,
    {
        let ack_timeout = self.ack_timeout;
        let service = ServiceExt::<Envelope>::ready(&mut self.service)
            .await
            .map_err(|e| TransportError::classify(e.into(), ack_timeout))?;
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::classify(e.into(), ack_timeout))
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
///
/// Every kind is recoverable: the publisher answers it with a retry.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker could not be reached.
    ConnectFailed(BoxError),
    /// The broker refused or dropped the message.
    SendFailed(BoxError),
    /// No acknowledgment arrived within the configured window.
    AckTimeout(Duration),
}

/// Copyable summary of a [`TransportErrorKind`], used in delivery outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    ConnectFailed,
    SendFailed,
    AckTimeout,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ConnectFailed => "connect failed",
            Self::SendFailed => "send failed",
            Self::AckTimeout => "ack timeout",
        })
    }
}

impl TransportError {
    /// Create a connection-related transport error.
    pub fn connect(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::ConnectFailed(err.into()),
        }
    }

    /// Create a send-related transport error.
    pub fn send(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::SendFailed(err.into()),
        }
    }

    /// Create an acknowledgment timeout error.
    pub fn ack_timeout(after: Duration) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::AckTimeout(after),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn failure(&self) -> TransportFailure {
        match self.kind {
            TransportErrorKind::ConnectFailed(_) => TransportFailure::ConnectFailed,
            TransportErrorKind::SendFailed(_) => TransportFailure::SendFailed,
            TransportErrorKind::AckTimeout(_) => TransportFailure::AckTimeout,
        }
    }

    fn classify(err: BoxError, ack_timeout: Option<Duration>) -> Self {
        if err.is::<tower::timeout::error::Elapsed>() {
            return Self::ack_timeout(ack_timeout.unwrap_or_default());
        }
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::send(err),
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(err) => write!(f, "Connect failed: {err}"),
            Self::SendFailed(err) => write!(f, "Send failed: {err}"),
            Self::AckTimeout(after) => write!(f, "No acknowledgment within {after:?}"),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::ConnectFailed(err) => Some(err.as_ref()),
            TransportErrorKind::SendFailed(err) => Some(err.as_ref()),
            TransportErrorKind::AckTimeout(_) => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Envelope> for SenderService<D>
where
    D: Sender + Clone,
{
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by connected broker backends.
///
/// A sender delivers an [`Envelope`] to its destination and resolves once the
/// broker has acknowledged it. Clones share the same underlying connection.
#[async_trait::async_trait]
pub trait Sender: Send + 'static {
    /// Backend-specific error type.
    type Error: Into<BoxError> + Send;

    /// Send an envelope and wait for the broker acknowledgment.
    async fn send(&mut self, envelope: Envelope) -> Result<(), Self::Error>;

    /// Tear down the underlying connection.
    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Opens broker connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Sender: Sender + Clone + Sync;
    type Error: Into<BoxError> + Send;

    async fn connect(&self, address: &str) -> Result<Self::Sender, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    #[tokio::test]
    async fn send_failures_are_classified() {
        let transport = InMemory::default();
        transport.script([Scripted::Fail]).await;
        let sender = transport.connect("memory://").await.unwrap();

        let mut sink = Transport::new(sender).with_ack_timeout(Duration::from_secs(1));
        let err = sink
            .send(Envelope::new(MessageKind::Event, "audit", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.failure(), TransportFailure::SendFailed);

        sink.send(Envelope::new(MessageKind::Event, "audit", vec![]))
            .await
            .unwrap();
        assert_eq!(transport.sent().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_acknowledgment_maps_to_ack_timeout() {
        let transport = InMemory::default();
        transport.script([Scripted::Hang]).await;
        let sender = transport.connect("memory://").await.unwrap();

        let mut sink = Transport::new(sender).with_ack_timeout(Duration::from_millis(250));
        let err = sink
            .send(Envelope::new(MessageKind::Command, "orders", vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            TransportErrorKind::AckTimeout(after) if *after == Duration::from_millis(250)
        ));
        assert!(transport.sent().await.is_empty());
    }

    #[test]
    fn wrapped_transport_errors_keep_their_kind() {
        let err = TransportError::classify(
            Box::new(TransportError::connect("refused")),
            None,
        );
        assert_eq!(err.failure(), TransportFailure::ConnectFailed);
    }
}
