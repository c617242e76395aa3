use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::{
    envelope::Envelope,
    transport::{Connector, Sender},
};

/// Outcome of one scripted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    /// The broker acknowledges the message.
    Ack,
    /// The broker rejects the message.
    Fail,
    /// The acknowledgment never arrives.
    Hang,
}

#[derive(Default)]
struct State {
    script: VecDeque<Scripted>,
    destinations: HashMap<String, Scripted>,
    connect_failures: usize,
    attempts: Vec<Envelope>,
    sent: Vec<Envelope>,
    connects: usize,
    closes: usize,
}

/// In-memory broker for testing or local pipelines.
///
/// It acts as both the [`Connector`] and the connected [`Sender`]. Every clone
/// shares one state, so a test keeps a handle and inspects what the publisher
/// sent. By default every send is acknowledged. Outcomes can be scripted per
/// send or per destination, and connection attempts can be refused.
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<Mutex<State>>,
}

impl InMemory {
    /// Queue outcomes for the next sends, in order. Once the script runs out
    /// sends are acknowledged again.
    pub async fn script(&self, outcomes: impl IntoIterator<Item = Scripted>) {
        self.state.lock().await.script.extend(outcomes);
    }

    /// Reject every send to `destination` until [`heal_destination`] is called.
    ///
    /// [`heal_destination`]: InMemory::heal_destination
    pub async fn fail_destination(&self, destination: impl Into<String>) {
        self.override_destination(destination.into(), Scripted::Fail)
            .await;
    }

    /// Never acknowledge sends to `destination` until [`heal_destination`] is
    /// called.
    ///
    /// [`heal_destination`]: InMemory::heal_destination
    pub async fn hang_destination(&self, destination: impl Into<String>) {
        self.override_destination(destination.into(), Scripted::Hang)
            .await;
    }

    /// Drop a destination override set by `fail_destination` or
    /// `hang_destination`.
    pub async fn heal_destination(&self, destination: &str) {
        self.state.lock().await.destinations.remove(destination);
    }

    async fn override_destination(&self, destination: String, outcome: Scripted) {
        self.state
            .lock()
            .await
            .destinations
            .insert(destination, outcome);
    }

    /// Refuse the next `count` connection attempts.
    pub async fn fail_connects(&self, count: usize) {
        self.state.lock().await.connect_failures = count;
    }

    /// Envelopes the broker acknowledged, in acknowledgment order.
    pub async fn sent(&self) -> Vec<Envelope> {
        self.state.lock().await.sent.clone()
    }

    /// Every envelope handed to the broker, acknowledged or not.
    pub async fn attempts(&self) -> Vec<Envelope> {
        self.state.lock().await.attempts.clone()
    }

    /// Successful connections opened so far.
    pub async fn connects(&self) -> usize {
        self.state.lock().await.connects
    }

    /// Connections closed so far.
    pub async fn closes(&self) -> usize {
        self.state.lock().await.closes
    }
}

#[async_trait::async_trait]
impl Connector for InMemory {
    type Sender = InMemory;
    type Error = std::io::Error;

    async fn connect(&self, address: &str) -> Result<Self::Sender, Self::Error> {
        let mut state = self.state.lock().await;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("in-memory broker refused connection to {address}"),
            ));
        }
        state.connects += 1;
        Ok(self.clone())
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = std::io::Error;

    /// "Send" a message by appending it to the in-memory log.
    #[tracing::instrument(skip_all, fields(envelope_id = %envelope.id(), destination = envelope.destination()))]
    async fn send(&mut self, envelope: Envelope) -> Result<(), Self::Error> {
        let outcome = {
            let mut state = self.state.lock().await;
            state.attempts.push(envelope.clone());
            match state.destinations.get(envelope.destination()) {
                Some(outcome) => *outcome,
                None => state.script.pop_front().unwrap_or(Scripted::Ack),
            }
        };

        match outcome {
            Scripted::Ack => {
                self.state.lock().await.sent.push(envelope);
                tracing::debug!("Message acknowledged by in-memory broker");
                Ok(())
            }
            Scripted::Fail => Err(std::io::Error::other("in-memory broker rejected message")),
            Scripted::Hang => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.state.lock().await.closes += 1;
        Ok(())
    }
}
