//! The broker loop: one frame at a time from the shared inbox, dispatched
//! against the client registry.
//!
//! Chat frames are fanned out to every other client with a single
//! non-blocking attempt each. A recipient that cannot take the frame misses
//! it; nothing is retried and the sender is never told.

use std::{future::Future, io, path::Path};

use anyhow::{Context, Result};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{debug, info, warn};

use crate::{
    frame::{Frame, FrameKind, SenderId},
    registry::ClientRegistry,
    transport::{FifoInbox, FifoOutbox, Inbox, Outbox},
};

/// Runtime policy for the broker loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Drop a client once this many deliveries to it have failed in a row.
    /// `None` keeps clients until they disconnect.
    pub evict_after: Option<u32>,
}

/// What the broker did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Registered(SenderId),
    AlreadyRegistered(SenderId),
    Unregistered(SenderId),
    UnknownSender(SenderId),
    Broadcast {
        sender_id: SenderId,
        attempted: usize,
        delivered: usize,
        evicted: Vec<SenderId>,
    },
    Ignored,
}

pub struct Broker<I, O> {
    inbox: I,
    outbox: O,
    registry: ClientRegistry,
    config: BrokerConfig,
}

impl Broker<FifoInbox, FifoOutbox> {
    /// Creates (if needed) and opens the shared FIFO at `path`.
    pub fn open(path: &Path, config: BrokerConfig) -> Result<Self> {
        let inbox = FifoInbox::create(path)
            .with_context(|| format!("failed to open shared inbox {}", path.display()))?;
        Ok(Self::with_config(inbox, FifoOutbox, config))
    }
}

impl<I, O> Broker<I, O>
where
    I: Inbox,
    O: Outbox,
{
    pub fn new(inbox: I, outbox: O) -> Self {
        Self::with_config(inbox, outbox, BrokerConfig::default())
    }

    pub fn with_config(inbox: I, outbox: O, config: BrokerConfig) -> Self {
        Self {
            inbox,
            outbox,
            registry: ClientRegistry::new(),
            config,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Serves frames until `shutdown` resolves, then releases the inbox.
    ///
    /// Shutdown is only observed while waiting for the next frame; a frame
    /// that has been read is always dispatched to completion first.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let outcome = self.serve(shutdown).await;

        let Broker {
            inbox,
            mut registry,
            ..
        } = self;
        info!(clients = registry.len(), "broker shutting down");
        registry.clear();
        let released = inbox.close().context("failed to release shared inbox");

        outcome.and(released)
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    async fn serve<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            let received = select! {
                biased;
                _ = &mut shutdown => return Ok(()),
                received = self.inbox.recv() => received,
            };

            match received {
                Ok(Some(bytes)) => {
                    self.handle_bytes(&bytes);
                }
                Ok(None) => {
                    debug!("shared inbox has no writers; reopening");
                    self.inbox
                        .reopen()
                        .context("failed to reopen shared inbox")?;
                }
                Err(err) if is_transient(&err) => continue,
                Err(err) => return Err(err).context("failed to read shared inbox"),
            }
        }
    }

    /// Decodes and dispatches raw bytes read from the inbox. Malformed input
    /// is logged and ignored.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Dispatch {
        match Frame::decode(bytes) {
            Ok(frame) => self.handle_frame(&frame),
            Err(error) => {
                warn!(%error, "ignoring malformed frame");
                Dispatch::Ignored
            }
        }
    }

    pub fn handle_frame(&mut self, frame: &Frame) -> Dispatch {
        let sender_id = frame.sender_id();
        match frame.kind() {
            FrameKind::Connect => self.connect(sender_id, frame.reply_address()),
            FrameKind::Disconnect => match self.registry.unregister(sender_id) {
                Some(_) => {
                    info!(sender_id, "client unregistered");
                    Dispatch::Unregistered(sender_id)
                }
                None => {
                    debug!(sender_id, "disconnect from unknown client");
                    Dispatch::UnknownSender(sender_id)
                }
            },
            FrameKind::Chat => {
                info!(sender_id, text = frame.text(), "chat received");
                self.broadcast(frame)
            }
        }
    }

    fn connect(&mut self, sender_id: SenderId, reply_address: &str) -> Dispatch {
        if reply_address.is_empty() {
            warn!(sender_id, "connect without reply address ignored");
            return Dispatch::Ignored;
        }
        if self.registry.register(sender_id, reply_address) {
            info!(sender_id, fifo = reply_address, "client registered");
            Dispatch::Registered(sender_id)
        } else {
            debug!(sender_id, "client already registered");
            Dispatch::AlreadyRegistered(sender_id)
        }
    }

    /// Delivers `frame` once to every client except its sender. Failures are
    /// dropped per recipient and never retried.
    fn broadcast(&mut self, frame: &Frame) -> Dispatch {
        let sender_id = frame.sender_id();

        let mut outcomes = Vec::new();
        for recipient in self.registry.recipients(sender_id) {
            let result = self.outbox.deliver(recipient.reply_address(), frame);
            if let Err(error) = &result {
                debug!(recipient = recipient.sender_id(), %error, "delivery dropped");
            }
            outcomes.push((recipient.sender_id(), result.is_ok()));
        }

        let attempted = outcomes.len();
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (recipient, ok) in outcomes {
            if ok {
                delivered += 1;
            }
            let failures = self.registry.record_delivery(recipient, ok);
            if self.config.evict_after.is_some_and(|limit| failures >= limit) {
                self.registry.unregister(recipient);
                warn!(recipient, failures, "evicting unreachable client");
                evicted.push(recipient);
            }
        }

        info!(sender_id, recipients = attempted, delivered, "broadcast complete");
        Dispatch::Broadcast {
            sender_id,
            attempted,
            delivered,
            evicted,
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeliveryError;
    use async_trait::async_trait;
    use bytes::BytesMut;

    struct IdleInbox;

    #[async_trait]
    impl Inbox for IdleInbox {
        async fn recv(&mut self) -> io::Result<Option<BytesMut>> {
            std::future::pending().await
        }

        fn reopen(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn close(self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingOutbox {
        attempts: Vec<String>,
    }

    impl Outbox for CountingOutbox {
        fn deliver(&mut self, address: &str, _frame: &Frame) -> Result<(), DeliveryError> {
            self.attempts.push(address.to_string());
            Ok(())
        }
    }

    #[test]
    fn connect_without_reply_address_is_ignored() {
        let mut broker = Broker::new(IdleInbox, CountingOutbox::default());

        assert_eq!(broker.handle_frame(&Frame::connect(1, "")), Dispatch::Ignored);
        assert!(broker.registry().is_empty());
    }

    #[test]
    fn chat_with_no_other_clients_attempts_nothing() {
        let mut broker = Broker::new(IdleInbox, CountingOutbox::default());
        broker.handle_frame(&Frame::connect(1, "/tmp/client_fifo_1"));

        let dispatch = broker.handle_frame(&Frame::chat(1, "/tmp/client_fifo_1", "anyone?"));

        assert_eq!(
            dispatch,
            Dispatch::Broadcast {
                sender_id: 1,
                attempted: 0,
                delivered: 0,
                evicted: vec![],
            }
        );
        assert!(broker.outbox.attempts.is_empty());
    }

    #[test]
    fn chat_from_unregistered_sender_still_reaches_everyone() {
        let mut broker = Broker::new(IdleInbox, CountingOutbox::default());
        broker.handle_frame(&Frame::connect(1, "/tmp/client_fifo_1"));
        broker.handle_frame(&Frame::connect(2, "/tmp/client_fifo_2"));

        broker.handle_frame(&Frame::chat(3, "/tmp/client_fifo_3", "drive-by"));

        assert_eq!(
            broker.outbox.attempts,
            vec!["/tmp/client_fifo_1", "/tmp/client_fifo_2"]
        );
    }

    #[tokio::test]
    async fn shutdown_before_any_frame_exits_cleanly() {
        let broker = Broker::new(IdleInbox, CountingOutbox::default());
        broker
            .run_until(async {})
            .await
            .expect("broker should stop on shutdown");
    }
}
