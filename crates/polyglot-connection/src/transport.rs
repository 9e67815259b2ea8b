//! Connectors that carry envelopes between hosts.
//!
//! - [`ChannelTransport`] — two in-process ends over unbounded queues
//! - [`JsonLinesSender`] / [`JsonLinesReceiver`] — one JSON envelope per line
//!   over any async byte stream (stdio, sockets, pipes)
//!
//! Every subscription ends when its transport closes, which is how proxies
//! learn that outstanding commands will never be answered.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use polyglot_protocol::{
    CommandOrEventStream, KernelCommandAndEventReceiver, KernelCommandAndEventSender,
    KernelCommandOrEventEnvelope, KernelError, KernelResult, KernelUri,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

type Subscribers = Vec<mpsc::UnboundedSender<KernelCommandOrEventEnvelope>>;

/// One direction of traffic: a queue per subscriber, so no reader ever
/// misses an envelope. `None` once closed.
type Channel = Arc<Mutex<Option<Subscribers>>>;

fn open_channel() -> Channel {
    Arc::new(Mutex::new(Some(Vec::new())))
}

fn subscribe_channel(channel: &Channel) -> CommandOrEventStream {
    let mut guard = channel.lock();
    let Some(subscribers) = guard.as_mut() else {
        return futures_util::stream::empty().boxed();
    };
    let (sender, receiver) = mpsc::unbounded_channel();
    subscribers.push(sender);
    UnboundedReceiverStream::new(receiver).boxed()
}

fn publish_channel(channel: &Channel, envelope: KernelCommandOrEventEnvelope) -> KernelResult<()> {
    let mut guard = channel.lock();
    let Some(subscribers) = guard.as_mut() else {
        return Err(KernelError::Disconnected("channel closed".to_owned()));
    };
    subscribers.retain(|subscriber| subscriber.send(envelope.clone()).is_ok());
    if subscribers.is_empty() {
        debug!("no subscribers on channel, envelope dropped");
    }
    Ok(())
}

/// One end of an in-process connection.
#[derive(Clone)]
pub struct ChannelTransport {
    outbound: Channel,
    inbound: Channel,
    remote_host_uri: Option<KernelUri>,
}

impl ChannelTransport {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        let forward = open_channel();
        let backward = open_channel();
        (
            Self {
                outbound: Arc::clone(&forward),
                inbound: Arc::clone(&backward),
                remote_host_uri: None,
            },
            Self {
                outbound: backward,
                inbound: forward,
                remote_host_uri: None,
            },
        )
    }

    /// Record the host reached through this end.
    pub fn reaching(mut self, remote_host_uri: KernelUri) -> Self {
        self.remote_host_uri = Some(remote_host_uri);
        self
    }

    /// Close both directions for both ends.
    pub fn close(&self) {
        self.outbound.lock().take();
        self.inbound.lock().take();
        info!("channel transport closed");
    }
}

#[async_trait]
impl KernelCommandAndEventSender for ChannelTransport {
    async fn send(&self, envelope: KernelCommandOrEventEnvelope) -> KernelResult<()> {
        publish_channel(&self.outbound, envelope)
    }

    fn remote_host_uri(&self) -> Option<KernelUri> {
        self.remote_host_uri.clone()
    }
}

impl KernelCommandAndEventReceiver for ChannelTransport {
    fn subscribe(&self) -> CommandOrEventStream {
        subscribe_channel(&self.inbound)
    }
}

/// Writes one JSON envelope per line.
pub struct JsonLinesSender<W> {
    writer: tokio::sync::Mutex<W>,
    remote_host_uri: Option<KernelUri>,
}

impl<W> JsonLinesSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            remote_host_uri: None,
        }
    }

    pub fn reaching(mut self, remote_host_uri: KernelUri) -> Self {
        self.remote_host_uri = Some(remote_host_uri);
        self
    }

    /// Shut down the writer; the reading side sees end of input.
    pub async fn close(&self) -> KernelResult<()> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|err| KernelError::Transport(err.to_string()))
    }
}

#[async_trait]
impl<W> KernelCommandAndEventSender for JsonLinesSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, envelope: KernelCommandOrEventEnvelope) -> KernelResult<()> {
        let mut line = envelope.to_json()?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| KernelError::Transport(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| KernelError::Transport(err.to_string()))
    }

    fn remote_host_uri(&self) -> Option<KernelUri> {
        self.remote_host_uri.clone()
    }
}

/// Reads one JSON envelope per line and fans them out to subscribers.
///
/// Reading starts with the first subscription. Malformed lines are logged
/// and skipped; end of input closes every subscription.
pub struct JsonLinesReceiver {
    channel: Channel,
    started: watch::Sender<bool>,
}

impl JsonLinesReceiver {
    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let channel = open_channel();
        let (started, mut start) = watch::channel(false);
        let pump_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            if start.wait_for(|started| *started).await.is_err() {
                return;
            }
            let envelopes = envelope_lines(reader);
            futures_util::pin_mut!(envelopes);
            while let Some(envelope) = envelopes.next().await {
                if publish_channel(&pump_channel, envelope).is_err() {
                    break;
                }
            }
            pump_channel.lock().take();
            debug!("json lines input ended");
        });
        Self { channel, started }
    }
}

impl KernelCommandAndEventReceiver for JsonLinesReceiver {
    fn subscribe(&self) -> CommandOrEventStream {
        let stream = subscribe_channel(&self.channel);
        self.started.send_replace(true);
        stream
    }
}

/// Decoded envelopes from `reader`, one per non-blank line.
pub fn envelope_lines<R>(reader: R) -> impl Stream<Item = KernelCommandOrEventEnvelope>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match KernelCommandOrEventEnvelope::from_json(&line) {
                        Ok(envelope) => yield envelope,
                        Err(err) => warn!(%err, "skipping malformed envelope line"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "reading envelopes failed");
                    break;
                }
            }
        }
    }
}
