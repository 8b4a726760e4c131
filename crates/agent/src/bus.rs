use async_trait::async_trait;
use futures::FutureExt;
use nanocell_core::{InboundMessage, OutboundMessage, Result};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Span};

/// Receives outbound messages for one channel name.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn handle(&self, msg: OutboundMessage) -> Result<()>;
}

#[async_trait]
impl<F, Fut> OutboundHandler for F
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, msg: OutboundMessage) -> Result<()> {
        (self)(msg).await
    }
}

/// In-process bus with an inbound queue (toward the agent) and an outbound
/// queue (toward delivery channels). Both are unbounded FIFOs; publishing
/// never blocks.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    inbound_len: AtomicUsize,
    outbound_len: AtomicUsize,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn OutboundHandler>>>>,
    stopped: AtomicBool,
    stop_notify: Notify,
    span: Span,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_len: AtomicUsize::new(0),
            outbound_len: AtomicUsize::new(0),
            subscribers: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            span: info_span!("message_bus", component = "bus"),
        }
    }

    pub fn publish_inbound(&self, msg: InboundMessage) {
        self.inbound_len.fetch_add(1, Ordering::SeqCst);
        if self.inbound_tx.send(msg).is_err() {
            // The receiver lives in `self`, so this only happens mid-drop.
            self.inbound_len.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Waits for the next inbound message. Returns `None` once the bus is stopped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let msg = self.recv(&self.inbound_rx).await;
        if msg.is_some() {
            decrement(&self.inbound_len);
        }
        msg
    }

    pub fn publish_outbound(&self, msg: OutboundMessage) {
        self.outbound_len.fetch_add(1, Ordering::SeqCst);
        if self.outbound_tx.send(msg).is_err() {
            self.outbound_len.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Waits for the next outbound message. Returns `None` once the bus is stopped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let msg = self.recv(&self.outbound_rx).await;
        if msg.is_some() {
            decrement(&self.outbound_len);
        }
        msg
    }

    /// A raw sender into the outbound queue, for tools that publish directly.
    /// Messages sent this way are not counted by [`outbound_size`](Self::outbound_size),
    /// so the size is a lower bound while such messages are queued.
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    async fn recv<T>(&self, rx: &Mutex<mpsc::UnboundedReceiver<T>>) -> Option<T> {
        let stop = self.stop_notify.notified();
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = rx.lock().await;
        tokio::select! {
            biased;
            _ = stop => None,
            msg = rx.recv() => msg,
        }
    }

    /// Adds a handler for messages addressed to `channel`. A channel may
    /// have any number of handlers; each gets every message.
    pub fn subscribe_outbound<H>(&self, channel: &str, handler: H)
    where
        H: OutboundHandler + 'static,
    {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(handler));
        self.span.in_scope(|| debug!(channel = channel, "Outbound subscriber added"));
    }

    /// Delivers outbound messages to subscribers until [`stop`](Self::stop)
    /// is called. Handlers for a message run one after another; a handler
    /// that fails or panics is logged and skipped. Nothing is redelivered.
    pub async fn dispatch_outbound(&self) {
        self.span.in_scope(|| info!("Outbound dispatcher started"));
        while let Some(msg) = self.consume_outbound().await {
            let handlers = {
                let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
                subscribers.get(&msg.channel).cloned().unwrap_or_default()
            };

            if handlers.is_empty() {
                self.span.in_scope(|| {
                    warn!(channel = %msg.channel, chat_id = %msg.chat_id, "No subscriber for outbound message, dropping")
                });
                continue;
            }

            for handler in handlers {
                match AssertUnwindSafe(handler.handle(msg.clone())).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.span.in_scope(|| {
                        error!(channel = %msg.channel, chat_id = %msg.chat_id, error = %e, "Outbound handler failed")
                    }),
                    Err(_) => self.span.in_scope(|| {
                        error!(channel = %msg.channel, chat_id = %msg.chat_id, "Outbound handler panicked")
                    }),
                }
            }
        }
        self.span.in_scope(|| info!("Outbound dispatcher stopped"));
    }

    /// Wakes every pending consumer with `None` and makes later consumes
    /// return `None` immediately.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn inbound_size(&self) -> usize {
        self.inbound_len.load(Ordering::SeqCst)
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound_len.load(Ordering::SeqCst)
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
