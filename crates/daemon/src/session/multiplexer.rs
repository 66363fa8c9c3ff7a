//! Session output multiplexer.
//!
//! This module fans the output of one terminal process out to every attached
//! subscriber. Each subscriber has its own bounded queue, so a slow
//! connection never stalls the reader or the other subscribers. A subscriber
//! whose queue overflows is evicted rather than silently losing chunks: its
//! stream ends and [`OutputSubscription::was_evicted`] reports why.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Identifier of a subscriber within one broadcaster.
pub type SubscriberId = u64;

/// Default per-subscriber queue depth, in chunks.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Delivery statistics for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Chunks queued for the subscriber.
    pub chunks_sent: u64,
    /// Bytes queued for the subscriber.
    pub bytes_sent: u64,
}

struct Subscriber {
    label: String,
    tx: mpsc::Sender<Bytes>,
    evicted: Arc<AtomicBool>,
    stats: SubscriberStats,
}

enum SendOutcome {
    Sent,
    Overflow,
    Closed,
}

impl Subscriber {
    fn try_send(&mut self, chunk: &Bytes) -> SendOutcome {
        match self.tx.try_send(chunk.clone()) {
            Ok(()) => {
                self.stats.chunks_sent += 1;
                self.stats.bytes_sent += chunk.len() as u64;
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// The receiving end of one subscription.
pub struct OutputSubscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Bytes>,
    evicted: Arc<AtomicBool>,
}

impl OutputSubscription {
    /// The subscriber ID, used to unsubscribe.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receives the next chunk. Returns `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Takes a queued chunk without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Whether the stream ended because this subscriber fell behind.
    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

struct Inner {
    subscribers: DashMap<SubscriberId, Subscriber>,
    next_id: AtomicU64,
    capacity: usize,
    reading: AtomicBool,
    closed: AtomicBool,
}

/// Broadcasts the output of one terminal to all subscribers.
///
/// Cloning the broadcaster yields another handle to the same subscriber set.
#[derive(Clone)]
pub struct OutputBroadcaster {
    inner: Arc<Inner>,
}

impl OutputBroadcaster {
    /// Creates a broadcaster whose subscribers queue up to `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                reading: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Attaches a subscriber.
    ///
    /// The subscriber receives every chunk broadcast after this call returns.
    /// Subscribing to a closed broadcaster yields an already-ended stream.
    pub fn subscribe(&self, label: impl Into<String>) -> OutputSubscription {
        let label = label.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let evicted = Arc::new(AtomicBool::new(false));

        if !self.is_closed() {
            self.inner.subscribers.insert(
                id,
                Subscriber {
                    label: label.clone(),
                    tx,
                    evicted: Arc::clone(&evicted),
                    stats: SubscriberStats::default(),
                },
            );
            // close() may have run between the check and the insert.
            if self.is_closed() {
                self.inner.subscribers.remove(&id);
            }
            tracing::debug!(subscriber = %label, id = id, "Subscribed to output");
        }

        OutputSubscription { id, rx, evicted }
    }

    /// Detaches a subscriber, returning its statistics if it was attached.
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.inner.subscribers.remove(&id).map(|(_, sub)| {
            tracing::debug!(subscriber = %sub.label, id = id, "Unsubscribed from output");
            sub.stats
        })
    }

    /// Returns the number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Returns statistics for one subscriber.
    pub fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.inner.subscribers.get(&id).map(|sub| sub.stats.clone())
    }

    /// Whether the stream has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the reader loop has been started.
    pub fn is_reading(&self) -> bool {
        self.inner.reading.load(Ordering::SeqCst)
    }

    /// Queues a chunk for every subscriber.
    ///
    /// Subscribers whose queue is full are evicted; subscribers whose
    /// receiver is gone are removed. Returns the number of subscribers the
    /// chunk was queued for.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut delivered = 0;
        let mut evicted = Vec::new();
        let mut gone = Vec::new();

        for mut entry in self.inner.subscribers.iter_mut() {
            match entry.value_mut().try_send(&chunk) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Overflow => evicted.push(*entry.key()),
                SendOutcome::Closed => gone.push(*entry.key()),
            }
        }

        for id in evicted {
            if let Some((_, sub)) = self.inner.subscribers.remove(&id) {
                sub.evicted.store(true, Ordering::SeqCst);
                tracing::warn!(
                    subscriber = %sub.label,
                    queued = self.inner.capacity,
                    "Subscriber fell behind the output stream, evicting"
                );
            }
        }

        for id in gone {
            if let Some((_, sub)) = self.inner.subscribers.remove(&id) {
                tracing::debug!(subscriber = %sub.label, "Removed disconnected subscriber");
            }
        }

        delivered
    }

    /// Ends the stream.
    ///
    /// Subscribers still receive chunks already queued, then `None`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.subscribers.clear();
        tracing::debug!("Output stream closed");
    }

    /// Starts the reader loop on a dedicated thread.
    ///
    /// The loop reads from `reader` and broadcasts each chunk in order until
    /// EOF or a read error, then closes the stream. Only the first call has
    /// any effect.
    pub fn start_reader_loop<R>(&self, name: String, mut reader: R)
    where
        R: Read + Send + 'static,
    {
        if self.inner.reading.swap(true, Ordering::SeqCst) {
            tracing::warn!("Reader loop already running");
            return;
        }

        let broadcaster = self.clone();
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::info!(reader = %name, "PTY EOF - process exited");
                            break;
                        }
                        Ok(n) => {
                            broadcaster.broadcast(Bytes::copy_from_slice(&buffer[..n]));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO is how Linux reports a closed PTY.
                            if !broadcaster.is_closed() {
                                tracing::debug!(reader = %name, error = %e, "PTY read ended");
                            }
                            break;
                        }
                    }
                }
                broadcaster.close();
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start PTY reader thread");
            self.close();
        }
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
