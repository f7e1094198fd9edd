//! Async driver: the link task owns the read half, the rx byte ring and the
//! poll timer. A writer task owns the write half, so a peer that stops
//! reading never stalls the receive path. [`LinkHandle`] talks to the
//! session behind a mutex.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, error, info, warn};
use serial_link::{
    ByteRing, LinkEvent, LinkStats, PacketBuffer, PacketType, QueueSelector, Session,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::port::StreamPort;

/// Receive ring between the stream reader and the session
pub const RX_RING_SIZE: usize = 4096;
/// Transmit ring inside the frame encoder
pub const TX_RING_SIZE: usize = 4096;

pub type HostSession = Session<StreamPort, TX_RING_SIZE>;

struct Shared {
    session: Mutex<HostSession>,
    /// Woken after every poll tick and when the task exits
    activity: Notify,
    shutdown: Notify,
    closed: AtomicBool,
    started: Instant,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Entry point for running a link over an async byte stream
pub struct LinkHost;

impl LinkHost {
    /// Start the link task on the current tokio runtime
    pub fn spawn<S>(io: S, config: HostConfig) -> LinkHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::new(StreamPort::new(), config.link.clone())),
            activity: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        });

        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            match run(io, Arc::clone(&task_shared), &config).await {
                Ok(()) => info!("link task stopped"),
                Err(err) => error!("link task failed: {}", err),
            }
            task_shared.closed.store(true, Ordering::Release);
            task_shared.activity.notify_waiters();
        });

        LinkHandle {
            shared,
            task: Some(task),
        }
    }
}

async fn run<S>(io: S, shared: Arc<Shared>, config: &HostConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(io);

    // The port holds back further chunks until the writer reports
    // completion, so one slot is enough
    let (chunks, chunk_rx) = mpsc::channel(1);
    let mut write_task = tokio::spawn(write_chunks(writer, chunk_rx, Arc::clone(&shared)));

    let mut ring: ByteRing<RX_RING_SIZE> = ByteRing::new();
    let (mut producer, mut consumer) = ring.split();
    let mut read_buf = vec![0u8; config.read_chunk_size.max(1)];

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("link started (serial-link {})", serial_link::VERSION);

    let result = loop {
        let room = producer.writable_len().min(read_buf.len());

        tokio::select! {
            _ = shared.shutdown.notified() => {
                debug!("link shutdown requested");
                break Ok(());
            }
            joined = &mut write_task => {
                break match joined {
                    Ok(written) => written,
                    Err(err) => Err(err.into()),
                };
            }
            read = reader.read(&mut read_buf[..room]), if room > 0 => match read {
                Ok(0) => {
                    info!("link stream closed by peer");
                    break Ok(());
                }
                Ok(n) => {
                    if let Err(err) = producer.write(&read_buf[..n]) {
                        warn!("dropped {} received bytes: {}", n, err);
                    }
                }
                Err(err) => break Err(err.into()),
            },
            _ = ticker.tick() => {
                let chunk = {
                    let mut session = shared.lock();
                    session.poll(&mut consumer, shared.now());
                    session.port_mut().take_queued()
                };
                if let Some(chunk) = chunk {
                    if chunks.try_send(chunk).is_err() {
                        warn!("writer gone, transmit chunk dropped");
                    }
                }
                shared.activity.notify_waiters();
            }
        }
    };

    write_task.abort();
    result
}

/// Write chunks handed over by the link task, then keep feeding the port
/// until the encoder runs dry
async fn write_chunks<W>(
    mut writer: W,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = chunks.recv().await {
        let mut chunk = Some(first);
        while let Some(bytes) = chunk {
            writer.write_all(&bytes).await?;
            writer.flush().await?;

            let now = shared.now();
            let mut session = shared.lock();
            session.port_mut().mark_complete();
            session.poll_tx(now);
            chunk = session.port_mut().take_queued();
        }
        shared.activity.notify_waiters();
    }
    Ok(())
}

/// Handle to a running link
///
/// Dropping the handle stops the link task.
pub struct LinkHandle {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Queue a packet with a fresh id. Returns the id.
    pub fn send(&self, kind: PacketType, payload: &[u8]) -> Result<u16> {
        let now = self.shared.now();
        Ok(self.shared.lock().send(kind, payload, now)?)
    }

    /// Queue a fully built packet
    pub fn send_packet(&self, packet: PacketBuffer) -> Result<()> {
        Ok(self.shared.lock().enqueue_outbound(packet)?)
    }

    pub fn next_packet_id(&self) -> u16 {
        self.shared.lock().next_packet_id()
    }

    pub fn register_queue(&self, selector: QueueSelector) -> Result<()> {
        Ok(self.shared.lock().register_queue(selector)?)
    }

    pub fn try_dequeue(&self, selector: QueueSelector) -> Option<PacketBuffer> {
        self.shared.lock().try_dequeue(selector)
    }

    /// Wait for the next packet in `selector`'s queue
    pub async fn recv(&self, selector: QueueSelector) -> Result<PacketBuffer> {
        self.wait_for(|session| session.try_dequeue(selector)).await
    }

    pub fn next_event(&self) -> Option<LinkEvent> {
        self.shared.lock().next_event()
    }

    /// Wait for the next delivery event
    pub async fn recv_event(&self) -> Result<LinkEvent> {
        self.wait_for(HostSession::next_event).await
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.lock().stats()
    }

    /// Counters as a JSON object
    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.stats())?)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the link task and wait for it to exit
    pub async fn shutdown(mut self) -> Result<()> {
        self.shared.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }

    async fn wait_for<T>(&self, mut poll: impl FnMut(&mut HostSession) -> Option<T>) -> Result<T> {
        loop {
            let mut notified = pin!(self.shared.activity.notified());
            notified.as_mut().enable();

            let ready = {
                let mut session = self.shared.lock();
                poll(&mut session)
            };
            if let Some(value) = ready {
                return Ok(value);
            }
            if self.is_closed() {
                return Err(HostError::Closed);
            }
            notified.await;
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shared.shutdown.notify_one();
        }
    }
}
