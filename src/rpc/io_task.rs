//! Async link I/O: one thread for the byte transport, one for dispatch.
//!
//! The I/O thread uses `edge-executor` for cooperative scheduling and
//! `async-io-mini` for reactor-driven timers (no busy-spinning). Two
//! futures share the transport:
//!
//! 1. **Read** polls `Transport::read` every `read_poll` via a reactor
//!    timer and pushes decoded frames into the inbound channel.
//! 2. **Write** wakes on the session's write signal, flushes the session
//!    into the framed sink and writes the encoded bytes out.
//!
//! The dispatch worker drains the inbound channel and feeds the session,
//! so application callbacks never run on the I/O thread.
//!
//! ```text
//!  ┌──────────────────────────────────────────┐   ┌────────────────────┐
//!  │  I/O thread                              │   │  Dispatch thread   │
//!  │  ┌────────────────────────────────────┐  │   │                    │
//!  │  │ edge_executor::LocalExecutor       │  │   │  inbound.receive() │
//!  │  │  ┌─────────┐     ┌──────────────┐  │  │   │   → codec.decode   │
//!  │  │  │ Read    │     │ Write        │  │  │──▶│   → Session::      │
//!  │  │  │ poll ⏱  │     │ wake-on-work │  │  │   │     process_incoming│
//!  │  │  └─────────┘     └──────────────┘  │  │   │                    │
//!  │  └────────────────────────────────────┘  │   └────────────────────┘
//!  └──────────────────────────────────────────┘
//! ```

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use super::channels::{Inbound, LinkChannels};
use super::codec::{Codec, CodecKind, DEFAULT_MAX_FRAME_SIZE, FrameDecoder};
use super::session::Session;
use super::transport::{FramedSink, Transport};

const READ_BUF_SIZE: usize = 4096;

/// Back-off while a non-blocking write makes no progress.
const WRITE_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct IoOptions {
    pub read_poll: Duration,
    pub max_frame_size: usize,
    pub codec: CodecKind,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            read_poll: Duration::from_millis(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            codec: CodecKind::Json,
        }
    }
}

/// Threads serving one connection.
pub struct IoHandles {
    pub channels: Arc<LinkChannels>,
    io: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl IoHandles {
    /// Ask the I/O thread to stop; the session sees a disconnect.
    pub fn stop(&self) {
        self.channels.request_stop();
    }

    pub fn is_finished(&self) -> bool {
        self.io.is_finished() && self.dispatch.is_finished()
    }

    /// Wait for both threads.
    pub fn join(self) {
        if self.io.join().is_err() {
            warn!("IO: I/O thread panicked");
        }
        if self.dispatch.join().is_err() {
            warn!("IO: dispatch thread panicked");
        }
    }
}

// ── Async I/O loop ───────────────────────────────────────────

type SharedTransport<T> = Rc<RefCell<T>>;

/// Read task. The timer is wake-based, so the executor services the write
/// task between ticks.
async fn read_loop<T: Transport>(
    transport: SharedTransport<T>,
    channels: Arc<LinkChannels>,
    options: IoOptions,
) {
    let mut decoder = FrameDecoder::new(options.max_frame_size);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let frames = {
            let mut t = transport.borrow_mut();
            if !t.is_connected() {
                info!("IO: peer closed the connection");
                break;
            }
            match t.read(&mut buf) {
                Ok(0) => Vec::new(),
                Ok(n) => decoder.feed(&buf[..n]),
                Err(e) => {
                    warn!("IO: read failed: {:?}", e);
                    break;
                }
            }
        };
        let idle = frames.is_empty();
        for frame in frames {
            channels.inbound.send(Inbound::Frame(frame)).await;
        }
        if idle {
            async_io_mini::Timer::after(options.read_poll).await;
        }
    }
    channels.request_stop();
}

/// Write task. Wakes when the outbound queue signals work; no polling.
async fn write_loop<T: Transport>(
    transport: SharedTransport<T>,
    session: Arc<Session>,
    sink: Arc<FramedSink>,
    channels: Arc<LinkChannels>,
) {
    loop {
        channels.write.wait().await;

        if let Err(e) = session.flush() {
            warn!("IO: encoding outbound message failed: {}", e);
            break;
        }
        let data = sink.take_output();
        if data.is_empty() {
            continue;
        }
        if let Err(e) = write_all(&transport, &data).await {
            warn!("IO: write failed: {}", e);
            break;
        }
        debug!("IO: wrote {} bytes", data.len());
    }
    channels.request_stop();
}

async fn write_all<T: Transport>(transport: &SharedTransport<T>, data: &[u8]) -> Result<(), String> {
    let mut written = 0;
    while written < data.len() {
        let n = transport
            .borrow_mut()
            .write(&data[written..])
            .map_err(|e| format!("{e:?}"))?;
        if n == 0 {
            async_io_mini::Timer::after(WRITE_RETRY).await;
        }
        written += n;
    }
    transport.borrow_mut().flush().map_err(|e| format!("{e:?}"))
}

fn run_io_loop<T: Transport + 'static>(
    transport: T,
    session: Arc<Session>,
    sink: Arc<FramedSink>,
    channels: Arc<LinkChannels>,
    options: IoOptions,
) {
    let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();
    let transport: SharedTransport<T> = Rc::new(RefCell::new(transport));

    futures_lite::future::block_on(channels.inbound.send(Inbound::Connected));
    // Anything queued before the connection came up goes out now.
    channels.wake_writer();

    executor
        .spawn(read_loop(transport.clone(), channels.clone(), options))
        .detach();
    executor
        .spawn(write_loop(transport, session, sink, channels.clone()))
        .detach();

    info!("IO task started (read poll {:?})", options.read_poll);

    futures_lite::future::block_on(executor.run(channels.stop.wait()));

    info!("IO task stopped");
    futures_lite::future::block_on(channels.inbound.send(Inbound::Disconnected));
}

// ── Dispatch worker ──────────────────────────────────────────

fn run_dispatch(session: Arc<Session>, channels: Arc<LinkChannels>, codec: Box<dyn Codec>) {
    futures_lite::future::block_on(async {
        loop {
            match channels.inbound.receive().await {
                Inbound::Connected => session.on_connect(),
                Inbound::Frame(payload) => {
                    let envelope = match codec.decode(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("IO: dropping undecodable frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = session.process_incoming(&envelope) {
                        warn!("IO: {}", e);
                    }
                }
                Inbound::Disconnected => {
                    session.on_disconnect();
                    break;
                }
            }
        }
    });
}

// ── Thread spawn ─────────────────────────────────────────────

/// Start serving `session` over `transport`.
///
/// Installs the write signal as the session queue's waker. Encoded output
/// goes through `sink`, which must be the sink the session was built with.
pub fn spawn<T: Transport + 'static>(
    transport: T,
    session: Arc<Session>,
    sink: Arc<FramedSink>,
    options: IoOptions,
) -> std::io::Result<IoHandles> {
    let channels = Arc::new(LinkChannels::new());

    let waker_channels = channels.clone();
    session
        .queue()
        .set_waker(Some(Arc::new(move || waker_channels.wake_writer())));

    let dispatch = {
        let session = session.clone();
        let channels = channels.clone();
        let codec = options.codec.codec();
        std::thread::Builder::new()
            .name("dslink-dispatch".into())
            .spawn(move || run_dispatch(session, channels, codec))?
    };

    let io = {
        let channels = channels.clone();
        std::thread::Builder::new()
            .name("dslink-io".into())
            .spawn(move || run_io_loop(transport, session, sink, channels, options))?
    };

    Ok(IoHandles {
        channels,
        io,
        dispatch,
    })
}

// ── Tests ────────────────────────────────────────────────────
