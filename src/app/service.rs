//! Link service — the façade applications hold.
//!
//! [`Link`] owns the [`Session`] and the I/O threads serving it. It wires
//! configuration, the node resolver and the event sink together and
//! exposes the requester half for issuing calls.
//!
//! ```text
//!  NodeResolver ──▶ ┌────────────────────────┐ ──▶ EventSink
//!                   │          Link          │
//!   Transport ◀───▶ │ Session · I/O threads  │
//!                   └────────────────────────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::adapters::tcp::TcpTransport;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::rpc::guard::lock;
use crate::rpc::io_task::{self, IoHandles, IoOptions};
use crate::rpc::requester::Requester;
use crate::rpc::session::Session;
use crate::rpc::transport::{FramedSink, Transport};

use super::ports::{EventSink, NodeResolver};

pub struct Link {
    config: LinkConfig,
    session: Arc<Session>,
    sink: Arc<FramedSink>,
    io: Mutex<Option<IoHandles>>,
}

impl Link {
    /// Build the session. Nothing touches the network until [`start`] or
    /// [`connect`].
    ///
    /// [`start`]: Link::start
    /// [`connect`]: Link::connect
    pub fn new(
        config: LinkConfig,
        resolver: Arc<dyn NodeResolver>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let sink = Arc::new(FramedSink::new(
            config.codec,
            config.budget(),
            config.max_frame_size,
        ));
        let session = Arc::new(Session::new(
            config.session_options(),
            resolver,
            sink.clone(),
            events,
        ));
        Ok(Self {
            config,
            session,
            sink,
            io: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The requester half, if enabled.
    pub fn requester(&self) -> Result<&Arc<Requester>> {
        self.session
            .requester()
            .ok_or(Error::Config("requester is disabled"))
    }

    fn io_options(&self) -> IoOptions {
        IoOptions {
            read_poll: Duration::from_millis(self.config.read_poll_ms),
            max_frame_size: self.config.max_frame_size,
            codec: self.config.codec,
        }
    }

    /// Serve the session over `transport`. A previous connection that has
    /// ended is reaped first.
    pub fn start<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        let mut io = lock(&self.io);
        if let Some(handles) = io.take() {
            if !handles.is_finished() {
                *io = Some(handles);
                return Err(Error::Config("link is already running"));
            }
            handles.join();
        }
        *io = Some(io_task::spawn(
            transport,
            self.session.clone(),
            self.sink.clone(),
            self.io_options(),
        )?);
        info!("LINK | {} started", self.config.name);
        Ok(())
    }

    /// Connect to the configured broker over TCP and start serving.
    pub fn connect(&self) -> Result<()> {
        let transport = TcpTransport::connect(self.config.broker.as_str())?;
        self.start(transport)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.io).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Tear the connection down and wait for the I/O threads. Open
    /// requests see a disconnect.
    pub fn stop(&self) {
        let handles = lock(&self.io).take();
        if let Some(handles) = handles {
            handles.stop();
            handles.join();
            info!("LINK | {} stopped", self.config.name);
        }
    }

    /// Block until the current connection ends on its own.
    pub fn wait(&self) {
        let handles = lock(&self.io).take();
        match handles {
            Some(handles) => handles.join(),
            None => warn!("LINK | wait() without a running connection"),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop();
    }
}
