use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::{debug, info, warn};

use crate::membership::engine::{Gossip, GossiperOptions, OutboundDatagram};
use crate::membership::listener::MemberListener;
use crate::membership::member::{MemberAddress, Service};
use crate::membership::transport::TransportActor;

/// One real-time tick drives one logical tick in the engine.
/// A protocol period (default 1s) is 10 of these.
const TICK_PERIOD: Duration = Duration::from_millis(100);

const CHANNEL_CAPACITY: usize = 100;

/// Everything the engine actor reacts to besides the passage of time.
pub enum EngineEvent {
    Datagram {
        src: MemberAddress,
        payload: bytes::Bytes,
    },
    ConnectTo(MemberAddress),
    AddListener {
        key: String,
        listener: Box<dyn MemberListener>,
    },
    RemoveListener(String),
    /// Advance one logical tick without waiting for the real interval
    /// (test hook).
    Tick,
    Shutdown,
}

/// Owns the [`Gossip`] state machine; the single place its state mutates.
pub struct EngineActor {
    mailbox: mpsc::Receiver<EngineEvent>,
    outbound: mpsc::Sender<OutboundDatagram>,
    state: Gossip,
}

impl EngineActor {
    pub fn new(
        state: Gossip,
        mailbox: mpsc::Receiver<EngineEvent>,
        outbound: mpsc::Sender<OutboundDatagram>,
    ) -> Self {
        Self {
            mailbox,
            outbound,
            state,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = time::interval(TICK_PERIOD);
        info!(local = %self.state.local_address(), "engine actor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
                event = self.mailbox.recv() => {
                    match event {
                        Some(EngineEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event).await,
                    }
                }
            }
        }
        // Dropping `outbound` is what lets the transport actor exit.
        debug!("engine actor stopped");
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Datagram { src, payload } => {
                self.state.step(src, &payload);
                self.flush_outbound().await;
            }
            EngineEvent::ConnectTo(seed) => {
                self.state.connect_to(seed);
                self.flush_outbound().await;
            }
            EngineEvent::AddListener { key, listener } => {
                self.state.add_listener(key, listener);
            }
            EngineEvent::RemoveListener(key) => {
                self.state.remove_listener(&key);
            }
            EngineEvent::Tick => {
                self.handle_tick().await;
            }
            EngineEvent::Shutdown => {}
        }
    }

    async fn handle_tick(&mut self) {
        self.state.tick();
        self.flush_outbound().await;
    }

    async fn flush_outbound(&mut self) {
        for datagram in self.state.take_outbound() {
            let _ = self.outbound.send(datagram).await;
        }
    }
}

/// Handle to a running membership node: a UDP transport actor plus an engine
/// actor, joined by channels. Cloning the handle is cheap; all clones talk to
/// the same engine.
#[derive(Clone)]
pub struct Gossiper {
    events: mpsc::Sender<EngineEvent>,
}

impl Gossiper {
    /// Bind `bind_addr` (port 0 picks a free port), spawn the actors, and
    /// return the handle together with the actual local port.
    pub async fn start(
        bind_addr: SocketAddr,
        service: Service,
        options: &GossiperOptions,
    ) -> anyhow::Result<(Gossiper, GossiperTasks, u16)> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding gossip socket on {bind_addr}"))?;
        let local = socket.local_addr().context("reading bound address")?;
        let local_address = MemberAddress::from_socket_addr(local)
            .context("gossip requires an IPv4 socket")?;

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let engine = Gossip::new(local_address, service, options);
        let engine_task = tokio::spawn(EngineActor::new(engine, events_rx, outbound_tx).run());
        let transport_task =
            tokio::spawn(TransportActor::new(socket, events_tx.clone(), outbound_rx).run());

        let handle = Gossiper { events: events_tx };
        let tasks = GossiperTasks {
            engine: engine_task,
            transport: transport_task,
        };
        Ok((handle, tasks, local.port()))
    }

    pub async fn connect_to(&self, seed: MemberAddress) {
        let _ = self.events.send(EngineEvent::ConnectTo(seed)).await;
    }

    pub async fn add_listener(&self, key: impl Into<String>, listener: Box<dyn MemberListener>) {
        let _ = self
            .events
            .send(EngineEvent::AddListener {
                key: key.into(),
                listener,
            })
            .await;
    }

    pub async fn remove_listener(&self, key: impl Into<String>) {
        let _ = self
            .events
            .send(EngineEvent::RemoveListener(key.into()))
            .await;
    }
}

/// Join handles for the two spawned actors, used for orderly shutdown.
pub struct GossiperTasks {
    engine: JoinHandle<()>,
    transport: JoinHandle<()>,
}

impl GossiperTasks {
    /// Ask the engine to stop and wait up to `grace` for both actors to
    /// drain; anything still running after that is aborted.
    pub async fn stop(self, gossiper: &Gossiper, grace: Duration) {
        let _ = gossiper.events.send(EngineEvent::Shutdown).await;
        for (name, task) in [("engine", self.engine), ("transport", self.transport)] {
            let abort = task.abort_handle();
            if timeout(grace, task).await.is_err() {
                warn!(task = name, "actor did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
