use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::membership::actor::EngineEvent;
use crate::membership::engine::OutboundDatagram;
use crate::membership::member::MemberAddress;
use crate::membership::wire::MAX_DATAGRAM_BYTES;

/// Moves datagrams between the UDP socket and the engine actor. All socket
/// errors are transient here: log and keep serving. The actor exits when the
/// engine drops its end of the outbound channel.
pub struct TransportActor {
    socket: UdpSocket,
    to_engine: mpsc::Sender<EngineEvent>,
    from_engine: mpsc::Receiver<OutboundDatagram>,
}

impl TransportActor {
    pub fn new(
        socket: UdpSocket,
        to_engine: mpsc::Sender<EngineEvent>,
        from_engine: mpsc::Receiver<OutboundDatagram>,
    ) -> Self {
        Self {
            socket,
            to_engine,
            from_engine,
        }
    }

    pub async fn run(mut self) {
        if let Ok(local) = self.socket.local_addr() {
            info!(%local, "transport actor listening");
        }

        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => {
                            let Some(src) = MemberAddress::from_socket_addr(src) else {
                                debug!(%src, "ignoring datagram from non-IPv4 source");
                                continue;
                            };
                            let payload = Bytes::copy_from_slice(&buf[..len]);
                            let _ = self
                                .to_engine
                                .send(EngineEvent::Datagram { src, payload })
                                .await;
                        }
                        Err(err) => warn!(%err, "recv_from failed"),
                    }
                }

                outbound = self.from_engine.recv() => {
                    match outbound {
                        Some(datagram) => {
                            if let Err(err) = self
                                .socket
                                .send_to(&datagram.payload, datagram.target.socket_addr())
                                .await
                            {
                                warn!(target = %datagram.target, %err, "send_to failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("transport actor stopped");
    }
}
