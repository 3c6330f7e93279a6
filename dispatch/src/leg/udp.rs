//! Reference `Leg` implementation over UDP (SPEC_FULL.md §B), grounded in
//! `pksip::transport::udp`. Enough to wire the registry/resolver/dispatcher
//! to a real socket and exercise the FD-registration contract in §4.3 end to
//! end — not a production transport (no TCP framing, no TLS, no multiplexed
//! connection leg spawning).

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::UdpSocket;
use util::ArcStr;

use crate::error::{Error, Result};
use crate::leg::{DeliverResult, Destination, Leg};
use crate::message::{Packet, TransportProtocol};

/// Parses one inbound datagram into a [`Packet`]. The real SIP grammar is
/// an external collaborator (§1); `UdpLeg` only knows how to move bytes,
/// not how to read them, so it takes one of these rather than hard-coding
/// a parser.
pub trait DatagramParser: Send + Sync {
    /// Returns `None` for a datagram that doesn't parse as a SIP message,
    /// which the leg then silently drops (§7 "malformed inbound").
    fn parse(&self, bytes: &[u8], from: SocketAddr) -> Option<Box<dyn Packet>>;
}

/// A UDP socket wrapped as a [`Leg`].
pub struct UdpLeg {
    socket: UdpSocket,
    addr: ArcStr,
    port: u16,
    contact: ArcStr,
    parser: Arc<dyn DatagramParser>,
}

impl std::fmt::Debug for UdpLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpLeg")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .finish()
    }
}

impl UdpLeg {
    /// Binds a new UDP socket at `bind_addr`. `contact` is the host:port
    /// advertised in outbound `Contact` headers, which may differ from
    /// `bind_addr` behind NAT — callers combine this with [`NatHelper`] for
    /// that case.
    ///
    /// [`NatHelper`]: crate::nat::NatHelper
    pub async fn bind(
        bind_addr: SocketAddr,
        contact: impl Into<ArcStr>,
        parser: Arc<dyn DatagramParser>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            addr: ArcStr::from(local.ip().to_string()),
            port: local.port(),
            contact: contact.into(),
            parser,
        })
    }
}

#[async_trait::async_trait]
impl Leg for UdpLeg {
    fn proto(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn addr(&self) -> ArcStr {
        self.addr.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn contact(&self) -> ArcStr {
        self.contact.clone()
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn can_deliver_to(&self, dst: &Destination) -> bool {
        dst.proto == TransportProtocol::Udp
    }

    async fn deliver(&self, bytes: &[u8], dst: &Destination) -> DeliverResult {
        let target: SocketAddr = format!("{}:{}", dst.host, dst.port).parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unresolved destination host")
        })?;
        self.socket.send_to(bytes, target).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<(Box<dyn Packet>, SocketAddr)>> {
        let mut buf = [0u8; 65536];
        let (n, from) = self.socket.recv_from(&mut buf).await.map_err(Error::Io)?;
        Ok(self.parser.parse(&buf[..n], from).map(|packet| (packet, from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};

    struct EchoParser;

    impl DatagramParser for EchoParser {
        fn parse(&self, bytes: &[u8], _from: SocketAddr) -> Option<Box<dyn Packet>> {
            if bytes.is_empty() {
                return None;
            }
            Some(Box::new(StubPacket))
        }
    }

    #[derive(Debug)]
    struct StubPacket;

    impl Packet for StubPacket {
        fn is_request(&self) -> bool {
            true
        }
        fn method(&self) -> SipMethod {
            SipMethod::Options
        }
        fn code(&self) -> Option<StatusCode> {
            None
        }
        fn cseq(&self) -> u32 {
            1
        }
        fn cseq_method(&self) -> SipMethod {
            SipMethod::Options
        }
        fn call_id(&self) -> ArcStr {
            ArcStr::from("c1")
        }
        fn uri(&self) -> Option<ArcStr> {
            None
        }
        fn tid(&self) -> ArcStr {
            ArcStr::from("tid1")
        }
        fn top_via(&self) -> Option<ArcStr> {
            None
        }
        fn top_route(&self) -> Option<ArcStr> {
            None
        }
        fn pop_route(&mut self) {}
        fn contacts(&self) -> Vec<ArcStr> {
            vec![]
        }
        fn set_contacts(&mut self, _: Vec<ArcStr>) {}
        fn dump(&self) -> Vec<u8> {
            b"OPTIONS".to_vec()
        }
    }

    #[tokio::test]
    async fn round_trip_send_and_receive() {
        let a = UdpLeg::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0",
            Arc::new(EchoParser),
        )
        .await
        .unwrap();
        let b = UdpLeg::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0",
            Arc::new(EchoParser),
        )
        .await
        .unwrap();

        let dst = Destination::new(TransportProtocol::Udp, b.addr(), b.port());
        a.deliver(b"OPTIONS sip:test SIP/2.0", &dst).await.unwrap();

        let (packet, from) = b.receive().await.unwrap().unwrap();
        assert!(packet.is_request());
        assert_eq!(from.ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn fd_is_present() {
        let leg = UdpLeg::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0",
            Arc::new(EchoParser),
        )
        .await
        .unwrap();
        assert!(leg.fd().is_some());
    }
}
