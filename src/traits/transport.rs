use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::{UdpSocket, lookup_host};

use crate::fanout::Destination;

/// Something able to carry one datagram to one collector.
///
/// Implementations must not retry: a failed send is reported to the caller and
/// forgotten.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, payload: &[u8], destination: &Destination) -> io::Result<usize>;
}

/// The first of `candidates` the socket bound at `local` can reach
fn same_family(
    local: SocketAddr,
    candidates: impl IntoIterator<Item = SocketAddr>,
) -> Option<SocketAddr> {
    candidates
        .into_iter()
        .find(|candidate| candidate.is_ipv4() == local.is_ipv4())
}

#[async_trait]
impl Transport for UdpSocket {
    async fn deliver(&self, payload: &[u8], destination: &Destination) -> io::Result<usize> {
        let local = self.local_addr()?;
        let resolved = lookup_host((destination.host(), destination.port())).await?;

        let target = same_family(local, resolved).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!(
                    "{destination} has no {} address",
                    if local.is_ipv4() { "IPv4" } else { "IPv6" }
                ),
            )
        })?;

        self.send_to(payload, target).await
    }
}
