//! UDP service announcement.
//!
//! The controller periodically broadcasts `<magic><ip>` datagrams on the
//! announce port so clients on the local network can discover it without
//! configuration. Announcement is fire-and-forget; send errors are logged
//! and the loop keeps going.

use std::net::IpAddr;
use std::sync::Arc;

use layersmith_core::config::Settings;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Pick the address to announce from the candidate interface addresses.
///
/// The first candidate matching a preferred subnet prefix wins; with no
/// preference configured (or no match) the first candidate is used, and
/// with no candidates at all we fall back to loopback.
pub fn select_address(candidates: &[IpAddr], preferred_subnets: &[String]) -> IpAddr {
    for prefix in preferred_subnets {
        if let Some(addr) = candidates
            .iter()
            .find(|a| a.to_string().starts_with(prefix.as_str()))
        {
            return *addr;
        }
    }
    candidates
        .first()
        .copied()
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Directed broadcast address for a /24 around `ip`.
///
/// Some platforms drop datagrams sent to the limited broadcast address, so
/// the subnet-directed x.y.z.255 form is used instead.
pub fn broadcast_address(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.255", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(_) => "255.255.255.255".to_string(),
    }
}

/// The local address the OS would route outbound traffic from.
async fn local_address() -> Option<IpAddr> {
    // Connecting a UDP socket sends nothing; it only resolves the source
    // address for the route.
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("198.51.100.1:80").await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Broadcast the service address until cancelled.
pub async fn announce(settings: Arc<Settings>, cancel: CancellationToken) {
    let candidates: Vec<IpAddr> = local_address().await.into_iter().collect();
    let ip = select_address(&candidates, &settings.preferred_subnets);
    let target = format!("{}:{}", broadcast_address(ip), settings.announce_port);
    let payload = format!("{}{}", settings.announce_magic, ip);

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(error = %e, "Cannot bind announcement socket");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tracing::error!(error = %e, "Cannot enable broadcast on announcement socket");
        return;
    }

    tracing::info!(ip = %ip, target = %target, "Announcing render service");

    let mut ticker = tokio::time::interval(settings.announce_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(payload.as_bytes(), &target).await {
                    tracing::warn!(error = %e, "Service announcement failed");
                }
            }
        }
    }

    tracing::info!("Service announcer shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn preferred_subnet_wins() {
        let candidates = [ip("10.0.0.5"), ip("192.168.178.20")];
        let selected = select_address(&candidates, &["192.168.178".to_string()]);
        assert_eq!(selected, ip("192.168.178.20"));
    }

    #[test]
    fn no_preference_takes_first_candidate() {
        let candidates = [ip("10.0.0.5"), ip("192.168.178.20")];
        assert_eq!(select_address(&candidates, &[]), ip("10.0.0.5"));
    }

    #[test]
    fn no_candidates_falls_back_to_loopback() {
        assert_eq!(select_address(&[], &[]), ip("127.0.0.1"));
    }

    #[test]
    fn broadcast_is_subnet_directed() {
        assert_eq!(broadcast_address(ip("192.168.178.20")), "192.168.178.255");
    }
}
