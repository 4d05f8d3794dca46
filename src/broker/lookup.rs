//! Broker host resolution with a local-network fallback.

use log::{debug, info, warn};
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon};
use std::time::{Duration, Instant};

const MDNS_TIMEOUT: Duration = Duration::from_secs(5);

/// `<host>.local.`, the name an mDNS responder answers to.
fn mdns_hostname(host: &str) -> String {
    let host = host.trim_end_matches('.');
    let host = host.strip_suffix(".local").unwrap_or(host);
    format!("{host}.local.")
}

/// Returns the address to connect to for `host`.
///
/// Names that DNS resolves are returned unchanged. Otherwise an mDNS lookup
/// is attempted and its first address is used; if that fails too the
/// configured host is returned and the connection attempt will report the
/// error.
pub async fn resolve_broker(host: &str, port: u16) -> String {
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map(|mut addrs| addrs.next().is_some());
    match resolved {
        Ok(true) => return host.to_string(),
        Ok(false) => warn!("{host} did not resolve to any address"),
        Err(e) => warn!("Could not resolve {host}: {e}"),
    }

    let hostname = mdns_hostname(host);
    let found = tokio::task::spawn_blocking(move || mdns_lookup(&hostname, MDNS_TIMEOUT))
        .await
        .unwrap_or_else(|e| {
            warn!("mDNS lookup task failed: {e}");
            None
        });

    match found {
        Some(address) => {
            info!("Resolved {host} to {address} via mDNS");
            address
        }
        None => host.to_string(),
    }
}

fn mdns_lookup(hostname: &str, timeout: Duration) -> Option<String> {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            warn!("mDNS unavailable: {e}");
            return None;
        }
    };

    let events = match daemon.resolve_hostname(hostname, Some(timeout.as_millis() as u64)) {
        Ok(events) => events,
        Err(e) => {
            warn!("mDNS lookup of {hostname} failed: {e}");
            let _ = daemon.shutdown();
            return None;
        }
    };

    let deadline = Instant::now() + timeout;
    let mut found = None;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Ok(HostnameResolutionEvent::AddressesFound(name, addresses)) => {
                debug!("mDNS: {name} has {addresses:?}");
                found = addresses.iter().next().map(|address| address.to_string());
                if found.is_some() {
                    break;
                }
            }
            Ok(HostnameResolutionEvent::SearchTimeout(_)) | Err(_) => break,
            Ok(event) => debug!("mDNS: {event:?}"),
        }
    }

    if found.is_none() {
        warn!("No mDNS answer for {hostname}");
    }
    let _ = daemon.shutdown();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mdns_hostname() {
        assert_eq!(mdns_hostname("broker"), "broker.local.");
        assert_eq!(mdns_hostname("broker.local"), "broker.local.");
        assert_eq!(mdns_hostname("broker.local."), "broker.local.");
    }

    #[tokio::test]
    async fn test_resolvable_host_is_unchanged() {
        assert_eq!(resolve_broker("127.0.0.1", 1883).await, "127.0.0.1");
    }
}
