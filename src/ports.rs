//! Port probing and allocation

use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect timeout used by plain "is something listening" checks
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// True if something accepts TCP connections on `host:port`
pub async fn is_port_open(host: &str, port: u16) -> bool {
    is_port_open_within(host, port, CONNECT_TIMEOUT).await
}

pub async fn is_port_open_within(host: &str, port: u16, timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Strategy used by deployments to decide a candidate worker is ready
pub trait ReadinessCheck: Send + Sync {
    fn check<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, bool>;
}

/// Ready once the port accepts a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpCheck;

impl ReadinessCheck for TcpCheck {
    fn check<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, bool> {
        Box::pin(is_port_open(host, port))
    }
}

/// Pick a random port in `start..end` for which `taken` is false.
/// Every port is tried at most once.
pub fn pick_port(start: u16, end: u16, mut taken: impl FnMut(u16) -> bool) -> Option<u16> {
    if start >= end {
        return None;
    }
    let mut candidates: Vec<u16> = (start..end).collect();
    let mut rng = rand::thread_rng();
    while !candidates.is_empty() {
        let index = rng.gen_range(0..candidates.len());
        let port = candidates.swap_remove(index);
        if !taken(port) {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_is_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_open("127.0.0.1", port).await);
        assert!(TcpCheck.check("127.0.0.1", port).await);

        drop(listener);
        assert!(!is_port_open("127.0.0.1", port).await);
        assert!(!is_port_open("127.0.0.1", 0).await);
    }

    #[test]
    fn test_pick_port_in_range() {
        for _ in 0..50 {
            let port = pick_port(5000, 5010, |_| false).unwrap();
            assert!((5000..5010).contains(&port));
        }
    }

    #[test]
    fn test_pick_port_skips_taken() {
        let port = pick_port(5000, 5010, |p| p != 5007).unwrap();
        assert_eq!(port, 5007);
    }

    #[test]
    fn test_pick_port_exhausted() {
        let mut tries = 0;
        assert_eq!(
            pick_port(5000, 5010, |_| {
                tries += 1;
                true
            }),
            None
        );
        assert_eq!(tries, 10);
        assert_eq!(pick_port(5000, 5000, |_| false), None);
    }
}
