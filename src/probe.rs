//! Health-probe collaborator: raw TCP reachability and an HTTP GET routed through the proxy.
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

pub trait Probe: Send + Sync {
    /// Short-timeout TCP connect to the local data port.
    fn tcp_reachable(&self, port: u16) -> bool;

    /// Short-timeout GET through `http://127.0.0.1:<port>`; true for any non-5xx answer.
    fn http_via_proxy(&self, port: u16) -> bool;
}

#[derive(Debug, Clone)]
pub struct NetProbe {
    url: String,
    tcp_timeout: Duration,
    http_timeout: Duration,
}

impl NetProbe {
    pub fn new(url: impl Into<String>, tcp_timeout: Duration, http_timeout: Duration) -> Self {
        NetProbe {
            url: url.into(),
            tcp_timeout,
            http_timeout,
        }
    }
}

pub fn is_local_port_reachable(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

impl Probe for NetProbe {
    fn tcp_reachable(&self, port: u16) -> bool {
        is_local_port_reachable(port, self.tcp_timeout)
    }

    fn http_via_proxy(&self, port: u16) -> bool {
        let proxy_url = format!("http://127.0.0.1:{port}");
        let proxy = match reqwest::Proxy::all(&proxy_url) {
            Ok(p) => p,
            Err(e) => {
                debug!("probe: invalid proxy url {proxy_url}: {e}");
                return false;
            }
        };
        let client = match reqwest::blocking::Client::builder()
            .proxy(proxy)
            .timeout(self.http_timeout)
            .connect_timeout(self.http_timeout)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                debug!("probe: client build failed: {e}");
                return false;
            }
        };
        match client.get(&self.url).send() {
            Ok(resp) => {
                let status = resp.status();
                debug!("probe: {} via :{port} -> {}", self.url, status.as_u16());
                !status.is_server_error()
            }
            Err(e) => {
                debug!("probe: {} via :{port} failed: {e}", self.url);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// One-shot fake proxy answering every request with `status`.
    fn fake_proxy(status: u16) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let h = thread::spawn(move || {
            let (mut s, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 4096];
            let n = s.read(&mut buf).unwrap_or(0);
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            let resp = format!(
                "HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = s.write_all(resp.as_bytes());
            req
        });
        (port, h)
    }

    #[test]
    fn test_http_via_proxy_routes_through_port() {
        let (port, h) = fake_proxy(204);
        let p = NetProbe::new(
            "http://probe.invalid/generate_204",
            Duration::from_secs(1),
            Duration::from_secs(3),
        );
        assert!(p.tcp_reachable(port));
        assert!(p.http_via_proxy(port));
        let req = h.join().unwrap();
        assert!(
            req.starts_with("GET http://probe.invalid/generate_204"),
            "request should use absolute-form through the proxy: {req}"
        );
    }

    #[test]
    fn test_http_via_proxy_server_error_is_unhealthy() {
        let (port, h) = fake_proxy(502);
        let p = NetProbe::new(
            "http://probe.invalid/",
            Duration::from_secs(1),
            Duration::from_secs(3),
        );
        assert!(!p.http_via_proxy(port));
        h.join().unwrap();
    }

    #[test]
    fn test_closed_port_is_unreachable() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").expect("bind");
            l.local_addr().unwrap().port()
        };
        let p = NetProbe::new(
            "http://probe.invalid/",
            Duration::from_millis(300),
            Duration::from_millis(300),
        );
        assert!(!p.tcp_reachable(port));
        assert!(!p.http_via_proxy(port));
    }
}
