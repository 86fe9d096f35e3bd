//! Pool addressing and the line-oriented TCP transport

use crate::{Error, Result};
use socket2::{SockRef, TcpKeepalive};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Timeout for establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(35);

/// Idle time before the first keepalive probe
const KEEPALIVE_TIME: Duration = Duration::from_secs(50);

/// Socket read timeout; bounds how long a blocked read ignores a stop request
pub const READ_POLL: Duration = Duration::from_secs(1);

/// URL schemes accepted for pool connections
const SCHEMES: [&str; 2] = ["stratum+tcp", "tcp"];

/// Host and port of a stratum pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAddress {
    pub host: String,
    pub port: u16,
}

impl PoolAddress {
    /// Parse `stratum+tcp://host:port`
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::stratum(format!("invalid pool url {:?}: {}", url, e)))?;

        if !SCHEMES.contains(&parsed.scheme()) {
            return Err(Error::stratum(format!(
                "unsupported pool url scheme {:?}, expected stratum+tcp",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::stratum(format!("pool url {:?} has no host", url)))?;
        let port = parsed
            .port()
            .ok_or_else(|| Error::stratum(format!("pool url {:?} has no port", url)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve the address
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<_> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::network(format!("{} resolved to no address", self)));
        }
        Ok(addrs)
    }
}

impl std::fmt::Display for PoolAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Open a TCP connection with the pool socket options applied
pub fn open(address: &PoolAddress) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in address.socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                configure(&stream)?;
                debug!("Connected to {} ({})", address, addr);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) if e.kind() == ErrorKind::TimedOut => {
            Error::timeout(format!("connect to {}", address))
        }
        Some(e) => Error::network(format!("connect to {}: {}", address, e)),
        None => Error::network(format!("no address to connect to for {}", address)),
    })
}

fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_interval(KEEPALIVE_TIME).with_retries(3);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Send one line, appending the newline
pub fn write_line(stream: &mut TcpStream, line: &str) -> Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    stream
        .write_all(&buf)
        .map_err(|e| Error::network(format!("send failed: {}", e)))
}

/// Close both directions, waking up a reader blocked on the socket
pub fn shutdown(stream: &TcpStream) {
    // the peer may already be gone
    let _ = stream.shutdown(Shutdown::Both);
}

/// Buffered reader yielding newline-terminated messages
///
/// Partial lines survive read timeouts and are completed on the next call.
pub struct LineReader {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        }
    }

    /// Read the next line without its terminator
    ///
    /// Returns `Ok(None)` once `stop` reports true while waiting. Fails with
    /// a timeout when no full line arrives within `stall`, and with a network
    /// error when the peer closes the connection.
    pub fn read_line(
        &mut self,
        stall: Duration,
        stop: impl Fn() -> bool,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        loop {
            if stop() {
                return Ok(None);
            }

            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(Error::network("connection closed by pool")),
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let raw = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&raw);
                    return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
                }
                Ok(_) => return Err(Error::network("connection closed mid-line")),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if started.elapsed() >= stall {
                        return Err(Error::timeout(format!(
                            "no data from pool for {}s",
                            stall.as_secs()
                        )));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::network(format!("receive failed: {}", e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_pool_address_parse() {
        let addr = PoolAddress::parse("stratum+tcp://pool.merit.me:3333").unwrap();
        assert_eq!(addr.host, "pool.merit.me");
        assert_eq!(addr.port, 3333);
        assert_eq!(addr.to_string(), "pool.merit.me:3333");

        assert!(PoolAddress::parse("tcp://127.0.0.1:1").is_ok());
    }

    #[test]
    fn test_pool_address_rejects_bad_urls() {
        assert!(PoolAddress::parse("http://pool.merit.me:3333").is_err());
        assert!(PoolAddress::parse("stratum+tcp://pool.merit.me").is_err());
        assert!(PoolAddress::parse("pool.merit.me:3333").is_err());
        assert!(PoolAddress::parse("").is_err());
    }

    #[test]
    fn test_line_reader_joins_partial_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            peer.write_all(b"{\"id\":").unwrap();
            peer.flush().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            peer.write_all(b"1}\r\nsecond\n").unwrap();
        });

        let address = PoolAddress {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let mut reader = LineReader::new(open(&address).unwrap());
        let stall = Duration::from_secs(5);

        assert_eq!(reader.read_line(stall, || false).unwrap().as_deref(), Some("{\"id\":1}"));
        assert_eq!(reader.read_line(stall, || false).unwrap().as_deref(), Some("second"));
        server.join().unwrap();
        assert!(reader.read_line(stall, || false).is_err());
    }

    #[test]
    fn test_line_reader_observes_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let _peer = listener.accept().unwrap();

        let mut reader = LineReader::new(stream);
        assert!(reader.read_line(Duration::from_secs(5), || true).unwrap().is_none());
    }
}
