use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Address family preference, `[server] family`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    /// First address of either family, in resolver order.
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "either" | "unspec" => Ok(AddressFamily::Any),
            "ipv4" | "inet" | "4" => Ok(AddressFamily::Ipv4),
            "ipv6" | "inet6" | "6" => Ok(AddressFamily::Ipv6),
            other => Err(format!("unknown address family '{}'", other)),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressFamily::Any => "any",
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        };
        f.write_str(s)
    }
}

/// Resolve `host` and pick the first address `family` accepts.
///
/// Name resolution goes through the system resolver and may block; entry
/// points use [`Resolution`] instead.
pub fn resolve(host: &str, port: u16, family: AddressFamily) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(|addr| family.accepts(addr))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {} address for {}", family, host),
            )
        })
}

/// A resolution in flight. Literal addresses are answered on the spot; host
/// names are looked up on a short-lived helper thread so the polling entry
/// point never waits on the system resolver.
pub struct Resolution {
    rx: Receiver<io::Result<SocketAddr>>,
}

impl Resolution {
    pub fn start(host: &str, port: u16, family: AddressFamily) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        if host.parse::<IpAddr>().is_ok() {
            let _ = tx.send(resolve(host, port, family));
            return Ok(Self { rx });
        }
        let host = host.to_string();
        thread::Builder::new()
            .name("corebot-resolve".into())
            .spawn(move || {
                // The receiver is gone if the attempt was abandoned meanwhile.
                let _ = tx.send(resolve(&host, port, family));
            })?;
        Ok(Self { rx })
    }

    /// `None` while the lookup is still running.
    pub fn poll(&self) -> Option<io::Result<SocketAddr>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(io::Error::new(
                io::ErrorKind::Other,
                "resolver exited without an answer",
            ))),
        }
    }
}
