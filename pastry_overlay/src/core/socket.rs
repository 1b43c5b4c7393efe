use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use tokio::net::lookup_host;

#[derive(
  Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match s.parse::<IpAddr>() {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "{}", s),
      Host::IP(ip) => write!(f, "{}", ip),
    }
  }
}

/// The TCP endpoint a node listens on.
#[derive(
  Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd,
)]
pub struct Socket {
  pub host: Host,
  pub port: u16,
}
impl Socket {
  pub fn new(host: Host, port: u16) -> Socket {
    Socket {
      host: host,
      port: port,
    }
  }

  pub fn localhost(port: u16) -> Socket {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)), port)
  }

  pub async fn as_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
    match &self.host {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, self.port)]),
      Host::DNS(s) => lookup_host((s.as_str(), self.port))
        .await
        .map(|x| x.filter(|a| a.is_ipv4()).collect()),
    }
  }

  /// Blocking resolution, for binding listeners outside the runtime.
  pub fn as_std_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
    match &self.host {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, self.port)]),
      Host::DNS(s) => (s.as_str(), self.port)
        .to_socket_addrs()
        .map(|x| x.filter(|a| a.is_ipv4()).collect()),
    }
  }
}
impl Default for Socket {
  fn default() -> Self {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 0)
  }
}
impl From<SocketAddr> for Socket {
  fn from(addr: SocketAddr) -> Self {
    Socket::new(Host::IP(addr.ip()), addr.port())
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

#[test]
fn test_socket_display() {
  let s = Socket::localhost(4000);
  assert_eq!(s.to_string(), "127.0.0.1:4000");
  let d = Socket::new(Host::from("example.org".to_string()), 80);
  assert_eq!(d.host, Host::DNS("example.org".to_string()));
  assert_eq!(d.to_string(), "example.org:80");
  assert_eq!(Host::from("10.0.0.1".to_string()), Host::IP("10.0.0.1".parse().unwrap()));
}
