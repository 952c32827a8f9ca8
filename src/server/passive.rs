use std::net::Ipv4Addr;
use std::time::Duration;

use log::debug;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{FtpError, Result};

/// A passive-mode listener bound from the configured port range. It serves
/// exactly one inbound data connection and is dropped afterwards.
pub struct PassiveListener {
  listener: TcpListener,
  port: u16,
}

/// `h1,h2,h3,h4,p1,p2` as it appears inside the 227 reply.
pub fn encode_advertisement(ip: Ipv4Addr, port: u16) -> String {
  let [h1, h2, h3, h4] = ip.octets();
  format!("{},{},{},{},{},{}", h1, h2, h3, h4, port / 256, port % 256)
}

impl PassiveListener {
  /// Scans `lo..=hi` and keeps the first port that binds. `None` when the
  /// whole range is occupied.
  pub async fn bind(range: (u16, u16)) -> Option<Self> {
    for port in range.0..=range.1 {
      match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(listener) => {
          let port = listener.local_addr().ok()?.port();
          debug!("passive listener bound on port {}", port);
          return Some(Self { listener, port });
        }
        Err(_) => continue,
      }
    }
    None
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn advertisement(&self, ip: Ipv4Addr) -> String {
    encode_advertisement(ip, self.port)
  }

  /// Accepts the single data connection, or times out and releases the
  /// port.
  pub async fn accept(self, deadline: Duration) -> Result<TcpStream> {
    match timeout(deadline, self.listener.accept()).await {
      Ok(Ok((stream, peer))) => {
        debug!("data connection accepted from {}", peer);
        Ok(stream)
      }
      Ok(Err(e)) => Err(FtpError::Transport(e)),
      Err(_) => Err(FtpError::Timeout("data connection")),
    }
  }
}
