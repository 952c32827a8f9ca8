use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{FtpError, Result};
use crate::reply::{Reply, ReplyReader};

pub mod cli;

/// Asks the user a yes/no question on the terminal. Anything but `y`
/// declines.
pub fn stdin_confirm(prompt: &str) -> bool {
  print!("{} (y/N): ", prompt);
  std::io::stdout().flush().ok();
  let mut line = String::new();
  if std::io::stdin().read_line(&mut line).is_err() {
    return false;
  }
  line.trim().eq_ignore_ascii_case("y")
}

/// Pulls the six numbers out of a `227 Entering Passive Mode
/// (h1,h2,h3,h4,p1,p2).` text.
pub(crate) fn parse_pasv(text: &str) -> Result<(Ipv4Addr, u16)> {
  let inner = text
    .find('(')
    .and_then(|start| text[start + 1..].find(')').map(|end| &text[start + 1..start + 1 + end]))
    .ok_or_else(|| FtpError::Protocol {
      code: 227,
      text: text.to_string(),
    })?;
  let parts: Vec<&str> = inner.split(',').collect();
  if parts.len() != 6 {
    return Err(FtpError::Protocol {
      code: 227,
      text: text.to_string(),
    });
  }
  let mut numbers = [0u8; 6];
  for (slot, part) in numbers.iter_mut().zip(&parts) {
    *slot = part.trim().parse::<u8>().map_err(|_| FtpError::Protocol {
      code: 227,
      text: text.to_string(),
    })?;
  }
  let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
  let port = ((numbers[4] as u16) << 8) | numbers[5] as u16;
  Ok((ip, port))
}

fn is_private(ip: Ipv4Addr) -> bool {
  ip.is_private() || ip.is_loopback()
}

/// NAT-aware choice of the data-channel host. A server behind NAT often
/// advertises its internal address; when the advertisement is private and
/// not the address we are already talking to, dial the control host
/// instead. The advertised port is always used.
pub(crate) fn data_dial_host(advertised: Ipv4Addr, control_host: &str) -> String {
  let control_ip = control_host.parse::<Ipv4Addr>().ok();
  if is_private(advertised) && control_ip != Some(advertised) {
    control_host.to_string()
  } else {
    advertised.to_string()
  }
}

/// `213 YYYYMMDDHHMMSS` (optionally with a fractional tail) as UTC.
pub(crate) fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
  let stamp = text.trim().split('.').next()?;
  NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
    .ok()
    .map(|naive| naive.and_utc())
}

/// The control-channel driver. Strictly sequential: one command, one
/// logical reply, with every exchange echoed to stdout.
pub struct FtpClient {
  host: String,
  reader: ReplyReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
  confirm: Box<dyn FnMut(&str) -> bool + Send>,
}

impl FtpClient {
  /// Connects and consumes the server greeting.
  pub async fn connect(host: &str, port: u16) -> Result<Self> {
    println!("Connecting to {}:{}", host, port);
    let stream = TcpStream::connect((host, port)).await?;
    let (reader, writer) = stream.into_split();
    let mut client = Self {
      host: host.to_string(),
      reader: ReplyReader::new(reader),
      writer,
      confirm: Box::new(stdin_confirm),
    };
    let greeting = client.read_reply().await?;
    if greeting.code != 220 {
      return Err(FtpError::Protocol {
        code: greeting.code,
        text: greeting.text,
      });
    }
    Ok(client)
  }

  /// Replaces the interactive confirmation prompt (used by tests and by
  /// callers that want non-interactive behavior).
  pub fn set_confirm(&mut self, confirm: impl FnMut(&str) -> bool + Send + 'static) {
    self.confirm = Box::new(confirm);
  }

  async fn send_command(&mut self, command: &str) -> Result<()> {
    if command.starts_with("PASS ") {
      println!(">> PASS ****");
    } else {
      println!(">> {}", command);
    }
    self
      .writer
      .write_all(format!("{}\r\n", command).as_bytes())
      .await?;
    Ok(())
  }

  async fn read_reply(&mut self) -> Result<Reply> {
    let reply = self.reader.read_reply().await?;
    println!("<< {}", reply);
    Ok(reply)
  }

  async fn command(&mut self, command: &str) -> Result<Reply> {
    self.send_command(command).await?;
    self.read_reply().await
  }

  fn expect_ok(reply: Reply) -> Result<Reply> {
    if reply.ok() {
      Ok(reply)
    } else {
      Err(FtpError::Protocol {
        code: reply.code,
        text: reply.text,
      })
    }
  }

  pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
    self.command(&format!("USER {}", username)).await?;
    let reply = self.command(&format!("PASS {}", password)).await?;
    Self::expect_ok(reply)?;
    println!("FTP login successful.");
    Ok(())
  }

  /// Binary type, stream mode, file structure. Must run after login and
  /// before any transfer; any refusal is fatal.
  pub async fn setup(&mut self) -> Result<()> {
    for command in ["TYPE I", "MODE S", "STRU F"] {
      let reply = self.command(command).await?;
      Self::expect_ok(reply)?;
    }
    println!("FTP setup successful.");
    Ok(())
  }

  /// PASV handshake plus the NAT-aware dial-back.
  async fn open_data_connection(&mut self) -> Result<TcpStream> {
    let reply = self.command("PASV").await?;
    if reply.code != 227 {
      return Err(FtpError::Protocol {
        code: reply.code,
        text: reply.text,
      });
    }
    let (advertised, port) = parse_pasv(&reply.text)?;
    let host = data_dial_host(advertised, &self.host);
    if host != advertised.to_string() {
      println!(
        "Server advertised private address {}; dialing {} instead.",
        advertised, host
      );
    }
    debug!("dialing data channel {}:{}", host, port);
    Ok(TcpStream::connect((host.as_str(), port)).await?)
  }

  /// Prints a remote listing. A 550 is reported as unavailable rather
  /// than treated as fatal.
  pub async fn list(&mut self, path: &str) -> Result<()> {
    let mut data = self.open_data_connection().await?;
    let command = if path.is_empty() {
      "LIST".to_string()
    } else {
      format!("LIST {}", path)
    };
    let reply = self.command(&command).await?;
    if reply.code == 550 {
      println!("File unavailable (e.g., file not found, no access)");
      return Ok(());
    }
    if reply.code != 150 {
      return Err(FtpError::Protocol {
        code: reply.code,
        text: reply.text,
      });
    }
    let mut listing = Vec::new();
    data.read_to_end(&mut listing).await?;
    drop(data);
    print!("{}", String::from_utf8_lossy(&listing));
    let done = self.read_reply().await?;
    Self::expect_ok(done)?;
    Ok(())
  }

  pub async fn make_directory(&mut self, path: &str) -> Result<()> {
    let reply = self.command(&format!("MKD {}", path)).await?;
    Self::expect_ok(reply)?;
    Ok(())
  }

  pub async fn remove_directory(&mut self, path: &str) -> Result<()> {
    let reply = self.command(&format!("RMD {}", path)).await?;
    Self::expect_ok(reply)?;
    Ok(())
  }

  pub async fn delete_file(&mut self, path: &str) -> Result<()> {
    let reply = self.command(&format!("DELE {}", path)).await?;
    if reply.code == 550 {
      println!(
        "Possible causes:\n1) Your account can't delete the file\n2) You're deleting a folder with rm instead of rmdir"
      );
    }
    Self::expect_ok(reply)?;
    Ok(())
  }

  /// Remote modification time, or `None` when the server refuses (550).
  pub async fn modification_time(&mut self, path: &str) -> Result<Option<DateTime<Utc>>> {
    let reply = self.command(&format!("MDTM {}", path)).await?;
    if reply.code == 213 {
      Ok(parse_mdtm(&reply.text))
    } else {
      Ok(None)
    }
  }

  /// Remote file size, or `None` when the server refuses (550).
  pub async fn size(&mut self, path: &str) -> Result<Option<u64>> {
    let reply = self.command(&format!("SIZE {}", path)).await?;
    if reply.code == 213 {
      Ok(reply.text.trim().parse::<u64>().ok())
    } else {
      Ok(None)
    }
  }

  /// Uploads a local file. Returns whether the transfer completed; a
  /// declined overwrite or a refused transfer is `false`, not an error.
  pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<bool> {
    let local_mtime: DateTime<Utc> = std::fs::metadata(local)?.modified()?.into();
    // When the remote copy is newer the user has to opt in before any
    // data channel is opened.
    if let Some(remote_mtime) = self.modification_time(remote).await? {
      if remote_mtime > local_mtime {
        let prompt = format!(
          "Remote file '{}' is newer ({}) than your local file ({}). Overwrite?",
          remote, remote_mtime, local_mtime
        );
        if !(self.confirm)(&prompt) {
          println!("Upload canceled.");
          return Ok(false);
        }
      }
    }

    let mut data = self.open_data_connection().await?;
    let reply = self.command(&format!("STOR {}", remote)).await?;
    if reply.code != 150 {
      println!("Server didn't start data transfer.");
      return Ok(false);
    }
    let mut file = tokio::fs::File::open(local).await?;
    tokio::io::copy(&mut file, &mut data).await?;
    data.shutdown().await?;
    drop(data);

    let done = self.read_reply().await?;
    if done.ok() {
      println!("File uploaded.");
      Ok(true)
    } else {
      println!("Upload failed.");
      Ok(false)
    }
  }

  /// Downloads a remote file. Returns whether the transfer completed and
  /// passed the size check; a declined overwrite is `false`.
  pub async fn download(&mut self, remote: &str, local: &Path) -> Result<bool> {
    if local.exists() {
      let prompt = format!(
        "The file '{}' already exists. Do you want to overwrite it?",
        local.display()
      );
      if !(self.confirm)(&prompt) {
        println!("Download aborted.");
        return Ok(false);
      }
    }

    let mut data = self.open_data_connection().await?;
    let reply = self.command(&format!("RETR {}", remote)).await?;
    if reply.code != 150 {
      println!("Server didn't start data transfer.");
      return Ok(false);
    }
    let mut file = tokio::fs::File::create(local).await?;
    let written = tokio::io::copy(&mut data, &mut file).await?;
    file.sync_all().await?;
    drop(data);

    let done = self.read_reply().await?;
    if !done.ok() {
      println!("File download failed.");
      return Ok(false);
    }
    // Verify against the server's own idea of the size when it offers one.
    if let Some(remote_size) = self.size(remote).await? {
      if remote_size != written {
        println!(
          "File download failed: size mismatch (remote {}, local {}).",
          remote_size, written
        );
        return Ok(false);
      }
    }
    println!("File downloaded successfully to '{}'.", local.display());
    Ok(true)
  }

  /// Always the last exchange on the control connection; failures are
  /// reported but not propagated.
  pub async fn quit(mut self) {
    if let Err(e) = self.command("QUIT").await {
      println!("Can't close connection: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pasv_text_parses() {
    let (ip, port) = parse_pasv("Entering Passive Mode (127,0,0,1,195,80).").unwrap();
    assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 1));
    assert_eq!(port, 50000);
  }

  #[test]
  fn pasv_rejects_malformed_text() {
    assert!(parse_pasv("Entering Passive Mode.").is_err());
    assert!(parse_pasv("(1,2,3,4,5)").is_err());
    assert!(parse_pasv("(1,2,3,4,5,999)").is_err());
  }

  #[test]
  fn private_advertisement_from_elsewhere_is_replaced() {
    // A NATed server advertising its internal address.
    assert_eq!(
      data_dial_host(Ipv4Addr::new(10, 0, 0, 5), "1.2.3.4"),
      "1.2.3.4"
    );
    // Loopback advertised by the loopback server we dialed: kept.
    assert_eq!(
      data_dial_host(Ipv4Addr::new(127, 0, 0, 1), "127.0.0.1"),
      "127.0.0.1"
    );
    // Public advertisement is trusted as-is.
    assert_eq!(
      data_dial_host(Ipv4Addr::new(93, 184, 216, 34), "example.com"),
      "93.184.216.34"
    );
    // Private advertisement while we dialed a hostname: replaced too.
    assert_eq!(
      data_dial_host(Ipv4Addr::new(192, 168, 1, 9), "ftp.example.com"),
      "ftp.example.com"
    );
  }

  #[test]
  fn mdtm_parses_with_and_without_fraction() {
    let t = parse_mdtm("20240315101500").unwrap();
    assert_eq!(t.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-15 10:15:00");
    assert_eq!(parse_mdtm("20240315101500.123"), parse_mdtm("20240315101500"));
    assert!(parse_mdtm("not-a-time").is_none());
  }
}
