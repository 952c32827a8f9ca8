use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{FtpError, Result};
use crate::jail::PathJail;
use crate::reply::Reply;
use crate::server::commands::{parse_command, FtpCommand};
use crate::server::passive::PassiveListener;
use crate::store::Authenticator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
  AwaitUser,
  AwaitPass,
  Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
  Ascii,
  Binary,
}

/// One control connection. The session owns its sockets; every exit path
/// runs through `run`, so they are released whatever happens.
pub struct Session {
  id: Uuid,
  config: Arc<ServerConfig>,
  auth: Arc<dyn Authenticator>,
  peer: SocketAddr,
  local_ip: Ipv4Addr,
  reader: BufReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
  state: SessionState,
  candidate: Option<String>,
  user: Option<String>,
  jail: Option<PathJail>,
  transfer_type: TransferType,
  data_socket: Option<TcpStream>,
}

// Maps filesystem errors onto the two kinds a session answers with 550.
fn fs_result<T>(res: std::io::Result<T>) -> Result<T> {
  res.map_err(|e| match e.kind() {
    ErrorKind::NotFound => FtpError::NotFound(e.to_string()),
    _ => FtpError::PermissionDenied(e.to_string()),
  })
}

fn list_line(meta: &std::fs::Metadata, name: &str) -> String {
  if meta.is_dir() {
    format!("drwxr-xr-x 2 user group {} Jan 1 00:00 {}", meta.len(), name)
  } else {
    format!("-rw-r--r-- 1 user group {} Jan 1 00:00 {}", meta.len(), name)
  }
}

// One line per immediate child in enumeration order; a plain file lists as
// itself. Only the size column is real.
fn list_lines(path: &Path) -> Result<String> {
  let mut lines = Vec::new();
  let meta = fs_result(std::fs::metadata(path))?;
  if meta.is_dir() {
    for entry in fs_result(std::fs::read_dir(path))? {
      let entry = fs_result(entry)?;
      let meta = fs_result(entry.metadata())?;
      lines.push(list_line(&meta, &entry.file_name().to_string_lossy()));
    }
  } else {
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default();
    lines.push(list_line(&meta, &name));
  }
  let mut out = lines.join("\r\n");
  if !out.is_empty() {
    out.push_str("\r\n");
  }
  Ok(out)
}

impl Session {
  pub fn new(
    id: Uuid,
    socket: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    auth: Arc<dyn Authenticator>,
  ) -> Result<Self> {
    let local_ip = match socket.local_addr()?.ip() {
      IpAddr::V4(v4) => v4,
      IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    let (reader, writer) = socket.into_split();
    Ok(Self {
      id,
      config,
      auth,
      peer,
      local_ip,
      reader: BufReader::new(reader),
      writer,
      state: SessionState::AwaitUser,
      candidate: None,
      user: None,
      jail: None,
      transfer_type: TransferType::Binary,
      data_socket: None,
    })
  }

  pub async fn run(mut self) {
    info!("[{}] session opened for {}", self.id, self.peer);
    match self.serve().await {
      Ok(()) => info!(
        "[{}] session closed (user: {})",
        self.id,
        self.user.as_deref().unwrap_or("-")
      ),
      Err(e) => warn!("[{}] session aborted: {}", self.id, e),
    }
  }

  async fn serve(&mut self) -> Result<()> {
    self.send(Reply::new(220, "Welcome to usftpd.")).await?;
    loop {
      let (deadline, timeout_text) = match self.state {
        SessionState::Ready => (self.config.session_timeout, "Session timeout, closing connection."),
        _ => (self.config.login_timeout, "Login timeout, closing connection."),
      };
      let line = match timeout(deadline, self.next_line()).await {
        Err(_) => {
          self.send(Reply::new(421, timeout_text)).await.ok();
          return Ok(());
        }
        Ok(Ok(None)) => return Ok(()), // peer closed
        Ok(Ok(Some(line))) => line,
        Ok(Err(e)) => return Err(e),
      };
      let cmd = parse_command(&line);
      match &cmd {
        FtpCommand::PASS(_) => debug!("[{}] << PASS ****", self.id),
        other => debug!("[{}] << {:?}", self.id, other),
      }
      if cmd == FtpCommand::QUIT {
        self.send(Reply::new(221, "Goodbye.")).await.ok();
        return Ok(());
      }
      if let Err(e) = self.dispatch(cmd).await {
        match e {
          FtpError::PermissionDenied(_) => {
            self.send(Reply::new(550, "Permission denied.")).await?;
          }
          FtpError::NotFound(_) => {
            self.send(Reply::new(550, "File not found.")).await?;
          }
          FtpError::Transport(_) | FtpError::Timeout(_) => return Err(e),
          other => {
            self.send(Reply::new(500, "Internal server error.")).await.ok();
            return Err(other);
          }
        }
      }
    }
  }

  async fn next_line(&mut self) -> Result<Option<String>> {
    let mut line = String::new();
    let n = self.reader.read_line(&mut line).await?;
    if n == 0 {
      return Ok(None);
    }
    Ok(Some(line))
  }

  async fn send(&mut self, reply: Reply) -> Result<()> {
    debug!("[{}] >> {}", self.id, reply);
    self.writer.write_all(reply.encode().as_bytes()).await?;
    Ok(())
  }

  fn jail(&self) -> Result<&PathJail> {
    self
      .jail
      .as_ref()
      .ok_or_else(|| FtpError::PermissionDenied("not logged in".to_string()))
  }

  async fn dispatch(&mut self, cmd: FtpCommand) -> Result<()> {
    match cmd {
      FtpCommand::USER(name) => return self.handle_user(name).await,
      FtpCommand::PASS(password) => return self.handle_pass(password).await,
      _ => {}
    }
    if self.state != SessionState::Ready {
      return self
        .send(Reply::new(530, "Please login with USER and PASS."))
        .await;
    }
    match cmd {
      FtpCommand::USER(_) | FtpCommand::PASS(_) | FtpCommand::QUIT => unreachable!(),
      FtpCommand::TYPE(arg) => self.handle_type(arg).await,
      FtpCommand::MODE(arg) => self.handle_mode(arg).await,
      FtpCommand::STRU(arg) => self.handle_stru(arg).await,
      FtpCommand::PASV => self.handle_pasv().await,
      FtpCommand::LIST(path) => self.handle_list(path).await,
      FtpCommand::PWD => self.handle_pwd().await,
      FtpCommand::CWD(path) => self.handle_cwd(path).await,
      FtpCommand::CDUP => self.handle_cwd("..".to_string()).await,
      FtpCommand::MKD(path) => self.handle_mkd(path).await,
      FtpCommand::RMD(path) => self.handle_rmd(path).await,
      FtpCommand::DELE(path) => self.handle_dele(path).await,
      FtpCommand::STOR(path) => self.handle_stor(path).await,
      FtpCommand::RETR(path) => self.handle_retr(path).await,
      FtpCommand::MDTM(path) => self.handle_mdtm(path).await,
      FtpCommand::SIZE(path) => self.handle_size(path).await,
      FtpCommand::NOOP => self.send(Reply::new(200, "NOOP ok.")).await,
      FtpCommand::SYST => self.send(Reply::new(215, "UNIX Type: L8")).await,
      FtpCommand::UNKNOWN(_) => self.send(Reply::new(502, "Command not implemented.")).await,
    }
  }

  async fn handle_user(&mut self, name: String) -> Result<()> {
    // A fresh USER always restarts the login exchange, dropping whatever
    // identity and data channel the session had.
    self.candidate = Some(name);
    self.user = None;
    self.jail = None;
    self.data_socket = None;
    self.state = SessionState::AwaitPass;
    self
      .send(Reply::new(331, "Username received, need password."))
      .await
  }

  async fn handle_pass(&mut self, password: String) -> Result<()> {
    let candidate = match (self.state, self.candidate.clone()) {
      (SessionState::AwaitPass, Some(candidate)) => candidate,
      _ => {
        return self
          .send(Reply::new(530, "Please login with USER and PASS."))
          .await;
      }
    };
    match self.auth.authenticate(&candidate, &password).await {
      Ok(record) => {
        self.jail = Some(PathJail::new(&record.home)?);
        self.user = Some(record.username);
        self.state = SessionState::Ready;
        info!("[{}] {} logged in", self.id, candidate);
        self.send(Reply::new(230, "User logged in, proceed.")).await
      }
      Err(FtpError::InvalidCredentials) => {
        warn!("[{}] failed login for {}", self.id, candidate);
        self.candidate = None;
        self.state = SessionState::AwaitUser;
        self.send(Reply::new(530, "Credentials incorrect.")).await
      }
      Err(e) => Err(e),
    }
  }

  async fn handle_type(&mut self, arg: String) -> Result<()> {
    match arg.to_ascii_uppercase().as_str() {
      "I" => {
        self.transfer_type = TransferType::Binary;
        self.send(Reply::new(200, "Type set to I (binary).")).await
      }
      "A" => {
        // Recorded but bytes still pass through untranslated.
        self.transfer_type = TransferType::Ascii;
        self.send(Reply::new(200, "Type set to A (ASCII).")).await
      }
      _ => {
        self
          .send(Reply::new(504, "Command not implemented for parameter."))
          .await
      }
    }
  }

  async fn handle_mode(&mut self, arg: String) -> Result<()> {
    if arg.eq_ignore_ascii_case("S") {
      self.send(Reply::new(200, "Mode set to S (stream).")).await
    } else {
      self
        .send(Reply::new(504, "Command not implemented for parameter."))
        .await
    }
  }

  async fn handle_stru(&mut self, arg: String) -> Result<()> {
    if arg.eq_ignore_ascii_case("F") {
      self.send(Reply::new(200, "Structure set to F (file).")).await
    } else {
      self
        .send(Reply::new(504, "Command not implemented for parameter."))
        .await
    }
  }

  async fn handle_pasv(&mut self) -> Result<()> {
    // A PASV replaces any data channel left over from a previous command.
    self.data_socket = None;
    let listener = match PassiveListener::bind(self.config.passive_ports).await {
      Some(listener) => listener,
      None => {
        return self
          .send(Reply::new(425, "Can't open passive connection."))
          .await;
      }
    };
    let advertisement = listener.advertisement(self.local_ip);
    self
      .send(Reply::new(
        227,
        format!("Entering Passive Mode ({}).", advertisement),
      ))
      .await?;
    match listener.accept(self.config.data_timeout).await {
      Ok(stream) => {
        self.data_socket = Some(stream);
        Ok(())
      }
      Err(FtpError::Timeout(_)) => {
        self.send(Reply::new(425, "Data connection timed out.")).await
      }
      Err(e) => Err(e),
    }
  }

  fn take_data_socket(&mut self) -> Option<TcpStream> {
    self.data_socket.take()
  }

  async fn handle_list(&mut self, path: Option<String>) -> Result<()> {
    let mut data = match self.take_data_socket() {
      Some(data) => data,
      None => return self.send(Reply::new(425, "Use PASV first.")).await,
    };
    let target = match path {
      Some(p) => self.jail()?.resolve(&p, true)?,
      None => self.jail()?.cwd().to_path_buf(),
    };
    let listing = list_lines(&target)?;
    self
      .send(Reply::new(150, "Here comes the directory listing."))
      .await?;
    data.write_all(listing.as_bytes()).await?;
    data.shutdown().await?;
    drop(data);
    self.send(Reply::new(226, "Transfer complete.")).await
  }

  async fn handle_stor(&mut self, path: String) -> Result<()> {
    let mut data = match self.take_data_socket() {
      Some(data) => data,
      None => return self.send(Reply::new(425, "Use PASV first.")).await,
    };
    let target = self.jail()?.resolve(&path, false)?;
    let mut file = fs_result(std::fs::File::create(&target).map(tokio::fs::File::from_std))?;
    self
      .send(Reply::new(
        150,
        format!("Opening BINARY mode data connection for {}.", path),
      ))
      .await?;
    tokio::io::copy(&mut data, &mut file).await?;
    file.sync_all().await?;
    drop(data);
    self.send(Reply::new(226, "Transfer complete.")).await
  }

  async fn handle_retr(&mut self, path: String) -> Result<()> {
    let mut data = match self.take_data_socket() {
      Some(data) => data,
      None => return self.send(Reply::new(425, "Use PASV first.")).await,
    };
    let target = self.jail()?.resolve(&path, true)?;
    if !fs_result(std::fs::metadata(&target))?.is_file() {
      return Err(FtpError::PermissionDenied(format!(
        "{} is not a regular file",
        path
      )));
    }
    let mut file = fs_result(std::fs::File::open(&target).map(tokio::fs::File::from_std))?;
    self
      .send(Reply::new(
        150,
        format!("Opening BINARY mode data connection for {}.", path),
      ))
      .await?;
    tokio::io::copy(&mut file, &mut data).await?;
    data.shutdown().await?;
    drop(data);
    self.send(Reply::new(226, "Transfer complete.")).await
  }

  async fn handle_pwd(&mut self) -> Result<()> {
    let vpath = {
      let jail = self.jail()?;
      jail.ftp_path(jail.cwd())
    };
    self
      .send(Reply::new(
        257,
        format!("\"{}\" is the current directory.", vpath),
      ))
      .await
  }

  async fn handle_cwd(&mut self, path: String) -> Result<()> {
    if path.is_empty() {
      return self.send(Reply::new(501, "Syntax error in parameters.")).await;
    }
    let target = self.jail()?.resolve(&path, true)?;
    if !fs_result(std::fs::metadata(&target))?.is_dir() {
      return Err(FtpError::NotFound(format!("{} is not a directory", path)));
    }
    if let Some(jail) = self.jail.as_mut() {
      jail.set_cwd(target)?;
    }
    self.send(Reply::new(250, "Directory changed.")).await
  }

  async fn handle_mkd(&mut self, path: String) -> Result<()> {
    if path.is_empty() {
      return self.send(Reply::new(501, "Syntax error in parameters.")).await;
    }
    let target = self.jail()?.resolve(&path, false)?;
    fs_result(std::fs::create_dir(&target))?;
    self
      .send(Reply::new(257, format!("Directory created: {}.", path)))
      .await
  }

  async fn handle_rmd(&mut self, path: String) -> Result<()> {
    if path.is_empty() {
      return self.send(Reply::new(501, "Syntax error in parameters.")).await;
    }
    let target = self.jail()?.resolve(&path, true)?;
    if !fs_result(std::fs::metadata(&target))?.is_dir() {
      return Err(FtpError::NotFound(format!("{} is not a directory", path)));
    }
    fs_result(std::fs::remove_dir(&target))?;
    self
      .send(Reply::new(250, format!("Directory deleted: {}.", path)))
      .await
  }

  async fn handle_dele(&mut self, path: String) -> Result<()> {
    let target = self.jail()?.resolve(&path, true)?;
    if !fs_result(std::fs::metadata(&target))?.is_file() {
      return Err(FtpError::PermissionDenied(format!(
        "{} is not a regular file",
        path
      )));
    }
    fs_result(std::fs::remove_file(&target))?;
    self.send(Reply::new(250, "File deleted.")).await
  }

  async fn handle_mdtm(&mut self, path: String) -> Result<()> {
    let target = self.jail()?.resolve(&path, true)?;
    let meta = fs_result(std::fs::metadata(&target))?;
    if !meta.is_file() {
      return Err(FtpError::PermissionDenied(format!(
        "{} is not a regular file",
        path
      )));
    }
    let mtime: DateTime<Utc> = fs_result(meta.modified())?.into();
    self
      .send(Reply::new(213, mtime.format("%Y%m%d%H%M%S").to_string()))
      .await
  }

  async fn handle_size(&mut self, path: String) -> Result<()> {
    if self.transfer_type != TransferType::Binary {
      return self
        .send(Reply::new(550, "SIZE not allowed in ASCII mode."))
        .await;
    }
    let target = self.jail()?.resolve(&path, true)?;
    let meta = fs_result(std::fs::metadata(&target))?;
    if !meta.is_file() {
      return Err(FtpError::PermissionDenied(format!(
        "{} is not a regular file",
        path
      )));
    }
    self.send(Reply::new(213, meta.len().to_string())).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn list_line_format() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("file.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();

    let file_meta = std::fs::metadata(dir.path().join("file.txt")).unwrap();
    assert_eq!(
      list_line(&file_meta, "file.txt"),
      "-rw-r--r-- 1 user group 5 Jan 1 00:00 file.txt"
    );
    let dir_meta = std::fs::metadata(dir.path().join("docs")).unwrap();
    assert!(list_line(&dir_meta, "docs").starts_with("drwxr-xr-x 2 user group "));
    assert!(list_line(&dir_meta, "docs").ends_with(" Jan 1 00:00 docs"));
  }

  #[test]
  fn listing_covers_immediate_children() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"aaaa").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/nested.txt"), b"x").unwrap();

    let listing = list_lines(dir.path()).unwrap();
    assert!(listing.contains("a.txt"));
    assert!(listing.contains("sub"));
    assert!(!listing.contains("nested.txt"));
    assert!(listing.ends_with("\r\n"));
  }

  #[test]
  fn listing_a_file_lists_itself() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("only.txt"), b"12345678").unwrap();
    let listing = list_lines(&dir.path().join("only.txt")).unwrap();
    assert_eq!(
      listing,
      "-rw-r--r-- 1 user group 8 Jan 1 00:00 only.txt\r\n"
    );
  }

  #[test]
  fn listing_missing_path_is_not_found() {
    assert!(matches!(
      list_lines(Path::new("/definitely/not/here")),
      Err(FtpError::NotFound(_))
    ));
  }
}
