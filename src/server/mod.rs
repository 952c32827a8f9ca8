use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{FtpError, Result};
use crate::store::{Authenticator, StoreAuthenticator, UserStore};

pub mod commands;
pub mod passive;
pub mod session;

use session::Session;

/// The acceptor: owns the control listener, spawns one session task per
/// connection, and tracks live sessions so shutdown can drain them.
#[derive(Clone)]
pub struct Server {
  config: Arc<ServerConfig>,
  auth: Arc<dyn Authenticator>,
  registry: Arc<Mutex<HashMap<Uuid, SocketAddr>>>,
}

impl Server {
  pub fn new(config: ServerConfig, store: Arc<UserStore>) -> Result<Self> {
    store.bootstrap_anonymous(&config.root)?;
    let auth = Arc::new(StoreAuthenticator::new(store, config.allow_anonymous));
    Ok(Self {
      config: Arc::new(config),
      auth,
      registry: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  pub fn config(&self) -> &ServerConfig {
    &self.config
  }

  pub fn session_count(&self) -> usize {
    self.registry.lock().unwrap().len()
  }

  /// Binds the control socket. An occupied address gets its own diagnostic
  /// since it is the most common operator mistake.
  pub async fn bind(&self) -> Result<TcpListener> {
    let addr = format!("{}:{}", self.config.host, self.config.port);
    match TcpListener::bind(&addr).await {
      Ok(listener) => Ok(listener),
      Err(e) if e.kind() == ErrorKind::AddrInUse => Err(FtpError::Config(format!(
        "control address {} is already in use; is another server running?",
        addr
      ))),
      Err(e) => Err(FtpError::Transport(e)),
    }
  }

  pub async fn listen<F>(&self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let listener = self.bind().await?;
    self.serve(listener, shutdown).await
  }

  /// Accept loop. Stays responsive to the shutdown future at all times;
  /// on shutdown the listener is closed and in-flight sessions drain.
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let local = listener.local_addr()?;
    info!("listening on {}", local);
    info!("serving root {}", self.config.root.display());

    let mut sessions: JoinSet<()> = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        accepted = listener.accept() => match accepted {
          Ok((socket, peer)) => {
            let id = Uuid::new_v4();
            let active = {
              let mut registry = self.registry.lock().unwrap();
              registry.insert(id, peer);
              registry.len()
            };
            info!("accepted {} ({} active)", peer, active);
            let config = self.config.clone();
            let auth = self.auth.clone();
            let registry = self.registry.clone();
            sessions.spawn(async move {
              match Session::new(id, socket, peer, config, auth) {
                Ok(session) => session.run().await,
                Err(e) => warn!("[{}] could not set up session for {}: {}", id, peer, e),
              }
              registry.lock().unwrap().remove(&id);
            });
          }
          Err(e) => warn!("accept failed: {}", e),
        },
        Some(_) = sessions.join_next() => {},
        _ = &mut shutdown => break,
      }
    }

    drop(listener);
    info!("control listener closed, draining {} session(s)", sessions.len());
    while sessions.join_next().await.is_some() {}
    Ok(())
  }
}
