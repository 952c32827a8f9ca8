use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FtpError, Result};

/// Server settings, loaded once at startup from the `[SERVER]` section of an
/// INI-style file. Every option is mandatory; a missing or unparsable one is
/// a fatal `Config` error naming the key.
#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  pub passive_ports: (u16, u16),
  pub session_timeout: Duration,
  pub login_timeout: Duration,
  pub data_timeout: Duration,
  pub root: PathBuf,
  pub allow_anonymous: bool,
}

fn section_values(raw: &str, wanted: &str) -> HashMap<String, String> {
  let mut values = HashMap::new();
  let mut in_section = false;
  for line in raw.lines() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
      continue;
    }
    if line.starts_with('[') && line.ends_with(']') {
      in_section = line[1..line.len() - 1].trim().eq_ignore_ascii_case(wanted);
      continue;
    }
    if !in_section {
      continue;
    }
    if let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) {
      values.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
  }
  values
}

fn required<'a>(values: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
  values
    .get(&key.to_ascii_lowercase())
    .map(String::as_str)
    .ok_or_else(|| FtpError::Config(format!("missing option '{}' in section [SERVER]", key)))
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
  raw
    .parse::<T>()
    .map_err(|_| FtpError::Config(format!("invalid value '{}' for option '{}'", raw, key)))
}

fn parse_bool(raw: &str, key: &str) -> Result<bool> {
  match raw.to_ascii_lowercase().as_str() {
    "true" | "yes" | "1" | "on" => Ok(true),
    "false" | "no" | "0" | "off" => Ok(false),
    _ => Err(FtpError::Config(format!(
      "invalid value '{}' for option '{}'",
      raw, key
    ))),
  }
}

impl ServerConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
      .map_err(|e| FtpError::Config(format!("cannot read '{}': {}", path.display(), e)))?;
    Self::parse_str(&raw)
  }

  pub fn parse_str(raw: &str) -> Result<Self> {
    let values = section_values(raw, "SERVER");
    if values.is_empty() {
      return Err(FtpError::Config("missing section [SERVER]".to_string()));
    }

    let range_raw = required(&values, "PassivePortRange")?;
    let passive_ports = match range_raw.split_once(',') {
      Some((lo, hi)) => (
        parse::<u16>(lo.trim(), "PassivePortRange")?,
        parse::<u16>(hi.trim(), "PassivePortRange")?,
      ),
      None => {
        return Err(FtpError::Config(format!(
          "invalid value '{}' for option 'PassivePortRange'",
          range_raw
        )))
      }
    };
    if passive_ports.0 > passive_ports.1 {
      return Err(FtpError::Config(format!(
        "passive port range {},{} is empty",
        passive_ports.0, passive_ports.1
      )));
    }

    let root = PathBuf::from(required(&values, "RootDirectory")?);
    fs::create_dir_all(&root)
      .map_err(|e| FtpError::Config(format!("cannot create root '{}': {}", root.display(), e)))?;
    let root = root
      .canonicalize()
      .map_err(|e| FtpError::Config(format!("cannot resolve root '{}': {}", root.display(), e)))?;

    Ok(Self {
      host: required(&values, "Host")?.to_string(),
      port: parse(required(&values, "Port")?, "Port")?,
      passive_ports,
      session_timeout: Duration::from_secs(parse(
        required(&values, "SessionTimeout")?,
        "SessionTimeout",
      )?),
      login_timeout: Duration::from_secs(parse(
        required(&values, "LoginTimeout")?,
        "LoginTimeout",
      )?),
      data_timeout: Duration::from_secs(parse(required(&values, "DataTimeout")?, "DataTimeout")?),
      root,
      allow_anonymous: parse_bool(required(&values, "AllowAnonymous")?, "AllowAnonymous")?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(root: &Path) -> String {
    format!(
      "[SERVER]\n\
       Host = 127.0.0.1\n\
       Port = 2121\n\
       PassivePortRange = 50000,50100\n\
       SessionTimeout = 300\n\
       LoginTimeout = 30\n\
       DataTimeout = 10\n\
       RootDirectory = {}\n\
       AllowAnonymous = True\n",
      root.display()
    )
  }

  #[test]
  fn parses_complete_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ServerConfig::parse_str(&sample(dir.path())).unwrap();
    assert_eq!(cfg.host, "127.0.0.1");
    assert_eq!(cfg.port, 2121);
    assert_eq!(cfg.passive_ports, (50000, 50100));
    assert_eq!(cfg.session_timeout, Duration::from_secs(300));
    assert_eq!(cfg.login_timeout, Duration::from_secs(30));
    assert_eq!(cfg.data_timeout, Duration::from_secs(10));
    assert!(cfg.allow_anonymous);
    assert_eq!(cfg.root, dir.path().canonicalize().unwrap());
  }

  #[test]
  fn missing_option_names_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let raw = sample(dir.path()).replace("DataTimeout = 10\n", "");
    let err = ServerConfig::parse_str(&raw).unwrap_err();
    assert!(err.to_string().contains("DataTimeout"));
  }

  #[test]
  fn missing_section_is_fatal() {
    let err = ServerConfig::parse_str("Host = 127.0.0.1\n").unwrap_err();
    assert!(err.to_string().contains("[SERVER]"));
  }

  #[test]
  fn rejects_malformed_port_range() {
    let dir = tempfile::tempdir().unwrap();
    let raw = sample(dir.path()).replace("50000,50100", "50100,50000");
    assert!(ServerConfig::parse_str(&raw).is_err());
    let raw = sample(dir.path()).replace("50000,50100", "50000");
    assert!(ServerConfig::parse_str(&raw).is_err());
  }

  #[test]
  fn load_reports_unreadable_file() {
    let err = ServerConfig::load("/nonexistent/ftpserver.conf").unwrap_err();
    assert!(matches!(err, FtpError::Config(_)));
  }
}
