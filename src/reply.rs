use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{FtpError, Result};

/// A single logical FTP reply: a three-digit code and its text. The text of
/// a multi-line reply holds the intermediate lines joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  pub code: u16,
  pub text: String,
}

impl Reply {
  pub fn new(code: u16, text: impl Into<String>) -> Self {
    Self {
      code,
      text: text.into(),
    }
  }

  /// 2xx replies are positive completions.
  pub fn ok(&self) -> bool {
    self.code / 100 == 2
  }

  /// Wire form, CRLF terminated. Text containing `\n` becomes a multi-line
  /// reply: `DDD-first`, bare middle lines, `DDD last`.
  pub fn encode(&self) -> String {
    let lines: Vec<&str> = self.text.split('\n').collect();
    if lines.len() == 1 {
      return format!("{:03} {}\r\n", self.code, self.text);
    }
    let mut out = format!("{:03}-{}\r\n", self.code, lines[0]);
    for line in &lines[1..lines.len() - 1] {
      out.push_str(line);
      out.push_str("\r\n");
    }
    out.push_str(&format!("{:03} {}\r\n", self.code, lines[lines.len() - 1]));
    out
  }
}

impl fmt::Display for Reply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.code, self.text)
  }
}

fn parse_code(line: &str) -> Option<(u16, u8)> {
  if line.len() < 4 || !line.is_char_boundary(3) {
    return None;
  }
  let (digits, rest) = line.split_at(3);
  let code = digits.parse::<u16>().ok()?;
  let sep = rest.as_bytes()[0];
  if sep == b' ' || sep == b'-' {
    Some((code, sep))
  } else {
    None
  }
}

/// Buffering reader that yields exactly one logical reply per call, however
/// the bytes were chunked by the transport. Lines that do not start with a
/// numeric code yield code 0 with the raw text preserved.
pub struct ReplyReader<R> {
  inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
  pub fn new(inner: R) -> Self {
    Self {
      inner: BufReader::new(inner),
    }
  }

  async fn next_line(&mut self) -> Result<String> {
    let mut line = String::new();
    let n = self.inner.read_line(&mut line).await?;
    if n == 0 {
      return Err(FtpError::Transport(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "control connection closed",
      )));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
      line.pop();
    }
    Ok(line)
  }

  pub async fn read_reply(&mut self) -> Result<Reply> {
    let first = self.next_line().await?;
    let (code, sep) = match parse_code(&first) {
      Some(pair) => pair,
      None => return Ok(Reply::new(0, first)),
    };
    let mut text = first[4..].to_string();
    if sep == b' ' {
      return Ok(Reply::new(code, text));
    }
    // Multi-line: gather until a line opens with the same code and a space.
    loop {
      let line = self.next_line().await?;
      if let Some((end_code, b' ')) = parse_code(&line) {
        if end_code == code {
          text.push('\n');
          text.push_str(&line[4..]);
          return Ok(Reply::new(code, text));
        }
      }
      text.push('\n');
      text.push_str(&line);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  async fn decode(raw: &[u8]) -> Reply {
    ReplyReader::new(raw).read_reply().await.unwrap()
  }

  #[tokio::test]
  async fn single_line_round_trip() {
    let reply = Reply::new(230, "User logged in, proceed.");
    assert_eq!(reply.encode(), "230 User logged in, proceed.\r\n");
    let decoded = decode(reply.encode().as_bytes()).await;
    assert_eq!(decoded, reply);
    assert!(decoded.ok());
  }

  #[tokio::test]
  async fn multi_line_terminates_on_matching_code() {
    let decoded = decode(b"120-Hi\r\n more\r\n120 Bye\r\n").await;
    assert_eq!(decoded.code, 120);
    assert_eq!(decoded.text, "Hi\n more\nBye");
    assert!(!decoded.ok());
  }

  #[tokio::test]
  async fn multi_line_ignores_other_codes_inside_body() {
    let decoded = decode(b"211-Status:\r\n212 not the end\r\n211 End.\r\n").await;
    assert_eq!(decoded.code, 211);
    assert_eq!(decoded.text, "Status:\n212 not the end\nEnd.");
  }

  #[tokio::test]
  async fn non_numeric_prefix_yields_code_zero() {
    let decoded = decode(b"garbage line\r\n").await;
    assert_eq!(decoded.code, 0);
    assert_eq!(decoded.text, "garbage line");
  }

  #[tokio::test]
  async fn one_reply_per_call() {
    let mut reader = ReplyReader::new(&b"200 Ok.\r\n221 Goodbye.\r\n"[..]);
    assert_eq!(reader.read_reply().await.unwrap().code, 200);
    assert_eq!(reader.read_reply().await.unwrap().code, 221);
    assert!(reader.read_reply().await.is_err());
  }

  #[tokio::test]
  async fn assembles_across_partial_writes() {
    let (client, server) = tokio::io::duplex(16);
    let writer = tokio::spawn(async move {
      let mut server = server;
      for chunk in [&b"227 Entering Passive"[..], &b" Mode (127,0,0,1,195,80).\r\n"[..]] {
        server.write_all(chunk).await.unwrap();
        tokio::task::yield_now().await;
      }
    });
    let reply = ReplyReader::new(client).read_reply().await.unwrap();
    writer.await.unwrap();
    assert_eq!(reply.code, 227);
    assert_eq!(reply.text, "Entering Passive Mode (127,0,0,1,195,80).");
  }

  #[tokio::test]
  async fn multi_line_encode_round_trip() {
    let reply = Reply::new(211, "Status:\nuser anonymous\nEnd.");
    assert_eq!(reply.encode(), "211-Status:\r\nuser anonymous\r\n211 End.\r\n");
    assert_eq!(decode(reply.encode().as_bytes()).await, reply);
  }
}
