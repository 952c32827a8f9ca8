/// Control-channel commands understood by the server. Anything else is kept
/// verbatim in `UNKNOWN` so dispatch can answer it explicitly instead of
/// falling through a catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtpCommand {
  USER(String),
  PASS(String),
  QUIT,
  TYPE(String),
  MODE(String),
  STRU(String),
  PASV,
  LIST(Option<String>),
  PWD,
  CWD(String),
  CDUP,
  MKD(String),
  RMD(String),
  DELE(String),
  STOR(String),
  RETR(String),
  MDTM(String),
  SIZE(String),
  NOOP,
  SYST,
  UNKNOWN(String),
}

fn empty_to_some(s: String) -> Option<String> {
  if s.is_empty() {
    None
  } else {
    Some(s)
  }
}

pub fn parse_command(req: &str) -> FtpCommand {
  let req = req.trim();
  let mut iter = req.split_whitespace();
  let cmd = iter.next().unwrap_or("").to_ascii_uppercase();
  let arg = iter.collect::<Vec<&str>>().join(" ");
  match cmd.as_str() {
    "USER" => FtpCommand::USER(arg),
    "PASS" => FtpCommand::PASS(arg),
    "QUIT" => FtpCommand::QUIT,
    "TYPE" => FtpCommand::TYPE(arg),
    "MODE" => FtpCommand::MODE(arg),
    "STRU" => FtpCommand::STRU(arg),
    "PASV" => FtpCommand::PASV,
    "LIST" => FtpCommand::LIST(empty_to_some(arg)),
    "PWD" => FtpCommand::PWD,
    "CWD" => FtpCommand::CWD(arg),
    "CDUP" => FtpCommand::CDUP,
    "MKD" => FtpCommand::MKD(arg),
    "RMD" => FtpCommand::RMD(arg),
    "DELE" => FtpCommand::DELE(arg),
    "STOR" => FtpCommand::STOR(arg),
    "RETR" => FtpCommand::RETR(arg),
    "MDTM" => FtpCommand::MDTM(arg),
    "SIZE" => FtpCommand::SIZE(arg),
    "NOOP" => FtpCommand::NOOP,
    "SYST" => FtpCommand::SYST,
    _ => FtpCommand::UNKNOWN(cmd),
  }
}
