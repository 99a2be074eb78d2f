//! Minimal control-port client: one blocking TCP dialogue to authenticate,
//! fetch the current consensus, and look up descriptor bandwidths.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;

use thiserror;
use tracing::trace;

use crate::parser::RelayId;

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("Control connection I/O failed")]
    Io(#[from] io::Error),
    #[error("Control port closed the connection")]
    Disconnected,
    #[error("Control port replied '{reply}' to {command}")]
    Rejected { command: String, reply: String },
    #[error("Could not read control auth cookie from {path}")]
    Cookie {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub struct Controller {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Controller {
    pub fn connect(host: &str, port: u16) -> Result<Controller, ControlError> {
        let stream = TcpStream::connect((host, port))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Controller {
            reader,
            writer: stream,
        })
    }

    /// Authenticate with the cookie file's raw bytes, hex-encoded.
    pub fn authenticate_cookie(&mut self, cookie_path: &Path) -> Result<(), ControlError> {
        let blob = fs::read(cookie_path).map_err(|e| ControlError::Cookie {
            path: cookie_path.display().to_string(),
            source: e,
        })?;

        use std::fmt::Write as _;
        let mut hex = String::with_capacity(blob.len() * 2);
        for byte in &blob {
            write!(&mut hex, "{:02X}", byte).unwrap();
        }

        self.send(&format!("AUTHENTICATE {}", hex))?;
        // keep the cookie out of any error we report
        self.read_reply("AUTHENTICATE").map(|_| ())
    }

    /// Issue a `GETINFO` request and return the payload of the reply.
    pub fn get_info(&mut self, key: &str) -> Result<String, ControlError> {
        self.send(&format!("GETINFO {}", key))?;
        self.read_reply(&format!("GETINFO {}", key))
    }

    /// The observed bandwidth from a relay's descriptor, if the relay has
    /// one. Lookup failures are soft: relays leave the network all the time.
    pub fn descriptor_bw(&mut self, id: &RelayId) -> Option<u64> {
        let text = match self.get_info(&format!("desc/id/{}", id.as_hex())) {
            Ok(text) => text,
            Err(e) => {
                trace!("No descriptor for {}: {}", id, e);
                return None;
            }
        };
        for line in text.lines() {
            if let Some(args) = line.strip_prefix("bandwidth ") {
                let mut fields = args.split_whitespace();
                let _avg = fields.next();
                let _burst = fields.next();
                return fields.next().and_then(|observed| observed.parse().ok());
            }
        }
        None
    }

    fn send(&mut self, line: &str) -> Result<(), ControlError> {
        write!(self.writer, "{}\r\n", line)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one reply. `250` lines end the reply; a `250+` line introduces a
    /// data block terminated by a lone `.`; anything else is a rejection.
    fn read_reply(&mut self, command: &str) -> Result<String, ControlError> {
        let mut data = String::new();
        loop {
            let line = self.read_line()?;
            if line.strip_prefix("250+").is_some() {
                loop {
                    let body = self.read_line()?;
                    if body == "." {
                        break;
                    }
                    data.push_str(&body);
                    data.push('\n');
                }
            } else if let Some(rest) = line.strip_prefix("250-") {
                if let Some((_, value)) = rest.split_once('=') {
                    if !value.is_empty() {
                        data.push_str(value);
                        data.push('\n');
                    }
                }
            } else if line.starts_with("250") {
                return Ok(data);
            } else {
                return Err(ControlError::Rejected {
                    command: command.to_string(),
                    reply: line,
                });
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ControlError> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf)? == 0 {
            return Err(ControlError::Disconnected);
        }
        Ok(buf.trim_end_matches(&['\r', '\n'][..]).to_string())
    }
}
