//! Line-oriented demo protocol.
//!
//! One command per `\n`-terminated line:
//!
//! | Command       | Reply                 |
//! |---------------|-----------------------|
//! | `PING`        | `PONG`                |
//! | `ECHO <text>` | `<text>`              |
//! | `ID`          | connection id         |
//! | `UPGRADE`     | `UPGRADED`, then raw byte echo |
//! | `QUIT`        | `BYE`, then close     |
//! | other         | `ERR unknown command` |

use std::io::{self, BufRead, Read, Write};

use crate::net::connection::Connection;
use crate::protocol::{DuplexHandler, Protocol, ProtocolError, RequestOutcome};

const MAX_LINE: u64 = 8 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct LineProtocol;

impl Protocol for LineProtocol {
    fn process_request(&self, conn: &mut Connection) -> Result<RequestOutcome, ProtocolError> {
        let mut line = String::new();
        let n = match conn.read_stream().take(MAX_LINE).read_line(&mut line) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ProtocolError::Malformed("line is not valid UTF-8".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(RequestOutcome::Close);
        }
        if !line.ends_with('\n') && n as u64 >= MAX_LINE {
            return Err(ProtocolError::Malformed(format!(
                "line exceeds {MAX_LINE} bytes"
            )));
        }

        let command = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        let id = conn.id();
        let out = conn.write_stream();

        match verb.to_ascii_uppercase().as_str() {
            "PING" => out.write_all(b"PONG\n")?,
            "ECHO" => writeln!(out, "{arg}")?,
            "ID" => writeln!(out, "{id}")?,
            "UPGRADE" => {
                out.write_all(b"UPGRADED\n")?;
                return Ok(RequestOutcome::Upgrade(Box::new(RawEcho::default())));
            }
            "QUIT" => {
                out.write_all(b"BYE\n")?;
                return Ok(RequestOutcome::Close);
            }
            _ => out.write_all(b"ERR unknown command\n")?,
        }

        if conn.read_stream().available() > 0 {
            Ok(RequestOutcome::Continue)
        } else {
            Ok(RequestOutcome::Keepalive)
        }
    }

    fn on_busy(&self, conn: &mut Connection) {
        let out = conn.write_stream();
        let _ = out.write_all(b"BUSY\n").and_then(|_| out.flush());
    }

    fn name(&self) -> &'static str {
        "line"
    }
}

/// Echoes every byte back to the peer.
#[derive(Debug, Default)]
pub struct RawEcho {
    echoed: u64,
}

impl DuplexHandler for RawEcho {
    fn service_read(&mut self, conn: &mut Connection) -> Result<(), ProtocolError> {
        let (input, output) = conn.streams();
        let chunk = input.fill_buf()?;
        let n = chunk.len();
        output.write_all(chunk)?;
        input.consume(n);
        output.flush()?;
        self.echoed += n as u64;
        Ok(())
    }

    fn on_complete(&mut self, conn: &mut Connection) {
        tracing::debug!(connection_id = %conn.id(), echoed = self.echoed, "Raw echo finished");
    }
}
