//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Popsync.
//
// Popsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Popsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Popsync. If not, see <http://www.gnu.org/licenses/>.

//! The command/reply layer the mailbox talks to the server through.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::conn::trust::TrustEngine;
use crate::conn::{tls, Connection, PasswordSource, MAX_LINE};
use crate::support::error::Error;
use crate::support::system_config::Config;

/// An authenticated POP session.
///
/// Commands are given without their line terminator.
pub trait Session {
    /// Connect and log in, returning the mailbox size in bytes.
    fn open(&mut self) -> Result<u64, Error>;
    /// Issue a command with a single-line reply, returning the text after
    /// `+OK`. A `-ERR` reply becomes `Error::Protocol`.
    fn query(&mut self, command: &str) -> Result<String, Error>;
    /// Issue a command with a multi-line reply, passing each line of the
    /// reply to `sink` with the line terminator and dot-stuffing removed.
    ///
    /// Once `sink` fails it is not called again, and its error is returned
    /// after the rest of the reply has been consumed.
    fn fetch(
        &mut self,
        command: &str,
        sink: &mut dyn FnMut(&str) -> Result<(), Error>,
    ) -> Result<(), Error>;
    /// Drop the connection without logging out.
    fn close(&mut self);
}

/// How TLS is negotiated with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Plain,
    /// Handshake immediately after connecting (`pop3s`).
    Direct,
    /// Upgrade with `STLS` after the greeting.
    StartTls,
}

/// A `Session` over a `Connection` which logs in with `USER`/`PASS`.
pub struct PlainSession {
    conn: Connection,
    config: Config,
    tls_mode: TlsMode,
    engine: Option<Arc<TrustEngine>>,
    password: Box<dyn PasswordSource>,
    /// Set once logged in. The server ends an authenticated session on
    /// `QUIT`, so it is never reused.
    authenticated: bool,
}

impl PlainSession {
    /// `engine` is required unless `tls_mode` is `Plain`.
    pub fn new(
        conn: Connection,
        config: Config,
        tls_mode: TlsMode,
        engine: Option<Arc<TrustEngine>>,
        password: Box<dyn PasswordSource>,
    ) -> Self {
        PlainSession {
            conn,
            config,
            tls_mode,
            engine,
            password,
            authenticated: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn engine(&self) -> Result<Arc<TrustEngine>, Error> {
        self.engine.clone().ok_or_else(|| {
            Error::Config("TLS requested without a trust engine".to_owned())
        })
    }

    fn read_status(&mut self) -> Result<String, Error> {
        let line = self.conn.read_line()?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim_start().to_owned())
        } else if line.starts_with("-ERR") {
            Err(Error::Protocol(line))
        } else {
            warn!("Unexpected reply from {}: {}", self.conn.account.host, line);
            Err(Error::Protocol(format!("Unexpected reply: {}", line)))
        }
    }

    fn send(&mut self, command: &str) -> Result<(), Error> {
        let mut line = String::with_capacity(command.len() + 2);
        line.push_str(command);
        line.push_str("\r\n");
        self.conn.write_all(line.as_bytes())
    }

    /// Read one reply line of any length.
    fn read_long_line(&mut self, buf: &mut Vec<u8>) -> Result<String, Error> {
        let mut line = Vec::new();
        loop {
            let consumed = self.conn.read_line_into(buf, MAX_LINE)?;
            line.extend_from_slice(buf);
            // Only a truncated read consumes exactly what it stored.
            if consumed != buf.len() {
                if Some(&b'\r') == line.last() {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    fn login(&mut self) -> Result<(), Error> {
        let user = self.conn.account.user.clone();
        self.query(&format!("USER {}", user))?;

        if self.conn.account.pass.is_none() {
            let pass = self.password.password(&self.conn.account)?;
            self.conn.account.pass = Some(pass);
        }
        let pass = self
            .conn
            .account
            .pass
            .as_ref()
            .map(|p| String::from_utf8_lossy(p.unsecure()).into_owned())
            .unwrap_or_default();

        match self.query(&format!("PASS {}", pass)) {
            Ok(_) => Ok(()),
            Err(e) => {
                // A wrong password must be asked for again.
                if e.is_protocol() {
                    self.conn.account.pass = None;
                }
                Err(e)
            }
        }
    }
}

impl Session for PlainSession {
    fn open(&mut self) -> Result<u64, Error> {
        if self.authenticated || !self.conn.is_open() {
            self.close();
            self.conn.open(&self.config)?;
            if TlsMode::Direct == self.tls_mode {
                let engine = self.engine()?;
                tls::secure(&mut self.conn, &engine)?;
            }
        }

        let greeting = self.read_status()?;
        debug!("Greeting from {}: {}", self.conn.account.host, greeting);

        if TlsMode::StartTls == self.tls_mode {
            self.query("STLS")?;
            let engine = self.engine()?;
            tls::starttls(&mut self.conn, &engine)?;
        }

        self.login()?;
        self.authenticated = true;

        let stat = self.query("STAT")?;
        let size = stat
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                Error::Protocol(format!("Unparsable STAT reply: {}", stat))
            })?;
        info!(
            "Logged in to {} as {}",
            self.conn.account.host, self.conn.account.user
        );
        Ok(size)
    }

    fn query(&mut self, command: &str) -> Result<String, Error> {
        self.send(command)?;
        self.read_status()
    }

    fn fetch(
        &mut self,
        command: &str,
        sink: &mut dyn FnMut(&str) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.query(command)?;

        let mut buf = Vec::new();
        let mut sink_error = None;
        loop {
            let line = self.read_long_line(&mut buf)?;
            if "." == line {
                break;
            }

            if sink_error.is_none() {
                let line = line.strip_prefix('.').unwrap_or(&line);
                if let Err(e) = sink(line) {
                    sink_error = Some(e);
                }
            }
        }

        match sink_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.authenticated = false;
        if !self.conn.is_open() {
            return;
        }
        if let Err(e) = self.conn.close() {
            debug!("Error closing {}: {}", self.conn.account.host, e);
        }
    }
}
