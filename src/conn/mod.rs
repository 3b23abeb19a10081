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

//! The byte-stream connection to a mail server.
//!
//! A `Connection` owns one `Transport` (a raw socket, a tunnel subprocess, or
//! a TLS session layered over a raw socket) plus a fixed-size read-ahead
//! buffer used for character and line reads.

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace, warn};
use secstr::SecStr;

use crate::support::error::Error;
use crate::support::system_config::Config;

pub mod socket;
pub mod tls;
pub mod trust;
pub mod tunnel;

/// Size of the read-ahead buffer.
pub const INBUF_SIZE: usize = 1024;

/// Longest line `Connection::read_line()` will return.
pub const MAX_LINE: usize = 8192;

/// The server and credentials one connection is for.
#[derive(Clone, Default)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Populated lazily, e.g. when a client certificate key needs it.
    pub pass: Option<SecStr>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Account {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
    ) -> Self {
        Account {
            host: host.into(),
            port,
            user: user.into(),
            pass: None,
        }
    }
}

/// Obtains the account password on demand.
pub trait PasswordSource: Send + Sync {
    fn password(&self, account: &Account) -> Result<SecStr, Error>;
}

/// One concrete kind of byte stream.
pub trait Transport {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    /// Write some prefix of `buf`, returning how much was written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;
    /// Wait until data can be read or `timeout` (forever if `None`) passes.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<bool, Error>;
    fn close(&mut self) -> Result<(), Error>;
    /// Security strength in bits; 0 for plaintext.
    fn ssf(&self) -> u32 {
        0
    }
    /// Give up the underlying plain socket so it can be wrapped in TLS.
    ///
    /// Transports that cannot be upgraded hand themselves back.
    fn into_socket(
        self: Box<Self>,
    ) -> Result<socket::RawSocket, Box<dyn Transport>>;
}

pub struct Connection {
    pub account: Account,
    transport: Option<Box<dyn Transport>>,
    inbuf: Box<[u8; INBUF_SIZE]>,
    bufpos: usize,
    available: usize,
    ssf: u32,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("account", &self.account)
            .field("open", &self.transport.is_some())
            .field("buffered", &(self.available - self.bufpos))
            .field("ssf", &self.ssf)
            .finish()
    }
}

impl Connection {
    /// Create a closed connection for `account`.
    pub fn new(account: Account) -> Self {
        Connection {
            account,
            transport: None,
            inbuf: Box::new([0u8; INBUF_SIZE]),
            bufpos: 0,
            available: 0,
            ssf: 0,
        }
    }

    /// Create a connection which is already open over `transport`.
    pub fn with_transport(
        account: Account,
        transport: Box<dyn Transport>,
    ) -> Self {
        let mut this = Connection::new(account);
        this.attach(transport);
        this
    }

    /// Open the connection according to `config`.
    ///
    /// The preconnect command, if any, runs first. Then either the tunnel
    /// command is started or a socket is connected to the account's host.
    pub fn open(&mut self, config: &Config) -> Result<(), Error> {
        if self.transport.is_some() {
            self.close()?;
        }

        if let Some(ref command) = config.connection.preconnect {
            socket::preconnect(command)?;
        }

        let transport: Box<dyn Transport> = match config.connection.tunnel {
            Some(ref command) => Box::new(tunnel::Tunnel::spawn(command)?),
            None => Box::new(socket::RawSocket::connect(
                &self.account,
                &config.connection,
            )?),
        };
        self.attach(transport);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// The negotiated security strength in bits, 0 if unencrypted.
    pub fn ssf(&self) -> u32 {
        self.ssf
    }

    pub(crate) fn attach(&mut self, transport: Box<dyn Transport>) {
        self.ssf = transport.ssf();
        self.transport = Some(transport);
        self.bufpos = 0;
        self.available = 0;
    }

    pub(crate) fn detach(&mut self) -> Option<Box<dyn Transport>> {
        self.ssf = 0;
        self.bufpos = 0;
        self.available = 0;
        self.transport.take()
    }

    /// Close the connection.
    ///
    /// Closing an already closed connection is logged but is not an error.
    /// The connection is always left closed with a security strength of 0.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.detach() {
            Some(mut transport) => transport.close(),
            None => {
                debug!(
                    "Attempt to close closed connection to {}",
                    self.account.host
                );
                Ok(())
            }
        }
    }

    fn close_after_error(&mut self) {
        if let Some(mut transport) = self.detach() {
            if let Err(e) = transport.close() {
                debug!("Error closing {}: {}", self.account.host, e);
            }
        }
    }

    /// Read directly into `buf`, draining the read-ahead buffer first.
    ///
    /// Returns 0 at end of stream. Any failure closes the connection.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.bufpos < self.available {
            let n = buf.len().min(self.available - self.bufpos);
            buf[..n].copy_from_slice(&self.inbuf[self.bufpos..self.bufpos + n]);
            self.bufpos += n;
            return Ok(n);
        }

        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        match transport.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.close_after_error();
                Err(e)
            }
        }
    }

    /// Write all of `data`. Short writes are retried; any failure closes
    /// the connection.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        if data.starts_with(b"PASS ") {
            trace!("{}> PASS *", self.account.host);
        } else {
            trace!(
                "{}> {}",
                self.account.host,
                String::from_utf8_lossy(data).trim_end()
            );
        }

        let mut result = Ok(());
        while !data.is_empty() {
            match transport.write(data) {
                Ok(0) => {
                    result = Err(Error::ConnectionClosed(
                        self.account.host.clone(),
                    ));
                    break;
                }
                Ok(n) => data = &data[n..],
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if let Err(ref e) = result {
            warn!("Error writing to {}: {}", self.account.host, e);
            self.close_after_error();
        }
        result
    }

    /// Whether data can be read within `timeout`.
    ///
    /// Buffered data counts as ready without consulting the transport.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        if self.bufpos < self.available {
            return Ok(true);
        }

        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        match transport.poll(timeout) {
            Ok(ready) => Ok(ready),
            Err(e) => {
                self.close_after_error();
                Err(e)
            }
        }
    }

    fn fill(&mut self) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        match transport.read(&mut self.inbuf[..]) {
            Ok(0) => {
                info!("Connection to {} closed", self.account.host);
                self.close_after_error();
                Err(Error::ConnectionClosed(self.account.host.clone()))
            }
            Ok(n) => {
                self.bufpos = 0;
                self.available = n;
                Ok(())
            }
            Err(e) => {
                self.close_after_error();
                Err(e)
            }
        }
    }

    /// Read a single byte, refilling the read-ahead buffer if necessary.
    pub fn read_char(&mut self) -> Result<u8, Error> {
        if self.bufpos >= self.available {
            self.fill()?;
        }

        let ch = self.inbuf[self.bufpos];
        self.bufpos += 1;
        Ok(ch)
    }

    /// Read one line into `dst`, which is cleared first.
    ///
    /// At most `max - 1` bytes are stored. Reading stops after a `\n`, which
    /// is not stored; a `\r` immediately before it is stripped as well. If
    /// the limit is reached first, the line is returned truncated and the
    /// rest stays in the stream.
    ///
    /// Returns the number of bytes consumed from the stream, including the
    /// line terminator. If the stream fails or ends before the line is
    /// complete, the error is returned and `dst` holds what was read so far.
    pub fn read_line_into(
        &mut self,
        dst: &mut Vec<u8>,
        max: usize,
    ) -> Result<usize, Error> {
        dst.clear();
        let limit = max.saturating_sub(1);
        let mut consumed = 0;

        while dst.len() < limit {
            if self.bufpos >= self.available {
                self.fill()?;
            }

            let room = limit - dst.len();
            let end = self.available.min(self.bufpos + room);
            let window = &self.inbuf[self.bufpos..end];
            match memchr::memchr(b'\n', window) {
                Some(ix) => {
                    dst.extend_from_slice(&window[..ix]);
                    self.bufpos += ix + 1;
                    consumed += ix + 1;
                    if Some(&b'\r') == dst.last() {
                        dst.pop();
                    }
                    trace!(
                        "{}< {}",
                        self.account.host,
                        String::from_utf8_lossy(dst)
                    );
                    return Ok(consumed);
                }
                None => {
                    dst.extend_from_slice(window);
                    consumed += window.len();
                    self.bufpos = end;
                }
            }
        }

        trace!(
            "{}< {} (truncated)",
            self.account.host,
            String::from_utf8_lossy(dst)
        );
        Ok(consumed)
    }

    /// Read one line of at most `MAX_LINE - 1` bytes as a string.
    pub fn read_line(&mut self) -> Result<String, Error> {
        let mut buf = Vec::new();
        self.read_line_into(&mut buf, MAX_LINE)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_after_error();
    }
}
