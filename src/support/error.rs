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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not find the host \"{0}\"")]
    Resolution(String),
    #[error("Could not connect to {host}: {source}")]
    Connect { host: String, source: io::Error },
    #[error("Preconnect command failed with exit status {0}")]
    Preconnect(i32),
    #[error("Connection to {0} closed")]
    ConnectionClosed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection aborted by user")]
    Cancelled,
    #[error("Tunnel error: {0}")]
    Tunnel(String),
    #[error("{0}")]
    Protocol(String),
    #[error("Certificate verification failed: {0}")]
    Verification(String),
    #[error("Cannot negotiate TLS over this kind of connection")]
    TlsUnsupported,
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Can't write message to temporary file: {0}")]
    TempFile(#[source] io::Error),
    #[error("The message index is incorrect. Try reopening the mailbox.")]
    StaleIndex,
    #[error("No message at position {0}")]
    NoSuchMessage(usize),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Tls(#[from] openssl::ssl::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}

impl Error {
    /// Whether this error means the link to the server is gone, so that the
    /// operation may be retried after reconnecting.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            *self,
            Error::Io(..)
                | Error::ConnectionClosed(..)
                | Error::NotConnected
                | Error::Tls(..)
                | Error::Nix(..)
        )
    }

    pub fn is_protocol(&self) -> bool {
        matches!(*self, Error::Protocol(..))
    }
}
