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

//! TLS over an established socket.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions,
    SslStream, SslVerifyMode,
};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509;

use super::socket::{poll_fd, RawSocket};
use super::trust::TrustEngine;
use super::{Account, Connection, Transport};
use crate::support::error::Error;
use crate::support::signals;
use crate::support::system_config::TlsConfig;

/// Negotiate TLS on an open connection whose server expects a handshake
/// right away.
///
/// On success the connection reads and writes through TLS and reports the
/// negotiated key size as its security strength. On failure the connection
/// is closed.
pub fn secure(
    conn: &mut Connection,
    engine: &Arc<TrustEngine>,
) -> Result<(), Error> {
    negotiate(conn, engine, false)
}

/// Upgrade a plaintext connection after the server agreed to start TLS.
///
/// Uses a context of its own, in which SSLv3 is never offered.
pub fn starttls(
    conn: &mut Connection,
    engine: &Arc<TrustEngine>,
) -> Result<(), Error> {
    negotiate(conn, engine, true)
}

fn negotiate(
    conn: &mut Connection,
    engine: &Arc<TrustEngine>,
    starttls: bool,
) -> Result<(), Error> {
    let transport = conn.detach().ok_or(Error::NotConnected)?;
    let socket = match transport.into_socket() {
        Ok(socket) => socket,
        Err(mut transport) => {
            if let Err(e) = transport.close() {
                debug!("Error closing {}: {}", conn.account.host, e);
            }
            return Err(Error::TlsUnsupported);
        }
    };

    let tls = handshake(socket, &mut conn.account, engine, starttls)?;
    info!(
        "{} connection using {} ({})",
        if starttls { "STARTTLS" } else { "SSL/TLS" },
        tls.stream.ssl().version_str(),
        tls.stream
            .ssl()
            .current_cipher()
            .map_or("unknown cipher", |c| c.name()),
    );
    conn.attach(Box::new(tls));
    Ok(())
}

fn context(
    config: &TlsConfig,
    account: &mut Account,
    engine: &TrustEngine,
    starttls: bool,
) -> Result<SslContext, Error> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

    let mut options = SslOptions::NO_SSLV2 | SslOptions::NO_COMPRESSION;
    if !config.use_sslv3 || starttls {
        options |= SslOptions::NO_SSLV3;
    }
    if !config.use_tlsv1 {
        options |= SslOptions::NO_TLSV1;
    }
    if !config.use_tlsv1_1 {
        options |= SslOptions::NO_TLSV1_1;
    }
    if !config.use_tlsv1_2 {
        options |= SslOptions::NO_TLSV1_2;
    }
    if !config.use_tlsv1_3 {
        options |= SslOptions::NO_TLSV1_3;
    }
    builder.set_options(options);

    if let Some(ref ciphers) = config.ciphers {
        if let Err(e) = builder.set_cipher_list(ciphers) {
            warn!("Could not select ciphers \"{}\": {}", ciphers, e);
        }
    }

    if config.use_system_certs {
        if let Err(e) = builder.set_default_verify_paths() {
            warn!("Unable to load system certificates: {}", e);
        }
    }

    if let Some(store) = engine.trust_store() {
        match store.load_valid(config.verify_dates) {
            Ok(certs) => {
                for cert in certs {
                    builder.cert_store_mut().add_cert(cert)?;
                }
            }
            Err(e) => warn!(
                "Unable to load certificates from {}: {}",
                store.path().display(),
                e
            ),
        }
    }

    if let Some(ref path) = config.client_cert {
        if let Err(e) = load_client_cert(&mut builder, path, account, engine)
        {
            warn!(
                "Unable to use client certificate {}: {}",
                path.display(),
                e
            );
        }
    }

    Ok(builder.build())
}

/// Load the certificate and private key from the PEM file at `path`.
///
/// The account password is only requested if the key turns out to be
/// encrypted, and is then kept in the account.
fn load_client_cert(
    builder: &mut SslContextBuilder,
    path: &std::path::Path,
    account: &mut Account,
    engine: &TrustEngine,
) -> Result<(), Error> {
    debug!("Using client certificate {}", path.display());
    let pem = fs::read(path)?;
    let cert = X509::from_pem(&pem)?;

    let mut password_error = None;
    let key = PKey::private_key_from_pem_callback(&pem, |buf| {
        if account.pass.is_none() {
            let source = engine.password_source().ok_or_else(ErrorStack::get)?;
            match source.password(account) {
                Ok(pass) => account.pass = Some(pass),
                Err(e) => {
                    password_error = Some(e);
                    return Err(ErrorStack::get());
                }
            }
        }

        let pass = account
            .pass
            .as_ref()
            .map(|p| p.unsecure())
            .unwrap_or_default();
        if pass.len() > buf.len() {
            return Err(ErrorStack::get());
        }
        buf[..pass.len()].copy_from_slice(pass);
        Ok(pass.len())
    });

    let key = match (key, password_error) {
        (Ok(key), _) => key,
        (Err(_), Some(e)) => return Err(e),
        (Err(e), None) => return Err(e.into()),
    };

    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    Ok(())
}

fn handshake(
    socket: RawSocket,
    account: &mut Account,
    engine: &Arc<TrustEngine>,
    starttls: bool,
) -> Result<TlsSocket, Error> {
    let config = engine.config();
    let ctx = context(config, account, engine, starttls)?;
    let mut ssl = Ssl::new(&ctx)?;

    if let Err(e) = ssl.set_hostname(&account.host) {
        warn!("Unable to set TLS server name {}: {}", account.host, e);
    }

    if config.verify_partial_chains {
        ssl.param_mut().set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
    }

    let verifier = Arc::new(engine.verifier(&account.host));
    ssl.set_verify_callback(SslVerifyMode::PEER, {
        let verifier = Arc::clone(&verifier);
        move |preverify_ok, ctx| {
            let chain_len = ctx.chain().map_or(1, |chain| chain.len());
            let depth = ctx.error_depth();
            let error = ctx.error();
            let error =
                format!("{} ({})", error.error_string(), error.as_raw());
            match ctx.current_cert() {
                Some(cert) => verifier.verify(
                    preverify_ok,
                    cert,
                    depth,
                    chain_len,
                    &error,
                ),
                None => preverify_ok,
            }
        }
    });

    let host = account.host.clone();
    match ssl.connect(socket) {
        Ok(stream) => Ok(TlsSocket { stream, host }),
        Err(HandshakeError::SetupFailure(e)) => Err(e.into()),
        Err(HandshakeError::Failure(mid))
        | Err(HandshakeError::WouldBlock(mid)) => match verifier.rejection() {
            Some(reason) => {
                warn!(
                    "Certificate verification failed for {}: {}",
                    host, reason
                );
                Err(Error::Verification(reason))
            }
            None => {
                warn!("TLS handshake with {} failed: {}", host, mid.error());
                Err(mid.into_error().into())
            }
        },
    }
}

/// A TLS session over a plain socket.
pub struct TlsSocket {
    stream: SslStream<RawSocket>,
    host: String,
}

impl TlsSocket {
    fn check_interrupt(&self) -> Result<(), Error> {
        if signals::take_interrupt() {
            warn!("Connection to {} has been aborted", self.host);
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Transport for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let result = {
            let _intr = signals::allow_interrupt()?;
            self.stream.read(buf)
        };
        self.check_interrupt()?;
        result.map_err(|e| {
            warn!("TLS read from {} failed: {}", self.host, e);
            e.into()
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let result = {
            let _intr = signals::allow_interrupt()?;
            self.stream.write(buf)
        };
        self.check_interrupt()?;
        result.map_err(|e| {
            warn!("TLS write to {} failed: {}", self.host, e);
            e.into()
        })
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        // Records already decrypted by OpenSSL never show up on the socket.
        if self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), timeout)
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Err(e) = self.stream.shutdown() {
            debug!("TLS shutdown with {} failed: {}", self.host, e);
        }
        Transport::close(self.stream.get_mut())
    }

    fn ssf(&self) -> u32 {
        self.stream
            .ssl()
            .current_cipher()
            .map_or(0, |cipher| cipher.bits().secret.max(0) as u32)
    }

    fn into_socket(self: Box<Self>) -> Result<RawSocket, Box<dyn Transport>> {
        Err(self)
    }
}
