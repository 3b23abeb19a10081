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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The configuration for Popsync.
///
/// This is typically stored in a file named `popsync.toml`. Every section is
/// optional; missing values take the defaults documented on each field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// How the byte stream to the server is established.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Configuration for TLS and certificate trust.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Behaviour of the POP mailbox engine.
    #[serde(default)]
    pub pop: PopConfig,
}

impl Config {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Error reading '{}': {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            Error::Config(format!(
                "Error in config file at '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// A shell command to run before connecting.
    ///
    /// A non-zero exit status aborts the connection attempt.
    pub preconnect: Option<String>,

    /// If set, use the standard input and output of this shell command as
    /// the connection to the server instead of opening a socket.
    pub tunnel: Option<String>,

    /// Seconds to wait for each connection attempt. 0 waits forever.
    pub connect_timeout: u32,

    /// Whether IPv6 addresses are considered when connecting.
    pub use_ipv6: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            preconnect: None,
            tunnel: None,
            connect_timeout: 30,
            use_ipv6: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Permit SSLv3. Never honoured for start-TLS upgrades.
    pub use_sslv3: bool,
    /// Permit TLS 1.0.
    pub use_tlsv1: bool,
    /// Permit TLS 1.1.
    pub use_tlsv1_1: bool,
    /// Permit TLS 1.2.
    pub use_tlsv1_2: bool,
    /// Permit TLS 1.3.
    pub use_tlsv1_3: bool,

    /// An OpenSSL cipher list string. The library default is used if unset.
    pub ciphers: Option<String>,

    /// Whether to trust the certificate authorities installed on the system.
    pub use_system_certs: bool,

    /// Path to a PEM file holding a client certificate and its private key.
    ///
    /// If the key is encrypted, the account password is used to decrypt it.
    pub client_cert: Option<PathBuf>,

    /// Path to the file of certificates the user chose to always trust.
    ///
    /// "Accept always" is only offered when this is set.
    pub certificate_file: Option<PathBuf>,

    /// Accept chains that end at a trusted intermediate instead of a root,
    /// and allow skipping individual intermediates when prompted.
    pub verify_partial_chains: bool,

    /// Check the server's host name against its certificate.
    pub verify_host: bool,

    /// Check certificate validity periods.
    pub verify_dates: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            use_sslv3: false,
            use_tlsv1: false,
            use_tlsv1_1: false,
            use_tlsv1_2: true,
            use_tlsv1_3: true,
            ciphers: None,
            use_system_certs: true,
            client_cert: None,
            certificate_file: None,
            verify_partial_chains: false,
            verify_host: true,
            verify_dates: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PopConfig {
    /// Mark messages whose headers came from the header cache but whose
    /// bodies were never downloaded as old rather than new.
    pub mark_old: bool,

    /// Number of slots in the in-memory fallback message cache used when no
    /// persistent body cache is available.
    pub cache_len: usize,

    /// Minimum number of seconds between checks for new mail.
    pub check_interval: u32,

    /// After each refresh, delete bodies from the persistent body cache
    /// whose messages are no longer on the server.
    pub message_cache_clean: bool,
}

impl Default for PopConfig {
    fn default() -> Self {
        PopConfig {
            mark_old: true,
            cache_len: 10,
            check_interval: 60,
            message_cache_clean: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
[connection]
preconnect = "ssh -f -L 1110:localhost:110 host sleep 5"
use_ipv6 = false

[tls]
certificate_file = "/home/user/.popsync/certificates"
verify_partial_chains = true

[pop]
cache_len = 4
"#,
        )
        .unwrap();

        assert_eq!(
            Some("ssh -f -L 1110:localhost:110 host sleep 5"),
            config.connection.preconnect.as_deref()
        );
        assert!(!config.connection.use_ipv6);
        assert_eq!(30, config.connection.connect_timeout);
        assert!(config.tls.verify_partial_chains);
        assert!(config.tls.verify_host);
        assert!(!config.tls.use_tlsv1);
        assert_eq!(4, config.pop.cache_len);
        assert_eq!(60, config.pop.check_interval);
        assert!(config.pop.mark_old);
    }

    #[test]
    fn empty_config_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.tunnel.is_none());
        assert!(config.tls.certificate_file.is_none());
        assert_eq!(10, config.pop.cache_len);
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("popsync.toml");
        std::fs::write(&path, "[pop]\ncache_len = \"ten\"\n").unwrap();
        assert_matches!(Err(Error::Config(..)), Config::load(&path));
        assert_matches!(
            Err(Error::Config(..)),
            Config::load(dir.path().join("missing.toml"))
        );
    }
}
