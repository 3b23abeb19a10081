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

use crate::conn::trust::{check_expiration, describe_certificate, TrustStore};
use crate::support::sysexits::*;
use crate::support::system_config::Config;

pub(super) fn list(config: Config) {
    let store = match config.tls.certificate_file {
        Some(path) => TrustStore::new(path),
        None => die!(EX_CONFIG, "No certificate_file is configured"),
    };

    let certs = match store.load() {
        Ok(certs) => certs,
        Err(e) => die!(
            Sysexit::from(&e),
            "Error reading '{}': {}",
            store.path().display(),
            e
        ),
    };

    if certs.is_empty() {
        println!("No certificates in '{}'", store.path().display());
        return;
    }

    for (ix, cert) in certs.iter().enumerate() {
        if ix > 0 {
            println!();
        }

        let expired = !check_expiration(cert, true, true);
        println!(
            "Certificate {} of {}{}",
            ix + 1,
            certs.len(),
            if expired { " (EXPIRED)" } else { "" }
        );
        for line in describe_certificate(cert) {
            println!("  {}", line);
        }
    }
}
