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

//! Certificates and messages shared by the unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509};

/// A self-signed certificate to generate.
pub struct CertSpec {
    pub common_name: String,
    pub alt_names: Vec<String>,
    /// Days relative to now.
    pub not_before_days: i64,
    pub not_after_days: i64,
}

impl CertSpec {
    /// A currently valid certificate whose only alternative name is its
    /// common name.
    pub fn leaf(common_name: &str) -> Self {
        CertSpec {
            common_name: common_name.to_owned(),
            alt_names: vec![common_name.to_owned()],
            not_before_days: -1,
            not_after_days: 30,
        }
    }
}

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

fn days_from_now(days: i64) -> Asn1Time {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    Asn1Time::from_unix((now + days * 86400) as _).unwrap()
}

/// Build and self-sign a certificate with the shared test key.
pub fn certificate(spec: &CertSpec) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", &spec.common_name).unwrap();
    let name = name.build();

    let serial = BigNum::from_u32(NEXT_SERIAL.fetch_add(1, Ordering::SeqCst))
        .unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&Asn1Integer::from_bn(&serial).unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&CERTIFICATE_PRIVATE_KEY).unwrap();
    builder
        .set_not_before(&days_from_now(spec.not_before_days))
        .unwrap();
    builder
        .set_not_after(&days_from_now(spec.not_after_days))
        .unwrap();

    if !spec.alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for alt in &spec.alt_names {
            san.dns(alt);
        }
        let ext = san.build(&builder.x509v3_context(None, None)).unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder
        .sign(&CERTIFICATE_PRIVATE_KEY, MessageDigest::sha256())
        .unwrap();
    builder.build()
}

lazy_static::lazy_static! {
    pub static ref CERTIFICATE_PRIVATE_KEY: PKey<Private> =
        PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
    /// Server certificate for `localhost`.
    pub static ref CERTIFICATE: X509 =
        certificate(&CertSpec::leaf("localhost"));
}

/// A small message with a folded subject.
pub static SIMPLE_MESSAGE: &str = "\
From: Alice <alice@example.com>\r
To: Bob <bob@example.com>\r
Subject: Re: Lunch\r
 plans\r
Date: Mon, 2 Mar 2020 10:00:00 +0000\r
Message-ID: <lunch-1@example.com>\r
\r
Noon works.\r
See you there.\r
";

/// A message with no body.
pub static HEADER_ONLY_MESSAGE: &str = "\
From: carol@example.com\r
Subject: Ping\r
Message-ID: <ping@example.com>\r
\r
";
