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

//! Certificate trust decisions.
//!
//! The `TrustEngine` lives as long as the client session. It owns the list
//! of certificates the user accepted during this run, the persistent trust
//! store, and the interactive prompt. Each TLS handshake gets its own
//! `Verifier`, which carries the per-handshake skip state through the
//! repeated invocations of the OpenSSL verification callback.

use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref, X509};

use super::PasswordSource;
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;
use crate::support::system_config::TlsConfig;

fn names_equal(a: &X509NameRef, b: &X509NameRef) -> bool {
    matches!(a.try_cmp(b), Ok(Ordering::Equal))
}

/// Whether `a` and `b` are the same certificate: equal subject, equal
/// issuer and equal SHA-256 digest.
pub fn certs_equal(a: &X509Ref, b: &X509Ref) -> bool {
    if !names_equal(a.subject_name(), b.subject_name())
        || !names_equal(a.issuer_name(), b.issuer_name())
    {
        return false;
    }

    match (
        a.digest(MessageDigest::sha256()),
        b.digest(MessageDigest::sha256()),
    ) {
        (Ok(da), Ok(db)) => *da == *db,
        _ => false,
    }
}

/// Whether `cert` is valid at `now`.
///
/// It is invalid if `now` is before its "not before" time or at or after
/// its "not after" time. Unless `silent`, the reason is logged as a warning.
pub fn check_expiration_at(
    cert: &X509Ref,
    now: &Asn1TimeRef,
    silent: bool,
) -> bool {
    match cert.not_before().compare(now) {
        Ok(Ordering::Greater) => {
            if !silent {
                warn!("Server certificate is not yet valid");
            }
            return false;
        }
        Ok(_) => (),
        Err(e) => {
            debug!("Unable to compare certificate dates: {}", e);
            return false;
        }
    }

    match cert.not_after().compare(now) {
        Ok(Ordering::Greater) => true,
        Ok(_) => {
            if !silent {
                warn!("Server certificate has expired");
            }
            false
        }
        Err(e) => {
            debug!("Unable to compare certificate dates: {}", e);
            false
        }
    }
}

/// Whether `cert` is currently valid. Always true if `verify_dates` is off.
pub fn check_expiration(
    cert: &X509Ref,
    verify_dates: bool,
    silent: bool,
) -> bool {
    if !verify_dates {
        return true;
    }

    match Asn1Time::days_from_now(0) {
        Ok(now) => check_expiration_at(cert, &now, silent),
        Err(e) => {
            warn!("Unable to determine the current time: {}", e);
            false
        }
    }
}

/// Match `host` against a certificate name, which may be a wildcard of the
/// form `*.example.com`.
///
/// A wildcard stands for exactly the first label of `host`. The comparison
/// ignores ASCII case, and fails if either side is empty.
pub fn hostname_match(host: &str, pattern: &str) -> bool {
    let (host, pattern) = match pattern.strip_prefix("*.") {
        Some(rest) if !rest.is_empty() => match host.find('.') {
            Some(dot) => (&host[dot + 1..], rest),
            None => return false,
        },
        _ => (host, pattern),
    };

    !host.is_empty()
        && !pattern.is_empty()
        && host.eq_ignore_ascii_case(pattern)
}

/// Check `host` against the DNS subject alternative names of `cert`, or
/// against its common name if it has no subject alternative names at all.
pub fn check_host(cert: &X509Ref, host: &str) -> Result<(), String> {
    let matched = match cert.subject_alt_names() {
        Some(names) => names
            .iter()
            .filter_map(|name| name.dnsname())
            .any(|name| hostname_match(host, name)),
        None => {
            let cn = cert
                .subject_name()
                .entries_by_nid(Nid::COMMONNAME)
                .next()
                .ok_or_else(|| {
                    "cannot get certificate common name".to_owned()
                })?;
            let cn = cn.data().as_utf8().map_err(|_| {
                "cannot get certificate common name".to_owned()
            })?;
            hostname_match(host, &cn)
        }
    };

    if matched {
        Ok(())
    } else {
        Err(format!("certificate owner does not match hostname {}", host))
    }
}

/// Format the `digest` fingerprint of `cert` as upper-case hex, with a
/// space after every two bytes.
pub fn fingerprint(cert: &X509Ref, digest: MessageDigest) -> String {
    let bytes = match cert.digest(digest) {
        Ok(bytes) => bytes,
        Err(_) => return String::new(),
    };

    let mut out = String::new();
    for (ix, b) in bytes.iter().enumerate() {
        if ix > 0 && 0 == ix % 2 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

fn name_part(name: &X509NameRef, nid: Nid) -> String {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Unknown".to_owned())
}

const NAME_PARTS: &[Nid] = &[
    Nid::COMMONNAME,
    Nid::PKCS9_EMAILADDRESS,
    Nid::ORGANIZATIONNAME,
    Nid::ORGANIZATIONALUNITNAME,
    Nid::LOCALITYNAME,
    Nid::STATEORPROVINCENAME,
    Nid::COUNTRYNAME,
];

/// The human-readable description of `cert` shown when asking the user
/// whether to trust it.
pub fn describe_certificate(cert: &X509Ref) -> Vec<String> {
    let mut lines = vec!["This certificate belongs to:".to_owned()];
    for &nid in NAME_PARTS {
        lines.push(format!("   {}", name_part(cert.subject_name(), nid)));
    }
    lines.push(String::new());
    lines.push("This certificate was issued by:".to_owned());
    for &nid in NAME_PARTS {
        lines.push(format!("   {}", name_part(cert.issuer_name(), nid)));
    }
    lines.push(String::new());
    lines.push("This certificate is valid".to_owned());
    lines.push(format!("   from {}", cert.not_before()));
    lines.push(format!("     to {}", cert.not_after()));
    lines.push(String::new());
    lines.push(format!(
        "SHA1 Fingerprint: {}",
        fingerprint(cert, MessageDigest::sha1())
    ));
    lines.push(format!(
        "MD5 Fingerprint: {}",
        fingerprint(cert, MessageDigest::md5())
    ));
    lines
}

/// The file of PEM certificates the user chose to always trust.
#[derive(Clone, Debug)]
pub struct TrustStore {
    path: PathBuf,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TrustStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every certificate in the store, front to back. A missing file is
    /// an empty store.
    pub fn load(&self) -> Result<Vec<X509>, Error> {
        let data = fs::read(&self.path).ignore_not_found()?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(X509::stack_from_pem(&data)?)
    }

    /// The stored certificates which are currently valid.
    pub fn load_valid(&self, verify_dates: bool) -> Result<Vec<X509>, Error> {
        let mut certs = self.load()?;
        certs.retain(|cert| {
            let valid = check_expiration(cert, verify_dates, true);
            if !valid {
                debug!(
                    "Filtering expired certificate {:?}",
                    name_part(cert.subject_name(), Nid::COMMONNAME)
                );
            }
            valid
        });
        Ok(certs)
    }

    /// Whether `cert` is currently valid and matches a stored certificate.
    pub fn contains_valid(&self, cert: &X509Ref, verify_dates: bool) -> bool {
        if !check_expiration(cert, verify_dates, false) {
            return false;
        }

        match self.load() {
            Ok(stored) => stored.iter().any(|s| certs_equal(s, cert)),
            Err(e) => {
                warn!(
                    "Unable to read certificates from {}: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }

    /// Append `cert` to the end of the store.
    pub fn append(&self, cert: &X509Ref) -> Result<(), Error> {
        let pem = cert.to_pem()?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&pem)?;
        file.flush().map_err(Error::from)
    }
}

/// The user's answer when asked about a certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustChoice {
    Reject,
    AcceptOnce,
    AcceptAlways,
    Skip,
}

/// What the prompt is asked about.
pub struct CertPrompt<'a> {
    pub cert: &'a X509Ref,
    /// Depth in the chain; 0 is the server's own certificate.
    pub depth: u32,
    pub chain_len: usize,
    /// Whether `AcceptAlways` is on offer.
    pub allow_always: bool,
    /// Whether `Skip` is on offer.
    pub allow_skip: bool,
    /// Why the certificate could not be trusted automatically.
    pub reason: &'a str,
}

impl CertPrompt<'_> {
    /// Position counted from the root, e.g. "certificate 2 of 2 in chain"
    /// for the server's certificate in a two-element chain.
    pub fn title(&self) -> String {
        format!(
            "SSL Certificate check (certificate {} of {} in chain)",
            self.chain_len.saturating_sub(self.depth as usize),
            self.chain_len
        )
    }

    pub fn description(&self) -> Vec<String> {
        describe_certificate(self.cert)
    }
}

/// Asks the user whether to trust a certificate.
pub trait TrustPrompt: Send + Sync {
    fn ask(&self, prompt: &CertPrompt<'_>) -> TrustChoice;
}

/// Session-lifetime certificate trust state.
pub struct TrustEngine {
    config: TlsConfig,
    prompt: Box<dyn TrustPrompt>,
    password: Option<Box<dyn PasswordSource>>,
    accepted: Mutex<Vec<X509>>,
}

impl TrustEngine {
    pub fn new(config: TlsConfig, prompt: Box<dyn TrustPrompt>) -> Self {
        TrustEngine {
            config,
            prompt,
            password: None,
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Use `source` when a client certificate key needs the account
    /// password.
    pub fn with_password_source(
        mut self,
        source: Box<dyn PasswordSource>,
    ) -> Self {
        self.password = Some(source);
        self
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn password_source(&self) -> Option<&dyn PasswordSource> {
        self.password.as_deref()
    }

    pub fn trust_store(&self) -> Option<TrustStore> {
        self.config.certificate_file.as_ref().map(TrustStore::new)
    }

    /// Whether the user accepted `cert` earlier in this session.
    pub fn is_accepted(&self, cert: &X509Ref) -> bool {
        match self.accepted.lock() {
            Ok(accepted) => accepted.iter().any(|a| certs_equal(a, cert)),
            Err(_) => false,
        }
    }

    fn accept(&self, cert: &X509Ref) {
        debug!("Trusted certificate for this session");
        if let Ok(mut accepted) = self.accepted.lock() {
            accepted.push(cert.to_owned());
        }
    }

    /// Forget every certificate accepted during this session.
    pub fn clear(&self) {
        if let Ok(mut accepted) = self.accepted.lock() {
            accepted.clear();
        }
    }

    /// Create the verifier for one handshake with `host`.
    pub fn verifier(self: &Arc<Self>, host: &str) -> Verifier {
        Verifier {
            engine: Arc::clone(self),
            host: host.to_owned(),
            state: Mutex::new(VerifyState::default()),
        }
    }
}

#[derive(Default)]
struct VerifyState {
    /// Set after the user skipped a certificate; every following
    /// certificate is treated as unverified until one is verified.
    skip_mode: bool,
    /// Depth and certificate of the previous callback invocation.
    last: Option<(u32, X509)>,
    /// Why a certificate was rejected, if one was.
    rejection: Option<String>,
}

/// The verification policy for one handshake.
pub struct Verifier {
    engine: Arc<TrustEngine>,
    host: String,
    state: Mutex<VerifyState>,
}

impl Verifier {
    /// The reason a certificate was rejected during this handshake, if one
    /// was.
    pub fn rejection(&self) -> Option<String> {
        match self.state.lock() {
            Ok(state) => state.rejection.clone(),
            Err(_) => Some("certificate verification failed".to_owned()),
        }
    }

    /// Decide whether to accept one certificate of the chain.
    ///
    /// `preverify_ok` is OpenSSL's own verdict and `error` its description
    /// of the problem when that is false.
    pub fn verify(
        &self,
        preverify_ok: bool,
        cert: &X509Ref,
        depth: u32,
        chain_len: usize,
        error: &str,
    ) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        let config = &self.engine.config;

        debug!(
            "Checking certificate chain entry {} (preverify: {} skip mode: {})",
            name_part(cert.subject_name(), Nid::COMMONNAME),
            preverify_ok,
            state.skip_mode
        );

        // OpenSSL sometimes presents a skipped certificate a second time,
        // now passing preverification.
        if state.skip_mode && preverify_ok {
            if let Some((last_depth, ref last_cert)) = state.last {
                if last_depth == depth && certs_equal(last_cert, cert) {
                    debug!("Ignoring duplicate skipped certificate");
                    return true;
                }
            }
        }
        state.last = Some((depth, cert.to_owned()));

        if self.engine.is_accepted(cert) {
            debug!("Using cached certificate");
            state.skip_mode = false;
            return true;
        }

        if 0 == depth && config.verify_host {
            if let Err(reason) = check_host(cert, &self.host) {
                warn!("Certificate host check failed: {}", reason);
                // Pinning the certificate would not fix a name mismatch.
                return self.ask(
                    &mut state, cert, depth, chain_len, false, &reason,
                );
            }
            debug!("Hostname check passed");
        }

        if !preverify_ok || state.skip_mode {
            if let Some(store) = self.engine.trust_store() {
                if store.contains_valid(cert, config.verify_dates) {
                    debug!("Digest check passed");
                    state.skip_mode = false;
                    return true;
                }
            }

            debug!("X509_verify_cert: {}", error);
            return self.ask(&mut state, cert, depth, chain_len, true, error);
        }

        true
    }

    fn ask(
        &self,
        state: &mut VerifyState,
        cert: &X509Ref,
        depth: u32,
        chain_len: usize,
        allow_always: bool,
        reason: &str,
    ) -> bool {
        let config = &self.engine.config;
        let store = self.engine.trust_store();
        let allow_skip = 0 != depth && config.verify_partial_chains;
        let allow_always = allow_always
            && store.is_some()
            && check_expiration(cert, config.verify_dates, true);

        let choice = self.engine.prompt.ask(&CertPrompt {
            cert,
            depth,
            chain_len,
            allow_always,
            allow_skip,
            reason,
        });
        let choice = match choice {
            TrustChoice::AcceptAlways if !allow_always => {
                TrustChoice::AcceptOnce
            }
            TrustChoice::Skip if !allow_skip => TrustChoice::Reject,
            choice => choice,
        };

        match choice {
            TrustChoice::Reject => {
                info!("Certificate rejected");
                state.rejection = Some(reason.to_owned());
                false
            }
            TrustChoice::Skip => {
                debug!("Certificate skipped");
                state.skip_mode = true;
                true
            }
            TrustChoice::AcceptOnce | TrustChoice::AcceptAlways => {
                if TrustChoice::AcceptAlways == choice {
                    if let Some(store) = store {
                        match store.append(cert) {
                            Ok(()) => info!(
                                "Certificate saved to {}",
                                store.path().display()
                            ),
                            Err(e) => warn!(
                                "Warning: Couldn't save certificate: {}",
                                e
                            ),
                        }
                    }
                }

                state.skip_mode = false;
                self.engine.accept(cert);
                true
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use proptest::prelude::*;

    use super::*;
    use crate::test_data::{self, CertSpec};

    /// Answers every prompt with a fixed choice, counting the prompts and
    /// remembering what was offered.
    pub struct FixedPrompt {
        pub choice: TrustChoice,
        pub asked: Arc<AtomicUsize>,
        pub offered: Arc<Mutex<Vec<(u32, bool, bool)>>>,
    }

    impl FixedPrompt {
        pub fn new(choice: TrustChoice) -> Self {
            FixedPrompt {
                choice,
                asked: Arc::new(AtomicUsize::new(0)),
                offered: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl TrustPrompt for FixedPrompt {
        fn ask(&self, prompt: &CertPrompt<'_>) -> TrustChoice {
            self.asked.fetch_add(1, AtomicOrdering::SeqCst);
            self.offered.lock().unwrap().push((
                prompt.depth,
                prompt.allow_always,
                prompt.allow_skip,
            ));
            self.choice
        }
    }

    fn engine(
        config: TlsConfig,
        choice: TrustChoice,
    ) -> (
        Arc<TrustEngine>,
        Arc<AtomicUsize>,
        Arc<Mutex<Vec<(u32, bool, bool)>>>,
    ) {
        let prompt = FixedPrompt::new(choice);
        let asked = Arc::clone(&prompt.asked);
        let offered = Arc::clone(&prompt.offered);
        (
            Arc::new(TrustEngine::new(config, Box::new(prompt))),
            asked,
            offered,
        )
    }

    #[test]
    fn certificate_equality() {
        let a = test_data::certificate(&CertSpec::leaf("a.example.com"));
        let b = test_data::certificate(&CertSpec::leaf("b.example.com"));
        assert!(certs_equal(&a, &a));
        assert!(certs_equal(&a, &a.to_owned()));
        assert!(!certs_equal(&a, &b));
    }

    #[test]
    fn certificate_expiration() {
        let current = test_data::certificate(&CertSpec::leaf("x"));
        let future = test_data::certificate(&CertSpec {
            not_before_days: 10,
            not_after_days: 20,
            ..CertSpec::leaf("x")
        });
        let expired = test_data::certificate(&CertSpec {
            not_before_days: -20,
            not_after_days: -10,
            ..CertSpec::leaf("x")
        });

        assert!(check_expiration(&current, true, false));
        assert!(!check_expiration(&future, true, false));
        assert!(!check_expiration(&expired, true, true));
        assert!(check_expiration(&expired, false, false));

        let now = Asn1Time::days_from_now(0).unwrap();
        assert!(check_expiration_at(&current, &now, true));
        let later = Asn1Time::days_from_now(15).unwrap();
        assert!(check_expiration_at(&future, &later, true));
    }

    #[test]
    fn hostname_matching() {
        assert!(hostname_match("mail.example.com", "*.example.com"));
        assert!(hostname_match("MAIL.Example.COM", "*.example.com"));
        assert!(hostname_match("mail.example.com", "mail.example.com"));
        assert!(!hostname_match("example.com", "*.example.com"));
        assert!(!hostname_match("evil.com", "*.example.com"));
        assert!(!hostname_match("a.b.example.com", "*.example.com"));
        assert!(!hostname_match("localhost", "*.example.com"));
        assert!(!hostname_match("", ""));
        assert!(!hostname_match("host.", "*."));
    }

    proptest! {
        #[test]
        fn wildcard_matches_any_single_label(
            label in "[a-z0-9-]{1,20}",
            domain in "[a-z]{1,10}\\.[a-z]{2,5}",
        ) {
            let host = format!("{}.{}", label, domain);
            let wildcard = format!("*.{}", domain);
            prop_assert!(hostname_match(&host, &wildcard));
            prop_assert!(hostname_match(&host.to_uppercase(), &host));
            prop_assert!(!hostname_match(&domain, &wildcard));
        }
    }

    #[test]
    fn host_check_prefers_alt_names() {
        let with_san = test_data::certificate(&CertSpec {
            alt_names: vec!["pop.example.com".to_owned()],
            ..CertSpec::leaf("other.example.com")
        });
        assert!(check_host(&with_san, "pop.example.com").is_ok());
        // The common name is not consulted when alt names exist.
        assert!(check_host(&with_san, "other.example.com").is_err());

        let cn_only = test_data::certificate(&CertSpec {
            alt_names: vec![],
            ..CertSpec::leaf("*.example.com")
        });
        assert!(check_host(&cn_only, "pop.example.com").is_ok());
        assert_eq!(
            Err("certificate owner does not match hostname example.org"
                .to_owned()),
            check_host(&cn_only, "example.org")
        );
    }

    #[test]
    fn description_and_fingerprints() {
        let cert = test_data::certificate(&CertSpec::leaf("pop.example.com"));
        let lines = describe_certificate(&cert);
        assert_eq!("This certificate belongs to:", lines[0]);
        assert_eq!("   pop.example.com", lines[1]);
        assert_eq!("   Unknown", lines[2]);
        assert!(lines.iter().any(|l| l.starts_with("SHA1 Fingerprint: ")));

        let sha1 = fingerprint(&cert, MessageDigest::sha1());
        // 20 bytes as 10 groups of 4 hex digits
        assert_eq!(49, sha1.len());
        assert_eq!(10, sha1.split(' ').count());
        assert!(sha1.split(' ').all(|g| 4 == g.len()
            && g.chars().all(|c| c.is_ascii_hexdigit() && !c.is_lowercase())));

        let prompt = CertPrompt {
            cert: &cert,
            depth: 0,
            chain_len: 3,
            allow_always: false,
            allow_skip: false,
            reason: "",
        };
        assert_eq!(
            "SSL Certificate check (certificate 3 of 3 in chain)",
            prompt.title()
        );
    }

    #[test]
    fn trust_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TrustStore::new(dir.path().join("certificates"));
        assert!(store.load().unwrap().is_empty());

        let good = test_data::certificate(&CertSpec::leaf("good"));
        let expired = test_data::certificate(&CertSpec {
            not_before_days: -20,
            not_after_days: -10,
            ..CertSpec::leaf("expired")
        });
        store.append(&expired).unwrap();
        store.append(&good).unwrap();

        assert_eq!(2, store.load().unwrap().len());
        let valid = store.load_valid(true).unwrap();
        assert_eq!(1, valid.len());
        assert!(certs_equal(&good, &valid[0]));
        assert_eq!(2, store.load_valid(false).unwrap().len());

        assert!(store.contains_valid(&good, true));
        assert!(!store.contains_valid(&expired, true));
        let stranger = test_data::certificate(&CertSpec::leaf("good"));
        assert!(!store.contains_valid(&stranger, true));
    }

    fn partial_config() -> TlsConfig {
        TlsConfig {
            verify_partial_chains: true,
            ..TlsConfig::default()
        }
    }

    #[test]
    fn skipped_certificate_is_not_prompted_twice() {
        let (engine, asked, _) = engine(partial_config(), TrustChoice::Skip);
        let verifier = engine.verifier("pop.example.com");
        let intermediate =
            test_data::certificate(&CertSpec::leaf("Intermediate CA"));

        assert!(verifier.verify(
            false,
            &intermediate,
            1,
            2,
            "unable to get issuer"
        ));
        assert_eq!(1, asked.load(AtomicOrdering::SeqCst));
        assert!(verifier.verify(true, &intermediate, 1, 2, ""));
        assert_eq!(1, asked.load(AtomicOrdering::SeqCst));
        assert_eq!(None, verifier.rejection());
    }

    #[test]
    fn skip_mode_questions_following_certificates() {
        let (engine, asked, offered) =
            engine(partial_config(), TrustChoice::Skip);
        let verifier = engine.verifier("pop.example.com");
        let intermediate =
            test_data::certificate(&CertSpec::leaf("Intermediate CA"));
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));

        assert!(verifier.verify(false, &intermediate, 1, 2, "untrusted"));
        // The leaf passes preverification but skip mode forces a prompt,
        // where skipping is not possible.
        assert!(!verifier.verify(true, &leaf, 0, 2, ""));
        assert_eq!(2, asked.load(AtomicOrdering::SeqCst));
        assert_eq!(
            vec![(1, false, true), (0, false, false)],
            *offered.lock().unwrap()
        );
        assert!(verifier.rejection().is_some());
    }

    #[test]
    fn accept_once_is_remembered_for_the_session() {
        let (engine, asked, _) =
            engine(TlsConfig::default(), TrustChoice::AcceptOnce);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));

        assert!(engine.verifier("pop.example.com").verify(
            false,
            &leaf,
            0,
            1,
            "self signed certificate"
        ));
        assert!(engine.is_accepted(&leaf));
        assert!(engine.verifier("pop.example.com").verify(
            false,
            &leaf,
            0,
            1,
            "self signed certificate"
        ));
        assert_eq!(1, asked.load(AtomicOrdering::SeqCst));

        engine.clear();
        assert!(!engine.is_accepted(&leaf));
    }

    #[test]
    fn accept_always_requires_store() {
        let (engine, _, offered) =
            engine(TlsConfig::default(), TrustChoice::AcceptAlways);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));
        assert!(engine
            .verifier("pop.example.com")
            .verify(false, &leaf, 0, 1, "untrusted"));
        assert_eq!(vec![(0, false, false)], *offered.lock().unwrap());
        // Downgraded to accept-once
        assert!(engine.is_accepted(&leaf));
    }

    #[test]
    fn accept_always_appends_to_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = TlsConfig {
            certificate_file: Some(dir.path().join("certificates")),
            ..TlsConfig::default()
        };
        let (engine1, _, offered) =
            engine(config.clone(), TrustChoice::AcceptAlways);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));
        assert!(engine1
            .verifier("pop.example.com")
            .verify(false, &leaf, 0, 1, "untrusted"));
        assert_eq!(vec![(0, true, false)], *offered.lock().unwrap());

        // A fresh session trusts it without asking.
        let (engine2, asked, _) = engine(config, TrustChoice::Reject);
        assert!(engine2
            .verifier("pop.example.com")
            .verify(false, &leaf, 0, 1, "untrusted"));
        assert_eq!(0, asked.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn host_mismatch_cannot_be_pinned() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = TlsConfig {
            certificate_file: Some(dir.path().join("certificates")),
            ..TlsConfig::default()
        };
        let (engine, _, offered) = engine(config, TrustChoice::Reject);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));

        let verifier = engine.verifier("imap.example.com");
        assert!(!verifier.verify(true, &leaf, 0, 1, ""));
        assert_eq!(vec![(0, false, false)], *offered.lock().unwrap());
        assert_eq!(
            Some(
                "certificate owner does not match hostname imap.example.com"
                    .to_owned()
            ),
            verifier.rejection()
        );
    }

    #[test]
    fn host_check_can_be_disabled() {
        let config = TlsConfig {
            verify_host: false,
            ..TlsConfig::default()
        };
        let (engine, asked, _) = engine(config, TrustChoice::Reject);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));
        assert!(engine
            .verifier("imap.example.com")
            .verify(true, &leaf, 0, 1, ""));
        assert_eq!(0, asked.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn skip_refused_for_leaf() {
        let (engine, _, _) = engine(partial_config(), TrustChoice::Skip);
        let leaf = test_data::certificate(&CertSpec::leaf("pop.example.com"));
        let verifier = engine.verifier("pop.example.com");
        assert!(!verifier.verify(false, &leaf, 0, 1, "untrusted"));
        assert!(verifier.rejection().is_some());
    }
}
