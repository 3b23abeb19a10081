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

//! Plain TCP connections.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Command;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc::c_int;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    self, AddressFamily, SockFlag, SockType, SockaddrStorage,
};
use nix::unistd::alarm;

use super::{Account, Transport};
use crate::support::error::Error;
use crate::support::signals;
use crate::support::system_config::ConnectionConfig;

/// Run the preconnect command through the shell.
///
/// A non-zero exit status aborts with that status.
pub fn preconnect(command: &str) -> Result<(), Error> {
    debug!("Executing preconnect: {}", command);
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(|e| {
            warn!("Preconnect command failed to start: {}", e);
            Error::Preconnect(-1)
        })?;

    if status.success() {
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        warn!("Preconnect command failed: {}", code);
        Err(Error::Preconnect(code))
    }
}

/// Resolve `host` to the ordered list of candidate addresses.
///
/// IPv6 candidates are dropped unless `use_ipv6` is set.
pub fn resolve(
    host: &str,
    port: u16,
    use_ipv6: bool,
) -> Result<Vec<SocketAddr>, Error> {
    let addresses: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            debug!("Resolving {} failed: {}", host, e);
            Error::Resolution(host.to_owned())
        })?
        .filter(|a| use_ipv6 || a.is_ipv4())
        .collect();

    if addresses.is_empty() {
        Err(Error::Resolution(host.to_owned()))
    } else {
        Ok(addresses)
    }
}

/// Connect a new socket to `address`.
///
/// If `timeout_secs` is non-zero, an alarm bounds the attempt. SIGINT may
/// interrupt the call, and SIGWINCH is held off while it is in progress.
fn timed_connect(
    address: SocketAddr,
    timeout_secs: u32,
) -> io::Result<TcpStream> {
    signals::init();

    let family = if address.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    // The stream owns the descriptor from here on, so every early return
    // closes it.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let target = SockaddrStorage::from(address);

    let result = {
        let _winch = signals::block_sigwinch().map_err(into_io_error)?;
        let _intr = signals::allow_interrupt().map_err(into_io_error)?;
        if timeout_secs > 0 {
            alarm::set(timeout_secs);
        }
        let result = socket::connect(fd, &target);
        if timeout_secs > 0 {
            alarm::cancel();
        }
        result
    };

    if signals::take_interrupt() {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "connection interrupted",
        ));
    }

    result.map_err(io::Error::from)?;
    Ok(stream)
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        Error::Nix(errno) => io::Error::from(errno),
        e => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}

/// Wait until `fd` is readable or `timeout` (forever if `None`) has passed.
///
/// The deadline is fixed on entry, so a wait that keeps being interrupted by
/// signals still ends on time, and never before it. When SIGINT interrupts
/// the wait, the abort check decides whether to give up.
pub fn poll_fd(fd: RawFd, timeout: Option<Duration>) -> Result<bool, Error> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let wait_millis: c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                // Rounded up; poll() may otherwise wake just short of the
                // deadline.
                ((left.as_nanos() + 999_999) / 1_000_000)
                    .min(c_int::MAX as u128) as c_int
            }
        };

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, wait_millis) {
            Ok(0) if deadline.map_or(true, |d| Instant::now() < d) => (),
            Ok(n) => return Ok(n > 0),
            Err(Errno::EINTR) => {
                if signals::interrupted() && signals::query_abort() {
                    return Err(Error::Cancelled);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A plain TCP connection.
#[derive(Debug)]
pub struct RawSocket {
    stream: TcpStream,
    host: String,
}

impl RawSocket {
    /// Connect to the account's host, trying each resolved address in turn.
    ///
    /// If every candidate fails, the error from the last one is reported.
    pub fn connect(
        account: &Account,
        config: &ConnectionConfig,
    ) -> Result<Self, Error> {
        let candidates = resolve(&account.host, account.port, config.use_ipv6)?;
        info!("Connecting to {}:{}...", account.host, account.port);

        let mut last_error = None;
        for address in candidates {
            match timed_connect(address, config.connect_timeout) {
                Ok(stream) => {
                    debug!("Connected to {} at {}", account.host, address);
                    return Ok(RawSocket {
                        stream,
                        host: account.host.clone(),
                    });
                }
                Err(e) => {
                    debug!("Connecting to {} failed: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no usable address")
        });
        warn!("Could not connect to {} ({})", account.host, source);
        Err(Error::Connect {
            host: account.host.clone(),
            source,
        })
    }

    fn check_interrupt(&self) -> Result<(), Error> {
        if signals::take_interrupt() {
            warn!("Connection to {} has been aborted", self.host);
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Read for RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for RawSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let result = {
            let _intr = signals::allow_interrupt()?;
            self.stream.read(buf)
        };
        self.check_interrupt()?;
        result.map_err(|e| {
            warn!("Error talking to {} ({})", self.host, e);
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
            warn!("Error talking to {} ({})", self.host, e);
            e.into()
        })
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        poll_fd(self.stream.as_raw_fd(), timeout)
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if io::ErrorKind::NotConnected != e.kind() => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn into_socket(self: Box<Self>) -> Result<RawSocket, Box<dyn Transport>> {
        Ok(*self)
    }
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use nix::sys::pthread::{pthread_kill, pthread_self};
    use nix::sys::signal::{raise, Signal};

    use super::*;
    use crate::conn::Connection;

    fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn local_config() -> ConnectionConfig {
        ConnectionConfig {
            use_ipv6: false,
            connect_timeout: 5,
            ..ConnectionConfig::default()
        }
    }

    fn connected() -> (Connection, TcpStream) {
        let (listener, port) = listen();
        let account = Account::new("127.0.0.1", port, "user");
        let socket = RawSocket::connect(&account, &local_config()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::with_transport(account, Box::new(socket)), server)
    }

    /// Sends SIGINT to the creating thread every few milliseconds until
    /// dropped.
    struct Interrupter {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Interrupter {
        fn start() -> Self {
            signals::init();
            let target = pthread_self();
            let stop = Arc::new(AtomicBool::new(false));
            let thread = thread::spawn({
                let stop = Arc::clone(&stop);
                move || {
                    while !stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(10));
                        pthread_kill(target, Signal::SIGINT).unwrap();
                    }
                }
            });
            Interrupter {
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for Interrupter {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
            signals::take_interrupt();
        }
    }

    #[test]
    fn connect_read_write() {
        crate::init_test_log();
        let _signals = signals::test::shared();

        let (listener, port) = listen();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"+OK ready\r\n").unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!("QUIT\r\n", line);
            stream.write_all(b"+OK bye\r\n").unwrap();
        });

        let account = Account::new("127.0.0.1", port, "user");
        let socket = RawSocket::connect(&account, &local_config()).unwrap();
        let mut conn = Connection::with_transport(account, Box::new(socket));

        assert!(conn.poll(Some(Duration::from_secs(5))).unwrap());
        assert_eq!("+OK ready", conn.read_line().unwrap());
        conn.write_all(b"QUIT\r\n").unwrap();
        assert_eq!("+OK bye", conn.read_line().unwrap());
        assert_eq!(0, conn.ssf());
        conn.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn poll_times_out() {
        let _signals = signals::test::shared();
        let (mut conn, _server) = connected();

        for &millis in &[1, 7, 50, 120] {
            let timeout = Duration::from_millis(millis);
            let start = Instant::now();
            assert!(!conn.poll(Some(timeout)).unwrap());
            assert!(start.elapsed() >= timeout);
        }
        assert!(conn.is_open());
    }

    #[test]
    fn poll_sees_data() {
        let _signals = signals::test::shared();
        let (mut conn, mut server) = connected();
        server.write_all(b"+OK\r\n").unwrap();
        assert!(conn.poll(Some(Duration::from_secs(5))).unwrap());
        assert_eq!("+OK", conn.read_line().unwrap());
    }

    #[test]
    fn interrupted_read_is_cancelled() {
        crate::init_test_log();
        let _signals = signals::test::exclusive();
        let (mut conn, mut server) = connected();
        server.write_all(b"+OK ready\r\n").unwrap();

        raise(Signal::SIGINT).unwrap();
        assert!(signals::interrupted());
        assert_matches!(Err(Error::Cancelled), conn.read_line());
        assert!(!conn.is_open());
        assert!(!signals::interrupted());
    }

    #[test]
    fn interrupted_write_is_cancelled() {
        crate::init_test_log();
        let _signals = signals::test::exclusive();
        let (mut conn, _server) = connected();

        raise(Signal::SIGINT).unwrap();
        assert_matches!(Err(Error::Cancelled), conn.write_all(b"NOOP\r\n"));
        assert!(!conn.is_open());
        assert!(!signals::interrupted());
    }

    #[test]
    fn interrupted_poll_resumes_when_not_aborted() {
        let _signals = signals::test::exclusive();
        signals::set_abort_check(|| false);
        let (idle, _peer) = UnixStream::pair().unwrap();
        let timeout = Duration::from_millis(200);

        let start = Instant::now();
        let ready = {
            let _interrupter = Interrupter::start();
            poll_fd(idle.as_raw_fd(), Some(timeout))
        };
        let elapsed = start.elapsed();
        signals::set_abort_check(|| true);

        assert!(!ready.unwrap());
        assert!(elapsed >= timeout);
    }

    #[test]
    fn interrupted_poll_aborts() {
        let _signals = signals::test::exclusive();
        signals::set_abort_check(|| true);
        let (idle, _peer) = UnixStream::pair().unwrap();
        let timeout = Duration::from_secs(30);

        let start = Instant::now();
        let ready = {
            let _interrupter = Interrupter::start();
            poll_fd(idle.as_raw_fd(), Some(timeout))
        };

        assert_matches!(Err(Error::Cancelled), ready);
        assert!(start.elapsed() < timeout);
    }

    #[test]
    fn connect_refused_reports_last_error() {
        let _signals = signals::test::shared();
        let (listener, port) = listen();
        drop(listener);

        let account = Account::new("127.0.0.1", port, "user");
        match RawSocket::connect(&account, &local_config()) {
            Err(Error::Connect { host, source }) => {
                assert_eq!("127.0.0.1", host);
                assert_eq!(io::ErrorKind::ConnectionRefused, source.kind());
            }
            r => panic!("Unexpected result: {:?}", r),
        }
    }

    #[test]
    fn unresolvable_host() {
        assert_matches!(
            Err(Error::Resolution(..)),
            resolve("nonexistent.invalid", 110, true)
        );
    }

    #[test]
    fn resolve_filters_ipv6() {
        let addresses = resolve("::1", 110, false);
        assert_matches!(Err(Error::Resolution(..)), addresses);
        assert_eq!(1, resolve("::1", 110, true).unwrap().len());
    }

    #[test]
    fn preconnect_exit_status() {
        preconnect("true").unwrap();
        assert_matches!(Err(Error::Preconnect(3)), preconnect("exit 3"));
    }
}
