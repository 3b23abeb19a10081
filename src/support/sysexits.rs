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

//! Exit statuses from `sysexits.h`, and the mapping of our errors onto them.

use crate::support::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_NOUSER: Sysexit = Sysexit(67);
pub const EX_NOHOST: Sysexit = Sysexit(68);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_OSFILE: Sysexit = Sysexit(72);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_PROTOCOL: Sysexit = Sysexit(76);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}

impl From<&Error> for Sysexit {
    fn from(e: &Error) -> Self {
        match *e {
            Error::Resolution(..) => EX_NOHOST,
            Error::Connect { .. } | Error::Preconnect(..) => EX_UNAVAILABLE,
            Error::Tunnel(..) => EX_OSERR,
            Error::Cancelled => EX_TEMPFAIL,
            Error::Protocol(..) | Error::TlsUnsupported => EX_PROTOCOL,
            Error::Verification(..) => EX_NOPERM,
            Error::Config(..) => EX_CONFIG,
            Error::Ssl(..) | Error::Cbor(..) => EX_SOFTWARE,
            _ => EX_IOERR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_exit_codes() {
        assert_eq!(EX_NOHOST, Sysexit::from(&Error::Resolution("x".into())));
        assert_eq!(
            EX_NOPERM,
            Sysexit::from(&Error::Verification("rejected".into()))
        );
        assert_eq!(EX_IOERR, Sysexit::from(&Error::NotConnected));
    }

    #[test]
    fn account_lookup_codes() {
        assert_eq!(Sysexit(67), EX_NOUSER);
        assert_eq!(Sysexit(72), EX_OSFILE);
        assert!(EX_NOUSER < EX_OSFILE);
    }
}
