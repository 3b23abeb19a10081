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

/// Escape an opaque identifier into a string that is safe to use as a single
/// file name.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`. In particular `.` is escaped, so an escaped name can never collide
/// with `.`, `..`, hidden files, or a name containing an extension.
pub fn escape_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for &b in id.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Reverse `escape_name()`.
///
/// Returns `None` if `name` could not have been produced by `escape_name()`.
pub fn unescape_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        match bytes[ix] {
            b'%' => {
                let hex = name.get(ix + 1..ix + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                ix += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' => {
                out.push(b);
                ix += 1;
            }
            _ => return None,
        }
    }

    String::from_utf8(out).ok()
}
