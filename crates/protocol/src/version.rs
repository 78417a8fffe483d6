//! Protocol version negotiation
//!
//! Version format: `MAJOR << 8 | MINOR`. A major bump breaks the envelope or
//! message layout, a minor bump only adds routes or optional fields.
//!
//! Client and server each advertise the range they speak; the ranges must
//! overlap and the lower of the two preferred versions is used.

use crate::error::{ProtocolError, Result};

/// Current protocol version (v1.0)
pub const CURRENT_PROTOCOL_VERSION: u16 = 0x0100;

/// Minimum supported protocol version (v1.0)
pub const MIN_PROTOCOL_VERSION: u16 = 0x0100;

/// Extracts the major version number
#[inline]
pub fn major_version(version: u16) -> u8 {
    (version >> 8) as u8
}

/// Extracts the minor version number
#[inline]
pub fn minor_version(version: u16) -> u8 {
    (version & 0xFF) as u8
}

/// Creates a version number from major and minor components
#[inline]
pub fn make_version(major: u8, minor: u8) -> u16 {
    ((major as u16) << 8) | (minor as u16)
}

/// Negotiates the protocol version for a new connection
///
/// ```
/// use exsim_protocol::version::negotiate_version;
///
/// // Client speaks v1.0-v1.5, server speaks v1.0-v2.0
/// assert_eq!(negotiate_version(0x0105, 0x0100, 0x0200, 0x0100).unwrap(), 0x0105);
/// ```
pub fn negotiate_version(
    client_version: u16,
    client_min: u16,
    server_version: u16,
    server_min: u16,
) -> Result<u16> {
    let mismatch = ProtocolError::VersionMismatch {
        client_min,
        client_max: client_version,
        server_min,
        server_max: server_version,
    };

    if client_version < server_min || server_version < client_min {
        return Err(mismatch);
    }

    let negotiated = client_version.min(server_version);
    if negotiated >= client_min && negotiated >= server_min {
        Ok(negotiated)
    } else {
        Err(mismatch)
    }
}
