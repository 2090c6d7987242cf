/// The current sync protocol version.
///
/// Covers the wire format of the `/sync/v{N}/connect` websocket and the
/// query AST format stored in the client view record.
pub const PROTOCOL_VERSION: u32 = 5;

/// Connections declaring an older protocol are closed with
/// [`ErrorKind::VersionNotSupported`](crate::ErrorKind::VersionNotSupported).
pub const MIN_SERVER_SUPPORTED_SYNC_PROTOCOL: u32 = 2;

/// First protocol version whose `pokeEnd` carries the final cookie.
pub const REVISED_COOKIE_PROTOCOL: u32 = 5;

const _: () = assert!(MIN_SERVER_SUPPORTED_SYNC_PROTOCOL < PROTOCOL_VERSION);

#[inline]
pub fn supports_revised_cookie_protocol(protocol_version: u32) -> bool {
    protocol_version >= REVISED_COOKIE_PROTOCOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revised_cookie_cutoff() {
        assert!(!supports_revised_cookie_protocol(4));
        assert!(supports_revised_cookie_protocol(5));
        assert!(supports_revised_cookie_protocol(PROTOCOL_VERSION));
    }
}
