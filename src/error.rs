use std::io;

use thiserror::Error;

/// Errors returned by the netline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or reactor I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Service or endpoint setup failed (bad bind address, dead reactor, ...).
    #[error("setup: {0}")]
    Setup(String),
    /// An elastic buffer ceiling would be exceeded.
    #[error("no buffer space available")]
    NoBufferSpace,
    /// A synchronous operation hit its deadline.
    #[error("operation timed out")]
    TimedOut,
    /// Invalid constructor argument (wrong-role TLS context, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,
    /// TLS layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Synthesize the capacity-exhaustion error used by the elastic buffer
/// ceilings. Carries the OS `ENOBUFS` code so handlers see a real errno.
pub(crate) fn no_buffer_space() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOBUFS)
}

/// Synthesize the timeout error used by the synchronous I/O arbiter.
pub(crate) fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

/// Synthesize the canceled-operation error delivered to the losing half of
/// a timeout race or to completions cut short by disconnect.
pub(crate) fn operation_aborted() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

pub(crate) fn is_timed_out(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut || err.raw_os_error() == Some(libc::ETIMEDOUT)
}

/// Benign-teardown filter: expected end-of-stream and cancellation codes
/// that are swallowed rather than surfaced through `on_error`.
pub(crate) fn is_benign(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => return true,
        _ => {}
    }
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNABORTED) | Some(libc::ECONNREFUSED) | Some(libc::ECONNRESET)
            | Some(libc::ECANCELED)
    )
}

/// TLS additions to the benign set: close_notify truncation plus the record
/// layer conditions a misbehaving or plaintext peer commonly produces.
pub(crate) fn is_benign_tls(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::DecryptError
            | rustls::Error::AlertReceived(rustls::AlertDescription::CloseNotify)
            | rustls::Error::InvalidMessage(rustls::InvalidMessage::UnknownProtocolVersion)
    )
}

/// Convert a rustls error into the `io::Error` the byte pump propagates.
/// Benign record-layer conditions map onto the benign-teardown set so the
/// generic filter swallows them.
pub(crate) fn tls_to_io(err: rustls::Error) -> io::Error {
    if is_benign_tls(&err) {
        io::Error::new(io::ErrorKind::ConnectionAborted, err)
    } else {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Split an `io::Error` into the `(code, category, message)` triple handed
/// to `on_error` hooks.
pub(crate) fn describe(err: &io::Error) -> (i32, &'static str, String) {
    let code = err.raw_os_error().unwrap_or(0);
    let category = if err.get_ref().map(|e| e.is::<rustls::Error>()).unwrap_or(false) {
        "tls"
    } else if err.raw_os_error().is_some() {
        "system"
    } else {
        "netline"
    };
    (code, category, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_classification() {
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_benign(&operation_aborted()));

        assert!(!is_benign(&no_buffer_space()));
        assert!(!is_benign(&timed_out()));
        assert!(!is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn tls_benign_classification() {
        assert!(is_benign_tls(&rustls::Error::DecryptError));
        assert!(is_benign_tls(&rustls::Error::AlertReceived(
            rustls::AlertDescription::CloseNotify
        )));
        assert!(!is_benign_tls(&rustls::Error::HandshakeNotComplete));

        // Benign TLS errors survive the io conversion as benign.
        assert!(is_benign(&tls_to_io(rustls::Error::DecryptError)));
        assert!(!is_benign(&tls_to_io(rustls::Error::HandshakeNotComplete)));
    }

    #[test]
    fn timeout_detection() {
        assert!(is_timed_out(&timed_out()));
        assert!(is_timed_out(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timed_out(&no_buffer_space()));
    }

    #[test]
    fn describe_triple() {
        let (code, category, message) = describe(&no_buffer_space());
        assert_eq!(code, libc::ENOBUFS);
        assert_eq!(category, "system");
        assert!(!message.is_empty());

        let (code, category, _) = describe(&io::Error::new(io::ErrorKind::Other, "local"));
        assert_eq!(code, 0);
        assert_eq!(category, "netline");
    }
}
