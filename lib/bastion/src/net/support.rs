use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation cannot make progress yet; try again once the socket is
    /// ready. Not a failure.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// A message cursor ran past the end of the frame.
    Truncated,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Truncated)).has_failed());
    }
}
