//! Utility macros for error handling.

/// Creates a [`crate::error::Error`] from an error kind and description,
/// optionally with a dynamic detail string.
#[macro_export]
macro_rules! pgclone_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::Error::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::Error::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::Error`] from the current function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::pgclone_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::pgclone_error!($kind, $desc, $detail))
    };
}
