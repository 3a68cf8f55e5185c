//! Internal helper macros.

/// Returns early with `Err($error)` when `$predicate` does not hold.
///
/// Like `assert!`, but for validation that reports an error instead of panicking.
///
/// ```ignore
/// ensure!(marker.len() <= self.block_size / 2, ParseError::MarkerTooLong { .. });
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
