use core::fmt;

/// A durability failure encountered while reading or writing a block
/// during recovery or commit.
///
/// The log treats every such failure as fatal (see the crate-level error
/// handling design): there is no partial-retry path, and a failed write
/// either leaves the header unmodified (safe to abort) or leaves a
/// durable record for the next boot's recovery to finish. This type only
/// exists to carry a structured message into the resulting panic.
#[derive(Debug, thiserror::Error)]
#[error("write-ahead log: fatal device I/O error: {0:?}")]
pub struct FatalIoError<E: fmt::Debug>(pub E);

/// Turns a durability failure into the fatal panic the log's error
/// handling design mandates for it.
pub(crate) fn expect_durable<T, E: fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}", FatalIoError(e)),
    }
}
