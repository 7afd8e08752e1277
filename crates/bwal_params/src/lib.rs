//! Filesystem-wide constants that size the write-ahead log.
#![no_std]

/// Block size, in bytes.
pub const BSIZE: usize = 1024;

/// Max number of blocks any single FS operation may log.
pub const MAX_OP_BLOCKS: usize = 10;

/// Max number of distinct blocks logged by one commit group.
pub const LOG_SIZE: usize = MAX_OP_BLOCKS * 3;

// The header block holds a 32-bit entry count followed by `LOG_SIZE`
// 32-bit block numbers; it must fit in a single block. `BSIZE`/`LOG_SIZE`
// are fixed at build time, so a misconfiguration is a build failure
// rather than the runtime fatal error the distilled spec describes.
const _: () = assert!(LOG_SIZE * 4 + 4 < BSIZE);
