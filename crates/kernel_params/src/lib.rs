//! Compile-time tunables shared by the buffer cache and page allocator.
#![no_std]

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Size of the disk block cache, in buffers.
pub const NBUF: usize = 30;

/// Number of hash buckets the buffer cache is sharded into.
///
/// Deliberately small: uniform block distribution across buckets is
/// assumed, not a coprimality property with typical access strides.
pub const NBUCKET: usize = 5;

/// Disk block size, in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Physical page size, in bytes.
pub const PAGE_SIZE: usize = 4096;
