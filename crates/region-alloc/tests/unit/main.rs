//! Unit test modules for the allocator family
//!
//! Coverage for the public surface of every allocator:
//! - Block pool free-list behavior, exhaustion, recycling
//! - Chained pool growth, retirement, reserve reuse
//! - Stack and dual-stack regions, markers, scoped rewind
//! - Randomised invariant checks over operation sequences
