//! Custom assertions for allocator tests

use std::fmt::Debug;

/// Assert that an address satisfies an alignment
pub fn assert_aligned(address: usize, align: usize) {
    assert!(
        address % align == 0,
        "Address {:#x} is not aligned to {}",
        address,
        align
    );
}

/// Assert that a value is within a range
pub fn assert_in_range<T: PartialOrd + Debug>(value: T, min: T, max: T) {
    assert!(
        value >= min && value <= max,
        "Value {:?} not in range [{:?}, {:?}]",
        value,
        min,
        max
    );
}

/// Assert that a set of byte ranges is pairwise disjoint
///
/// Ranges are `(start, len)` pairs. Used by stack-region stress tests to
/// prove no two threads were handed overlapping memory.
pub fn assert_disjoint(ranges: &[(usize, usize)]) {
    let mut sorted: Vec<_> = ranges.iter().filter(|(_, len)| *len > 0).collect();
    sorted.sort_by_key(|(start, _)| *start);
    for window in sorted.windows(2) {
        let (a_start, a_len) = *window[0];
        let (b_start, _) = *window[1];
        assert!(
            a_start + a_len <= b_start,
            "Ranges overlap: {:#x}+{} runs into {:#x}",
            a_start,
            a_len,
            b_start
        );
    }
}
