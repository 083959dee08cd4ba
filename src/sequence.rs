// Bilateral Firmware - 8-bit Wrapping Sequence Numbers
//
// Beacon sequences are a single byte on the wire and wrap 255 -> 0. Ordering
// is defined over the half-range, so 0 follows 255 and a gap never reads as
// 255 lost beacons.

/// Returns whether `s1` is newer than `s2`.
/// sequence_greater_than(2, 1) is true, sequence_greater_than(0, 255) is true,
/// sequence_greater_than(1, 1) is false.
pub fn sequence_greater_than(s1: u8, s2: u8) -> bool {
    ((s1 > s2) && (s1 - s2 <= 128)) || ((s1 < s2) && (s2 - s1 > 128))
}

pub fn sequence_less_than(s1: u8, s2: u8) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `a` forward to `b`.
///
/// ```
/// # use bilateral::sequence::wrapping_diff;
/// assert_eq!(wrapping_diff(1, 2), 1);
/// assert_eq!(wrapping_diff(2, 1), -1);
/// assert_eq!(wrapping_diff(255, 0), 1);
/// assert_eq!(wrapping_diff(254, 1), 3);
/// ```
pub fn wrapping_diff(a: u8, b: u8) -> i8 {
    b.wrapping_sub(a) as i8
}

/// Number of sequence numbers skipped between `last` and `next`, or `None`
/// if `next` is not newer than `last`. Ordering follows
/// `sequence_greater_than`, so a forward gap of exactly half the range counts
/// 127 skipped values.
pub fn missed_between(last: u8, next: u8) -> Option<u8> {
    if sequence_greater_than(next, last) {
        Some(next.wrapping_sub(last) - 1)
    } else {
        None
    }
}
