use crate::error::TranscodeError;

/// Half the 32-bit timestamp space. Differences at or above this are
/// treated as wraps rather than plain jumps.
const HALF_SPACE: u64 = 1 << 31;

/// Headroom added under the first observed timestamp so that early
/// out-of-order packets cannot underflow the extended clock.
const EPOCH_HEADROOM: u64 = 1 << 32;

/// Unwraps 32-bit RTP timestamps into a 64-bit monotonic clock and derives
/// a presentation time relative to the first observed packet.
///
/// The extended clock survives forward wraps and tolerates bounded
/// out-of-order movement in either direction; a jump that cannot be
/// classified is reported as a discontinuity and the mapper must be
/// rebased before further use.
#[derive(Debug, Default)]
pub struct TimestampMapper {
    /// Extended value of the first packet (t0).
    start: Option<u64>,
    /// Last raw 32-bit timestamp seen.
    last: u32,
    /// Extended 64-bit position of `last`.
    extended: u64,
    /// Last presentation time handed out, kept for rebasing.
    last_pts: i64,
}

impl TimestampMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a 32-bit RTP timestamp to a presentation time in the stream's
    /// clock units.
    pub fn map(&mut self, ts: u32) -> Result<i64, TranscodeError> {
        let start = match self.start {
            Some(start) => start,
            None => {
                let extended = EPOCH_HEADROOM + u64::from(ts);
                self.start = Some(extended);
                self.last = ts;
                self.extended = extended;
                self.last_pts = 0;
                return Ok(0);
            }
        };

        let n = u64::from(ts);
        let m = u64::from(self.last);

        let extended = if n == m {
            self.extended
        } else if n > m && n - m < HALF_SPACE {
            // Plain forward movement.
            self.extended + (n - m)
        } else if m > n && m - n >= HALF_SPACE {
            // Forward wrap across the 32-bit boundary.
            self.extended + ((1 << 32) - m) + n
        } else if n > m && n - m >= HALF_SPACE {
            // Out-of-order packet from before a wrap.
            let back = m + ((1 << 32) - n);
            self.extended
                .checked_sub(back)
                .ok_or(TranscodeError::TimestampDiscontinuity)?
        } else {
            // m > n, small difference: plain out-of-order movement.
            let back = m - n;
            self.extended
                .checked_sub(back)
                .ok_or(TranscodeError::TimestampDiscontinuity)?
        };

        self.last = ts;
        self.extended = extended;
        self.last_pts = extended as i64 - start as i64;
        Ok(self.last_pts)
    }

    /// Restarts the mapping after a discontinuity so that `ts` continues
    /// from the last presentation time handed out.
    pub fn rebase(&mut self, ts: u32) {
        let extended = EPOCH_HEADROOM + u64::from(ts);
        self.start = Some((extended as i64 - self.last_pts) as u64);
        self.last = ts;
        self.extended = extended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_packet_is_zero() {
        let mut m = TimestampMapper::new();
        assert_eq!(m.map(123_456).unwrap(), 0);
    }

    #[test]
    fn test_forward_advance() {
        let mut m = TimestampMapper::new();
        m.map(1000).unwrap();
        assert_eq!(m.map(4000).unwrap(), 3000);
        assert_eq!(m.map(4000).unwrap(), 3000);
    }

    #[test]
    fn test_forward_wrap() {
        let mut m = TimestampMapper::new();
        m.map(u32::MAX - 500).unwrap();
        // Wraps past zero: advance is 501 + 499.
        assert_eq!(m.map(499).unwrap(), 1000);
    }

    #[test]
    fn test_backward_reorder() {
        let mut m = TimestampMapper::new();
        m.map(10_000).unwrap();
        m.map(13_000).unwrap();
        assert_eq!(m.map(12_000).unwrap(), 2000);
        // Forward again from the reordered position.
        assert_eq!(m.map(16_000).unwrap(), 6000);
    }

    #[test]
    fn test_backward_across_wrap() {
        let mut m = TimestampMapper::new();
        m.map(100).unwrap();
        m.map(400).unwrap();
        // A packet from just before the wrap point arrives late.
        assert_eq!(m.map(u32::MAX - 99).unwrap(), 300 - 500);
    }

    #[test]
    fn test_rebase_continues_presentation_time() {
        let mut m = TimestampMapper::new();
        m.map(1000).unwrap();
        m.map(2000).unwrap();
        m.rebase(900_000);
        assert_eq!(m.map(900_000).unwrap(), 1000);
        assert_eq!(m.map(900_100).unwrap(), 1100);
    }
}
