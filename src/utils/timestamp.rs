use std::cmp::Ordering;

/// A timestamp of the X server, in milliseconds.
///
/// The server clock is a 32-bit counter that wraps around roughly every 49.7 days,
/// so comparisons treat the value space as a circle: a timestamp is considered
/// older than another if it lies less than half the range behind it.
///
/// The protocol reserves `0` as `CurrentTime`, a wildcard that is never ordered
/// against real timestamps by the selection code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Timestamp(pub(crate) u32);

impl Timestamp {
    /// The `CurrentTime` wildcard
    pub const CURRENT_TIME: Timestamp = Timestamp(x11rb::CURRENT_TIME);

    /// Whether this is the `CurrentTime` wildcard instead of an actual server time
    pub fn is_current_time(&self) -> bool {
        *self == Self::CURRENT_TIME
    }

    /// Checks if a timestamp was taken after or at the same time as another given timestamp
    pub fn is_no_older_than(&self, other: &Timestamp) -> bool {
        other <= self
    }

    /// Returns the more recent of two timestamps, ignoring `CurrentTime`
    pub fn latest(self, other: Timestamp) -> Timestamp {
        if self.is_current_time() {
            other
        } else if other.is_current_time() || other <= self {
            self
        } else {
            other
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let distance = if self.0 > other.0 {
            self.0 - other.0
        } else {
            other.0 - self.0
        };
        if distance < u32::MAX / 2 {
            self.0.partial_cmp(&other.0)
        } else {
            // wrap-around occurred, invert comparison
            other.0.partial_cmp(&self.0)
        }
    }
}

impl From<u32> for Timestamp {
    fn from(time: u32) -> Self {
        Timestamp(time)
    }
}

impl From<Timestamp> for u32 {
    fn from(time: Timestamp) -> u32 {
        time.0
    }
}
