//! Per-device communication statistics.

/// Response time sampler with min/max/average over a capped number of
/// samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeStats {
    /// Smallest sample seen, in microseconds. `u32::MAX` before any sample.
    pub min: u32,
    /// Largest sample seen, in microseconds.
    pub max: u32,
    /// Sum of all accepted samples, in microseconds.
    pub sum: u32,
    pub number_of_samples: u32,
    /// `sum / number_of_samples`, or 0 before any sample.
    pub average: u32,
}

impl Default for ResponseTimeStats {
    fn default() -> Self {
        Self {
            min: u32::MAX,
            max: 0,
            sum: 0,
            number_of_samples: 0,
            average: 0,
        }
    }
}

impl ResponseTimeStats {
    /// Record one sample.
    ///
    /// The sample is dropped when `max_number_of_samples` have already been
    /// recorded, or when adding it would overflow the u32 sum.
    pub fn update(&mut self, sample: u32, max_number_of_samples: u16) {
        if self.number_of_samples >= u32::from(max_number_of_samples) {
            return;
        }
        let sum = match self.sum.checked_add(sample) {
            Some(sum) => sum,
            None => return,
        };
        self.sum = sum;
        self.number_of_samples += 1;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        self.average = self.sum / self.number_of_samples;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Counters for the communication with one slave device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub number_of_sent_frames: u32,
    pub number_of_incoming_frames: u32,
    pub number_of_incoming_invalid_frames: u32,
    pub number_of_incoming_alarm_frames: u32,
    pub number_of_connects: u32,
    pub number_of_disconnects: u32,
    pub number_of_timeouts: u32,
    pub measured_time: ResponseTimeStats,
}

impl Statistics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
