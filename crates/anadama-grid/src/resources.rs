//! Resource requests for grid jobs and the retry scaling rules.

/// How many times a memory- or time-killed job is resubmitted with
/// scaled resources before it is reported failed.
pub const GRID_RETRY_LIMIT: u32 = 3;

/// Resources requested for one grid task.
#[derive(Debug, Clone, PartialEq)]
pub struct GridResources {
    pub cores: u32,
    pub time_minutes: u64,
    pub mem_mb: u64,
    /// Overrides the driver's default partition/queue when set.
    pub partition: Option<String>,
    pub max_retries: u32,
}

impl GridResources {
    pub fn new(time_minutes: u64, mem_mb: u64, cores: u32) -> Self {
        Self {
            cores,
            time_minutes,
            mem_mb,
            partition: None,
            max_retries: GRID_RETRY_LIMIT,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Memory after `tries` memory-kills: the original request scaled by
/// 1.3 per kill, so 100MB becomes ~130, ~169, ~220.
pub fn scale_memory(base_mb: u64, tries: u32) -> u64 {
    (base_mb as f64 * 1.3f64.powi(tries as i32)).round() as u64
}

/// Wall-clock budget after `tries` timeouts, stretched by half again per
/// timeout.
pub fn scale_time(base_minutes: u64, tries: u32) -> u64 {
    (base_minutes as f64 * 1.5f64.powi(tries as i32)).round() as u64
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case(100, 1, 130)]
    #[test_case(100, 2, 169)]
    #[test_case(100, 3, 220)]
    fn memory_scaling(base: u64, tries: u32, expected: u64) {
        assert_eq!(scale_memory(base, tries), expected);
    }

    #[test_case(60, 1, 90)]
    #[test_case(60, 2, 135)]
    fn time_scaling(base: u64, tries: u32, expected: u64) {
        assert_eq!(scale_time(base, tries), expected);
    }
}
