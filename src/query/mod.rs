pub mod aggregate;
pub mod compile;
pub mod display;
pub mod filters;
pub mod group_keys;
pub mod postprocess;
pub mod result;
pub mod runner;
pub mod spec;
pub mod sql;
pub mod steps;

/// Sentinel for a missing or empty dimension value.
pub const NONE_VALUE: &str = "$none";
/// Sentinel carried by every dimension column of the overall row.
pub const NO_GROUP_VALUE: &str = "$no_group";
/// Name of the side table holding average step times.
pub const META_STEP_TIME_INFO: &str = "MetaStepTimeInfo";

/// Count column of step `i`.
pub fn step_column(i: usize) -> String {
    format!("step_{i}")
}

/// First recorded timestamp of step `i` per identity.
pub fn step_timestamp_column(i: usize) -> String {
    format!("step_{i}_timestamp")
}

/// Average time between step `i - 1` and step `i`.
pub fn step_time_column(i: usize) -> String {
    format!("step_{}_{i}_time", i - 1)
}

pub fn is_step_column(name: &str) -> bool {
    name.strip_prefix("step_")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

pub fn is_step_time_column(name: &str) -> bool {
    name.starts_with("step_") && name.ends_with("_time")
}

pub fn is_conversion_column(name: &str) -> bool {
    name.ends_with(postprocess::CONVERSION_SUFFIX)
}

/// Tunables applied while compiling and shaping a funnel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryLimits {
    pub max_steps: usize,
    /// Maximum number of grouped rows, not counting the overall row.
    pub result_limit: usize,
    pub bucket_count: u32,
    pub percentile_lower: f64,
    pub percentile_upper: f64,
    /// Decimal places kept on step times.
    pub time_precision: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_steps: 10,
            result_limit: 100,
            bucket_count: 8,
            percentile_lower: 0.02,
            percentile_upper: 0.98,
            time_precision: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!(step_column(2), "step_2");
        assert_eq!(step_timestamp_column(0), "step_0_timestamp");
        assert_eq!(step_time_column(1), "step_0_1_time");
    }

    #[test]
    fn test_column_classification() {
        assert!(is_step_column("step_0"));
        assert!(is_step_column("step_12"));
        assert!(!is_step_column("step_0_1_time"));
        assert!(!is_step_column("step_"));
        assert!(!is_step_column("_group_key_0"));
        assert!(is_step_time_column("step_0_1_time"));
        assert!(!is_step_time_column("step_1"));
        assert!(is_conversion_column("step_0_step_1_conv"));
        assert!(is_conversion_column("overall_conv"));
    }
}
