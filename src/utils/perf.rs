//! Process memory statistics, read from `/proc/self/status` on Linux.

/// Value in kB of a `Key:   1234 kB` line of a proc status file.
fn status_field_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Peak resident set size (`VmHWM`) in kB, or 0 when unavailable.
#[cfg(target_os = "linux")]
pub fn peak_rss_kb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| status_field_kb(&status, "VmHWM"))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn peak_rss_kb() -> u64 {
    use std::sync::Once;
    static WARN_ONCE: Once = Once::new();
    WARN_ONCE.call_once(|| log::warn!("peak RSS is only read on Linux; reporting 0"));
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_field_parsing() {
        let status = "Name:\theff_bench\nVmPeak:\t  20480 kB\nVmHWM:\t   8192 kB\n";
        assert_eq!(status_field_kb(status, "VmHWM"), Some(8192));
        assert_eq!(status_field_kb(status, "VmPeak"), Some(20480));
        assert_eq!(status_field_kb(status, "VmRSS"), None);
    }
}
