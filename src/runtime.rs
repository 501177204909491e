/// Container-aware sizing for the tokio worker thread pool.
///
/// All three mirage components run as single containers with CPU limits;
/// tokio's default (host CPU count) over-provisions threads on large nodes.
/// Detection order: `MIRAGE_CPU_LIMIT` env override, cgroup v2 `cpu.max`,
/// cgroup v1 quota/period, then `available_parallelism()`.
pub fn worker_threads() -> usize {
    if let Ok(raw) = std::env::var("MIRAGE_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&raw) {
            return cores.max(1);
        }
    }

    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2(&content) {
            return cores.max(1);
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_quota_period(&quota, &period) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Accepts "2" (cores) or "2000m" (millicores, downward-API style).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period", or "max period" for unlimited.
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_quota_period(quota, period)
}

fn parse_quota_period(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
