//! Raw process metrics from the kernel's process tables.
//!
//! Linux reads `/proc/self/{stat,status,io}`; every quantity degrades to `0`
//! when a source is unreadable, so restricted environments still emit
//! well-formed telemetry.

use std::time::Instant;

struct CpuSample {
    total_ticks: u64,
    at_ms: u64,
}

struct IoSample {
    total_bytes: u64,
    at_ms: u64,
}

/// Samples CPU, resident memory, and I/O rate for the current process.
/// Rates are computed against the previous call, so the first call of each
/// rate quantity returns `0`.
pub struct ProcessSampler {
    origin: Instant,
    ticks_per_sec: u64,
    cpu: Option<CpuSample>,
    io: Option<IoSample>,
}

impl ProcessSampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            ticks_per_sec: clock_ticks_per_sec(),
            cpu: None,
            io: None,
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// CPU usage in percent since the previous sample.
    pub fn cpu_percent(&mut self) -> f32 {
        let Some(total_ticks) = read_cpu_ticks() else {
            return 0.0;
        };
        let now = self.now_ms();
        let percent = match &self.cpu {
            Some(last) if now > last.at_ms && total_ticks >= last.total_ticks => {
                let tick_delta = total_ticks - last.total_ticks;
                let ms_delta = now - last.at_ms;
                #[allow(clippy::cast_precision_loss)]
                {
                    100.0 * tick_delta as f32 * 1000.0 / (self.ticks_per_sec * ms_delta) as f32
                }
            }
            _ => 0.0,
        };
        self.cpu = Some(CpuSample {
            total_ticks,
            at_ms: now,
        });
        percent
    }

    /// Resident set size in MiB.
    #[allow(clippy::cast_precision_loss, clippy::unused_self)]
    pub fn memory_mib(&mut self) -> f32 {
        read_rss_kib().map_or(0.0, |kib| kib as f32 / 1024.0)
    }

    /// Combined read+write rate in KiB/s since the previous sample.
    pub fn io_rate_kib(&mut self) -> f32 {
        let Some(total_bytes) = read_io_bytes() else {
            return 0.0;
        };
        let now = self.now_ms();
        let rate = match &self.io {
            Some(last) if now > last.at_ms && total_bytes >= last.total_bytes => {
                let byte_delta = total_bytes - last.total_bytes;
                let ms_delta = now - last.at_ms;
                #[allow(clippy::cast_precision_loss)]
                {
                    (byte_delta as f64 / 1024.0 / (ms_delta as f64 / 1000.0)) as f32
                }
            }
            _ => 0.0,
        };
        self.io = Some(IoSample {
            total_bytes,
            at_ms: now,
        });
        rate
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).unwrap_or(100)
}

#[cfg(not(target_os = "linux"))]
fn clock_ticks_per_sec() -> u64 {
    100
}

/// utime + stime from `/proc/self/stat`. The command name can contain
/// spaces and parentheses, so fields are located after the last `)`.
#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_ascii_whitespace();
    // state is field 3; utime and stime are fields 14 and 15.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(target_os = "linux")]
fn read_rss_kib() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_ascii_whitespace().next())
        .and_then(|kib| kib.parse().ok())
}

#[cfg(target_os = "linux")]
fn read_io_bytes() -> Option<u64> {
    let io = std::fs::read_to_string("/proc/self/io").ok()?;
    let mut read_bytes = None;
    let mut write_bytes = None;
    for line in io.lines() {
        if let Some(rest) = line.strip_prefix("read_bytes:") {
            read_bytes = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("write_bytes:") {
            write_bytes = rest.trim().parse::<u64>().ok();
        }
    }
    Some(read_bytes? + write_bytes?)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_rss_kib() -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_io_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_rate_samples_are_zero() {
        let mut sampler = ProcessSampler::new();
        assert_eq!(sampler.cpu_percent(), 0.0);
        assert_eq!(sampler.io_rate_kib(), 0.0);
    }

    #[test]
    fn samples_are_non_negative() {
        let mut sampler = ProcessSampler::new();
        sampler.cpu_percent();
        sampler.io_rate_kib();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(sampler.cpu_percent() >= 0.0);
        assert!(sampler.memory_mib() >= 0.0);
        assert!(sampler.io_rate_kib() >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_stat_parses() {
        assert!(read_cpu_ticks().is_some());
        assert!(read_rss_kib().unwrap_or(0) > 0);
    }
}
