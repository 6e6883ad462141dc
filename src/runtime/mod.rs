//! Thread utilities: category cpusets and interval threads
//!
//! Thread categories are pinned through environment variables of the form
//! `FAAS_<CATEGORY>_THREAD_CPUSET`, holding a cpu list like `0-3,6`. A
//! category without a setting runs unpinned.

use std::time::Duration;
use tracing::{debug, info};

/// Apply the cpuset configured for `category` to the current thread.
///
/// Panics when a cpuset is configured but cannot be parsed or applied: a
/// misconfigured pin is an operator error worth stopping on.
pub fn apply_thread_cpuset(category: &str) {
    let var_name = format!("FAAS_{category}_THREAD_CPUSET");
    let cpuset_str = match std::env::var(&var_name) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            debug!(
                category,
                var_name, "No cpuset configured for thread category"
            );
            return;
        }
    };
    let cpus = parse_cpu_list(&cpuset_str);
    assert!(
        !cpus.is_empty(),
        "cannot parse cpuset {cpuset_str:?} from {var_name}"
    );
    if let Err(e) = set_affinity(&cpus) {
        panic!("failed to set CPU affinity to {cpuset_str}: {e}");
    }
    info!(category, cpuset = %cpuset_str, "Thread pinned to cpuset");
}

/// Parse a cpu list string (e.g. `0-3,5,7-9`)
fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut result = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                result.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            result.push(cpu);
        }
    }
    result.sort_unstable();
    result.dedup();
    result
}

#[cfg(target_os = "linux")]
fn set_affinity(cpus: &[usize]) -> std::io::Result<()> {
    use std::mem;
    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut cpuset);
        }
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_cpus: &[usize]) -> std::io::Result<()> {
    tracing::warn!("CPU affinity not supported on this platform");
    Ok(())
}

/// Spawn a named thread invoking `tick` on a fixed interval for the life
/// of the process. The thread's cpuset category matches its name.
pub fn spawn_interval_thread<F>(
    name: &str,
    category: &str,
    interval: Duration,
    mut tick: F,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let category = category.to_string();
    std::thread::Builder::new().name(name.to_string()).spawn(move || {
        apply_thread_cpuset(&category);
        loop {
            std::thread::sleep(interval);
            tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0"), vec![0]);
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-2,5,7-9"), vec![0, 1, 2, 5, 7, 8, 9]);
        assert_eq!(parse_cpu_list("3,1,1"), vec![1, 3]);
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
    }

    #[test]
    fn test_unset_category_is_noop() {
        // No FAAS_TEST_NOOP_THREAD_CPUSET in the environment
        apply_thread_cpuset("TEST_NOOP");
    }
}
