//! Worker thread CPU pinning
//!
//! Pinning is opt-in through [`NetConfig::worker_cpus`](crate::NetConfig::worker_cpus).
//! A failed pin is logged by the worker and otherwise ignored.

use std::io;

/// CPU that worker `index` should run on, cycling through `cpus`.
pub fn worker_cpu(cpus: &[usize], index: usize) -> Option<usize> {
    if cpus.is_empty() {
        None
    } else {
        Some(cpus[index % cpus.len()])
    }
}

/// Pins the calling thread to `cpu`.
///
/// Uses `sched_setaffinity` on Linux, Android and FreeBSD and
/// `SetThreadAffinityMask` on Windows. Elsewhere it succeeds without pinning.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            pin_unix(cpu)
        } else if #[cfg(target_os = "windows")] {
            pin_windows(cpu)
        } else {
            let _ = cpu;
            Ok(())
        }
    }
}

/// Logical CPUs available to the process; 1 when unknown.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn pin_unix(cpu: usize) -> io::Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};

    if cpu >= CPU_SETSIZE as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("cpu {} out of range", cpu)));
    }
    // SAFETY: cpu_set_t is plain data and `cpu` is below CPU_SETSIZE.
    unsafe {
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);
        if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn pin_windows(cpu: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Threading::{GetCurrentThread, SetThreadAffinityMask};

    if cpu >= usize::BITS as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("cpu {} out of range", cpu)));
    }
    // SAFETY: GetCurrentThread returns a pseudo handle valid for this thread.
    if unsafe { SetThreadAffinityMask(GetCurrentThread(), 1usize << cpu) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_cpu_cycles() {
        assert_eq!(worker_cpu(&[], 3), None);
        assert_eq!(worker_cpu(&[2, 5], 0), Some(2));
        assert_eq!(worker_cpu(&[2, 5], 1), Some(5));
        assert_eq!(worker_cpu(&[2, 5], 2), Some(2));
    }

    #[test]
    fn test_pin_current_thread() {
        assert!(cpu_count() > 0);
        // may be refused in restricted environments; it must not panic
        let _ = std::thread::spawn(|| pin_to_cpu(0)).join();
    }

    #[test]
    fn test_pin_rejects_absurd_cpu() {
        if cfg!(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "windows")) {
            assert!(pin_to_cpu(1 << 20).is_err());
        }
    }
}
