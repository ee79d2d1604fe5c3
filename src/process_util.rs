//! Small helpers shared by the subprocess-based executors and tunnels.

use std::path::PathBuf;

/// Locate `binary` on `PATH` without shelling out to `which`/`command -v`.
pub fn which(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

pub fn kill_process_group(pid: i32, force: bool) {
    #[cfg(unix)]
    unsafe {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        libc::kill(-pid, signal);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
    }
}
