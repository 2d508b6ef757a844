//! Pid files and liveness probes for the restart logic.
//!
//! Each actor records its OS pid in `<run_dir>/<actor>_pid.txt` at
//! bootstrap. The coordinator's restart path probes those pids with
//! signal 0 before deciding whether a respawn needs `force`.

use crate::config::ApexConfig;
use crate::error::Result;
use crate::messages::ActorId;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Record the current process id for `actor`.
pub fn write_pid_file(config: &ApexConfig, actor: ActorId) -> Result<()> {
    std::fs::create_dir_all(&config.run_dir)?;
    let path = config.pid_path(&actor.to_string());
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    log::debug!("wrote pid file {}", path.display());
    Ok(())
}

/// Read the recorded pid for `actor`, if a pid file exists and parses.
pub fn read_pid(config: &ApexConfig, actor: ActorId) -> Option<i32> {
    let raw = std::fs::read_to_string(config.pid_path(&actor.to_string())).ok()?;
    raw.trim().parse().ok()
}

/// Probe a pid with signal 0.
pub fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// The recorded pid of `actor`, if that process is still running.
pub fn live_pid(config: &ApexConfig, actor: ActorId) -> Option<i32> {
    read_pid(config, actor).filter(|&pid| is_alive(pid))
}

/// Kill a process outright. Used only under the `force` restart flag.
pub fn kill_process(pid: i32) -> Result<()> {
    kill(Pid::from_raw(pid), Some(Signal::SIGKILL))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> ApexConfig {
        ApexConfig::new().with_run_dir(dir)
    }

    #[test]
    fn test_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        write_pid_file(&config, ActorId::Worker(2)).unwrap();
        let pid = read_pid(&config, ActorId::Worker(2)).unwrap();
        assert_eq!(pid as u32, std::process::id());
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn test_missing_pid_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_pid(&config(dir.path()), ActorId::Learner).is_none());
    }

    #[test]
    fn test_live_pid_filters_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        // Write an implausible pid; the probe must reject it.
        std::fs::create_dir_all(&config.run_dir).unwrap();
        std::fs::write(config.pid_path("learner"), "999999999\n").unwrap();
        assert!(live_pid(&config, ActorId::Learner).is_none());
    }
}
