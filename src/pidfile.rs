//! PID file management (spec §6.4).
//!
//! Writes the running process id as a single ASCII line and removes the
//! file again on clean shutdown. No teacher file does this (turn-rs is
//! always run under a supervisor that tracks its own pid), so this is
//! grounded on the original `rtpproxy`'s own pidfile handling in
//! `main.c`: refuse to start if a live process already owns the file,
//! otherwise overwrite it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates (or takes over) the pid file at `path`, after checking that
    /// no other live process currently holds it.
    pub fn create(path: PathBuf) -> Result<Self> {
        if let Some(existing) = read_pid(&path)? {
            if process_is_alive(existing) {
                bail!("pid file {} is held by running process {existing}", path.display());
            }
        }

        std::fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Ok(contents) = std::fs::read_to_string(&self.path) {
            if contents.trim() == std::process::id().to_string() {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading pid file {}", path.display())),
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // signal 0 performs no action but still validates permission/existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_own_pid() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rtprelay-test-{}.pid", std::process::id()));

        let pidfile = PidFile::create(path.clone()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn refuses_to_take_over_a_live_process() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rtprelay-test-live-{}.pid", std::process::id()));
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::create(path.clone()).unwrap_err();
        assert!(err.to_string().contains("held by running process"));

        std::fs::remove_file(&path).unwrap();
    }
}
