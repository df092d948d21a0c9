//! Isolated child-process launch for one executor.
//!
//! Spawn protocol: the parent forks, the child parks on a synchronization
//! socketpair until the parent has placed its pid into the task's control
//! group, then applies optional namespace isolation, wires its stdio to the
//! forwarded sockets and execs the executor binary. Stream fds named in the
//! environment contract stay inheritable for the duration of the spawn.

use crate::cgroup::ControlGroup;
use crate::error::{ClusterError, Result};
use flowgraph_core::device::{Device, ScopedOpenOnExec};
use flowgraph_protocol::{ExitStatus, EXIT_CONTAINER_SPAWN_FAILED};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvpe, fork, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Everything needed to exec one executor child.
pub struct SpawnCommand {
    pub file: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Sockets dup2'd onto the child's stdout and stderr.
    pub stdio: Option<(Arc<Device>, Arc<Device>)>,
    /// Devices whose fds the environment contract references; kept
    /// inheritable across the exec.
    pub inherit: Vec<Arc<Device>>,
    pub namespaces: CloneFlags,
}

/// Supervisor handle for one spawned executor process.
#[derive(Default)]
pub struct Container {
    pid: Option<Pid>,
    status: Option<ExitStatus>,
    cgroup: Option<ControlGroup>,
}

impl Container {
    pub fn new(cgroup: Option<ControlGroup>) -> Self {
        Self {
            pid: None,
            status: None,
            cgroup,
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    pub fn cgroup(&self) -> Option<&ControlGroup> {
        self.cgroup.as_ref()
    }

    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// True between a successful spawn and the reaping wait.
    pub fn alive(&self) -> bool {
        self.pid.is_some() && self.status.is_none()
    }

    pub fn spawn(&mut self, command: &SpawnCommand) -> Result<()> {
        if self.pid.is_some() {
            return Err(ClusterError::Container("container already spawned".into()));
        }

        let file = CString::new(command.file.as_str())
            .map_err(|_| ClusterError::Container("NUL byte in program path".into()))?;
        let mut argv = vec![file.clone()];
        for arg in &command.args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| ClusterError::Container("NUL byte in argv".into()))?,
            );
        }
        let mut envp = Vec::with_capacity(command.envs.len());
        for (key, value) in &command.envs {
            envp.push(
                CString::new(format!("{key}={value}"))
                    .map_err(|_| ClusterError::Container("NUL byte in environment".into()))?,
            );
        }

        // Inheritable + blocking only for the spawn window.
        let mut guards = Vec::new();
        for device in &command.inherit {
            guards.push(ScopedOpenOnExec::new(device.clone())?);
        }
        if let Some((out, err)) = &command.stdio {
            guards.push(ScopedOpenOnExec::new(out.clone())?);
            guards.push(ScopedOpenOnExec::new(err.clone())?);
        }

        let (mut parent_sync, mut child_sync) = UnixStream::pair()?;

        match unsafe { fork() }.map_err(ClusterError::from_errno)? {
            ForkResult::Child => {
                // Wait until the parent has grouped us.
                let mut byte = [0u8; 1];
                let _ = child_sync.read_exact(&mut byte);

                if !command.namespaces.is_empty() {
                    let _ = nix::sched::unshare(command.namespaces);
                }
                if let Some((out, err)) = &command.stdio {
                    let _ = dup2(out.fd(), 1);
                    let _ = dup2(err.fd(), 2);
                }
                let _ = execvpe(&file, &argv, &envp);
                std::process::exit(EXIT_CONTAINER_SPAWN_FAILED);
            }
            ForkResult::Parent { child } => {
                if let Some(cgroup) = &self.cgroup {
                    if let Err(err) = cgroup.add(child.as_raw()) {
                        tracing::warn!(pid = child.as_raw(), error = %err, "cgroup placement failed");
                    }
                }
                parent_sync.write_all(&[1])?;
                self.pid = Some(child);
                tracing::info!(pid = child.as_raw(), file = %command.file, "container spawned");
                Ok(())
            }
        }
    }

    /// Send SIGKILL; reaping still happens through [`wait`](Self::wait).
    pub fn kill(&self) -> Result<()> {
        match self.pid {
            Some(pid) if self.status.is_none() => {
                kill(pid, Signal::SIGKILL).map_err(ClusterError::from_errno)
            }
            _ => Ok(()),
        }
    }

    /// Block until the child exits and return its status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let pid = self
            .pid
            .ok_or_else(|| ClusterError::Container("container never spawned".into()))?;
        loop {
            match waitpid(pid, None).map_err(ClusterError::from_errno)? {
                WaitStatus::Exited(_, code) => {
                    let status = ExitStatus::Exited(code);
                    self.status = Some(status);
                    return Ok(status);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    let status = ExitStatus::Signaled(signal as i32);
                    self.status = Some(status);
                    return Ok(status);
                }
                _ => continue,
            }
        }
    }

    /// Non-blocking reap; `Some` once the child has exited.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(ClusterError::from_errno)? {
            WaitStatus::Exited(_, code) => {
                self.status = Some(ExitStatus::Exited(code));
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.status = Some(ExitStatus::Signaled(signal as i32));
            }
            _ => return Ok(None),
        }
        Ok(self.status)
    }
}

/// Optional namespace knobs carried in a container's config map.
pub fn namespace_flags(configs: &HashMap<String, String>) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    let knobs = [
        ("namespace.mount", CloneFlags::CLONE_NEWNS),
        ("namespace.pid", CloneFlags::CLONE_NEWPID),
        ("namespace.uts", CloneFlags::CLONE_NEWUTS),
        ("namespace.ipc", CloneFlags::CLONE_NEWIPC),
        ("namespace.net", CloneFlags::CLONE_NEWNET),
    ];
    for (key, flag) in knobs {
        if configs.get(key).map(String::as_str) == Some("1") {
            flags |= flag;
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_command(file: &str, args: &[&str]) -> SpawnCommand {
        SpawnCommand {
            file: file.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            envs: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            stdio: None,
            inherit: Vec::new(),
            namespaces: CloneFlags::empty(),
        }
    }

    #[test]
    fn spawn_and_wait_reports_exit_code() {
        let mut container = Container::new(None);
        container.spawn(&plain_command("true", &[])).unwrap();
        assert!(container.alive());
        assert_eq!(container.wait().unwrap(), ExitStatus::Exited(0));
        assert!(!container.alive());

        let mut failing = Container::new(None);
        failing.spawn(&plain_command("false", &[])).unwrap();
        assert_eq!(failing.wait().unwrap(), ExitStatus::Exited(1));
    }

    #[test]
    fn kill_terminates_with_signal_status() {
        let mut container = Container::new(None);
        container.spawn(&plain_command("sleep", &["30"])).unwrap();
        container.kill().unwrap();
        let status = container.wait().unwrap();
        assert_eq!(status, ExitStatus::Signaled(9));
    }

    #[test]
    fn try_wait_is_none_while_running() {
        let mut container = Container::new(None);
        container.spawn(&plain_command("sleep", &["30"])).unwrap();
        assert_eq!(container.try_wait().unwrap(), None);
        container.kill().unwrap();
        // The kill lands asynchronously; poll until the reap completes.
        loop {
            if let Some(status) = container.try_wait().unwrap() {
                assert_eq!(status, ExitStatus::Signaled(9));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn namespace_knobs_parse_from_configs() {
        let mut configs = HashMap::new();
        configs.insert("namespace.uts".to_string(), "1".to_string());
        configs.insert("namespace.net".to_string(), "0".to_string());
        let flags = namespace_flags(&configs);
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }
}
