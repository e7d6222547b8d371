// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Child processes under a pseudo-terminal.
//!
//! The pty gives us two things a plain pipe cannot: password prompts reach
//! us (and our replies reach the child) the way a terminal would carry
//! them, and line buffering in the child behaves interactively. The master
//! side is a single bidirectional byte stream.

use anyhow::{anyhow, bail, Context as _, Result};
use nix::errno::Errno;
use nix::libc;
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

pub enum PtyRead {
    Data(usize),
    WouldBlock,
    Eof,
}

pub struct PtyProcess {
    master: Option<OwnedFd>,
    pid: Pid,
    returncode: Option<i32>,
}

impl PtyProcess {
    /// Fork a child under a fresh pty and exec `cmdline` in it. The master
    /// fd is left non-blocking; local echo is disabled before anything is
    /// written, otherwise the password we type is echoed back into the
    /// parsers.
    pub fn spawn(cmdline: &[String]) -> Result<PtyProcess> {
        if cmdline.is_empty() {
            bail!("Cannot spawn an empty command line");
        }
        let argv: Vec<CString> = cmdline
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .context("Command line contains a NUL byte")?;

        let pty = openpty(None, None).context("openpty failed")?;
        let master = pty.master;
        let slave = pty.slave;

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                // Only async-signal-safe calls between fork and exec.
                unsafe {
                    libc::setsid();
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0);
                    libc::dup2(slave.as_raw_fd(), 0);
                    libc::dup2(slave.as_raw_fd(), 1);
                    libc::dup2(slave.as_raw_fd(), 2);
                }
                let _ = execvp(&argv[0], &argv);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop(slave);
                if let Ok(mut termios) = tcgetattr(&master) {
                    termios.local_flags.remove(LocalFlags::ECHO);
                    let _ = tcsetattr(&master, SetArg::TCSADRAIN, &termios);
                }
                unsafe {
                    let flags = libc::fcntl(master.as_raw_fd(), libc::F_GETFL);
                    libc::fcntl(master.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
                Ok(PtyProcess {
                    master: Some(master),
                    pid: child,
                    returncode: None,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// Non-blocking read from the master side. The master reports `EIO`
    /// once the child hangs up; that is a normal end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<PtyRead> {
        let fd = match &self.master {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(PtyRead::Eof),
        };
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => Ok(PtyRead::WouldBlock),
                Errno::EIO => Ok(PtyRead::Eof),
                err => Err(anyhow!("Reading from the pty failed: {}", err)),
            };
        }
        if n == 0 {
            return Ok(PtyRead::Eof);
        }
        Ok(PtyRead::Data(n as usize))
    }

    /// Write the whole buffer. A full tty buffer surfaces as an error; the
    /// caller turns it into a stream interrupt.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let fd = match &self.master {
            Some(fd) => fd.as_raw_fd(),
            None => bail!("The pty is closed"),
        };
        let mut written = 0;
        while written < data.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if n < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                bail!("Writing to the pty failed: {}", err);
            }
            written += n as usize;
        }
        Ok(())
    }

    /// Signal the child, ignoring "no such process": teardown races
    /// against natural exit are expected.
    pub fn send_signal(&self, signal: Signal) {
        let _ = kill(self.pid, signal);
    }

    pub fn terminate(&self) {
        self.send_signal(Signal::SIGTERM);
    }

    fn record_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, code) => self.returncode = Some(code),
            WaitStatus::Signaled(_, signal, _) => self.returncode = Some(-(signal as i32)),
            _ => {}
        }
    }

    /// Non-blocking reap. Returns the exit code once the child is gone:
    /// the code itself for a normal exit, `-signum` for a signaled death.
    pub fn poll(&mut self) -> Option<i32> {
        if self.returncode.is_some() {
            return self.returncode;
        }
        if let Ok(status) = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            self.record_status(status);
        }
        self.returncode
    }

    /// Blocking reap, retried on interruption.
    pub fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = self.returncode {
                return code;
            }
            match waitpid(self.pid, None) {
                Ok(status) => self.record_status(status),
                Err(Errno::EINTR) => continue,
                Err(_) => return self.returncode.unwrap_or(-1),
            }
        }
    }

    /// Close the master fd. Safe to call more than once.
    pub fn close(&mut self) {
        self.master = None;
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }
}
