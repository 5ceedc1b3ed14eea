//! Parent side of the descriptor-handoff protocol.
//!
//! A [`UnixCmd`] owns one worker's control socket. The worker asks for
//! ports over it; every port it opens is registered with the shared
//! registry under the command's matcher, and matched connections are passed
//! back to the worker as descriptors.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::control::{decode_port, encode_port, socket_pair, ControlSocket, PORT_MESSAGE_LEN};
use super::CONTROL_FD_ENV;
use crate::buffer::Prefix;
use crate::error::{ControlError, TransferError};
use crate::lock::lock;
use crate::matcher::MatchService;
use crate::proxy::{Backend, Port, PortRegistry, Status};

/// Largest message a worker is expected to send.
const REQUEST_BUFFER_SIZE: usize = 64;

/// Backend that passes matched connections to a worker.
struct ProcessHandoff {
    control: Arc<ControlSocket>,
}

#[async_trait]
impl Backend for ProcessHandoff {
    async fn transfer(&self, prefix: Prefix, conn: TcpStream) -> Result<(), TransferError> {
        // Deregisters from the reactor; the descriptor is ours to send.
        let fd: OwnedFd = conn.into_std()?.into();

        let sent = self.control.send(prefix.filled(), Some(fd.as_fd())).await;

        // The worker has its own copy now; ours closes here either way.
        drop(fd);
        prefix.release();
        sent.map_err(TransferError::from)
    }
}

#[derive(Default)]
struct CmdState {
    open: HashMap<u16, Port>,
    closed: bool,
    exited: bool,
    exit_status: Option<ExitStatus>,
}

struct CmdInner {
    registry: PortRegistry,
    control: Arc<ControlSocket>,
    pid: Option<Pid>,
    state: Mutex<CmdState>,
    done: watch::Sender<bool>,
}

impl CmdInner {
    /// Mark closed and deregister every port. Returns false if already
    /// closed.
    fn close_ports(&self) -> bool {
        let ports = {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.open)
        };
        for port in ports.into_values() {
            port.close();
        }
        true
    }
}

/// A worker reached over a control socket.
///
/// Cheap to clone; clones control the same worker.
#[derive(Clone)]
pub struct UnixCmd {
    inner: Arc<CmdInner>,
}

impl UnixCmd {
    /// Spawn `cmd` as a worker.
    ///
    /// The child inherits one end of a fresh control socket; its descriptor
    /// number is passed in `HOSTMUX_CONTROL_FD`.
    pub fn spawn(
        registry: &PortRegistry,
        matcher: Arc<dyn MatchService>,
        mut cmd: Command,
    ) -> Result<Self, ControlError> {
        let (parent, child) = socket_pair().map_err(ControlError::Spawn)?;
        let child_fd = child.as_raw_fd();

        cmd.env(CONTROL_FD_ENV, child_fd.to_string());
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let process = cmd.spawn().map_err(ControlError::Spawn)?;
        drop(child);

        let control = ControlSocket::from_fd(parent).map_err(ControlError::Spawn)?;
        Ok(Self::start(registry, matcher, control, Some(process)))
    }

    /// Serve the handoff protocol over an already connected control socket.
    pub fn attach(
        registry: &PortRegistry,
        matcher: Arc<dyn MatchService>,
        control: ControlSocket,
    ) -> Self {
        Self::start(registry, matcher, control, None)
    }

    fn start(
        registry: &PortRegistry,
        matcher: Arc<dyn MatchService>,
        control: ControlSocket,
        process: Option<Child>,
    ) -> Self {
        let pid = process
            .as_ref()
            .and_then(Child::id)
            .map(|id| Pid::from_raw(id as i32));
        let (done, _) = watch::channel(false);
        let inner = Arc::new(CmdInner {
            registry: registry.clone(),
            control: Arc::new(control),
            pid,
            state: Mutex::new(CmdState::default()),
            done,
        });

        let span = tracing::info_span!("worker", pid = pid.map(Pid::as_raw));
        tokio::spawn(run(Arc::clone(&inner), matcher, process).instrument(span));
        info!(pid = pid.map(Pid::as_raw), "worker started");
        Self { inner }
    }

    /// Process id of the spawned worker, if there is one.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.map(|pid| pid.as_raw() as u32)
    }

    /// Close every port, shut the control socket down and interrupt the
    /// worker. Fails with [`ControlError::Closed`] if already closed.
    pub fn close(&self) -> Result<(), ControlError> {
        if !self.inner.close_ports() {
            return Err(ControlError::Closed);
        }
        let shutdown = self.inner.control.shutdown();
        let signalled = match self.inner.pid {
            Some(pid) if !lock(&self.inner.state).exited => kill(pid, Signal::SIGINT),
            _ => Ok(()),
        };
        shutdown?;
        signalled?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        let state = lock(&self.inner.state);
        // A port whose listener failed stays in `open` until the worker
        // closes it, but it is no longer serving.
        let mut ports: Vec<u16> = state
            .open
            .iter()
            .filter(|(_, port)| !port.is_closed())
            .map(|(number, _)| *number)
            .collect();
        ports.sort_unstable();
        Status {
            ports,
            closing: state.closed,
            active: !state.exited,
        }
    }

    /// Wait until the control loop has finished and the worker has been
    /// reaped. Returns the worker's exit status when there is a process.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut done = self.inner.done.subscribe();
        // The sender lives in `inner`, which we hold.
        let _ = done.wait_for(|done| *done).await;
        lock(&self.inner.state).exit_status
    }
}

async fn run(inner: Arc<CmdInner>, matcher: Arc<dyn MatchService>, process: Option<Child>) {
    let backend: Arc<dyn Backend> = Arc::new(ProcessHandoff {
        control: Arc::clone(&inner.control),
    });
    let mut buf = [0u8; REQUEST_BUFFER_SIZE];

    loop {
        let msg = match inner.control.recv(&mut buf).await {
            Ok(msg) if msg.is_eof() => break,
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "control socket failed");
                break;
            }
        };
        if msg.truncated || msg.len != PORT_MESSAGE_LEN {
            debug!(len = msg.len, "ignoring malformed control message");
            continue;
        }
        let Some(port) = decode_port(&buf[..msg.len]) else {
            continue;
        };
        handle_request(&inner, &matcher, &backend, port).await;
    }

    inner.close_ports();
    if let Err(e) = inner.control.shutdown() {
        debug!(error = %e, "control socket shutdown failed");
    }

    let exit_status = match process {
        Some(mut child) => match child.wait().await {
            Ok(status) => {
                info!(status = %status, "worker exited");
                Some(status)
            }
            Err(e) => {
                warn!(error = %e, "failed to reap worker");
                None
            }
        },
        None => None,
    };

    {
        let mut state = lock(&inner.state);
        state.exited = true;
        state.exit_status = exit_status;
    }
    inner.done.send_replace(true);
}

/// Toggle `port`: close it if the worker has it open, otherwise register it.
async fn handle_request(
    inner: &CmdInner,
    matcher: &Arc<dyn MatchService>,
    backend: &Arc<dyn Backend>,
    port: u16,
) {
    let existing = {
        let mut state = lock(&inner.state);
        if state.closed {
            return;
        }
        state.open.remove(&port)
    };

    let reply = match existing {
        Some(open) => {
            open.close();
            info!(port, "worker closed port");
            encode_port(port).to_vec()
        }
        None => {
            match inner
                .registry
                .add_port(port, Arc::clone(matcher), Arc::clone(backend))
                .await
            {
                Ok(registered) => {
                    let mut state = lock(&inner.state);
                    if state.closed {
                        drop(state);
                        registered.close();
                        return;
                    }
                    state.open.insert(port, registered);
                    info!(port, "worker opened port");
                    encode_port(port).to_vec()
                }
                Err(e) => {
                    info!(port, error = %e, "worker port rejected");
                    let text = e.to_string();
                    let mut reply = Vec::with_capacity(PORT_MESSAGE_LEN + text.len());
                    reply.extend_from_slice(&encode_port(port));
                    reply.extend_from_slice(text.as_bytes());
                    reply
                }
            }
        }
    };

    if let Err(e) = inner.control.send(&reply, None).await {
        debug!(port, error = %e, "failed to answer worker");
    }
}
