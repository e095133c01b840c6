//! Namespace-scoped kernel connections
//!
//! nf_tables requests go to the network namespace of the thread that sends
//! them. A connection to a named namespace therefore owns a dedicated thread
//! that enters the namespace once and serves every request from there. The
//! caller's thread never changes namespace.

use crate::core::backend::{Op, RulesetBackend};
use crate::core::error::{Error, Result};
use crate::core::netlink::NetlinkConn;
use crate::core::rule::Rule;
use crate::core::topology::ChainName;
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Directory holding named namespace handles (`ip netns add`)
pub const NETNS_DIR: &str = match option_env!("ZONEWALL_NETNS_DIR") {
    Some(dir) => dir,
    None => "/var/run/netns",
};

pub fn netns_path(name: &str) -> PathBuf {
    Path::new(NETNS_DIR).join(name)
}

fn connection_error(name: Option<&str>, message: impl Into<String>) -> Error {
    Error::Connection {
        netns: name.unwrap_or("(current)").to_string(),
        message: message.into(),
    }
}

enum Request {
    Flush(Vec<Op>, mpsc::Sender<Result<()>>),
    Rules(ChainName, mpsc::Sender<Result<Vec<Rule>>>),
}

/// Thread living in another namespace, running requests on its behalf.
struct NamespaceThread {
    name: String,
    pending: Vec<Op>,
    requests: Option<mpsc::Sender<Request>>,
    handle: Option<JoinHandle<()>>,
}

impl NamespaceThread {
    /// Starts the thread and waits until it has entered `target`.
    fn spawn(name: &str, target: OwnedFd) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (requests, inbox) = mpsc::channel::<Request>();

        let handle = thread::Builder::new()
            .name(format!("netns-{name}"))
            .spawn(move || {
                if let Err(e) = setns(target.as_fd(), CloneFlags::CLONE_NEWNET) {
                    let _ = ready_tx.send(Err(format!("setns: {e}")));
                    return;
                }
                drop(target);
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                let mut conn = NetlinkConn::new();
                for request in inbox {
                    match request {
                        Request::Flush(ops, reply) => {
                            for op in ops {
                                conn.queue(op);
                            }
                            let _ = reply.send(conn.flush());
                        }
                        Request::Rules(chain, reply) => {
                            let _ = reply.send(conn.get_rules(chain));
                        }
                    }
                }
            })
            .map_err(|e| connection_error(Some(name), format!("spawning worker: {e}")))?;

        let entered = ready_rx
            .recv()
            .map_err(|_| "worker exited before entering the namespace".to_string())
            .and_then(|r| r);
        if let Err(message) = entered {
            let _ = handle.join();
            return Err(connection_error(Some(name), message));
        }
        debug!("Worker entered namespace {}", name);

        Ok(Self {
            name: name.to_string(),
            pending: Vec::new(),
            requests: Some(requests),
            handle: Some(handle),
        })
    }

    fn call<T>(&self, make: impl FnOnce(mpsc::Sender<Result<T>>) -> Request) -> Result<T> {
        let gone = || connection_error(Some(&self.name), "namespace worker is gone");
        let requests = self.requests.as_ref().ok_or_else(gone)?;
        let (reply, response) = mpsc::channel();
        requests.send(make(reply)).map_err(|_| gone())?;
        response.recv().map_err(|_| gone())?
    }
}

impl Drop for NamespaceThread {
    fn drop(&mut self) {
        // Closing the channel ends the request loop.
        self.requests.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Namespace worker for {} panicked", self.name);
        }
    }
}

enum Transport {
    Local(NetlinkConn),
    Namespace(NamespaceThread),
}

/// An open kernel connection, optionally pinned to a named namespace.
pub struct Connection {
    name: Option<String>,
    netns: Option<OwnedFd>,
    transport: Transport,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("netns", &self.name)
            .finish_non_exhaustive()
    }
}

/// Opens a connection in the current namespace (no argument) or in the
/// named one.
///
/// # Errors
///
/// - `InvalidArgumentCount` for more than one name
/// - `Connection` if the namespace cannot be opened or entered
pub fn open_connection(names: &[&str]) -> Result<Connection> {
    match names {
        [] => Ok(Connection {
            name: None,
            netns: None,
            transport: Transport::Local(NetlinkConn::new()),
        }),
        [name] => open_in(name),
        _ => Err(Error::InvalidArgumentCount(names.len())),
    }
}

fn open_in(name: &str) -> Result<Connection> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(connection_error(Some(name), "invalid namespace name"));
    }
    let path = netns_path(name);
    let target: OwnedFd = File::open(&path)
        .map_err(|e| connection_error(Some(name), format!("{}: {e}", path.display())))?
        .into();
    let for_worker = target
        .try_clone()
        .map_err(|e| connection_error(Some(name), format!("dup: {e}")))?;

    let worker = NamespaceThread::spawn(name, for_worker)?;
    Ok(Connection {
        name: Some(name.to_string()),
        netns: Some(target),
        transport: Transport::Namespace(worker),
    })
}

impl Connection {
    /// Namespace name, `None` for the caller's own namespace.
    pub fn netns(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Descriptor of the namespace the connection is bound to.
    pub fn netns_fd(&self) -> Option<BorrowedFd<'_>> {
        self.netns.as_ref().map(AsFd::as_fd)
    }

    /// Stops the namespace worker and releases the namespace descriptor,
    /// reporting a failed close. Dropping the connection releases them too.
    ///
    /// # Errors
    ///
    /// Returns the `close(2)` error of the namespace descriptor.
    pub fn close(mut self) -> Result<()> {
        if let Some(fd) = self.netns.take() {
            let raw = fd.into_raw_fd();
            // SAFETY: `raw` came out of an OwnedFd and is closed exactly once.
            if unsafe { libc::close(raw) } < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl RulesetBackend for Connection {
    fn queue(&mut self, op: Op) {
        match &mut self.transport {
            Transport::Local(conn) => conn.queue(op),
            Transport::Namespace(worker) => worker.pending.push(op),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Local(conn) => conn.flush(),
            Transport::Namespace(worker) => {
                let ops = std::mem::take(&mut worker.pending);
                if ops.is_empty() {
                    return Ok(());
                }
                worker.call(|reply| Request::Flush(ops, reply))
            }
        }
    }

    fn get_rules(&mut self, chain: ChainName) -> Result<Vec<Rule>> {
        match &mut self.transport {
            Transport::Local(conn) => conn.get_rules(chain),
            Transport::Namespace(worker) => worker.call(|reply| Request::Rules(chain, reply)),
        }
    }
}
