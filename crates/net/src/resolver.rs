use std::net::ToSocketAddrs;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::JoinHandle;

use log::debug;

use crate::address::NetAddress;
use crate::error::NetError;

/// An in-flight hostname lookup. `ToSocketAddrs` blocks, so the lookup runs
/// on its own thread and the caller polls the handle from its tick loop.
/// Dropping the handle abandons the result; the thread finishes on its own.
pub struct AddressResolver {
    receiver: Receiver<Result<NetAddress, NetError>>,
    thread: Option<JoinHandle<()>>,
    finished: bool,
}

impl AddressResolver {
    pub(crate) fn spawn(host: String) -> Self {
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("net-resolver".into())
            .spawn(move || {
                let result = resolve(&host);
                // The caller may have dropped the handle already.
                let _ = sender.send(result);
            })
            .ok();
        if thread.is_none() {
            // The disconnected channel reports the failure on first poll.
            debug!("failed to spawn resolver thread");
        }
        Self {
            receiver,
            thread,
            finished: false,
        }
    }

    /// Non-blocking check for the result. Returns `Some` exactly once when
    /// the lookup completes; `None` while it is still running or after the
    /// result was already taken.
    pub fn poll(&mut self) -> Option<Result<NetAddress, NetError>> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.finished = true;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                Some(Err(NetError::ResolveFailed))
            }
        }
    }

    /// Blocks until the lookup completes and returns its result.
    pub fn wait(mut self) -> Result<NetAddress, NetError> {
        self.finished = true;
        let result = self
            .receiver
            .recv()
            .unwrap_or(Err(NetError::ResolveFailed));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }
}

impl Drop for AddressResolver {
    fn drop(&mut self) {
        // Detach: blocking a caller's drop on a slow DNS server would be
        // worse than letting the thread run to completion unobserved.
        self.thread.take();
    }
}

fn resolve(host: &str) -> Result<NetAddress, NetError> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| NetError::ResolveFailed)?;
    addrs
        .into_iter()
        .find_map(NetAddress::from_socket)
        .ok_or(NetError::ResolveNotFound)
}
