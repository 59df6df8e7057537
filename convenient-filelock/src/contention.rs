//! Asking the owner of a lock to let go of it.
//!
//! A process holding a lock it does not strictly need (a cache kept open
//! between operations) registers a contended action for the lock id. Another
//! process that fails to acquire the lock finds the owner's port in the
//! information region and sends an unlock request there. The owner runs the
//! contended action, which eventually releases the lock and triggers the
//! released signal; that sends a release confirmation back, waking the
//! requester's backoff early.

use crate::backoff::AwaitableFileLockReleasedSignal;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const PROTOCOL_VERSION: u8 = 1;
const UNLOCK_REQUEST: u8 = 1;
const RELEASE_CONFIRMATION: u8 = 2;
const MESSAGE_LENGTH: usize = 10;
const PING_DELAY: Duration = Duration::from_secs(1);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Handed to a contended action; trigger it once the lock was released.
pub trait FileLockReleasedSignal: Send + Sync {
    /// The lock was released.
    fn trigger(&self);
}

/// Run by the owner when another process asks for its lock.
pub type ContendedAction = Arc<dyn Fn(Arc<dyn FileLockReleasedSignal>) + Send + Sync>;

/// Cross-process side channel of the lock manager.
pub trait FileLockContentionHandler: Send + Sync {
    /// Port other processes can ping, starting to listen if needed.
    /// `None` if this handler cannot be pinged.
    ///
    /// # Errors
    ///
    /// Propagates socket failures.
    fn reserve_port(&self) -> Result<Option<u16>>;

    /// Run `action` when another process asks for lock `lock_id`.
    fn start(&self, lock_id: u64, action: ContendedAction);

    /// Lock `lock_id` was released; forget its action and confirm the
    /// release to everyone who asked for it.
    fn stop(&self, lock_id: u64);

    /// Ping the owner of lock `lock_id` listening on `port`, unless it was
    /// pinged less than a second ago. Returns whether a ping was sent.
    fn maybe_ping_owner(
        &self,
        port: u16,
        lock_id: u64,
        display_name: &str,
        since_last_ping: Duration,
        signal: &Arc<AwaitableFileLockReleasedSignal>,
    ) -> bool;
}

/// Handler for processes that never share their locks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpContentionHandler;

impl FileLockContentionHandler for NoOpContentionHandler {
    fn reserve_port(&self) -> Result<Option<u16>> {
        Ok(None)
    }

    fn start(&self, _lock_id: u64, _action: ContendedAction) {}

    fn stop(&self, _lock_id: u64) {}

    fn maybe_ping_owner(
        &self,
        _port: u16,
        _lock_id: u64,
        _display_name: &str,
        _since_last_ping: Duration,
        _signal: &Arc<AwaitableFileLockReleasedSignal>,
    ) -> bool {
        false
    }
}

#[derive(Default)]
struct HandlerState {
    socket: Option<Arc<UdpSocket>>,
    actions: HashMap<u64, ContendedAction>,
    // lock id -> processes waiting for a release confirmation
    requesters: HashMap<u64, Vec<SocketAddr>>,
    // lock id we asked for -> owner port we asked and how to wake us
    pinged: HashMap<u64, (u16, Arc<AwaitableFileLockReleasedSignal>)>,
}

struct HandlerInner {
    state: Mutex<HandlerState>,
    stopped: AtomicBool,
}

/// Contention handler talking UDP over the loopback interface.
///
/// Messages are `[version][type][lock id, big endian]`.
pub struct DefaultFileLockContentionHandler {
    inner: Arc<HandlerInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DefaultFileLockContentionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultFileLockContentionHandler {
    /// Handler that starts listening on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                state: Mutex::new(HandlerState::default()),
                stopped: AtomicBool::new(false),
            }),
            listener: Mutex::new(None),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        let mut state = self.inner.state.lock();
        if let Some(socket) = &state.socket {
            return Ok(Arc::clone(socket));
        }
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        let socket = Arc::new(socket);
        let inner = Arc::downgrade(&self.inner);
        let receiving = Arc::clone(&socket);
        let handle = thread::Builder::new()
            .name("file-lock-contention".to_string())
            .spawn(move || listen(&inner, &receiving))?;
        *self.listener.lock() = Some(handle);
        debug!(port = socket.local_addr()?.port(), "Listening for file lock requests");
        state.socket = Some(Arc::clone(&socket));
        Ok(socket)
    }
}

impl Drop for DefaultFileLockContentionHandler {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }
}

impl FileLockContentionHandler for DefaultFileLockContentionHandler {
    fn reserve_port(&self) -> Result<Option<u16>> {
        Ok(Some(self.socket()?.local_addr()?.port()))
    }

    fn start(&self, lock_id: u64, action: ContendedAction) {
        let _ = self.inner.state.lock().actions.insert(lock_id, action);
    }

    fn stop(&self, lock_id: u64) {
        let (socket, requesters) = {
            let mut state = self.inner.state.lock();
            let _ = state.actions.remove(&lock_id);
            (state.socket.clone(), state.requesters.remove(&lock_id))
        };
        if let (Some(socket), Some(requesters)) = (socket, requesters) {
            confirm_release(&socket, lock_id, &requesters);
        }
    }

    fn maybe_ping_owner(
        &self,
        port: u16,
        lock_id: u64,
        display_name: &str,
        since_last_ping: Duration,
        signal: &Arc<AwaitableFileLockReleasedSignal>,
    ) -> bool {
        let socket = {
            let mut state = self.inner.state.lock();
            if since_last_ping < PING_DELAY
                && state.pinged.get(&lock_id).is_some_and(|(p, _)| *p == port)
            {
                return false;
            }
            let Some(socket) = state.socket.clone() else {
                return false;
            };
            let _ = state.pinged.insert(lock_id, (port, Arc::clone(signal)));
            socket
        };
        match socket.send_to(&encode(UNLOCK_REQUEST, lock_id), (Ipv4Addr::LOCALHOST, port)) {
            Ok(_) => {
                debug!(display_name, port, lock_id, "Pinged owner of file lock");
                true
            }
            Err(err) => {
                debug!(display_name, port, error = %err, "Failed to ping owner of file lock");
                false
            }
        }
    }
}

struct ReleaseConfirmation {
    inner: Weak<HandlerInner>,
    lock_id: u64,
}

impl FileLockReleasedSignal for ReleaseConfirmation {
    fn trigger(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (socket, requesters) = {
            let mut state = inner.state.lock();
            (state.socket.clone(), state.requesters.remove(&self.lock_id))
        };
        if let (Some(socket), Some(requesters)) = (socket, requesters) {
            confirm_release(&socket, self.lock_id, &requesters);
        }
    }
}

fn encode(message_type: u8, lock_id: u64) -> [u8; MESSAGE_LENGTH] {
    let mut message = [0u8; MESSAGE_LENGTH];
    message[0] = PROTOCOL_VERSION;
    message[1] = message_type;
    message[2..].copy_from_slice(&lock_id.to_be_bytes());
    message
}

fn decode(message: &[u8]) -> Option<(u8, u64)> {
    if message.len() != MESSAGE_LENGTH || message[0] != PROTOCOL_VERSION {
        return None;
    }
    let mut lock_id = [0u8; 8];
    lock_id.copy_from_slice(&message[2..]);
    Some((message[1], u64::from_be_bytes(lock_id)))
}

fn confirm_release(socket: &UdpSocket, lock_id: u64, requesters: &[SocketAddr]) {
    for requester in requesters {
        if let Err(err) = socket.send_to(&encode(RELEASE_CONFIRMATION, lock_id), requester) {
            debug!(%requester, error = %err, "Failed to confirm lock release");
        }
    }
}

fn listen(inner: &Weak<HandlerInner>, socket: &UdpSocket) {
    let mut buffer = [0u8; 64];
    loop {
        let Some(handler) = inner.upgrade() else {
            return;
        };
        if handler.stopped.load(Ordering::SeqCst) {
            return;
        }
        let (length, sender) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                warn!(error = %err, "Stopped listening for file lock requests");
                return;
            }
        };
        match decode(&buffer[..length]) {
            Some((UNLOCK_REQUEST, lock_id)) => unlock_requested(&handler, socket, lock_id, sender),
            Some((RELEASE_CONFIRMATION, lock_id)) => {
                let signal = handler.state.lock().pinged.remove(&lock_id);
                if let Some((_, signal)) = signal {
                    debug!(lock_id, "Owner confirmed lock release");
                    signal.trigger();
                }
            }
            _ => debug!(%sender, "Ignoring unexpected file lock message"),
        }
    }
}

fn unlock_requested(handler: &Arc<HandlerInner>, socket: &UdpSocket, lock_id: u64, sender: SocketAddr) {
    let action = {
        let mut state = handler.state.lock();
        let Some(action) = state.actions.get(&lock_id).cloned() else {
            drop(state);
            // Not ours anymore; the requester may go ahead right away.
            confirm_release(socket, lock_id, &[sender]);
            return;
        };
        let requesters = state.requesters.entry(lock_id).or_default();
        let first = requesters.is_empty();
        if !requesters.contains(&sender) {
            requesters.push(sender);
        }
        first.then_some(action)
    };
    let Some(action) = action else {
        return;
    };
    debug!(lock_id, %sender, "Another process requested a file lock");
    let signal: Arc<dyn FileLockReleasedSignal> = Arc::new(ReleaseConfirmation {
        inner: Arc::downgrade(handler),
        lock_id,
    });
    // The action may close the lock, which calls back into the handler.
    let spawned = thread::Builder::new()
        .name("file-lock-release".to_string())
        .spawn(move || action(signal));
    if let Err(err) = spawned {
        warn!(error = %err, "Could not run contended action");
    }
}
