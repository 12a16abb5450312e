//! Storage and bookkeeping for ACL connections.
//!
//! Each connection occupies a fixed slot holding its protocol state plus
//! the signals used to resolve per-operation HCI procedures. Slots are
//! reference counted; a slot is recycled once the connection is down and
//! no [`Connection`](crate::connection::Connection) refers to it.

use core::cell::RefCell;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::config;
use crate::connection::{ConnectionEvent, ConnectionParams, RemoteVersion};
use crate::types::{ConnHandle, Role, SecurityLevel};
use crate::{Address, Error};

/// An inbound or outbound PDU payload.
pub(crate) type Pdu = Vec<u8>;

/// A notification or indication received by the client side of a
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The attribute handle the value belongs to.
    pub handle: u16,
    /// Whether this was an indication (already confirmed by the stack).
    pub indicated: bool,
    /// The attribute value.
    pub data: Vec<u8>,
}

/// One L2CAP fragment queued towards the controller.
pub(crate) struct OutFragment {
    pub group: u64,
    pub first: bool,
    pub end_of_group: bool,
    pub data: Vec<u8>,
}

/// A single prepared write queued by a Prepare Write request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedWrite {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

/// ATT bearer state of one connection.
pub(crate) struct AttSessionState {
    /// Effective MTU. Starts at 23, may grow exactly once.
    pub mtu: u16,
    pub mtu_changed: bool,
    /// A request or indication went unanswered for 30 s; the bearer is
    /// dead.
    pub timed_out: bool,
    /// The server has accepted a request and not yet responded.
    pub server_busy: bool,
    /// Our own Exchange MTU request is in flight; notifications are held
    /// back until it completes.
    pub mtu_exchange_pending: bool,
    pub held_notifications: VecDeque<Pdu>,
    pub prepare_queue: Vec<PreparedWrite>,
    /// True between sending an indication and receiving its confirmation.
    pub indication_pending: bool,
}

impl AttSessionState {
    fn new() -> Self {
        Self {
            mtu: config::ATT_DEFAULT_MTU,
            mtu_changed: false,
            timed_out: false,
            server_busy: false,
            mtu_exchange_pending: false,
            held_notifications: VecDeque::new(),
            prepare_queue: Vec::new(),
            indication_pending: false,
        }
    }

    /// Apply the result of an Exchange MTU procedure. The MTU never
    /// shrinks and changes at most once per connection.
    pub fn apply_mtu(&mut self, client: u16, server: u16) -> u16 {
        if !self.mtu_changed {
            let mtu = client.max(config::ATT_DEFAULT_MTU).min(server);
            if mtu > self.mtu {
                self.mtu = mtu;
                self.mtu_changed = true;
            }
        }
        self.mtu
    }
}

pub(crate) struct ConnectionState {
    pub generation: u32,
    pub handle: ConnHandle,
    pub role: Role,
    pub peer: Address,
    pub connected: bool,
    pub disconnecting: bool,
    pub refs: u8,
    pub security: SecurityLevel,
    pub bonded: bool,
    /// In-progress L2CAP recombination buffer.
    pub reassembly: Option<Vec<u8>>,
    pub outbound: VecDeque<OutFragment>,
    pub next_group: u64,
    pub sent_group: u64,
    pub completed_group: u64,
    /// Per fragment held by the controller: its group and whether it is
    /// the last fragment of that group.
    pub inflight: VecDeque<(u64, bool)>,
    pub outstanding: u16,
    pub att: AttSessionState,
    sent_wakers: Vec<Waker>,
    completed_wakers: Vec<Waker>,
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

/// A connection slot: state plus the rendezvous points used to complete
/// HCI procedures and route ATT traffic.
pub(crate) struct ConnectionSlot<M: RawMutex> {
    pub state: Mutex<M, RefCell<Option<ConnectionState>>>,
    pub att_response: Signal<M, Pdu>,
    pub att_confirm: Signal<M, ()>,
    /// Pulsed when an MTU exchange settles, releasing held notifications
    /// and queued indications.
    pub mtu_done: Signal<M, ()>,
    pub notifications: Channel<M, Notification, { config::NOTIFICATION_QUEUE_SIZE }>,
    pub events: Channel<M, ConnectionEvent, { config::CONNECTION_EVENT_QUEUE_SIZE }>,
    pub conn_update: Signal<M, Result<ConnectionParams, Error>>,
    pub remote_features: Signal<M, Result<u64, Error>>,
    pub remote_version: Signal<M, Result<RemoteVersion, Error>>,
    pub encryption: Signal<M, Result<bool, Error>>,
    pub phy: Signal<M, Result<(u8, u8), Error>>,
    /// Serializes ATT client requests: one outstanding per connection.
    pub request_lock: embassy_sync::mutex::Mutex<M, ()>,
    /// Serializes outbound indications: one unconfirmed at a time.
    pub indication_lock: embassy_sync::mutex::Mutex<M, ()>,
}

impl<M: RawMutex> ConnectionSlot<M> {
    fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(None)),
            att_response: Signal::new(),
            att_confirm: Signal::new(),
            mtu_done: Signal::new(),
            notifications: Channel::new(),
            events: Channel::new(),
            conn_update: Signal::new(),
            remote_features: Signal::new(),
            remote_version: Signal::new(),
            encryption: Signal::new(),
            phy: Signal::new(),
            request_lock: embassy_sync::mutex::Mutex::new(()),
            indication_lock: embassy_sync::mutex::Mutex::new(()),
        }
    }

    fn reset_rendezvous(&self) {
        self.att_response.reset();
        self.att_confirm.reset();
        self.mtu_done.reset();
        while self.notifications.try_receive().is_ok() {}
        while self.events.try_receive().is_ok() {}
        self.conn_update.reset();
        self.remote_features.reset();
        self.remote_version.reset();
        self.encryption.reset();
        self.phy.reset();
    }

    fn cancel_pending(&self) {
        self.mtu_done.signal(());
        self.conn_update.signal(Err(Error::Disconnected));
        self.remote_features.signal(Err(Error::Disconnected));
        self.remote_version.signal(Err(Error::Disconnected));
        self.encryption.signal(Err(Error::Disconnected));
        self.phy.signal(Err(Error::Disconnected));
    }
}

pub(crate) struct ConnectionManager<M: RawMutex> {
    slots: [ConnectionSlot<M>; config::MAX_CONNECTIONS],
    generation: Mutex<M, RefCell<u32>>,
}

impl<M: RawMutex> ConnectionManager<M> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ConnectionSlot::new()),
            generation: Mutex::new(RefCell::new(0)),
        }
    }

    pub fn slot(&self, index: usize) -> &ConnectionSlot<M> {
        &self.slots[index]
    }

    /// Record a new connection, returning its slot index and generation.
    pub fn connect(&self, handle: ConnHandle, role: Role, peer: Address) -> Result<(usize, u32), Error> {
        let generation = self.generation.lock(|g| {
            let mut g = g.borrow_mut();
            *g = g.wrapping_add(1);
            *g
        });
        for (index, slot) in self.slots.iter().enumerate() {
            let claimed = slot.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.is_some() {
                    return false;
                }
                *state = Some(ConnectionState {
                    generation,
                    handle,
                    role,
                    peer,
                    connected: true,
                    disconnecting: false,
                    refs: 0,
                    security: SecurityLevel::default(),
                    bonded: false,
                    reassembly: None,
                    outbound: VecDeque::new(),
                    next_group: 0,
                    sent_group: 0,
                    completed_group: 0,
                    inflight: VecDeque::new(),
                    outstanding: 0,
                    att: AttSessionState::new(),
                    sent_wakers: Vec::new(),
                    completed_wakers: Vec::new(),
                });
                true
            });
            if claimed {
                slot.reset_rendezvous();
                return Ok((index, generation));
            }
        }
        Err(Error::ConnectionLimitReached)
    }

    /// Locate the slot currently bound to `handle`.
    pub fn lookup(&self, handle: ConnHandle) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.state.lock(|state| {
                state
                    .borrow()
                    .as_ref()
                    .map(|s| s.connected && s.handle == handle)
                    .unwrap_or(false)
            })
        })
    }

    /// Run `f` against the live state of `(index, generation)`.
    pub fn with_state<R>(
        &self,
        index: usize,
        generation: u32,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Result<R, Error> {
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.as_mut() {
                Some(s) if s.generation == generation && s.connected => Ok(f(s)),
                _ => Err(Error::Disconnected),
            }
        })
    }

    /// Like [`Self::with_state`] but also usable after disconnection, as
    /// long as the slot has not been recycled.
    pub fn with_state_any<R>(
        &self,
        index: usize,
        generation: u32,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Result<R, Error> {
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.as_mut() {
                Some(s) if s.generation == generation => Ok(f(s)),
                _ => Err(Error::Disconnected),
            }
        })
    }

    pub fn with_handle<R>(&self, handle: ConnHandle, f: impl FnOnce(&mut ConnectionState) -> R) -> Option<R> {
        let mut f = Some(f);
        for slot in self.slots.iter() {
            let hit = slot.state.lock(|state| {
                let mut state = state.borrow_mut();
                match state.as_mut() {
                    Some(s) if s.connected && s.handle == handle => Some(f.take().unwrap()(s)),
                    _ => None,
                }
            });
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    pub fn inc_ref(&self, index: usize) {
        self.slots[index].state.lock(|state| {
            if let Some(s) = state.borrow_mut().as_mut() {
                s.refs += 1;
            }
        });
    }

    pub fn dec_ref(&self, index: usize) {
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(s) = state.as_mut() {
                s.refs = s.refs.saturating_sub(1);
                if s.refs == 0 && !s.connected {
                    *state = None;
                }
            }
        });
    }

    /// Handle a Disconnection Complete: tear down state and cancel every
    /// pending per-operation waiter. Returns the number of controller
    /// buffers the connection still held, to be handed back to the
    /// credit pool.
    pub fn disconnected(&self, handle: ConnHandle, reason: u8) -> Option<u16> {
        for slot in self.slots.iter() {
            let freed = slot.state.lock(|state| {
                let mut state = state.borrow_mut();
                match state.as_mut() {
                    Some(s) if s.connected && s.handle == handle => {
                        s.connected = false;
                        s.disconnecting = false;
                        s.outbound.clear();
                        s.inflight.clear();
                        let freed = s.outstanding;
                        s.outstanding = 0;
                        s.reassembly = None;
                        for w in s.sent_wakers.drain(..).chain(s.completed_wakers.drain(..)) {
                            w.wake();
                        }
                        if s.refs == 0 {
                            *state = None;
                        }
                        Some(freed)
                    }
                    _ => None,
                }
            });
            if let Some(freed) = freed {
                slot.cancel_pending();
                if slot.events.try_send(ConnectionEvent::Disconnected { reason }).is_err() {
                    warn!("[link] connection event queue full, dropping disconnect event");
                }
                return Some(freed);
            }
        }
        None
    }

    /// Queue the fragments of one L2CAP PDU, returning the group id used
    /// to track its sent/complete progress.
    pub fn enqueue(&self, index: usize, generation: u32, fragments: Vec<(bool, Vec<u8>)>) -> Result<u64, Error> {
        self.with_state(index, generation, |s| {
            if s.disconnecting {
                return Err(Error::Disconnected);
            }
            s.next_group += 1;
            let group = s.next_group;
            let count = fragments.len();
            for (i, (first, data)) in fragments.into_iter().enumerate() {
                s.outbound.push_back(OutFragment {
                    group,
                    first,
                    end_of_group: i + 1 == count,
                    data,
                });
            }
            Ok(group)
        })?
    }

    /// Select a connection with pending outbound data, uniformly at
    /// random, and pop one fragment from it.
    pub fn next_outbound(&self, pick: impl FnOnce(usize) -> usize) -> Option<(usize, ConnHandle, OutFragment)> {
        let mut ready: heapless::Vec<usize, { config::MAX_CONNECTIONS }> = heapless::Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let has_data = slot.state.lock(|state| {
                state
                    .borrow()
                    .as_ref()
                    .map(|s| s.connected && !s.disconnecting && !s.outbound.is_empty())
                    .unwrap_or(false)
            });
            if has_data {
                let _ = ready.push(index);
            }
        }
        if ready.is_empty() {
            return None;
        }
        let index = ready[pick(ready.len()) % ready.len()];
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            let s = state.as_mut()?;
            let frag = s.outbound.pop_front()?;
            s.outstanding += 1;
            s.inflight.push_back((frag.group, frag.end_of_group));
            Some((index, s.handle, frag))
        })
    }

    /// Mark a fragment as written to the transport.
    pub fn fragment_sent(&self, index: usize, group: u64, end_of_group: bool) {
        let wakers = self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.as_mut() {
                Some(s) => {
                    if end_of_group && group > s.sent_group {
                        s.sent_group = group;
                    }
                    core::mem::take(&mut s.sent_wakers)
                }
                None => Vec::new(),
            }
        });
        for w in wakers {
            w.wake();
        }
    }

    /// Poll whether the fragments of `group` have all been written to the
    /// transport.
    pub fn poll_sent(&self, index: usize, generation: u32, group: u64, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.as_mut() {
                Some(s) if s.generation == generation => {
                    if s.sent_group >= group {
                        Poll::Ready(Ok(()))
                    } else if !s.connected {
                        Poll::Ready(Err(Error::Disconnected))
                    } else {
                        register(&mut s.sent_wakers, cx.waker());
                        Poll::Pending
                    }
                }
                _ => Poll::Ready(Err(Error::Disconnected)),
            }
        })
    }

    /// Poll whether the controller has reported the fragments of `group`
    /// complete.
    pub fn poll_completed(
        &self,
        index: usize,
        generation: u32,
        group: u64,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Error>> {
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.as_mut() {
                Some(s) if s.generation == generation => {
                    if s.completed_group >= group {
                        Poll::Ready(Ok(()))
                    } else if !s.connected {
                        Poll::Ready(Err(Error::Disconnected))
                    } else {
                        register(&mut s.completed_wakers, cx.waker());
                        Poll::Pending
                    }
                }
                _ => Poll::Ready(Err(Error::Disconnected)),
            }
        })
    }

    /// Process one handle entry of a Number Of Completed Packets event.
    /// Returns the credits actually freed, clamped to what the
    /// connection really had outstanding.
    pub fn packets_completed(&self, handle: ConnHandle, count: u16) -> u16 {
        for slot in self.slots.iter() {
            let freed = slot.state.lock(|state| {
                let mut state = state.borrow_mut();
                match state.as_mut() {
                    Some(s) if s.handle == handle && s.outstanding > 0 => {
                        let freed = count.min(s.outstanding);
                        s.outstanding -= freed;
                        for _ in 0..freed {
                            if let Some((group, end)) = s.inflight.pop_front() {
                                if end && group > s.completed_group {
                                    s.completed_group = group;
                                }
                            }
                        }
                        Some((freed, core::mem::take(&mut s.completed_wakers)))
                    }
                    _ => None,
                }
            });
            if let Some((freed, wakers)) = freed {
                for w in wakers {
                    w.wake();
                }
                return freed;
            }
        }
        0
    }

    /// Feed one inbound ACL fragment into the connection's recombination
    /// buffer. Returns a complete L2CAP PDU as `(slot, cid, payload)`
    /// when one is assembled.
    pub fn reassemble(&self, handle: ConnHandle, first: bool, payload: &[u8]) -> Option<(usize, u16, Vec<u8>)> {
        let index = self.lookup(handle)?;
        self.slots[index].state.lock(|state| {
            let mut state = state.borrow_mut();
            let s = state.as_mut()?;
            if first {
                if s.reassembly.is_some() {
                    warn!("[link] restarting l2cap recombination, dropping partial pdu");
                }
                s.reassembly = Some(payload.to_vec());
            } else {
                match s.reassembly.as_mut() {
                    Some(buf) => buf.extend_from_slice(payload),
                    // Continuation without a start fragment.
                    None => return None,
                }
            }

            let buf = s.reassembly.as_ref()?;
            if buf.len() < 4 {
                return None;
            }
            let l2cap_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
            match (4 + l2cap_len).cmp(&buf.len()) {
                core::cmp::Ordering::Equal => {
                    let buf = s.reassembly.take()?;
                    let cid = u16::from_le_bytes([buf[2], buf[3]]);
                    Some((index, cid, buf[4..].to_vec()))
                }
                core::cmp::Ordering::Less => {
                    // Longer than its own header claims; poison pill.
                    s.reassembly = None;
                    None
                }
                core::cmp::Ordering::Greater => None,
            }
        })
    }
}
