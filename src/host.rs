//! The HCI adapter: command scheduling, ACL flow control and event
//! dispatch over a [`Transport`].

use core::cell::{Cell, RefCell};
use core::future::poll_fn;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::AtomicWaker;
use rand_core::RngCore;

use crate::att;
use crate::config;
use crate::connection::{Connection, ConnectionEvent, ConnectionParams};
use crate::connection_manager::{ConnectionManager, Notification, Pdu};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::hci::{
    AclBoundary, AclHeader, AdvParams, ConnParams, Event, LeEvent, Opcode, ScanParams, HCI_ACL_HDR, HCI_COMMAND_HDR,
    HCI_MAX_EVENT_PARAMS, HCI_PACKET_ACL_DATA, HCI_PACKET_COMMAND, HCI_PACKET_EVENT,
};
use crate::scan::ScanReport;
use crate::types::l2cap::{L2CAP_CID_ATT, L2CAP_CID_LE_U_SIGNAL, L2CAP_CID_SMP};
use crate::types::{AddrKind, BdAddr, ConnHandle, DisconnectReason, Role, Status};
use crate::{Address, BleHostError, Error, Transport};

/// Default event mask: everything this stack dispatches.
const DEFAULT_EVENT_MASK: u64 = 0x3DBF_F807_FFFB_FFFF;
/// LE meta subevents 0x01..=0x0D.
const DEFAULT_LE_EVENT_MASK: u64 = 0x0000_0000_0000_1FFF;

/// Versions reported by Read Local Version Information.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_subversion: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct ControllerInfo {
    acl_mtu: u16,
    acl_buffers: u16,
}

/// Return parameters of a completed command, after the status byte.
pub(crate) struct CommandResponse {
    status: Status,
    params: heapless::Vec<u8, HCI_MAX_EVENT_PARAMS>,
}

impl CommandResponse {
    fn ok(self) -> Result<heapless::Vec<u8, HCI_MAX_EVENT_PARAMS>, Error> {
        self.status.to_result().map_err(Error::Hci)?;
        Ok(self.params)
    }
}

/// One command outstanding towards the controller; completions are
/// matched by opcode, everything else on the event stream is someone
/// else's and ignored.
struct CommandChannel<M: RawMutex> {
    lock: embassy_sync::mutex::Mutex<M, ()>,
    pending: Mutex<M, Cell<Option<Opcode>>>,
    response: Signal<M, Result<CommandResponse, Error>>,
}

impl<M: RawMutex> CommandChannel<M> {
    fn new() -> Self {
        Self {
            lock: embassy_sync::mutex::Mutex::new(()),
            pending: Mutex::new(Cell::new(None)),
            response: Signal::new(),
        }
    }

    fn complete(&self, opcode: Opcode, status: Status, params: &[u8]) {
        let matches = self.pending.lock(|p| {
            if p.get() == Some(opcode) {
                p.set(None);
                true
            } else {
                false
            }
        });
        if matches {
            let mut buf = heapless::Vec::new();
            if buf.extend_from_slice(params).is_err() {
                self.response.signal(Err(Error::InsufficientSpace));
                return;
            }
            self.response.signal(Ok(CommandResponse { status, params: buf }));
        } else {
            trace!("[hci] ignoring completion for opcode {:04x}", opcode.0);
        }
    }

    fn fail_pending(&self, error: Error) {
        let had = self.pending.lock(|p| p.take().is_some());
        if had {
            self.response.signal(Err(error));
        }
    }
}

struct Credits<M: RawMutex> {
    state: Mutex<M, Cell<(u16, u16)>>,
}

impl<M: RawMutex> Credits<M> {
    fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new((0, 0))),
        }
    }

    fn reset(&self, total: u16) {
        self.state.lock(|s| s.set((total, total)));
    }

    fn available(&self) -> u16 {
        self.state.lock(|s| s.get().0)
    }

    fn take(&self) {
        self.state.lock(|s| {
            let (free, total) = s.get();
            s.set((free.saturating_sub(1), total));
        });
    }

    fn release(&self, n: u16) {
        self.state.lock(|s| {
            let (free, total) = s.get();
            s.set(((free + n).min(total), total));
        });
    }
}

/// The host side of the HCI, driving a byte transport to a controller.
///
/// Create one, run its [`Runner`], then [`Adapter::init`] it.
pub struct Adapter<M: RawMutex, T: Transport> {
    pub(crate) transport: T,
    rng: Mutex<M, RefCell<Box<dyn RngCore + Send>>>,
    stopped: AtomicBool,
    stop: Signal<M, ()>,
    info: Mutex<M, Cell<ControllerInfo>>,
    own_address: Mutex<M, Cell<Option<Address>>>,
    local_version: Mutex<M, Cell<LocalVersion>>,
    credits: Credits<M>,
    command: CommandChannel<M>,
    pub(crate) connections: ConnectionManager<M>,
    /// Inbound ATT PDUs bound for the server: `(slot, generation, pdu)`.
    pub(crate) att_inbound: Channel<M, (usize, u32, Pdu), { config::ATT_RX_QUEUE_SIZE }>,
    scanner: Channel<M, ScanReport, { config::SCAN_QUEUE_SIZE }>,
    accept_slot: Signal<M, Result<(usize, u32), Error>>,
    connect_slot: Signal<M, Result<(usize, u32), Error>>,
    accept_pending: AtomicBool,
    connect_pending: AtomicBool,
    hardware_error: Signal<M, u8>,
    tx_waker: AtomicWaker,
}

impl<M: RawMutex, T: Transport> Adapter<M, T> {
    /// Create an adapter over `transport`.
    ///
    /// The RNG drives the fair selection between connections competing
    /// for controller buffers.
    pub fn new(transport: T, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            transport,
            rng: Mutex::new(RefCell::new(Box::new(rng))),
            stopped: AtomicBool::new(false),
            stop: Signal::new(),
            info: Mutex::new(Cell::new(ControllerInfo::default())),
            own_address: Mutex::new(Cell::new(None)),
            local_version: Mutex::new(Cell::new(LocalVersion::default())),
            credits: Credits::new(),
            command: CommandChannel::new(),
            connections: ConnectionManager::new(),
            att_inbound: Channel::new(),
            scanner: Channel::new(),
            accept_slot: Signal::new(),
            connect_slot: Signal::new(),
            accept_pending: AtomicBool::new(false),
            connect_pending: AtomicBool::new(false),
            hardware_error: Signal::new(),
            tx_waker: AtomicWaker::new(),
        }
    }

    /// The processing loops for this adapter.
    pub fn runner(&self) -> Runner<'_, M, T> {
        Runner { adapter: self }
    }

    /// Detach from the controller. All further operations are inert.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.stop.signal(());
        self.command.fail_pending(Error::InvalidState);
        self.tx_waker.wake();
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::Relaxed) {
            Err(Error::InvalidState)
        } else {
            Ok(())
        }
    }

    /// Largest ACL fragment the controller accepts.
    pub fn acl_mtu(&self) -> u16 {
        self.info.lock(|i| i.get().acl_mtu)
    }

    /// The controller's public address, known after [`Adapter::init`].
    pub fn own_address(&self) -> Option<Address> {
        self.own_address.lock(|a| a.get())
    }

    /// The controller's version information, known after [`Adapter::init`].
    pub fn local_version(&self) -> LocalVersion {
        self.local_version.lock(|v| v.get())
    }

    /// Wait for a hardware error event. Command scheduling is already
    /// cleared when this resolves; issue [`Adapter::reset`] to recover.
    pub async fn hardware_error(&self) -> u8 {
        self.hardware_error.wait().await
    }

    // --- Command plumbing ---

    /// Issue a raw command and wait for its Command Complete or Command
    /// Status event. At most one command is outstanding at a time.
    pub(crate) async fn command(
        &self,
        opcode: Opcode,
        params: &[u8],
        assoc: Option<ConnHandle>,
    ) -> Result<CommandResponse, BleHostError<T::Error>> {
        self.check_running()?;
        let _guard = self.command.lock.lock().await;
        // A command tied to a connection that died while we were queued
        // is not worth sending.
        if let Some(handle) = assoc {
            if self.connections.lookup(handle).is_none() {
                return Err(Error::Disconnected.into());
            }
        }
        self.check_running()?;

        let mut buf = [0u8; HCI_COMMAND_HDR + HCI_MAX_EVENT_PARAMS];
        let mut w = WriteCursor::new(&mut buf);
        w.write(HCI_PACKET_COMMAND).map_err(Error::Codec)?;
        w.write(opcode.0).map_err(Error::Codec)?;
        w.write(params.len() as u8).map_err(Error::Codec)?;
        w.append(params).map_err(Error::Codec)?;
        let len = w.len();

        self.command.response.reset();
        self.command.pending.lock(|p| p.set(Some(opcode)));
        self.transport.write(&buf[..len]).await.map_err(BleHostError::Transport)?;

        let response = self.command.response.wait().await?;
        Ok(response)
    }

    async fn command_ok(
        &self,
        opcode: Opcode,
        params: &[u8],
        assoc: Option<ConnHandle>,
    ) -> Result<heapless::Vec<u8, HCI_MAX_EVENT_PARAMS>, BleHostError<T::Error>> {
        let rsp = self.command(opcode, params, assoc).await?;
        Ok(rsp.ok()?)
    }

    /// Write a command without registering for its completion. Used from
    /// the event dispatcher, which cannot wait on events it delivers
    /// itself; the completion is ignored like any other unmatched event.
    async fn post_command(&self, opcode: Opcode, params: &[u8]) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; HCI_COMMAND_HDR + HCI_MAX_EVENT_PARAMS];
        let mut w = WriteCursor::new(&mut buf);
        w.write(HCI_PACKET_COMMAND).map_err(Error::Codec)?;
        w.write(opcode.0).map_err(Error::Codec)?;
        w.write(params.len() as u8).map_err(Error::Codec)?;
        w.append(params).map_err(Error::Codec)?;
        let len = w.len();
        self.transport.write(&buf[..len]).await.map_err(BleHostError::Transport)
    }

    // --- Typed commands ---

    /// HCI Reset. Also re-arms command scheduling after a hardware error.
    pub async fn reset(&self) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::RESET, &[], None).await?;
        Ok(())
    }

    pub async fn set_event_mask(&self, mask: u64) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::SET_EVENT_MASK, &mask.to_le_bytes(), None).await?;
        Ok(())
    }

    pub async fn le_set_event_mask(&self, mask: u64) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::LE_SET_EVENT_MASK, &mask.to_le_bytes(), None)
            .await?;
        Ok(())
    }

    pub async fn read_buffer_size(&self) -> Result<(u16, u16), BleHostError<T::Error>> {
        let params = self.command_ok(Opcode::READ_BUFFER_SIZE, &[], None).await?;
        let mut r = ReadCursor::new(&params);
        let acl_len: u16 = r.read().map_err(Error::Codec)?;
        let _sync_len: u8 = r.read().map_err(Error::Codec)?;
        let acl_num: u16 = r.read().map_err(Error::Codec)?;
        Ok((acl_len, acl_num))
    }

    pub async fn le_read_buffer_size(&self) -> Result<(u16, u8), BleHostError<T::Error>> {
        let params = self.command_ok(Opcode::LE_READ_BUFFER_SIZE, &[], None).await?;
        let mut r = ReadCursor::new(&params);
        let acl_len: u16 = r.read().map_err(Error::Codec)?;
        let acl_num: u8 = r.read().map_err(Error::Codec)?;
        Ok((acl_len, acl_num))
    }

    pub async fn read_bd_addr(&self) -> Result<BdAddr, BleHostError<T::Error>> {
        let params = self.command_ok(Opcode::READ_BD_ADDR, &[], None).await?;
        let mut r = ReadCursor::new(&params);
        Ok(r.read().map_err(Error::Codec)?)
    }

    pub async fn read_local_version(&self) -> Result<LocalVersion, BleHostError<T::Error>> {
        let params = self.command_ok(Opcode::READ_LOCAL_VERSION, &[], None).await?;
        let mut r = ReadCursor::new(&params);
        Ok(LocalVersion {
            hci_version: r.read().map_err(Error::Codec)?,
            hci_subversion: r.read().map_err(Error::Codec)?,
            lmp_version: r.read().map_err(Error::Codec)?,
            manufacturer: r.read().map_err(Error::Codec)?,
            lmp_subversion: r.read().map_err(Error::Codec)?,
        })
    }

    pub async fn le_set_random_address(&self, addr: BdAddr) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::LE_SET_RANDOM_ADDRESS, &addr.raw(), None).await?;
        Ok(())
    }

    pub async fn le_set_adv_params(&self, params: &AdvParams) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 15];
        crate::codec::Encode::encode(params, &mut buf).map_err(Error::Codec)?;
        self.command_ok(Opcode::LE_SET_ADV_PARAMS, &buf, None).await?;
        Ok(())
    }

    pub async fn le_set_adv_data(&self, data: &[u8]) -> Result<(), BleHostError<T::Error>> {
        if data.len() > 31 {
            return Err(Error::InvalidArgument.into());
        }
        let mut buf = [0u8; 32];
        buf[0] = data.len() as u8;
        buf[1..1 + data.len()].copy_from_slice(data);
        self.command_ok(Opcode::LE_SET_ADV_DATA, &buf, None).await?;
        Ok(())
    }

    pub async fn le_set_scan_response_data(&self, data: &[u8]) -> Result<(), BleHostError<T::Error>> {
        if data.len() > 31 {
            return Err(Error::InvalidArgument.into());
        }
        let mut buf = [0u8; 32];
        buf[0] = data.len() as u8;
        buf[1..1 + data.len()].copy_from_slice(data);
        self.command_ok(Opcode::LE_SET_SCAN_RESPONSE_DATA, &buf, None).await?;
        Ok(())
    }

    pub async fn le_set_adv_enable(&self, enable: bool) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::LE_SET_ADV_ENABLE, &[enable as u8], None).await?;
        Ok(())
    }

    pub async fn le_set_scan_params(&self, params: &ScanParams) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 7];
        crate::codec::Encode::encode(params, &mut buf).map_err(Error::Codec)?;
        self.command_ok(Opcode::LE_SET_SCAN_PARAMS, &buf, None).await?;
        Ok(())
    }

    pub async fn le_set_scan_enable(&self, enable: bool, filter_duplicates: bool) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(
            Opcode::LE_SET_SCAN_ENABLE,
            &[enable as u8, filter_duplicates as u8],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn le_create_connection_cancel(&self) -> Result<(), BleHostError<T::Error>> {
        self.command_ok(Opcode::LE_CREATE_CONN_CANCEL, &[], None).await?;
        Ok(())
    }

    /// Request disconnection. The connection stops competing for
    /// controller buffers immediately; teardown completes when the
    /// Disconnection Complete event arrives.
    pub async fn disconnect(&self, handle: ConnHandle, reason: DisconnectReason) -> Result<(), BleHostError<T::Error>> {
        self.connections.with_handle(handle, |s| {
            s.disconnecting = true;
            s.outbound.clear();
        });
        let mut buf = [0u8; 3];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.write(reason.0).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::DISCONNECT, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    pub(crate) async fn le_conn_update(
        &self,
        handle: ConnHandle,
        params: &ConnParams,
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 14];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.write_ref(params).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::LE_CONN_UPDATE, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    pub(crate) async fn le_read_remote_features(&self, handle: ConnHandle) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 2];
        crate::codec::Encode::encode(&handle, &mut buf).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::LE_READ_REMOTE_FEATURES, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    pub(crate) async fn read_remote_version(&self, handle: ConnHandle) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 2];
        crate::codec::Encode::encode(&handle, &mut buf).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::READ_REMOTE_VERSION, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    pub(crate) async fn le_start_encryption(
        &self,
        handle: ConnHandle,
        rand: u64,
        ediv: u16,
        ltk: &[u8; 16],
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 28];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.write(rand).map_err(Error::Codec)?;
        w.write(ediv).map_err(Error::Codec)?;
        w.append(ltk).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::LE_START_ENCRYPTION, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    /// Hand the controller the LTK it asked for with an LE Long Term Key
    /// Request event.
    pub async fn le_long_term_key_request_reply(
        &self,
        handle: ConnHandle,
        ltk: &[u8; 16],
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 18];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.append(ltk).map_err(Error::Codec)?;
        self.command_ok(Opcode::LE_LTK_REQUEST_REPLY, &buf, Some(handle)).await?;
        Ok(())
    }

    /// Refuse an LE Long Term Key Request.
    pub async fn le_long_term_key_request_negative_reply(
        &self,
        handle: ConnHandle,
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 2];
        crate::codec::Encode::encode(&handle, &mut buf).map_err(Error::Codec)?;
        self.command_ok(Opcode::LE_LTK_REQUEST_NEGATIVE_REPLY, &buf, Some(handle))
            .await?;
        Ok(())
    }

    pub(crate) async fn le_set_phy(
        &self,
        handle: ConnHandle,
        tx_phys: u8,
        rx_phys: u8,
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 7];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.write(0u8).map_err(Error::Codec)?;
        w.write(tx_phys).map_err(Error::Codec)?;
        w.write(rx_phys).map_err(Error::Codec)?;
        w.write(0u16).map_err(Error::Codec)?;
        let rsp = self.command(Opcode::LE_SET_PHY, &buf, Some(handle)).await?;
        rsp.status.to_result().map_err(|e| Error::Hci(e).into()).map(|_| ())
    }

    pub(crate) async fn le_read_phy(&self, handle: ConnHandle) -> Result<(u8, u8), BleHostError<T::Error>> {
        let mut buf = [0u8; 2];
        crate::codec::Encode::encode(&handle, &mut buf).map_err(Error::Codec)?;
        let params = self.command_ok(Opcode::LE_READ_PHY, &buf, Some(handle)).await?;
        let mut r = ReadCursor::new(&params);
        let _handle: ConnHandle = r.read().map_err(Error::Codec)?;
        let tx: u8 = r.read().map_err(Error::Codec)?;
        let rx: u8 = r.read().map_err(Error::Codec)?;
        Ok((tx, rx))
    }

    pub async fn le_set_data_length(
        &self,
        handle: ConnHandle,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<(), BleHostError<T::Error>> {
        let mut buf = [0u8; 6];
        let mut w = WriteCursor::new(&mut buf);
        w.write(handle).map_err(Error::Codec)?;
        w.write(tx_octets).map_err(Error::Codec)?;
        w.write(tx_time).map_err(Error::Codec)?;
        self.command_ok(Opcode::LE_SET_DATA_LENGTH, &buf, Some(handle)).await?;
        Ok(())
    }

    pub async fn read_rssi(&self, handle: ConnHandle) -> Result<i8, BleHostError<T::Error>> {
        let mut buf = [0u8; 2];
        crate::codec::Encode::encode(&handle, &mut buf).map_err(Error::Codec)?;
        let params = self.command_ok(Opcode::READ_RSSI, &buf, Some(handle)).await?;
        let mut r = ReadCursor::new(&params);
        let _handle: ConnHandle = r.read().map_err(Error::Codec)?;
        let rssi: u8 = r.read().map_err(Error::Codec)?;
        Ok(rssi as i8)
    }

    /// Bring up the controller: reset, set event masks, learn the ACL
    /// buffer geometry and our own address.
    pub async fn init(&self) -> Result<(), BleHostError<T::Error>> {
        self.reset().await?;
        self.set_event_mask(DEFAULT_EVENT_MASK).await?;
        self.le_set_event_mask(DEFAULT_LE_EVENT_MASK).await?;

        let (mut acl_len, mut acl_num) = {
            let (len, num) = self.le_read_buffer_size().await?;
            (len, num as u16)
        };
        if acl_len == 0 || acl_num == 0 {
            // Shared buffers with BR/EDR.
            let (len, num) = self.read_buffer_size().await?;
            acl_len = len;
            acl_num = num;
        }
        let acl_mtu = acl_len.min(config::ACL_MTU_CAP);
        self.info.lock(|i| i.set(ControllerInfo { acl_mtu, acl_buffers: acl_num }));
        self.credits.reset(acl_num);

        let addr = self.read_bd_addr().await?;
        self.own_address.lock(|a| a.set(Some(Address { kind: AddrKind::PUBLIC, addr })));
        let version = self.read_local_version().await?;
        self.local_version.lock(|v| v.set(version));
        info!("[hci] initialized, acl mtu {} x {} buffers", acl_mtu, acl_num);
        Ok(())
    }

    // --- Roles ---

    /// Start undirected advertising and wait for a central to connect.
    pub async fn advertise(
        &self,
        params: &AdvParams,
        adv_data: &[u8],
        scan_response: &[u8],
    ) -> Result<Connection<'_, M, T>, BleHostError<T::Error>> {
        self.le_set_adv_params(params).await?;
        self.le_set_adv_data(adv_data).await?;
        self.le_set_scan_response_data(scan_response).await?;
        self.accept_slot.reset();
        self.accept_pending.store(true, Ordering::Relaxed);
        self.le_set_adv_enable(true).await?;
        let result = self.accept_slot.wait().await;
        self.accept_pending.store(false, Ordering::Relaxed);
        let _ = self.le_set_adv_enable(false).await;
        let (index, generation) = result?;
        Ok(Connection::new(self, index, generation))
    }

    /// Initiate a connection to `peer` and wait for it to come up.
    pub async fn connect(
        &self,
        peer: Address,
        params: &ConnParams,
    ) -> Result<Connection<'_, M, T>, BleHostError<T::Error>> {
        let mut buf = [0u8; 25];
        let mut w = WriteCursor::new(&mut buf);
        w.write(0x0060u16).map_err(Error::Codec)?; // scan interval
        w.write(0x0060u16).map_err(Error::Codec)?; // scan window
        w.write(0u8).map_err(Error::Codec)?; // no filter accept list
        w.write(peer.kind.into_inner()).map_err(Error::Codec)?;
        w.write_ref(&peer.addr).map_err(Error::Codec)?;
        w.write(AddrKind::PUBLIC.into_inner()).map_err(Error::Codec)?;
        w.write_ref(params).map_err(Error::Codec)?;

        self.connect_slot.reset();
        self.connect_pending.store(true, Ordering::Relaxed);
        let rsp = self.command(Opcode::LE_CREATE_CONN, &buf, None).await?;
        if let Err(status) = rsp.status.to_result() {
            self.connect_pending.store(false, Ordering::Relaxed);
            return Err(Error::Hci(status).into());
        }
        let result = self.connect_slot.wait().await;
        self.connect_pending.store(false, Ordering::Relaxed);
        let (index, generation) = result?;
        Ok(Connection::new(self, index, generation))
    }

    /// Receive the next batch of advertising reports. Scanning itself is
    /// driven with [`Adapter::le_set_scan_params`] and
    /// [`Adapter::le_set_scan_enable`].
    pub async fn scan_report(&self) -> ScanReport {
        self.scanner.receive().await
    }

    // --- ACL data path ---

    /// Queue an L2CAP PDU and wait until its last fragment has been
    /// written to the transport. The returned [`Completion`] resolves
    /// when the controller reports all fragments complete.
    pub(crate) async fn send_l2cap(
        &self,
        index: usize,
        generation: u32,
        cid: u16,
        payload: &[u8],
    ) -> Result<Completion<'_, M, T>, Error> {
        let group = self.enqueue_l2cap(index, generation, cid, payload)?;
        poll_fn(|cx| self.connections.poll_sent(index, generation, group, cx)).await?;
        Ok(Completion {
            adapter: self,
            index,
            generation,
            group,
        })
    }

    /// Queue an L2CAP PDU without waiting for it to reach the transport.
    pub(crate) fn send_l2cap_nowait(
        &self,
        index: usize,
        generation: u32,
        cid: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.enqueue_l2cap(index, generation, cid, payload)?;
        Ok(())
    }

    fn enqueue_l2cap(&self, index: usize, generation: u32, cid: u16, payload: &[u8]) -> Result<u64, Error> {
        self.check_running()?;
        let mtu = self.acl_mtu() as usize;
        if mtu < HCI_ACL_HDR {
            return Err(Error::InvalidState);
        }

        let mut pdu = Vec::with_capacity(4 + payload.len());
        pdu.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        pdu.extend_from_slice(&cid.to_le_bytes());
        pdu.extend_from_slice(payload);

        let fragments = pdu
            .chunks(mtu)
            .enumerate()
            .map(|(i, chunk)| (i == 0, chunk.to_vec()))
            .collect();
        let group = self.connections.enqueue(index, generation, fragments)?;
        self.tx_waker.wake();
        Ok(group)
    }

    // --- Event dispatch ---

    async fn handle_event(&self, body: &[u8]) -> Result<(), BleHostError<T::Error>> {
        let event = match Event::decode(body) {
            Ok(event) => event,
            Err(e) => {
                warn!("[hci] dropping undecodable event: {:?}", e);
                return Ok(());
            }
        };
        match event {
            Event::CommandComplete { opcode, params, .. } => {
                let status = params.first().copied().map(Status).unwrap_or(Status::SUCCESS);
                let rest = if params.is_empty() { params } else { &params[1..] };
                self.command.complete(opcode, status, rest);
            }
            Event::CommandStatus { status, opcode, .. } => {
                self.command.complete(opcode, status, &[]);
            }
            Event::DisconnectionComplete { status, handle, reason } => {
                if status.is_ok() {
                    debug!("[hci] disconnected handle {} reason {:02x}", handle.raw(), reason);
                    if let Some(freed) = self.connections.disconnected(handle, reason) {
                        self.credits.release(freed);
                        self.tx_waker.wake();
                    }
                }
            }
            Event::EncryptionChange { status, handle, enabled } => {
                let active = status.is_ok() && enabled;
                if let Some(index) = self.connections.lookup(handle) {
                    self.connections.with_handle(handle, |s| s.security.encrypted = active);
                    let slot = self.connections.slot(index);
                    slot.encryption.signal(match status.to_result() {
                        Ok(()) => Ok(enabled),
                        Err(e) => Err(Error::Hci(e)),
                    });
                    let _ = slot.events.try_send(ConnectionEvent::EncryptionChanged { enabled: active });
                }
            }
            Event::EncryptionKeyRefreshComplete { status, handle } => {
                if let Some(index) = self.connections.lookup(handle) {
                    let slot = self.connections.slot(index);
                    slot.encryption.signal(match status.to_result() {
                        Ok(()) => Ok(true),
                        Err(e) => Err(Error::Hci(e)),
                    });
                }
            }
            Event::ReadRemoteVersionComplete {
                status,
                handle,
                version,
                manufacturer,
                subversion,
            } => {
                if let Some(index) = self.connections.lookup(handle) {
                    self.connections.slot(index).remote_version.signal(match status.to_result() {
                        Ok(()) => Ok(crate::connection::RemoteVersion {
                            version,
                            manufacturer,
                            subversion,
                        }),
                        Err(e) => Err(Error::Hci(e)),
                    });
                }
            }
            Event::HardwareError { code } => {
                error!("[hci] hardware error {:02x}", code);
                self.command.fail_pending(Error::HardwareError(code));
                self.hardware_error.signal(code);
            }
            Event::NumberOfCompletedPackets { mut it } => {
                let mut freed = 0;
                while let Some((handle, count)) = it.next() {
                    freed += self.connections.packets_completed(handle, count);
                }
                if freed > 0 {
                    self.credits.release(freed);
                    self.tx_waker.wake();
                }
            }
            Event::Le(le) => self.handle_le_event(le).await?,
            Event::Unknown { code, .. } => {
                trace!("[hci] ignoring event {:02x}", code);
            }
        }
        Ok(())
    }

    async fn handle_le_event(&self, event: LeEvent<'_>) -> Result<(), BleHostError<T::Error>> {
        match event {
            LeEvent::ConnectionComplete(c) => {
                let for_central = self.connect_pending.load(Ordering::Relaxed);
                if let Err(status) = c.status.to_result() {
                    let slot = if for_central { &self.connect_slot } else { &self.accept_slot };
                    slot.signal(Err(Error::Hci(status)));
                    return Ok(());
                }
                let role = Role::from_raw(c.role);
                let peer = Address {
                    kind: c.peer_addr_kind,
                    addr: c.peer_addr,
                };
                match self.connections.connect(c.handle, role, peer) {
                    Ok((index, generation)) => {
                        debug!("[hci] connected handle {} role {:?}", c.handle.raw(), role);
                        match role {
                            Role::Peripheral => self.accept_slot.signal(Ok((index, generation))),
                            Role::Central => self.connect_slot.signal(Ok((index, generation))),
                        }
                    }
                    Err(e) => {
                        warn!("[hci] no room for connection: {:?}", e);
                        let mut buf = [0u8; 3];
                        let mut w = WriteCursor::new(&mut buf);
                        let _ = w.write(c.handle);
                        let _ = w.write(DisconnectReason::REMOTE_LOW_RESOURCES.0);
                        let _ = self.post_command(Opcode::DISCONNECT, &buf).await;
                    }
                }
            }
            LeEvent::AdvertisingReport { num_reports, data } => {
                let _ = self.scanner.try_send(ScanReport::new(false, num_reports, data));
            }
            LeEvent::ExtendedAdvertisingReport { num_reports, data } => {
                let _ = self.scanner.try_send(ScanReport::new(true, num_reports, data));
            }
            LeEvent::ConnectionUpdateComplete {
                status,
                handle,
                interval,
                latency,
                supervision_timeout,
            } => {
                if let Some(index) = self.connections.lookup(handle) {
                    let slot = self.connections.slot(index);
                    let result = match status.to_result() {
                        Ok(()) => Ok(ConnectionParams {
                            interval,
                            latency,
                            supervision_timeout,
                        }),
                        Err(e) => Err(Error::Hci(e)),
                    };
                    if let Ok(params) = &result {
                        let _ = slot.events.try_send(ConnectionEvent::ConnParamsUpdated(*params));
                    }
                    slot.conn_update.signal(result);
                }
            }
            LeEvent::ReadRemoteFeaturesComplete { status, handle, features } => {
                if let Some(index) = self.connections.lookup(handle) {
                    self.connections.slot(index).remote_features.signal(match status.to_result() {
                        Ok(()) => Ok(features),
                        Err(e) => Err(Error::Hci(e)),
                    });
                }
            }
            LeEvent::LongTermKeyRequest { handle, rand, ediv } => {
                if let Some(index) = self.connections.lookup(handle) {
                    let slot = self.connections.slot(index);
                    if slot
                        .events
                        .try_send(ConnectionEvent::LongTermKeyRequest { rand, ediv })
                        .is_err()
                    {
                        warn!("[hci] event queue full, refusing ltk request");
                        let mut buf = [0u8; 2];
                        let _ = crate::codec::Encode::encode(&handle, &mut buf);
                        let _ = self.post_command(Opcode::LE_LTK_REQUEST_NEGATIVE_REPLY, &buf).await;
                    }
                }
            }
            LeEvent::PhyUpdateComplete {
                status,
                handle,
                tx_phy,
                rx_phy,
            } => {
                if let Some(index) = self.connections.lookup(handle) {
                    let slot = self.connections.slot(index);
                    if status.is_ok() {
                        let _ = slot.events.try_send(ConnectionEvent::PhyUpdated { tx_phy, rx_phy });
                    }
                    slot.phy.signal(match status.to_result() {
                        Ok(()) => Ok((tx_phy, rx_phy)),
                        Err(e) => Err(Error::Hci(e)),
                    });
                }
            }
            LeEvent::ReadLocalP256PublicKeyComplete { .. } | LeEvent::GenerateDhKeyComplete { .. } => {
                // Pairing is outside this stack; the SMP implementation
                // sees these through its own transport hooks.
                trace!("[hci] ignoring key generation event");
            }
            LeEvent::Unknown { subevent, .. } => {
                trace!("[hci] ignoring le subevent {:02x}", subevent);
            }
        }
        Ok(())
    }

    fn handle_acl(&self, body: &[u8]) {
        let (header, payload) = match AclHeader::decode_packet(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("[hci] dropping malformed acl packet: {:?}", e);
                return;
            }
        };
        let Some((index, cid, pdu)) = self
            .connections
            .reassemble(header.handle, header.boundary.is_first(), payload)
        else {
            return;
        };
        match cid {
            L2CAP_CID_ATT => self.route_att(index, pdu),
            L2CAP_CID_SMP => {
                let slot = self.connections.slot(index);
                if slot.events.try_send(ConnectionEvent::SmpData { data: pdu }).is_err() {
                    warn!("[l2cap] event queue full, dropping smp pdu");
                }
            }
            L2CAP_CID_LE_U_SIGNAL => {
                debug!("[l2cap] ignoring le signaling pdu");
            }
            other => {
                debug!("[l2cap] dropping pdu for unknown cid {}", other);
            }
        }
    }

    fn route_att(&self, index: usize, pdu: Pdu) {
        let Some(&opcode) = pdu.first() else {
            return;
        };
        let slot = self.connections.slot(index);
        let meta = slot.state.lock(|state| {
            state
                .borrow()
                .as_ref()
                .filter(|s| s.connected)
                .map(|s| (s.generation, s.att.server_busy))
        });
        let Some((generation, server_busy)) = meta else {
            return;
        };

        match opcode {
            att::ATT_HANDLE_VALUE_NTF => {
                if pdu.len() < 3 {
                    return;
                }
                let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
                let _ = slot.notifications.try_send(Notification {
                    handle,
                    indicated: false,
                    data: pdu[3..].to_vec(),
                });
            }
            att::ATT_HANDLE_VALUE_IND => {
                if pdu.len() < 3 {
                    return;
                }
                let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
                let _ = slot.notifications.try_send(Notification {
                    handle,
                    indicated: true,
                    data: pdu[3..].to_vec(),
                });
                // Confirm on behalf of the consumer.
                let _ = self.send_l2cap_nowait(index, generation, L2CAP_CID_ATT, &[att::ATT_HANDLE_VALUE_CFM]);
            }
            att::ATT_HANDLE_VALUE_CFM => {
                self.connections.slot(index).state.lock(|state| {
                    if let Some(s) = state.borrow_mut().as_mut() {
                        s.att.indication_pending = false;
                    }
                });
                slot.att_confirm.signal(());
            }
            att::ATT_ERROR_RSP
            | att::ATT_EXCHANGE_MTU_RSP
            | att::ATT_FIND_INFORMATION_RSP
            | att::ATT_FIND_BY_TYPE_VALUE_RSP
            | att::ATT_READ_BY_TYPE_RSP
            | att::ATT_READ_RSP
            | att::ATT_READ_BLOB_RSP
            | att::ATT_READ_MULTIPLE_RSP
            | att::ATT_READ_BY_GROUP_TYPE_RSP
            | att::ATT_WRITE_RSP
            | att::ATT_PREPARE_WRITE_RSP
            | att::ATT_EXECUTE_WRITE_RSP => {
                slot.att_response.signal(pdu);
            }
            att::ATT_WRITE_CMD | att::ATT_SIGNED_WRITE_CMD => {
                if self.att_inbound.try_send((index, generation, pdu)).is_err() {
                    warn!("[att] inbound queue full, dropping command");
                }
            }
            _ => {
                // Request opcodes. The server handles one at a time;
                // anything arriving while busy is dropped and the peer
                // times out.
                if server_busy {
                    debug!("[att] server busy, dropping request {:02x}", opcode);
                    return;
                }
                if self.att_inbound.try_send((index, generation, pdu)).is_err() {
                    warn!("[att] inbound queue full, dropping request");
                }
            }
        }
    }

    fn pick_random(&self, n: usize) -> usize {
        self.rng.lock(|rng| rng.borrow_mut().next_u32() as usize % n.max(1))
    }
}

/// Resolves when the controller has reported every fragment of a sent
/// PDU complete.
pub struct Completion<'d, M: RawMutex, T: Transport> {
    adapter: &'d Adapter<M, T>,
    index: usize,
    generation: u32,
    group: u64,
}

impl<'d, M: RawMutex, T: Transport> Completion<'d, M, T> {
    /// Wait for controller completion of the PDU.
    pub async fn completed(self) -> Result<(), Error> {
        poll_fn(|cx| {
            self.adapter
                .connections
                .poll_completed(self.index, self.generation, self.group, cx)
        })
        .await
    }
}

/// Drives the adapter's receive and transmit loops. Run it for as long
/// as the stack is in use.
pub struct Runner<'d, M: RawMutex, T: Transport> {
    adapter: &'d Adapter<M, T>,
}

impl<'d, M: RawMutex, T: Transport> Runner<'d, M, T> {
    /// Run until [`Adapter::stop`] or a transport failure.
    pub async fn run(&self) -> Result<(), BleHostError<T::Error>> {
        let adapter = self.adapter;
        let result = select(adapter.stop.wait(), select(self.run_rx(), self.run_tx())).await;
        match result {
            Either::First(()) => Ok(()),
            Either::Second(Either::First(r)) => r,
            Either::Second(Either::Second(r)) => r,
        }
    }

    async fn run_rx(&self) -> Result<(), BleHostError<T::Error>> {
        let adapter = self.adapter;
        let mut buf = vec![0u8; HCI_ACL_HDR + config::ACL_MTU_CAP as usize];
        loop {
            let packet = adapter.transport.read(&mut buf).await.map_err(BleHostError::Transport)?;
            let Some((&kind, body)) = packet.split_first() else {
                continue;
            };
            match kind {
                HCI_PACKET_EVENT => adapter.handle_event(body).await?,
                HCI_PACKET_ACL_DATA => adapter.handle_acl(body),
                other => {
                    warn!("[hci] unexpected packet type {:02x} from controller", other);
                }
            }
        }
    }

    async fn run_tx(&self) -> Result<(), BleHostError<T::Error>> {
        let adapter = self.adapter;
        loop {
            let next = poll_fn(|cx| {
                if adapter.stopped.load(Ordering::Relaxed) {
                    return Poll::Ready(None);
                }
                if adapter.credits.available() > 0 {
                    if let Some(out) = adapter.connections.next_outbound(|n| adapter.pick_random(n)) {
                        adapter.credits.take();
                        return Poll::Ready(Some(out));
                    }
                }
                adapter.tx_waker.register(cx.waker());
                // Re-check after registering to close the wakeup race.
                if adapter.credits.available() > 0 {
                    if let Some(out) = adapter.connections.next_outbound(|n| adapter.pick_random(n)) {
                        adapter.credits.take();
                        return Poll::Ready(Some(out));
                    }
                }
                if adapter.stopped.load(Ordering::Relaxed) {
                    return Poll::Ready(None);
                }
                Poll::Pending
            })
            .await;

            let Some((index, handle, fragment)) = next else {
                return Ok(());
            };
            let boundary = if fragment.first {
                AclBoundary::FirstNonFlushable
            } else {
                AclBoundary::Continuing
            };
            let header = AclHeader {
                handle,
                boundary,
                length: fragment.data.len() as u16,
            };
            let mut packet = vec![0u8; HCI_ACL_HDR + fragment.data.len()];
            let len = header
                .encode_packet(&fragment.data, &mut packet)
                .map_err(Error::Codec)?;
            adapter
                .transport
                .write(&packet[..len])
                .await
                .map_err(BleHostError::Transport)?;
            adapter
                .connections
                .fragment_sent(index, fragment.group, fragment.end_of_group);
        }
    }
}
