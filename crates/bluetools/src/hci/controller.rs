//! HCI controller
//!
//! Wraps one local adapter: the sockets opened on it, a virtual operating
//! state and the device registry every discovered peer is written to.
//!
//! Every operation follows the same contract:
//!
//! 1. If an earlier operation was interrupted, try to resolve it first.
//! 2. The controller must be [`ControllerState::Open`], otherwise the call
//!    fails with [`Error::BusyOrClosed`] and nothing is sent.
//! 3. The socket used is the one supplied by the caller, else the first
//!    socket owned by the controller, else a fresh socket that is closed
//!    again before returning.
//! 4. The state goes back to `Open` when the operation ends, whatever the
//!    outcome. The one exception is an LE scan that could not be disabled:
//!    the controller then stays `Scanning` with the interrupted flag set.
//!
//! Operations are serialized: each one holds the controller's operation lock
//! for its whole duration.

use crate::config::HciConfig;
use crate::error::{Error, Result};
use crate::gap::{AddressType, BdAddr, Device, DeviceRegistry, KnownDevicePolicy, UNKNOWN_NAME};
use crate::hci::codec::{self, EventFilter, FieldView};
use crate::hci::constants::*;
use crate::hci::packet::{HciCommand, HciEvent};
use crate::hci::socket::{AdapterInfo, HciChannel, HciSocketProvider, SystemSockets};
use crate::hci::states::{LeFeatures, LeStates};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of unrelated events tolerated while waiting for a command's answer
const MAX_EVENT_TRIES: usize = 10;

/// Virtual operating state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Closed,
    Open,
    Scanning,
    /// Reserved, no operation advertises yet
    Advertising,
    Reading,
    Writing,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Closed => "closed",
            ControllerState::Open => "open",
            ControllerState::Scanning => "scanning",
            ControllerState::Advertising => "advertising",
            ControllerState::Reading => "reading",
            ControllerState::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// Key of a socket owned by a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket #{}", self.0)
    }
}

/// One RSSI measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    pub address: BdAddr,
    pub rssi: i8,
}

/// Parameters of an LE scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeScanParameters {
    pub scan_type: u8,
    /// In units of 0.625 ms
    pub scan_interval: u16,
    /// In units of 0.625 ms
    pub scan_window: u16,
    pub own_address_type: AddressType,
    pub filter_policy: u8,
    pub filter_duplicates: bool,
}

impl Default for LeScanParameters {
    fn default() -> Self {
        Self {
            scan_type: LE_SCAN_ACTIVE,
            scan_interval: 0x0010,
            scan_window: 0x0010,
            own_address_type: AddressType::Public,
            filter_policy: LE_FILTER_ACCEPT_ALL,
            filter_duplicates: false,
        }
    }
}

#[derive(Debug)]
struct Status {
    state: ControllerState,
    interrupted: bool,
}

/// Socket used by one operation
enum Lease<'a, S> {
    /// Supplied by the caller, left untouched
    Borrowed(&'a S),
    /// Owned by the controller
    Owned(Arc<S>),
    /// Opened for this operation, closed when dropped
    Fresh(S),
}

impl<S> Lease<'_, S> {
    fn is_fresh(&self) -> bool {
        matches!(self, Lease::Fresh(_))
    }
}

impl<S> Deref for Lease<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self {
            Lease::Borrowed(socket) => socket,
            Lease::Owned(socket) => socket.as_ref(),
            Lease::Fresh(socket) => socket,
        }
    }
}

/// Installs an event filter and puts the previous one back on drop
struct FilterGuard<'a, S: HciChannel> {
    socket: &'a S,
    saved: Option<EventFilter>,
}

impl<'a, S: HciChannel> FilterGuard<'a, S> {
    /// `save` is false for sockets nobody else will read from again
    fn install(socket: &'a S, filter: &EventFilter, save: bool) -> Result<Self> {
        let saved = if save {
            match socket.filter() {
                Ok(previous) => Some(previous),
                Err(err) => {
                    warn!("Unable to save the socket filter: {}", err);
                    None
                }
            }
        } else {
            None
        };

        socket.set_filter(filter)?;
        Ok(Self { socket, saved })
    }
}

impl<S: HciChannel> Drop for FilterGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(err) = self.socket.set_filter(&saved) {
                warn!("Unable to restore the socket filter: {}", err);
            }
        }
    }
}

/// State machine over one local Bluetooth adapter
pub struct HciController<P: HciSocketProvider = SystemSockets> {
    provider: P,
    device: Device,
    adapter: Option<BdAddr>,
    dev_id: u16,
    config: HciConfig,
    registry: Arc<DeviceRegistry>,
    status: Mutex<Status>,
    operation: Mutex<()>,
    sockets: Mutex<Vec<(SocketId, Arc<P::Socket>)>>,
    next_socket_id: AtomicU32,
}

impl HciController<SystemSockets> {
    /// Opens the adapter with address `adapter`, or the first adapter that is up
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry receiving the adapter's record and every discovered device
    /// * `adapter` - Address of the local adapter, `None` for the default one
    /// * `custom_name` - Name given to the adapter's record (`"UNKNOWN"` when absent)
    pub fn open(
        registry: Arc<DeviceRegistry>,
        adapter: Option<&BdAddr>,
        custom_name: Option<&str>,
    ) -> Result<Self> {
        Self::open_with_config(registry, adapter, custom_name, HciConfig::default())
    }

    pub fn open_with_config(
        registry: Arc<DeviceRegistry>,
        adapter: Option<&BdAddr>,
        custom_name: Option<&str>,
        config: HciConfig,
    ) -> Result<Self> {
        Self::with_provider(SystemSockets, registry, adapter, custom_name, config)
    }
}

impl<P: HciSocketProvider> HciController<P> {
    /// Opens a controller whose sockets come from `provider`.
    ///
    /// A probe socket is opened to read the adapter identity, then closed;
    /// the new controller owns no socket. The adapter's own record is
    /// registered as a public address.
    pub fn with_provider(
        provider: P,
        registry: Arc<DeviceRegistry>,
        adapter: Option<&BdAddr>,
        custom_name: Option<&str>,
        config: HciConfig,
    ) -> Result<Self> {
        let identity = provider.open(adapter)?;
        let info = identity.adapter_info().unwrap_or_else(|err| {
            warn!("Unable to read adapter information: {}", err);
            AdapterInfo {
                dev_id: identity.dev_id(),
                address: adapter.copied().unwrap_or(BdAddr::ANY),
                name: UNKNOWN_NAME.to_string(),
            }
        });
        drop(identity);

        let device = Device::new(
            info.address,
            AddressType::Public,
            Some(&info.name),
            custom_name,
        );
        registry.register(device.clone());
        info!("Opened controller {} on hci{}", device, info.dev_id);

        Ok(Self {
            provider,
            adapter: (!info.address.is_any()).then_some(info.address),
            device,
            dev_id: info.dev_id,
            config,
            registry,
            status: Mutex::new(Status {
                state: ControllerState::Open,
                interrupted: false,
            }),
            operation: Mutex::new(()),
            sockets: Mutex::new(Vec::new()),
            next_socket_id: AtomicU32::new(0),
        })
    }

    /// Closes every owned socket and marks the controller closed.
    ///
    /// Closing an already closed controller only logs a warning.
    pub fn close(&self) -> Result<()> {
        let _op = self.operation.lock();
        let state = self.state();
        match state {
            ControllerState::Closed => {
                warn!("Controller {} is already closed", self.device.custom_name);
                Ok(())
            }
            ControllerState::Open => {
                let sockets = std::mem::take(&mut *self.sockets.lock());
                debug!("Closing {} owned socket(s)", sockets.len());
                drop(sockets);
                self.set_state(ControllerState::Closed);
                info!("Closed controller {}", self.device);
                Ok(())
            }
            busy => {
                error!("close: busy controller (state: {})", busy);
                Err(Error::BusyOrClosed(busy))
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        self.status.lock().state
    }

    pub fn is_interrupted(&self) -> bool {
        self.status.lock().interrupted
    }

    /// Record of the local adapter
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HciConfig {
        &self.config
    }

    /// Opens a socket owned by the controller
    pub fn open_socket(&self) -> Result<SocketId> {
        let state = self.state();
        if state == ControllerState::Closed {
            error!("open_socket: closed controller");
            return Err(Error::BusyOrClosed(state));
        }

        let socket = self.provider.open(self.adapter.as_ref())?;
        let id = SocketId(self.next_socket_id.fetch_add(1, Ordering::Relaxed));
        self.sockets.lock().push((id, Arc::new(socket)));
        debug!("Controller opened {}", id);
        Ok(id)
    }

    /// Owned socket registered under `id`, to be passed to operations
    pub fn socket(&self, id: SocketId) -> Result<Arc<P::Socket>> {
        self.sockets
            .lock()
            .iter()
            .find(|(key, _)| *key == id)
            .map(|(_, socket)| Arc::clone(socket))
            .ok_or_else(|| Error::InvalidReference(id.to_string()))
    }

    /// Closes the owned socket registered under `id`
    pub fn close_socket(&self, id: SocketId) -> Result<()> {
        let mut sockets = self.sockets.lock();
        match sockets.iter().position(|(key, _)| *key == id) {
            Some(index) => {
                sockets.remove(index);
                debug!("Controller closed {}", id);
                Ok(())
            }
            None => {
                warn!("close_socket: unknown {}", id);
                Err(Error::InvalidReference(id.to_string()))
            }
        }
    }

    pub fn owned_socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Brings an interrupted controller back to `Open`.
    ///
    /// Only an LE scan that could not be disabled leaves a controller
    /// interrupted; resolution retries disabling it.
    pub fn resolve_interruption(&self, socket: Option<&P::Socket>) -> Result<()> {
        let _op = self.operation.lock();
        if !self.is_interrupted() {
            warn!("resolve_interruption: nothing to resolve");
            return Ok(());
        }
        let lease = self.acquire(socket)?;
        self.resolve_locked(&*lease)
    }

    /// Reads the LE features of the local adapter
    pub fn le_read_local_supported_features(
        &self,
        socket: Option<&P::Socket>,
    ) -> Result<LeFeatures> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Reading);
            let command = HciCommand::LeReadLocalSupportedFeatures;
            let params = self.command(&**lease, &command, self.config.command_timeout())?;
            let bits = FieldView::new(&params).u64_le(0)?;
            Ok(LeFeatures::from_bits_retain(bits))
        })
    }

    /// Reads the LE states and state combinations the adapter supports
    pub fn le_read_supported_states(&self, socket: Option<&P::Socket>) -> Result<LeStates> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Reading);
            let command = HciCommand::LeReadSupportedStates;
            let params = self.command(&**lease, &command, self.config.command_timeout())?;
            let bits = FieldView::new(&params).u64_le(0)?;
            Ok(LeStates::from_bits_retain(bits))
        })
    }

    pub fn le_clear_white_list(&self, socket: Option<&P::Socket>) -> Result<()> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Writing);
            self.command(&**lease, &HciCommand::LeClearWhiteList, self.config.command_timeout())?;
            Ok(())
        })
    }

    /// Adds `device` to the white list and registers it if unknown.
    ///
    /// An unknown address type is sent as public.
    pub fn le_add_white_list(&self, socket: Option<&P::Socket>, device: &Device) -> Result<()> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Writing);
            let command = HciCommand::LeAddDeviceToWhiteList {
                address_type: device.address_type.wire_value(),
                address: device.address,
            };
            self.command(&**lease, &command, self.config.command_timeout())?;
            self.registry.register_if_absent(device.clone());
            Ok(())
        })
    }

    /// Removes `device` from the white list and registers it if unknown.
    pub fn le_remove_white_list(&self, socket: Option<&P::Socket>, device: &Device) -> Result<()> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Writing);
            let command = HciCommand::LeRemoveDeviceFromWhiteList {
                address_type: device.address_type.wire_value(),
                address: device.address,
            };
            self.command(&**lease, &command, self.config.command_timeout())?;
            self.registry.register_if_absent(device.clone());
            Ok(())
        })
    }

    pub fn le_white_list_size(&self, socket: Option<&P::Socket>) -> Result<u8> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Reading);
            let command = HciCommand::LeReadWhiteListSize;
            let params = self.command(&**lease, &command, self.config.command_timeout())?;
            FieldView::new(&params).u8(0)
        })
    }

    /// Asks `address` for its name; a failed request yields `"UNKNOWN"`
    pub fn resolve_remote_name(
        &self,
        socket: Option<&P::Socket>,
        address: &BdAddr,
    ) -> Result<String> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Scanning);
            Ok(self.remote_name_or_unknown(&**lease, address))
        })
    }

    /// Classic inquiry for up to `max_rsp` devices during `duration` × 1.28 s.
    ///
    /// Unknown devices get their name queried and are registered with an
    /// unknown address type. Known devices are not queried again; under
    /// [`KnownDevicePolicy::Overwrite`] they are reported and re-registered
    /// as address-only records, under `Preserve` their stored record is
    /// reported unchanged.
    pub fn scan_devices(
        &self,
        socket: Option<&P::Socket>,
        duration: u8,
        max_rsp: u8,
    ) -> Result<Vec<Device>> {
        self.run(socket, |lease| {
            self.set_state(ControllerState::Scanning);
            info!("Starting the scanning inquiry...");
            let addresses = self.inquiry_addresses(lease, duration, max_rsp)?;

            if addresses.is_empty() {
                info!("No device found");
                return Ok(Vec::new());
            }
            info!("Inquiry found {} device(s)", addresses.len());

            let devices: Vec<Device> = addresses
                .into_iter()
                .map(|address| self.scanned_device(&**lease, address))
                .collect();
            Ok(devices)
        })
    }

    /// Measures the RSSI of classic devices answering an inquiry.
    ///
    /// Results not matching `target` (when given) are skipped. Every sample
    /// is also written to `sink` as a decimal line.
    pub fn measure_rssi(
        &self,
        socket: Option<&P::Socket>,
        sink: Option<&mut dyn Write>,
        target: Option<&BdAddr>,
        duration: u8,
        max_rsp: u8,
    ) -> Result<Vec<RssiSample>> {
        let mut sink = sink;
        self.run(socket, |lease| {
            let filter = codec::build_event_filter(&[
                EVT_CMD_STATUS,
                EVT_INQUIRY_RESULT_WITH_RSSI,
                EVT_INQUIRY_COMPLETE,
            ]);
            let _filter = FilterGuard::install(&**lease, &filter, !lease.is_fresh())?;

            debug!("Configuring the inquiry mode...");
            self.set_state(ControllerState::Writing);
            lease.send_command(&HciCommand::WriteInquiryMode {
                mode: INQUIRY_MODE_RSSI,
            })?;
            match self.check_cmd_complete(&**lease) {
                Ok(()) => debug!("Inquiry mode set"),
                Err(err) => warn!("Inquiry mode not acknowledged: {}", err),
            }

            info!("Starting inquiry with RSSI...");
            self.set_state(ControllerState::Scanning);
            let inquiry = HciCommand::Inquiry {
                lap: self.config.inquiry_lap,
                length: duration,
                num_responses: max_rsp,
            };
            lease.send_command(&inquiry)?;

            let mut samples = Vec::new();
            let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
            loop {
                if !lease.wait_readable(Some(self.config.command_timeout()))? {
                    warn!("measure_rssi: timed out waiting for inquiry events");
                    break;
                }
                let len = lease.read_packet(&mut buf)?;
                if len == 0 {
                    warn!("measure_rssi: nothing to read on the socket");
                    break;
                }
                let packet = &buf[..len];

                let header = match codec::decode_event_header(packet) {
                    Ok(header) => header,
                    Err(err) => {
                        warn!("measure_rssi: dropping event: {}", err);
                        continue;
                    }
                };

                match header.event_code {
                    EVT_CMD_COMPLETE => warn!("measure_rssi: untreated Command Complete event"),
                    EVT_CMD_STATUS => {
                        let status = match codec::decode_command_status(packet) {
                            Ok(status) => status,
                            Err(err) => {
                                warn!("measure_rssi: dropping command status: {}", err);
                                continue;
                            }
                        };
                        if status.opcode == inquiry.opcode() && status.status != HCI_SUCCESS {
                            error!("Inquiry rejected with status 0x{:02X}", status.status);
                            return Err(Error::command_status(status.opcode, status.status));
                        }
                    }
                    EVT_INQUIRY_RESULT_WITH_RSSI => {
                        let results = match codec::decode_inquiry_rssi_results(packet) {
                            Ok(results) => results,
                            Err(err) => {
                                warn!("measure_rssi: dropping inquiry result: {}", err);
                                continue;
                            }
                        };
                        for result in results {
                            let device = self.discovered_device(&**lease, result.address);
                            if target.is_some_and(|t| *t != result.address) {
                                continue;
                            }
                            let rssi = result.rssi.unwrap_or(RSSI_UNAVAILABLE);
                            record_sample(&mut samples, &mut sink, &device, rssi);
                        }
                    }
                    EVT_INQUIRY_COMPLETE => {
                        info!("Inquiry complete");
                        break;
                    }
                    other => warn!("measure_rssi: unknown event 0x{:02X}", other),
                }
            }
            Ok(samples)
        })
    }

    /// Measures the RSSI of LE advertisers.
    ///
    /// Stops after `max_rsp` samples (`0` for no limit), or when no report
    /// arrives within the LE poll timeout. Scanning is disabled before
    /// returning, even after a failure. If disabling fails the controller
    /// is left interrupted and the samples gathered so far are returned.
    pub fn le_measure_rssi(
        &self,
        socket: Option<&P::Socket>,
        sink: Option<&mut dyn Write>,
        target: Option<&BdAddr>,
        max_rsp: usize,
        params: &LeScanParameters,
    ) -> Result<Vec<RssiSample>> {
        let mut sink = sink;
        self.run(socket, |lease| {
            let filter = codec::build_event_filter(&[EVT_LE_META_EVENT]);
            let _filter = FilterGuard::install(&**lease, &filter, !lease.is_fresh())?;

            debug!("Setting scan parameters...");
            self.set_state(ControllerState::Writing);
            let set_params = HciCommand::LeSetScanParameters {
                scan_type: params.scan_type,
                scan_interval: params.scan_interval,
                scan_window: params.scan_window,
                own_address_type: params.own_address_type.wire_value(),
                filter_policy: params.filter_policy,
            };
            self.command(&**lease, &set_params, self.config.le_command_timeout())?;

            debug!("Enabling scan...");
            self.set_state(ControllerState::Scanning);
            self.le_set_scan_enable(&**lease, true, params.filter_duplicates)?;

            let mut samples = Vec::new();
            let outcome =
                self.collect_le_reports(&**lease, &mut sink, target, max_rsp, &mut samples);
            info!("Scan complete");

            debug!("Disabling scan...");
            if let Err(err) = self.le_set_scan_enable(&**lease, false, false) {
                error!("Unable to disable the LE scan: {}", err);
                self.status.lock().interrupted = true;
                warn!("Controller {} left interrupted", self.device.custom_name);
            }

            outcome.map(|()| samples)
        })
    }

    // Operation plumbing

    /// Runs `op` under the operation lock, honoring the state contract.
    ///
    /// The socket acquired to resolve an interruption is the one the
    /// operation then runs on.
    fn run<'s, T>(
        &self,
        socket: Option<&'s P::Socket>,
        op: impl FnOnce(&Lease<'s, P::Socket>) -> Result<T>,
    ) -> Result<T> {
        let _op = self.operation.lock();

        let lease = if self.is_interrupted() {
            let lease = self.acquire(socket)?;
            if let Err(err) = self.resolve_locked(&*lease) {
                warn!("Interruption not resolved: {}", err);
            }
            self.ensure_open()?;
            lease
        } else {
            self.ensure_open()?;
            self.acquire(socket)?
        };

        let result = op(&lease);
        self.settle();
        result
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        if state != ControllerState::Open {
            error!("Busy or closed controller (state: {})", state);
            return Err(Error::BusyOrClosed(state));
        }
        Ok(())
    }

    fn acquire<'s>(&self, socket: Option<&'s P::Socket>) -> Result<Lease<'s, P::Socket>> {
        if let Some(socket) = socket {
            return Ok(Lease::Borrowed(socket));
        }
        if let Some((_, socket)) = self.sockets.lock().first() {
            return Ok(Lease::Owned(Arc::clone(socket)));
        }
        Ok(Lease::Fresh(self.provider.open(self.adapter.as_ref())?))
    }

    fn set_state(&self, state: ControllerState) {
        let mut status = self.status.lock();
        debug!(
            "Controller {} state changing from {} to {}",
            self.device.custom_name, status.state, state
        );
        status.state = state;
    }

    /// Back to `Open` unless the operation left the controller interrupted
    fn settle(&self) {
        let mut status = self.status.lock();
        if !status.interrupted && status.state != ControllerState::Open {
            debug!(
                "Controller {} state changing from {} to {}",
                self.device.custom_name,
                status.state,
                ControllerState::Open
            );
            status.state = ControllerState::Open;
        }
    }

    /// Undoes the operation that left the controller interrupted
    fn resolve_locked<S: HciChannel>(&self, socket: &S) -> Result<()> {
        let state = self.state();
        match state {
            ControllerState::Scanning => {
                info!("The controller was previously blocked in the scanning state");
                match self.le_set_scan_enable(socket, false, false) {
                    Ok(()) => {
                        let mut status = self.status.lock();
                        status.interrupted = false;
                        status.state = ControllerState::Open;
                        info!("Interruption resolved");
                        Ok(())
                    }
                    Err(err) => {
                        error!("Unable to resolve the interruption: {}", err);
                        Err(err)
                    }
                }
            }
            // No operation leaves this state interrupted
            other => {
                error!("Unable to resolve an interruption in state {}", other);
                Err(Error::BusyOrClosed(other))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn interrupt_in(&self, state: ControllerState) {
        let mut status = self.status.lock();
        status.state = state;
        status.interrupted = true;
    }

    // Command plumbing

    /// Sends `command` and waits for its answer, like BlueZ `hci_send_req`.
    ///
    /// Returns the raw packet of the Command Complete event, or of `event`
    /// when the command is answered by Command Status followed by another
    /// event. Up to ten unrelated events are skipped.
    fn send_request<S: HciChannel>(
        &self,
        socket: &S,
        command: &HciCommand,
        event: Option<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (ogf, ocf) = command.opcode_parts();
        let opcode = command.opcode();

        let mut filter = codec::build_event_filter(&[EVT_CMD_STATUS, EVT_LE_META_EVENT]);
        if let Some(event) = event {
            filter.set_event(event);
        }
        filter.set_opcode(opcode);
        let _filter = FilterGuard::install(socket, &filter, true)?;

        socket.send_command(command)?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        for _ in 0..MAX_EVENT_TRIES {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !socket.wait_readable(Some(remaining))? {
                debug!("Command 0x{:04X} timed out", opcode);
                return Err(Error::Timeout);
            }

            let len = socket.read_packet(&mut buf)?;
            if len == 0 {
                return Err(Error::command_io(
                    opcode,
                    &std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                ));
            }
            let packet = &buf[..len];

            let received = match HciEvent::from_packet(packet) {
                Ok(received) => received,
                Err(err) => {
                    debug!("Skipping undecodable packet: {}", err);
                    continue;
                }
            };

            if received.is_command_status(ogf, ocf) {
                let status = received.get_status().unwrap_or(HCI_SUCCESS);
                if status != HCI_SUCCESS {
                    return Err(Error::command_status(opcode, status));
                }
                if event == Some(EVT_CMD_STATUS) {
                    return Ok(packet.to_vec());
                }
                continue;
            }

            if received.is_command_complete(ogf, ocf) {
                return Ok(packet.to_vec());
            }

            if event.is_some_and(|e| e != EVT_CMD_COMPLETE && e == received.event_code) {
                return Ok(packet.to_vec());
            }

            trace!("Skipping unrelated event 0x{:02X}", received.event_code);
        }

        Err(Error::Timeout)
    }

    /// Sends `command`, checks its Command Complete status and returns the
    /// return parameters
    fn command<S: HciChannel>(
        &self,
        socket: &S,
        command: &HciCommand,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let packet = self.send_request(socket, command, None, timeout)?;
        let complete = codec::decode_command_complete(&packet)?;
        if complete.status != HCI_SUCCESS {
            error!(
                "Command 0x{:04X} failed with status 0x{:02X}",
                complete.opcode, complete.status
            );
            return Err(Error::command_status(complete.opcode, complete.status));
        }
        Ok(complete.return_parameters)
    }

    /// Waits for the Command Complete of a command sent without `send_request`
    fn check_cmd_complete<S: HciChannel>(&self, socket: &S) -> Result<()> {
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        for _ in 0..MAX_EVENT_TRIES {
            if !socket.wait_readable(Some(self.config.command_timeout()))? {
                return Err(Error::Timeout);
            }
            let len = socket.read_packet(&mut buf)?;
            let packet = &buf[..len];
            match codec::decode_event_header(packet) {
                Ok(header) if header.event_code == EVT_CMD_COMPLETE => {
                    let complete = codec::decode_command_complete(packet)?;
                    if complete.status != HCI_SUCCESS {
                        return Err(Error::command_status(complete.opcode, complete.status));
                    }
                    return Ok(());
                }
                _ => warn!("check_cmd_complete: an unknown event occurred"),
            }
        }
        Err(Error::Timeout)
    }

    fn le_set_scan_enable<S: HciChannel>(
        &self,
        socket: &S,
        enable: bool,
        filter_duplicates: bool,
    ) -> Result<()> {
        let command = HciCommand::LeSetScanEnable {
            enable,
            filter_duplicates,
        };
        self.command(socket, &command, self.config.le_command_timeout())?;
        Ok(())
    }

    fn read_remote_name<S: HciChannel>(&self, socket: &S, address: &BdAddr) -> Result<String> {
        let command = HciCommand::RemoteNameRequest {
            bd_addr: *address,
            page_scan_repetition_mode: PSCAN_REP_MODE_R1,
            clock_offset: 0,
        };
        let packet = self.send_request(
            socket,
            &command,
            Some(EVT_REMOTE_NAME_REQ_COMPLETE),
            self.config.command_timeout(),
        )?;
        let complete = codec::decode_remote_name_complete(&packet)?;
        if complete.status != HCI_SUCCESS {
            return Err(Error::command_status(command.opcode(), complete.status));
        }
        Ok(complete.name)
    }

    fn remote_name_or_unknown<S: HciChannel>(&self, socket: &S, address: &BdAddr) -> String {
        match self.read_remote_name(socket, address) {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => UNKNOWN_NAME.to_string(),
            Err(err) => {
                warn!("Unable to read the name of {}: {}", address, err);
                UNKNOWN_NAME.to_string()
            }
        }
    }

    // Discovery helpers

    /// Runs a classic inquiry and returns the responding addresses in order
    fn inquiry_addresses(
        &self,
        lease: &Lease<'_, P::Socket>,
        duration: u8,
        max_rsp: u8,
    ) -> Result<Vec<BdAddr>> {
        let filter = codec::build_event_filter(&[
            EVT_CMD_STATUS,
            EVT_INQUIRY_RESULT,
            EVT_INQUIRY_RESULT_WITH_RSSI,
            EVT_INQUIRY_COMPLETE,
        ]);
        let _filter = FilterGuard::install(&**lease, &filter, !lease.is_fresh())?;

        let inquiry = HciCommand::Inquiry {
            lap: self.config.inquiry_lap,
            length: duration,
            num_responses: max_rsp,
        };
        lease.send_command(&inquiry)?;

        let wait = Duration::from_millis(INQUIRY_UNIT_MS * duration as u64)
            + self.config.command_timeout();
        let mut addresses: Vec<BdAddr> = Vec::new();
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        loop {
            if !lease.wait_readable(Some(wait))? {
                warn!("scan_devices: inquiry did not complete in time");
                break;
            }
            let len = lease.read_packet(&mut buf)?;
            if len == 0 {
                warn!("scan_devices: nothing to read on the socket");
                break;
            }
            let packet = &buf[..len];

            let header = match codec::decode_event_header(packet) {
                Ok(header) => header,
                Err(err) => {
                    warn!("scan_devices: dropping event: {}", err);
                    continue;
                }
            };

            let results = match header.event_code {
                EVT_CMD_STATUS => {
                    let status = match codec::decode_command_status(packet) {
                        Ok(status) => status,
                        Err(err) => {
                            warn!("scan_devices: dropping command status: {}", err);
                            continue;
                        }
                    };
                    if status.opcode == inquiry.opcode() && status.status != HCI_SUCCESS {
                        error!("Inquiry rejected with status 0x{:02X}", status.status);
                        return Err(Error::command_status(status.opcode, status.status));
                    }
                    continue;
                }
                EVT_INQUIRY_RESULT => codec::decode_inquiry_results(packet),
                EVT_INQUIRY_RESULT_WITH_RSSI => codec::decode_inquiry_rssi_results(packet),
                EVT_INQUIRY_COMPLETE => {
                    match codec::decode_inquiry_complete(packet) {
                        Ok(HCI_SUCCESS) => {}
                        Ok(status) => warn!("Inquiry completed with status 0x{:02X}", status),
                        Err(err) => warn!("scan_devices: truncated inquiry complete: {}", err),
                    }
                    break;
                }
                other => {
                    trace!("scan_devices: ignoring event 0x{:02X}", other);
                    continue;
                }
            };

            match results {
                Ok(results) => {
                    for result in results {
                        if !addresses.contains(&result.address) {
                            addresses.push(result.address);
                        }
                    }
                }
                Err(err) => warn!("scan_devices: dropping inquiry result: {}", err),
            }
        }
        Ok(addresses)
    }

    /// Record reported by a classic scan for `address`
    fn scanned_device<S: HciChannel>(&self, socket: &S, address: BdAddr) -> Device {
        if self.registry.exists(&address) {
            match self.config.known_device_policy {
                KnownDevicePolicy::Overwrite => {
                    let device = Device::minimal(address);
                    self.registry.register(device.clone());
                    return device;
                }
                KnownDevicePolicy::Preserve => {
                    if let Ok(device) = self.registry.get(&address) {
                        return device;
                    }
                }
            }
        }
        self.discovered_device(socket, address)
    }

    /// Registered record for `address`, querying the name of unknown devices
    fn discovered_device<S: HciChannel>(&self, socket: &S, address: BdAddr) -> Device {
        if let Ok(device) = self.registry.get(&address) {
            return device;
        }
        let name = self.remote_name_or_unknown(socket, &address);
        let device = Device::new(address, AddressType::Unknown, Some(&name), None);
        if !self.registry.register_if_absent(device.clone()) {
            return self.registry.get(&address).unwrap_or(device);
        }
        device
    }

    /// Reads advertising reports until `max_rsp` samples, a poll timeout or
    /// a socket error
    fn collect_le_reports<S: HciChannel>(
        &self,
        socket: &S,
        sink: &mut Option<&mut dyn Write>,
        target: Option<&BdAddr>,
        max_rsp: usize,
        samples: &mut Vec<RssiSample>,
    ) -> Result<()> {
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        while max_rsp == 0 || samples.len() < max_rsp {
            if !socket.wait_readable(Some(self.config.le_poll_timeout()))? {
                debug!("le_measure_rssi: no report within {:?}", self.config.le_poll_timeout());
                break;
            }
            let len = socket.read_packet(&mut buf)?;
            if len == 0 {
                warn!("le_measure_rssi: nothing to read on the socket");
                break;
            }
            let packet = &buf[..len];

            let header = match codec::decode_event_header(packet) {
                Ok(header) => header,
                Err(err) => {
                    warn!("le_measure_rssi: dropping event: {}", err);
                    continue;
                }
            };

            match header.event_code {
                EVT_LE_META_EVENT => {}
                EVT_CMD_COMPLETE => {
                    trace!("le_measure_rssi: ignoring Command Complete");
                    continue;
                }
                other => {
                    warn!("le_measure_rssi: unknown event 0x{:02X}", other);
                    continue;
                }
            }

            let subevent = match codec::decode_le_subevent(packet) {
                Ok(subevent) => subevent,
                Err(err) => {
                    warn!("le_measure_rssi: dropping LE event: {}", err);
                    continue;
                }
            };
            if subevent != EVT_LE_ADVERTISING_REPORT {
                warn!("le_measure_rssi: unknown LE sub-event 0x{:02X}", subevent);
                continue;
            }

            let reports = match codec::decode_le_advertising_reports(packet) {
                Ok(reports) => reports,
                Err(err) => {
                    warn!("le_measure_rssi: dropping advertising report: {}", err);
                    continue;
                }
            };

            for report in reports {
                let candidate = Device::new(report.address, report.address_type, None, None);
                let device = if self.registry.register_if_absent(candidate.clone()) {
                    candidate
                } else {
                    self.registry.get(&report.address).unwrap_or(candidate)
                };

                if target.is_some_and(|t| *t != report.address) {
                    continue;
                }

                if report.rssi != RSSI_UNAVAILABLE && report.rssi >= LE_RSSI_ANOMALY_THRESHOLD {
                    warn!(
                        "le_measure_rssi: suspicious RSSI {} from {}",
                        report.rssi, report.address
                    );
                }
                record_sample(samples, sink, &device, report.rssi);

                if max_rsp != 0 && samples.len() >= max_rsp {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Logs, stores and forwards one RSSI value
fn record_sample(
    samples: &mut Vec<RssiSample>,
    sink: &mut Option<&mut dyn Write>,
    device: &Device,
    rssi: i8,
) {
    if rssi == RSSI_UNAVAILABLE {
        warn!("RSSI measure unavailable for {}", device.address);
    }
    info!("{} RSSI {}", device, rssi);

    if let Some(sink) = sink.as_mut() {
        if let Err(err) = writeln!(sink, "{}", rssi) {
            warn!("Unable to write RSSI value into the sink: {}", err);
        }
    }

    samples.push(RssiSample {
        address: device.address,
        rssi,
    });
}

impl<P: HciSocketProvider> fmt::Debug for HciController<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.lock();
        f.debug_struct("HciController")
            .field("device", &self.device)
            .field("dev_id", &self.dev_id)
            .field("state", &status.state)
            .field("interrupted", &status.interrupted)
            .field("sockets", &self.sockets.lock().len())
            .finish()
    }
}
