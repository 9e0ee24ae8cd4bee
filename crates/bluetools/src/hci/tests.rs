//! Unit tests for HCI packet handling, event decoding and the controller

use super::codec::*;
use super::constants::*;
use super::controller::*;
use super::packet::*;
use super::socket::*;
use super::states::{LeFeatures, LeStates};
use crate::config::HciConfig;
use crate::error::Error;
use crate::gap::{AddressType, BdAddr, Device, DeviceRegistry, KnownDevicePolicy, BT_NAME_LENGTH};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn event(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![HCI_EVENT_PKT, code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

fn addr(tag: u8) -> BdAddr {
    BdAddr::new([tag, 0x22, 0x33, 0x44, 0x55, 0x66])
}

// Column-major encoders, used to build fixtures and check the decoders

fn encode_inquiry_results(code: u8, results: &[InquiryResult]) -> Vec<u8> {
    let mut params = vec![results.len() as u8];
    for r in results {
        params.extend_from_slice(r.address.as_slice());
    }
    for r in results {
        params.push(r.page_scan_repetition_mode);
    }
    let reserved = if code == EVT_INQUIRY_RESULT { 2 } else { 1 };
    for _ in 0..reserved * results.len() {
        params.push(0);
    }
    for r in results {
        params.extend_from_slice(&r.class_of_device.to_le_bytes()[..3]);
    }
    for r in results {
        params.extend_from_slice(&r.clock_offset.to_le_bytes());
    }
    if code == EVT_INQUIRY_RESULT_WITH_RSSI {
        for r in results {
            params.push(r.rssi.unwrap_or(RSSI_UNAVAILABLE) as u8);
        }
    }
    event(code, &params)
}

fn encode_le_reports(reports: &[LeAdvertisingReport]) -> Vec<u8> {
    let mut params = vec![EVT_LE_ADVERTISING_REPORT, reports.len() as u8];
    for r in reports {
        params.push(r.event_type);
    }
    for r in reports {
        params.push(u8::from(r.address_type));
    }
    for r in reports {
        params.extend_from_slice(r.address.as_slice());
    }
    for r in reports {
        params.push(r.data.len() as u8);
    }
    for r in reports {
        params.extend_from_slice(&r.data);
    }
    for r in reports {
        params.push(r.rssi as u8);
    }
    event(EVT_LE_META_EVENT, &params)
}

fn le_report(tag: u8, address_type: AddressType, data: &[u8], rssi: i8) -> LeAdvertisingReport {
    LeAdvertisingReport {
        event_type: 0x00,
        address_type,
        address: addr(tag),
        raw_payload_len: data.len() as u8,
        data: data.to_vec(),
        rssi,
    }
}

#[test]
fn test_hci_command_serialization() {
    // Inquiry with the general access code
    let command = HciCommand::Inquiry {
        lap: GIAC_LAP,
        length: 8,
        num_responses: 255,
    };
    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0401);
    assert_eq!(packet[3], 5);
    assert_eq!(&packet[4..], &[0x33, 0x8B, 0x9E, 8, 255]);

    // Write Inquiry Mode
    let packet = HciCommand::WriteInquiryMode {
        mode: INQUIRY_MODE_RSSI,
    }
    .to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C45);
    assert_eq!(&packet[3..], &[1, 0x01]);

    // LE Add Device To White List
    let command = HciCommand::LeAddDeviceToWhiteList {
        address_type: 0x01,
        address: addr(0xAA),
    };
    let packet = command.to_packet();
    assert_eq!(command.opcode(), 0x2011);
    assert_eq!(packet[3], 7);
    assert_eq!(packet[4], 0x01);
    assert_eq!(&packet[5..11], addr(0xAA).as_slice());

    // Remote Name Request
    let packet = HciCommand::RemoteNameRequest {
        bd_addr: addr(0x01),
        page_scan_repetition_mode: PSCAN_REP_MODE_R1,
        clock_offset: 0x1234,
    }
    .to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0419);
    assert_eq!(packet[3], 10);
    assert_eq!(&packet[10..], &[0x01, 0x00, 0x34, 0x12]);

    // Raw command
    let command = HciCommand::new(OGF_LE, OCF_LE_READ_SUPPORTED_STATES, vec![0x01, 0x02]);
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x201C);
    assert_eq!(&packet[3..], &[2, 0x01, 0x02]);

    assert_eq!(opcode_split(0x201C), (OGF_LE, OCF_LE_READ_SUPPORTED_STATES));
}

#[test]
fn test_hci_event_parsing() {
    // Command Complete for Write Inquiry Mode
    let data = [
        EVT_CMD_COMPLETE, // Event code
        4,                // Parameter length
        1,                // Num_HCI_Command_Packets
        0x45,             // Command_Opcode (low byte)
        0x0C,             // Command_Opcode (high byte)
        0x00,             // Status
    ];

    let event = HciEvent::parse(&data).unwrap();

    assert_eq!(event.event_code, EVT_CMD_COMPLETE);
    assert_eq!(event.parameter_total_length, 4);
    assert_eq!(event.parameters, vec![1, 0x45, 0x0C, 0x00]);
    assert!(event.is_command_complete(OGF_HOST_CTL, OCF_WRITE_INQUIRY_MODE));
    assert!(!event.is_command_complete(OGF_LINK_CTL, OCF_INQUIRY));
    assert_eq!(event.get_status(), Some(0x00));
    assert!(event.return_parameters().is_empty());

    // Command Status for Inquiry
    let data = [EVT_CMD_STATUS, 4, 0x0C, 1, 0x01, 0x04];
    let event = HciEvent::parse(&data).unwrap();
    assert!(event.is_command_status(OGF_LINK_CTL, OCF_INQUIRY));
    assert_eq!(event.get_status(), Some(0x0C));

    // Packet with indicator
    let packet = [HCI_EVENT_PKT, EVT_INQUIRY_COMPLETE, 1, 0x00];
    let event = HciEvent::from_packet(&packet).unwrap();
    assert_eq!(event.event_code, EVT_INQUIRY_COMPLETE);
    assert_eq!(event.get_status(), None);

    // Invalid data tests
    assert!(matches!(HciEvent::parse(&[]), Err(Error::MalformedPacket(_))));
    assert!(matches!(
        HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]),
        Err(Error::MalformedPacket(_))
    ));
    assert!(HciEvent::from_packet(&[HCI_ACL_PKT, 0, 0]).is_err());
}

#[test]
fn test_event_filter_bits() {
    let filter = build_event_filter(&[
        EVT_INQUIRY_RESULT_WITH_RSSI,
        EVT_INQUIRY_COMPLETE,
        EVT_LE_META_EVENT,
    ]);

    assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
    assert!(filter.test_ptype(HCI_EVENT_PKT));
    assert!(!filter.test_ptype(HCI_ACL_PKT));

    // Command Complete is always let through
    assert!(filter.test_event(EVT_CMD_COMPLETE));
    assert!(filter.test_event(EVT_INQUIRY_RESULT_WITH_RSSI));
    assert!(filter.test_event(EVT_INQUIRY_COMPLETE));
    assert!(filter.test_event(EVT_LE_META_EVENT));
    assert!(!filter.test_event(EVT_CMD_STATUS));

    // Codes from 0x20 up land in the second word
    assert_eq!(filter.event_mask[0], (1 << EVT_CMD_COMPLETE) | (1 << EVT_INQUIRY_COMPLETE));
    assert_eq!(
        filter.event_mask[1],
        (1 << (EVT_INQUIRY_RESULT_WITH_RSSI - 32)) | (1 << (EVT_LE_META_EVENT - 32))
    );
    assert_eq!(filter.event_mask, [0x0000_4002, 0x4000_0004]);

    let mut filter = filter;
    filter.clear_event(EVT_INQUIRY_COMPLETE);
    assert!(!filter.test_event(EVT_INQUIRY_COMPLETE));
    filter.clear();
    assert_eq!(filter, EventFilter::new());
}

#[test]
fn test_event_header_and_command_events() {
    let packet = event(EVT_CMD_COMPLETE, &[1, 0x0F, 0x20, 0x00, 0x08]);
    let header = decode_event_header(&packet).unwrap();
    assert_eq!(header.event_code, EVT_CMD_COMPLETE);
    assert_eq!(header.param_len, 5);

    let complete = decode_command_complete(&packet).unwrap();
    assert_eq!(complete.opcode, 0x200F);
    assert_eq!(complete.status, 0);
    assert_eq!(complete.return_parameters, vec![0x08]);

    let packet = event(EVT_CMD_STATUS, &[0x00, 1, 0x19, 0x04]);
    let status = decode_command_status(&packet).unwrap();
    assert_eq!(status.opcode, 0x0419);
    assert_eq!(status.status, 0);

    // Wrong event for the decoder
    assert!(matches!(decode_command_complete(&packet), Err(Error::MalformedPacket(_))));

    // Truncated parameters and bad indicator
    assert!(decode_event_header(&[HCI_EVENT_PKT, EVT_CMD_COMPLETE, 4, 1, 2]).is_err());
    assert!(decode_event_header(&[HCI_EVENT_PKT, EVT_CMD_COMPLETE]).is_err());
    assert!(strip_packet_indicator(&[HCI_COMMAND_PKT, 0x00]).is_err());
    assert!(strip_packet_indicator(&[]).is_err());

    assert_eq!(decode_inquiry_complete(&event(EVT_INQUIRY_COMPLETE, &[0x00])).unwrap(), 0);
}

#[test]
fn test_remote_name_complete() {
    let mut params = vec![0x00];
    params.extend_from_slice(addr(0x01).as_slice());
    let mut name = [0u8; BT_NAME_LENGTH];
    name[..5].copy_from_slice(b"Phone");
    params.extend_from_slice(&name);

    let packet = event(EVT_REMOTE_NAME_REQ_COMPLETE, &params);
    let complete = decode_remote_name_complete(&packet).unwrap();
    assert_eq!(complete.status, 0);
    assert_eq!(complete.address, addr(0x01));
    assert_eq!(complete.name, "Phone");

    // Short name without padding
    let mut params = vec![0x00];
    params.extend_from_slice(addr(0x02).as_slice());
    params.extend_from_slice(b"Tab");
    let packet = event(EVT_REMOTE_NAME_REQ_COMPLETE, &params);
    let complete = decode_remote_name_complete(&packet).unwrap();
    assert_eq!(complete.name, "Tab");
}

#[test]
fn test_inquiry_rssi_fixture() {
    #[rustfmt::skip]
    let params = [
        0x02,                               // Num_Responses
        0x11, 0x11, 0x11, 0x11, 0x11, 0x11, // BD_ADDR[0]
        0x22, 0x22, 0x22, 0x22, 0x22, 0x22, // BD_ADDR[1]
        0x01, 0x02,                         // Page_Scan_Repetition_Mode[0..2]
        0x00, 0x00,                         // Reserved[0..2]
        0x0C, 0x02, 0x5A,                   // Class_Of_Device[0]
        0x04, 0x04, 0x24,                   // Class_Of_Device[1]
        0x34, 0x12,                         // Clock_Offset[0]
        0x78, 0x56,                         // Clock_Offset[1]
        0xC4, 0x7F,                         // RSSI[0..2]
    ];
    let packet = event(EVT_INQUIRY_RESULT_WITH_RSSI, &params);
    let results = decode_inquiry_rssi_results(&packet).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].address, BdAddr::new([0x11; 6]));
    assert_eq!(results[0].page_scan_repetition_mode, 1);
    assert_eq!(results[0].class_of_device, 0x5A020C);
    assert_eq!(results[0].clock_offset, 0x1234);
    assert_eq!(results[0].rssi, Some(-60));

    assert_eq!(results[1].address, BdAddr::new([0x22; 6]));
    assert_eq!(results[1].page_scan_repetition_mode, 2);
    assert_eq!(results[1].class_of_device, 0x240404);
    assert_eq!(results[1].clock_offset, 0x5678);
    assert_eq!(results[1].rssi, Some(RSSI_UNAVAILABLE));
}

#[test]
fn test_inquiry_results_reject_overrun() {
    // Count of 3 with room for 2
    let mut params = vec![0x03];
    params.extend_from_slice(&[0u8; 28]);
    assert!(matches!(
        decode_inquiry_rssi_results(&event(EVT_INQUIRY_RESULT_WITH_RSSI, &params)),
        Err(Error::MalformedPacket(_))
    ));

    // Declared length longer than the buffer
    let mut packet = event(EVT_INQUIRY_RESULT_WITH_RSSI, &[0x01; 15]);
    packet.truncate(10);
    assert!(decode_inquiry_rssi_results(&packet).is_err());

    // No responses at all
    let packet = event(EVT_INQUIRY_RESULT_WITH_RSSI, &[0x00]);
    let results = decode_inquiry_rssi_results(&packet).unwrap();
    assert!(results.is_empty());

    // Wrong event code
    assert!(decode_inquiry_rssi_results(&event(EVT_INQUIRY_RESULT, &[0x00])).is_err());
}

#[test]
fn test_le_advertising_fixture() {
    #[rustfmt::skip]
    let params = [
        EVT_LE_ADVERTISING_REPORT,          // Subevent_Code
        0x02,                               // Num_Reports
        0x00, 0x04,                         // Event_Type[0..2]
        0x00, 0x01,                         // Address_Type[0..2]
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // Address[0]
        0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, // Address[1]
        0x03, 0x00,                         // Length_Data[0..2]
        0x02, 0x01, 0x06,                   // Data[0], Data[1] is empty
        0xC3, 0xB0,                         // RSSI[0..2]
    ];
    let reports = decode_le_advertising_reports(&event(EVT_LE_META_EVENT, &params)).unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].event_type, 0x00);
    assert_eq!(reports[0].address_type, AddressType::Public);
    assert_eq!(reports[0].address, BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]));
    assert_eq!(reports[0].raw_payload_len, 3);
    assert_eq!(reports[0].data, vec![0x02, 0x01, 0x06]);
    assert_eq!(reports[0].rssi, -61);

    assert_eq!(reports[1].event_type, 0x04);
    assert_eq!(reports[1].address_type, AddressType::Random);
    assert_eq!(reports[1].address, BdAddr::new([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]));
    assert_eq!(reports[1].raw_payload_len, 0);
    assert!(reports[1].data.is_empty());
    assert_eq!(reports[1].rssi, -80);

    let subevent = decode_le_subevent(&event(EVT_LE_META_EVENT, &params)).unwrap();
    assert_eq!(subevent, EVT_LE_ADVERTISING_REPORT);
}

#[test]
fn test_le_advertising_rssi_follows_all_payloads() {
    // Both payloads come before the first RSSI byte, whatever their lengths
    #[rustfmt::skip]
    let params = [
        EVT_LE_ADVERTISING_REPORT,          // Subevent_Code
        0x02,                               // Num_Reports
        0x00, 0x03,                         // Event_Type[0..2]
        0x00, 0x00,                         // Address_Type[0..2]
        0x11, 0x12, 0x13, 0x14, 0x15, 0x16, // Address[0]
        0x21, 0x22, 0x23, 0x24, 0x25, 0x26, // Address[1]
        0x02, 0x01,                         // Length_Data[0..2]
        0x01, 0x06,                         // Data[0]
        0xFF,                               // Data[1]
        0xD8, 0xCE,                         // RSSI[0..2]
    ];
    let reports = decode_le_advertising_reports(&event(EVT_LE_META_EVENT, &params)).unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].data, vec![0x01, 0x06]);
    assert_eq!(reports[0].rssi, -40);
    assert_eq!(reports[1].event_type, 0x03);
    assert_eq!(reports[1].address, BdAddr::new([0x21, 0x22, 0x23, 0x24, 0x25, 0x26]));
    assert_eq!(reports[1].data, vec![0xFF]);
    assert_eq!(reports[1].rssi, -50);
}

#[test]
fn test_le_advertising_rejects_bad_lengths() {
    // Payload length pointing past the parameters
    #[rustfmt::skip]
    let params = [
        EVT_LE_ADVERTISING_REPORT, 0x01,
        0x00, 0x00,
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
        0x1F,
        0x02, 0x01,
        0xC3,
    ];
    assert!(matches!(
        decode_le_advertising_reports(&event(EVT_LE_META_EVENT, &params)),
        Err(Error::MalformedPacket(_))
    ));

    // Other LE subevent
    let packet = event(EVT_LE_META_EVENT, &[EVT_LE_CONN_COMPLETE, 0x00, 0x40, 0x00]);
    assert!(decode_le_advertising_reports(&packet).is_err());

    // Not an LE meta event
    assert!(decode_le_advertising_reports(&event(EVT_CMD_COMPLETE, &[1, 0, 0, 0])).is_err());

    // No report
    let packet = event(EVT_LE_META_EVENT, &[EVT_LE_ADVERTISING_REPORT, 0]);
    let reports = decode_le_advertising_reports(&packet).unwrap();
    assert!(reports.is_empty());
}

#[test]
fn test_column_major_round_trip() {
    for n in [1u8, 2, 5] {
        let results: Vec<InquiryResult> = (0..n)
            .map(|i| InquiryResult {
                address: addr(i + 1),
                page_scan_repetition_mode: i % 3,
                class_of_device: 0x5A0100 + i as u32,
                clock_offset: 0x1000 + i as u16,
                rssi: Some(-40 - i as i8),
            })
            .collect();
        let packet = encode_inquiry_results(EVT_INQUIRY_RESULT_WITH_RSSI, &results);
        assert_eq!(decode_inquiry_rssi_results(&packet).unwrap(), results, "n = {}", n);

        let plain: Vec<InquiryResult> = results
            .iter()
            .map(|r| InquiryResult { rssi: None, ..*r })
            .collect();
        let packet = encode_inquiry_results(EVT_INQUIRY_RESULT, &plain);
        assert_eq!(decode_inquiry_results(&packet).unwrap(), plain, "n = {}", n);

        let payloads: Vec<Vec<u8>> = (0..n).map(|i| vec![0xF0 | i; (i as usize) * 3]).collect();
        let reports: Vec<LeAdvertisingReport> = (0..n)
            .map(|i| {
                let address_type = if i % 2 == 0 {
                    AddressType::Public
                } else {
                    AddressType::Random
                };
                le_report(i + 1, address_type, &payloads[i as usize], -50 - i as i8)
            })
            .collect();
        let packet = encode_le_reports(&reports);
        assert_eq!(decode_le_advertising_reports(&packet).unwrap(), reports, "n = {}", n);
    }
}

// Scripted socket provider

type Responder = dyn Fn(&HciCommand) -> Vec<Vec<u8>> + Send + Sync;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

struct MockSocket {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    filter: Mutex<EventFilter>,
    sent: Arc<Mutex<Vec<HciCommand>>>,
    responder: Arc<Responder>,
    counters: Arc<Counters>,
}

impl HciChannel for MockSocket {
    fn dev_id(&self) -> u16 {
        0
    }

    fn send_command(&self, command: &HciCommand) -> crate::error::Result<()> {
        self.sent.lock().push(command.clone());
        let replies = (self.responder)(command);
        self.inbox.lock().extend(replies);
        Ok(())
    }

    fn wait_readable(&self, _timeout: Option<Duration>) -> crate::error::Result<bool> {
        Ok(!self.inbox.lock().is_empty())
    }

    fn read_packet(&self, buf: &mut [u8]) -> crate::error::Result<usize> {
        match self.inbox.lock().pop_front() {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Ok(0),
        }
    }

    fn filter(&self) -> crate::error::Result<EventFilter> {
        Ok(*self.filter.lock())
    }

    fn set_filter(&self, filter: &EventFilter) -> crate::error::Result<()> {
        *self.filter.lock() = *filter;
        Ok(())
    }

    fn adapter_info(&self) -> crate::error::Result<AdapterInfo> {
        Ok(AdapterInfo {
            dev_id: 0,
            address: adapter_address(),
            name: "hci0".to_string(),
        })
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockProvider {
    sent: Arc<Mutex<Vec<HciCommand>>>,
    responder: Arc<Responder>,
    counters: Arc<Counters>,
}

impl HciSocketProvider for MockProvider {
    type Socket = MockSocket;

    fn open(&self, _adapter: Option<&BdAddr>) -> crate::error::Result<MockSocket> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSocket {
            inbox: Mutex::new(VecDeque::new()),
            filter: Mutex::new(EventFilter::new()),
            sent: Arc::clone(&self.sent),
            responder: Arc::clone(&self.responder),
            counters: Arc::clone(&self.counters),
        })
    }
}

struct Harness {
    controller: HciController<MockProvider>,
    registry: Arc<DeviceRegistry>,
    sent: Arc<Mutex<Vec<HciCommand>>>,
    counters: Arc<Counters>,
}

impl Harness {
    fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<HciCommand> {
        self.sent.lock().clone()
    }
}

fn adapter_address() -> BdAddr {
    "00:1A:7D:DA:71:13".parse().unwrap()
}

fn test_config() -> HciConfig {
    HciConfig {
        command_timeout_ms: 50,
        le_poll_timeout_ms: 50,
        ..HciConfig::default()
    }
}

fn harness_with(
    config: HciConfig,
    responder: impl Fn(&HciCommand) -> Vec<Vec<u8>> + Send + Sync + 'static,
) -> Harness {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let counters = Arc::new(Counters::default());
    let provider = MockProvider {
        sent: Arc::clone(&sent),
        responder: Arc::new(responder),
        counters: Arc::clone(&counters),
    };
    let registry = Arc::new(DeviceRegistry::new());
    let controller = HciController::with_provider(
        provider,
        Arc::clone(&registry),
        None,
        Some("DONGLE"),
        config,
    )
    .unwrap();
    Harness {
        controller,
        registry,
        sent,
        counters,
    }
}

fn harness(responder: impl Fn(&HciCommand) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Harness {
    harness_with(test_config(), responder)
}

fn cmd_complete(command: &HciCommand, status: u8, return_parameters: &[u8]) -> Vec<u8> {
    let mut params = vec![1];
    params.extend_from_slice(&command.opcode().to_le_bytes());
    params.push(status);
    params.extend_from_slice(return_parameters);
    event(EVT_CMD_COMPLETE, &params)
}

fn cmd_status(command: &HciCommand, status: u8) -> Vec<u8> {
    let opcode = command.opcode().to_le_bytes();
    event(EVT_CMD_STATUS, &[status, 1, opcode[0], opcode[1]])
}

fn name_complete(address: BdAddr, name: &str) -> Vec<u8> {
    let mut params = vec![0x00];
    params.extend_from_slice(address.as_slice());
    params.extend_from_slice(name.as_bytes());
    params.push(0);
    event(EVT_REMOTE_NAME_REQ_COMPLETE, &params)
}

fn rssi_result(tag: u8, rssi: i8) -> InquiryResult {
    InquiryResult {
        address: addr(tag),
        page_scan_repetition_mode: 1,
        class_of_device: 0x5A020C,
        clock_offset: 0,
        rssi: Some(rssi),
    }
}

/// Answers every LE scan command successfully; enabling the scan also
/// queues `reports`
fn le_responder(
    reports: Vec<Vec<u8>>,
) -> impl Fn(&HciCommand) -> Vec<Vec<u8>> + Send + Sync + 'static {
    move |command| match command {
        HciCommand::LeSetScanParameters { .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::LeSetScanEnable { enable: true, .. } => {
            let mut replies = vec![cmd_complete(command, 0, &[])];
            replies.extend(reports.iter().cloned());
            replies
        }
        HciCommand::LeSetScanEnable { enable: false, .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::LeReadWhiteListSize => vec![cmd_complete(command, 0, &[12])],
        _ => vec![],
    }
}

#[test]
fn test_controller_open_registers_adapter() {
    let h = harness(|_| vec![]);

    assert_eq!(h.controller.state(), ControllerState::Open);
    assert!(!h.controller.is_interrupted());
    assert_eq!(h.controller.owned_socket_count(), 0);

    // The probe socket does not outlive open
    assert_eq!(h.opened(), 1);
    assert_eq!(h.closed(), 1);

    let adapter = h.registry.get(&adapter_address()).unwrap();
    assert_eq!(adapter.address_type, AddressType::Public);
    assert_eq!(adapter.real_name, "hci0");
    assert_eq!(adapter.custom_name, "DONGLE");
    assert_eq!(h.controller.device(), &adapter);
}

#[test]
fn test_operation_without_socket_uses_a_fresh_one() {
    let h = harness(|command| match command {
        HciCommand::LeReadWhiteListSize => vec![cmd_complete(command, 0, &[8])],
        _ => vec![],
    });

    assert_eq!(h.controller.le_white_list_size(None).unwrap(), 8);

    assert_eq!(h.opened(), 2);
    assert_eq!(h.closed(), 2);
    assert_eq!(h.controller.owned_socket_count(), 0);
    assert_eq!(h.controller.state(), ControllerState::Open);
    assert_eq!(h.sent(), vec![HciCommand::LeReadWhiteListSize]);
}

#[test]
fn test_owned_sockets_are_reused_and_closed_by_key() {
    let h = harness(|command| match command {
        HciCommand::LeReadWhiteListSize => vec![cmd_complete(command, 0, &[8])],
        _ => vec![],
    });

    let first = h.controller.open_socket().unwrap();
    let second = h.controller.open_socket().unwrap();
    assert_ne!(first, second);
    assert_eq!(h.controller.owned_socket_count(), 2);
    assert_eq!(h.opened(), 3);

    h.controller.le_white_list_size(None).unwrap();
    assert_eq!(h.opened(), 3);

    h.controller.close_socket(first).unwrap();
    assert_eq!(h.controller.owned_socket_count(), 1);
    assert_eq!(h.closed(), 2);

    assert!(matches!(
        h.controller.close_socket(first),
        Err(Error::InvalidReference(_))
    ));
    assert!(h.controller.socket(first).is_err());
    assert!(h.controller.socket(second).is_ok());
}

#[test]
fn test_failed_command_reverts_to_open() {
    let h = harness(|command| match command {
        HciCommand::LeClearWhiteList => vec![cmd_complete(command, 0x0C, &[])],
        _ => vec![],
    });

    let err = h.controller.le_clear_white_list(None).unwrap_err();
    assert!(matches!(
        err,
        Error::HardwareCommandFailed { opcode: 0x2010, .. }
    ));
    assert_eq!(h.controller.state(), ControllerState::Open);
    assert!(!h.controller.is_interrupted());
    assert_eq!(h.closed(), h.opened());
}

#[test]
fn test_unanswered_command_times_out() {
    let h = harness(|_| vec![]);

    assert!(matches!(
        h.controller.le_read_supported_states(None),
        Err(Error::Timeout)
    ));
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_unrelated_events_are_skipped() {
    let h = harness(|command| match command {
        HciCommand::LeReadWhiteListSize => vec![
            event(EVT_INQUIRY_COMPLETE, &[0]),
            cmd_complete(&HciCommand::LeClearWhiteList, 0, &[]),
            cmd_complete(command, 0, &[4]),
        ],
        _ => vec![],
    });

    assert_eq!(h.controller.le_white_list_size(None).unwrap(), 4);
}

#[test]
fn test_closed_controller_rejects_operations() {
    let h = harness(|command| vec![cmd_complete(command, 0, &[1])]);
    h.controller.open_socket().unwrap();

    h.controller.close().unwrap();
    assert_eq!(h.controller.state(), ControllerState::Closed);
    assert_eq!(h.controller.owned_socket_count(), 0);
    assert_eq!(h.opened(), h.closed());

    assert!(matches!(
        h.controller.le_white_list_size(None),
        Err(Error::BusyOrClosed(ControllerState::Closed))
    ));
    assert!(matches!(
        h.controller.open_socket(),
        Err(Error::BusyOrClosed(ControllerState::Closed))
    ));
    assert!(h.sent().is_empty());

    // Second close is a logged no-op
    assert!(h.controller.close().is_ok());
}

#[test]
fn test_read_features_and_states() {
    let h = harness(|command| match command {
        HciCommand::LeReadLocalSupportedFeatures => {
            vec![cmd_complete(command, 0, &[0x01, 0, 0, 0, 0, 0, 0, 0])]
        }
        HciCommand::LeReadSupportedStates => {
            vec![cmd_complete(command, 0, &[0x30, 0, 0, 0, 0, 0, 0, 0])]
        }
        _ => vec![],
    });

    let features = h.controller.le_read_local_supported_features(None).unwrap();
    assert_eq!(features, LeFeatures::ENCRYPTION);

    let states = h.controller.le_read_supported_states(None).unwrap();
    assert_eq!(states, LeStates::PASSIVE_SCAN | LeStates::ACTIVE_SCAN);
}

#[test]
fn test_short_return_parameters_are_malformed() {
    let h = harness(|command| vec![cmd_complete(command, 0, &[0x01, 0x02])]);

    assert!(matches!(
        h.controller.le_read_supported_states(None),
        Err(Error::MalformedPacket(_))
    ));
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_white_list_registers_unknown_devices() {
    let h = harness(|command| vec![cmd_complete(command, 0, &[])]);

    let stranger = Device::new(addr(0x01), AddressType::Unknown, Some("Tag"), None);
    h.controller.le_add_white_list(None, &stranger).unwrap();

    // Unknown address types go out as public
    assert_eq!(
        h.sent(),
        vec![HciCommand::LeAddDeviceToWhiteList {
            address_type: 0x00,
            address: addr(0x01),
        }]
    );
    assert_eq!(h.registry.get(&addr(0x01)).unwrap(), stranger);

    // Known devices are left as they are
    let renamed = Device::new(addr(0x01), AddressType::Random, Some("Other"), None);
    h.controller.le_remove_white_list(None, &renamed).unwrap();
    assert_eq!(h.registry.get(&addr(0x01)).unwrap(), stranger);
    assert_eq!(
        h.sent()[1],
        HciCommand::LeRemoveDeviceFromWhiteList {
            address_type: 0x01,
            address: addr(0x01),
        }
    );

    h.controller.le_clear_white_list(None).unwrap();
    assert_eq!(h.sent()[2], HciCommand::LeClearWhiteList);
}

#[test]
fn test_le_rssi_collects_reports() {
    let reports = vec![
        encode_le_reports(&[
            le_report(0x01, AddressType::Public, &[0x02, 0x01, 0x06], -60),
            le_report(0x02, AddressType::Random, &[], -70),
        ]),
        event(EVT_CMD_STATUS, &[0, 1, 0, 0]),
        encode_le_reports(&[le_report(0x01, AddressType::Public, &[0x02, 0x01, 0x06], -62)]),
    ];
    let h = harness(le_responder(reports));

    let mut sink: Vec<u8> = Vec::new();
    let samples = h
        .controller
        .le_measure_rssi(None, Some(&mut sink), None, 0, &LeScanParameters::default())
        .unwrap();

    let values: Vec<(BdAddr, i8)> = samples.iter().map(|s| (s.address, s.rssi)).collect();
    assert_eq!(values, vec![(addr(0x01), -60), (addr(0x02), -70), (addr(0x01), -62)]);
    assert_eq!(String::from_utf8(sink).unwrap(), "-60\n-70\n-62\n");

    // Advertisers are registered with the reported address type, without a name
    let random = h.registry.get(&addr(0x02)).unwrap();
    assert_eq!(random.address_type, AddressType::Random);
    assert_eq!(random.real_name, "UNKNOWN");

    assert_eq!(h.controller.state(), ControllerState::Open);
    assert!(!h.controller.is_interrupted());

    // Scan is turned off at the end
    assert_eq!(
        h.sent().last(),
        Some(&HciCommand::LeSetScanEnable {
            enable: false,
            filter_duplicates: false
        })
    );
}

#[test]
fn test_le_rssi_target_and_limit() {
    let reports = vec![
        encode_le_reports(&[
            le_report(0x02, AddressType::Random, &[0xFF], -70),
            le_report(0x01, AddressType::Public, &[], -60),
        ]),
        encode_le_reports(&[le_report(0x01, AddressType::Public, &[], -61)]),
    ];
    let h = harness(le_responder(reports));

    let samples = h
        .controller
        .le_measure_rssi(None, None, Some(&addr(0x01)), 1, &LeScanParameters::default())
        .unwrap();

    assert_eq!(samples, vec![RssiSample { address: addr(0x01), rssi: -60 }]);
    // Non-matching advertisers are still registered
    assert!(h.registry.exists(&addr(0x02)));
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_le_rssi_restores_caller_filter() {
    let h = harness(le_responder(vec![encode_le_reports(&[le_report(
        0x01,
        AddressType::Public,
        &[],
        -55,
    )])]));

    let id = h.controller.open_socket().unwrap();
    let socket = h.controller.socket(id).unwrap();
    let previous = build_event_filter(&[EVT_INQUIRY_COMPLETE]);
    socket.set_filter(&previous).unwrap();

    let samples = h
        .controller
        .le_measure_rssi(Some(socket.as_ref()), None, None, 0, &LeScanParameters::default())
        .unwrap();

    assert_eq!(samples.len(), 1);
    assert_eq!(socket.filter().unwrap(), previous);
    // The caller's socket was used, nothing else was opened
    assert_eq!(h.opened(), 2);
}

#[test]
fn test_le_rssi_skips_truncated_events() {
    let reports = vec![
        encode_le_reports(&[le_report(0x01, AddressType::Public, &[], -60)]),
        event(EVT_LE_META_EVENT, &[]),
        encode_le_reports(&[le_report(0x02, AddressType::Public, &[], -61)]),
    ];
    let h = harness(le_responder(reports));

    let samples = h
        .controller
        .le_measure_rssi(None, None, None, 0, &LeScanParameters::default())
        .unwrap();

    assert_eq!(
        samples,
        vec![
            RssiSample { address: addr(0x01), rssi: -60 },
            RssiSample { address: addr(0x02), rssi: -61 },
        ]
    );
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_le_rssi_emits_suspicious_and_unavailable_values() {
    let reports = vec![encode_le_reports(&[
        le_report(0x01, AddressType::Public, &[], 25),
        le_report(0x02, AddressType::Random, &[], RSSI_UNAVAILABLE),
    ])];
    let h = harness(le_responder(reports));

    let mut sink: Vec<u8> = Vec::new();
    let samples = h
        .controller
        .le_measure_rssi(None, Some(&mut sink), None, 0, &LeScanParameters::default())
        .unwrap();

    assert_eq!(
        samples,
        vec![
            RssiSample { address: addr(0x01), rssi: 25 },
            RssiSample { address: addr(0x02), rssi: RSSI_UNAVAILABLE },
        ]
    );
    assert_eq!(String::from_utf8(sink).unwrap(), "25\n127\n");
}

#[test]
fn test_classic_discovery_skips_truncated_events() {
    let h = harness(|command| match command {
        HciCommand::WriteInquiryMode { .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::Inquiry { .. } => vec![
            cmd_status(command, 0),
            event(EVT_CMD_STATUS, &[0x00]),
            encode_inquiry_results(EVT_INQUIRY_RESULT_WITH_RSSI, &[rssi_result(0x01, -45)]),
            event(EVT_INQUIRY_COMPLETE, &[]),
        ],
        _ => vec![],
    });
    h.registry.register(Device::minimal(addr(0x01)));

    let samples = h.controller.measure_rssi(None, None, None, 4, 0).unwrap();
    assert_eq!(samples, vec![RssiSample { address: addr(0x01), rssi: -45 }]);

    // A truncated Inquiry Complete still ends the inquiry
    let devices = h.controller.scan_devices(None, 4, 0).unwrap();
    assert_eq!(devices, vec![Device::minimal(addr(0x01))]);
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_failed_scan_disable_interrupts_until_resolved() {
    let refuse_disable = Arc::new(AtomicBool::new(true));
    let refuse = Arc::clone(&refuse_disable);
    let h = harness(move |command| match command {
        HciCommand::LeSetScanEnable { enable: false, .. } => {
            let status = if refuse.load(Ordering::SeqCst) { 0x0C } else { 0x00 };
            vec![cmd_complete(command, status, &[])]
        }
        HciCommand::LeSetScanEnable { enable: true, .. } => vec![
            cmd_complete(command, 0, &[]),
            encode_le_reports(&[le_report(0x01, AddressType::Public, &[], -50)]),
        ],
        _ => vec![cmd_complete(command, 0, &[3])],
    });

    let samples = h
        .controller
        .le_measure_rssi(None, None, None, 0, &LeScanParameters::default())
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(h.controller.state(), ControllerState::Scanning);
    assert!(h.controller.is_interrupted());

    // Resolution keeps failing while the adapter refuses
    assert!(matches!(
        h.controller.le_white_list_size(None),
        Err(Error::BusyOrClosed(ControllerState::Scanning))
    ));
    assert!(h.controller.resolve_interruption(None).is_err());
    assert!(h.controller.is_interrupted());

    // The next operation resolves the interruption first, on its own socket
    refuse_disable.store(false, Ordering::SeqCst);
    let opened = h.opened();
    assert_eq!(h.controller.le_white_list_size(None).unwrap(), 3);
    assert_eq!(h.controller.state(), ControllerState::Open);
    assert!(!h.controller.is_interrupted());
    assert_eq!(h.opened(), opened + 1);
    assert_eq!(h.closed(), h.opened());

    let sent = h.sent();
    assert_eq!(
        sent[sent.len() - 2..],
        [
            HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false
            },
            HciCommand::LeReadWhiteListSize,
        ]
    );
}

#[test]
fn test_unknown_interruption_is_kept() {
    let h = harness(|command| vec![cmd_complete(command, 0, &[3])]);
    h.controller.interrupt_in(ControllerState::Reading);

    assert!(matches!(
        h.controller.resolve_interruption(None),
        Err(Error::BusyOrClosed(ControllerState::Reading))
    ));
    assert!(matches!(
        h.controller.le_white_list_size(None),
        Err(Error::BusyOrClosed(ControllerState::Reading))
    ));

    assert!(h.controller.is_interrupted());
    assert_eq!(h.controller.state(), ControllerState::Reading);
    assert!(h.sent().is_empty());
}

#[test]
fn test_resolve_without_interruption_is_a_no_op() {
    let h = harness(|_| vec![]);
    assert!(h.controller.resolve_interruption(None).is_ok());
    assert!(h.sent().is_empty());
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_classic_rssi_queries_unknown_names() {
    let h = harness(|command| match command {
        HciCommand::WriteInquiryMode { .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::Inquiry { .. } => vec![
            cmd_status(command, 0),
            encode_inquiry_results(
                EVT_INQUIRY_RESULT_WITH_RSSI,
                &[rssi_result(0x01, -50), rssi_result(0x02, RSSI_UNAVAILABLE)],
            ),
            event(EVT_INQUIRY_COMPLETE, &[0]),
        ],
        HciCommand::RemoteNameRequest { bd_addr, .. } => {
            vec![cmd_status(command, 0), name_complete(*bd_addr, "Phone")]
        }
        _ => vec![],
    });
    let known = Device::new(addr(0x01), AddressType::Public, Some("Headset"), Some("Mine"));
    h.registry.register(known.clone());

    let mut sink: Vec<u8> = Vec::new();
    let samples = h
        .controller
        .measure_rssi(None, Some(&mut sink), None, 4, 0)
        .unwrap();

    assert_eq!(
        samples,
        vec![
            RssiSample { address: addr(0x01), rssi: -50 },
            RssiSample { address: addr(0x02), rssi: RSSI_UNAVAILABLE },
        ]
    );
    assert_eq!(String::from_utf8(sink).unwrap(), "-50\n127\n");

    // Only the unknown device had its name requested
    let name_requests = h
        .sent()
        .iter()
        .filter(|c| matches!(c, HciCommand::RemoteNameRequest { .. }))
        .count();
    assert_eq!(name_requests, 1);
    assert_eq!(h.registry.get(&addr(0x01)).unwrap(), known);
    let stranger = h.registry.get(&addr(0x02)).unwrap();
    assert_eq!(stranger.real_name, "Phone");
    assert_eq!(stranger.address_type, AddressType::Unknown);

    assert_eq!(h.sent()[0], HciCommand::WriteInquiryMode { mode: INQUIRY_MODE_RSSI });
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_classic_rssi_target_filter() {
    let h = harness(|command| match command {
        HciCommand::WriteInquiryMode { .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::Inquiry { .. } => vec![
            cmd_status(command, 0),
            encode_inquiry_results(
                EVT_INQUIRY_RESULT_WITH_RSSI,
                &[rssi_result(0x01, -50), rssi_result(0x02, -65)],
            ),
            event(EVT_INQUIRY_COMPLETE, &[0]),
        ],
        _ => vec![],
    });
    h.registry.register(Device::minimal(addr(0x01)));
    h.registry.register(Device::minimal(addr(0x02)));

    let samples = h
        .controller
        .measure_rssi(None, None, Some(&addr(0x02)), 4, 0)
        .unwrap();
    assert_eq!(samples, vec![RssiSample { address: addr(0x02), rssi: -65 }]);
}

#[test]
fn test_rejected_inquiry_fails() {
    let h = harness(|command| match command {
        HciCommand::WriteInquiryMode { .. } => vec![cmd_complete(command, 0, &[])],
        HciCommand::Inquiry { .. } => vec![cmd_status(command, 0x0C)],
        _ => vec![],
    });

    assert!(matches!(
        h.controller.measure_rssi(None, None, None, 4, 0),
        Err(Error::HardwareCommandFailed { opcode: 0x0401, .. })
    ));
    assert!(matches!(
        h.controller.scan_devices(None, 4, 0),
        Err(Error::HardwareCommandFailed { opcode: 0x0401, .. })
    ));
    assert_eq!(h.controller.state(), ControllerState::Open);
}

fn scan_responder(command: &HciCommand) -> Vec<Vec<u8>> {
    match command {
        HciCommand::Inquiry { .. } => vec![
            cmd_status(command, 0),
            encode_inquiry_results(
                EVT_INQUIRY_RESULT,
                &[
                    InquiryResult { rssi: None, ..rssi_result(0x01, 0) },
                    InquiryResult { rssi: None, ..rssi_result(0x03, 0) },
                ],
            ),
            encode_inquiry_results(
                EVT_INQUIRY_RESULT,
                &[InquiryResult { rssi: None, ..rssi_result(0x01, 0) }],
            ),
            event(EVT_INQUIRY_COMPLETE, &[0]),
        ],
        HciCommand::RemoteNameRequest { bd_addr, .. } => {
            vec![cmd_status(command, 0), name_complete(*bd_addr, "Laptop")]
        }
        _ => vec![],
    }
}

#[test]
fn test_scan_overwrites_known_devices() {
    let h = harness(scan_responder);
    h.registry
        .register(Device::new(addr(0x01), AddressType::Public, Some("Headset"), Some("Mine")));

    let devices = h.controller.scan_devices(None, 4, 0).unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0], Device::minimal(addr(0x01)));
    assert_eq!(devices[1].address, addr(0x03));
    assert_eq!(devices[1].real_name, "Laptop");
    assert_eq!(devices[1].address_type, AddressType::Unknown);

    // The richer record is replaced by the address-only one
    assert_eq!(h.registry.get(&addr(0x01)).unwrap(), Device::minimal(addr(0x01)));
    assert_eq!(h.registry.get(&addr(0x03)).unwrap(), devices[1]);
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_scan_can_preserve_known_devices() {
    let config = HciConfig {
        known_device_policy: KnownDevicePolicy::Preserve,
        ..test_config()
    };
    let h = harness_with(config, scan_responder);
    let known = Device::new(addr(0x01), AddressType::Public, Some("Headset"), Some("Mine"));
    h.registry.register(known.clone());

    let devices = h.controller.scan_devices(None, 4, 0).unwrap();

    assert_eq!(devices[0], known);
    assert_eq!(h.registry.get(&addr(0x01)).unwrap(), known);
}

#[test]
fn test_scan_without_answers_is_empty() {
    let h = harness(|command| match command {
        HciCommand::Inquiry { .. } => {
            vec![cmd_status(command, 0), event(EVT_INQUIRY_COMPLETE, &[0])]
        }
        _ => vec![],
    });

    assert!(h.controller.scan_devices(None, 1, 0).unwrap().is_empty());
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_remote_name_falls_back_to_unknown() {
    let h = harness(|command| match command {
        HciCommand::RemoteNameRequest { .. } => vec![cmd_status(command, 0x04)],
        _ => vec![],
    });

    assert_eq!(h.controller.resolve_remote_name(None, &addr(0x09)).unwrap(), "UNKNOWN");
    assert_eq!(h.controller.state(), ControllerState::Open);
}

#[test]
fn test_remote_name_resolution() {
    let h = harness(|command| match command {
        HciCommand::RemoteNameRequest { bd_addr, .. } => {
            vec![cmd_status(command, 0), name_complete(*bd_addr, "Speaker")]
        }
        _ => vec![],
    });

    assert_eq!(h.controller.resolve_remote_name(None, &addr(0x09)).unwrap(), "Speaker");
}

#[test]
fn test_controller_is_shareable_between_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<HciController<MockProvider>>();
    assert_send_sync::<HciController>();

    let h = harness(|command| vec![cmd_complete(command, 0, &[2])]);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                assert_eq!(h.controller.le_white_list_size(None).unwrap(), 2);
            });
        }
    });
    assert_eq!(h.controller.state(), ControllerState::Open);
    assert_eq!(h.opened(), h.closed());
}
