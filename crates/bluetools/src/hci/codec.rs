//! HCI event decoding
//!
//! Stateless routines turning raw event buffers, as read from a raw HCI
//! socket, into structured records. Every routine takes the whole packet,
//! packet indicator included, and fails with [`Error::MalformedPacket`] when
//! a declared length or record count runs past the buffer.
//!
//! Inquiry results and LE advertising reports pack several responses into a
//! single event "column-major": first the N addresses, then the N values of
//! the next field, and so on. The offset of field `f` of response `i` is
//! `base + N * size_of_fields_before(f) + size_of(f) * i`.

use crate::error::{Error, Result};
use crate::gap::{AddressType, BdAddr, BT_NAME_LENGTH};
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};

/// Bounds-checked read access to an event's bytes
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    buf: &'a [u8],
}

impl<'a> FieldView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or_else(|| {
                Error::MalformedPacket(format!(
                    "{} byte field at offset {} runs past {} bytes",
                    len,
                    offset,
                    self.buf.len()
                ))
            })
    }

    pub fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn i8(&self, offset: usize) -> Result<i8> {
        Ok(self.u8(offset)? as i8)
    }

    pub fn u16_le(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn u24_le(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u24(self.slice(offset, 3)?))
    }

    pub fn u64_le(&self, offset: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    pub fn address(&self, offset: usize) -> Result<BdAddr> {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(self.slice(offset, 6)?);
        Ok(BdAddr::new(bytes))
    }
}

/// Kernel `struct hci_filter`, as exchanged through `SOL_HCI`/`HCI_FILTER`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFilter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

impl EventFilter {
    /// Filter letting nothing through
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_ptype(&mut self, ptype: u8) {
        let bit = if ptype == HCI_VENDOR_PKT { 0 } else { ptype & 31 };
        self.type_mask |= 1 << bit;
    }

    pub fn set_event(&mut self, event: u8) {
        let bit = event & 63;
        self.event_mask[(bit >> 5) as usize] |= 1 << (bit & 31);
    }

    pub fn clear_event(&mut self, event: u8) {
        let bit = event & 63;
        self.event_mask[(bit >> 5) as usize] &= !(1 << (bit & 31));
    }

    pub fn test_event(&self, event: u8) -> bool {
        let bit = event & 63;
        self.event_mask[(bit >> 5) as usize] & (1 << (bit & 31)) != 0
    }

    pub fn test_ptype(&self, ptype: u8) -> bool {
        let bit = if ptype == HCI_VENDOR_PKT { 0 } else { ptype & 31 };
        self.type_mask & (1 << bit) != 0
    }

    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode;
    }
}

/// Builds a filter passing event packets of the given codes.
///
/// Command Complete is always included.
pub fn build_event_filter(events: &[u8]) -> EventFilter {
    let mut filter = EventFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_CMD_COMPLETE);
    for &event in events {
        filter.set_event(event);
    }
    filter
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub event_code: u8,
    pub param_len: u8,
}

/// Validates the packet indicator and event header.
///
/// The buffer must hold at least the header plus the declared parameters.
pub fn decode_event_header(buffer: &[u8]) -> Result<EventHeader> {
    let params = strip_packet_indicator(buffer)?;
    if params.len() < HCI_EVENT_HDR_SIZE {
        return Err(Error::MalformedPacket(format!(
            "event header needs {} bytes, got {}",
            HCI_EVENT_HDR_SIZE,
            params.len()
        )));
    }
    let header = EventHeader {
        event_code: params[0],
        param_len: params[1],
    };
    let available = params.len() - HCI_EVENT_HDR_SIZE;
    if available < header.param_len as usize {
        return Err(Error::MalformedPacket(format!(
            "event 0x{:02X} declares {} parameter bytes, only {} present",
            header.event_code, header.param_len, available
        )));
    }
    Ok(header)
}

/// Returns the packet without its leading event indicator byte
pub fn strip_packet_indicator(buffer: &[u8]) -> Result<&[u8]> {
    match buffer.split_first() {
        Some((&HCI_EVENT_PKT, rest)) => Ok(rest),
        Some((other, _)) => Err(Error::MalformedPacket(format!(
            "expected event packet indicator 0x{:02X}, got 0x{:02X}",
            HCI_EVENT_PKT, other
        ))),
        None => Err(Error::MalformedPacket("empty packet".into())),
    }
}

/// Header plus a view over exactly the declared parameters
fn event_parameters(buffer: &[u8]) -> Result<(EventHeader, FieldView<'_>)> {
    let header = decode_event_header(buffer)?;
    let start = 1 + HCI_EVENT_HDR_SIZE;
    let params = &buffer[start..start + header.param_len as usize];
    Ok((header, FieldView::new(params)))
}

fn expect_event(header: &EventHeader, event_code: u8) -> Result<()> {
    if header.event_code != event_code {
        return Err(Error::MalformedPacket(format!(
            "expected event 0x{:02X}, got 0x{:02X}",
            event_code, header.event_code
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub num_packets: u8,
    pub opcode: u16,
    pub status: u8,
    pub return_parameters: Vec<u8>,
}

pub fn decode_command_complete(buffer: &[u8]) -> Result<CommandComplete> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_CMD_COMPLETE)?;
    Ok(CommandComplete {
        num_packets: view.u8(0)?,
        opcode: view.u16_le(1)?,
        status: view.u8(3)?,
        return_parameters: view.slice(4, view.len().saturating_sub(4))?.to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub status: u8,
    pub num_packets: u8,
    pub opcode: u16,
}

pub fn decode_command_status(buffer: &[u8]) -> Result<CommandStatus> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_CMD_STATUS)?;
    Ok(CommandStatus {
        status: view.u8(0)?,
        num_packets: view.u8(1)?,
        opcode: view.u16_le(2)?,
    })
}

/// Status of an Inquiry Complete event
pub fn decode_inquiry_complete(buffer: &[u8]) -> Result<u8> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_INQUIRY_COMPLETE)?;
    view.u8(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNameComplete {
    pub status: u8,
    pub address: BdAddr,
    pub name: String,
}

/// Decodes a Remote Name Request Complete event; the name stops at the first NUL.
pub fn decode_remote_name_complete(buffer: &[u8]) -> Result<RemoteNameComplete> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_REMOTE_NAME_REQ_COMPLETE)?;
    let status = view.u8(0)?;
    let address = view.address(1)?;
    let raw = view.slice(7, view.len().saturating_sub(7).min(BT_NAME_LENGTH))?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(RemoteNameComplete {
        status,
        address,
        name: String::from_utf8_lossy(&raw[..end]).into_owned(),
    })
}

/// One response of an inquiry result event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryResult {
    pub address: BdAddr,
    pub page_scan_repetition_mode: u8,
    /// 24-bit class of device
    pub class_of_device: u32,
    pub clock_offset: u16,
    /// Present only for Inquiry Result with RSSI
    pub rssi: Option<i8>,
}

fn record_count(
    view: &FieldView<'_>,
    count_offset: usize,
    base: usize,
    record_size: usize,
) -> Result<usize> {
    let count = view.u8(count_offset)? as usize;
    let needed = base + count * record_size;
    if needed > view.len() {
        return Err(Error::MalformedPacket(format!(
            "{} records need {} parameter bytes, only {} present",
            count,
            needed,
            view.len()
        )));
    }
    Ok(count)
}

/// Decodes a standard Inquiry Result event (0x02).
///
/// Column sizes: address 6, page scan repetition mode 1, reserved 2,
/// class of device 3, clock offset 2.
pub fn decode_inquiry_results(buffer: &[u8]) -> Result<Vec<InquiryResult>> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_INQUIRY_RESULT)?;

    const BASE: usize = 1;
    let n = record_count(&view, 0, BASE, 14)?;

    (0..n)
        .map(|i| {
            Ok(InquiryResult {
                address: view.address(BASE + 6 * i)?,
                page_scan_repetition_mode: view.u8(BASE + 6 * n + i)?,
                class_of_device: view.u24_le(BASE + 9 * n + 3 * i)?,
                clock_offset: view.u16_le(BASE + 12 * n + 2 * i)?,
                rssi: None,
            })
        })
        .collect()
}

/// Decodes an Inquiry Result with RSSI event (0x22).
///
/// Column sizes: address 6, page scan repetition mode 1, reserved 1,
/// class of device 3, clock offset 2, RSSI 1.
pub fn decode_inquiry_rssi_results(buffer: &[u8]) -> Result<Vec<InquiryResult>> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_INQUIRY_RESULT_WITH_RSSI)?;

    const BASE: usize = 1;
    let n = record_count(&view, 0, BASE, 14)?;

    (0..n)
        .map(|i| {
            Ok(InquiryResult {
                address: view.address(BASE + 6 * i)?,
                page_scan_repetition_mode: view.u8(BASE + 6 * n + i)?,
                class_of_device: view.u24_le(BASE + 8 * n + 3 * i)?,
                clock_offset: view.u16_le(BASE + 11 * n + 2 * i)?,
                rssi: Some(view.i8(BASE + 13 * n + i)?),
            })
        })
        .collect()
}

/// Subevent code of an LE Meta event
pub fn decode_le_subevent(buffer: &[u8]) -> Result<u8> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_LE_META_EVENT)?;
    view.u8(0)
}

/// One report of an LE Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeAdvertisingReport {
    pub event_type: u8,
    pub address_type: AddressType,
    pub address: BdAddr,
    pub raw_payload_len: u8,
    pub data: Vec<u8>,
    pub rssi: i8,
}

/// Decodes an LE Meta / Advertising Report event (0x3E / 0x02).
///
/// After the subevent code and report count come the N event types, the N
/// address types, the N addresses, the N payload lengths, the N payloads
/// back to back, and finally the N RSSI bytes. The payloads vary in length,
/// so the RSSI column starts after the sum of all payload lengths.
pub fn decode_le_advertising_reports(buffer: &[u8]) -> Result<Vec<LeAdvertisingReport>> {
    let (header, view) = event_parameters(buffer)?;
    expect_event(&header, EVT_LE_META_EVENT)?;

    let subevent = view.u8(0)?;
    if subevent != EVT_LE_ADVERTISING_REPORT {
        return Err(Error::MalformedPacket(format!(
            "expected LE subevent 0x{:02X}, got 0x{:02X}",
            EVT_LE_ADVERTISING_REPORT, subevent
        )));
    }

    const BASE: usize = 2;
    // Fixed part: event type 1, address type 1, address 6, length 1, RSSI 1
    let n = record_count(&view, 1, BASE, 10)?;

    let lengths = view.slice(BASE + 8 * n, n)?;
    let total: usize = lengths.iter().map(|&l| l as usize).sum();
    let data_start = BASE + 9 * n;
    let rssi_start = data_start + total;
    if rssi_start + n > view.len() {
        return Err(Error::MalformedPacket(format!(
            "{} reports with {} payload bytes need {} parameter bytes, only {} present",
            n,
            total,
            rssi_start + n,
            view.len()
        )));
    }

    let mut reports = Vec::with_capacity(n);
    let mut data_offset = data_start;
    for (i, &len) in lengths.iter().enumerate() {
        reports.push(LeAdvertisingReport {
            event_type: view.u8(BASE + i)?,
            address_type: AddressType::from(view.u8(BASE + n + i)?),
            address: view.address(BASE + 2 * n + 6 * i)?,
            raw_payload_len: len,
            data: view.slice(data_offset, len as usize)?.to_vec(),
            rssi: view.i8(rssi_start + i)?,
        });
        data_offset += len as usize;
    }
    Ok(reports)
}
