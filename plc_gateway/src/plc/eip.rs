//! EtherNet/IP drivers for Allen-Bradley controllers.
//!
//! Class 3 explicit messaging over TCP port 44818: CompactLogix tags are
//! read with the CIP Read Tag service (symbolic addressing), SLC 5/05
//! data-table words with PCCC protected typed logical reads tunnelled
//! through the CIP PCCC object.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::plc::driver::{DriverError, DriverFactory, DriverResult, PlcDriver, ReadResult};
use crate::tags::structures::TagValue;

const ETHERNET_IP_PORT: u16 = 44818;

const ENCAP_CMD_REGISTER_SESSION: u16 = 0x0065;
const ENCAP_CMD_UNREGISTER_SESSION: u16 = 0x0066;
const ENCAP_CMD_SEND_RR_DATA: u16 = 0x006F;

const CIP_SERVICE_READ_TAG: u8 = 0x4C;
const CIP_SERVICE_PCCC_EXECUTE: u8 = 0x4B;

// CIP elementary type codes carried in Read Tag replies.
const CIP_TYPE_BOOL: u16 = 0x00C1;
const CIP_TYPE_SINT: u16 = 0x00C2;
const CIP_TYPE_INT: u16 = 0x00C3;
const CIP_TYPE_DINT: u16 = 0x00C4;
const CIP_TYPE_LINT: u16 = 0x00C5;
const CIP_TYPE_USINT: u16 = 0x00C6;
const CIP_TYPE_UINT: u16 = 0x00C7;
const CIP_TYPE_UDINT: u16 = 0x00C8;
const CIP_TYPE_REAL: u16 = 0x00CA;
const CIP_TYPE_LREAL: u16 = 0x00CB;

/// Shared encapsulation transport: one registered session per TCP stream.
struct EipTransport {
    endpoint: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    session_handle: u32,
}

impl EipTransport {
    fn new(endpoint: String, timeout: Duration) -> Self {
        EipTransport {
            endpoint,
            timeout,
            stream: None,
            session_handle: 0,
        }
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&mut self) -> DriverResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = if self.endpoint.contains(':') {
            self.endpoint.clone()
        } else {
            format!("{}:{}", self.endpoint, ETHERNET_IP_PORT)
        };
        let addr = target
            .to_socket_addrs()
            .map_err(|e| DriverError::ConnectionFailed(format!("invalid socket address: {e}")))?
            .next()
            .ok_or_else(|| {
                DriverError::ConnectionFailed(format!("no address resolved for {target}"))
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| DriverError::ConnectionFailed(format!("connect to plc: {e}")))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| DriverError::ConnectionFailed(format!("socket setup: {e}")))?;
        self.stream = Some(stream);

        match self.register_session() {
            Ok(handle) => {
                self.session_handle = handle;
                debug!(endpoint = %self.endpoint, session = handle, "EtherNet/IP session registered");
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // Best-effort unregister before dropping the socket.
            let packet = encap_header(ENCAP_CMD_UNREGISTER_SESSION, self.session_handle, 0);
            let _ = stream.write_all(&packet);
        }
        self.session_handle = 0;
    }

    fn register_session(&mut self) -> DriverResult<u32> {
        let mut packet = encap_header(ENCAP_CMD_REGISTER_SESSION, 0, 4);
        packet.extend_from_slice(&1u16.to_le_bytes()); // protocol version
        packet.extend_from_slice(&0u16.to_le_bytes()); // options flags

        let response = self.exchange(&packet)?;
        if response.len() < 24 {
            return Err(DriverError::ConnectionFailed(
                "register session response too short".to_string(),
            ));
        }
        let status = u32::from_le_bytes([response[8], response[9], response[10], response[11]]);
        if status != 0 {
            return Err(DriverError::ConnectionFailed(format!(
                "register session rejected: 0x{status:08X}"
            )));
        }
        Ok(u32::from_le_bytes([
            response[4],
            response[5],
            response[6],
            response[7],
        ]))
    }

    /// Wrap a CIP request in a SendRRData encapsulation and return the CIP
    /// reply payload (CPF headers stripped).
    fn send_rr_data(&mut self, cip: &[u8]) -> DriverResult<Vec<u8>> {
        if self.stream.is_none() {
            return Err(DriverError::NotConnected);
        }
        let cpf_len = 16 + cip.len();
        let mut packet = encap_header(ENCAP_CMD_SEND_RR_DATA, self.session_handle, cpf_len as u16);
        packet.extend_from_slice(&0u32.to_le_bytes()); // interface handle (CIP)
        packet.extend_from_slice(&0u16.to_le_bytes()); // timeout
        packet.extend_from_slice(&2u16.to_le_bytes()); // item count
        packet.extend_from_slice(&0u16.to_le_bytes()); // null address item
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&0x00B2u16.to_le_bytes()); // unconnected data item
        packet.extend_from_slice(&(cip.len() as u16).to_le_bytes());
        packet.extend_from_slice(cip);

        let response = self.exchange(&packet)?;
        let status = u32::from_le_bytes([response[8], response[9], response[10], response[11]]);
        if status != 0 {
            return Err(DriverError::ReadFailed(format!(
                "encapsulation error: 0x{status:08X}"
            )));
        }
        // 24-byte encapsulation header, then CPF: interface handle (4),
        // timeout (2), item count (2), null item (4), data item header (4).
        if response.len() < 40 {
            return Err(DriverError::ReadFailed("response too short".to_string()));
        }
        Ok(response[40..].to_vec())
    }

    fn exchange(&mut self, packet: &[u8]) -> DriverResult<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(DriverError::NotConnected)?;
        let io_result = (|| {
            stream.write_all(packet)?;
            let mut header = [0u8; 24];
            stream.read_exact(&mut header)?;
            let data_len = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut body = vec![0u8; data_len];
            stream.read_exact(&mut body)?;
            let mut full = header.to_vec();
            full.extend_from_slice(&body);
            Ok::<_, std::io::Error>(full)
        })();
        match io_result {
            Ok(full) => Ok(full),
            Err(e) => {
                // A failed exchange leaves the stream in an unknown framing
                // state; force a reconnect on the next attempt.
                self.stream = None;
                self.session_handle = 0;
                match e.kind() {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                        Err(DriverError::Timeout)
                    }
                    _ => Err(DriverError::ReadFailed(format!("socket error: {e}"))),
                }
            }
        }
    }
}

impl Drop for EipTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn encap_header(command: u16, session_handle: u32, data_len: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(24 + data_len as usize);
    packet.extend_from_slice(&command.to_le_bytes());
    packet.extend_from_slice(&data_len.to_le_bytes());
    packet.extend_from_slice(&session_handle.to_le_bytes());
    packet.extend_from_slice(&0u32.to_le_bytes()); // status
    packet.extend_from_slice(&[0u8; 8]); // sender context
    packet.extend_from_slice(&0u32.to_le_bytes()); // options
    packet
}

/// Validate a Logix symbolic tag address ("MyTag", "Program:Main.Flow").
fn validate_logix_address(address: &str) -> DriverResult<()> {
    if address.is_empty() {
        return Err(DriverError::InvalidAddress("address cannot be empty".to_string()));
    }
    let valid = address
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == ':');
    if !valid {
        return Err(DriverError::InvalidAddress(format!(
            "invalid characters in tag address: {address}"
        )));
    }
    Ok(())
}

/// Encode a symbolic tag path as CIP EPATH ANSI extended symbol segments,
/// one segment per dot-separated member.
fn build_symbolic_path(address: &str) -> Vec<u8> {
    let mut path = Vec::new();
    for part in address.split('.') {
        path.push(0x91); // ANSI extended symbol segment
        path.push(part.len() as u8);
        path.extend_from_slice(part.as_bytes());
        if part.len() % 2 != 0 {
            path.push(0); // pad to 16-bit boundary
        }
    }
    path
}

fn build_read_tag_request(address: &str) -> Vec<u8> {
    let path = build_symbolic_path(address);
    let mut cip = Vec::with_capacity(4 + path.len());
    cip.push(CIP_SERVICE_READ_TAG);
    cip.push((path.len() / 2) as u8); // path size in words
    cip.extend_from_slice(&path);
    cip.extend_from_slice(&1u16.to_le_bytes()); // element count
    cip
}

/// Decode a Read Tag reply: service echo, general status, type code, data.
fn parse_read_tag_reply(reply: &[u8]) -> DriverResult<TagValue> {
    if reply.len() < 4 {
        return Err(DriverError::ReadFailed("CIP reply too short".to_string()));
    }
    let general_status = reply[2];
    if general_status != 0 {
        return Err(DriverError::ReadFailed(format!(
            "CIP status 0x{general_status:02X}"
        )));
    }
    if reply.len() < 6 {
        return Err(DriverError::ReadFailed("CIP reply missing type code".to_string()));
    }
    let type_code = u16::from_le_bytes([reply[4], reply[5]]);
    let data = &reply[6..];
    decode_cip_value(type_code, data)
}

fn decode_cip_value(type_code: u16, data: &[u8]) -> DriverResult<TagValue> {
    let need = |n: usize| -> DriverResult<()> {
        if data.len() < n {
            Err(DriverError::ReadFailed(format!(
                "short data for type 0x{type_code:04X}"
            )))
        } else {
            Ok(())
        }
    };
    match type_code {
        CIP_TYPE_BOOL => {
            need(1)?;
            Ok(TagValue::Bool(data[0] != 0))
        }
        CIP_TYPE_SINT => {
            need(1)?;
            Ok(TagValue::Int(data[0] as i8 as i64))
        }
        CIP_TYPE_INT => {
            need(2)?;
            Ok(TagValue::Int(i16::from_le_bytes([data[0], data[1]]) as i64))
        }
        CIP_TYPE_DINT => {
            need(4)?;
            Ok(TagValue::Int(
                i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
            ))
        }
        CIP_TYPE_LINT => {
            need(8)?;
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[..8]);
            Ok(TagValue::Int(i64::from_le_bytes(b)))
        }
        CIP_TYPE_USINT => {
            need(1)?;
            Ok(TagValue::UInt(data[0] as u64))
        }
        CIP_TYPE_UINT => {
            need(2)?;
            Ok(TagValue::UInt(u16::from_le_bytes([data[0], data[1]]) as u64))
        }
        CIP_TYPE_UDINT => {
            need(4)?;
            Ok(TagValue::UInt(
                u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64,
            ))
        }
        CIP_TYPE_REAL => {
            need(4)?;
            Ok(TagValue::Float(
                f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64,
            ))
        }
        CIP_TYPE_LREAL => {
            need(8)?;
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[..8]);
            Ok(TagValue::Float(f64::from_le_bytes(b)))
        }
        other => Err(DriverError::ReadFailed(format!(
            "unsupported CIP type 0x{other:04X}"
        ))),
    }
}

/// Driver for CompactLogix controllers (symbolic tag addressing).
pub struct LogixDriver {
    transport: EipTransport,
}

impl LogixDriver {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        LogixDriver {
            transport: EipTransport::new(endpoint, timeout),
        }
    }
}

impl PlcDriver for LogixDriver {
    fn open(&mut self) -> DriverResult<()> {
        self.transport.connect()
    }

    fn close(&mut self) {
        self.transport.disconnect();
    }

    fn connected(&self) -> bool {
        self.transport.connected()
    }

    fn read(&mut self, addresses: &[String]) -> DriverResult<Vec<ReadResult>> {
        if !self.transport.connected() {
            return Err(DriverError::NotConnected);
        }
        let mut results = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Err(e) = validate_logix_address(address) {
                results.push(ReadResult::err(address, e.to_string()));
                continue;
            }
            let request = build_read_tag_request(address);
            let reply = self.transport.send_rr_data(&request)?;
            match parse_read_tag_reply(&reply) {
                Ok(value) => results.push(ReadResult::ok(address, value)),
                Err(e) => results.push(ReadResult::err(address, e.to_string())),
            }
        }
        Ok(results)
    }
}

/// Parsed SLC data-table address, e.g. `N7:0`, `F8:3`, `B3:1`.
#[derive(Debug, PartialEq)]
struct SlcAddress {
    file_type: u8,
    file_number: u8,
    element: u8,
    element_size: u8,
}

fn parse_slc_address(address: &str) -> DriverResult<SlcAddress> {
    let invalid = || DriverError::InvalidAddress(format!("invalid SLC address: {address}"));
    let (file_part, element_part) = address.split_once(':').ok_or_else(invalid)?;
    let mut chars = file_part.chars();
    let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
    let (file_type, element_size) = match letter {
        'O' => (0x82, 2),
        'I' => (0x83, 2),
        'S' => (0x84, 2),
        'B' => (0x85, 2),
        'T' => (0x86, 2),
        'C' => (0x87, 2),
        'N' => (0x89, 2),
        'F' => (0x8A, 4),
        _ => return Err(invalid()),
    };
    let file_number: u8 = chars.as_str().parse().map_err(|_| invalid())?;
    // Bit-level suffixes ("B3:1/4") are not supported; whole words only.
    let element: u8 = element_part.parse().map_err(|_| invalid())?;
    Ok(SlcAddress {
        file_type,
        file_number,
        element,
        element_size,
    })
}

/// PCCC protected typed logical read (cmd 0x0F / fnc 0xA2) wrapped in a
/// CIP Execute PCCC request.
fn build_pccc_read_request(addr: &SlcAddress, tns: u16) -> Vec<u8> {
    let mut cip = Vec::new();
    cip.push(CIP_SERVICE_PCCC_EXECUTE);
    cip.push(0x02); // path size: class + instance
    cip.extend_from_slice(&[0x20, 0x67]); // class: PCCC object
    cip.extend_from_slice(&[0x24, 0x01]); // instance 1
    // Requestor id: length, vendor, serial number.
    cip.push(0x07);
    cip.extend_from_slice(&[0x00, 0x00]);
    cip.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    // PCCC command body.
    cip.push(0x0F); // command
    cip.push(0x00); // status
    cip.extend_from_slice(&tns.to_le_bytes());
    cip.push(0xA2); // protected typed logical read, 3 address fields
    cip.push(addr.element_size);
    cip.push(addr.file_number);
    cip.push(addr.file_type);
    cip.push(addr.element);
    cip.push(0x00); // sub-element
    cip
}

fn parse_pccc_read_reply(reply: &[u8], addr: &SlcAddress) -> DriverResult<TagValue> {
    if reply.len() < 4 {
        return Err(DriverError::ReadFailed("PCCC reply too short".to_string()));
    }
    let general_status = reply[2];
    if general_status != 0 {
        return Err(DriverError::ReadFailed(format!(
            "CIP status 0x{general_status:02X}"
        )));
    }
    // Skip the echoed requestor id (length-prefixed) after the 4-byte
    // service header, then the 4-byte PCCC response header.
    let body = &reply[4..];
    if body.is_empty() {
        return Err(DriverError::ReadFailed("PCCC reply missing body".to_string()));
    }
    let requestor_len = body[0] as usize;
    if body.len() < requestor_len + 4 {
        return Err(DriverError::ReadFailed("PCCC reply truncated".to_string()));
    }
    let pccc = &body[requestor_len..];
    let status = pccc[1];
    if status != 0 {
        return Err(DriverError::ReadFailed(format!("PCCC status 0x{status:02X}")));
    }
    let data = &pccc[4..];
    if data.len() < addr.element_size as usize {
        return Err(DriverError::ReadFailed("PCCC data too short".to_string()));
    }
    match addr.element_size {
        4 => Ok(TagValue::Float(
            f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64,
        )),
        _ => Ok(TagValue::Int(i16::from_le_bytes([data[0], data[1]]) as i64)),
    }
}

/// Driver for SLC 5/05 controllers (data-table file/word addressing).
pub struct SlcDriver {
    transport: EipTransport,
    tns: u16,
}

impl SlcDriver {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        SlcDriver {
            transport: EipTransport::new(endpoint, timeout),
            tns: 0,
        }
    }
}

impl PlcDriver for SlcDriver {
    fn open(&mut self) -> DriverResult<()> {
        self.transport.connect()
    }

    fn close(&mut self) {
        self.transport.disconnect();
    }

    fn connected(&self) -> bool {
        self.transport.connected()
    }

    fn read(&mut self, addresses: &[String]) -> DriverResult<Vec<ReadResult>> {
        if !self.transport.connected() {
            return Err(DriverError::NotConnected);
        }
        let mut results = Vec::with_capacity(addresses.len());
        for address in addresses {
            let parsed = match parse_slc_address(address) {
                Ok(p) => p,
                Err(e) => {
                    results.push(ReadResult::err(address, e.to_string()));
                    continue;
                }
            };
            self.tns = self.tns.wrapping_add(1);
            let request = build_pccc_read_request(&parsed, self.tns);
            let reply = self.transport.send_rr_data(&request)?;
            match parse_pccc_read_reply(&reply, &parsed) {
                Ok(value) => results.push(ReadResult::ok(address, value)),
                Err(e) => results.push(ReadResult::err(address, e.to_string())),
            }
        }
        Ok(results)
    }
}

pub struct LogixDriverFactory {
    pub endpoint: Option<String>,
    pub socket_timeout: Duration,
}

impl DriverFactory for LogixDriverFactory {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>> {
        let endpoint = self.endpoint.clone().ok_or_else(|| {
            DriverError::ConnectionFailed("no CompactLogix address configured".to_string())
        })?;
        Ok(Box::new(LogixDriver::new(endpoint, self.socket_timeout)))
    }
}

pub struct SlcDriverFactory {
    pub endpoint: Option<String>,
    pub socket_timeout: Duration,
}

impl DriverFactory for SlcDriverFactory {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>> {
        let endpoint = self.endpoint.clone().ok_or_else(|| {
            DriverError::ConnectionFailed("no SLC 5/05 address configured".to_string())
        })?;
        Ok(Box::new(SlcDriver::new(endpoint, self.socket_timeout)))
    }
}
