//! S7comm over ISO-on-TCP (RFC 1006).
//!
//! Every packet is a TPKT header, a COTP header, and for data transfer an S7
//! PDU. Only the pieces needed for bit-level alarm output are implemented:
//! connection setup, PDU negotiation, and single-item read/write of data block
//! memory.

use std::{
    io::{Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use link_core::AbortHandle;
use tracing::debug;

use crate::{
    address::BitAddress,
    error::PlcError,
    transport::{PlcConnector, PlcTransport},
};

pub const ISO_TCP_PORT: u16 = 102;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;

const COTP_CONNECTION_REQUEST: u8 = 0xE0;
const COTP_CONNECTION_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;
/// COTP data header: length indicator, PDU type, last-data-unit flag.
const COTP_DATA_HEADER: [u8; 3] = [0x02, COTP_DATA, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP_COMMUNICATION: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

const AREA_DATA_BLOCK: u8 = 0x84;
const SYNTAX_S7ANY: u8 = 0x10;
const VAR_SPEC: u8 = 0x12;

const TRANSPORT_BIT: u8 = 0x01;
const TRANSPORT_BYTE: u8 = 0x02;
const DATA_SIZE_BIT: u8 = 0x03;
const DATA_SIZE_BYTE: u8 = 0x04;

const RETURN_SUCCESS: u8 = 0xFF;

pub const DEFAULT_PDU_SIZE: u16 = 480;

fn tpkt(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + TPKT_HEADER_LEN) as u16;
    let mut packet = Vec::with_capacity(len as usize);
    packet.extend_from_slice(&[TPKT_VERSION, 0x00]);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// COTP connection request addressed to the CPU in `rack`/`slot`.
pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    let remote_tsap = (rack & 0x07) * 0x20 + (slot & 0x1F);
    tpkt(&[
        0x11, // length indicator
        COTP_CONNECTION_REQUEST,
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // local TSAP
        0xC2, 0x02, 0x01, remote_tsap, // remote TSAP, PG connection
    ])
}

fn s7_job(pdu_ref: u16, param: &[u8], data: &[u8]) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(COTP_DATA_HEADER.len() + JOB_HEADER_LEN + param.len() + data.len());
    payload.extend_from_slice(&COTP_DATA_HEADER);
    payload.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    payload.extend_from_slice(&pdu_ref.to_be_bytes());
    payload.extend_from_slice(&(param.len() as u16).to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(param);
    payload.extend_from_slice(data);
    tpkt(&payload)
}

pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let size = pdu_size.to_be_bytes();
    s7_job(
        pdu_ref,
        &[
            FN_SETUP_COMMUNICATION,
            0x00,
            0x00, 0x01, // max parallel jobs calling
            0x00, 0x01, // max parallel jobs called
            size[0], size[1],
        ],
        &[],
    )
}

fn item_spec(transport: u8, count: u16, db: u16, bit_offset: u32) -> [u8; 12] {
    let count = count.to_be_bytes();
    let db = db.to_be_bytes();
    let offset = bit_offset.to_be_bytes();
    [
        VAR_SPEC,
        0x0A,
        SYNTAX_S7ANY,
        transport,
        count[0],
        count[1],
        db[0],
        db[1],
        AREA_DATA_BLOCK,
        offset[1],
        offset[2],
        offset[3],
    ]
}

pub fn read_bit_request(pdu_ref: u16, address: BitAddress) -> Vec<u8> {
    let mut param = vec![FN_READ_VAR, 0x01];
    param.extend_from_slice(&item_spec(TRANSPORT_BIT, 1, address.db, address.bit_offset()));
    s7_job(pdu_ref, &param, &[])
}

pub fn read_byte_request(pdu_ref: u16, db: u16, byte: u32) -> Vec<u8> {
    let mut param = vec![FN_READ_VAR, 0x01];
    param.extend_from_slice(&item_spec(TRANSPORT_BYTE, 1, db, byte * 8));
    s7_job(pdu_ref, &param, &[])
}

pub fn write_bit_request(pdu_ref: u16, address: BitAddress, value: bool) -> Vec<u8> {
    let mut param = vec![FN_WRITE_VAR, 0x01];
    param.extend_from_slice(&item_spec(TRANSPORT_BIT, 1, address.db, address.bit_offset()));
    let data = [0x00, DATA_SIZE_BIT, 0x00, 0x01, u8::from(value)];
    s7_job(pdu_ref, &param, &data)
}

/// Parsed S7 acknowledgement carrying parameters and data.
#[derive(Debug)]
pub struct AckData<'a> {
    pub pdu_ref: u16,
    pub param: &'a [u8],
    pub data: &'a [u8],
}

fn protocol(msg: impl Into<String>) -> PlcError {
    PlcError::Protocol(msg.into())
}

fn check_tpkt(frame: &[u8]) -> Result<(), PlcError> {
    if frame.len() < TPKT_HEADER_LEN + 2 || frame[0] != TPKT_VERSION {
        return Err(protocol("malformed TPKT header"));
    }
    let declared = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(protocol(format!(
            "TPKT length {declared} does not match packet size {}",
            frame.len()
        )));
    }
    Ok(())
}

pub fn parse_connection_confirm(frame: &[u8]) -> Result<(), PlcError> {
    check_tpkt(frame)?;
    if frame[5] != COTP_CONNECTION_CONFIRM {
        return Err(PlcError::Rejected(format!(
            "connection refused (COTP PDU type 0x{:02X})",
            frame[5]
        )));
    }
    Ok(())
}

pub fn parse_ack(frame: &[u8]) -> Result<AckData<'_>, PlcError> {
    check_tpkt(frame)?;
    let cotp_len = frame[4] as usize + 1;
    if frame[5] != COTP_DATA {
        return Err(protocol(format!("unexpected COTP PDU type 0x{:02X}", frame[5])));
    }
    let s7 = frame
        .get(TPKT_HEADER_LEN + cotp_len..)
        .ok_or_else(|| protocol("truncated COTP header"))?;
    if s7.len() < ACK_HEADER_LEN || s7[0] != S7_PROTOCOL_ID {
        return Err(protocol("missing S7 header"));
    }
    if s7[1] != ROSCTR_ACK_DATA && s7[1] != ROSCTR_ACK {
        return Err(protocol(format!("unexpected S7 message type 0x{:02X}", s7[1])));
    }

    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0 || error_code != 0 {
        return Err(PlcError::Rejected(format!(
            "error class 0x{error_class:02X}, code 0x{error_code:02X}"
        )));
    }

    let body = &s7[ACK_HEADER_LEN..];
    if body.len() < param_len + data_len {
        return Err(protocol("S7 parameter/data section truncated"));
    }
    Ok(AckData {
        pdu_ref,
        param: &body[..param_len],
        data: &body[param_len..param_len + data_len],
    })
}

/// Returns the PDU size granted by the controller.
pub fn parse_setup_response(ack: &AckData<'_>) -> Result<u16, PlcError> {
    match ack.param {
        [FN_SETUP_COMMUNICATION, _, _, _, _, _, hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(protocol("malformed setup communication response")),
    }
}

fn return_code_reason(code: u8) -> &'static str {
    match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown return code",
    }
}

/// Returns the payload bytes of a single-item read.
pub fn parse_read_response<'a>(ack: &AckData<'a>) -> Result<&'a [u8], PlcError> {
    if ack.param.first() != Some(&FN_READ_VAR) {
        return Err(protocol("response is not a read reply"));
    }
    let data = ack.data;
    let [code, size, hi, lo, payload @ ..] = data else {
        return Err(protocol("read reply data truncated"));
    };
    if *code != RETURN_SUCCESS {
        return Err(PlcError::Rejected(format!(
            "read failed: {} (0x{code:02X})",
            return_code_reason(*code)
        )));
    }
    let length = u16::from_be_bytes([*hi, *lo]) as usize;
    let byte_len = match *size {
        // Bit items carry one byte per bit.
        DATA_SIZE_BIT => length,
        // Length is given in bits for byte/word items.
        DATA_SIZE_BYTE => length.div_ceil(8),
        _ => length,
    };
    payload
        .get(..byte_len)
        .ok_or_else(|| protocol("read reply payload truncated"))
}

pub fn parse_write_response(ack: &AckData<'_>) -> Result<(), PlcError> {
    if ack.param.first() != Some(&FN_WRITE_VAR) {
        return Err(protocol("response is not a write reply"));
    }
    match ack.data.first() {
        Some(&RETURN_SUCCESS) => Ok(()),
        Some(&code) => Err(PlcError::Rejected(format!(
            "write failed: {} (0x{code:02X})",
            return_code_reason(code)
        ))),
        None => Err(protocol("write reply data missing")),
    }
}

/// Read one complete TPKT packet.
pub fn read_packet(reader: &mut impl Read) -> Result<Vec<u8>, PlcError> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    reader.read_exact(&mut header)?;
    if header[0] != TPKT_VERSION {
        return Err(protocol(format!("bad TPKT version 0x{:02X}", header[0])));
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_HEADER_LEN + 2 {
        return Err(protocol(format!("TPKT length {len} too short")));
    }
    let mut packet = vec![0u8; len];
    packet[..TPKT_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut packet[TPKT_HEADER_LEN..])?;
    Ok(packet)
}

/// Connects to an S7 CPU over ISO-on-TCP.
#[derive(Clone, Debug)]
pub struct S7Connector {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub io_timeout: Duration,
}

impl S7Connector {
    pub fn new(host: impl Into<String>, rack: u8, slot: u8) -> Self {
        Self {
            host: host.into(),
            port: ISO_TCP_PORT,
            rack,
            slot,
            io_timeout: Duration::from_secs(2),
        }
    }

    fn open_stream(&self) -> Result<TcpStream, PlcError> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.io_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => PlcError::Communication(err),
            None => PlcError::InvalidAddress(format!("{} did not resolve", self.host)),
        })
    }
}

impl PlcConnector for S7Connector {
    fn connect(&self) -> Result<Box<dyn PlcTransport>, PlcError> {
        let stream = self.open_stream()?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;

        let mut transport = S7Transport {
            stream,
            pdu_ref: 0,
            pdu_size: DEFAULT_PDU_SIZE,
        };
        transport.stream.write_all(&connection_request(self.rack, self.slot))?;
        parse_connection_confirm(&read_packet(&mut transport.stream)?)?;

        let pdu_ref = transport.next_ref();
        let reply = transport.exchange(&setup_communication(pdu_ref, DEFAULT_PDU_SIZE))?;
        let ack = transport.check_ack(&reply, pdu_ref)?;
        transport.pdu_size = parse_setup_response(&ack)?;
        debug!(
            plc = %self.describe(),
            pdu_size = transport.pdu_size,
            "S7 session established"
        );
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!(
            "s7://{}:{} rack {} slot {}",
            self.host, self.port, self.rack, self.slot
        )
    }
}

pub struct S7Transport {
    stream: TcpStream,
    pdu_ref: u16,
    pdu_size: u16,
}

impl S7Transport {
    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, PlcError> {
        self.stream.write_all(request)?;
        read_packet(&mut self.stream)
    }

    fn check_ack<'a>(&self, reply: &'a [u8], pdu_ref: u16) -> Result<AckData<'a>, PlcError> {
        let ack = parse_ack(reply)?;
        if ack.pdu_ref != pdu_ref {
            return Err(protocol(format!(
                "reply for PDU {} while waiting for {pdu_ref}",
                ack.pdu_ref
            )));
        }
        Ok(ack)
    }

    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }
}

impl PlcTransport for S7Transport {
    fn read_bit(&mut self, address: BitAddress) -> Result<bool, PlcError> {
        let pdu_ref = self.next_ref();
        let reply = self.exchange(&read_bit_request(pdu_ref, address))?;
        let ack = self.check_ack(&reply, pdu_ref)?;
        let payload = parse_read_response(&ack)?;
        Ok(payload.first().is_some_and(|b| b & 0x01 != 0))
    }

    fn read_byte(&mut self, db: u16, byte: u32) -> Result<u8, PlcError> {
        let pdu_ref = self.next_ref();
        let reply = self.exchange(&read_byte_request(pdu_ref, db, byte))?;
        let ack = self.check_ack(&reply, pdu_ref)?;
        parse_read_response(&ack)?
            .first()
            .copied()
            .ok_or_else(|| protocol("empty read reply"))
    }

    fn write_bit(&mut self, address: BitAddress, value: bool) -> Result<(), PlcError> {
        let pdu_ref = self.next_ref();
        let reply = self.exchange(&write_bit_request(pdu_ref, address, value))?;
        let ack = self.check_ack(&reply, pdu_ref)?;
        parse_write_response(&ack)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let stream = self.stream.try_clone().ok()?;
        Some(Arc::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
