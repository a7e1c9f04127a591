//! IEEE 1588-2019 grandmaster transmit path.
//!
//! The grandmaster only ever talks: two-step Sync + Follow_Up once per
//! second and Announce every two seconds, multicast to 224.0.1.129.
//! Received PTP traffic (delay requests, foreign announces) is out of
//! scope here; the encode layer is kept free of sockets so it can be
//! tested byte-for-byte.

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::net::UdpSocket;

use crate::traits::TimePublisher;

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_PRIMARY_MULTICAST: &str = "224.0.1.129";

const HEADER_SIZE: usize = 34;
const SYNC_SIZE: usize = 44;
const ANNOUNCE_SIZE: usize = 64;

// Message types (transportSpecific nibble zero).
const MSG_SYNC: u8 = 0x0;
const MSG_FOLLOW_UP: u8 = 0x8;
const MSG_ANNOUNCE: u8 = 0xB;

// Control field values kept for v1 hardware compatibility.
const CTRL_SYNC: u8 = 0;
const CTRL_FOLLOW_UP: u8 = 2;
const CTRL_OTHER: u8 = 5;

// flagField: twoStepFlag in octet 0; PTP timescale in octet 1.
const FLAG0_TWO_STEP: u8 = 0x02;
const FLAG1_PTP_TIMESCALE: u8 = 0x08;
const FLAG1_UTC_OFF_VALID: u8 = 0x04;

// clockClass per table 4 of the standard.
const CLASS_GPS_LOCKED: u8 = 6;
const CLASS_HOLDOVER: u8 = 7;
const ACCURACY_100NS: u8 = 0x21;
const ACCURACY_UNKNOWN: u8 = 0xFE;
const TIME_SOURCE_GPS: u8 = 0x20;

/// EUI-64 clock identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// Standard EUI-48 to EUI-64 expansion (ff:fe in the middle).
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([
            mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5],
        ])
    }

    /// Fallback identity for interfaces without a readable MAC.
    pub fn random() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let bytes = uuid.as_bytes();
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        ClockIdentity(id)
    }
}

/// Static per-port announcement parameters.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub identity: ClockIdentity,
    pub domain: u8,
    pub priority1: u8,
    pub priority2: u8,
    /// TAI-UTC offset advertised in Announce (37 s as of 2017).
    pub current_utc_offset: i16,
    /// Announce cadence in ticks (seconds).
    pub announce_interval_ticks: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            identity: ClockIdentity([0; 8]),
            domain: 0,
            priority1: 128,
            priority2: 128,
            current_utc_offset: 37,
            announce_interval_ticks: 2,
        }
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn write_header(
    buf: &mut [u8],
    msg_type: u8,
    length: u16,
    cfg: &PortConfig,
    flags0: u8,
    sequence_id: u16,
    control: u8,
    log_interval: i8,
) {
    buf[0] = msg_type & 0x0F;
    buf[1] = 0x12; // versionPTP 2, minorVersionPTP 1 (IEEE 1588-2019)
    BigEndian::write_u16(&mut buf[2..4], length);
    buf[4] = cfg.domain;
    buf[5] = 0; // minorSdoId
    buf[6] = flags0;
    buf[7] = FLAG1_PTP_TIMESCALE | FLAG1_UTC_OFF_VALID;
    // correctionField (8..16) and messageTypeSpecific (16..20) stay zero.
    buf[20..28].copy_from_slice(&cfg.identity.0);
    BigEndian::write_u16(&mut buf[28..30], 1); // portNumber
    BigEndian::write_u16(&mut buf[30..32], sequence_id);
    buf[32] = control;
    buf[33] = log_interval as u8;
}

/// 48-bit seconds + 32-bit nanoseconds.
fn write_timestamp(buf: &mut [u8], seconds: u64, nanoseconds: u32) {
    BigEndian::write_u16(&mut buf[0..2], (seconds >> 32) as u16);
    BigEndian::write_u32(&mut buf[2..6], seconds as u32);
    BigEndian::write_u32(&mut buf[6..10], nanoseconds);
}

/// Two-step Sync: origin timestamp zero, twoStepFlag set.
pub fn encode_sync(cfg: &PortConfig, sequence_id: u16) -> [u8; SYNC_SIZE] {
    let mut buf = [0u8; SYNC_SIZE];
    write_header(
        &mut buf,
        MSG_SYNC,
        SYNC_SIZE as u16,
        cfg,
        FLAG0_TWO_STEP,
        sequence_id,
        CTRL_SYNC,
        0,
    );
    buf
}

pub fn encode_follow_up(
    cfg: &PortConfig,
    sequence_id: u16,
    seconds: u64,
    nanoseconds: u32,
) -> [u8; SYNC_SIZE] {
    let mut buf = [0u8; SYNC_SIZE];
    write_header(
        &mut buf,
        MSG_FOLLOW_UP,
        SYNC_SIZE as u16,
        cfg,
        0,
        sequence_id,
        CTRL_FOLLOW_UP,
        0,
    );
    write_timestamp(&mut buf[HEADER_SIZE..], seconds, nanoseconds);
    buf
}

pub fn encode_announce(cfg: &PortConfig, sequence_id: u16, healthy: bool) -> [u8; ANNOUNCE_SIZE] {
    let mut buf = [0u8; ANNOUNCE_SIZE];
    write_header(
        &mut buf,
        MSG_ANNOUNCE,
        ANNOUNCE_SIZE as u16,
        cfg,
        0,
        sequence_id,
        CTRL_OTHER,
        1,
    );

    let body = &mut buf[HEADER_SIZE..];
    // originTimestamp (10 bytes) is permitted to be zero.
    BigEndian::write_i16(&mut body[10..12], cfg.current_utc_offset);
    // body[12] reserved
    body[13] = cfg.priority1;
    body[14] = if healthy { CLASS_GPS_LOCKED } else { CLASS_HOLDOVER };
    body[15] = if healthy { ACCURACY_100NS } else { ACCURACY_UNKNOWN };
    BigEndian::write_u16(&mut body[16..18], 0xFFFF); // offsetScaledLogVariance
    body[18] = cfg.priority2;
    body[19..27].copy_from_slice(&cfg.identity.0);
    BigEndian::write_u16(&mut body[27..29], 0); // stepsRemoved
    body[29] = TIME_SOURCE_GPS;
    buf
}

// ============================================================================
// PORT
// ============================================================================

/// The transmit-only grandmaster port over the two multicast sockets.
pub struct PtpPort {
    cfg: PortConfig,
    event: UdpSocket,
    general: UdpSocket,
    sync_seq: u16,
    announce_seq: u16,
    ticks: u64,
}

impl PtpPort {
    pub fn new(cfg: PortConfig, event: UdpSocket, general: UdpSocket) -> Self {
        PtpPort {
            cfg,
            event,
            general,
            sync_seq: 0,
            announce_seq: 0,
            ticks: 0,
        }
    }
}

impl TimePublisher for PtpPort {
    fn publish_tick(&mut self, utc_sec: u64, utc_ns: u32, healthy: bool) -> Result<()> {
        let event_dst = (PTP_PRIMARY_MULTICAST, PTP_EVENT_PORT);
        let general_dst = (PTP_PRIMARY_MULTICAST, PTP_GENERAL_PORT);

        let sync = encode_sync(&self.cfg, self.sync_seq);
        self.event.send_to(&sync, event_dst)?;

        // Two-step: the precise origin time rides in the Follow_Up.
        let follow_up = encode_follow_up(&self.cfg, self.sync_seq, utc_sec, utc_ns);
        self.general.send_to(&follow_up, general_dst)?;
        self.sync_seq = self.sync_seq.wrapping_add(1);

        if self.ticks % self.cfg.announce_interval_ticks == 0 {
            let announce = encode_announce(&self.cfg, self.announce_seq, healthy);
            self.general.send_to(&announce, general_dst)?;
            self.announce_seq = self.announce_seq.wrapping_add(1);
            debug!(
                "[PTP] announce #{} class={}",
                self.announce_seq,
                if healthy { CLASS_GPS_LOCKED } else { CLASS_HOLDOVER }
            );
        }
        self.ticks += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
