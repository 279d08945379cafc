// ── Sensor frame codec ──
//
// Pure decoding of the binary sensor packet. Both entry points are total:
// malformed input yields `None`, never a panic.
//
// Layout (little-endian):
//   0..2    start marker 5A 5A
//   2..8    48-bit device id
//   8       sample count `sn`
//   9..13   u32 seconds
//   13..15  u16 milliseconds
//   15..    sn x i32 pressure, then 3 x f32 mag, gyro, acc
//   last 2  end marker A5 A5

use serde::Serialize;

pub const START_MARKER: [u8; 2] = [0x5A, 0x5A];
pub const END_MARKER: [u8; 2] = [0xA5, 0xA5];

/// Fixed header preceding the pressure samples.
pub const HEADER_LEN: usize = 15;
const IMU_LEN: usize = 36;
const END_LEN: usize = 2;
/// Shortest possible frame (`sn = 0`).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + IMU_LEN + END_LEN;

const DN_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// One decoded sensor packet.
///
/// Serializes to the parsed-topic document
/// `{ts, dn, sn, p, mag, gyro, acc}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorFrame {
    pub ts: f64,
    pub dn: String,
    pub sn: u8,
    pub p: Vec<i32>,
    pub mag: [f32; 3],
    pub gyro: [f32; 3],
    pub acc: [f32; 3],
}

/// Header fields readable without validating the whole packet.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub dn: String,
    pub ts: Option<f64>,
}

/// Total length a frame with `sn` samples must have.
pub fn expected_len(sn: u8) -> usize {
    HEADER_LEN + 4 * usize::from(sn) + IMU_LEN + END_LEN
}

/// Read the device id and, when present, the timestamp.
///
/// Only the start marker and the 15-byte header are required; the tail
/// may be truncated.
pub fn peek_metadata(packet: &[u8]) -> Option<FrameMetadata> {
    if packet.len() < HEADER_LEN || !packet.starts_with(&START_MARKER) {
        return None;
    }
    Some(FrameMetadata {
        dn: read_dn(packet)?,
        ts: read_timestamp(packet),
    })
}

/// Fully decode and validate a frame.
pub fn parse(packet: &[u8]) -> Option<SensorFrame> {
    if packet.len() < MIN_FRAME_LEN
        || !packet.starts_with(&START_MARKER)
        || !packet.ends_with(&END_MARKER)
    {
        return None;
    }

    let sn = *packet.get(8)?;
    if packet.len() < expected_len(sn) {
        return None;
    }

    let pressure_end = HEADER_LEN + 4 * usize::from(sn);
    let p = (HEADER_LEN..pressure_end)
        .step_by(4)
        .map(|offset| read_i32(packet, offset))
        .collect::<Option<Vec<_>>>()?;

    Some(SensorFrame {
        ts: read_timestamp(packet)?,
        dn: read_dn(packet)?,
        sn,
        p,
        mag: read_vec3(packet, pressure_end)?,
        gyro: read_vec3(packet, pressure_end + 12)?,
        acc: read_vec3(packet, pressure_end + 24)?,
    })
}

/// Render a 48-bit id as 12 uppercase hex digits.
pub fn format_dn(value: u64) -> String {
    format!("{:012X}", value & DN_MASK)
}

// ── Field readers ────────────────────────────────────────────────

fn read_dn(packet: &[u8]) -> Option<String> {
    let raw = packet.get(2..8)?;
    let mut wide = [0u8; 8];
    wide[..6].copy_from_slice(raw);
    Some(format_dn(u64::from_le_bytes(wide)))
}

fn read_timestamp(packet: &[u8]) -> Option<f64> {
    let secs = u32::from_le_bytes(packet.get(9..13)?.try_into().ok()?);
    let millis = u16::from_le_bytes(packet.get(13..15)?.try_into().ok()?);
    Some(f64::from(secs) + f64::from(millis) / 1000.0)
}

fn read_i32(packet: &[u8], offset: usize) -> Option<i32> {
    Some(i32::from_le_bytes(
        packet.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn read_f32(packet: &[u8], offset: usize) -> Option<f32> {
    Some(f32::from_le_bytes(
        packet.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn read_vec3(packet: &[u8], offset: usize) -> Option<[f32; 3]> {
    Some([
        read_f32(packet, offset)?,
        read_f32(packet, offset + 4)?,
        read_f32(packet, offset + 8)?,
    ])
}
