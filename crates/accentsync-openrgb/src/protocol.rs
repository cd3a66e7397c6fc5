//! OpenRGB SDK wire protocol: packet framing and controller-data parsing.
//!
//! Every packet on the wire is a 16-byte header followed by a payload:
//!
//! ```text
//! ┌────────────┬──────────────────┬───────────────┬─────────────────┐
//! │ "ORGB"     │ device index u32 │ packet id u32 │ payload len u32 │
//! └────────────┴──────────────────┴───────────────┴─────────────────┘
//! ```
//!
//! All integers are little-endian. Replies echo the request's device index
//! and packet id, which is what the client uses to correlate them.

use tokio::io::{AsyncRead, AsyncReadExt};

use accentsync_core::prelude::*;
use accentsync_core::Color;

/// Magic bytes at the start of every packet header.
pub const MAGIC: [u8; 4] = *b"ORGB";

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 16;

/// Highest SDK protocol version this client speaks.
///
/// Version 4 adds segment data inside zone descriptions; negotiation caps the
/// version at 3 so [`Controller::parse`] never sees segments. Raising this
/// requires extending the zone parser first.
pub const CLIENT_PROTOCOL_VERSION: u32 = 3;

/// Upper bound on a sane payload length. Anything larger is treated as a
/// corrupt header rather than an allocation request.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Packet ids for the subset of the SDK surface this client speaks.
pub mod packet_id {
    /// Reply payload: `u32` controller count.
    pub const REQUEST_CONTROLLER_COUNT: u32 = 0;
    /// Request payload: `u32` negotiated protocol version (empty for 0).
    /// Reply payload: controller data blob.
    pub const REQUEST_CONTROLLER_DATA: u32 = 1;
    /// Request payload: `u32` client version. Reply payload: `u32` server
    /// version. Servers predating version 1 never answer.
    pub const REQUEST_PROTOCOL_VERSION: u32 = 40;
    /// Request payload: UTF-8 name bytes plus NUL. No reply.
    pub const SET_CLIENT_NAME: u32 = 50;
    /// Server to client, unsolicited, no payload.
    pub const DEVICE_LIST_UPDATED: u32 = 100;
    /// Request payload: `u32` data size, `u16` color count, 4 bytes per
    /// color. No reply.
    pub const UPDATE_LEDS: u32 = 1050;
    /// Header only; the device index selects the controller. No reply.
    pub const SET_CUSTOM_MODE: u32 = 1100;
}

// ---------------------------------------------------------------------------
// Packet header
// ---------------------------------------------------------------------------

/// The fixed 16-byte header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub device_index: u32,
    pub packet_id: u32,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(device_index: u32, packet_id: u32, payload_len: u32) -> Self {
        Self {
            device_index,
            packet_id,
            payload_len,
        }
    }

    /// Serialize the header to its wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.device_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.packet_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the buffer is short, the magic does not match,
    /// or the payload length exceeds [`MAX_PAYLOAD_LEN`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::protocol(format!(
                "packet header truncated: {} of {} bytes",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(Error::protocol(format!(
                "bad packet magic: {:02x?}",
                &bytes[0..4]
            )));
        }
        let device_index = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let packet_id = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let payload_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::protocol(format!(
                "payload length {} exceeds limit",
                payload_len
            )));
        }
        Ok(Self {
            device_index,
            packet_id,
            payload_len,
        })
    }
}

/// Build a complete frame: header plus payload.
pub fn frame(device_index: u32, packet_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader::new(device_index, packet_id, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Read one complete packet (header + payload) from `reader`.
///
/// # Errors
///
/// IO errors from the reader (including EOF mid-packet) and
/// [`Error::Protocol`] for a corrupt header.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(PacketHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = PacketHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((header, payload))
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// Build a RequestProtocolVersion frame announcing `client_version`.
pub fn request_protocol_version(client_version: u32) -> Vec<u8> {
    frame(
        0,
        packet_id::REQUEST_PROTOCOL_VERSION,
        &client_version.to_le_bytes(),
    )
}

/// Build a SetClientName frame. The name is sent NUL-terminated.
pub fn set_client_name(name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 1);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    frame(0, packet_id::SET_CLIENT_NAME, &payload)
}

/// Build a RequestControllerCount frame.
pub fn request_controller_count() -> Vec<u8> {
    frame(0, packet_id::REQUEST_CONTROLLER_COUNT, &[])
}

/// Build a RequestControllerData frame for `device_index`.
///
/// Protocol 1 and later include the negotiated version in the payload so the
/// server serializes the blob at the version both sides understand; version 0
/// sends an empty payload.
pub fn request_controller_data(device_index: u32, protocol_version: u32) -> Vec<u8> {
    if protocol_version >= 1 {
        frame(
            device_index,
            packet_id::REQUEST_CONTROLLER_DATA,
            &protocol_version.to_le_bytes(),
        )
    } else {
        frame(device_index, packet_id::REQUEST_CONTROLLER_DATA, &[])
    }
}

/// Build an UpdateLeds frame painting `led_count` LEDs with `color`.
///
/// Payload layout: `u32` data size (including itself), `u16` color count,
/// then one `(r, g, b, 0)` quad per LED.
pub fn update_leds(device_index: u32, color: Color, led_count: u32) -> Vec<u8> {
    let count = led_count as usize;
    let data_size = (4 + 2 + count * 4) as u32;

    let mut payload = Vec::with_capacity(data_size as usize);
    payload.extend_from_slice(&data_size.to_le_bytes());
    payload.extend_from_slice(&(led_count as u16).to_le_bytes());
    for _ in 0..count {
        payload.extend_from_slice(&[color.r, color.g, color.b, 0]);
    }
    frame(device_index, packet_id::UPDATE_LEDS, &payload)
}

/// Build a SetCustomMode frame for `device_index`.
pub fn set_custom_mode(device_index: u32) -> Vec<u8> {
    frame(device_index, packet_id::SET_CUSTOM_MODE, &[])
}

// ---------------------------------------------------------------------------
// Controller data blob
// ---------------------------------------------------------------------------

/// Cursor over a controller-data payload with truncation-checked reads.
pub struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left unread.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "controller blob truncated at byte {}: wanted {} more, have {}",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    /// Read a length-prefixed string: `u16` length including the trailing
    /// NUL, then that many bytes. Non-UTF-8 bytes are replaced, never fatal.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let mut bytes = self.take(len)?;
        if bytes.last() == Some(&0) {
            bytes = &bytes[..bytes.len() - 1];
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read one `(r, g, b, _)` color quad.
    pub fn read_color(&mut self) -> Result<Color> {
        let b = self.take(4)?;
        Ok(Color::new(b[0], b[1], b[2]))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }
}

/// One lighting mode of a controller.
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: String,
    pub value: i32,
    pub flags: u32,
    pub speed_min: u32,
    pub speed_max: u32,
    /// Present for protocol 3 and later.
    pub brightness_min: Option<u32>,
    pub brightness_max: Option<u32>,
    pub colors_min: u32,
    pub colors_max: u32,
    pub speed: u32,
    pub brightness: Option<u32>,
    pub direction: u32,
    pub color_mode: u32,
    pub colors: Vec<Color>,
}

/// One LED zone of a controller.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    pub zone_type: i32,
    pub leds_min: u32,
    pub leds_max: u32,
    pub leds_count: u32,
    /// `(height, width)` when the zone carries a matrix map.
    pub matrix: Option<(u32, u32)>,
}

/// One LED of a controller.
#[derive(Debug, Clone)]
pub struct Led {
    pub name: String,
    pub value: u32,
}

/// A controller description as returned by RequestControllerData.
#[derive(Debug, Clone)]
pub struct Controller {
    pub device_type: i32,
    pub name: String,
    /// Present for protocol 1 and later.
    pub vendor: Option<String>,
    pub description: String,
    pub version: String,
    pub serial: String,
    pub location: String,
    pub active_mode: i32,
    pub modes: Vec<Mode>,
    pub zones: Vec<Zone>,
    pub leds: Vec<Led>,
    pub colors: Vec<Color>,
}

impl Controller {
    /// Parse a controller blob serialized at `protocol_version`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] on truncation or on a size field the payload
    /// cannot satisfy. Callers treat a failed parse as "skip this device",
    /// not a fatal condition.
    pub fn parse(payload: &[u8], protocol_version: u32) -> Result<Controller> {
        let mut r = BlobReader::new(payload);

        // Leading total-size field; the framing already bounds the payload.
        let _data_size = r.read_u32()?;

        let device_type = r.read_i32()?;
        let name = r.read_string()?;
        let vendor = if protocol_version >= 1 {
            Some(r.read_string()?)
        } else {
            None
        };
        let description = r.read_string()?;
        let version = r.read_string()?;
        let serial = r.read_string()?;
        let location = r.read_string()?;

        let mode_count = r.read_u16()?;
        let active_mode = r.read_i32()?;
        let mut modes = Vec::with_capacity(mode_count as usize);
        for _ in 0..mode_count {
            modes.push(Self::parse_mode(&mut r, protocol_version)?);
        }

        let zone_count = r.read_u16()?;
        let mut zones = Vec::with_capacity(zone_count as usize);
        for _ in 0..zone_count {
            zones.push(Self::parse_zone(&mut r)?);
        }

        let led_count = r.read_u16()?;
        let mut leds = Vec::with_capacity(led_count as usize);
        for _ in 0..led_count {
            let name = r.read_string()?;
            let value = r.read_u32()?;
            leds.push(Led { name, value });
        }

        let color_count = r.read_u16()?;
        let mut colors = Vec::with_capacity(color_count as usize);
        for _ in 0..color_count {
            colors.push(r.read_color()?);
        }

        Ok(Controller {
            device_type,
            name,
            vendor,
            description,
            version,
            serial,
            location,
            active_mode,
            modes,
            zones,
            leds,
            colors,
        })
    }

    fn parse_mode(r: &mut BlobReader<'_>, protocol_version: u32) -> Result<Mode> {
        let name = r.read_string()?;
        let value = r.read_i32()?;
        let flags = r.read_u32()?;
        let speed_min = r.read_u32()?;
        let speed_max = r.read_u32()?;
        let (brightness_min, brightness_max) = if protocol_version >= 3 {
            (Some(r.read_u32()?), Some(r.read_u32()?))
        } else {
            (None, None)
        };
        let colors_min = r.read_u32()?;
        let colors_max = r.read_u32()?;
        let speed = r.read_u32()?;
        let brightness = if protocol_version >= 3 {
            Some(r.read_u32()?)
        } else {
            None
        };
        let direction = r.read_u32()?;
        let color_mode = r.read_u32()?;
        let color_count = r.read_u16()?;
        let mut colors = Vec::with_capacity(color_count as usize);
        for _ in 0..color_count {
            colors.push(r.read_color()?);
        }
        Ok(Mode {
            name,
            value,
            flags,
            speed_min,
            speed_max,
            brightness_min,
            brightness_max,
            colors_min,
            colors_max,
            speed,
            brightness,
            direction,
            color_mode,
            colors,
        })
    }

    fn parse_zone(r: &mut BlobReader<'_>) -> Result<Zone> {
        let name = r.read_string()?;
        let zone_type = r.read_i32()?;
        let leds_min = r.read_u32()?;
        let leds_max = r.read_u32()?;
        let leds_count = r.read_u32()?;
        let matrix_len = r.read_u16()? as usize;
        let matrix = if matrix_len > 0 {
            let height = r.read_u32()?;
            let width = r.read_u32()?;
            // The map entries are per-cell LED indices; nothing here needs
            // them, so they are skipped rather than materialized. Both
            // dimensions come off the wire: the skip length is computed in
            // u64 and bounded by the blob before use.
            let map_bytes = (height as u64)
                .checked_mul(width as u64)
                .and_then(|cells| cells.checked_mul(4))
                .filter(|&bytes| bytes <= r.remaining() as u64)
                .ok_or_else(|| {
                    Error::protocol(format!(
                        "zone matrix {}x{} does not fit the controller blob",
                        height, width
                    ))
                })?;
            r.skip(map_bytes as usize)?;
            Some((height, width))
        } else {
            None
        };
        Ok(Zone {
            name,
            zone_type,
            leds_min,
            leds_max,
            leds_count,
            matrix,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
