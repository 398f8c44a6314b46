/// Advertisement record decoding
///
/// Raw advertising payloads are a sequence of AD structures, each laid out as
/// `[length][ad_type][data...]` where `length` covers the type byte and data.
/// The engine treats the decoded record as opaque except for the fields that
/// scan filters inspect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB);

/// System ID characteristic, carried as service data by some beacons
pub const SYSTEM_ID_UUID16: u16 = 0x2A23;

const AD_FLAGS: u8 = 0x01;
const AD_UUID16_PARTIAL: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_PARTIAL: u8 = 0x04;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_PARTIAL: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_LOCAL_NAME_SHORT: u8 = 0x08;
const AD_LOCAL_NAME_COMPLETE: u8 = 0x09;
const AD_TX_POWER_LEVEL: u8 = 0x0A;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Expand a 16-bit assigned number into a full 128-bit UUID
pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number into a full 128-bit UUID
pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Parse a little-endian 2, 4 or 16 byte UUID as it appears on air
pub fn parse_uuid_le(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => Some(uuid_from_u32(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        16 => {
            let mut be = [0u8; 16];
            for (i, b) in bytes.iter().rev().enumerate() {
                be[i] = *b;
            }
            Some(Uuid::from_bytes(be))
        }
        _ => None,
    }
}

/// Decoded advertising payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Advertising flags, if present
    pub advertise_flags: Option<u8>,
    /// Advertised service UUIDs (16/32-bit values expanded to 128-bit)
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by service UUID
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Transmit power level in dBm
    pub tx_power_level: Option<i8>,
    /// Shortened or complete local name
    pub device_name: Option<String>,
    /// The raw payload exactly as received
    pub bytes: Vec<u8>,
}

impl ScanRecord {
    /// Decode a raw advertising payload.
    ///
    /// A truncated or zero-length structure stops decoding; whatever was decoded
    /// before it is kept. The raw bytes are always retained.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut record = ScanRecord {
            bytes: bytes.to_vec(),
            ..Default::default()
        };

        let mut i = 0;
        while i < bytes.len() {
            let length = bytes[i] as usize;
            if length == 0 || i + length >= bytes.len() {
                break;
            }
            let ad_type = bytes[i + 1];
            let data = &bytes[i + 2..i + 1 + length];
            record.apply(ad_type, data);
            i += 1 + length;
        }

        record
    }

    fn apply(&mut self, ad_type: u8, data: &[u8]) {
        match ad_type {
            AD_FLAGS => self.advertise_flags = data.first().copied(),
            AD_UUID16_PARTIAL | AD_UUID16_COMPLETE => self.push_uuids(data, 2),
            AD_UUID32_PARTIAL | AD_UUID32_COMPLETE => self.push_uuids(data, 4),
            AD_UUID128_PARTIAL | AD_UUID128_COMPLETE => self.push_uuids(data, 16),
            AD_LOCAL_NAME_SHORT | AD_LOCAL_NAME_COMPLETE => {
                self.device_name = Some(String::from_utf8_lossy(data).into_owned());
            }
            AD_TX_POWER_LEVEL => self.tx_power_level = data.first().map(|b| *b as i8),
            AD_SERVICE_DATA_UUID16 => self.push_service_data(data, 2),
            AD_SERVICE_DATA_UUID32 => self.push_service_data(data, 4),
            AD_SERVICE_DATA_UUID128 => self.push_service_data(data, 16),
            AD_MANUFACTURER_DATA => {
                if data.len() >= 2 {
                    let company = u16::from_le_bytes([data[0], data[1]]);
                    self.manufacturer_data.insert(company, data[2..].to_vec());
                }
            }
            _ => {}
        }
    }

    fn push_uuids(&mut self, data: &[u8], width: usize) {
        for chunk in data.chunks_exact(width) {
            if let Some(uuid) = parse_uuid_le(chunk) {
                self.service_uuids.push(uuid);
            }
        }
    }

    fn push_service_data(&mut self, data: &[u8], width: usize) {
        if data.len() < width {
            return;
        }
        if let Some(uuid) = parse_uuid_le(&data[..width]) {
            self.service_data.insert(uuid, data[width..].to_vec());
        }
    }

    /// Service data advertised for `uuid`
    pub fn service_data_for(&self, uuid: &Uuid) -> Option<&[u8]> {
        self.service_data.get(uuid).map(Vec::as_slice)
    }

    /// Manufacturer data advertised for `company_id`
    pub fn manufacturer_data_for(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data.get(&company_id).map(Vec::as_slice)
    }

    /// Hex encoded System ID (0x2A23 service data), most significant byte first
    pub fn system_id(&self) -> Option<String> {
        let data = self.service_data_for(&uuid_from_u16(SYSTEM_ID_UUID16))?;
        if data.is_empty() {
            return None;
        }
        let reversed: Vec<u8> = data.iter().rev().copied().collect();
        Some(hex::encode(reversed))
    }
}
