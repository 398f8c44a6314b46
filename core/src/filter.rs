/// Scan filters
///
/// A filter is a conjunction of optional criteria over a sighting. A list of
/// filters is OR-combined, and an empty list matches every sighting so that an
/// unfiltered bulk scan is just a client with no filters.

use crate::record::ScanRecord;
use crate::sighting::Sighting;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building a filter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Mask length {mask} does not match data length {data}")]
    MaskLengthMismatch { data: usize, mask: usize },
    #[error("Mask given without the value it applies to: {0}")]
    MaskWithoutValue(&'static str),
}

/// Predicate description over a sighting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    device_address: Option<String>,
    device_name: Option<String>,
    service_uuid: Option<Uuid>,
    service_uuid_mask: Option<Uuid>,
    service_data_uuid: Option<Uuid>,
    service_data: Option<Vec<u8>>,
    service_data_mask: Option<Vec<u8>>,
    manufacturer_id: Option<u16>,
    manufacturer_data: Option<Vec<u8>>,
    manufacturer_data_mask: Option<Vec<u8>>,
}

impl ScanFilter {
    /// Start building a filter
    pub fn builder() -> ScanFilterBuilder {
        ScanFilterBuilder::default()
    }

    pub fn device_address(&self) -> Option<&str> {
        self.device_address.as_deref()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn service_uuid(&self) -> Option<Uuid> {
        self.service_uuid
    }

    pub fn manufacturer_id(&self) -> Option<u16> {
        self.manufacturer_id
    }

    /// True when no criterion is set
    pub fn is_empty(&self) -> bool {
        *self == ScanFilter::default()
    }

    /// Check a sighting against every criterion of this filter
    pub fn matches(&self, sighting: &Sighting) -> bool {
        if let Some(address) = &self.device_address {
            if !address.eq_ignore_ascii_case(&sighting.address) {
                return false;
            }
        }

        let record = &sighting.record;

        if let Some(name) = &self.device_name {
            if record.device_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }

        if let Some(uuid) = &self.service_uuid {
            if !matches_service_uuid(uuid, self.service_uuid_mask.as_ref(), record) {
                return false;
            }
        }

        if let (Some(uuid), Some(pattern)) = (&self.service_data_uuid, &self.service_data) {
            let data = record.service_data_for(uuid);
            if !matches_partial_data(pattern, self.service_data_mask.as_deref(), data) {
                return false;
            }
        }

        if let (Some(id), Some(pattern)) = (self.manufacturer_id, &self.manufacturer_data) {
            let data = record.manufacturer_data_for(id);
            if !matches_partial_data(pattern, self.manufacturer_data_mask.as_deref(), data) {
                return false;
            }
        }

        true
    }
}

/// OR-combine `filters` against a sighting. An empty slice matches everything.
pub fn matches_any(filters: &[ScanFilter], sighting: &Sighting) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(sighting))
}

fn matches_service_uuid(uuid: &Uuid, mask: Option<&Uuid>, record: &ScanRecord) -> bool {
    let mask = mask.map(Uuid::as_u128).unwrap_or(u128::MAX);
    let wanted = uuid.as_u128() & mask;
    record
        .service_uuids
        .iter()
        .any(|candidate| candidate.as_u128() & mask == wanted)
}

// Prefix comparison: the advertised data may be longer than the pattern.
fn matches_partial_data(pattern: &[u8], mask: Option<&[u8]>, data: Option<&[u8]>) -> bool {
    let data = match data {
        Some(data) if data.len() >= pattern.len() => data,
        _ => return false,
    };
    match mask {
        None => data[..pattern.len()] == *pattern,
        Some(mask) => pattern
            .iter()
            .zip(mask)
            .zip(data)
            .all(|((p, m), d)| p & m == d & m),
    }
}

/// Builder with validation for `ScanFilter`
#[derive(Debug, Clone, Default)]
pub struct ScanFilterBuilder {
    filter: ScanFilter,
}

impl ScanFilterBuilder {
    pub fn device_address(mut self, address: impl Into<String>) -> Self {
        self.filter.device_address = Some(address.into());
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.filter.device_name = Some(name.into());
        self
    }

    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.filter.service_uuid = Some(uuid);
        self
    }

    /// Bits set in `mask` take part in the comparison
    pub fn service_uuid_mask(mut self, mask: Uuid) -> Self {
        self.filter.service_uuid_mask = Some(mask);
        self
    }

    pub fn service_data(mut self, uuid: Uuid, data: Vec<u8>) -> Self {
        self.filter.service_data_uuid = Some(uuid);
        self.filter.service_data = Some(data);
        self
    }

    pub fn service_data_mask(mut self, mask: Vec<u8>) -> Self {
        self.filter.service_data_mask = Some(mask);
        self
    }

    pub fn manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.filter.manufacturer_id = Some(company_id);
        self.filter.manufacturer_data = Some(data);
        self
    }

    pub fn manufacturer_data_mask(mut self, mask: Vec<u8>) -> Self {
        self.filter.manufacturer_data_mask = Some(mask);
        self
    }

    /// Validate and produce the filter
    pub fn build(self) -> Result<ScanFilter, FilterError> {
        let f = &self.filter;

        if f.service_uuid_mask.is_some() && f.service_uuid.is_none() {
            return Err(FilterError::MaskWithoutValue("service_uuid"));
        }
        check_mask(f.service_data.as_deref(), f.service_data_mask.as_deref(), "service_data")?;
        check_mask(
            f.manufacturer_data.as_deref(),
            f.manufacturer_data_mask.as_deref(),
            "manufacturer_data",
        )?;

        Ok(self.filter)
    }
}

fn check_mask(data: Option<&[u8]>, mask: Option<&[u8]>, field: &'static str) -> Result<(), FilterError> {
    match (data, mask) {
        (None, Some(_)) => Err(FilterError::MaskWithoutValue(field)),
        (Some(data), Some(mask)) if data.len() != mask.len() => Err(FilterError::MaskLengthMismatch {
            data: data.len(),
            mask: mask.len(),
        }),
        _ => Ok(()),
    }
}
