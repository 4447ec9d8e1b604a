//! Fixed-layout counter region read by an external monitoring process.
//!
//! Layout, all integers native-endian:
//!
//! ```text
//! header      i32 version, i32 gateway label len, i32 gateway value len, i32 slot count
//! slots       MAX_SERVICE_SLOTS x { [u8; SLOT_NAME_LEN] name,
//!                                   i32 label offset, i32 label len,
//!                                   i32 value offset, i32 value len }
//! gateway     [u8; LABEL_CAPACITY] labels, [u8; VALUE_CAPACITY] values
//! services    MAX_SERVICE_SLOTS x { labels, values } (pre-reserved)
//! ```
//!
//! Labels are the summary field names joined by `\n`; values are `i64`s in
//! the same order. The region is sized once and never reallocated.

use std::{path::Path, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    bean::{BeanKind, GatewayKind, ServiceKind},
    context::ManagementContext,
};
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const VERSION: i32 = 1;
pub const MAX_SERVICE_SLOTS: usize = 32;
pub const SLOT_NAME_LEN: usize = 64;

const LABEL_CAPACITY: usize = 256;
const MAX_FIELDS: usize = 8;
const VALUE_CAPACITY: usize = MAX_FIELDS * 8;

const HEADER_LEN: usize = 4 * 4;
const SLOT_META_LEN: usize = SLOT_NAME_LEN + 4 * 4;
const BUFFER_PAIR_LEN: usize = LABEL_CAPACITY + VALUE_CAPACITY;

const GATEWAY_LABEL_OFFSET: usize = HEADER_LEN + MAX_SERVICE_SLOTS * SLOT_META_LEN;
const FIRST_SLOT_OFFSET: usize = GATEWAY_LABEL_OFFSET + BUFFER_PAIR_LEN;

pub const REGION_LEN: usize = FIRST_SLOT_OFFSET + MAX_SERVICE_SLOTS * BUFFER_PAIR_LEN;

// -----------------------------------------------------------------------------
// ----- CounterRegion ---------------------------------------------------------

pub struct CounterRegion {
    buf: BytesMut,
    slot_count: usize,
}

// -----------------------------------------------------------------------------
// ----- CounterRegion: Static -------------------------------------------------

impl CounterRegion {
    pub fn new() -> Self {
        let gateway_labels = labels(GatewayKind::SUMMARY_FIELDS);

        let mut buf = BytesMut::with_capacity(REGION_LEN);
        buf.put_i32_ne(VERSION);
        buf.put_i32_ne(gateway_labels.len() as i32);
        buf.put_i32_ne((GatewayKind::SUMMARY_FIELDS.len() * 8) as i32);
        buf.put_i32_ne(0);
        buf.put_bytes(0, REGION_LEN - HEADER_LEN);

        let mut region = Self { buf, slot_count: 0 };
        region.write_at(GATEWAY_LABEL_OFFSET, &gateway_labels);
        region
    }
}

impl Default for CounterRegion {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// ----- CounterRegion: Public -------------------------------------------------

impl CounterRegion {
    /// Claim the next free slot for a service. Slots are never released.
    pub fn register_service(&mut self, name: &str) -> Result<usize, GatewayError> {
        if self.slot_count == MAX_SERVICE_SLOTS {
            return Err(GatewayError::ExportSlotsExhausted {
                max: MAX_SERVICE_SLOTS,
            });
        }

        let slot = self.slot_count;
        let meta = slot_meta_offset(slot);
        let label_offset = slot_label_offset(slot);
        let value_offset = label_offset + LABEL_CAPACITY;
        let service_labels = labels(ServiceKind::SUMMARY_FIELDS);

        let mut name_field = [0u8; SLOT_NAME_LEN];
        let name = truncate(name.as_bytes(), SLOT_NAME_LEN);
        name_field[..name.len()].copy_from_slice(name);

        self.write_at(meta, &name_field);
        self.write_i32(meta + SLOT_NAME_LEN, label_offset as i32);
        self.write_i32(meta + SLOT_NAME_LEN + 4, service_labels.len() as i32);
        self.write_i32(meta + SLOT_NAME_LEN + 8, value_offset as i32);
        self.write_i32(
            meta + SLOT_NAME_LEN + 12,
            (ServiceKind::SUMMARY_FIELDS.len() * 8) as i32,
        );
        self.write_at(label_offset, &service_labels);

        self.slot_count += 1;
        self.write_i32(12, self.slot_count as i32);
        Ok(slot)
    }

    pub fn write_gateway(&mut self, values: &[i64]) {
        self.write_values(GATEWAY_LABEL_OFFSET + LABEL_CAPACITY, values);
    }

    pub fn write_service(&mut self, slot: usize, values: &[i64]) {
        if slot >= self.slot_count {
            return;
        }
        self.write_values(slot_label_offset(slot) + LABEL_CAPACITY, values);
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}

// -----------------------------------------------------------------------------
// ----- CounterRegion: Readers ------------------------------------------------

impl CounterRegion {
    pub fn version(&self) -> i32 {
        self.read_i32(0)
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[offset..offset + 4]);
        i32::from_ne_bytes(raw)
    }

    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[offset..offset + 8]);
        i64::from_ne_bytes(raw)
    }

    pub fn slot_name(&self, slot: usize) -> Option<String> {
        if slot >= self.slot_count {
            return None;
        }
        let meta = slot_meta_offset(slot);
        let raw = &self.buf[meta..meta + SLOT_NAME_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(SLOT_NAME_LEN);
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// `(labels, values)` for a slot, decoded via its metadata entry.
    pub fn slot_counters(&self, slot: usize) -> Option<(Vec<String>, Vec<i64>)> {
        if slot >= self.slot_count {
            return None;
        }
        let meta = slot_meta_offset(slot) + SLOT_NAME_LEN;
        let label_offset = self.read_i32(meta) as usize;
        let label_len = self.read_i32(meta + 4) as usize;
        let value_offset = self.read_i32(meta + 8) as usize;
        let value_len = self.read_i32(meta + 12) as usize;
        Some(self.decode(label_offset, label_len, value_offset, value_len))
    }

    pub fn gateway_counters(&self) -> (Vec<String>, Vec<i64>) {
        let label_len = self.read_i32(4) as usize;
        let value_len = self.read_i32(8) as usize;
        self.decode(
            GATEWAY_LABEL_OFFSET,
            label_len,
            GATEWAY_LABEL_OFFSET + LABEL_CAPACITY,
            value_len,
        )
    }
}

// -----------------------------------------------------------------------------
// ----- CounterRegion: Private ------------------------------------------------

impl CounterRegion {
    fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.write_at(offset, &value.to_ne_bytes());
    }

    fn write_values(&mut self, offset: usize, values: &[i64]) {
        for (i, value) in values.iter().take(MAX_FIELDS).enumerate() {
            self.write_at(offset + i * 8, &value.to_ne_bytes());
        }
    }

    fn decode(
        &self,
        label_offset: usize,
        label_len: usize,
        value_offset: usize,
        value_len: usize,
    ) -> (Vec<String>, Vec<i64>) {
        let labels = String::from_utf8_lossy(&self.buf[label_offset..label_offset + label_len])
            .split('\n')
            .map(str::to_string)
            .collect();
        let values = (0..value_len / 8)
            .map(|i| self.read_i64(value_offset + i * 8))
            .collect();
        (labels, values)
    }
}

// -----------------------------------------------------------------------------
// ----- CounterExporter -------------------------------------------------------

/// Keeps a [`CounterRegion`] in step with the context's beans.
pub struct CounterExporter {
    ctx: Arc<ManagementContext>,
    region: Mutex<CounterRegion>,
    slots: DashMap<String, usize>,
}

impl CounterExporter {
    pub fn new(ctx: Arc<ManagementContext>) -> Self {
        Self {
            ctx,
            region: Mutex::new(CounterRegion::new()),
            slots: DashMap::new(),
        }
    }

    /// Assign slots to services seen for the first time, then copy every
    /// bean's current summary into the region.
    pub fn refresh(&self) {
        let mut region = self.region.lock();

        region.write_gateway(&self.ctx.gateway_bean().summary_values());

        for bean in self.ctx.services() {
            let slot = match self.slots.get(bean.name()).map(|s| *s) {
                Some(slot) => slot,
                None => match region.register_service(bean.name()) {
                    Ok(slot) => {
                        debug!("service '{}' exported in slot {slot}", bean.name());
                        self.slots.insert(bean.name().to_string(), slot);
                        slot
                    }
                    Err(e) => {
                        warn!("not exporting service '{}': {e}", bean.name());
                        continue;
                    }
                },
            };
            region.write_service(slot, &bean.summary_values());
        }
    }

    pub fn slot_of(&self, service: &str) -> Option<usize> {
        self.slots.get(service).map(|s| *s)
    }

    pub fn snapshot(&self) -> Bytes {
        self.region.lock().snapshot()
    }

    pub fn with_region<R>(&self, f: impl FnOnce(&CounterRegion) -> R) -> R {
        f(&self.region.lock())
    }

    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        tokio::fs::write(path, &snapshot).await
    }
}

// -----------------------------------------------------------------------------
// ----- Helpers ---------------------------------------------------------------

fn slot_meta_offset(slot: usize) -> usize {
    HEADER_LEN + slot * SLOT_META_LEN
}

fn slot_label_offset(slot: usize) -> usize {
    FIRST_SLOT_OFFSET + slot * BUFFER_PAIR_LEN
}

fn labels(fields: &[&str]) -> Vec<u8> {
    let joined = fields.join("\n");
    truncate(joined.as_bytes(), LABEL_CAPACITY).to_vec()
}

fn truncate(raw: &[u8], max: usize) -> &[u8] {
    &raw[..raw.len().min(max)]
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
