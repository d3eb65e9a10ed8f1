use crate::bus::Bus;
use crate::constants::{MODEL_OFFSET, VERSION_OFFSET};
use crate::error::BusError;
use crate::packet::Id;
use crate::transport::Transport;
use std::fmt;
use tracing::{info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Id ranges searched by [`Scanner::scan`], as `(start_id, count)`.
pub const DEFAULT_SCAN_RANGES: [(u8, usize); 2] = [(0, 32), (100, 32)];

/// A device that answered a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSummary {
    pub id: Id,
    pub model: u16,
    pub version: u8,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {:3} Model: {:5} Version: {:5}",
            self.id.value(),
            self.model,
            self.version
        )
    }
}

/// Finds devices by pinging id ranges, then reads each one's model and version.
pub struct Scanner<'a, T> {
    bus: &'a mut Bus<T>,
    devices: Vec<DeviceSummary>,
}

impl<'a, T: Transport> Scanner<'a, T> {
    pub fn new(bus: &'a mut Bus<T>) -> Self {
        Self {
            bus,
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceSummary] {
        &self.devices
    }

    /// Scans [`DEFAULT_SCAN_RANGES`].
    pub async fn scan(&mut self) -> Result<Vec<DeviceSummary>, BusError> {
        self.devices.clear();
        for (start_id, count) in DEFAULT_SCAN_RANGES {
            self.scan_range(start_id, count).await?;
        }
        if self.devices.is_empty() {
            info!("No devices found");
        } else {
            info!("Scan done");
        }
        Ok(self.devices.clone())
    }

    /// Scans `count` ids starting at `start_id`, adding what it finds to
    /// [`Self::devices`].
    pub async fn scan_range(&mut self, start_id: u8, count: usize) -> Result<(), BusError> {
        if count == 0 {
            return Ok(());
        }
        info!(
            "Scanning IDs from {start_id} to {}",
            (start_id as usize)
                .saturating_add(count - 1)
                .min(Id::BROADCAST.value() as usize - 1)
        );
        let mut found = Vec::new();
        self.bus.scan(start_id, count, |id| found.push(id), |_| {}).await?;

        for id in found {
            // Model and version are adjacent, so one read covers both.
            let data = match self.bus.read(id, MODEL_OFFSET as u8, 3).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("Device {} READ failed: {e}", id.value());
                    continue;
                }
            };
            let Some(summary) = summarize(id, &data) else {
                warn!("Device {} returned {} bytes for model/version", id.value(), data.len());
                continue;
            };
            info!("  {summary}");
            self.devices.push(summary);
        }
        Ok(())
    }
}

fn summarize(id: Id, data: &[u8]) -> Option<DeviceSummary> {
    let model = data.get(MODEL_OFFSET..MODEL_OFFSET + 2)?;
    Some(DeviceSummary {
        id,
        model: u16::from_le_bytes([model[0], model[1]]),
        version: *data.get(VERSION_OFFSET)?,
    })
}
