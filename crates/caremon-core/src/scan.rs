//! Device discovery and scanning.
//!
//! A scan listens for a bounded window, de-duplicates what it saw by device
//! identifier and optionally keeps only devices carrying a fingerprint
//! (serial number or hardware id).

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use caremon_types::uuids::{DEVICE_NAME_PREFIX, HEALTH_SERVICE, MANUFACTURER_ID};

use crate::error::{Error, Result};
use crate::radio::{Advertisement, Radio};
use crate::util::{hex_lower, normalize_fingerprint};

/// Default scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Information about a discovered wearable.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    /// Connection identifier.
    pub id: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Strongest recent RSSI.
    pub rssi: Option<i16>,
    /// Whether the advertisement looks like a caremon wearable.
    pub is_wearable: bool,
    /// Raw manufacturer payload under the caremon company ID, if any.
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to listen for advertisements.
    pub window: Duration,
    /// Without a fingerprint, only return devices that look like wearables.
    pub wearables_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCAN_WINDOW,
            wearables_only: true,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan window.
    #[must_use]
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Return every device seen, not just wearables.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.wearables_only = false;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::invalid_config("scan window must be > 0"));
        }
        Ok(())
    }
}

/// Scan for devices, returning matches de-duplicated by identifier.
///
/// When `fingerprint` is given, a device matches if the normalized
/// fingerprint occurs in its advertised name, identifier, manufacturer
/// payload or service payload. The scan ends when the window elapses or
/// `cancel` fires; an empty result is not an error.
#[tracing::instrument(level = "info", skip(radio, options, cancel), fields(window = ?options.window))]
pub async fn scan_devices(
    radio: &dyn Radio,
    options: &ScanOptions,
    fingerprint: Option<&str>,
    cancel: CancellationToken,
) -> Result<Vec<DiscoveredDevice>> {
    options.validate()?;

    let observed = radio.scan(options.window, cancel).await?;
    let fingerprint = fingerprint
        .map(normalize_fingerprint)
        .filter(|fp| !fp.is_empty());

    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Advertisement> = HashMap::new();
    for adv in observed {
        match merged.get_mut(&adv.id) {
            Some(existing) => merge_advertisement(existing, adv),
            None => {
                order.push(adv.id.clone());
                merged.insert(adv.id.clone(), adv);
            }
        }
    }

    let mut discovered = Vec::new();
    for id in order {
        let Some(adv) = merged.remove(&id) else {
            continue;
        };

        let is_wearable = is_wearable(&adv);
        let keep = match &fingerprint {
            Some(fp) => matches_fingerprint(&adv, fp),
            None => is_wearable || !options.wearables_only,
        };
        if !keep {
            debug!(device_id = %adv.id, "Skipping non-matching device");
            continue;
        }

        discovered.push(DiscoveredDevice {
            manufacturer_data: adv.manufacturer_data.get(&MANUFACTURER_ID).cloned(),
            id: adv.id,
            name: adv.name,
            rssi: adv.rssi,
            is_wearable,
        });
    }

    info!("Scan complete. Found {} device(s)", discovered.len());
    Ok(discovered)
}

/// Fold a later advertisement for the same device into an earlier one.
fn merge_advertisement(existing: &mut Advertisement, later: Advertisement) {
    if later.name.is_some() {
        existing.name = later.name;
    }
    if later.rssi.is_some() {
        existing.rssi = later.rssi;
    }
    existing.manufacturer_data.extend(later.manufacturer_data);
    existing.service_data.extend(later.service_data);
    for service in later.services {
        if !existing.services.contains(&service) {
            existing.services.push(service);
        }
    }
}

/// Whether an advertisement carries the (already normalized) fingerprint.
pub fn matches_fingerprint(adv: &Advertisement, normalized: &str) -> bool {
    let found_in = |candidate: &str| normalize_fingerprint(candidate).contains(normalized);
    let found_in_payload =
        |bytes: &[u8]| found_in(&String::from_utf8_lossy(bytes)) || hex_lower(bytes).contains(normalized);

    adv.name.as_deref().is_some_and(found_in)
        || found_in(&adv.id)
        || adv.manufacturer_data.values().any(|p| found_in_payload(p))
        || adv.service_data.values().any(|p| found_in_payload(p))
}

/// Check if an advertisement looks like a caremon wearable.
fn is_wearable(adv: &Advertisement) -> bool {
    if adv.manufacturer_data.contains_key(&MANUFACTURER_ID) {
        return true;
    }

    if adv.services.contains(&HEALTH_SERVICE) || adv.service_data.contains_key(&HEALTH_SERVICE) {
        return true;
    }

    adv.name
        .as_deref()
        .is_some_and(|name| name.to_lowercase().contains(&DEVICE_NAME_PREFIX.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;

    fn adv(id: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_matches_name_case_and_hyphens() {
        let device = adv("AA:BB:CC:DD:EE:01", Some("CareMonitor SN123456"));
        assert!(matches_fingerprint(&device, &normalize_fingerprint("sn-123456")));
        assert!(!matches_fingerprint(&device, &normalize_fingerprint("SN999")));
    }

    #[test]
    fn test_fingerprint_matches_identifier() {
        let device = adv("AA:BB:CC:DD:EE:01", None);
        assert!(matches_fingerprint(&device, &normalize_fingerprint("ee:01")));
    }

    #[test]
    fn test_fingerprint_matches_manufacturer_payload() {
        let mut device = adv("id-1", Some("Watch"));
        device
            .manufacturer_data
            .insert(MANUFACTURER_ID, b"SN123456".to_vec());
        assert!(matches_fingerprint(&device, "sn123456"));

        let mut binary = adv("id-2", None);
        binary.service_data.insert(HEALTH_SERVICE, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches_fingerprint(&binary, "deadbeef"));
    }

    #[tokio::test]
    async fn test_scan_deduplicates_and_filters() {
        let radio = MockRadio::builder()
            .advertisement(adv("dev-1", Some("CareMonitor SN123456")))
            .advertisement(adv("dev-2", Some("Headphones")))
            .advertisement(Advertisement {
                rssi: Some(-40),
                ..adv("dev-1", None)
            })
            .build();

        let found = scan_devices(&radio, &ScanOptions::default(), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dev-1");
        assert_eq!(found[0].name.as_deref(), Some("CareMonitor SN123456"));
        assert_eq!(found[0].rssi, Some(-40));
    }

    #[tokio::test]
    async fn test_scan_with_fingerprint_ignores_wearable_filter() {
        let radio = MockRadio::builder()
            .advertisement(adv("dev-1", Some("CareMonitor SN000001")))
            .advertisement(adv("dev-2", Some("Generic SN123456")))
            .build();

        let found = scan_devices(
            &radio,
            &ScanOptions::default(),
            Some("sn-123456"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dev-2");
    }

    #[tokio::test]
    async fn test_scan_empty_is_ok() {
        let radio = MockRadio::builder().build();
        let found = scan_devices(&radio, &ScanOptions::default(), Some("x"), CancellationToken::new())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(ScanOptions::new().window(Duration::ZERO).validate().is_err());
    }
}
