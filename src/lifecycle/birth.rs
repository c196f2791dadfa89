//! Device inventory and the lifecycle payload shapes built from it

use crate::config::DeviceOptions;
use crate::payload::{Payload, Position};
use chrono::Utc;
use std::time::Instant;

pub const UPTIME: &str = "uptime";
pub const DISPLAY_NAME: &str = "display_name";
pub const MODEL_NAME: &str = "model_name";
pub const MODEL_ID: &str = "model_id";
pub const PART_NUMBER: &str = "part_number";
pub const SERIAL_NUMBER: &str = "serial_number";
pub const AVAILABLE_PROCESSORS: &str = "available_processors";
pub const TOTAL_MEMORY: &str = "total_memory";
pub const FIRMWARE_VERSION: &str = "firmware_version";
pub const BIOS_VERSION: &str = "bios_version";
pub const OS: &str = "os";
pub const OS_VERSION: &str = "os_version";
pub const OS_ARCH: &str = "os_arch";
pub const APPLICATION_FRAMEWORK: &str = "application_framework";
pub const APPLICATION_FRAMEWORK_VERSION: &str = "application_framework_version";
pub const CONNECTION_INTERFACE: &str = "connection_interface";
pub const CONNECTION_IP: &str = "connection_ip";
pub const ACCEPT_ENCODING: &str = "accept_encoding";
pub const APPLICATION_IDS: &str = "application_ids";
pub const MODEM_IMEI: &str = "modem_imei";
pub const MODEM_IMSI: &str = "modem_imsi";
pub const MODEM_ICCID: &str = "modem_iccid";
pub const MODEM_RSSI: &str = "modem_rssi";
pub const PAYLOAD_ENCODING: &str = "payload_encoding";
pub const TAMPER_STATUS: &str = "tamper_status";
pub const EXTENDED_PROPERTIES: &str = "extended_properties";

const FRAMEWORK_NAME: &str = "cloudlink";

/// Cellular modem identity reported once the modem is ready
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemIdentity {
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub rssi: Option<String>,
}

impl ModemIdentity {
    /// At least one identifier is present and is not the modem's error marker
    pub fn is_meaningful(&self) -> bool {
        [&self.imei, &self.imsi, &self.iccid]
            .into_iter()
            .flatten()
            .any(|value| !value.is_empty() && !value.eq_ignore_ascii_case("ERROR"))
    }
}

/// Everything the birth certificate reports about the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProfile {
    pub uptime_ms: u64,
    pub display_name: String,
    pub model_name: Option<String>,
    pub model_id: Option<String>,
    pub part_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub bios_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub os_arch: Option<String>,
    pub available_processors: Option<usize>,
    pub total_memory: Option<String>,
    pub application_framework: Option<String>,
    pub application_framework_version: Option<String>,
    pub connection_interface: Option<String>,
    pub connection_ip: Option<String>,
    pub modem: ModemIdentity,
    pub tamper_status: Option<String>,
    pub extended_properties: Option<String>,
    pub position: Option<Position>,
}

/// Source of the device inventory
pub trait DeviceInfoProvider: Send + Sync {
    fn profile(&self) -> DeviceProfile;
}

/// Inventory assembled from configuration and the host environment
#[derive(Debug, Clone)]
pub struct ConfiguredDevice {
    options: DeviceOptions,
    started: Instant,
}

impl ConfiguredDevice {
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            options,
            started: Instant::now(),
        }
    }
}

impl DeviceInfoProvider for ConfiguredDevice {
    fn profile(&self) -> DeviceProfile {
        let options = &self.options;
        DeviceProfile {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            display_name: options.display_name.clone(),
            model_name: options.model_name.clone(),
            model_id: options.model_id.clone(),
            part_number: options.part_number.clone(),
            serial_number: options.serial_number.clone(),
            firmware_version: options.firmware_version.clone(),
            bios_version: options.bios_version.clone(),
            os: Some(std::env::consts::OS.to_string()),
            os_version: None,
            os_arch: Some(std::env::consts::ARCH.to_string()),
            available_processors: std::thread::available_parallelism()
                .ok()
                .map(|n| n.get()),
            total_memory: None,
            application_framework: Some(FRAMEWORK_NAME.to_string()),
            application_framework_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            connection_interface: options.connection_interface.clone(),
            connection_ip: options.connection_ip.clone(),
            ..DeviceProfile::default()
        }
    }
}

/// Connection-level facts added to the birth and app-list certificates
#[derive(Debug, Clone, Copy)]
pub struct BirthContext<'a> {
    pub application_ids: &'a [String],
    pub payload_encoding: &'a str,
    pub accept_encoding: Option<&'a str>,
}

fn put(payload: &mut Payload, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        payload.add_metric(name, value);
    }
}

/// Birth certificate; also the shape of the application-list certificate
pub fn birth_payload(profile: &DeviceProfile, context: &BirthContext<'_>) -> Payload {
    let mut payload = Payload::new().with_timestamp(Utc::now());
    payload.add_metric(UPTIME, profile.uptime_ms.to_string());
    payload.add_metric(DISPLAY_NAME, profile.display_name.as_str());
    put(&mut payload, MODEL_NAME, profile.model_name.as_deref());
    put(&mut payload, MODEL_ID, profile.model_id.as_deref());
    put(&mut payload, PART_NUMBER, profile.part_number.as_deref());
    put(&mut payload, SERIAL_NUMBER, profile.serial_number.as_deref());
    put(&mut payload, FIRMWARE_VERSION, profile.firmware_version.as_deref());
    put(&mut payload, BIOS_VERSION, profile.bios_version.as_deref());
    put(&mut payload, OS, profile.os.as_deref());
    put(&mut payload, OS_VERSION, profile.os_version.as_deref());
    put(&mut payload, OS_ARCH, profile.os_arch.as_deref());
    if let Some(n) = profile.available_processors {
        payload.add_metric(AVAILABLE_PROCESSORS, n.to_string());
    }
    put(&mut payload, TOTAL_MEMORY, profile.total_memory.as_deref());
    put(
        &mut payload,
        APPLICATION_FRAMEWORK,
        profile.application_framework.as_deref(),
    );
    put(
        &mut payload,
        APPLICATION_FRAMEWORK_VERSION,
        profile.application_framework_version.as_deref(),
    );
    put(
        &mut payload,
        CONNECTION_INTERFACE,
        profile.connection_interface.as_deref(),
    );
    put(&mut payload, CONNECTION_IP, profile.connection_ip.as_deref());
    put(&mut payload, ACCEPT_ENCODING, context.accept_encoding);
    payload.add_metric(APPLICATION_IDS, context.application_ids.join(","));
    put(&mut payload, MODEM_IMEI, profile.modem.imei.as_deref());
    put(&mut payload, MODEM_IMSI, profile.modem.imsi.as_deref());
    put(&mut payload, MODEM_ICCID, profile.modem.iccid.as_deref());
    put(&mut payload, MODEM_RSSI, profile.modem.rssi.as_deref());
    payload.add_metric(PAYLOAD_ENCODING, context.payload_encoding);
    put(&mut payload, TAMPER_STATUS, profile.tamper_status.as_deref());
    put(
        &mut payload,
        EXTENDED_PROPERTIES,
        profile.extended_properties.as_deref(),
    );
    payload.position = profile.position.clone();
    payload
}

pub fn disconnect_payload(profile: &DeviceProfile) -> Payload {
    let mut payload = Payload::new().with_timestamp(Utc::now());
    payload.add_metric(UPTIME, profile.uptime_ms.to_string());
    payload.add_metric(DISPLAY_NAME, profile.display_name.as_str());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MetricValue;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            uptime_ms: 1234,
            display_name: "Gateway".to_string(),
            serial_number: Some("SN-1".to_string()),
            tamper_status: Some("NOT_TAMPERED".to_string()),
            ..DeviceProfile::default()
        }
    }

    #[test]
    fn birth_carries_inventory_and_app_ids() {
        let apps = vec!["CONF-V1".to_string(), "DEPLOY-V2".to_string()];
        let payload = birth_payload(
            &profile(),
            &BirthContext {
                application_ids: &apps,
                payload_encoding: "protobuf",
                accept_encoding: None,
            },
        );

        assert_eq!(payload.metric(UPTIME), Some(&MetricValue::from("1234")));
        assert_eq!(payload.metric(SERIAL_NUMBER), Some(&MetricValue::from("SN-1")));
        assert_eq!(
            payload.metric(APPLICATION_IDS),
            Some(&MetricValue::from("CONF-V1,DEPLOY-V2"))
        );
        assert_eq!(
            payload.metric(TAMPER_STATUS),
            Some(&MetricValue::from("NOT_TAMPERED"))
        );
        assert!(payload.metric(MODEL_NAME).is_none());
        assert!(payload.metric(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn disconnect_has_uptime_and_name_only() {
        let payload = disconnect_payload(&profile());
        assert_eq!(payload.metrics.len(), 2);
        assert_eq!(payload.metric(DISPLAY_NAME), Some(&MetricValue::from("Gateway")));
    }

    #[test]
    fn modem_identity_needs_a_real_identifier() {
        let errors = ModemIdentity {
            imei: Some("ERROR".to_string()),
            imsi: Some(String::new()),
            iccid: None,
            rssi: Some("-70".to_string()),
        };
        assert!(!errors.is_meaningful());

        let real = ModemIdentity {
            iccid: Some("8939".to_string()),
            ..errors
        };
        assert!(real.is_meaningful());
    }

    #[test]
    fn configured_device_reports_host_facts() {
        let device = ConfiguredDevice::new(DeviceOptions {
            display_name: "edge".to_string(),
            ..DeviceOptions::default()
        });
        let profile = device.profile();
        assert_eq!(profile.display_name, "edge");
        assert_eq!(profile.os.as_deref(), Some(std::env::consts::OS));
        assert_eq!(profile.application_framework.as_deref(), Some("cloudlink"));
    }
}
