use serde::Serialize;
use serde_json::{Map, Value};

pub mod custom;
pub mod scheduler;
pub mod system;

/// Payload of one collection tick, published as UTF-8 JSON. Built-in
/// sections that failed to sample are omitted entirely; custom probe
/// failures are reported inline under their own key.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub hostname: String,
    pub ip: String,
    /// Local wall clock, `%Y-%m-%dT%H:%M:%S`, no timezone suffix
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuStats {
    /// Percent busy since the previous sample, one decimal
    pub usage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub usage: f64,
    pub total: u64,
    pub used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub capacity: u64,
    pub used: u64,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Disk {
    pub id: String,
    pub status: DiskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Normal,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    /// Bytes sent per second since the previous sample
    pub upload: u64,
    pub download: u64,
}

/// Seam between the scheduler and the OS. The production implementation
/// reads procfs/sysfs; tests substitute fixed values.
pub trait SystemSampler: Send {
    fn sample(&mut self) -> Telemetry;
}

#[cfg(test)]
mod test {
    use super::*;

    const CANONICAL: &str = concat!(
        "{\"hostname\":\"NAS-Server\",\"ip\":\"192.168.1.100\",\"timestamp\":\"2023-12-01T22:58:00\",",
        "\"cpu\":{\"usage\":35.5,\"temperature\":45.2},",
        "\"memory\":{\"usage\":67.8,\"total\":17179869184,\"used\":11659091968},",
        "\"storage\":{\"capacity\":32000000000000,\"used\":18000000000000,",
        "\"disks\":[{\"id\":\"hdd1\",\"status\":\"normal\"},{\"id\":\"hdd3\",\"status\":\"warning\"},{\"id\":\"hdd5\",\"status\":\"error\"}]},",
        "\"network\":{\"upload\":2812000,\"download\":9400000}}",
    );

    fn canonical_telemetry() -> Telemetry {
        Telemetry {
            hostname: "NAS-Server".into(),
            ip: "192.168.1.100".into(),
            timestamp: "2023-12-01T22:58:00".into(),
            cpu: Some(CpuStats {
                usage: 35.5,
                temperature: Some(45.2),
            }),
            memory: Some(MemoryStats {
                usage: 67.8,
                total: 17179869184,
                used: 11659091968,
                temperature: None,
            }),
            storage: Some(StorageStats {
                capacity: 32000000000000,
                used: 18000000000000,
                disks: vec![
                    Disk {
                        id: "hdd1".into(),
                        status: DiskStatus::Normal,
                    },
                    Disk {
                        id: "hdd3".into(),
                        status: DiskStatus::Warning,
                    },
                    Disk {
                        id: "hdd5".into(),
                        status: DiskStatus::Error,
                    },
                ],
            }),
            network: Some(NetworkStats {
                upload: 2812000,
                download: 9400000,
            }),
            custom: None,
        }
    }

    #[test]
    fn canonical_payload_matches_golden_example() {
        let serialized = serde_json::to_string(&canonical_telemetry()).unwrap();

        let ours: Value = serde_json::from_str(&serialized).unwrap();
        let golden: Value = serde_json::from_str(CANONICAL).unwrap();
        assert_eq!(ours, golden);

        // re-serializing either value sorts the keys, and the results
        // agree byte for byte
        assert_eq!(ours.to_string(), golden.to_string());
    }

    #[test]
    fn failed_builtin_sections_are_omitted() {
        let mut telemetry = canonical_telemetry();
        telemetry.cpu = None;
        telemetry.network = None;

        let value: Value = serde_json::to_value(&telemetry).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("cpu"));
        assert!(!object.contains_key("network"));
        assert!(object.contains_key("memory"));
    }

    #[test]
    fn custom_entries_serialize_under_their_names() {
        let mut telemetry = canonical_telemetry();
        let mut custom = Map::new();
        custom.insert(
            "fan_speed".into(),
            serde_json::json!({"value": 1200, "unit": "rpm", "type": "file"}),
        );
        custom.insert(
            "broken".into(),
            serde_json::json!({"error": "command timed out"}),
        );
        telemetry.custom = Some(custom);

        let value: Value = serde_json::to_value(&telemetry).unwrap();
        assert_eq!(value["custom"]["fan_speed"]["value"], 1200);
        assert_eq!(value["custom"]["broken"]["error"], "command timed out");
    }
}
