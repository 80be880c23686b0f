//! JSON-lines audit trail of alarm activity, one file per camera per day.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{
    alarm::AlarmKind,
    alert::{AlertEvent, AlertHandler},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Severity {
    High,
    Info,
    Warning,
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    camera_id: &'a str,
    alarm_type: AlarmKind,
    event: &'static str,
    severity: Severity,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plc: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

pub struct AuditLog {
    dir: PathBuf,
    throttle: Duration,
    last_raise: HashMap<(String, AlarmKind), DateTime<Utc>>,
}

impl AuditLog {
    /// Raises for the same camera and alarm closer together than `throttle`
    /// (by event time) are not written. Clears and delivery failures always are.
    pub fn new(dir: impl Into<PathBuf>, throttle: Duration) -> Self {
        Self {
            dir: dir.into(),
            throttle,
            last_raise: HashMap::new(),
        }
    }

    /// `<dir>/<YYYYMMDD>/alerts_<camera>_<YYYYMMDD>.log` for the local day of `at`.
    pub fn path_for(&self, camera: &str, at: DateTime<Utc>) -> PathBuf {
        let day = at.with_timezone(&Local).format("%Y%m%d").to_string();
        self.dir
            .join(&day)
            .join(format!("alerts_{}_{day}.log", sanitize(camera)))
    }

    fn throttled(&mut self, camera: &str, kind: AlarmKind, at: DateTime<Utc>) -> bool {
        let key = (camera.to_string(), kind);
        if let Some(last) = self.last_raise.get(&key) {
            if (at - *last).to_std().is_ok_and(|gap| gap < self.throttle) {
                return true;
            }
        }
        self.last_raise.insert(key, at);
        false
    }

    pub fn record(&mut self, event: &AlertEvent) -> io::Result<bool> {
        let entry = match event {
            AlertEvent::Transition(t) if t.current => {
                if self.throttled(&t.camera, t.kind, t.at) {
                    return Ok(false);
                }
                AuditEntry {
                    timestamp: t.at,
                    camera_id: &t.camera,
                    alarm_type: t.kind,
                    event: "raised",
                    severity: Severity::High,
                    description: match t.kind {
                        AlarmKind::Person => format!("{} person(s) in restricted zone", t.metric),
                        AlarmKind::Coal => format!("coal covers {:.1}% of zone", t.metric * 100.0),
                    },
                    metric: Some(t.metric),
                    plc: None,
                    address: None,
                }
            }
            AlertEvent::Transition(t) => AuditEntry {
                timestamp: t.at,
                camera_id: &t.camera,
                alarm_type: t.kind,
                event: "cleared",
                severity: Severity::Info,
                description: format!("{} alarm cleared", t.kind),
                metric: Some(t.metric),
                plc: None,
                address: None,
            },
            AlertEvent::DeliveryFailure(f) => AuditEntry {
                timestamp: f.at,
                camera_id: &f.camera,
                alarm_type: f.kind,
                event: "delivery_failure",
                severity: Severity::Warning,
                description: format!(
                    "could not set alarm bit to {}: {}",
                    u8::from(f.desired),
                    f.reason
                ),
                metric: None,
                plc: Some(&f.link),
                address: Some(f.address.to_string()),
            },
        };
        let path = self.path_for(entry.camera_id, entry.timestamp);
        append_line(&path, &entry)?;
        Ok(true)
    }
}

impl AlertHandler for AuditLog {
    fn handle(&mut self, event: &AlertEvent) {
        if let Err(err) = self.record(event) {
            warn!(camera = %event.camera(), "failed to write audit entry: {err}");
        }
    }
}

fn append_line(path: &Path, entry: &impl Serialize) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

/// Keep camera ids usable as file name components.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use plc_link::BitAddress;

    use super::*;
    use crate::alert::{AlarmTransition, DeliveryFailure};

    fn transition(current: bool, at: DateTime<Utc>) -> AlertEvent {
        AlertEvent::Transition(AlarmTransition {
            camera: "cam 1".into(),
            kind: AlarmKind::Person,
            previous: !current,
            current,
            metric: 2.0,
            at,
            frame: None,
            roi: Vec::new(),
        })
    }

    fn lines(log: &AuditLog, at: DateTime<Utc>) -> Vec<serde_json::Value> {
        fs::read_to_string(log.path_for("cam 1", at))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn raises_are_throttled_clears_are_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path(), Duration::from_secs(5));
        let t0 = Utc::now();

        assert!(log.record(&transition(true, t0)).unwrap());
        assert!(log.record(&transition(false, t0 + TimeDelta::seconds(1))).unwrap());
        assert!(!log.record(&transition(true, t0 + TimeDelta::seconds(2))).unwrap());
        assert!(log.record(&transition(true, t0 + TimeDelta::seconds(6))).unwrap());

        let entries = lines(&log, t0);
        let events: Vec<_> = entries.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(events, ["raised", "cleared", "raised"]);
        assert_eq!(entries[0]["camera_id"], "cam 1");
        assert_eq!(entries[0]["alarm_type"], "person");
        assert!(log.path_for("cam 1", t0).to_string_lossy().contains("alerts_cam_1_"));
    }

    #[test]
    fn delivery_failures_carry_the_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::new(dir.path(), Duration::from_secs(5));
        let at = Utc::now();
        for _ in 0..2 {
            log.record(&AlertEvent::DeliveryFailure(DeliveryFailure {
                camera: "cam 1".into(),
                kind: AlarmKind::Coal,
                link: "plc1".into(),
                address: BitAddress::new(300, 6, 1).unwrap(),
                desired: true,
                reason: "PLC link is disconnected".into(),
                at,
            }))
            .unwrap();
        }
        let entries = lines(&log, at);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["address"], "DB300.DBX6.1");
        assert_eq!(entries[0]["severity"], "warning");
    }
}
