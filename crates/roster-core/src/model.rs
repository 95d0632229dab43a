//! The synchronized application document.
//!
//! Field names follow the persisted JSON shape (camelCase), so a decoded remote
//! file is human-readable and interchangeable with the cached local copy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of change log entries kept in the document.
pub const MAX_LOG_ENTRIES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShiftType {
    #[serde(rename = "1st Shift")]
    First,
    #[serde(rename = "2nd Shift")]
    Second,
    #[serde(rename = "3rd Shift")]
    Third,
}

impl ShiftType {
    pub fn label(&self) -> &'static str {
        match self {
            ShiftType::First => "1st Shift",
            ShiftType::Second => "2nd Shift",
            ShiftType::Third => "3rd Shift",
        }
    }
}

/// What an employee is doing on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayStatus {
    #[serde(rename = "ASSIGNED TO STORE #")]
    Work,
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "TRAINING")]
    Training,
    #[serde(rename = "PTO")]
    Pto,
    #[serde(rename = "UNPAID")]
    Unpaid,
    #[serde(rename = "CALL OFF")]
    CallOff,
    #[serde(rename = "UNSCHEDULED")]
    Unscheduled,
    #[serde(rename = "LEAVE OF ABSENCE")]
    LeaveOfAbsence,
    #[serde(rename = "BEREAVEMENT")]
    Bereavement,
}

impl DayStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DayStatus::Work => "ASSIGNED TO STORE #",
            DayStatus::Off => "OFF",
            DayStatus::Training => "TRAINING",
            DayStatus::Pto => "PTO",
            DayStatus::Unpaid => "UNPAID",
            DayStatus::CallOff => "CALL OFF",
            DayStatus::Unscheduled => "UNSCHEDULED",
            DayStatus::LeaveOfAbsence => "LEAVE OF ABSENCE",
            DayStatus::Bereavement => "BEREAVEMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriveTimeLabel {
    #[default]
    #[serde(rename = "Drive Time")]
    DriveTime,
    #[serde(rename = "DT")]
    Short,
}

impl DriveTimeLabel {
    pub fn toggled(self) -> Self {
        match self {
            DriveTimeLabel::DriveTime => DriveTimeLabel::Short,
            DriveTimeLabel::Short => DriveTimeLabel::DriveTime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub number: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationDay {
    pub status: DayStatus,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
}

/// Two-week rotation template. Day keys are indexes from Friday (0) to Thursday (6).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rotation {
    #[serde(default)]
    pub week1: BTreeMap<u8, RotationDay>,
    #[serde(default)]
    pub week2: BTreeMap<u8, RotationDay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub shift: ShiftType,
    pub home_store_id: String,
    #[serde(default)]
    pub allowed_stores: Vec<String>,
    #[serde(default)]
    pub drive_time_stores: Vec<String>,
    #[serde(default)]
    pub rotation: Rotation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub employee_id: String,
    pub date: String,
    pub store_id: String,
    pub status: DayStatus,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub is_manual_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub body: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

/// One audit trail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLog {
    pub id: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub user_name: String,
    pub action: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Where the remote copy of the document lives.
///
/// Locally authoritative: a pull never replaces these with the remote's values.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// `owner/repo`
    pub repo: String,
    pub branch: String,
    pub token: String,
    /// File path inside the repository, e.g. `data.json`.
    pub path: String,
}

impl ConnectionSettings {
    /// Sync is inert unless both a repository and a credential are set.
    pub fn is_configured(&self) -> bool {
        !self.repo.is_empty() && !self.token.is_empty()
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            repo: String::new(),
            branch: "main".to_string(),
            token: String::new(),
            path: "data.json".to_string(),
        }
    }
}

// Hand-written so the credential never ends up in logs.
impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("path", &self.path)
            .field("token", &if self.token.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

/// The full synchronized document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub district: String,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub drive_time_label: DriveTimeLabel,
    #[serde(default)]
    pub stores: Vec<Store>,
    #[serde(default)]
    pub employees: Vec<Employee>,
    /// Sparse overrides keyed by `{employeeId}_{yyyy-MM-dd}`.
    #[serde(default)]
    pub schedule: BTreeMap<String, ScheduleEntry>,
    /// Newest first.
    #[serde(default)]
    pub announcements: Vec<Announcement>,
    /// Oldest first, capped at [`MAX_LOG_ENTRIES`].
    #[serde(default)]
    pub logs: Vec<ChangeLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<ConnectionSettings>,
}

impl ApplicationState {
    /// Connection settings, only when they are complete enough to sync.
    pub fn connection(&self) -> Option<&ConnectionSettings> {
        self.github.as_ref().filter(|c| c.is_configured())
    }

    /// Full-document overwrite merge of a pulled document.
    ///
    /// Every top-level field comes from `incoming` except the connection
    /// settings, which stay local. Logs come from `incoming` as-is (already
    /// empty when the remote document has none).
    pub fn merged_with_remote(&self, incoming: ApplicationState) -> ApplicationState {
        ApplicationState {
            github: self.github.clone(),
            ..incoming
        }
    }

    pub fn store(&self, id: &str) -> Option<&Store> {
        self.stores.iter().find(|s| s.id == id)
    }

    pub fn employee(&self, id: &str) -> Option<&Employee> {
        self.employees.iter().find(|e| e.id == id)
    }
}

impl Default for ApplicationState {
    fn default() -> Self {
        Self {
            district: "42".to_string(),
            dark_mode: true,
            drive_time_label: DriveTimeLabel::DriveTime,
            stores: initial_stores(),
            employees: Vec::new(),
            schedule: BTreeMap::new(),
            announcements: Vec::new(),
            logs: Vec::new(),
            github: Some(ConnectionSettings::default()),
        }
    }
}

/// Stores seeded into a brand new district.
pub fn initial_stores() -> Vec<Store> {
    [
        ("1", "645", "123 Sheetz Way, Altoona, PA"),
        ("2", "736", "456 Fuel St, Pittsburgh, PA"),
        ("3", "809", "789 Snack Ave, Harrisburg, PA"),
        ("4", "716", "101 Coffee Rd, York, PA"),
        ("5", "866", "202 MTO Blvd, State College, PA"),
        ("6", "863", "303 Soda Ln, Erie, PA"),
        ("7", "804", "404 Burger Dr, Scranton, PA"),
        ("8", "836", "505 Fry Cir, Reading, PA"),
        ("9", "798", "606 Hotdog Ct, Lancaster, PA"),
    ]
    .into_iter()
    .map(|(id, number, address)| Store {
        id: id.to_string(),
        number: number.to_string(),
        address: address.to_string(),
    })
    .collect()
}
