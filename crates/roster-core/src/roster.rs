//! Editing operations on the roster document.
//!
//! Each operation is a plain transform of [`ApplicationState`], meant to be
//! run through the mutation gate (`StateContainer::mutate`). Validation
//! failures leave the state untouched.

use crate::model::{
    Announcement, ApplicationState, ChangeLog, DayStatus, Employee, MAX_LOG_ENTRIES,
    ScheduleEntry, Store,
};
use crate::schedule::{self, WeekParity};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("Unknown employee: {0}")]
    UnknownEmployee(String),

    #[error("A district must keep at least one store")]
    LastStore,
}

pub type Result<T> = std::result::Result<T, RosterError>;

/// Short random identifier for new records.
pub fn new_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(9);
    id
}

/// A single-field change to one day of an employee's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEdit {
    Status(DayStatus),
    Store(String),
    /// New start time; the end time is derived from the regular shift length.
    StartTime(String),
}

impl ApplicationState {
    pub fn add_store(&mut self, number: &str, address: &str) -> Result<&Store> {
        if number.trim().is_empty() {
            return Err(RosterError::MissingField("number"));
        }
        if address.trim().is_empty() {
            return Err(RosterError::MissingField("address"));
        }
        self.stores.push(Store {
            id: new_id(),
            number: number.to_string(),
            address: address.to_string(),
        });
        Ok(&self.stores[self.stores.len() - 1])
    }

    pub fn remove_store(&mut self, id: &str) -> Result<Store> {
        let pos = self
            .stores
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RosterError::UnknownStore(id.to_string()))?;
        if self.stores.len() <= 1 {
            return Err(RosterError::LastStore);
        }
        Ok(self.stores.remove(pos))
    }

    /// Post to the bulletin board. New posts go to the top.
    pub fn post_announcement(&mut self, title: &str, body: &str, now_ms: i64) -> Result<&Announcement> {
        if title.trim().is_empty() {
            return Err(RosterError::MissingField("title"));
        }
        if body.trim().is_empty() {
            return Err(RosterError::MissingField("body"));
        }
        self.announcements.insert(
            0,
            Announcement {
                id: new_id(),
                title: title.to_string(),
                body: body.to_string(),
                timestamp: now_ms,
            },
        );
        Ok(&self.announcements[0])
    }

    /// Returns whether a post was removed.
    pub fn delete_announcement(&mut self, id: &str) -> bool {
        let before = self.announcements.len();
        self.announcements.retain(|a| a.id != id);
        self.announcements.len() != before
    }

    /// Append to the change log, dropping the oldest entries past the cap.
    pub fn record_change(&mut self, entry: ChangeLog) {
        self.logs.push(entry);
        if self.logs.len() > MAX_LOG_ENTRIES {
            let excess = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(..excess);
        }
    }

    /// The effective schedule for `employee` on `date`: a manual override if
    /// one exists, otherwise the rotation default for that week.
    pub fn resolve_entry(&self, employee: &Employee, date: NaiveDate) -> ScheduleEntry {
        if let Some(entry) = self.schedule.get(&schedule::schedule_key(&employee.id, date)) {
            return entry.clone();
        }

        let week = match schedule::week_parity(schedule::week_number(date)) {
            WeekParity::Week1 => &employee.rotation.week1,
            WeekParity::Week2 => &employee.rotation.week2,
        };
        let day = week.get(&schedule::day_index(date));

        ScheduleEntry {
            employee_id: employee.id.clone(),
            date: schedule::date_id(date),
            store_id: employee.home_store_id.clone(),
            status: day.map(|d| d.status).unwrap_or(DayStatus::Unscheduled),
            start_time: day.map(|d| d.start_time.clone()).unwrap_or_default(),
            end_time: day.map(|d| d.end_time.clone()).unwrap_or_default(),
            is_manual_override: false,
        }
    }

    /// Write a manual override for one day and log it under the employee's name.
    pub fn override_entry(
        &mut self,
        employee_id: &str,
        date: NaiveDate,
        edit: EntryEdit,
        now_ms: i64,
    ) -> Result<&ScheduleEntry> {
        let employee = self
            .employee(employee_id)
            .cloned()
            .ok_or_else(|| RosterError::UnknownEmployee(employee_id.to_string()))?;
        let current = self.resolve_entry(&employee, date);
        let stamp = date.format("%m/%d");

        let mut next = current.clone();
        next.is_manual_override = true;
        let (field, old_value, new_value) = match edit {
            EntryEdit::Status(status) => {
                next.status = status;
                (
                    format!("Shift Status ({stamp})"),
                    current.status.label().to_string(),
                    status.label().to_string(),
                )
            }
            EntryEdit::Store(store_id) => {
                let new_number = self
                    .store(&store_id)
                    .map(|s| s.number.clone())
                    .ok_or_else(|| RosterError::UnknownStore(store_id.clone()))?;
                let old_number = self
                    .store(&current.store_id)
                    .map(|s| s.number.clone())
                    .unwrap_or_else(|| "??".to_string());
                // Giving an unscheduled day a store puts the employee to work there
                if current.status == DayStatus::Unscheduled {
                    next.status = DayStatus::Work;
                }
                next.store_id = store_id;
                (
                    format!("Store Assignment ({stamp})"),
                    format!("#{old_number}"),
                    format!("#{new_number}"),
                )
            }
            EntryEdit::StartTime(start) => {
                next.end_time = schedule::calculate_end_time(&start);
                next.start_time = start.clone();
                (format!("Start Time ({stamp})"), current.start_time.clone(), start)
            }
        };

        let key = schedule::schedule_key(employee_id, date);
        self.schedule.insert(key.clone(), next);
        self.record_change(ChangeLog {
            id: new_id(),
            timestamp: now_ms,
            user_name: employee.name.clone(),
            action: "OVERRIDE".to_string(),
            field,
            old_value,
            new_value,
        });
        Ok(&self.schedule[&key])
    }

    /// Drop a manual override so the day falls back to the rotation default.
    /// Returns whether an override existed.
    pub fn revert_override(&mut self, employee_id: &str, date: NaiveDate, now_ms: i64) -> Result<bool> {
        let name = self
            .employee(employee_id)
            .map(|e| e.name.clone())
            .ok_or_else(|| RosterError::UnknownEmployee(employee_id.to_string()))?;
        if self.schedule.remove(&schedule::schedule_key(employee_id, date)).is_none() {
            return Ok(false);
        }
        self.record_change(ChangeLog {
            id: new_id(),
            timestamp: now_ms,
            user_name: name,
            action: "REVERT".to_string(),
            field: format!("Manual Override ({})", date.format("%m/%d")),
            old_value: "Manual".to_string(),
            new_value: "Rotation Default".to_string(),
        });
        Ok(true)
    }
}
