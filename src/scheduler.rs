//! Time- and step-based triggers that inject reminders into an `AgentLoop`
//! (spec §4.10).
//!
//! `Scheduler` never runs its own thread or timer loop — per the resolved
//! Open Question in SPEC_FULL.md §9, it is polled once per `AgentLoop` tick
//! and decides whether anything is due, the same way `TodoManager::tick_step`
//! is polled rather than self-scheduled. The one exception is
//! `every_interval`, which needs wall-clock time and uses `tokio::time::Interval`
//! internally but still only reports readiness when polled, never pushing
//! directly onto the loop's queue itself.

use crate::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One thing a schedule entry can fire on.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fires once every `n` agent-loop steps.
    EverySteps(u32),
    /// Fires once every `interval` of wall-clock time.
    EveryInterval(Duration),
    /// Fires according to a 5-field cron expression (`min hour dom month dow`).
    Cron(CronSchedule),
}

/// A trigger the `AgentLoop` should act on.
#[derive(Debug, Clone)]
pub struct SchedulerTrigger {
    pub id: String,
    pub fired_at: chrono::DateTime<chrono::Utc>,
}

struct Entry {
    schedule: Schedule,
    steps_since_fire: u32,
    last_fired: Option<Instant>,
}

/// Registry of named schedules for one agent, polled once per loop tick.
pub struct Scheduler {
    entries: HashMap<String, Entry>,
    external: std::sync::Mutex<Vec<String>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), external: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn every_steps(&mut self, id: impl Into<String>, n: u32) {
        self.entries.insert(
            id.into(),
            Entry { schedule: Schedule::EverySteps(n.max(1)), steps_since_fire: 0, last_fired: None },
        );
    }

    pub fn every_interval(&mut self, id: impl Into<String>, interval: Duration) {
        self.entries.insert(
            id.into(),
            Entry { schedule: Schedule::EveryInterval(interval), steps_since_fire: 0, last_fired: None },
        );
    }

    pub fn cron(&mut self, id: impl Into<String>, expression: &str) -> Result<()> {
        let cron = CronSchedule::parse(expression)?;
        self.entries.insert(
            id.into(),
            Entry { schedule: Schedule::Cron(cron), steps_since_fire: 0, last_fired: None },
        );
        Ok(())
    }

    /// Queues an out-of-band trigger (e.g. an external webhook) to be picked
    /// up on the next `poll_step`.
    pub fn notify_external_trigger(&self, id: impl Into<String>) {
        self.external.lock().unwrap().push(id.into());
    }

    /// Call once per `AgentLoop` step. Returns every trigger that's due.
    pub fn poll_step(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<SchedulerTrigger> {
        let mut due = Vec::new();

        for id in self.external.lock().unwrap().drain(..) {
            due.push(SchedulerTrigger { id, fired_at: now });
        }

        for (id, entry) in self.entries.iter_mut() {
            let fires = match &entry.schedule {
                Schedule::EverySteps(n) => {
                    entry.steps_since_fire += 1;
                    if entry.steps_since_fire >= *n {
                        entry.steps_since_fire = 0;
                        true
                    } else {
                        false
                    }
                }
                Schedule::EveryInterval(interval) => {
                    let elapsed = entry.last_fired.map(|t| t.elapsed()).unwrap_or(*interval);
                    if elapsed >= *interval {
                        entry.last_fired = Some(Instant::now());
                        true
                    } else {
                        false
                    }
                }
                Schedule::Cron(cron) => cron.matches(now),
            };
            if fires {
                due.push(SchedulerTrigger { id: id.clone(), fired_at: now });
            }
        }

        due
    }
}

/// A parsed 5-field cron expression (`minute hour day-of-month month
/// day-of-week`). Supports `*`, a bare number, and comma-separated lists —
/// enough for the reminder schedules this kernel needs, without reaching for
/// an external cron crate for five integer fields.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

#[derive(Debug, Clone)]
enum Field {
    Any,
    Values(Vec<u32>),
}

impl Field {
    fn parse(raw: &str, max: u32) -> Result<Self> {
        if raw == "*" {
            return Ok(Field::Any);
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            let n: u32 = part
                .trim()
                .parse()
                .map_err(|_| Error::invalid_input(format!("invalid cron field value: {part}")))?;
            if n > max {
                return Err(Error::invalid_input(format!("cron field value {n} exceeds max {max}")));
            }
            values.push(n);
        }
        Ok(Field::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(values) => values.contains(&value),
        }
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::invalid_input(format!(
                "cron expression must have 5 fields, got {}: {expression}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: Field::parse(fields[0], 59)?,
            hour: Field::parse(fields[1], 23)?,
            day_of_month: Field::parse(fields[2], 31)?,
            month: Field::parse(fields[3], 12)?,
            day_of_week: Field::parse(fields[4], 6)?,
        })
    }

    /// Whether `now` falls in the minute this schedule fires. Callers poll at
    /// sub-minute granularity should debounce externally; the kernel's loop
    /// tick cadence is expected to be coarser than one minute in practice.
    pub fn matches(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        self.minute.matches(now.minute())
            && self.hour.matches(now.hour())
            && self.day_of_month.matches(now.day())
            && self.month.matches(now.month())
            && self.day_of_week.matches(now.weekday().num_days_from_sunday())
    }
}
