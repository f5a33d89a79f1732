//! Scheduled world backups: when to fire, and which archives to keep.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::supervisor::Supervisor;
use crate::types::{ArchiveFormat, Backup, BackupConfig, BackupSchedule};

/// Whether `config` asks for a backup during the minute containing `now`.
pub fn is_due<Tz: TimeZone>(config: &BackupConfig, now: &DateTime<Tz>) -> bool {
    if !config.enabled {
        return false;
    }
    let Ok((hour, minute)) = config.time_of_day() else {
        return false;
    };
    if now.minute() != minute {
        return false;
    }
    match config.schedule {
        BackupSchedule::Hourly => true,
        BackupSchedule::Daily => now.hour() == hour,
        BackupSchedule::Weekly => {
            now.hour() == hour && now.weekday().num_days_from_sunday() == u32::from(config.schedule_day)
        }
    }
}

/// Remembers the minute each server last fired in, so a sweep that runs twice
/// inside one matching minute only backs up once.
#[derive(Debug, Default)]
pub struct FireLog {
    last_fired: HashMap<Uuid, i64>,
}

impl FireLog {
    pub fn should_fire<Tz: TimeZone>(&mut self, id: Uuid, config: &BackupConfig, now: &DateTime<Tz>) -> bool {
        if !is_due(config, now) {
            return false;
        }
        let minute = now.timestamp().div_euclid(60);
        if self.last_fired.get(&id) == Some(&minute) {
            return false;
        }
        self.last_fired.insert(id, minute);
        true
    }

    pub fn forget(&mut self, id: &Uuid) {
        self.last_fired.remove(id);
    }
}

/// Prepends `backup` and returns the entries evicted to honour `keep`,
/// oldest last.
pub fn record_and_rotate(history: &mut Vec<Backup>, backup: Backup, keep: usize) -> Vec<Backup> {
    history.insert(0, backup);
    let keep = keep.max(1);
    if history.len() > keep {
        history.split_off(keep)
    } else {
        Vec::new()
    }
}

/// File name for a new archive, unique per backup id.
pub fn archive_file_name(server_name: &str, created: &DateTime<Utc>, id: &Uuid, format: ArchiveFormat) -> String {
    let safe: String = server_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let short = id.simple().to_string();
    format!(
        "{}-{}-{}.{}",
        safe,
        created.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        &short[..8],
        format.extension()
    )
}

/// Runs the backup sweep until the supervisor is dropped.
pub fn spawn_scheduler(supervisor: Weak<Supervisor>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut fire_log = FireLog::default();

        loop {
            ticker.tick().await;
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };

            let now = Local::now();
            for (id, config) in supervisor.backup_configs() {
                if !fire_log.should_fire(id, &config, &now) {
                    continue;
                }
                tracing::info!(server_id = %id, "Scheduled backup due");
                // Each backup runs on its own task so one failure never stalls the sweep.
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.create_backup(id).await {
                        tracing::error!(server_id = %id, "Scheduled backup failed: {}", e);
                    }
                });
            }
            fire_log
                .last_fired
                .retain(|id, _| supervisor.contains_server(id));
        }
        tracing::debug!("Backup scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, ss)
            .unwrap()
            .and_utc()
    }

    fn config(schedule: BackupSchedule, time: &str, day: u8) -> BackupConfig {
        BackupConfig {
            enabled: true,
            schedule,
            schedule_time: time.to_string(),
            schedule_day: day,
            ..Default::default()
        }
    }

    #[test]
    fn hourly_fires_every_hour_on_the_minute() {
        let cfg = config(BackupSchedule::Hourly, "03:15", 0);
        assert!(is_due(&cfg, &at(2024, 5, 1, 3, 15, 0)));
        assert!(is_due(&cfg, &at(2024, 5, 1, 17, 15, 30)));
        assert!(!is_due(&cfg, &at(2024, 5, 1, 17, 16, 0)));
    }

    #[test]
    fn daily_needs_hour_and_minute() {
        let cfg = config(BackupSchedule::Daily, "03:00", 0);
        assert!(is_due(&cfg, &at(2024, 5, 1, 3, 0, 10)));
        assert!(!is_due(&cfg, &at(2024, 5, 1, 4, 0, 10)));
    }

    #[test]
    fn weekly_needs_day_of_week() {
        // 2024-05-05 is a Sunday
        let cfg = config(BackupSchedule::Weekly, "22:30", 0);
        assert!(is_due(&cfg, &at(2024, 5, 5, 22, 30, 0)));
        assert!(!is_due(&cfg, &at(2024, 5, 6, 22, 30, 0)));
    }

    #[test]
    fn disabled_or_malformed_never_fires() {
        let mut cfg = config(BackupSchedule::Hourly, "03:00", 0);
        cfg.enabled = false;
        assert!(!is_due(&cfg, &at(2024, 5, 1, 3, 0, 0)));
        let cfg = config(BackupSchedule::Hourly, "later", 0);
        assert!(!is_due(&cfg, &at(2024, 5, 1, 3, 0, 0)));
    }

    #[test]
    fn daily_fires_once_per_day_even_with_repeated_sweeps() {
        let cfg = config(BackupSchedule::Daily, "03:00", 0);
        let id = Uuid::new_v4();
        let mut log = FireLog::default();

        assert!(log.should_fire(id, &cfg, &at(2024, 5, 1, 3, 0, 1)));
        assert!(!log.should_fire(id, &cfg, &at(2024, 5, 1, 3, 0, 45)));
        assert!(!log.should_fire(id, &cfg, &at(2024, 5, 1, 3, 1, 0)));
        assert!(log.should_fire(id, &cfg, &at(2024, 5, 2, 3, 0, 2)));
    }

    fn backup(n: u32) -> Backup {
        Backup {
            id: Uuid::new_v4(),
            date: format!("2024-05-01T00:00:{:02}Z", n),
            size: 10,
            path: PathBuf::from(format!("/tmp/{}.zip", n)),
        }
    }

    #[test]
    fn rotation_keeps_newest() {
        let mut history = Vec::new();
        let mut evicted = Vec::new();
        for n in 0..4 {
            evicted.extend(record_and_rotate(&mut history, backup(n), 3));
        }
        let dates: Vec<_> = history.iter().map(|b| b.date.as_str()).collect();
        assert_eq!(
            dates,
            vec!["2024-05-01T00:00:03Z", "2024-05-01T00:00:02Z", "2024-05-01T00:00:01Z"]
        );
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].date, "2024-05-01T00:00:00Z");
    }

    #[test]
    fn archive_names_are_filesystem_safe() {
        let id = Uuid::new_v4();
        let name = archive_file_name("My Hub/1", &at(2024, 5, 1, 3, 0, 0), &id, ArchiveFormat::TarGz);
        assert!(name.starts_with("My_Hub_1-2024-05-01T03-00-00-000Z-"));
        assert!(name.ends_with(".tar.gz"));
        assert!(!name.contains(':'));
    }
}
