//! Resync scheduling.
//!
//! Deciding whether a resync is due is pure; the recurring trigger that
//! calls `edgewall --cron` once a day is a systemd timer.

use anyhow::{Context, Result};
use chrono::{NaiveTime, Timelike};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::cmd_abstraction::{run, CommandExecutor};
use crate::state::SyncRecord;

pub const SECONDS_PER_DAY: i64 = 86_400;

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";
const SERVICE_NAME: &str = "edgewall-sync.service";
const TIMER_NAME: &str = "edgewall-sync.timer";

/// True once `update_interval_days` have fully elapsed since the last sync.
pub fn is_due(record: &SyncRecord, now: i64) -> bool {
    now.saturating_sub(record.last_sync_epoch) >= i64::from(record.update_interval_days) * SECONDS_PER_DAY
}

/// Epoch second at which the record becomes due.
pub fn next_due(record: &SyncRecord) -> i64 {
    record
        .last_sync_epoch
        .saturating_add(i64::from(record.update_interval_days) * SECONDS_PER_DAY)
}

/// Time of day (minute precision) the recurring trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime(NaiveTime);

impl DailyTime {
    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    /// systemd `OnCalendar=` expression.
    pub fn on_calendar(&self) -> String {
        format!("*-*-* {:02}:{:02}:00", self.hour(), self.minute())
    }
}

impl FromStr for DailyTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let time = NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| anyhow::anyhow!("invalid sync_time '{}', expected HH:MM", s))?;
        Ok(Self(time))
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Host mechanism that re-invokes the tool once a day.
pub trait RecurringTrigger {
    fn register(&self, at: &DailyTime) -> Result<()>;

    fn unregister(&self) -> Result<()>;

    fn is_registered(&self) -> bool;
}

/// Oneshot service plus daily timer.
pub struct SystemdTimer<'a> {
    executor: &'a dyn CommandExecutor,
    unit_dir: PathBuf,
    binary_path: PathBuf,
    config_path: PathBuf,
}

impl<'a> SystemdTimer<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, binary_path: &Path, config_path: &Path) -> Self {
        Self::with_unit_dir(executor, Path::new(SYSTEMD_UNIT_DIR), binary_path, config_path)
    }

    pub fn with_unit_dir(
        executor: &'a dyn CommandExecutor,
        unit_dir: &Path,
        binary_path: &Path,
        config_path: &Path,
    ) -> Self {
        Self {
            executor,
            unit_dir: unit_dir.to_path_buf(),
            binary_path: binary_path.to_path_buf(),
            config_path: config_path.to_path_buf(),
        }
    }

    fn service_path(&self) -> PathBuf {
        self.unit_dir.join(SERVICE_NAME)
    }

    fn timer_path(&self) -> PathBuf {
        self.unit_dir.join(TIMER_NAME)
    }

    fn generate_service_unit(&self) -> String {
        format!(
            r#"[Unit]
Description=edgewall CDN whitelist resync
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
ExecStart={} --cron --quiet --config {}

NoNewPrivileges=yes
ProtectHome=yes
PrivateTmp=yes
"#,
            self.binary_path.display(),
            self.config_path.display()
        )
    }

    fn generate_timer_unit(at: &DailyTime) -> String {
        format!(
            r#"[Unit]
Description=Daily edgewall whitelist resync check

[Timer]
OnCalendar={}
Persistent=true

[Install]
WantedBy=timers.target
"#,
            at.on_calendar()
        )
    }
}

impl RecurringTrigger for SystemdTimer<'_> {
    fn register(&self, at: &DailyTime) -> Result<()> {
        fs::create_dir_all(&self.unit_dir)
            .with_context(|| format!("Failed to create {:?}", self.unit_dir))?;

        info!("Creating {}...", self.service_path().display());
        fs::write(self.service_path(), self.generate_service_unit())
            .context("Failed to write systemd service")?;

        info!("Creating {}...", self.timer_path().display());
        fs::write(self.timer_path(), Self::generate_timer_unit(at)).context("Failed to write systemd timer")?;

        run(self.executor, "systemctl", &["daemon-reload"]).context("Failed to reload systemd")?;
        run(self.executor, "systemctl", &["enable", "--now", TIMER_NAME]).context("Failed to enable timer")?;
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        if self.timer_path().exists() {
            // an already stopped unit is fine
            if let Err(e) = run(self.executor, "systemctl", &["disable", "--now", TIMER_NAME]) {
                debug!("Disabling {} failed: {}", TIMER_NAME, e);
            }
        }

        for path in [self.timer_path(), self.service_path()] {
            if path.exists() {
                info!("Removing {}...", path.display());
                fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
            }
        }

        run(self.executor, "systemctl", &["daemon-reload"]).context("Failed to reload systemd")?;
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.timer_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};
    use mockall::Sequence;
    use tempfile::TempDir;

    fn record(last: i64, days: u32) -> SyncRecord {
        SyncRecord::new(days).mark_synced(last)
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            success: true,
            code: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_due_boundary() {
        let r = record(1_000, 1);
        assert!(!is_due(&r, 1_000 + SECONDS_PER_DAY - 1));
        assert!(is_due(&r, 1_000 + SECONDS_PER_DAY));
        assert!(is_due(&r, 1_000 + 10 * SECONDS_PER_DAY));
        assert_eq!(next_due(&r), 1_000 + SECONDS_PER_DAY);
    }

    #[test]
    fn test_never_synced_is_due() {
        assert!(is_due(&SyncRecord::new(7), 7 * SECONDS_PER_DAY));
    }

    #[test]
    fn test_daily_time_parse() {
        let t: DailyTime = "04:30".parse().unwrap();
        assert_eq!(t.to_string(), "04:30");
        assert_eq!(t.on_calendar(), "*-*-* 04:30:00");
        assert!("24:00".parse::<DailyTime>().is_err());
        assert!("4h".parse::<DailyTime>().is_err());
        assert_eq!(" 23:59 ".parse::<DailyTime>().unwrap().to_string(), "23:59");
    }

    #[test]
    fn test_register_writes_units_and_enables_timer() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCommandExecutor::new();
        let mut seq = Sequence::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "systemctl" && args == ["daemon-reload".to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(ok()));
        mock.expect_execute()
            .withf(|cmd, args| cmd == "systemctl" && args.first().map(String::as_str) == Some("enable"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(ok()));

        let timer = SystemdTimer::with_unit_dir(
            &mock,
            dir.path(),
            Path::new("/usr/local/bin/edgewall"),
            Path::new("/etc/edgewall/config.yaml"),
        );
        timer.register(&"03:15".parse().unwrap()).unwrap();

        assert!(timer.is_registered());
        let service = fs::read_to_string(dir.path().join(SERVICE_NAME)).unwrap();
        assert!(service.contains("ExecStart=/usr/local/bin/edgewall --cron --quiet --config /etc/edgewall/config.yaml"));
        let unit = fs::read_to_string(dir.path().join(TIMER_NAME)).unwrap();
        assert!(unit.contains("OnCalendar=*-*-* 03:15:00"));
        assert!(unit.contains("Persistent=true"));
    }

    #[test]
    fn test_unregister_removes_units() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SERVICE_NAME), "").unwrap();
        fs::write(dir.path().join(TIMER_NAME), "").unwrap();

        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|_, _| Ok(ok()));

        let timer = SystemdTimer::with_unit_dir(&mock, dir.path(), Path::new("/bin/edgewall"), Path::new("/c.yaml"));
        timer.unregister().unwrap();
        assert!(!timer.is_registered());
        assert!(!dir.path().join(SERVICE_NAME).exists());
    }
}
