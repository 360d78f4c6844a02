use crate::import_run::RecordStatus;
use crate::EntityKind;
use anyhow::Context;
use lazy_regex::regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

const KEEP_DAYS: i64 = 5;
const KEEP_MIN_FILES: usize = 5;

/// Plain-text audit trail: one file per day per entity type, append-only,
/// never read back by the importer itself.
pub struct RunLog {
    path: PathBuf,
}

fn date_stamp(date: Date) -> String {
    let fmt = format_description!("[year][month][day]");
    date.format(&fmt).unwrap_or_else(|_| date.to_string())
}

impl RunLog {
    pub fn open(dir: &Path, kind: EntityKind) -> Result<Self, anyhow::Error> {
        fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
        let today = OffsetDateTime::now_utc().date();
        let path = dir.join(format!("{}_{}_cron.log", date_stamp(today), kind.as_str()));
        if !path.exists() {
            let mut file = fs::File::create(&path)?;
            writeln!(file, "{} import log -- {}", kind.as_str(), today)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<(), anyhow::Error> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn add_line(&self, line: &str) -> Result<(), anyhow::Error> {
        self.append(line)
    }

    /// Numbered entries continue across pages of one run; `start_index` is
    /// the cumulative processed count before this page.
    pub fn add_statuses(
        &self,
        start_index: usize,
        statuses: &[RecordStatus],
    ) -> Result<(), anyhow::Error> {
        for (offset, status) in statuses.iter().enumerate() {
            self.append(&format_status_line(start_index + offset + 1, status))?;
        }
        Ok(())
    }

    pub fn add_page_failure(&self, page: usize, message: &str) -> Result<(), anyhow::Error> {
        self.append(&format!("Page {page} failed -- {message}"))
    }
}

pub fn format_status_line(index: usize, status: &RecordStatus) -> String {
    format!(
        "{index}. {} {} -- {}",
        status.key,
        status.label.to_uppercase(),
        status.message
    )
}

/// Delete logs older than the retention window, but only once the folder
/// has accumulated more files than the window itself holds.
pub fn clear_old_logs(dir: &Path) -> Result<usize, anyhow::Error> {
    let today = OffsetDateTime::now_utc().date();
    let mut logs = Vec::new();
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(date) = parse_log_date(&name) {
            logs.push((entry.path(), date));
        }
    }
    if logs.len() <= KEEP_MIN_FILES {
        return Ok(0);
    }
    let mut removed = 0;
    for (path, date) in logs {
        if (today - date).whole_days() > KEEP_DAYS {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn parse_log_date(file_name: &str) -> Option<Date> {
    let re = regex!(r"^(\d{4})(\d{2})(\d{2})_[a-z]+_cron\.log$");
    let caps = re.captures(file_name)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u8 = caps.get(2)?.as_str().parse().ok()?;
    let day: u8 = caps.get(3)?.as_str().parse().ok()?;
    let month = time::Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::import_run::{RecordStatus, CREATED, FAILED};
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sv-sync-log-{}", Uuid::new_v4()))
    }

    #[test]
    fn status_lines_are_numbered_from_start_index() {
        let status = RecordStatus {
            key: "412".to_string(),
            label: CREATED,
            message: "Blue Heron Tours listing created".to_string(),
        };
        assert_eq!(
            "21. 412 CREATED -- Blue Heron Tours listing created",
            format_status_line(21, &status)
        );
    }

    #[test]
    fn appends_across_pages() {
        let dir = temp_dir();
        let log = RunLog::open(&dir, EntityKind::Listings).expect("log");
        log.add_statuses(
            0,
            &[RecordStatus {
                key: "1".to_string(),
                label: CREATED,
                message: "a".to_string(),
            }],
        )
        .expect("page one");
        log.add_statuses(
            1,
            &[RecordStatus {
                key: "900".to_string(),
                label: FAILED,
                message: "Company Name Missing".to_string(),
            }],
        )
        .expect("page two");
        log.add_page_failure(3, "Connection to API failed -- HTTP status 500")
            .expect("page failure");
        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.contains("1. 1 CREATED -- a"));
        assert!(contents.contains("2. 900 FAILED -- Company Name Missing"));
        assert!(contents.contains("Page 3 failed"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parses_dates_only_from_log_names() {
        assert_eq!(
            Date::from_calendar_date(2026, time::Month::August, 30).ok(),
            parse_log_date("20260830_listings_cron.log")
        );
        assert_eq!(None, parse_log_date("notes.txt"));
        assert_eq!(None, parse_log_date("20269999_listings_cron.log"));
    }

    #[test]
    fn retention_keeps_small_folders_intact() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir");
        for name in ["20200101_listings_cron.log", "20200102_events_cron.log"] {
            fs::write(dir.join(name), "old").expect("write");
        }
        // Only two files: nothing is deleted even though they are ancient.
        assert_eq!(0, clear_old_logs(&dir).expect("clear"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn retention_drops_stale_files_once_folder_grows() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).expect("dir");
        for day in 1..=6 {
            fs::write(
                dir.join(format!("202001{day:02}_listings_cron.log")),
                "old",
            )
            .expect("write");
        }
        assert_eq!(6, clear_old_logs(&dir).expect("clear"));
        fs::remove_dir_all(&dir).ok();
    }
}
