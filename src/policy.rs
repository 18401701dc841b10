//! Insurance policy records and due-date extraction.
//!
//! Due dates are found by an ordered table of [`DueDateRule`]s. Each rule
//! pairs a label (such as "premium due") with one date format. Rules are
//! tried in table order and the first rule that yields a valid calendar
//! date anywhere in the text wins. Supporting a new label or format means
//! adding rows to the table.
//!
//! Accepted formats:
//!
//! | Format | Examples |
//! |--------|----------|
//! | Numeric, day first | `10/07/2025`, `10-07-2025`, `10/07/25` (two-digit years are 20YY) |
//! | Long form | `July 10, 2025`, `Jul 10 2025` |
//!
//! [`PolicyStore`] persists one [`Policy`] per normalized file name in the
//! `policies` table.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::{Captures, Regex};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::documents::normalize_name;
use crate::error::{KbError, KbResult};
use crate::models::Policy;

/// Labels in priority order.
const LABELS: &[&str] = &[
    "due date",
    "premium due",
    "payment due",
    "next payment",
    "premium date",
    "next due",
];

const NUMERIC_DATE: &str =
    r"(?P<d>\d{1,2})(?:/(?P<m1>\d{1,2})/|-(?P<m2>\d{1,2})-)(?P<y>\d{2,4})\b";
const LONG_DATE: &str = r"(?P<month>[a-z]{3,9})\.?\s+(?P<day>\d{1,2})(?:st|nd|rd|th)?,?\s+(?P<year>\d{4})\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    Numeric,
    LongForm,
}

pub struct DueDateRule {
    pub label: &'static str,
    pub format: DateFormat,
    pattern: Regex,
}

impl DueDateRule {
    fn new(label: &'static str, format: DateFormat) -> Result<Self, regex::Error> {
        let label_pattern = label
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s*");
        let date = match format {
            DateFormat::Numeric => NUMERIC_DATE,
            DateFormat::LongForm => LONG_DATE,
        };
        let pattern = Regex::new(&format!(r"(?i)\b{}[:\s]+{}", label_pattern, date))?;
        Ok(Self {
            label,
            format,
            pattern,
        })
    }

    /// First valid date this rule finds in `text`.
    fn find(&self, text: &str) -> Option<NaiveDate> {
        self.pattern.captures_iter(text).find_map(|caps| match self.format {
            DateFormat::Numeric => numeric_date(&caps),
            DateFormat::LongForm => long_date(&caps),
        })
    }
}

static RULES: LazyLock<Vec<DueDateRule>> = LazyLock::new(|| {
    LABELS
        .iter()
        .flat_map(|label| [(*label, DateFormat::Numeric), (*label, DateFormat::LongForm)])
        .filter_map(|(label, format)| match DueDateRule::new(label, format) {
            Ok(rule) => Some(rule),
            Err(e) => {
                tracing::error!(label, error = %e, "invalid due-date rule");
                None
            }
        })
        .collect()
});

pub fn rules() -> &'static [DueDateRule] {
    &RULES
}

fn numeric_date(caps: &Captures<'_>) -> Option<NaiveDate> {
    let day: u32 = caps.name("d")?.as_str().parse().ok()?;
    let month: u32 = caps
        .name("m1")
        .or_else(|| caps.name("m2"))?
        .as_str()
        .parse()
        .ok()?;
    let year_str = caps.name("y")?.as_str();
    let year: i32 = match year_str.len() {
        2 => 2000 + year_str.parse::<i32>().ok()?,
        4 => year_str.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let name = name.to_lowercase();
    if name == "sept" {
        return Some(9);
    }
    MONTHS
        .iter()
        .position(|m| *m == name || (name.len() == 3 && m.starts_with(name.as_str())))
        .map(|i| i as u32 + 1)
}

fn long_date(caps: &Captures<'_>) -> Option<NaiveDate> {
    let month = month_number(caps.name("month")?.as_str())?;
    let day: u32 = caps.name("day")?.as_str().parse().ok()?;
    let year: i32 = caps.name("year")?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// A due date and the label that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueDateMatch {
    pub date: NaiveDate,
    pub label: &'static str,
}

/// Extract the due date from policy text, trying rules in priority order.
pub fn extract_due_date(text: &str) -> Option<DueDateMatch> {
    rules().iter().find_map(|rule| {
        rule.find(text).map(|date| DueDateMatch {
            date,
            label: rule.label,
        })
    })
}

// ============ Store ============

pub struct PolicyStore {
    pool: SqlitePool,
}

fn ts(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(|t| DateTime::from_timestamp(t, 0))
}

fn row_to_policy(row: &SqliteRow) -> KbResult<Policy> {
    let name: String = row.get("name");
    let due_date = match row.get::<Option<String>, _>("due_date") {
        Some(raw) => Some(
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|_| KbError::DateExtraction(name.clone()))?,
        ),
        None => None,
    };
    Ok(Policy {
        due_date,
        last_checked: ts(row.get("last_checked")),
        notified: row.get::<i64, _>("notified") != 0,
        uploaded_at: ts(Some(row.get("uploaded_at"))).unwrap_or_default(),
        name,
    })
}

impl PolicyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a policy, extracting its due date from `text`.
    ///
    /// Re-uploading with the same due date keeps the notification state.
    /// A changed due date resets it so the new date gets its own reminder.
    pub async fn upload(&self, name: &str, text: &str) -> KbResult<Policy> {
        let name = normalize_name(name)?;
        let found = extract_due_date(text);
        match found {
            Some(m) => tracing::info!(policy = %name, due_date = %m.date, label = m.label, "extracted due date"),
            None => tracing::warn!(policy = %name, "{}", KbError::DateExtraction(name.clone())),
        }
        let due_date = found.map(|m| m.date);

        let previous = match self.get(&name).await {
            Ok(previous) => previous,
            Err(KbError::DateExtraction(_)) => {
                tracing::warn!(policy = %name, "replacing unreadable policy row");
                None
            }
            Err(e) => return Err(e),
        };
        let (notified, last_checked) = match previous {
            Some(existing) if existing.due_date == due_date => {
                (existing.notified, existing.last_checked)
            }
            _ => (false, None),
        };

        let policy = Policy {
            name,
            due_date,
            last_checked,
            notified,
            uploaded_at: ts(Some(Utc::now().timestamp())).unwrap_or_default(),
        };

        sqlx::query(
            r#"
            INSERT INTO policies (name, due_date, last_checked, notified, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                due_date = excluded.due_date,
                last_checked = excluded.last_checked,
                notified = excluded.notified,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(&policy.name)
        .bind(policy.due_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(policy.last_checked.map(|t| t.timestamp()))
        .bind(policy.notified as i64)
        .bind(policy.uploaded_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(policy)
    }

    pub async fn get(&self, name: &str) -> KbResult<Option<Policy>> {
        let name = normalize_name(name)?;
        let row = sqlx::query(
            "SELECT name, due_date, last_checked, notified, uploaded_at FROM policies WHERE name = ?",
        )
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_policy).transpose()
    }

    /// All readable policies ordered by name. Rows with a malformed due
    /// date are logged and skipped.
    pub async fn list(&self) -> KbResult<Vec<Policy>> {
        let rows = sqlx::query(
            "SELECT name, due_date, last_checked, notified, uploaded_at FROM policies ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row_to_policy(row) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable policy row");
                    None
                }
            })
            .collect())
    }

    /// Returns `false` when no such policy exists.
    pub async fn delete(&self, name: &str) -> KbResult<bool> {
        let name = normalize_name(name)?;
        let result = sqlx::query("DELETE FROM policies WHERE name = ?")
            .bind(&name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Names of policies that have a due date and are not yet notified.
    pub(crate) async fn unnotified_names(&self) -> KbResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT name FROM policies WHERE due_date IS NOT NULL AND notified = 0 ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Mark a policy notified for `due_date`. Returns `true` only for the
    /// caller that flipped the flag, so each due date notifies once.
    pub(crate) async fn mark_notified(
        &self,
        name: &str,
        due_date: NaiveDate,
        at: DateTime<Utc>,
    ) -> KbResult<bool> {
        let result = sqlx::query(
            "UPDATE policies SET notified = 1, last_checked = ? WHERE name = ? AND notified = 0 AND due_date = ?",
        )
        .bind(at.timestamp())
        .bind(name)
        .bind(due_date.format("%Y-%m-%d").to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub(crate) async fn touch_checked(&self, name: &str, at: DateTime<Utc>) -> KbResult<()> {
        sqlx::query("UPDATE policies SET last_checked = ? WHERE name = ? AND notified = 0")
            .bind(at.timestamp())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use crate::models::PolicyState;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn due(text: &str) -> Option<NaiveDate> {
        extract_due_date(text).map(|m| m.date)
    }

    #[test]
    fn test_numeric_and_long_forms_agree() {
        assert_eq!(due("Due Date: 10/07/2025"), Some(date(2025, 7, 10)));
        assert_eq!(due("premium due July 10, 2025"), Some(date(2025, 7, 10)));
        assert_eq!(due("PAYMENT DUE: 10-07-2025"), Some(date(2025, 7, 10)));
        assert_eq!(due("next payment: Jul 10 2025"), Some(date(2025, 7, 10)));
    }

    #[test]
    fn test_two_digit_years() {
        assert_eq!(due("premium date: 01/02/26"), Some(date(2026, 2, 1)));
    }

    #[test]
    fn test_label_priority_beats_position() {
        let text = "Next payment: 01/01/2026. Policy terms... Due date: 15/03/2026";
        let found = extract_due_date(text).unwrap();
        assert_eq!(found.label, "due date");
        assert_eq!(found.date, date(2026, 3, 15));
    }

    #[test]
    fn test_invalid_date_falls_through() {
        assert_eq!(
            due("due date: 31/02/2025 premium due: 28/02/2025"),
            Some(date(2025, 2, 28))
        );
        assert_eq!(due("due date: 31/02/2025, again due date: 01/03/2025"), Some(date(2025, 3, 1)));
    }

    #[test]
    fn test_next_due_label_tolerates_spacing() {
        assert_eq!(due("NextDue: 05/06/2025"), Some(date(2025, 6, 5)));
    }

    #[test]
    fn test_no_label_no_date() {
        assert_eq!(due("Renewal on 10/07/2025"), None);
        assert_eq!(due(""), None);
        assert_eq!(due("due date: soon"), None);
    }

    #[test]
    fn test_rule_table_is_complete() {
        assert_eq!(rules().len(), LABELS.len() * 2);
        assert_eq!(rules()[0].label, "due date");
        assert_eq!(rules()[0].format, DateFormat::Numeric);
    }

    async fn store() -> (TempDir, PolicyStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("p.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (tmp, PolicyStore::new(pool))
    }

    #[tokio::test]
    async fn test_upload_get_list_delete() {
        let (_tmp, store) = store().await;
        let p = store
            .upload("uploads/car.pdf", "Premium due: 10/07/2025")
            .await
            .unwrap();
        assert_eq!(p.name, "car.pdf");
        assert_eq!(p.state(), PolicyState::DateExtracted);

        let failed = store.upload("home.pdf", "no dates here").await.unwrap();
        assert_eq!(failed.state(), PolicyState::ExtractionFailed);

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["car.pdf", "home.pdf"]);
        assert_eq!(store.get("car.pdf").await.unwrap().unwrap().due_date, Some(date(2025, 7, 10)));

        assert!(store.delete("car.pdf").await.unwrap());
        assert!(!store.delete("car.pdf").await.unwrap());
        assert!(store.get("car.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reupload_keeps_or_resets_notification() {
        let (_tmp, store) = store().await;
        store.upload("car.pdf", "due date: 10/07/2025").await.unwrap();
        assert!(store
            .mark_notified("car.pdf", date(2025, 7, 10), Utc::now())
            .await
            .unwrap());

        let same = store.upload("car.pdf", "due date: 10/07/2025").await.unwrap();
        assert!(same.notified);

        let changed = store.upload("car.pdf", "due date: 10/07/2026").await.unwrap();
        assert!(!changed.notified);
        assert!(changed.last_checked.is_none());
    }

    #[tokio::test]
    async fn test_reupload_read_failure_keeps_notification() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.db");
        let pool = db::connect(&path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = PolicyStore::new(pool.clone());
        store.upload("car.pdf", "due date: 10/07/2025").await.unwrap();
        assert!(store
            .mark_notified("car.pdf", date(2025, 7, 10), Utc::now())
            .await
            .unwrap());

        pool.close().await;
        let err = store
            .upload("car.pdf", "due date: 10/07/2025")
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Database(_)));

        let reopened = PolicyStore::new(db::connect(&path).await.unwrap());
        let stored = reopened.get("car.pdf").await.unwrap().unwrap();
        assert!(stored.notified);
        assert_eq!(stored.state(), PolicyState::Notified);
    }

    #[tokio::test]
    async fn test_reupload_replaces_unreadable_row() {
        let (_tmp, store) = store().await;
        sqlx::query(
            "INSERT INTO policies (name, due_date, last_checked, notified, uploaded_at) VALUES ('car.pdf', 'someday', NULL, 1, 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        assert!(store.get("car.pdf").await.is_err());

        let policy = store.upload("car.pdf", "due date: 10/07/2025").await.unwrap();
        assert!(!policy.notified);
        assert_eq!(
            store.get("car.pdf").await.unwrap().unwrap().due_date,
            Some(date(2025, 7, 10))
        );
    }

    #[tokio::test]
    async fn test_mark_notified_only_once() {
        let (_tmp, store) = store().await;
        store.upload("car.pdf", "due date: 10/07/2025").await.unwrap();
        let at = Utc::now();
        assert!(store.mark_notified("car.pdf", date(2025, 7, 10), at).await.unwrap());
        assert!(!store.mark_notified("car.pdf", date(2025, 7, 10), at).await.unwrap());
        assert!(store.unnotified_names().await.unwrap().is_empty());
    }
}
