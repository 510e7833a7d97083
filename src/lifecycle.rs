use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Lateness is evaluated once, when the submission row is written. Editing the
/// assignment's due date afterwards does not retroactively reflag rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accept { is_late: bool },
    Closed,
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A per-student deadline override always wins over the assignment due date,
/// regardless of which is earlier.
pub fn effective_deadline(
    deadline_override: Option<DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    deadline_override.or(due_date)
}

pub fn evaluate_submission(
    now: DateTime<Utc>,
    effective_deadline: Option<DateTime<Utc>>,
    allow_late: bool,
) -> SubmitOutcome {
    let is_late = match effective_deadline {
        Some(deadline) => now > deadline,
        None => false,
    };
    if is_late && !allow_late {
        SubmitOutcome::Closed
    } else {
        SubmitOutcome::Accept { is_late }
    }
}

pub fn grade_percent(grade: i64, points: i64) -> f64 {
    if points <= 0 {
        return 0.0;
    }
    100.0 * (grade as f64) / (points as f64)
}

pub const GRADE_BIN_COUNT: usize = 10;

pub fn grade_bin_label(bin: usize) -> String {
    if bin == 0 {
        "0-10%".to_string()
    } else {
        format!("{}-{}%", bin * 10 + 1, (bin + 1) * 10)
    }
}

/// Ten inclusive bins over [0, 100]: [0-10], [11-20], ..., [91-100].
/// A 0% grade lands in bin 0; a 100% grade lands in bin 9.
pub fn grade_bin(percent: f64) -> usize {
    if percent <= 10.0 {
        return 0;
    }
    let bin = ((percent - 10.0) / 10.0).ceil() as usize;
    bin.min(GRADE_BIN_COUNT - 1)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBucket {
    pub range: String,
    pub count: u64,
}

pub fn grade_distribution(percents: &[f64]) -> Vec<GradeBucket> {
    let mut counts = [0u64; GRADE_BIN_COUNT];
    for &p in percents {
        counts[grade_bin(p)] += 1;
    }
    counts
        .iter()
        .enumerate()
        .map(|(bin, &count)| GradeBucket {
            range: grade_bin_label(bin),
            count,
        })
        .collect()
}

pub const AT_RISK_MISSING_THRESHOLD: i64 = 3;

pub fn missing_count(assigned: i64, submitted: i64) -> i64 {
    (assigned - submitted).max(0)
}

pub fn is_at_risk(missing: i64) -> bool {
    missing >= AT_RISK_MISSING_THRESHOLD
}

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Short human-shareable enrollment code. Uniqueness is enforced by the
/// classes.class_code constraint; callers retry on collision.
pub fn generate_class_code() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    bytes
        .iter()
        .take(CODE_LEN)
        .map(|b| CODE_ALPHABET[(*b as usize) % CODE_ALPHABET.len()] as char)
        .collect()
}
