//! Output formatting shared by the tool layer.
//!
//! Every columnar tool output goes through [`render_table`], whose
//! leading `▶` row lets the post-tool display collaborator align the
//! header without re-parsing — the renderer here must stay the single
//! source of column order.

use chrono::{DateTime, Local, Utc};

/// Render a columnar table with a `▶`-marked header row.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let columns = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().take(columns).enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format_row("\u{25b6}  ", headers.iter().map(|h| h.to_string()), &widths));
    for row in rows {
        lines.push(format_row("   ", row.iter().cloned(), &widths));
    }
    lines.join("\n")
}

fn format_row(prefix: &str, cells: impl Iterator<Item = String>, widths: &[usize]) -> String {
    let mut line = String::from(prefix);
    let last = widths.len().saturating_sub(1);
    for (i, cell) in cells.enumerate() {
        if i == last {
            line.push_str(&cell);
        } else {
            let pad = widths[i].saturating_sub(cell.chars().count());
            line.push_str(&cell);
            line.push_str(&" ".repeat(pad + 2));
        }
    }
    line.trim_end().to_string()
}

/// Idle time in BSD `w(1)` style: `0m`, `3m`, `2h`, `1d`.
pub fn format_idle(last_active: DateTime<Utc>) -> String {
    let seconds = (Utc::now() - last_active).num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if days > 0 {
        format!("{days}d")
    } else if hours > 0 {
        format!("{hours}h")
    } else {
        format!("{minutes}m")
    }
}

/// A timestamp in the invoking session's local zone: `Sun Feb 15 14:01`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%a %b %d %H:%M").to_string()
}

/// Duration between two instants as `H:MM`.
pub fn format_duration(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let seconds = (to - from).num_seconds().max(0);
    format!("{}:{:02}", seconds / 3600, (seconds % 3600) / 60)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Column index (in characters, not bytes — the sentinel is
    /// multi-byte) where `needle` starts in `line`.
    fn char_col(line: &str, needle: &str) -> usize {
        let byte = line.find(needle).unwrap();
        line[..byte].chars().count()
    }

    #[test]
    fn table_header_carries_sentinel() {
        let out = render_table(
            &["NAME", "PLAN"],
            &[
                vec!["@kai".to_string(), "fixing auth".to_string()],
                vec!["@eric".to_string(), "-".to_string()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with('\u{25b6}'));
        assert!(lines[0].contains("NAME"));
        assert!(lines[1].contains("@kai"));
        // Columns align: PLAN starts at the same column in every row.
        let plan_col = char_col(lines[0], "PLAN");
        assert_eq!(char_col(lines[1], "fixing auth"), plan_col);
    }

    #[test]
    fn table_widths_fit_widest_cell() {
        let out = render_table(
            &["A", "B"],
            &[vec!["very-long-cell".to_string(), "x".to_string()]],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(char_col(lines[1], "x"), char_col(lines[0], "B"));
    }

    #[test]
    fn idle_buckets() {
        let now = Utc::now();
        assert_eq!(format_idle(now), "0m");
        assert_eq!(format_idle(now - Duration::from_secs(3 * 60)), "3m");
        assert_eq!(format_idle(now - Duration::from_secs(2 * 3600)), "2h");
        assert_eq!(format_idle(now - Duration::from_secs(30 * 24 * 3600)), "30d");
        // Clock skew never yields negative idle.
        assert_eq!(format_idle(now + Duration::from_secs(60)), "0m");
    }

    #[test]
    fn duration_h_mm() {
        let start = Utc::now();
        assert_eq!(
            format_duration(start, start + Duration::from_secs(7 * 3600 + 22 * 60)),
            "7:22"
        );
        assert_eq!(format_duration(start, start), "0:00");
        // Logout before login (skewed clocks) clamps to zero.
        assert_eq!(format_duration(start, start - Duration::from_secs(60)), "0:00");
    }
}
