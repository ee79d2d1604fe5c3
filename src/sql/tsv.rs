//! TSV row formatting and streaming byte-budget accounting.
//!
//! Every query executor funnels its output through a single
//! [`TsvAccumulator`] so the truncation rule is implemented exactly once and
//! applied identically regardless of backend.

/// Quote and escape a single field using RFC 4180-style minimal quoting: a
/// field is wrapped in double quotes only if it contains a tab, a quote, or
/// a line ending, and embedded quotes are doubled.
fn quote_field(value: &str) -> String {
    if value.contains('\t') || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('"');
        for ch in value.chars() {
            if ch == '"' {
                quoted.push('"');
            }
            quoted.push(ch);
        }
        quoted.push('"');
        quoted
    } else {
        value.to_string()
    }
}

/// Render one tab-separated line (no trailing newline) from already
/// stringified, NULL-normalized field values.
pub fn format_tsv_line(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote_field(v))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Render a full TSV document: an optional header line followed by rows.
/// Used by tests and by callers that already have every row in hand.
pub fn format_stream(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    if !columns.is_empty() {
        lines.push(format_tsv_line(columns));
    }
    for row in rows {
        lines.push(format_tsv_line(row));
    }
    lines.join("\n")
}

/// Incremental TSV builder enforcing the streaming byte cap.
///
/// The first line pushed (header, or first row when an executor has no
/// separate header concept) is always admitted even if it alone exceeds the
/// budget; every subsequent line is admitted only if doing so keeps the
/// running total within `max_result_bytes`. A `max_result_bytes` of 0 means
/// unlimited.
pub struct TsvAccumulator {
    lines: Vec<String>,
    total_bytes: u64,
    max_bytes: u64,
    truncated: bool,
    any_line: bool,
}

impl TsvAccumulator {
    pub fn new(max_result_bytes: u64) -> Self {
        Self {
            lines: Vec::new(),
            total_bytes: 0,
            max_bytes: max_result_bytes,
            truncated: false,
            any_line: false,
        }
    }

    /// Force-append `line` regardless of the byte budget. Intended for the
    /// header line (or the first row, where no header exists).
    pub fn push_forced(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.total_bytes += line.len() as u64 + 1;
        self.lines.push(line);
        self.any_line = true;
    }

    /// Attempt to append `line`, respecting the byte budget. Returns
    /// `false` and marks the stream truncated if the budget would be
    /// exceeded; subsequent calls after a truncation also return `false`
    /// without touching the buffer.
    pub fn try_push(&mut self, line: impl Into<String>) -> bool {
        if self.truncated {
            return false;
        }
        let line = line.into();
        let candidate = self.total_bytes + line.len() as u64 + 1;
        if self.max_bytes > 0 && self.any_line && candidate > self.max_bytes {
            self.truncated = true;
            return false;
        }
        self.total_bytes = candidate;
        self.lines.push(line);
        self.any_line = true;
        true
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Consume the accumulator, appending the truncation notice if needed.
    pub fn finish(mut self) -> String {
        if self.truncated {
            self.lines.push(format!(
                "[RESULT TRUNCATED: exceeded max_result_bytes={} bytes]",
                self.max_bytes
            ));
        }
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(format_tsv_line(&["plain".to_string()]), "plain");
        assert_eq!(
            format_tsv_line(&["a\tb".to_string()]),
            "\"a\tb\""
        );
        assert_eq!(
            format_tsv_line(&["she said \"hi\"".to_string()]),
            "\"she said \"\"hi\"\"\""
        );
    }

    #[test]
    fn format_stream_has_no_trailing_newline() {
        let out = format_stream(
            &["x".to_string()],
            &[vec!["1".to_string()], vec!["2".to_string()]],
        );
        assert_eq!(out, "x\n1\n2");
        assert!(!out.ends_with('\n'));
    }

    #[test]
    fn format_stream_without_columns() {
        let out = format_stream(&[], &[vec!["1".to_string()]]);
        assert_eq!(out, "1");
    }

    #[test]
    fn unlimited_budget_never_truncates() {
        let mut acc = TsvAccumulator::new(0);
        acc.push_forced("x");
        for i in 0..1000 {
            assert!(acc.try_push(i.to_string()));
        }
        assert!(!acc.truncated());
    }

    #[test]
    fn header_always_admitted_even_over_budget() {
        let mut acc = TsvAccumulator::new(1);
        acc.push_forced("header_longer_than_budget");
        assert!(!acc.truncated());
        assert!(!acc.try_push("row1"));
        assert!(acc.truncated());
        let out = acc.finish();
        assert!(out.starts_with("header_longer_than_budget\n"));
        assert!(out.ends_with("[RESULT TRUNCATED: exceeded max_result_bytes=1 bytes]"));
    }

    #[test]
    fn budget_exactly_header_length_yields_header_then_truncation() {
        let header = "abc";
        let mut acc = TsvAccumulator::new(header.len() as u64);
        acc.push_forced(header);
        assert!(!acc.try_push("x"));
        assert!(acc.truncated());
        let out = acc.finish();
        assert_eq!(
            out,
            "abc\n[RESULT TRUNCATED: exceeded max_result_bytes=3 bytes]"
        );
    }

    #[test]
    fn rows_fitting_exactly_are_kept() {
        let mut acc = TsvAccumulator::new(20);
        acc.push_forced("x");
        assert!(acc.try_push("1"));
        assert!(acc.try_push("2"));
        assert!(!acc.truncated());
        assert_eq!(acc.finish(), "x\n1\n2");
    }

    #[test]
    fn no_rows_and_no_header_forced_is_empty() {
        let acc = TsvAccumulator::new(100);
        assert_eq!(acc.finish(), "");
    }
}
