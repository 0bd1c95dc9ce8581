//! Check-run output rendering.

use runnergrid_state::{CheckOutput, CheckStatus, Conclusion, StepStatus};

/// Upstream limit on `output.text`, in characters.
pub const MAX_TEXT_CHARS: usize = 65_535;

pub fn conclusion_label(conclusion: Conclusion) -> &'static str {
    match conclusion {
        Conclusion::Success => "Succeeded",
        Conclusion::Failure => "Failed",
        Conclusion::Cancelled => "Cancelled",
        Conclusion::Skipped => "Skipped",
        Conclusion::TimedOut => "Timed Out",
        Conclusion::ActionRequired => "Action Required",
        Conclusion::Neutral => "Neutral",
    }
}

fn conclusion_summary(name: &str, conclusion: Conclusion) -> String {
    match conclusion {
        Conclusion::Success => format!("Job {name} completed successfully."),
        Conclusion::Failure => format!("Job {name} failed."),
        Conclusion::Cancelled => format!("Job {name} was cancelled."),
        Conclusion::Skipped => format!("Job {name} was skipped."),
        Conclusion::TimedOut => format!("Job {name} exceeded its time limit."),
        Conclusion::ActionRequired => format!("Job {name} needs attention before it can continue."),
        Conclusion::Neutral => format!("Job {name} finished without a verdict."),
    }
}

pub fn started_output(name: &str) -> CheckOutput {
    CheckOutput {
        title: "Job Started".to_string(),
        summary: format!("Job {name} is running."),
        text: None,
    }
}

pub fn completed_output(name: &str, conclusion: Conclusion) -> CheckOutput {
    CheckOutput {
        title: format!("Job {}", conclusion_label(conclusion)),
        summary: conclusion_summary(name, conclusion),
        text: None,
    }
}

fn status_label(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Queued => "queued",
        CheckStatus::InProgress => "in progress",
        CheckStatus::Completed => "completed",
    }
}

/// Markdown table of steps, in step-number order.
pub fn steps_table(steps: &[StepStatus]) -> String {
    let mut out = String::from("### Steps\n\n| # | Step | Status | Conclusion |\n|---|------|--------|------------|\n");
    for step in steps {
        let conclusion = step.conclusion.map_or("-", conclusion_label);
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            step.number,
            step.name.replace('|', "\\|"),
            status_label(step.status),
            conclusion
        ));
    }
    out
}

/// Insert or replace a step by number, keeping the list ordered.
pub fn merge_step(steps: &mut Vec<StepStatus>, step: StepStatus) {
    match steps.binary_search_by_key(&step.number, |s| s.number) {
        Ok(idx) => steps[idx] = step,
        Err(idx) => steps.insert(idx, step),
    }
}

/// The last `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Detail text: the steps table followed by the log tail, within the
/// upstream limit. Logs give way first.
pub fn detail_text(steps: &[StepStatus], logs: Option<&str>) -> Option<String> {
    let table = (!steps.is_empty()).then(|| steps_table(steps));
    let logs = logs.filter(|l| !l.is_empty());
    if table.is_none() && logs.is_none() {
        return None;
    }

    let mut text = table.unwrap_or_default();
    let table_len = text.chars().count();
    if table_len >= MAX_TEXT_CHARS {
        return Some(tail_chars(&text, MAX_TEXT_CHARS).to_string());
    }
    if let Some(logs) = logs {
        let header = if text.is_empty() { "### Logs\n\n```\n" } else { "\n### Logs\n\n```\n" };
        let footer = "\n```\n";
        let overhead = table_len + header.len() + footer.len();
        if overhead < MAX_TEXT_CHARS {
            text.push_str(header);
            text.push_str(tail_chars(logs, MAX_TEXT_CHARS - overhead));
            text.push_str(footer);
        }
    }
    Some(text)
}
