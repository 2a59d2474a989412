//! Compact output rendering helpers for CLI surfaces.

/// Output format shared by every command group.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Render a list of store ids, bounded for terminal display.
pub fn preview_ids(ids: &[i64], max_items: usize) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    let shown = ids
        .iter()
        .take(max_items)
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > max_items {
        format!("{} (+{} more)", shown, ids.len() - max_items)
    } else {
        shown
    }
}

/// Human-readable age of an epoch timestamp relative to `now`.
pub fn age(ts: Option<i64>, now: i64) -> String {
    let Some(ts) = ts else {
        return "never".to_string();
    };
    let secs = (now - ts).max(0);
    match secs {
        s if s < 60 => format!("{}s ago", s),
        s if s < 3_600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3_600),
        s => format!("{}d ago", s / 86_400),
    }
}
