//! Interaction counts and recency. Every window looks backwards from the
//! as-of date; nothing is measured relative to a future renewal.

use super::{normalize_label, registry::windowed, NullReason, RowBuilder};
use crate::{asof::EntityView, config::FeatureConfig, sources::Sentiment};

fn is_complaint(kind: &str) -> bool {
    kind.to_lowercase().contains("complaint")
}

fn is_cancel_intent(intent: &str) -> bool {
    intent.to_lowercase().contains("cancel")
}

pub fn compute(view: &EntityView<'_>, cfg: &FeatureConfig, row: &mut RowBuilder) {
    let w = &cfg.windows;
    let all = view.interactions();
    row.flag("no_interaction", all.is_empty());

    for days in [w.short_days, w.medium_days, w.year_days] {
        row.num(
            windowed("interaction_count", days),
            Some(view.interactions_within(days).len() as f64),
            NullReason::NoInteraction,
        );
    }

    let recent = view.interactions_within(w.medium_days);
    let complaints = recent.iter().filter(|i| is_complaint(&i.kind)).count();
    let negative = recent.iter().filter(|i| i.sentiment == Some(Sentiment::Negative)).count();
    let cancel = recent.iter().any(|i| i.intent.as_deref().is_some_and(is_cancel_intent));
    row.num(windowed("complaint_count", w.medium_days), Some(complaints as f64), NullReason::NoInteraction);
    row.num(windowed("negative_sentiment_count", w.medium_days), Some(negative as f64), NullReason::NoInteraction);
    row.flag(windowed("has_cancel_intent", w.medium_days), cancel);

    let last = all.last();
    row.num(
        "days_since_last_interaction",
        last.map(|i| (view.asof - i.ts.date()).num_days() as f64),
        NullReason::NoInteraction,
    );
    // Latest annotated interaction, which need not be the latest one.
    let last_sentiment = all.iter().rev().find_map(|i| i.sentiment);
    row.cat("last_sentiment", last_sentiment.map(|s| s.as_str().to_string()), NullReason::NoInteraction);
    let last_intent = all.iter().rev().find_map(|i| i.intent.as_deref()).map(normalize_label);
    row.cat("last_intent", last_intent, NullReason::NoInteraction);
}
