//! The point-in-time boundary.
//!
//! RULE: every source read passes through `AsOfSnapshot::build`, exactly once
//! per run. That is the only place a raw timestamp is parsed and the only
//! place the `date(ts) <= asof` filter is applied. Feature code receives an
//! `EntityView` and cannot reach a record timestamped after the as-of date.
//!
//! The as-of day is inclusive: anything stamped on the as-of date itself,
//! at any time of day, is visible.

use crate::{
    error::{ChurnError, ChurnResult},
    grain::TimedValue,
    sources::{parse_date, parse_timestamp, ContractStatus, CustomerProfile, Fuel, PricePoint,
              Sentiment, SourceSnapshot},
    types::{Date, EntityId, Timestamp},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-source outcome of the central filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilterReport {
    pub source:    String,
    pub read:      usize,
    pub visible:   usize,
    /// Unparseable timestamp or date.
    pub malformed: usize,
    /// Stamped after the as-of date.
    pub future:    usize,
    /// Parsed fine but carried a non-finite value.
    pub invalid:   usize,
}

impl SourceFilterReport {
    fn new(source: &str, read: usize) -> Self {
        Self { source: source.into(), read, ..Default::default() }
    }

    pub fn excluded(&self) -> usize {
        self.malformed + self.future + self.invalid
    }
}

/// A contract as it stood on the as-of date.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractView {
    pub contract_id: String,
    pub start:       Date,
    pub end:         Option<Date>,
    pub status:      ContractStatus,
    pub term_months: u32,
    pub fuel:        Fuel,
}

impl ContractView {
    /// Status on `asof`, derived from dates where the dates decide it.
    ///
    /// A source status reflects the moment of extraction, which may be
    /// after the as-of date, so it is only trusted when nothing dated
    /// settles the question:
    ///   - an end on or before `asof` means ended
    ///   - `pending` stays pending
    ///   - `ended` with no end date stays ended
    ///   - anything else is active
    fn status_as_of(source: ContractStatus, end: Option<Date>, asof: Date) -> ContractStatus {
        match (source, end) {
            (_, Some(e)) if e <= asof           => ContractStatus::Ended,
            (ContractStatus::Pending, _)        => ContractStatus::Pending,
            (ContractStatus::Ended, None)       => ContractStatus::Ended,
            _                                   => ContractStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionView {
    pub ts:        Timestamp,
    pub seq:       usize,
    pub channel:   String,
    pub kind:      String,
    pub sentiment: Option<Sentiment>,
    pub intent:    Option<String>,
}

/// Everything visible about one entity at the as-of date. Series are
/// sorted by (timestamp, ingestion order).
#[derive(Debug, Clone, Default)]
pub struct EntityHistory {
    pub profile:      Option<CustomerProfile>,
    pub contracts:    Vec<ContractView>,
    pub consumption:  Vec<TimedValue>,
    /// Monthly billed margin (revenue − cost), stamped at period close.
    pub margin:       Vec<TimedValue>,
    pub interactions: Vec<InteractionView>,
}

impl EntityHistory {
    fn is_empty(&self) -> bool {
        self.profile.is_none()
            && self.contracts.is_empty()
            && self.consumption.is_empty()
            && self.margin.is_empty()
            && self.interactions.is_empty()
    }

    fn sort(&mut self) {
        self.consumption.sort_by_key(|p| (p.ts, p.seq));
        self.margin.sort_by_key(|p| (p.ts, p.seq));
        self.interactions.sort_by_key(|i| (i.ts, i.seq));
        self.contracts.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.contract_id.cmp(&b.contract_id)));
    }
}

/// The filtered, read-only source state for one run.
#[derive(Debug, Clone)]
pub struct AsOfSnapshot {
    asof:       Date,
    entities:   BTreeMap<EntityId, EntityHistory>,
    tariffs:    BTreeMap<String, Vec<TimedValue>>,
    benchmarks: BTreeMap<String, Vec<TimedValue>>,
    reports:    Vec<SourceFilterReport>,
    empty:      EntityHistory,
}

impl AsOfSnapshot {
    /// Apply the point-in-time filter to every source.
    pub fn build(sources: &SourceSnapshot, asof: Date) -> Self {
        let visible = |ts: &Timestamp| ts.date() <= asof;
        let mut entities: BTreeMap<EntityId, EntityHistory> = BTreeMap::new();
        let mut reports = Vec::new();

        // Profiles carry no timestamp and are always visible.
        let mut report = SourceFilterReport::new("customers", sources.customers.len());
        for c in &sources.customers {
            entities.entry(c.customer_id.clone()).or_default().profile = Some(c.clone());
            report.visible += 1;
        }
        reports.push(report);

        let mut report = SourceFilterReport::new("contracts", sources.contracts.len());
        for c in &sources.contracts {
            let Some(start) = parse_date(&c.start_date) else {
                report.malformed += 1;
                continue;
            };
            let end = match c.end_date.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(raw) => match parse_date(raw) {
                    Some(d) => Some(d),
                    None => {
                        report.malformed += 1;
                        continue;
                    }
                },
                None => None,
            };
            if start > asof {
                report.future += 1;
                continue;
            }
            report.visible += 1;
            entities.entry(c.customer_id.clone()).or_default().contracts.push(ContractView {
                contract_id: c.contract_id.clone(),
                start,
                end,
                status:      ContractView::status_as_of(c.status, end, asof),
                term_months: c.term_months,
                fuel:        c.fuel,
            });
        }
        reports.push(report);

        let mut report = SourceFilterReport::new("consumption", sources.consumption.len());
        for (seq, r) in sources.consumption.iter().enumerate() {
            let Some(ts) = parse_timestamp(&r.timestamp) else {
                report.malformed += 1;
                continue;
            };
            if !visible(&ts) {
                report.future += 1;
                continue;
            }
            if !r.kwh.is_finite() {
                report.invalid += 1;
                continue;
            }
            report.visible += 1;
            entities.entry(r.customer_id.clone()).or_default()
                .consumption.push(TimedValue { ts, value: r.kwh, seq });
        }
        reports.push(report);

        let mut report = SourceFilterReport::new("billing", sources.billing.len());
        for (seq, b) in sources.billing.iter().enumerate() {
            let Some(ts) = parse_timestamp(&b.period) else {
                report.malformed += 1;
                continue;
            };
            if !visible(&ts) {
                report.future += 1;
                continue;
            }
            let margin = b.revenue - b.cost;
            if !margin.is_finite() {
                report.invalid += 1;
                continue;
            }
            report.visible += 1;
            entities.entry(b.customer_id.clone()).or_default()
                .margin.push(TimedValue { ts, value: margin, seq });
        }
        reports.push(report);

        let mut report = SourceFilterReport::new("interactions", sources.interactions.len());
        for (seq, i) in sources.interactions.iter().enumerate() {
            let Some(ts) = parse_timestamp(&i.timestamp) else {
                report.malformed += 1;
                continue;
            };
            if !visible(&ts) {
                report.future += 1;
                continue;
            }
            report.visible += 1;
            entities.entry(i.customer_id.clone()).or_default().interactions.push(InteractionView {
                ts,
                seq,
                channel:   i.channel.clone(),
                kind:      i.kind.clone(),
                sentiment: i.sentiment,
                intent:    i.intent.clone(),
            });
        }
        reports.push(report);

        let (tariffs, report) = filter_prices("tariff_prices", &sources.tariff_prices, asof);
        reports.push(report);
        let (benchmarks, report) = filter_prices("benchmark_prices", &sources.benchmark_prices, asof);
        reports.push(report);

        entities.retain(|_, h| !h.is_empty());
        for history in entities.values_mut() {
            history.sort();
        }

        for r in reports.iter().filter(|r| r.excluded() > 0) {
            log::info!(
                "asof={asof} sources: {} excluded {} of {} (malformed={}, future={}, invalid={})",
                r.source, r.excluded(), r.read, r.malformed, r.future, r.invalid
            );
        }

        Self { asof, entities, tariffs, benchmarks, reports, empty: EntityHistory::default() }
    }

    pub fn asof(&self) -> Date {
        self.asof
    }

    pub fn reports(&self) -> &[SourceFilterReport] {
        &self.reports
    }

    /// The view for one entity. Entities absent from every source get an
    /// empty view rather than an error.
    pub fn entity<'a>(&'a self, entity_id: &'a str) -> EntityView<'a> {
        let history = self.entities.get(entity_id);
        let region = history
            .and_then(|h| h.profile.as_ref())
            .map(|p| p.region.as_str());
        EntityView {
            entity_id,
            asof:      self.asof,
            covered:   history.is_some(),
            history:   history.unwrap_or(&self.empty),
            tariff:    region.and_then(|r| self.tariffs.get(r)).map(Vec::as_slice).unwrap_or(&[]),
            benchmark: region.and_then(|r| self.benchmarks.get(r)).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// Re-check the filter over everything the snapshot retained.
    /// Any hit is a defect in `build`, not a data problem.
    pub fn verify_point_in_time(&self) -> ChurnResult<()> {
        for (entity_id, _) in self.entities.iter() {
            self.entity(entity_id).verify()?;
        }
        for (region, series) in self.tariffs.iter().chain(self.benchmarks.iter()) {
            if let Some(p) = series.iter().find(|p| p.ts.date() > self.asof) {
                return Err(ChurnError::LeakageViolation {
                    entity_id: format!("region:{region}"),
                    feature:   "price".into(),
                    asof:      self.asof,
                    observed:  p.ts.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn filter_prices(
    source: &str,
    points: &[PricePoint],
    asof: Date,
) -> (BTreeMap<String, Vec<TimedValue>>, SourceFilterReport) {
    let mut report = SourceFilterReport::new(source, points.len());
    let mut by_region: BTreeMap<String, Vec<TimedValue>> = BTreeMap::new();
    for (seq, p) in points.iter().enumerate() {
        let Some(ts) = parse_timestamp(&p.timestamp) else {
            report.malformed += 1;
            continue;
        };
        if ts.date() > asof {
            report.future += 1;
            continue;
        }
        if !p.price.is_finite() {
            report.invalid += 1;
            continue;
        }
        report.visible += 1;
        by_region.entry(p.region.clone()).or_default().push(TimedValue { ts, value: p.price, seq });
    }
    for series in by_region.values_mut() {
        series.sort_by_key(|p| (p.ts, p.seq));
    }
    (by_region, report)
}

/// First day of a trailing window of `days` ending on (and including) `asof`.
/// A window reaching past the calendar's first date starts there.
pub fn window_start(asof: Date, days: u32) -> Date {
    asof.checked_sub_signed(Duration::days(i64::from(days.max(1)) - 1))
        .unwrap_or(Date::MIN)
}

/// Read-only, already-filtered data for one entity.
#[derive(Debug, Clone, Copy)]
pub struct EntityView<'a> {
    pub entity_id: &'a str,
    pub asof:      Date,
    /// False when the entity appears in no source at all.
    pub covered:   bool,
    history:       &'a EntityHistory,
    tariff:        &'a [TimedValue],
    benchmark:     &'a [TimedValue],
}

impl<'a> EntityView<'a> {
    pub fn profile(&self) -> Option<&'a CustomerProfile> {
        self.history.profile.as_ref()
    }

    pub fn contracts(&self) -> &'a [ContractView] {
        &self.history.contracts
    }

    pub fn consumption(&self) -> &'a [TimedValue] {
        &self.history.consumption
    }

    pub fn margin(&self) -> &'a [TimedValue] {
        &self.history.margin
    }

    pub fn interactions(&self) -> &'a [InteractionView] {
        &self.history.interactions
    }

    pub fn tariff(&self) -> &'a [TimedValue] {
        self.tariff
    }

    pub fn benchmark(&self) -> &'a [TimedValue] {
        self.benchmark
    }

    /// Points of `series` inside the trailing window of `days`.
    pub fn trailing(&self, series: &'a [TimedValue], days: u32) -> &'a [TimedValue] {
        let start = window_start(self.asof, days);
        let from = series.partition_point(|p| p.ts.date() < start);
        &series[from..]
    }

    pub fn interactions_within(&self, days: u32) -> &'a [InteractionView] {
        let start = window_start(self.asof, days);
        let all = self.interactions();
        let from = all.partition_point(|i| i.ts.date() < start);
        &all[from..]
    }

    /// Contracts active on the as-of date, ordered by the tie-break rule:
    /// latest start first, then contract id.
    pub fn active_contracts(&self) -> Vec<&'a ContractView> {
        let mut active: Vec<&ContractView> = self.contracts().iter()
            .filter(|c| c.status == ContractStatus::Active)
            .collect();
        active.sort_by(|a, b| b.start.cmp(&a.start).then_with(|| a.contract_id.cmp(&b.contract_id)));
        active
    }

    /// Latest observation timestamp across every entity-level series.
    pub fn latest_observation(&self) -> Option<Timestamp> {
        let series = self.consumption().iter().chain(self.margin()).map(|p| p.ts);
        let events = self.interactions().iter().map(|i| i.ts);
        let prices = self.tariff.iter().chain(self.benchmark).map(|p| p.ts);
        series.chain(events).chain(prices).max()
    }

    /// Fails with `LeakageViolation` if anything reachable from this view
    /// is dated after the as-of date.
    pub fn verify(&self) -> ChurnResult<()> {
        let leak = |feature: &str, observed: String| ChurnError::LeakageViolation {
            entity_id: self.entity_id.to_string(),
            feature:   feature.into(),
            asof:      self.asof,
            observed,
        };
        if let Some(ts) = self.latest_observation().filter(|ts| ts.date() > self.asof) {
            return Err(leak("observation", ts.to_string()));
        }
        if let Some(c) = self.contracts().iter().find(|c| c.start > self.asof) {
            return Err(leak("contract_start", c.start.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ContractRecord, InteractionRecord, MeterReading};
    use chrono::NaiveDate;

    fn d(s: &str) -> Date {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn reading(id: &str, ts: &str, kwh: f64) -> MeterReading {
        MeterReading { customer_id: id.into(), timestamp: ts.into(), kwh }
    }

    #[test]
    fn as_of_day_is_inclusive() {
        let sources = SourceSnapshot {
            consumption: vec![
                reading("C1", "2026-02-01T23:00:00", 1.0),
                reading("C1", "2026-02-02T00:00:00", 9.0),
            ],
            ..Default::default()
        };
        let snap = AsOfSnapshot::build(&sources, d("2026-02-01"));
        let view = snap.entity("C1");
        assert_eq!(view.consumption().len(), 1);
        assert_eq!(view.consumption()[0].value, 1.0);
        let report = &snap.reports()[2];
        assert_eq!((report.visible, report.future), (1, 1));
        snap.verify_point_in_time().unwrap();
    }

    #[test]
    fn malformed_records_are_counted_not_fatal() {
        let sources = SourceSnapshot {
            consumption: vec![reading("C1", "not-a-time", 1.0), reading("C1", "2026-01-05", f64::NAN)],
            interactions: vec![InteractionRecord {
                customer_id: "C1".into(),
                timestamp:   "".into(),
                channel:     "phone".into(),
                kind:        "complaint".into(),
                sentiment:   None,
                intent:      None,
            }],
            ..Default::default()
        };
        let snap = AsOfSnapshot::build(&sources, d("2026-02-01"));
        let consumption = &snap.reports()[2];
        assert_eq!(consumption.malformed, 1);
        assert_eq!(consumption.invalid, 1);
        assert_eq!(snap.reports()[4].malformed, 1);
        assert!(!snap.entity("C1").covered);
    }

    #[test]
    fn contract_status_is_derived_as_of() {
        let contract = |id: &str, start: &str, end: Option<&str>, status| ContractRecord {
            contract_id: id.into(),
            customer_id: "C1".into(),
            start_date:  start.into(),
            end_date:    end.map(Into::into),
            status,
            term_months: 12,
            fuel:        Fuel::Electricity,
        };
        let sources = SourceSnapshot {
            contracts: vec![
                // ended after the as-of date: still active then
                contract("K1", "2025-03-01", Some("2026-03-01"), ContractStatus::Ended),
                contract("K2", "2024-01-01", Some("2025-01-01"), ContractStatus::Active),
                contract("K3", "2026-06-01", None, ContractStatus::Active),
            ],
            ..Default::default()
        };
        let snap = AsOfSnapshot::build(&sources, d("2026-02-01"));
        let view = snap.entity("C1");
        assert_eq!(view.contracts().len(), 2, "future-start contract is not visible");
        let active = view.active_contracts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].contract_id, "K1");
        assert_eq!(snap.reports()[1].future, 1);
    }

    #[test]
    fn trailing_window_edges() {
        let sources = SourceSnapshot {
            consumption: vec![
                reading("C1", "2025-11-03T00:00:00", 1.0), // day 91 back
                reading("C1", "2025-11-04T00:00:00", 2.0), // first day of 90d window
                reading("C1", "2026-02-01T12:00:00", 3.0),
            ],
            ..Default::default()
        };
        let snap = AsOfSnapshot::build(&sources, d("2026-02-01"));
        let view = snap.entity("C1");
        let w = view.trailing(view.consumption(), 90);
        assert_eq!(w.iter().map(|p| p.value).collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn window_longer_than_the_calendar_starts_at_its_first_day() {
        assert_eq!(window_start(d("2026-02-01"), 30), d("2026-01-03"));
        assert_eq!(window_start(d("2026-02-01"), u32::MAX), Date::MIN);
    }
}
