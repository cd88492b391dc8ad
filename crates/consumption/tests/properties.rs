//! Property tests for period pairing and the rollups built on it.

use consumption::{round2, ConsumptionAggregator, Event};
use proptest::prelude::*;
use time::macros::offset;
use time::OffsetDateTime;

const SENSORS: [&str; 3] = ["sensor1", "sensor2", "sensor_test"];
const ACTIONS: [&str; 4] = ["Riego ON", "Riego OFF", "Humedad registrada", "riego automático on"];

/// Logs with strictly increasing timestamps, so no two events tie.
fn event_log() -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec((0usize..3, 0usize..4, 1i64..900), 0..60).prop_map(|rows| {
        let mut ts = 1_710_000_000;
        rows.into_iter()
            .map(|(s, a, gap)| {
                ts += gap;
                Event::new(SENSORS[s], ACTIONS[a], ts)
            })
            .collect()
    })
}

fn log_and_shuffle() -> impl Strategy<Value = (Vec<Event>, Vec<Event>)> {
    event_log().prop_flat_map(|events| {
        let shuffled = Just(events.clone()).prop_shuffle();
        (Just(events), shuffled)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Input order does not matter once timestamps are distinct.
    #[test]
    fn prop_order_independent((events, shuffled) in log_and_shuffle()) {
        let agg = ConsumptionAggregator::default();
        prop_assert_eq!(agg.periods(&events), agg.periods(&shuffled));
    }

    /// Periods never run backwards and never produce negative volume.
    #[test]
    fn prop_periods_well_formed(events in event_log()) {
        for p in ConsumptionAggregator::default().periods(&events) {
            prop_assert!(p.end_ts >= p.start_ts);
            prop_assert_eq!(p.duration_secs, p.end_ts - p.start_ts);
            prop_assert!(p.liters >= 0.0);
        }
    }

    /// The total is the rounded sum of the rounded per-period values.
    #[test]
    fn prop_total_is_two_stage_rounded(events in event_log()) {
        let t = ConsumptionAggregator::default().total(&events);
        let reference = round2(t.periods.iter().fold(0.0, |acc, p| acc + p.liters));
        prop_assert_eq!(t.total_liters, reference);
        prop_assert_eq!(t.period_count, t.periods.len());
    }

    /// Day and sensor breakdowns partition the same period list.
    #[test]
    fn prop_breakdowns_cover_every_period(events in event_log()) {
        let agg = ConsumptionAggregator::new(1.67, offset!(-3));
        let total = agg.total(&events).period_count;

        let by_day: usize = agg.by_day(&events).iter().map(|d| d.period_count).sum();
        let by_sensor: usize = agg.by_sensor(&events).iter().map(|s| s.period_count).sum();
        prop_assert_eq!(by_day, total);
        prop_assert_eq!(by_sensor, total);
    }

    /// Today is always a subset of the full list.
    #[test]
    fn prop_today_is_subset(events in event_log(), hour in 0i64..72) {
        let agg = ConsumptionAggregator::default();
        let now = OffsetDateTime::from_unix_timestamp(1_710_000_000 + hour * 3600).unwrap();
        let today = agg.today(&events, now);
        let all = agg.periods(&events);
        prop_assert!(today.periods.iter().all(|p| all.contains(p)));
    }
}

#[test]
fn double_on_is_overwritten_not_closed() {
    let events = vec![
        Event::new("sensor1", "ON", 10),
        Event::new("sensor1", "ON", 20),
        Event::new("sensor1", "OFF", 80),
    ];
    let periods = ConsumptionAggregator::default().periods(&events);
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].start_ts, 20);
}

#[test]
fn every_permutation_of_small_log() {
    let base = vec![
        Event::new("sensor1", "ON", 10),
        Event::new("sensor2", "ON", 15),
        Event::new("sensor1", "OFF", 70),
        Event::new("sensor2", "OFF", 95),
    ];
    let agg = ConsumptionAggregator::default();
    let expected = agg.periods(&base);
    assert_eq!(expected.len(), 2);

    let idx = [0usize, 1, 2, 3];
    for a in idx {
        for b in idx {
            for c in idx {
                for d in idx {
                    let order = [a, b, c, d];
                    let mut seen = [false; 4];
                    if order.iter().any(|&i| std::mem::replace(&mut seen[i], true)) {
                        continue;
                    }
                    let permuted: Vec<Event> = order.iter().map(|&i| base[i].clone()).collect();
                    assert_eq!(agg.periods(&permuted), expected, "order {order:?}");
                }
            }
        }
    }
}
