//! Deterministic feature augmentation.
//!
//! `augment` copies the input frame and appends engineered columns. Nothing is
//! learned: the same input always yields the same output. A derived column
//! whose source columns are missing is filled with its neutral default instead
//! of failing the whole pipeline.

use crate::features::FeatureSet;
use crate::frame::{category_key, Frame};
use std::collections::BTreeMap;
use tracing::debug;

/// Derived columns, in the order they are appended
pub const DERIVED_FEATURES: [&str; 12] = [
    "time_bend_ratio",
    "wind_course_complex",
    "temp_diff",
    "optimal_conditions",
    "racer_consistency",
    "motor_boat_harmony",
    "motor_boat_ratio",
    "wave_outer_advantage",
    "weather_optimal",
    "course_class_score",
    "racer_win_rate_zscore",
    "racer_winning_tendency",
];

/// Historical win-rate advantage by starting course (boat 1..=6)
pub const COURSE_ADVANTAGE: [f64; 6] = [1.0, 0.95, 0.82, 0.63, 0.39, 0.17];

const OFF_TABLE_COURSE_ADVANTAGE: f64 = 0.5;

/// Neutral value used when a derived column cannot be computed
pub fn neutral_default(name: &str) -> f64 {
    match name {
        "motor_boat_ratio" => 1.0,
        _ => 0.0,
    }
}

/// Append every derived column to a copy of `frame`
pub fn augment(frame: &Frame, features: &FeatureSet) -> Frame {
    let mut out = frame.clone();
    let groups = race_groups(frame, &features.race_key);

    for name in DERIVED_FEATURES {
        let values = derive(frame, name, groups.as_deref()).unwrap_or_else(|| {
            debug!("source columns for '{}' missing, using neutral default", name);
            vec![neutral_default(name); frame.n_rows()]
        });
        out.upsert(name.to_string(), values);
    }

    out
}

fn derive(frame: &Frame, name: &str, groups: Option<&[usize]>) -> Option<Vec<f64>> {
    match name {
        "time_bend_ratio" => zip2(frame, "motor_2ren", "exhibition_time", |motor, time| {
            motor / (time * time + 1.0)
        }),
        "wind_course_complex" => zip2(frame, "wind_direction", "boat_no", |dir, boat| {
            (dir * 45.0).to_radians().sin() * (boat - 3.5)
        }),
        "temp_diff" => zip2(frame, "temperature", "water_temperature", |air, water| {
            air - water
        }),
        "optimal_conditions" => map1(frame, "water_temperature", |w| {
            indicator((10.0..=30.0).contains(&w))
        }),
        "racer_consistency" => {
            let values = frame.column("racer_win_rate")?;
            let stats = group_stats(values, groups?);
            Some(stats.iter().map(|s| s.std).collect())
        }
        "motor_boat_harmony" => zip2(frame, "motor_2ren", "boat_2ren", |motor, boat| {
            (motor * boat).max(0.0).sqrt()
        }),
        "motor_boat_ratio" => zip2(frame, "motor_2ren", "boat_2ren", |motor, boat| {
            motor / (boat + 1.0)
        }),
        "wave_outer_advantage" => zip2(frame, "wave_height", "boat_no", |wave, boat| {
            indicator(wave > 2.0 && boat >= 4.0)
        }),
        "weather_optimal" => {
            let weather = frame.column("weather")?;
            let wind = frame.column("wind_speed")?;
            let wave = frame.column("wave_height")?;
            Some(
                (0..frame.n_rows())
                    .map(|i| {
                        let good_weather = matches!(category_key(weather[i]), 0 | 1);
                        let good_wind = (2.0..=4.0).contains(&wind[i]);
                        let good_wave = (1.0..=2.0).contains(&wave[i]);
                        indicator(good_weather && good_wind && good_wave)
                    })
                    .collect(),
            )
        }
        "course_class_score" => zip2(frame, "racer_win_rate", "boat_no", |rate, boat| {
            rate * course_advantage(boat)
        }),
        "racer_win_rate_zscore" => {
            let values = frame.column("racer_win_rate")?;
            let groups = groups?;
            let stats = group_stats(values, groups);
            Some(
                values
                    .iter()
                    .zip(stats.iter())
                    .map(|(&v, s)| if s.std > 0.0 { (v - s.mean) / s.std } else { 0.0 })
                    .collect(),
            )
        }
        "racer_winning_tendency" => {
            zip2(frame, "racer_win_rate", "racer_course_advantage", |rate, adv| rate * adv)
        }
        _ => None,
    }
}

fn map1(frame: &Frame, a: &str, f: impl Fn(f64) -> f64) -> Option<Vec<f64>> {
    Some(frame.column(a)?.iter().map(|&x| f(x)).collect())
}

fn zip2(frame: &Frame, a: &str, b: &str, f: impl Fn(f64, f64) -> f64) -> Option<Vec<f64>> {
    let left = frame.column(a)?;
    let right = frame.column(b)?;
    Some(left.iter().zip(right).map(|(&x, &y)| f(x, y)).collect())
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn course_advantage(boat: f64) -> f64 {
    match category_key(boat) {
        k @ 1..=6 => COURSE_ADVANTAGE[(k - 1) as usize],
        _ => OFF_TABLE_COURSE_ADVANTAGE,
    }
}

/// Group index per row, or `None` if any race-key column is absent
fn race_groups(frame: &Frame, race_key: &[String]) -> Option<Vec<usize>> {
    if race_key.is_empty() {
        return None;
    }
    let columns = frame.columns_for(race_key).ok()?;
    let mut ids: BTreeMap<Vec<u64>, usize> = BTreeMap::new();
    let groups = (0..frame.n_rows())
        .map(|row| {
            let key: Vec<u64> = columns.iter().map(|c| c[row].to_bits()).collect();
            let next = ids.len();
            *ids.entry(key).or_insert(next)
        })
        .collect();
    Some(groups)
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupStat {
    mean: f64,
    std: f64,
}

/// Per-row mean and sample standard deviation of `values` within its group.
/// Singleton groups get a standard deviation of 0.
fn group_stats(values: &[f64], groups: &[usize]) -> Vec<GroupStat> {
    let n_groups = groups.iter().max().map_or(0, |m| m + 1);
    let mut sums = vec![0.0; n_groups];
    let mut counts = vec![0usize; n_groups];
    for (&v, &g) in values.iter().zip(groups) {
        if v.is_finite() {
            sums[g] += v;
            counts[g] += 1;
        }
    }
    let means: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();

    let mut sq = vec![0.0; n_groups];
    for (&v, &g) in values.iter().zip(groups) {
        if v.is_finite() {
            sq[g] += (v - means[g]).powi(2);
        }
    }
    let stds: Vec<f64> = sq
        .iter()
        .zip(&counts)
        .map(|(&s, &c)| if c > 1 { (s / (c - 1) as f64).sqrt() } else { 0.0 })
        .collect();

    groups
        .iter()
        .map(|&g| GroupStat {
            mean: means[g],
            std: stds[g],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race_frame() -> Frame {
        Frame::from_columns(vec![
            ("date", vec![20240101.0, 20240101.0, 20240101.0, 20240102.0]),
            ("jyo_cd", vec![1.0, 1.0, 1.0, 1.0]),
            ("race_no", vec![1.0, 1.0, 1.0, 1.0]),
            ("boat_no", vec![1.0, 4.0, 6.0, 2.0]),
            ("racer_win_rate", vec![6.0, 4.0, 5.0, 7.0]),
            ("motor_2ren", vec![40.0, 30.0, 20.0, 35.0]),
            ("boat_2ren", vec![30.0, 30.0, 20.0, 35.0]),
            ("exhibition_time", vec![6.7, 6.8, 6.9, 6.75]),
            ("wave_height", vec![1.0, 3.0, 3.0, 1.5]),
        ])
        .unwrap()
    }

    #[test]
    fn test_augment_appends_all_derived_columns() {
        let frame = race_frame();
        let out = augment(&frame, &FeatureSet::default());
        for name in DERIVED_FEATURES {
            assert!(out.has_column(name), "missing {name}");
        }
        assert_eq!(out.n_rows(), frame.n_rows());
        assert_eq!(out.n_cols(), frame.n_cols() + DERIVED_FEATURES.len());
    }

    #[test]
    fn test_augment_leaves_input_untouched() {
        let frame = race_frame();
        let before = frame.clone();
        let _ = augment(&frame, &FeatureSet::default());
        assert_eq!(frame, before);
    }

    #[test]
    fn test_augment_is_deterministic() {
        let frame = race_frame();
        let a = augment(&frame, &FeatureSet::default());
        let b = augment(&frame, &FeatureSet::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_sources_use_neutral_default() {
        let frame = race_frame();
        let out = augment(&frame, &FeatureSet::default());
        // no temperature columns supplied
        assert_eq!(out.column("temp_diff").unwrap(), &[0.0; 4]);
        // no racer_course_advantage column supplied
        assert_eq!(out.column("racer_winning_tendency").unwrap(), &[0.0; 4]);
    }

    #[test]
    fn test_group_features_respect_race_boundaries() {
        let frame = race_frame();
        let out = augment(&frame, &FeatureSet::default());
        let consistency = out.column("racer_consistency").unwrap();
        // first race: rates 6, 4, 5 -> sample std 1.0
        assert!((consistency[0] - 1.0).abs() < 1e-12);
        assert!((consistency[2] - 1.0).abs() < 1e-12);
        // second race has a single entrant
        assert_eq!(consistency[3], 0.0);

        let z = out.column("racer_win_rate_zscore").unwrap();
        assert!((z[0] - 1.0).abs() < 1e-12);
        assert!((z[1] + 1.0).abs() < 1e-12);
        assert_eq!(z[3], 0.0);
    }

    #[test]
    fn test_group_features_default_without_race_key() {
        let full = race_frame();
        let frame = Frame::from_columns(
            full.column_names()
                .iter()
                .filter(|n| n.as_str() != "race_no")
                .map(|n| (n.clone(), full.column(n).unwrap().to_vec()))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let out = augment(&frame, &FeatureSet::default());
        assert_eq!(out.column("racer_consistency").unwrap(), &[0.0; 4]);
    }

    #[test]
    fn test_course_and_outer_features() {
        let frame = race_frame();
        let out = augment(&frame, &FeatureSet::default());
        let score = out.column("course_class_score").unwrap();
        assert!((score[0] - 6.0).abs() < 1e-12);
        assert!((score[2] - 5.0 * 0.17).abs() < 1e-12);

        let outer = out.column("wave_outer_advantage").unwrap();
        assert_eq!(outer, &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_extra_columns_pass_through() {
        let mut frame = race_frame();
        frame.insert_column("odds", vec![1.5, 3.0, 9.0, 2.0]).unwrap();
        let out = augment(&frame, &FeatureSet::default());
        assert_eq!(out.column("odds"), frame.column("odds"));
    }
}
