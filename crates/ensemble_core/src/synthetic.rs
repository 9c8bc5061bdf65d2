//! Deterministic synthetic race cards for smoke runs and tests.
//!
//! Each race has six entrants with every base column of the default contract
//! plus the `date` and `race_no` key columns. Exactly one entrant per race is
//! labelled the winner; the winner is drawn from a latent strength that
//! favours inner courses, high win rates and fast exhibition times, so the
//! generated data carries real signal for every family.

use crate::augment::COURSE_ADVANTAGE;
use crate::deterministic::LcgRng;
use crate::frame::Frame;
use tracing::debug;

pub const BOATS_PER_RACE: usize = 6;

const RACES_PER_DAY: usize = 12;
const VENUES: usize = 24;

/// Generator settings
#[derive(Debug, Clone)]
pub struct SyntheticRaces {
    pub n_races: usize,
    pub seed: u64,
    /// Share of exhibition times blanked to `NaN`
    pub missing_rate: f64,
}

impl SyntheticRaces {
    pub fn new(n_races: usize, seed: u64) -> Self {
        Self {
            n_races,
            seed,
            missing_rate: 0.0,
        }
    }

    pub fn with_missing_rate(mut self, rate: f64) -> Self {
        self.missing_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Build the frame and the 0/1 win labels
    pub fn generate(&self) -> (Frame, Vec<u8>) {
        let mut rng = LcgRng::new(self.seed);
        let mut cols = Columns::with_capacity(self.n_races * BOATS_PER_RACE);
        let mut labels = Vec::with_capacity(self.n_races * BOATS_PER_RACE);

        for race in 0..self.n_races {
            let date = 20240101.0 + (race / (RACES_PER_DAY * VENUES)) as f64;
            let venue = 1 + (race / RACES_PER_DAY) % VENUES;
            let race_no = 1 + race % RACES_PER_DAY;

            let temperature = 5.0 + 25.0 * rng.next_f64();
            let water_temperature = temperature + 6.0 * rng.next_f64() - 3.0;
            let wind_speed = (8.0 * rng.next_f64()).floor();
            let wave_height = (wind_speed * 1.2 + 3.0 * rng.next_f64()).floor();
            let wind_direction = 1 + rng.next_range(16);
            let weather = 1 + rng.next_range(4);

            let win_rate: Vec<f64> = (0..BOATS_PER_RACE).map(|_| 3.0 + 5.0 * rng.next_f64()).collect();
            let motor: Vec<f64> = (0..BOATS_PER_RACE).map(|_| 20.0 + 40.0 * rng.next_f64()).collect();
            let hull: Vec<f64> = (0..BOATS_PER_RACE).map(|_| 20.0 + 40.0 * rng.next_f64()).collect();
            let exhibition: Vec<f64> = (0..BOATS_PER_RACE).map(|_| 6.6 + 0.3 * rng.next_f64()).collect();

            let rate_mean = mean(&win_rate);
            let motor_mean = mean(&motor);
            let time_mean = mean(&exhibition);

            let strength: Vec<f64> = (0..BOATS_PER_RACE)
                .map(|i| {
                    2.0 * COURSE_ADVANTAGE[i].ln() + 0.6 * win_rate[i] + 0.03 * motor[i]
                        - 8.0 * (exhibition[i] - time_mean)
                        + gumbel(&mut rng)
                })
                .collect();
            let winner = argmax(&strength);

            for i in 0..BOATS_PER_RACE {
                let exhibition_time = if rng.next_f64() < self.missing_rate {
                    f64::NAN
                } else {
                    exhibition[i]
                };
                let tilt = [-0.5, 0.0, 0.5][rng.next_range(3)];

                cols.push(&[
                    ("date", date),
                    ("race_no", race_no as f64),
                    ("jyo_cd", venue as f64),
                    ("boat_no", (i + 1) as f64),
                    ("racer_win_rate", win_rate[i]),
                    ("motor_2ren", motor[i]),
                    ("boat_2ren", hull[i]),
                    ("exhibition_time", exhibition_time),
                    ("tilt", tilt),
                    ("temperature", temperature),
                    ("water_temperature", water_temperature),
                    ("wind_speed", wind_speed),
                    ("wave_height", wave_height),
                    ("wind_direction", wind_direction as f64),
                    ("weather", weather as f64),
                    ("racer_win_rate_diff", win_rate[i] - rate_mean),
                    ("motor_2ren_diff", motor[i] - motor_mean),
                    ("exhibition_time_diff", exhibition_time - time_mean),
                ]);
                labels.push(u8::from(i == winner));
            }
        }

        debug!("Generated {} synthetic races ({} rows)", self.n_races, labels.len());
        (cols.into_frame(), labels)
    }
}

/// Shorthand for `SyntheticRaces::new(n_races, seed).generate()`
pub fn synthetic_races(n_races: usize, seed: u64) -> (Frame, Vec<u8>) {
    SyntheticRaces::new(n_races, seed).generate()
}

struct Columns {
    names: Vec<&'static str>,
    values: Vec<Vec<f64>>,
    capacity: usize,
}

impl Columns {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            names: Vec::new(),
            values: Vec::new(),
            capacity,
        }
    }

    fn push(&mut self, row: &[(&'static str, f64)]) {
        if self.names.is_empty() {
            self.names = row.iter().map(|(name, _)| *name).collect();
            self.values = vec![Vec::with_capacity(self.capacity); row.len()];
        }
        for (column, (_, value)) in self.values.iter_mut().zip(row) {
            column.push(*value);
        }
    }

    fn into_frame(self) -> Frame {
        let mut frame = Frame::new();
        for (name, values) in self.names.into_iter().zip(self.values) {
            frame.upsert(name.to_string(), values);
        }
        frame
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn gumbel(rng: &mut LcgRng) -> f64 {
    let u = rng.next_f64().clamp(1e-12, 1.0 - 1e-12);
    -(-u.ln()).ln()
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSet;

    #[test]
    fn test_one_winner_per_race() {
        let (frame, labels) = synthetic_races(50, 3);
        assert_eq!(frame.n_rows(), 300);
        assert_eq!(labels.len(), 300);
        for race in labels.chunks(BOATS_PER_RACE) {
            assert_eq!(race.iter().filter(|&&l| l == 1).count(), 1);
        }
    }

    #[test]
    fn test_covers_default_contract() {
        let (frame, _) = synthetic_races(2, 1);
        let features = FeatureSet::default();
        assert!(features.check_frame(&frame).is_ok());
        for key in &features.race_key {
            assert!(frame.has_column(key), "{key}");
        }
    }

    #[test]
    fn test_same_seed_same_data() {
        let (a, la) = synthetic_races(20, 11);
        let (b, lb) = synthetic_races(20, 11);
        assert_eq!(a, b);
        assert_eq!(la, lb);
        let (_, lc) = synthetic_races(20, 12);
        assert_ne!(la, lc);
    }

    #[test]
    fn test_inner_course_wins_most() {
        let (frame, labels) = synthetic_races(600, 5);
        let boats = frame.column("boat_no").unwrap();
        let wins = |boat: f64| {
            boats
                .iter()
                .zip(&labels)
                .filter(|(b, l)| **b == boat && **l == 1)
                .count()
        };
        assert!(wins(1.0) > wins(6.0));
    }

    #[test]
    fn test_missing_rate_blanks_exhibition_time() {
        let (frame, _) = SyntheticRaces::new(100, 9).with_missing_rate(0.5).generate();
        let times = frame.column("exhibition_time").unwrap();
        let missing = times.iter().filter(|t| t.is_nan()).count();
        assert!(missing > 100 && missing < 500, "{missing}");
    }
}
