use std::sync::{Arc, Mutex};

/// Rappel de progression, en pourcentage (0.0 à 100.0).
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Progression globale répartie en phases pondérées (ex. 20/60/20).
///
/// Les valeurs transmises ne décroissent jamais et se terminent à 100.
pub struct PhaseProgress {
    /// Poids cumulés au début de chaque phase, normalisés sur 100.
    starts: Vec<f64>,
    weights: Vec<f64>,
    last: Mutex<f64>,
    sink: ProgressFn,
}

impl PhaseProgress {
    pub fn new(weights: &[f64], sink: ProgressFn) -> Self {
        let total: f64 = weights.iter().sum();
        let scale = if total > 0.0 { 100.0 / total } else { 0.0 };
        let weights: Vec<f64> = weights.iter().map(|w| w * scale).collect();
        let mut starts = Vec::with_capacity(weights.len());
        let mut acc = 0.0;
        for weight in &weights {
            starts.push(acc);
            acc += weight;
        }
        Self {
            starts,
            weights,
            last: Mutex::new(0.0),
            sink,
        }
    }

    /// Signale `done` unités terminées sur `total` dans la phase `phase`.
    pub fn update(&self, phase: usize, done: usize, total: usize) {
        let (Some(start), Some(weight)) = (self.starts.get(phase), self.weights.get(phase)) else {
            return;
        };
        let fraction = if total == 0 {
            1.0
        } else {
            (done.min(total) as f64) / (total as f64)
        };
        self.report(start + weight * fraction);
    }

    pub fn finish(&self) {
        self.report(100.0);
    }

    fn report(&self, value: f64) {
        let value = value.clamp(0.0, 100.0);
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if value > *last {
            *last = value;
            (self.sink)(value);
        }
    }
}
