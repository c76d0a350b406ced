use std::collections::VecDeque;

/// Fixed-window average over the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Returns `NaN` until the first sample is recorded.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.sum / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_nan() {
        assert!(RollingAverage::new(4).average().is_nan());
    }

    #[test]
    fn test_window_drops_oldest_samples() {
        let mut avg = RollingAverage::new(3);
        for v in [10.0, 20.0, 30.0] {
            avg.add_value(v);
        }
        assert_eq!(avg.average(), 20.0);

        avg.add_value(60.0);
        assert_eq!(avg.len(), 3);
        assert_eq!(avg.average(), 110.0 / 3.0);
    }
}
