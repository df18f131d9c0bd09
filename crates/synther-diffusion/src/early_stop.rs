//! Patience-based early stopping on evaluation losses

/// Stops training once the loss has exceeded the best value by more than
/// `delta` for `patience` consecutive evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopper {
    patience: usize,
    delta: f64,
    best_loss: Option<f64>,
    counter: usize,
    stop: bool,
}

impl Default for EarlyStopper {
    fn default() -> Self {
        Self::new(3, 0.003)
    }
}

impl EarlyStopper {
    pub fn new(patience: usize, delta: f64) -> Self {
        Self {
            patience,
            delta,
            best_loss: None,
            counter: 0,
            stop: false,
        }
    }

    /// Records one evaluation loss and returns [`Self::should_stop`]
    pub fn observe(&mut self, loss: f64) -> bool {
        match self.best_loss {
            Some(best) if loss > best + self.delta => {
                self.counter += 1;
                if self.counter >= self.patience {
                    self.stop = true;
                }
            }
            _ => {
                self.best_loss = Some(loss);
                self.counter = 0;
            }
        }
        self.stop
    }

    pub fn should_stop(&self) -> bool {
        self.stop
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    /// Consecutive evaluations worse than the best
    pub fn counter(&self) -> usize {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience() {
        let mut stopper = EarlyStopper::default();
        assert!(!stopper.observe(1.0));
        assert!(!stopper.observe(1.1));
        assert!(!stopper.observe(1.1));
        assert!(stopper.observe(1.1));
        assert_eq!(stopper.best_loss(), Some(1.0));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut stopper = EarlyStopper::new(2, 0.0);
        stopper.observe(1.0);
        stopper.observe(2.0);
        assert_eq!(stopper.counter(), 1);
        stopper.observe(0.5);
        assert_eq!(stopper.counter(), 0);
        assert_eq!(stopper.best_loss(), Some(0.5));
        assert!(!stopper.should_stop());
    }

    #[test]
    fn test_within_delta_counts_as_best() {
        let mut stopper = EarlyStopper::new(1, 0.003);
        stopper.observe(1.0);
        // not worse than best + delta, so it becomes the new best
        stopper.observe(1.002);
        assert_eq!(stopper.best_loss(), Some(1.002));
        assert!(!stopper.should_stop());
    }

    #[test]
    fn test_stop_is_sticky() {
        let mut stopper = EarlyStopper::new(1, 0.0);
        stopper.observe(1.0);
        assert!(stopper.observe(2.0));
        assert!(stopper.observe(0.1));
    }
}
