use tokio::time::{sleep, Duration, Instant};

/// Smoothing factor for the frame-rate estimate.
const FPS_ALPHA: f64 = 0.1;

/// Fixed inter-frame delay plus a running frame-rate estimate.
#[derive(Debug, Clone)]
pub struct Pacer {
    delay: Duration,
    last_send: Option<Instant>,
    fps: f64,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_send: None,
            fps: 0.0,
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        if let Some(last) = self.last_send {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.fps = if self.fps == 0.0 {
                    instant
                } else {
                    self.fps + FPS_ALPHA * (instant - self.fps)
                };
            }
        }
        self.last_send = Some(now);
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_has_no_rate() {
        let mut pacer = Pacer::new(Duration::from_millis(30));
        pacer.record_send(Instant::now());
        assert_eq!(pacer.fps(), 0.0);
    }

    #[test]
    fn rate_tracks_send_spacing() {
        let mut pacer = Pacer::new(Duration::ZERO);
        let start = Instant::now();
        for i in 0..50 {
            pacer.record_send(start + Duration::from_millis(40 * i));
        }
        assert!((pacer.fps() - 25.0).abs() < 0.5, "fps was {}", pacer.fps());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_waits_for_the_delay() {
        let pacer = Pacer::new(Duration::from_millis(30));
        let before = Instant::now();
        pacer.pause().await;
        assert!(before.elapsed() >= Duration::from_millis(30));
    }
}
