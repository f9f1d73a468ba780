use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

/// Evenly spaced permits, shared by every call a driver makes.
///
/// Slots are reserved under the lock and waited on outside it, so concurrent
/// callers are serialized without holding the lock while sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(permits: u32) -> Self {
        RateLimiter {
            period: Duration::from_secs(1) / permits.max(1),
            next: Mutex::new(None),
        }
    }

    pub async fn take(&self) {
        let slot = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |at| at.max(now));
            *next = Some(slot + self.period);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}
