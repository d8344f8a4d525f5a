//! Permit handed out by `AdmissionLimiter::acquire`.

use std::sync::Arc;

use super::pool::AdmissionLimiter;

/// One admitted unit of work. Returns to the limiter on drop.
#[must_use = "dropping the permit releases it immediately"]
pub struct AdmissionPermit {
    limiter: Arc<AdmissionLimiter>,
    armed: bool,
}

impl AdmissionPermit {
    pub(crate) fn new(limiter: Arc<AdmissionLimiter>) -> Self {
        Self {
            limiter,
            armed: true,
        }
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    /// Release explicitly. Same as dropping the permit.
    pub fn release(self) {
        drop(self);
    }

    /// Detach the permit without releasing it.
    ///
    /// The holder then owes exactly one `AdmissionLimiter::release` call.
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("limiter", &self.limiter.name())
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_releases_permit() {
        let limiter = AdmissionLimiter::new("api", 1).unwrap();
        {
            let _permit = limiter.acquire().await.unwrap();
            assert_eq!(limiter.active_count(), 1);
        }
        assert_eq!(limiter.active_count(), 0);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn forget_then_manual_release() {
        let limiter = AdmissionLimiter::new("api", 1).unwrap();
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(permit.limiter().name(), "api");

        permit.forget();
        assert_eq!(limiter.active_count(), 1);

        limiter.release();
        assert_eq!(limiter.active_count(), 0);
    }
}
