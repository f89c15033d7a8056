//! Admission control for in-flight requests.

use crate::error::NetError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of unresolved outbound requests.
///
/// A non-positive limit disables admission control.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Option<Arc<Semaphore>>,
    max: usize,
}

impl AdmissionController {
    /// Largest enforceable limit. Larger values are clamped to it.
    pub const MAX_LIMIT: usize = Semaphore::MAX_PERMITS;

    pub fn new(max_processing_requests: i64) -> Self {
        if max_processing_requests <= 0 {
            return Self::disabled();
        }
        let requested = u64::try_from(max_processing_requests).unwrap_or(u64::MAX);
        let max = usize::try_from(requested)
            .unwrap_or(usize::MAX)
            .min(Self::MAX_LIMIT);
        if (max as u64) < requested {
            tracing::warn!(
                "max_processing_requests {} exceeds {}, clamping",
                max_processing_requests,
                Self::MAX_LIMIT
            );
        }
        Self {
            semaphore: Some(Arc::new(Semaphore::new(max))),
            max,
        }
    }

    pub fn disabled() -> Self {
        Self {
            semaphore: None,
            max: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Takes a permit without waiting.
    ///
    /// Fails with [`NetError::TooManyRequests`] when every permit is held.
    pub fn try_acquire(&self) -> Result<AdmissionPermit, NetError> {
        match &self.semaphore {
            None => Ok(AdmissionPermit::unbounded()),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .map(|permit| AdmissionPermit {
                    permit: Some(permit),
                })
                .map_err(|_| NetError::TooManyRequests { max: self.max }),
        }
    }

    /// Returns the number of free permits, or `None` when disabled.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A held admission permit.
///
/// Released on [`AdmissionPermit::release`] or on drop, whichever comes first.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    /// A permit that holds nothing, used when admission control is disabled.
    pub fn unbounded() -> Self {
        Self { permit: None }
    }

    /// Returns the permit to the controller. Returns `false` when there was
    /// nothing left to release.
    pub fn release(&mut self) -> bool {
        self.permit.take().is_some()
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled() {
        for limit in [0, -1] {
            let admission = AdmissionController::new(limit);
            assert!(!admission.is_enabled());
            assert_eq!(admission.available(), None);
            let permits: Vec<_> = (0..100).map(|_| admission.try_acquire().unwrap()).collect();
            assert!(permits.iter().all(|p| !p.is_held()));
        }
    }

    #[test]
    fn test_limit_enforced() {
        let admission = AdmissionController::new(2);
        let a = admission.try_acquire().unwrap();
        let _b = admission.try_acquire().unwrap();
        assert_eq!(admission.available(), Some(0));

        let err = admission.try_acquire().unwrap_err();
        assert!(matches!(err, NetError::TooManyRequests { max: 2 }));

        drop(a);
        assert_eq!(admission.available(), Some(1));
        assert!(admission.try_acquire().is_ok());
    }

    #[test]
    fn test_oversized_limit_clamped() {
        for limit in [i64::MAX, AdmissionController::MAX_LIMIT as i64 + 1] {
            let admission = AdmissionController::new(limit);
            assert!(admission.is_enabled());
            assert_eq!(admission.max(), AdmissionController::MAX_LIMIT);
            assert!(admission.try_acquire().unwrap().is_held());
        }
    }

    #[test]
    fn test_release_once() {
        let admission = AdmissionController::new(1);
        let mut permit = admission.try_acquire().unwrap();
        assert!(permit.release());
        assert!(!permit.release());
        assert_eq!(admission.available(), Some(1));

        drop(permit);
        assert_eq!(admission.available(), Some(1));
    }
}
