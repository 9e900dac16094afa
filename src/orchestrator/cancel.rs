use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run-abort flag shared by every worker. Optionally also observes a
/// process-wide flag such as the SIGINT latch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    external: Option<&'static AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external(external: &'static AtomicBool) -> Self {
        Self {
            flag: Arc::default(),
            external: Some(external),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .external
                .is_some_and(|external| external.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn observes_external_flag() {
        static EXTERNAL: AtomicBool = AtomicBool::new(false);
        let token = CancelToken::with_external(&EXTERNAL);
        assert!(!token.is_cancelled());
        EXTERNAL.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
    }
}
