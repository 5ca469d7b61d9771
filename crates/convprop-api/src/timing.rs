/// Receives a named checkpoint after each propagate call.
///
/// Implementations must tolerate being called when no timing session is
/// active.
pub trait TimingSink: Send + Sync {
    fn time_check(&self, label: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimingSink;

impl TimingSink for NoopTimingSink {
    fn time_check(&self, _label: &str) {}
}
