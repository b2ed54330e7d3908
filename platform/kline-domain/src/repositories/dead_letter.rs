use crate::value_objects::fetch_window::DeadLetter;

/// Durable operator queue for windows that ran out of retries.
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: &DeadLetter) -> Result<(), String>;
    fn list(&self) -> Result<Vec<DeadLetter>, String>;
    /// Drops every stored letter matching one of `letters`; returns how many were removed.
    fn remove(&self, letters: &[DeadLetter]) -> Result<usize, String>;
}
