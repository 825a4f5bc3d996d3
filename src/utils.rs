pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxResult<T> = Result<T, BoxError>;

/// make sure to abort a task on drop, so that it's easier to
/// do assertion in tests with less worry about cleaning up
#[cfg(test)]
pub(crate) struct AbortHdl<T>(pub(crate) tokio::task::JoinHandle<T>);

#[cfg(test)]
impl<T> Drop for AbortHdl<T> {
    fn drop(&mut self) {
        self.0.abort()
    }
}
