/// The output wrapper uses `Result<T, E>` to be able to provide an additional "wait value" when
/// output isn't present, e.g. the deadline at which a machine next wants to be ticked.
///
/// State machines still return `None` when no wait value is applicable.
pub type WrappedOutput<T, E> = Result<T, E>;
