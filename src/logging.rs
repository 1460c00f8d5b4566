//! Replay-gated tracing for orchestrator code. Plain `tracing::info!` inside
//! an orchestration would re-emit on every replay of the same turn; these
//! macros consult [`OrchestrationContext::is_logging_enabled`] and only fire
//! while the orchestrator is executing past the end of recorded history.
//!
//! [`OrchestrationContext::is_logging_enabled`]: crate::OrchestrationContext::is_logging_enabled

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(target: "duratask::orchestration", turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(target: "duratask::orchestration", turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(target: "duratask::orchestration", turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
