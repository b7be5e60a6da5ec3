use biometrics::{Collector, Counter, Moments};

pub(crate) static GATEWAY_REQUESTS: Counter = Counter::new("semki.gateway.requests");
pub(crate) static GATEWAY_UNAUTHORIZED: Counter = Counter::new("semki.gateway.unauthorized");
pub(crate) static GATEWAY_REPLAYS: Counter = Counter::new("semki.gateway.replays");
pub(crate) static GATEWAY_RENEWALS: Counter = Counter::new("semki.gateway.renewals");
pub(crate) static GATEWAY_RENEWAL_FAILURES: Counter =
    Counter::new("semki.gateway.renewal_failures");
pub(crate) static GATEWAY_RENEWAL_WAITERS: Counter =
    Counter::new("semki.gateway.renewal_waiters");
pub(crate) static GATEWAY_FORCED_LOGOUTS: Counter = Counter::new("semki.gateway.forced_logouts");
pub(crate) static GATEWAY_RENEWAL_DURATION: Moments =
    Moments::new("semki.gateway.renewal_duration_seconds");

pub(crate) static STREAM_OPENS: Counter = Counter::new("semki.stream.opens");
pub(crate) static STREAM_FRAMES: Counter = Counter::new("semki.stream.frames");
pub(crate) static STREAM_DECODE_ERRORS: Counter = Counter::new("semki.stream.decode_errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("semki.stream.bytes");
pub(crate) static STREAM_COMPLETED: Counter = Counter::new("semki.stream.completed");
pub(crate) static STREAM_CANCELLED: Counter = Counter::new("semki.stream.cancelled");
pub(crate) static STREAM_FAILED: Counter = Counter::new("semki.stream.failed");
pub(crate) static STREAM_DURATION: Moments = Moments::new("semki.stream.duration_seconds");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&GATEWAY_REQUESTS);
    collector.register_counter(&GATEWAY_UNAUTHORIZED);
    collector.register_counter(&GATEWAY_REPLAYS);
    collector.register_counter(&GATEWAY_RENEWALS);
    collector.register_counter(&GATEWAY_RENEWAL_FAILURES);
    collector.register_counter(&GATEWAY_RENEWAL_WAITERS);
    collector.register_counter(&GATEWAY_FORCED_LOGOUTS);
    collector.register_moments(&GATEWAY_RENEWAL_DURATION);

    collector.register_counter(&STREAM_OPENS);
    collector.register_counter(&STREAM_FRAMES);
    collector.register_counter(&STREAM_DECODE_ERRORS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_COMPLETED);
    collector.register_counter(&STREAM_CANCELLED);
    collector.register_counter(&STREAM_FAILED);
    collector.register_moments(&STREAM_DURATION);
}
