use metrics::{describe_counter, describe_histogram};
use std::time::Duration;

pub fn describe() {
    describe_counter!(
        "reviews_fetched_total",
        "Reviews written by the fetch pass, by strategy and outcome"
    );
    describe_counter!(
        "reviews_generated_total",
        "Replies produced by the generation pass, by outcome"
    );
    describe_counter!("reviews_enqueued_total", "Reply messages published");
    describe_counter!(
        "reviews_submitted_total",
        "Reply submissions settled by the consumer, by outcome"
    );
    describe_counter!("lease_contended_total", "Lease acquisitions refused");
    describe_histogram!("pass_duration_seconds", "Wall time of a pipeline pass");
}

pub fn reviews_fetched(strategy: &'static str, outcome: &'static str, count: u64) {
    metrics::counter!("reviews_fetched_total", "strategy" => strategy, "outcome" => outcome)
        .increment(count);
}

pub fn reply_generated(outcome: &'static str) {
    metrics::counter!("reviews_generated_total", "outcome" => outcome).increment(1);
}

pub fn reply_enqueued() {
    metrics::counter!("reviews_enqueued_total").increment(1);
}

pub fn reply_submitted(outcome: &'static str) {
    metrics::counter!("reviews_submitted_total", "outcome" => outcome).increment(1);
}

pub fn lease_contended() {
    metrics::counter!("lease_contended_total").increment(1);
}

pub fn pass_elapsed(pass: &'static str, elapsed: Duration) {
    metrics::histogram!("pass_duration_seconds", "pass" => pass).record(elapsed.as_secs_f64());
}
