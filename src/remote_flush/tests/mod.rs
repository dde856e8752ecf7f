pub mod helpers;
mod tests_cancellation;
mod tests_commit_ordering;
mod tests_end_to_end;
mod tests_liveness;
mod tests_local_fallback;
mod tests_transport_closed_retry;
