/// Retries an async action a fixed number of times with a fixed pause in between.
///
/// The `error` closure receives the error and the attempt number and returns `true` when the
/// loop should stop early. The last result is returned as-is.
macro_rules! retry {
    ($action:expr, times: $num_times:expr, interval: $interval:expr, error: $on_err:expr) => {{
        let mut n = 0u32;
        loop {
            n += 1;
            let result = $action;
            match result {
                Ok(_) => break result,
                Err(ref e) => {
                    if $on_err(e, n) || n >= $num_times {
                        break result;
                    }
                    tokio::time::sleep($interval).await;
                }
            }
        }
    }};
    ($action:expr, times: $num_times:expr, interval: $interval:expr, log_error: $log:expr) => {
        retry!($action, times: $num_times, interval: $interval, error: |e, n| { $log(e, n); false })
    };
    ($action:expr, times: $num_times:expr, interval: $interval:expr) => {
        retry!($action, times: $num_times, interval: $interval, error: |_, _| { false })
    };
}
