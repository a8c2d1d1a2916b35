use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    focus_tracker_lib::run().await
}
