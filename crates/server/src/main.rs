use std::process::ExitCode;

use realm_server::app;
use tracing::error;

fn main() -> ExitCode {
    match app::build_server() {
        Ok(wiring) => app::run(wiring),
        Err(err) => {
            error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}
