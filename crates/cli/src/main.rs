use std::process::ExitCode;

fn main() -> ExitCode {
    provisio_cli::run()
}
