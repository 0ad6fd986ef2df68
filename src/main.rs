use std::process::ExitCode;

fn main() -> ExitCode {
    stemi_analyzer_lib::run()
}
