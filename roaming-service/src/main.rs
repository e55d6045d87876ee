fn main() {
    if let Err(err) = roaming_hub::app::run_jobs() {
        eprintln!("sync service startup failed: {err}");
        std::process::exit(1);
    }
}
