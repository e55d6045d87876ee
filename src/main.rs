fn main() {
    if let Err(err) = roaming_hub::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
