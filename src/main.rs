fn main() {
    if let Err(err) = paceline_lib::run() {
        eprintln!("paceline: {err:#}");
        std::process::exit(1);
    }
}
