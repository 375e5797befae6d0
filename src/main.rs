fn main() {
    if let Err(e) = lmngen_lib::run() {
        eprintln!("lmngen: {}", e);
        std::process::exit(1);
    }
}
